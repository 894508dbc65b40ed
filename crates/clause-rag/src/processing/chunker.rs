use std::sync::LazyLock;

use crate::config::ChunkingConfig;
use crate::types::{content_hash, Chunk, Document};

static NUMBERED_CLAUSE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^(?:section\s+|clause\s+)?\d+(?:\.\d+)*\.?\s+\S")
        .expect("numbered clause regex is valid")
});

/// Char span of one chunk within a page's text.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSpan {
    pub text: String,
    pub heading: Option<String>,
    pub start_offset: usize,
    pub end_offset: usize,
}

/// Sizes and offsets are counted in chars, not bytes.
pub struct TextChunker {
    chunk_size: usize,
    chunk_overlap: usize,
    min_chunk_size: usize,
}

impl TextChunker {
    /// `chunk_overlap` is clamped below `chunk_size`.
    pub fn new(chunk_size: usize, chunk_overlap: usize, min_chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size - 1),
            min_chunk_size,
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(config.chunk_size, config.chunk_overlap, config.min_chunk_size)
    }

    /// Split one page of text into spans. Every span except the last shares
    /// exactly `chunk_overlap` chars with the one after it.
    pub fn chunk(&self, text: &str) -> Vec<ChunkSpan> {
        if text.trim().chars().count() < self.min_chunk_size.max(1) {
            return Vec::new();
        }

        // bounds[i] is the byte offset of char i; the last entry is text.len()
        let bounds: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let total = bounds.len() - 1;

        let mut spans = Vec::new();
        let mut start = 0;

        while start < total {
            let end = (start + self.chunk_size).min(total);
            let actual_end = if end < total {
                self.find_break_point(text, &bounds, start, end)
            } else {
                end
            };

            let trimmed = text[bounds[start]..bounds[actual_end]].trim();
            if trimmed.chars().count() >= self.min_chunk_size {
                spans.push(ChunkSpan {
                    text: trimmed.to_string(),
                    heading: extract_heading(trimmed),
                    start_offset: start,
                    end_offset: actual_end,
                });
            }

            if actual_end >= total {
                break;
            }
            start = actual_end.saturating_sub(self.chunk_overlap).max(start + 1);
        }

        spans
    }

    /// Chunk every page of a document. Pages are processed in page-number
    /// order; out-of-order input is reordered rather than rejected.
    pub fn chunk_document(&self, document: &Document) -> Vec<Chunk> {
        let mut pages: Vec<_> = document.pages.iter().collect();
        if pages.windows(2).any(|w| w[0].number > w[1].number) {
            tracing::warn!(
                doc_id = %document.id,
                "Pages arrived out of order, sorting by page number"
            );
            pages.sort_by_key(|p| p.number);
        }

        let mut chunks = Vec::new();
        for page in pages {
            for span in self.chunk(&page.text) {
                let index = chunks.len();
                chunks.push(Chunk {
                    id: Chunk::make_id(&document.id, index),
                    document_id: document.id.clone(),
                    page: page.number,
                    index,
                    content_hash: content_hash(&span.text),
                    text: span.text,
                    heading: span.heading,
                    start_offset: span.start_offset,
                    end_offset: span.end_offset,
                    embedding: Vec::new(),
                });
            }
        }

        tracing::debug!(
            doc_id = %document.id,
            pages = document.pages.len(),
            chunks = chunks.len(),
            "Chunked document"
        );
        chunks
    }

    /// Char index to end the chunk at. Only the trailing half of the window
    /// is searched, and never the first `chunk_overlap + 1` chars, so the
    /// next chunk can always start `chunk_overlap` chars back and still advance.
    fn find_break_point(&self, text: &str, bounds: &[usize], start: usize, preferred_end: usize) -> usize {
        let window = (self.chunk_size / 2).min(200);
        let search_start = preferred_end
            .saturating_sub(window)
            .max(start + self.chunk_overlap + 1);
        if search_start >= preferred_end {
            return preferred_end;
        }

        let region_start = bounds[search_start];
        let search_region = &text[region_start..bounds[preferred_end]];
        let to_char = |byte: usize| bounds.partition_point(|&b| b < region_start + byte);

        // Priority: paragraph break > sentence end > line break > word break
        if let Some(pos) = search_region.rfind("\n\n") {
            return to_char(pos + 2);
        }
        if let Some(pos) = search_region.rfind(". ") {
            return to_char(pos + 2);
        }
        if let Some(pos) = search_region.rfind(".\n") {
            return to_char(pos + 2);
        }
        if let Some(pos) = search_region.rfind('\n') {
            return to_char(pos + 1);
        }
        if let Some(pos) = search_region.rfind(' ') {
            return to_char(pos + 1);
        }

        preferred_end
    }
}

impl Default for TextChunker {
    fn default() -> Self {
        Self::from_config(&ChunkingConfig::default())
    }
}

/// Best guess at a clause title from the first line of a chunk.
fn extract_heading(text: &str) -> Option<String> {
    let first_line = text.lines().map(str::trim).find(|l| !l.is_empty())?;

    if first_line.starts_with('#') {
        let heading = first_line.trim_start_matches('#').trim();
        return (!heading.is_empty()).then(|| heading.to_string());
    }
    if first_line.len() > 80 || first_line.ends_with('.') {
        return None;
    }
    if NUMBERED_CLAUSE_RE.is_match(&first_line.to_lowercase()) {
        return Some(first_line.to_string());
    }

    let words: Vec<&str> = first_line.split_whitespace().collect();
    if words.is_empty() || words.len() > 8 {
        return None;
    }
    let capitalized = words
        .iter()
        .filter(|w| w.chars().next().is_some_and(|c| c.is_uppercase()))
        .count();
    (capitalized * 2 > words.len() && words.len() >= 2).then(|| first_line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Page;

    #[test]
    fn test_empty_input_produces_no_chunks() {
        let chunker = TextChunker::new(100, 10, 5);
        assert!(chunker.chunk("").is_empty());
        assert!(chunker.chunk("   \n\t ").is_empty());
    }

    #[test]
    fn test_short_text_is_single_chunk() {
        let chunker = TextChunker::new(100, 10, 5);
        let spans = chunker.chunk("Maternity benefits covered after 24 months.");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start_offset, 0);
    }

    #[test]
    fn test_consecutive_chunks_overlap() {
        let chunker = TextChunker::new(60, 15, 1);
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda mu nu xi omicron pi rho sigma tau upsilon phi chi psi omega";
        let spans = chunker.chunk(text);
        assert!(spans.len() > 1);
        for pair in spans.windows(2) {
            assert_eq!(pair[0].end_offset - pair[1].start_offset, 15);
            assert!(pair[0].end_offset - pair[0].start_offset <= 60);
        }
        assert_eq!(spans.last().unwrap().end_offset, text.chars().count());
    }

    #[test]
    fn test_multibyte_text_does_not_panic() {
        let chunker = TextChunker::new(16, 4, 1);
        let text = "पॉलिसी में मातृत्व लाभ शामिल है। ".repeat(6);
        let spans = chunker.chunk(&text);
        assert!(!spans.is_empty());
    }

    #[test]
    fn test_sizes_count_chars_not_bytes() {
        let chunker = TextChunker::new(40, 8, 1);
        let text = "पॉलिसी में मातृत्व लाभ शामिल है। ".repeat(10);
        let spans = chunker.chunk(&text);
        assert!(spans.len() > 1);
        for span in &spans[..spans.len() - 1] {
            let len = span.end_offset - span.start_offset;
            assert!(len <= 40);
            assert!(len > 20, "chunk of {} chars is far below the configured size", len);
        }
        assert_eq!(spans.last().unwrap().end_offset, text.chars().count());
    }

    #[test]
    fn test_high_overlap_is_kept_when_break_point_shortens_chunk() {
        let chunker = TextChunker::new(100, 80, 1);
        let text = "Room rent is capped. Maternity cover applies after two years of continuous cover. \
                    Cosmetic surgery is excluded. Ambulance charges are paid up to the limit.";
        let spans = chunker.chunk(text);
        assert!(spans.len() > 1);
        for pair in spans.windows(2) {
            assert_eq!(pair[0].end_offset - pair[1].start_offset, 80);
            assert!(pair[1].start_offset > pair[0].start_offset);
        }
    }

    #[test]
    fn test_chunk_document_assigns_pages_and_stable_ids() {
        let doc = Document::with_id(
            "doc-1",
            "policy.pdf",
            vec![
                Page { number: 3, text: "Exclusions apply to cosmetic surgery.".into() },
                Page { number: 1, text: "Policy schedule and insured details.".into() },
                Page { number: 2, text: "".into() },
            ],
        );
        let chunker = TextChunker::new(200, 20, 5);
        let chunks = chunker.chunk_document(&doc);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].page, 1);
        assert_eq!(chunks[1].page, 3);
        assert_eq!(chunks[0].id, "doc-1-c00000");
        assert_eq!(chunks[1].index, 1);
        assert_eq!(chunks[0].content_hash, content_hash(&chunks[0].text));

        let again = chunker.chunk_document(&doc);
        assert_eq!(chunks, again);
    }

    #[test]
    fn test_heading_extraction() {
        assert_eq!(extract_heading("# Maternity Benefits\nbody"), Some("Maternity Benefits".into()));
        assert_eq!(extract_heading("4.2 Maternity cover\nbody"), Some("4.2 Maternity cover".into()));
        assert_eq!(extract_heading("Waiting Period Clause\nbody"), Some("Waiting Period Clause".into()));
        assert_eq!(extract_heading("the insurer shall pay the claim."), None);
    }
}
