//! Lexical relevance over a small candidate pool.
//!
//! The pool is whatever the vector store returned for one query. It is loaded
//! into a throwaway in-RAM tantivy index so BM25 statistics are pool-local.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, Query, TermQuery};
use tantivy::schema::{
    Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, STORED, STRING,
};
use tantivy::tokenizer::{
    Language, LowerCaser, RemoveLongFilter, SimpleTokenizer, Stemmer, StopWordFilter, TextAnalyzer,
    TokenStream,
};
use tantivy::{Index, TantivyDocument, Term};

const CLAUSE_TOKENIZER: &str = "clause_text";

// above tantivy's per-thread writer floor
const WRITER_HEAP_BYTES: usize = 20_000_000;

static ANALYZER: LazyLock<TextAnalyzer> = LazyLock::new(|| {
    let mut builder = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .dynamic();
    if let Some(stop_words) = StopWordFilter::new(Language::English) {
        builder = builder.filter_dynamic(stop_words);
    }
    builder.filter_dynamic(Stemmer::new(Language::English)).build()
});

/// Lowercased, stop-word filtered, stemmed terms in text order.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut analyzer = ANALYZER.clone();
    let mut stream = analyzer.token_stream(text);
    let mut terms = Vec::new();
    stream.process(&mut |token| terms.push(token.text.clone()));
    terms
}

/// BM25 over one candidate pool, scored by tantivy.
#[derive(Debug, Default, Clone, Copy)]
pub struct Bm25Scorer;

struct PoolFields {
    id: Field,
    text: Field,
}

impl Bm25Scorer {
    pub fn new() -> Self {
        Self
    }

    fn build_schema() -> (Schema, PoolFields) {
        let mut sb = Schema::builder();
        let id = sb.add_text_field("id", STRING | STORED);
        let text_options = TextOptions::default().set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(CLAUSE_TOKENIZER)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        );
        let text = sb.add_text_field("text", text_options);
        (sb.build(), PoolFields { id, text })
    }

    /// Score every text in `pool` against `query`. Output is aligned with `pool`;
    /// texts that share no term with the query score 0.
    pub fn score_pool(&self, query: &str, pool: &[&str]) -> Result<Vec<f32>> {
        let query_terms: BTreeSet<String> = tokenize(query).into_iter().collect();
        if query_terms.is_empty() || pool.is_empty() {
            return Ok(vec![0.0; pool.len()]);
        }

        let (schema, fields) = Self::build_schema();
        let index = Index::create_in_ram(schema);
        index.tokenizers().register(CLAUSE_TOKENIZER, ANALYZER.clone());

        // one thread keeps the pool in a single segment
        let mut writer = index
            .writer_with_num_threads::<TantivyDocument>(1, WRITER_HEAP_BYTES)
            .context("Failed to create pool index writer")?;
        for (position, text) in pool.iter().enumerate() {
            let mut doc = TantivyDocument::new();
            doc.add_text(fields.id, position.to_string());
            doc.add_text(fields.text, text);
            writer.add_document(doc)?;
        }
        writer.commit().context("Failed to commit pool index")?;

        let reader = index.reader().context("Failed to open pool reader")?;
        let searcher = reader.searcher();

        let clauses: Vec<(Occur, Box<dyn Query>)> = query_terms
            .iter()
            .map(|term| {
                let query: Box<dyn Query> = Box::new(TermQuery::new(
                    Term::from_field_text(fields.text, term),
                    IndexRecordOption::WithFreqs,
                ));
                (Occur::Should, query)
            })
            .collect();
        let query = BooleanQuery::new(clauses);

        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(pool.len()))
            .context("Pool search failed")?;

        let mut by_position: HashMap<usize, f32> = HashMap::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            let position = doc
                .get_first(fields.id)
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<usize>().ok())
                .context("Pool document lost its position")?;
            by_position.insert(position, score);
        }

        Ok((0..pool.len())
            .map(|position| by_position.get(&position).copied().unwrap_or(0.0))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_drops_stopwords_and_stems() {
        let tokens = tokenize("Does this policy cover maternity expenses?");
        assert!(!tokens.iter().any(|t| t == "does" || t == "this"));
        assert!(tokens.contains(&"cover".to_string()));
        assert!(tokens.contains(&"expens".to_string()));
        assert_eq!(tokenize("covered"), vec!["cover"]);
        assert_eq!(tokenize("24 months"), vec!["24", "month"]);
    }

    #[test]
    fn test_matching_doc_scores_higher() {
        let scorer = Bm25Scorer::new();
        let pool = [
            "Maternity benefits covered after 24 months continuous coverage",
            "The policy term is one year from the start date",
            "Dental treatment is excluded unless caused by accident",
        ];
        let scores = scorer.score_pool("maternity coverage", &pool).unwrap();
        assert_eq!(scores.len(), 3);
        assert!(scores[0] > scores[1]);
        assert!(scores[0] > scores[2]);
        assert_eq!(scores[2], 0.0);
    }

    #[test]
    fn test_stemmed_forms_match() {
        let scorer = Bm25Scorer::new();
        let pool = ["Hospitalisation expenses are covered", "Premiums are payable yearly"];
        let scores = scorer.score_pool("is expense cover available", &pool).unwrap();
        assert!(scores[0] > 0.0);
        assert_eq!(scores[1], 0.0);
    }

    #[test]
    fn test_scores_are_reproducible() {
        let scorer = Bm25Scorer::new();
        let pool = [
            "maternity waiting period of 24 months",
            "maternity cover excludes surrogacy",
            "room rent capped per day",
        ];
        let first = scorer.score_pool("maternity waiting period", &pool).unwrap();
        let second = scorer.score_pool("maternity waiting period", &pool).unwrap();
        assert_eq!(first, second);
        assert!(first[0] > first[1]);
    }

    #[test]
    fn test_empty_query_scores_zero() {
        let scorer = Bm25Scorer::new();
        let scores = scorer.score_pool("the of and", &["anything at all"]).unwrap();
        assert_eq!(scores, vec![0.0]);
        assert!(scorer.score_pool("maternity", &[]).unwrap().is_empty());
    }
}
