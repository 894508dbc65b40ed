//! clause-rag: answer coverage questions about one document from the command line.
//!
//! The document is a UTF-8 text file; form feeds separate pages. The response
//! JSON goes to stdout, logs go to stderr.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use clause_rag::config::{EmbeddingBackend, StorageBackend};
use clause_rag::{Document, PipelineConfig, QueryRequest, RAGEngine};

#[derive(Parser)]
#[command(name = "clause-rag")]
#[command(about = "Explainable coverage decisions over a policy or contract document")]
#[command(version)]
struct Cli {
    /// Document text file (pages separated by form feeds)
    document: PathBuf,

    /// Question to answer (repeatable)
    #[arg(short, long = "question")]
    questions: Vec<String>,

    /// File with one question per line
    #[arg(long)]
    questions_file: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Embed with local feature hashing instead of the embedding API
    #[arg(long)]
    offline_embeddings: bool,

    /// Vector store backend
    #[arg(long, value_enum)]
    store: Option<StoreArg>,

    /// Data directory for the lance store
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Gemini API key
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Pretty-print the response
    #[arg(long)]
    pretty: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum StoreArg {
    Memory,
    Lance,
}

impl From<StoreArg> for StorageBackend {
    fn from(arg: StoreArg) -> Self {
        match arg {
            StoreArg::Memory => StorageBackend::Memory,
            StoreArg::Lance => StorageBackend::Lance,
        }
    }
}

fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path).map_err(anyhow::Error::msg)?,
        None => PipelineConfig::default(),
    };
    let mut config = config.apply_env();

    if cli.offline_embeddings {
        config.models.embedding_backend = EmbeddingBackend::Hashing;
    }
    if let Some(store) = cli.store {
        config.storage.backend = store.into();
    }
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.clone();
    }
    if let Some(key) = &cli.api_key {
        config.models.api_key = Some(key.clone());
    }

    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}

fn collect_questions(cli: &Cli) -> Result<Vec<String>> {
    let mut questions = cli.questions.clone();
    if let Some(path) = &cli.questions_file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read questions from {}", path.display()))?;
        questions.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from),
        );
    }
    if questions.is_empty() {
        bail!("no questions given; use --question or --questions-file");
    }
    Ok(questions)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;
    let request = QueryRequest {
        documents: cli.document.display().to_string(),
        questions: collect_questions(&cli)?,
    };
    request.validate(&config.runtime)?;

    let text = std::fs::read_to_string(&cli.document)
        .with_context(|| format!("Failed to read document {}", cli.document.display()))?;
    let document = Document::from_text(request.documents.clone(), &text);
    tracing::info!(
        doc_id = %document.id,
        pages = document.page_count(),
        questions = request.questions.len(),
        "Loaded document"
    );

    let engine = RAGEngine::from_config(config).await?;
    let response = engine.run_batch(&document, &request.questions).await?;

    let output = if cli.pretty {
        serde_json::to_string_pretty(&response)?
    } else {
        serde_json::to_string(&response)?
    };
    println!("{}", output);
    Ok(())
}
