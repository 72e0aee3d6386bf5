use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use rank_pool::encoder::{FnEncoder, HttpEncoder, QueryEncoder};
use rank_pool::index::{HttpIndex, IndexSchema, MemoryIndex, SearchBackend};
use rank_pool::indexer::IndexReport;
use rank_pool::pipeline::Pipeline;
use rank_pool::pool::PoolMethod;
use rank_pool::search::render_gallery;
use rank_pool::store::{self, EmbeddingCorpus};
use rank_pool::{Config, Error, Hit, QueryEmbedding};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rank-pool")]
#[command(about = "Pool, binarize and index multi-vector page embeddings; query them with MaxSim")]
struct Cli {
    /// Search engine to talk to
    #[arg(long, value_enum, default_value_t = BackendKind::Http, global = true)]
    backend: BackendKind,

    /// Overrides RANK_POOL_POOL_FACTOR
    #[arg(long, global = true)]
    pool_factor: Option<usize>,

    /// Overrides RANK_POOL_POOL_METHOD (hierarchical, sequential)
    #[arg(long, global = true)]
    pool_method: Option<PoolMethod>,

    /// Overrides RANK_POOL_WORKERS
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Overrides RANK_POOL_MAX_ATTEMPTS
    #[arg(long, global = true)]
    max_attempts: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// In-process engine, nothing persisted
    Memory,
    /// Vespa-style HTTP engine at RANK_POOL_ENDPOINT
    Http,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pool, binarize and index an embeddings file (.json or .bin)
    Index {
        #[arg(long)]
        input: PathBuf,
    },
    /// Query the index
    Search {
        #[arg(long)]
        query: String,
        #[arg(long)]
        hits: Option<usize>,
        /// Write an HTML gallery of the hits
        #[arg(long)]
        gallery: Option<PathBuf>,
        /// Directory holding the page images
        #[arg(long, default_value = ".")]
        images: PathBuf,
    },
    /// Print the schema definition for the document type
    Schema {
        /// Float dimension of the patch vectors
        #[arg(long, default_value_t = 128)]
        dim: usize,
    },
    /// Write a deterministic synthetic corpus
    Synth {
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value_t = 3)]
        docs: usize,
        #[arg(long, default_value_t = 1030)]
        patches: usize,
        #[arg(long, default_value_t = 128)]
        dim: usize,
    },
    /// Index into the in-process engine, then query by example
    Demo {
        /// Embeddings file; a synthetic corpus when omitted
        #[arg(long)]
        input: Option<PathBuf>,
        /// Document whose first pooled vector is the query
        #[arg(long)]
        query_doc: Option<String>,
        #[arg(long)]
        hits: Option<usize>,
        #[arg(long)]
        gallery: Option<PathBuf>,
        #[arg(long, default_value = ".")]
        images: PathBuf,
    },
}

impl Cli {
    fn config(&self) -> anyhow::Result<Config> {
        let mut config = Config::from_env().context("reading RANK_POOL_* environment")?;
        if let Some(v) = self.pool_factor {
            config.pool_factor = v;
        }
        if let Some(v) = self.pool_method {
            config.pool_method = v;
        }
        if let Some(v) = self.workers {
            config.workers = v;
        }
        if let Some(v) = self.max_attempts {
            config.max_attempts = v;
        }
        if let Command::Search { hits: Some(k), .. } | Command::Demo { hits: Some(k), .. } = self.command {
            config.hits = k;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rank_pool=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config()?;

    match cli.command {
        Command::Index { ref input } => {
            let corpus = EmbeddingCorpus::load(input)
                .with_context(|| format!("loading {}", input.display()))?;
            let backend = backend(cli.backend, &config, corpus.dim())?;
            let pipeline = Pipeline::new(config.clone(), backend, HttpEncoder::new(&config)?)?;
            let report = pipeline.index_corpus(&corpus).await?;
            print_report(&report);
            pipeline.finish();
            Ok(exit_code(&report))
        }
        Command::Search {
            ref query,
            ref gallery,
            ref images,
            ..
        } => {
            if cli.backend == BackendKind::Memory {
                bail!("the memory backend does not persist between runs; use `demo` instead");
            }
            let backend = backend(cli.backend, &config, 0)?;
            let pipeline = Pipeline::new(config.clone(), backend, HttpEncoder::new(&config)?)?;
            let hits = pipeline.search(query).await?;
            pipeline.finish();
            print_hits(&hits);
            if let Some(out) = gallery {
                write_gallery(out, query, &hits, images)?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Schema { dim } => {
            let schema = IndexSchema::new(config.document_type, dim, config.rank_profile);
            print!("{}", schema.to_sd());
            Ok(ExitCode::SUCCESS)
        }
        Command::Synth {
            ref output,
            docs,
            patches,
            dim,
        } => {
            store::synthetic(docs, patches, dim)
                .context("docs, patches and dim must all be positive")?
                .save(output)
                .with_context(|| format!("writing {}", output.display()))?;
            info!(path = %output.display(), docs, patches, dim, "wrote synthetic corpus");
            Ok(ExitCode::SUCCESS)
        }
        Command::Demo {
            ref input,
            ref query_doc,
            ref gallery,
            ref images,
            ..
        } => demo(config, input.as_deref(), query_doc.as_deref(), gallery.as_deref(), images).await,
    }
}

fn backend(kind: BackendKind, config: &Config, dim: usize) -> anyhow::Result<Arc<dyn SearchBackend>> {
    Ok(match kind {
        BackendKind::Memory => Arc::new(MemoryIndex::new(IndexSchema::new(
            config.document_type.clone(),
            dim,
            config.rank_profile.clone(),
        ))),
        BackendKind::Http => Arc::new(HttpIndex::new(config)?),
    })
}

/// Index a corpus in-process and query it with one document's first pooled
/// vector. That document should rank first.
async fn demo(
    config: Config,
    input: Option<&Path>,
    query_doc: Option<&str>,
    gallery: Option<&Path>,
    images: &Path,
) -> anyhow::Result<ExitCode> {
    let corpus = match input {
        Some(path) => EmbeddingCorpus::load(path)?,
        None => store::synthetic(3, 64, 128)?,
    };
    let backend = Arc::new(MemoryIndex::new(IndexSchema::new(
        config.document_type.clone(),
        corpus.dim(),
        config.rank_profile.clone(),
    )));

    let pooler = config.pool_method.pooler();
    let mut examples = HashMap::new();
    for doc in corpus.documents() {
        if let Some(first) = pooler.pool_by_factor(&doc.patches, config.pool_factor).into_iter().next() {
            examples.insert(doc.id, first);
        }
    }
    let encoder: Box<dyn QueryEncoder> = Box::new(FnEncoder::new("query-by-example", move |id: &str| {
        examples
            .get(id)
            .cloned()
            .map(QueryEmbedding::single)
            .ok_or_else(|| Error::Encoder(format!("no document '{id}' to query by")))
    }));

    let query = match query_doc {
        Some(id) => id.to_string(),
        None => corpus
            .ids()
            .nth(1)
            .or_else(|| corpus.ids().next())
            .map(str::to_string)
            .context("corpus is empty")?,
    };

    let pipeline = Pipeline::new(config, Arc::clone(&backend), encoder)?;
    let report = pipeline.index_corpus(&corpus).await?;
    print_report(&report);
    let hits = pipeline.search(&query).await?;
    pipeline.finish();

    println!("query: {query}");
    print_hits(&hits);
    if let Some(out) = gallery {
        write_gallery(out, &query, &hits, images)?;
    }
    Ok(exit_code(&report))
}

fn print_report(report: &IndexReport) {
    println!(
        "indexed {} documents: {} written, {} skipped, {} failed",
        report.total(),
        report.written.len(),
        report.skipped.len(),
        report.failed.len()
    );
    for (id, err) in &report.failed {
        println!("  failed {id}: {err}");
    }
}

fn print_hits(hits: &[Hit]) {
    for (rank, hit) in hits.iter().enumerate() {
        println!("{:>3}. {hit}", rank + 1);
    }
}

fn write_gallery(out: &Path, title: &str, hits: &[Hit], images: &Path) -> anyhow::Result<()> {
    let html = render_gallery(title, hits, images)?;
    std::fs::write(out, html).with_context(|| format!("writing {}", out.display()))?;
    info!(path = %out.display(), "wrote gallery");
    Ok(())
}

fn exit_code(report: &IndexReport) -> ExitCode {
    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
