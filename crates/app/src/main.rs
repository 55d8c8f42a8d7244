use anyhow::{bail, Context};
use book_graph_core::{
    discover_pdf_files, document_title, load_outline, load_source, recover_structure, BookCategory,
    HttpClientFactory, MemoryStore, MemoryUsageLedger, Pipeline, PipelineConfig, SourceText,
    StaticProviderResolver,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "book-graph", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Pipeline config file (TOML). Built-in defaults are used when absent.
    #[arg(long, env = "BOOK_GRAPH_CONFIG", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the section structure recovered from a document.
    Structure {
        /// PDF or text file.
        #[arg(long)]
        input: PathBuf,
        /// Bookmark sidecar JSON: [{"level", "title", "page"}].
        #[arg(long)]
        outline: Option<PathBuf>,
    },
    /// Extract a knowledge graph for every section of a document or folder of PDFs.
    Process {
        /// PDF or text file, or a folder searched recursively for PDFs.
        #[arg(long)]
        input: PathBuf,
        /// Bookmark sidecar JSON. Only valid with a single input file.
        #[arg(long)]
        outline: Option<PathBuf>,
        /// Provider profile name. Defaults to the configured default provider.
        #[arg(long, env = "BOOK_GRAPH_PROVIDER")]
        provider: Option<String>,
        /// Book category used to pick the extraction focus.
        #[arg(long)]
        category: Option<String>,
        /// Directory that receives one folder of graph JSON per document.
        #[arg(long, default_value = "graphs")]
        out_dir: PathBuf,
        /// Seconds between liveness signals while processing. 0 disables them.
        #[arg(long, default_value = "15")]
        heartbeat_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PipelineConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "book-graph boot"
    );

    match cli.command {
        Command::Structure { input, outline } => {
            let source = read_source(&input, outline.as_deref())?;
            let recovered = recover_structure(&source, &config.structure)?;

            println!("source: {:?}", recovered.source);
            if let Some(title) = &recovered.title {
                println!("title: {title}");
            }
            for (index, section) in recovered.sections.iter().enumerate() {
                println!(
                    "[{index:02}] level={} chars={}..{} {}",
                    section.level, section.start_char, section.end_char, section.title
                );
            }
        }
        Command::Process {
            input,
            outline,
            provider,
            category,
            out_dir,
            heartbeat_secs,
        } => {
            let inputs = if input.is_dir() {
                discover_pdf_files(&input)
            } else {
                vec![input]
            };
            if inputs.is_empty() {
                println!("0 documents found");
                return Ok(());
            }
            if outline.is_some() && inputs.len() > 1 {
                bail!("--outline can only be used with a single input file");
            }

            let category = BookCategory::normalize(category.as_deref());
            let ledger = Arc::new(MemoryUsageLedger::default());
            let resolver = StaticProviderResolver::from_config(&config);
            let clients = HttpClientFactory::new(config.concurrency.request_timeout);
            let pipeline = Arc::new(Pipeline::new(
                config,
                Arc::new(MemoryStore::new()),
                Arc::new(resolver),
                Arc::new(clients),
                ledger.clone(),
            ));

            let mut failed = 0;
            for path in &inputs {
                let outcome = process_one(
                    &pipeline,
                    path,
                    outline.as_deref(),
                    provider.as_deref(),
                    category,
                    &out_dir,
                    heartbeat_secs,
                )
                .await;
                if let Err(error) = outcome {
                    failed += 1;
                    warn!(path = %path.display(), error = %error, "document was not processed");
                }
            }

            let mut totals = ledger.totals().await.into_iter().collect::<Vec<_>>();
            totals.sort();
            for ((provider, model), (calls, tokens_in, tokens_out)) in totals {
                println!("usage: provider={provider} model={model} calls={calls} tokens_in={tokens_in} tokens_out={tokens_out}");
            }
            println!(
                "{} of {} documents processed at {}",
                inputs.len() - failed,
                inputs.len(),
                Utc::now().to_rfc3339()
            );
        }
    }

    Ok(())
}

fn read_source(path: &Path, outline: Option<&Path>) -> anyhow::Result<SourceText> {
    let source = load_source(path).with_context(|| format!("reading {}", path.display()))?;
    match outline {
        Some(outline) => Ok(source.with_outline(load_outline(outline)?)),
        None => Ok(source),
    }
}

async fn process_one(
    pipeline: &Arc<Pipeline>,
    path: &Path,
    outline: Option<&Path>,
    provider: Option<&str>,
    category: BookCategory,
    out_dir: &Path,
    heartbeat_secs: u64,
) -> anyhow::Result<()> {
    let source = read_source(path, outline)?;
    let document = pipeline.ingest(&document_title(path)?, source, category).await?;
    let document_id = document.document_id.clone();

    let heartbeat = (heartbeat_secs > 0).then(|| {
        spawn_heartbeat(
            Arc::clone(pipeline),
            document_id.clone(),
            Duration::from_secs(heartbeat_secs),
        )
    });
    let processed = pipeline.process_document(&document_id, provider).await;
    if let Some(heartbeat) = heartbeat {
        heartbeat.abort();
    }
    let report = processed?;

    let target = out_dir.join(&document_id);
    tokio::fs::create_dir_all(&target).await?;
    tokio::fs::write(target.join("document.json"), serde_json::to_string_pretty(&report)?).await?;

    let mut graphs = 0;
    for section in &report.sections {
        let Some(graph) = pipeline.section_graph(&section.section_id).await? else {
            continue;
        };
        let file_name = format!("{}.json", section.section_id.replace(':', "_"));
        tokio::fs::write(target.join(file_name), serde_json::to_string_pretty(&graph)?).await?;
        graphs += 1;
    }

    println!(
        "{} status={:?} title={:?} sections={} graphs={} out={}",
        document_id,
        report.document.status,
        report.document.title,
        report.sections.len(),
        graphs,
        target.display()
    );
    if let Some(reason) = &report.document.failure_reason {
        println!("  failure: {reason}");
    }
    Ok(())
}

fn spawn_heartbeat(pipeline: Arc<Pipeline>, document_id: String, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            if let Err(error) = pipeline.liveness(&document_id).await {
                warn!(document_id = %document_id, error = %error, "liveness signal failed");
                break;
            }
        }
    })
}
