mod config;
mod server;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use config::GlobalArgs;
use office_search_core::library::DEFAULT_MAX_UPLOAD_BYTES;
use office_search_core::{
    run_ingestion, CommandLauncher, DocumentLibrary, IngestionManager, LibraryOptions, RunStatus,
};
use server::AppState;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "office-search", version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rebuild the vector and lexical indexes from the document root.
    Ingest,
    /// Run a hybrid search against the current indexes.
    Search {
        #[arg(long)]
        query: String,
        /// Clamped to [1, 25].
        #[arg(long, default_value_t = 5)]
        top_k: i64,
        /// Print the raw result as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// List indexed documents with chunk and page counts.
    List {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Serve ingestion control, uploads and search over HTTP.
    Serve {
        #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0:3222")]
        bind: String,
        #[arg(long, default_value_t = DEFAULT_MAX_UPLOAD_BYTES / (1024 * 1024))]
        max_upload_mb: u64,
        #[arg(long, value_delimiter = ',', default_value = ".pdf,.docx,.pptx,.xlsx,.xls")]
        allowed_types: Vec<String>,
        /// Seconds a stopped ingestion gets to exit before it is killed.
        #[arg(long, default_value_t = 5)]
        grace_period_secs: u64,
        #[arg(long, default_value_t = 2)]
        poll_interval_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        docs_root = %cli.global.docs_root.display(),
        "office-search boot"
    );

    match cli.command {
        Command::Ingest => ingest(&cli.global).await,
        Command::Search { query, top_k, json } => search(&cli.global, &query, top_k, json).await,
        Command::List { json } => list(&cli.global, json).await,
        Command::Serve {
            bind,
            max_upload_mb,
            allowed_types,
            grace_period_secs,
            poll_interval_secs,
        } => {
            let library = LibraryOptions {
                allowed_types: allowed_types
                    .iter()
                    .map(|suffix| normalize_suffix(suffix))
                    .filter(|suffix| suffix.len() > 1)
                    .collect(),
                max_upload_bytes: max_upload_mb.saturating_mul(1024 * 1024),
            };
            serve(
                cli.global,
                &bind,
                library,
                Duration::from_secs(grace_period_secs),
                Duration::from_secs(poll_interval_secs.max(1)),
            )
            .await
        }
    }
}

async fn ingest(global: &GlobalArgs) -> anyhow::Result<()> {
    let orchestrator = Arc::new(global.orchestrator()?);
    let builder = global.index_builder()?;

    let report = run_ingestion(orchestrator, &builder)
        .await
        .context("ingestion failed")?;

    println!(
        "{} of {} files indexed, {} chunks, {} failed ({:.1}% success) at {}",
        report.processed,
        report.files_found,
        report.total_chunks,
        report.failed.len(),
        report.success_rate(),
        Utc::now().to_rfc3339()
    );
    for skipped in &report.failed {
        println!("  failed: {} ({})", skipped.path.display(), skipped.reason);
    }
    Ok(())
}

async fn search(global: &GlobalArgs, query: &str, top_k: i64, json: bool) -> anyhow::Result<()> {
    let retriever = global.retriever()?;
    let result = retriever.search_documents(query, top_k).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    if let Some(error) = result.error {
        anyhow::bail!("search failed: {error}");
    }

    println!("query: {} ({} results)", result.query, result.total_found);
    for (rank, hit) in result.results.iter().enumerate() {
        let rerank = hit
            .rerank_score
            .map(|score| format!(" rerank={score:.4}"))
            .unwrap_or_default();
        println!(
            "[{}] score={:.4}{} {} page={} chunk={}",
            rank + 1,
            hit.score,
            rerank,
            hit.metadata.filename,
            hit.metadata.page,
            hit.metadata.chunk
        );
        println!("{}\n", hit.text);
    }
    Ok(())
}

async fn list(global: &GlobalArgs, json: bool) -> anyhow::Result<()> {
    let listing = global.retriever()?.list_documents().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }
    if let Some(error) = listing.error {
        anyhow::bail!("listing failed: {error}");
    }

    for document in &listing.documents {
        println!(
            "{}  {} chunks, {}/{} pages indexed, {}",
            document.filename,
            document.chunks,
            document.indexed_pages,
            document.total_pages,
            document.file_type
        );
    }
    println!(
        "{} documents, {} chunks, {} pages",
        listing.summary.total_documents, listing.summary.total_chunks, listing.summary.total_pages
    );
    Ok(())
}

async fn serve(
    global: GlobalArgs,
    bind: &str,
    library_options: LibraryOptions,
    grace_period: Duration,
    poll_interval: Duration,
) -> anyhow::Result<()> {
    let executable = std::env::current_exe().context("cannot locate the running executable")?;
    let mut ingest_args = global.to_args();
    ingest_args.push("ingest".to_string());

    let manager = Arc::new(
        IngestionManager::new(CommandLauncher::new(executable, ingest_args))
            .with_grace_period(grace_period),
    );
    // base64 grows payloads by a third; leave room for the JSON envelope.
    let body_limit = usize::try_from(library_options.max_upload_bytes / 3 * 4 + 64 * 1024)
        .unwrap_or(usize::MAX);
    let library = DocumentLibrary::new(&global.docs_root, Arc::clone(&manager))
        .with_options(library_options);
    let state = AppState {
        retriever: Arc::new(global.retriever()?),
        manager: Arc::clone(&manager),
        library: Arc::new(library),
    };

    server::spawn_liveness_poll(Arc::clone(&manager), poll_interval);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("cannot bind {bind}"))?;
    info!(bind, "http server listening");
    axum::serve(listener, server::router(state, body_limit))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    if manager.status().status == RunStatus::Running {
        let outcome = manager.stop().await;
        info!(success = outcome.success, message = %outcome.message, "stopped ingestion on shutdown");
    }
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

fn normalize_suffix(suffix: &str) -> String {
    let suffix = suffix.trim().to_ascii_lowercase();
    if suffix.starts_with('.') {
        suffix
    } else {
        format!(".{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffixes_are_lowercased_and_dotted() {
        assert_eq!(normalize_suffix("PDF"), ".pdf");
        assert_eq!(normalize_suffix(" .Docx "), ".docx");
    }

    #[test]
    fn serve_defaults_match_library_defaults() {
        let cli = Cli::parse_from(["office-search", "serve"]);
        let Command::Serve {
            max_upload_mb,
            allowed_types,
            ..
        } = cli.command
        else {
            panic!("expected serve");
        };
        let defaults = LibraryOptions::default();
        assert_eq!(max_upload_mb * 1024 * 1024, defaults.max_upload_bytes);
        let normalized: Vec<String> = allowed_types.iter().map(|s| normalize_suffix(s)).collect();
        assert_eq!(normalized, defaults.allowed_types);
    }
}
