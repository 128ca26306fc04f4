//! hover-translate: incremental machine translation for editor hover tooltips.
//! Library: segmentation, content-addressed cache, background task manager,
//! refresh orchestration and the hover pipeline facade. `run` is the entry
//! point of the demo binary.

pub mod cache;
pub mod config;
pub mod metrics;
pub mod pipeline;
pub mod refresh;
pub mod segment;
pub mod task;
pub mod translate;

#[cfg(test)]
mod testing;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::Notify;
use tracing::{info, warn};

use cache::sqlite::SqliteStore;
use cache::{ContentStore, DurableStore, SystemClock};
use config::Config;
use pipeline::{HoverRender, Pipeline, SegmentStatus};
use refresh::{DisplayError, HoverDisplay};

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Parser, Debug)]
#[command(name = "hover-translate", version, about = "Translate hover documentation incrementally")]
struct Cli {
    /// JSON config file (defaults to $HOVER_TRANSLATE_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Hover text to translate; stdin when omitted
    file: Option<PathBuf>,

    /// Print each render as JSON instead of Markdown
    #[arg(long)]
    json: bool,

    /// Give up waiting for pending segments after this many seconds
    #[arg(long, default_value_t = 120)]
    max_wait_secs: u64,
}

/// Display sink for the terminal: a re-render request wakes the print loop.
struct ConsoleDisplay {
    wake: Arc<Notify>,
}

impl HoverDisplay for ConsoleDisplay {
    fn request_rerender(&self) -> Result<(), DisplayError> {
        self.wake.notify_one();
        Ok(())
    }
}

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hover_translate=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();
}

pub fn run() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    runtime.block_on(run_hover(cli))
}

async fn run_hover(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    let raw = read_input(cli.file.as_deref())?;
    info!(chars = raw.chars().count(), "hover-translate starting");

    let store = open_store(&config);
    cache::start_sweep_loop(&store, SWEEP_INTERVAL);
    let backend = translate::build_backend(&config.backend, config.tasks.request_timeout());
    let wake = Arc::new(Notify::new());
    let display = Arc::new(ConsoleDisplay {
        wake: Arc::clone(&wake),
    });
    let pipeline = Pipeline::new(&config, store, backend, display);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(cli.max_wait_secs);
    let mut render = pipeline.handle(&raw).context("hover request was rejected")?;
    print_render(&render, cli.json)?;
    while !render.is_settled() {
        tokio::select! {
            _ = wake.notified() => {}
            _ = tokio::time::sleep_until(deadline) => {
                warn!(pending = render.count(SegmentStatus::Pending), "stopped waiting for translations");
                break;
            }
        }
        render = pipeline.handle(&raw).context("hover request was rejected")?;
        print_render(&render, cli.json)?;
    }

    pipeline.shutdown().await;
    let stats = pipeline.cache_stats();
    info!(
        entries = stats.entries,
        hits = stats.hits,
        misses = stats.misses,
        metrics = %serde_json::to_string(&pipeline.metrics().summary())?,
        "hover-translate done"
    );
    Ok(())
}

fn read_input(path: Option<&Path>) -> anyhow::Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display())),
        None => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("failed to read stdin")?;
            Ok(raw)
        }
    }
}

/// SQLite when configured and openable, memory-only otherwise.
fn open_store(config: &Config) -> Arc<ContentStore> {
    let clock = Arc::new(SystemClock);
    let Some(path) = &config.cache.db_path else {
        return ContentStore::in_memory(config.cache.ttl(), clock);
    };
    match SqliteStore::open(path) {
        Ok(db) => ContentStore::open(
            Arc::new(db) as Arc<dyn DurableStore>,
            config.cache.ttl(),
            config.cache.flush_debounce(),
            clock,
        ),
        Err(e) => {
            warn!(error = %e, path = %path.display(), "cache database unavailable, continuing memory-only");
            ContentStore::in_memory(config.cache.ttl(), clock)
        }
    }
}

fn print_render(render: &HoverRender, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(render)?);
    } else {
        println!("{}\n---", render.to_markdown());
    }
    Ok(())
}
