//! thumbcache - fetch thumbnails through the shared image cache
//!
//! Front end for exercising the cache from a terminal: every URL goes through
//! one `ImageCache`, results are delivered back onto the main task and printed
//! as JSON lines.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use thumbcache::{CacheConfig, ChannelDispatcher, HttpFetcher, ImageCache, LoadResult};

/// Row height the asset list renders thumbnails at
const DEFAULT_THUMBNAIL_HEIGHT: u32 = 64;

/// CLI command
#[derive(Debug)]
enum Command {
    /// Fetch thumbnails and print their dimensions
    Fetch { urls: Vec<String>, height: u32 },
    /// Show help
    Help,
}

/// One result line
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FetchReport {
    url: String,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scaled_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scaled_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl FetchReport {
    fn from_result(url: String, result: LoadResult, target_height: u32) -> Self {
        let mut report = FetchReport {
            url,
            ok: false,
            width: None,
            height: None,
            scaled_width: None,
            scaled_height: None,
            error: None,
        };

        match result {
            Ok(store) => {
                let (width, height) = store.dimensions();
                report.width = Some(width);
                report.height = Some(height);
                match store.scaled_view(target_height) {
                    Ok(view) => {
                        report.ok = true;
                        report.scaled_width = Some(view.width());
                        report.scaled_height = Some(view.height());
                    }
                    Err(e) => report.error = Some(e.to_string()),
                }
            }
            Err(e) => report.error = Some(e.to_string()),
        }

        report
    }
}

fn print_help() {
    eprintln!(
        r#"thumbcache - Fetch and scale thumbnails through a shared image cache

USAGE:
    thumbcache fetch [--height <px>] <url>...
    thumbcache help

COMMANDS:
    fetch   Download every URL (duplicates share one download), scale each
            image to the given height and print one JSON line per URL
    help    Show this help message

OPTIONS:
    --height <px>   Thumbnail height in pixels (default: 64)

CONFIG:
    <config dir>/thumbcache/config.json, e.g.
        {{ "workers": 2, "maxEntries": 1000, "fetchTimeoutSecs": 30 }}

ENVIRONMENT:
    THUMBCACHE_WORKERS             Concurrent downloads (default 2)
    THUMBCACHE_MAX_ENTRIES         Cap on cached images (default unbounded)
    THUMBCACHE_FETCH_TIMEOUT_SECS  Per-download timeout (default none)
    RUST_LOG                       Log level (trace, debug, info, warn, error)

Press Ctrl+C to cancel outstanding downloads.
"#
    );
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "fetch" => {
            let mut urls = Vec::new();
            let mut height = DEFAULT_THUMBNAIL_HEIGHT;
            let mut rest = args[2..].iter();

            while let Some(arg) = rest.next() {
                if arg == "--height" {
                    let value = rest
                        .next()
                        .ok_or_else(|| anyhow!("--height requires a value"))?;
                    height = value
                        .parse()
                        .with_context(|| format!("Invalid height: {}", value))?;
                    if height == 0 {
                        return Err(anyhow!("--height must be positive"));
                    }
                } else {
                    urls.push(arg.clone());
                }
            }

            if urls.is_empty() {
                return Err(anyhow!("Usage: thumbcache fetch [--height <px>] <url>..."));
            }
            Ok(Command::Fetch { urls, height })
        }
        "help" | "--help" | "-h" => Ok(Command::Help),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            Ok(Command::Help)
        }
    }
}

/// Request every URL and print reports as listeners fire on this task
async fn run_fetch(urls: Vec<String>, height: u32) -> Result<()> {
    let config = CacheConfig::load().context("Failed to load configuration")?;
    let fetcher = HttpFetcher::new(&config).context("Failed to create HTTP client")?;
    let (dispatcher, mut queue) = ChannelDispatcher::new();
    let cache = ImageCache::new(
        &config,
        Arc::new(fetcher),
        Arc::new(dispatcher),
        Handle::current(),
    )
    .context("Failed to create image cache")?;

    let remaining = Arc::new(AtomicUsize::new(urls.len()));

    for url in urls {
        let remaining = Arc::clone(&remaining);
        let key = url.clone();
        cache.request(&key, move |result| {
            let report = FetchReport::from_result(url, result, height);
            match serde_json::to_string(&report) {
                Ok(line) => println!("{}", line),
                Err(e) => eprintln!("Failed to serialize report: {}", e),
            }
            remaining.fetch_sub(1, Ordering::SeqCst);
        });
    }

    while remaining.load(Ordering::SeqCst) > 0 {
        tokio::select! {
            more = queue.next() => {
                if !more {
                    break;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Received interrupt, cancelling outstanding downloads...");
                cache.cancel_all();
                break;
            }
        }
    }

    cache.log_metrics();
    println!("{}", serde_json::to_string(&cache.stats())?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let log_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Parse command
    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    match command {
        Command::Fetch { urls, height } => {
            info!(count = urls.len(), height = height, "Fetching thumbnails");
            run_fetch(urls, height).await?;
        }
        Command::Help => {
            print_help();
        }
    }

    Ok(())
}
