//! CLI parsing and orchestration. Resolves the getter for the URL, runs
//! authorize -> get, then builds every requested format. Maps errors to exit codes.

use crate::builder::{parse_formats, populate, AssetKind, BuilderError, OutputFormat};
use crate::config::{self, Config};
use crate::getter::{
    parse_book_url, ChapterRange, GetterConfig, GetterError, GetterOptions, GetterRegistry,
    MissingChapterBehavior, ProgressFn, RetryClient,
};
use crate::model::Book;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETRY_COUNT: u32 = 3;
const DEFAULT_BACKOFF_SECS: [u64; 3] = [1, 2, 4];
const DEFAULT_FORMATS: &str = "epub";
/// Auxiliary files packaged from `--assets-dir`.
const ASSET_PATTERNS: [(&str, AssetKind); 3] = [
    ("*.css", AssetKind::Style),
    ("*.ttf", AssetKind::Font),
    ("*.otf", AssetKind::Font),
];

/// CLI error carrying exit code and message.
#[derive(Debug, Error)]
pub enum CliRunError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0:#}")]
    Config(anyhow::Error),

    #[error("{0}")]
    Getter(#[from] GetterError),

    #[error("No chapter with content could be retrieved from {url}")]
    NoChapters { url: String },

    #[error("{failed} of {total} output format(s) failed")]
    Output { failed: usize, total: usize },

    #[error("Cancelled")]
    Cancelled,
}

impl CliRunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliRunError::InvalidInput(_) | CliRunError::Config(_) => 1,
            CliRunError::Getter(_) | CliRunError::NoChapters { .. } => 2,
            CliRunError::Output { .. } => 3,
            CliRunError::Cancelled => 130,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "ficfetch", version)]
#[command(about = "Download a serialized book and write EPUB, JSON, Markdown or text")]
#[command(
    after_help = "Config file keys (output_dir, user_agent, timeout_secs, chapter_timeout_secs, retry_count, retry_backoff_secs, concurrency, login, password, formats, missing_chapters, assets_dir) are read from ./ficfetch.toml or the user config directory. CLI flags override config."
)]
pub struct Args {
    /// Book URL (litnet.com, booknet.com, ranobelib.me or royalroad.com).
    pub url: String,

    /// Output directory. Artifacts are named after the book title.
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Comma-separated output formats: epub, json, md, txt.
    #[arg(short, long)]
    pub formats: Option<String>,

    /// Account login for sources that support it.
    #[arg(long)]
    pub login: Option<String>,

    #[arg(long)]
    pub password: Option<String>,

    /// First TOC index to fetch (0-based, inclusive).
    #[arg(long, conflicts_with = "chapters")]
    pub start: Option<usize>,

    /// TOC index to stop before (0-based, exclusive).
    #[arg(long, conflicts_with = "chapters")]
    pub end: Option<usize>,

    /// Fetch only chapters in this range (1-based inclusive), e.g. 1-10.
    #[arg(long, value_parser = parse_chapter_range)]
    pub chapters: Option<(usize, usize)>,

    /// Request timeout in seconds (default 30).
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Timeout in seconds for a single chapter request (default 10).
    #[arg(long)]
    pub chapter_timeout: Option<u64>,

    /// Chapters fetched at once (default 4).
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Attempts per request for transient failures (default 3).
    #[arg(long)]
    pub retries: Option<u32>,

    /// Chapters that cannot be fetched: skip (default), placeholder, or fail.
    #[arg(long)]
    pub missing_chapters: Option<MissingChapterBehavior>,

    #[arg(long)]
    pub user_agent: Option<String>,

    /// Directory with *.css, *.ttf and *.otf files to package into EPUB.
    #[arg(long)]
    pub assets_dir: Option<PathBuf>,

    /// Read this config file instead of searching for one.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Errors only, no progress bar.
    #[arg(short, long)]
    pub quiet: bool,

    /// Debug logging and the full error chain.
    #[arg(short, long)]
    pub verbose: bool,
}

fn parse_chapter_range(s: &str) -> Result<(usize, usize), String> {
    let s = s.trim();
    let (from_str, to_str) = s
        .split_once('-')
        .ok_or_else(|| format!("Invalid --chapters: expected 'from-to' (e.g. 1-10), got '{}'", s))?;
    let parse = |v: &str, which: &str| -> Result<usize, String> {
        match v.trim().parse::<usize>() {
            Ok(n) if n >= 1 => Ok(n),
            _ => Err(format!(
                "Invalid --chapters: '{}' is not a valid {} chapter number",
                v.trim(),
                which
            )),
        }
    };
    let from = parse(from_str, "start")?;
    let to = parse(to_str, "end")?;
    if from > to {
        return Err(format!(
            "Invalid --chapters: start ({}) must be <= end ({})",
            from, to
        ));
    }
    Ok((from, to))
}

/// Flags merged over the config file and defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub output_dir: PathBuf,
    pub formats: Vec<OutputFormat>,
    pub user_agent: Option<String>,
    pub timeout: Duration,
    pub retry_count: u32,
    pub retry_backoff: Vec<Duration>,
    pub assets_dir: Option<PathBuf>,
    pub options: GetterOptions,
}

impl Settings {
    pub fn resolve(args: &Args, config: Option<&Config>) -> Result<Self, CliRunError> {
        let cfg = |f: fn(&Config) -> Option<String>| config.and_then(f);
        let defaults = GetterOptions::default();

        let formats = args
            .formats
            .clone()
            .or_else(|| cfg(|c| c.formats.clone()))
            .unwrap_or_else(|| DEFAULT_FORMATS.to_string());
        let formats = parse_formats(&formats).map_err(CliRunError::InvalidInput)?;

        let missing_chapters = match args.missing_chapters {
            Some(m) => m,
            None => match cfg(|c| c.missing_chapters.clone()) {
                Some(s) => s.parse().map_err(|e: String| {
                    CliRunError::InvalidInput(format!("Invalid missing_chapters in config: {}", e))
                })?,
                None => MissingChapterBehavior::default(),
            },
        };

        let range = match args.chapters {
            Some((from, to)) => ChapterRange::from_numbers(from, to),
            None => ChapterRange::new(args.start, args.end),
        };

        let concurrency = args
            .concurrency
            .or_else(|| config.and_then(|c| c.concurrency))
            .unwrap_or(defaults.concurrency);
        if concurrency == 0 {
            return Err(CliRunError::InvalidInput(
                "Concurrency must be at least 1.".to_string(),
            ));
        }
        let chapter_timeout = args
            .chapter_timeout
            .or_else(|| config.and_then(|c| c.chapter_timeout_secs))
            .map(Duration::from_secs)
            .unwrap_or(defaults.chapter_timeout);
        let timeout_secs = args
            .timeout
            .or_else(|| config.and_then(|c| c.timeout_secs))
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let retry_count = args
            .retries
            .or_else(|| config.and_then(|c| c.retry_count))
            .unwrap_or(DEFAULT_RETRY_COUNT)
            .max(1);
        let retry_backoff = config
            .and_then(|c| c.retry_backoff_secs.clone())
            .unwrap_or_else(|| DEFAULT_BACKOFF_SECS.to_vec())
            .into_iter()
            .map(Duration::from_secs)
            .collect();

        Ok(Self {
            output_dir: args
                .output_dir
                .clone()
                .or_else(|| config.and_then(|c| c.output_dir.clone()))
                .unwrap_or_else(|| PathBuf::from(".")),
            formats,
            user_agent: args.user_agent.clone().or_else(|| cfg(|c| c.user_agent.clone())),
            timeout: Duration::from_secs(timeout_secs),
            retry_count,
            retry_backoff,
            assets_dir: args
                .assets_dir
                .clone()
                .or_else(|| config.and_then(|c| c.assets_dir.clone())),
            options: GetterOptions {
                login: args.login.clone().or_else(|| cfg(|c| c.login.clone())),
                password: args.password.clone().or_else(|| cfg(|c| c.password.clone())),
                range,
                missing_chapters,
                chapter_timeout,
                concurrency,
            },
        })
    }

    fn client(&self) -> Result<RetryClient, CliRunError> {
        let mut builder = RetryClient::builder()
            .timeout(self.timeout)
            .retry_count(self.retry_count)
            .retry_backoff(self.retry_backoff.clone())
            .max_in_flight(self.options.concurrency * 2);
        if let Some(ua) = &self.user_agent {
            builder = builder.user_agent(ua.clone());
        }
        builder
            .build()
            .map_err(|e| CliRunError::InvalidInput(format!("Failed to create HTTP client: {}", e)))
    }
}

fn load_config(args: &Args) -> Result<Option<Config>, CliRunError> {
    match &args.config {
        Some(path) => config::load_config_file(path).map(Some),
        None => config::load_config(),
    }
    .map_err(CliRunError::Config)
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(0);
    if let Ok(style) =
        ProgressStyle::with_template("{spinner} {msg} [{bar:40}] {pos}/{len} ({elapsed})")
    {
        bar.set_style(
            style
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
                .progress_chars("█▉▊▋▌▍▎▏ "),
        );
    }
    bar
}

/// Entry point for the CLI: the default registry, cancellable with Ctrl-C.
pub async fn run(args: &Args) -> Result<Vec<PathBuf>, CliRunError> {
    let registry = GetterRegistry::with_defaults();
    let interrupted = async {
        // Without a signal handler nothing can cancel the run.
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    run_with(args, &registry, interrupted).await
}

/// Fetch the book through `registry` and write every requested format. Returns the
/// written paths.
///
/// `cancel` interrupts the fetch. Once building has started it runs to completion, so
/// a cancelled run never leaves a partial artifact behind.
pub async fn run_with(
    args: &Args,
    registry: &GetterRegistry,
    cancel: impl Future<Output = ()>,
) -> Result<Vec<PathBuf>, CliRunError> {
    let url = parse_book_url(&args.url).map_err(|e| {
        CliRunError::InvalidInput(format!(
            "{}. Example: https://ranobelib.me/ru/book/12345--slug",
            e
        ))
    })?;
    if !registry.supports(&url) {
        let hosts: Vec<&str> = registry.hosts().collect();
        return Err(CliRunError::InvalidInput(format!(
            "Unsupported site: {}. Supported: {}.",
            url.host_str().unwrap_or_default(),
            hosts.join(", ")
        )));
    }

    let config = load_config(args)?;
    let settings = Settings::resolve(args, config.as_ref())?;
    let client = settings.client()?;

    let bar = progress_bar(args.quiet);
    let progress: ProgressFn = {
        let bar = bar.clone();
        Arc::new(move |done: usize, total: usize| {
            bar.set_length(total as u64);
            bar.set_position(done as u64);
            bar.set_message(format!("Fetching chapter {}/{}", done, total));
        })
    };
    bar.enable_steady_tick(Duration::from_millis(80));

    let getter_config = GetterConfig::new(client, settings.options.clone()).with_progress(progress);
    let fetched = tokio::select! {
        result = fetch(registry, &url, getter_config) => Some(result),
        () = cancel => None,
    };
    bar.disable_steady_tick();
    bar.finish_and_clear();
    let Some(fetched) = fetched else {
        warn!("interrupted");
        return Err(CliRunError::Cancelled);
    };
    let book = fetched?;

    let valid = book.valid_chapters().count();
    if valid == 0 {
        return Err(CliRunError::NoChapters {
            url: url.to_string(),
        });
    }
    info!(title = %book.title, chapters = valid, "book fetched");

    let paths = build_all(Arc::new(book), &settings).await?;
    if !args.quiet {
        for path in &paths {
            eprintln!("Wrote {}", path.display());
        }
    }
    Ok(paths)
}

async fn fetch(
    registry: &GetterRegistry,
    url: &url::Url,
    config: GetterConfig,
) -> Result<Book, GetterError> {
    let mut getter = registry.resolve(url, config)?;
    info!(source = getter.name(), url = %url, "fetching book");
    getter.authorize().await?;
    getter.get(url).await
}

/// Build each format on the blocking pool. A failed format does not stop the others.
async fn build_all(book: Arc<Book>, settings: &Settings) -> Result<Vec<PathBuf>, CliRunError> {
    let mut paths = Vec::new();
    let mut failed = 0;
    for &format in &settings.formats {
        let book = Arc::clone(&book);
        let dir = settings.output_dir.clone();
        let assets = settings.assets_dir.clone();
        let result =
            tokio::task::spawn_blocking(move || build_one(format, &book, &dir, assets.as_deref()))
                .await;
        match result {
            Ok(Ok(path)) => paths.push(path),
            Ok(Err(e)) => {
                failed += 1;
                error!(format = format.extension(), error = %e, "build failed");
            }
            Err(e) => {
                failed += 1;
                error!(format = format.extension(), error = %e, "build task failed");
            }
        }
    }
    if failed > 0 {
        return Err(CliRunError::Output {
            failed,
            total: settings.formats.len(),
        });
    }
    Ok(paths)
}

fn build_one(
    format: OutputFormat,
    book: &Book,
    dir: &Path,
    assets: Option<&Path>,
) -> Result<PathBuf, BuilderError> {
    let mut builder = format.create_builder();
    populate(&mut *builder, book);
    if let Some(assets) = assets {
        for (pattern, kind) in ASSET_PATTERNS {
            builder.with_files(assets, pattern, kind)?;
        }
    }
    builder.build(dir, &book.title)
}
