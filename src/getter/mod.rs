//! Source adapters ("getters"). Registry, per-run configuration, the getter trait and
//! the helpers every getter shares: TOC slicing, bounded chapter fill, image localization.

mod client;
mod error;

pub mod auth;
pub mod decode;
pub mod images;
pub mod litnet;
pub mod ranobelib;
pub mod royalroad;

pub use client::{parse_json, RetryClient, RetryClientBuilder};
pub use error::{DecodeError, GetterError};
pub use images::ImageStore;

use crate::model::{Book, Chapter, Image};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

const DEFAULT_CHAPTER_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CONCURRENCY: usize = 4;
const PLACEHOLDER_BODY: &str = "<p>This chapter could not be retrieved.</p>";

/// Source adapter: turns a book URL into a normalized [Book].
///
/// Call order per run: [authorize](Getter::authorize) once, then [get](Getter::get).
#[async_trait]
pub trait Getter: Send + Sync {
    /// Short source name for logs.
    fn name(&self) -> &'static str;

    /// Log in when credentials are configured; a no-op (or an anonymous device session
    /// where the source needs one) otherwise. A rejected login is an error, never a
    /// silent fallback to anonymous access.
    async fn authorize(&mut self) -> Result<(), GetterError>;

    /// Source-specific book id from a book URL. No I/O.
    fn get_id(&self, url: &Url) -> Result<String, GetterError>;

    /// Fetch metadata and chapters. Fails as a whole if the book metadata cannot be read.
    async fn get(&self, url: &Url) -> Result<Book, GetterError>;
}

/// What to do with a chapter whose download or decoding failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingChapterBehavior {
    /// Keep an empty chapter (dropped by builders) and log a warning.
    #[default]
    Skip,
    /// Keep the chapter with a notice as its body.
    Placeholder,
    /// Fail the whole fetch.
    Fail,
}

impl std::str::FromStr for MissingChapterBehavior {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "placeholder" => Ok(Self::Placeholder),
            "fail" => Ok(Self::Fail),
            _ => Err(format!(
                "Invalid missing-chapter policy: '{}'. Use skip, placeholder, or fail.",
                s
            )),
        }
    }
}

/// Contiguous TOC window, 0-based and half-open: `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChapterRange {
    pub start: Option<usize>,
    pub end: Option<usize>,
}

impl ChapterRange {
    pub fn new(start: Option<usize>, end: Option<usize>) -> Self {
        Self { start, end }
    }

    /// From 1-based inclusive chapter numbers, as users write them.
    pub fn from_numbers(first: usize, last: usize) -> Self {
        Self {
            start: Some(first.saturating_sub(1)),
            end: Some(last),
        }
    }

    pub fn is_full(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Restrict `toc` to the window. Bounds clamp to the list length.
    pub fn slice<T>(&self, toc: Vec<T>) -> Vec<T> {
        let len = toc.len();
        let start = self.start.unwrap_or(0).min(len);
        let end = self.end.unwrap_or(len).min(len);
        if start >= end {
            return Vec::new();
        }
        toc.into_iter().skip(start).take(end - start).collect()
    }
}

/// Run options a getter reads.
#[derive(Debug, Clone)]
pub struct GetterOptions {
    pub login: Option<String>,
    pub password: Option<String>,
    pub range: ChapterRange,
    pub missing_chapters: MissingChapterBehavior,
    /// Per-attempt timeout for chapter bodies.
    pub chapter_timeout: Duration,
    /// Chapters fetched at once.
    pub concurrency: usize,
}

impl Default for GetterOptions {
    fn default() -> Self {
        Self {
            login: None,
            password: None,
            range: ChapterRange::default(),
            missing_chapters: MissingChapterBehavior::default(),
            chapter_timeout: Duration::from_secs(DEFAULT_CHAPTER_TIMEOUT_SECS),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// Called with `(done, total)` after each chapter.
pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Everything one run of one getter works with. Owned by the getter instance, so
/// nothing here outlives the run.
#[derive(Clone)]
pub struct GetterConfig {
    pub client: RetryClient,
    pub options: GetterOptions,
    pub images: ImageStore,
    progress: Option<ProgressFn>,
}

impl std::fmt::Debug for GetterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetterConfig")
            .field("client", &self.client)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl GetterConfig {
    pub fn new(client: RetryClient, options: GetterOptions) -> Self {
        Self {
            client,
            options,
            images: ImageStore::new(),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn has_credentials(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        filled(&self.options.login) && filled(&self.options.password)
    }

    /// Credentials, if both are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        if !self.has_credentials() {
            return None;
        }
        Some((
            self.options.login.as_deref()?,
            self.options.password.as_deref()?,
        ))
    }

    /// Restrict a TOC to the configured chapter range.
    pub fn slice_toc<T>(&self, toc: Vec<T>) -> Vec<T> {
        let total = toc.len();
        let sliced = self.options.range.slice(toc);
        if !self.options.range.is_full() {
            info!(total, selected = sliced.len(), "chapter range applied");
        }
        sliced
    }

    /// Download an image through the run's shared cache.
    pub async fn save_image(&self, url: Url) -> Option<Image> {
        self.images.fetch(&self.client, url).await
    }

    /// Build a chapter from raw markup: sanitize and localize images.
    pub async fn chapter_from_markup(&self, title: String, raw: &str, image_host: &Url) -> Chapter {
        let (content, images) = images::localize(raw, image_host, &self.client, &self.images).await;
        Chapter {
            title,
            content,
            images,
        }
    }

    /// Fetch every TOC entry with at most `concurrency` requests in flight and return the
    /// chapters in TOC order.
    ///
    /// `toc` pairs each entry with its title. A failed entry is handled per
    /// [MissingChapterBehavior]; chapters that come back empty are kept (builders drop
    /// them) and logged.
    pub async fn fill_chapters<T, F, Fut>(
        &self,
        toc: Vec<(String, T)>,
        fetch: F,
    ) -> Result<Vec<Chapter>, GetterError>
    where
        T: Send,
        F: Fn(usize, String, T) -> Fut + Sync,
        Fut: Future<Output = Result<Chapter, GetterError>> + Send,
    {
        let total = toc.len();
        let fetch = &fetch;
        let mut pending = stream::iter(toc.into_iter().enumerate())
            .map(|(index, (title, entry))| async move {
                let result = fetch(index, title.clone(), entry).await;
                (index, title, result)
            })
            .buffer_unordered(self.options.concurrency.max(1));

        let mut slots: Vec<Option<Chapter>> = vec![None; total];
        let mut done = 0;
        while let Some((index, title, result)) = pending.next().await {
            done += 1;
            if let Some(progress) = &self.progress {
                progress(done, total);
            }
            let chapter = match result {
                Ok(chapter) => {
                    if !chapter.is_valid() {
                        warn!(chapter = index + 1, title = %chapter.title, "chapter has no content");
                    }
                    chapter
                }
                Err(e) => match self.options.missing_chapters {
                    MissingChapterBehavior::Skip => {
                        warn!(chapter = index + 1, title = %title, error = %e, "chapter skipped");
                        Chapter::new(title)
                    }
                    MissingChapterBehavior::Placeholder => {
                        warn!(chapter = index + 1, title = %title, error = %e, "chapter replaced by placeholder");
                        Chapter {
                            content: PLACEHOLDER_BODY.to_string(),
                            ..Chapter::new(title)
                        }
                    }
                    MissingChapterBehavior::Fail => {
                        return Err(GetterError::Chapter {
                            index: index + 1,
                            title,
                            source: Box::new(e),
                        });
                    }
                },
            };
            slots[index] = Some(chapter);
        }
        Ok(slots.into_iter().flatten().collect())
    }
}

/// Constructor for one getter, given the input URL and the run configuration.
pub type GetterFactory = fn(&Url, GetterConfig) -> Result<Box<dyn Getter>, GetterError>;

/// Maps source hosts to getter constructors.
#[derive(Default)]
pub struct GetterRegistry {
    entries: Vec<(&'static str, GetterFactory)>,
}

impl GetterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in source.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("litnet.com", litnet::LitnetGetter::create);
        registry.register("booknet.com", litnet::LitnetGetter::create);
        registry.register("ranobelib.me", ranobelib::RanobeLibGetter::create);
        registry.register("royalroad.com", royalroad::RoyalRoadGetter::create);
        registry
    }

    /// `host` matches itself and its subdomains.
    pub fn register(&mut self, host: &'static str, factory: GetterFactory) {
        self.entries.push((host, factory));
    }

    pub fn hosts(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(h, _)| *h)
    }

    fn find(&self, url: &Url) -> Option<GetterFactory> {
        let host = url.host_str()?;
        self.entries
            .iter()
            .find(|(pattern, _)| host == *pattern || host.ends_with(&format!(".{pattern}")))
            .map(|(_, f)| *f)
    }

    pub fn supports(&self, url: &Url) -> bool {
        self.find(url).is_some()
    }

    /// Build the getter registered for the URL's host.
    pub fn resolve(&self, url: &Url, config: GetterConfig) -> Result<Box<dyn Getter>, GetterError> {
        let factory = self.find(url).ok_or_else(|| GetterError::UnsupportedSource {
            host: url.host_str().unwrap_or_default().to_string(),
        })?;
        factory(url, config)
    }
}

/// Parse user input as an absolute http(s) URL.
pub fn parse_book_url(input: &str) -> Result<Url, GetterError> {
    let url = Url::parse(input.trim()).map_err(|e| GetterError::InvalidUrl {
        input: input.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(GetterError::InvalidUrl {
            input: input.to_string(),
            reason: "expected an http(s) URL with a host".to_string(),
        });
    }
    Ok(url)
}

/// Non-empty path segments of a URL.
pub(crate) fn path_segments(url: &Url) -> Vec<&str> {
    url.path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default()
}
