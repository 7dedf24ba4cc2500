//! Output builders. Each format accumulates book fields through the same fluent
//! setters and is finalized exactly once with [Builder::build].

pub mod epub;
pub mod json;
pub mod plain;

use crate::model::{Author, Book, Chapter, Image, Seria};
use crate::text;
use serde::Serialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Name used when a title sanitizes to nothing.
const FALLBACK_FILE_STEM: &str = "book";

/// Errors from the builders. Maps to CLI exit code 3.
#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("Cannot write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write EPUB archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Failed to serialize book: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cannot build {format}: {reason}")]
    Incomplete { format: &'static str, reason: String },
}

impl BuilderError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> BuilderError + '_ {
        move |source| BuilderError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Kind of an auxiliary file packaged next to the content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AssetKind {
    Style,
    Font,
    Image,
}

impl AssetKind {
    pub fn media_type(&self, name: &str) -> &'static str {
        let ext = name
            .rsplit_once('.')
            .map(|(_, e)| e.to_ascii_lowercase())
            .unwrap_or_default();
        match (self, ext.as_str()) {
            (AssetKind::Style, _) => "text/css",
            (AssetKind::Font, "otf") => "font/otf",
            (AssetKind::Font, "woff") => "font/woff",
            (AssetKind::Font, "woff2") => "font/woff2",
            (AssetKind::Font, _) => "font/ttf",
            (AssetKind::Image, "png") => "image/png",
            (AssetKind::Image, "gif") => "image/gif",
            (AssetKind::Image, "svg") => "image/svg+xml",
            (AssetKind::Image, _) => "image/jpeg",
        }
    }

    fn folder(&self) -> &'static str {
        match self {
            AssetKind::Style => "styles",
            AssetKind::Font => "fonts",
            AssetKind::Image => "images",
        }
    }
}

/// An auxiliary file read by [Builder::with_files].
#[derive(Debug, Clone)]
pub struct Asset {
    pub name: String,
    pub kind: AssetKind,
    pub content: Vec<u8>,
}

impl Asset {
    /// Path inside a packaged artifact.
    pub fn path(&self) -> String {
        format!("{}/{}", self.kind.folder(), self.name)
    }
}

/// Fields accumulated by the setters. Shared by every builder.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BookParts {
    pub url: Option<Url>,
    pub title: String,
    pub authors: Vec<Author>,
    pub cover: Option<Image>,
    pub annotation: Option<String>,
    pub seria: Option<Seria>,
    pub lang: Option<String>,
    pub chapters: Vec<Chapter>,
    #[serde(skip)]
    pub assets: Vec<Asset>,
}

impl BookParts {
    /// Cover and chapter images, each distinct file once, in first-use order.
    pub fn images(&self) -> Vec<&Image> {
        let mut out: Vec<&Image> = Vec::new();
        let all = self
            .cover
            .iter()
            .chain(self.chapters.iter().flat_map(|c| c.images.iter()));
        for image in all {
            if !out.iter().any(|i| i.name == image.name) {
                out.push(image);
            }
        }
        out
    }
}

/// A format-specific accumulator.
///
/// Setters take optional values as given; `None` or empty means "not present".
/// Implementors provide storage ([parts](Builder::parts)), the file extension and
/// [build](Builder::build); the setters are shared.
pub trait Builder: Send {
    /// File extension of the artifact, without the dot.
    fn extension(&self) -> &'static str;

    fn parts(&mut self) -> &mut BookParts;

    /// `self` as a trait object, for chaining.
    fn as_dyn(&mut self) -> &mut dyn Builder;

    fn add_author(&mut self, author: &Author) -> &mut dyn Builder {
        self.parts().authors.push(author.clone());
        self.as_dyn()
    }

    fn with_title(&mut self, title: &str) -> &mut dyn Builder {
        self.parts().title = title.trim().to_string();
        self.as_dyn()
    }

    fn with_cover(&mut self, cover: Option<&Image>) -> &mut dyn Builder {
        self.parts().cover = cover.cloned();
        self.as_dyn()
    }

    fn with_book_url(&mut self, url: &Url) -> &mut dyn Builder {
        self.parts().url = Some(url.clone());
        self.as_dyn()
    }

    fn with_annotation(&mut self, annotation: Option<&str>) -> &mut dyn Builder {
        self.parts().annotation = annotation.filter(|a| !a.trim().is_empty()).map(String::from);
        self.as_dyn()
    }

    fn with_seria(&mut self, seria: Option<&Seria>) -> &mut dyn Builder {
        self.parts().seria = seria.cloned();
        self.as_dyn()
    }

    fn with_lang(&mut self, lang: Option<&str>) -> &mut dyn Builder {
        self.parts().lang = lang.filter(|l| !l.trim().is_empty()).map(String::from);
        self.as_dyn()
    }

    /// Keep only chapters with content, in the given order.
    fn with_chapters(&mut self, chapters: &[Chapter]) -> &mut dyn Builder {
        let valid: Vec<Chapter> = chapters.iter().filter(|c| c.is_valid()).cloned().collect();
        let dropped = chapters.len() - valid.len();
        if dropped > 0 {
            debug!(dropped, "chapters without content left out");
        }
        self.parts().chapters = valid;
        self.as_dyn()
    }

    /// Add auxiliary files from `dir` whose names match `pattern` (`*` matches any run
    /// of characters). A no-op for formats without packaging.
    fn with_files(
        &mut self,
        _dir: &Path,
        _pattern: &str,
        _kind: AssetKind,
    ) -> Result<&mut dyn Builder, BuilderError> {
        Ok(self.as_dyn())
    }

    /// Write `<dir>/<sanitized name>.<ext>` and return its path. Consumes the builder.
    fn build(self: Box<Self>, dir: &Path, name: &str) -> Result<PathBuf, BuilderError>;
}

/// Feed every field of `book` into `builder`.
pub fn populate<'a>(builder: &'a mut dyn Builder, book: &Book) -> &'a mut dyn Builder {
    builder.add_author(&book.author);
    for co_author in &book.co_authors {
        builder.add_author(co_author);
    }
    builder
        .with_title(&book.title)
        .with_cover(book.cover.as_ref())
        .with_book_url(&book.url)
        .with_annotation(book.annotation.as_deref())
        .with_seria(book.seria.as_ref())
        .with_lang(book.lang.as_deref())
        .with_chapters(&book.chapters)
}

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Epub,
    Json,
    Markdown,
    Text,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Epub => "epub",
            OutputFormat::Json => "json",
            OutputFormat::Markdown => "md",
            OutputFormat::Text => "txt",
        }
    }

    pub fn create_builder(&self) -> Box<dyn Builder> {
        match self {
            OutputFormat::Epub => Box::new(epub::EpubBuilder::new()),
            OutputFormat::Json => Box::new(json::JsonBuilder::new()),
            OutputFormat::Markdown => Box::new(plain::PlainBuilder::markdown()),
            OutputFormat::Text => Box::new(plain::PlainBuilder::text()),
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "epub" => Ok(OutputFormat::Epub),
            "json" => Ok(OutputFormat::Json),
            "md" | "markdown" => Ok(OutputFormat::Markdown),
            "txt" | "text" => Ok(OutputFormat::Text),
            _ => Err(format!(
                "Invalid format: '{}'. Use epub, json, md, or txt.",
                s.trim()
            )),
        }
    }
}

/// Parse a comma-separated format list, keeping first occurrences.
pub fn parse_formats(list: &str) -> Result<Vec<OutputFormat>, String> {
    let mut formats = Vec::new();
    for part in list.split(',').filter(|p| !p.trim().is_empty()) {
        let format: OutputFormat = part.parse()?;
        if !formats.contains(&format) {
            formats.push(format);
        }
    }
    if formats.is_empty() {
        return Err("At least one output format is required.".to_string());
    }
    Ok(formats)
}

/// `<dir>/<name>.<ext>` with characters invalid in file names removed.
pub fn artifact_path(dir: &Path, name: &str, extension: &str) -> PathBuf {
    let stem = text::remove_invalid_chars(&text::replace_newline(name));
    let stem = if stem.is_empty() {
        FALLBACK_FILE_STEM
    } else {
        stem.as_str()
    };
    dir.join(format!("{stem}.{extension}"))
}

/// Create parent directories, let `write` fill a temporary sibling file, then move it
/// into place. On failure the temporary file is removed and `path` is left untouched.
pub fn write_atomically<F>(path: &Path, write: F) -> Result<(), BuilderError>
where
    F: FnOnce(File) -> Result<(), BuilderError>,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(BuilderError::io(parent))?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".part");
    let tmp = path.with_file_name(tmp_name);

    let result = File::create(&tmp)
        .map_err(BuilderError::io(&tmp))
        .and_then(write)
        .and_then(|()| fs::rename(&tmp, path).map_err(BuilderError::io(path)));
    if result.is_err() {
        if let Err(e) = fs::remove_file(&tmp) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %tmp.display(), error = %e, "temporary file could not be removed");
            }
        }
    }
    result
}

pub(crate) fn read_assets(dir: &Path, pattern: &str, kind: AssetKind) -> Result<Vec<Asset>, BuilderError> {
    let entries = fs::read_dir(dir).map_err(BuilderError::io(dir))?;
    let mut assets = Vec::new();
    for entry in entries {
        let entry = entry.map_err(BuilderError::io(dir))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !matches_pattern(name, pattern) {
            continue;
        }
        let content = fs::read(&path).map_err(BuilderError::io(&path))?;
        assets.push(Asset {
            name: text::remove_invalid_chars(name),
            kind,
            content,
        });
    }
    assets.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(assets)
}

/// Glob with `*` wildcards only.
fn matches_pattern(name: &str, pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return name == pattern;
    }
    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !name.starts_with(first) || name.len() < first.len() + last.len() || !name.ends_with(last) {
        return false;
    }
    let mut rest = &name[first.len()..name.len() - last.len()];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(i) => rest = &rest[i + middle.len()..],
            None => return false,
        }
    }
    true
}

/// Escape text for XML content and attribute values.
pub(crate) fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
pub(crate) mod fixture {
    use crate::model::{Author, Book, Chapter, Image};
    use std::sync::Arc;
    use url::Url;

    pub fn image(url: &str, name: &str) -> Image {
        Image {
            url: Url::parse(url).unwrap(),
            name: name.to_string(),
            content: Arc::from(&b"\x89PNG fake"[..]),
        }
    }

    pub fn book() -> Book {
        let url = Url::parse("https://example.com/book/1").unwrap();
        let mut book = Book::new(url, Author::new("Test Author", None));
        book.title = "Test Book".to_string();
        book.chapters = vec![
            Chapter {
                content: "<p>First paragraph.</p>".to_string(),
                ..Chapter::new("Chapter 1")
            },
            Chapter::new("Empty"),
            Chapter {
                content: r#"<p>Second &amp; last.</p><p><img src="images/pic.png"></p>"#.to_string(),
                images: vec![image("https://example.com/pic.png", "pic.png")],
                ..Chapter::new("Chapter <2>")
            },
        ];
        book
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn formats_parse_and_dedupe() {
        assert_eq!(
            parse_formats("epub, json,EPUB,md"),
            Ok(vec![OutputFormat::Epub, OutputFormat::Json, OutputFormat::Markdown])
        );
        assert_eq!(parse_formats("text"), Ok(vec![OutputFormat::Text]));
        assert!(parse_formats("pdf").is_err());
        assert!(parse_formats(" , ").is_err());
    }

    #[test]
    fn artifact_path_is_sanitized() {
        let dir = Path::new("out");
        assert_eq!(artifact_path(dir, "My/Book:Title*", "epub"), dir.join("MyBookTitle.epub"));
        assert_eq!(artifact_path(dir, "???", "json"), dir.join("book.json"));
        assert_eq!(artifact_path(dir, "Two\nLines", "txt"), dir.join("Two Lines.txt"));
    }

    #[test]
    fn setters_chain_and_filter_chapters() {
        let book = fixture::book();
        let mut builder = json::JsonBuilder::new();
        populate(&mut builder, &book).with_annotation(Some("  "));
        let parts = builder.parts();
        assert_eq!(parts.title, "Test Book");
        assert_eq!(parts.authors.len(), 1);
        assert!(parts.annotation.is_none());
        let titles: Vec<_> = parts.chapters.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["Chapter 1", "Chapter <2>"]);
    }

    #[test]
    fn images_are_deduplicated_by_name() {
        let mut parts = BookParts {
            cover: Some(fixture::image("https://example.com/c.png", "c.png")),
            ..BookParts::default()
        };
        let shared = fixture::image("https://example.com/p.png", "p.png");
        parts.chapters = vec![
            Chapter {
                images: vec![shared.clone()],
                ..Chapter::new("a")
            },
            Chapter {
                images: vec![shared, fixture::image("https://example.com/c.png", "c.png")],
                ..Chapter::new("b")
            },
        ];
        let names: Vec<_> = parts.images().iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["c.png", "p.png"]);
    }

    #[test]
    fn atomic_write_leaves_nothing_on_failure() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("out.txt");
        let result = write_atomically(&path, |_| {
            Err(BuilderError::Incomplete {
                format: "txt",
                reason: "boom".into(),
            })
        });
        assert!(result.is_err());
        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path().join("nested"))?.count(), 0);

        write_atomically(&path, |mut f| {
            std::io::Write::write_all(&mut f, b"ok").map_err(BuilderError::io(Path::new("x")))
        })?;
        assert_eq!(fs::read_to_string(&path)?, "ok");
        Ok(())
    }

    #[test]
    fn pattern_matching() {
        assert!(matches_pattern("style.css", "*.css"));
        assert!(matches_pattern("a.css", "*"));
        assert!(matches_pattern("font-bold.ttf", "font*.ttf"));
        assert!(matches_pattern("x.ttf", "x.ttf"));
        assert!(!matches_pattern("style.css.bak", "*.css"));
        assert!(!matches_pattern("a.css", "b*.css"));
        assert!(matches_pattern("a-b-c.txt", "a*b*c.txt"));
    }

    #[test]
    fn assets_are_read_from_directory() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("b.css"), "p{}")?;
        fs::write(dir.path().join("a.css"), "h1{}")?;
        fs::write(dir.path().join("notes.txt"), "x")?;
        let assets = read_assets(dir.path(), "*.css", AssetKind::Style)?;
        let names: Vec<_> = assets.iter().map(|a| a.path()).collect();
        assert_eq!(names, vec!["styles/a.css", "styles/b.css"]);
        assert!(read_assets(&dir.path().join("missing"), "*", AssetKind::Font).is_err());
        Ok(())
    }
}
