//! Royal Road adapter. Scrapes the fiction page (metadata + TOC) then each chapter page.
//!
//! Cloudflare: cookie jar and browser-like User-Agent are used; captcha is not handled.

use crate::getter::{path_segments, Getter, GetterConfig, GetterError};
use crate::model::{Author, Book, Chapter};
use crate::text;
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use url::Url;

const ROYALROAD_BASE: &str = "https://www.royalroad.com/";
const TITLE_SUFFIXES: [&str; 3] = [" _ Royal Road", " - Royal Road", " | Royal Road"];

/// Parse a CSS selector or return a parse error (avoids panics from Selector::parse).
fn parse_selector(sel: &str) -> Result<Selector, GetterError> {
    Selector::parse(sel).map_err(|e| GetterError::parse("page", format!("invalid selector {sel:?}: {e}")))
}

/// Shape of one entry in window.chapters (relative url, order 0-based, isUnlocked).
#[derive(Debug, Deserialize)]
struct WindowChapter {
    title: String,
    url: String,
    #[serde(default)]
    order: u32,
    #[serde(rename = "isUnlocked", default = "default_true")]
    is_unlocked: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, PartialEq)]
struct Metadata {
    title: String,
    author: String,
    author_url: Option<String>,
    description: Option<String>,
    cover_url: Option<String>,
}

#[derive(Debug, PartialEq)]
struct TocEntry {
    url: Url,
    title: String,
    unlocked: bool,
}

pub struct RoyalRoadGetter {
    config: GetterConfig,
    base: Url,
}

impl RoyalRoadGetter {
    pub fn new(config: GetterConfig, base: Url) -> Self {
        Self { config, base }
    }

    pub fn create(_url: &Url, config: GetterConfig) -> Result<Box<dyn Getter>, GetterError> {
        let base = Url::parse(ROYALROAD_BASE).map_err(|e| GetterError::InvalidUrl {
            input: ROYALROAD_BASE.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(Self::new(config, base)))
    }

    async fn fetch_chapter(&self, title: String, entry: TocEntry) -> Result<Chapter, GetterError> {
        if !entry.unlocked {
            return Err(GetterError::parse("chapter", "chapter is locked (premium)"));
        }
        debug!(url = %entry.url, "loading chapter");
        let request = self
            .config
            .client
            .get(entry.url.clone())
            .timeout(self.config.options.chapter_timeout);
        let html = self.config.client.text(request, "chapter page").await?;
        let (page_title, body) = parse_chapter_page(&html, &entry.url)?;
        let title = if title.trim().is_empty() { page_title } else { title };
        Ok(self.config.chapter_from_markup(title, &body, &self.base).await)
    }
}

#[async_trait]
impl Getter for RoyalRoadGetter {
    fn name(&self) -> &'static str {
        "royalroad"
    }

    /// Public fictions need no login.
    async fn authorize(&mut self) -> Result<(), GetterError> {
        if self.config.has_credentials() {
            warn!("Royal Road login is not supported; continuing anonymously");
        }
        Ok(())
    }

    /// `/fiction/<id>/<slug>` -> `<id>`. Chapter URLs are rejected.
    fn get_id(&self, url: &Url) -> Result<String, GetterError> {
        let segments = path_segments(url);
        if segments.contains(&"chapter") {
            return Err(GetterError::InvalidUrl {
                input: url.to_string(),
                reason: "expected a fiction (index) URL, not a chapter URL".to_string(),
            });
        }
        match segments.as_slice() {
            ["fiction", id, ..] if id.chars().all(|c| c.is_ascii_digit()) => Ok(id.to_string()),
            _ => Err(GetterError::InvalidUrl {
                input: url.to_string(),
                reason: "expected https://www.royalroad.com/fiction/<id>/<slug>".to_string(),
            }),
        }
    }

    #[instrument(skip(self, url), fields(source = "royalroad", url = %url))]
    async fn get(&self, url: &Url) -> Result<Book, GetterError> {
        self.get_id(url)?;
        let html = self
            .config
            .client
            .text(self.config.client.get(url.clone()), "story page")
            .await?;
        let meta = parse_metadata(&html)?;
        let toc = parse_toc(&html, &self.base)?;

        let locked = toc.iter().filter(|e| !e.unlocked).count();
        if locked > 0 {
            warn!(locked, "fiction has locked chapters");
        }

        let author_url = meta.author_url.as_deref().and_then(|u| self.base.join(u).ok());
        let mut book = Book::new(url.clone(), Author::new(meta.author, author_url));
        book.title = meta.title;
        book.lang = Some("en".to_string());
        book.annotation = meta.description.map(|d| {
            if d.contains('<') {
                text::sanitize_fragment(&d)
            } else {
                text::paragraphs(&d)
            }
        });
        if let Some(cover) = meta.cover_url {
            match self.base.join(&cover) {
                Ok(cover_url) => book.cover = self.config.save_image(cover_url).await,
                Err(e) => warn!(cover, error = %e, "cover URL is invalid"),
            }
        }

        let toc: Vec<(String, TocEntry)> = self
            .config
            .slice_toc(toc)
            .into_iter()
            .map(|e| (e.title.clone(), e))
            .collect();
        info!(title = %book.title, chapters = toc.len(), "fetching chapters");

        book.chapters = self
            .config
            .fill_chapters(toc, |_, title, entry| self.fetch_chapter(title, entry))
            .await?;
        Ok(book)
    }
}

/// Extract metadata from fiction page HTML: JSON-LD Book first, then DOM fallback.
fn parse_metadata(html: &str) -> Result<Metadata, GetterError> {
    let doc = Html::parse_document(html);
    let author_link_sel = parse_selector("h4 a[href*='/profile/']")?;
    let author_url = doc
        .select(&author_link_sel)
        .next()
        .and_then(|e| e.value().attr("href"))
        .map(String::from);

    let ld_sel = parse_selector("script[type='application/ld+json']")?;
    for script in doc.select(&ld_sel) {
        let json = script.text().collect::<String>();
        let Ok(v) = serde_json::from_str::<serde_json::Value>(json.trim()) else {
            continue;
        };
        if v.get("@type").and_then(|t| t.as_str()) != Some("Book") {
            continue;
        }
        let field = |value: Option<&serde_json::Value>| {
            value
                .and_then(|n| n.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let title = field(v.get("name"));
        let author = field(v.get("author").and_then(|a| a.get("name")));
        if let (Some(title), Some(author)) = (title, author) {
            return Ok(Metadata {
                title,
                author,
                author_url,
                description: field(v.get("description")),
                cover_url: field(v.get("image")),
            });
        }
    }

    // Fallback: DOM selectors
    let text_of = |sel: &Selector| {
        doc.select(sel)
            .next()
            .map(|e| text::replace_newline(&e.text().collect::<String>()))
            .filter(|s| !s.is_empty())
    };
    let title = text_of(&parse_selector("h1.font-white")?);
    let author = text_of(&parse_selector("h4 a.font-white")?);
    let desc_sel = parse_selector(".description")?;
    let description = doc
        .select(&desc_sel)
        .next()
        .map(|e| e.inner_html().trim().to_string())
        .filter(|s| !s.is_empty());
    let cover_sel = parse_selector("meta[property=\"og:image\"]")?;
    let cover_url = doc
        .select(&cover_sel)
        .next()
        .and_then(|e| e.value().attr("content").map(String::from))
        .filter(|s| !s.is_empty());

    match (title, author) {
        (Some(title), Some(author)) => Ok(Metadata {
            title,
            author,
            author_url,
            description,
            cover_url,
        }),
        _ => Err(GetterError::parse(
            "story page",
            "missing title or author (selector or structure may have changed)",
        )),
    }
}

/// Extract the window.chapters array. Relative URLs resolve against `base`.
fn parse_toc(html: &str, base: &Url) -> Result<Vec<TocEntry>, GetterError> {
    let toc_error = |reason: &str| GetterError::parse("chapter list", reason);
    let needle = "window.chapters = ";
    let start = html
        .find(needle)
        .ok_or_else(|| toc_error("window.chapters not found"))?;
    let array = extract_json_array_with_strings(&html[start + needle.len()..])
        .ok_or_else(|| toc_error("could not extract window.chapters array"))?;
    let mut chapters: Vec<WindowChapter> =
        serde_json::from_str(array).map_err(|e| toc_error(&e.to_string()))?;
    chapters.sort_by_key(|c| c.order);

    chapters
        .into_iter()
        .map(|ch| {
            let url = base
                .join(&ch.url)
                .map_err(|e| toc_error(&format!("{}: {e}", ch.url)))?;
            Ok(TocEntry {
                url,
                title: text::replace_newline(&ch.title),
                unlocked: ch.is_unlocked,
            })
        })
        .collect()
}

/// Find the matching closing bracket for the first '[' in s, skipping content inside JSON strings.
fn extract_json_array_with_strings(s: &str) -> Option<&str> {
    let start = s.find('[')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    for (offset, c) in s[start..].char_indices() {
        if in_string {
            match c {
                _ if escape => escape = false,
                '\\' => escape = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + offset + 1]);
                }
            }
            '"' => in_string = true,
            _ => {}
        }
    }
    None
}

/// Chapter title and the raw markup of the chapter container.
fn parse_chapter_page(html: &str, url: &Url) -> Result<(String, String), GetterError> {
    let doc = Html::parse_document(html);

    let h1_sel = parse_selector("h1.font-white.break-word")?;
    let og_title_sel = parse_selector("meta[property=\"og:title\"]")?;
    let title = doc
        .select(&h1_sel)
        .next()
        .map(|e| text::replace_newline(&e.text().collect::<String>()))
        .filter(|s| !s.is_empty())
        .or_else(|| {
            doc.select(&og_title_sel)
                .next()
                .and_then(|e| e.value().attr("content"))
                .map(strip_title_site_suffix)
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_default();

    let container_sel = parse_selector("div.chapter-inner.chapter-content")?;
    let body = doc
        .select(&container_sel)
        .next()
        .map(|c| c.inner_html())
        .ok_or_else(|| GetterError::parse("chapter page", format!("no chapter content container at {url}")))?;
    Ok((title, body))
}

fn strip_title_site_suffix(s: &str) -> String {
    let t = s.trim();
    TITLE_SUFFIXES
        .iter()
        .find_map(|suffix| t.strip_suffix(suffix))
        .unwrap_or(t)
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::getter::{GetterOptions, RetryClient};
    use std::error::Error;

    fn base() -> Result<Url, url::ParseError> {
        Url::parse(ROYALROAD_BASE)
    }

    #[test]
    fn metadata_from_json_ld() -> Result<(), Box<dyn Error>> {
        let html = r#"<html><head></head><body>
<h4><a class="font-white" href="/profile/99">Inline Author</a></h4>
<script type="application/ld+json">
{"@type":"Book","name":"Inline Test Book","author":{"name":"Inline Author"},"description":"A description.","image":"https://example.com/cover.png"}
</script>
</body></html>"#;
        let meta = parse_metadata(html)?;
        assert_eq!(meta.title, "Inline Test Book");
        assert_eq!(meta.author, "Inline Author");
        assert_eq!(meta.author_url.as_deref(), Some("/profile/99"));
        assert_eq!(meta.description.as_deref(), Some("A description."));
        assert_eq!(meta.cover_url.as_deref(), Some("https://example.com/cover.png"));
        Ok(())
    }

    #[test]
    fn metadata_falls_back_to_dom() -> Result<(), Box<dyn Error>> {
        let html = r#"<html><head><meta property="og:image" content="/covers/c.jpg"></head><body>
<h1 class="font-white">DOM Title</h1><h4><a class="font-white" href="/profile/1">DOM Author</a></h4>
<div class="description"><p>Blurb</p></div></body></html>"#;
        let meta = parse_metadata(html)?;
        assert_eq!(meta.title, "DOM Title");
        assert_eq!(meta.author, "DOM Author");
        assert_eq!(meta.description.as_deref(), Some("<p>Blurb</p>"));
        assert_eq!(meta.cover_url.as_deref(), Some("/covers/c.jpg"));
        Ok(())
    }

    #[test]
    fn metadata_without_title_is_an_error() {
        assert!(parse_metadata("<html><body><p>nothing</p></body></html>").is_err());
    }

    #[test]
    fn toc_is_ordered_and_keeps_lock_state() -> Result<(), Box<dyn Error>> {
        let html = r#"<script>
window.chapters = [{"id":2,"title":"Locked","url":"/fiction/1/s/chapter/2/locked","order":1,"isUnlocked":false},{"id":1,"title":"Free [1]","url":"/fiction/1/s/chapter/1/free","order":0,"isUnlocked":true}];
</script>"#;
        let toc = parse_toc(html, &base()?)?;
        assert_eq!(toc.len(), 2);
        assert_eq!(toc[0].title, "Free [1]");
        assert!(toc[0].unlocked);
        assert_eq!(toc[0].url.as_str(), "https://www.royalroad.com/fiction/1/s/chapter/1/free");
        assert!(!toc[1].unlocked);
        Ok(())
    }

    #[test]
    fn missing_toc_is_an_error() -> Result<(), Box<dyn Error>> {
        assert!(parse_toc("<html></html>", &base()?).is_err());
        Ok(())
    }

    #[test]
    fn json_array_extraction_skips_brackets_in_strings() {
        let s = r#"[{"t":"a]b","u":"\"[x"}]; var y = [1];"#;
        assert_eq!(extract_json_array_with_strings(s), Some(r#"[{"t":"a]b","u":"\"[x"}]"#));
        assert_eq!(extract_json_array_with_strings("[1, [2"), None);
    }

    #[test]
    fn chapter_page_keeps_container_markup() -> Result<(), Box<dyn Error>> {
        let html = r#"<!DOCTYPE html><html><head><meta property="og:title" content="1. Good Morning - Book _ Royal Road"/></head><body>
<h1 class="font-white break-word">1. Good Morning</h1>
<div class="chapter-inner chapter-content">
<p>First paragraph here.</p>
<p><img src="/img/a.png"></p>
</div>
</body></html>"#;
        let (title, body) = parse_chapter_page(html, &base()?)?;
        assert_eq!(title, "1. Good Morning");
        assert!(body.contains("<p>First paragraph here.</p>"));
        assert!(body.contains("<img src=\"/img/a.png\">"));
        Ok(())
    }

    #[test]
    fn chapter_title_falls_back_to_og_title() -> Result<(), Box<dyn Error>> {
        let html = r#"<html><head><meta property="og:title" content="1. Good Morning - Brother - Book _ Royal Road"/></head><body>
<div class="chapter-inner chapter-content"><p>Content.</p></div></body></html>"#;
        let (title, _) = parse_chapter_page(html, &base()?)?;
        assert_eq!(title, "1. Good Morning - Brother - Book");
        Ok(())
    }

    #[test]
    fn chapter_page_without_container_is_an_error() -> Result<(), Box<dyn Error>> {
        assert!(parse_chapter_page("<html><body><p>x</p></body></html>", &base()?).is_err());
        Ok(())
    }

    #[test]
    fn id_requires_fiction_url() -> Result<(), Box<dyn Error>> {
        let config = GetterConfig::new(RetryClient::new()?, GetterOptions::default());
        let g = RoyalRoadGetter::new(config, base()?);
        let id = g.get_id(&Url::parse("https://www.royalroad.com/fiction/21220/mother-of-learning")?)?;
        assert_eq!(id, "21220");
        assert!(g
            .get_id(&Url::parse("https://www.royalroad.com/fiction/21220/m/chapter/301778/one")?)
            .is_err());
        assert!(g.get_id(&Url::parse("https://www.royalroad.com/profile/1")?).is_err());
        Ok(())
    }
}
