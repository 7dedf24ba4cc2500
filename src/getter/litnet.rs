//! Litnet adapter. JSON API with device-token auth and signed query parameters; chapter
//! texts arrive AES-encrypted (inline) or AES-encrypted and gzipped (binary fallback).

use crate::getter::auth::{AuthSession, SignedQuery};
use crate::getter::decode::{AesFragments, ChapterDecoder};
use crate::getter::{parse_json, path_segments, Getter, GetterConfig, GetterError};
use crate::model::{Author, Book, Chapter, Seria};
use crate::text;
use async_trait::async_trait;
use reqwest::StatusCode;
use scraper::{Html, Selector};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};
use url::Url;

const SECRET: &str = "14a6579a984b3c6abecda6c2dfa83a64";
const SAPI_BASE: &str = "https://sapi.litnet.com/";

/// Base URLs the adapter talks to. Derived from the book URL in production,
/// pointed at a mock server in tests.
#[derive(Debug, Clone)]
pub struct LitnetHosts {
    /// Public site (book pages, author pages).
    pub site: Url,
    /// JSON API.
    pub api: Url,
    /// Binary chapter endpoint.
    pub sapi: Url,
}

impl LitnetHosts {
    pub fn for_site(url: &Url) -> Result<Self, GetterError> {
        let host = url.host_str().ok_or_else(|| GetterError::InvalidUrl {
            input: url.to_string(),
            reason: "URL has no host".to_string(),
        })?;
        let host = host.trim_start_matches("www.");
        let parse = |s: String| {
            Url::parse(&s).map_err(|e| GetterError::InvalidUrl {
                input: s.clone(),
                reason: e.to_string(),
            })
        };
        Ok(Self {
            site: parse(format!("https://{host}/"))?,
            api: parse(format!("https://api.{host}/"))?,
            sapi: parse(SAPI_BASE.to_string())?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BookResponse {
    title: String,
    url: Option<String>,
    author_name: Option<String>,
    author_id: Option<u64>,
    annotation: Option<String>,
    cover: Option<String>,
    lang: Option<String>,
    #[serde(default)]
    adult_only: bool,
    cycle_priority: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ContentsEntry {
    id: u64,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChapterText {
    id: u64,
    text: Option<String>,
}

pub struct LitnetGetter {
    config: GetterConfig,
    hosts: LitnetHosts,
    session: AuthSession,
    signer: SignedQuery,
    inline: AesFragments,
    binary: AesFragments,
}

impl LitnetGetter {
    pub fn new(config: GetterConfig, hosts: LitnetHosts) -> Self {
        let device_id = uuid::Uuid::new_v4().to_string().to_uppercase();
        Self {
            config,
            hosts,
            session: AuthSession::default(),
            signer: SignedQuery::new(device_id, SECRET),
            inline: AesFragments::text(SECRET),
            binary: AesFragments::binary_gzip(SECRET),
        }
    }

    pub fn create(url: &Url, config: GetterConfig) -> Result<Box<dyn Getter>, GetterError> {
        Ok(Box::new(Self::new(config, LitnetHosts::for_site(url)?)))
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    fn api_url(&self, path: &str) -> Result<Url, GetterError> {
        self.hosts
            .api
            .join(path)
            .map_err(|e| GetterError::parse("API URL", e.to_string()))
    }

    async fn fetch_book(&self, id: &str) -> Result<BookResponse, GetterError> {
        let url = self.api_url(&format!("v1/book/get/{id}"))?;
        let request = self.session.decorate(self.config.client.get(url));
        let book: BookResponse = self.config.client.json(request, "book details").await?;
        if book.adult_only && !self.config.has_credentials() {
            return Err(GetterError::auth(
                "the book is 18+; set a login and password to download it",
            ));
        }
        Ok(book)
    }

    /// Chapter list; a missing list (HTTP 404) means the book has no chapters.
    async fn fetch_contents(&self, id: &str) -> Result<Vec<ContentsEntry>, GetterError> {
        let url = self.api_url("v1/book/contents")?;
        let request = self
            .session
            .decorate(self.config.client.get(url).query(&[("bookId", id)]));
        let response = self.config.client.send(request).await?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                info!(book = id, "book has no contents");
                Ok(Vec::new())
            }
            status if status.is_success() => parse_json(response).await,
            status => Err(GetterError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
                context: "table of contents".to_string(),
            }),
        }
    }

    async fn fetch_texts(&self, contents: &[ContentsEntry]) -> Result<HashMap<u64, String>, GetterError> {
        if contents.is_empty() {
            return Ok(HashMap::new());
        }
        let url = self.api_url("v1/book/get-chapters-texts/")?;
        let ids: Vec<(&str, u64)> = contents.iter().map(|c| ("chapter_ids[]", c.id)).collect();
        let request = self.session.decorate(self.config.client.get(url).query(&ids));
        let texts: Vec<ChapterText> = self.config.client.json(request, "chapter texts").await?;
        Ok(texts
            .into_iter()
            .filter_map(|t| t.text.filter(|s| !s.trim().is_empty()).map(|s| (t.id, s)))
            .collect())
    }

    /// Chapters whose text is not inline come from the binary endpoint.
    async fn fetch_binary(&self, chapter_id: u64) -> Result<String, GetterError> {
        let url = self
            .hosts
            .sapi
            .join("v1/text/get-chapter")
            .map_err(|e| GetterError::parse("chapter URL", e.to_string()))?;
        let mut form = self.signer.params();
        form.push(("version", "1.0".to_string()));
        let request = self
            .config
            .client
            .post(url)
            .query(&[("chapter_id", chapter_id)])
            .form(&form)
            .timeout(self.config.options.chapter_timeout);
        let payload = self.config.client.bytes(request, "chapter text").await?;
        Ok(self.binary.decode(&payload)?)
    }

    async fn fetch_chapter(
        &self,
        title: String,
        chapter_id: u64,
        inline: Option<String>,
    ) -> Result<Chapter, GetterError> {
        debug!(chapter_id, title = %title, "loading chapter");
        let markup = match inline {
            Some(encoded) => self.inline.decode(encoded.as_bytes())?,
            None => self.fetch_binary(chapter_id).await?,
        };
        Ok(self
            .config
            .chapter_from_markup(title, &markup, &self.hosts.site)
            .await)
    }

    async fn fetch_seria(&self, book_url: &Url, cycle_priority: Option<i64>) -> Option<Seria> {
        let page = self.config.client.get(book_url.clone());
        match self.config.client.text(page, "book page").await {
            Ok(html) => parse_seria(&html, book_url, cycle_priority),
            Err(e) => {
                warn!(url = %book_url, error = %e, "series lookup failed");
                None
            }
        }
    }

    fn author(&self, book: &BookResponse) -> Author {
        let name = book
            .author_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or_else(|| self.hosts.site.host_str())
            .unwrap_or_default();
        let url = book
            .author_id
            .and_then(|id| self.hosts.site.join(&format!("/ru/{id}")).ok());
        Author::new(name, url)
    }
}

#[async_trait]
impl Getter for LitnetGetter {
    fn name(&self) -> &'static str {
        "litnet"
    }

    /// Log in with credentials, otherwise register an anonymous device session.
    #[instrument(skip(self), fields(source = "litnet"))]
    async fn authorize(&mut self) -> Result<(), GetterError> {
        let credentials = self
            .config
            .credentials()
            .map(|(l, p)| (l.trim_start_matches('+').to_string(), p.to_string()));
        let path = if credentials.is_some() {
            self.session.begin()?;
            "v1/user/find-by-login"
        } else {
            "v1/registration/registration-by-device"
        };
        let url = self.api_url(path)?;
        let (login, password) = credentials.clone().unwrap_or_default();
        let request = self.config.client.get(url).query(&[
            ("login", login),
            ("password", password),
            ("app", "android".to_string()),
            ("device_id", self.signer.device_id().to_string()),
            ("sign", self.signer.sign()),
        ]);

        let response = match self.config.client.send(request).await {
            Ok(r) => r,
            Err(e) => return Err(self.session.fail(e.to_string())),
        };
        let data: AuthResponse = match parse_json(response).await {
            Ok(d) => d,
            Err(e) => return Err(self.session.fail(e.to_string())),
        };
        let Some(token) = data.token.filter(|t| !t.trim().is_empty()) else {
            let reason = data.error.unwrap_or_else(|| "no token in response".to_string());
            return Err(self.session.fail(reason));
        };

        self.signer = self.signer.clone().with_token(token);
        if credentials.is_some() {
            self.session.complete(self.signer.clone());
        } else {
            debug!("anonymous device session registered");
            self.session.set_anonymous(self.signer.clone());
        }
        Ok(())
    }

    /// `.../book/some-title-b12345` -> `12345`.
    fn get_id(&self, url: &Url) -> Result<String, GetterError> {
        let id = path_segments(url)
            .last()
            .and_then(|s| s.rsplit('-').next())
            .map(|s| s.replace('b', ""))
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GetterError::InvalidUrl {
                input: url.to_string(),
                reason: "expected a book URL ending in -b<id>".to_string(),
            })?;
        Ok(id)
    }

    #[instrument(skip(self, url), fields(source = "litnet", url = %url))]
    async fn get(&self, url: &Url) -> Result<Book, GetterError> {
        let id = self.get_id(url)?;
        let details = self.fetch_book(&id).await?;

        let book_url = details
            .url
            .as_deref()
            .and_then(|u| Url::parse(u).ok())
            .and_then(|u| self.hosts.site.join(u.path()).ok())
            .unwrap_or_else(|| url.clone());

        let mut book = Book::new(book_url.clone(), self.author(&details));
        book.title = details.title.trim().to_string();
        book.lang = details.lang.clone().filter(|l| !l.is_empty());
        book.annotation = details
            .annotation
            .as_deref()
            .map(text::paragraphs)
            .filter(|a| !a.is_empty());
        if let Some(cover) = details.cover.as_deref().filter(|c| !c.trim().is_empty()) {
            match self.hosts.site.join(cover.trim()) {
                Ok(cover_url) => book.cover = self.config.save_image(cover_url).await,
                Err(e) => warn!(cover, error = %e, "cover URL is invalid"),
            }
        }
        book.seria = self.fetch_seria(&book_url, details.cycle_priority).await;

        let contents = self.config.slice_toc(self.fetch_contents(&id).await?);
        let mut texts = self.fetch_texts(&contents).await?;
        let toc: Vec<(String, (u64, Option<String>))> = contents
            .into_iter()
            .map(|c| {
                let title = c
                    .title
                    .as_deref()
                    .map(text::replace_newline)
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| book.title.clone());
                (title, (c.id, texts.remove(&c.id)))
            })
            .collect();
        info!(title = %book.title, chapters = toc.len(), "fetching chapters");

        book.chapters = self
            .config
            .fill_chapters(toc, |_, title, (chapter_id, inline)| {
                self.fetch_chapter(title, chapter_id, inline)
            })
            .await?;
        Ok(book)
    }
}

/// Series link on the public book page, if any.
fn parse_seria(html: &str, book_url: &Url, cycle_priority: Option<i64>) -> Option<Seria> {
    let doc = Html::parse_document(html);
    let sel = Selector::parse("div.book-view-info-coll a[href*='sort=cycles']").ok()?;
    let link = doc.select(&sel).next()?;
    let name = text::replace_newline(&link.text().collect::<String>());
    if name.is_empty() {
        return None;
    }
    Some(Seria {
        name,
        url: link.value().attr("href").and_then(|h| book_url.join(h).ok()),
        number: cycle_priority
            .filter(|p| *p > 0)
            .map(|p| p.to_string())
            .unwrap_or_default(),
    })
}
