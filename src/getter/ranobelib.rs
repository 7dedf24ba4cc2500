//! RanobeLib adapter. JSON API; optional OAuth 2 login (authorization code with PKCE)
//! against the shared auth host, after which every request carries a bearer token.

use crate::getter::auth::{pkce_challenge, random_string, AuthSession, BearerToken};
use crate::getter::{path_segments, Getter, GetterConfig, GetterError};
use crate::model::{Author, Book, Chapter};
use crate::text;
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::{Deserialize, Deserializer};
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use url::Url;

const CLIENT_ID: u32 = 1;
const VERIFIER_LEN: usize = 128;
const STATE_LEN: usize = 40;
const FALLBACK_AUTHOR: &str = "Ranobelib";
const DETAIL_FIELDS: [&str; 5] = ["background", "teams", "authors", "chap_count", "summary"];

/// Base URLs of the site, its API, the OAuth host and the image CDN.
#[derive(Debug, Clone)]
pub struct RanobeLibHosts {
    pub site: Url,
    pub api: Url,
    pub auth: Url,
    pub images: Url,
}

impl RanobeLibHosts {
    pub fn production() -> Result<Self, GetterError> {
        let parse = |s: &str| {
            Url::parse(s).map_err(|e| GetterError::InvalidUrl {
                input: s.to_string(),
                reason: e.to_string(),
            })
        };
        Ok(Self {
            site: parse("https://ranobelib.me/")?,
            api: parse("https://api.lib.social/")?,
            auth: parse("https://auth.lib.social/")?,
            images: parse("https://cover.imgslib.link/")?,
        })
    }

    /// All four roles served from one base URL.
    pub fn single(base: &Url) -> Self {
        Self {
            site: base.clone(),
            api: base.clone(),
            auth: base.clone(),
            images: base.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct Details {
    name: String,
    slug_url: String,
    cover: Option<Cover>,
    #[serde(default)]
    authors: Vec<Person>,
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Cover {
    default: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Person {
    name: String,
    slug_url: String,
}

#[derive(Debug, Deserialize)]
struct TocEntry {
    #[serde(deserialize_with = "string_or_number")]
    number: String,
    #[serde(deserialize_with = "string_or_number")]
    volume: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChapterBody {
    content: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

/// What the login POST returned.
#[derive(Debug, PartialEq)]
enum LoginPage {
    Rejected(String),
    Consent {
        action: String,
        fields: Vec<(String, String)>,
    },
}

pub struct RanobeLibGetter {
    config: GetterConfig,
    hosts: RanobeLibHosts,
    session: AuthSession,
}

impl RanobeLibGetter {
    pub fn new(config: GetterConfig, hosts: RanobeLibHosts) -> Self {
        Self {
            config,
            hosts,
            session: AuthSession::default(),
        }
    }

    pub fn create(_url: &Url, config: GetterConfig) -> Result<Box<dyn Getter>, GetterError> {
        Ok(Box::new(Self::new(config, RanobeLibHosts::production()?)))
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    fn join(base: &Url, path: &str) -> Result<Url, GetterError> {
        base.join(path)
            .map_err(|e| GetterError::parse("URL", format!("{path}: {e}")))
    }

    /// Authorization-code flow. Returns the access token.
    async fn login(&self, login: &str, password: &str) -> Result<String, GetterError> {
        let client = &self.config.client;
        let verifier = random_string(VERIFIER_LEN);
        let state = random_string(STATE_LEN);
        let redirect_uri = Self::join(&self.hosts.site, "/auth/oauth/callback")?;

        let authorize = Self::join(&self.hosts.auth, "/auth/oauth/authorize")?;
        client
            .send(client.get(authorize).query(&[
                ("client_id", CLIENT_ID.to_string()),
                ("code_challenge", pkce_challenge(&verifier)),
                ("code_challenge_method", "S256".to_string()),
                ("prompt", "consent".to_string()),
                ("redirect_uri", redirect_uri.to_string()),
                ("response_type", "code".to_string()),
                ("scope", String::new()),
                ("state", state),
            ]))
            .await?;

        let form_url = Self::join(&self.hosts.auth, "/auth/login-form")?;
        let form = client.text(client.get(form_url), "login form").await?;
        let csrf = login_token(&form)
            .ok_or_else(|| GetterError::auth("login form has no _token field"))?;

        let login_url = Self::join(&self.hosts.auth, "/auth/login")?;
        let response = client
            .send(client.post(login_url).form(&[
                ("_token", csrf.as_str()),
                ("login", login),
                ("password", password),
            ]))
            .await?;
        let page_url = response.url().to_string();
        let page = response
            .text()
            .await
            .map_err(|source| GetterError::BodyRead { url: page_url, source })?;

        let (action, fields) = match parse_login_page(&page)? {
            LoginPage::Rejected(reason) => return Err(GetterError::auth(reason)),
            LoginPage::Consent { action, fields } => (action, fields),
        };

        let consent_url = Self::join(&self.hosts.auth, &action)?;
        let approved = client.send(client.post(consent_url).form(&fields)).await?;
        let code = approved
            .url()
            .query_pairs()
            .find(|(k, _)| k == "code")
            .map(|(_, v)| v.into_owned())
            .ok_or_else(|| GetterError::auth("authorization code missing from redirect"))?;
        debug!("authorization code received");

        let token_url = Self::join(&self.hosts.api, "/api/auth/oauth/token")?;
        let token: TokenResponse = client
            .json(
                client.post(token_url).json(&json!({
                    "grant_type": "authorization_code",
                    "client_id": CLIENT_ID,
                    "redirect_uri": redirect_uri.as_str(),
                    "code_verifier": verifier,
                    "code": code,
                })),
                "access token",
            )
            .await?;
        token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GetterError::auth("token endpoint returned no access token"))
    }

    async fn fetch_details(&self, id: &str) -> Result<Details, GetterError> {
        let url = Self::join(&self.hosts.api, &format!("/api/manga/{id}"))?;
        let fields: Vec<(&str, &str)> = DETAIL_FIELDS.iter().map(|f| ("fields[]", *f)).collect();
        let request = self.session.decorate(self.config.client.get(url).query(&fields));
        let details: Envelope<Details> = self.config.client.json(request, "book details").await?;
        Ok(details.data)
    }

    async fn fetch_toc(&self, slug: &str) -> Result<Vec<TocEntry>, GetterError> {
        let url = Self::join(&self.hosts.api, &format!("/api/manga/{slug}/chapters"))?;
        let request = self.session.decorate(self.config.client.get(url));
        let toc: Envelope<Vec<TocEntry>> =
            self.config.client.json(request, "table of contents").await?;
        Ok(toc.data)
    }

    async fn fetch_chapter(&self, slug: &str, title: String, entry: TocEntry) -> Result<Chapter, GetterError> {
        debug!(title = %title, number = %entry.number, volume = %entry.volume, "loading chapter");
        let url = Self::join(&self.hosts.api, &format!("/api/manga/{slug}/chapter"))?;
        let request = self
            .session
            .decorate(self.config.client.get(url).query(&[
                ("number", entry.number.as_str()),
                ("volume", entry.volume.as_str()),
            ]))
            .timeout(self.config.options.chapter_timeout);
        let body: Envelope<ChapterBody> = self.config.client.json(request, "chapter").await?;
        let markup = match body.data.content {
            serde_json::Value::String(s) => s,
            serde_json::Value::Null => String::new(),
            _ => {
                return Err(GetterError::parse(
                    "chapter",
                    "content is a structured document, not markup",
                ))
            }
        };
        Ok(self
            .config
            .chapter_from_markup(title, &markup, &self.hosts.images)
            .await)
    }

    fn person(&self, p: &Person) -> Author {
        let url = self.hosts.site.join(&format!("/ru/people/{}", p.slug_url)).ok();
        Author::new(p.name.trim(), url)
    }
}

#[async_trait]
impl Getter for RanobeLibGetter {
    fn name(&self) -> &'static str {
        "ranobelib"
    }

    /// Without credentials the session stays anonymous.
    #[instrument(skip(self), fields(source = "ranobelib"))]
    async fn authorize(&mut self) -> Result<(), GetterError> {
        let Some((login, password)) = self
            .config
            .credentials()
            .map(|(l, p)| (l.to_string(), p.to_string()))
        else {
            return Ok(());
        };
        self.session.begin()?;
        match self.login(&login, &password).await {
            Ok(token) => {
                self.session.complete(BearerToken::new(token));
                Ok(())
            }
            Err(e) => Err(self.session.fail(e.to_string())),
        }
    }

    /// `/ru/book/<id>` or `/ru/<id>` -> `<id>`.
    fn get_id(&self, url: &Url) -> Result<String, GetterError> {
        let segments = path_segments(url);
        let id = match segments.get(1) {
            Some(&"book") | Some(&"read") => segments.get(2),
            other => other,
        };
        id.map(|s| s.to_string()).ok_or_else(|| GetterError::InvalidUrl {
            input: url.to_string(),
            reason: "expected a book URL like /ru/book/<id>".to_string(),
        })
    }

    #[instrument(skip(self, url), fields(source = "ranobelib", url = %url))]
    async fn get(&self, url: &Url) -> Result<Book, GetterError> {
        let id = self.get_id(url)?;
        let details = self.fetch_details(&id).await?;

        let author = details
            .authors
            .first()
            .map(|p| self.person(p))
            .unwrap_or_else(|| Author::new(FALLBACK_AUTHOR, None));
        let mut book = Book::new(url.clone(), author);
        book.title = details.name.trim().to_string();
        book.co_authors = details.authors.iter().skip(1).map(|p| self.person(p)).collect();
        book.annotation = details
            .summary
            .as_deref()
            .map(text::paragraphs)
            .filter(|a| !a.is_empty());

        let cover = details.cover.as_ref().and_then(|c| c.default.as_deref());
        if let Some(cover) = cover.filter(|c| !c.trim().is_empty()) {
            match self.hosts.images.join(cover.trim()) {
                Ok(cover_url) => book.cover = self.config.save_image(cover_url).await,
                Err(e) => warn!(cover, error = %e, "cover URL is invalid"),
            }
        }

        let toc = self.config.slice_toc(self.fetch_toc(&details.slug_url).await?);
        let toc: Vec<(String, TocEntry)> = toc
            .into_iter()
            .map(|entry| {
                let name = entry.name.as_deref().map(text::replace_newline).unwrap_or_default();
                let title = if name.is_empty() {
                    format!("Volume {} Chapter {}", entry.volume, entry.number)
                } else {
                    name
                };
                (title, entry)
            })
            .collect();
        info!(title = %book.title, chapters = toc.len(), "fetching chapters");

        let slug = details.slug_url.as_str();
        book.chapters = self
            .config
            .fill_chapters(toc, |_, title, entry| self.fetch_chapter(slug, title, entry))
            .await?;
        Ok(book)
    }
}

fn login_token(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let sel = Selector::parse("input[name=_token]").ok()?;
    doc.select(&sel)
        .next()
        .and_then(|el| el.value().attr("value"))
        .map(String::from)
}

/// A login error message, or the consent form to submit next.
fn parse_login_page(html: &str) -> Result<LoginPage, GetterError> {
    let doc = Html::parse_document(html);
    let selector = |s: &str| {
        Selector::parse(s).map_err(|e| GetterError::parse("login page", format!("{s}: {e}")))
    };

    let error_sel = selector(".form-field__error")?;
    if let Some(err) = doc.select(&error_sel).next() {
        let message = text::replace_newline(&err.text().collect::<String>());
        if !message.is_empty() {
            return Ok(LoginPage::Rejected(message));
        }
    }

    let form_sel = selector("form[method=post]")?;
    let hidden_sel = selector("input[type=hidden]")?;
    let form = doc
        .select(&form_sel)
        .next()
        .ok_or_else(|| GetterError::auth("login response has no consent form"))?;
    let action = form
        .value()
        .attr("action")
        .ok_or_else(|| GetterError::auth("consent form has no action"))?
        .to_string();
    let fields = form
        .select(&hidden_sel)
        .filter_map(|input| {
            let name = input.value().attr("name")?;
            Some((name.to_string(), input.value().attr("value").unwrap_or_default().to_string()))
        })
        .collect();
    Ok(LoginPage::Consent { action, fields })
}
