//! Normalized book model.
//!
//! Every getter produces this shape; every builder consumes it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

/// One book from one source. Identity is the source URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    pub url: Url,
    pub title: String,
    pub author: Author,
    #[serde(default)]
    pub co_authors: Vec<Author>,
    pub cover: Option<Image>,
    /// Sanitized markup.
    pub annotation: Option<String>,
    pub seria: Option<Seria>,
    /// Source TOC order.
    pub chapters: Vec<Chapter>,
    pub lang: Option<String>,
}

impl Book {
    /// Empty book for `url`, filled in field by field by a getter.
    pub fn new(url: Url, author: Author) -> Self {
        Self {
            url,
            title: String::new(),
            author,
            co_authors: Vec::new(),
            cover: None,
            annotation: None,
            seria: None,
            chapters: Vec::new(),
            lang: None,
        }
    }

    pub fn valid_chapters(&self) -> impl Iterator<Item = &Chapter> {
        self.chapters.iter().filter(|c| c.is_valid())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub url: Option<Url>,
}

impl Author {
    pub fn new(name: impl Into<String>, url: Option<Url>) -> Self {
        Self {
            name: name.into(),
            url,
        }
    }
}

/// Series membership. `number` is empty when the source gives no ordinal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seria {
    pub name: String,
    pub url: Option<Url>,
    #[serde(default)]
    pub number: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    /// Sanitized fragment; image `src` attributes point at [`Image::path`].
    pub content: String,
    #[serde(default)]
    pub images: Vec<Image>,
}

impl Chapter {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// A chapter is kept by builders only when it has content.
    pub fn is_valid(&self) -> bool {
        !self.content.trim().is_empty()
    }
}

/// Downloaded image. Clones share the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub url: Url,
    /// Local file name, derived from `url` only.
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub content: Arc<[u8]>,
}

impl Image {
    /// Path of the image relative to the chapter documents that embed it.
    pub fn path(&self) -> String {
        format!("images/{}", self.name)
    }

    pub fn media_type(&self) -> &'static str {
        let ext = self
            .name
            .rsplit_once('.')
            .map(|(_, e)| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "webp" => "image/webp",
            "svg" => "image/svg+xml",
            _ => "image/png",
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S: Serializer>(bytes: &Arc<[u8]>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Arc<[u8]>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD
            .decode(s.as_bytes())
            .map(Arc::from)
            .map_err(serde::de::Error::custom)
    }
}
