//! Image localization. Each distinct image URL is downloaded at most once per run and
//! every chapter that references it shares the same payload.

use crate::getter::RetryClient;
use crate::model::Image;
use crate::text;
use futures_util::future::join_all;
use scraper::{Node, Selector};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use url::Url;

type Slot = Arc<OnceCell<Option<Image>>>;

/// Per-run image cache keyed by source URL. Clones share the cache.
#[derive(Debug, Clone, Default)]
pub struct ImageStore {
    slots: Arc<Mutex<HashMap<Url, Slot>>>,
}

impl ImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Download `url` once; later calls (also concurrent ones) get the same result.
    /// A failed download is logged and remembered as `None`.
    pub async fn fetch(&self, client: &RetryClient, url: Url) -> Option<Image> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.entry(url.clone()).or_default().clone()
        };
        slot.get_or_init(|| download(client, url)).await.clone()
    }

    /// Number of distinct URLs requested so far.
    pub fn len(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn download(client: &RetryClient, url: Url) -> Option<Image> {
    debug!(url = %url, "downloading image");
    match client.bytes(client.get(url.clone()), "image").await {
        Ok(bytes) if !bytes.is_empty() => Some(Image {
            name: image_file_name(&url),
            content: Arc::from(bytes),
            url,
        }),
        Ok(_) => {
            warn!(url = %url, "image is empty, skipped");
            None
        }
        Err(e) => {
            warn!(url = %url, error = %e, "image could not be downloaded, skipped");
            None
        }
    }
}

/// Local file name for an image: a short hash of the full URL plus the sanitized last
/// path segment. Same URL, same name; different URLs with the same segment stay apart.
pub fn image_file_name(url: &Url) -> String {
    let hash = Sha256::digest(url.as_str().as_bytes());
    let prefix: String = hash[..4].iter().map(|b| format!("{b:02x}")).collect();
    let segment = url
        .path_segments()
        .and_then(|mut s| s.next_back())
        .map(text::remove_invalid_chars)
        .unwrap_or_default();
    match segment.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => format!("{prefix}_{segment}"),
        _ if segment.is_empty() => format!("{prefix}.jpg"),
        _ => format!("{prefix}_{segment}.jpg"),
    }
}

/// Sanitize a raw fragment, download every `<img src>` and point the tags at the local
/// copies.
///
/// Relative sources resolve against `image_host`. Returns the rewritten markup and the
/// images in first-reference order, without duplicates.
pub async fn localize(
    raw: &str,
    image_host: &Url,
    client: &RetryClient,
    store: &ImageStore,
) -> (String, Vec<Image>) {
    let (markup, sources) = sanitize_and_collect(raw, image_host);
    if sources.is_empty() {
        return (markup, Vec::new());
    }

    let fetched = join_all(
        sources
            .iter()
            .map(|(_, url)| store.fetch(client, url.clone())),
    )
    .await;

    let mut local: HashMap<String, String> = HashMap::new();
    let mut images: Vec<Image> = Vec::new();
    for ((src, _), image) in sources.into_iter().zip(fetched) {
        let Some(image) = image else {
            continue;
        };
        local.insert(src, image.path());
        if !images.iter().any(|i| i.url == image.url) {
            images.push(image);
        }
    }
    if local.is_empty() {
        return (markup, images);
    }
    (rewrite_sources(&markup, &local), images)
}

/// Sanitized markup plus the distinct image sources (as written, and resolved).
/// The parsed tree stays inside this function; it is not `Send`.
fn sanitize_and_collect(raw: &str, image_host: &Url) -> (String, Vec<(String, Url)>) {
    let doc = text::parse_fragment(raw);
    let markup = text::fragment_markup(&doc);
    let Ok(img_sel) = Selector::parse("img[src]") else {
        return (markup, Vec::new());
    };

    let mut sources: Vec<(String, Url)> = Vec::new();
    for img in doc.select(&img_sel) {
        let Some(src) = img.value().attr("src") else {
            continue;
        };
        if sources.iter().any(|(s, _)| s == src) {
            continue;
        }
        match image_host.join(src.trim()) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {
                sources.push((src.to_string(), url));
            }
            Ok(_) => {}
            Err(e) => warn!(src, error = %e, "image source is not a valid URL, left as is"),
        }
    }
    (markup, sources)
}

/// Point the `src` of every `<img>` found in `local` at its local path. Only element
/// attributes change; text that happens to look like an attribute is left alone.
fn rewrite_sources(markup: &str, local: &HashMap<String, String>) -> String {
    let mut doc = text::parse_fragment(markup);
    let Ok(img_sel) = Selector::parse("img[src]") else {
        return markup.to_string();
    };
    let ids: Vec<_> = doc.select(&img_sel).map(|el| el.id()).collect();
    for id in ids {
        let Some(mut node) = doc.tree.get_mut(id) else {
            continue;
        };
        let Node::Element(el) = node.value() else {
            continue;
        };
        for (name, value) in el.attrs.iter_mut() {
            if &*name.local != "src" {
                continue;
            }
            if let Some(path) = local.get(&**value) {
                *value = path.clone().into();
            }
        }
    }
    text::fragment_markup(&doc)
}
