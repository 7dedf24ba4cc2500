//! Getter errors. Transport and decode failures are translated here into a skip,
//! a retry or an escalation by the calling getter.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GetterError {
    #[error("Invalid URL: {input}: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("No getter is registered for host '{host}'.")]
    UnsupportedSource { host: String },

    #[error("Authorization failed: {message}")]
    Auth { message: String },

    #[error("Network error: could not reach {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} when fetching {context}: {url}")]
    HttpStatus {
        status: u16,
        url: String,
        context: String,
    },

    #[error("Failed to read response body from {url}: {source}")]
    BodyRead {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Unexpected response from {url}: {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Could not parse {what}: {message}")]
    Parse { what: String, message: String },

    #[error("Could not decode chapter payload: {0}")]
    Decode(#[from] DecodeError),

    #[error("Chapter {index} ({title}) could not be retrieved: {source}")]
    Chapter {
        index: usize,
        title: String,
        #[source]
        source: Box<GetterError>,
    },

    #[error("HTTP client could not be created: {0}")]
    Client(#[source] reqwest::Error),
}

impl GetterError {
    pub fn auth(message: impl Into<String>) -> Self {
        GetterError::Auth {
            message: message.into(),
        }
    }

    pub fn parse(what: impl Into<String>, message: impl Into<String>) -> Self {
        GetterError::Parse {
            what: what.into(),
            message: message.into(),
        }
    }
}

/// Malformed or undecryptable chapter payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload shorter than the {0}-byte IV prefix")]
    TooShort(usize),

    #[error("invalid key or IV length")]
    KeyLength,

    #[error("decryption failed (bad padding)")]
    Padding,

    #[error("gzip stream is corrupt: {0}")]
    Gzip(#[source] std::io::Error),

    #[error("payload is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("payload is not a JSON array of fragments: {0}")]
    Fragments(#[source] serde_json::Error),
}
