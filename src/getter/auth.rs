//! Source authentication: session state plus the request decorations sources expect.
//!
//! A getter owns one [AuthSession] per run. How an authenticated request looks differs
//! per source, so the session carries a [RequestDecorator] that the getter applies to
//! its own requests: a bearer header for OAuth sources, signed query parameters for
//! device-token sources.

use crate::getter::GetterError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use md5::{Digest as _, Md5};
use rand::Rng;
use reqwest::RequestBuilder;
use sha2::Sha256;
use std::fmt;
use tracing::info;

const ALPHABET_BASE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Anonymous,
    Authenticating,
    Authenticated,
    /// Terminal; the run must abort.
    Failed,
}

/// Decorates outgoing requests with whatever a source needs to recognise the session.
pub trait RequestDecorator: Send + Sync + fmt::Debug {
    fn decorate(&self, request: RequestBuilder) -> RequestBuilder;
}

/// `Authorization: Bearer <token>` on every request.
#[derive(Clone)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(..)")
    }
}

impl RequestDecorator for BearerToken {
    fn decorate(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.0)
    }
}

/// Per-request signature over device id, shared secret and session token.
///
/// Appends `app`, `device_id`, `user_token` and `sign` query parameters.
#[derive(Clone)]
pub struct SignedQuery {
    device_id: String,
    secret: String,
    token: String,
}

impl SignedQuery {
    pub fn new(device_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            secret: secret.into(),
            token: String::new(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Lowercase hex MD5 of `device_id + secret + token`.
    pub fn sign(&self) -> String {
        let digest = Md5::digest(format!("{}{}{}", self.device_id, self.secret, self.token));
        hex_lower(&digest)
    }

    /// The signed parameters as form/query pairs.
    pub fn params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("app", "android".to_string()),
            ("device_id", self.device_id.clone()),
            ("user_token", self.token.clone()),
            ("sign", self.sign()),
        ]
    }
}

impl fmt::Debug for SignedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedQuery")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl RequestDecorator for SignedQuery {
    fn decorate(&self, request: RequestBuilder) -> RequestBuilder {
        request.query(&self.params())
    }
}

/// Authentication state of one getter for one run.
#[derive(Debug)]
pub struct AuthSession {
    state: AuthState,
    decorator: Option<Box<dyn RequestDecorator>>,
}

impl Default for AuthSession {
    fn default() -> Self {
        Self {
            state: AuthState::Anonymous,
            decorator: None,
        }
    }
}

impl AuthSession {
    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    /// Enter `Authenticating`. Only valid from `Anonymous`.
    pub fn begin(&mut self) -> Result<(), GetterError> {
        match self.state {
            AuthState::Anonymous => {
                self.state = AuthState::Authenticating;
                Ok(())
            }
            AuthState::Authenticated => Err(GetterError::auth("already authorized")),
            AuthState::Authenticating => Err(GetterError::auth("authorization already in progress")),
            AuthState::Failed => Err(GetterError::auth("a previous authorization failed")),
        }
    }

    /// Finish a login successfully; `decorator` is applied to every later request.
    pub fn complete(&mut self, decorator: impl RequestDecorator + 'static) {
        self.state = AuthState::Authenticated;
        self.decorator = Some(Box::new(decorator));
        info!("authorized");
    }

    /// Attach a decoration without logging in (anonymous device sessions).
    pub fn set_anonymous(&mut self, decorator: impl RequestDecorator + 'static) {
        self.state = AuthState::Anonymous;
        self.decorator = Some(Box::new(decorator));
    }

    /// Mark the session failed and return the error to propagate.
    pub fn fail(&mut self, message: impl Into<String>) -> GetterError {
        self.state = AuthState::Failed;
        self.decorator = None;
        GetterError::auth(message)
    }

    pub fn decorate(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.decorator {
            Some(d) => d.decorate(request),
            None => request,
        }
    }
}

/// Random string over `[A-Za-z0-9]` from the thread-local CSPRNG.
pub fn random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET_BASE[rng.gen_range(0..ALPHABET_BASE.len())] as char)
        .collect()
}

/// PKCE S256 code challenge: unpadded URL-safe base64 of SHA-256(verifier).
pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
