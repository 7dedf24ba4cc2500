//! Shared helpers for the mock-server tests.
#![allow(dead_code)]

use ficfetch::getter::{GetterConfig, GetterOptions, RetryClient};
use std::error::Error;
use std::time::Duration;
use url::Url;
use wiremock::MockServer;

pub type TestResult = Result<(), Box<dyn Error>>;

/// Client that retries without waiting.
pub fn client() -> Result<RetryClient, Box<dyn Error>> {
    Ok(RetryClient::builder()
        .timeout(Duration::from_secs(5))
        .retry_count(3)
        .retry_backoff(vec![Duration::ZERO])
        .build()?)
}

pub fn config(options: GetterOptions) -> Result<GetterConfig, Box<dyn Error>> {
    Ok(GetterConfig::new(client()?, options))
}

pub fn credentials(login: &str, password: &str) -> GetterOptions {
    GetterOptions {
        login: Some(login.to_string()),
        password: Some(password.to_string()),
        ..GetterOptions::default()
    }
}

/// Base URL of the mock server, with a trailing slash.
pub fn base(server: &MockServer) -> Result<Url, Box<dyn Error>> {
    Ok(Url::parse(&format!("{}/", server.uri()))?)
}
