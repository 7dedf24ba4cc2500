mod common;

use clap::Parser;
use common::TestResult;
use ficfetch::cli::{run_with, Args};
use ficfetch::getter::ranobelib::{RanobeLibGetter, RanobeLibHosts};
use ficfetch::getter::{Getter, GetterConfig, GetterError, GetterRegistry};
use serde_json::json;
use std::future::{pending, ready};
use std::path::Path;
use std::time::Duration;
use url::Url;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// RanobeLib served entirely by the mock server the book URL points at.
fn local_ranobelib(url: &Url, config: GetterConfig) -> Result<Box<dyn Getter>, GetterError> {
    let origin = url.origin().ascii_serialization();
    let base = Url::parse(&format!("{origin}/")).map_err(|e| GetterError::InvalidUrl {
        input: origin,
        reason: e.to_string(),
    })?;
    Ok(Box::new(RanobeLibGetter::new(config, RanobeLibHosts::single(&base))))
}

fn registry() -> GetterRegistry {
    let mut registry = GetterRegistry::new();
    registry.register("127.0.0.1", local_ranobelib);
    registry
}

async fn mount_book(server: &MockServer, chapter_content: &str) {
    Mock::given(method("GET"))
        .and(path("/api/manga/9--tale"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "name": "Tale/Two",
                "slug_url": "9--tale",
                "authors": [{ "name": "Teller", "slug_url": "teller" }]
            }
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/manga/9--tale/chapters"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "number": 1, "volume": 1, "name": "Only" }]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/manga/9--tale/chapter"))
        .and(query_param("number", "1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "data": { "content": chapter_content } })),
        )
        .mount(server)
        .await;
}

fn args(server: &MockServer, out: &Path, config: &Path) -> Result<Args, clap::Error> {
    Args::try_parse_from([
        "ficfetch".to_string(),
        format!("{}/ru/book/9--tale", server.uri()),
        "-o".to_string(),
        out.display().to_string(),
        "-f".to_string(),
        "json,txt,md".to_string(),
        "--config".to_string(),
        config.display().to_string(),
        "--quiet".to_string(),
    ])
}

#[tokio::test]
async fn every_format_is_written() -> TestResult {
    let server = MockServer::start().await;
    mount_book(&server, "<p>Once upon a time.</p>").await;
    let dir = tempfile::tempdir()?;
    let config = dir.path().join("ficfetch.toml");
    std::fs::write(&config, "retry_backoff_secs = [0]\n")?;
    let out = dir.path().join("books");

    let paths = run_with(&args(&server, &out, &config)?, &registry(), pending()).await?;
    let names: Vec<_> = paths
        .iter()
        .filter_map(|p| p.file_name()?.to_str().map(String::from))
        .collect();
    assert_eq!(names, vec!["TaleTwo.json", "TaleTwo.txt", "TaleTwo.md"]);
    let text = std::fs::read_to_string(out.join("TaleTwo.txt"))?;
    assert!(text.contains("Once upon a time."));

    // Same input, same bytes.
    let before = std::fs::read(out.join("TaleTwo.json"))?;
    run_with(&args(&server, &out, &config)?, &registry(), pending()).await?;
    assert_eq!(before, std::fs::read(out.join("TaleTwo.json"))?);
    Ok(())
}

#[tokio::test]
async fn book_without_content_fails_without_artifacts() -> TestResult {
    let server = MockServer::start().await;
    mount_book(&server, "").await;
    let dir = tempfile::tempdir()?;
    let config = dir.path().join("ficfetch.toml");
    std::fs::write(&config, "")?;
    let out = dir.path().join("books");

    let err = run_with(&args(&server, &out, &config)?, &registry(), pending())
        .await
        .err()
        .ok_or("expected error")?;
    assert_eq!(err.exit_code(), 2);
    assert!(!out.exists());
    Ok(())
}

#[tokio::test]
async fn invalid_config_is_an_input_error() -> TestResult {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir()?;
    let config = dir.path().join("ficfetch.toml");
    std::fs::write(&config, "formats = [")?;

    let err = run_with(&args(&server, dir.path(), &config)?, &registry(), pending())
        .await
        .err()
        .ok_or("expected error")?;
    assert_eq!(err.exit_code(), 1);
    assert!(err.to_string().contains("ficfetch.toml"));
    Ok(())
}

#[tokio::test]
async fn cancelled_fetch_writes_nothing() -> TestResult {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/manga/9--tale"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;
    let dir = tempfile::tempdir()?;
    let config = dir.path().join("ficfetch.toml");
    std::fs::write(&config, "")?;
    let out = dir.path().join("books");

    let err = run_with(&args(&server, &out, &config)?, &registry(), ready(()))
        .await
        .err()
        .ok_or("expected error")?;
    assert_eq!(err.exit_code(), 130);
    assert!(!out.exists());
    Ok(())
}
