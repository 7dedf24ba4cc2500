mod common;

use common::{base, config, credentials, TestResult};
use ficfetch::builder::{populate, OutputFormat};
use ficfetch::getter::auth::AuthState;
use ficfetch::getter::ranobelib::{RanobeLibGetter, RanobeLibHosts};
use ficfetch::getter::{Getter, GetterError, GetterOptions};
use serde_json::json;
use std::fs::File;
use std::io::Read;
use url::Url;
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BOOK_URL: &str = "https://ranobelib.me/ru/book/42--story";

async fn mount_book(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/manga/42--story"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "name": " Story: One ",
                "slug_url": "42--story",
                "cover": { "default": "/covers/c.jpg" },
                "authors": [
                    { "name": "Author A", "slug_url": "author-a" },
                    { "name": "Author B", "slug_url": "author-b" }
                ],
                "summary": "Line one\n\n  Line two  "
            }
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/covers/c.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"cover-bytes".to_vec()))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/manga/42--story/chapters"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "number": 1, "volume": 1, "name": "Start" },
                { "number": "2", "volume": "1", "name": null },
                { "number": 3, "volume": 1, "name": "Empty" }
            ]
        })))
        .mount(server)
        .await;
    let chapter = |number: &str, content: &str| {
        Mock::given(method("GET"))
            .and(path("/api/manga/42--story/chapter"))
            .and(query_param("number", number))
            .and(query_param("volume", "1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "data": { "content": content } })),
            )
    };
    chapter(
        "1",
        r#"<p>One <img src="/img/shared.png"></p><p>Type src="/img/shared.png" here.</p><script>x()</script>"#,
    )
    .mount(server)
    .await;
    chapter("2", r#"<p>Two <img src="/img/shared.png"></p>"#)
        .mount(server)
        .await;
    chapter("3", "").mount(server).await;
    Mock::given(method("GET"))
        .and(path("/img/shared.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"png-bytes".to_vec()))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn anonymous_book_is_fetched_and_built() -> TestResult {
    let server = MockServer::start().await;
    mount_book(&server).await;

    let mut getter = RanobeLibGetter::new(
        config(GetterOptions::default())?,
        RanobeLibHosts::single(&base(&server)?),
    );
    getter.authorize().await?;
    assert_eq!(getter.session().state(), AuthState::Anonymous);

    let book = getter.get(&Url::parse(BOOK_URL)?).await?;
    assert_eq!(book.title, "Story: One");
    assert_eq!(book.author.name, "Author A");
    assert_eq!(book.co_authors.len(), 1);
    assert_eq!(book.annotation.as_deref(), Some("<p>Line one</p><p>Line two</p>"));
    assert!(book.cover.is_some());

    let titles: Vec<_> = book.chapters.iter().map(|c| c.title.as_str()).collect();
    assert_eq!(titles, vec!["Start", "Volume 1 Chapter 2", "Empty"]);
    assert_eq!(book.valid_chapters().count(), 2);
    assert!(!book.chapters[0].content.contains("script"));
    assert_eq!(book.chapters[0].images[0].name, book.chapters[1].images[0].name);
    let local = book.chapters[0].images[0].path();
    assert!(book.chapters[0].content.contains(&format!("<img src=\"{local}\">")));
    assert!(book.chapters[0]
        .content
        .contains(r#"<p>Type src="/img/shared.png" here.</p>"#));

    let dir = tempfile::tempdir()?;
    for format in [OutputFormat::Json, OutputFormat::Epub] {
        let mut builder = format.create_builder();
        populate(&mut *builder, &book);
        builder.build(dir.path(), &book.title)?;
    }
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("Story One.json"))?)?;
    assert_eq!(json["chapters"].as_array().map(Vec::len), Some(2));

    let mut zip = zip::ZipArchive::new(File::open(dir.path().join("Story One.epub"))?)?;
    let names: Vec<String> = zip.file_names().map(String::from).collect();
    assert_eq!(names.iter().filter(|n| n.contains("chapter-")).count(), 2);
    assert_eq!(names.iter().filter(|n| n.ends_with("shared.png")).count(), 1);
    let mut opf = String::new();
    zip.by_name("OEBPS/content.opf")?.read_to_string(&mut opf)?;
    assert!(opf.contains("<dc:creator id=\"creator-2\">Author B</dc:creator>"));
    Ok(())
}

#[tokio::test]
async fn chapter_range_limits_requests() -> TestResult {
    let server = MockServer::start().await;
    mount_book(&server).await;
    let options = GetterOptions {
        range: ficfetch::getter::ChapterRange::from_numbers(2, 2),
        ..GetterOptions::default()
    };
    let getter = RanobeLibGetter::new(config(options)?, RanobeLibHosts::single(&base(&server)?));
    let book = getter.get(&Url::parse(BOOK_URL)?).await?;
    assert_eq!(book.chapters.len(), 1);
    assert_eq!(book.chapters[0].title, "Volume 1 Chapter 2");

    let requests = server.received_requests().await.unwrap_or_default();
    let chapter_calls = requests
        .iter()
        .filter(|r| r.url.path() == "/api/manga/42--story/chapter")
        .count();
    assert_eq!(chapter_calls, 1);
    Ok(())
}

#[tokio::test]
async fn login_flow_attaches_bearer_token() -> TestResult {
    let server = MockServer::start().await;
    let uri = server.uri();

    Mock::given(method("GET"))
        .and(path("/auth/oauth/authorize"))
        .and(query_param("code_challenge_method", "S256"))
        .and(query_param("client_id", "1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/auth/login-form"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<form method="post" action="/auth/login"><input name="_token" value="csrf123"></form>"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_string_contains("_token=csrf123"))
        .and(body_string_contains("login=reader"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><body><form method="post" action="/auth/oauth/approve">
                <input type="hidden" name="state" value="s1">
                <input type="hidden" name="approve" value="1">
                <button>Allow</button>
            </form></body></html>"#,
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/oauth/approve"))
        .and(body_string_contains("approve=1"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", format!("{uri}/auth/oauth/callback?code=abc").as_str()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/auth/oauth/callback"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/oauth/token"))
        .and(body_partial_json(json!({ "code": "abc", "grant_type": "authorization_code" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access_token": "tok" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/manga/7"))
        .and(header("authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "name": "Locked", "slug_url": "7--locked", "authors": [] }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/manga/7--locked/chapters"))
        .and(header("authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .mount(&server)
        .await;

    let mut getter = RanobeLibGetter::new(
        config(credentials("reader", "secret"))?,
        RanobeLibHosts::single(&base(&server)?),
    );
    getter.authorize().await?;
    assert!(getter.session().is_authenticated());

    let book = getter.get(&Url::parse("https://ranobelib.me/ru/7")?).await?;
    assert_eq!(book.title, "Locked");
    assert_eq!(book.author.name, "Ranobelib");
    assert!(book.chapters.is_empty());
    Ok(())
}

#[tokio::test]
async fn rejected_login_fails_before_book_requests() -> TestResult {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/oauth/authorize"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/auth/login-form"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"<input name="_token" value="t">"#),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<div class="form-field__error">Wrong password</div>"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/manga/7"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut getter = RanobeLibGetter::new(
        config(credentials("reader", "bad"))?,
        RanobeLibHosts::single(&base(&server)?),
    );
    let err = getter.authorize().await.err().ok_or("expected auth error")?;
    assert!(matches!(&err, GetterError::Auth { message } if message.contains("Wrong password")));
    assert_eq!(getter.session().state(), AuthState::Failed);
    Ok(())
}

#[tokio::test]
async fn flaky_chapter_is_retried_until_it_loads() -> TestResult {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/manga/5--flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "name": "Flaky", "slug_url": "5--flaky", "authors": [] }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/manga/5--flaky/chapters"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "number": 1, "volume": 1, "name": "Only" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/manga/5--flaky/chapter"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/manga/5--flaky/chapter"))
        .and(query_param("number", "1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "data": { "content": "<p>Finally.</p>" } })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let getter = RanobeLibGetter::new(
        config(GetterOptions::default())?,
        RanobeLibHosts::single(&base(&server)?),
    );
    let book = getter.get(&Url::parse("https://ranobelib.me/ru/book/5--flaky")?).await?;
    assert_eq!(book.chapters.len(), 1);
    assert_eq!(book.chapters[0].content, "<p>Finally.</p>");
    Ok(())
}
