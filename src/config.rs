//! Optional config file loading. Search order: ./ficfetch.toml, then
//! $XDG_CONFIG_HOME/ficfetch/config.toml (or the platform config directory).

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const LOCAL_FILE: &str = "ficfetch.toml";

/// Config file contents. All fields optional; command-line flags win over present keys.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case", default, deny_unknown_fields)]
pub struct Config {
    /// Default output directory when -o is not set. Relative to CWD.
    pub output_dir: Option<PathBuf>,
    pub user_agent: Option<String>,
    /// Timeout for book-level requests.
    pub timeout_secs: Option<u64>,
    /// Timeout for a single chapter request.
    pub chapter_timeout_secs: Option<u64>,
    /// HTTP attempts for transient failures (default 3).
    pub retry_count: Option<u32>,
    /// Delay before each retry, e.g. [1, 2, 4].
    pub retry_backoff_secs: Option<Vec<u64>>,
    /// Chapters fetched at once.
    pub concurrency: Option<usize>,
    pub login: Option<String>,
    pub password: Option<String>,
    /// Comma-separated list: epub, json, md, txt.
    pub formats: Option<String>,
    /// skip (default), placeholder, or fail.
    pub missing_chapters: Option<String>,
    /// Directory with *.css and font files packaged into EPUB.
    pub assets_dir: Option<PathBuf>,
}

/// Load the first config file found. Missing files give `Ok(None)`; unreadable or
/// invalid ones are errors.
pub fn load_config() -> anyhow::Result<Option<Config>> {
    let cwd = std::env::current_dir().context("Cannot determine current directory")?;
    let mut paths = vec![cwd.join(LOCAL_FILE)];
    if let Some(d) = dirs::config_dir() {
        paths.push(d.join("ficfetch").join("config.toml"));
    }
    for path in &paths {
        if path.exists() {
            return load_config_file(path).map(Some);
        }
    }
    Ok(None)
}

pub fn load_config_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config {}", path.display()))?;
    let config: Config =
        toml::from_str(&s).with_context(|| format!("Invalid config {}", path.display()))?;
    tracing::debug!(path = %path.display(), "config loaded");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn parse_empty_config() -> Result<(), Box<dyn Error>> {
        let c: Config = toml::from_str("")?;
        assert!(c.output_dir.is_none());
        assert!(c.login.is_none());
        assert!(c.formats.is_none());
        assert!(c.retry_backoff_secs.is_none());
        assert!(c.missing_chapters.is_none());
        Ok(())
    }

    #[test]
    fn parse_full_config() -> Result<(), Box<dyn Error>> {
        let s = r#"
            output_dir = "out"
            user_agent = "Custom/1.0"
            timeout_secs = 60
            chapter_timeout_secs = 15
            retry_count = 5
            retry_backoff_secs = [1, 2, 4, 8]
            concurrency = 2
            login = "reader"
            password = "secret"
            formats = "epub,json"
            missing_chapters = "placeholder"
            assets_dir = "assets"
        "#;
        let c: Config = toml::from_str(s)?;
        assert_eq!(c.output_dir.as_deref(), Some(Path::new("out")));
        assert_eq!(c.user_agent.as_deref(), Some("Custom/1.0"));
        assert_eq!(c.timeout_secs, Some(60));
        assert_eq!(c.chapter_timeout_secs, Some(15));
        assert_eq!(c.retry_count, Some(5));
        assert_eq!(c.retry_backoff_secs.as_deref(), Some([1, 2, 4, 8].as_slice()));
        assert_eq!(c.concurrency, Some(2));
        assert_eq!(c.login.as_deref(), Some("reader"));
        assert_eq!(c.password.as_deref(), Some("secret"));
        assert_eq!(c.formats.as_deref(), Some("epub,json"));
        assert_eq!(c.missing_chapters.as_deref(), Some("placeholder"));
        assert_eq!(c.assets_dir.as_deref(), Some(Path::new("assets")));
        Ok(())
    }

    #[test]
    fn unknown_keys_and_bad_toml_error() {
        assert!(toml::from_str::<Config>("output_dir = [").is_err());
        assert!(toml::from_str::<Config>("toc_page = true").is_err());
    }

    #[test]
    fn file_errors_carry_path() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "concurrency = \"many\"")?;
        let err = load_config_file(&path).err().ok_or("expected error")?;
        assert!(err.to_string().contains("config.toml"));

        std::fs::write(&path, "concurrency = 8")?;
        assert_eq!(load_config_file(&path)?.concurrency, Some(8));
        assert!(load_config_file(&dir.path().join("missing.toml")).is_err());
        Ok(())
    }
}
