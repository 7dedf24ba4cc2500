//! JSON dump of every accumulated field. Image payloads are base64.

use crate::builder::{artifact_path, write_atomically, BookParts, Builder, BuilderError};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Default)]
pub struct JsonBuilder {
    parts: BookParts,
}

impl JsonBuilder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Builder for JsonBuilder {
    fn extension(&self) -> &'static str {
        "json"
    }

    fn parts(&mut self) -> &mut BookParts {
        &mut self.parts
    }

    fn as_dyn(&mut self) -> &mut dyn Builder {
        self
    }

    fn build(self: Box<Self>, dir: &Path, name: &str) -> Result<PathBuf, BuilderError> {
        let path = artifact_path(dir, name, self.extension());
        write_atomically(&path, |file| {
            let mut out = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut out, &self.parts)?;
            out.flush().map_err(BuilderError::io(&path))
        })?;
        info!(path = %path.display(), chapters = self.parts.chapters.len(), "JSON written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{fixture, populate};
    use std::error::Error;

    #[test]
    fn json_contains_valid_chapters_and_images() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let mut builder = Box::new(JsonBuilder::new());
        populate(&mut *builder, &fixture::book());
        let path = builder.build(dir.path(), "Test: Book")?;
        assert_eq!(path, dir.path().join("Test Book.json"));

        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(value["title"], "Test Book");
        assert_eq!(value["authors"][0]["name"], "Test Author");
        assert_eq!(value["url"], "https://example.com/book/1");
        let chapters = value["chapters"].as_array().ok_or("chapters")?;
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[1]["images"][0]["name"], "pic.png");
        assert!(chapters[1]["images"][0]["content"].is_string());
        Ok(())
    }

    #[test]
    fn rebuild_overwrites_with_identical_bytes() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let build = || -> Result<Vec<u8>, Box<dyn Error>> {
            let mut builder = Box::new(JsonBuilder::new());
            populate(&mut *builder, &fixture::book());
            let path = builder.build(dir.path(), "same")?;
            Ok(std::fs::read(path)?)
        };
        assert_eq!(build()?, build()?);
        Ok(())
    }
}
