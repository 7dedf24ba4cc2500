//! Single-file Markdown and plain-text output.
//!
//! Markdown keeps image references and writes the images to `images/` next to the
//! document; plain text drops them.

use crate::builder::{artifact_path, write_atomically, BookParts, Builder, BuilderError};
use crate::text;
use std::fmt::Write as _;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Style {
    Markdown,
    Text,
}

#[derive(Debug)]
pub struct PlainBuilder {
    parts: BookParts,
    style: Style,
}

impl PlainBuilder {
    pub fn markdown() -> Self {
        Self {
            parts: BookParts::default(),
            style: Style::Markdown,
        }
    }

    pub fn text() -> Self {
        Self {
            parts: BookParts::default(),
            style: Style::Text,
        }
    }

    fn authors(&self) -> String {
        self.parts
            .authors
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn render_markdown(&self) -> String {
        let p = &self.parts;
        let mut out = String::new();
        let _ = writeln!(out, "# {}\n", p.title);
        if !p.authors.is_empty() {
            let _ = writeln!(out, "By {}\n", self.authors());
        }
        if let Some(seria) = &p.seria {
            match seria.number.as_str() {
                "" => {
                    let _ = writeln!(out, "Series: {}\n", seria.name);
                }
                n => {
                    let _ = writeln!(out, "Series: {} #{}\n", seria.name, n);
                }
            }
        }
        if let Some(cover) = &p.cover {
            let _ = writeln!(out, "![Cover]({})\n", cover.path());
        }
        if let Some(annotation) = &p.annotation {
            let _ = writeln!(out, "{}\n", html2md::parse_html(annotation).trim());
        }
        let _ = writeln!(out, "---\n");
        for ch in &p.chapters {
            let _ = writeln!(out, "## {}\n", ch.title);
            let _ = writeln!(out, "{}\n", html2md::parse_html(&ch.content).trim());
        }
        out
    }

    fn render_text(&self) -> String {
        let p = &self.parts;
        let mut out = String::new();
        let _ = writeln!(out, "{}", p.title);
        if !p.authors.is_empty() {
            let _ = writeln!(out, "By {}", self.authors());
        }
        if let Some(seria) = &p.seria {
            let _ = writeln!(out, "Series: {} {}", seria.name, seria.number);
        }
        let _ = writeln!(out);
        if let Some(annotation) = &p.annotation {
            let _ = writeln!(out, "{}\n", text::plain_text(annotation));
        }
        for (i, ch) in p.chapters.iter().enumerate() {
            let _ = writeln!(out, "\n--- Chapter {}: {} ---\n", i + 1, ch.title);
            let _ = writeln!(out, "{}", text::plain_text(&ch.content));
        }
        out
    }

    /// Write every image under `dir`. On failure the images written so far are removed.
    fn write_images(&self, dir: &Path) -> Result<(), BuilderError> {
        let mut written: Vec<std::path::PathBuf> = Vec::new();
        for image in self.parts.images() {
            let path = dir.join(image.path());
            let result = write_atomically(&path, |mut file| {
                file.write_all(&image.content).map_err(BuilderError::io(&path))
            });
            if let Err(e) = result {
                for written in &written {
                    remove_quietly(written);
                }
                return Err(e);
            }
            written.push(path);
        }
        Ok(())
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "file could not be removed");
    }
}

impl Builder for PlainBuilder {
    fn extension(&self) -> &'static str {
        match self.style {
            Style::Markdown => "md",
            Style::Text => "txt",
        }
    }

    fn parts(&mut self) -> &mut BookParts {
        &mut self.parts
    }

    fn as_dyn(&mut self) -> &mut dyn Builder {
        self
    }

    fn build(self: Box<Self>, dir: &Path, name: &str) -> Result<PathBuf, BuilderError> {
        let path = artifact_path(dir, name, self.extension());
        let rendered = match self.style {
            Style::Markdown => self.render_markdown(),
            Style::Text => self.render_text(),
        };
        write_atomically(&path, |mut file| {
            file.write_all(rendered.as_bytes())
                .map_err(BuilderError::io(&path))
        })?;
        // The document exists before its images; without them it is removed again.
        if matches!(self.style, Style::Markdown) {
            if let Err(e) = self.write_images(dir) {
                remove_quietly(&path);
                return Err(e);
            }
        }
        info!(path = %path.display(), chapters = self.parts.chapters.len(), "document written");
        Ok(path)
    }
}
