//! ficfetch: download serialized fiction from web sources and build EPUB, JSON,
//! Markdown or plain-text books.

pub mod builder;
pub mod cli;
pub mod config;
pub mod getter;
pub mod model;
pub mod text;

// Re-exports for CLI and consumers.
pub use builder::{populate, Builder, BuilderError, OutputFormat};
pub use getter::{
    Getter, GetterConfig, GetterError, GetterOptions, GetterRegistry, MissingChapterBehavior,
    RetryClient,
};
pub use model::{Author, Book, Chapter, Image, Seria};
