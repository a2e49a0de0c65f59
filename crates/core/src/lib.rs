pub mod book;
pub mod cache;
pub mod config;
pub mod detect;
pub mod encoding;
pub mod error;
pub mod html;
pub mod library;
pub mod pipeline;
pub mod progress;
pub mod readers;
pub mod rewrite;
pub mod security;
pub mod segment;
pub mod toc;

pub mod prelude {
    pub use crate::book::*;
    pub use crate::cache::CacheStatus;
    pub use crate::config::{AppConfig, PipelineConfig};
    pub use crate::error::*;
    pub use crate::library::{BookSummary, Library};
    pub use crate::pipeline::Pipeline;
    pub use crate::progress::{IngestStage, ProgressEvent, ProgressHandler};
}
