//! Config file parsing for `~/.config/folio/config.toml`.
//!
//! The pipeline never reads configuration on its own: callers load an
//! [`AppConfig`], apply environment overrides, and hand the resulting
//! [`PipelineConfig`] to [`crate::pipeline::Pipeline::new`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::encoding::EncodingOptions;
use crate::error::ConfigError;
use crate::security::SecurityLimits;
use crate::segment::txt::{SegmenterOptions, SplitStrategy};

/// Environment variable overriding the cache root.
pub const ENV_LIBRARY_DIR: &str = "READER_LIBRARY_DIR";
/// Environment variable overriding the upload directory.
pub const ENV_UPLOAD_DIR: &str = "READER_UPLOAD_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub segmenter: SegmenterConfig,
    #[serde(default)]
    pub encoding: EncodingConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Root directory holding one `<slug>_data` directory per book.
    pub cache_root: Option<String>,
    /// Directory users drop new EPUB/TXT files into.
    pub upload_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmenterConfig {
    /// Text split strategies, tried in order.
    #[serde(default = "default_strategies")]
    pub strategies: Vec<String>,
    #[serde(default = "default_blank_run_threshold")]
    pub blank_run_threshold: usize,
    #[serde(default = "default_min_chapters")]
    pub min_chapters: usize,
    #[serde(default = "default_max_heading_chars")]
    pub max_heading_chars: usize,
    /// Chunk cue-less texts into sections of roughly this many characters.
    pub max_section_chars: Option<usize>,
}

fn default_strategies() -> Vec<String> {
    SegmenterOptions::default()
        .strategies
        .iter()
        .map(|s| s.name().to_string())
        .collect()
}
fn default_blank_run_threshold() -> usize {
    SegmenterOptions::default().blank_run_threshold
}
fn default_min_chapters() -> usize {
    SegmenterOptions::default().min_chapters
}
fn default_max_heading_chars() -> usize {
    SegmenterOptions::default().max_heading_chars
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            strategies: default_strategies(),
            blank_run_threshold: default_blank_run_threshold(),
            min_chapters: default_min_chapters(),
            max_heading_chars: default_max_heading_chars(),
            max_section_chars: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodingConfig {
    pub max_decode_error_rate: f64,
    pub normalize_titles: bool,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        let defaults = EncodingOptions::default();
        Self {
            max_decode_error_rate: defaults.max_error_rate,
            normalize_titles: defaults.normalize_titles,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub max_file_size_mb: Option<u64>,
    pub max_compression_ratio: Option<u64>,
    pub max_toc_depth: Option<u32>,
}

/// Fully resolved configuration consumed by one pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub cache_root: PathBuf,
    pub upload_dir: PathBuf,
    pub segmenter: SegmenterOptions,
    pub encoding: EncodingOptions,
    pub security: SecurityLimits,
}

impl PipelineConfig {
    /// Defaults for everything except the two directories.
    pub fn new(cache_root: impl Into<PathBuf>, upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            upload_dir: upload_dir.into(),
            segmenter: SegmenterOptions::default(),
            encoding: EncodingOptions::default(),
            security: SecurityLimits::default(),
        }
    }
}

impl AppConfig {
    /// Apply `READER_LIBRARY_DIR` / `READER_UPLOAD_DIR` on top of the file values.
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(ENV_LIBRARY_DIR) {
            if !dir.is_empty() {
                self.library.cache_root = Some(dir);
            }
        }
        if let Ok(dir) = std::env::var(ENV_UPLOAD_DIR) {
            if !dir.is_empty() {
                self.library.upload_dir = Some(dir);
            }
        }
    }
}

/// Load config from the default path. Missing or unreadable files yield defaults.
pub fn load_config() -> AppConfig {
    let Some(path) = config_path() else {
        return AppConfig::default();
    };
    if !path.exists() {
        return AppConfig::default();
    }
    match load_config_from(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("Ignoring config file: {}", e);
            AppConfig::default()
        }
    }
}

/// Load config from an explicit path, reporting parse errors.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str::<AppConfig>(&content).map_err(|e| ConfigError::Invalid {
        path: path.display().to_string(),
        detail: e.to_string(),
    })
}

/// Return the default config file path.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|mut p| {
        p.push("folio");
        p.push("config.toml");
        p
    })
}

fn default_data_dir(leaf: &str, fallback: &str) -> PathBuf {
    dirs::data_local_dir()
        .map(|p| p.join("folio").join(leaf))
        .unwrap_or_else(|| PathBuf::from(fallback))
}

pub fn security_limits_from_config(c: &SecurityConfig) -> SecurityLimits {
    let mut limits = SecurityLimits::default();
    if let Some(mb) = c.max_file_size_mb {
        limits.max_total_size_bytes = mb.saturating_mul(1024).saturating_mul(1024);
    }
    if let Some(r) = c.max_compression_ratio {
        limits.max_compression_ratio = r;
    }
    if let Some(d) = c.max_toc_depth {
        limits.max_nesting_depth = d;
    }
    limits
}

pub fn encoding_options_from_config(c: &EncodingConfig) -> EncodingOptions {
    EncodingOptions {
        max_error_rate: c.max_decode_error_rate,
        normalize_titles: c.normalize_titles,
    }
}

pub fn segmenter_options_from_config(c: &SegmenterConfig) -> Result<SegmenterOptions, ConfigError> {
    let strategies = c
        .strategies
        .iter()
        .map(|name| {
            SplitStrategy::from_name(name).ok_or_else(|| ConfigError::UnknownStrategy(name.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SegmenterOptions {
        strategies,
        blank_run_threshold: c.blank_run_threshold.max(1),
        min_chapters: c.min_chapters.max(1),
        max_heading_chars: c.max_heading_chars,
        max_section_chars: c.max_section_chars,
    })
}

/// Build the pipeline configuration from the app config.
pub fn pipeline_config_from(cfg: &AppConfig) -> Result<PipelineConfig, ConfigError> {
    let cache_root = cfg
        .library
        .cache_root
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(|| default_data_dir("library", "./data"));
    let upload_dir = cfg
        .library
        .upload_dir
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(|| default_data_dir("books", "./books"));

    Ok(PipelineConfig {
        cache_root,
        upload_dir,
        segmenter: segmenter_options_from_config(&cfg.segmenter)?,
        encoding: encoding_options_from_config(&cfg.encoding),
        security: security_limits_from_config(&cfg.security),
    })
}
