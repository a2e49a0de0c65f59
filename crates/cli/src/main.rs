use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use folio_core::book::{Book, TocEntry};
use folio_core::config::{config_path, load_config, pipeline_config_from, AppConfig};
use folio_core::library::Library;
use folio_core::progress::{IngestStage, ProgressEvent, ProgressHandler};
use indicatif::{ProgressBar, ProgressStyle};

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "folio")]
#[command(about = "Ingest EPUB and plain-text books into a chapter cache")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse books and (re)build their caches
    Ingest {
        /// Source files (.epub, .txt)
        #[arg(required_unless_present = "pending")]
        files: Vec<String>,

        /// Also ingest every uncached file in the upload directory
        #[arg(long)]
        pending: bool,
    },

    /// Show metadata and cache details for a book
    Info {
        /// Cache id or source path
        book: String,
    },

    /// Print the table of contents
    Toc {
        /// Cache id or source path
        book: String,
    },

    /// Print one chapter
    Chapter {
        /// Cache id or source path
        book: String,

        /// Zero-based chapter index
        index: usize,

        /// Print the rewritten XHTML instead of plain text
        #[arg(long)]
        html: bool,
    },

    /// List cached books
    List,

    /// Delete the cache of a book
    Remove {
        /// Cache id or source path
        book: String,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Initialize default config file
    Init,
    /// Show current configuration
    Show,
    /// Print the config file location
    Path,
    /// Set a configuration value
    Set {
        /// Key (dot-separated path)
        key: String,
        /// Value
        value: String,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let result = match &cli.command {
        Commands::Ingest { files, pending } => run_ingest(files, *pending, cli.json),
        Commands::Info { book } => run_info(book, cli.json),
        Commands::Toc { book } => run_toc(book, cli.json),
        Commands::Chapter { book, index, html } => run_chapter(book, *index, *html, cli.json),
        Commands::List => run_list(cli.json),
        Commands::Remove { book } => run_remove(book, cli.json),
        Commands::Config { action } => run_config(action, cli.json),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn open_library() -> CliResult<Library> {
    let mut cfg = load_config();
    cfg.apply_env();
    Ok(Library::new(pipeline_config_from(&cfg)?))
}

/// Drives a terminal spinner from pipeline stage events.
struct SpinnerProgress {
    bar: ProgressBar,
}

impl SpinnerProgress {
    fn new(hidden: bool) -> Self {
        let bar = if hidden {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(IngestStage::COUNT)
        };
        let style = ProgressStyle::with_template("{spinner} [{pos}/{len}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        bar.set_style(style);
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressHandler for SpinnerProgress {
    fn on_progress(&self, event: ProgressEvent) {
        self.bar.set_length(event.total);
        self.bar.set_position(event.current);
        match event.message {
            Some(m) => self.bar.set_message(format!("{}: {}", event.stage.label(), m)),
            None => self.bar.set_message(event.stage.label()),
        }
        self.bar.tick();
    }
}

fn run_ingest(files: &[String], pending: bool, json: bool) -> CliResult {
    let library = open_library()?;
    let mut sources: Vec<PathBuf> = files.iter().map(PathBuf::from).collect();
    if pending {
        for path in library.pending_sources()? {
            if !sources.contains(&path) {
                sources.push(path);
            }
        }
    }
    if sources.is_empty() {
        if json {
            println!("[]");
        } else {
            println!("Nothing to ingest.");
        }
        return Ok(());
    }

    let mut reports = Vec::new();
    let mut failed = 0usize;
    for source in &sources {
        let progress = SpinnerProgress::new(json);
        let result = library
            .pipeline()
            .ingest_with_progress(source, Some(&progress));
        progress.finish();
        match result {
            Ok(book) => {
                let cache_dir = library.pipeline().cache_dir_for(source);
                if !json {
                    println!(
                        "Ingested: {} -> {} ({} chapters, {} images)",
                        source.display(),
                        cache_dir.display(),
                        book.chapters.len(),
                        book.images.len()
                    );
                    for d in &book.diagnostics {
                        println!("  [{:?}] {}", d.kind, d.detail);
                    }
                }
                reports.push(serde_json::json!({
                    "source": source,
                    "cache_dir": cache_dir,
                    "title": book.metadata.title,
                    "chapters": book.chapters.len(),
                    "images": book.images.len(),
                    "diagnostics": book.diagnostics,
                }));
            }
            Err(e) => {
                failed += 1;
                eprintln!("Failed: {}: {}", source.display(), e);
                reports.push(serde_json::json!({
                    "source": source,
                    "error": e.to_string(),
                }));
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }
    if failed > 0 {
        return Err(format!("{} of {} book(s) failed to ingest", failed, sources.len()).into());
    }
    Ok(())
}

fn run_info(book_ref: &str, json: bool) -> CliResult {
    let library = open_library()?;
    let (cache_dir, _) = library.locate(book_ref);
    let book = library.open(book_ref)?;

    if json {
        let info = serde_json::json!({
            "cache_dir": cache_dir,
            "metadata": book.metadata,
            "chapters": book.chapters.len(),
            "toc_entries": book.flat_toc().len(),
            "images": book.images.len(),
            "diagnostics": book.diagnostics,
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    let m = &book.metadata;
    println!("Title: {}", m.title);
    if !m.authors.is_empty() {
        println!("Authors: {}", m.authors.join(", "));
    }
    println!("Language: {}", m.language);
    if let Some(publisher) = &m.publisher {
        println!("Publisher: {}", publisher);
    }
    println!("Format: {}", m.source.format);
    println!("Source: {}", m.source.path.display());
    if let Some(encoding) = &m.text_encoding {
        println!("Encoding: {}", encoding);
    }
    println!("Cache: {}", cache_dir.display());
    println!("Chapters: {}", book.chapters.len());
    println!("TOC entries: {}", book.flat_toc().len());
    println!("Images: {}", book.images.len());
    if let Some(cover) = &m.cover_image {
        println!("Cover: {}", cover);
    }
    if !book.diagnostics.is_empty() {
        println!("Diagnostics: {}", book.diagnostics.len());
        for d in &book.diagnostics {
            println!("  [{:?}] {}", d.kind, d.detail);
        }
    }
    Ok(())
}

fn run_toc(book_ref: &str, json: bool) -> CliResult {
    let book = open_library()?.open(book_ref)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&book.toc)?);
    } else {
        print_toc(&book.toc, 0);
    }
    Ok(())
}

fn print_toc(entries: &[TocEntry], depth: usize) {
    for entry in entries {
        println!("{}{}  [{}]", "  ".repeat(depth), entry.title, entry.target.href());
        print_toc(&entry.children, depth + 1);
    }
}

fn run_chapter(book_ref: &str, index: usize, html: bool, json: bool) -> CliResult {
    let book: Book = open_library()?.open(book_ref)?;
    let chapter = book.chapter(index).ok_or_else(|| {
        format!(
            "Chapter {} out of range (book has {} chapters)",
            index,
            book.chapters.len()
        )
    })?;
    if json {
        println!("{}", serde_json::to_string_pretty(chapter)?);
    } else if html {
        println!("{}", chapter.content);
    } else {
        println!("{}\n", chapter.title);
        println!("{}", chapter.text);
    }
    Ok(())
}

fn run_list(json: bool) -> CliResult {
    let library = open_library()?;
    let books = library.list()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&books)?);
        return Ok(());
    }
    if books.is_empty() {
        println!("No books in {}", library.cache_root().display());
    }
    for b in &books {
        let authors = if b.authors.is_empty() {
            String::new()
        } else {
            format!(" by {}", b.authors.join(", "))
        };
        println!("{}: {}{} ({}, {} chapters)", b.id, b.title, authors, b.format, b.chapter_count);
    }
    let pending = library.pending_sources()?;
    if !pending.is_empty() {
        println!("\nNot yet ingested:");
        for p in &pending {
            println!("  {}", p.display());
        }
    }
    Ok(())
}

fn run_remove(book_ref: &str, json: bool) -> CliResult {
    let library = open_library()?;
    library.remove(book_ref)?;
    if !json {
        println!("Removed {}", book_ref);
    }
    Ok(())
}

fn run_config(action: &ConfigAction, json: bool) -> CliResult {
    match action {
        ConfigAction::Init => {
            let path = config_path().ok_or("Could not determine config directory")?;
            write_config(&path, &AppConfig::default())?;
            println!("Wrote default config to {}", path.display());
        }
        ConfigAction::Show => {
            let mut cfg = load_config();
            cfg.apply_env();
            if json {
                println!("{}", serde_json::to_string_pretty(&cfg)?);
            } else {
                println!("{}", toml::to_string_pretty(&cfg)?);
            }
        }
        ConfigAction::Path => {
            let path = config_path().ok_or("Could not determine config directory")?;
            println!("{}", path.display());
        }
        ConfigAction::Set { key, value } => {
            let path = config_path().ok_or("Could not determine config directory")?;
            let mut cfg: AppConfig = if path.exists() {
                let s = std::fs::read_to_string(&path)?;
                toml::from_str(&s).unwrap_or_else(|_| AppConfig::default())
            } else {
                AppConfig::default()
            };

            set_config_key(&mut cfg, key, value)?;
            // Reject values the pipeline would refuse at startup.
            pipeline_config_from(&cfg)?;

            write_config(&path, &cfg)?;
            if !json {
                println!("Updated {}", key);
            }
        }
    }
    Ok(())
}

fn write_config(path: &Path, cfg: &AppConfig) -> CliResult {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(cfg)?)?;
    Ok(())
}

fn set_config_key(cfg: &mut AppConfig, key: &str, value: &str) -> CliResult {
    let parts: Vec<&str> = key.splitn(2, '.').collect();
    match parts.as_slice() {
        ["library", sub] => match *sub {
            "cache_root" => cfg.library.cache_root = Some(value.to_string()),
            "upload_dir" => cfg.library.upload_dir = Some(value.to_string()),
            _ => return Err(format!("Unknown key: {}", key).into()),
        },
        ["segmenter", sub] => match *sub {
            "strategies" => {
                cfg.segmenter.strategies = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            }
            "blank_run_threshold" => cfg.segmenter.blank_run_threshold = value.parse()?,
            "min_chapters" => cfg.segmenter.min_chapters = value.parse()?,
            "max_heading_chars" => cfg.segmenter.max_heading_chars = value.parse()?,
            "max_section_chars" => cfg.segmenter.max_section_chars = value.parse().ok(),
            _ => return Err(format!("Unknown key: {}", key).into()),
        },
        ["encoding", sub] => match *sub {
            "max_decode_error_rate" => cfg.encoding.max_decode_error_rate = value.parse()?,
            "normalize_titles" => cfg.encoding.normalize_titles = value.parse()?,
            _ => return Err(format!("Unknown key: {}", key).into()),
        },
        ["security", sub] => match *sub {
            "max_file_size_mb" => cfg.security.max_file_size_mb = value.parse().ok(),
            "max_compression_ratio" => cfg.security.max_compression_ratio = value.parse().ok(),
            "max_toc_depth" => cfg.security.max_toc_depth = value.parse().ok(),
            _ => return Err(format!("Unknown key: {}", key).into()),
        },
        _ => return Err(format!("Unknown key: {}", key).into()),
    }
    Ok(())
}
