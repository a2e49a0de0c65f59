//! Progress reporting for ingestion runs.

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Detect,
    OpenSource,
    ResolveToc,
    Segment,
    Rewrite,
    WriteCache,
}

impl IngestStage {
    pub const COUNT: u64 = 6;

    pub fn ordinal(self) -> u64 {
        self as u64
    }

    pub fn label(self) -> &'static str {
        match self {
            IngestStage::Detect => "Detecting format",
            IngestStage::OpenSource => "Opening source",
            IngestStage::ResolveToc => "Resolving table of contents",
            IngestStage::Segment => "Segmenting chapters",
            IngestStage::Rewrite => "Rewriting links and images",
            IngestStage::WriteCache => "Writing cache",
        }
    }
}

/// Event emitted when the pipeline enters a stage.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub stage: IngestStage,
    pub current: u64,
    pub total: u64,
    pub message: Option<String>,
}

/// Receives progress updates. Implement this to drive progress bars or logs.
pub trait ProgressHandler: Send {
    fn on_progress(&self, event: ProgressEvent);
}

/// Helper to emit a progress event if a handler is provided.
pub fn emit_progress(
    handler: Option<&dyn ProgressHandler>,
    stage: IngestStage,
    message: Option<&str>,
) {
    tracing::debug!(stage = stage.label(), "ingest stage");
    if let Some(h) = handler {
        h.on_progress(ProgressEvent {
            stage,
            current: stage.ordinal(),
            total: IngestStage::COUNT,
            message: message.map(|s| s.to_string()),
        });
    }
}
