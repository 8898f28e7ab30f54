//! Per-stage diagnostics for a single OCR run.

use std::{fmt, time::Duration};

use schemars::JsonSchema;

use crate::{
    messages::{BilingualMessage, MessageCause},
    prelude::*,
    preprocess::enhance::Enhancement,
    retry::{AttemptRecord, millis},
};

/// The stages of an OCR run, in the order they happen.
#[derive(
    Clone, Copy, Debug, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Work out what kind of file we were given.
    UploadParse,
    /// Rasterize PDF pages.
    PdfToImage,
    /// Clean up images for OCR.
    Preprocess,
    /// Call the primary engine.
    AzureCall,
    /// Call the fallback engine.
    FallbackCall,
    /// Choose the final text.
    Extraction,
}

impl StageName {
    /// Every stage, in canonical order.
    pub const ALL: [StageName; 6] = [
        StageName::UploadParse,
        StageName::PdfToImage,
        StageName::Preprocess,
        StageName::AzureCall,
        StageName::FallbackCall,
        StageName::Extraction,
    ];
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageName::UploadParse => "upload_parse",
            StageName::PdfToImage => "pdf_to_image",
            StageName::Preprocess => "preprocess",
            StageName::AzureCall => "azure_call",
            StageName::FallbackCall => "fallback_call",
            StageName::Extraction => "extraction",
        };
        f.write_str(name)
    }
}

/// How did a stage end?
#[derive(Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ok,
    Error,
    Skipped,
}

/// What happened during one stage.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct StageRecord {
    /// Which stage is this?
    pub stage: StageName,

    /// How did it end?
    pub status: StageStatus,

    /// How long did it take, in milliseconds?
    pub duration_ms: u64,

    /// For engine stages, every attempt we made.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<AttemptRecord>,

    /// For engine stages, the confidence of the result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    /// For `preprocess`, the clean-up steps applied to at least one page.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Enhancement>,

    /// Zero-based indices of pages which failed in this stage.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pages_failed: Vec<usize>,

    /// What went wrong, for end users.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<BilingualMessage>,

    /// What went wrong, for developers. Only present in debug mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub technical_detail: Option<String>,
}

impl StageRecord {
    fn new(stage: StageName, status: StageStatus, duration: Duration) -> Self {
        Self {
            stage,
            status,
            duration_ms: millis(duration),
            attempts: vec![],
            confidence: None,
            steps: vec![],
            pages_failed: vec![],
            error_detail: None,
            technical_detail: None,
        }
    }

    /// A stage that succeeded.
    pub fn ok(stage: StageName, duration: Duration) -> Self {
        Self::new(stage, StageStatus::Ok, duration)
    }

    /// A stage that failed.
    pub fn error(
        stage: StageName,
        duration: Duration,
        cause: MessageCause,
        technical_detail: impl Into<String>,
    ) -> Self {
        Self {
            error_detail: Some(cause.into()),
            technical_detail: Some(technical_detail.into()),
            ..Self::new(stage, StageStatus::Error, duration)
        }
    }

    /// A stage we never ran.
    pub fn skipped(stage: StageName) -> Self {
        Self::new(stage, StageStatus::Skipped, Duration::ZERO)
    }

    /// Attach engine attempts.
    pub fn with_attempts(mut self, attempts: Vec<AttemptRecord>) -> Self {
        self.attempts = attempts;
        self
    }

    /// Attach a confidence score.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Attach the enhancement steps we applied.
    pub fn with_steps(mut self, steps: Vec<Enhancement>) -> Self {
        self.steps = steps;
        self
    }

    /// Attach failed page numbers.
    pub fn with_pages_failed(mut self, pages_failed: Vec<usize>) -> Self {
        self.pages_failed = pages_failed;
        self
    }

    /// Attach technical details without marking the stage as failed.
    pub fn with_technical_detail(mut self, detail: impl Into<String>) -> Self {
        self.technical_detail = Some(detail.into());
        self
    }
}

/// Collects [`StageRecord`]s for one run.
///
/// Stages must be recorded in canonical order, at most once each. Anything
/// else is logged and ignored, so a bug in the caller can't produce a
/// confusing `stages` list.
#[derive(Debug)]
pub struct DiagnosticsRecorder {
    /// Keep technical details?
    debug: bool,

    /// What we've recorded so far, in order.
    records: Vec<StageRecord>,
}

impl DiagnosticsRecorder {
    /// Create a new recorder.
    pub fn new(debug: bool) -> Self {
        Self {
            debug,
            records: Vec::with_capacity(StageName::ALL.len()),
        }
    }

    /// Record a stage. Returns `false` if the record was rejected.
    pub fn record(&mut self, mut record: StageRecord) -> bool {
        if let Some(last) = self.records.last()
            && record.stage <= last.stage
        {
            error!(
                stage = %record.stage,
                last_stage = %last.stage,
                "ignoring duplicate or out-of-order stage record"
            );
            return false;
        }
        if !self.debug {
            record.technical_detail = None;
        }
        debug!(stage = %record.stage, status = ?record.status, duration_ms = record.duration_ms, "stage finished");
        self.records.push(record);
        true
    }

    /// Return one record per stage, in canonical order, marking anything we
    /// never heard about as skipped.
    pub fn finish(self) -> Vec<StageRecord> {
        let mut recorded = self.records.into_iter().peekable();
        StageName::ALL
            .iter()
            .map(|&stage| match recorded.next_if(|r| r.stage == stage) {
                Some(record) => record,
                None => StageRecord::skipped(stage),
            })
            .collect()
    }
}
