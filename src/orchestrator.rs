//! Running one document through the whole OCR pipeline.
//!
//! A run moves through a small state machine:
//!
//! ```text
//! Idle → Preprocessing → PrimaryAttempt → Evaluate ─┬─────────────────→ Finalizing → Done
//!                                                   └→ FallbackAttempt ─┘           └→ Failed
//! ```
//!
//! Every run produces an [`OcrOutcome`], even when the upload can't be read.
//! Runs share nothing mutable, so any number of them may run at once.

use std::{fmt, sync::Arc, time::Duration};

use futures::{FutureExt as _, StreamExt as _};
use schemars::JsonSchema;
use tokio::time::Instant;
use tracing::Instrument as _;

use crate::{
    config::OcrConfig,
    diagnostics::{DiagnosticsRecorder, StageName, StageRecord, StageStatus},
    document::{Document, UploadError},
    engines::{EngineError, EngineKind, EngineResult, OcrEngine},
    messages::{BilingualMessage, MessageCause},
    preprocess::{ImageSource, PreparedImage, PreprocessError, Preprocessor},
    prelude::*,
    retry::{AttemptRecord, IntoRetryResult as _, with_retry},
};

/// Did the run produce text?
#[derive(Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Done,
    Failed,
}

/// The result of OCRing one document.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct OcrOutcome {
    /// Did we get usable text?
    pub status: OutcomeStatus,

    /// Which engine produced `text`. Missing if neither engine found any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_used: Option<EngineKind>,

    /// Confidence in `text`, from 0.0 to 1.0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    /// The extracted text, with pages separated by blank lines.
    pub text: String,

    /// The start of `text` on one line, for quick review.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,

    /// How many pages the document has.
    pub page_count: usize,

    /// One record per pipeline stage, in order.
    pub stages: Vec<StageRecord>,

    /// Things the user should know, even though we succeeded.
    pub warnings: Vec<BilingualMessage>,

    /// What went wrong. Present exactly when `status` is `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_facing_error: Option<BilingualMessage>,
}

impl OcrOutcome {
    /// Did this run succeed?
    pub fn is_done(&self) -> bool {
        self.status == OutcomeStatus::Done
    }

    /// Look up the record for `stage`.
    pub fn stage(&self, stage: StageName) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.stage == stage)
    }
}

/// Where a run is in the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Preprocessing,
    PrimaryAttempt,
    Evaluate,
    FallbackAttempt,
    Finalizing,
    Done,
    Failed,
}

impl RunState {
    /// Is `next` a legal successor of this state?
    fn can_move_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Preprocessing)
                | (Preprocessing, PrimaryAttempt)
                | (PrimaryAttempt, Evaluate)
                | (Evaluate, FallbackAttempt)
                | (Evaluate, Finalizing)
                | (FallbackAttempt, Finalizing)
                | (Finalizing, Done)
                | (Finalizing, Failed)
                // Bad uploads and unreadable documents fail early.
                | (Idle, Failed)
                | (Preprocessing, Failed)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Drives documents through preprocessing, the primary engine and, when
/// needed, the fallback engine.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<OcrConfig>,
    preprocessor: Preprocessor,
    primary: Arc<dyn OcrEngine>,
    fallback: Arc<dyn OcrEngine>,
}

impl Orchestrator {
    /// Create a new orchestrator.
    pub fn new(
        config: Arc<OcrConfig>,
        preprocessor: Preprocessor,
        primary: Arc<dyn OcrEngine>,
        fallback: Arc<dyn OcrEngine>,
    ) -> Self {
        Self {
            config,
            preprocessor,
            primary,
            fallback,
        }
    }

    /// OCR a file on disk.
    pub async fn run_path(&self, path: &Path, declared_mime_type: Option<&str>) -> OcrOutcome {
        let started = Instant::now();
        let document = Document::from_path(path, declared_mime_type).await;
        self.run_upload(document, started.elapsed()).await
    }

    /// OCR an upload held in memory.
    #[cfg(test)]
    pub async fn run_bytes(
        &self,
        label: &str,
        bytes: Vec<u8>,
        declared_mime_type: Option<&str>,
    ) -> OcrOutcome {
        let started = Instant::now();
        let document = Document::from_bytes(label, bytes, declared_mime_type);
        self.run_upload(document, started.elapsed()).await
    }

    async fn run_upload(
        &self,
        document: Result<Document, UploadError>,
        upload_duration: Duration,
    ) -> OcrOutcome {
        let mut run = Run::new(self.config.debug);
        match document {
            Ok(document) => {
                run.record(
                    StageRecord::ok(StageName::UploadParse, upload_duration).with_technical_detail(
                        format!("{} ({} bytes)", document.mime_type, document.size()),
                    ),
                );
                self.run(run, &document)
                    .instrument(tracing::info_span!("ocr_run", document = %document.label))
                    .await
            }
            Err(err) => {
                warn!("cannot parse upload: {}", err);
                run.record(StageRecord::error(
                    StageName::UploadParse,
                    upload_duration,
                    err.cause,
                    err.message,
                ));
                run.fail(err.cause, 0)
            }
        }
    }

    async fn run(&self, mut run: Run, document: &Document) -> OcrOutcome {
        run.enter(RunState::Preprocessing);
        let prepared = match self.preprocess(&mut run, document).await {
            Ok(prepared) => prepared,
            Err(failure) => return run.fail(failure.cause, failure.page_count),
        };
        let page_count = prepared.page_count;
        let images = prepared.images;

        run.enter(RunState::PrimaryAttempt);
        let primary = if self.config.offline {
            // Leaves `azure_call` as skipped.
            debug!("offline mode, not calling the primary engine");
            EnginePass::default()
        } else {
            let primary = self.engine_pass(self.primary.as_ref(), &images).await;
            run.record(primary.stage_record(StageName::AzureCall));
            primary
        };

        run.enter(RunState::Evaluate);
        let threshold = self.config.confidence_threshold;
        let primary_is_good = primary.error.is_none()
            && primary.has_usable_text()
            && primary.confidence >= threshold;

        let fallback = if primary_is_good {
            debug!(confidence = primary.confidence, "primary result is good enough");
            None
        } else {
            info!(
                confidence = primary.confidence,
                error = ?primary.error.as_ref().map(|e| e.kind),
                "primary result not usable, trying fallback"
            );
            run.enter(RunState::FallbackAttempt);
            let fallback = self.engine_pass(self.fallback.as_ref(), &images).await;
            run.record(fallback.stage_record(StageName::FallbackCall));
            Some(fallback)
        };

        run.enter(RunState::Finalizing);
        let started = Instant::now();
        let Some((engine_used, chosen)) = choose_result(&primary, fallback.as_ref()) else {
            run.record(StageRecord::error(
                StageName::Extraction,
                started.elapsed(),
                MessageCause::NoTextExtracted,
                "neither engine produced any text",
            ));
            return run.fail(MessageCause::NoTextExtracted, page_count);
        };

        if let Some(err) = &chosen.error {
            // Partial text from an engine that gave up part way through.
            run.warn(MessageCause::PagesSkipped);
            debug!(%err, "returning partial text");
        }
        let confidence = round_confidence(chosen.confidence);
        if confidence < threshold {
            run.warn(MessageCause::LowConfidence);
        }
        let text = chosen.text();
        run.record(
            StageRecord::ok(StageName::Extraction, started.elapsed()).with_confidence(confidence),
        );
        run.done(engine_used, confidence, text, page_count)
    }

    /// Prepare every page, recording the `pdf_to_image` and `preprocess`
    /// stages. Fails if no page could be prepared.
    async fn preprocess(
        &self,
        run: &mut Run,
        document: &Document,
    ) -> Result<PreparedDocument, PreprocessFailure> {
        let started = Instant::now();
        let prepared = match self.preprocessor.prepare(document).await {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!("cannot prepare document: {}", err);
                run.record(StageRecord::error(
                    err.stage,
                    started.elapsed(),
                    err.cause,
                    err.message.clone(),
                ));
                return Err(PreprocessFailure {
                    cause: err.cause,
                    page_count: 0,
                });
            }
        };

        if prepared.hit_page_limit() {
            run.warn(MessageCause::PageLimitReached);
        }
        let source = prepared.source;
        let page_count = prepared.total_pages;

        let results = prepared.pages.collect::<Vec<_>>().await;
        let mut images = Vec::with_capacity(results.len());
        let mut errors = vec![];
        for result in results {
            match result {
                Ok(image) => images.push(image),
                Err(err) => {
                    warn!("skipping page: {}", err);
                    errors.push(err);
                }
            }
        }

        match source {
            ImageSource::PdfPage => {
                let duration = images.iter().map(|i| i.timings.rasterize).sum::<Duration>();
                let pages_failed = errors.iter().filter_map(|e| e.page_idx).collect::<Vec<_>>();
                if images.is_empty() {
                    run.record(
                        StageRecord::error(
                            StageName::PdfToImage,
                            started.elapsed(),
                            MessageCause::NoReadablePages,
                            technical_summary(&errors),
                        )
                        .with_pages_failed(pages_failed),
                    );
                    return Err(PreprocessFailure {
                        cause: MessageCause::NoReadablePages,
                        page_count,
                    });
                }
                let mut record =
                    StageRecord::ok(StageName::PdfToImage, duration).with_pages_failed(pages_failed);
                if !errors.is_empty() {
                    run.warn(MessageCause::PagesSkipped);
                    record = record.with_technical_detail(technical_summary(&errors));
                }
                run.record(record);
            }
            ImageSource::Photo => {
                if images.is_empty() {
                    let cause = errors
                        .first()
                        .map_or(MessageCause::ImageUnreadable, |e| e.cause);
                    run.record(StageRecord::error(
                        StageName::Preprocess,
                        started.elapsed(),
                        cause,
                        technical_summary(&errors),
                    ));
                    return Err(PreprocessFailure { cause, page_count });
                }
            }
        }

        let mut applied = images
            .iter()
            .flat_map(|i| i.enhancements.iter().copied())
            .collect::<Vec<_>>();
        applied.sort();
        applied.dedup();
        let mut skipped = images
            .iter()
            .flat_map(|i| i.skipped_enhancements.iter().copied())
            .collect::<Vec<_>>();
        skipped.sort();
        skipped.dedup();
        let duration = images.iter().map(|i| i.timings.enhance).sum::<Duration>();
        let mut record = StageRecord::ok(StageName::Preprocess, duration).with_steps(applied);
        if !skipped.is_empty() {
            run.warn(MessageCause::EnhancementSkipped);
            record = record.with_technical_detail(format!("skipped {:?}", skipped));
        }
        run.record(record);

        Ok(PreparedDocument { images, page_count })
    }

    /// Run `engine` over each page in order, with retries. Stops at the
    /// first page that fails for good.
    #[instrument(level = "debug", skip_all, fields(engine = engine.name(), pages = images.len()))]
    async fn engine_pass(&self, engine: &dyn OcrEngine, images: &[PreparedImage]) -> EnginePass {
        let started = Instant::now();
        let mut pass = EnginePass::default();
        for image in images {
            let report = with_retry(&self.config.retry, |ctx| {
                trace!(page = image.page_idx + 1, attempt = ctx.attempt, "calling engine");
                engine
                    .analyze(image, ctx.remaining)
                    .map(|result| result.into_retry_result())
            })
            .await;
            pass.attempts.extend(report.attempts);
            match report.result {
                Ok(result) => pass.pages.push(result),
                Err(err) => {
                    warn!(engine = engine.name(), page = image.page_idx + 1, %err, "engine failed");
                    pass.error = Some(err);
                    break;
                }
            }
        }
        pass.confidence = weighted_confidence(&pass.pages);
        pass.duration = started.elapsed();
        pass
    }
}

/// Pages which made it through preprocessing.
struct PreparedDocument {
    images: Vec<PreparedImage>,
    page_count: usize,
}

/// Why a document never reached the engines.
struct PreprocessFailure {
    cause: MessageCause,
    page_count: usize,
}

/// Everything one engine produced for a document.
#[derive(Debug, Default)]
struct EnginePass {
    /// Results for the pages that succeeded, in page order.
    pages: Vec<EngineResult>,

    /// Every attempt, across all pages.
    attempts: Vec<AttemptRecord>,

    /// The error that ended the pass early, if any.
    error: Option<EngineError>,

    /// Text-length-weighted confidence over `pages`.
    confidence: f64,

    duration: Duration,
}

impl EnginePass {
    fn has_usable_text(&self) -> bool {
        self.pages.iter().any(EngineResult::has_usable_text)
    }

    /// The text of every page, separated by blank lines.
    fn text(&self) -> String {
        self.pages
            .iter()
            .filter(|page| page.has_usable_text())
            .map(|page| page.text.trim())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn stage_record(&self, stage: StageName) -> StageRecord {
        let record = match &self.error {
            Some(err) => StageRecord::error(
                stage,
                self.duration,
                err.kind.message_cause(),
                err.message.clone(),
            ),
            None => {
                let metadata = self.pages.iter().map(|p| p.raw_metadata.clone()).collect();
                StageRecord::ok(stage, self.duration)
                    .with_technical_detail(Value::Array(metadata).to_string())
            }
        };
        let record = record.with_attempts(self.attempts.clone());
        if self.pages.is_empty() {
            record
        } else {
            record.with_confidence(round_confidence(self.confidence))
        }
    }
}

/// Pick the text to return, in order of preference: a complete fallback
/// result, anything from the primary, then partial fallback text.
fn choose_result<'a>(
    primary: &'a EnginePass,
    fallback: Option<&'a EnginePass>,
) -> Option<(EngineKind, &'a EnginePass)> {
    let Some(fallback) = fallback else {
        return Some((EngineKind::Primary, primary));
    };
    if fallback.error.is_none() && fallback.has_usable_text() {
        Some((EngineKind::Fallback, fallback))
    } else if primary.has_usable_text() {
        Some((EngineKind::Primary, primary))
    } else if fallback.has_usable_text() {
        Some((EngineKind::Fallback, fallback))
    } else {
        None
    }
}

/// Average page confidence, weighted by how much text each page has.
fn weighted_confidence(pages: &[EngineResult]) -> f64 {
    let (weighted, total) = pages.iter().fold((0.0, 0usize), |(weighted, total), page| {
        let len = page.text.trim().chars().count();
        (weighted + page.confidence * len as f64, total + len)
    });
    if total == 0 {
        0.0
    } else {
        (weighted / total as f64).clamp(0.0, 1.0)
    }
}

/// Round to 3 decimal places, so outputs are stable and readable.
fn round_confidence(confidence: f64) -> f64 {
    (confidence * 1000.0).round() / 1000.0
}

/// How long [`OcrOutcome::preview`] may be, in characters.
const PREVIEW_WIDTH: usize = 320;

/// Marks a shortened preview.
const PREVIEW_ELLIPSIS: &str = "...";

/// Collapse whitespace in `text`, and shorten it to [`PREVIEW_WIDTH`]
/// characters, breaking between words where we can.
fn preview(text: &str) -> Option<String> {
    let words = text.split_whitespace().collect::<Vec<_>>();
    let full = words.join(" ");
    if full.is_empty() {
        return None;
    }
    if full.chars().count() <= PREVIEW_WIDTH {
        return Some(full);
    }

    let budget = PREVIEW_WIDTH - PREVIEW_ELLIPSIS.len();
    let mut shortened = String::new();
    let mut len = 0;
    for word in words {
        let sep = usize::from(!shortened.is_empty());
        let word_len = word.chars().count();
        if len + sep + word_len > budget {
            if shortened.is_empty() {
                // One enormous word.
                shortened.extend(word.chars().take(budget));
            }
            break;
        }
        if sep == 1 {
            shortened.push(' ');
        }
        shortened.push_str(word);
        len += sep + word_len;
    }
    shortened.push_str(PREVIEW_ELLIPSIS);
    Some(shortened)
}

/// Summarize preprocessing errors for `technical_detail`.
fn technical_summary(errors: &[PreprocessError]) -> String {
    errors
        .iter()
        .map(|err| err.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// State for a single run.
struct Run {
    state: RunState,
    recorder: DiagnosticsRecorder,
    warnings: Vec<BilingualMessage>,
}

impl Run {
    fn new(debug: bool) -> Self {
        Self {
            state: RunState::Idle,
            recorder: DiagnosticsRecorder::new(debug),
            warnings: vec![],
        }
    }

    fn enter(&mut self, next: RunState) {
        if !self.state.can_move_to(next) {
            error!(from = %self.state, to = %next, "unexpected run state transition");
        }
        debug!(from = %self.state, to = %next, "run state");
        self.state = next;
    }

    fn record(&mut self, record: StageRecord) {
        self.recorder.record(record);
    }

    fn warn(&mut self, cause: MessageCause) {
        if !self.warnings.iter().any(|w| w.code == cause) {
            self.warnings.push(cause.into());
        }
    }

    fn done(
        mut self,
        engine_used: EngineKind,
        confidence: f64,
        text: String,
        page_count: usize,
    ) -> OcrOutcome {
        self.enter(RunState::Done);
        info!(?engine_used, confidence, page_count, "OCR finished");
        OcrOutcome {
            status: OutcomeStatus::Done,
            engine_used: Some(engine_used),
            confidence: Some(confidence),
            preview: preview(&text),
            text,
            page_count,
            stages: self.recorder.finish(),
            warnings: self.warnings,
            user_facing_error: None,
        }
    }

    fn fail(mut self, cause: MessageCause, page_count: usize) -> OcrOutcome {
        self.enter(RunState::Failed);
        let stages = self.recorder.finish();
        let failed_stage = stages
            .iter()
            .find(|r| r.status == StageStatus::Error)
            .map(|r| r.stage);
        warn!(?cause, ?failed_stage, "OCR failed");
        OcrOutcome {
            status: OutcomeStatus::Failed,
            engine_used: None,
            confidence: None,
            text: String::new(),
            preview: None,
            page_count,
            stages,
            warnings: self.warnings,
            user_facing_error: Some(cause.into()),
        }
    }
}
