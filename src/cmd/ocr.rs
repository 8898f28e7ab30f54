//! The `ocr` subcommand.

use std::{sync::Arc, time::Duration};

use clap::Args;
use futures::{FutureExt as _, Stream as _, StreamExt as _};
use schemars::JsonSchema;

use crate::{
    config::OcrConfig,
    engines::{EngineKind, azure::AzureReadEngine, tesseract::TesseractEngine},
    orchestrator::{OcrOutcome, Orchestrator},
    prelude::*,
    preprocess::{PreprocessOptions, Preprocessor, rasterize::PopplerRasterizer},
    rate_limit::RateLimit,
    ui::{ProgressConfig, Ui},
    work::{WorkInput, WorkOutput, WorkResult},
};

use super::StreamOpts;

/// An input record naming a document to OCR.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct OcrInput {
    /// Path to a PDF, PNG or JPEG file.
    pub path: PathBuf,

    /// The MIME type the uploader claimed, if any. Generic types like
    /// `application/octet-stream` are replaced by the detected type.
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl OcrInput {
    /// The declared MIME type, treating blank CSV cells as missing.
    fn declared_mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref().filter(|m| !m.trim().is_empty())
    }
}

/// An output record for one document.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct OcrOutput {
    /// The input path.
    pub path: PathBuf,

    #[serde(flatten)]
    pub outcome: OcrOutcome,
}

impl WorkResult for OcrOutput {
    fn is_failed(&self) -> bool {
        !self.outcome.is_done()
    }

    fn used_fallback(&self) -> bool {
        self.outcome.engine_used == Some(EngineKind::Fallback)
    }

    fn warning_count(&self) -> usize {
        self.outcome.warnings.len()
    }
}

/// OCR command line arguments.
#[derive(Debug, Args)]
pub struct OcrOpts {
    /// Input file, in JSONL or CSV format, with `id` and `path` fields, and
    /// an optional `mime_type`. Defaults to standard input.
    pub input_path: Option<PathBuf>,

    /// Output file, in JSONL format. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Use the fallback engine when the primary engine's confidence is below
    /// this. Overrides OCR_CONFIDENCE_THRESHOLD.
    #[clap(long)]
    pub confidence_threshold: Option<f64>,

    /// Attempts per engine call, including the first. Overrides
    /// OCR_MAX_ATTEMPTS.
    #[clap(long)]
    pub max_attempts: Option<u32>,

    /// Time limit for each engine call, including retries, in seconds.
    /// Overrides OCR_TOTAL_TIMEOUT_SECONDS.
    #[clap(long)]
    pub total_timeout: Option<f64>,

    /// Limit requests to Azure, e.g. "10/s" or "300/m". Overrides
    /// AZURE_DI_RATE_LIMIT.
    #[clap(long)]
    pub azure_rate_limit: Option<RateLimit>,

    /// Only use tesseract. Overrides OFFLINE_MODE.
    #[clap(long)]
    pub offline: bool,

    #[clap(flatten)]
    pub preprocess: PreprocessOptions,

    #[clap(flatten)]
    pub stream_opts: StreamOpts,
}

impl OcrOpts {
    /// Apply command-line overrides on top of the environment.
    fn apply_overrides(&self, config: &mut OcrConfig) -> Result<()> {
        if let Some(threshold) = self.confidence_threshold {
            config.confidence_threshold = threshold;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.retry.max_attempts = max_attempts;
        }
        if let Some(secs) = self.total_timeout {
            config.retry.total_timeout = Duration::try_from_secs_f64(secs)
                .with_context(|| format!("invalid --total-timeout {}", secs))?;
        }
        if let Some(rate_limit) = &self.azure_rate_limit {
            config.azure.rate_limit = Some(rate_limit.clone());
        }
        if self.offline {
            config.offline = true;
        }
        config.validate()
    }
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(ui: Ui, opts: &OcrOpts) -> Result<()> {
    let mut config = OcrConfig::from_env()?;
    opts.apply_overrides(&mut config)?;
    debug!(?config, "loaded configuration");
    let config = Arc::new(config);

    let primary = Arc::new(AzureReadEngine::new(config.azure.clone())?);
    let fallback = Arc::new(TesseractEngine::new(config.tesseract.clone()));
    let preprocessor = Preprocessor::new(
        opts.preprocess.clone(),
        Arc::new(PopplerRasterizer),
        config.debug_image_dir().map(Path::to_owned),
    );
    let orchestrator = Orchestrator::new(config, preprocessor, primary, fallback);

    let input = WorkInput::<OcrInput>::read_stream(&ui, opts.input_path.as_deref()).await?;
    let input = opts.stream_opts.apply_stream_input_opts(input);

    let pb = ui.new_from_size_hint(
        &ProgressConfig {
            emoji: "📄",
            msg: "OCRing documents",
            done_msg: "OCRed documents",
        },
        input.size_hint(),
    );

    let output = input
        .map(move |input| {
            let orchestrator = orchestrator.clone();
            async move { Ok(ocr_one(&orchestrator, input?).await) }.boxed()
        })
        .buffered(opts.stream_opts.job_count.max(1));
    let output = pb.wrap_stream(output).boxed();

    WorkOutput::write_stream(&ui, opts.output_path.as_deref(), output, &opts.stream_opts).await
}

/// OCR a single input record.
#[instrument(level = "info", skip_all, fields(id = %input.id, path = %input.data.path.display()))]
async fn ocr_one(orchestrator: &Orchestrator, input: WorkInput<OcrInput>) -> WorkOutput<OcrOutput> {
    let WorkInput { id, data } = input;
    let outcome = orchestrator
        .run_path(&data.path, data.declared_mime_type())
        .await;
    WorkOutput {
        id,
        data: OcrOutput {
            path: data.path,
            outcome,
        },
    }
}
