use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod config;
mod cpu_limit;
mod diagnostics;
mod document;
mod engines;
mod messages;
mod orchestrator;
mod prelude;
mod preprocess;
mod rate_limit;
mod retry;
mod ui;
mod work;

/// OCR scanned documents, with a cloud engine, a local fallback, and
/// bilingual diagnostics for every stage.
#[derive(Debug, Parser)]
#[clap(
    version,
    after_help = r#"
Environment Variables:
  - AZURE_DI_ENDPOINT: Azure Document Intelligence endpoint.
  - AZURE_DI_API_KEY: Azure Document Intelligence key.
  - AZURE_DI_API_VERSION, AZURE_DI_MODEL (optional): API version and model.
  - OCR_CONFIDENCE_THRESHOLD (optional): Fallback below this (0.75).
  - OCR_MAX_ATTEMPTS, OCR_RETRY_BASE_DELAY_MS, OCR_RETRY_MAX_DELAY_MS,
    OCR_TOTAL_TIMEOUT_SECONDS (optional): Retry behavior.
  - TESSERACT_CMD, TESSERACT_LANGS (optional): Fallback engine settings.
  - OFFLINE_MODE (optional): Never call Azure.
  - DEBUG_OCR, DEBUG_OCR_DIR (optional): Include technical details in
    output, and save prepared page images.

  Without Azure credentials, every document uses tesseract. PDFs need
  Poppler's `pdfinfo` and `pdftocairo` on the PATH.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// OCR PDFs and photos. The input file should have `id` and `path` fields.
    Ocr(cmd::ocr::OcrOpts),
    /// Print schemas for input and output records.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we writing results to stdout?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Ocr(opts) => opts.output_path.is_none(),
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Set up logging, then hand off to [`real_main`].
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    let directive = Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();
    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.stderr_writer())
        .with_filter(env_filter);
    tracing_subscriber::registry().with(subscriber).init();

    real_main(ui).await
}

#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // A missing `.env` file is fine.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    match &opts.subcmd {
        Cmd::Ocr(opts) => cmd::ocr::cmd_ocr(ui, opts).await,
        Cmd::Schema(opts) => cmd::schema::cmd_schema(opts).await,
    }
}
