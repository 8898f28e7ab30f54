//! Turning [`Document`]s into images an OCR engine can read.
//!
//! PDFs are rasterized one page at a time. Rendered pages and photos alike
//! then go through [`enhance::enhance_photo`]. We produce a stream of
//! [`PreparedImage`]s in page order, with per-page errors kept separate so one
//! bad page doesn't sink the rest of the document.

use std::{
    error, fmt,
    hash::{DefaultHasher, Hash as _, Hasher as _},
    sync::Arc,
    time::Duration,
};

use clap::Args;
use futures::{FutureExt as _, StreamExt as _, stream};
use schemars::JsonSchema;
use tokio::time::Instant;

use crate::{
    async_utils::{BoxedStream, spawn_blocking_propagating_panics},
    diagnostics::StageName,
    document::Document,
    messages::MessageCause,
    prelude::*,
};

use self::{
    enhance::{Enhancement, EnhancedImage},
    rasterize::PdfRasterizer,
};

pub mod enhance;
pub mod rasterize;

/// Options for preparing pages.
#[derive(Args, Clone, Debug)]
pub struct PreprocessOptions {
    /// The DPI to use when rasterizing PDFs.
    #[clap(long, default_value = "300")]
    pub rasterize_dpi: u32,

    /// The maximum number of pages to process per document. Later pages are
    /// skipped and a warning is added to the output.
    #[clap(long)]
    pub max_pages: Option<usize>,

    /// How many pages of a single document to prepare at once. Defaults to
    /// the number of CPUs.
    #[clap(long)]
    pub page_workers: Option<usize>,

    /// Don't try to clean up photos before OCR.
    #[clap(long, default_value = "false")]
    pub no_enhance: bool,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            rasterize_dpi: 300,
            max_pages: None,
            page_workers: None,
            no_enhance: false,
        }
    }
}

impl PreprocessOptions {
    /// How many pages we prepare concurrently.
    fn worker_count(&self) -> usize {
        self.page_workers.unwrap_or_else(num_cpus::get).max(1)
    }
}

/// Where did an image come from?
#[derive(Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    /// A rasterized PDF page.
    PdfPage,
    /// An uploaded photo or scan.
    Photo,
}

/// How long we spent on each part of preparing a page.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PageTimings {
    /// Time spent rasterizing, for PDF pages.
    pub rasterize: Duration,
    /// Time spent decoding, enhancing and encoding.
    pub enhance: Duration,
}

/// One normalized page, ready for OCR.
#[derive(Clone)]
pub struct PreparedImage {
    /// Zero-based page index within the document.
    pub page_idx: usize,

    /// Where this image came from.
    pub source: ImageSource,

    /// Width in pixels.
    pub width: u32,

    /// Height in pixels.
    pub height: u32,

    /// Resolution, if known. Photos don't have a meaningful DPI.
    pub dpi: Option<u32>,

    /// Enhancement steps that were applied, in order.
    pub enhancements: Vec<Enhancement>,

    /// Enhancement steps that failed and were left out.
    pub skipped_enhancements: Vec<Enhancement>,

    /// PNG-encoded image data.
    pub png: Arc<[u8]>,

    /// Timing information.
    pub timings: PageTimings,
}

impl PreparedImage {
    fn from_enhanced(
        page_idx: usize,
        source: ImageSource,
        dpi: Option<u32>,
        enhanced: EnhancedImage,
        timings: PageTimings,
    ) -> Self {
        let EnhancedImage {
            png,
            width,
            height,
            applied,
            skipped,
        } = enhanced;
        Self {
            page_idx,
            source,
            width,
            height,
            dpi,
            enhancements: applied,
            skipped_enhancements: skipped,
            png: png.into(),
            timings,
        }
    }
}

impl fmt::Debug for PreparedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedImage")
            .field("page_idx", &self.page_idx)
            .field("source", &self.source)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("dpi", &self.dpi)
            .field("enhancements", &self.enhancements)
            .field("skipped_enhancements", &self.skipped_enhancements)
            .field("png_len", &self.png.len())
            .finish()
    }
}

/// A page (or a whole document) could not be prepared.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreprocessError {
    /// The stage where this happened.
    pub stage: StageName,

    /// The page, if this error only affects one page.
    pub page_idx: Option<usize>,

    /// What to tell the user.
    pub cause: MessageCause,

    /// Technical details.
    pub message: String,
}

impl PreprocessError {
    /// An error affecting a single page.
    pub fn page(
        stage: StageName,
        page_idx: usize,
        cause: MessageCause,
        message: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            page_idx: Some(page_idx),
            cause,
            message: message.into(),
        }
    }

    /// An error affecting the whole document.
    pub fn document(stage: StageName, cause: MessageCause, message: impl Into<String>) -> Self {
        Self {
            stage,
            page_idx: None,
            cause,
            message: message.into(),
        }
    }
}

impl fmt::Display for PreprocessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.page_idx {
            Some(idx) => write!(f, "{} failed on page {}: {}", self.stage, idx + 1, self.message),
            None => write!(f, "{} failed: {}", self.stage, self.message),
        }
    }
}

impl error::Error for PreprocessError {}

/// The result of [`Preprocessor::prepare`].
pub struct PreparedPages {
    /// What kind of document this was.
    pub source: ImageSource,

    /// How many pages the document has.
    pub total_pages: usize,

    /// How many pages we'll actually produce, after applying `max_pages`.
    pub selected_pages: usize,

    /// One item per selected page, in page order.
    pub pages: BoxedStream<Result<PreparedImage, PreprocessError>>,
}

impl PreparedPages {
    /// Did we leave pages out because of `max_pages`?
    pub fn hit_page_limit(&self) -> bool {
        self.selected_pages < self.total_pages
    }
}

/// Prepares documents for OCR.
#[derive(Clone)]
pub struct Preprocessor {
    options: PreprocessOptions,
    rasterizer: Arc<dyn PdfRasterizer>,
    debug_dir: Option<PathBuf>,
}

impl Preprocessor {
    /// Create a new preprocessor. If `debug_dir` is set, every prepared page
    /// is also written there.
    pub fn new(
        options: PreprocessOptions,
        rasterizer: Arc<dyn PdfRasterizer>,
        debug_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            options,
            rasterizer,
            debug_dir,
        }
    }

    /// Start preparing `document`.
    ///
    /// Errors returned here affect the whole document. Per-page errors
    /// appear in the returned stream. Each call starts from the first page.
    #[instrument(level = "debug", skip_all, fields(document = %document.label))]
    pub async fn prepare(&self, document: &Document) -> Result<PreparedPages, PreprocessError> {
        if document.is_pdf() {
            self.prepare_pdf(document).await
        } else {
            Ok(self.prepare_photo(document))
        }
    }

    /// Rasterize each PDF page.
    async fn prepare_pdf(&self, document: &Document) -> Result<PreparedPages, PreprocessError> {
        let pdf_error = |message: String| {
            PreprocessError::document(StageName::PdfToImage, MessageCause::PdfUnreadable, message)
        };

        // Poppler wants a real file.
        let pdf = write_temp_pdf(&document.bytes)
            .await
            .map_err(|err| pdf_error(format!("{err:?}")))?;
        let pdf = Arc::new(pdf);

        let total_pages = self
            .rasterizer
            .page_count(pdf.path())
            .await
            .map_err(|err| pdf_error(format!("{err:?}")))?;
        if total_pages == 0 {
            return Err(pdf_error("PDF has no pages".to_owned()));
        }
        let selected_pages = self
            .options
            .max_pages
            .map_or(total_pages, |max| total_pages.min(max));
        if selected_pages < total_pages {
            warn!(total_pages, selected_pages, "only processing the first pages of the PDF");
        }

        let dpi = self.options.rasterize_dpi;
        let enhance = !self.options.no_enhance;
        let rasterizer = self.rasterizer.clone();
        let debug_dir = self.debug_dir.clone();
        let debug_name = debug_name(document);
        let pages = stream::iter(0..selected_pages)
            .map(move |page_idx| {
                let rasterizer = rasterizer.clone();
                let pdf = pdf.clone();
                let debug_dir = debug_dir.clone();
                let debug_name = debug_name.clone();
                async move {
                    let page_error = |err: anyhow::Error| {
                        PreprocessError::page(
                            StageName::PdfToImage,
                            page_idx,
                            MessageCause::PagesSkipped,
                            format!("{err:?}"),
                        )
                    };
                    let started = Instant::now();
                    let png = rasterizer
                        .rasterize_page(pdf.path(), page_idx, dpi)
                        .await
                        .map_err(page_error)?;
                    let rasterize = started.elapsed();

                    // Scanned PDFs are just photos in a wrapper, so they get
                    // the same clean-up.
                    let started = Instant::now();
                    let enhanced = spawn_blocking_propagating_panics(move || {
                        enhance::prepare_image_sync(&png, enhance)
                    })
                    .await
                    .map_err(page_error)?;
                    let image = PreparedImage::from_enhanced(
                        page_idx,
                        ImageSource::PdfPage,
                        Some(dpi),
                        enhanced,
                        PageTimings {
                            rasterize,
                            enhance: started.elapsed(),
                        },
                    );
                    save_debug_image(debug_dir.as_deref(), &debug_name, &image).await;
                    Ok(image)
                }
                .boxed()
            })
            .buffered(self.options.worker_count())
            .boxed();

        Ok(PreparedPages {
            source: ImageSource::PdfPage,
            total_pages,
            selected_pages,
            pages,
        })
    }

    /// Decode and enhance a single photo.
    fn prepare_photo(&self, document: &Document) -> PreparedPages {
        let bytes = document.bytes.clone();
        let enhance = !self.options.no_enhance;
        let debug_dir = self.debug_dir.clone();
        let debug_name = debug_name(document);
        let page = async move {
            let started = Instant::now();
            let enhanced = spawn_blocking_propagating_panics(move || {
                enhance::prepare_image_sync(&bytes, enhance)
            })
            .await
            .map_err(|err| {
                PreprocessError::page(
                    StageName::Preprocess,
                    0,
                    MessageCause::ImageUnreadable,
                    format!("{err:?}"),
                )
            })?;
            let image = PreparedImage::from_enhanced(
                0,
                ImageSource::Photo,
                None,
                enhanced,
                PageTimings {
                    rasterize: Duration::ZERO,
                    enhance: started.elapsed(),
                },
            );
            save_debug_image(debug_dir.as_deref(), &debug_name, &image).await;
            Ok(image)
        };
        PreparedPages {
            source: ImageSource::Photo,
            total_pages: 1,
            selected_pages: 1,
            pages: stream::once(page).boxed(),
        }
    }
}

/// Write PDF bytes to a temporary file.
async fn write_temp_pdf(bytes: &Arc<[u8]>) -> Result<tempfile::NamedTempFile> {
    let bytes = bytes.clone();
    spawn_blocking_propagating_panics(move || -> Result<_> {
        let mut file = tempfile::Builder::new()
            .prefix("upload")
            .suffix(".pdf")
            .tempfile()
            .context("cannot create temporary PDF")?;
        std::io::Write::write_all(&mut file, &bytes).context("cannot write temporary PDF")?;
        Ok(file)
    })
    .await
}

/// A file name prefix for `document`'s debug images. The label alone isn't
/// unique, because a batch may contain `a/scan.pdf` and `b/scan.pdf`, so we
/// add a short hash of the contents.
fn debug_name(document: &Document) -> String {
    let mut hasher = DefaultHasher::new();
    document.bytes.hash(&mut hasher);
    format!("{}-{:08x}", document.label, hasher.finish() as u32)
}

/// Save a copy of `image` for debugging. Failures are logged and ignored.
async fn save_debug_image(debug_dir: Option<&Path>, debug_name: &str, image: &PreparedImage) {
    let Some(debug_dir) = debug_dir else {
        return;
    };
    let path = debug_dir.join(format!("{}-page-{}.png", debug_name, image.page_idx + 1));
    let result = async {
        tokio::fs::create_dir_all(debug_dir)
            .await
            .with_context(|| format!("cannot create {}", debug_dir.display()))?;
        tokio::fs::write(&path, &image.png)
            .await
            .with_context(|| format!("cannot write {}", path.display()))
    }
    .await;
    match result {
        Ok(()) => debug!(path = %path.display(), "saved debug image"),
        Err(err) => warn!("could not save debug image: {:?}", err),
    }
}
