//! Configuration, read once from the environment at startup.
//!
//! Everything here is immutable once built. Each OCR run gets an
//! `Arc<OcrConfig>` and nothing else that is shared.

use std::{env, fmt, str::FromStr, time::Duration};

use crate::{prelude::*, rate_limit::RateLimit, retry::RetryPolicy};

/// The default confidence threshold below which we try the fallback engine.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.75;

/// No timeout, delay or poll wait may be longer than this.
pub const MAX_SETTING_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// The largest factor we'll grow the Azure poll wait by.
pub const MAX_POLL_BACKOFF: f64 = 10.0;

/// Everything needed to run the OCR pipeline.
#[derive(Clone, Debug)]
pub struct OcrConfig {
    /// Primary results below this confidence trigger the fallback engine.
    pub confidence_threshold: f64,

    /// Include technical details in stage records, and save debug images.
    pub debug: bool,

    /// Where to save debug images, if `debug` is set.
    pub debug_dir: Option<PathBuf>,

    /// Never call the primary engine. Every document goes to tesseract.
    pub offline: bool,

    /// How we retry each engine call.
    pub retry: RetryPolicy,

    /// Azure Document Intelligence settings.
    pub azure: AzureSettings,

    /// Tesseract settings.
    pub tesseract: TesseractSettings,
}

impl OcrConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration using `lookup` to find variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars { lookup: &lookup };

        let confidence_threshold = vars
            .parse("OCR_CONFIDENCE_THRESHOLD")?
            .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD);
        let debug = vars.flag("DEBUG_OCR")?;
        let debug_dir = vars.get(&["DEBUG_OCR_DIR"]).map(PathBuf::from);
        let offline = vars.flag("OFFLINE_MODE")?;

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: vars.parse("OCR_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts),
            base_delay: vars
                .parse("OCR_RETRY_BASE_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: vars
                .parse("OCR_RETRY_MAX_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            total_timeout: vars
                .secs("OCR_TOTAL_TIMEOUT_SECONDS")?
                .unwrap_or(defaults.total_timeout),
        };

        let azure_defaults = AzureSettings::default();
        let azure = AzureSettings {
            endpoint: vars.get(&["AZURE_DI_ENDPOINT", "AZURE_DOCINTEL_ENDPOINT"]),
            api_key: vars.get(&["AZURE_DI_API_KEY", "AZURE_DOCINTEL_KEY", "AZURE_DI_KEY"]),
            api_version: vars
                .get(&["AZURE_DI_API_VERSION"])
                .unwrap_or(azure_defaults.api_version),
            model: vars.get(&["AZURE_DI_MODEL"]).unwrap_or(azure_defaults.model),
            poll_attempts: vars
                .parse("AZURE_DI_POLL_ATTEMPTS")?
                .unwrap_or(azure_defaults.poll_attempts),
            initial_poll_wait: vars
                .secs("AZURE_DI_INITIAL_POLL_WAIT")?
                .unwrap_or(azure_defaults.initial_poll_wait),
            max_poll_wait: vars
                .secs("AZURE_DI_MAX_POLL_WAIT")?
                .unwrap_or(azure_defaults.max_poll_wait),
            poll_backoff: vars
                .parse("AZURE_DI_POLL_BACKOFF")?
                .unwrap_or(azure_defaults.poll_backoff),
            http_timeout: vars
                .secs("HTTP_TIMEOUT_SECONDS")?
                .unwrap_or(azure_defaults.http_timeout),
            rate_limit: vars.parse("AZURE_DI_RATE_LIMIT")?,
        };

        let tesseract_defaults = TesseractSettings::default();
        let tesseract = TesseractSettings {
            command: vars
                .get(&["TESSERACT_CMD"])
                .unwrap_or(tesseract_defaults.command),
            languages: vars
                .get(&["TESSERACT_LANGS"])
                .unwrap_or(tesseract_defaults.languages),
        };

        let config = Self {
            confidence_threshold,
            debug,
            debug_dir,
            offline,
            retry,
            azure,
            tesseract,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that our values make sense together.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(anyhow!(
                "confidence threshold must be between 0.0 and 1.0, got {}",
                self.confidence_threshold
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("OCR_MAX_ATTEMPTS must be at least 1"));
        }
        if self.retry.total_timeout.is_zero() {
            return Err(anyhow!("OCR_TOTAL_TIMEOUT_SECONDS must be positive"));
        }
        // Written as `contains` so that NaN is rejected too.
        if !(1.0..=MAX_POLL_BACKOFF).contains(&self.azure.poll_backoff) {
            return Err(anyhow!(
                "AZURE_DI_POLL_BACKOFF must be between 1.0 and {}, got {}",
                MAX_POLL_BACKOFF,
                self.azure.poll_backoff
            ));
        }
        let durations = [
            ("OCR_RETRY_BASE_DELAY_MS", self.retry.base_delay),
            ("OCR_RETRY_MAX_DELAY_MS", self.retry.max_delay),
            ("OCR_TOTAL_TIMEOUT_SECONDS", self.retry.total_timeout),
            ("AZURE_DI_INITIAL_POLL_WAIT", self.azure.initial_poll_wait),
            ("AZURE_DI_MAX_POLL_WAIT", self.azure.max_poll_wait),
            ("HTTP_TIMEOUT_SECONDS", self.azure.http_timeout),
        ];
        for (name, duration) in durations {
            if duration > MAX_SETTING_DURATION {
                return Err(anyhow!(
                    "{} must be at most {:?}, got {:?}",
                    name,
                    MAX_SETTING_DURATION,
                    duration
                ));
            }
        }
        Ok(())
    }

    /// Should we save debug images, and where?
    pub fn debug_image_dir(&self) -> Option<&Path> {
        if self.debug {
            self.debug_dir.as_deref()
        } else {
            None
        }
    }
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            debug: false,
            debug_dir: None,
            offline: false,
            retry: RetryPolicy::default(),
            azure: AzureSettings::default(),
            tesseract: TesseractSettings::default(),
        }
    }
}

/// Azure Document Intelligence settings.
#[derive(Clone)]
pub struct AzureSettings {
    /// The resource endpoint, e.g. `https://example.cognitiveservices.azure.com`.
    pub endpoint: Option<String>,
    /// The subscription key.
    pub api_key: Option<String>,
    /// The API version to request.
    pub api_version: String,
    /// The model to use.
    pub model: String,
    /// How many times we poll for a result before giving up.
    pub poll_attempts: u32,
    /// How long to wait before the first poll.
    pub initial_poll_wait: Duration,
    /// The longest we'll wait between polls.
    pub max_poll_wait: Duration,
    /// Multiply the poll wait by this after each poll.
    pub poll_backoff: f64,
    /// Timeout for each individual HTTP request.
    pub http_timeout: Duration,
    /// Optional client-side rate limit.
    pub rate_limit: Option<RateLimit>,
}

impl Default for AzureSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            api_version: "2024-11-30".to_owned(),
            model: "prebuilt-read".to_owned(),
            poll_attempts: 15,
            initial_poll_wait: Duration::from_secs(1),
            max_poll_wait: Duration::from_secs(2),
            poll_backoff: 1.5,
            http_timeout: Duration::from_secs(30),
            rate_limit: None,
        }
    }
}

// Hand-written so the key never ends up in logs.
impl fmt::Debug for AzureSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureSettings")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_version", &self.api_version)
            .field("model", &self.model)
            .field("poll_attempts", &self.poll_attempts)
            .field("initial_poll_wait", &self.initial_poll_wait)
            .field("max_poll_wait", &self.max_poll_wait)
            .field("poll_backoff", &self.poll_backoff)
            .field("http_timeout", &self.http_timeout)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

/// Settings for the `tesseract` CLI.
#[derive(Clone, Debug)]
pub struct TesseractSettings {
    /// The command to run.
    pub command: String,
    /// Languages to pass to `-l`.
    pub languages: String,
}

impl Default for TesseractSettings {
    fn default() -> Self {
        Self {
            command: "tesseract".to_owned(),
            languages: "eng+spa".to_owned(),
        }
    }
}

/// Helper for reading variables through a lookup function.
struct Vars<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Vars<'_> {
    /// Get the first non-blank value among `names`.
    fn get(&self, names: &[&str]) -> Option<String> {
        names
            .iter()
            .filter_map(|name| (self.lookup)(name))
            .map(|value| value.trim().to_owned())
            .find(|value| !value.is_empty())
    }

    /// Parse a variable, if it is set.
    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(&[name]) {
            None => Ok(None),
            Some(value) => value
                .parse::<T>()
                .map(Some)
                .map_err(|err| anyhow!("invalid value {:?} for {}: {}", value, name, err)),
        }
    }

    /// Parse a duration given in (possibly fractional) seconds.
    fn secs(&self, name: &str) -> Result<Option<Duration>> {
        self.parse::<f64>(name)?
            .map(|secs| {
                Duration::try_from_secs_f64(secs).map_err(|err| {
                    anyhow!("invalid duration {} for {}: {}", secs, name, err)
                })
            })
            .transpose()
    }

    /// Parse a boolean flag. Unset means `false`.
    fn flag(&self, name: &str) -> Result<bool> {
        match self.get(&[name]).map(|v| v.to_ascii_lowercase()).as_deref() {
            None | Some("0" | "false" | "no" | "off") => Ok(false),
            Some("1" | "true" | "yes" | "on") => Ok(true),
            Some(other) => Err(anyhow!("invalid value {:?} for {}", other, name)),
        }
    }
}
