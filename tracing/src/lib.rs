//! Logging for the cvmfs binaries. Events go to stderr, either compact or
//! as JSON, and spans carrying `indicatif.pb_show` get a progress bar.
use indicatif::ProgressStyle;
use lazy_static::lazy_static;
use tracing::Level;
use tracing_indicatif::{filter::IndicatifFilter, writer, IndicatifLayer, IndicatifWriter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

lazy_static! {
    /// Walking the catalogs of one repository. How many there are is only
    /// known at the end, so this counts up.
    pub static ref PB_WALK_STYLE: ProgressStyle = ProgressStyle::with_template(
        "{span_child_prefix}{spinner} {wide_msg} {pos:>6} catalogs ({elapsed})"
    )
    .expect("invalid walk progress template");

    /// A batch of repositories.
    pub static ref PB_BATCH_STYLE: ProgressStyle = ProgressStyle::with_template(
        "{span_child_prefix}{wide_msg} {bar:20} {pos:>3}/{len:3} repositories ({elapsed})"
    )
    .expect("invalid batch progress template");
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Init(#[from] tracing_subscriber::util::TryInitError),

    #[error("invalid RUST_LOG: {0}")]
    Filter(#[from] tracing_subscriber::filter::FromEnvError),
}

/// How events are rendered on stderr.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            LogFormat::Json
        } else {
            LogFormat::Compact
        }
    }
}

/// Returned by [TracingBuilder::build].
#[derive(Clone)]
pub struct Logging {
    stdout: IndicatifWriter<writer::Stdout>,
}

impl Logging {
    /// A stdout writer that doesn't tear through the progress bars. Results
    /// printed by the binaries go through here.
    pub fn stdout(&self) -> IndicatifWriter<writer::Stdout> {
        self.stdout.clone()
    }
}

pub struct TracingBuilder {
    level: Level,
    format: LogFormat,
    progress: bool,
}

impl TracingBuilder {
    /// `level` applies unless RUST_LOG says otherwise. INFO if unset.
    pub fn new(level: Option<Level>) -> Self {
        Self {
            level: level.unwrap_or(Level::INFO),
            format: LogFormat::default(),
            progress: false,
        }
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Draw progress bars for the walk and the batch. Off by default, the
    /// bridge never wants them.
    pub fn progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Installs the global subscriber. Fails if one is installed already.
    pub fn build(self) -> Result<Logging, Error> {
        let indicatif_layer = IndicatifLayer::new().with_progress_style(PB_WALK_STYLE.clone());
        let stdout = indicatif_layer.get_stdout_writer();

        let events = tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer());
        let events = match self.format {
            LogFormat::Compact => events.compact().boxed(),
            LogFormat::Json => events.json().boxed(),
        };

        let filter = EnvFilter::builder()
            .with_default_directive(self.level.into())
            .from_env()?;

        tracing_subscriber::registry()
            .with(filter)
            .with(events)
            .with(
                self.progress
                    .then(|| indicatif_layer.with_filter(IndicatifFilter::new(false))),
            )
            .try_init()?;

        Ok(Logging { stdout })
    }
}

/// Returns a reqwest middleware recording a span (including the URL) per
/// outgoing request.
#[cfg(feature = "reqwest")]
pub fn http_middleware() -> reqwest_tracing::TracingMiddleware<reqwest_tracing::SpanBackendWithUrl>
{
    reqwest_tracing::TracingMiddleware::<reqwest_tracing::SpanBackendWithUrl>::new()
}

#[cfg(test)]
mod tests {
    use super::{LogFormat, TracingBuilder, PB_BATCH_STYLE, PB_WALK_STYLE};

    #[test]
    fn progress_templates_parse() {
        lazy_static::initialize(&PB_WALK_STYLE);
        lazy_static::initialize(&PB_BATCH_STYLE);
    }

    #[test]
    fn json_flag() {
        assert_eq!(LogFormat::Json, LogFormat::from_json_flag(true));
        assert_eq!(LogFormat::Compact, LogFormat::from_json_flag(false));
    }

    #[test]
    fn defaults_to_info() {
        let builder = TracingBuilder::new(None);
        assert_eq!(tracing::Level::INFO, builder.level);
        assert!(!builder.progress);
    }
}
