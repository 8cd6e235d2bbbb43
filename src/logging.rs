//! Subscriber setup shared by the binaries.
//!
//! Output goes through one `fmt` layer filtered twice: by `RUST_LOG` (or the
//! configured default directive) and by a [`LogFilter`] predicate that keeps
//! noisy HTTP transport targets quiet below a threshold.

use tracing::{Level, Metadata};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::error::{Error, Result};

/// Targets quieted by [`LogFilter::default`].
pub const NOISY_TARGETS: &[&str] = &["hyper", "hyper_util", "h2", "rustls", "reqwest"];

/// Predicate deciding which events reach the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    quiet_targets: Vec<String>,
    quiet_level: Level,
}

impl Default for LogFilter {
    fn default() -> Self {
        Self::new(NOISY_TARGETS.iter().copied(), Level::ERROR)
    }
}

impl LogFilter {
    /// Events from targets under any prefix in `quiet_targets` pass only at
    /// `quiet_level` or more severe.
    pub fn new<I, S>(quiet_targets: I, quiet_level: Level) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            quiet_targets: quiet_targets.into_iter().map(Into::into).collect(),
            quiet_level,
        }
    }

    /// Lets everything through.
    pub fn permissive() -> Self {
        Self::new(Vec::<String>::new(), Level::TRACE)
    }

    pub fn allows(&self, meta: &Metadata<'_>) -> bool {
        self.allows_target(meta.target(), *meta.level())
    }

    pub fn allows_target(&self, target: &str, level: Level) -> bool {
        let quiet = self.quiet_targets.iter().any(|prefix| {
            target == prefix
                || target
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with("::"))
        });
        !quiet || level <= self.quiet_level
    }
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directive used when `RUST_LOG` is unset or invalid.
    pub default_directive: String,
    pub filter: LogFilter,
    pub ansi: bool,
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_directive: "info".to_string(),
            filter: LogFilter::default(),
            ansi: true,
            with_target: false,
        }
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init(config: &LogConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let predicate = config.filter.clone();
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(config.ansi)
        .with_target(config.with_target)
        .with_writer(std::io::stderr)
        .with_filter(env_filter)
        .with_filter(filter_fn(move |meta| predicate.allows(meta)));

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {}", e)))
}
