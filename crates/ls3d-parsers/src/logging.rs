//! Logging and tracing utilities for the ls3d codec
//!
//! Subscriber setup for binaries and tests, plus the timing span wrapped
//! around every decode. Library code only emits `tracing` events.

use std::sync::atomic::{AtomicBool, Ordering};

/// Whether tracing has been initialized
static TRACING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "warn,ls3d=info";

/// Initialize the default tracing subscriber
///
/// This should be called once at application startup. Multiple calls are safe
/// and will be ignored.
pub fn init_default() {
    #[cfg(feature = "tracing")]
    init_with_config(TracingConfig::default());
}

/// Initialize tracing with a custom configuration
#[cfg(feature = "tracing")]
pub fn init_with_config(config: TracingConfig) {
    if TRACING_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
        .is_ok()
    {
        use tracing_subscriber::{fmt, prelude::*, EnvFilter};

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.default_level));

        let fmt_layer = fmt::layer()
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_file(config.show_file)
            .with_line_number(config.show_line_number);

        // A host may already have installed a global subscriber.
        let _ = tracing_subscriber::registry()
            .with(fmt_layer)
            .with(filter)
            .try_init();
    }
}

/// Configuration for tracing initialization
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default log level filter (e.g., "info", "debug", "warn")
    pub default_level: String,
    /// Show the target (module path) in log output
    pub show_target: bool,
    /// Show thread IDs in log output
    pub show_thread_ids: bool,
    /// Show source file in log output
    pub show_file: bool,
    /// Show line number in log output
    pub show_line_number: bool,
}

impl TracingConfig {
    /// Config matching a `-v` count: 0 = warn, 1 = info, 2 = debug, 3+ = trace
    pub fn from_verbosity(verbosity: u8) -> Self {
        let default_level = match verbosity {
            0 => DEFAULT_FILTER.to_string(),
            1 => "info".to_string(),
            2 => "debug".to_string(),
            _ => "trace".to_string(),
        };
        Self {
            default_level,
            show_target: verbosity >= 2,
            show_thread_ids: verbosity >= 3,
            show_file: verbosity >= 3,
            show_line_number: verbosity >= 3,
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_level: DEFAULT_FILTER.to_string(),
            show_target: true,
            show_thread_ids: false,
            show_file: false,
            show_line_number: false,
        }
    }
}

/// Start of a file decode, with the path being read
#[macro_export]
macro_rules! log_parse_start {
    ($parser:expr, $path:expr) => {
        tracing::info!(
            parser = %$parser,
            path = %$path.display(),
            "Decoding model"
        );
    };
}

/// End of a file decode, with elapsed time and decoded frame count
#[macro_export]
macro_rules! log_parse_complete {
    ($parser:expr, $duration:expr, $frames:expr) => {
        tracing::info!(
            parser = %$parser,
            duration_ms = %$duration.as_millis(),
            frames = %$frames,
            "Model decoded"
        );
    };
}

/// Fatal decode error
#[macro_export]
macro_rules! log_parse_error {
    ($parser:expr, $error:expr) => {
        tracing::error!(
            parser = %$parser,
            error = %$error,
            "Decode failed"
        );
    };
}

/// Instrument a parsing operation with timing
#[cfg(feature = "tracing")]
pub fn instrument_parse<T, F>(name: &str, f: F) -> T
where
    F: FnOnce() -> T,
{
    let span = tracing::info_span!("parse", parser = %name);
    let _guard = span.enter();

    let start = std::time::Instant::now();
    let result = f();
    let duration = start.elapsed();

    tracing::debug!(duration_ms = %duration.as_millis(), "Parse operation complete");

    result
}

#[cfg(not(feature = "tracing"))]
pub fn instrument_parse<T, F>(_name: &str, f: F) -> T
where
    F: FnOnce() -> T,
{
    f()
}

/// Debug event every 100 frames and on the last one
#[cfg(feature = "tracing")]
pub fn log_progress(current: usize, total: usize) {
    if total == 0 {
        return;
    }
    if current % 100 == 0 || current == total {
        let percent = (current as f64 / total as f64 * 100.0) as u32;
        tracing::debug!(current = %current, total = %total, percent = %percent, "Progress");
    }
}

#[cfg(not(feature = "tracing"))]
pub fn log_progress(_current: usize, _total: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_config_default() {
        let config = TracingConfig::default();
        assert!(config.default_level.contains("info"));
        assert!(config.show_target);
        assert!(!config.show_thread_ids);
    }

    #[test]
    fn test_tracing_config_verbosity() {
        assert_eq!(TracingConfig::from_verbosity(0).default_level, DEFAULT_FILTER);
        assert_eq!(TracingConfig::from_verbosity(2).default_level, "debug");
        assert!(TracingConfig::from_verbosity(3).show_line_number);
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_default();
        init_default();
        assert!(TRACING_INITIALIZED.load(Ordering::SeqCst));
    }

    #[test]
    fn test_parse_log_macros() {
        let path = std::path::Path::new("models/box.4ds");
        crate::log_parse_start!("4DS", path);
        crate::log_parse_complete!("4DS", std::time::Duration::from_millis(3), 7usize);
        crate::log_parse_error!("4DS", crate::ParseError::StringTooLong { length: 300 });
    }

    #[test]
    fn test_instrument_parse() {
        let result = instrument_parse("test", || 42);
        assert_eq!(result, 42);
    }
}
