//! Structured logging setup.
//!
//! Configures a global `tracing` subscriber with:
//! - An `EnvFilter` built from the configured level
//! - A human-readable console layer
//! - A JSON file layer behind a non-blocking rolling writer
//!
//! Also provides the stack trace filter used when panics are recovered.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation as AppenderRotation};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{FileRotationConfig, LogConfig, Rotation, TimePrecision};
use crate::error::InitError;
use crate::provider::ShutdownFn;

/// Frame prefixes dropped from recovered panic stacks by default.
pub const DEFAULT_STACK_FILTERS: &[&str] = &[
    "std::",
    "core::",
    "alloc::",
    "<core::",
    "<alloc::",
    "<std::",
    "tokio::",
    "<tokio::",
    "futures_util::",
    "<futures_util::",
    "tower::",
    "<tower::",
    "hyper::",
    "test::",
    "<unknown>",
    "o11y::panic::",
    "rust_begin_unwind",
    "__rust",
];

/// Install the global subscriber described by `cfg`.
///
/// Never fails: an unusable file destination falls back to console output,
/// an invalid level falls back to `info`, and an already installed global
/// subscriber is left in place. The returned shutdown flushes the file
/// writer.
pub fn setup_logging(cfg: &LogConfig) -> ShutdownFn {
    let (filter, invalid_level) = match EnvFilter::try_new(&cfg.level) {
        Ok(filter) if !cfg.level.trim().is_empty() => (filter, false),
        _ => (EnvFilter::new("info"), true),
    };

    let mut file_error = None;
    let mut guard = None;
    let file_layer = if cfg.file {
        match file_writer(&cfg.rotation) {
            Ok((writer, worker_guard)) => {
                guard = Some(worker_guard);
                Some(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(writer)
                        .with_timer(UnixTime::new(cfg.time_precision))
                        .with_current_span(true)
                        .with_span_list(true)
                        .with_ansi(false)
                        .with_file(cfg.caller)
                        .with_line_number(cfg.caller),
                )
            }
            Err(e) => {
                file_error = Some(e);
                None
            }
        }
    } else {
        None
    };

    // Console is the fallback when no other writer is configured.
    let console_layer = (cfg.console || file_layer.is_none()).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_file(cfg.caller)
            .with_line_number(cfg.caller)
    });

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init();

    if let Err(e) = installed {
        tracing::debug!(error = %e, "Global subscriber already installed, keeping it");
    }
    if invalid_level {
        tracing::warn!(level = %cfg.level, "Invalid or empty log level, defaulting to info");
    }
    if let Some(e) = file_error {
        tracing::error!(error = %e, "Log file is enabled but unusable, disabling file logging");
    }

    ShutdownFn::new(move || {
        // Dropping the guard flushes buffered lines to the file.
        drop(guard);
        Ok(())
    })
}

/// Build the non-blocking rolling file writer for `cfg`.
pub fn file_writer(cfg: &FileRotationConfig) -> Result<(NonBlocking, WorkerGuard), InitError> {
    if cfg.file_name_prefix.is_empty() {
        return Err(InitError::setup(
            crate::error::Subsystem::Logging,
            anyhow::anyhow!("no log file name prefix configured"),
        ));
    }

    let rotation = match cfg.rotation {
        Rotation::Minutely => AppenderRotation::MINUTELY,
        Rotation::Hourly => AppenderRotation::HOURLY,
        Rotation::Daily => AppenderRotation::DAILY,
        Rotation::Never => AppenderRotation::NEVER,
    };

    let mut builder = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(cfg.file_name_prefix.clone())
        .filename_suffix("log");
    if let Some(max) = cfg.max_files {
        builder = builder.max_log_files(max);
    }

    let appender = builder.build(&cfg.directory)?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Unix timestamp formatter with a fixed precision.
#[derive(Debug, Clone, Copy)]
pub struct UnixTime {
    precision: TimePrecision,
}

impl UnixTime {
    pub fn new(precision: TimePrecision) -> Self {
        Self { precision }
    }

    fn render(self, since_epoch: std::time::Duration) -> String {
        match self.precision {
            TimePrecision::S => since_epoch.as_secs().to_string(),
            TimePrecision::Ms => since_epoch.as_millis().to_string(),
            TimePrecision::Us => since_epoch.as_micros().to_string(),
            TimePrecision::Ns => since_epoch.as_nanos().to_string(),
        }
    }
}

impl FormatTime for UnixTime {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        w.write_str(&self.render(since_epoch))
    }
}

/// Drop uninteresting frames from a rendered `std::backtrace::Backtrace`.
///
/// A frame is a `N: symbol` line followed by its `at file:line` lines. A
/// frame is dropped when its symbol starts with one of `ignore` or one of
/// its locations contains one. An empty `ignore` uses
/// [`DEFAULT_STACK_FILTERS`]. Input that does not look like a backtrace is
/// returned unchanged.
pub fn filter_stack_trace<S: AsRef<str>>(stack: &str, ignore: &[S]) -> String {
    let ignore: Vec<&str> = if ignore.is_empty() {
        DEFAULT_STACK_FILTERS.to_vec()
    } else {
        ignore.iter().map(AsRef::as_ref).collect()
    };

    let mut frames: Vec<Vec<&str>> = Vec::new();
    for line in stack.lines() {
        if frame_symbol(line).is_some() {
            frames.push(vec![line]);
        } else if let Some(frame) = frames.last_mut() {
            frame.push(line);
        } else {
            return stack.to_string();
        }
    }
    if frames.is_empty() {
        return stack.to_string();
    }

    let mut out = String::with_capacity(stack.len());
    for frame in frames {
        let symbol = frame_symbol(frame[0]).unwrap_or_default();
        let ignored = ignore.iter().any(|prefix| {
            symbol.starts_with(prefix)
                || frame[1..]
                    .iter()
                    .any(|loc| loc.trim_start().starts_with("at ") && loc.contains(prefix))
        });
        if !ignored {
            for line in frame {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    out
}

/// The symbol of a `   N: symbol` frame header line.
fn frame_symbol(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let (index, rest) = trimmed.split_once(':')?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(rest.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STACK: &str = "   0: std::backtrace::Backtrace::force_capture
             at /rustc/abc/library/std/src/backtrace.rs:312:13
   1: orders::checkout::charge
             at ./src/checkout.rs:42:9
   2: tokio::runtime::task::harness::poll_future
             at /cargo/registry/tokio/src/runtime/task/harness.rs:473:19
   3: orders::main
             at ./src/main.rs:10:5
";

    #[test]
    fn test_filter_stack_trace_drops_default_frames() {
        let filtered = filter_stack_trace::<&str>(STACK, &[]);
        assert!(filtered.contains("orders::checkout::charge"));
        assert!(filtered.contains("./src/checkout.rs:42:9"));
        assert!(filtered.contains("orders::main"));
        assert!(!filtered.contains("force_capture"));
        assert!(!filtered.contains("poll_future"));
    }

    #[test]
    fn test_filter_stack_trace_drops_hook_and_harness_frames() {
        let stack = "   0: o11y::panic::install_hook::{{closure}}
             at ./src/panic.rs:27:28
   1: orders::checkout::charge
             at ./src/checkout.rs:42:9
   2: test::run_test::{{closure}}
             at /rustc/abc/library/test/src/lib.rs:648:41
   3: <unknown>
";
        let filtered = filter_stack_trace::<&str>(stack, &[]);
        assert_eq!(
            filtered.trim_end(),
            "   1: orders::checkout::charge\n             at ./src/checkout.rs:42:9"
        );
    }

    #[test]
    fn test_filter_stack_trace_custom_filters() {
        let filtered = filter_stack_trace(STACK, &["orders::main"]);
        assert!(filtered.contains("force_capture"));
        assert!(!filtered.contains("orders::main"));
    }

    #[test]
    fn test_filter_stack_trace_matches_locations() {
        let filtered = filter_stack_trace(STACK, &["checkout.rs"]);
        assert!(!filtered.contains("orders::checkout::charge"));
        assert!(filtered.contains("orders::main"));
    }

    #[test]
    fn test_filter_stack_trace_passes_through_non_backtraces() {
        let text = "disabled backtrace";
        assert_eq!(filter_stack_trace::<&str>(text, &[]), text);
    }

    #[test]
    fn test_unix_time_precision() {
        let t = std::time::Duration::from_nanos(1_678_886_400_123_456_789);
        assert_eq!(UnixTime::new(TimePrecision::S).render(t), "1678886400");
        assert_eq!(UnixTime::new(TimePrecision::Ms).render(t), "1678886400123");
        assert_eq!(UnixTime::new(TimePrecision::Us).render(t), "1678886400123456");
        assert_eq!(
            UnixTime::new(TimePrecision::Ns).render(t),
            "1678886400123456789"
        );
    }

    #[test]
    fn test_file_writer_requires_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = FileRotationConfig {
            directory: dir.path().to_path_buf(),
            file_name_prefix: String::new(),
            ..FileRotationConfig::default()
        };
        assert!(file_writer(&cfg).is_err());
    }

    #[test]
    fn test_file_writer_creates_appender() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = FileRotationConfig {
            directory: dir.path().to_path_buf(),
            file_name_prefix: "service".into(),
            rotation: Rotation::Never,
            max_files: None,
        };
        let (_writer, guard) = file_writer(&cfg).expect("writer");
        drop(guard);
        assert!(dir.path().exists());
    }
}
