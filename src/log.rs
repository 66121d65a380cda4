//! Structured logging for debugging glossa.
//!
//! Log levels:
//! - ERROR: Lost results, failed joins
//! - WARN: Recoverable faults (retries, stage timeouts, degraded findings)
//! - INFO: Workflow, stage and runtime lifecycle
//! - DEBUG: Per-task traces (dispatch, settle, dedup)
//! - TRACE: Every publish on the broker
//!
//! Debug mode can be enabled with `--debug` flag or `GLOSSA_DEBUG=1` env var.
//! `GLOSSA_LOG` takes a full filter (`glossa=trace,warn`) and wins over both.

use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::Config;

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize logging to ~/.glossa/glossa.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// The log file is truncated on startup. Without a home directory, logs go
/// to stderr so stdout stays clean for command output.
pub fn init_with_debug(debug: bool) {
    let env_debug = std::env::var("GLOSSA_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let debug_enabled = debug || env_debug;
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let directive = filter_directive(debug_enabled, std::env::var("GLOSSA_LOG").ok());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false);

    let file = Config::glossa_dir().ok().and_then(|dir| {
        std::fs::create_dir_all(&dir).ok()?;
        File::create(dir.join("glossa.log")).ok()
    });
    // A subscriber may already be installed (tests, embedding binaries).
    let _ = match file {
        Some(file) => builder.with_writer(Mutex::new(file)).try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Filter used for the subscriber: an explicit override, else `debug` for
/// this crate in debug mode, else `info`.
pub fn filter_directive(debug: bool, env_override: Option<String>) -> String {
    match env_override {
        Some(directive) if !directive.trim().is_empty() => directive,
        _ if debug => "glossa=debug,info".to_string(),
        _ => "info".to_string(),
    }
}
