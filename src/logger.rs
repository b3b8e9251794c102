//! Tracing setup: stderr plus `pritunl.log` in the data dir, and the
//! session-wide alert guard used by the panic hook and error reporting.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::error;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const MAX_LOG_SIZE: u64 = 200_000;
pub const MAX_ALERTS: usize = 100;

// ── Log file ──────────────────────────────────────────────────────────────────

/// Append-only log file that starts over once it grows past `max` bytes.
#[derive(Debug, Clone)]
pub struct CappedFile {
    path: PathBuf,
    max: u64,
}

impl CappedFile {
    pub fn new(path: impl Into<PathBuf>, max: u64) -> Self {
        Self { path: path.into(), max }
    }

    fn open(&self) -> io::Result<File> {
        let oversized = std::fs::metadata(&self.path).map(|m| m.len() > self.max).unwrap_or(false);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut opts = OpenOptions::new();
        opts.create(true);
        if oversized {
            opts.write(true).truncate(true);
        } else {
            opts.append(true);
        }
        opts.open(&self.path)
    }
}

/// Writer for one log record. Records are dropped when the file can't be
/// opened.
pub struct CappedWriter(Option<File>);

impl Write for CappedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.0 {
            Some(f) => f.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.0 {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for CappedFile {
    type Writer = CappedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CappedWriter(self.open().ok())
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `verbose`.
pub fn init(log_path: &Path, verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr).with_target(false).without_time())
        .with(
            fmt::layer()
                .with_writer(CappedFile::new(log_path, MAX_LOG_SIZE))
                .with_ansi(false),
        )
        .try_init()
        .ok();
}

// ── Alerts ────────────────────────────────────────────────────────────────────

/// Counts user-facing alerts for the session. Past the limit, alerts are no
/// longer shown and a single suppression notice is logged.
#[derive(Debug, Clone)]
pub struct AlertGuard {
    count: Arc<AtomicUsize>,
    limit: usize,
}

impl Default for AlertGuard {
    fn default() -> Self {
        Self::new(MAX_ALERTS)
    }
}

impl AlertGuard {
    pub fn new(limit: usize) -> Self {
        Self { count: Arc::new(AtomicUsize::new(0)), limit }
    }

    /// Log `msg` and return whether it should still be shown to the user.
    pub fn raise(&self, msg: &str) -> bool {
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.limit {
            error!("{}", msg);
            true
        } else {
            if n == self.limit + 1 {
                error!("Too many errors, further alerts suppressed");
            }
            false
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

/// Route panics through the guard before the default hook runs.
pub fn install_panic_hook(guard: AlertGuard) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if guard.raise(&format!("Unexpected error: {}", info)) {
            previous(info);
        }
    }));
}
