use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use tracing_subscriber::fmt::MakeWriter;

// ── DeferredFileWriter ───────────────────────────────────

/// A `MakeWriter` that discards writes until `handle.set_file(path)` is
/// called, then appends to that file.
///
/// The subscriber is installed before configuration is loaded, and the
/// engine log location comes from configuration.
#[derive(Clone)]
pub struct DeferredFileWriter {
    inner: Arc<Mutex<Option<File>>>,
}

/// Activation side of a [`DeferredFileWriter`].
#[derive(Clone)]
pub struct DeferredFileHandle {
    inner: Arc<Mutex<Option<File>>>,
}

impl DeferredFileWriter {
    pub fn new() -> (Self, DeferredFileHandle) {
        let inner = Arc::new(Mutex::new(None));
        (
            Self {
                inner: inner.clone(),
            },
            DeferredFileHandle { inner },
        )
    }
}

impl DeferredFileHandle {
    pub fn set_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(file);
        Ok(())
    }
}

pub struct DeferredWriter {
    inner: Arc<Mutex<Option<File>>>,
}

impl Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            Some(f) => f.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            inner: self.inner.clone(),
        }
    }
}

// ── ScriptLogger ─────────────────────────────────────────

/// Persists one installer script's output.
///
/// Creates `<timestamp>_<product>_<script>_running.log`; `finish` renames
/// it to `_ok.log` or `_failed.log`.
pub struct ScriptLogger {
    file: File,
    path: PathBuf,
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '-' })
        .collect()
}

impl ScriptLogger {
    pub fn new(logs_dir: &Path, product_id: &str, script: &str) -> std::io::Result<Self> {
        fs::create_dir_all(logs_dir)?;
        let filename = format!(
            "{}_{}_{}_running.log",
            utc_timestamp(),
            file_safe(product_id),
            file_safe(script)
        );
        let path = logs_dir.join(filename);
        let file = File::create(&path)?;
        Ok(Self { file, path })
    }

    pub fn write_line(&mut self, line: &str) {
        let _ = writeln!(self.file, "{line}");
    }

    /// Write a labelled block of captured output, one line at a time.
    pub fn write_section(&mut self, label: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        self.write_line(&format!("── {label} ──"));
        for line in text.lines() {
            self.write_line(line);
        }
    }

    pub fn finish(self, success: bool) -> PathBuf {
        let suffix = if success { "ok" } else { "failed" };
        let renamed = self
            .path
            .file_name()
            .and_then(|f| f.to_str())
            .map(|f| f.replace("_running.log", &format!("_{suffix}.log")));
        match renamed {
            Some(name) => {
                let new_path = self.path.with_file_name(name);
                match fs::rename(&self.path, &new_path) {
                    Ok(()) => new_path,
                    Err(_) => self.path,
                }
            }
            None => self.path,
        }
    }
}

// ── Log rotation ─────────────────────────────────────────

/// Delete the oldest finished logs for one product's script, keeping at
/// most `keep`.
pub fn rotate_logs(logs_dir: &Path, product_id: &str, script: &str, keep: usize) {
    let Ok(entries) = fs::read_dir(logs_dir) else {
        return;
    };

    let infix = format!("_{}_{}_", file_safe(product_id), file_safe(script));
    let mut matching: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name().and_then(|f| f.to_str()).is_some_and(|f| {
                f.contains(&infix) && (f.ends_with("_ok.log") || f.ends_with("_failed.log"))
            })
        })
        .collect();

    // Timestamp prefix makes name order chronological.
    matching.sort();

    if matching.len() > keep {
        for old in &matching[..matching.len() - keep] {
            let _ = fs::remove_file(old);
        }
    }
}

// ── Timestamp helper ─────────────────────────────────────

/// Current UTC time as `YYYY-MM-DDTHH-MM-SS`.
pub fn utc_timestamp() -> String {
    let secs = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_utc(secs)
}

fn format_utc(secs: u64) -> String {
    let days = (secs / 86400) as i64;
    let time_of_day = secs % 86400;
    let (hours, minutes, seconds) = (time_of_day / 3600, (time_of_day % 3600) / 60, time_of_day % 60);

    // Howard Hinnant's civil_from_days.
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = yoe as i64 + era * 400 + i64::from(m <= 2);

    format!("{y:04}-{m:02}-{d:02}T{hours:02}-{minutes:02}-{seconds:02}")
}
