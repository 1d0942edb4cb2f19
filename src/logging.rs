//! File-backed logger behind the `log` facade.
//!
//! Records land in per-category daily files under
//! `<working_dir>/.internal/logs/<category>/YYYY-MM-DD.log` and are mirrored
//! to stderr. The root is installed when the working directory is
//! configured; until then only the stderr mirror is active. Rotation beyond
//! the daily split is out of scope; the monitoring endpoint serves these
//! files back with a read cap.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::util::lock;

pub(crate) const LOG_CATEGORIES: &[&str] = &["info", "error", "debug"];

struct FileLogger {
    root: Mutex<Option<PathBuf>>,
}

static LOGGER: FileLogger = FileLogger {
    root: Mutex::new(None),
};

fn category_for(level: Level) -> &'static str {
    match level {
        Level::Error => "error",
        Level::Warn | Level::Info => "info",
        Level::Debug | Level::Trace => "debug",
    }
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let now = Utc::now();
        let line = format!(
            "{} [{}] {}: {}\n",
            now.format("%Y-%m-%dT%H:%M:%SZ"),
            record.level(),
            record.target(),
            record.args()
        );
        eprint!("{line}");

        let root = lock(&self.root);
        let Some(root) = root.as_ref() else { return };
        let dir = root.join(category_for(record.level()));
        let path = dir.join(format!("{}.log", now.format("%Y-%m-%d")));
        let opened = OpenOptions::new().create(true).append(true).open(&path);
        if let Ok(mut file) = opened {
            let _ = file.write_all(line.as_bytes());
        }
    }

    fn flush(&self) {}
}

/// Install the global logger. Level comes from `DATVAULT_LOG`
/// (error|warn|info|debug|trace), defaulting to info.
pub(crate) fn init() {
    let level = match crate::util::env_optional("DATVAULT_LOG")
        .map(|v| v.to_ascii_lowercase())
        .as_deref()
    {
        Some("error") => LevelFilter::Error,
        Some("warn") => LevelFilter::Warn,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

/// Point the logger at `<working_dir>/.internal/logs`, creating the
/// category directories.
pub(crate) fn set_log_root(working_dir: &Path) -> std::io::Result<PathBuf> {
    let root = working_dir.join(".internal").join("logs");
    for category in LOG_CATEGORIES {
        std::fs::create_dir_all(root.join(category))?;
    }
    *lock(&LOGGER.root) = Some(root.clone());
    Ok(root)
}

/// Read at most `cap` bytes from the start of a served log file.
pub(crate) fn read_log_capped(path: &Path, cap: u64) -> std::io::Result<Vec<u8>> {
    use std::io::Read;
    let file = std::fs::File::open(path)?;
    let mut bytes = Vec::new();
    file.take(cap).read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Resolve a served log file, refusing anything but plain path components.
pub(crate) fn log_file_path(
    working_dir: &Path,
    category: &str,
    file: &str,
) -> Option<PathBuf> {
    if !LOG_CATEGORIES.contains(&category) {
        return None;
    }
    if !crate::util::is_safe_path_component(file) {
        return None;
    }
    Some(
        working_dir
            .join(".internal")
            .join("logs")
            .join(category)
            .join(file),
    )
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_mapping() {
        assert_eq!(category_for(Level::Error), "error");
        assert_eq!(category_for(Level::Warn), "info");
        assert_eq!(category_for(Level::Info), "info");
        assert_eq!(category_for(Level::Debug), "debug");
    }

    #[test]
    fn test_log_file_path_rejects_traversal() {
        let dir = Path::new("/tmp/wd");
        assert!(log_file_path(dir, "info", "2026-08-01.log").is_some());
        assert!(log_file_path(dir, "info", "../secrets").is_none());
        assert!(log_file_path(dir, "bogus", "a.log").is_none());
        assert!(log_file_path(dir, "info", "a/b.log").is_none());
    }

    #[test]
    fn test_read_log_capped_truncates() {
        let dir = std::env::temp_dir().join(format!("datvault_logcap_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("big.log");
        // 5.2 KiB of log lines, read back with a 2 KiB cap.
        let line = "2026-08-01T00:00:00Z [INFO] datvault: something happened\n";
        let mut content = String::new();
        while content.len() < 5325 {
            content.push_str(line);
        }
        std::fs::write(&path, &content).unwrap();

        let bytes = read_log_capped(&path, 2048).unwrap();
        assert_eq!(bytes.len(), 2048);
        assert!(!bytes.is_empty());

        // Files smaller than the cap come back whole.
        let small = dir.join("small.log");
        std::fs::write(&small, b"short").unwrap();
        assert_eq!(read_log_capped(&small, 2048).unwrap(), b"short");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_set_log_root_creates_categories() {
        let dir = std::env::temp_dir().join(format!("datvault_log_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let root = set_log_root(&dir).unwrap();
        for category in LOG_CATEGORIES {
            assert!(root.join(category).is_dir());
        }
        // Detach so other tests do not write into the temp dir.
        *lock(&LOGGER.root) = None;
        std::fs::remove_dir_all(&dir).ok();
    }
}
