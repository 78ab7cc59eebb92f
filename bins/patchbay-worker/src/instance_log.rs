// Per-instance log file, mirrored to the process-wide tracing subscriber
use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARNING",
            Level::Error => "ERROR",
        }
    }
}

/// Appends `<timestamp> - <repo> - <LEVEL> - <message>` lines to `run_repo.log`
pub struct InstanceLog {
    repo: String,
    path: PathBuf,
    file: Mutex<File>,
}

impl InstanceLog {
    pub fn create(repo: &str, path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;

        Ok(Self {
            repo: repo.to_string(),
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!(repo = %self.repo, "{}", message);
        self.append(Level::Info, message);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::warn!(repo = %self.repo, "{}", message);
        self.append(Level::Warn, message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::error!(repo = %self.repo, "{}", message);
        self.append(Level::Error, message);
    }

    fn append(&self, level: Level, message: &str) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S,%3f");
        let line = format!("{} - {} - {} - {}\n", timestamp, self.repo, level.as_str(), message);

        // A poisoned lock only means another write panicked mid-line
        let mut file = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = file.write_all(line.as_bytes()) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to write instance log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_are_appended_with_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_repo.log");

        let log = InstanceLog::create("requests", &path).unwrap();
        log.info("Container started");
        log.warn("Git diff changed after running eval script");
        log.error("boom");
        drop(log);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with(" - requests - INFO - Container started"));
        assert!(lines[1].contains(" - WARNING - Git diff changed"));
        assert!(lines[2].ends_with(" - requests - ERROR - boom"));
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_repo.log");

        InstanceLog::create("r", &path).unwrap().info("first run");
        InstanceLog::create("r", &path).unwrap().info("second run");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
