/// Liveness sentinel
///
/// The registration controller touches a file after every successful
/// authenticated REGISTER; an external supervisor runs the `check`
/// subcommand and alerts when the mtime goes stale. The file content
/// is irrelevant, the mtime carries the signal.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info};

/// Delay before `check` inspects the file, so a supervisor probing
/// right after process start does not trip on a not-yet-touched file.
const CHECK_STARTUP_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct Sentinel {
    path: PathBuf,
}

impl Sentinel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the file or refresh its mtime.
    pub fn touch(&self) -> Result<()> {
        std::fs::write(&self.path, b"")
            .with_context(|| format!("failed to touch sentinel {:?}", self.path))?;
        debug!("sentinel touched: {:?}", self.path);
        Ok(())
    }

    /// Seconds since the file was last touched.
    pub fn age(&self) -> Result<u64> {
        let mtime = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .with_context(|| format!("failed to stat sentinel {:?}", self.path))?;
        let age = SystemTime::now()
            .duration_since(mtime)
            .unwrap_or(Duration::ZERO);
        Ok(age.as_secs())
    }
}

/// Liveness check for an external supervisor.
///
/// Returns the process exit code: 0 when the sentinel exists and is
/// younger than `max_age_secs`, 1 otherwise.
pub async fn check(sentinel: &Sentinel, max_age_secs: u64) -> i32 {
    // so the first check after start-up is unlikely to fail
    tokio::time::sleep(CHECK_STARTUP_DELAY).await;

    if !sentinel.path().exists() {
        error!("sentinel file {:?} does not exist", sentinel.path());
        return 1;
    }
    match sentinel.age() {
        Ok(age) if age > max_age_secs => {
            error!("sentinel file has expired, age: {}s", age);
            1
        }
        Ok(age) => {
            info!("sentinel file ok, age: {}s", age);
            0
        }
        Err(e) => {
            error!("unable to read sentinel: {:#}", e);
            1
        }
    }
}
