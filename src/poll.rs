//! Generic predicate polling, used for ready-file watching.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::time::interval;

/// Repeatedly evaluate `predicate` every `period` until it returns true or
/// `deadline` elapses. Returns whether the predicate fired.
pub async fn poll_until<F>(period: Duration, deadline: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let mut ticker = interval(period);
    let poll = async {
        loop {
            ticker.tick().await;
            if predicate() {
                return;
            }
        }
    };
    tokio::time::timeout(deadline, poll).await.is_ok()
}

/// Watches one path for creation or an mtime change relative to the
/// baseline captured at construction.
pub struct FileTouchWatch {
    path: PathBuf,
    baseline: Option<SystemTime>,
}

impl FileTouchWatch {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let baseline = mtime(&path);
        Self { path, baseline }
    }

    /// True once the file exists with an mtime different from the baseline
    /// (or exists at all when it did not at construction).
    pub fn touched(&self) -> bool {
        match (mtime(&self.path), self.baseline) {
            (Some(current), Some(baseline)) => current != baseline,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
