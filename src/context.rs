//! Target-scoped build context.
//!
//! Every stage receives a [`TargetContext`] instead of reading process-wide
//! state: the target being built, its private work directory, its deadline
//! and the run's cancellation flag.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{BundleError, IoResultExt, Result};
use crate::target::Target;

/// Run-wide cancellation flag. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct TargetContext {
    pub target: Target,
    /// Private scratch directory; nothing else writes here.
    pub work_dir: PathBuf,
    deadline: Option<Instant>,
    cancel: CancelToken,
}

impl TargetContext {
    /// Create the context and a fresh work directory under `work_root`.
    pub fn create(
        target: Target,
        work_root: &Path,
        timeout: Option<Duration>,
        cancel: CancelToken,
    ) -> Result<Self> {
        let work_dir = work_root.join(target.key());
        if work_dir.exists() {
            fs::remove_dir_all(&work_dir).at(&work_dir)?;
        }
        fs::create_dir_all(&work_dir).at(&work_dir)?;
        Ok(Self {
            target,
            work_dir,
            deadline: timeout.map(|t| Instant::now() + t),
            cancel,
        })
    }

    /// Fail if the run was cancelled or the target's time is up.
    ///
    /// Called at every state transition and between entries while
    /// extracting and writing archives; `stage` names the stage running so
    /// the failure says where the target stopped. A single fetch is bounded
    /// by the transport timeout instead.
    pub fn checkpoint(&self, stage: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(BundleError::Cancelled {
                stage: stage.to_string(),
            });
        }
        if self.remaining() == Some(Duration::ZERO) {
            return Err(BundleError::Timeout {
                stage: stage.to_string(),
            });
        }
        Ok(())
    }

    /// Time left before the deadline, or `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// A fresh subdirectory of the work directory.
    pub fn scratch(&self, name: &str) -> Result<PathBuf> {
        let dir = self.work_dir.join(name);
        if dir.exists() {
            fs::remove_dir_all(&dir).at(&dir)?;
        }
        fs::create_dir_all(&dir).at(&dir)?;
        Ok(dir)
    }

    /// Remove the work directory. Errors are ignored; it is scratch space.
    pub fn cleanup(&self) {
        let _ = fs::remove_dir_all(&self.work_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn target() -> Target {
        Target::new("linux", "x86_64", "21.1.5").unwrap()
    }

    #[test]
    fn work_dir_is_per_target_and_fresh() {
        let temp = TempDir::new().unwrap();
        let stale = temp.path().join("linux-x86_64-21.1.5/leftover");
        fs::create_dir_all(&stale).unwrap();

        let ctx = TargetContext::create(target(), temp.path(), None, CancelToken::new()).unwrap();
        assert!(ctx.work_dir.ends_with("linux-x86_64-21.1.5"));
        assert!(!stale.exists());
        ctx.cleanup();
        assert!(!ctx.work_dir.exists());
    }

    #[test]
    fn checkpoint_reports_cancellation() {
        let temp = TempDir::new().unwrap();
        let cancel = CancelToken::new();
        let ctx = TargetContext::create(target(), temp.path(), None, cancel.clone()).unwrap();
        assert!(ctx.checkpoint("fetching").is_ok());
        cancel.cancel();
        let err = ctx.checkpoint("extracting").unwrap_err();
        assert!(matches!(err, BundleError::Cancelled { ref stage } if stage == "extracting"));
    }

    #[test]
    fn checkpoint_reports_timeout() {
        let temp = TempDir::new().unwrap();
        let ctx = TargetContext::create(
            target(),
            temp.path(),
            Some(Duration::ZERO),
            CancelToken::new(),
        )
        .unwrap();
        assert!(matches!(
            ctx.checkpoint("building"),
            Err(BundleError::Timeout { .. })
        ));
    }
}
