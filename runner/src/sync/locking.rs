use crate::{
    sentinel::{self, SentinelError, LOCK},
    sync::session::SessionId,
};
use std::path::{Path, PathBuf};
use tracing::trace;


/// A successful claim on a run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunLock {
    path: PathBuf,
}

/// Try to claim `run` for `session`.
///
/// `Ok(None)` means another session got there first; that is a lost race and
/// not an error.
pub fn claim(run: &Path, session: &SessionId) -> Result<Option<RunLock>, SentinelError> {
    let path = run.join(LOCK);

    if sentinel::create_exclusive(&path, session.as_str())? {
        Ok(Some(RunLock { path }))
    } else {
        trace!(run = ?run, "Lost the claim race");
        Ok(None)
    }
}

impl RunLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run(&self) -> &Path {
        self.path.parent().unwrap_or(&self.path)
    }

    /// Delete the lock; a lock already removed by an in-place worker is fine
    pub fn release(&self) -> Result<bool, SentinelError> {
        sentinel::remove(&self.path)
    }
}
