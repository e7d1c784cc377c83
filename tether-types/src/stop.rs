use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

const MARKER_POLL: Duration = Duration::from_millis(250);

/// Cooperative stop signal: an explicit cancel, or a marker file appearing on disk.
///
/// Loops check it at every wait point through [`StopSignal::sleep`] or
/// [`StopSignal::stopped`].
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    token: CancellationToken,
    marker: Option<Arc<PathBuf>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_marker(path: impl Into<PathBuf>) -> Self {
        Self {
            token: CancellationToken::new(),
            marker: Some(Arc::new(path.into())),
        }
    }

    pub fn marker(&self) -> Option<&Path> {
        self.marker.as_deref().map(|p| p.as_path())
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        match self.marker.as_deref() {
            Some(path) if path.exists() => {
                self.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Remove a marker left over from a previous run.
    pub fn clear_marker(&self) -> io::Result<bool> {
        match self.marker.as_deref() {
            Some(path) if path.exists() => {
                std::fs::remove_file(path)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Resolves once the signal fires.
    pub async fn stopped(&self) {
        loop {
            if self.is_stopped() {
                return;
            }
            if self.marker.is_none() {
                self.token.cancelled().await;
                return;
            }
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep(MARKER_POLL) => {}
            }
        }
    }

    /// Sleep for `duration` unless stopped first. Returns `true` if stopped.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        tokio::select! {
            biased;
            _ = self.stopped() => true,
            _ = tokio::time::sleep(duration) => self.is_stopped(),
        }
    }
}
