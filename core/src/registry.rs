//! One session per open document.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::driver::SessionHandle;
use crate::session::StopOutcome;

#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<PathBuf, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` for `path`, returning the handle it replaced.
    pub async fn insert(&self, path: impl Into<PathBuf>, handle: SessionHandle) -> Option<SessionHandle> {
        self.sessions.lock().await.insert(path.into(), handle)
    }

    pub async fn get(&self, path: &Path) -> Option<SessionHandle> {
        self.sessions.lock().await.get(path).cloned()
    }

    /// Forgets the session for `path` and stops it.
    pub async fn close(&self, path: &Path) -> Option<StopOutcome> {
        let handle = self.sessions.lock().await.remove(path)?;
        tracing::info!("Closing session for {}", path.display());
        handle.stop().await.ok()
    }

    /// Stops every registered session. Sessions whose driver is already gone
    /// are dropped from the registry.
    pub async fn stop_all(&self) -> Vec<(PathBuf, StopOutcome)> {
        let handles: Vec<(PathBuf, SessionHandle)> = {
            let mut sessions = self.sessions.lock().await;
            sessions.retain(|_, handle| !handle.is_closed());
            sessions
                .iter()
                .map(|(path, handle)| (path.clone(), handle.clone()))
                .collect()
        };

        let mut outcomes = Vec::with_capacity(handles.len());
        for (path, handle) in handles {
            match handle.stop().await {
                Ok(outcome) => {
                    tracing::info!("Stopped session for {}: {outcome:?}", path.display());
                    outcomes.push((path, outcome));
                }
                Err(e) => tracing::warn!("Could not stop session for {}: {e}", path.display()),
            }
        }
        outcomes
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
