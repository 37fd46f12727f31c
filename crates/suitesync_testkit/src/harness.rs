//! Runs a [`SyncEngine`] against a [`MemoryBackend`].

use crate::backend::MemoryBackend;
use crate::fixtures::{within, wait_until};
use std::sync::Arc;
use suitesync_engine::{EngineHandle, SyncConfig, SyncEngine, SyncResult, SyncState};
use tokio::task::JoinHandle;

/// A spawned engine plus the backend it syncs from.
pub struct EngineHarness {
    /// The server side.
    pub backend: Arc<MemoryBackend>,
    /// Handle to the running engine.
    pub handle: EngineHandle,
    task: Option<JoinHandle<SyncResult<()>>>,
}

impl EngineHarness {
    /// Spawns an engine with `config` against `backend`.
    pub fn spawn(config: SyncConfig, backend: Arc<MemoryBackend>) -> Self {
        let (engine, handle) = SyncEngine::new(config, backend.clone(), backend.clone());
        let task = tokio::spawn(engine.run());
        Self {
            backend,
            handle,
            task: Some(task),
        }
    }

    /// Waits until the engine is live: connected, snapshot exhausted and no
    /// update left waiting.
    pub async fn wait_live(&self) {
        wait_until(|| self.handle.state() == SyncState::Live).await;
    }

    /// Waits until `condition` holds for the engine handle.
    pub async fn wait_for(&self, mut condition: impl FnMut(&EngineHandle) -> bool) {
        wait_until(|| condition(&self.handle)).await;
    }

    /// Waits for `run` to return on its own.
    pub async fn join(&mut self) -> SyncResult<()> {
        let task = self.task.take().expect("engine already joined");
        within(task).await.expect("engine task panicked")
    }

    /// Shuts the engine down and returns the result of `run`.
    pub async fn shutdown(mut self) -> SyncResult<()> {
        self.handle.shutdown()?;
        self.join().await
    }
}

impl Drop for EngineHarness {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
