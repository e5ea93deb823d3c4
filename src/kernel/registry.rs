//! Conversation → kernel session mapping
//!
//! In `isolated` mode every conversation gets its own interpreter; in
//! `shared` mode all conversations use one. Sessions start lazily on first
//! use and exactly once per key, even when several executions race for it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

use super::launcher::KernelLauncher;
use super::session::KernelSession;
use super::KernelError;

/// Registry key used by every conversation in shared mode
pub const SHARED_KEY: &str = "__shared__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelPoolMode {
    /// One kernel per conversation
    #[default]
    Isolated,
    /// One kernel for the whole process
    Shared,
}

type Slot = Arc<OnceCell<Arc<KernelSession>>>;

pub struct KernelRegistry {
    mode: KernelPoolMode,
    launcher: Arc<dyn KernelLauncher>,
    sessions: Mutex<HashMap<String, Slot>>,
}

impl KernelRegistry {
    pub fn new(mode: KernelPoolMode, launcher: Arc<dyn KernelLauncher>) -> Self {
        Self {
            mode,
            launcher,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> KernelPoolMode {
        self.mode
    }

    fn key<'a>(&self, conversation_id: &'a str) -> &'a str {
        match self.mode {
            KernelPoolMode::Isolated => conversation_id,
            KernelPoolMode::Shared => SHARED_KEY,
        }
    }

    /// Session for `conversation_id`, starting it if needed
    pub async fn session(&self, conversation_id: &str) -> Result<Arc<KernelSession>, KernelError> {
        let key = self.key(conversation_id).to_string();
        let slot = {
            let mut sessions = self.sessions.lock().await;
            sessions.entry(key.clone()).or_default().clone()
        };

        let session = slot
            .get_or_try_init(|| async {
                info!(key = %key, mode = ?self.mode, "starting kernel");
                self.launcher.launch().await.map(Arc::new)
            })
            .await?;
        Ok(session.clone())
    }

    /// Session for `conversation_id` if one is already running
    pub async fn existing(&self, conversation_id: &str) -> Option<Arc<KernelSession>> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(self.key(conversation_id))
            .and_then(|slot| slot.get().cloned())
    }

    /// Drop `session` if it is still registered for `conversation_id`
    ///
    /// Used when a kernel dies so the next execution starts a fresh one.
    pub async fn discard(&self, conversation_id: &str, session: &Arc<KernelSession>) {
        let key = self.key(conversation_id);
        let mut sessions = self.sessions.lock().await;
        let registered = sessions
            .get(key)
            .and_then(|slot| slot.get())
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if registered {
            sessions.remove(key);
            warn!(key = %key, "discarded dead kernel");
        }
    }

    /// End a conversation: shut down its kernel (isolated mode only)
    pub async fn reap(&self, conversation_id: &str) -> bool {
        if self.mode == KernelPoolMode::Shared {
            return false;
        }
        let slot = self.sessions.lock().await.remove(conversation_id);
        match slot.and_then(|slot| slot.get().cloned()) {
            Some(session) => {
                if let Err(e) = session.shutdown().await {
                    warn!(conversation_id, error = %e, "kernel shutdown failed");
                }
                true
            }
            None => false,
        }
    }

    /// Shut down every kernel
    pub async fn shutdown_all(&self) {
        let slots: Vec<(String, Slot)> = self.sessions.lock().await.drain().collect();
        for (key, slot) in slots {
            if let Some(session) = slot.get() {
                if let Err(e) = session.shutdown().await {
                    warn!(key = %key, error = %e, "kernel shutdown failed");
                }
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
