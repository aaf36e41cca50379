//! Sessions: a conversation plus the optimizer state that belongs to it.
//!
//! A [`Session`] is mutated by one request loop at a time. The
//! [`SessionManager`] enforces that for multi-session hosts by handing out
//! owned lock guards and rejecting a second request with
//! [`SessionError::Busy`] instead of queueing it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ferrule_config::OptimizerConfig;
use ferrule_core::error::SessionError;
use ferrule_core::message::{Conversation, ConversationId};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::optimizer::{ContextOptimizer, OptimizationReport, OptimizerState};

/// One conversation and its optimizer.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub conversation: Conversation,
    optimizer: ContextOptimizer,
}

impl Session {
    /// Start a session seeded with a system prompt.
    pub fn new(
        id: impl Into<String>,
        system_prompt: impl Into<String>,
        optimizer: &OptimizerConfig,
    ) -> Self {
        let id = id.into();
        let mut conversation = Conversation::with_system_prompt(system_prompt);
        conversation.id = ConversationId::from(id.as_str());
        Self {
            id,
            conversation,
            optimizer: ContextOptimizer::new(optimizer),
        }
    }

    pub fn optimizer(&self) -> &ContextOptimizer {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut ContextOptimizer {
        &mut self.optimizer
    }

    /// Drop everything but the system prompt and forget the summary.
    pub fn clear_history(&mut self) {
        self.conversation.clear_history();
        self.optimizer.reset();
        debug!(session_id = %self.id, "Session history cleared");
    }

    /// Run the optimizer on demand (ignores the auto-optimize setting).
    pub fn optimize(&mut self) -> OptimizationReport {
        self.optimizer.optimize(&mut self.conversation)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            conversation: self.conversation.clone(),
            optimizer: self.optimizer.state().clone(),
        }
    }

    pub fn restore(snapshot: SessionSnapshot) -> Self {
        Self {
            id: snapshot.id,
            conversation: snapshot.conversation,
            optimizer: ContextOptimizer::from_state(snapshot.optimizer),
        }
    }
}

/// Serializable form of a [`Session`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub conversation: Conversation,
    pub optimizer: OptimizerState,
}

/// Where sessions are persisted between runs.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self, id: &str) -> Result<Option<SessionSnapshot>, SessionError>;

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), SessionError>;

    /// Returns whether anything was deleted.
    async fn delete(&self, id: &str) -> Result<bool, SessionError>;
}

/// Process-local store, mostly for tests and embedding.
#[derive(Default)]
pub struct InMemoryStore {
    sessions: RwLock<HashMap<String, SessionSnapshot>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn load(&self, id: &str) -> Result<Option<SessionSnapshot>, SessionError> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), SessionError> {
        self.sessions
            .write()
            .await
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, SessionError> {
        Ok(self.sessions.write().await.remove(id).is_some())
    }
}

/// One pretty-printed JSON file per session under a directory.
///
/// Default location: `~/.ferrule/sessions/<id>.json`
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        // Session ids come from users; keep them to one safe path segment
        let file: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{file}.json"))
    }
}

#[async_trait]
impl ConversationStore for JsonFileStore {
    fn name(&self) -> &str {
        "json_file"
    }

    async fn load(&self, id: &str) -> Result<Option<SessionSnapshot>, SessionError> {
        let path = self.path_for(id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SessionError::Storage(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        match serde_json::from_str(&content) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring corrupted session file");
                Ok(None)
            }
        }
    }

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), SessionError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            SessionError::Storage(format!("Failed to create session directory: {e}"))
        })?;

        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| SessionError::Storage(format!("Failed to serialize session: {e}")))?;

        let path = self.path_for(&snapshot.id);
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| SessionError::Storage(format!("Failed to write {}: {e}", path.display())))?;
        debug!(path = %path.display(), "Session saved");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, SessionError> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SessionError::Storage(format!("Failed to delete session: {e}"))),
        }
    }
}

/// Holds live sessions and serializes access to each one.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<AsyncMutex<Session>>>>,
    store: Option<Arc<dyn ConversationStore>>,
    system_prompt: String,
    optimizer: OptimizerConfig,
}

impl SessionManager {
    pub fn new(system_prompt: impl Into<String>, optimizer: OptimizerConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            store: None,
            system_prompt: system_prompt.into(),
            optimizer,
        }
    }

    /// Persist sessions through a store and restore them on first use.
    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AsyncMutex<Session>>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Exclusive access to a session, creating or restoring it as needed.
    ///
    /// Fails with [`SessionError::Busy`] while another request holds it.
    pub async fn acquire(&self, id: &str) -> Result<OwnedMutexGuard<Session>, SessionError> {
        let existing = self.lock().get(id).cloned();
        let slot = match existing {
            Some(slot) => slot,
            None => {
                let session = self.open(id).await?;
                let mut sessions = self.lock();
                Arc::clone(
                    sessions
                        .entry(id.to_string())
                        .or_insert_with(|| Arc::new(AsyncMutex::new(session))),
                )
            }
        };

        slot.try_lock_owned().map_err(|_| {
            debug!(session_id = %id, "Rejecting request for busy session");
            SessionError::Busy(id.to_string())
        })
    }

    async fn open(&self, id: &str) -> Result<Session, SessionError> {
        if let Some(store) = &self.store
            && let Some(snapshot) = store.load(id).await?
        {
            info!(session_id = %id, store = store.name(), "Restored session");
            let mut session = Session::restore(snapshot);
            session.conversation.set_system_prompt(self.system_prompt.clone());
            return Ok(session);
        }
        Ok(Session::new(id, self.system_prompt.clone(), &self.optimizer))
    }

    /// Save a session through the store, if one is configured.
    pub async fn persist(&self, session: &Session) -> Result<(), SessionError> {
        match &self.store {
            Some(store) => store.save(&session.snapshot()).await,
            None => Ok(()),
        }
    }

    /// Forget a session in memory and in the store.
    pub async fn remove(&self, id: &str) -> Result<bool, SessionError> {
        let live = self.lock().remove(id).is_some();
        let stored = match &self.store {
            Some(store) => store.delete(id).await?,
            None => false,
        };
        Ok(live || stored)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
