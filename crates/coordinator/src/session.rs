//! Chat sessions
//!
//! A session is an ordered conversation between one user and that user's
//! model. Sending a message appends it, waits for the worker's lane,
//! makes sure the worker is resident, then streams the reply back and
//! appends it as an assistant message.

use crate::allocator::AllocatorStats;
use crate::dispatch::DispatchQueue;
use crate::protocol::{ChunkCallback, ChunkTarget, GenerationOutcome, ProtocolDriver};
use crate::store::SessionStore;
use crate::supervisor::{ModelWorker, Supervisor};
use chrono::{DateTime, TimeDelta, Utc};
use modelpool_common::config::SessionConfig;
use modelpool_common::{ModelPoolError, Result, METRICS};
use modelpool_proto::{ChatSettings, ContextMessage, GenerateRequest, Role};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_TITLE: &str = "New conversation";

/// Reply details recorded on assistant messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub response_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotional_tone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl From<&GenerationOutcome> for MessageMetadata {
    fn from(outcome: &GenerationOutcome) -> Self {
        Self {
            response_time_ms: outcome
                .metadata
                .response_time_ms
                .unwrap_or(outcome.elapsed.as_millis() as u64),
            token_count: outcome.metadata.token_count,
            emotional_tone: outcome.metadata.emotional_tone.clone(),
            confidence: outcome.metadata.confidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub messages: Vec<ChatMessage>,
    pub settings: ChatSettings,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl ChatSession {
    fn new(user_id: &str, title: String, settings: ChatSettings) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title,
            messages: Vec::new(),
            settings,
            created_at: now,
            last_active_at: now,
        }
    }

    /// Append a message. Timestamps are kept strictly increasing even
    /// when the clock does not move between appends.
    fn push_message(
        &mut self,
        id: String,
        role: Role,
        content: String,
        metadata: Option<MessageMetadata>,
    ) -> ChatMessage {
        let mut timestamp = Utc::now();
        if let Some(last) = self.messages.last() {
            if timestamp <= last.timestamp {
                timestamp = last.timestamp + TimeDelta::microseconds(1);
            }
        }

        let message = ChatMessage {
            id,
            role,
            content,
            timestamp,
            metadata,
        };
        self.messages.push(message.clone());
        self.last_active_at = timestamp.max(self.last_active_at);
        message
    }

    /// The trailing `n` messages, oldest first
    pub fn context_window(&self, n: usize) -> Vec<ContextMessage> {
        let start = self.messages.len().saturating_sub(n);
        self.messages[start..]
            .iter()
            .map(|m| ContextMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect()
    }
}

/// Service-wide snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub allocator: AllocatorStats,
    pub loaded_workers: usize,
    pub active_sessions: usize,
    pub total_inferences: u64,
    pub average_response_time_ms: f64,
}

/// Owns every session and routes their messages to workers
pub struct SessionManager {
    config: SessionConfig,
    supervisor: Arc<Supervisor>,
    driver: ProtocolDriver,
    lanes: Arc<DispatchQueue>,
    store: Arc<dyn SessionStore>,
    sessions: RwLock<HashMap<String, ChatSession>>,
    /// Bumped to cancel whatever the session has in flight
    cancels: Mutex<HashMap<String, watch::Sender<u64>>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig, supervisor: Arc<Supervisor>, store: Arc<dyn SessionStore>) -> Self {
        let driver = ProtocolDriver::new(config.generation_timeout());
        Self {
            config,
            supervisor,
            driver,
            lanes: DispatchQueue::new(),
            store,
            sessions: RwLock::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Start a conversation seeded with the welcome message
    pub fn create_session(
        &self,
        user_id: &str,
        title: Option<String>,
        settings: Option<ChatSettings>,
    ) -> Result<ChatSession> {
        if user_id.trim().is_empty() {
            return Err(ModelPoolError::invalid_input("user id must not be empty"));
        }

        let title = title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TITLE.to_string());
        let settings = settings.unwrap_or_else(|| self.config.default_settings.clone());

        let mut session = ChatSession::new(user_id, title, settings);
        session.push_message(
            Uuid::new_v4().to_string(),
            Role::System,
            self.config.welcome_message.clone(),
            None,
        );

        let count = {
            let mut sessions = self.sessions.write();
            sessions.insert(session.id.clone(), session.clone());
            sessions.len()
        };
        METRICS.sessions.active_sessions.set(count as i64);
        info!("Created session {} for {}", session.id, user_id);

        self.persist(&session);
        Ok(session)
    }

    /// Send `text` and wait for the assistant's reply.
    ///
    /// The user message is recorded before any work happens and stays in
    /// the session whatever the outcome. The assistant message is only
    /// appended on success.
    pub async fn send_message(
        &self,
        session_id: &str,
        text: &str,
        on_chunk: Option<ChunkCallback<'_>>,
    ) -> Result<ChatMessage> {
        if text.trim().is_empty() {
            return Err(ModelPoolError::invalid_input("message must not be empty"));
        }

        let (user_id, request, snapshot) = {
            let mut sessions = self.sessions.write();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| ModelPoolError::session_not_found(session_id))?;

            let context = session.context_window(session.settings.memory_length);
            session.push_message(Uuid::new_v4().to_string(), Role::User, text.to_string(), None);

            let request = GenerateRequest {
                request_id: Some(Uuid::new_v4().to_string()),
                message: text.to_string(),
                context_messages: context,
                settings: session.settings.clone(),
            };
            (session.user_id.clone(), request, session.clone())
        };
        self.persist(&snapshot);

        let mut cancel = self.cancel_receiver(session_id);
        let target = ChunkTarget {
            session_id: session_id.to_string(),
            message_id: Uuid::new_v4().to_string(),
        };

        let generated: Result<(Arc<ModelWorker>, GenerationOutcome)> = async {
            let _lane = tokio::select! {
                lane = self.lanes.acquire(&user_id) => lane,
                Ok(()) = cancel.changed() => {
                    return Err(ModelPoolError::cancelled("message cancelled while queued"));
                }
            };

            let worker = tokio::select! {
                worker = self.supervisor.ensure_loaded(&user_id) => worker?,
                Ok(()) = cancel.changed() => {
                    return Err(ModelPoolError::cancelled("message cancelled while loading"));
                }
            };

            let outcome = self
                .driver
                .generate(&worker, &request, &target, on_chunk, Some(cancel))
                .await?;
            Ok((worker, outcome))
        }
        .await;

        match generated {
            Ok((worker, outcome)) => {
                self.supervisor.record_inference(&worker, outcome.elapsed);
                METRICS.sessions.messages_total.inc();
                Ok(self.append_reply(session_id, target.message_id, &outcome))
            }
            Err(e) => {
                METRICS.sessions.generation_failures.inc();
                warn!("Message on session {} failed: {}", session_id, e);
                Err(e)
            }
        }
    }

    fn append_reply(&self, session_id: &str, message_id: String, outcome: &GenerationOutcome) -> ChatMessage {
        let metadata = Some(MessageMetadata::from(outcome));
        let appended = {
            let mut sessions = self.sessions.write();
            sessions.get_mut(session_id).map(|session| {
                let message = session.push_message(
                    message_id.clone(),
                    Role::Assistant,
                    outcome.content.clone(),
                    metadata.clone(),
                );
                (message, session.clone())
            })
        };

        match appended {
            Some((message, snapshot)) => {
                self.persist(&snapshot);
                message
            }
            None => {
                // Deleted or swept mid-generation; the reply still goes back
                debug!("Session {} gone before its reply arrived", session_id);
                ChatMessage {
                    id: message_id,
                    role: Role::Assistant,
                    content: outcome.content.clone(),
                    timestamp: Utc::now(),
                    metadata,
                }
            }
        }
    }

    fn cancel_receiver(&self, session_id: &str) -> watch::Receiver<u64> {
        self.cancels
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    /// Cancel every message the session has queued or in flight
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.cancels.lock().get(session_id) {
            Some(tx) => {
                tx.send_modify(|generation| *generation += 1);
                info!("Cancelled in-flight work for session {}", session_id);
                true
            }
            None => false,
        }
    }

    pub fn get_session(&self, session_id: &str) -> Option<ChatSession> {
        self.sessions.read().get(session_id).cloned()
    }

    /// The user's sessions, most recently active first
    pub fn list_sessions(&self, user_id: &str) -> Vec<ChatSession> {
        let mut sessions: Vec<ChatSession> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        sessions
    }

    /// Bring a persisted session back into memory
    pub fn resume_session(&self, session_id: &str) -> Result<ChatSession> {
        if let Some(session) = self.get_session(session_id) {
            return Ok(session);
        }

        let session = self
            .store
            .load(session_id)?
            .ok_or_else(|| ModelPoolError::session_not_found(session_id))?;

        let count = {
            let mut sessions = self.sessions.write();
            sessions.insert(session.id.clone(), session.clone());
            sessions.len()
        };
        METRICS.sessions.active_sessions.set(count as i64);
        info!("Resumed session {} for {}", session.id, session.user_id);
        Ok(session)
    }

    pub fn delete_session(&self, session_id: &str) -> bool {
        let removed = {
            let mut sessions = self.sessions.write();
            let removed = sessions.remove(session_id).is_some();
            METRICS.sessions.active_sessions.set(sessions.len() as i64);
            removed
        };

        if removed {
            self.cancel(session_id);
            self.cancels.lock().remove(session_id);
            if let Err(e) = self.store.delete(session_id) {
                warn!("Failed to delete stored session {}: {}", session_id, e);
            }
            info!("Deleted session {}", session_id);
        }
        removed
    }

    /// Replace the session's settings; applies to the next message
    pub fn update_settings(&self, session_id: &str, settings: ChatSettings) -> Result<ChatSession> {
        let snapshot = {
            let mut sessions = self.sessions.write();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| ModelPoolError::session_not_found(session_id))?;
            session.settings = settings;
            session.last_active_at = Utc::now().max(session.last_active_at);
            session.clone()
        };
        self.persist(&snapshot);
        Ok(snapshot)
    }

    /// Drop sessions idle for longer than the configured timeout
    pub fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(Utc::now())
    }

    pub fn sweep_idle_at(&self, now: DateTime<Utc>) -> usize {
        let idle = TimeDelta::from_std(self.config.idle_timeout())
            .unwrap_or_else(|_| TimeDelta::MAX);

        let expired: Vec<String> = {
            let mut sessions = self.sessions.write();
            let expired: Vec<String> = sessions
                .values()
                .filter(|s| now.signed_duration_since(s.last_active_at) > idle)
                .map(|s| s.id.clone())
                .collect();
            for id in &expired {
                sessions.remove(id);
            }
            METRICS.sessions.active_sessions.set(sessions.len() as i64);
            expired
        };

        if !expired.is_empty() {
            let mut cancels = self.cancels.lock();
            for id in &expired {
                cancels.remove(id);
            }
            info!("Swept {} idle sessions", expired.len());
        }
        expired.len()
    }

    /// Sweep idle sessions on the configured interval
    pub fn start_idle_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.sweep_interval());
            interval.tick().await;

            loop {
                interval.tick().await;
                let swept = self.sweep_idle();
                if swept > 0 {
                    debug!("Idle sweep removed {} sessions", swept);
                }
            }
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn stats(&self) -> ServiceStats {
        let supervisor = self.supervisor.stats();
        ServiceStats {
            allocator: self.supervisor.allocator().stats(),
            loaded_workers: supervisor.loaded_workers,
            active_sessions: self.session_count(),
            total_inferences: supervisor.total_inferences,
            average_response_time_ms: supervisor.average_response_time_ms,
        }
    }

    fn persist(&self, session: &ChatSession) {
        if let Err(e) = self.store.save(session) {
            warn!("Failed to persist session {}: {}", session.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::StaticLocator;
    use crate::protocol::StreamingChunk;
    use crate::store::MemorySessionStore;
    use crate::test_support::{FakeLauncher, Outcome, Reply};
    use modelpool_common::config::{AllocatorConfig, SupervisorConfig};
    use std::time::Duration;

    struct Harness {
        launcher: Arc<FakeLauncher>,
        store: Arc<MemorySessionStore>,
        manager: Arc<SessionManager>,
    }

    fn harness(users: &[&str]) -> Harness {
        harness_with(FakeLauncher::new(), users)
    }

    fn harness_with(launcher: Arc<FakeLauncher>, users: &[&str]) -> Harness {
        let locator = Arc::new(StaticLocator::new());
        for user in users {
            locator.insert(*user, format!("/models/{}", user));
        }
        let supervisor = Supervisor::new(
            SupervisorConfig::default(),
            &AllocatorConfig::default(),
            Arc::clone(&launcher) as Arc<dyn crate::process::WorkerLauncher>,
            locator,
        );
        let store = Arc::new(MemorySessionStore::new());
        let manager = Arc::new(SessionManager::new(
            SessionConfig::default(),
            supervisor,
            Arc::clone(&store) as Arc<dyn SessionStore>,
        ));
        Harness {
            launcher,
            store,
            manager,
        }
    }

    #[tokio::test]
    async fn test_create_session_seeds_welcome() {
        let h = harness(&["u1"]);
        let session = h.manager.create_session("u1", None, None).unwrap();

        assert_eq!(session.title, DEFAULT_TITLE);
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].role, Role::System);
        assert_eq!(session.settings, ChatSettings::default());
        assert!(h.store.load(&session.id).unwrap().is_some());
        assert!(h.manager.create_session("  ", None, None).is_err());
    }

    #[tokio::test]
    async fn test_send_message_streams_and_records() {
        let h = harness(&["u1"]);
        h.launcher.push_reply(Reply::chunks(&["Hi", " there", "!"]));
        let session = h.manager.create_session("u1", None, None).unwrap();

        let mut chunks: Vec<StreamingChunk> = Vec::new();
        let mut collect = |chunk: StreamingChunk| chunks.push(chunk);
        let callback: ChunkCallback<'_> = &mut collect;
        let reply = h
            .manager
            .send_message(&session.id, "hello", Some(callback))
            .await
            .unwrap();

        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.message_id == reply.id && !c.is_complete));
        assert_eq!(reply.content, "Hi there!");
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.metadata.as_ref().unwrap().token_count, Some(3));

        let stored = h.manager.get_session(&session.id).unwrap();
        let roles: Vec<Role> = stored.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
        assert!(stored
            .messages
            .windows(2)
            .all(|pair| pair[0].timestamp < pair[1].timestamp));

        // The persisted copy round-trips to the same conversation
        assert_eq!(h.store.load(&session.id).unwrap(), Some(stored));
    }

    #[tokio::test]
    async fn test_request_carries_context_and_settings() {
        let h = harness(&["u1"]);
        let settings = ChatSettings {
            memory_length: 2,
            temperature: 0.2,
            ..Default::default()
        };
        let session = h.manager.create_session("u1", None, Some(settings)).unwrap();

        h.manager.send_message(&session.id, "first", None).await.unwrap();
        h.manager.send_message(&session.id, "second", None).await.unwrap();

        let requests = h.launcher.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].message, "second");
        assert_eq!(requests[1].settings.temperature, 0.2);
        let context: Vec<&str> = requests[1]
            .context_messages
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(context, vec!["first", "ok"]);
        assert_ne!(requests[0].request_id, requests[1].request_id);
    }

    #[tokio::test]
    async fn test_messages_to_one_worker_are_serialized() {
        let h = harness(&["u1"]);
        h.launcher
            .push_reply(Reply::words("first reply").with_delay(Duration::from_millis(20)));
        h.launcher
            .push_reply(Reply::words("second reply").with_delay(Duration::from_millis(20)));
        let a = h.manager.create_session("u1", None, None).unwrap();
        let b = h.manager.create_session("u1", None, None).unwrap();

        let (ra, rb) = tokio::join!(
            h.manager.send_message(&a.id, "from a", None),
            h.manager.send_message(&b.id, "from b", None),
        );
        assert!(ra.is_ok() && rb.is_ok());

        assert_eq!(
            h.launcher.events(),
            vec!["start:from a", "end:from a", "start:from b", "end:from b"]
        );
        assert_eq!(h.launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_streamed_chunks_then_complete_content() {
        let h = harness(&["u1"]);
        h.launcher.push_reply(
            Reply::chunks(&["hel", "lo ", "there"])
                .with_outcome(Outcome::Complete(Some("hello there".to_string()))),
        );
        let session = h.manager.create_session("u1", None, None).unwrap();

        let mut deltas: Vec<String> = Vec::new();
        let mut collect = |chunk: StreamingChunk| deltas.push(chunk.content_delta);
        let callback: ChunkCallback<'_> = &mut collect;
        let reply = h
            .manager
            .send_message(&session.id, "hi", Some(callback))
            .await
            .unwrap();

        assert_eq!(deltas, vec!["hel", "lo ", "there"]);
        assert_eq!(reply.content, "hello there");
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_worker_times_out_then_recovers() {
        let h = harness(&["u1"]);
        h.launcher.push_reply(Reply::silent());
        let session = h.manager.create_session("u1", None, None).unwrap();
        h.manager.supervisor().ensure_loaded("u1").await.unwrap();

        let started = tokio::time::Instant::now();
        let result = h.manager.send_message(&session.id, "hello", None).await;
        let waited = started.elapsed();

        assert!(matches!(result, Err(ModelPoolError::ResponseTimeout(_))));
        assert!(waited >= Duration::from_secs(60) && waited < Duration::from_secs(61));
        let stored = h.manager.get_session(&session.id).unwrap();
        assert_eq!(stored.messages.last().unwrap().role, Role::User);

        let reply = h.manager.send_message(&session.id, "again", None).await.unwrap();
        assert_eq!(reply.content, "ok");
        assert_eq!(h.launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let h = harness(&["u1"]);
        let result = h.manager.send_message("missing", "hello", None).await;
        assert!(matches!(result, Err(ModelPoolError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_failure_keeps_user_message() {
        let h = harness(&["u1"]);
        h.launcher.push_reply(Reply::error("boom"));
        let session = h.manager.create_session("u1", None, None).unwrap();

        let result = h.manager.send_message(&session.id, "hello", None).await;
        assert!(matches!(result, Err(ModelPoolError::WorkerError(_))));

        let stored = h.manager.get_session(&session.id).unwrap();
        assert_eq!(stored.messages.len(), 2);
        assert_eq!(stored.messages[1].role, Role::User);
    }

    #[tokio::test]
    async fn test_missing_model_fails_message() {
        let h = harness(&[]);
        let session = h.manager.create_session("nobody", None, None).unwrap();

        let result = h.manager.send_message(&session.id, "hello", None).await;
        assert!(matches!(result, Err(ModelPoolError::ModelNotFound(_))));
        assert_eq!(h.launcher.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_in_flight_and_queued() {
        let h = harness(&["u1"]);
        h.launcher.push_reply(Reply::silent());
        let session = h.manager.create_session("u1", None, None).unwrap();

        let manager = Arc::clone(&h.manager);
        let id = session.id.clone();
        let first = tokio::spawn(async move { manager.send_message(&id, "one", None).await });
        let manager = Arc::clone(&h.manager);
        let id = session.id.clone();
        let second = tokio::spawn(async move { manager.send_message(&id, "two", None).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.manager.cancel(&session.id));

        let first = first.await.unwrap();
        let second = second.await.unwrap();
        assert!(matches!(first, Err(ModelPoolError::Cancelled(_))));
        assert!(matches!(second, Err(ModelPoolError::Cancelled(_))));

        // Cancellation does not stick to later messages
        let reply = h.manager.send_message(&session.id, "three", None).await.unwrap();
        assert_eq!(reply.content, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_startup_leaves_no_allocation() {
        let h = harness_with(FakeLauncher::never_ready(), &["u1"]);
        let session = h.manager.create_session("u1", None, None).unwrap();

        let manager = Arc::clone(&h.manager);
        let id = session.id.clone();
        let pending = tokio::spawn(async move { manager.send_message(&id, "hi", None).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.manager.cancel(&session.id));
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(ModelPoolError::Cancelled(_))));

        // The load outlives the cancelled caller and cleans up when it fails
        let supervisor = h.manager.supervisor();
        tokio::time::sleep(supervisor.config().startup_timeout() + Duration::from_secs(1)).await;
        assert!(!supervisor.allocator().is_allocated("u1"));
        assert_eq!(supervisor.loaded_count(), 0);
        assert_eq!(h.launcher.kill_count().await, 1);
    }

    #[tokio::test]
    async fn test_list_update_delete() {
        let h = harness(&["u1"]);
        let older = h.manager.create_session("u1", Some("older".into()), None).unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let newer = h.manager.create_session("u1", Some("newer".into()), None).unwrap();
        h.manager.create_session("u2", None, None).unwrap();

        let titles: Vec<String> = h.manager.list_sessions("u1").into_iter().map(|s| s.title).collect();
        assert_eq!(titles, vec!["newer", "older"]);

        tokio::time::sleep(Duration::from_millis(2)).await;
        let settings = ChatSettings {
            response_style: "concise".to_string(),
            ..Default::default()
        };
        let updated = h.manager.update_settings(&older.id, settings).unwrap();
        assert_eq!(updated.settings.response_style, "concise");
        assert_eq!(h.manager.list_sessions("u1")[0].id, older.id);

        assert!(h.manager.delete_session(&newer.id));
        assert!(!h.manager.delete_session(&newer.id));
        assert!(h.store.load(&newer.id).unwrap().is_none());
        assert!(matches!(
            h.manager.update_settings(&newer.id, ChatSettings::default()),
            Err(ModelPoolError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resume_from_store() {
        let h = harness(&["u1"]);
        let session = h.manager.create_session("u1", None, None).unwrap();

        // Simulate a restart: the in-memory copy is gone, the store keeps it
        h.manager.sessions.write().remove(&session.id);
        let resumed = h.manager.resume_session(&session.id).unwrap();
        assert_eq!(resumed, session);
        assert!(h.manager.get_session(&session.id).is_some());
        assert!(h.manager.resume_session("missing").is_err());
    }

    #[tokio::test]
    async fn test_sweep_idle_sessions() {
        let h = harness(&["u1"]);
        let session = h.manager.create_session("u1", None, None).unwrap();
        h.manager.send_message(&session.id, "hello", None).await.unwrap();

        let soon = Utc::now() + TimeDelta::minutes(5);
        assert_eq!(h.manager.sweep_idle_at(soon), 0);

        let later = Utc::now() + TimeDelta::minutes(31);
        assert_eq!(h.manager.sweep_idle_at(later), 1);
        assert!(h.manager.get_session(&session.id).is_none());

        // Sweeping sessions leaves the worker resident
        assert!(h.manager.supervisor().worker("u1").is_some());
    }

    #[tokio::test]
    async fn test_stats() {
        let h = harness(&["u1"]);
        let session = h.manager.create_session("u1", None, None).unwrap();
        h.manager.send_message(&session.id, "hello", None).await.unwrap();

        let stats = h.manager.stats();
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.loaded_workers, 1);
        assert_eq!(stats.total_inferences, 1);
        assert_eq!(stats.allocator.active_allocations, 1);
    }
}
