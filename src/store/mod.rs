//! Session store
//!
//! Authoritative in-memory model of every conversation, with best-effort
//! whole-collection persistence and broadcast change notifications.
//!
//! Every public operation is synchronous, mutates the collection atomically,
//! persists the full collection, and emits one [`StoreEvent`]. Persistence
//! failures are logged and swallowed; they never interrupt the conversation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

/// File name the collection is cached under (one JSON document).
pub const STORAGE_FILE: &str = "chat_sessions.json";

const EVENT_CAPACITY: usize = 256;
const TITLE_MAX_CHARS: usize = 20;
const PREVIEW_MAX_CHARS: usize = 40;
const DEFAULT_TITLE: &str = "新的对话";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One chat message. `thinking` marks the transient deliberation message of
/// an active turn, `streaming` the in-progress final answer; a completed
/// turn leaves at most the `thinking` marker (for collapsed display) set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub thinking: bool,
    #[serde(default)]
    pub streaming: bool,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            thinking: false,
            streaming: false,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            thinking: false,
            streaming: false,
        }
    }
}

/// One conversation. Title and preview are derived lazily, exactly once:
/// the title from the first user message, the preview from the first
/// completed answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub preview: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: String::new(),
            preview: String::new(),
            messages: Vec::new(),
            last_used_at: None,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Persistence seam. The whole collection is written as one document;
/// corrupt or missing data reads back as an empty collection.
pub trait SessionCache: Send + Sync {
    fn load(&self) -> Option<Vec<Session>>;
    fn store(&self, sessions: &[Session]) -> anyhow::Result<()>;
}

/// JSON-file cache under the application data directory.
pub struct FileCache {
    path: PathBuf,
}

impl FileCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Cache under the platform data dir, mirroring where the rest of the
    /// application keeps its state.
    pub fn in_data_dir() -> Option<Self> {
        crate::config::Config::data_dir().map(|dir| Self::new(dir.join(STORAGE_FILE)))
    }
}

impl SessionCache for FileCache {
    fn load(&self) -> Option<Vec<Session>> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&content) {
            Ok(sessions) => Some(sessions),
            Err(err) => {
                tracing::warn!(path = ?self.path, error = %err, "ignoring corrupt session cache");
                None
            }
        }
    }

    fn store(&self, sessions: &[Session]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string(sessions)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

/// In-memory cache for ephemeral runs (`session.persist = false`).
#[derive(Default)]
pub struct MemoryCache {
    sessions: Mutex<Option<Vec<Session>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionCache for MemoryCache {
    fn load(&self) -> Option<Vec<Session>> {
        self.sessions.lock().expect("memory cache poisoned").clone()
    }

    fn store(&self, sessions: &[Session]) -> anyhow::Result<()> {
        *self.sessions.lock().expect("memory cache poisoned") = Some(sessions.to_vec());
        Ok(())
    }
}

/// What changed in one atomic mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    DraftStarted,
    MessageAppended,
    TurnStarted,
    ReasoningUpdated,
    AnswerUpdated,
    TurnCompleted,
    TurnAborted,
    TurnFailed,
    Selected,
    Deleted,
    Renamed,
}

/// Change notification emitted after every mutation.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    /// Affected session; `None` for collection-level changes such as
    /// starting a draft.
    pub session_id: Option<String>,
    pub change: ChangeKind,
}

/// The session collection plus its active pointer.
///
/// Most-recently-used ordering: selection and sending move a session to the
/// front without disturbing the relative order of the rest. The active
/// session is tracked by id, never by position.
pub struct SessionStore {
    sessions: Vec<Session>,
    active_id: Option<String>,
    cache: Box<dyn SessionCache>,
    events: broadcast::Sender<StoreEvent>,
}

impl SessionStore {
    /// Load the persisted collection (empty on corrupt/missing data). The
    /// store starts in draft state: no session is active until the first
    /// send or an explicit selection.
    pub fn new(cache: Box<dyn SessionCache>) -> Self {
        let sessions = cache.load().unwrap_or_default();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions,
            active_id: None,
            cache,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active_id.as_deref()
    }

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn active_session(&self) -> Option<&Session> {
        self.active_id
            .as_deref()
            .and_then(|id| self.sessions.iter().find(|s| s.id == id))
    }

    /// Clear the active pointer without creating a collection entry; a
    /// session only materializes on the first send.
    pub fn create_draft(&mut self) {
        self.active_id = None;
        self.emit(None, ChangeKind::DraftStarted);
    }

    /// Append a user message to the active session, creating and activating
    /// a fresh session when none is active. Stale empty scaffold messages
    /// left by a previously interrupted turn are pruned first. Returns the
    /// id of the session the turn belongs to.
    pub fn append_user_message(&mut self, prompt: &str) -> String {
        let now = Utc::now();
        let existing = self
            .active_id
            .as_deref()
            .and_then(|id| self.sessions.iter().position(|s| s.id == id));

        let (id, change) = match existing {
            Some(idx) => {
                let session = &mut self.sessions[idx];
                session
                    .messages
                    .retain(|m| m.role == Role::User || !m.content.trim().is_empty());
                for message in &mut session.messages {
                    message.streaming = false;
                }
                session.messages.push(ChatMessage::user(prompt));
                session.last_used_at = Some(now);
                let id = session.id.clone();
                self.move_to_front(idx);
                (id, ChangeKind::MessageAppended)
            }
            None => {
                let mut session = Session::new();
                session.messages.push(ChatMessage::user(prompt));
                session.last_used_at = Some(now);
                let id = session.id.clone();
                self.sessions.insert(0, session);
                self.active_id = Some(id.clone());
                (id, ChangeKind::Created)
            }
        };
        self.persist();
        self.emit(Some(id.clone()), change);
        id
    }

    /// Append the turn scaffold: one empty deliberation message and one
    /// empty streaming answer message, in that order.
    pub fn begin_assistant_turn(&mut self, id: &str) {
        let Some(session) = self.session_mut(id) else {
            return;
        };
        session.messages.push(ChatMessage {
            role: Role::Assistant,
            content: String::new(),
            thinking: true,
            streaming: false,
        });
        session.messages.push(ChatMessage {
            role: Role::Assistant,
            content: String::new(),
            thinking: false,
            streaming: true,
        });
        self.persist();
        self.emit(Some(id.to_string()), ChangeKind::TurnStarted);
    }

    /// Replace the deliberation message content in place. No-op when the
    /// turn has no such message (e.g. the session was deleted mid-stream).
    pub fn update_reasoning(&mut self, id: &str, text: &str) {
        let Some(session) = self.session_mut(id) else {
            return;
        };
        let Some(pos) = session.messages.iter().rposition(|m| m.thinking) else {
            return;
        };
        session.messages[pos].content = text.to_string();
        self.persist();
        self.emit(Some(id.to_string()), ChangeKind::ReasoningUpdated);
    }

    /// Replace the streaming answer content in place. No-op without one.
    pub fn update_final(&mut self, id: &str, text: &str) {
        let Some(session) = self.session_mut(id) else {
            return;
        };
        let Some(pos) = session.messages.iter().rposition(|m| m.streaming) else {
            return;
        };
        session.messages[pos].content = text.to_string();
        self.persist();
        self.emit(Some(id.to_string()), ChangeKind::AnswerUpdated);
    }

    /// Convert the streaming message into a completed answer, drop an empty
    /// deliberation scaffold, and lazily derive title/preview.
    pub fn complete_turn(&mut self, id: &str, final_text: &str) {
        let Some(session) = self.session_mut(id) else {
            return;
        };
        if let Some(pos) = session.messages.iter().rposition(|m| m.streaming) {
            session.messages[pos].content = final_text.to_string();
            session.messages[pos].streaming = false;
        }
        session
            .messages
            .retain(|m| !(m.thinking && m.content.trim().is_empty()));
        if session.title.is_empty() {
            if let Some(first_user) = session.messages.iter().find(|m| m.role == Role::User) {
                session.title = derive_title(&first_user.content);
            }
        }
        if session.preview.is_empty() && !final_text.trim().is_empty() {
            session.preview = final_text.trim().chars().take(PREVIEW_MAX_CHARS).collect();
        }
        self.persist();
        self.emit(Some(id.to_string()), ChangeKind::TurnCompleted);
    }

    /// Tear down an interrupted turn: whatever text already arrived stays
    /// as a legitimately truncated answer, empty scaffolds are dropped, and
    /// no error message is appended.
    pub fn abort_turn(&mut self, id: &str) {
        let Some(session) = self.session_mut(id) else {
            return;
        };
        for message in &mut session.messages {
            message.streaming = false;
        }
        session
            .messages
            .retain(|m| m.role == Role::User || !m.content.trim().is_empty());
        self.persist();
        self.emit(Some(id.to_string()), ChangeKind::TurnAborted);
    }

    /// Tear down a failed turn and append one synthetic assistant message
    /// carrying the user-facing explanation.
    pub fn fail_turn(&mut self, id: &str, error_text: &str) {
        let Some(session) = self.session_mut(id) else {
            return;
        };
        for message in &mut session.messages {
            message.streaming = false;
        }
        session
            .messages
            .retain(|m| m.role == Role::User || !m.content.trim().is_empty());
        session.messages.push(ChatMessage::assistant(error_text));
        self.persist();
        self.emit(Some(id.to_string()), ChangeKind::TurnFailed);
    }

    /// Activate a session and move it to the front of the collection. The
    /// relative order of every other session is preserved.
    pub fn select_session(&mut self, id: &str) -> bool {
        let Some(idx) = self.sessions.iter().position(|s| s.id == id) else {
            return false;
        };
        self.sessions[idx].last_used_at = Some(Utc::now());
        self.move_to_front(idx);
        self.active_id = Some(id.to_string());
        self.persist();
        self.emit(Some(id.to_string()), ChangeKind::Selected);
        true
    }

    /// Remove a session. When the active one is deleted, the new front
    /// session becomes active, or a fresh empty session is synthesized so
    /// the collection is never left empty.
    pub fn delete_session(&mut self, id: &str) -> bool {
        let Some(idx) = self.sessions.iter().position(|s| s.id == id) else {
            return false;
        };
        self.sessions.remove(idx);
        if self.active_id.as_deref() == Some(id) {
            match self.sessions.first() {
                Some(front) => self.active_id = Some(front.id.clone()),
                None => {
                    let session = Session::new();
                    self.active_id = Some(session.id.clone());
                    self.sessions.push(session);
                }
            }
        }
        self.persist();
        self.emit(Some(id.to_string()), ChangeKind::Deleted);
        true
    }

    /// Overwrite a session title. Empty or whitespace-only titles are
    /// rejected; no other validation.
    pub fn rename_session(&mut self, id: &str, title: &str) -> bool {
        let title = title.trim();
        if title.is_empty() {
            return false;
        }
        let Some(session) = self.session_mut(id) else {
            return false;
        };
        session.title = title.to_string();
        self.persist();
        self.emit(Some(id.to_string()), ChangeKind::Renamed);
        true
    }

    fn session_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    fn move_to_front(&mut self, idx: usize) {
        if idx > 0 {
            let session = self.sessions.remove(idx);
            self.sessions.insert(0, session);
        }
    }

    fn persist(&self) {
        if let Err(err) = self.cache.store(&self.sessions) {
            tracing::warn!(error = %err, "failed to persist session collection");
        }
    }

    fn emit(&self, session_id: Option<String>, change: ChangeKind) {
        let _ = self.events.send(StoreEvent { session_id, change });
    }
}

fn derive_title(text: &str) -> String {
    let first = text
        .split(['。', '.', '!', '?', '！', '？', '\n'])
        .next()
        .unwrap_or("")
        .trim();
    let base = if first.is_empty() { text.trim() } else { first };
    let title: String = base.chars().take(TITLE_MAX_CHARS).collect();
    if title.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        title
    }
}
