//! Chat orchestration
//!
//! The top-level state machine: wires a user send through the request
//! controller, writes incremental snapshots into the session store, and
//! exposes the observable surface (messages, suggestions, loading and
//! retrying flags) to the presentation layer.
//!
//! Turn states: Idle → Sending → Streaming → Completing → Idle, with
//! Aborting reachable on explicit cancel and an error path that appends one
//! synthetic assistant message. A send issued while a turn is active first
//! cancels that turn and waits for its teardown before touching the store,
//! so two streams can never interleave in one session.

use crate::request::{RequestController, RequestError};
use crate::store::{ChatMessage, Role, SessionStore, StoreEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::sync::Mutex as AsyncMutex;

/// How many prior messages are rendered into each outbound prompt.
const HISTORY_WINDOW: usize = 10;

/// At most this many follow-up suggestions are kept per turn.
const SUGGESTION_LIMIT: usize = 3;

/// Instruction appended to every prompt so the backend closes its answer
/// with a parseable 【推荐问题】 block.
const SUGGESTION_INSTRUCTION: &str =
    "\n\n请在回答后额外给出3个用户可能会继续追问的相关问题，格式如下：\n【推荐问题】\n1. xxx\n2. xxx\n3. xxx";

/// Tone guidance carried on every prompt.
const STYLE_INSTRUCTION: &str =
    "\n\n请用风趣、易于理解但又不失专业性的方式回答用户。表达要轻松幽默、善用比喻和Emoji，但核心内容必须准确、专业。";

/// Shown when a turn fails for any reason other than user cancellation.
const FAILURE_NOTICE: &str = "AI 回复失败，请检查网络或稍后重试。";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Sending,
    Streaming,
    Completing,
    Aborting,
}

pub struct ChatOrchestrator {
    store: Arc<Mutex<SessionStore>>,
    controller: Arc<RequestController>,
    state: Mutex<TurnState>,
    suggestions: Mutex<Vec<String>>,
    loading: AtomicBool,
    /// Serializes turns: held for the whole lifetime of a send, so a new
    /// send only proceeds once the previous turn's teardown finished.
    turn_gate: AsyncMutex<()>,
}

impl ChatOrchestrator {
    pub fn new(store: SessionStore, controller: RequestController) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            controller: Arc::new(controller),
            state: Mutex::new(TurnState::Idle),
            suggestions: Mutex::new(Vec::new()),
            loading: AtomicBool::new(false),
            turn_gate: AsyncMutex::new(()),
        }
    }

    /// Run one full conversation turn. Resolves once the turn reached a
    /// terminal state; every effect is observable through the store and the
    /// flag getters, including the error path.
    pub async fn send(&self, text: &str) {
        let prompt = text.trim().to_string();
        if prompt.is_empty() {
            return;
        }

        // Supersede any in-flight turn, then wait for its teardown.
        self.controller.cancel();
        let _gate = self.turn_gate.lock().await;

        self.set_state(TurnState::Sending);
        self.loading.store(true, Ordering::SeqCst);
        self.suggestions.lock().expect("suggestions poisoned").clear();

        let (session_id, query) = {
            let mut store = self.lock_store();
            let history = render_history(store.active_session().map(|s| s.messages.as_slice()));
            let id = store.append_user_message(&prompt);
            store.begin_assistant_turn(&id);
            (id, compose_query(&history, &prompt))
        };

        let result = self
            .controller
            .send(
                &query,
                |final_text| {
                    if !final_text.is_empty() {
                        self.set_state(TurnState::Streaming);
                    }
                    self.lock_store().update_final(&session_id, final_text);
                },
                |reasoning| {
                    if !reasoning.is_empty() {
                        self.set_state(TurnState::Streaming);
                    }
                    self.lock_store().update_reasoning(&session_id, reasoning);
                },
            )
            .await;

        match result {
            Ok(reply) => {
                self.set_state(TurnState::Completing);
                self.lock_store().complete_turn(&session_id, &reply.final_text);
                let mut suggestions = self.suggestions.lock().expect("suggestions poisoned");
                *suggestions = reply
                    .suggestions
                    .into_iter()
                    .take(SUGGESTION_LIMIT)
                    .collect();
            }
            Err(RequestError::Cancelled) => {
                // Not a failure: keep whatever text arrived, inject nothing.
                self.set_state(TurnState::Aborting);
                self.lock_store().abort_turn(&session_id);
            }
            Err(err) => {
                tracing::warn!(error = %err, "conversation turn failed");
                self.lock_store()
                    .fail_turn(&session_id, &failure_message(&err));
                self.suggestions
                    .lock()
                    .expect("suggestions poisoned")
                    .clear();
            }
        }

        self.loading.store(false, Ordering::SeqCst);
        self.set_state(TurnState::Idle);
    }

    /// Cancel the active turn, if any. The turn's own task performs the
    /// teardown and clears the loading flag.
    pub fn pause(&self) {
        self.controller.cancel();
    }

    /// Enter draft state: the next send starts a fresh session.
    pub fn new_session(&self) {
        self.lock_store().create_draft();
        self.suggestions
            .lock()
            .expect("suggestions poisoned")
            .clear();
    }

    /// Activate a session (moves it to the front). Suggestions belong to
    /// the previous turn, so they are cleared on switch.
    pub fn select_session(&self, id: &str) -> bool {
        let selected = self.lock_store().select_session(id);
        if selected {
            self.suggestions
                .lock()
                .expect("suggestions poisoned")
                .clear();
        }
        selected
    }

    pub fn delete_session(&self, id: &str) -> bool {
        self.lock_store().delete_session(id)
    }

    pub fn rename_session(&self, id: &str, title: &str) -> bool {
        self.lock_store().rename_session(id, title)
    }

    pub fn loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub fn retrying(&self) -> bool {
        self.controller.is_retrying()
    }

    pub fn state(&self) -> TurnState {
        *self.state.lock().expect("state poisoned")
    }

    /// Suggestions for the most recently completed turn.
    pub fn suggestions(&self) -> Vec<String> {
        self.suggestions
            .lock()
            .expect("suggestions poisoned")
            .clone()
    }

    /// Messages of the active session, in order.
    pub fn active_messages(&self) -> Vec<ChatMessage> {
        self.lock_store()
            .active_session()
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    /// Subscribe to store change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.lock_store().subscribe()
    }

    /// Read access to the session collection for the presentation layer.
    pub fn with_store<R>(&self, f: impl FnOnce(&SessionStore) -> R) -> R {
        f(&self.lock_store())
    }

    fn lock_store(&self) -> std::sync::MutexGuard<'_, SessionStore> {
        self.store.lock().expect("session store poisoned")
    }

    fn set_state(&self, state: TurnState) {
        *self.state.lock().expect("state poisoned") = state;
    }
}

/// Render the rolling history window the way the backend expects it.
fn render_history(messages: Option<&[ChatMessage]>) -> String {
    let Some(messages) = messages else {
        return String::new();
    };
    let lines: Vec<String> = messages
        .iter()
        .filter(|m| !m.thinking && !m.content.trim().is_empty())
        .map(|m| match m.role {
            Role::User => format!("用户：{}", m.content),
            Role::Assistant => format!("AI：{}", m.content),
        })
        .collect();
    let start = lines.len().saturating_sub(HISTORY_WINDOW);
    lines[start..].join("\n")
}

fn compose_query(history: &str, prompt: &str) -> String {
    let mut query = String::new();
    if !history.is_empty() {
        query.push_str(history);
        query.push('\n');
    }
    query.push_str("用户：");
    query.push_str(prompt);
    query.push_str(SUGGESTION_INSTRUCTION);
    query.push_str(STYLE_INSTRUCTION);
    query
}

fn failure_message(err: &RequestError) -> String {
    match err {
        RequestError::Upstream { message, .. } if !message.trim().is_empty() => {
            format!("{FAILURE_NOTICE}\n{message}")
        }
        other => format!("{FAILURE_NOTICE}\n{other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_window_keeps_only_the_most_recent_lines() {
        let mut messages: Vec<ChatMessage> = (0..12)
            .map(|i| ChatMessage::user(format!("m{i}")))
            .collect();
        messages.push(ChatMessage {
            role: Role::Assistant,
            content: "thinking text".to_string(),
            thinking: true,
            streaming: false,
        });
        let history = render_history(Some(&messages));
        let lines: Vec<&str> = history.lines().collect();
        assert_eq!(lines.len(), HISTORY_WINDOW);
        assert_eq!(lines[0], "用户：m2");
        assert_eq!(lines[9], "用户：m11");
        assert!(!history.contains("thinking text"));
    }

    #[test]
    fn query_carries_prompt_and_suggestion_instruction() {
        let query = compose_query("用户：早些的问题\nAI：早些的回答", "新问题");
        assert!(query.starts_with("用户：早些的问题\n"));
        assert!(query.contains("用户：新问题"));
        assert!(query.contains("【推荐问题】"));
    }

    #[test]
    fn failure_message_includes_upstream_detail() {
        let message = failure_message(&RequestError::Upstream {
            status: 500,
            message: "quota exceeded".to_string(),
        });
        assert!(message.starts_with(FAILURE_NOTICE));
        assert!(message.contains("quota exceeded"));
    }
}
