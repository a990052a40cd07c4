//! End-to-end conversation flow tests
//!
//! Drives the orchestrator through the public surface with a channel-paced
//! fake transport, so interruption points are deterministic rather than
//! timing-dependent.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use quantchat_agent::chat::ChatOrchestrator;
use quantchat_agent::content::ContentSplitter;
use quantchat_agent::request::{
    ByteStream, ChatRequest, RequestController, StreamTransport, TransportError,
};
use quantchat_agent::store::{MemoryCache, Role, SessionStore, StoreEvent};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

type ChunkResult = Result<Bytes, TransportError>;

/// Transport whose streams are fed chunk-by-chunk through channels.
struct PacedTransport {
    feeds: Mutex<VecDeque<mpsc::Receiver<ChunkResult>>>,
}

impl PacedTransport {
    fn new(feeds: Vec<mpsc::Receiver<ChunkResult>>) -> Self {
        Self {
            feeds: Mutex::new(feeds.into()),
        }
    }
}

#[async_trait]
impl StreamTransport for PacedTransport {
    async fn open(
        &self,
        _request: &ChatRequest,
        _abort: watch::Receiver<bool>,
    ) -> Result<ByteStream, TransportError> {
        let rx = self
            .feeds
            .lock()
            .expect("feeds poisoned")
            .pop_front()
            .expect("unexpected extra open");
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}

/// Transport that fails every attempt.
struct FailingTransport;

#[async_trait]
impl StreamTransport for FailingTransport {
    async fn open(
        &self,
        _request: &ChatRequest,
        _abort: watch::Receiver<bool>,
    ) -> Result<ByteStream, TransportError> {
        Err(TransportError::Network("connection refused".to_string()))
    }
}

fn orchestrator(transport: Arc<dyn StreamTransport>) -> ChatOrchestrator {
    let controller = RequestController::new(transport, ContentSplitter::default(), "test-user");
    ChatOrchestrator::new(SessionStore::new(Box::new(MemoryCache::new())), controller)
}

fn chunk(s: &'static str) -> ChunkResult {
    Ok(Bytes::from_static(s.as_bytes()))
}

/// Wait, via the store change feed, until a predicate over the orchestrator
/// holds.
async fn wait_until(
    orchestrator: &ChatOrchestrator,
    events: &mut broadcast::Receiver<StoreEvent>,
    pred: impl Fn(&ChatOrchestrator) -> bool,
) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if pred(orchestrator) {
                return;
            }
            let _ = events.recv().await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn a_full_turn_lands_in_the_store_with_suggestions() {
    let (tx, rx) = mpsc::channel(8);
    let transport = Arc::new(PacedTransport::new(vec![rx]));
    let orchestrator = orchestrator(transport);

    tx.send(chunk(
        "data: {\"answer\":\"<details><summary>t</summary>查看均线与成交量\",\"conversation_id\":\"c-1\"}\n",
    ))
    .await
    .expect("feed");
    tx.send(chunk(
        "data: {\"answer\":\"</details>趋势健康，可以继续持有。\\n\\n【推荐问题】\\n1. 目标价位？\\n2. 止损位？\"}\n",
    ))
    .await
    .expect("feed");
    tx.send(chunk("data: [DONE]\n")).await.expect("feed");
    drop(tx);

    orchestrator.send("AAPL 怎么看").await;

    let messages = orchestrator.active_messages();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "AAPL 怎么看");
    assert!(messages[1].thinking);
    assert_eq!(messages[1].content, "查看均线与成交量");
    assert_eq!(messages[2].content, "趋势健康，可以继续持有。");
    assert!(!messages[2].streaming);

    assert_eq!(orchestrator.suggestions(), ["目标价位？", "止损位？"]);
    assert!(!orchestrator.loading());

    orchestrator.with_store(|store| {
        let session = store.active_session().expect("session exists");
        assert_eq!(session.title, "AAPL 怎么看");
        assert_eq!(session.preview, "趋势健康，可以继续持有。");
    });
}

#[tokio::test]
async fn a_new_send_truncates_the_previous_turn_without_interleaving() {
    let (tx1, rx1) = mpsc::channel(8);
    let (tx2, rx2) = mpsc::channel(8);
    let transport = Arc::new(PacedTransport::new(vec![rx1, rx2]));
    let orchestrator = Arc::new(orchestrator(transport));
    let mut events = orchestrator.subscribe();

    let first = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.send("hello").await })
    };

    tx1.send(chunk("data: {\"answer\":\"First partial\"}\n"))
        .await
        .expect("feed");
    wait_until(&orchestrator, &mut events, |o| {
        o.active_messages()
            .iter()
            .any(|m| m.content == "First partial")
    })
    .await;

    // Second send before the first stream completes; its reply is already
    // buffered so the turn can run to completion once admitted.
    tx2.send(chunk("data: {\"answer\":\"Second answer\"}\n"))
        .await
        .expect("feed");
    drop(tx2);
    orchestrator.send("world").await;
    first.await.expect("first turn joins");

    let contents: Vec<String> = orchestrator
        .active_messages()
        .iter()
        .map(|m| m.content.clone())
        .collect();
    assert_eq!(
        contents,
        ["hello", "First partial", "world", "Second answer"]
    );
    // The truncated answer is an ordinary completed message now.
    assert!(orchestrator.active_messages().iter().all(|m| !m.streaming));
    assert!(!orchestrator.loading());
}

#[tokio::test]
async fn pause_keeps_truncated_text_and_injects_no_error() {
    let (tx, rx) = mpsc::channel(8);
    let transport = Arc::new(PacedTransport::new(vec![rx]));
    let orchestrator = Arc::new(orchestrator(transport));
    let mut events = orchestrator.subscribe();

    let turn = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.send("讲讲大盘").await })
    };

    tx.send(chunk("data: {\"answer\":\"今天大盘震荡\"}\n"))
        .await
        .expect("feed");
    wait_until(&orchestrator, &mut events, |o| {
        o.active_messages()
            .iter()
            .any(|m| m.content == "今天大盘震荡")
    })
    .await;

    orchestrator.pause();
    turn.await.expect("turn joins");

    let messages = orchestrator.active_messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "今天大盘震荡");
    assert!(!messages[1].streaming);
    assert!(!orchestrator.loading());
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_append_one_error_message() {
    let orchestrator = orchestrator(Arc::new(FailingTransport));
    orchestrator.send("你好").await;

    let messages = orchestrator.active_messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "你好");
    assert_eq!(messages[1].role, Role::Assistant);
    assert!(messages[1].content.starts_with("AI 回复失败"));
    assert!(orchestrator.suggestions().is_empty());
    assert!(!orchestrator.loading());
}

#[tokio::test]
async fn deleting_the_last_session_leaves_a_fresh_active_one() {
    let (tx, rx) = mpsc::channel(8);
    drop(tx);
    let orchestrator = orchestrator(Arc::new(PacedTransport::new(vec![rx])));
    orchestrator.send("only turn").await;

    let id = orchestrator
        .with_store(|store| store.active_id().map(str::to_string))
        .expect("active session");
    assert!(orchestrator.delete_session(&id));

    orchestrator.with_store(|store| {
        assert_eq!(store.sessions().len(), 1);
        assert_ne!(store.sessions()[0].id, id);
        assert_eq!(store.active_id(), Some(store.sessions()[0].id.as_str()));
        assert!(store.sessions()[0].messages.is_empty());
    });
}
