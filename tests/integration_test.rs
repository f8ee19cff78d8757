//! Integration tests for the streaming pipeline
//!
//! These tests run against scripted engines, so no inference server is needed

use async_trait::async_trait;
use chatgate::core::{EngineError, GenerationParams, InferenceEngine, ScriptedEngine, TokenSink};
use chatgate::{Gateway, GatewayError, GenerateRequest, Role, Settings, StreamEvent, Turn};
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn gateway(engine: Arc<dyn InferenceEngine>) -> Gateway {
    Gateway::new(engine, Settings::default())
}

fn request(session_id: &str, prompt: &str) -> GenerateRequest {
    GenerateRequest {
        session_id: session_id.to_string(),
        prompt: prompt.to_string(),
        params: GenerationParams::default(),
        new_context: false,
    }
}

async fn run(gateway: &Gateway, request: GenerateRequest) -> Vec<StreamEvent> {
    gateway.pipeline().handle(request).collect().await
}

fn reply_text(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Token(token) => Some(token.as_str()),
            _ => None,
        })
        .collect()
}

fn assert_alternates(history: &[Turn]) {
    for (i, turn) in history.iter().enumerate() {
        let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
        assert_eq!(turn.role(), expected, "turn {} out of order: {:?}", i, history);
    }
}

#[tokio::test]
async fn test_sequential_requests_alternate_roles() {
    let gateway = gateway(Arc::new(ScriptedEngine::from_reply("Hi there")));

    for prompt in ["one", "two", "three"] {
        let events = run(&gateway, request("s1", prompt)).await;
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }

    let history = gateway.store().history("s1").await;
    assert_eq!(history.len(), 6);
    assert_alternates(&history);
    assert_eq!(history[4], Turn::user("three"));
    assert_eq!(history[5], Turn::assistant("Hi there"));
}

#[tokio::test]
async fn test_concurrent_requests_on_one_session_stay_ordered() {
    let engine = ScriptedEngine::from_reply("ok then").with_delay(Duration::from_millis(5));
    let gateway = Arc::new(gateway(Arc::new(engine)));

    let mut tasks = Vec::new();
    for i in 0..5 {
        let gateway = gateway.clone();
        tasks.push(tokio::spawn(async move {
            run(&gateway, request("shared", &format!("message {}", i))).await
        }));
    }
    for task in tasks {
        let events = task.await.unwrap();
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }

    let history = gateway.store().history("shared").await;
    assert_eq!(history.len(), 10);
    assert_alternates(&history);
}

#[tokio::test]
async fn test_new_context_forgets_earlier_turns() {
    let engine = Arc::new(ScriptedEngine::from_reply("Sure"));
    let gateway = gateway(engine.clone());

    run(&gateway, request("s1", "hello")).await;

    let mut fresh = request("s1", "bye");
    fresh.new_context = true;
    run(&gateway, fresh).await;

    assert_eq!(
        gateway.store().history("s1").await,
        vec![Turn::user("bye"), Turn::assistant("Sure")]
    );

    let prompts = engine.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[0].contains("hello"));
    assert!(prompts[1].contains("<|user|>\nbye<|end|>"));
    assert!(!prompts[1].contains("hello"));
    assert!(prompts[1].ends_with("<|assistant|>\n"));
}

#[tokio::test]
async fn test_prompt_carries_full_history() {
    let engine = Arc::new(ScriptedEngine::from_reply("Fine"));
    let gateway = gateway(engine.clone());

    run(&gateway, request("s1", "first")).await;
    run(&gateway, request("s1", "second")).await;

    let prompts = engine.prompts();
    let last = &prompts[1];
    let first_at = last.find("first").unwrap();
    let reply_at = last.find("<|assistant|>\nFine<|end|>").unwrap();
    let second_at = last.find("second").unwrap();
    assert!(first_at < reply_at && reply_at < second_at);
}

#[tokio::test]
async fn test_streamed_fragments_match_committed_reply() {
    let engine = ScriptedEngine::new(["The", " answer", " is", " 42", "."]);
    let gateway = gateway(Arc::new(engine));

    let events = run(&gateway, request("s1", "question")).await;

    assert_eq!(reply_text(&events), "The answer is 42.");
    assert_eq!(
        events.last(),
        Some(&StreamEvent::Done {
            fragments: 5,
            reply_chars: 17
        })
    );
    let history = gateway.store().history("s1").await;
    assert_eq!(history[1], Turn::assistant(reply_text(&events)));
}

#[tokio::test]
async fn test_max_tokens_caps_the_reply() {
    let engine = ScriptedEngine::new(["a", "b", "c", "d"]);
    let gateway = gateway(Arc::new(engine));

    let mut capped = request("s1", "letters");
    capped.params.max_tokens = 2;
    let events = run(&gateway, capped).await;

    assert_eq!(reply_text(&events), "ab");
    assert_eq!(gateway.store().history("s1").await[1], Turn::assistant("ab"));
}

#[tokio::test]
async fn test_engine_failure_commits_nothing() {
    let engine = ScriptedEngine::new(["partial", " reply"]).fail_after(1, "out of memory");
    let gateway = gateway(Arc::new(engine));

    let events = run(&gateway, request("s1", "hello")).await;

    assert_eq!(events[0], StreamEvent::Token("partial".into()));
    assert!(matches!(&events[1], StreamEvent::Error(msg) if msg.contains("out of memory")));
    assert_eq!(events.len(), 2);
    assert_eq!(gateway.store().history("s1").await, vec![Turn::user("hello")]);
}

#[tokio::test]
async fn test_dropped_stream_cancels_generation() {
    let engine = ScriptedEngine::new(["one", " two", " three", " four"])
        .with_delay(Duration::from_millis(30));
    let gateway = gateway(Arc::new(engine));

    let mut stream = gateway.pipeline().handle(request("s1", "count"));
    assert_eq!(stream.next().await, Some(StreamEvent::Token("one".into())));
    drop(stream);

    let engine = gateway.pipeline().engine();
    for _ in 0..100 {
        if engine.stats().cancelled == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(engine.stats().cancelled, 1);
    assert_eq!(engine.stats().completed, 0);
    assert_eq!(gateway.store().history("s1").await, vec![Turn::user("count")]);

    // the engine is free for the next request
    let events = run(&gateway, request("s2", "again")).await;
    assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let engine = ScriptedEngine::from_reply("noted").with_delay(Duration::from_millis(5));
    let gateway = Arc::new(gateway(Arc::new(engine)));

    let a = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            for i in 0..3 {
                run(&gateway, request("A", &format!("alpha {}", i))).await;
            }
        })
    };
    let b = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            for i in 0..3 {
                run(&gateway, request("B", &format!("beta {}", i))).await;
            }
        })
    };
    a.await.unwrap();
    b.await.unwrap();

    let history_a = gateway.store().history("A").await;
    let history_b = gateway.store().history("B").await;
    assert_eq!(history_a.len(), 6);
    assert_eq!(history_b.len(), 6);
    assert!(history_a.iter().all(|t| !t.content().contains("beta")));
    assert!(history_b.iter().all(|t| !t.content().contains("alpha")));

    // resetting one session leaves the other untouched
    gateway.store().reset("A").await;
    assert!(gateway.store().history("A").await.is_empty());
    assert_eq!(gateway.store().history("B").await.len(), 6);
}

/// Records how many generations run at the same time
struct OverlapProbe {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl InferenceEngine for OverlapProbe {
    fn name(&self) -> &str {
        "probe"
    }

    async fn generate(
        &self,
        _prompt: &str,
        _params: &GenerationParams,
        sink: &mut TokenSink,
    ) -> Result<(), EngineError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let sent = sink.send("done").await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        sent.map_err(Into::into)
    }
}

#[tokio::test]
async fn test_engine_runs_one_generation_at_a_time() {
    let probe = Arc::new(OverlapProbe {
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let gateway = Arc::new(gateway(probe.clone()));

    let mut tasks = Vec::new();
    for i in 0..6 {
        let gateway = gateway.clone();
        tasks.push(tokio::spawn(async move {
            run(&gateway, request(&format!("session-{}", i), "go")).await
        }));
    }
    for task in tasks {
        let events = task.await.unwrap();
        assert_eq!(reply_text(&events), "done");
    }

    assert_eq!(probe.peak.load(Ordering::SeqCst), 1);
    for i in 0..6 {
        let history = gateway.store().history(&format!("session-{}", i)).await;
        assert_eq!(history, vec![Turn::user("go"), Turn::assistant("done")]);
    }
}

#[tokio::test]
async fn test_new_context_history_during_generation() {
    let engine = ScriptedEngine::new(["See", " you"]).with_delay(Duration::from_millis(30));
    let gateway = gateway(Arc::new(engine));

    run(&gateway, request("s1", "hello")).await;

    let mut fresh = request("s1", "bye");
    fresh.new_context = true;
    let mut stream = gateway.pipeline().handle(fresh);
    assert_eq!(stream.next().await, Some(StreamEvent::Token("See".into())));

    assert_eq!(gateway.store().history("s1").await, vec![Turn::user("bye")]);

    let rest: Vec<StreamEvent> = stream.collect().await;
    assert!(matches!(rest.last(), Some(StreamEvent::Done { .. })));
    assert_eq!(
        gateway.store().history("s1").await,
        vec![Turn::user("bye"), Turn::assistant("See you")]
    );
}

#[tokio::test]
async fn test_dropped_before_first_fragment_keeps_only_user_turn() {
    let engine = Arc::new(ScriptedEngine::new(["slow"]).with_delay(Duration::from_millis(300)));
    let gateway = gateway(engine.clone());

    let stream = gateway.pipeline().handle(request("s1", "hello"));
    for _ in 0..100 {
        if !engine.prompts().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(engine.prompts().len(), 1);
    drop(stream);

    let actor = gateway.pipeline().engine();
    for _ in 0..100 {
        if actor.stats().cancelled == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(actor.stats().cancelled, 1);
    assert_eq!(actor.stats().completed, 0);
    assert_eq!(gateway.store().history("s1").await, vec![Turn::user("hello")]);
}

#[tokio::test]
async fn test_request_abandoned_while_session_busy_is_discarded() {
    let engine = ScriptedEngine::new(["a", "b", "c"]).with_delay(Duration::from_millis(20));
    let gateway = gateway(Arc::new(engine));

    let mut busy = gateway.pipeline().handle(request("s1", "first"));
    assert_eq!(busy.next().await, Some(StreamEvent::Token("a".into())));

    drop(gateway.pipeline().handle(request("s1", "abandoned")));
    let mut wipe = request("s1", "wipe");
    wipe.new_context = true;
    drop(gateway.pipeline().handle(wipe));

    let rest: Vec<StreamEvent> = busy.collect().await;
    assert!(matches!(rest.last(), Some(StreamEvent::Done { .. })));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = run(&gateway, request("s1", "second")).await;
    assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));

    let history = gateway.store().history("s1").await;
    assert_eq!(
        history,
        vec![
            Turn::user("first"),
            Turn::assistant("abc"),
            Turn::user("second"),
            Turn::assistant("abc"),
        ]
    );
    assert_alternates(&history);
}

#[tokio::test]
async fn test_stream_reply_surfaces_generation_failure() {
    let engine = ScriptedEngine::new(["half"]).fail_after(1, "backend down");
    let gateway = gateway(Arc::new(engine));

    let mut received = String::new();
    let result = gateway
        .stream_reply(request("s1", "hello"), |fragment| received.push_str(fragment))
        .await;

    assert!(matches!(result, Err(GatewayError::Generation(msg)) if msg.contains("backend down")));
    assert_eq!(received, "half");
}

#[tokio::test]
async fn test_stream_reply_returns_reply_length() {
    let gateway = gateway(Arc::new(ScriptedEngine::from_reply("Hi there")));

    let mut received = String::new();
    let chars = gateway
        .stream_reply(request("s1", "hello"), |fragment| received.push_str(fragment))
        .await
        .unwrap();

    assert_eq!(chars, 8);
    assert_eq!(received, "Hi there");
}
