use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use rpchan::{
    decode_fn, from_stream, listen, transports::TransportError, Context, ContextError,
    DecodeErrorPolicy, JsonCodec, Listener, ListenerConfig, ListenerState, RawMessage,
    SourceError, StreamSource, Termination,
};
use serde::Deserialize;
use tokio::time::{sleep, timeout, Instant};

#[derive(Debug, Deserialize, PartialEq)]
struct T {
    a: i64,
    b: i64,
    c: String,
}

fn t(a: i64) -> T {
    T {
        a,
        b: a * 2,
        c: format!("value {a}"),
    }
}

fn json(a: i64) -> Result<RawMessage, TransportError> {
    Ok(RawMessage::new(
        format!(r#"{{"a":{a},"b":{},"c":"value {a}"}}"#, a * 2).into_bytes(),
    ))
}

fn garbage() -> Result<RawMessage, TransportError> {
    Ok(RawMessage::new(b"{\"a\": oops".to_vec()))
}

/// Source fed by the test through a channel, recording whether it was released
struct ChannelSource {
    messages: async_channel::Receiver<RawMessage>,
    receives: Arc<AtomicUsize>,
    released: Arc<AtomicBool>,
}

#[derive(Clone)]
struct ChannelSourceHandle {
    messages: async_channel::Sender<RawMessage>,
    receives: Arc<AtomicUsize>,
    released: Arc<AtomicBool>,
}

fn channel_source() -> (ChannelSource, ChannelSourceHandle) {
    let (sender, receiver) = async_channel::unbounded();
    let receives = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicBool::new(false));
    (
        ChannelSource {
            messages: receiver,
            receives: receives.clone(),
            released: released.clone(),
        },
        ChannelSourceHandle {
            messages: sender,
            receives,
            released,
        },
    )
}

#[async_trait]
impl StreamSource for ChannelSource {
    async fn receive(&mut self) -> Result<RawMessage, SourceError> {
        self.receives.fetch_add(1, Ordering::SeqCst);
        self.messages.recv().await.map_err(|_| SourceError::Closed)
    }

    async fn close(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn values_arrive_in_order() {
    let source = from_stream(stream::iter((0..50).map(json)));
    let subscription = Listener::new(source, JsonCodec).listen::<T>(&Context::background(), 4);
    let probe = subscription.clone();

    let values = subscription.collect().await;

    assert_eq!(values, (0..50).map(t).collect::<Vec<_>>());
    assert!(matches!(probe.closed().await, Some(Termination::SourceClosed)));
    let metrics = probe.metrics();
    assert_eq!(metrics.messages_received, 50);
    assert_eq!(metrics.values_delivered, 50);
    assert_eq!(metrics.decode_errors, 0);
}

#[tokio::test]
async fn decode_failures_are_skipped() {
    let source = from_stream(stream::iter(vec![json(1), garbage(), json(3)]));
    let subscription = listen::<T, _, _>(&Context::background(), source, JsonCodec, 1);
    let probe = subscription.clone();

    assert_eq!(subscription.collect().await, vec![t(1), t(3)]);
    assert!(matches!(probe.closed().await, Some(Termination::SourceClosed)));
    assert_eq!(probe.metrics().decode_errors, 1);
}

#[tokio::test]
async fn decode_failures_can_end_the_sequence() {
    let source = from_stream(stream::iter(vec![json(1), garbage(), json(3)]));
    let subscription = Listener::new(source, JsonCodec)
        .decode_errors(DecodeErrorPolicy::Terminate)
        .listen::<T>(&Context::background(), 1);
    let probe = subscription.clone();

    assert_eq!(subscription.collect().await, vec![t(1)]);
    match probe.closed().await {
        Some(Termination::Decode(error)) => assert!(error.to_string().contains("invalid json")),
        other => panic!("unexpected termination {other:?}"),
    }
}

#[tokio::test]
async fn an_expired_context_yields_nothing() {
    let (source, handle) = channel_source();
    handle.messages.send(RawMessage::new(b"1".to_vec())).await.unwrap();
    let (ctx, cancel) = Context::background().with_cancel();
    cancel.cancel();

    let mut subscription = Listener::new(source, decode_fn(|payload: &[u8]| {
        std::str::from_utf8(payload).map(str::to_owned)
    }))
    .listen::<String>(&ctx, 1);

    assert_eq!(subscription.next().await, None);
    assert!(matches!(
        subscription.closed().await,
        Some(Termination::Cancelled(ContextError::Canceled))
    ));
    assert_eq!(subscription.metrics().messages_received, 0);
    assert!(handle.released.load(Ordering::SeqCst));
    assert_eq!(subscription.state(), ListenerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn cancelling_mid_stream_ends_the_sequence_promptly() {
    let (source, handle) = channel_source();
    let (ctx, cancel) = Context::background().with_cancel();
    let mut subscription = Listener::new(source, JsonCodec).listen::<T>(&ctx, 8);

    for a in 0..3 {
        handle.messages.send(json(a).unwrap()).await.unwrap();
    }
    assert_eq!(subscription.next().await, Some(t(0)));

    cancel.cancel();
    // values still buffered are not delivered after the cancellation
    let next = timeout(Duration::from_millis(50), subscription.next()).await;
    assert_eq!(next.unwrap(), None);
    assert_eq!(subscription.next().await, None);

    assert!(matches!(
        subscription.closed().await,
        Some(Termination::Cancelled(ContextError::Canceled))
    ));
    assert!(handle.released.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn a_full_buffer_does_not_outlive_the_deadline() {
    let (source, handle) = channel_source();
    let (ctx, _) = Context::background().with_timeout(Duration::from_secs(1));
    let subscription = Listener::new(source, JsonCodec).listen::<T>(&ctx, 1);

    // nobody consumes: the worker blocks pushing the second value
    for a in 0..5 {
        handle.messages.send(json(a).unwrap()).await.unwrap();
    }

    let termination = timeout(Duration::from_secs(5), subscription.closed())
        .await
        .expect("the worker stops at the deadline");
    assert!(matches!(
        termination,
        Some(Termination::Cancelled(ContextError::DeadlineExceeded))
    ));
    assert_eq!(subscription.metrics().values_delivered, 1);
}

#[tokio::test(start_paused = true)]
async fn unbuffered_listeners_hand_values_over_one_at_a_time() {
    let (source, handle) = channel_source();
    for a in 0..3 {
        handle.messages.send(json(a).unwrap()).await.unwrap();
    }
    let mut subscription = Listener::new(source, JsonCodec).listen::<T>(&Context::background(), 0);

    sleep(Duration::from_millis(10)).await;
    // the first value waits for a consumer, the second message isn't even read
    assert_eq!(subscription.metrics().messages_received, 1);
    assert_eq!(subscription.metrics().values_delivered, 0);
    assert_eq!(handle.receives.load(Ordering::SeqCst), 1);

    assert_eq!(subscription.next().await, Some(t(0)));
    sleep(Duration::from_millis(10)).await;
    assert_eq!(subscription.metrics().messages_received, 2);
    assert_eq!(subscription.metrics().values_delivered, 1);

    assert_eq!(subscription.next().await, Some(t(1)));
    assert_eq!(subscription.next().await, Some(t(2)));
}

#[tokio::test(start_paused = true)]
async fn buffered_listeners_read_ahead() {
    let (source, handle) = channel_source();
    for a in 0..3 {
        handle.messages.send(json(a).unwrap()).await.unwrap();
    }
    let subscription = Listener::new(source, JsonCodec).listen::<T>(&Context::background(), 1);

    sleep(Duration::from_millis(10)).await;
    // one value buffered, the second one waiting for room
    assert_eq!(subscription.metrics().messages_received, 2);
    assert_eq!(subscription.metrics().values_delivered, 1);
}

#[tokio::test]
async fn every_consumer_observes_the_end_once_and_for_all() {
    let source = from_stream(stream::iter((0..10).map(json)));
    let first = Listener::new(source, JsonCodec).listen::<T>(&Context::background(), 2);
    let second = first.clone();

    let (left, right) = tokio::join!(first.collect(), second.collect());
    let mut all: Vec<i64> = left.iter().chain(right.iter()).map(|value| value.a).collect();
    all.sort_unstable();
    assert_eq!(all, (0..10).collect::<Vec<_>>());

    let source = from_stream(stream::iter(vec![json(1)]));
    let mut subscription = Listener::new(source, JsonCodec).listen::<T>(&Context::background(), 0);
    assert_eq!(subscription.next().await, Some(t(1)));
    for _ in 0..3 {
        assert_eq!(subscription.next().await, None);
    }
}

#[tokio::test]
async fn transport_failures_end_the_sequence_with_their_cause() {
    let source = from_stream(stream::iter(vec![
        json(1),
        Err(TransportError::NotBinaryMessage),
        json(2),
    ]));
    let subscription = Listener::new(source, JsonCodec).listen::<T>(&Context::background(), 1);
    let probe = subscription.clone();

    assert_eq!(subscription.collect().await, vec![t(1)]);
    match probe.closed().await {
        Some(termination @ Termination::Source(_)) => {
            assert!(!termination.is_graceful());
            if let Termination::Source(error) = termination {
                assert!(matches!(
                    *error,
                    SourceError::Transport(TransportError::NotBinaryMessage)
                ));
            }
        }
        other => panic!("unexpected termination {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn dropping_the_subscription_releases_the_source() {
    let (source, handle) = channel_source();
    let subscription = Listener::new(source, JsonCodec).listen::<T>(&Context::background(), 1);
    sleep(Duration::from_millis(10)).await;
    assert!(!handle.released.load(Ordering::SeqCst));

    drop(subscription);

    for _ in 0..100 {
        if handle.released.load(Ordering::SeqCst) {
            break;
        }
        sleep(Duration::from_millis(1)).await;
    }
    assert!(handle.released.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn deadline_scenario_ten_ticks() {
    let start = Instant::now();
    let ticks = stream::unfold(0i64, |a| async move {
        sleep(Duration::from_secs(1)).await;
        Some((json(a), a + 1))
    });
    let (ctx, _) = Context::background().with_timeout(Duration::from_secs(10));
    let deadline = ctx.deadline().unwrap();

    let mut received = Vec::new();
    let mut subscription = Listener::new(from_stream(ticks), JsonCodec).listen::<T>(&ctx, 1);
    while let Some(value) = subscription.next().await {
        assert!(Instant::now() < deadline);
        received.push(value.a);
    }

    assert!((9..=10).contains(&received.len()), "{received:?}");
    assert_eq!(received, (0..received.len() as i64).collect::<Vec<_>>());
    assert!(Instant::now() - start >= Duration::from_secs(10));
    assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
}

#[tokio::test]
async fn into_stream_works_with_stream_combinators() {
    let source = from_stream(stream::iter((1..=4).map(json)));
    let subscription = Listener::new(source, JsonCodec)
        .with_config(ListenerConfig {
            buffer_size: 2,
            ..ListenerConfig::default()
        })
        .start::<T>(&Context::background());

    let sum: i64 = subscription
        .into_stream()
        .map(|value| value.b)
        .fold(0, |acc, b| async move { acc + b })
        .await;
    assert_eq!(sum, 20);
}

#[test]
fn config_deserializes_with_defaults() {
    let config: ListenerConfig = serde_json::from_str(r#"{"decode_errors": "terminate"}"#).unwrap();
    assert_eq!(config.buffer_size, 0);
    assert_eq!(config.decode_errors, DecodeErrorPolicy::Terminate);
    assert_eq!(config.close_timeout_ms, 1_000);
    assert_eq!(
        serde_json::from_str::<ListenerConfig>("{}").unwrap(),
        ListenerConfig::default()
    );
}
