//! Integration tests for the stream relay

use crate::integration::test_utils::{manual_clock, throttle, ScriptedClient};
use cadence::clock::Clock;
use cadence::error::{ApiError, ProviderError};
use cadence::provider::ChatMessage;
use cadence::quota::{QuotaConfig, QuotaLedger, Reservation};
use cadence::relay::{RelayEnd, RelayEvent, RelayRequest, StreamRelay};
use std::sync::Arc;
use tokio::sync::mpsc;

fn request(identity: &str) -> RelayRequest {
    RelayRequest {
        identity: identity.to_string(),
        bypass_quota: false,
        messages: vec![
            ChatMessage::system("You are a helpful coach."),
            ChatMessage::user("How long should I rest between sets?"),
        ],
        max_output_tokens: Some(200),
    }
}

fn relay_with_quota(client: Arc<ScriptedClient>, cap: u64) -> (StreamRelay, Arc<QuotaLedger>) {
    let db = cadence::store::open_temporary().unwrap();
    let clock: Arc<dyn Clock> = manual_clock();
    let config = QuotaConfig {
        daily_tokens: cap,
        ..QuotaConfig::default()
    };
    let ledger = Arc::new(QuotaLedger::open(&db, config, clock, throttle()).unwrap());
    let relay = StreamRelay::new(client, Some(Arc::clone(&ledger)), 100, throttle());
    (relay, ledger)
}

async fn collect(mut rx: mpsc::Receiver<RelayEvent>) -> Vec<RelayEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn delta(content: &str) -> RelayEvent {
    RelayEvent::Delta {
        content: content.to_string(),
    }
}

#[tokio::test]
async fn deltas_arrive_in_order_then_done() {
    let client = ScriptedClient::new();
    *client.fragments.lock() = vec!["Rest ".to_string(), String::new(), "60-90s.".to_string()];
    let (relay, ledger) = relay_with_quota(client, 10_000);
    let req = request("user-1");
    let estimate = relay.estimate(&req);

    let (tx, rx) = mpsc::channel(8);
    let (summary, events) = tokio::join!(relay.relay(req, tx), collect(rx));
    let summary = summary.unwrap();

    assert_eq!(events, vec![delta("Rest "), delta("60-90s."), RelayEvent::Done]);
    assert_eq!(summary.end, RelayEnd::Done);
    assert_eq!(summary.fragments, 2);
    assert_eq!(summary.characters, 12);
    assert_eq!(summary.tokens_reserved, estimate);
    assert!(matches!(summary.reservation, Reservation::Granted { .. }));
    assert_eq!(ledger.usage("user-1").unwrap().tokens_used, estimate);
}

#[tokio::test]
async fn mid_stream_failure_sends_one_error_and_no_done() {
    let client = ScriptedClient::new();
    *client.fragments.lock() = vec!["Partial".to_string()];
    *client.stream_error.lock() = Some(ProviderError::RequestFailed("reset".to_string()));
    let (relay, _) = relay_with_quota(client, 10_000);

    let (tx, rx) = mpsc::channel(8);
    let (summary, events) = tokio::join!(relay.relay(request("user-1"), tx), collect(rx));

    assert_eq!(summary.unwrap().end, RelayEnd::Error);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], delta("Partial"));
    assert!(matches!(events[1], RelayEvent::Error { .. }));
    assert!(!events.contains(&RelayEvent::Done));
}

#[tokio::test]
async fn failure_to_open_is_reported_in_band() {
    let client = ScriptedClient::new();
    *client.stream_open_error.lock() = Some(ProviderError::AuthFailed("bad key".to_string()));
    let (relay, _) = relay_with_quota(client, 10_000);

    let (tx, rx) = mpsc::channel(8);
    let (summary, events) = tokio::join!(relay.relay(request("user-1"), tx), collect(rx));
    assert_eq!(summary.unwrap().end, RelayEnd::Error);
    assert_eq!(events.len(), 1);
    assert!(events[0].to_sse().contains("bad key"));
}

#[tokio::test]
async fn quota_rejection_sends_no_events() {
    let client = ScriptedClient::new();
    *client.fragments.lock() = vec!["never sent".to_string()];
    let (relay, ledger) = relay_with_quota(client, 10);

    let (tx, rx) = mpsc::channel(8);
    let (result, events) = tokio::join!(relay.relay(request("anon-1"), tx), collect(rx));
    let err = result.unwrap_err();
    assert!(err.is_quota_exceeded());
    assert!(events.is_empty());
    assert_eq!(ledger.usage("anon-1").unwrap().tokens_used, 0);

    let mut req = request("anon-1");
    req.bypass_quota = true;
    let (tx, rx) = mpsc::channel(8);
    let (summary, events) = tokio::join!(relay.relay(req, tx), collect(rx));
    assert_eq!(summary.unwrap().reservation, Reservation::Bypassed);
    assert_eq!(events.last(), Some(&RelayEvent::Done));
}

#[tokio::test]
async fn dropped_receiver_ends_the_relay() {
    let client = ScriptedClient::new();
    *client.fragments.lock() = vec!["a".to_string(), "b".to_string()];
    let (relay, _) = relay_with_quota(client, 10_000);

    let (tx, rx) = mpsc::channel(8);
    drop(rx);
    let summary = relay.relay(request("user-1"), tx).await.unwrap();
    assert_eq!(summary.end, RelayEnd::Disconnected);
    assert_eq!(summary.fragments, 0);
}

#[tokio::test]
async fn empty_conversation_is_rejected() {
    let relay = StreamRelay::new(ScriptedClient::new(), None, 100, throttle());
    let mut req = request("user-1");
    req.messages.clear();
    let (tx, _rx) = mpsc::channel(1);
    let err = relay.relay(req, tx).await.unwrap_err();
    assert!(matches!(err, ApiError::InvalidRequest(_)));
}
