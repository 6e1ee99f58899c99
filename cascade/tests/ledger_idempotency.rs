//! Inbox and outbox idempotency seen from the outside: redelivered webhooks,
//! verification ahead of the inbox, and concurrent call placement.

mod common;

use std::sync::Arc;

use cascade::engine::TELEPHONY_PROVIDER;
use cascade::ingress::{sign, HmacVerifier, Ingress, SharedSecretVerifier, WebhookRequest};
use cascade::scheduler::{ActionHandler, ScheduledAction};
use cascade::store::{attempts, Channel, IncidentStatus};
use cascade::Clock;
use common::{call_link, Harness};
use serde_json::json;

const CALL_SECRET: &str = "call-secret";
const CHAT_SECRET: &str = "chat-secret";

fn ingress(h: &Harness) -> Ingress {
    let call = HmacVerifier::new(CALL_SECRET, h.clock.clone()).unwrap();
    let chat = SharedSecretVerifier::new("x-chat-token", CHAT_SECRET).unwrap();
    Ingress::new(h.engine.clone(), Arc::new(call), Arc::new(chat))
}

fn signed(h: &Harness, body: serde_json::Value) -> WebhookRequest {
    let body = serde_json::to_vec(&body).unwrap();
    let ts = h.clock.now().timestamp();
    let signature = sign(CALL_SECRET, ts, &body).unwrap();
    WebhookRequest::new(body)
        .with_header(HmacVerifier::DEFAULT_TIMESTAMP_HEADER, ts.to_string())
        .with_header(HmacVerifier::DEFAULT_SIGNATURE_HEADER, signature)
}

#[tokio::test]
async fn test_redelivered_webhook_has_one_effect() {
    let h = Harness::new();
    h.seed(call_link("subject", "w1", 1, 2, 60));
    let incident = h.engine.trigger("subject").await.unwrap().incident;
    let attempt = h.attempts_of(&incident.id, "w1").await.remove(0);
    let ingress = ingress(&h);
    let mut events = h.engine.events().subscribe();

    let body = json!({
        "event_id": "evt-hangup-1",
        "call_id": attempt.provider_call_id,
        "attempt_id": attempt.id,
        "kind": "hangup",
        "cause": "no-answer",
    });
    let first = ingress.call_webhook(&signed(&h, body.clone())).await;
    let second = ingress.call_webhook(&signed(&h, body)).await;

    assert_eq!(first.status, 200);
    assert_eq!(first.body["outcome"], "processed");
    assert_eq!(second.status, 200);
    assert_eq!(second.body["outcome"], "duplicate");

    // Exactly one retry was scheduled for the single hangup
    let report = h.report(&incident.id).await;
    let retries: Vec<_> = report
        .pending_jobs
        .iter()
        .filter(|j| j.action_type == "retry_call")
        .collect();
    assert_eq!(retries.len(), 1);

    let mut ended = 0;
    let mut duplicates = 0;
    while let Ok(event) = events.try_recv() {
        match event.event_type() {
            "call_ended" => ended += 1,
            "inbound_duplicate" => duplicates += 1,
            _ => {}
        }
    }
    assert_eq!((ended, duplicates), (1, 1));

    let inbox = h
        .engine
        .ledger()
        .inbound(TELEPHONY_PROVIDER, "evt-hangup-1")
        .await
        .unwrap()
        .unwrap();
    assert!(inbox.processed_at.is_some());
    assert!(inbox.error.is_none());
}

#[tokio::test]
async fn test_unverified_webhook_never_reaches_the_inbox() {
    let h = Harness::new();
    h.seed(call_link("subject", "w1", 1, 2, 60));
    h.engine.trigger("subject").await.unwrap();
    let ingress = ingress(&h);

    let body = serde_json::to_vec(&json!({
        "event_id": "evt-forged",
        "call_id": "call-1",
        "kind": "digits",
        "digits": "1",
    }))
    .unwrap();
    let ts = h.clock.now().timestamp();
    let forged = WebhookRequest::new(body)
        .with_header(HmacVerifier::DEFAULT_TIMESTAMP_HEADER, ts.to_string())
        .with_header(HmacVerifier::DEFAULT_SIGNATURE_HEADER, sign("wrong", ts, b"x").unwrap());

    let reply = ingress.call_webhook(&forged).await;
    assert_eq!(reply.status, 401);
    assert!(h
        .engine
        .ledger()
        .inbound(TELEPHONY_PROVIDER, "evt-forged")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_chat_webhook_needs_the_shared_token() {
    let h = Harness::new();
    h.seed(call_link("subject", "w1", 1, 2, 60).with_channels(true, true));
    let incident = h.engine.trigger("subject").await.unwrap().incident;
    let ingress = ingress(&h);

    let body = serde_json::to_vec(&json!({
        "event_id": "upd-1",
        "chat_id": "chat-w1",
        "text": "yes",
    }))
    .unwrap();

    let rejected = ingress
        .chat_webhook(&WebhookRequest::new(body.clone()).with_header("x-chat-token", "guess"))
        .await;
    assert_eq!(rejected.status, 401);
    assert_eq!(h.report(&incident.id).await.incident.status, IncidentStatus::Active);

    let accepted = ingress
        .chat_webhook(&WebhookRequest::new(body).with_header("X-Chat-Token", CHAT_SECRET))
        .await;
    assert_eq!(accepted.status, 200);
    assert_eq!(h.report(&incident.id).await.incident.status, IncidentStatus::Acknowledged);
}

#[tokio::test]
async fn test_undecodable_payload_is_acknowledged_to_the_provider() {
    let h = Harness::new();
    let ingress = ingress(&h);
    let body = b"not json".to_vec();
    let ts = h.clock.now().timestamp();
    let request = WebhookRequest::new(body.clone())
        .with_header(HmacVerifier::DEFAULT_TIMESTAMP_HEADER, ts.to_string())
        .with_header(HmacVerifier::DEFAULT_SIGNATURE_HEADER, sign(CALL_SECRET, ts, &body).unwrap());

    let reply = ingress.call_webhook(&request).await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body["outcome"], "undecodable");
}

#[tokio::test]
async fn test_concurrent_call_placement_stores_one_call_id() {
    let h = Harness::new();
    h.seed(call_link("subject", "w1", 1, 3, 60));
    let incident = h.engine.trigger("subject").await.unwrap().incident;
    let alert_id = h.report(&incident.id).await.alerts[0].id.clone();

    let action = ScheduledAction::RetryCall {
        alert_id: alert_id.clone(),
        attempt_no: 2,
    };
    let (a, b) = tokio::join!(
        h.engine.handle(&incident.id, &action),
        h.engine.handle(&incident.id, &action)
    );
    a.unwrap();
    b.unwrap();

    let stored = h
        .store
        .run(move |conn| attempts::list_for_alert(conn, &alert_id))
        .await
        .unwrap();
    let second: Vec<_> = stored.iter().filter(|a| a.attempt_no == 2).collect();
    assert_eq!(second.len(), 1);
    assert!(second[0].provider_call_id.is_some());

    // One provider request per (incident, watcher, attempt)
    let keys: Vec<_> = h.telephony.placed().into_iter().map(|c| c.idempotency_key).collect();
    assert_eq!(keys.len(), 2);
    assert_ne!(keys[0], keys[1]);
    assert!(keys.iter().all(|k| k.starts_with(Channel::Call.as_str())));
}
