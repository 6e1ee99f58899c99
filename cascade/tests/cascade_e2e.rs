//! Two-watcher escalation from trigger to acknowledgment

mod common;

use chrono::Duration;

use cascade::ingress::CallEventKind;
use cascade::store::{AlertStatus, CallResult, Channel, IncidentStatus, WatcherLink};
use cascade::CascadeConfig;
use common::{phone_of, Harness};

fn seed_pair(h: &Harness) {
    h.seed(WatcherLink::new("S", "W1", 1).with_call_policy(25, 2, 60));
    h.seed(WatcherLink::new("S", "W2", 2).with_call_policy(25, 2, 60));
}

#[tokio::test]
async fn test_w1_exhausts_retries_and_w2_acknowledges() {
    let h = Harness::new();
    seed_pair(&h);

    let incident = h.engine.trigger("S").await.unwrap().incident;
    let report = h.report(&incident.id).await;
    assert_eq!(report.alerts.len(), 4);
    for watcher in ["W1", "W2"] {
        for channel in [Channel::Chat, Channel::Call] {
            assert!(report
                .alerts
                .iter()
                .any(|a| a.watcher_id == watcher && a.channel == channel));
        }
    }
    assert_eq!(h.telephony.placed_to(&phone_of("W1")), 1);
    assert_eq!(h.chat.sent().len(), 2);

    // W1 does not pick up; W2 answers
    h.clock.advance_secs(10);
    let w1_first = h.attempts_of(&incident.id, "W1").await.remove(0);
    let w2_first = h.attempts_of(&incident.id, "W2").await.remove(0);
    h.call_event("tel-1", &w1_first, CallEventKind::Hangup, None, Some("no-answer"))
        .await;
    h.call_event("tel-2", &w2_first, CallEventKind::Answered, None, None).await;

    // W2's answered call survives its ring timeout; W1 is retried 60s after its hangup
    h.advance(15).await;
    h.advance(45).await;
    h.advance(25).await;

    let w1 = h.attempts_of(&incident.id, "W1").await;
    assert_eq!(w1.len(), 2);
    assert_eq!(w1[0].result, Some(CallResult::NoAnswer));
    assert_eq!(w1[1].result, Some(CallResult::NoAnswer));
    let gap = w1[1].started_at - w1[0].ended_at.unwrap();
    assert_eq!(gap, Duration::seconds(60));

    let report = h.report(&incident.id).await;
    let w1_call = report
        .alerts
        .iter()
        .find(|a| a.watcher_id == "W1" && a.channel == Channel::Call)
        .unwrap();
    assert_eq!(w1_call.status, AlertStatus::Failed);
    assert_eq!(report.incident.status, IncidentStatus::Active);
    assert!(!report.pending_jobs.is_empty());

    // W2 presses 1 on attempt 1
    let w2_first = h.attempts_of(&incident.id, "W2").await.remove(0);
    assert!(w2_first.ended_at.is_none());
    h.call_event("tel-3", &w2_first, CallEventKind::Digits, Some("1"), None)
        .await;

    let report = h.report(&incident.id).await;
    assert_eq!(report.incident.status, IncidentStatus::Acknowledged);
    assert_eq!(report.incident.acknowledged_by.as_deref(), Some("W2"));
    assert!(report.pending_jobs.is_empty());
    assert!(h.telephony.hangups().contains(w2_first.provider_call_id.as_ref().unwrap()));

    // Nothing else fires afterwards
    let calls_before = h.telephony.placed().len();
    let chats_before = h.chat.sent().len();
    for _ in 0..6 {
        assert_eq!(h.advance(60).await.claimed, 0);
    }
    assert_eq!(h.telephony.placed().len(), calls_before);
    assert_eq!(h.chat.sent().len(), chats_before);
}

#[tokio::test]
async fn test_ack_removes_pending_retries_of_other_watchers() {
    let h = Harness::new();
    seed_pair(&h);
    let incident = h.engine.trigger("S").await.unwrap().incident;

    h.clock.advance_secs(10);
    let w1_first = h.attempts_of(&incident.id, "W1").await.remove(0);
    let w2_first = h.attempts_of(&incident.id, "W2").await.remove(0);
    h.call_event("tel-1", &w1_first, CallEventKind::Hangup, None, Some("busy"))
        .await;
    assert!(h
        .report(&incident.id)
        .await
        .pending_jobs
        .iter()
        .any(|j| j.action_type == "retry_call"));

    h.call_event("tel-2", &w2_first, CallEventKind::Answered, None, None).await;
    h.call_event("tel-3", &w2_first, CallEventKind::Digits, Some("1"), None)
        .await;

    let report = h.report(&incident.id).await;
    assert_eq!(report.incident.acknowledged_by.as_deref(), Some("W2"));
    assert!(report.pending_jobs.is_empty());

    h.advance(60).await;
    h.advance(60).await;
    assert_eq!(h.telephony.placed_to(&phone_of("W1")), 1);
}

#[tokio::test]
async fn test_chat_reply_acknowledges_while_calls_ring() {
    let h = Harness::new();
    seed_pair(&h);
    let incident = h.engine.trigger("S").await.unwrap().incident;

    h.clock.advance_secs(5);
    h.chat_reply("upd-1", "W1", "help").await;

    let report = h.report(&incident.id).await;
    assert_eq!(report.incident.status, IncidentStatus::Acknowledged);
    assert_eq!(report.incident.acknowledged_by.as_deref(), Some("W1"));
    assert!(report.pending_jobs.is_empty());

    // Ring timeouts were removed with the rest of the schedule
    assert_eq!(h.advance(30).await.claimed, 0);
}

#[tokio::test]
async fn test_hangup_on_ack_stops_ringing_calls() {
    let h = Harness::with_config(CascadeConfig {
        hangup_on_ack: true,
        ..CascadeConfig::default()
    });
    seed_pair(&h);
    let incident = h.engine.trigger("S").await.unwrap().incident;

    h.clock.advance_secs(5);
    h.chat_reply("upd-1", "W1", "ok").await;

    let hangups = h.telephony.hangups();
    for watcher in ["W1", "W2"] {
        let attempt = h.attempts_of(&incident.id, watcher).await.remove(0);
        assert!(hangups.contains(attempt.provider_call_id.as_ref().unwrap()));
    }
}

#[tokio::test]
async fn test_ack_leaves_ringing_calls_alone_by_default() {
    let h = Harness::new();
    seed_pair(&h);
    h.engine.trigger("S").await.unwrap();

    h.clock.advance_secs(5);
    h.chat_reply("upd-1", "W1", "ok").await;
    assert!(h.telephony.hangups().is_empty());
}
