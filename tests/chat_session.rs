mod common;

use common::{ack_body, dm, eventually, harness, ids, push_body, settle, stored};
use futures::StreamExt;
use huddle::{
    bus::Event,
    error::{HistoryError, SendError, TransportError},
    protocol::{RECEIVE_CHANNEL_MESSAGE, RECEIVE_DIRECT_MESSAGE, NEW_CHANNEL_MESSAGE},
    ConversationKey, DeliveryState, MessageId, Outgoing,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn send_shows_pending_then_confirmed() {
    let mut h = harness();
    let key = dm("u2");
    h.session.activate(key.clone());

    let token = h.session.send(Outgoing::Text("hello".into())).unwrap();

    let snapshot = h.session.snapshot(&key);
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, MessageId::Placeholder(token));
    assert_eq!(snapshot[0].text.as_deref(), Some("hello"));
    assert_eq!(snapshot[0].delivery, DeliveryState::Pending);

    assert!(h.transport.acknowledge(1, Ok(ack_body("m1", "u1", "u2", "hello"))));

    eventually("confirmation", || {
        h.session.snapshot(&key).first().map(|m| m.delivery) == Some(DeliveryState::Confirmed)
    })
    .await;
    let snapshot = h.session.snapshot(&key);
    assert_eq!(ids(&snapshot), vec!["m1"]);
    assert_eq!(snapshot[0].text.as_deref(), Some("hello"));
}

#[tokio::test]
async fn offline_send_fails_without_duplicating() {
    let mut h = harness();
    let key = dm("u2");
    h.session.activate(key.clone());
    h.transport.set_offline(true);

    let token = h.session.send(Outgoing::Text("hello".into())).unwrap();
    assert_eq!(h.session.snapshot(&key)[0].delivery, DeliveryState::Pending);

    eventually("failure", || {
        h.session.snapshot(&key).first().map(|m| m.delivery) == Some(DeliveryState::Failed)
    })
    .await;
    let snapshot = h.session.snapshot(&key);
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot[0].id.is_placeholder_for(token));
    assert_eq!(h.session.last_failed(), Some(token));
}

#[tokio::test]
async fn dropped_connection_fails_in_flight_send() {
    let mut h = harness();
    let key = dm("u2");
    h.session.activate(key.clone());

    h.session.send(Outgoing::Text("hello".into())).unwrap();
    settle().await;
    assert_eq!(h.session.snapshot(&key)[0].delivery, DeliveryState::Pending);

    h.transport.set_offline(true);
    eventually("failure", || {
        h.session.snapshot(&key).first().map(|m| m.delivery) == Some(DeliveryState::Failed)
    })
    .await;
    assert_eq!(h.session.snapshot(&key).len(), 1);
}

#[tokio::test]
async fn ack_then_echo_keeps_one_message() {
    let mut h = harness();
    let key = dm("u2");
    h.session.activate(key.clone());
    h.session.send(Outgoing::Text("hello".into())).unwrap();

    h.transport.acknowledge(1, Ok(ack_body("m1", "u1", "u2", "hello")));
    eventually("confirmation", || ids(&h.session.snapshot(&key)) == vec!["m1"]).await;

    h.transport
        .push(RECEIVE_DIRECT_MESSAGE, push_body("m1", "u1", "u2", "hello"));
    settle().await;

    let snapshot = h.session.snapshot(&key);
    assert_eq!(ids(&snapshot), vec!["m1"]);
    assert_eq!(snapshot[0].delivery, DeliveryState::Confirmed);
}

#[tokio::test]
async fn echo_then_ack_keeps_one_message() {
    let mut h = harness();
    let key = dm("u2");
    h.session.activate(key.clone());
    h.session.send(Outgoing::Text("hello".into())).unwrap();

    h.transport
        .push(RECEIVE_DIRECT_MESSAGE, push_body("m1", "u1", "u2", "hello"));
    eventually("echo", || h.session.snapshot(&key).len() == 2).await;

    h.transport.acknowledge(1, Ok(ack_body("m1", "u1", "u2", "hello")));
    eventually("reconciliation", || ids(&h.session.snapshot(&key)) == vec!["m1"]).await;
    assert_eq!(h.session.snapshot(&key)[0].delivery, DeliveryState::Confirmed);
}

#[tokio::test]
async fn late_ack_updates_only_its_own_conversation() {
    let mut h = harness();
    let first = dm("u2");
    let second = dm("u3");

    h.session.activate(first.clone());
    h.session.send(Outgoing::Text("hello".into())).unwrap();
    h.session.activate(second.clone());
    assert_eq!(h.session.active(), Some(&second));

    h.transport.acknowledge(1, Ok(ack_body("m1", "u1", "u2", "hello")));
    eventually("late confirmation", || ids(&h.session.snapshot(&first)) == vec!["m1"]).await;
    assert!(h.session.snapshot(&second).is_empty());

    // The first conversation is no longer listened to
    h.transport
        .push(RECEIVE_DIRECT_MESSAGE, push_body("m2", "u2", "u1", "still there?"));
    settle().await;
    assert_eq!(ids(&h.session.snapshot(&first)), vec!["m1"]);
    assert!(h.session.snapshot(&second).is_empty());
}

#[tokio::test]
async fn history_merges_with_early_push() {
    let mut h = harness();
    let key = dm("u2");
    let gate = h.history.gate(&key);
    h.session.activate(key.clone());

    h.transport
        .push(RECEIVE_DIRECT_MESSAGE, push_body("m1", "u2", "u1", "first"));
    eventually("early push", || h.session.snapshot(&key).len() == 1).await;

    gate.send(Ok(vec![
        stored("m1", &key, "u2", "first"),
        stored("m2", &key, "u1", "second"),
    ]))
    .unwrap();

    eventually("history", || ids(&h.session.snapshot(&key)) == vec!["m1", "m2"]).await;
    assert_eq!(h.history.requests(), 1);
}

#[tokio::test]
async fn history_failure_leaves_conversation_usable() {
    let mut h = harness();
    let key = dm("u2");
    let mut events = h.bus.subscribe();
    let gate = h.history.gate(&key);
    h.session.activate(key.clone());

    gate.send(Err(HistoryError::Rejected("Friend not found".into())))
        .unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(Event::HistoryFailed { key: failed, reason }) = events.recv().await {
                assert_eq!(failed, key);
                break reason;
            }
        }
    })
    .await
    .unwrap();
    assert!(reason.contains("Friend not found"));
    assert!(h.session.snapshot(&key).is_empty());

    h.transport
        .push(RECEIVE_DIRECT_MESSAGE, push_body("m9", "u2", "u1", "hi"));
    eventually("push after failure", || ids(&h.session.snapshot(&key)) == vec!["m9"]).await;
}

#[tokio::test]
async fn history_of_an_abandoned_conversation_is_discarded() {
    let mut h = harness();
    let first = dm("u2");
    let gate = h.history.gate(&first);
    h.session.activate(first.clone());
    h.session.activate(dm("u3"));

    let _ = gate.send(Ok(vec![stored("m1", &first, "u2", "old")]));
    settle().await;
    assert!(h.session.snapshot(&first).is_empty());
}

#[tokio::test]
async fn pushes_for_other_conversations_are_ignored() {
    let mut h = harness();
    let key = dm("u2");
    h.session.activate(key.clone());

    h.transport
        .push(RECEIVE_DIRECT_MESSAGE, push_body("m5", "u3", "u1", "wrong room"));
    h.transport.push(
        RECEIVE_DIRECT_MESSAGE,
        json!({"message": "Something else", "user": {"id": "u2"}, "chat": {"id": "m6", "userId": "u2", "friendId": "u1"}}),
    );
    h.transport
        .push(RECEIVE_DIRECT_MESSAGE, push_body("m7", "u2", "u1", "right room"));

    eventually("matching push", || !h.session.snapshot(&key).is_empty()).await;
    settle().await;
    assert_eq!(ids(&h.session.snapshot(&key)), vec!["m7"]);
    assert!(h.session.snapshot(&dm("u3")).is_empty());
}

#[tokio::test]
async fn channel_pushes_and_sends() {
    let mut h = harness();
    let key = ConversationKey::channel("c1");
    h.session.activate(key.clone());

    h.transport.push(
        RECEIVE_CHANNEL_MESSAGE,
        json!({
            "message": NEW_CHANNEL_MESSAGE,
            "user": {"id": "u4"},
            "chat": {"id": 41, "userId": "u4", "channelId": "c1", "text": "welcome"}
        }),
    );
    eventually("channel push", || ids(&h.session.snapshot(&key)) == vec!["41"]).await;

    h.session.send(Outgoing::Text("thanks".into())).unwrap();
    let emitted = h.transport.last_emitted().unwrap();
    assert_eq!(emitted.payload["channelId"], "c1");
    assert!(emitted.payload.get("friendId").is_none());

    h.transport.acknowledge(
        emitted.seq,
        Ok(json!({"message": "Send channel message successfully", "chat": {"id": 42, "userId": "u1", "channelId": "c1", "text": "thanks"}})),
    );
    eventually("channel ack", || ids(&h.session.snapshot(&key)) == vec!["41", "42"]).await;
}

#[tokio::test]
async fn rejected_send_can_be_retried() {
    let mut h = harness();
    let key = dm("u2");
    let mut events = h.bus.subscribe();
    h.session.activate(key.clone());

    let token = h.session.send(Outgoing::Text("hello".into())).unwrap();
    h.transport.acknowledge(1, Ok(json!({"message": "Friend not found"})));
    eventually("rejection", || h.session.last_failed() == Some(token)).await;

    let notified = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(Event::Notification { message, .. }) = events.recv().await {
                break message;
            }
        }
    })
    .await
    .unwrap();
    assert!(notified.contains("Friend not found"));

    let retried = h.session.retry(token).unwrap();
    assert_ne!(retried, token);
    assert_eq!(h.transport.last_emitted().unwrap().payload["text"], "hello");

    h.transport.acknowledge(2, Ok(ack_body("m1", "u1", "u2", "hello")));
    eventually("retried confirmation", || {
        h.session.snapshot(&key).last().map(|m| m.delivery) == Some(DeliveryState::Confirmed)
    })
    .await;

    let snapshot = h.session.snapshot(&key);
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].delivery, DeliveryState::Failed);
    assert_eq!(ids(&snapshot), vec!["<pending>", "m1"]);
    assert_eq!(h.session.retry(retried), Err(SendError::NotRetryable));
}

#[tokio::test]
async fn unanswered_send_times_out() {
    let h = harness();
    let mut session = h.session.with_ack_timeout(Some(Duration::from_millis(30)));
    let key = dm("u2");
    session.activate(key.clone());

    session.send(Outgoing::Text("anyone?".into())).unwrap();
    eventually("timeout", || {
        session.snapshot(&key).first().map(|m| m.delivery) == Some(DeliveryState::Failed)
    })
    .await;

    // A late answer no longer changes a failed message
    h.transport.acknowledge(1, Ok(ack_body("m1", "u1", "u2", "anyone?")));
    settle().await;
    assert_eq!(session.snapshot(&key)[0].delivery, DeliveryState::Failed);
}

#[tokio::test]
async fn subscribers_see_each_change_until_dropped() {
    let mut h = harness();
    let key = dm("u2");
    let seen: Arc<Mutex<Vec<usize>>> = Arc::default();

    let sink = seen.clone();
    let subscription = h.session.subscribe(key.clone(), move |snapshot| {
        sink.lock().unwrap().push(snapshot.len());
    });
    h.session.activate(key.clone());

    h.session.send(Outgoing::Text("one".into())).unwrap();
    eventually("first snapshot", || seen.lock().unwrap().contains(&1)).await;

    subscription.unsubscribe();
    settle().await;
    let before = seen.lock().unwrap().len();

    h.session.send(Outgoing::Text("two".into())).unwrap();
    settle().await;
    assert_eq!(seen.lock().unwrap().len(), before);
    assert_eq!(h.session.snapshot(&key).len(), 2);
}

#[tokio::test]
async fn change_stream_yields_snapshots() {
    let mut h = harness();
    let key = dm("u2");
    let changes = h.session.changes(key.clone());
    tokio::pin!(changes);
    h.session.activate(key.clone());

    h.transport
        .push(RECEIVE_DIRECT_MESSAGE, push_body("m1", "u2", "u1", "hey"));

    let snapshot = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let snapshot = changes.next().await.unwrap();
            if !snapshot.is_empty() {
                break snapshot;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(ids(&snapshot), vec!["m1"]);
}

#[tokio::test]
async fn attachments_are_sent_as_files() {
    let mut h = harness();
    h.session.activate(dm("u2"));

    h.session
        .send(Outgoing::Attachment(huddle::Attachment::from_url(
            "https://files.example/u1/report.pdf",
        )))
        .unwrap();

    let emitted = h.transport.last_emitted().unwrap();
    assert_eq!(emitted.payload["type"], "file");
    assert_eq!(emitted.payload["fileName"], "report.pdf");
    assert_eq!(emitted.payload["url"], "https://files.example/u1/report.pdf");
    assert!(emitted.payload.get("text").is_none());

    h.transport
        .acknowledge(emitted.seq, Err(TransportError::Rejected("too large".into())));
    eventually("failed attachment", || h.session.last_failed().is_some()).await;
}

#[tokio::test]
async fn reopening_keeps_an_in_flight_send_until_it_is_confirmed() {
    let mut h = harness();
    let key = dm("u2");
    h.session.activate(key.clone());
    let token = h.session.send(Outgoing::Text("hello".into())).unwrap();

    h.session.activate(dm("u3"));
    let gate = h.history.gate(&key);
    h.session.activate(key.clone());

    let snapshot = h.session.snapshot(&key);
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot[0].id.is_placeholder_for(token));
    assert_eq!(snapshot[0].delivery, DeliveryState::Pending);

    gate.send(Ok(vec![stored("m0", &key, "u2", "earlier")])).unwrap();
    eventually("history", || h.session.snapshot(&key).len() == 2).await;

    h.transport.acknowledge(1, Ok(ack_body("m1", "u1", "u2", "hello")));
    eventually("confirmation", || ids(&h.session.snapshot(&key)) == vec!["m1", "m0"]).await;
    assert!(h
        .session
        .snapshot(&key)
        .iter()
        .all(|m| m.delivery == DeliveryState::Confirmed));
}

#[tokio::test]
async fn reopening_keeps_an_in_flight_send_until_it_fails() {
    let mut h = harness();
    let key = dm("u2");
    h.session.activate(key.clone());
    let token = h.session.send(Outgoing::Text("hello".into())).unwrap();

    h.session.activate(dm("u3"));
    h.session.activate(key.clone());
    assert_eq!(h.session.snapshot(&key).len(), 1);

    h.transport.set_offline(true);
    eventually("failure", || h.session.last_failed() == Some(token)).await;

    let snapshot = h.session.snapshot(&key);
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].delivery, DeliveryState::Failed);
    assert_eq!(snapshot[0].text.as_deref(), Some("hello"));

    h.transport.set_offline(false);
    h.session.retry(token).unwrap();
    assert_eq!(h.transport.last_emitted().unwrap().payload["text"], "hello");
}

#[tokio::test]
async fn failure_after_the_placeholder_was_cleared_is_still_visible() {
    let mut h = harness();
    let key = dm("u2");
    h.session.activate(key.clone());
    let token = h.session.send(Outgoing::Text("hello".into())).unwrap();

    h.session.store().discard(&key);
    h.transport.acknowledge(1, Err(TransportError::Rejected("Friend not found".into())));

    eventually("failed entry", || h.session.last_failed() == Some(token)).await;
    assert_eq!(h.session.snapshot(&key).len(), 1);
}

#[tokio::test]
async fn terse_acknowledgment_is_attributed_to_the_sender() {
    let mut h = harness();
    let key = dm("u2");
    h.session.activate(key.clone());
    h.session.send(Outgoing::Text("hello".into())).unwrap();

    h.transport.acknowledge(
        1,
        Ok(json!({"message": "Send direct message successfully", "chat": {"id": "m1", "text": "hello"}})),
    );

    eventually("confirmation", || ids(&h.session.snapshot(&key)) == vec!["m1"]).await;
    let message = &h.session.snapshot(&key)[0];
    assert_eq!(message.delivery, DeliveryState::Confirmed);
    assert_eq!(message.sender_id.as_str(), "u1");
    assert_eq!(message.conversation, key);
}
