//! End-to-end session scenarios over the room and media services.
//!
//! Runs the full core (presence, room, media, router registry) against the
//! scripted in-process engine and a capturing event sink.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use conference_service::errors::SessionError;
use conference_service::events::{ParticipantLeft, SessionEvent};
use conference_service::media::{MediaKind, TransportDirection};
use conference_service::presence::PresenceStore;
use conference_test_utils::{
    audio_only_capabilities, client_dtls_parameters, full_capabilities, opus_rtp_parameters,
    vp8_rtp_parameters, ScriptedEngine, TestMeeting, TestParticipant, TestStack,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Media lifecycle
// ============================================================================

#[tokio::test]
async fn test_produce_consume_resume_then_producer_leaves() -> Result<(), anyhow::Error> {
    let stack = TestStack::new();
    let meeting = TestMeeting::random();
    let (a, _) = stack.join(&meeting.id, &TestParticipant::alice()).await;
    let (b, snapshot) = stack.join(&meeting.id, &TestParticipant::bob()).await;
    assert_eq!(snapshot.participants.len(), 2);

    let send = stack
        .media
        .create_transport(a, &meeting.id, TransportDirection::Send)
        .await?;
    stack
        .media
        .connect_transport(a, &send.id, &client_dtls_parameters())
        .await?;
    let producer_id = stack
        .media
        .produce(a, &send.id, MediaKind::Video, &vp8_rtp_parameters(), Value::Null)
        .await?;

    let announced = stack.sink.events_for(b).into_iter().find_map(|e| match e {
        SessionEvent::NewProducer(p) => Some(p),
        _ => None,
    });
    let announced = announced.expect("bob should hear about the new producer");
    assert_eq!(announced.producer_id, producer_id);
    assert_eq!(announced.user_id, "alice");
    assert_eq!(announced.kind, MediaKind::Video);
    assert!(!stack
        .sink
        .event_names_for(a)
        .contains(&"new-producer"));

    let recv = stack
        .media
        .create_transport(b, &meeting.id, TransportDirection::Recv)
        .await?;
    let consumer = stack
        .media
        .consume(b, &recv.id, &producer_id, &full_capabilities())
        .await?;
    assert!(consumer.paused);
    assert_eq!(consumer.producer_id, producer_id);
    assert_eq!(stack.engine.local().consumer_paused(&consumer.id), Some(true));

    stack.media.resume_consumer(b, &consumer.id).await;
    assert_eq!(stack.engine.local().consumer_paused(&consumer.id), Some(false));

    stack.sink.clear();
    let departure = stack.room.leave(a).await?;
    assert_eq!(departure.map(|d| d.user_id), Some("alice".to_string()));

    assert_eq!(
        stack.sink.event_names_for(b),
        vec!["consumer-closed", "participant-left"]
    );
    let left = stack.sink.events_for(b).into_iter().find_map(|e| match e {
        SessionEvent::ParticipantLeft(left) => Some(left),
        _ => None,
    });
    assert_eq!(
        left,
        Some(ParticipantLeft {
            user_id: "alice".to_string(),
            connection_id: a,
            name: "Alice".to_string(),
        })
    );
    assert_eq!(stack.engine.local().consumer_paused(&consumer.id), None);

    let late = stack
        .media
        .consume(b, &recv.id, &producer_id, &full_capabilities())
        .await;
    assert!(matches!(late, Err(SessionError::NotFound { .. })));
    Ok(())
}

#[tokio::test]
async fn test_consume_rejects_undecodable_producer() -> Result<(), anyhow::Error> {
    let stack = TestStack::new();
    let meeting = TestMeeting::random();
    let (a, _) = stack.join(&meeting.id, &TestParticipant::alice()).await;
    let (b, _) = stack.join(&meeting.id, &TestParticipant::bob()).await;

    let send = stack
        .media
        .create_transport(a, &meeting.id, TransportDirection::Send)
        .await?;
    let video = stack
        .media
        .produce(a, &send.id, MediaKind::Video, &vp8_rtp_parameters(), Value::Null)
        .await?;
    let audio = stack
        .media
        .produce(a, &send.id, MediaKind::Audio, &opus_rtp_parameters(), Value::Null)
        .await?;
    let recv = stack
        .media
        .create_transport(b, &meeting.id, TransportDirection::Recv)
        .await?;

    let refused = stack
        .media
        .consume(b, &recv.id, &video, &audio_only_capabilities())
        .await;
    assert!(matches!(refused, Err(SessionError::CannotConsume { .. })));

    let accepted = stack
        .media
        .consume(b, &recv.id, &audio, &audio_only_capabilities())
        .await?;
    assert_eq!(accepted.kind, MediaKind::Audio);
    Ok(())
}

#[tokio::test]
async fn test_producer_in_other_meeting_is_not_found() -> Result<(), anyhow::Error> {
    let stack = TestStack::new();
    let first = TestMeeting::random();
    let second = TestMeeting::random();
    let (a, _) = stack.join(&first.id, &TestParticipant::alice()).await;
    let (b, _) = stack.join(&second.id, &TestParticipant::bob()).await;

    let send = stack
        .media
        .create_transport(a, &first.id, TransportDirection::Send)
        .await?;
    let producer_id = stack
        .media
        .produce(a, &send.id, MediaKind::Audio, &opus_rtp_parameters(), Value::Null)
        .await?;
    let recv = stack
        .media
        .create_transport(b, &second.id, TransportDirection::Recv)
        .await?;

    let result = stack
        .media
        .consume(b, &recv.id, &producer_id, &full_capabilities())
        .await;
    assert!(matches!(result, Err(SessionError::NotFound { .. })));
    assert!(stack.sink.events_for(b).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_app_data_reaches_other_members() -> Result<(), anyhow::Error> {
    let stack = TestStack::new();
    let meeting = TestMeeting::random();
    let (a, _) = stack.join(&meeting.id, &TestParticipant::alice()).await;
    let (b, _) = stack.join(&meeting.id, &TestParticipant::bob()).await;

    let send = stack
        .media
        .create_transport(a, &meeting.id, TransportDirection::Send)
        .await?;
    stack
        .media
        .produce(
            a,
            &send.id,
            MediaKind::Video,
            &vp8_rtp_parameters(),
            json!({ "source": "screen" }),
        )
        .await?;

    let app_data = stack.sink.events_for(b).into_iter().find_map(|e| match e {
        SessionEvent::NewProducer(p) => Some(p.app_data),
        _ => None,
    });
    assert_eq!(app_data, Some(json!({ "source": "screen" })));
    Ok(())
}

// ============================================================================
// Chat
// ============================================================================

#[tokio::test]
async fn test_chat_reaches_every_member_in_order() -> Result<(), anyhow::Error> {
    let stack = TestStack::new();
    let meeting = TestMeeting::random();
    let (a, _) = stack.join(&meeting.id, &TestParticipant::alice()).await;
    let (b, _) = stack.join(&meeting.id, &TestParticipant::bob()).await;
    let (c, _) = stack.join(&meeting.id, &TestParticipant::carol()).await;
    stack.sink.clear();

    stack.room.relay_chat(a, "hi").await?;
    stack.room.relay_chat(a, "again").await?;

    for member in [a, b, c] {
        let chats: Vec<_> = stack
            .sink
            .events_for(member)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::ChatMessage(m) => Some(m),
                _ => None,
            })
            .collect();
        assert_eq!(chats.len(), 2);
        let contents: Vec<&str> = chats.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hi", "again"]);
        assert!(chats
            .iter()
            .all(|m| m.sender_id == "alice" && m.sender_name == "Alice"));
        assert!(chats.windows(2).all(|w| match w {
            [earlier, later] => earlier.timestamp <= later.timestamp,
            _ => true,
        }));
    }
    Ok(())
}

#[tokio::test]
async fn test_empty_chat_is_rejected_without_broadcast() {
    let stack = TestStack::new();
    let meeting = TestMeeting::random();
    let (a, _) = stack.join(&meeting.id, &TestParticipant::alice()).await;
    stack.sink.clear();

    let result = stack.room.relay_chat(a, "  ").await;

    assert!(matches!(result, Err(SessionError::BadRequest(_))));
    assert!(stack.sink.events_for(a).is_empty());
}

// ============================================================================
// Membership
// ============================================================================

#[tokio::test]
async fn test_rejoin_supersedes_older_connection() -> Result<(), anyhow::Error> {
    let stack = TestStack::new();
    let meeting = TestMeeting::random();
    let (old, _) = stack.join(&meeting.id, &TestParticipant::alice()).await;
    let (bob, _) = stack.join(&meeting.id, &TestParticipant::bob()).await;
    stack
        .media
        .create_transport(old, &meeting.id, TransportDirection::Send)
        .await?;
    stack.sink.clear();

    let (new, snapshot) = stack.join(&meeting.id, &TestParticipant::alice()).await;

    assert_eq!(stack.sink.superseded(), vec![old]);
    assert_eq!(
        stack.sink.event_names_for(bob),
        vec!["participant-left", "participant-joined"]
    );
    assert_eq!(snapshot.participants.len(), 2);
    assert!(snapshot.participants.iter().any(|p| p.connection_id == new));
    assert!(stack.presence.lookup(old).await?.is_none());
    assert!(!stack.media.is_open(old));
    assert_eq!(stack.media.transport_count(), 0);

    // The superseded connection's own cleanup finds nothing left to do
    assert_eq!(stack.room.leave(old).await?, None);
    assert_eq!(stack.room.participant_count(&meeting.id).await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_leave_is_idempotent_and_silent_second_time() -> Result<(), anyhow::Error> {
    let stack = TestStack::new();
    let meeting = TestMeeting::random();
    let (a, _) = stack.join(&meeting.id, &TestParticipant::alice()).await;
    let (b, _) = stack.join(&meeting.id, &TestParticipant::bob()).await;
    stack.sink.clear();

    assert!(stack.room.leave(a).await?.is_some());
    assert!(stack.room.leave(a).await?.is_none());

    assert_eq!(stack.sink.event_names_for(b), vec!["participant-left"]);
    Ok(())
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn test_concurrent_first_transports_share_one_router() -> Result<(), anyhow::Error> {
    let stack = TestStack::with_engine(
        ScriptedEngine::new().with_router_delay(Duration::from_millis(20)),
    );
    let meeting = TestMeeting::random();
    let mut connections = Vec::new();
    for user in ["alice", "bob", "carol", "dave"] {
        let (conn, _) = stack.join(&meeting.id, &TestParticipant::new(user)).await;
        connections.push(conn);
    }

    let mut tasks = Vec::new();
    for conn in connections {
        let media = Arc::clone(&stack.media);
        let meeting_id = meeting.id.clone();
        tasks.push(tokio::spawn(async move {
            media
                .create_transport(conn, &meeting_id, TransportDirection::Send)
                .await
        }));
    }
    for task in tasks {
        task.await??;
    }

    assert_eq!(stack.engine.create_router_calls(), 1);
    assert_eq!(stack.routers.holders(&meeting.id), 4);
    assert_eq!(stack.engine.local().router_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_router_failure_then_retry_succeeds() -> Result<(), anyhow::Error> {
    let stack = TestStack::new();
    let meeting = TestMeeting::random();
    let (a, _) = stack.join(&meeting.id, &TestParticipant::alice()).await;
    stack.engine.fail_next_router("no worker");

    let failed = stack.media.router_capabilities(a).await;
    assert!(matches!(
        failed,
        Err(SessionError::RouterCreationFailed { .. })
    ));
    assert_eq!(stack.routers.holders(&meeting.id), 0);

    let capabilities = stack.media.router_capabilities(a).await?;
    assert!(!capabilities.codecs.is_empty());
    assert_eq!(stack.engine.create_router_calls(), 2);
    Ok(())
}

#[tokio::test]
async fn test_leave_during_transport_creation_leaks_nothing() -> Result<(), anyhow::Error> {
    let stack = TestStack::with_engine(
        ScriptedEngine::new().with_transport_delay(Duration::from_millis(30)),
    );
    let meeting = TestMeeting::random();
    let (a, _) = stack.join(&meeting.id, &TestParticipant::alice()).await;

    let media = Arc::clone(&stack.media);
    let meeting_id = meeting.id.clone();
    let in_flight = tokio::spawn(async move {
        media
            .create_transport(a, &meeting_id, TransportDirection::Send)
            .await
    });
    tokio::time::sleep(Duration::from_millis(5)).await;

    stack.room.leave(a).await?;
    // Outcome of the racing request does not matter, only that nothing leaks
    let _ = in_flight.await?;

    assert_eq!(stack.engine.local().transport_count(), 0);
    assert_eq!(stack.engine.local().router_count(), 0);
    assert_eq!(stack.routers.holders(&meeting.id), 0);
    assert_eq!(stack.media.transport_count(), 0);
    Ok(())
}

// ============================================================================
// Engine notifications
// ============================================================================

#[tokio::test]
async fn test_worker_death_fails_meeting_then_recovers() -> Result<(), anyhow::Error> {
    let stack = TestStack::new();
    let cancel_token = CancellationToken::new();
    let events = stack.spawn_engine_events(cancel_token.clone());
    let meeting = TestMeeting::random();
    let (a, _) = stack.join(&meeting.id, &TestParticipant::alice()).await;
    let (b, _) = stack.join(&meeting.id, &TestParticipant::bob()).await;
    stack
        .media
        .create_transport(a, &meeting.id, TransportDirection::Send)
        .await?;
    stack
        .media
        .create_transport(b, &meeting.id, TransportDirection::Recv)
        .await?;
    stack.sink.clear();

    stack.engine.local().simulate_worker_death();
    tokio::time::timeout(Duration::from_secs(1), async {
        while !stack
            .sink
            .event_names_for(b)
            .contains(&"media-unavailable")
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    assert!(stack
        .sink
        .event_names_for(a)
        .contains(&"media-unavailable"));
    assert_eq!(stack.media.transport_count(), 0);
    let blocked = stack
        .media
        .create_transport(a, &meeting.id, TransportDirection::Send)
        .await;
    assert!(matches!(blocked, Err(SessionError::MediaUnavailable(_))));

    // Once both holders let go of the lost router, a new one can be created
    stack.media.router_capabilities(a).await.ok();
    stack.media.router_capabilities(b).await?;
    stack.media.router_capabilities(a).await?;
    assert_eq!(stack.routers.holders(&meeting.id), 2);

    cancel_token.cancel();
    events.await?;
    Ok(())
}
