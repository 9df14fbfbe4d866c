//! Connection controller (C5).
//!
//! One instance of [`run`] is spawned per accepted websocket connection. It
//! owns the per-connection state machine, dispatches inbound messages
//! through the ordered-check pipelines described for each operation, and
//! performs cascading cleanup on disconnect.

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use salvo::websocket::{Message, WebSocket};
use serde_json::json;
use tokio::sync::mpsc;

use crate::auth::{AuthContext, Role};
use crate::presence::ConnectionHandle;
use crate::ratelimit::EventKind;
use crate::session::SessionError;

use super::BrokerState;
use super::messages::{
    CrewBroadcast, ErrorCode, Inbound, OnlineProducer, Outbound, SignalKind,
};

/// Per-connection state. `registered` gates everything except the two
/// `register-*` messages.
struct Ctx {
    handle: ConnectionHandle,
    client_id: String,
    role: Role,
    registered: bool,
}

pub async fn run(ws: WebSocket, auth: AuthContext) {
    let broker = BrokerState::global();
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    let handle = broker.open_connection(out_tx);

    let forward = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if ws_tx.send(Message::text(message.to_json())).await.is_err() {
                break;
            }
        }
    });

    let mut ctx = Ctx {
        handle,
        client_id: auth.client_id,
        role: auth.role,
        registered: false,
    };

    tracing::info!(
        connection = handle,
        client_id = %ctx.client_id,
        role = ctx.role.as_str(),
        "connection accepted"
    );

    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(err) => {
                tracing::warn!(connection = handle, error = %err, "websocket read error");
                break;
            }
        };
        if frame.is_close() {
            break;
        }
        let Ok(text) = frame.to_str() else {
            continue;
        };
        match serde_json::from_str::<Inbound>(text) {
            Ok(message) => dispatch(broker, &mut ctx, message),
            Err(err) => {
                tracing::warn!(connection = handle, error = %err, "malformed message");
                broker.send_to(
                    handle,
                    Outbound::error(
                        ErrorCode::InvalidRequest,
                        "request body could not be parsed",
                    ),
                );
            }
        }
    }

    forward.abort();
    disconnect(broker, &ctx);
    tracing::info!(connection = handle, client_id = %ctx.client_id, "connection closed");
}

fn dispatch(broker: &BrokerState, ctx: &mut Ctx, message: Inbound) {
    match message {
        Inbound::RegisterProducer => handle_register_producer(broker, ctx),
        Inbound::RegisterConsumer => handle_register_consumer(broker, ctx),
        Inbound::StartMonitoring { producer_id } => {
            handle_start_monitoring(broker, ctx, producer_id)
        }
        Inbound::StopMonitoring { producer_id } => {
            handle_stop_monitoring(broker, ctx, producer_id)
        }
        Inbound::Offer { target_id, offer } => {
            handle_signal(broker, ctx, SignalKind::Offer, target_id, offer)
        }
        Inbound::Answer { target_id, answer } => {
            handle_signal(broker, ctx, SignalKind::Answer, target_id, answer)
        }
        Inbound::IceCandidate { target_id, candidate } => handle_signal(
            broker,
            ctx,
            SignalKind::IceCandidate,
            target_id,
            candidate,
        ),
        Inbound::HeartbeatPing => handle_heartbeat_ping(broker, ctx),
        Inbound::CrewSignOn(payload) => {
            handle_crew_event(broker, ctx, true, payload)
        }
        Inbound::CrewSignOff(payload) => {
            handle_crew_event(broker, ctx, false, payload)
        }
    }
}

fn reject(broker: &BrokerState, ctx: &Ctx, code: ErrorCode, message: &str) {
    broker.send_to(ctx.handle, Outbound::error(code, message));
}

fn handle_register_producer(broker: &BrokerState, ctx: &mut Ctx) {
    if ctx.role != Role::Producer {
        return reject(
            broker,
            ctx,
            ErrorCode::AuthInvalidRole,
            "only producers may register as a producer",
        );
    }
    if broker
        .producers
        .register(&ctx.client_id, ctx.handle)
        .is_err()
    {
        return reject(
            broker,
            ctx,
            ErrorCode::InvalidRequest,
            "client id must not be empty",
        );
    }
    ctx.registered = true;
    let now = Utc::now();
    broker.broadcast_to_consumers(Outbound::ProducerOnline {
        producer_id: ctx.client_id.clone(),
        timestamp: now,
    });
    broker.send_to(
        ctx.handle,
        Outbound::ProducerRegistered {
            producer_id: ctx.client_id.clone(),
            timestamp: now,
        },
    );
}

fn handle_register_consumer(broker: &BrokerState, ctx: &mut Ctx) {
    if ctx.role != Role::Consumer {
        return reject(
            broker,
            ctx,
            ErrorCode::AuthInvalidRole,
            "only consumers may register as a consumer",
        );
    }
    if broker
        .consumers
        .register(&ctx.client_id, ctx.handle)
        .is_err()
    {
        return reject(
            broker,
            ctx,
            ErrorCode::InvalidRequest,
            "client id must not be empty",
        );
    }
    ctx.registered = true;
    let online_producers = broker
        .producers
        .list_online()
        .into_iter()
        .map(|entry| OnlineProducer {
            producer_id: entry.client_id,
            connected_at: entry.registered_at,
        })
        .collect();
    broker.send_to(
        ctx.handle,
        Outbound::ConsumerRegistered {
            consumer_id: ctx.client_id.clone(),
            online_producers,
            timestamp: Utc::now(),
        },
    );
}

fn require_registered(broker: &BrokerState, ctx: &Ctx) -> bool {
    if !ctx.registered {
        reject(
            broker,
            ctx,
            ErrorCode::ClientNotRegistered,
            "register before issuing this message",
        );
        return false;
    }
    true
}

fn handle_start_monitoring(
    broker: &BrokerState,
    ctx: &mut Ctx,
    producer_id: String,
) {
    if !require_registered(broker, ctx) {
        return;
    }
    if ctx.role != Role::Consumer {
        return reject(
            broker,
            ctx,
            ErrorCode::OperationNotAllowed,
            "only consumers may start monitoring",
        );
    }
    if producer_id.is_empty() {
        return reject(
            broker,
            ctx,
            ErrorCode::InvalidRequest,
            "producerId must not be empty",
        );
    }
    if !broker.producers.is_online(&producer_id) {
        return reject(
            broker,
            ctx,
            ErrorCode::SessionProducerOffline,
            "producer is not online",
        );
    }

    if let Some(existing) = broker.sessions.get(&producer_id) {
        if existing.consumer_connection == ctx.handle {
            broker.sessions.refresh_activity(&producer_id);
            return broker.send_to(
                ctx.handle,
                Outbound::MonitoringStarted {
                    producer_id,
                    session_id: existing.producer_id.clone(),
                    started_at: Some(existing.started_at),
                    timestamp: Utc::now(),
                },
            );
        }
        return reject_with_details(
            broker,
            ctx,
            ErrorCode::SessionAlreadyExists,
            "producer is already being monitored",
            json!({ "existingConsumerId": existing.consumer_id }),
        );
    }

    match broker.sessions.create(&producer_id, &ctx.client_id, ctx.handle) {
        Ok(session) => broker.send_to(
            ctx.handle,
            Outbound::MonitoringStarted {
                producer_id,
                session_id: session.producer_id.clone(),
                started_at: Some(session.started_at),
                timestamp: Utc::now(),
            },
        ),
        Err(SessionError::SessionExists { existing_consumer_id }) => {
            reject_with_details(
                broker,
                ctx,
                ErrorCode::SessionAlreadyExists,
                "producer is already being monitored",
                json!({ "existingConsumerId": existing_consumer_id }),
            )
        }
    }
}

fn reject_with_details(
    broker: &BrokerState,
    ctx: &Ctx,
    code: ErrorCode,
    message: &str,
    details: serde_json::Value,
) {
    broker.send_to(
        ctx.handle,
        Outbound::error_with_details(code, message, details),
    );
}

fn handle_stop_monitoring(
    broker: &BrokerState,
    ctx: &mut Ctx,
    producer_id: String,
) {
    if !require_registered(broker, ctx) {
        return;
    }
    if ctx.role != Role::Consumer {
        return reject(
            broker,
            ctx,
            ErrorCode::OperationNotAllowed,
            "only consumers may stop monitoring",
        );
    }
    if producer_id.is_empty() {
        return reject(
            broker,
            ctx,
            ErrorCode::InvalidRequest,
            "producerId must not be empty",
        );
    }
    if !broker.sessions.has_active(&producer_id) {
        return reject(
            broker,
            ctx,
            ErrorCode::SessionNotFound,
            "no active session for this producer",
        );
    }
    if !broker.sessions.validate_ownership(&producer_id, ctx.handle) {
        return reject(
            broker,
            ctx,
            ErrorCode::SessionNotAuthorized,
            "this connection does not own the session",
        );
    }
    broker.sessions.end(&producer_id);
    broker.send_to(
        ctx.handle,
        Outbound::MonitoringStopped {
            producer_id,
            timestamp: Utc::now(),
        },
    );
}

fn handle_signal(
    broker: &BrokerState,
    ctx: &mut Ctx,
    kind: SignalKind,
    target_id: String,
    payload: Option<serde_json::Value>,
) {
    if !require_registered(broker, ctx) {
        return;
    }
    if target_id.is_empty() || payload.is_none() {
        return reject(
            broker,
            ctx,
            ErrorCode::SignalingMissingData,
            "targetId and the signal payload are required",
        );
    }

    let event_kind = match kind {
        SignalKind::Offer => EventKind::Offer,
        SignalKind::Answer => EventKind::Answer,
        SignalKind::IceCandidate => EventKind::IceCandidate,
    };
    let outcome = broker.rate_limiter.check(&ctx.client_id, event_kind);
    if !outcome.allowed {
        return reject_with_details(
            broker,
            ctx,
            ErrorCode::RateLimitExceeded,
            "too many signaling messages",
            json!({ "resetAt": outcome.reset_at, "event": event_kind.to_string() }),
        );
    }

    let target_producer = broker.producers.lookup(&target_id);
    let target_consumer = broker.consumers.lookup(&target_id);
    let (target_handle, target_role) = match (target_producer, target_consumer)
    {
        (Some(p), _) => (p.connection, Role::Producer),
        (None, Some(c)) => (c.connection, Role::Consumer),
        (None, None) => {
            return reject(
                broker,
                ctx,
                ErrorCode::SignalingInvalidTarget,
                "target is not known to the broker",
            );
        }
    };

    if target_role == ctx.role {
        return reject(
            broker,
            ctx,
            ErrorCode::SignalingInvalidPairing,
            "signaling only flows between a producer and a consumer",
        );
    }

    let producer_id = if ctx.role == Role::Producer {
        ctx.client_id.clone()
    } else {
        target_id.clone()
    };

    let Some(session) = broker.sessions.get(&producer_id) else {
        return reject(
            broker,
            ctx,
            ErrorCode::SignalingNoSession,
            "no active session between sender and target",
        );
    };
    let authorized = match ctx.role {
        Role::Consumer => session.consumer_connection == ctx.handle,
        Role::Producer => session.producer_id == ctx.client_id,
    };
    if !authorized {
        return reject(
            broker,
            ctx,
            ErrorCode::SignalingUnauthorizedSender,
            "this connection is not a party to the session",
        );
    }

    broker.sessions.refresh_activity(&producer_id);

    if broker
        .producers
        .lookup_by_connection(target_handle)
        .is_none()
        && broker.consumers.lookup_by_connection(target_handle).is_none()
    {
        return reject(
            broker,
            ctx,
            ErrorCode::SignalingInvalidTarget,
            "target disconnected before delivery",
        );
    }

    let from_id = ctx.client_id.clone();
    let outbound = match kind {
        SignalKind::Offer => Outbound::Offer { from_id, offer: payload },
        SignalKind::Answer => Outbound::Answer { from_id, answer: payload },
        SignalKind::IceCandidate => {
            Outbound::IceCandidate { from_id, candidate: payload }
        }
    };
    broker.send_to(target_handle, outbound);
}

fn handle_heartbeat_ping(broker: &BrokerState, ctx: &mut Ctx) {
    if !require_registered(broker, ctx) {
        return;
    }
    if ctx.role != Role::Producer {
        return reject(
            broker,
            ctx,
            ErrorCode::OperationNotAllowed,
            "only producers send heartbeats",
        );
    }
    let result = broker.liveness.record_ping(&ctx.client_id);
    broker.producers.refresh(&ctx.client_id);
    broker.send_to(
        ctx.handle,
        Outbound::HeartbeatPong { timestamp: result.timestamp },
    );
}

fn handle_crew_event(
    broker: &BrokerState,
    ctx: &mut Ctx,
    sign_on: bool,
    payload: super::messages::CrewEventPayload,
) {
    if !require_registered(broker, ctx) {
        return;
    }
    if ctx.role != Role::Producer {
        return reject(
            broker,
            ctx,
            ErrorCode::CrewEventUnauthorized,
            "only producers emit crew events",
        );
    }
    if validator::Validate::validate(&payload).is_err() {
        return reject(
            broker,
            ctx,
            ErrorCode::CrewEventInvalidPayload,
            "employeeId and name are required",
        );
    }

    let kind = if sign_on {
        EventKind::CrewSignOn
    } else {
        EventKind::CrewSignOff
    };
    let outcome = broker.rate_limiter.check(&ctx.client_id, kind);
    if !outcome.allowed {
        return reject_with_details(
            broker,
            ctx,
            ErrorCode::RateLimitExceeded,
            "too many crew events",
            json!({ "resetAt": outcome.reset_at, "event": kind.to_string() }),
        );
    }

    // authoritative id override: never trust the client-supplied producerId
    let producer_id = ctx.client_id.clone();
    let event_type = if sign_on { "sign-on" } else { "sign-off" };
    let broadcast = CrewBroadcast::new(
        payload.employee_id.clone(),
        payload.name,
        producer_id,
        event_type,
    );
    broker.broadcast_to_consumers(if sign_on {
        Outbound::CrewSignOn(broadcast)
    } else {
        Outbound::CrewSignOff(broadcast)
    });

    let timestamp = Utc::now();
    broker.send_to(
        ctx.handle,
        if sign_on {
            Outbound::CrewSignOnAck {
                employee_id: payload.employee_id,
                timestamp,
            }
        } else {
            Outbound::CrewSignOffAck {
                employee_id: payload.employee_id,
                timestamp,
            }
        },
    );
}

/// Cascading cleanup on disconnect. Defensive: any single failure here is
/// logged and swallowed so it cannot block cleanup for the rest of the
/// fleet (see the Design Notes on cyclic references / exception-suppressed
/// cleanup).
///
/// Every presence mutation is gated on `ctx.handle` still being the
/// connection on file for `ctx.client_id`: if the client has already
/// reconnected under a new handle, this is a belated disconnect for a
/// connection that is no longer current, and it must not tear down the new
/// connection's presence, liveness, or session state.
fn disconnect(broker: &BrokerState, ctx: &Ctx) {
    broker.close_connection(ctx.handle);
    broker.rate_limiter.reset_all(&ctx.client_id);

    if !ctx.registered {
        return;
    }

    match ctx.role {
        Role::Producer => {
            if !broker.producers.mark_offline(&ctx.client_id, ctx.handle) {
                return;
            }
            broker.liveness.remove(&ctx.client_id);
            let ended = broker.sessions.end(&ctx.client_id);
            broker.broadcast_to_consumers(Outbound::ProducerOffline {
                producer_id: ctx.client_id.clone(),
                reason: "disconnect",
                timestamp: Utc::now(),
            });
            if let Some(session) = ended {
                broker.broadcast_to_consumers(Outbound::SessionEnded {
                    producer_id: session.producer_id,
                    consumer_id: session.consumer_id,
                    reason: "producer-disconnect",
                    timestamp: Utc::now(),
                });
            }
            broker.producers.remove(&ctx.client_id, ctx.handle);
        }
        Role::Consumer => {
            if !broker.consumers.remove(&ctx.client_id, ctx.handle) {
                return;
            }
            let ended = broker.sessions.end_by_consumer_connection(ctx.handle);
            for session in ended {
                broker.broadcast_to_consumers(Outbound::SessionEnded {
                    producer_id: session.producer_id,
                    consumer_id: session.consumer_id,
                    reason: "consumer-disconnect",
                    timestamp: Utc::now(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerTuning;

    fn new_broker() -> BrokerState {
        BrokerState::new(&BrokerTuning::default())
    }

    fn new_ctx(
        broker: &BrokerState,
        client_id: &str,
        role: Role,
    ) -> (Ctx, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = broker.open_connection(tx);
        (
            Ctx { handle, client_id: client_id.to_string(), role, registered: false },
            rx,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn happy_path_signaling_round_trip() {
        let broker = new_broker();
        let (mut producer, mut producer_rx) =
            new_ctx(&broker, "kiosk-1", Role::Producer);
        let (mut consumer, mut consumer_rx) =
            new_ctx(&broker, "monitor-1", Role::Consumer);

        handle_register_producer(&broker, &mut producer);
        assert!(producer.registered);
        handle_register_consumer(&broker, &mut consumer);
        assert!(consumer.registered);
        drain(&mut producer_rx);
        drain(&mut consumer_rx);

        handle_start_monitoring(&broker, &mut consumer, "kiosk-1".to_string());
        let started = drain(&mut consumer_rx);
        assert!(matches!(started[0], Outbound::MonitoringStarted { .. }));
        assert!(broker.sessions.has_active("kiosk-1"));

        handle_signal(
            &broker,
            &mut consumer,
            SignalKind::Offer,
            "kiosk-1".to_string(),
            Some(json!({"sdp": "v=0"})),
        );
        let delivered = drain(&mut producer_rx);
        match &delivered[0] {
            Outbound::Offer { from_id, .. } => assert_eq!(from_id, "monitor-1"),
            other => panic!("expected an offer, got {other:?}"),
        }

        handle_signal(
            &broker,
            &mut producer,
            SignalKind::Answer,
            "monitor-1".to_string(),
            Some(json!({"sdp": "v=0"})),
        );
        let delivered = drain(&mut consumer_rx);
        match &delivered[0] {
            Outbound::Answer { from_id, .. } => assert_eq!(from_id, "kiosk-1"),
            other => panic!("expected an answer, got {other:?}"),
        }
    }

    #[test]
    fn exclusivity_rejects_a_second_consumer() {
        let broker = new_broker();
        let (mut producer, _) = new_ctx(&broker, "kiosk-1", Role::Producer);
        let (mut first, mut first_rx) =
            new_ctx(&broker, "monitor-1", Role::Consumer);
        let (mut second, mut second_rx) =
            new_ctx(&broker, "monitor-2", Role::Consumer);

        handle_register_producer(&broker, &mut producer);
        handle_register_consumer(&broker, &mut first);
        handle_register_consumer(&broker, &mut second);
        drain(&mut first_rx);
        drain(&mut second_rx);

        handle_start_monitoring(&broker, &mut first, "kiosk-1".to_string());
        drain(&mut first_rx);
        handle_start_monitoring(&broker, &mut second, "kiosk-1".to_string());
        let reply = drain(&mut second_rx);
        match &reply[0] {
            Outbound::Error { code, .. } => {
                assert_eq!(*code, ErrorCode::SessionAlreadyExists)
            }
            other => panic!("expected an error, got {other:?}"),
        }
    }

    #[test]
    fn signaling_without_a_session_is_rejected() {
        let broker = new_broker();
        let (mut producer, mut producer_rx) =
            new_ctx(&broker, "kiosk-1", Role::Producer);
        let (mut consumer, mut consumer_rx) =
            new_ctx(&broker, "monitor-1", Role::Consumer);
        handle_register_producer(&broker, &mut producer);
        handle_register_consumer(&broker, &mut consumer);
        drain(&mut producer_rx);
        drain(&mut consumer_rx);

        handle_signal(
            &broker,
            &mut consumer,
            SignalKind::Offer,
            "kiosk-1".to_string(),
            Some(json!({"sdp": "v=0"})),
        );
        let reply = drain(&mut consumer_rx);
        match &reply[0] {
            Outbound::Error { code, .. } => {
                assert_eq!(*code, ErrorCode::SignalingNoSession)
            }
            other => panic!("expected an error, got {other:?}"),
        }
    }

    #[test]
    fn crew_event_rate_limit_blocks_after_ceiling() {
        let broker = new_broker();
        let (mut producer, mut rx) = new_ctx(&broker, "kiosk-1", Role::Producer);
        handle_register_producer(&broker, &mut producer);
        drain(&mut rx);

        for _ in 0..10 {
            handle_crew_event(
                &broker,
                &mut producer,
                true,
                super::messages::CrewEventPayload {
                    employee_id: "E1".to_string(),
                    name: "Alice".to_string(),
                    producer_id: None,
                },
            );
        }
        drain(&mut rx);
        handle_crew_event(
            &broker,
            &mut producer,
            true,
            super::messages::CrewEventPayload {
                employee_id: "E1".to_string(),
                name: "Alice".to_string(),
                producer_id: None,
            },
        );
        let reply = drain(&mut rx);
        match &reply[0] {
            Outbound::Error { code, .. } => {
                assert_eq!(*code, ErrorCode::RateLimitExceeded)
            }
            other => panic!("expected a rate limit error, got {other:?}"),
        }
    }

    #[test]
    fn crew_event_always_attributes_to_the_authenticated_producer() {
        let broker = new_broker();
        let (mut producer, mut rx) = new_ctx(&broker, "kiosk-1", Role::Producer);
        handle_register_producer(&broker, &mut producer);
        drain(&mut rx);

        let (consumer, mut consumer_rx) =
            new_ctx(&broker, "monitor-1", Role::Consumer);
        broker.consumers.register(&consumer.client_id, consumer.handle).unwrap();

        handle_crew_event(
            &broker,
            &mut producer,
            true,
            super::messages::CrewEventPayload {
                employee_id: "E1".to_string(),
                name: "Alice".to_string(),
                producer_id: Some("someone-else".to_string()),
            },
        );
        drain(&mut rx);
        let broadcast = drain(&mut consumer_rx);
        match &broadcast[0] {
            Outbound::CrewSignOn(b) => assert_eq!(b.producer_id, "kiosk-1"),
            other => panic!("expected a crew-sign-on broadcast, got {other:?}"),
        }
    }

    #[test]
    fn heartbeat_timeout_marks_producer_offline_on_scan() {
        let broker = BrokerState::new(&BrokerTuning {
            heartbeat_timeout_ms: 0,
            ..BrokerTuning::default()
        });
        let (mut producer, mut rx) = new_ctx(&broker, "kiosk-1", Role::Producer);
        handle_register_producer(&broker, &mut producer);
        drain(&mut rx);
        handle_heartbeat_ping(&broker, &mut producer);
        drain(&mut rx);

        std::thread::sleep(std::time::Duration::from_millis(1));
        let timed_out = broker.liveness.scan();
        assert_eq!(timed_out, vec!["kiosk-1".to_string()]);
    }
}
