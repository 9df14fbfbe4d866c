//! Wire messages exchanged with a connected client.
//!
//! One JSON text frame per message, tagged by `type`. This framing is an
//! implementation detail of the websocket transport binding chosen for
//! this crate; the controller in [`super::connection`] only ever deals in
//! these typed values, never in raw frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum Inbound {
    #[serde(rename = "register-producer")]
    RegisterProducer,
    #[serde(rename = "register-consumer")]
    RegisterConsumer,
    #[serde(rename = "start-monitoring")]
    StartMonitoring {
        #[serde(rename = "producerId")]
        producer_id: String,
    },
    #[serde(rename = "stop-monitoring")]
    StopMonitoring {
        #[serde(rename = "producerId")]
        producer_id: String,
    },
    #[serde(rename = "offer")]
    Offer {
        #[serde(rename = "targetId")]
        target_id: String,
        offer: Option<Value>,
    },
    #[serde(rename = "answer")]
    Answer {
        #[serde(rename = "targetId")]
        target_id: String,
        answer: Option<Value>,
    },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        #[serde(rename = "targetId")]
        target_id: String,
        candidate: Option<Value>,
    },
    #[serde(rename = "heartbeat-ping")]
    HeartbeatPing,
    #[serde(rename = "crew-sign-on")]
    CrewSignOn(CrewEventPayload),
    #[serde(rename = "crew-sign-off")]
    CrewSignOff(CrewEventPayload),
}

#[derive(Debug, Deserialize, Validate)]
pub struct CrewEventPayload {
    #[serde(rename = "employeeId")]
    #[validate(length(min = 1))]
    pub employee_id: String,
    #[validate(length(min = 1))]
    pub name: String,
    /// Client-supplied; always overwritten with the authenticated sender's
    /// id before broadcast. Present only so senders can populate it without
    /// the broker rejecting the shape.
    #[serde(rename = "producerId", default)]
    pub producer_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn wire_name(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(test, derive(strum::EnumIter))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthInvalidToken,
    AuthInvalidRole,
    InvalidRequest,
    OperationNotAllowed,
    ClientNotRegistered,
    SessionProducerOffline,
    SessionAlreadyExists,
    SessionNotFound,
    SessionNotAuthorized,
    SignalingMissingData,
    SignalingInvalidTarget,
    SignalingInvalidPairing,
    SignalingNoSession,
    SignalingUnauthorizedSender,
    CrewEventUnauthorized,
    CrewEventInvalidPayload,
    RateLimitExceeded,
    InternalError,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Outbound {
    #[serde(rename = "producer-registered")]
    ProducerRegistered {
        #[serde(rename = "producerId")]
        producer_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "consumer-registered")]
    ConsumerRegistered {
        #[serde(rename = "consumerId")]
        consumer_id: String,
        #[serde(rename = "onlineProducers")]
        online_producers: Vec<OnlineProducer>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "producer-online")]
    ProducerOnline {
        #[serde(rename = "producerId")]
        producer_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "producer-offline")]
    ProducerOffline {
        #[serde(rename = "producerId")]
        producer_id: String,
        reason: &'static str,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "monitoring-started")]
    MonitoringStarted {
        #[serde(rename = "producerId")]
        producer_id: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "startedAt", skip_serializing_if = "Option::is_none")]
        started_at: Option<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "monitoring-stopped")]
    MonitoringStopped {
        #[serde(rename = "producerId")]
        producer_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "session-ended")]
    SessionEnded {
        #[serde(rename = "producerId")]
        producer_id: String,
        #[serde(rename = "consumerId")]
        consumer_id: String,
        reason: &'static str,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "session-timeout")]
    SessionTimeout {
        #[serde(rename = "producerId")]
        producer_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "offer")]
    Offer {
        #[serde(rename = "fromId")]
        from_id: String,
        offer: Option<Value>,
    },
    #[serde(rename = "answer")]
    Answer {
        #[serde(rename = "fromId")]
        from_id: String,
        answer: Option<Value>,
    },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        #[serde(rename = "fromId")]
        from_id: String,
        candidate: Option<Value>,
    },
    #[serde(rename = "crew-sign-on")]
    CrewSignOn(CrewBroadcast),
    #[serde(rename = "crew-sign-off")]
    CrewSignOff(CrewBroadcast),
    #[serde(rename = "crew-sign-on-ack")]
    CrewSignOnAck {
        #[serde(rename = "employeeId")]
        employee_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "crew-sign-off-ack")]
    CrewSignOffAck {
        #[serde(rename = "employeeId")]
        employee_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "heartbeat-pong")]
    HeartbeatPong { timestamp: DateTime<Utc> },
    #[serde(rename = "error")]
    Error {
        code: ErrorCode,
        message: String,
        timestamp: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct OnlineProducer {
    #[serde(rename = "producerId")]
    pub producer_id: String,
    #[serde(rename = "connectedAt")]
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrewBroadcast {
    #[serde(rename = "employeeId")]
    pub employee_id: String,
    pub name: String,
    timestamp: DateTime<Utc>,
    #[serde(rename = "producerId")]
    pub producer_id: String,
    #[serde(rename = "eventType")]
    pub event_type: &'static str,
}

impl CrewBroadcast {
    pub fn new(
        employee_id: String,
        name: String,
        producer_id: String,
        event_type: &'static str,
    ) -> Self {
        Self {
            employee_id,
            name,
            timestamp: Utc::now(),
            producer_id,
            event_type,
        }
    }
}

impl Outbound {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Outbound::Error {
            code,
            message: message.into(),
            timestamp: Utc::now(),
            details: None,
        }
    }

    pub fn error_with_details(
        code: ErrorCode,
        message: impl Into<String>,
        details: Value,
    ) -> Self {
        Outbound::Error {
            code,
            message: message.into(),
            timestamp: Utc::now(),
            details: Some(details),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .expect("Outbound variants always serialize")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_register_producer_has_no_payload() {
        let msg: Inbound =
            serde_json::from_str(r#"{"type":"register-producer"}"#).unwrap();
        assert!(matches!(msg, Inbound::RegisterProducer));
    }

    #[test]
    fn inbound_start_monitoring_parses_producer_id() {
        let msg: Inbound = serde_json::from_str(
            r#"{"type":"start-monitoring","producerId":"kiosk-1"}"#,
        )
        .unwrap();
        match msg {
            Inbound::StartMonitoring { producer_id } => {
                assert_eq!(producer_id, "kiosk-1")
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn outbound_error_round_trips_through_json() {
        let msg = Outbound::error(ErrorCode::RateLimitExceeded, "too fast");
        let json = msg.to_json();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("RATE_LIMIT_EXCEEDED"));
    }

    #[test]
    fn every_error_code_maps_to_its_screaming_snake_case_wire_name() {
        use strum::IntoEnumIterator;

        let expected = [
            (ErrorCode::AuthInvalidToken, "AUTH_INVALID_TOKEN"),
            (ErrorCode::AuthInvalidRole, "AUTH_INVALID_ROLE"),
            (ErrorCode::InvalidRequest, "INVALID_REQUEST"),
            (ErrorCode::OperationNotAllowed, "OPERATION_NOT_ALLOWED"),
            (ErrorCode::ClientNotRegistered, "CLIENT_NOT_REGISTERED"),
            (
                ErrorCode::SessionProducerOffline,
                "SESSION_PRODUCER_OFFLINE",
            ),
            (ErrorCode::SessionAlreadyExists, "SESSION_ALREADY_EXISTS"),
            (ErrorCode::SessionNotFound, "SESSION_NOT_FOUND"),
            (ErrorCode::SessionNotAuthorized, "SESSION_NOT_AUTHORIZED"),
            (ErrorCode::SignalingMissingData, "SIGNALING_MISSING_DATA"),
            (
                ErrorCode::SignalingInvalidTarget,
                "SIGNALING_INVALID_TARGET",
            ),
            (
                ErrorCode::SignalingInvalidPairing,
                "SIGNALING_INVALID_PAIRING",
            ),
            (ErrorCode::SignalingNoSession, "SIGNALING_NO_SESSION"),
            (
                ErrorCode::SignalingUnauthorizedSender,
                "SIGNALING_UNAUTHORIZED_SENDER",
            ),
            (ErrorCode::CrewEventUnauthorized, "CREW_EVENT_UNAUTHORIZED"),
            (
                ErrorCode::CrewEventInvalidPayload,
                "CREW_EVENT_INVALID_PAYLOAD",
            ),
            (ErrorCode::RateLimitExceeded, "RATE_LIMIT_EXCEEDED"),
            (ErrorCode::InternalError, "INTERNAL_ERROR"),
        ];

        // Guards the table above against a variant being added to ErrorCode
        // without a matching entry here.
        assert_eq!(expected.len(), ErrorCode::iter().count());

        for (code, wire_name) in expected {
            let json = Outbound::error(code, "x").to_json();
            assert!(
                json.contains(&format!("\"code\":\"{wire_name}\"")),
                "expected {wire_name} in {json}"
            );
        }
    }

    #[test]
    fn crew_sign_on_overwrites_producer_id_field_name() {
        let broadcast = CrewBroadcast::new(
            "E1".into(),
            "N".into(),
            "PRODUCER_A".into(),
            "sign-on",
        );
        let json = serde_json::to_string(&broadcast).unwrap();
        assert!(json.contains("\"producerId\":\"PRODUCER_A\""));
    }
}
