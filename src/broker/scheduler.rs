//! Periodic background scan: heartbeat timeouts and session inactivity
//! timeouts, both driven off the same tick interval.

use chrono::Utc;

use crate::presence::PresenceStatus;

use super::BrokerState;
use super::messages::Outbound;

pub async fn run(broker: &'static BrokerState) {
    let mut ticker = tokio::time::interval(broker.scan_interval);
    loop {
        ticker.tick().await;
        scan_heartbeats(broker);
        scan_session_timeouts(broker);
    }
}

fn scan_heartbeats(broker: &BrokerState) {
    for producer_id in broker.liveness.scan() {
        // Re-read the connection that currently owns this producer id and
        // gate every mutation on it: if the producer reconnected between
        // the last ping and this scan, its new connection must be left
        // untouched by a timeout that belongs to the old one.
        let Some(entry) = broker.producers.lookup(&producer_id) else {
            continue;
        };
        if entry.status != PresenceStatus::Online {
            continue;
        }
        if !broker.producers.mark_offline(&producer_id, entry.connection) {
            continue;
        }
        let ended = broker.sessions.end(&producer_id);
        tracing::info!(producer_id, "heartbeat timeout");
        broker.broadcast_to_consumers(Outbound::ProducerOffline {
            producer_id: producer_id.clone(),
            reason: "heartbeat-timeout",
            timestamp: Utc::now(),
        });
        if let Some(session) = ended {
            broker.broadcast_to_consumers(Outbound::SessionEnded {
                producer_id: session.producer_id,
                consumer_id: session.consumer_id,
                reason: "producer-timeout",
                timestamp: Utc::now(),
            });
        }
        broker.producers.remove(&producer_id, entry.connection);
    }
}

fn scan_session_timeouts(broker: &BrokerState) {
    for session in broker.sessions.scan_timed_out(broker.session_timeout) {
        // another event may have ended it between the scan and now; end()
        // is idempotent so this is safe either way.
        if broker.sessions.end(&session.producer_id).is_none() {
            continue;
        }
        tracing::info!(
            producer_id = session.producer_id,
            consumer_id = session.consumer_id,
            "session inactivity timeout"
        );
        broker.broadcast_to_consumers(Outbound::SessionEnded {
            producer_id: session.producer_id.clone(),
            consumer_id: session.consumer_id,
            reason: "session-timeout",
            timestamp: Utc::now(),
        });
        broker.send_to(
            session.consumer_connection,
            Outbound::SessionTimeout {
                producer_id: session.producer_id,
                timestamp: Utc::now(),
            },
        );
    }
}
