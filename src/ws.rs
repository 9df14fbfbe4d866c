//! Websocket upgrade endpoint: one long-lived websocket per client carries
//! the full signaling/presence message bus. The auth handshake happens
//! here, before the upgrade completes; everything after belongs to
//! [`crate::broker::connection`].

use salvo::websocket::WebSocketUpgrade;

use crate::auth::SharedAuthVerifier;
use crate::broker::connection;
use crate::error::BrokerError;
use crate::prelude::*;

#[handler]
pub async fn connect(
    req: &mut Request,
    depot: &mut Depot,
    res: &mut Response,
) -> AppResult<()> {
    let verifier = depot
        .get::<SharedAuthVerifier>("auth_verifier")
        .expect("auth verifier must be injected into the depot")
        .clone();

    let token =
        req.query::<String>("token").ok_or(BrokerError::Unauthorized)?;

    let auth =
        verifier.verify(&token).map_err(|_| BrokerError::Unauthorized)?;

    WebSocketUpgrade::new()
        .upgrade(req, res, move |ws| async move {
            connection::run(ws, auth).await;
        })
        .await
        .map_err(|err| BrokerError::Upgrade(err.to_string()))
}
