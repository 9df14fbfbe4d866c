use std::sync::Arc;

use salvo::prelude::*;
use tokio::signal;
use tracing::info;

mod auth;
mod broker;
mod config;
mod error;
mod liveness;
mod prelude;
mod presence;
mod ratelimit;
mod routers;
mod session;
mod utils;
mod ws;

use auth::{AuthVerifier, JwtAuthVerifier};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    if let Err(err) = config::init() {
        eprintln!(
            "It looks like your config is invalid. The following error occurred: {err}"
        );
        std::process::exit(1);
    }
    let cfg = config::get();

    let _guard = cfg.log.guard();
    tracing::info!("log level: {}", &cfg.log.filter_level);

    let verifier: Arc<dyn AuthVerifier> =
        Arc::new(JwtAuthVerifier::new(&cfg.jwt_secret));

    tokio::spawn(broker::scheduler::run(broker::BrokerState::global()));

    let service = Service::new(routers::root(verifier, &cfg.cors_origin))
        .catcher(routers::catcher());

    let acceptor =
        TcpListener::new((cfg.listen_addr.as_str(), cfg.listen_port))
            .bind()
            .await;
    let server = Server::new(acceptor);
    println!(
        "🚀 Server listening on ws://{}:{}/api/ws",
        cfg.listen_addr.replace("0.0.0.0", "127.0.0.1"),
        cfg.listen_port
    );
    tokio::spawn(shutdown_signal(server.handle()));
    server.serve(service).await;
}

async fn shutdown_signal(handle: salvo::server::ServerHandle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl_c signal received"),
        _ = terminate => info!("terminate signal received"),
    }
    handle.stop_graceful(std::time::Duration::from_secs(60));
}
