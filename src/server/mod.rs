pub mod bootstrap;
pub mod middleware;
pub mod observability;
mod state;

pub use state::GatewayState;

use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// Run the gateway server with graceful shutdown support.
///
/// When `shutdown` is notified the server stops accepting new
/// connections and waits up to the configured grace window for
/// in-flight requests to complete before dropping the rest.
pub async fn run_server(state: GatewayState, shutdown: Arc<Notify>) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], state.settings.port).into();
    let listener = TcpListener::bind(addr).await?;
    info!("server: listening, addr={}", addr);

    let drain_timeout = state.settings.shutdown_timeout;
    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!("connections_total", "status" => "accepted").increment(1);
                v
            }
            Err(e) => {
                error!("server: accept failed, error={}", e);
                metrics::counter!("connections_total", "status" => "error").increment(1);
                continue;
            }
        };

        metrics::gauge!("connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let state_inner = state.clone();
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state_inner.clone();
                async move { middleware::handle_request(req, state, peer_addr).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: connection error, peer={}, error={}", peer_addr, e);
                }
            }

            metrics::gauge!("connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    // Drain phase: wait for in-flight connections, then give up.
    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!("server: waiting for {} active connections to drain", active);
        let drain = async {
            loop {
                if active_conns.load(Ordering::Relaxed) == 0 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(drain_timeout, drain).await {
            Ok(_) => info!("server: all connections drained"),
            Err(_) => {
                let remaining = active_conns.load(Ordering::Relaxed);
                info!(
                    "server: drain timeout ({}s), {} connections forcibly closed",
                    drain_timeout.as_secs(),
                    remaining
                );
            }
        }
    }

    Ok(())
}
