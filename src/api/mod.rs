//! HTTP surface of the compute.

pub mod handlers;

use std::sync::Arc;

use axum::{
    body::Body,
    extract::Request,
    routing::{get, post, MethodRouter},
    Json, Router,
};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tower_http::trace::TraceLayer;

use crate::dynamips::Dynamips;
use handlers::ethernet_hub as hub;

const HUB_NODES: &str = "/v3/compute/projects/:project_id/ethernet_hub/nodes";

/// State shared by every handler.
#[derive(Clone)]
pub struct ApiServer {
    pub dynamips: Arc<Dynamips>,
    /// Cancelled once the supervisor stops the scheduler.
    pub scheduler: CancellationToken,
}

fn add_route(
    router: Router<ApiServer>,
    methods: &str,
    path: &str,
    handler: MethodRouter<ApiServer>,
) -> Router<ApiServer> {
    tracing::debug!("Adding route: {} {}", methods, path);
    router.route(path, handler)
}

impl ApiServer {
    pub fn new(dynamips: Arc<Dynamips>, scheduler: CancellationToken) -> Self {
        Self { dynamips, scheduler }
    }

    pub fn router(&self) -> Router {
        let node = format!("{}/:node_id", HUB_NODES);
        let port = format!("{}/adapters/:adapter_number/ports/:port_number", node);

        let mut router = Router::new();
        router = add_route(router, "GET", "/v3/compute/version", get(version));
        router = add_route(router, "POST", HUB_NODES, post(hub::create_ethernet_hub));
        router = add_route(
            router,
            "GET PUT DELETE",
            &node,
            get(hub::get_ethernet_hub)
                .put(hub::update_ethernet_hub)
                .delete(hub::delete_ethernet_hub),
        );
        router = add_route(router, "POST", &format!("{}/duplicate", node), post(hub::duplicate_ethernet_hub));
        router = add_route(router, "POST", &format!("{}/start", node), post(hub::start_ethernet_hub));
        router = add_route(router, "POST", &format!("{}/stop", node), post(hub::stop_ethernet_hub));
        router = add_route(router, "POST", &format!("{}/suspend", node), post(hub::suspend_ethernet_hub));
        router = add_route(
            router,
            "POST DELETE",
            &format!("{}/nio", port),
            post(hub::create_nio).delete(hub::delete_nio),
        );
        router = add_route(router, "POST", &format!("{}/start_capture", port), post(hub::start_capture));
        router = add_route(router, "POST", &format!("{}/stop_capture", port), post(hub::stop_capture));
        router = add_route(router, "GET", &format!("{}/pcap", port), get(hub::stream_pcap_file));

        router.layer(TraceLayer::new_for_http()).with_state(self.clone())
    }
}

/// GET /v3/compute/version
async fn version() -> Json<serde_json::Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

/// Serve plain HTTP until `scheduler` is cancelled.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    scheduler: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { scheduler.cancelled().await })
        .await
}

/// Serve HTTPS until `scheduler` is cancelled. Open connections are asked to
/// finish gracefully once it is.
pub async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls: Arc<rustls::ServerConfig>,
    scheduler: CancellationToken,
) -> std::io::Result<()> {
    let acceptor = TlsAcceptor::from(tls);
    loop {
        let (stream, peer) = tokio::select! {
            _ = scheduler.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("Failed to accept connection: {}", e);
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!("TLS handshake with {} failed: {}", peer, e);
                    return;
                }
            };
            let service = hyper::service::service_fn(move |request: Request<Incoming>| {
                router.clone().call(request.map(Body::new))
            });
            let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
            let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
            tokio::pin!(conn);

            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = scheduler.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            };
            if let Err(e) = result {
                tracing::debug!("Connection with {} closed: {}", peer, e);
            }
        });
    }
    Ok(())
}
