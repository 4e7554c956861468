//! Prometheus metrics.
//!
//! All metrics live in the process-wide default registry and are created
//! once on first use. The scrape endpoint is a minimal HTTP server that
//! answers every request with the encoded registry contents.

use std::io;
use std::net::SocketAddr;

use http::{Response, StatusCode, header};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ServerBuilder;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounterVec, IntGaugeVec, TextEncoder, register_int_counter_vec,
    register_int_gauge_vec,
};
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Total number of DNS queries, labeled by transport and whether the
/// answer was rewritten to steer the client at the relay.
pub static QUERIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "shunt_dns_queries_total",
        "The total number of DNS queries.",
        &["proto", "redirected"]
    )
    .unwrap()
});

/// Number of currently tunneled connections per remote endpoint.
pub static CONNS_NUM: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "shunt_relay_conns_num",
        "The total number of connections to the relay service.",
        &["servername"]
    )
    .unwrap()
});

/// Bytes received from remote endpoints, per endpoint.
pub static BYTES_RECEIVED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "shunt_relay_bytes_received_total",
        "The total number of bytes received from the remote endpoint.",
        &["servername"]
    )
    .unwrap()
});

/// Bytes sent to remote endpoints, per endpoint.
pub static BYTES_SENT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "shunt_relay_bytes_sent_total",
        "The total number of bytes sent to the remote endpoint.",
        &["servername"]
    )
    .unwrap()
});

/// A constant-one gauge labeled with the build version.
static UP: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "shunt_app_up",
        "A metric with a constant '1' value labeled by the build version.",
        &["version"]
    )
    .unwrap()
});

/// Marks the process as up.
pub fn set_up_gauge() {
    UP.with_label_values(&[env!("CARGO_PKG_VERSION")]).set(1);
}

/// Serves the scrape endpoint on `addr` until the task is dropped.
pub async fn serve(addr: SocketAddr) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("metrics: listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer_addr) = listener.accept().await?;

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(|_req: hyper::Request<Incoming>| async {
                Ok::<_, hyper::Error>(render_metrics())
            });

            if let Err(err) = ServerBuilder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                debug!("metrics: connection from {} failed: {}", peer_addr, err);
            }
        });
    }
}

/// Encodes the default registry into an HTTP response.
fn render_metrics() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();

    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buf) {
        debug!("metrics: failed to encode registry: {}", err);
        return Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Full::new(Bytes::new()))
            .unwrap();
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(Full::new(Bytes::from(buf)))
        .unwrap()
}
