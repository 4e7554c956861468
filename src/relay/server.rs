//! The relay server: two listeners, accept loops and per-connection
//! workers.
//!
//! One listener receives plain HTTP connections, the other receives TLS.
//! Every accepted connection is handled by an independent worker that
//! peeks the server name, checks it against the redirect patterns, dials
//! the real destination and tunnels bytes until both sides are done.
//! `close` stops the accept loops and then waits for every in-flight
//! worker to return.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info};

use super::config::Config;
use super::dial::Dialer;
use super::peek::peek_server_name;
use super::tunnel;
use crate::domains::DomainPatterns;
use crate::metrics;

/// Read deadline applied while peeking the server name. Cleared before
/// tunneling starts; established tunnels may stay idle indefinitely.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Remote port for plain HTTP connections.
const REMOTE_PORT_PLAIN: u16 = 80;

/// Remote port for TLS connections.
const REMOTE_PORT_TLS: u16 = 443;

/// Backoff bounds for repeated accept errors.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server is already started")]
    AlreadyStarted,
    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, #[source] std::io::Error),
}

/// The SNI relay server.
pub struct Server {
    domains: DomainPatterns,
    dialer: Arc<Dialer>,
    listen_addr_plain: SocketAddr,
    listen_addr_tls: SocketAddr,

    /// Guards the started flag and the listener bookkeeping. Connection
    /// workers never touch this lock.
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    started: bool,
    plain_addr: Option<SocketAddr>,
    tls_addr: Option<SocketAddr>,
    shutdown: Option<watch::Sender<bool>>,
    workers_done: Option<mpsc::Receiver<()>>,
}

/// Everything a connection worker needs, shared across both accept loops.
struct ConnContext {
    domains: DomainPatterns,
    dialer: Arc<Dialer>,
    plain_addr: SocketAddr,
    tls_addr: SocketAddr,
}

impl Server {
    /// Creates a new relay server from the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            domains: DomainPatterns::new(&config.redirect_domains),
            dialer: Arc::new(Dialer::new(config.upstream_proxy)),
            listen_addr_plain: SocketAddr::new(config.listen_addr, config.plain_port),
            listen_addr_tls: SocketAddr::new(config.listen_addr, config.tls_port),
            state: Mutex::new(State::default()),
        }
    }

    /// Binds both listeners and launches the accept loops. Returns an
    /// error if the server is already started or a bind fails.
    pub async fn start(&self) -> Result<(), ServerError> {
        info!("relay: starting");

        if self.state.lock().unwrap().started {
            return Err(ServerError::AlreadyStarted);
        }

        let listener_plain = TcpListener::bind(self.listen_addr_plain)
            .await
            .map_err(|err| ServerError::Bind(self.listen_addr_plain, err))?;
        let listener_tls = TcpListener::bind(self.listen_addr_tls)
            .await
            .map_err(|err| ServerError::Bind(self.listen_addr_tls, err))?;

        let plain_addr = listener_plain
            .local_addr()
            .map_err(|err| ServerError::Bind(self.listen_addr_plain, err))?;
        let tls_addr = listener_tls
            .local_addr()
            .map_err(|err| ServerError::Bind(self.listen_addr_tls, err))?;

        let ctx = Arc::new(ConnContext {
            domains: self.domains.clone(),
            dialer: Arc::clone(&self.dialer),
            plain_addr,
            tls_addr,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (workers_tx, workers_rx) = mpsc::channel::<()>(1);

        {
            let mut state = self.state.lock().unwrap();
            if state.started {
                return Err(ServerError::AlreadyStarted);
            }
            state.started = true;
            state.plain_addr = Some(plain_addr);
            state.tls_addr = Some(tls_addr);
            state.shutdown = Some(shutdown_tx);
            state.workers_done = Some(workers_rx);
        }

        tokio::spawn(accept_loop(
            listener_plain,
            true,
            Arc::clone(&ctx),
            shutdown_rx.clone(),
            workers_tx.clone(),
        ));
        tokio::spawn(accept_loop(listener_tls, false, ctx, shutdown_rx, workers_tx));

        info!("relay: listening for plain HTTP on {}", plain_addr);
        info!("relay: listening for TLS on {}", tls_addr);

        Ok(())
    }

    /// Address of the plain HTTP listener, or `None` when not started.
    pub fn addr_plain(&self) -> Option<SocketAddr> {
        let state = self.state.lock().unwrap();
        if state.started { state.plain_addr } else { None }
    }

    /// Address of the TLS listener, or `None` when not started.
    pub fn addr_tls(&self) -> Option<SocketAddr> {
        let state = self.state.lock().unwrap();
        if state.started { state.tls_addr } else { None }
    }

    /// Stops both accept loops and waits until every in-flight connection
    /// worker has returned. Closing a server that is not running is a
    /// no-op.
    pub async fn close(&self) -> Result<(), ServerError> {
        let (shutdown, workers_done) = {
            let mut state = self.state.lock().unwrap();
            if !state.started {
                return Ok(());
            }

            info!("relay: closing");
            state.started = false;
            (state.shutdown.take(), state.workers_done.take())
        };

        if let Some(tx) = shutdown {
            let _ = tx.send(true);
        }

        info!("relay: waiting until connections stop processing");
        if let Some(mut rx) = workers_done {
            // The channel closes once both accept loops and every worker
            // have dropped their sender.
            while rx.recv().await.is_some() {}
        }

        info!("relay: closed");

        Ok(())
    }
}

/// Accepts connections until the shutdown signal fires, spawning one
/// worker per connection. Repeated accept errors back off exponentially
/// instead of spinning.
async fn accept_loop(
    listener: TcpListener,
    plain_http: bool,
    ctx: Arc<ConnContext>,
    mut shutdown: watch::Receiver<bool>,
    workers: mpsc::Sender<()>,
) {
    let label = if plain_http { "plain" } else { "tls" };
    let mut backoff = ACCEPT_BACKOFF_MIN;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("relay: exiting {} listener loop as it has been closed", label);
                return;
            }
            result = listener.accept() => match result {
                Ok((conn, peer_addr)) => {
                    backoff = ACCEPT_BACKOFF_MIN;
                    debug!("relay: accepted new connection from {}", peer_addr);

                    let ctx = Arc::clone(&ctx);
                    let in_flight = workers.clone();
                    tokio::spawn(async move {
                        let work = handle_conn(conn, plain_http, ctx);
                        if let Err(panic) = AssertUnwindSafe(work).catch_unwind().await {
                            error!("relay: panic in connection worker: {:?}", panic);
                        }
                        drop(in_flight);
                    });
                }
                Err(err) => {
                    debug!("relay: error accepting conn: {}", err);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                }
            }
        }
    }
}

/// Handles one accepted connection end-to-end: peek, admit, dial, tunnel.
/// All failures close the connection and stay inside this worker.
async fn handle_conn(conn: TcpStream, plain_http: bool, ctx: Arc<ConnContext>) {
    let Ok(peer_addr) = conn.peer_addr() else {
        return;
    };
    let Ok(local_addr) = conn.local_addr() else {
        return;
    };

    let (server_name, client) = match timeout(READ_TIMEOUT, peek_server_name(conn, plain_http)).await
    {
        Ok(Ok(peeked)) => peeked,
        Ok(Err(err)) => {
            debug!("relay: failed to peek server name from {}: {}", peer_addr, err);
            return;
        }
        Err(_) => {
            debug!("relay: timed out peeking server name from {}", peer_addr);
            return;
        }
    };

    debug!("relay: peeked server name is {:?}", server_name);

    if !ctx.domains.matches(&server_name) {
        debug!("relay: relaying {} is not allowed", server_name);
        return;
    }

    if server_name == ctx.plain_addr.to_string() || server_name == ctx.tls_addr.to_string() {
        debug!("relay: direct connection to the relay address, closing it");
        return;
    }

    let remote_port = if plain_http {
        REMOTE_PORT_PLAIN
    } else {
        REMOTE_PORT_TLS
    };
    let remote_addr = format!("{server_name}:{remote_port}");

    debug!("relay: connecting to {}", remote_addr);
    let remote = match ctx.dialer.dial(&server_name, remote_port, local_addr).await {
        Ok(remote) => remote,
        Err(err) => {
            info!("relay: failed to connect to {}: {}", remote_addr, err);
            return;
        }
    };

    metrics::CONNS_NUM
        .with_label_values(&[remote_addr.as_str()])
        .inc();

    debug!("relay: start tunneling {}<->{}", remote_addr, peer_addr);
    let start = Instant::now();

    let stats = tunnel::run(client, remote).await;

    metrics::CONNS_NUM
        .with_label_values(&[remote_addr.as_str()])
        .dec();
    metrics::BYTES_SENT_TOTAL
        .with_label_values(&[remote_addr.as_str()])
        .inc_by(stats.bytes_sent);
    metrics::BYTES_RECEIVED_TOTAL
        .with_label_values(&[remote_addr.as_str()])
        .inc_by(stats.bytes_received);

    debug!(
        "relay: finished tunneling to {}. received {}, sent {}, elapsed: {:?}",
        remote_addr,
        stats.bytes_received,
        stats.bytes_sent,
        start.elapsed(),
    );
}
