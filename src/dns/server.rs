//! The DNS steering front-end.
//!
//! Listens for plain DNS over UDP and TCP. Address queries (A, AAAA) for
//! steered domains are answered with the relay's address so clients
//! connect to the relay; HTTPS (TYPE65) queries for those domains get an
//! empty NOERROR answer so clients fall back to A/AAAA. Everything else
//! is forwarded verbatim to the upstream resolver.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::config::Config;
use super::ratelimit::RateLimiter;
use super::wire::{self, Question, RData};
use crate::domains::DomainPatterns;
use crate::metrics;

/// Buffer size for DNS packets (EDNS0 supports up to 4096).
const DNS_BUF_SIZE: usize = 4096;

/// Timeout for upstream responses.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle deadline for DNS-over-TCP connections.
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server is already started")]
    AlreadyStarted,
    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, #[source] std::io::Error),
}

/// The DNS server.
pub struct Server {
    handler: Arc<Handler>,
    listen_addr: SocketAddr,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    started: bool,
    addr: Option<SocketAddr>,
    shutdown: Option<watch::Sender<bool>>,
    tasks_done: Option<mpsc::Receiver<()>>,
}

/// Query handling shared by the UDP and TCP listeners.
struct Handler {
    domains: DomainPatterns,
    config: Config,
    rate_limiter: RateLimiter,
}

impl Server {
    /// Creates a new DNS server from the given configuration.
    pub fn new(config: Config) -> Self {
        let listen_addr = SocketAddr::new(config.listen_addr, config.port);

        Self {
            handler: Arc::new(Handler {
                domains: DomainPatterns::new(&config.redirect_domains),
                rate_limiter: RateLimiter::new(
                    config.rate_limit,
                    config.rate_limit_allowlist.clone(),
                ),
                config,
            }),
            listen_addr,
            state: Mutex::new(State::default()),
        }
    }

    /// Binds the UDP socket and the TCP listener on the same port and
    /// launches both serving loops.
    pub async fn start(&self) -> Result<(), ServerError> {
        info!("dns: starting");

        if self.state.lock().unwrap().started {
            return Err(ServerError::AlreadyStarted);
        }

        let udp = UdpSocket::bind(self.listen_addr)
            .await
            .map_err(|err| ServerError::Bind(self.listen_addr, err))?;
        let addr = udp
            .local_addr()
            .map_err(|err| ServerError::Bind(self.listen_addr, err))?;
        // TCP shares the effective port, which matters when 0 was asked.
        let tcp = TcpListener::bind(addr)
            .await
            .map_err(|err| ServerError::Bind(addr, err))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tasks_tx, tasks_rx) = mpsc::channel::<()>(1);

        {
            let mut state = self.state.lock().unwrap();
            if state.started {
                return Err(ServerError::AlreadyStarted);
            }
            state.started = true;
            state.addr = Some(addr);
            state.shutdown = Some(shutdown_tx);
            state.tasks_done = Some(tasks_rx);
        }

        tokio::spawn(udp_loop(
            Arc::new(udp),
            Arc::clone(&self.handler),
            shutdown_rx.clone(),
            tasks_tx.clone(),
        ));
        tokio::spawn(tcp_loop(
            tcp,
            Arc::clone(&self.handler),
            shutdown_rx,
            tasks_tx,
        ));

        info!("dns: listening on {} (udp and tcp)", addr);

        Ok(())
    }

    /// The effective listen address, or `None` when not started.
    pub fn addr(&self) -> Option<SocketAddr> {
        let state = self.state.lock().unwrap();
        if state.started { state.addr } else { None }
    }

    /// Stops both serving loops and waits for in-flight query tasks.
    /// Closing a server that is not running is a no-op.
    pub async fn close(&self) -> Result<(), ServerError> {
        let (shutdown, tasks_done) = {
            let mut state = self.state.lock().unwrap();
            if !state.started {
                return Ok(());
            }

            info!("dns: closing");
            state.started = false;
            (state.shutdown.take(), state.tasks_done.take())
        };

        if let Some(tx) = shutdown {
            let _ = tx.send(true);
        }

        if let Some(mut rx) = tasks_done {
            while rx.recv().await.is_some() {}
        }

        info!("dns: closed");

        Ok(())
    }
}

/// Receives UDP queries and answers each from a spawned task.
async fn udp_loop(
    socket: Arc<UdpSocket>,
    handler: Arc<Handler>,
    mut shutdown: watch::Receiver<bool>,
    tasks: mpsc::Sender<()>,
) {
    let mut buf = [0u8; DNS_BUF_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("dns: exiting UDP loop as the server has been closed");
                return;
            }
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, client_addr)) => {
                    if !handler.rate_limiter.allow(client_addr.ip()) {
                        continue;
                    }

                    let packet = buf[..len].to_vec();
                    let socket = Arc::clone(&socket);
                    let handler = Arc::clone(&handler);
                    let in_flight = tasks.clone();
                    tokio::spawn(async move {
                        if let Some(response) = handler.handle_query(&packet, "udp").await
                            && let Err(err) = socket.send_to(&response, client_addr).await
                        {
                            debug!("dns: failed to respond to {}: {}", client_addr, err);
                        }
                        drop(in_flight);
                    });
                }
                Err(err) => {
                    debug!("dns: error receiving packet: {}", err);
                }
            }
        }
    }
}

/// Accepts DNS-over-TCP connections.
async fn tcp_loop(
    listener: TcpListener,
    handler: Arc<Handler>,
    mut shutdown: watch::Receiver<bool>,
    tasks: mpsc::Sender<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("dns: exiting TCP loop as the server has been closed");
                return;
            }
            result = listener.accept() => match result {
                Ok((conn, client_addr)) => {
                    let handler = Arc::clone(&handler);
                    let in_flight = tasks.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_tcp_conn(conn, &handler).await {
                            debug!("dns: TCP connection from {} ended: {}", client_addr, err);
                        }
                        drop(in_flight);
                    });
                }
                Err(err) => {
                    debug!("dns: error accepting TCP connection: {}", err);
                }
            }
        }
    }
}

/// Serves length-prefixed queries on one TCP connection until the client
/// closes or goes idle (RFC 1035 section 4.2.2 framing).
async fn serve_tcp_conn(mut conn: TcpStream, handler: &Handler) -> std::io::Result<()> {
    loop {
        let len = match timeout(TCP_IDLE_TIMEOUT, conn.read_u16()).await {
            Ok(Ok(len)) => len as usize,
            // Clean EOF between messages, or idle for too long.
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(err)) => return Err(err),
            Err(_) => return Ok(()),
        };

        if len == 0 || len > DNS_BUF_SIZE {
            return Ok(());
        }

        let mut packet = vec![0u8; len];
        conn.read_exact(&mut packet).await?;

        if let Some(response) = handler.handle_query(&packet, "tcp").await {
            conn.write_u16(response.len() as u16).await?;
            conn.write_all(&response).await?;
        }
    }
}

impl Handler {
    /// Produces the response for one query: a steering override for
    /// matched address queries, otherwise whatever the upstream says.
    async fn handle_query(&self, packet: &[u8], proto: &'static str) -> Option<Vec<u8>> {
        let question = match Question::parse(packet) {
            Ok(question) => question,
            Err(err) => {
                debug!("dns: ignoring unparseable packet: {}", err);
                return None;
            }
        };

        let redirect = self.domains.matches(&question.name);
        metrics::QUERIES_TOTAL
            .with_label_values(&[proto, if redirect { "1" } else { "0" }])
            .inc();

        debug!(
            "dns: [{}] type {} query for {}",
            question.txid, question.qtype, question.name
        );

        if redirect && let Some(response) = self.override_response(packet, &question) {
            return Some(response);
        }

        self.forward(packet).await
    }

    /// Builds the steering answer for address-family queries. Other query
    /// types go upstream even for steered domains.
    fn override_response(&self, packet: &[u8], question: &Question) -> Option<Vec<u8>> {
        match question.qtype {
            wire::QTYPE_A => {
                let rdata = self.config.redirect_addr_v4.map(RData::A);
                Some(wire::build_response(packet, question, rdata))
            }
            wire::QTYPE_AAAA => {
                let rdata = self.config.redirect_addr_v6.map(RData::Aaaa);
                Some(wire::build_response(packet, question, rdata))
            }
            wire::QTYPE_HTTPS => Some(wire::build_response(packet, question, None)),
            _ => None,
        }
    }

    /// Forwards the query verbatim to the upstream resolver and relays
    /// its response verbatim.
    async fn forward(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let upstream = self.config.upstream_addr;
        let bind_addr: SocketAddr = if upstream.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };

        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(err) => {
                warn!("dns: failed to bind upstream socket: {}", err);
                return None;
            }
        };

        if let Err(err) = socket.send_to(packet, upstream).await {
            warn!("dns: failed to reach upstream {}: {}", upstream, err);
            return None;
        }

        let mut buf = [0u8; DNS_BUF_SIZE];
        match timeout(UPSTREAM_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => Some(buf[..len].to_vec()),
            Ok(Err(err)) => {
                warn!("dns: upstream recv error: {}", err);
                None
            }
            Err(_) => {
                warn!("dns: upstream timeout (server: {})", upstream);
                None
            }
        }
    }
}
