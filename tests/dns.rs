//! DNS front-end tests.
//!
//! The server under test steers address queries for configured domains
//! and forwards everything else to a fake upstream resolver that answers
//! NXDOMAIN, which makes forwarded responses easy to tell apart from
//! locally generated ones.

use std::net::SocketAddr;
use std::time::Duration;

use shunt::dns::{Config, Server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

const QTYPE_A: u16 = 1;
const QTYPE_AAAA: u16 = 28;
const QTYPE_HTTPS: u16 = 65;
const QTYPE_TXT: u16 = 16;

/// Builds a DNS query packet.
fn build_query(name: &str, qtype: u16) -> Vec<u8> {
    let mut packet = vec![
        0x12, 0x34, // Transaction ID
        0x01, 0x00, // Flags: standard query, RD
        0x00, 0x01, // QDCOUNT: 1
        0x00, 0x00, // ANCOUNT: 0
        0x00, 0x00, // NSCOUNT: 0
        0x00, 0x00, // ARCOUNT: 0
    ];

    for label in name.split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes());

    packet
}

fn rcode(packet: &[u8]) -> u8 {
    packet[3] & 0x0F
}

fn ancount(packet: &[u8]) -> u16 {
    u16::from_be_bytes([packet[6], packet[7]])
}

/// Fake upstream resolver: echoes every query back with QR set and
/// RCODE=3 (NXDOMAIN).
async fn spawn_upstream() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let Ok((len, client)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let mut response = buf[..len].to_vec();
            response[2] |= 0x80; // QR
            response[3] = (response[3] & 0xF0) | 0x03; // NXDOMAIN
            let _ = socket.send_to(&response, client).await;
        }
    });

    addr
}

fn dns_config(upstream: SocketAddr, rate_limit: u32) -> Config {
    Config {
        listen_addr: "127.0.0.1".parse().unwrap(),
        port: 0,
        upstream_addr: upstream,
        redirect_addr_v4: Some("203.0.113.10".parse().unwrap()),
        redirect_addr_v6: None,
        redirect_domains: vec!["*.example".to_string()],
        rate_limit,
        rate_limit_allowlist: Vec::new(),
    }
}

async fn query_udp(server_addr: SocketAddr, packet: &[u8]) -> Option<Vec<u8>> {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(packet, server_addr).await.unwrap();

    let mut buf = [0u8; 4096];
    match timeout(Duration::from_millis(500), socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => Some(buf[..len].to_vec()),
        _ => None,
    }
}

/// An A query for a steered domain is answered with the redirect address
/// and a 300-second TTL, without consulting the upstream.
#[tokio::test]
async fn steered_a_query_gets_redirect_answer() {
    let upstream = spawn_upstream().await;
    let server = Server::new(dns_config(upstream, 0));
    server.start().await.unwrap();
    let addr = server.addr().unwrap();

    let response = query_udp(addr, &build_query("api.example", QTYPE_A))
        .await
        .expect("no response");

    assert_eq!(rcode(&response), 0);
    assert_eq!(ancount(&response), 1);
    // TTL and address sit at the end of the single answer record.
    let record_tail = &response[response.len() - 10..];
    assert_eq!(
        u32::from_be_bytes([record_tail[0], record_tail[1], record_tail[2], record_tail[3]]),
        300
    );
    assert_eq!(&response[response.len() - 4..], &[203, 0, 113, 10]);

    server.close().await.unwrap();
}

/// An AAAA query for a steered domain gets an empty NOERROR answer when
/// no IPv6 redirect address is configured.
#[tokio::test]
async fn steered_aaaa_without_v6_gets_empty_noerror() {
    let upstream = spawn_upstream().await;
    let server = Server::new(dns_config(upstream, 0));
    server.start().await.unwrap();

    let response = query_udp(server.addr().unwrap(), &build_query("api.example", QTYPE_AAAA))
        .await
        .expect("no response");

    assert_eq!(rcode(&response), 0);
    assert_eq!(ancount(&response), 0);

    server.close().await.unwrap();
}

/// An AAAA query is answered with the configured IPv6 redirect address.
#[tokio::test]
async fn steered_aaaa_with_v6_gets_answer() {
    let upstream = spawn_upstream().await;
    let mut config = dns_config(upstream, 0);
    config.redirect_addr_v6 = Some("2001:db8::10".parse().unwrap());
    let server = Server::new(config);
    server.start().await.unwrap();

    let response = query_udp(server.addr().unwrap(), &build_query("api.example", QTYPE_AAAA))
        .await
        .expect("no response");

    assert_eq!(ancount(&response), 1);
    let expected: std::net::Ipv6Addr = "2001:db8::10".parse().unwrap();
    assert_eq!(&response[response.len() - 16..], &expected.octets());

    server.close().await.unwrap();
}

/// HTTPS (TYPE65) queries for steered domains are suppressed with an
/// empty NOERROR so clients fall back to A/AAAA.
#[tokio::test]
async fn https_query_gets_empty_noerror() {
    let upstream = spawn_upstream().await;
    let server = Server::new(dns_config(upstream, 0));
    server.start().await.unwrap();

    let response = query_udp(server.addr().unwrap(), &build_query("api.example", QTYPE_HTTPS))
        .await
        .expect("no response");

    assert_eq!(rcode(&response), 0);
    assert_eq!(ancount(&response), 0);

    server.close().await.unwrap();
}

/// Queries for unlisted domains are forwarded verbatim to the upstream
/// and its response is relayed back (recognizable by the NXDOMAIN the
/// fake upstream always returns).
#[tokio::test]
async fn unmatched_query_is_forwarded_upstream() {
    let upstream = spawn_upstream().await;
    let server = Server::new(dns_config(upstream, 0));
    server.start().await.unwrap();

    let response = query_udp(server.addr().unwrap(), &build_query("other.test", QTYPE_A))
        .await
        .expect("no response");

    assert_eq!(rcode(&response), 3);

    server.close().await.unwrap();
}

/// Non-address query types go upstream even for steered domains.
#[tokio::test]
async fn steered_txt_query_is_forwarded_upstream() {
    let upstream = spawn_upstream().await;
    let server = Server::new(dns_config(upstream, 0));
    server.start().await.unwrap();

    let response = query_udp(server.addr().unwrap(), &build_query("api.example", QTYPE_TXT))
        .await
        .expect("no response");

    assert_eq!(rcode(&response), 3);

    server.close().await.unwrap();
}

/// The same answers are served over DNS-over-TCP framing.
#[tokio::test]
async fn tcp_query_is_answered() {
    let upstream = spawn_upstream().await;
    let server = Server::new(dns_config(upstream, 0));
    server.start().await.unwrap();

    let mut conn = TcpStream::connect(server.addr().unwrap()).await.unwrap();

    let query = build_query("api.example", QTYPE_A);
    conn.write_u16(query.len() as u16).await.unwrap();
    conn.write_all(&query).await.unwrap();

    let len = conn.read_u16().await.unwrap() as usize;
    let mut response = vec![0u8; len];
    conn.read_exact(&mut response).await.unwrap();

    assert_eq!(ancount(&response), 1);
    assert_eq!(&response[response.len() - 4..], &[203, 0, 113, 10]);

    server.close().await.unwrap();
}

/// Queries beyond the per-subnet rate limit are dropped without a
/// response.
#[tokio::test]
async fn rate_limited_queries_are_dropped() {
    let upstream = spawn_upstream().await;
    let server = Server::new(dns_config(upstream, 1));
    server.start().await.unwrap();
    let addr = server.addr().unwrap();

    let first = query_udp(addr, &build_query("api.example", QTYPE_A)).await;
    assert!(first.is_some());

    let second = query_udp(addr, &build_query("api.example", QTYPE_A)).await;
    assert!(second.is_none(), "second query should have been dropped");

    server.close().await.unwrap();
}

/// Lifecycle mirrors the relay server: no address before start, close is
/// idempotent.
#[tokio::test]
async fn lifecycle() {
    let upstream = spawn_upstream().await;
    let server = Server::new(dns_config(upstream, 0));

    assert!(server.addr().is_none());
    server.close().await.unwrap();

    server.start().await.unwrap();
    assert!(server.addr().is_some());
    assert!(server.start().await.is_err());

    server.close().await.unwrap();
    assert!(server.addr().is_none());
    server.close().await.unwrap();
}
