//! DNS wire format.
//!
//! Just enough of RFC 1035 for the steering front-end: reading the
//! question out of client queries, and building address or empty NOERROR
//! answers that echo the query. Only queries are ever parsed here —
//! upstream responses are relayed back verbatim — so the name reader
//! handles the plain label runs queries carry and treats anything else
//! as malformed.

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;

/// Query type for IPv4 addresses.
pub const QTYPE_A: u16 = 1;

/// Query type for IPv6 addresses.
pub const QTYPE_AAAA: u16 = 28;

/// Query type for HTTPS service bindings (TYPE65).
pub const QTYPE_HTTPS: u16 = 65;

/// TTL of rewritten steering answers.
pub const REDIRECT_TTL: u32 = 300;

/// Wire-format cap on a full domain name (RFC 1035 section 2.3.4).
const MAX_NAME_WIRE_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("packet truncated at {0} bytes")]
    Truncated(usize),
    #[error("packet is not a query with a question")]
    NoQuestion,
    #[error("malformed question name")]
    BadName,
}

/// The first question of a DNS query.
#[derive(Debug, Clone)]
pub struct Question {
    /// The queried domain name, without the trailing dot.
    pub name: String,
    /// Query type (A=1, AAAA=28, HTTPS=65, ...).
    pub qtype: u16,
    /// DNS transaction ID.
    pub txid: u16,
    /// Offset just past the question section (name + QTYPE + QCLASS).
    question_end: usize,
}

impl Question {
    /// Parses the first question of a query packet.
    ///
    /// Responses (QR bit set) and packets without a question are
    /// rejected. A freshly built query writes its question name as a
    /// plain run of labels, so a compression pointer or reserved label
    /// type here is malformed and is rejected rather than followed.
    pub fn parse(packet: &[u8]) -> Result<Self, WireError> {
        let header = packet.get(..12).ok_or(WireError::Truncated(packet.len()))?;

        if header[2] & 0x80 != 0 {
            return Err(WireError::NoQuestion);
        }
        if u16::from_be_bytes([header[4], header[5]]) == 0 {
            return Err(WireError::NoQuestion);
        }

        let txid = u16::from_be_bytes([header[0], header[1]]);

        // Single pass over the label run, tracking the question span as
        // we go.
        let mut name = String::new();
        let mut pos = 12;
        loop {
            let &len = packet.get(pos).ok_or(WireError::Truncated(packet.len()))?;
            pos += 1;

            match len {
                0 => break,
                1..=63 => {
                    let label = packet
                        .get(pos..pos + len as usize)
                        .ok_or(WireError::Truncated(packet.len()))?;
                    pos += len as usize;

                    if pos - 12 > MAX_NAME_WIRE_LEN {
                        return Err(WireError::BadName);
                    }

                    if !name.is_empty() {
                        name.push('.');
                    }
                    // Hostnames are ASCII in practice; keep whatever the
                    // client sent so the patterns see it unchanged.
                    name.extend(label.iter().map(|&b| b as char));
                }
                _ => return Err(WireError::BadName),
            }
        }

        let question_end = pos + 4;
        let type_class = packet
            .get(pos..question_end)
            .ok_or(WireError::Truncated(packet.len()))?;
        let qtype = u16::from_be_bytes([type_class[0], type_class[1]]);

        Ok(Self {
            name,
            qtype,
            txid,
            question_end,
        })
    }
}

/// Record data for a steering answer.
#[derive(Debug, Clone, Copy)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
}

/// Builds a steering response for `question`: the echoed header and
/// question followed by a single address record, or an empty NOERROR
/// answer when `rdata` is absent (used for HTTPS queries and for address
/// families without a configured redirect address).
pub fn build_response(query: &[u8], question: &Question, rdata: Option<RData>) -> Vec<u8> {
    // Header plus the question section, verbatim. Any additional records
    // of the query (such as EDNS OPT) are dropped, and the counts below
    // are rewritten to match.
    let mut response = query[..question.question_end].to_vec();

    // QR=1, RA=1, RCODE=0; OPCODE and RD carried over from the query.
    let flags = u16::from_be_bytes([query[2], query[3]]);
    let new_flags = (flags & 0x7900) | 0x8000 | 0x0080;
    response[2..4].copy_from_slice(&new_flags.to_be_bytes());

    let ancount: u16 = if rdata.is_some() { 1 } else { 0 };
    response[6..8].copy_from_slice(&ancount.to_be_bytes());
    response[8..10].copy_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    response[10..12].copy_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    if let Some(rdata) = rdata {
        // Name as a compression pointer to the question at offset 12.
        response.extend_from_slice(&[0xC0, 0x0C]);

        let (rtype, addr_bytes): (u16, Vec<u8>) = match rdata {
            RData::A(v4) => (QTYPE_A, v4.octets().to_vec()),
            RData::Aaaa(v6) => (QTYPE_AAAA, v6.octets().to_vec()),
        };

        response.extend_from_slice(&rtype.to_be_bytes());
        response.extend_from_slice(&1u16.to_be_bytes()); // CLASS IN
        response.extend_from_slice(&REDIRECT_TTL.to_be_bytes());
        response.extend_from_slice(&(addr_bytes.len() as u16).to_be_bytes());
        response.extend_from_slice(&addr_bytes);
    }

    response
}
