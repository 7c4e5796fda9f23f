//! Capture filter expressions.
//!
//! A small userspace subset of the usual capture filter syntax:
//!
//! ```text
//! tcp
//! port 443
//! tcp port 80
//! host 10.0.0.1 and tcp port 22
//! ```
//!
//! All terms must match. An empty expression matches every frame.

use std::net::IpAddr;

use crate::handshake::decode::ip_endpoints;
use crate::handshake::{DecodedPacket, LinkType};

/// Error parsing a filter expression.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("expected a port number after 'port'")]
    MissingPort,

    #[error("invalid port: '{0}'")]
    InvalidPort(String),

    #[error("expected an address after 'host'")]
    MissingHost,

    #[error("invalid host address: '{0}'")]
    InvalidHost(String),

    #[error("unsupported filter term: '{0}' (supported: tcp, port N, host ADDR, and)")]
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    Tcp,
    Port(u16),
    Host(IpAddr),
}

/// Parsed capture filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureFilter {
    terms: Vec<Term>,
}

impl CaptureFilter {
    /// Filter that accepts every frame.
    pub fn any() -> Self {
        Self::default()
    }

    /// Parse a filter expression.
    pub fn parse(expr: &str) -> Result<Self, FilterError> {
        let mut terms = Vec::new();
        let mut tokens = expr.split_whitespace();

        while let Some(token) = tokens.next() {
            match token.to_ascii_lowercase().as_str() {
                "and" | "&&" => {}
                "tcp" => terms.push(Term::Tcp),
                "port" => {
                    let raw = tokens.next().ok_or(FilterError::MissingPort)?;
                    let port = raw
                        .parse::<u16>()
                        .map_err(|_| FilterError::InvalidPort(raw.to_string()))?;
                    terms.push(Term::Port(port));
                }
                "host" => {
                    let raw = tokens.next().ok_or(FilterError::MissingHost)?;
                    let addr = raw
                        .parse::<IpAddr>()
                        .map_err(|_| FilterError::InvalidHost(raw.to_string()))?;
                    terms.push(Term::Host(addr));
                }
                _ => return Err(FilterError::Unsupported(token.to_string())),
            }
        }

        Ok(Self { terms })
    }

    /// True if the filter has no terms.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Check a frame against the filter.
    ///
    /// `packet` is the already-decoded form of `data`. Port terms match TCP
    /// source or destination ports only.
    pub fn matches(&self, data: &[u8], link: LinkType, packet: &DecodedPacket) -> bool {
        if self.terms.is_empty() {
            return true;
        }
        let mut endpoints = None;
        self.terms.iter().all(|term| match term {
            Term::Tcp => packet.tcp.is_some(),
            Term::Port(port) => packet
                .tcp
                .map(|t| t.source_port == *port || t.dest_port == *port)
                .unwrap_or(false),
            Term::Host(addr) => {
                let (src, dst) = match *endpoints.get_or_insert_with(|| ip_endpoints(data, link)) {
                    Some(pair) => pair,
                    None => return false,
                };
                src == *addr || dst == *addr
            }
        })
    }
}

impl std::fmt::Display for CaptureFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.terms.is_empty() {
            return write!(f, "(any)");
        }
        let parts: Vec<String> = self
            .terms
            .iter()
            .map(|t| match t {
                Term::Tcp => "tcp".to_string(),
                Term::Port(p) => format!("port {p}"),
                Term::Host(h) => format!("host {h}"),
            })
            .collect();
        write!(f, "{}", parts.join(" and "))
    }
}
