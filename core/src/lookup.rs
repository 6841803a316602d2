//! Hostname and ident collaborators for the admission pipeline
//!
//! Both lookups run with a deadline; on timeout or failure the connection
//! proceeds with the IP literal as its host and no ident answer.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Result of a reverse hostname lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResult {
    pub hostname: Option<String>,
}

impl LookupResult {
    /// The display host: resolved name, or the IP literal fallback.
    pub fn host_or_ip(&self, ip: IpAddr) -> String {
        self.hostname.clone().unwrap_or_else(|| ip.to_string())
    }
}

/// Admission-time lookups with per-request deadlines
#[derive(Debug, Clone)]
pub struct LookupService {
    pub timeout: Duration,
}

impl Default for LookupService {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(5) }
    }
}

impl LookupService {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Reverse-resolve a peer address. Resolution rides the system
    /// resolver; anything but a timely answer yields the IP fallback.
    pub async fn reverse_dns(&self, ip: IpAddr) -> LookupResult {
        let fut = tokio::net::lookup_host((ip.to_string(), 0));
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(mut addrs)) => {
                // the system resolver answers with the address itself when
                // no PTR record exists; treat that as unresolved
                let hostname = addrs
                    .next()
                    .map(|a: SocketAddr| a.ip().to_string())
                    .filter(|h| h != &ip.to_string());
                LookupResult { hostname }
            }
            _ => LookupResult { hostname: None },
        }
    }

    /// RFC 1413 ident query against the peer.
    pub async fn ident(&self, peer: SocketAddr, local: SocketAddr) -> Option<String> {
        let query = async {
            let mut stream = TcpStream::connect((peer.ip(), 113)).await.ok()?;
            let request = format!("{}, {}\r\n", peer.port(), local.port());
            stream.write_all(request.as_bytes()).await.ok()?;
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.ok()?;
            parse_ident_reply(&line)
        };
        tokio::time::timeout(self.timeout, query).await.ok().flatten()
    }
}

fn parse_ident_reply(line: &str) -> Option<String> {
    // "<port>, <port> : USERID : <ostype> : <userid>"
    let mut fields = line.split(':').map(str::trim);
    fields.next()?;
    if fields.next()? != "USERID" {
        return None;
    }
    fields.next()?;
    let userid = fields.next()?.trim_end_matches(['\r', '\n']).trim();
    if userid.is_empty() {
        None
    } else {
        Some(userid.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ident_reply_parsing() {
        assert_eq!(
            parse_ident_reply("6193, 23 : USERID : UNIX : stjohns\r\n"),
            Some("stjohns".to_string())
        );
        assert_eq!(parse_ident_reply("6193, 23 : ERROR : NO-USER\r\n"), None);
        assert_eq!(parse_ident_reply("garbage"), None);
    }

    #[test]
    fn test_host_fallback_is_ip_literal() {
        let res = LookupResult { hostname: None };
        let ip: IpAddr = "192.0.2.7".parse().unwrap();
        assert_eq!(res.host_or_ip(ip), "192.0.2.7");

        let res = LookupResult { hostname: Some("host.example".to_string()) };
        assert_eq!(res.host_or_ip(ip), "host.example");
    }

    #[tokio::test]
    async fn test_ident_times_out_quietly() {
        let svc = LookupService::new(Duration::from_millis(10));
        // RFC 5737 TEST-NET address; nothing listens there
        let peer: SocketAddr = "192.0.2.1:50000".parse().unwrap();
        let local: SocketAddr = "192.0.2.2:6667".parse().unwrap();
        assert_eq!(svc.ident(peer, local).await, None);
    }
}
