//! Access level for the status endpoint.
//!
//! Local callers (loopback or private ranges) and callers presenting the
//! access token get the detailed view; everyone else gets the basic one.

use std::io::Write;
use std::net::IpAddr;

use axum::http::HeaderMap;
use rand::RngCore;

pub const ACCESS_TOKEN_HEADER: &str = "x-access-token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    Basic,
    Detailed,
}

/// Status endpoint settings resolved at startup.
#[derive(Debug, Clone)]
pub struct StatusAccess {
    pub name: String,
    token: String,
}

impl StatusAccess {
    /// Use the configured token, or generate one and print it to stderr.
    ///
    /// A generated token never goes through the log pipeline.
    pub fn new(name: impl Into<String>, configured: Option<String>) -> Self {
        let token = match configured.filter(|t| !t.is_empty()) {
            Some(token) => token,
            None => {
                let token = generate_token();
                tracing::warn!(
                    "No status access token configured; generated one for this run (printed to stderr). \
                     Set status.access_token to pin it"
                );
                if let Err(e) = announce_token(&mut std::io::stderr().lock(), &token) {
                    tracing::error!(error = %e, "Failed to print generated access token");
                }
                token
            }
        };
        Self {
            name: name.into(),
            token,
        }
    }

    pub fn level(&self, peer: IpAddr, headers: &HeaderMap, query_token: Option<&str>) -> AccessLevel {
        if is_local(peer) {
            return AccessLevel::Detailed;
        }
        let header_token = headers.get(ACCESS_TOKEN_HEADER).and_then(|v| v.to_str().ok());
        if header_token == Some(self.token.as_str()) || query_token == Some(self.token.as_str()) {
            AccessLevel::Detailed
        } else {
            AccessLevel::Basic
        }
    }
}

fn announce_token(out: &mut impl Write, token: &str) -> std::io::Result<()> {
    writeln!(out, "status access token: {token}")?;
    writeln!(out, "set status.access_token in the config file to keep it across restarts")
}

fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Loopback or private-range address.
pub fn is_local(ip: IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn local_ranges() {
        assert!(is_local(addr("127.0.0.1")));
        assert!(is_local(addr("192.168.0.10")));
        assert!(is_local(addr("10.1.2.3")));
        assert!(is_local(addr("::1")));
        assert!(is_local(addr("::ffff:172.16.0.1")));
        assert!(is_local(addr("fd00::1")));
        assert!(!is_local(addr("8.8.8.8")));
        assert!(!is_local(addr("2001:db8::1")));
    }

    #[test]
    fn token_unlocks_detailed_view_for_remote_callers() {
        let access = StatusAccess::new("relay", Some("s3cret".to_string()));
        let remote = addr("203.0.113.5");

        assert_eq!(access.level(remote, &HeaderMap::new(), None), AccessLevel::Basic);
        assert_eq!(access.level(remote, &HeaderMap::new(), Some("s3cret")), AccessLevel::Detailed);
        assert_eq!(access.level(remote, &HeaderMap::new(), Some("guess")), AccessLevel::Basic);

        let mut headers = HeaderMap::new();
        headers.insert(ACCESS_TOKEN_HEADER, HeaderValue::from_static("s3cret"));
        assert_eq!(access.level(remote, &headers, None), AccessLevel::Detailed);
    }

    #[test]
    fn generated_tokens_are_hex() {
        let token = generate_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn generated_token_is_announced_with_guidance() {
        let mut out = Vec::new();
        announce_token(&mut out, "abc123").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("status access token: abc123\n"));
        assert!(text.contains("status.access_token"));
    }
}
