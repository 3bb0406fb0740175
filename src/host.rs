//! Peer records produced by discovery and consumed by the client transport.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    #[default]
    Unknown,
    Online,
    Offline,
}

/// A discovered or configured peer.
///
/// Discovery owns and mutates these; the transport only reads them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(
        rename = "tailscaleIP",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub tailscale_ip: Option<String>,
    #[serde(default)]
    pub status: HostStatus,
    /// Milliseconds since the Unix epoch
    #[serde(default)]
    pub last_seen: u64,
    #[serde(default)]
    pub version: String,
}

impl Host {
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            address: address.into(),
            port,
            tailscale_ip: None,
            status: HostStatus::Unknown,
            last_seen: 0,
            version: String::new(),
        }
    }

    /// `address:port`, bracketing IPv6 literals.
    pub fn socket_addr_string(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// Name presented for TLS SNI. The certificate is not validated against
    /// it, but rustls still needs a syntactically valid name.
    pub fn server_name(&self) -> String {
        self.address
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_wire_shape() {
        let host: Host = serde_json::from_str(
            r#"{"id":"h1","name":"laptop","address":"192.168.1.4","port":9876,
                "tailscaleIP":"100.64.0.2","status":"online","lastSeen":1700000000000,
                "version":"1.2.0"}"#,
        )
        .unwrap();
        assert_eq!(host.tailscale_ip.as_deref(), Some("100.64.0.2"));
        assert_eq!(host.status, HostStatus::Online);
        assert_eq!(host.socket_addr_string(), "192.168.1.4:9876");
    }

    #[test]
    fn test_ipv6_socket_addr() {
        let host = Host::new("h", "::1", 7000);
        assert_eq!(host.socket_addr_string(), "[::1]:7000");
        assert_eq!(host.server_name(), "::1");
    }
}
