//! Destination address parsing for `X-Proxy-Target`.

use std::fmt;
use std::str::FromStr;

use crate::error::AddressParseError;

/// A validated `host:port` pair.
///
/// The host is kept verbatim and resolved only when the tunnel connects, so
/// both names and IPv4 literals are accepted. Bracketed IPv6 literals contain
/// more than one colon and are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddress {
    host: String,
    port: u16,
}

impl TargetAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parse a raw header value, which may be absent or not UTF-8.
    pub fn from_header(value: Option<&[u8]>) -> Result<Self, AddressParseError> {
        let raw = value.ok_or(AddressParseError::Missing)?;
        let text = std::str::from_utf8(raw).map_err(|_| AddressParseError::NotUtf8)?;
        text.parse()
    }
}

impl FromStr for TargetAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut parts = s.split(':');
        let (host, port) = match (parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(port), None) if !host.is_empty() && !port.is_empty() => {
                (host, port)
            }
            _ => return Err(AddressParseError::Format(s.to_string())),
        };

        if host.bytes().any(|b| b.is_ascii_whitespace()) {
            return Err(AddressParseError::InvalidHost(host.to_string()));
        }

        // u32::from_str would accept a leading '+'
        if !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AddressParseError::InvalidPort(port.to_string()));
        }
        let port: u32 = port
            .parse()
            .map_err(|_| AddressParseError::InvalidPort(port.to_string()))?;
        let port = match u16::try_from(port) {
            Ok(p) if p != 0 => p,
            _ => return Err(AddressParseError::PortOutOfRange(port)),
        };

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        let target: TargetAddress = "example.com:443".parse().unwrap();
        assert_eq!(target.host(), "example.com");
        assert_eq!(target.port(), 443);
        assert_eq!(target.to_string(), "example.com:443");

        let target: TargetAddress = "10.0.0.1:1".parse().unwrap();
        assert_eq!(target.port(), 1);

        let target: TargetAddress = "localhost:65535".parse().unwrap();
        assert_eq!(target.port(), 65535);
    }

    #[test]
    fn test_parse_rejects_bad_shape() {
        for raw in ["", ":", "host", "host:", ":80", "a:b:c", "::1:80", "[::1]:80"] {
            assert!(
                matches!(raw.parse::<TargetAddress>(), Err(AddressParseError::Format(_))),
                "{raw:?} should be a format error"
            );
        }
    }

    #[test]
    fn test_parse_rejects_whitespace_in_host() {
        assert_eq!(
            "db host:5432".parse::<TargetAddress>(),
            Err(AddressParseError::InvalidHost("db host".to_string()))
        );
        assert!(matches!(
            "db\thost:5432".parse::<TargetAddress>(),
            Err(AddressParseError::InvalidHost(_))
        ));
        // Outer whitespace is trimmed, not rejected.
        assert_eq!(
            " db:5432 ".parse::<TargetAddress>(),
            Ok(TargetAddress::new("db", 5432))
        );
    }

    #[test]
    fn test_parse_rejects_bad_port() {
        assert_eq!(
            "host:http".parse::<TargetAddress>(),
            Err(AddressParseError::InvalidPort("http".to_string()))
        );
        assert_eq!(
            "host:+80".parse::<TargetAddress>(),
            Err(AddressParseError::InvalidPort("+80".to_string()))
        );
        assert_eq!(
            "host:-1".parse::<TargetAddress>(),
            Err(AddressParseError::InvalidPort("-1".to_string()))
        );
        assert_eq!(
            "host:0".parse::<TargetAddress>(),
            Err(AddressParseError::PortOutOfRange(0))
        );
        assert_eq!(
            "host:65536".parse::<TargetAddress>(),
            Err(AddressParseError::PortOutOfRange(65536))
        );
        assert!(matches!(
            "host:99999999999".parse::<TargetAddress>(),
            Err(AddressParseError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_from_header() {
        assert_eq!(
            TargetAddress::from_header(None),
            Err(AddressParseError::Missing)
        );
        assert_eq!(
            TargetAddress::from_header(Some(&[0xff, b':', b'1'])),
            Err(AddressParseError::NotUtf8)
        );
        assert_eq!(
            TargetAddress::from_header(Some(b"db.internal:5432")),
            Ok(TargetAddress::new("db.internal", 5432))
        );
    }
}
