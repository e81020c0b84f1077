use std::sync::Arc;

use http::header::{AUTHORIZATION, UPGRADE};
use http::HeaderMap;

use crate::error::TunnelError;
use crate::protocol::{Secret, TargetAddress, TARGET_HEADER, UPGRADE_PROTOCOL};

/// Admission checks run on every request, in order: credential,
/// upgrade token, target address. Nothing is opened until all three pass.
#[derive(Debug, Clone)]
pub struct Gate {
    secret: Arc<Secret>,
}

impl Gate {
    pub fn new(secret: Arc<Secret>) -> Self {
        Self { secret }
    }

    pub fn admit(&self, headers: &HeaderMap) -> Result<TargetAddress, TunnelError> {
        let credential = headers.get(AUTHORIZATION).map(|v| v.as_bytes());
        if !self.secret.matches(credential) {
            return Err(TunnelError::Auth);
        }

        match headers.get(UPGRADE) {
            Some(upgrade) if upgrade.as_bytes() == UPGRADE_PROTOCOL.as_bytes() => {}
            _ => return Err(TunnelError::Protocol),
        }

        let target = TargetAddress::from_header(headers.get(TARGET_HEADER).map(|v| v.as_bytes()))?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AddressParseError;

    fn gate() -> Gate {
        Gate::new(Arc::new(Secret::new("letmein").unwrap()))
    }

    fn request(headers: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                http::HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_admits_valid_request() {
        let req = request(&[
            ("Authorization", "letmein"),
            ("Upgrade", "websocket"),
            ("X-Proxy-Target", "example.com:22"),
        ]);

        let target = gate().admit(&req).unwrap();
        assert_eq!(target, TargetAddress::new("example.com", 22));
    }

    #[test]
    fn test_rejects_bad_credentials_first() {
        for auth in [None, Some(""), Some("letmei"), Some("letmein2"), Some("Bearer letmein")] {
            let mut headers = vec![("Upgrade", "nope")];
            if let Some(auth) = auth {
                headers.push(("Authorization", auth));
            }
            // Credential is checked before anything else, even a bad upgrade.
            assert!(matches!(
                gate().admit(&request(&headers)),
                Err(TunnelError::Auth)
            ));
        }
    }

    #[test]
    fn test_requires_websocket_upgrade() {
        for upgrade in [None, Some("h2c"), Some("WebSocket"), Some("")] {
            let mut headers = vec![("Authorization", "letmein"), ("X-Proxy-Target", "a:1")];
            if let Some(upgrade) = upgrade {
                headers.push(("Upgrade", upgrade));
            }
            assert!(matches!(
                gate().admit(&request(&headers)),
                Err(TunnelError::Protocol)
            ));
        }
    }

    #[test]
    fn test_requires_target() {
        let req = request(&[("Authorization", "letmein"), ("Upgrade", "websocket")]);
        assert!(matches!(
            gate().admit(&req),
            Err(TunnelError::Address(AddressParseError::Missing))
        ));

        let req = request(&[
            ("Authorization", "letmein"),
            ("Upgrade", "websocket"),
            ("X-Proxy-Target", "example.com:70000"),
        ]);
        assert!(matches!(
            gate().admit(&req),
            Err(TunnelError::Address(AddressParseError::PortOutOfRange(70000)))
        ));
    }
}
