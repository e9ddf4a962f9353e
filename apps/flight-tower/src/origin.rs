use std::net::IpAddr;

use thiserror::Error;
use url::{Host, Url};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OriginRejection {
    #[error("request carried no Origin header")]
    Missing,
    #[error("origin {0} is not allowed")]
    NotAllowed(String),
}

impl OriginRejection {
    pub fn metric_label(&self) -> &'static str {
        match self {
            OriginRejection::Missing => "missing",
            OriginRejection::NotAllowed(_) => "not_allowed",
        }
    }
}

/// Decides, before the WebSocket upgrade, whether a request may connect.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    allowed: Vec<String>,
    permissive: bool,
}

impl OriginPolicy {
    /// Only origins in `allowed` are accepted.
    pub fn strict(allowed: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        Self {
            allowed: allowed
                .into_iter()
                .map(|origin| normalize(origin.as_ref()))
                .filter(|origin| !origin.is_empty())
                .collect(),
            permissive: false,
        }
    }

    /// Like `strict`, but also accepts loopback origins on any port and
    /// requests without an Origin header. Meant for local development.
    pub fn permissive(allowed: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        Self {
            permissive: true,
            ..Self::strict(allowed)
        }
    }

    pub fn is_permissive(&self) -> bool {
        self.permissive
    }

    pub fn check(&self, origin: Option<&str>) -> Result<(), OriginRejection> {
        let Some(origin) = origin else {
            return if self.permissive {
                Ok(())
            } else {
                Err(OriginRejection::Missing)
            };
        };
        let normalized = normalize(origin);
        if self.allowed.iter().any(|allowed| *allowed == normalized) {
            return Ok(());
        }
        if self.permissive && is_loopback_origin(&normalized) {
            return Ok(());
        }
        Err(OriginRejection::NotAllowed(origin.to_string()))
    }
}

fn normalize(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

fn is_loopback_origin(origin: &str) -> bool {
    let Ok(url) = Url::parse(origin) else {
        return false;
    };
    match url.host() {
        Some(Host::Domain(domain)) => domain == "localhost",
        Some(Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALLOWED: [&str; 2] = ["https://flight.example.com", "app://flight-tower"];

    #[test_timeout::timeout]
    fn strict_accepts_only_the_list() {
        let policy = OriginPolicy::strict(ALLOWED);
        assert!(policy.check(Some("https://flight.example.com")).is_ok());
        assert!(policy.check(Some("https://FLIGHT.example.com/")).is_ok());
        assert!(policy.check(Some("app://flight-tower")).is_ok());
        assert_eq!(
            policy.check(Some("http://localhost:3000")),
            Err(OriginRejection::NotAllowed("http://localhost:3000".into()))
        );
        assert_eq!(policy.check(None), Err(OriginRejection::Missing));
    }

    #[test_timeout::timeout]
    fn permissive_adds_loopback_and_missing_origin() {
        let policy = OriginPolicy::permissive(ALLOWED);
        assert!(policy.check(None).is_ok());
        assert!(policy.check(Some("http://localhost:5173")).is_ok());
        assert!(policy.check(Some("http://127.0.0.1:8080")).is_ok());
        assert!(policy.check(Some("http://[::1]:9000")).is_ok());
        assert!(policy.check(Some("https://flight.example.com")).is_ok());
        assert!(policy.check(Some("https://evil.example.com")).is_err());
        assert!(policy.check(Some("http://localhost.evil.com")).is_err());
        assert!(policy.check(Some("null")).is_err());
    }
}
