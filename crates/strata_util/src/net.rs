//! Host/port addressing for statically configured peers.

use serde::{Deserialize, Serialize};

/// A peer address as configured, prior to any resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for HostPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for HostPort {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| {
            crate::Error::InvalidArgument(format!("expected host:port, got {s:?}"))
        })?;
        let port = port.parse::<u16>().map_err(|_| {
            crate::Error::InvalidArgument(format!("invalid port in {s:?}"))
        })?;
        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays() {
        let hp: HostPort = "master-1.example.com:7051".parse().unwrap();
        assert_eq!(hp.host, "master-1.example.com");
        assert_eq!(hp.port, 7051);
        assert_eq!(hp.to_string(), "master-1.example.com:7051");
    }

    #[test]
    fn rejects_missing_port() {
        assert!("master-1".parse::<HostPort>().is_err());
        assert!("master-1:notaport".parse::<HostPort>().is_err());
    }
}
