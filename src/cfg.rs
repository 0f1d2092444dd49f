//! Connection configuration.

use serde::{Deserialize, Serialize};

use crate::err::{Error, Result};

/// Sizing and timing knobs applied when a connection request is constructed.
///
/// The request pre-creates its completion queue and queue pair, so the
/// configuration travels with the constructors ([`crate::ConnReq::new`],
/// [`crate::Endpoint::next_conn_req`]); `timeout_ms` also bounds address and
/// route resolution and the wait for the connection to become established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnCfg {
    /// Timeout for blocking connection setup steps, in milliseconds.
    pub timeout_ms: u32,
    /// Completion queue depth.
    pub cq_size: u32,
    /// Send queue depth.
    pub sq_size: u32,
    /// Receive queue depth.
    pub rq_size: u32,
}

impl Default for ConnCfg {
    fn default() -> Self {
        ConnCfg {
            timeout_ms: 1000,
            cq_size: 10,
            sq_size: 10,
            rq_size: 10,
        }
    }
}

impl ConnCfg {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let cfg: ConnCfg = toml::from_str(text).map_err(|_| Error::Inval)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a configuration from a TOML file.
    pub fn load_toml(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|_| Error::Inval)?;
        Self::from_toml_str(&text)
    }

    /// All knobs must be non-zero.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 || self.cq_size == 0 || self.sq_size == 0 || self.rq_size == 0 {
            return Err(Error::Inval);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ConnCfg::default();
        assert_eq!(cfg.timeout_ms, 1000);
        assert_eq!(cfg.cq_size, 10);
        assert_eq!(cfg.sq_size, 10);
        assert_eq!(cfg.rq_size, 10);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg = ConnCfg::from_toml_str("timeout_ms = 250\ncq_size = 64\n").unwrap();
        assert_eq!(cfg.timeout_ms, 250);
        assert_eq!(cfg.cq_size, 64);
        assert_eq!(cfg.sq_size, 10);
        assert_eq!(cfg.rq_size, 10);
    }

    #[test]
    fn zero_knobs_are_invalid() {
        assert_eq!(ConnCfg::from_toml_str("timeout_ms = 0\n"), Err(Error::Inval));
        assert_eq!(ConnCfg::from_toml_str("sq_size = 0\n"), Err(Error::Inval));
    }

    #[test]
    fn garbage_is_invalid() {
        assert_eq!(ConnCfg::from_toml_str("timeout_ms = \"soon\""), Err(Error::Inval));
    }
}
