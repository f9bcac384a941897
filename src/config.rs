//! Provider configuration.

use std::io::Read;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::*;

/// Tunables of an interface adapter. Every field has a default, so an empty
/// `[rdapl]` table is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bytes of connection private data retained per connection request.
    /// Longer private data is truncated.
    pub max_private_data_size: usize,

    /// Largest event queue length an EVD may be created or resized with.
    pub max_evd_qlen: usize,

    /// Queue length used when an EVD is created with length 0.
    pub default_evd_qlen: usize,

    /// Default number of outstanding send-queue work requests per endpoint.
    pub max_request_dtos: usize,

    /// Default number of outstanding receive work requests per endpoint.
    pub max_recv_dtos: usize,

    /// Default number of outstanding receive work requests per SRQ.
    pub max_srq_dtos: usize,

    /// Extra completion queue entries requested beyond the EVD length.
    pub cq_depth_slack: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_private_data_size: 256,
            max_evd_qlen: 65536,
            default_evd_qlen: 128,
            max_request_dtos: 256,
            max_recv_dtos: 256,
            max_srq_dtos: 1024,
            cq_depth_slack: 0,
        }
    }
}

impl Config {
    /// Load the configuration from the `[rdapl]` table of a TOML file.
    pub fn load_toml(config_file: &str) -> Result<Self> {
        let mut file = std::fs::File::open(config_file)?;
        let mut toml_str = String::new();
        file.read_to_string(&mut toml_str)?;
        Self::from_toml_str(&toml_str)
    }

    /// Parse the configuration from the `[rdapl]` table of a TOML document.
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        let toml: toml::Table = toml::from_str(toml_str)?;
        let table = match toml.get("rdapl") {
            Some(v) => v.clone(),
            None => return Err(anyhow::anyhow!("rdapl configuration not found")),
        };
        let config: Self = table.try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse the configuration from a JSON object.
    pub fn from_json_str(json_str: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the limits are mutually consistent.
    pub fn validate(&self) -> DatResult<()> {
        if self.max_evd_qlen == 0
            || self.default_evd_qlen == 0
            || self.default_evd_qlen > self.max_evd_qlen
            || self.max_request_dtos == 0
            || self.max_recv_dtos == 0
            || self.max_srq_dtos == 0
        {
            return Err(DatError::InvalidParameter(Param::Config));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_toml_partial_table() -> Result<()> {
        let config = Config::from_toml_str(
            r#"
            [rdapl]
            max_private_data_size = 64
            default_evd_qlen = 16
            "#,
        )?;
        assert_eq!(config.max_private_data_size, 64);
        assert_eq!(config.default_evd_qlen, 16);
        assert_eq!(config.max_evd_qlen, Config::default().max_evd_qlen);
        Ok(())
    }

    #[test]
    fn test_toml_missing_table() {
        assert!(Config::from_toml_str("[other]\nx = 1\n").is_err());
    }

    #[test]
    fn test_json_and_validation() -> Result<()> {
        let config = Config::from_json_str(r#"{ "max_srq_dtos": 32 }"#)?;
        assert_eq!(config.max_srq_dtos, 32);

        let bad = Config::from_json_str(r#"{ "default_evd_qlen": 10, "max_evd_qlen": 4 }"#);
        assert!(bad.is_err());
        Ok(())
    }

    #[test]
    fn test_load_toml_file() -> Result<()> {
        let path = std::env::temp_dir().join(format!("rdapl-config-{}.toml", std::process::id()));
        std::fs::write(&path, "[rdapl]\ncq_depth_slack = 8\n")?;
        let config = Config::load_toml(path.to_str().unwrap_or_default());
        std::fs::remove_file(&path)?;
        assert_eq!(config?.cq_depth_slack, 8);
        Ok(())
    }
}
