//! Federation configuration

use crate::federation::{FederationSnapshot, StaticFederation};
use crate::{Error, FederationKey, Result, DEFAULT_FEDERATION_SIZE, DEFAULT_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

/// Federation membership as stored on disk.
///
/// ```json
/// { "threshold": 10, "federation": ["02ab..", ...], "local_key": "02ab.." }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    /// Distinct contributors needed before finalization is attempted
    #[serde(default = "default_threshold")]
    pub threshold: usize,

    /// Hex-encoded public keys of every member
    pub federation: Vec<String>,

    /// Hex-encoded public key this node signs with
    #[serde(default)]
    pub local_key: Option<String>,
}

fn default_threshold() -> usize {
    DEFAULT_THRESHOLD
}

impl FederationConfig {
    /// Read and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;

        info!(
            members = config.federation.len(),
            threshold = config.threshold,
            member = config.local_key.is_some(),
            "Federation initialized successfully"
        );
        if !config.is_default_layout() {
            warn!(
                members = config.federation.len(),
                threshold = config.threshold,
                "Federation differs from the {}-of-{} layout",
                DEFAULT_THRESHOLD,
                DEFAULT_FEDERATION_SIZE
            );
        }
        Ok(config)
    }

    /// Whether this is the standard 10-of-100 federation
    pub fn is_default_layout(&self) -> bool {
        self.threshold == DEFAULT_THRESHOLD && self.federation.len() == DEFAULT_FEDERATION_SIZE
    }

    /// Check threshold bounds, key encodings, duplicates and local membership
    pub fn validate(&self) -> Result<()> {
        let keys = self.keys()?;
        if keys.is_empty() {
            return Err(Error::InvalidConfig("federation has no keys".into()));
        }
        if self.threshold == 0 {
            return Err(Error::InvalidConfig("threshold must be at least 1".into()));
        }
        if self.threshold > keys.len() {
            return Err(Error::InvalidConfig(format!(
                "threshold {} exceeds federation size {}",
                self.threshold,
                keys.len()
            )));
        }

        let mut seen = HashSet::new();
        for (key, hex_key) in keys.iter().zip(&self.federation) {
            if !seen.insert(key) {
                return Err(Error::InvalidConfig(format!("duplicate key '{}'", hex_key)));
            }
        }

        if let Some(local) = self.local()? {
            if !seen.contains(&local) {
                return Err(Error::InvalidConfig(
                    "local_key is not a federation member".into(),
                ));
            }
        }
        Ok(())
    }

    /// Decoded federation keys
    pub fn keys(&self) -> Result<Vec<FederationKey>> {
        self.federation.iter().map(|k| decode_key(k)).collect()
    }

    /// Decoded local key, if configured
    pub fn local(&self) -> Result<Option<FederationKey>> {
        self.local_key.as_deref().map(decode_key).transpose()
    }

    /// Snapshot of the configured federation
    pub fn snapshot(&self) -> Result<FederationSnapshot> {
        Ok(FederationSnapshot {
            keys: self.keys()?,
            local_key: self.local()?,
        })
    }

    /// Resolver serving this configuration
    pub fn resolver(&self) -> Result<StaticFederation> {
        Ok(StaticFederation::new(self.snapshot()?))
    }
}

fn decode_key(hex_key: &str) -> Result<FederationKey> {
    let bytes = hex::decode(hex_key)
        .map_err(|e| Error::InvalidConfig(format!("key '{}' is not valid hex: {}", hex_key, e)))?;
    match bytes.len() {
        32 | 33 => Ok(bytes),
        n => Err(Error::InvalidConfig(format!(
            "key '{}' has {} bytes, expected 32 or 33",
            hex_key, n
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::SignerSetResolver;

    fn hex_keys(n: u8) -> Vec<String> {
        (0..n)
            .map(|i| {
                let mut key = vec![0x02; 33];
                key[32] = i;
                hex::encode(key)
            })
            .collect()
    }

    fn config(n: u8, threshold: usize) -> FederationConfig {
        FederationConfig {
            threshold,
            federation: hex_keys(n),
            local_key: None,
        }
    }

    #[test]
    fn test_valid_config() {
        let mut cfg = config(100, 10);
        cfg.local_key = Some(cfg.federation[7].clone());
        cfg.validate().unwrap();

        let snapshot = cfg.resolver().unwrap().resolve().unwrap();
        assert_eq!(snapshot.keys.len(), 100);
        assert_eq!(snapshot.local_key.unwrap()[32], 7);
    }

    #[test]
    fn test_default_layout() {
        assert!(config(DEFAULT_FEDERATION_SIZE as u8, DEFAULT_THRESHOLD).is_default_layout());
        assert!(!config(DEFAULT_FEDERATION_SIZE as u8, 11).is_default_layout());
        assert!(!config(12, DEFAULT_THRESHOLD).is_default_layout());
    }

    #[test]
    fn test_threshold_bounds() {
        assert!(config(5, 0).validate().is_err());
        assert!(config(5, 6).validate().is_err());
        assert!(config(5, 5).validate().is_ok());
        assert!(config(0, 1).validate().is_err());
    }

    #[test]
    fn test_invalid_keys() {
        let mut cfg = config(3, 2);
        cfg.federation.push("invalid_key".into());
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));

        let mut cfg = config(3, 2);
        cfg.federation.push("02abcd".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_duplicate_key() {
        let mut cfg = config(3, 2);
        cfg.federation.push(cfg.federation[0].clone());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_local_key_must_be_member() {
        let mut cfg = config(3, 2);
        cfg.local_key = Some(hex::encode([0x03; 33]));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_default_threshold_from_json() {
        let json = serde_json::json!({ "federation": hex_keys(12) });
        let cfg: FederationConfig = serde_json::from_value(json).unwrap();
        assert_eq!(cfg.threshold, DEFAULT_THRESHOLD);
        assert!(cfg.local_key.is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let mut cfg = config(20, 10);
        cfg.local_key = Some(cfg.federation[0].clone());

        let path = std::env::temp_dir().join(format!("signet-federation-{}.json", std::process::id()));
        std::fs::write(&path, serde_json::to_string_pretty(&cfg).unwrap()).unwrap();

        let loaded = FederationConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(loaded.federation, cfg.federation);
        assert_eq!(loaded.local_key, cfg.local_key);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(FederationConfig::load("/nonexistent/federation.json").is_err());
    }
}
