use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{CardError, Result};
use crate::core::family::{AtrTable, CardFamily, DEFAULT_AT_ATRS, DEFAULT_DE_ATRS};
use crate::core::file::ReadPolicy;

/// Reader configuration, loaded from a JSON file. Every field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub atr: AtrConfig,
    /// Family assumed for cards whose ATR is not in the table
    pub fallback: Option<CardFamily>,
    pub policies: PolicyConfig,
    /// Timeout of one reader status wait
    pub poll_interval_ms: u64,
}

/// Hex encoded ATR fingerprints per family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtrConfig {
    pub de: Vec<String>,
    pub at: Vec<String>,
}

/// Overrides of the per-family status handling
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub de: Option<ReadPolicy>,
    pub at: Option<ReadPolicy>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            atr: AtrConfig::default(),
            fallback: None,
            policies: PolicyConfig::default(),
            poll_interval_ms: 500,
        }
    }
}

impl Default for AtrConfig {
    fn default() -> Self {
        Self {
            de: DEFAULT_DE_ATRS.iter().map(|atr| atr.to_string()).collect(),
            at: DEFAULT_AT_ATRS.iter().map(|atr| atr.to_string()).collect(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            CardError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| CardError::Config(format!("Failed to parse {}: {e}", path.display())))?;

        // Reject bad ATR strings at load time
        config.atr_table()?;

        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn atr_table(&self) -> Result<AtrTable> {
        AtrTable::from_hex(&self.atr.de, &self.atr.at)
    }

    /// Status handling for a family, falling back to the built-in defaults
    pub fn policy(&self, family: CardFamily) -> ReadPolicy {
        let configured = match family {
            CardFamily::De => &self.policies.de,
            CardFamily::At => &self.policies.at,
        };
        configured
            .clone()
            .unwrap_or_else(|| family.default_policy())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::apdu::StatusWord;
    use std::io::Write;

    #[test]
    fn test_empty_object_gives_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.policy(CardFamily::At), CardFamily::At.default_policy());
        assert_eq!(config.atr_table().unwrap(), AtrTable::default());
    }

    #[test]
    fn test_partial_overrides() {
        let json = r#"{
            "atr": { "de": ["3B 01 02"] },
            "fallback": "AT",
            "policies": { "de": { "success": ["9000", "6282"] } },
            "poll_interval_ms": 100
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();

        assert_eq!(config.fallback, Some(CardFamily::At));
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.atr.at, AtrConfig::default().at);

        let table = config.atr_table().unwrap();
        assert_eq!(table.family_of(&[0x3B, 0x01, 0x02]), Some(CardFamily::De));

        let policy = config.policy(CardFamily::De);
        assert_eq!(policy.success, vec![StatusWord::SUCCESS, StatusWord::END_OF_FILE]);
        assert!(policy.end_of_file.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "fallback": "egk" }}"#).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.fallback, Some(CardFamily::De));
    }

    #[test]
    fn test_load_rejects_bad_input() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "atr": {{ "de": ["XYZ"] }} }}"#).unwrap();
        assert!(matches!(Config::load(file.path()), Err(CardError::Config(_))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "policies": {{ "at": {{ "success": ["90"] }} }} }}"#).unwrap();
        assert!(matches!(Config::load(file.path()), Err(CardError::Config(_))));

        assert!(Config::load(Path::new("/nonexistent/health-card.json")).is_err());
    }
}
