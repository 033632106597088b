use {
    crate::{arena::DEFAULT_TRANSACTION_ARENA_SIZE, compute_budget::ComputeBudget},
    serde_derive::{Deserialize, Serialize},
    solana_loader_sdk::feature_set::FeatureSet,
    std::{fs, io, path::Path},
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read runtime config: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse runtime config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Encapsulates flags that can be used to tweak the runtime behavior.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub compute_budget: ComputeBudget,
    pub feature_set: FeatureSet,
    /// `None` disables the log byte limit
    pub log_messages_bytes_limit: Option<usize>,
    pub transaction_arena_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            compute_budget: ComputeBudget::default(),
            feature_set: FeatureSet::default(),
            log_messages_bytes_limit: Some(10 * 1000),
            transaction_arena_size: DEFAULT_TRANSACTION_ARENA_SIZE,
        }
    }
}

impl RuntimeConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let yaml = fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches};

    #[test]
    fn test_from_yaml_str() {
        let config = RuntimeConfig::from_yaml_str(
            r#"
compute_budget:
  compute_unit_limit: 200000
  heap_size: 65536
feature_set:
  enable_loader_v4: true
  bpf_account_data_direct_mapping: true
log_messages_bytes_limit: ~
"#,
        )
        .unwrap();
        assert_eq!(config.compute_budget.compute_unit_limit, 200_000);
        assert_eq!(config.compute_budget.heap_size, 65536);
        // Unset fields keep their defaults
        assert_eq!(config.compute_budget.heap_cost, 8);
        assert!(config.feature_set.enable_loader_v4);
        assert!(!config.feature_set.enable_extend_program_checked);
        assert_eq!(config.log_messages_bytes_limit, None);
        assert_eq!(config.transaction_arena_size, DEFAULT_TRANSACTION_ARENA_SIZE);

        assert_eq!(
            RuntimeConfig::from_yaml_str("{}").unwrap(),
            RuntimeConfig::default()
        );
        assert_matches!(
            RuntimeConfig::from_yaml_str("compute_budget: [1, 2]"),
            Err(ConfigError::Yaml(_))
        );
    }

    #[test]
    fn test_load_missing_file() {
        assert_matches!(
            RuntimeConfig::load("/nonexistent/runtime-config.yml"),
            Err(ConfigError::Io(_))
        );
    }
}
