use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use precompute_core::PrecomputeConfig;

/// Overrides `store.path` when set.
pub const DB_PATH_ENV: &str = "PRECOMPUTE_DB";
/// Overrides `coordinator.owner_id` when set.
pub const OWNER_ENV: &str = "PRECOMPUTE_OWNER";

/// Load a YAML config file, apply environment overrides and validate it.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed or validated.
pub fn load_config(path: &Path) -> Result<PrecomputeConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let mut config: PrecomputeConfig = serde_yaml::from_str(&text)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    config.validate().with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(config)
}

pub fn apply_env_overrides(config: &mut PrecomputeConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(path) = lookup(DB_PATH_ENV).filter(|value| !value.trim().is_empty()) {
        config.store.path = PathBuf::from(path);
    }
    if let Some(owner) = lookup(OWNER_ENV).filter(|value| !value.trim().is_empty()) {
        config.coordinator.owner_id = Some(owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "
resolver:
  acceptance_threshold: 0.45
  ambiguity_band: 0.1
  weights:
    token_overlap: 0.4
    compact_match: 0.5
    domain_match: 0.1
";

    #[test]
    fn loads_yaml_with_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("precompute.yaml");
        fs::write(&path, format!("{MINIMAL}cache:\n  default_ttl_secs: 120\n"))?;

        let config = load_config(&path)?;
        assert_eq!(config.cache.default_ttl_secs, 120);
        assert_eq!(config.coordinator.max_attempts, 3);
        Ok(())
    }

    #[test]
    fn example_config_matches_defaults() -> Result<()> {
        let path =
            Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/precompute.example.yaml");
        let text = fs::read_to_string(&path)?;
        let config: PrecomputeConfig = serde_yaml::from_str(&text)?;
        config.validate()?;

        let defaults: PrecomputeConfig = serde_yaml::from_str(MINIMAL)?;
        assert_eq!(config.store, defaults.store);
        assert_eq!(config.cache, defaults.cache);
        assert_eq!(config.fingerprint, defaults.fingerprint);
        assert_eq!(config.coordinator, defaults.coordinator);
        assert_eq!(config.resolver.max_merge_retries, 5);
        Ok(())
    }

    #[test]
    fn env_overrides_replace_path_and_owner() -> Result<()> {
        let mut config: PrecomputeConfig = serde_yaml::from_str(MINIMAL)?;
        apply_env_overrides(&mut config, |name| match name {
            DB_PATH_ENV => Some("/var/lib/precompute/state.sqlite3".to_string()),
            OWNER_ENV => Some("worker-7".to_string()),
            _ => None,
        });
        assert_eq!(config.store.path, PathBuf::from("/var/lib/precompute/state.sqlite3"));
        assert_eq!(config.coordinator.owner_id.as_deref(), Some("worker-7"));
        Ok(())
    }

    #[test]
    fn invalid_values_are_reported_with_the_file_name() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.yaml");
        fs::write(&path, format!("{MINIMAL}store:\n  workers: 0\n"))?;

        let err = match load_config(&path) {
            Ok(_) => panic!("zero workers must be rejected"),
            Err(err) => format!("{err:#}"),
        };
        assert!(err.contains("broken.yaml"), "{err}");
        assert!(err.contains("store.workers"), "{err}");
        Ok(())
    }
}
