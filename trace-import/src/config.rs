//! Import configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Translate the finished model so the earliest event sits at zero.
    #[serde(default = "default_shift_world_to_zero")]
    pub shift_world_to_zero: bool,

    /// Drop threads and processes that ended up with no events.
    #[serde(default = "default_prune_empty_containers")]
    pub prune_empty_containers: bool,

    /// Derive thread-time bounds for async slices from `tts` fields even
    /// when the events do not opt in themselves.
    #[serde(default)]
    pub use_async_tts: bool,
}

fn default_shift_world_to_zero() -> bool {
    true
}

fn default_prune_empty_containers() -> bool {
    true
}

impl Default for ImportConfig {
    fn default() -> Self {
        ImportConfig {
            shift_world_to_zero: true,
            prune_empty_containers: true,
            use_async_tts: false,
        }
    }
}

impl ImportConfig {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ImportConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn defaults_match_empty_toml() {
        let config: ImportConfig = toml::from_str("").unwrap();
        assert!(config.shift_world_to_zero);
        assert!(config.prune_empty_containers);
        assert!(!config.use_async_tts);
    }

    #[rstest]
    fn overrides_parse() {
        let config: ImportConfig =
            toml::from_str("shift_world_to_zero = false\nuse_async_tts = true\n").unwrap();
        assert!(!config.shift_world_to_zero);
        assert!(config.use_async_tts);
    }
}
