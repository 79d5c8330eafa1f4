//! Hub configuration

use crate::id::BufferId;

/// Default prefix for shared memory object names
pub const DEFAULT_SHM_PREFIX: &str = "/bufferhub";

/// Default upper bound for the user metadata area (1 MiB)
pub const DEFAULT_MAX_USER_METADATA_SIZE: usize = 1024 * 1024;

const ENV_SHM_PREFIX: &str = "BUFFERHUB_SHM_PREFIX";
const ENV_MAX_USER_METADATA: &str = "BUFFERHUB_MAX_USER_METADATA_BYTES";

/// Settings shared by every buffer created or attached through a hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Prefix of every shared memory object name
    pub shm_prefix: String,
    /// Largest user metadata area a buffer may request
    pub max_user_metadata_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            shm_prefix: DEFAULT_SHM_PREFIX.to_string(),
            max_user_metadata_size: DEFAULT_MAX_USER_METADATA_SIZE,
        }
    }
}

impl HubConfig {
    /// Build a config with the given name prefix and default limits
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            shm_prefix: prefix.to_string(),
            ..Self::default()
        }
    }

    /// Read overrides from the environment, falling back to defaults for
    /// unset, empty or unparsable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let shm_prefix = std::env::var(ENV_SHM_PREFIX)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.shm_prefix);

        let max_user_metadata_size = std::env::var(ENV_MAX_USER_METADATA)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(defaults.max_user_metadata_size);

        Self {
            shm_prefix,
            max_user_metadata_size,
        }
    }

    /// Shared memory name of a buffer's metadata block
    pub fn metadata_shm_name(&self, id: BufferId) -> String {
        format!("{}_{}_meta", self.shm_prefix, id.get())
    }

    /// Shared memory name of a buffer's pixel storage
    pub fn buffer_shm_name(&self, id: BufferId) -> String {
        format!("{}_{}_buf", self.shm_prefix, id.get())
    }

    /// Shared memory name of the id counter every hub under this prefix uses
    pub fn id_shm_name(&self) -> String {
        format!("{}_ids", self.shm_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_names() {
        let config = HubConfig::default();
        let id = BufferId::new(42).unwrap();
        assert_eq!(config.metadata_shm_name(id), "/bufferhub_42_meta");
        assert_eq!(config.buffer_shm_name(id), "/bufferhub_42_buf");
        assert_eq!(config.id_shm_name(), "/bufferhub_ids");
    }

    #[test]
    fn test_with_prefix_keeps_limits() {
        let config = HubConfig::with_prefix("/custom");
        assert_eq!(config.shm_prefix, "/custom");
        assert_eq!(
            config.max_user_metadata_size,
            DEFAULT_MAX_USER_METADATA_SIZE
        );
    }
}
