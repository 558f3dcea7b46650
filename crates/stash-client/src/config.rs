use std::time::Duration;

use serde::{Deserialize, Serialize};
use stash_types::Keyspace;

use crate::error::{CacheError, CacheResult};

const MIB: usize = 1024 * 1024;

/// Configuration for a [`StashClient`](crate::StashClient).
///
/// Every field has a default, so a TOML document only needs the options it
/// changes:
///
/// ```toml
/// keyspace = "wiki"
/// sync_timeout_secs = 5
/// segmentation_size = 1048576
/// merge_backoff_ms = 10
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Prefix scoping every key made by the client.
    pub keyspace: Keyspace,
    /// How long a `WRITE_SYNC` write may take before it is reported as slow.
    #[serde(rename = "sync_timeout_secs", with = "duration_secs")]
    pub sync_timeout: Duration,
    /// Largest serialized value stored inline; larger values are segmented.
    pub segmentation_size: usize,
    /// Largest serialized value accepted at all when segmenting.
    pub segmented_value_max_size: usize,
    /// Log keys fetched more than once through the same client.
    pub report_dupes: bool,
    /// Pause between merge attempts. `None` retries immediately.
    #[serde(rename = "merge_backoff_ms", with = "opt_duration_millis")]
    pub merge_backoff: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            keyspace: Keyspace::default(),
            sync_timeout: Duration::from_secs(3),
            segmentation_size: 8 * MIB,
            segmented_value_max_size: 64 * MIB,
            report_dupes: true,
            merge_backoff: None,
        }
    }
}

impl CacheConfig {
    /// Default configuration with the given keyspace.
    pub fn with_keyspace(keyspace: &str) -> CacheResult<Self> {
        Ok(Self {
            keyspace: Keyspace::new(keyspace)?,
            ..Default::default()
        })
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> CacheResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| CacheError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML.
    pub fn to_toml_string(&self) -> CacheResult<String> {
        toml::to_string(self).map_err(|e| CacheError::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.segmentation_size == 0 {
            return Err(CacheError::InvalidConfig(
                "segmentation_size must be non-zero".into(),
            ));
        }
        if self.segmented_value_max_size < self.segmentation_size {
            return Err(CacheError::InvalidConfig(format!(
                "segmented_value_max_size ({}) is below segmentation_size ({})",
                self.segmented_value_max_size, self.segmentation_size
            )));
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod opt_duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
