//! Registry configuration

use chrono::TimeDelta;
use serde::Deserialize;

const DEFAULT_BUCKET: &str = "registry";
const DEFAULT_UPLOAD_TTL_SECONDS: u64 = 24 * 60 * 60;

/// Settings for a [`crate::Registry`].
///
/// ```toml
/// bucket = "registry"
/// upload-ttl-seconds = 86400
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RegistryConfig {
    /// Storage bucket holding all registry content
    pub bucket: String,

    /// Idle time after which an upload session is discarded
    pub upload_ttl_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_string(),
            upload_ttl_seconds: DEFAULT_UPLOAD_TTL_SECONDS,
        }
    }
}

impl RegistryConfig {
    /// Upload session idle timeout
    pub fn upload_ttl(&self) -> TimeDelta {
        i64::try_from(self.upload_ttl_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX)
    }
}
