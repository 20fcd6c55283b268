use std::{path::PathBuf, time::Duration};

use tracing::warn;

pub const DOWNLOAD_DIR_NAME: &str = "apk_downloads";
pub const STORAGE_DIR_NAME: &str = "storage";
pub const DEFAULT_VERSION_CHECK_URL: &str = "https://doubleds.vercel.app/api/version";
pub const DEFAULT_UPDATE_URL: &str = "https://doubleds.vercel.app/downloads/double.apk";

/// Runtime settings for the bridge. Built from a data directory, then
/// optionally overridden from `DOUBLE_*` environment variables.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub data_dir: PathBuf,
    pub download_dir: PathBuf,
    pub storage_dir: PathBuf,
    pub app_version: String,
    pub version_check_url: String,
    pub default_update_url: String,
    pub update_check_interval: Duration,
    pub check_updates_on_start: bool,
    /// Time given to the user in the system settings screen before the
    /// permission flow resumes.
    pub settings_grace: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl BridgeConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            download_dir: data_dir.join(DOWNLOAD_DIR_NAME),
            storage_dir: data_dir.join(STORAGE_DIR_NAME),
            data_dir,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            version_check_url: DEFAULT_VERSION_CHECK_URL.to_string(),
            default_update_url: DEFAULT_UPDATE_URL.to_string(),
            update_check_interval: Duration::from_secs(60 * 60),
            check_updates_on_start: true,
            settings_grace: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            user_agent: format!("Double/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(dir) = normalized_env_var("DOUBLE_DOWNLOAD_DIR") {
            self.download_dir = PathBuf::from(dir);
        }
        if let Some(dir) = normalized_env_var("DOUBLE_STORAGE_DIR") {
            self.storage_dir = PathBuf::from(dir);
        }
        if let Some(version) = normalized_env_var("DOUBLE_APP_VERSION") {
            self.app_version = version;
        }
        if let Some(url) = normalized_env_var("DOUBLE_VERSION_CHECK_URL") {
            self.version_check_url = url;
        }
        if let Some(url) = normalized_env_var("DOUBLE_DEFAULT_UPDATE_URL") {
            self.default_update_url = url;
        }
        if let Some(secs) = env_u64("DOUBLE_UPDATE_CHECK_INTERVAL_SECS") {
            self.update_check_interval = Duration::from_secs(secs);
        }
        self.check_updates_on_start =
            env_bool("DOUBLE_CHECK_UPDATES", self.check_updates_on_start);
        if let Some(ms) = env_u64("DOUBLE_SETTINGS_GRACE_MS") {
            self.settings_grace = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("DOUBLE_CONNECT_TIMEOUT_SECS") {
            self.connect_timeout = Duration::from_secs(secs);
        }
        self
    }
}

pub fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|value| match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

pub fn normalized_env_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = normalized_env_var(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {key}={raw}: not a whole number");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_derive_from_data_dir() {
        let config = BridgeConfig::new("/data/double");
        assert_eq!(config.download_dir, PathBuf::from("/data/double/apk_downloads"));
        assert_eq!(config.storage_dir, PathBuf::from("/data/double/storage"));
        assert_eq!(config.update_check_interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_env_bool_falls_back_on_garbage() {
        assert!(env_bool("DOUBLE_TEST_UNSET_FLAG_7f3a", true));
        assert!(!env_bool("DOUBLE_TEST_UNSET_FLAG_7f3a", false));
    }
}
