use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{config::BridgeConfig, store::KvStore};

pub const PENDING_UPDATE_KEY: &str = "double_pending_update";
pub const LAST_CHECK_KEY: &str = "double_last_update_check";
pub const DEFAULT_UPDATE_MESSAGE: &str = "A new version is available!";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    pub latest_version: String,
    pub update_url: String,
    pub message: String,
}

/// Response of the version endpoint.
#[derive(Debug, Deserialize)]
struct VersionManifest {
    #[serde(default)]
    latest_version: Option<String>,
    #[serde(default)]
    update_url: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Tracks whether a newer build of the shell is available. Nothing here is
/// critical: failures are logged and the current state is kept.
#[derive(Clone)]
pub struct UpdateService {
    client: Client,
    store: Arc<dyn KvStore>,
    app_version: String,
    check_url: String,
    default_update_url: String,
    check_interval: Duration,
}

impl UpdateService {
    pub fn new(client: Client, store: Arc<dyn KvStore>, config: &BridgeConfig) -> Self {
        Self {
            client,
            store,
            app_version: config.app_version.clone(),
            check_url: config.version_check_url.clone(),
            default_update_url: config.default_update_url.clone(),
            check_interval: config.update_check_interval,
        }
    }

    pub fn app_version(&self) -> &str {
        &self.app_version
    }

    /// Queries the version endpoint. Returns the new pending update, if the
    /// advertised version differs from ours.
    pub async fn check_for_update(&self) -> Option<UpdateInfo> {
        let found = match self.fetch_manifest().await {
            Ok(manifest) => manifest.latest_version.and_then(|version| {
                self.offer(version, manifest.update_url, manifest.message)
            }),
            Err(err) => {
                warn!("[Update] Version check failed: {err:#}");
                None
            }
        };
        self.set_last_check(Utc::now());
        found
    }

    /// Startup check, skipped when the last one is younger than the check
    /// interval. Returns whatever update is pending afterwards.
    pub async fn check_on_start(&self) -> Option<UpdateInfo> {
        if self.is_check_due(Utc::now()) {
            if let Some(info) = self.check_for_update().await {
                return Some(info);
            }
        } else {
            debug!("[Update] Checked recently, skipping version request");
        }
        self.pending()
    }

    /// Same as a version check result, but announced by the page itself.
    pub fn notify_from_content(
        &self,
        version: &str,
        url: Option<String>,
        message: Option<String>,
    ) -> Option<UpdateInfo> {
        self.offer(version.to_string(), url, message)
    }

    /// The persisted update, unless the running build already is that
    /// version, in which case it is cleared.
    pub fn pending(&self) -> Option<UpdateInfo> {
        let raw = match self.store.get_item(PENDING_UPDATE_KEY) {
            Ok(raw) => raw?,
            Err(err) => {
                warn!("[Update] Failed to read pending update: {err:#}");
                return None;
            }
        };
        let info: UpdateInfo = match serde_json::from_str(&raw) {
            Ok(info) => info,
            Err(err) => {
                warn!("[Update] Ignoring unreadable pending update: {err}");
                return None;
            }
        };
        if info.latest_version.trim() == self.app_version {
            info!(
                "[Update] Already running {}, dropping pending update",
                self.app_version
            );
            self.dismiss();
            return None;
        }
        Some(info)
    }

    pub fn dismiss(&self) {
        if let Err(err) = self.store.remove_item(PENDING_UPDATE_KEY) {
            warn!("[Update] Failed to clear pending update: {err:#}");
        }
    }

    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        let raw = self.store.get_item(LAST_CHECK_KEY).ok()??;
        DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|at| at.with_timezone(&Utc))
    }

    pub fn is_check_due(&self, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_check() else {
            return true;
        };
        match (now - last).to_std() {
            Ok(elapsed) => elapsed >= self.check_interval,
            // Last check is in the future: clock moved back, check again.
            Err(_) => true,
        }
    }

    fn set_last_check(&self, at: DateTime<Utc>) {
        if let Err(err) = self.store.set_item(LAST_CHECK_KEY, &at.to_rfc3339()) {
            warn!("[Update] Failed to record check time: {err:#}");
        }
    }

    async fn fetch_manifest(&self) -> anyhow::Result<VersionManifest> {
        let response = self
            .client
            .get(&self.check_url)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    fn offer(
        &self,
        version: String,
        url: Option<String>,
        message: Option<String>,
    ) -> Option<UpdateInfo> {
        let version = version.trim().to_string();
        if version.is_empty() || version == self.app_version {
            return None;
        }

        let info = UpdateInfo {
            latest_version: version,
            update_url: non_empty(url).unwrap_or_else(|| self.default_update_url.clone()),
            message: non_empty(message).unwrap_or_else(|| DEFAULT_UPDATE_MESSAGE.to_string()),
        };
        info!(
            "🔔 [Update] {} → {} available",
            self.app_version, info.latest_version
        );

        match serde_json::to_string(&info) {
            Ok(raw) => {
                if let Err(err) = self.store.set_item(PENDING_UPDATE_KEY, &raw) {
                    warn!("[Update] Failed to persist pending update: {err:#}");
                }
            }
            Err(err) => warn!("[Update] Failed to encode pending update: {err}"),
        }
        Some(info)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn service(store: Arc<MemoryStore>) -> UpdateService {
        let mut config = BridgeConfig::new("/tmp/double-test");
        config.app_version = "1.0.0".to_string();
        config.version_check_url = "http://127.0.0.1:9/api/version".to_string();
        UpdateService::new(Client::new(), store, &config)
    }

    #[test]
    fn test_same_version_is_not_an_update() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store);
        assert_eq!(service.notify_from_content("1.0.0", None, None), None);
        assert_eq!(service.pending(), None);
    }

    #[test]
    fn test_notify_fills_defaults_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store.clone());

        let info = service
            .notify_from_content("1.1.0", Some(String::new()), None)
            .unwrap();
        assert_eq!(
            info,
            UpdateInfo {
                latest_version: "1.1.0".to_string(),
                update_url: crate::config::DEFAULT_UPDATE_URL.to_string(),
                message: DEFAULT_UPDATE_MESSAGE.to_string(),
            }
        );

        // A fresh service over the same store sees it too.
        assert_eq!(self::service(store).pending(), Some(info));
    }

    #[test]
    fn test_dismiss_clears_pending() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store);
        service.notify_from_content("2.0.0", Some("https://x/d.apk".to_string()), Some("Hi".to_string()));
        assert!(service.pending().is_some());
        service.dismiss();
        assert_eq!(service.pending(), None);
    }

    #[test]
    fn test_pending_update_is_dropped_once_installed() {
        let store = Arc::new(MemoryStore::new());
        service(store.clone()).notify_from_content("1.1.0", None, None);

        let mut config = BridgeConfig::new("/tmp/double-test");
        config.app_version = "1.1.0".to_string();
        let upgraded = UpdateService::new(Client::new(), store.clone(), &config);

        assert_eq!(upgraded.pending(), None);
        assert_eq!(store.get_item(PENDING_UPDATE_KEY).unwrap(), None);

        // Still pending for a build that has not caught up.
        upgraded.notify_from_content("1.2.0", None, None);
        assert_eq!(service(store).pending().unwrap().latest_version, "1.2.0");
    }

    #[test]
    fn test_check_is_throttled() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store);
        let now = Utc::now();
        assert!(service.is_check_due(now));

        service.set_last_check(now);
        assert!(!service.is_check_due(now + chrono::Duration::minutes(30)));
        assert!(service.is_check_due(now + chrono::Duration::minutes(61)));
    }

    #[tokio::test]
    async fn test_failed_check_is_swallowed_but_recorded() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store);
        assert_eq!(service.check_for_update().await, None);
        assert!(service.last_check().is_some());
        // Recorded, so the startup check stays quiet for the next hour.
        assert_eq!(service.check_on_start().await, None);
    }
}
