use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::Client;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::{
    error::{BridgeError, Result},
    record::{ArtifactRecord, ArtifactStatus},
    registry::Registry,
};

pub const INTERRUPTED_MESSAGE: &str = "download interrupted";

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    /// Bytes were fetched by this call.
    Downloaded(ArtifactRecord),
    /// The file was already on disk; nothing was fetched.
    AlreadyPresent(ArtifactRecord),
    /// Another call is transferring this id right now.
    InFlight(ArtifactRecord),
}

impl DownloadOutcome {
    pub fn record(&self) -> &ArtifactRecord {
        match self {
            DownloadOutcome::Downloaded(record)
            | DownloadOutcome::AlreadyPresent(record)
            | DownloadOutcome::InFlight(record) => record,
        }
    }

    pub fn into_record(self) -> ArtifactRecord {
        match self {
            DownloadOutcome::Downloaded(record)
            | DownloadOutcome::AlreadyPresent(record)
            | DownloadOutcome::InFlight(record) => record,
        }
    }
}

/// Streams packages into the download directory and keeps the registry in
/// step with each transfer.
#[derive(Clone)]
pub struct DownloadEngine {
    client: Client,
    registry: Registry,
    download_dir: PathBuf,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.id);
    }
}

impl DownloadEngine {
    pub fn new(client: Client, registry: Registry, download_dir: PathBuf) -> Self {
        Self {
            client,
            registry,
            download_dir,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight.lock().contains(id)
    }

    fn claim(&self, id: &str) -> Option<InFlightGuard> {
        let mut in_flight = self.in_flight.lock();
        if !in_flight.insert(id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            in_flight: self.in_flight.clone(),
            id: id.to_string(),
        })
    }

    /// Downloads `url` for `id` unless it is already on disk or already being
    /// fetched. `on_progress` receives the completed fraction in `0.0..=1.0`.
    pub async fn request_download<P>(
        &self,
        id: &str,
        url: &str,
        on_progress: P,
    ) -> Result<DownloadOutcome>
    where
        P: Fn(f64) + Send + Sync,
    {
        let id = require(id, "apkId")?;
        let url = require(url, "url")?;

        fs::create_dir_all(&self.download_dir).await?;

        if let Some(existing) = self.registry.get(&id).await
            && !existing.file_vanished()
        {
            if existing.status == ArtifactStatus::Downloaded {
                info!("[Download] {id} already downloaded, skipping");
                return Ok(DownloadOutcome::AlreadyPresent(existing));
            }
            if existing.install_in_progress() {
                info!("[Download] {id} is being installed, keeping the current file");
                return Ok(DownloadOutcome::AlreadyPresent(existing));
            }
        }

        let Some(_guard) = self.claim(&id) else {
            info!("[Download] {id} already in flight, not starting another transfer");
            let current = self
                .registry
                .get(&id)
                .await
                .unwrap_or_else(|| ArtifactRecord::new(&id, &url));
            return Ok(DownloadOutcome::InFlight(current));
        };

        let record = {
            let record_id = id.clone();
            let source_url = url.clone();
            self.transition(&id, move |slot| {
                let record = slot.get_or_insert_with(|| ArtifactRecord::new(&record_id, &source_url));
                // We hold the in-flight claim, so a persisted `downloading`
                // is left over from a killed process.
                if record.status == ArtifactStatus::Downloading {
                    record.fail(INTERRUPTED_MESSAGE)?;
                }
                record.begin_download(&source_url)
            })
            .await?
        };

        let final_path = self.download_dir.join(&record.file_name);
        let part_path = final_path.with_extension("apk.part");
        info!("⬇️ [Download] {id} from {url}");

        let transfer = async {
            let written = self.transfer(&url, &part_path, &on_progress).await?;
            fs::rename(&part_path, &final_path).await?;
            Ok::<u64, BridgeError>(written)
        };

        let result = transfer.await;
        match result {
            Ok(written) => {
                let record = self
                    .transition(&id, move |slot| match slot.as_mut() {
                        Some(record) => record.complete_download(final_path, Utc::now()),
                        None => Err(BridgeError::NotFound),
                    })
                    .await?;
                info!("✅ [Download] {id} complete ({written} bytes)");
                Ok(DownloadOutcome::Downloaded(record))
            }
            Err(err) => {
                warn!("❌ [Download] {id} failed: {err}");
                if let Err(remove_err) = fs::remove_file(&part_path).await
                    && remove_err.kind() != std::io::ErrorKind::NotFound
                {
                    warn!("[Download] Failed to remove partial file: {remove_err}");
                }
                let message = err.to_string();
                if let Err(record_err) = self
                    .transition(&id, move |slot| match slot.as_mut() {
                        Some(record) => record.fail(message),
                        None => Ok(()),
                    })
                    .await
                {
                    warn!("[Download] Failed to record error for {id}: {record_err}");
                }
                Err(err)
            }
        }
    }

    async fn transfer<P>(&self, url: &str, dest: &Path, on_progress: &P) -> Result<u64>
    where
        P: Fn(f64) + Send + Sync,
    {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::Http(status));
        }

        let total = response.content_length().filter(|total| *total > 0);
        let mut file = fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        let mut last_percent = None;

        if total.is_some() {
            last_percent = Some(0);
            on_progress(0.0);
        }

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;

            if let Some(total) = total {
                let percent = (written.saturating_mul(100) / total).min(100);
                if last_percent != Some(percent) {
                    last_percent = Some(percent);
                    on_progress(percent as f64 / 100.0);
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        if last_percent != Some(100) {
            on_progress(1.0);
        }
        Ok(written)
    }

    /// Current status of `id`. A record that claims a file which is no
    /// longer on disk is demoted to `pending` and saved that way.
    pub async fn check_status(&self, id: &str) -> Result<ArtifactStatus> {
        let id = require(id, "apkId")?;
        let Some(record) = self.registry.get(&id).await else {
            return Ok(ArtifactStatus::Pending);
        };

        if record.file_vanished() {
            warn!(
                "[Download] File for {id} is gone ({}), resetting to pending",
                record.status
            );
            let healed = self
                .registry
                .update(&id, |slot| {
                    if let Some(record) = slot.as_mut()
                        && record.file_vanished()
                    {
                        record.reset()?;
                    }
                    Ok(())
                })
                .await?;
            return Ok(healed.map_or(ArtifactStatus::Pending, |record| record.status));
        }

        Ok(record.status)
    }

    /// Removes the downloaded file and resets the record to `pending`.
    /// Unknown ids are a no-op.
    pub async fn delete_file(&self, id: &str) -> Result<Option<ArtifactRecord>> {
        let id = require(id, "apkId")?;
        let Some(record) = self.registry.get(&id).await else {
            return Ok(None);
        };

        if record.status == ArtifactStatus::Downloading || self.is_in_flight(&id) {
            return Err(BridgeError::InvalidTransition {
                from: ArtifactStatus::Downloading,
                to: ArtifactStatus::Pending,
            });
        }
        if record.install_in_progress() {
            return Err(BridgeError::InvalidTransition {
                from: ArtifactStatus::Installing,
                to: ArtifactStatus::Pending,
            });
        }

        if let Some(path) = &record.local_path {
            match fs::remove_file(path).await {
                Ok(()) => info!("🗑️ [Download] Deleted {}", path.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        self.registry
            .update(&id, |slot| match slot.as_mut() {
                Some(record) if record.install_in_progress() => {
                    Err(BridgeError::InvalidTransition {
                        from: ArtifactStatus::Installing,
                        to: ArtifactStatus::Pending,
                    })
                }
                Some(record) => record.reset(),
                None => Ok(()),
            })
            .await
    }

    /// Marks records left in `downloading` by a previous process as failed so
    /// the page can retry them. Returns how many were recovered.
    pub async fn recover_interrupted(&self) -> usize {
        let stale: Vec<ArtifactRecord> = self
            .registry
            .all()
            .await
            .into_values()
            .filter(|record| {
                record.status == ArtifactStatus::Downloading && !self.is_in_flight(&record.id)
            })
            .collect();

        let mut recovered = 0;
        for record in stale {
            let in_flight = self.in_flight.clone();
            let id = record.id.clone();
            let result = self
                .registry
                .update(&record.id, move |slot| {
                    if let Some(record) = slot.as_mut()
                        && record.status == ArtifactStatus::Downloading
                        && !in_flight.lock().contains(&id)
                    {
                        record.fail(INTERRUPTED_MESSAGE)?;
                    }
                    Ok(())
                })
                .await;

            match result {
                Ok(Some(updated))
                    if updated.status == ArtifactStatus::Error
                        && updated.last_error.as_deref() == Some(INTERRUPTED_MESSAGE) =>
                {
                    recovered += 1;
                    let part_path = self
                        .download_dir
                        .join(&record.file_name)
                        .with_extension("apk.part");
                    if let Err(err) = fs::remove_file(&part_path).await
                        && err.kind() != std::io::ErrorKind::NotFound
                    {
                        warn!(
                            "[Download] Failed to remove {}: {err}",
                            part_path.display()
                        );
                    }
                }
                Ok(_) => debug!("[Download] {} moved on before recovery", record.id),
                Err(err) => warn!("[Download] Could not recover {}: {err}", record.id),
            }
        }

        if recovered > 0 {
            info!("[Download] Recovered {recovered} interrupted download(s)");
        }
        recovered
    }

    async fn transition<F>(&self, id: &str, apply: F) -> Result<ArtifactRecord>
    where
        F: FnOnce(&mut Option<ArtifactRecord>) -> Result<()> + Send + 'static,
    {
        self.registry
            .update(id, apply)
            .await?
            .ok_or(BridgeError::NotFound)
    }
}

fn require(value: &str, field: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(BridgeError::InvalidRequest(format!("missing {field}")));
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{record::file_name_for, store::MemoryStore};

    fn engine(dir: &Path) -> DownloadEngine {
        let registry = Registry::spawn(Arc::new(MemoryStore::new()));
        DownloadEngine::new(Client::new(), registry, dir.join("apk_downloads"))
    }

    async fn downloaded_record(engine: &DownloadEngine, id: &str) -> PathBuf {
        std::fs::create_dir_all(engine.download_dir()).unwrap();
        let path = engine.download_dir().join(format!("{id}.apk"));
        std::fs::write(&path, b"PK\x03\x04").unwrap();

        let mut record = ArtifactRecord::new(id, "https://x/a.apk");
        record.begin_download("https://x/a.apk").unwrap();
        record.complete_download(path.clone(), Utc::now()).unwrap();
        engine.registry().put(record).await;
        path
    }

    #[tokio::test]
    async fn test_missing_fields_are_rejected_before_any_work() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        let err = engine.request_download("app1", "  ", |_| {}).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRequest(_)));
        let err = engine.request_download("", "https://x/a.apk", |_| {}).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRequest(_)));

        assert!(engine.registry().all().await.is_empty());
        assert!(!engine.download_dir().exists());
    }

    #[tokio::test]
    async fn test_existing_download_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        downloaded_record(&engine, "app1").await;

        // Unroutable URL: reaching the network would fail the call.
        let outcome = engine
            .request_download("app1", "http://127.0.0.1:9/a.apk", |_| {})
            .await
            .unwrap();
        assert!(matches!(outcome, DownloadOutcome::AlreadyPresent(_)));
        assert_eq!(outcome.record().status, ArtifactStatus::Downloaded);
    }

    #[tokio::test]
    async fn test_second_request_while_in_flight_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let _guard = engine.claim("app1").unwrap();

        let outcome = engine
            .request_download("app1", "http://127.0.0.1:9/a.apk", |_| {})
            .await
            .unwrap();
        assert!(matches!(outcome, DownloadOutcome::InFlight(_)));
        assert!(engine.registry().get("app1").await.is_none());
    }

    #[tokio::test]
    async fn test_claim_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        {
            let _guard = engine.claim("app1").unwrap();
            assert!(engine.claim("app1").is_none());
            assert!(engine.is_in_flight("app1"));
        }
        assert!(!engine.is_in_flight("app1"));
    }

    #[tokio::test]
    async fn test_network_failure_records_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        let result = engine
            .request_download("app1", "http://127.0.0.1:9/a.apk", |_| {})
            .await;
        assert!(result.is_err());

        let record = engine.registry().get("app1").await.unwrap();
        assert_eq!(record.status, ArtifactStatus::Error);
        assert!(record.last_error.is_some());
        assert!(record.local_path.is_none());
        assert!(!engine.is_in_flight("app1"));
        assert!(!engine.download_dir().join("app1.apk.part").exists());
    }

    #[tokio::test]
    async fn test_check_status_heals_vanished_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let path = downloaded_record(&engine, "app1").await;

        assert_eq!(
            engine.check_status("app1").await.unwrap(),
            ArtifactStatus::Downloaded
        );

        std::fs::remove_file(&path).unwrap();
        assert_eq!(
            engine.check_status("app1").await.unwrap(),
            ArtifactStatus::Pending
        );

        let record = engine.registry().get("app1").await.unwrap();
        assert_eq!(record.status, ArtifactStatus::Pending);
        assert!(record.local_path.is_none());
    }

    #[tokio::test]
    async fn test_check_status_of_unknown_id_is_pending() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        assert_eq!(
            engine.check_status("nobody").await.unwrap(),
            ArtifactStatus::Pending
        );
        assert!(engine.registry().get("nobody").await.is_none());
    }

    #[tokio::test]
    async fn test_delete_then_check_is_pending() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let path = downloaded_record(&engine, "app1").await;

        let record = engine.delete_file("app1").await.unwrap().unwrap();
        assert_eq!(record.status, ArtifactStatus::Pending);
        assert!(!path.exists());

        assert_eq!(
            engine.check_status("app1").await.unwrap(),
            ArtifactStatus::Pending
        );
        assert!(engine.registry().get("app1").await.unwrap().local_path.is_none());

        assert!(engine.delete_file("never-seen").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recover_interrupted_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        let mut stale = ArtifactRecord::new("stale", "https://x/a.apk");
        stale.begin_download("https://x/a.apk").unwrap();
        engine.registry().put(stale).await;

        let mut live = ArtifactRecord::new("live", "https://x/b.apk");
        live.begin_download("https://x/b.apk").unwrap();
        engine.registry().put(live).await;
        let _guard = engine.claim("live").unwrap();

        std::fs::create_dir_all(engine.download_dir()).unwrap();
        let part = engine.download_dir().join("stale.apk.part");
        std::fs::write(&part, b"PK").unwrap();

        assert_eq!(engine.recover_interrupted().await, 1);

        let stale = engine.registry().get("stale").await.unwrap();
        assert_eq!(stale.status, ArtifactStatus::Error);
        assert_eq!(stale.last_error.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert!(!part.exists());
        assert_eq!(
            engine.registry().get("live").await.unwrap().status,
            ArtifactStatus::Downloading
        );

        // Nothing left to recover.
        assert_eq!(engine.recover_interrupted().await, 0);
    }

    #[tokio::test]
    async fn test_download_request_during_install_keeps_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let path = downloaded_record(&engine, "app1").await;
        engine
            .registry()
            .update("app1", |slot| match slot.as_mut() {
                Some(record) => record.begin_install(),
                None => Err(BridgeError::NotFound),
            })
            .await
            .unwrap();

        let outcome = engine
            .request_download("app1", "http://127.0.0.1:9/a.apk", |_| {})
            .await
            .unwrap();
        assert!(matches!(outcome, DownloadOutcome::AlreadyPresent(_)));
        assert_eq!(outcome.record().status, ArtifactStatus::Installing);

        let err = engine.delete_file("app1").await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::InvalidTransition {
                from: ArtifactStatus::Installing,
                to: ArtifactStatus::Pending
            }
        ));
        assert!(path.is_file());
        assert_eq!(
            engine.registry().get("app1").await.unwrap().status,
            ArtifactStatus::Installing
        );
    }

    #[tokio::test]
    async fn test_ids_that_sanitize_alike_keep_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        std::fs::create_dir_all(engine.download_dir()).unwrap();

        for id in ["a b", "a_b"] {
            let path = engine.download_dir().join(file_name_for(id));
            std::fs::write(&path, id).unwrap();
            let mut record = ArtifactRecord::new(id, "https://x/a.apk");
            record.begin_download("https://x/a.apk").unwrap();
            record.complete_download(path, Utc::now()).unwrap();
            engine.registry().put(record).await;
        }

        engine.delete_file("a b").await.unwrap();
        assert_eq!(
            engine.check_status("a_b").await.unwrap(),
            ArtifactStatus::Downloaded
        );
        let kept = engine.registry().get("a_b").await.unwrap().local_path.unwrap();
        assert_eq!(std::fs::read_to_string(kept).unwrap(), "a_b");
    }
}
