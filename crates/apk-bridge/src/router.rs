use std::sync::Arc;

use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    downloader::{DownloadEngine, DownloadOutcome},
    installer::{InstallLauncher, InstallOutcome},
    permission::PermissionFlow,
    protocol::{BridgeEvent, BridgeRequest, BridgeResponse, Envelope, EnvelopeError, error_event},
    update::UpdateService,
};

/// Where rendered callback scripts go: the WebView's evaluate-javascript
/// hook, a WebSocket fan-out, or a test channel.
pub trait ScriptSink: Send + Sync {
    fn inject(&self, script: String);
}

impl ScriptSink for mpsc::UnboundedSender<String> {
    fn inject(&self, script: String) {
        if self.send(script).is_err() {
            debug!("[Router] Script receiver closed, dropping callback");
        }
    }
}

impl ScriptSink for broadcast::Sender<String> {
    fn inject(&self, script: String) {
        // No subscriber means no page is listening right now.
        let _ = self.send(script);
    }
}

#[derive(Clone)]
pub struct HostRouter {
    downloads: DownloadEngine,
    installer: InstallLauncher,
    permission: PermissionFlow,
    updates: UpdateService,
    sink: Arc<dyn ScriptSink>,
}

impl HostRouter {
    pub fn new(
        downloads: DownloadEngine,
        installer: InstallLauncher,
        permission: PermissionFlow,
        updates: UpdateService,
        sink: Arc<dyn ScriptSink>,
    ) -> Self {
        Self {
            downloads,
            installer,
            permission,
            updates,
            sink,
        }
    }

    fn emit(&self, event: BridgeEvent) {
        self.sink.inject(event.to_script());
    }

    /// Entry point for messages posted by the page. Valid requests run on
    /// their own task and report back through the sink; the handle is
    /// returned so callers (and tests) can await completion.
    pub fn handle_message(&self, raw: &str) -> Option<JoinHandle<()>> {
        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!("[Router] Ignoring non-JSON message: {err}");
                return None;
            }
        };
        if !envelope.is_bridge_message() {
            debug!("[Router] Ignoring message of type {:?}", envelope.kind);
            return None;
        }

        let request = match envelope.into_request() {
            Ok(request) => request,
            Err(err) => {
                self.reject(err);
                return None;
            }
        };

        info!("[Router] {} {}", request.method(), request.apk_id().unwrap_or(""));
        let router = self.clone();
        Some(tokio::spawn(async move { router.dispatch(request).await }))
    }

    fn reject(&self, err: EnvelopeError) {
        warn!("[Router] Rejected bridge message: {err}");
        if let EnvelopeError::MissingField {
            method,
            apk_id: Some(apk_id),
            ..
        } = &err
            && let Some(event) = error_event(method, apk_id, err.to_string())
        {
            self.emit(event);
        }
    }

    async fn dispatch(&self, request: BridgeRequest) {
        match request {
            BridgeRequest::RequestDownload { apk_id, url } => {
                let sink = self.sink.clone();
                let progress_id = apk_id.clone();
                let on_progress = move |fraction: f64| {
                    let percent = (fraction * 100.0).round().clamp(0.0, 100.0) as u8;
                    sink.inject(
                        BridgeEvent::DownloadProgress {
                            apk_id: progress_id.clone(),
                            percent,
                        }
                        .to_script(),
                    );
                };
                match self.downloads.request_download(&apk_id, &url, on_progress).await {
                    Ok(DownloadOutcome::InFlight(_)) => {
                        debug!("[Router] {apk_id} already downloading; completion will follow");
                    }
                    Ok(outcome) => self.emit(BridgeEvent::DownloadComplete {
                        apk_id,
                        record: outcome.into_record(),
                    }),
                    Err(err) => self.emit(BridgeEvent::DownloadError {
                        apk_id,
                        message: err.to_string(),
                    }),
                }
            }
            BridgeRequest::RequestInstall { apk_id } | BridgeRequest::OpenInstaller { apk_id } => {
                match self.installer.request_install(&apk_id).await {
                    Ok(InstallOutcome::Launched(_)) => {
                        self.emit(BridgeEvent::InstallStarted { apk_id })
                    }
                    Ok(InstallOutcome::Cancelled(_)) => {
                        self.emit(BridgeEvent::InstallCancelled { apk_id })
                    }
                    Err(err) => self.emit(BridgeEvent::InstallError {
                        apk_id,
                        message: err.to_string(),
                    }),
                }
            }
            BridgeRequest::CheckStatus { apk_id } => match self.downloads.check_status(&apk_id).await {
                Ok(status) => self.emit(BridgeEvent::StatusCheck { apk_id, status }),
                Err(err) => self.emit(BridgeEvent::StatusError {
                    apk_id,
                    message: err.to_string(),
                }),
            },
            BridgeRequest::DeleteFile { apk_id } => match self.downloads.delete_file(&apk_id).await {
                Ok(_) => self.emit(BridgeEvent::FileDeleted { apk_id }),
                Err(err) => self.emit(BridgeEvent::DeleteError {
                    apk_id,
                    message: err.to_string(),
                }),
            },
            BridgeRequest::RequestPermission => {
                let granted = self.permission.request("requestPermission").await;
                self.emit(BridgeEvent::PermissionRequested { granted });
            }
            BridgeRequest::NotifyUpdate {
                version,
                url,
                message,
            } => {
                if let Some(info) = self.updates.notify_from_content(&version, url, message) {
                    self.emit(BridgeEvent::UpdateAvailable { info });
                }
            }
        }
    }

    /// Direct-return path: runs the request and answers with a JSON body
    /// instead of a callback.
    pub async fn invoke(&self, envelope: Envelope) -> BridgeResponse {
        let request = match envelope.into_request() {
            Ok(request) => request,
            Err(err) => {
                warn!("[Router] Rejected invoke: {err}");
                return BridgeResponse::failed(err);
            }
        };

        match request {
            BridgeRequest::RequestDownload { apk_id, url } => {
                match self.downloads.request_download(&apk_id, &url, |_| {}).await {
                    Ok(_) => BridgeResponse::ok_id(apk_id),
                    Err(err) => BridgeResponse::failed(err),
                }
            }
            BridgeRequest::RequestInstall { apk_id } | BridgeRequest::OpenInstaller { apk_id } => {
                match self.installer.request_install(&apk_id).await {
                    Ok(outcome) => BridgeResponse {
                        status: Some(outcome.record().status),
                        ..BridgeResponse::ok_id(apk_id)
                    },
                    Err(err) => BridgeResponse::failed(err),
                }
            }
            BridgeRequest::CheckStatus { apk_id } => match self.downloads.check_status(&apk_id).await {
                Ok(status) => BridgeResponse::ok_status(status),
                Err(err) => BridgeResponse::failed(err),
            },
            BridgeRequest::DeleteFile { apk_id } => match self.downloads.delete_file(&apk_id).await {
                Ok(_) => BridgeResponse::ok_id(apk_id),
                Err(err) => BridgeResponse::failed(err),
            },
            BridgeRequest::RequestPermission => {
                BridgeResponse::granted(self.permission.request("requestPermission").await)
            }
            BridgeRequest::NotifyUpdate {
                version,
                url,
                message,
            } => {
                if let Some(info) = self.updates.notify_from_content(&version, url, message) {
                    self.emit(BridgeEvent::UpdateAvailable { info });
                }
                BridgeResponse::ok()
            }
        }
    }
}
