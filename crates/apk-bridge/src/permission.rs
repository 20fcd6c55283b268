use std::{future::Future, sync::Arc, time::Duration};

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::platform::{IntentRequest, Platform};

pub const INSTALL_RATIONALE: &str = "To install this app, allow installing apps from unknown \
     sources. You will be taken to the system settings; enable the permission there and come back.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Confirm,
    Cancel,
}

/// A prompt waiting for the host UI. Dropping it without answering counts as
/// a cancel.
#[derive(Debug)]
pub struct ConfirmationRequest {
    pub rationale: String,
    pub purpose: String,
    responder: oneshot::Sender<Decision>,
}

impl ConfirmationRequest {
    pub fn confirm(self) {
        let _ = self.responder.send(Decision::Confirm);
    }

    pub fn cancel(self) {
        let _ = self.responder.send(Decision::Cancel);
    }

    pub fn answer(self, decision: Decision) {
        let _ = self.responder.send(decision);
    }
}

/// Receiving half handed to whatever UI renders the prompts.
pub type PromptReceiver = mpsc::Receiver<ConfirmationRequest>;

/// The "install unknown apps" gate: ask, open settings, give the user a
/// moment, resume.
#[derive(Clone)]
pub struct PermissionFlow {
    prompts: mpsc::Sender<ConfirmationRequest>,
    platform: Arc<dyn Platform>,
    settings_grace: Duration,
}

impl PermissionFlow {
    pub fn channel(
        platform: Arc<dyn Platform>,
        settings_grace: Duration,
    ) -> (Self, PromptReceiver) {
        let (prompts, rx) = mpsc::channel(8);
        (
            Self {
                prompts,
                platform,
                settings_grace,
            },
            rx,
        )
    }

    /// Returns whether the permission should be treated as granted.
    pub async fn request(&self, purpose: &str) -> bool {
        match self.ask(purpose).await {
            Some(Decision::Confirm) => self.open_settings(true).await,
            Some(Decision::Cancel) => {
                info!("[Permission] Cancelled by user ({purpose})");
                false
            }
            // Nobody is rendering prompts; go straight to the settings screen.
            None => {
                info!("[Permission] No prompt handler attached, opening settings directly");
                self.open_settings(false).await
            }
        }
    }

    /// Runs `action` only once the permission is granted.
    pub async fn gate<F, Fut, T>(&self, purpose: &str, action: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self.request(purpose).await {
            Some(action().await)
        } else {
            None
        }
    }

    /// `None` means no UI is attached. A dropped responder is a cancel.
    async fn ask(&self, purpose: &str) -> Option<Decision> {
        let (responder, answer) = oneshot::channel();
        let request = ConfirmationRequest {
            rationale: INSTALL_RATIONALE.to_string(),
            purpose: purpose.to_string(),
            responder,
        };
        if self.prompts.send(request).await.is_err() {
            return None;
        }
        Some(answer.await.unwrap_or(Decision::Cancel))
    }

    async fn open_settings(&self, wait_for_return: bool) -> bool {
        if let Err(err) = self
            .platform
            .start_activity(&IntentRequest::unknown_sources_settings())
        {
            warn!("❌ [Permission] Could not open unknown-sources settings: {err:#}");
            return false;
        }
        if wait_for_return && !self.settings_grace.is_zero() {
            tokio::time::sleep(self.settings_grace).await;
        }
        true
    }
}
