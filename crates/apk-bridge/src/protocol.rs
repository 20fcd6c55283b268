//! Wire vocabulary between the embedded page and the host.
//!
//! Pages send [`Envelope`]s; the host answers either by injecting a
//! [`BridgeEvent`] script into the page or, on the direct path, with a
//! [`BridgeResponse`] body.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    record::{ArtifactRecord, ArtifactStatus},
    update::UpdateInfo,
};

pub const ENVELOPE_TYPE: &str = "androidBridge";

/// Raw message as posted by the page. Every field is optional here;
/// [`Envelope::into_request`] decides what is actually required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apk_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeRequest {
    RequestDownload { apk_id: String, url: String },
    RequestInstall { apk_id: String },
    CheckStatus { apk_id: String },
    DeleteFile { apk_id: String },
    OpenInstaller { apk_id: String },
    RequestPermission,
    NotifyUpdate {
        version: String,
        url: Option<String>,
        message: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("unknown bridge method `{0}`")]
    UnknownMethod(String),

    #[error("{method} is missing {field}")]
    MissingField {
        method: &'static str,
        field: &'static str,
        /// Present when the page did send an id, so the failure can still be
        /// reported through that id's error callback.
        apk_id: Option<String>,
    },
}

fn present(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl Envelope {
    pub fn is_bridge_message(&self) -> bool {
        self.kind.as_deref() == Some(ENVELOPE_TYPE)
    }

    pub fn into_request(self) -> Result<BridgeRequest, EnvelopeError> {
        let apk_id = present(self.apk_id);
        let url = present(self.url);

        let method: &'static str = match self.method.as_str() {
            "requestDownload" => "requestDownload",
            "requestInstall" => "requestInstall",
            "checkStatus" => "checkStatus",
            "deleteFile" => "deleteFile",
            "openInstaller" => "openInstaller",
            "requestPermission" => return Ok(BridgeRequest::RequestPermission),
            "notifyUpdate" => {
                let version =
                    present(self.version).ok_or_else(|| EnvelopeError::MissingField {
                        method: "notifyUpdate",
                        field: "version",
                        apk_id: None,
                    })?;
                return Ok(BridgeRequest::NotifyUpdate {
                    version,
                    url,
                    message: present(self.message),
                });
            }
            other => return Err(EnvelopeError::UnknownMethod(other.to_string())),
        };

        let Some(apk_id) = apk_id else {
            return Err(EnvelopeError::MissingField {
                method,
                field: "apkId",
                apk_id: None,
            });
        };

        Ok(match method {
            "requestDownload" => match url {
                Some(url) => BridgeRequest::RequestDownload { apk_id, url },
                None => {
                    return Err(EnvelopeError::MissingField {
                        method,
                        field: "url",
                        apk_id: Some(apk_id),
                    });
                }
            },
            "requestInstall" => BridgeRequest::RequestInstall { apk_id },
            "checkStatus" => BridgeRequest::CheckStatus { apk_id },
            "deleteFile" => BridgeRequest::DeleteFile { apk_id },
            _ => BridgeRequest::OpenInstaller { apk_id },
        })
    }
}

impl BridgeRequest {
    pub fn method(&self) -> &'static str {
        match self {
            BridgeRequest::RequestDownload { .. } => "requestDownload",
            BridgeRequest::RequestInstall { .. } => "requestInstall",
            BridgeRequest::CheckStatus { .. } => "checkStatus",
            BridgeRequest::DeleteFile { .. } => "deleteFile",
            BridgeRequest::OpenInstaller { .. } => "openInstaller",
            BridgeRequest::RequestPermission => "requestPermission",
            BridgeRequest::NotifyUpdate { .. } => "notifyUpdate",
        }
    }

    pub fn apk_id(&self) -> Option<&str> {
        match self {
            BridgeRequest::RequestDownload { apk_id, .. }
            | BridgeRequest::RequestInstall { apk_id }
            | BridgeRequest::CheckStatus { apk_id }
            | BridgeRequest::DeleteFile { apk_id }
            | BridgeRequest::OpenInstaller { apk_id } => Some(apk_id),
            BridgeRequest::RequestPermission | BridgeRequest::NotifyUpdate { .. } => None,
        }
    }
}

/// Error callback the page expects for a failed `method`, if it has one.
pub fn error_event(method: &str, apk_id: &str, message: String) -> Option<BridgeEvent> {
    let apk_id = apk_id.to_string();
    match method {
        "requestDownload" => Some(BridgeEvent::DownloadError { apk_id, message }),
        "requestInstall" | "openInstaller" => Some(BridgeEvent::InstallError { apk_id, message }),
        "checkStatus" => Some(BridgeEvent::StatusError { apk_id, message }),
        "deleteFile" => Some(BridgeEvent::DeleteError { apk_id, message }),
        _ => None,
    }
}

/// Host → page notification, delivered as `window.Android.<callback>(...)`.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    DownloadProgress { apk_id: String, percent: u8 },
    DownloadComplete { apk_id: String, record: ArtifactRecord },
    DownloadError { apk_id: String, message: String },
    StatusCheck { apk_id: String, status: ArtifactStatus },
    StatusError { apk_id: String, message: String },
    FileDeleted { apk_id: String },
    DeleteError { apk_id: String, message: String },
    PermissionRequested { granted: bool },
    InstallStarted { apk_id: String },
    InstallCancelled { apk_id: String },
    InstallError { apk_id: String, message: String },
    UpdateAvailable { info: UpdateInfo },
}

impl BridgeEvent {
    pub fn callback_name(&self) -> &'static str {
        match self {
            BridgeEvent::DownloadProgress { .. } => "onDownloadProgress",
            BridgeEvent::DownloadComplete { .. } => "onDownloadComplete",
            BridgeEvent::DownloadError { .. } => "onDownloadError",
            BridgeEvent::StatusCheck { .. } => "onStatusCheck",
            BridgeEvent::StatusError { .. } => "onStatusError",
            BridgeEvent::FileDeleted { .. } => "onFileDeleted",
            BridgeEvent::DeleteError { .. } => "onDeleteError",
            BridgeEvent::PermissionRequested { .. } => "onPermissionRequested",
            BridgeEvent::InstallStarted { .. } => "onInstallStarted",
            BridgeEvent::InstallCancelled { .. } => "onInstallCancelled",
            BridgeEvent::InstallError { .. } => "onInstallError",
            BridgeEvent::UpdateAvailable { .. } => "onUpdateAvailable",
        }
    }

    pub fn args(&self) -> Vec<Value> {
        match self {
            BridgeEvent::DownloadProgress { apk_id, percent } => {
                vec![json!(apk_id), json!(percent)]
            }
            BridgeEvent::DownloadComplete { apk_id, record } => {
                vec![json!(apk_id), serde_json::to_value(record).unwrap_or(Value::Null)]
            }
            BridgeEvent::DownloadError { apk_id, message }
            | BridgeEvent::StatusError { apk_id, message }
            | BridgeEvent::DeleteError { apk_id, message }
            | BridgeEvent::InstallError { apk_id, message } => {
                vec![json!(apk_id), json!(message)]
            }
            BridgeEvent::StatusCheck { apk_id, status } => vec![json!(apk_id), json!(status)],
            BridgeEvent::FileDeleted { apk_id }
            | BridgeEvent::InstallStarted { apk_id }
            | BridgeEvent::InstallCancelled { apk_id } => vec![json!(apk_id)],
            BridgeEvent::PermissionRequested { granted } => vec![json!(granted)],
            BridgeEvent::UpdateAvailable { info } => {
                vec![serde_json::to_value(info).unwrap_or(Value::Null)]
            }
        }
    }

    /// Script for the page. Arguments are JSON literals, and the call is
    /// skipped when the page has not defined the handler.
    pub fn to_script(&self) -> String {
        let name = self.callback_name();
        let args = self
            .args()
            .iter()
            .map(js_literal)
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "(function(){{var b=window.Android;if(b&&typeof b.{name}==='function'){{b.{name}({args});}}}})();"
        )
    }
}

// JSON is a JS expression except for the two line separators, which older
// engines reject inside string literals.
fn js_literal(value: &Value) -> String {
    value
        .to_string()
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

/// Body of the direct-return path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apk_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ArtifactStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BridgeResponse {
    pub fn ok_id(apk_id: impl Into<String>) -> Self {
        Self {
            success: true,
            apk_id: Some(apk_id.into()),
            ..Self::default()
        }
    }

    pub fn ok_status(status: ArtifactStatus) -> Self {
        Self {
            success: true,
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn granted(granted: bool) -> Self {
        Self {
            success: true,
            granted: Some(granted),
            ..Self::default()
        }
    }

    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

/// Page-side script defining `window.Android` (and `window.AndroidApp`).
///
/// Messages go through `ReactNativeWebView.postMessage` when the page runs
/// inside such a WebView, otherwise they are POSTed to `message_endpoint`.
/// Callbacks the page already set on `window.Android` are kept.
pub fn injection_script(message_endpoint: &str) -> String {
    let endpoint = js_literal(&json!(message_endpoint));
    format!(
        r#"(function() {{
  var endpoint = {endpoint};
  function post(message) {{
    message.type = '{ENVELOPE_TYPE}';
    var body = JSON.stringify(message);
    if (window.ReactNativeWebView && window.ReactNativeWebView.postMessage) {{
      window.ReactNativeWebView.postMessage(body);
    }} else if (window.fetch) {{
      window.fetch(endpoint, {{
        method: 'POST',
        headers: {{ 'Content-Type': 'application/json' }},
        body: body
      }}).catch(function(err) {{ console.error('Android bridge post failed', err); }});
    }}
  }}
  var bridge = window.Android || {{}};
  bridge.requestDownload = function(apkId, url) {{
    post({{ method: 'requestDownload', apkId: apkId, url: url }});
  }};
  bridge.requestInstall = function(apkId) {{
    post({{ method: 'requestInstall', apkId: apkId }});
  }};
  bridge.checkStatus = function(apkId) {{
    post({{ method: 'checkStatus', apkId: apkId }});
  }};
  bridge.deleteFile = function(apkId) {{
    post({{ method: 'deleteFile', apkId: apkId }});
  }};
  bridge.openInstaller = function(apkId) {{
    post({{ method: 'openInstaller', apkId: apkId }});
  }};
  bridge.requestPermission = function() {{
    post({{ method: 'requestPermission' }});
  }};
  bridge.notifyUpdate = function(version, url, message) {{
    post({{ method: 'notifyUpdate', version: version, url: url, message: message }});
  }};
  window.Android = bridge;
  window.AndroidApp = bridge;
  true;
}})();
"#
    )
}
