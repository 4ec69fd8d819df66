use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub fn control_socket_path(data_dir: &Path) -> PathBuf {
    data_dir.join("ipc").join("control.sock")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl ControlError {
    pub fn unavailable(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: "control.unavailable".to_string(),
            message: message.into(),
            retryable: true,
            details,
        }
    }

    pub fn invalid_request(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: "control.invalid_request".to_string(),
            message: message.into(),
            retryable: false,
            details,
        }
    }

    pub fn method_not_found(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: "control.method_not_found".to_string(),
            message: message.into(),
            retryable: false,
            details,
        }
    }

    pub fn from_error(error: &crate::Error) -> Self {
        Self {
            code: format!("artifact.{}", error_code(error)),
            message: error.to_string(),
            retryable: !error.is_terminal(),
            details: serde_json::json!({}),
        }
    }
}

fn error_code(error: &crate::Error) -> &'static str {
    use crate::Error;
    match error {
        Error::Validation { .. } => "validation",
        Error::Authorization => "authorization",
        Error::NotFound { .. } => "not_found",
        Error::RemoteStore { .. } => "remote_store",
        Error::Transcode { .. } => "transcode",
        Error::Cancelled => "cancelled",
        Error::Interrupted => "interrupted",
        Error::Io(_) => "io",
        Error::Sqlite(_) => "sqlite",
        Error::SqliteMigrate(_) => "sqlite_migrate",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    #[serde(rename = "type")]
    pub type_: String,
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ControlRequest {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            type_: "control.request".to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    #[serde(rename = "type")]
    pub type_: String,
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ControlError>,
}

impl ControlResponse {
    pub fn ok(id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            type_: "control.response".to_string(),
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ControlError) -> Self {
        Self {
            type_: "control.response".to_string(),
            id: id.into(),
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_error_marks_validation_as_non_retryable() {
        let err = crate::Error::validation("bad title");
        let control_err = ControlError::from_error(&err);
        assert!(!control_err.retryable);
        assert_eq!(control_err.code, "artifact.validation");
    }

    #[test]
    fn from_error_marks_remote_store_as_retryable() {
        let err = crate::Error::remote_store("timed out");
        let control_err = ControlError::from_error(&err);
        assert!(control_err.retryable);
    }
}
