//! Response envelope.
//!
//! Request bodies are the `service` request types; they are parsed from
//! the raw body so that malformed JSON still gets a `{status, msg}` reply.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome carried in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Failed,
}

/// `{status, msg}` body returned by every JSON endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: ResponseStatus,
    pub msg: Value,
}

impl ApiResponse {
    pub fn success(msg: impl Into<Value>) -> Self {
        Self {
            status: ResponseStatus::Success,
            msg: msg.into(),
        }
    }

    pub fn failed(msg: impl Into<Value>) -> Self {
        Self {
            status: ResponseStatus::Failed,
            msg: msg.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_shape() {
        assert_eq!(
            serde_json::to_value(ApiResponse::success("ok")).unwrap(),
            json!({"status": "success", "msg": "ok"})
        );
        assert_eq!(
            serde_json::to_value(ApiResponse::failed("boom")).unwrap(),
            json!({"status": "failed", "msg": "boom"})
        );
    }
}
