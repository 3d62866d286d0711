//! HTTP wire types for pelbox commands
//!
//! Request bodies carry the member's access token next to the target value.
//! Every response is `{success, settings?, message?}`.

use serde::{Deserialize, Serialize};

use crate::device::DoorPosition;

/// `PUT /set_locking`
#[derive(Debug, Clone, Deserialize)]
pub struct LockRequest {
    #[serde(default)]
    pub access_token: String,
    pub locked: bool,
}

/// `PUT /set_dismantle`
#[derive(Debug, Clone, Deserialize)]
pub struct DismantleRequest {
    #[serde(default)]
    pub access_token: String,
    pub dismantle: bool,
}

/// `PUT /set_expanding_value`
#[derive(Debug, Clone, Deserialize)]
pub struct ExpansionRequest {
    #[serde(default)]
    pub access_token: String,
    #[serde(rename = "expanding-value")]
    pub expanding_value: i64,
}

/// `PUT /set_door`
#[derive(Debug, Clone, Deserialize)]
pub struct DoorRequest {
    #[serde(default)]
    pub access_token: String,
    pub door: DoorPosition,
}

/// Response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse<T = serde_json::Value> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> CommandResponse<T> {
    pub fn ok(settings: T) -> Self {
        Self {
            success: true,
            settings: Some(settings),
            message: None,
        }
    }

    pub fn with_status(success: bool, settings: T) -> Self {
        Self {
            success,
            settings: Some(settings),
            message: None,
        }
    }
}

impl CommandResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            settings: None,
            message: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expansion_request_field_name() {
        let req: ExpansionRequest =
            serde_json::from_str(r#"{"access_token": "t", "expanding-value": 3}"#).unwrap();
        assert_eq!(req.expanding_value, 3);
    }

    #[test]
    fn test_missing_token_defaults_to_empty() {
        let req: LockRequest = serde_json::from_str(r#"{"locked": true}"#).unwrap();
        assert!(req.access_token.is_empty());
    }

    #[test]
    fn test_door_request() {
        let req: DoorRequest =
            serde_json::from_str(r#"{"access_token": "t", "door": "close"}"#).unwrap();
        assert_eq!(req.door, DoorPosition::Closed);
        let ajar = serde_json::from_str::<DoorRequest>(r#"{"access_token": "t", "door": "ajar"}"#);
        assert!(ajar.is_err());
    }

    #[test]
    fn test_error_envelope_omits_settings() {
        let json = serde_json::to_value(CommandResponse::error("Member is not logged in")).unwrap();
        assert_eq!(json["success"], false);
        assert!(json.get("settings").is_none());
        assert_eq!(json["message"], "Member is not logged in");
    }
}
