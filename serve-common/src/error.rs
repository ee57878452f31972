//! OpenAI-style error bodies.

use serde::{Deserialize, Serialize};

/// Error body returned on failure. `code` doubles as the HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub object: String,
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(default)]
    pub param: Option<String>,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>, error_type: impl Into<String>, code: u16) -> Self {
        Self {
            object: "error".to_string(),
            message: message.into(),
            error_type: error_type.into(),
            param: None,
            code,
        }
    }
}

/// Terminal SSE payload sent when a streamed generation fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamError {
    pub error: ErrorResponse,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_wire_shape() {
        let err = ErrorResponse::new("Model not found: unknown", "NotFound", 404);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["object"], "error");
        assert_eq!(json["type"], "NotFound");
        assert_eq!(json["code"], 404);
        assert!(json["param"].is_null());
    }

    #[test]
    fn test_stream_error_wraps_body() {
        let event = StreamError {
            error: ErrorResponse::new("boom", "UpstreamEngineError", 500),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.starts_with(r#"{"error":{"#));
    }
}
