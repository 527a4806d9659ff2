use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
}

impl ErrorCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            422 => Self::Validation,
            429 => Self::RateLimited,
            _ => Self::Internal,
        }
    }
}

/// Error body returned by the REST backend (`{"message": .., "errors": {..}}`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub errors: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Builds an error from an HTTP status and a raw response body, keeping the
    /// backend message and the first field error when the body is JSON.
    pub fn from_response(status: u16, raw_body: &str) -> Self {
        let code = ErrorCode::from_status(status);
        let Ok(body) = serde_json::from_str::<ApiErrorBody>(raw_body) else {
            let trimmed = raw_body.trim();
            let message = if trimmed.is_empty() {
                format!("request failed with status {status}")
            } else {
                trimmed.chars().take(200).collect()
            };
            return Self::new(code, message);
        };

        let mut message = body
            .message
            .unwrap_or_else(|| format!("request failed with status {status}"));
        let mut fields: Vec<_> = body.errors.into_iter().collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some((field, reasons)) = fields.into_iter().next() {
            if let Some(reason) = reasons.into_iter().next() {
                message = format!("{message} ({field}: {reason})");
            }
        }
        Self::new(code, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_backend_message_and_first_field_error() {
        let err = ApiError::from_response(
            422,
            r#"{"message":"The given data was invalid.","errors":{"message":["The message field is required."]}}"#,
        );
        assert_eq!(err.code, ErrorCode::Validation);
        assert_eq!(
            err.message,
            "The given data was invalid. (message: The message field is required.)"
        );
    }

    #[test]
    fn falls_back_to_status_for_empty_body() {
        let err = ApiError::from_response(500, "");
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "request failed with status 500");
    }
}
