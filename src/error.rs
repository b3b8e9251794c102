use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Read error: {0}")]
    Read(String),
    #[error("Write error: {0}")]
    Write(String),
    #[error("Request error: {msg}{}", detail(.error_msg))]
    Request { msg: String, error_msg: Option<String> },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Process error: {0}")]
    Process(String),
    #[error("Authentication error: {0}")]
    Auth(String),
    #[error("Timeout error: {0}")]
    Timeout(String),
    #[error("Signature invalid for profile {0}")]
    Signature(String),
    #[error("Connect cancelled")]
    Cancelled,
    #[error("No profile found with id: {0}")]
    NoProfile(String),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl AppError {
    pub fn request(msg: impl Into<String>) -> Self {
        Self::Request { msg: msg.into(), error_msg: None }
    }

    /// Build a request error from a service response body, picking up its
    /// `error_msg` field when the body is JSON.
    pub fn from_response(msg: impl Into<String>, status: u16, body: &str) -> Self {
        let error_msg = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("error_msg").and_then(|m| m.as_str()).map(str::to_string))
            .or_else(|| Some(format!("status {}", status)));
        Self::Request { msg: msg.into(), error_msg }
    }
}

fn detail(error_msg: &Option<String>) -> String {
    error_msg.as_deref().map(|m| format!(" ({})", m)).unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_error_carries_error_msg() {
        let err = AppError::from_response(
            "Service: Connect failed",
            500,
            r#"{"error":"parse_error","error_msg":"Invalid profile ID"}"#,
        );
        match &err {
            AppError::Request { error_msg, .. } => {
                assert_eq!(error_msg.as_deref(), Some("Invalid profile ID"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            err.to_string(),
            "Request error: Service: Connect failed (Invalid profile ID)"
        );
    }

    #[test]
    fn response_error_falls_back_to_status() {
        let err = AppError::from_response("Service: Token update failed", 502, "<html>");
        assert!(err.to_string().ends_with("(status 502)"));
    }
}
