use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Response after a successful upload.
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub message: String,
    /// Stored name, also the download path
    pub filename: String,
    /// Name as sent by the client
    pub original_name: String,
    pub size: u64,
    /// e.g. "1.5 MB"
    pub size_human: String,
    pub expires_at: DateTime<Utc>,
    /// e.g. "1h"
    pub expires_in: String,
    pub download_url: String,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service health status
    pub status: String,
    /// Counting store backing admission, or "disabled"
    pub rate_limit_store: String,
    /// Service version
    pub version: String,
    pub uptime_seconds: u64,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_response_serialization() {
        let response = UploadResponse {
            message: "File uploaded successfully".to_string(),
            filename: "abc_1700000000.txt".to_string(),
            original_name: "notes.txt".to_string(),
            size: 1536,
            size_human: "1.5 KB".to_string(),
            expires_at: Utc::now(),
            expires_in: "1h".to_string(),
            download_url: "http://localhost:3000/abc_1700000000.txt".to_string(),
        };

        let json = serde_json::to_value(&response).expect("Serialization should succeed");
        assert_eq!(json["size"], 1536);
        assert_eq!(json["size_human"], "1.5 KB");
        assert!(json["expires_at"].is_string());
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy".to_string(),
            rate_limit_store: "memory".to_string(),
            version: "0.1.0".to_string(),
            uptime_seconds: 42,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&response).expect("Serialization should succeed");
        assert!(json.contains("\"status\":\"healthy\""));
        assert!(json.contains("\"rate_limit_store\":\"memory\""));
    }
}
