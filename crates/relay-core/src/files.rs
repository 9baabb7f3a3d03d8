//! File discovery record model
//!
//! Records are built post-hoc from filesystem inspection after a turn ends
//! and serialized once into the response; nothing here is retained
//! server-side afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A file the engine wrote to disk during a turn.
///
/// `checksum` is `"sha256:" + lowercase hex digest` of the raw bytes;
/// `content_base64` is standard (non-URL-safe) base64 of the same bytes, and
/// is omitted for files above the configured inline cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub relative_path: String,
    pub filename: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub checksum: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_base64: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStatus {
    Success,
    NoFilesFound,
}

/// Which strategy actually produced the returned files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    SdkParsing,
    DirectoryScan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub status: DiscoveryStatus,
    pub method: Option<DiscoveryMethod>,
    pub files: Vec<FileRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<DiscoveryDiagnostics>,
}

impl DiscoveryResult {
    /// Empty result used when discovery itself failed; the content stream
    /// must still terminate normally with a diagnostic block.
    pub fn failed(reason: &str) -> Self {
        Self {
            status: DiscoveryStatus::NoFilesFound,
            method: None,
            files: Vec::new(),
            diagnostics: Some(DiscoveryDiagnostics {
                sdk_parsing_attempted: true,
                sdk_parsing_failures: 1,
                directory_scan_attempted: false,
                directory_scan_failures: 0,
                permission_denials: 0,
                possible_causes: vec![format!("Discovery failed internally: {reason}")],
                suggested_actions: vec!["Check output directory manually".to_string()],
            }),
        }
    }

    /// Wire shape for the `x_claude_metadata` field / SSE event.
    pub fn into_metadata(self) -> ClaudeMetadata {
        ClaudeMetadata {
            files_created: self.files,
            discovery_status: self.status,
            discovery_method: self.method,
            discovery_details: self.diagnostics,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryDiagnostics {
    pub sdk_parsing_attempted: bool,
    pub sdk_parsing_failures: u32,
    pub directory_scan_attempted: bool,
    pub directory_scan_failures: u32,
    pub permission_denials: u32,
    pub possible_causes: Vec<String>,
    pub suggested_actions: Vec<String>,
}

/// The metadata payload appended to responses when discovery ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeMetadata {
    pub files_created: Vec<FileRecord>,
    pub discovery_status: DiscoveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery_method: Option<DiscoveryMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery_details: Option<DiscoveryDiagnostics>,
}
