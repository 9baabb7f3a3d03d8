//! File discovery engine
//!
//! Determines which files the engine wrote during a turn. Two strategies run
//! in order: parse the turn's buffered `Write` tool calls (authoritative),
//! then fall back to scanning the working directory for freshly modified
//! report files. Both validate against the turn start time so stale files
//! from earlier runs never leak into a response.

use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use relay_core::{
    DiscoveryDiagnostics, DiscoveryMethod, DiscoveryResult, DiscoveryStatus, EngineMessage,
    FileRecord,
};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::DEFAULT_SCAN_PATTERNS;

/// Slack applied to the tool-call strategy's freshness check. Coarse
/// filesystem timestamps can land a hair before the recorded turn start.
const MTIME_SLACK_SECS: i64 = 2;

pub struct DiscoveryEngine {
    max_inline_bytes: u64,
}

impl DiscoveryEngine {
    pub fn new(max_inline_bytes: u64) -> Self {
        Self { max_inline_bytes }
    }

    /// Run discovery over a finished turn.
    ///
    /// `buffer` is the full message buffer (possibly truncated by timeout),
    /// `scan_dir` the directory the engine ran in, `started_at` the turn
    /// start. Never returns an error: internal failures degrade to a
    /// `no_files_found` result carrying diagnostics.
    pub fn discover(
        &self,
        buffer: &[EngineMessage],
        scan_dir: &Path,
        started_at: DateTime<Utc>,
    ) -> DiscoveryResult {
        let mut diag = DiscoveryDiagnostics {
            sdk_parsing_attempted: true,
            sdk_parsing_failures: 0,
            directory_scan_attempted: false,
            directory_scan_failures: 0,
            permission_denials: count_denials(buffer),
            possible_causes: Vec::new(),
            suggested_actions: Vec::new(),
        };

        let mut files = self.from_tool_calls(buffer, scan_dir, started_at, &mut diag);
        if !files.is_empty() {
            files.sort_by_key(|f| f.modified_at);
            debug!(count = files.len(), "discovery resolved via tool-call parsing");
            return DiscoveryResult {
                status: DiscoveryStatus::Success,
                method: Some(DiscoveryMethod::SdkParsing),
                files,
                diagnostics: None,
            };
        }

        diag.directory_scan_attempted = true;
        let mut files = self.from_directory_scan(scan_dir, started_at, &mut diag);
        if !files.is_empty() {
            files.sort_by_key(|f| f.modified_at);
            debug!(count = files.len(), "discovery resolved via directory scan");
            return DiscoveryResult {
                status: DiscoveryStatus::Success,
                method: Some(DiscoveryMethod::DirectoryScan),
                files,
                diagnostics: None,
            };
        }

        fill_no_files_advice(&mut diag);
        DiscoveryResult {
            status: DiscoveryStatus::NoFilesFound,
            method: None,
            files: Vec::new(),
            diagnostics: Some(diag),
        }
    }

    /// Strategy 1: paths named by `Write` tool calls in the turn buffer,
    /// deduplicated in first-seen order and validated on disk.
    fn from_tool_calls(
        &self,
        buffer: &[EngineMessage],
        scan_dir: &Path,
        started_at: DateTime<Utc>,
        diag: &mut DiscoveryDiagnostics,
    ) -> Vec<FileRecord> {
        let mut seen = HashSet::new();
        let mut records = Vec::new();
        let cutoff = started_at - ChronoDuration::seconds(MTIME_SLACK_SECS);

        for msg in buffer {
            let Some(target) = msg.write_target() else {
                continue;
            };
            let path = resolve(scan_dir, target);
            if !seen.insert(path.clone()) {
                continue;
            }
            match self.build_record(&path, scan_dir) {
                Ok(record) if record.modified_at >= cutoff => records.push(record),
                Ok(record) => {
                    debug!(
                        path = %path.display(),
                        modified_at = %record.modified_at,
                        "tool-call file predates turn, skipping"
                    );
                    diag.sdk_parsing_failures += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "tool-call file unreadable");
                    diag.sdk_parsing_failures += 1;
                }
            }
        }
        records
    }

    /// Strategy 2: scan the working directory for report-shaped files
    /// modified strictly after the turn started.
    fn from_directory_scan(
        &self,
        scan_dir: &Path,
        started_at: DateTime<Utc>,
        diag: &mut DiscoveryDiagnostics,
    ) -> Vec<FileRecord> {
        let entries = match std::fs::read_dir(scan_dir) {
            Ok(e) => e,
            Err(e) => {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    diag.permission_denials += 1;
                }
                warn!(dir = %scan_dir.display(), error = %e, "directory scan failed");
                diag.directory_scan_failures += 1;
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        for entry in entries {
            let Ok(entry) = entry else {
                diag.directory_scan_failures += 1;
                continue;
            };
            let path = entry.path();
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !DEFAULT_SCAN_PATTERNS.iter().any(|p| matches_pattern(name, p)) {
                continue;
            }
            match self.build_record(&path, scan_dir) {
                Ok(record) if record.modified_at > started_at => records.push(record),
                Ok(_) => {}
                Err(e) => {
                    if e.kind() == std::io::ErrorKind::PermissionDenied {
                        diag.permission_denials += 1;
                    }
                    diag.directory_scan_failures += 1;
                }
            }
        }
        records
    }

    fn build_record(&self, path: &Path, scan_dir: &Path) -> std::io::Result<FileRecord> {
        let meta = std::fs::metadata(path)?;
        if !meta.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "not a regular file",
            ));
        }

        let size_bytes = meta.len();
        let modified_at: DateTime<Utc> = meta.modified()?.into();
        let created_at: DateTime<Utc> = meta.created().map(Into::into).unwrap_or(modified_at);

        let (checksum, content_base64) = if size_bytes > self.max_inline_bytes {
            warn!(
                path = %path.display(),
                size_bytes,
                cap = self.max_inline_bytes,
                "file exceeds inline cap; returning checksum only"
            );
            (hash_streaming(path)?, None)
        } else {
            let bytes = std::fs::read(path)?;
            let digest = Sha256::digest(&bytes);
            (format!("sha256:{digest:x}"), Some(BASE64.encode(&bytes)))
        };

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let relative_path = path
            .strip_prefix(scan_dir)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| filename.clone());

        Ok(FileRecord {
            path: path.to_string_lossy().into_owned(),
            relative_path,
            filename,
            size_bytes,
            created_at,
            modified_at,
            checksum,
            mime_type: mime_guess::from_path(path)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
            content_base64,
        })
    }
}

fn resolve(scan_dir: &Path, target: &str) -> PathBuf {
    let p = Path::new(target);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        scan_dir.join(p)
    }
}

fn count_denials(buffer: &[EngineMessage]) -> u32 {
    buffer
        .iter()
        .filter(|m| matches!(m, EngineMessage::ToolResult { is_error: true, .. }))
        .count() as u32
}

/// Minimal glob support: `*.ext` suffix patterns only, which is all the
/// scan patterns use.
fn matches_pattern(name: &str, pattern: &str) -> bool {
    match pattern.strip_prefix('*') {
        Some(suffix) => name.ends_with(suffix),
        None => name == pattern,
    }
}

fn hash_streaming(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(format!("sha256:{digest:x}"))
}

fn fill_no_files_advice(diag: &mut DiscoveryDiagnostics) {
    if diag.permission_denials > 0 {
        diag.possible_causes
            .push("File-writing tool calls were denied by the permission policy".to_string());
        diag.suggested_actions
            .push("Run the gateway with a permission mode that allows edits".to_string());
    }
    if diag.sdk_parsing_failures > 0 {
        diag.possible_causes
            .push("Tool calls referenced paths that were missing or stale on disk".to_string());
    }
    if diag.directory_scan_failures > 0 {
        diag.possible_causes
            .push("The working directory could not be scanned".to_string());
        diag.suggested_actions
            .push("Verify the working directory exists and is readable".to_string());
    }
    if diag.possible_causes.is_empty() {
        diag.possible_causes
            .push("The engine completed without writing any files".to_string());
    }
    diag.suggested_actions
        .push("Check the output directory manually".to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write as _;

    const CAP: u64 = 10 * 1024 * 1024;

    fn write_tool_use(path: &Path) -> EngineMessage {
        EngineMessage::ToolUse {
            name: "Write".to_string(),
            input: json!({ "file_path": path.to_string_lossy(), "content": "x" }),
        }
    }

    fn long_ago() -> DateTime<Utc> {
        Utc::now() - ChronoDuration::seconds(60)
    }

    #[test]
    fn test_tool_call_parsing_finds_written_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("report.md");
        std::fs::write(&path, b"# findings\n").expect("write");

        let engine = DiscoveryEngine::new(CAP);
        let result = engine.discover(&[write_tool_use(&path)], dir.path(), long_ago());

        assert_eq!(result.status, DiscoveryStatus::Success);
        assert_eq!(result.method, Some(DiscoveryMethod::SdkParsing));
        assert_eq!(result.files.len(), 1);

        let record = &result.files[0];
        assert_eq!(record.filename, "report.md");
        assert_eq!(record.relative_path, "report.md");
        assert_eq!(record.size_bytes, 11);
        assert_eq!(record.mime_type, "text/markdown");
        assert!(record.checksum.starts_with("sha256:"));
        let decoded = BASE64
            .decode(record.content_base64.as_deref().expect("inline content"))
            .expect("valid base64");
        assert_eq!(decoded, b"# findings\n");
    }

    #[test]
    fn test_duplicate_write_calls_yield_one_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        std::fs::write(&path, b"{}").expect("write");

        let engine = DiscoveryEngine::new(CAP);
        let buffer = vec![write_tool_use(&path), write_tool_use(&path)];
        let result = engine.discover(&buffer, dir.path(), long_ago());

        assert_eq!(result.files.len(), 1);
    }

    #[test]
    fn test_missing_tool_call_path_falls_back_to_scan() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ghost = dir.path().join("never-written.md");
        let real = dir.path().join("actual.md");
        std::fs::write(&real, b"fallback").expect("write");

        let engine = DiscoveryEngine::new(CAP);
        let result = engine.discover(&[write_tool_use(&ghost)], dir.path(), long_ago());

        assert_eq!(result.status, DiscoveryStatus::Success);
        assert_eq!(result.method, Some(DiscoveryMethod::DirectoryScan));
        assert_eq!(result.files[0].filename, "actual.md");
    }

    #[test]
    fn test_scan_ignores_files_older_than_turn() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("stale.md"), b"old").expect("write");

        let engine = DiscoveryEngine::new(CAP);
        // Turn "started" in the future, so nothing on disk qualifies.
        let started = Utc::now() + ChronoDuration::seconds(30);
        let result = engine.discover(&[], dir.path(), started);

        assert_eq!(result.status, DiscoveryStatus::NoFilesFound);
        assert!(result.files.is_empty());
        let diag = result.diagnostics.expect("diagnostics on no_files_found");
        assert!(diag.directory_scan_attempted);
        assert!(!diag.possible_causes.is_empty());
        assert!(!diag.suggested_actions.is_empty());
    }

    #[test]
    fn test_scan_skips_non_report_extensions() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("notes.txt"), b"ignored").expect("write");
        std::fs::write(dir.path().join("found.json"), b"{}").expect("write");

        let engine = DiscoveryEngine::new(CAP);
        let result = engine.discover(&[], dir.path(), long_ago());

        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].filename, "found.json");
    }

    #[test]
    fn test_oversized_file_keeps_checksum_drops_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("big.md");
        let mut f = std::fs::File::create(&path).expect("create");
        f.write_all(&[b'a'; 256]).expect("write");
        drop(f);

        let engine = DiscoveryEngine::new(16);
        let result = engine.discover(&[write_tool_use(&path)], dir.path(), long_ago());

        assert_eq!(result.status, DiscoveryStatus::Success);
        let record = &result.files[0];
        assert!(record.content_base64.is_none());
        assert!(record.checksum.starts_with("sha256:"));
        assert_eq!(record.size_bytes, 256);
    }

    #[test]
    fn test_permission_denials_surface_in_diagnostics() {
        let dir = tempfile::tempdir().expect("tempdir");
        let buffer = vec![EngineMessage::ToolResult {
            is_error: true,
            content: Some("permission denied".to_string()),
        }];

        let engine = DiscoveryEngine::new(CAP);
        let result = engine.discover(&buffer, dir.path(), long_ago());

        assert_eq!(result.status, DiscoveryStatus::NoFilesFound);
        let diag = result.diagnostics.expect("diagnostics");
        assert_eq!(diag.permission_denials, 1);
        assert!(diag
            .possible_causes
            .iter()
            .any(|c| c.contains("permission policy")));
    }

    #[test]
    fn test_concurrent_turns_do_not_cross_contaminate() {
        // Two turns share one output directory; a file created between
        // their start times belongs only to the earlier turn.
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = DiscoveryEngine::new(CAP);

        let first_start = Utc::now() - ChronoDuration::seconds(60);
        std::fs::write(dir.path().join("report.md"), b"turn one output").expect("write");
        let second_start = Utc::now() + ChronoDuration::seconds(5);

        let first = engine.discover(&[], dir.path(), first_start);
        let second = engine.discover(&[], dir.path(), second_start);

        assert_eq!(first.status, DiscoveryStatus::Success);
        assert_eq!(first.files.len(), 1);
        assert_eq!(second.status, DiscoveryStatus::NoFilesFound);
        assert!(second.files.is_empty());
    }

    #[test]
    fn test_files_sorted_by_modification_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = dir.path().join("first.md");
        let second = dir.path().join("second.md");
        std::fs::write(&first, b"1").expect("write");
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(&second, b"2").expect("write");

        let engine = DiscoveryEngine::new(CAP);
        let buffer = vec![write_tool_use(&second), write_tool_use(&first)];
        let result = engine.discover(&buffer, dir.path(), long_ago());

        let names: Vec<_> = result.files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["first.md", "second.md"]);
    }
}
