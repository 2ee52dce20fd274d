use serde::{Deserialize, Serialize};

use crate::content::EntryInfo;
use crate::history::SyncRecord;
use crate::invalidation::{InvalidationScope, RevalidationStats};
use crate::scheduler::JobDescriptor;
use crate::sync::{SyncResult, SyncState};
use crate::types::Locale;

/// All RPC methods supported by the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    /// Get daemon status
    Status,

    /// Force a repository sync
    Sync,

    /// Invalidate cached content for one locale, or all of them
    Invalidate {
        #[serde(default)]
        locale: Option<Locale>,
    },

    /// Read (building if needed) the content snapshot for a locale
    Content {
        #[serde(default)]
        locale: Option<Locale>,
    },

    /// Recent sync attempts from the history log
    History { limit: usize },

    /// Get daemon version
    Version,

    /// Stop the daemon
    Stop,
}

/// Status response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResult {
    pub running: bool,
    pub version: String,
    pub pid: u32,
    pub uptime_secs: u64,
    /// Remote URL with credentials redacted.
    pub repo_url: String,
    pub branch: String,
    pub mirror_dir: String,
    pub sync: SyncState,
    #[serde(default)]
    pub jobs: Vec<JobDescriptor>,
    #[serde(default)]
    pub cache: Vec<EntryInfo>,
    #[serde(default)]
    pub revalidation: RevalidationStats,
    #[serde(default)]
    pub history_enabled: bool,
}

/// Invalidate response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidateResult {
    pub scope: InvalidationScope,
    /// Page paths queued for downstream revalidation.
    pub paths: Vec<String>,
}

/// Content response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentResult {
    pub entry: Option<EntryInfo>,
    /// Item slugs, sorted.
    pub items: Vec<String>,
    /// Page slugs, sorted.
    pub pages: Vec<String>,
}

/// History response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResult {
    pub records: Vec<SyncRecord>,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResult {
    pub version: String,
    pub pid: u32,
}

/// All possible success responses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Status(Box<StatusResult>),
    Sync(SyncResult),
    Invalidate(InvalidateResult),
    Content(ContentResult),
    History(HistoryResult),
    Version(VersionResult),
    Ok(()), // For stop - unit type serializes as null
}

/// Invalid JSON.
pub const PARSE_ERROR: i32 = -32700;
/// Valid JSON but not a JSON-RPC 2.0 request.
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
/// The daemon does not have the requested resource (e.g. history is off).
pub const NOT_FOUND: i32 = -1;

/// RPC error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn parse_error(msg: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR, msg)
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, msg)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("unknown method: {}", method))
    }

    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(NOT_FOUND, msg)
    }
}

impl Request {
    /// Wire names of every method, as they appear in `"method"`.
    pub const METHODS: &'static [&'static str] = &[
        "status",
        "sync",
        "invalidate",
        "content",
        "history",
        "version",
        "stop",
    ];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncOutcome;
    use crate::types::SyncReason;

    #[test]
    fn test_serialize_request_with_params() {
        let req = Request::Invalidate {
            locale: Some("fr".parse().unwrap()),
        };
        let json = serde_json::to_string(&req).unwrap();

        // Should have method and params fields due to serde tag/content
        assert!(json.contains(r#""method":"invalidate""#));
        assert!(json.contains(r#""params":"#));
        assert!(json.contains(r#""locale":"fr""#));
    }

    #[test]
    fn test_serialize_request_without_params() {
        for (req, method) in [
            (Request::Status, "status"),
            (Request::Sync, "sync"),
            (Request::Version, "version"),
            (Request::Stop, "stop"),
        ] {
            let json = serde_json::to_string(&req).unwrap();
            assert!(json.contains(&format!(r#""method":"{}""#, method)));
            assert!(!json.contains(r#""params""#));
        }
    }

    #[test]
    fn test_deserialize_request_with_params() {
        let json = r#"{"method":"history","params":{"limit":5}}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert!(matches!(req, Request::History { limit: 5 }));

        let json = r#"{"method":"content","params":{}}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert!(matches!(req, Request::Content { locale: None }));
    }

    #[test]
    fn test_deserialize_rejects_invalid_locale() {
        let json = r#"{"method":"invalidate","params":{"locale":"../etc"}}"#;
        assert!(serde_json::from_str::<Request>(json).is_err());
    }

    #[test]
    fn test_deserialize_request_without_params() {
        let json = r#"{"method":"status"}"#;
        let req: Request = serde_json::from_str(json).unwrap();

        assert!(matches!(req, Request::Status));
    }

    #[test]
    fn test_untagged_response_picks_matching_variant() {
        let sync = SyncResult {
            outcome: SyncOutcome::Failed,
            success: false,
            message: "sync failed".to_string(),
            details: Some("git fetch failed".to_string()),
            duration_ms: 10,
            timestamp: 1,
            reason: SyncReason::Forced,
            attempts: 3,
            generation: 4,
            commit: None,
        };
        let json = serde_json::to_string(&Response::Sync(sync.clone())).unwrap();
        match serde_json::from_str::<Response>(&json).unwrap() {
            Response::Sync(parsed) => assert_eq!(parsed, sync),
            other => panic!("Expected Sync response, got {:?}", other),
        }

        let history = Response::History(HistoryResult { records: vec![] });
        let json = serde_json::to_string(&history).unwrap();
        assert!(matches!(
            serde_json::from_str::<Response>(&json).unwrap(),
            Response::History(_)
        ));

        let json = r#"{"version":"0.1.0","pid":7}"#;
        assert!(matches!(
            serde_json::from_str::<Response>(json).unwrap(),
            Response::Version(_)
        ));
    }

    #[test]
    fn test_response_ok_serializes_as_null() {
        let resp = Response::Ok(());
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, "null");
    }

    #[test]
    fn test_rpc_error_codes() {
        let invalid = RpcError::invalid_params("bad param");
        assert_eq!(invalid.code, -32602);

        let internal = RpcError::internal("server error");
        assert_eq!(internal.code, -32603);

        let not_found = RpcError::not_found("history disabled");
        assert_eq!(not_found.code, -1);

        let unknown = RpcError::method_not_found("reboot");
        assert_eq!(unknown.code, -32601);
        assert_eq!(unknown.message, "unknown method: reboot");
    }

    #[test]
    fn method_table_matches_request_names() {
        let requests = [
            Request::Status,
            Request::Sync,
            Request::Invalidate { locale: None },
            Request::Content { locale: None },
            Request::History { limit: 1 },
            Request::Version,
            Request::Stop,
        ];
        assert_eq!(requests.len(), Request::METHODS.len());
        for (request, method) in requests.iter().zip(Request::METHODS) {
            let json = serde_json::to_value(request).unwrap();
            assert_eq!(json["method"], *method);
        }
    }
}
