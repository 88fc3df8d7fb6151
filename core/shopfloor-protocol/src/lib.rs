//! IPC protocol types and validation for shopfloord.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    Report,
    GetStatus,
    GetJobs,
    GetDayActivity,
    GetCursors,
    CursorSeen,
    Subscribe,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// One flat telemetry report, one per machine per poll.
///
/// Every field other than the machine identity is optional: a field absent
/// from a given report keeps its previous value on the daemon side. Duration
/// fields are `HH:MM:SS` strings as emitted by the machine controllers.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryReport {
    pub report_id: String,
    pub machine_id: String,
    pub recorded_at: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub active_program: Option<String>,
    #[serde(default)]
    pub current_tool: Option<String>,
    #[serde(default)]
    pub restart_counter_a: Option<i64>,
    #[serde(default)]
    pub restart_counter_b: Option<i64>,
    #[serde(default)]
    pub machine_clock: Option<String>,
    #[serde(default)]
    pub remaining_time: Option<String>,
    #[serde(default)]
    pub cycle_time: Option<String>,
    #[serde(default)]
    pub last_cycle_time: Option<String>,
}

impl TelemetryReport {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.report_id.trim().is_empty() {
            return Err(ErrorInfo::new("invalid_report_id", "report_id is required"));
        }
        if self.report_id.len() > 128 {
            return Err(ErrorInfo::new(
                "invalid_report_id",
                "report_id must be 128 characters or fewer",
            ));
        }
        if self.machine_id.trim().is_empty() {
            return Err(ErrorInfo::new(
                "invalid_machine_id",
                "machine_id is required",
            ));
        }
        if DateTime::parse_from_rfc3339(&self.recorded_at).is_err() {
            return Err(ErrorInfo::new(
                "invalid_timestamp",
                "recorded_at must be RFC3339",
            ));
        }
        Ok(())
    }
}

pub fn parse_report(params: Value) -> Result<TelemetryReport, ErrorInfo> {
    let report: TelemetryReport = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("report payload is invalid JSON: {}", err),
        )
    })?;
    report.validate()?;
    Ok(report)
}

/// Message published to the live-status broadcast topic whenever the
/// currently viewed operation changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BroadcastMessage {
    pub operation_id: String,
    pub operation_name: String,
    pub timestamp: String,
}

/// Parse a controller-style `HH:MM:SS` duration into whole seconds.
///
/// Hours may exceed two digits (long-running totals); minutes and seconds
/// must stay below 60. Returns `None` for any malformed value so callers can
/// fall back to the previously known field.
pub fn parse_hms(value: &str) -> Option<i64> {
    let mut parts = value.split(':');
    let hours: i64 = parts.next()?.trim().parse().ok()?;
    let minutes: i64 = parts.next()?.trim().parse().ok()?;
    let seconds: i64 = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    if hours < 0 || !(0..60).contains(&minutes) || !(0..60).contains(&seconds) {
        return None;
    }
    Some(hours * 3600 + minutes * 60 + seconds)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CursorSeenParams {
    pub operation_id: String,
    #[serde(default)]
    pub operation_name: Option<String>,
}

pub fn parse_cursor_seen(params: Value) -> Result<CursorSeenParams, ErrorInfo> {
    let parsed: CursorSeenParams = serde_json::from_value(params)
        .map_err(|err| ErrorInfo::new("invalid_params", format!("cursor params: {}", err)))?;
    if parsed.operation_id.trim().is_empty() {
        return Err(ErrorInfo::new(
            "invalid_operation_id",
            "operation_id is required",
        ));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_report() -> TelemetryReport {
        TelemetryReport {
            report_id: "rpt-1".to_string(),
            machine_id: "mill-01".to_string(),
            recorded_at: "2026-01-30T12:00:00Z".to_string(),
            status: Some("active".to_string()),
            mode: Some("automatic".to_string()),
            active_program: Some("O1234".to_string()),
            current_tool: Some("T05".to_string()),
            restart_counter_a: Some(12),
            restart_counter_b: Some(3),
            machine_clock: Some("2026-01-30T12:00:00Z".to_string()),
            remaining_time: Some("00:12:30".to_string()),
            cycle_time: Some("00:04:10".to_string()),
            last_cycle_time: Some("00:04:05".to_string()),
        }
    }

    #[test]
    fn validates_report() {
        assert!(base_report().validate().is_ok());
    }

    #[test]
    fn rejects_missing_machine_id() {
        let mut report = base_report();
        report.machine_id = "  ".to_string();
        assert!(report.validate().is_err());
    }

    #[test]
    fn rejects_bad_timestamp() {
        let mut report = base_report();
        report.recorded_at = "not-a-time".to_string();
        assert!(report.validate().is_err());
    }

    #[test]
    fn rejects_long_report_id() {
        let mut report = base_report();
        report.report_id = "a".repeat(256);
        assert!(report.validate().is_err());
    }

    #[test]
    fn parses_hms_durations() {
        assert_eq!(parse_hms("00:04:10"), Some(250));
        assert_eq!(parse_hms("01:00:00"), Some(3600));
        assert_eq!(parse_hms("123:00:01"), Some(123 * 3600 + 1));
    }

    #[test]
    fn rejects_malformed_hms() {
        assert_eq!(parse_hms(""), None);
        assert_eq!(parse_hms("12:34"), None);
        assert_eq!(parse_hms("00:61:00"), None);
        assert_eq!(parse_hms("00:00:-5"), None);
        assert_eq!(parse_hms("1:2:3:4"), None);
        assert_eq!(parse_hms("aa:bb:cc"), None);
    }

    #[test]
    fn report_round_trips_partial_fields() {
        let json = serde_json::json!({
            "report_id": "rpt-2",
            "machine_id": "mill-01",
            "recorded_at": "2026-01-30T12:00:10Z",
            "status": "stopped"
        });
        let report = parse_report(json).expect("partial report parses");
        assert_eq!(report.status.as_deref(), Some("stopped"));
        assert!(report.mode.is_none());
        assert!(report.current_tool.is_none());
    }

    #[test]
    fn cursor_params_require_operation_id() {
        let err = parse_cursor_seen(serde_json::json!({ "operation_id": "" }));
        assert!(err.is_err());
        let ok = parse_cursor_seen(serde_json::json!({
            "operation_id": "op-7",
            "operation_name": "OP70 housing"
        }));
        assert!(ok.is_ok());
    }
}
