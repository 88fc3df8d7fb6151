//! Shopfloor daemon entrypoint.
//!
//! A small, single-writer service: a unix-socket listener with strict
//! request validation, SQLite-backed machine/job state, and a periodically
//! refreshed status cache served to clients.

use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use serde_json::Value;
use shopfloor_protocol::{
    parse_cursor_seen, parse_report, ErrorInfo, Method, Request, Response, MAX_REQUEST_BYTES,
    PROTOCOL_VERSION,
};

mod accountant;
mod classify;
mod config;
mod db;
mod ingest;
mod state;
mod status;

use db::Db;
use state::SharedState;

const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

fn main() {
    init_logging();

    let socket_path = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(path = %socket_path.display(), "Shopfloor daemon started");

    let db_path = match daemon_db_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon database path");
            std::process::exit(1);
        }
    };

    let db = match Db::new(db_path) {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon database");
            std::process::exit(1);
        }
    };

    let runtime_config = match config::load_runtime_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load runtime config; using defaults");
            config::RuntimeConfig::default()
        }
    };
    let calendar = match runtime_config.calendar.build() {
        Ok(calendar) => calendar,
        Err(err) => {
            error!(error = %err, "Invalid work calendar configuration");
            std::process::exit(1);
        }
    };
    info!(
        warmup_threshold_secs = runtime_config.ingest.warmup_threshold_secs,
        refresh_interval_secs = runtime_config.status.refresh_interval_secs,
        cursor_ttl_secs = runtime_config.status.cursor_ttl_secs,
        shift_secs = calendar.shift_secs(),
        "Runtime config loaded"
    );

    let shared_state = Arc::new(SharedState::new(db, runtime_config, calendar));
    if let Err(err) = shared_state.refresh_status_cache() {
        warn!(error = %err, "Initial status refresh failed");
    }
    spawn_status_refresher(Arc::clone(&shared_state));

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&shared_state);
                thread::spawn(|| handle_connection(stream, state));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn spawn_status_refresher(state: Arc<SharedState>) {
    let interval = Duration::from_secs(state.refresh_interval_secs());
    thread::spawn(move || loop {
        thread::sleep(interval);
        match state.refresh_status_cache() {
            Ok(count) => tracing::debug!(machines = count, "Status cache refreshed"),
            Err(err) => warn!(error = %err, "Status cache refresh failed"),
        }
    });
}

fn init_logging() {
    let debug_enabled = env::var("SHOPFLOOR_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn daemon_socket_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".shopfloor").join(SOCKET_NAME))
}

fn daemon_db_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".shopfloor").join("daemon").join("state.db"))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: Arc<SharedState>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");

    if request.protocol_version != PROTOCOL_VERSION {
        let response = Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
        let _ = write_response(&mut stream, response);
        return;
    }

    // Subscribe holds the connection open and streams broadcast lines; every
    // other method is one request, one response.
    if request.method == Method::Subscribe {
        handle_subscribe(stream, request, state);
        return;
    }

    let response = handle_request(request, state);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let request_bytes = match newline_index {
        Some(index) => {
            if buffer.len() > index + 1 {
                let trailing = &buffer[index + 1..];
                if trailing.iter().any(|b| !b.is_ascii_whitespace()) {
                    warn!("Extra bytes detected after newline; ignoring trailing data");
                }
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, state: Arc<SharedState>) -> Response {
    match request.method {
        Method::GetHealth => {
            let data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "status_refresh_interval_secs": state.refresh_interval_secs(),
            });
            Response::ok(request.id, data)
        }
        Method::Report => handle_report(request, state),
        Method::GetStatus => {
            let snapshot = state.status_snapshot();
            tracing::debug!(machines = snapshot.len(), "Status snapshot");
            match serde_json::to_value(snapshot) {
                Ok(value) => Response::ok(request.id, value),
                Err(err) => Response::error(
                    request.id,
                    "serialization_error",
                    format!("Failed to serialize status: {}", err),
                ),
            }
        }
        Method::GetJobs => match state.jobs_snapshot() {
            Ok(jobs) => {
                let count = jobs.len();
                match serde_json::to_value(&jobs) {
                    Ok(value) => {
                        tracing::debug!(jobs = count, "Jobs snapshot");
                        Response::ok(request.id, value)
                    }
                    Err(err) => Response::error(
                        request.id,
                        "serialization_error",
                        format!("Failed to serialize jobs: {}", err),
                    ),
                }
            }
            Err(err) => Response::error(
                request.id,
                "jobs_error",
                format!("Failed to fetch jobs: {}", err),
            ),
        },
        Method::GetDayActivity => {
            let machine_id = match parse_day_activity_params(request.params) {
                Ok(machine_id) => machine_id,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            match state.day_activity_snapshot(machine_id.as_deref()) {
                Ok(entries) => match serde_json::to_value(entries) {
                    Ok(value) => Response::ok(request.id, value),
                    Err(err) => Response::error(
                        request.id,
                        "serialization_error",
                        format!("Failed to serialize day activity: {}", err),
                    ),
                },
                Err(err) => Response::error(
                    request.id,
                    "day_activity_error",
                    format!("Failed to fetch day activity: {}", err),
                ),
            }
        }
        Method::GetCursors => {
            let cursors = state.cursor_snapshot();
            tracing::debug!(cursors = cursors.len(), "Cursor snapshot");
            match serde_json::to_value(cursors) {
                Ok(value) => Response::ok(request.id, value),
                Err(err) => Response::error(
                    request.id,
                    "serialization_error",
                    format!("Failed to serialize cursors: {}", err),
                ),
            }
        }
        Method::CursorSeen => {
            let params = match request.params {
                Some(params) => params,
                None => {
                    return Response::error(request.id, "invalid_params", "operation_id is required")
                }
            };
            let parsed = match parse_cursor_seen(params) {
                Ok(parsed) => parsed,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            state.touch_cursor(&parsed.operation_id, parsed.operation_name.as_deref());
            Response::ok(request.id, serde_json::json!({"accepted": true}))
        }
        Method::Subscribe => Response::error(
            request.id,
            "invalid_method",
            "subscribe is handled on the connection",
        ),
    }
}

fn handle_report(request: Request, state: Arc<SharedState>) -> Response {
    let params = match request.params {
        Some(params) => params,
        None => return Response::error(request.id, "invalid_params", "report payload is required"),
    };

    let report = match parse_report(params) {
        Ok(report) => report,
        Err(err) => return Response::error_with_info(request.id, err),
    };

    info!(
        report_id = %report.report_id,
        machine_id = %report.machine_id,
        status = ?report.status,
        mode = ?report.mode,
        program = ?report.active_program,
        "Received telemetry report"
    );

    match state.ingest_report(&report) {
        Ok(outcome) => Response::ok(
            request.id,
            serde_json::json!({
                "accepted": true,
                "started_cycle": outcome.started_cycle,
                "finished_cycle": outcome.finished_cycle,
                "finished_job": outcome.finished_job,
            }),
        ),
        Err(err) => {
            warn!(machine_id = %report.machine_id, error = %err, "Report ingestion failed");
            Response::error(
                request.id,
                "ingest_error",
                format!("Failed to ingest report: {}", err),
            )
        }
    }
}

/// Stream broadcast messages to the subscriber until it hangs up. The ok
/// response confirms the subscription before the first message.
fn handle_subscribe(mut stream: UnixStream, request: Request, state: Arc<SharedState>) {
    let receiver = state.subscribe_broadcast();
    let response = Response::ok(request.id, serde_json::json!({"subscribed": true}));
    if write_response(&mut stream, response).is_err() {
        return;
    }
    let _ = stream.set_read_timeout(None);

    info!("Broadcast subscriber attached");
    for message in receiver {
        let Ok(line) = serde_json::to_string(&message) else {
            continue;
        };
        if stream
            .write_all(line.as_bytes())
            .and_then(|_| stream.write_all(b"\n"))
            .and_then(|_| stream.flush())
            .is_err()
        {
            break;
        }
    }
    tracing::debug!("Broadcast subscriber detached");
}

fn parse_day_activity_params(params: Option<Value>) -> Result<Option<String>, ErrorInfo> {
    let Some(params) = params else {
        return Ok(None);
    };
    if !params.is_object() {
        return Err(ErrorInfo::new("invalid_params", "params must be an object"));
    }
    let machine_id = params
        .get("machine_id")
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    Ok(machine_id)
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_activity_params_accept_missing_and_named_machine() {
        assert_eq!(parse_day_activity_params(None).expect("none"), None);
        assert_eq!(
            parse_day_activity_params(Some(serde_json::json!({}))).expect("empty"),
            None
        );
        assert_eq!(
            parse_day_activity_params(Some(serde_json::json!({"machine_id": " mill-01 "})))
                .expect("named"),
            Some("mill-01".to_string())
        );
        assert!(parse_day_activity_params(Some(serde_json::json!([1, 2]))).is_err());
    }
}
