//! Client helper for talking to the shopfloor daemon.
//!
//! The daemon is the only writer. Failures are surfaced to the caller; the
//! report path retries once since collector scripts fire and forget.

use chrono::Utc;
use rand::RngCore;
use serde_json::Value;
use shopfloor_protocol::{
    Method, Request, Response, TelemetryReport, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use std::env;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

const SOCKET_ENV: &str = "SHOPFLOOR_DAEMON_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_MS: u64 = 600;
const WRITE_TIMEOUT_MS: u64 = 600;
const RETRY_DELAY_MS: u64 = 50;

/// Read one telemetry report from stdin, fill in identity fields the
/// collector may omit, and send it. Retries once on failure.
pub fn send_report_from_stdin() -> Result<(), String> {
    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .map_err(|err| format!("Failed to read report from stdin: {}", err))?;

    let mut value: Value =
        serde_json::from_str(&raw).map_err(|err| format!("Report is not valid JSON: {}", err))?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| "Report must be a JSON object".to_string())?;

    if !object.contains_key("report_id") {
        object.insert("report_id".to_string(), Value::String(make_report_id()));
    }
    if !object.contains_key("recorded_at") {
        object.insert(
            "recorded_at".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
    }

    let report: TelemetryReport = serde_json::from_value(value)
        .map_err(|err| format!("Report payload is invalid: {}", err))?;
    report
        .validate()
        .map_err(|err| format!("{}: {}", err.code, err.message))?;

    let send = || {
        let request = Request {
            protocol_version: PROTOCOL_VERSION,
            method: Method::Report,
            id: Some(report.report_id.clone()),
            params: Some(
                serde_json::to_value(&report)
                    .map_err(|err| format!("Failed to serialize report: {}", err))?,
            ),
        };
        expect_ok(send_request(request)?)
    };

    match send() {
        Ok(()) => Ok(()),
        Err(err) => {
            tracing::warn!(error = %err, "Failed to send report to daemon; retrying");
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            send()
        }
    }
}

pub fn send_cursor_seen(operation_id: &str, operation_name: Option<&str>) -> Result<(), String> {
    let mut params = serde_json::json!({ "operation_id": operation_id });
    if let Some(name) = operation_name {
        params["operation_name"] = Value::String(name.to_string());
    }
    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method: Method::CursorSeen,
        id: Some(make_report_id()),
        params: Some(params),
    };
    expect_ok(send_request(request)?)
}

/// Run a read-only query and pretty-print the response payload.
pub fn print_query(method: Method, params: Option<Value>) -> Result<(), String> {
    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some(make_report_id()),
        params,
    };
    let response = send_request(request)?;
    if !response.ok {
        return Err(error_message(response));
    }
    let data = response.data.unwrap_or(Value::Null);
    let rendered = serde_json::to_string_pretty(&data)
        .map_err(|err| format!("Failed to render response: {}", err))?;
    println!("{rendered}");
    Ok(())
}

/// Subscribe to the broadcast stream and print one JSON line per message
/// until the daemon goes away.
pub fn watch_broadcasts() -> Result<(), String> {
    let socket = socket_path()?;
    let mut stream = UnixStream::connect(&socket)
        .map_err(|err| format!("Failed to connect to daemon socket: {}", err))?;
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method: Method::Subscribe,
        id: Some(make_report_id()),
        params: None,
    };
    serde_json::to_writer(&mut stream, &request)
        .map_err(|err| format!("Failed to write request: {}", err))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush request: {}", err))?;
    stream.flush().ok();

    let reader = BufReader::new(stream);
    let mut lines = reader.lines();

    // First line is the subscription acknowledgement.
    let ack = lines
        .next()
        .ok_or_else(|| "Daemon closed the connection".to_string())?
        .map_err(|err| format!("Failed to read acknowledgement: {}", err))?;
    let response: Response = serde_json::from_str(&ack)
        .map_err(|err| format!("Failed to parse acknowledgement: {}", err))?;
    if !response.ok {
        return Err(error_message(response));
    }

    for line in lines {
        let line = line.map_err(|err| format!("Broadcast stream ended: {}", err))?;
        println!("{line}");
    }
    Ok(())
}

fn expect_ok(response: Response) -> Result<(), String> {
    if response.ok {
        Ok(())
    } else {
        Err(error_message(response))
    }
}

fn error_message(response: Response) -> String {
    response
        .error
        .map(|err| format!("{}: {}", err.code, err.message))
        .unwrap_or_else(|| "Unknown daemon error".to_string())
}

fn socket_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".shopfloor").join(SOCKET_NAME))
}

fn send_request(request: Request) -> Result<Response, String> {
    let socket = socket_path()?;
    let mut stream = UnixStream::connect(&socket)
        .map_err(|err| format!("Failed to connect to daemon socket: {}", err))?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    serde_json::to_writer(&mut stream, &request)
        .map_err(|err| format!("Failed to write request: {}", err))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush request: {}", err))?;
    stream.flush().ok();

    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("Response exceeded maximum size".to_string());
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err("Timed out waiting for daemon response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err("Daemon response was empty".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}

fn make_report_id() -> String {
    let mut random = rand::thread_rng();
    let rand = random.next_u64();
    format!(
        "rpt-{}-{}-{:x}",
        Utc::now().timestamp_millis(),
        std::process::id(),
        rand
    )
}
