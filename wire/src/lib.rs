//! Guest exec wire codec: a length-delimited stream of self-describing JSON
//! objects exchanged between the control service and the guest agent running
//! inside a sandbox.
//!
//! Three message shapes travel host->guest (`Request`, `InputFrame`) and
//! guest->host (`OutputFrame`, or a single-shot `LegacyResponse` when the
//! guest never managed to speak the framed protocol at all).

use std::io;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

/// Fixed default port for the guest's virtual-socket listener.
pub const DEFAULT_GUEST_PORT: u16 = 10700;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed frame: {0}")]
    Protocol(String),
    #[error("unknown frame type: {0}")]
    UnknownType(String),
}

/// Host->guest request, always the first object on a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub command: Vec<String>,
    pub dir: Option<String>,
    pub env: Option<Vec<String>>,
    pub tty: bool,
    pub entropy_seed: Option<Vec<u8>>,
    pub workspace_tar_gz: Option<Vec<u8>>,
    pub workspace_access: Option<String>,
}

/// Host->guest input frame, any number of which may follow the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputFrame {
    Stdin { data: Vec<u8> },
    Eof,
    Resize { cols: u32, rows: u32 },
}

/// Guest->host output frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFrame {
    Stdout { data: Vec<u8> },
    Stderr { data: Vec<u8> },
    Exit {
        exit_code: i32,
        error: Option<String>,
    },
}

/// Single-shot fallback result, used when the guest never gets to frame
/// output (decode/validation failure before a connection can stream) or when
/// sending the terminal exit frame itself fails.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyResponse {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub error: Option<String>,
}

/// Either shape a guest connection may produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestMessage {
    Output(OutputFrame),
    Legacy(LegacyResponse),
}

fn bytes_to_b64(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Decode a JSON field that may be a base64 string or a raw string, per the
/// wire codec's tolerance rule. Missing/null fields decode to an empty byte
/// sequence; callers distinguish "absent" via `Value::get` beforehand.
fn flexible_bytes(value: &Value) -> Vec<u8> {
    match value.as_str() {
        Some(s) => BASE64.decode(s).unwrap_or_else(|_| s.as_bytes().to_vec()),
        None => Vec::new(),
    }
}

fn parse_frame_value(bytes: &[u8]) -> Result<Value, WireError> {
    serde_json::from_slice(bytes).map_err(|e| WireError::Protocol(e.to_string()))
}

// ---------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------

pub fn encode_request(req: &Request) -> Vec<u8> {
    let mut obj = serde_json::Map::new();
    obj.insert(
        "command".to_string(),
        Value::Array(req.command.iter().cloned().map(Value::String).collect()),
    );
    if let Some(dir) = &req.dir {
        obj.insert("dir".to_string(), Value::String(dir.clone()));
    }
    if let Some(env) = &req.env {
        obj.insert(
            "env".to_string(),
            Value::Array(env.iter().cloned().map(Value::String).collect()),
        );
    }
    obj.insert("tty".to_string(), Value::Bool(req.tty));
    if let Some(seed) = &req.entropy_seed {
        obj.insert(
            "entropy_seed".to_string(),
            Value::String(bytes_to_b64(seed)),
        );
    }
    if let Some(tar) = &req.workspace_tar_gz {
        obj.insert(
            "workspace_tar_gz".to_string(),
            Value::String(bytes_to_b64(tar)),
        );
    }
    if let Some(access) = &req.workspace_access {
        obj.insert("workspace_access".to_string(), Value::String(access.clone()));
    }
    serde_json::to_vec(&Value::Object(obj)).unwrap_or_default()
}

pub fn decode_request(bytes: &[u8]) -> Result<Request, WireError> {
    let value = parse_frame_value(bytes)?;
    let obj = value
        .as_object()
        .ok_or_else(|| WireError::Protocol("request is not a JSON object".to_string()))?;

    let command = obj
        .get("command")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .map(|v| v.as_str().unwrap_or_default().to_string())
                .collect()
        })
        .unwrap_or_default();

    let dir = obj
        .get("dir")
        .and_then(Value::as_str)
        .map(str::to_string);

    let env = obj.get("env").and_then(Value::as_array).map(|arr| {
        arr.iter()
            .map(|v| v.as_str().unwrap_or_default().to_string())
            .collect()
    });

    let tty = obj.get("tty").and_then(Value::as_bool).unwrap_or(false);

    let entropy_seed = obj.get("entropy_seed").map(flexible_bytes);
    let workspace_tar_gz = obj.get("workspace_tar_gz").map(flexible_bytes);
    let workspace_access = obj
        .get("workspace_access")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(Request {
        command,
        dir,
        env,
        tty,
        entropy_seed,
        workspace_tar_gz,
        workspace_access,
    })
}

// ---------------------------------------------------------------------
// InputFrame
// ---------------------------------------------------------------------

pub fn encode_input_frame(frame: &InputFrame) -> Vec<u8> {
    let value = match frame {
        InputFrame::Stdin { data } => json!({"type": "stdin", "data": bytes_to_b64(data)}),
        InputFrame::Eof => json!({"type": "eof"}),
        InputFrame::Resize { cols, rows } => json!({"type": "resize", "cols": cols, "rows": rows}),
    };
    serde_json::to_vec(&value).unwrap_or_default()
}

pub fn decode_input_frame(bytes: &[u8]) -> Result<InputFrame, WireError> {
    let value = parse_frame_value(bytes)?;
    let obj = value
        .as_object()
        .ok_or_else(|| WireError::Protocol("input frame is not a JSON object".to_string()))?;
    let ty = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| WireError::Protocol("input frame missing type".to_string()))?;
    match ty {
        "stdin" => Ok(InputFrame::Stdin {
            data: obj.get("data").map(flexible_bytes).unwrap_or_default(),
        }),
        "eof" => Ok(InputFrame::Eof),
        "resize" => {
            let cols = obj
                .get("cols")
                .and_then(Value::as_u64)
                .ok_or_else(|| WireError::Protocol("resize missing cols".to_string()))?
                as u32;
            let rows = obj
                .get("rows")
                .and_then(Value::as_u64)
                .ok_or_else(|| WireError::Protocol("resize missing rows".to_string()))?
                as u32;
            Ok(InputFrame::Resize { cols, rows })
        }
        other => Err(WireError::UnknownType(other.to_string())),
    }
}

// ---------------------------------------------------------------------
// OutputFrame / LegacyResponse / GuestMessage
// ---------------------------------------------------------------------

pub fn encode_output_frame(frame: &OutputFrame) -> Vec<u8> {
    let value = match frame {
        OutputFrame::Stdout { data } => json!({"type": "stdout", "data": bytes_to_b64(data)}),
        OutputFrame::Stderr { data } => json!({"type": "stderr", "data": bytes_to_b64(data)}),
        OutputFrame::Exit { exit_code, error } => {
            json!({"type": "exit", "exit_code": exit_code, "error": error})
        }
    };
    serde_json::to_vec(&value).unwrap_or_default()
}

pub fn decode_output_frame(bytes: &[u8]) -> Result<OutputFrame, WireError> {
    let value = parse_frame_value(bytes)?;
    let obj = value
        .as_object()
        .ok_or_else(|| WireError::Protocol("output frame is not a JSON object".to_string()))?;
    let ty = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| WireError::Protocol("output frame missing type".to_string()))?;
    match ty {
        "stdout" => Ok(OutputFrame::Stdout {
            data: obj.get("data").map(flexible_bytes).unwrap_or_default(),
        }),
        "stderr" => Ok(OutputFrame::Stderr {
            data: obj.get("data").map(flexible_bytes).unwrap_or_default(),
        }),
        "exit" => Ok(OutputFrame::Exit {
            exit_code: obj.get("exit_code").and_then(Value::as_i64).unwrap_or(1) as i32,
            error: obj
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string),
        }),
        other => Err(WireError::UnknownType(other.to_string())),
    }
}

pub fn encode_legacy_response(resp: &LegacyResponse) -> Vec<u8> {
    let value = json!({
        "exit_code": resp.exit_code,
        "stdout": bytes_to_b64(&resp.stdout),
        "stderr": bytes_to_b64(&resp.stderr),
        "error": resp.error,
    });
    serde_json::to_vec(&value).unwrap_or_default()
}

fn decode_legacy_response(obj: &serde_json::Map<String, Value>) -> LegacyResponse {
    LegacyResponse {
        exit_code: obj.get("exit_code").and_then(Value::as_i64).unwrap_or(1) as i32,
        stdout: obj.get("stdout").map(flexible_bytes).unwrap_or_default(),
        stderr: obj.get("stderr").map(flexible_bytes).unwrap_or_default(),
        error: obj
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// Decode a guest->host message, tolerating the legacy single-object
/// fallback: an object with no `type` field is a [`LegacyResponse`].
pub fn decode_guest_message(bytes: &[u8]) -> Result<GuestMessage, WireError> {
    let value = parse_frame_value(bytes)?;
    let obj = value
        .as_object()
        .ok_or_else(|| WireError::Protocol("message is not a JSON object".to_string()))?;
    if obj.contains_key("type") {
        decode_output_frame(bytes).map(GuestMessage::Output)
    } else {
        Ok(GuestMessage::Legacy(decode_legacy_response(obj)))
    }
}

// ---------------------------------------------------------------------
// Length-delimited framing on an async byte stream.
// ---------------------------------------------------------------------

/// Read one length-delimited frame. Returns `Ok(None)` on a clean EOF before
/// any byte of the next length prefix arrives.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Write one length-delimited frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let req = Request {
            command: vec!["/bin/echo".to_string(), "hi there ".to_string()],
            dir: Some("/workspace".to_string()),
            env: Some(vec!["FOO=bar".to_string(), "BARE".to_string()]),
            tty: true,
            entropy_seed: Some(vec![1, 2, 3, 255]),
            workspace_tar_gz: Some(vec![0x1f, 0x8b, 0, 0]),
            workspace_access: Some("ro".to_string()),
        };
        let encoded = encode_request(&req);
        let decoded = decode_request(&encoded).expect("decode");
        assert_eq!(req, decoded);
    }

    #[test]
    fn request_minimal_round_trip() {
        let req = Request {
            command: vec!["/bin/true".to_string()],
            ..Default::default()
        };
        let decoded = decode_request(&encode_request(&req)).expect("decode");
        assert_eq!(req, decoded);
    }

    #[test]
    fn input_frame_round_trip_all_variants() {
        for frame in [
            InputFrame::Stdin {
                data: b"ping\n".to_vec(),
            },
            InputFrame::Eof,
            InputFrame::Resize { cols: 120, rows: 40 },
        ] {
            let decoded = decode_input_frame(&encode_input_frame(&frame)).expect("decode");
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn output_frame_round_trip_all_variants() {
        for frame in [
            OutputFrame::Stdout {
                data: b"hello\n".to_vec(),
            },
            OutputFrame::Stderr {
                data: b"oops\n".to_vec(),
            },
            OutputFrame::Exit {
                exit_code: 0,
                error: None,
            },
            OutputFrame::Exit {
                exit_code: 1,
                error: Some("boom".to_string()),
            },
        ] {
            let decoded = decode_output_frame(&encode_output_frame(&frame)).expect("decode");
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn legacy_response_detected_when_type_absent() {
        let resp = LegacyResponse {
            exit_code: 1,
            stdout: b"partial".to_vec(),
            stderr: Vec::new(),
            error: Some("decode failed".to_string()),
        };
        let bytes = encode_legacy_response(&resp);
        match decode_guest_message(&bytes).expect("decode") {
            GuestMessage::Legacy(got) => assert_eq!(resp, got),
            GuestMessage::Output(_) => panic!("expected legacy response"),
        }
    }

    #[test]
    fn output_frame_detected_when_type_present() {
        let frame = OutputFrame::Stdout {
            data: b"x".to_vec(),
        };
        let bytes = encode_output_frame(&frame);
        match decode_guest_message(&bytes).expect("decode") {
            GuestMessage::Output(got) => assert_eq!(frame, got),
            GuestMessage::Legacy(_) => panic!("expected output frame"),
        }
    }

    #[test]
    fn unknown_type_is_protocol_error() {
        let bytes = br#"{"type":"bogus"}"#;
        let err = decode_output_frame(bytes).expect_err("should fail");
        assert!(matches!(err, WireError::UnknownType(ref t) if t == "bogus"));
    }

    #[test]
    fn raw_string_data_tolerated_when_not_base64() {
        // "hello world" is not valid base64 padding-wise in a way that
        // round-trips to itself, so the decoder must fall back to raw bytes.
        let bytes = br#"{"type":"stdout","data":"not base64!!"}"#;
        let frame = decode_output_frame(bytes).expect("decode");
        match frame {
            OutputFrame::Stdout { data } => assert_eq!(data, b"not base64!!"),
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn length_delimited_frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").await.expect("write");
        let mut cursor = std::io::Cursor::new(buf);
        let got = read_frame(&mut cursor).await.expect("read").expect("some");
        assert_eq!(got, b"hello");
        let eof = read_frame(&mut cursor).await.expect("read");
        assert!(eof.is_none());
    }
}
