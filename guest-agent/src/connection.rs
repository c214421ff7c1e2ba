//! Per-connection driver: decode the request, prepare the workspace and
//! environment, run the command, and stream frames back, falling back to
//! a single legacy response object whenever the framed protocol can't be
//! used at all.

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use cleanroom_wire::InputFrame;
use cleanroom_wire::LegacyResponse;
use cleanroom_wire::OutputFrame;
use cleanroom_wire::Request;
use cleanroom_wire::decode_input_frame;
use cleanroom_wire::decode_request;
use cleanroom_wire::encode_legacy_response;
use cleanroom_wire::encode_output_frame;
use cleanroom_wire::read_frame;
use cleanroom_wire::write_frame;
use cleanroom_workspace::WORKSPACE_ROOT;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::mpsc;

use crate::env::build_env;
use crate::exec::run_piped;
use crate::exec::run_tty;

/// Handle one guest connection end to end. `reader`/`writer` are the two
/// halves of the transport (vsock stream split, or stdin/stdout).
pub async fn handle_connection<R, W>(mut reader: R, writer: W)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let outbound = Arc::new(TokioMutex::new(writer));

    let first = match read_frame(&mut reader).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return,
        Err(err) => {
            tracing::debug!(%err, "connection closed before a request arrived");
            return;
        }
    };

    let request = match decode_request(&first) {
        Ok(request) => request,
        Err(err) => {
            send_legacy_error(&outbound, err.to_string()).await;
            return;
        }
    };

    if let Err(message) = validate_request(&request) {
        send_legacy_error(&outbound, message).await;
        return;
    }

    if let Some(seed) = &request.entropy_seed {
        if let Err(err) = cleanroom_workspace::seed_entropy(seed) {
            tracing::warn!(%err, "entropy seeding failed, continuing without it");
        }
    }

    let mut dir = request.dir.clone();
    if let Some(tar_gz) = &request.workspace_tar_gz {
        let root = Path::new(WORKSPACE_ROOT);
        if let Err(err) = cleanroom_workspace::materialize(tar_gz, root) {
            send_legacy_error(&outbound, format!("workspace materialize failed: {err}")).await;
            return;
        }
        if let Err(err) = cleanroom_workspace::seal_if_readonly(root, request.workspace_access.as_deref()) {
            send_legacy_error(&outbound, format!("workspace seal failed: {err}")).await;
            return;
        }
        if dir.as_deref().map(str::is_empty).unwrap_or(true) {
            dir = Some(WORKSPACE_ROOT.to_string());
        }
    }

    let env = build_env(&request.env);

    let (input_tx, input_rx) = mpsc::channel::<InputFrame>(32);
    let mut frame_reader = reader;
    let reader_handle = tokio::spawn(async move {
        loop {
            match read_frame(&mut frame_reader).await {
                Ok(Some(bytes)) => match decode_input_frame(&bytes) {
                    Ok(frame) => {
                        if input_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::debug!(%err, "dropping malformed input frame"),
                },
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(%err, "input stream closed");
                    break;
                }
            }
        }
    });

    // Every frame, from both the streaming tasks below and the terminal
    // exit frame, funnels through this one channel so a single task writes
    // them to the wire in the order they were produced; spawning a writer
    // task per frame would let the outbound lock acquisitions race and
    // reorder chunks relative to each other.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutputFrame>();
    let outbound_for_writer = outbound.clone();
    let writer_handle = tokio::spawn(async move {
        let mut last_write_ok = true;
        while let Some(frame) = out_rx.recv().await {
            let mut guard = outbound_for_writer.lock().await;
            last_write_ok = write_frame(&mut *guard, &encode_output_frame(&frame)).await.is_ok();
        }
        last_write_ok
    });

    let send_tx = out_tx.clone();
    let send = move |frame: OutputFrame| {
        let _ = send_tx.send(frame);
    };

    let captured_stdout = Arc::new(StdMutex::new(Vec::new()));
    let captured_stderr = Arc::new(StdMutex::new(Vec::new()));

    let exit_frame = if request.tty {
        // TTY sessions have no separate capture buffer; stdout/stderr are
        // interleaved on the pty and only ever reach the caller as frames.
        run_tty(&request.command, dir.as_deref(), &env, send, input_rx).await
    } else {
        run_piped(
            &request.command,
            dir.as_deref(),
            &env,
            send,
            input_rx,
            captured_stdout.clone(),
            captured_stderr.clone(),
        )
        .await
    };

    reader_handle.abort();

    let (exit_code, error) = match &exit_frame {
        OutputFrame::Exit { exit_code, error } => (*exit_code, error.clone()),
        _ => (1, Some("internal error: non-exit frame from executor".to_string())),
    };

    let _ = out_tx.send(exit_frame);
    drop(out_tx);
    let exit_write_ok = writer_handle.await.unwrap_or(false);

    if !exit_write_ok {
        let stdout = captured_stdout.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let stderr = captured_stderr.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let legacy = LegacyResponse {
            exit_code,
            stdout,
            stderr,
            error,
        };
        let mut guard = outbound.lock().await;
        let _ = write_frame(&mut *guard, &encode_legacy_response(&legacy)).await;
    }
}

fn validate_request(request: &Request) -> Result<(), String> {
    let first = request
        .command
        .first()
        .ok_or_else(|| "missing command".to_string())?;
    if first.trim().is_empty() {
        return Err("empty command after trim".to_string());
    }
    Ok(())
}

async fn send_legacy_error<W>(outbound: &Arc<TokioMutex<W>>, message: String)
where
    W: AsyncWrite + Unpin,
{
    let response = LegacyResponse {
        exit_code: 1,
        stdout: Vec::new(),
        stderr: Vec::new(),
        error: Some(message),
    };
    let mut guard = outbound.lock().await;
    let _ = write_frame(&mut *guard, &encode_legacy_response(&response)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_request_rejects_blank_first_argument() {
        let request = Request {
            command: vec!["  ".to_string(), "echo".to_string(), "hi".to_string()],
            ..Default::default()
        };
        assert!(validate_request(&request).is_err());
    }

    #[test]
    fn validate_request_accepts_nonblank_command() {
        let request = Request {
            command: vec!["/bin/echo".to_string()],
            ..Default::default()
        };
        assert!(validate_request(&request).is_ok());
    }

    #[test]
    fn validate_request_rejects_empty_command() {
        let request = Request::default();
        assert!(validate_request(&request).is_err());
    }
}
