//! Child process execution: a PTY-backed path for interactive TTY requests
//! and a piped path for everything else, both streaming stdout/stderr back
//! as output frames while the input-frame channel feeds stdin/eof/resize.

use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use cleanroom_wire::InputFrame;
use cleanroom_wire::OutputFrame;
use portable_pty::CommandBuilder;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::env::effective_term;

const INITIAL_COLS: u16 = 80;
const INITIAL_ROWS: u16 = 24;

fn exit_for_io_error(err: std::io::Error) -> OutputFrame {
    OutputFrame::Exit {
        exit_code: 1,
        error: Some(err.to_string()),
    }
}

/// Run `command` attached to a fresh pseudo-terminal. Stdout/stderr are not
/// distinguished on a PTY; everything the master produces is forwarded as
/// `Stdout` frames.
pub async fn run_tty(
    command: &[String],
    dir: Option<&str>,
    env: &[(String, String)],
    send: impl Fn(OutputFrame) + Send + Sync + 'static,
    mut input_rx: mpsc::Receiver<InputFrame>,
) -> OutputFrame {
    let pty_system = native_pty_system();
    let pair = match pty_system.openpty(PtySize {
        rows: INITIAL_ROWS,
        cols: INITIAL_COLS,
        pixel_width: 0,
        pixel_height: 0,
    }) {
        Ok(pair) => pair,
        Err(err) => return exit_for_io_error(std::io::Error::other(err.to_string())),
    };

    let mut builder = CommandBuilder::new(&command[0]);
    builder.args(&command[1..]);
    if let Some(dir) = dir {
        builder.cwd(dir);
    }
    for (key, value) in env {
        builder.env(key, value);
    }
    builder.env("TERM", effective_term(env));

    let mut child = match pair.slave.spawn_command(builder) {
        Ok(child) => child,
        Err(err) => return exit_for_io_error(std::io::Error::other(err.to_string())),
    };
    drop(pair.slave);

    let mut reader = match pair.master.try_clone_reader() {
        Ok(reader) => reader,
        Err(err) => return exit_for_io_error(std::io::Error::other(err.to_string())),
    };
    let writer = match pair.master.take_writer() {
        Ok(writer) => writer,
        Err(err) => return exit_for_io_error(std::io::Error::other(err.to_string())),
    };
    let writer_slot: Arc<StdMutex<Option<Box<dyn Write + Send>>>> = Arc::new(StdMutex::new(Some(writer)));
    let master = Arc::new(StdMutex::new(pair.master));

    let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(256);
    let reader_handle = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if chunk_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                // The slave side closing its end of the PTY surfaces as EIO
                // on the master reader; treat it like a normal EOF.
                Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
                Err(_) => break,
            }
        }
    });

    let send = Arc::new(send);
    let forward_send = send.clone();
    let forward_handle = tokio::spawn(async move {
        while let Some(data) = chunk_rx.recv().await {
            forward_send(OutputFrame::Stdout { data });
        }
    });

    let writer_for_input = writer_slot.clone();
    let master_for_input = master.clone();
    let input_handle = tokio::spawn(async move {
        while let Some(frame) = input_rx.recv().await {
            match frame {
                InputFrame::Stdin { data } => {
                    let slot = writer_for_input.clone();
                    let _ = tokio::task::spawn_blocking(move || {
                        if let Ok(mut guard) = slot.lock() {
                            if let Some(writer) = guard.as_mut() {
                                let _ = writer.write_all(&data);
                                let _ = writer.flush();
                            }
                        }
                    })
                    .await;
                }
                InputFrame::Resize { cols, rows } => {
                    if let Ok(guard) = master_for_input.lock() {
                        let _ = guard.resize(PtySize {
                            rows: rows as u16,
                            cols: cols as u16,
                            pixel_width: 0,
                            pixel_height: 0,
                        });
                    }
                }
                InputFrame::Eof => {
                    if let Ok(mut guard) = writer_for_input.lock() {
                        guard.take();
                    }
                    break;
                }
            }
        }
    });

    let wait_result = tokio::task::spawn_blocking(move || child.wait()).await;

    drop(reader_handle.await);
    let _ = forward_handle.await;
    input_handle.abort();

    match wait_result {
        Ok(Ok(status)) => OutputFrame::Exit {
            exit_code: status.exit_code() as i32,
            error: None,
        },
        Ok(Err(err)) => exit_for_io_error(std::io::Error::other(err.to_string())),
        Err(join_err) => exit_for_io_error(std::io::Error::other(join_err.to_string())),
    }
}

/// Run `command` with separate piped stdin/stdout/stderr. Output is both
/// streamed as frames (authoritative) and accumulated into `captured`, used
/// only to build the legacy fallback response if the terminal exit frame
/// itself cannot be sent.
pub async fn run_piped(
    command: &[String],
    dir: Option<&str>,
    env: &[(String, String)],
    send: impl Fn(OutputFrame) + Send + Sync + 'static,
    mut input_rx: mpsc::Receiver<InputFrame>,
    captured_stdout: Arc<StdMutex<Vec<u8>>>,
    captured_stderr: Arc<StdMutex<Vec<u8>>>,
) -> OutputFrame {
    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..]);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    cmd.env_clear();
    cmd.envs(env.iter().cloned());
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => return exit_for_io_error(err),
    };

    let stdin = child.stdin.take();
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    let send = Arc::new(send);

    let stdout_handle = {
        let send = send.clone();
        let captured = captured_stdout.clone();
        tokio::spawn(async move {
            if let Some(stream) = stdout.as_mut() {
                let mut buf = [0u8; 8192];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let data = buf[..n].to_vec();
                            if let Ok(mut guard) = captured.lock() {
                                guard.extend_from_slice(&data);
                            }
                            send(OutputFrame::Stdout { data });
                        }
                    }
                }
            }
        })
    };

    let stderr_handle = {
        let send = send.clone();
        let captured = captured_stderr.clone();
        tokio::spawn(async move {
            if let Some(stream) = stderr.as_mut() {
                let mut buf = [0u8; 8192];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let data = buf[..n].to_vec();
                            if let Ok(mut guard) = captured.lock() {
                                guard.extend_from_slice(&data);
                            }
                            send(OutputFrame::Stderr { data });
                        }
                    }
                }
            }
        })
    };

    let stdin_slot: Arc<tokio::sync::Mutex<Option<tokio::process::ChildStdin>>> =
        Arc::new(tokio::sync::Mutex::new(stdin));
    let input_handle = {
        let stdin_slot = stdin_slot.clone();
        tokio::spawn(async move {
            while let Some(frame) = input_rx.recv().await {
                match frame {
                    InputFrame::Stdin { data } => {
                        let mut guard = stdin_slot.lock().await;
                        if let Some(stdin) = guard.as_mut() {
                            let _ = stdin.write_all(&data).await;
                            let _ = stdin.flush().await;
                        }
                    }
                    // A piped (non-TTY) child has no terminal dimensions.
                    InputFrame::Resize { .. } => {}
                    InputFrame::Eof => {
                        guard_eof(&stdin_slot).await;
                        break;
                    }
                }
            }
        })
    };

    let wait_result = child.wait().await;

    let _ = stdout_handle.await;
    let _ = stderr_handle.await;
    input_handle.abort();

    match wait_result {
        Ok(status) => OutputFrame::Exit {
            exit_code: status.code().unwrap_or(1),
            error: None,
        },
        Err(err) => exit_for_io_error(err),
    }
}

async fn guard_eof(stdin_slot: &Arc<tokio::sync::Mutex<Option<tokio::process::ChildStdin>>>) {
    let mut guard = stdin_slot.lock().await;
    guard.take();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn piped_echo_streams_stdout_and_exits_zero() {
        let (_tx, rx) = mpsc::channel(1);
        let frames = Arc::new(StdMutex::new(Vec::new()));
        let frames_for_send = frames.clone();
        let captured_out = Arc::new(StdMutex::new(Vec::new()));
        let captured_err = Arc::new(StdMutex::new(Vec::new()));
        let exit = run_piped(
            &["/bin/echo".to_string(), "hi".to_string()],
            None,
            &[],
            move |frame| frames_for_send.lock().unwrap_or_else(|e| e.into_inner()).push(frame),
            rx,
            captured_out.clone(),
            captured_err,
        )
        .await;

        match exit {
            OutputFrame::Exit { exit_code, .. } => assert_eq!(exit_code, 0),
            _ => panic!("expected exit frame"),
        }
        let captured = captured_out.lock().unwrap_or_else(|e| e.into_inner());
        assert_eq!(captured.as_slice(), b"hi\n");
    }

    #[tokio::test]
    async fn piped_stdin_is_forwarded_before_eof() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(InputFrame::Stdin {
            data: b"ping\n".to_vec(),
        })
        .await
        .expect("send stdin");
        tx.send(InputFrame::Eof).await.expect("send eof");
        drop(tx);

        let frames = Arc::new(StdMutex::new(Vec::new()));
        let frames_for_send = frames.clone();
        let captured_out = Arc::new(StdMutex::new(Vec::new()));
        let captured_err = Arc::new(StdMutex::new(Vec::new()));
        let exit = run_piped(
            &["/bin/cat".to_string()],
            None,
            &[],
            move |frame| frames_for_send.lock().unwrap_or_else(|e| e.into_inner()).push(frame),
            rx,
            captured_out.clone(),
            captured_err,
        )
        .await;

        match exit {
            OutputFrame::Exit { exit_code, .. } => assert_eq!(exit_code, 0),
            _ => panic!("expected exit frame"),
        }
        assert_eq!(captured_out.lock().unwrap_or_else(|e| e.into_inner()).as_slice(), b"ping\n");
    }
}
