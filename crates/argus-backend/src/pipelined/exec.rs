//! Handler dispatch: pipe subprocesses and TCP/UDP sockets.
//!
//! Pipe handlers receive the mutated payload on stdin and run under a
//! wall-clock deadline: SIGTERM at the deadline, SIGKILL if the process
//! lingers past the kill delay. Stderr is captured for the log and a
//! non-zero exit is a non-fatal, counted error. Socket handlers dial with
//! a connect timeout and write with the handler timeout; TCP writes are
//! retried once.

use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::process::{Child, Command};
use tracing::debug;

use argus_core::handler::HandlerSocket;

/// Environment variable exposing the backend host to handler processes.
pub const BACKEND_HOST_ENV: &str = "ARGUS_BACKEND_HOST";

/// Grace between SIGTERM and SIGKILL for timed-out handlers.
const KILL_DELAY: Duration = Duration::from_secs(2);

/// Timeout used to establish socket connections.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Handler execution failure.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The subprocess could not be spawned.
    #[error("spawn failed: {0}")]
    Spawn(std::io::Error),

    /// The payload could not be written to the subprocess or socket.
    #[error("payload write failed: {0}")]
    Write(std::io::Error),

    /// The wall-clock deadline passed.
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// The subprocess exited non-zero (non-fatal; logged and counted).
    #[error("command exited with status {code}")]
    NonZeroExit {
        /// Exit code, or -1 when killed by signal.
        code: i32,
    },

    /// The socket endpoint could not be reached.
    #[error("connect to {endpoint} failed: {reason}")]
    Connect {
        /// `host:port` dialed.
        endpoint: String,
        /// Diagnostic.
        reason: String,
    },
}

/// Output of a completed piped command.
#[derive(Debug)]
pub struct CommandOutput {
    /// Exit code (-1 when terminated by signal).
    pub code: i32,
    /// Captured stdout.
    pub stdout: Vec<u8>,
    /// Captured stderr.
    pub stderr: Vec<u8>,
}

/// Runs `sh -c command` with the payload on stdin, bounded by `timeout`.
///
/// # Errors
///
/// Returns [`ExecError::Timeout`] after SIGTERM/SIGKILL cleanup when the
/// deadline passes, or [`ExecError::Spawn`]/[`ExecError::Write`] on setup
/// failures. A non-zero exit is NOT an error here; callers inspect
/// [`CommandOutput::code`].
pub async fn run_piped_command(
    command: &str,
    backend_host: &str,
    payload: &[u8],
    timeout: Duration,
) -> Result<CommandOutput, ExecError> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .env(BACKEND_HOST_ENV, backend_host)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(ExecError::Spawn)?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(payload).await.map_err(ExecError::Write)?;
        stdin.shutdown().await.map_err(ExecError::Write)?;
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_task = tokio::spawn(read_all(stdout));
    let stderr_task = tokio::spawn(read_all(stderr));

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => return Err(ExecError::Spawn(err)),
        Err(_) => {
            terminate(&mut child).await;
            return Err(ExecError::Timeout(timeout));
        }
    };

    Ok(CommandOutput {
        code: status.code().unwrap_or(-1),
        stdout: stdout_task.await.unwrap_or_default(),
        stderr: stderr_task.await.unwrap_or_default(),
    })
}

async fn read_all(pipe: Option<impl tokio::io::AsyncRead + Unpin>) -> Vec<u8> {
    use tokio::io::AsyncReadExt;
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

/// SIGTERM, a short grace, then SIGKILL.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        #[allow(clippy::cast_possible_wrap)] // PIDs fit in i32
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    if tokio::time::timeout(KILL_DELAY, child.wait()).await.is_err() {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

/// Dispatches to a pipe handler and maps the exit status.
///
/// # Errors
///
/// See [`run_piped_command`]; additionally maps a non-zero exit to
/// [`ExecError::NonZeroExit`].
pub async fn dispatch_pipe(
    command: &str,
    backend_host: &str,
    payload: &[u8],
    timeout: Duration,
) -> Result<(), ExecError> {
    let output = run_piped_command(command, backend_host, payload, timeout).await?;
    if !output.stderr.is_empty() {
        debug!(
            command,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "handler stderr"
        );
    }
    if output.code != 0 {
        return Err(ExecError::NonZeroExit { code: output.code });
    }
    Ok(())
}

/// Writes the payload to a TCP endpoint, retrying the write once.
///
/// # Errors
///
/// Returns [`ExecError::Connect`] when the endpoint is unreachable and
/// [`ExecError::Write`]/[`ExecError::Timeout`] on write failures after
/// the retry.
pub async fn dispatch_tcp(
    socket: &HandlerSocket,
    payload: &[u8],
    write_timeout: Duration,
) -> Result<(), ExecError> {
    let endpoint = format!("{}:{}", socket.host, socket.port);
    let mut last_err = None;
    for attempt in 0..2 {
        match try_tcp_write(&endpoint, payload, write_timeout).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                if attempt == 0 {
                    debug!(endpoint = %endpoint, error = %err, "tcp write failed, retrying once");
                }
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or(ExecError::Timeout(write_timeout)))
}

async fn try_tcp_write(
    endpoint: &str,
    payload: &[u8],
    write_timeout: Duration,
) -> Result<(), ExecError> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(endpoint))
        .await
        .map_err(|_| ExecError::Connect {
            endpoint: endpoint.to_string(),
            reason: "connect timed out".to_string(),
        })?
        .map_err(|err| ExecError::Connect {
            endpoint: endpoint.to_string(),
            reason: err.to_string(),
        })?;
    let mut stream = stream;
    match tokio::time::timeout(write_timeout, async {
        stream.write_all(payload).await?;
        stream.shutdown().await
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(ExecError::Write(err)),
        Err(_) => Err(ExecError::Timeout(write_timeout)),
    }
}

/// Sends the payload as a single UDP datagram.
///
/// # Errors
///
/// Returns [`ExecError::Connect`] when the socket cannot be set up and
/// [`ExecError::Write`] when the send fails.
pub async fn dispatch_udp(socket: &HandlerSocket, payload: &[u8]) -> Result<(), ExecError> {
    let endpoint = format!("{}:{}", socket.host, socket.port);
    let local = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|err| ExecError::Connect {
            endpoint: endpoint.clone(),
            reason: err.to_string(),
        })?;
    local
        .send_to(payload, &endpoint)
        .await
        .map_err(ExecError::Write)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn pipe_receives_payload_on_stdin() {
        let output = run_piped_command("cat", "localhost", b"hello", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.code, 0);
        assert_eq!(output.stdout, b"hello");
    }

    #[tokio::test]
    async fn pipe_exposes_backend_host() {
        let output = run_piped_command(
            "printf '%s' \"$ARGUS_BACKEND_HOST\"",
            "backend01",
            b"",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(output.stdout, b"backend01");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let err = dispatch_pipe("exit 3", "localhost", b"", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::NonZeroExit { code: 3 }));
    }

    #[tokio::test]
    async fn timed_out_pipe_is_killed() {
        let started = std::time::Instant::now();
        let err = dispatch_pipe("sleep 30", "localhost", b"", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));
        // SIGTERM lands well before the sleep would finish.
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn tcp_dispatch_writes_payload() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let socket = HandlerSocket {
            host: addr.ip().to_string(),
            port: addr.port(),
        };
        dispatch_tcp(&socket, b"{\"status\":2}", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(server.await.unwrap(), b"{\"status\":2}");
    }

    #[tokio::test]
    async fn tcp_dispatch_fails_on_unreachable_endpoint() {
        let socket = HandlerSocket {
            host: "127.0.0.1".to_string(),
            // A listener that was just closed.
            port: {
                let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let port = l.local_addr().unwrap().port();
                drop(l);
                port
            },
        };
        let err = dispatch_tcp(&socket, b"x", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Connect { .. }));
    }

    #[tokio::test]
    async fn udp_dispatch_sends_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();
        let socket = HandlerSocket {
            host: addr.ip().to_string(),
            port: addr.port(),
        };
        dispatch_udp(&socket, b"metric 1").await.unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"metric 1");
    }
}
