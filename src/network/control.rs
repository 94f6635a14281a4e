//! JSON-line control protocol client for the user-mode NAT's API socket.

use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::{sleep, Instant};

use crate::error::FabricError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
}

impl Proto {
    fn as_str(self) -> &'static str {
        match self {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
        }
    }
}

#[derive(Serialize)]
struct HostFwdArgs {
    proto: &'static str,
    host_addr: &'static str,
    host_port: u16,
    guest_addr: &'static str,
    guest_port: u16,
}

#[derive(Serialize)]
struct HostFwdRequest {
    execute: &'static str,
    arguments: HostFwdArgs,
}

/// Connects to the control socket, retrying with a fixed backoff bounded by
/// `timeout`. Fails fast if `still_running` reports the NAT process exited.
async fn connect(
    socket_path: &Path,
    timeout: Duration,
    mut still_running: impl FnMut() -> bool,
) -> Result<UnixStream, FabricError> {
    let deadline = Instant::now() + timeout;
    let mut last_error = "API socket not ready yet".to_string();
    let mut backoff = Duration::from_millis(5);
    const MAX_BACKOFF: Duration = Duration::from_millis(100);

    loop {
        if !still_running() {
            return Err(FabricError::NatExitedEarly);
        }
        match UnixStream::connect(socket_path).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = e.to_string(),
        }
        if Instant::now() >= deadline {
            return Err(FabricError::ControlSocketTimeout(last_error));
        }
        sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Writes `{"execute":"add_hostfwd","arguments":{...}}\n` and parses the
/// newline-terminated JSON reply, returned verbatim to the caller.
pub async fn add_hostfwd(
    socket_path: &Path,
    proto: Proto,
    guest_port: u16,
    host_port: u16,
    still_running: impl FnMut() -> bool,
) -> Result<serde_json::Value, FabricError> {
    let mut stream = connect(socket_path, Duration::from_secs(1), still_running).await?;

    let request = HostFwdRequest {
        execute: "add_hostfwd",
        arguments: HostFwdArgs {
            proto: proto.as_str(),
            host_addr: "127.0.0.1",
            host_port,
            guest_addr: "10.0.2.100",
            guest_port,
        },
    };
    let mut line = serde_json::to_string(&request)
        .map_err(|e| FabricError::ControlProtocolError(e.to_string()))?;
    line.push('\n');
    stream.write_all(line.as_bytes()).await?;

    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await?;
    serde_json::from_slice(&buf[..n]).map_err(|e| FabricError::ControlProtocolError(e.to_string()))
}
