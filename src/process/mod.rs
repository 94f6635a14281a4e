//! A spawned child wrapped as a streamable, cancellable, timeout-aware
//! process handle — the pipe/PTY duality described in spec.md §4.E.

mod pty;
mod stream;

pub use pty::PtyHandle;
pub use stream::{LineStream, OutputChunk, OutputStream, StreamName};

use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::time::timeout as tokio_timeout;

use crate::error::ProcessError;

/// `running -> exited(code) | killed_by_timeout | killed_by_caller`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(i32),
    KilledByTimeout,
    KilledByCaller,
}

enum Backend {
    Pipe {
        child: Child,
        stdin: Option<ChildStdin>,
    },
    Pty {
        pty: Arc<PtyHandle>,
    },
}

/// Wraps one spawned child. Constructed by [`crate::sandbox::Sandbox::run`];
/// not constructed directly by callers.
pub struct ProcessHandle {
    backend: Backend,
    pid: Option<u32>,
    default_timeout: Option<Duration>,
    state: Mutex<ProcessState>,
}

impl ProcessHandle {
    pub fn from_piped_child(
        mut child: Child,
        default_timeout: Option<Duration>,
    ) -> Self {
        let pid = child.id();
        let stdin = child.stdin.take();
        Self {
            backend: Backend::Pipe { child, stdin },
            pid,
            default_timeout,
            state: Mutex::new(ProcessState::Running),
        }
    }

    pub fn from_pty(pty: PtyHandle, default_timeout: Option<Duration>) -> Self {
        let pid = pty
            .child()
            .lock()
            .unwrap()
            .process_id();
        Self {
            backend: Backend::Pty {
                pty: Arc::new(pty),
            },
            pid,
            default_timeout,
            state: Mutex::new(ProcessState::Running),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn returncode(&self) -> Option<i32> {
        match *self.state.lock().unwrap() {
            ProcessState::Exited(code) => Some(code),
            ProcessState::KilledByTimeout | ProcessState::KilledByCaller => Some(-(Signal::SIGKILL as i32)),
            ProcessState::Running => None,
        }
    }

    pub fn master_fd_present(&self) -> bool {
        matches!(self.backend, Backend::Pty { .. })
    }

    fn resolve_timeout(&self, timeout: Option<Duration>) -> Option<Duration> {
        timeout.or(self.default_timeout)
    }

    async fn raw_wait(&mut self) -> io::Result<i32> {
        match &mut self.backend {
            Backend::Pipe { child, .. } => {
                let status = child.wait().await?;
                Ok(status.code().unwrap_or_else(|| signal_exit_code(&status)))
            }
            Backend::Pty { pty } => {
                let pty = pty.clone();
                tokio::task::spawn_blocking(move || {
                    let mut child = pty.child().lock().unwrap();
                    let status = child.wait()?;
                    Ok::<i32, io::Error>(if status.success() { 0 } else { 1 })
                })
                .await
                .map_err(io::Error::other)?
            }
        }
    }

    async fn hard_kill(&mut self) {
        match &mut self.backend {
            Backend::Pipe { child, .. } => {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            Backend::Pty { pty } => {
                let pty = pty.clone();
                let _ = tokio::task::spawn_blocking(move || {
                    let mut child = pty.child().lock().unwrap();
                    let _ = child.kill();
                    let _ = child.wait();
                })
                .await;
            }
        }
    }

    /// Waits for completion, applying `timeout` (or the default). On
    /// expiry the child is killed and awaited before `Timeout` surfaces.
    /// `check` converts a non-zero exit into `NonZeroExit`.
    pub async fn wait(&mut self, timeout: Option<Duration>, check: bool) -> Result<i32, ProcessError> {
        let effective = self.resolve_timeout(timeout);
        let code = match effective {
            None => self.raw_wait().await?,
            Some(d) => match tokio_timeout(d, self.raw_wait()).await {
                Ok(result) => result?,
                Err(_) => {
                    self.hard_kill().await;
                    *self.state.lock().unwrap() = ProcessState::KilledByTimeout;
                    return Err(ProcessError::Timeout(d));
                }
            },
        };
        *self.state.lock().unwrap() = ProcessState::Exited(code);
        if check && code != 0 {
            return Err(ProcessError::NonZeroExit(code));
        }
        Ok(code)
    }

    /// Writes optional input, drains both streams to EOF, then waits.
    pub async fn communicate(
        &mut self,
        input: Option<&[u8]>,
        timeout: Option<Duration>,
        check: bool,
    ) -> Result<(Vec<u8>, Vec<u8>), ProcessError> {
        let effective = self.resolve_timeout(timeout);
        let body = self.communicate_inner(input);
        let (stdout, stderr, code) = match effective {
            None => body.await?,
            Some(d) => match tokio_timeout(d, body).await {
                Ok(result) => result?,
                Err(_) => {
                    self.hard_kill().await;
                    *self.state.lock().unwrap() = ProcessState::KilledByTimeout;
                    return Err(ProcessError::Timeout(d));
                }
            },
        };
        *self.state.lock().unwrap() = ProcessState::Exited(code);
        if check && code != 0 {
            return Err(ProcessError::NonZeroExit(code));
        }
        Ok((stdout, stderr))
    }

    async fn communicate_inner(
        &mut self,
        input: Option<&[u8]>,
    ) -> Result<(Vec<u8>, Vec<u8>, i32), ProcessError> {
        if let Some(data) = input {
            self.send(data).await?;
        }
        self.close_stdin();

        match &mut self.backend {
            Backend::Pipe { child, .. } => {
                let mut stdout_buf = Vec::new();
                let mut stderr_buf = Vec::new();
                let stdout = child.stdout.take();
                let stderr = child.stderr.take();

                // Drain both pipes concurrently: a child that fills the stderr
                // buffer while stdout stays open would otherwise deadlock a
                // sequential read_to_end/read_to_end.
                let read_stdout = async {
                    if let Some(mut out) = stdout {
                        tokio::io::AsyncReadExt::read_to_end(&mut out, &mut stdout_buf).await?;
                    }
                    Ok::<(), io::Error>(())
                };
                let read_stderr = async {
                    if let Some(mut err) = stderr {
                        tokio::io::AsyncReadExt::read_to_end(&mut err, &mut stderr_buf).await?;
                    }
                    Ok::<(), io::Error>(())
                };
                let (out_result, err_result) = tokio::join!(read_stdout, read_stderr);
                out_result?;
                err_result?;

                let status = child.wait().await?;
                let code = status.code().unwrap_or_else(|| signal_exit_code(&status));
                Ok((stdout_buf, stderr_buf, code))
            }
            Backend::Pty { pty } => {
                let mut out = Vec::new();
                if let Some(mut rx) = pty.take_reader() {
                    while let Some(Some(chunk)) = rx.recv().await {
                        out.extend_from_slice(&chunk);
                    }
                }
                let pty = pty.clone();
                let code = tokio::task::spawn_blocking(move || {
                    let mut child = pty.child().lock().unwrap();
                    let status = child.wait()?;
                    Ok::<i32, io::Error>(if status.success() { 0 } else { 1 })
                })
                .await
                .map_err(io::Error::other)??;
                Ok((out, Vec::new(), code))
            }
        }
    }

    /// Writes to the PTY master (PTY mode) or stdin pipe (pipe mode).
    pub async fn send(&mut self, data: &[u8]) -> Result<(), ProcessError> {
        match &mut self.backend {
            Backend::Pipe { stdin, .. } => {
                let stdin = stdin.as_mut().ok_or(ProcessError::StdinUnavailable)?;
                stdin.write_all(data).await?;
                stdin.flush().await?;
                Ok(())
            }
            Backend::Pty { pty } => {
                pty.write(data)?;
                Ok(())
            }
        }
    }

    pub async fn send_text(&mut self, text: &str) -> Result<(), ProcessError> {
        self.send(text.as_bytes()).await
    }

    pub fn close_stdin(&mut self) {
        if let Backend::Pipe { stdin, .. } = &mut self.backend {
            *stdin = None;
        }
    }

    /// Lazily yields interleaved output chunks. In PTY mode every chunk is
    /// labeled [`StreamName::Stdout`].
    pub fn stream(&mut self, chunk_size: usize) -> Result<OutputStream, ProcessError> {
        match &mut self.backend {
            Backend::Pipe { child, .. } => {
                let stdout = child.stdout.take();
                let stderr = child.stderr.take();
                Ok(OutputStream::from_pipes(stdout, stderr, chunk_size))
            }
            Backend::Pty { pty } => {
                let rx = pty.take_reader().ok_or(ProcessError::NotPty)?;
                let (tx, labeled_rx) = tokio::sync::mpsc::channel(64);
                let mut rx = rx;
                tokio::spawn(async move {
                    while let Some(Some(chunk)) = rx.recv().await {
                        if tx
                            .send(OutputChunk {
                                stream: StreamName::Stdout,
                                data: chunk,
                            })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });
                Ok(OutputStream::from_single(labeled_rx))
            }
        }
    }

    pub fn stream_lines(&mut self) -> Result<LineStream, ProcessError> {
        Ok(LineStream::new(self.stream(4096)?))
    }

    pub fn set_terminal_size(&self, rows: u16, cols: u16) -> Result<(), ProcessError> {
        match &self.backend {
            Backend::Pty { pty } => pty.resize(rows, cols),
            Backend::Pipe { .. } => Err(ProcessError::NotPty),
        }
    }

    /// Drops the PTY master's writer, signalling EOF to the child's stdin
    /// side of the pty. Errors with `NotPty` in pipe mode.
    pub fn close_pty(&self) -> Result<(), ProcessError> {
        match &self.backend {
            Backend::Pty { pty } => {
                pty.close_writer();
                Ok(())
            }
            Backend::Pipe { .. } => Err(ProcessError::NotPty),
        }
    }

    pub fn terminate(&self) {
        if let Some(pid) = self.pid {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    pub fn kill(&self) {
        if let Some(pid) = self.pid {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }
}

fn signal_exit_code(status: &std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map(|s| 128 + s).unwrap_or(1)
    }
    #[cfg(not(unix))]
    {
        1
    }
}

/// Builds the `Stdio` configuration for pipe-mode spawns: stdin is piped iff
/// requested, stdout/stderr are always piped so `communicate`/`stream` work.
pub fn pipe_stdio(stdin_pipe: bool) -> (Stdio, Stdio, Stdio) {
    (
        if stdin_pipe { Stdio::piped() } else { Stdio::null() },
        Stdio::piped(),
        Stdio::piped(),
    )
}

pub fn spawn_piped(argv: &[String], stdin_pipe: bool) -> io::Result<Child> {
    let (stdin, stdout, stderr) = pipe_stdio(stdin_pipe);
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .stdin(stdin)
        .stdout(stdout)
        .stderr(stderr)
        .kill_on_drop(true);
    cmd.spawn()
}
