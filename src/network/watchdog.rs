//! The watchdog process: a minimal child whose sole purpose is to pin an
//! unprivileged user+network namespace by existing.

use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};

use crate::error::FabricError;

pub struct Watchdog {
    child: Child,
    pid: i32,
}

impl Watchdog {
    pub async fn spawn() -> Result<Self, FabricError> {
        if which::which("unshare").is_err() {
            return Err(FabricError::FabricToolMissing("unshare"));
        }
        let child = Command::new("unshare")
            .args([
                "--user",
                "--map-root-user",
                "--net",
                "--keep-caps",
                "sh",
                "-c",
                "sleep infinity",
            ])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| FabricError::LoopbackSetupFailed("watchdog exited immediately".into()))?
            as i32;
        Ok(Self { child, pid })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn user_ns_path(&self) -> PathBuf {
        PathBuf::from(format!("/proc/{}/ns/user", self.pid))
    }

    pub fn net_ns_path(&self) -> PathBuf {
        PathBuf::from(format!("/proc/{}/ns/net", self.pid))
    }

    /// Polls until both namespace paths exist and a credential-preserving
    /// `nsenter true` probe inside them succeeds.
    pub async fn await_ready(&mut self, timeout: Duration) -> Result<(), FabricError> {
        let deadline = Instant::now() + timeout;
        let mut last_error = String::new();

        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(FabricError::NamespaceTimeout(
                    timeout,
                    format!("watchdog exited before becoming ready: {status}"),
                ));
            }

            if !(self.user_ns_path().exists() && self.net_ns_path().exists()) {
                last_error = format!("namespace paths for pid {} not present yet", self.pid);
            } else {
                let probe = Command::new("nsenter")
                    .arg(format!("--user={}", self.user_ns_path().display()))
                    .arg(format!("--net={}", self.net_ns_path().display()))
                    .arg("--preserve-credentials")
                    .arg("--")
                    .arg("true")
                    .stdout(std::process::Stdio::null())
                    .stderr(std::process::Stdio::piped())
                    .output()
                    .await?;
                if probe.status.success() {
                    return Ok(());
                }
                last_error = String::from_utf8_lossy(&probe.stderr).trim().to_string();
            }

            if Instant::now() >= deadline {
                return Err(FabricError::NamespaceTimeout(timeout, last_error));
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn bring_loopback_up(&self) -> Result<(), FabricError> {
        let output = Command::new("nsenter")
            .arg(format!("--user={}", self.user_ns_path().display()))
            .arg(format!("--net={}", self.net_ns_path().display()))
            .arg("--preserve-credentials")
            .arg("--")
            .arg("ip")
            .arg("link")
            .arg("set")
            .arg("lo")
            .arg("up")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .output()
            .await?;
        if !output.status.success() {
            return Err(FabricError::LoopbackSetupFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    /// SIGTERM, wait up to 1s, then SIGKILL. Idempotent if already reaped.
    pub async fn terminate(&mut self) {
        let _ = signal::kill(Pid::from_raw(self.pid), Signal::SIGTERM);
        if tokio::time::timeout(Duration::from_secs(1), self.child.wait())
            .await
            .is_err()
        {
            let _ = signal::kill(Pid::from_raw(self.pid), Signal::SIGKILL);
            let _ = self.child.wait().await;
        }
    }
}
