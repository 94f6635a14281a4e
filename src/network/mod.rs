//! Unprivileged network namespace pinned by a watchdog, with an optional
//! user-mode NAT providing outbound connectivity and dynamic port-forwarding.

mod control;
mod watchdog;

pub use control::Proto;

use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::process::{Child, Command};
use tokio::time::timeout;

use crate::error::FabricError;
use watchdog::Watchdog;

const NAMESPACE_READY_TIMEOUT: Duration = Duration::from_millis(500);

pub struct NetworkFabricOptions {
    pub enable_outbound: bool,
    pub allow_host_loopback: bool,
}

impl Default for NetworkFabricOptions {
    fn default() -> Self {
        Self {
            enable_outbound: false,
            allow_host_loopback: false,
        }
    }
}

/// `down -> namespace_ready -> outbound_ready (optional)`.
pub struct NetworkFabric {
    watchdog: Watchdog,
    hosts_file: NamedTempFile,
    resolv_file: Option<NamedTempFile>,
    outbound_bridge: Option<Child>,
    control_socket: Option<NamedTempFile>,
}

impl NetworkFabric {
    pub async fn start(opts: NetworkFabricOptions) -> Result<Self, FabricError> {
        let mut watchdog = Watchdog::spawn().await?;
        watchdog.await_ready(NAMESPACE_READY_TIMEOUT).await?;
        watchdog.bring_loopback_up().await?;

        let mut hosts_file = NamedTempFile::new_in("/tmp")?;
        {
            use std::io::Write;
            hosts_file.write_all(b"127.0.0.1 localhost\n::1 localhost\n127.0.1.1 sandbox\n")?;
            hosts_file.flush()?;
        }

        let mut fabric = Self {
            watchdog,
            hosts_file,
            resolv_file: None,
            outbound_bridge: None,
            control_socket: None,
        };

        if opts.enable_outbound {
            if which::which("slirp4netns").is_err() {
                return Err(FabricError::FabricToolMissing("slirp4netns"));
            }

            let control_socket = tempfile::Builder::new()
                .suffix(".sock")
                .tempfile_in("/tmp")?;
            let socket_path = control_socket.path().to_path_buf();
            // slirp4netns creates the socket itself; remove our placeholder first.
            drop(std::fs::remove_file(&socket_path));

            let mut args = vec!["--api-socket".to_string(), socket_path.display().to_string()];
            if !opts.allow_host_loopback {
                args.push("--disable-host-loopback".to_string());
            }
            args.push("--configure".to_string());
            args.push(fabric.watchdog.pid().to_string());
            args.push("tap0".to_string());

            let bridge = Command::new("slirp4netns")
                .args(&args)
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .kill_on_drop(true)
                .spawn()?;

            let mut resolv_file = NamedTempFile::new_in("/tmp")?;
            {
                use std::io::Write;
                resolv_file.write_all(b"nameserver 8.8.8.8\nnameserver 8.8.4.4\n")?;
                resolv_file.flush()?;
            }

            fabric.outbound_bridge = Some(bridge);
            fabric.resolv_file = Some(resolv_file);
            fabric.control_socket = Some(control_socket);
        }

        Ok(fabric)
    }

    /// Prepends `nsenter --user=... --net=... --preserve-credentials --` so
    /// `command` executes inside the fabric's namespaces.
    pub fn wrap(&self, command: &[String]) -> Vec<String> {
        let mut argv = vec![
            "nsenter".to_string(),
            format!("--user=/proc/{}/ns/user", self.watchdog.pid()),
            format!("--net=/proc/{}/ns/net", self.watchdog.pid()),
            "--preserve-credentials".to_string(),
            "--".to_string(),
        ];
        argv.extend(command.iter().cloned());
        argv
    }

    /// Launcher flags binding the hosts file (and resolv file, if outbound
    /// is enabled), sharing the namespace, and granting `CAP_NET_RAW`.
    pub fn bind_args(&self) -> Vec<String> {
        let mut args = vec![
            "--ro-bind".to_string(),
            self.hosts_file.path().display().to_string(),
            "/etc/hosts".to_string(),
            "--share-net".to_string(),
            "--cap-add".to_string(),
            "CAP_NET_RAW".to_string(),
        ];
        if let Some(resolv) = &self.resolv_file {
            args.push("--ro-bind".to_string());
            args.push(resolv.path().display().to_string());
            args.push("/etc/resolv.conf".to_string());
        }
        args
    }

    pub async fn forward_port(
        &mut self,
        guest_port: u16,
        host_port: u16,
        proto: Proto,
    ) -> Result<serde_json::Value, FabricError> {
        let socket_path = self
            .control_socket
            .as_ref()
            .ok_or(FabricError::OutboundNotEnabled)?
            .path()
            .to_path_buf();
        let bridge = self
            .outbound_bridge
            .as_mut()
            .ok_or(FabricError::OutboundNotEnabled)?;
        control::add_hostfwd(&socket_path, proto, guest_port, host_port, || {
            bridge.try_wait().ok().flatten().is_none()
        })
        .await
    }

    /// Terminates the NAT (if any), then the watchdog, then removes temp
    /// files. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut bridge) = self.outbound_bridge.take() {
            if let Some(pid) = bridge.id() {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGTERM,
                );
            }
            if timeout(Duration::from_secs(1), bridge.wait()).await.is_err() {
                let _ = bridge.kill().await;
            }
        }
        self.watchdog.terminate().await;
        self.control_socket = None;
        self.resolv_file = None;
    }
}
