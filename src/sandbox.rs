//! The façade composing archive/overlay/network/process into one sandbox
//! lifecycle per invocation, per spec.md §4.F.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, instrument};

use crate::archive::ArchiveStore;
use crate::assembler::{self, LaunchPlan};
use crate::error::SandboxError;
use crate::network::{NetworkFabric, NetworkFabricOptions, Proto};
use crate::overlay::OverlaySet;
use crate::process::{spawn_piped, PtyHandle, ProcessHandle};

/// Construction-time configuration for a [`Sandbox`]. Mirrors the original's
/// constructor keyword arguments — there is no external config-file format.
pub struct SandboxOptions {
    pub archive_path: PathBuf,
    pub rootfs_target: Option<PathBuf>,
    pub overlay: bool,
    pub overlay_path: Option<PathBuf>,
    pub persist_overlayfs: bool,
    pub network: Option<NetworkFabricOptions>,
    pub uid: u32,
    pub user: String,
    pub hostname: String,
    pub env: Vec<(String, String)>,
    pub default_timeout: Option<Duration>,
    /// When set, the work directory is the caller's and survives `close()`.
    /// When unset, an engine-created temp directory is used and removed on
    /// `close()`, per spec.md §8's work-dir persistence invariant.
    pub work_dir: Option<PathBuf>,
}

impl SandboxOptions {
    pub fn new(archive_path: impl AsRef<Path>) -> Self {
        Self {
            archive_path: archive_path.as_ref().to_path_buf(),
            rootfs_target: None,
            overlay: false,
            overlay_path: None,
            persist_overlayfs: false,
            network: None,
            uid: 1000,
            user: "sandbox".to_string(),
            hostname: "sandbox".to_string(),
            env: Vec::new(),
            default_timeout: None,
            work_dir: None,
        }
    }
}

/// Either an engine-owned temp directory (removed on close) or a
/// caller-supplied path (left untouched on close).
enum WorkDir {
    Owned(tempfile::TempDir),
    External(PathBuf),
}

impl WorkDir {
    fn path(&self) -> &Path {
        match self {
            WorkDir::Owned(dir) => dir.path(),
            WorkDir::External(path) => path,
        }
    }
}

fn check_tool(name: &'static str) -> Result<(), SandboxError> {
    which::which(name)
        .map(|_| ())
        .map_err(|_| SandboxError::LauncherMissing(name))
}

/// One sandbox instance: a prepared rootfs, an optional overlay, an optional
/// network fabric, and the scratch directories command invocations bind.
pub struct Sandbox {
    opts: SandboxOptions,
    rootfs_root: PathBuf,
    overlay: Option<OverlaySet>,
    network: Option<NetworkFabric>,
    work_dir: Option<WorkDir>,
    work_dir_path: PathBuf,
    scratch_tmp: Option<tempfile::TempDir>,
    scratch_tmp_path: PathBuf,
    closed: bool,
}

impl Sandbox {
    /// Validates preconditions, extracts the rootfs, optionally mounts the
    /// overlay and starts the network fabric. No command has run yet.
    #[instrument(skip(opts))]
    pub async fn start(opts: SandboxOptions) -> Result<Self, SandboxError> {
        check_tool("bwrap")?;
        if opts.overlay {
            check_tool("fuse-overlayfs")?;
            if opts.persist_overlayfs && opts.overlay_path.is_none() {
                return Err(SandboxError::Overlay(
                    crate::error::OverlayError::PersistRequiresPath,
                ));
            }
        }
        if let Some(net_opts) = &opts.network {
            if net_opts.enable_outbound {
                check_tool("slirp4netns")?;
            }
        }

        let extracted = ArchiveStore::prepare(&opts.archive_path, opts.rootfs_target.as_deref())?;

        let overlay = if opts.overlay {
            let overlay_root = match &opts.overlay_path {
                Some(path) => path.clone(),
                None => tempfile::Builder::new()
                    .prefix("sandkit-overlay-")
                    .tempdir()?
                    .into_path(),
            };
            std::fs::create_dir_all(&overlay_root)?;
            Some(OverlaySet::mount(&extracted, &overlay_root, opts.persist_overlayfs)?)
        } else {
            None
        };

        let rootfs_root = overlay
            .as_ref()
            .map(|o| o.mount_dir.clone())
            .unwrap_or_else(|| extracted.clone());

        let network = match &opts.network {
            Some(net_opts) => Some(
                NetworkFabric::start(NetworkFabricOptions {
                    enable_outbound: net_opts.enable_outbound,
                    allow_host_loopback: net_opts.allow_host_loopback,
                })
                .await?,
            ),
            None => None,
        };

        let work_dir = match &opts.work_dir {
            Some(path) => {
                std::fs::create_dir_all(path)?;
                WorkDir::External(path.clone())
            }
            None => WorkDir::Owned(tempfile::Builder::new().prefix("sandkit-work-").tempdir()?),
        };
        let scratch_tmp = tempfile::Builder::new().prefix("sandkit-tmp-").tempdir()?;

        info!(
            rootfs = %rootfs_root.display(),
            overlay = opts.overlay,
            network = opts.network.is_some(),
            "sandbox started"
        );

        let work_dir_path = work_dir.path().to_path_buf();
        let scratch_tmp_path = scratch_tmp.path().to_path_buf();

        Ok(Self {
            opts,
            rootfs_root,
            overlay,
            network,
            work_dir: Some(work_dir),
            work_dir_path,
            scratch_tmp: Some(scratch_tmp),
            scratch_tmp_path,
            closed: false,
        })
    }

    fn build_plan<'a>(&'a self, command: &'a [String], use_pty: bool) -> LaunchPlan<'a> {
        LaunchPlan {
            rootfs_root: &self.rootfs_root,
            overlay: self.opts.overlay,
            work_dir: &self.work_dir_path,
            scratch_tmp: &self.scratch_tmp_path,
            uid: self.opts.uid,
            hostname: &self.opts.hostname,
            user: &self.opts.user,
            env: &self.opts.env,
            network_bind_args: self.network.as_ref().map(|n| n.bind_args()),
            use_pty,
            command,
        }
    }

    /// Runs `command` (argv form, e.g. `["bash", "-c", "echo hi"]`) inside a
    /// fresh bwrap sandbox. `pty` mutually excludes any non-interactive pipe
    /// usage per spec.md's PTY/`--new-session` invariant.
    #[instrument(skip(self, command))]
    pub async fn run(
        &self,
        command: &[String],
        pty: Option<(u16, u16)>,
    ) -> Result<ProcessHandle, SandboxError> {
        let plan = self.build_plan(command, pty.is_some());
        let argv = assembler::build_argv(&plan);
        let argv = match &self.network {
            Some(net) => net.wrap(&argv),
            None => argv,
        };

        match pty {
            Some((rows, cols)) => {
                let pty_handle = PtyHandle::spawn(&argv, rows, cols)?;
                Ok(ProcessHandle::from_pty(pty_handle, self.opts.default_timeout))
            }
            None => {
                let child = spawn_piped(&argv, true)?;
                Ok(ProcessHandle::from_piped_child(child, self.opts.default_timeout))
            }
        }
    }

    /// Writes `code` to a randomly named file under the scratch tmp dir and
    /// runs `<run_command> /tmp/script_<uuid>.<extension>`.
    pub async fn run_script(
        &self,
        code: &str,
        run_command: &[String],
        extension: &str,
        pty: Option<(u16, u16)>,
    ) -> Result<ProcessHandle, SandboxError> {
        let filename = format!("script_{}.{}", uuid::Uuid::new_v4(), extension);
        let host_path = self.scratch_tmp_path.join(&filename);
        std::fs::write(&host_path, code)?;

        let mut command: Vec<String> = run_command.to_vec();
        command.push(format!("/tmp/{filename}"));
        self.run(&command, pty).await
    }

    pub async fn forward_port(
        &mut self,
        guest_port: u16,
        host_port: u16,
        proto: Proto,
    ) -> Result<serde_json::Value, SandboxError> {
        let network = self
            .network
            .as_mut()
            .ok_or(crate::error::FabricError::OutboundNotEnabled)?;
        Ok(network.forward_port(guest_port, host_port, proto).await?)
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir_path
    }

    /// Tears down network, overlay, then temp directories, in reverse order
    /// of construction. Idempotent; safe to call more than once. An
    /// engine-owned work directory is removed; a caller-supplied one is left
    /// untouched, per spec.md §8's work-dir persistence invariant.
    #[instrument(skip(self))]
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(network) = self.network.as_mut() {
            network.close().await;
        }
        if let Some(overlay) = self.overlay.take() {
            if let Err(err) = overlay.unmount() {
                tracing::warn!(error = %err, "failed to unmount overlay during close");
            }
        }
        if let Some(WorkDir::Owned(dir)) = self.work_dir.take() {
            if let Err(err) = dir.close() {
                tracing::warn!(error = %err, "failed to remove owned work directory during close");
            }
        }
        if let Some(dir) = self.scratch_tmp.take() {
            if let Err(err) = dir.close() {
                tracing::warn!(error = %err, "failed to remove scratch tmp directory during close");
            }
        }
        info!("sandbox closed");
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if !self.closed {
            if let Some(overlay) = self.overlay.take() {
                let _ = overlay.unmount();
            }
            tracing::warn!("sandbox dropped without calling close(); network fabric teardown was skipped");
        }
    }
}
