//! Typed error taxonomy for the sandbox lifecycle engine.
//!
//! Each component owns one error enum; `SandboxError` wraps them via `#[from]`
//! so façade-level callers can match on a single type while still being able
//! to downcast to the component that raised it.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("rootfs tarball not found: {0}")]
    ArchiveNotFound(PathBuf),
    #[error("unsafe path in tarball: {0}")]
    UnsafeMember(String),
    #[error("failed to decompress tarball: {0}")]
    DecompressionFailed(String),
    #[error("unrecognized archive suffix: {0}")]
    UnknownCodec(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("fuse-overlayfs was not found on PATH")]
    OverlayToolMissing,
    #[error("persist_overlayfs requires an explicit overlay root")]
    PersistRequiresPath,
    #[error("failed to mount overlay: {0}")]
    MountFailed(String),
    #[error("failed to unmount overlay: {0}")]
    UnmountFailed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("{0} was not found on PATH")]
    FabricToolMissing(&'static str),
    #[error("network namespace was not ready within {0:?}: {1}")]
    NamespaceTimeout(std::time::Duration, String),
    #[error("failed to bring loopback interface up: {0}")]
    LoopbackSetupFailed(String),
    #[error("user-mode NAT exited before the control socket became ready")]
    NatExitedEarly,
    #[error("timed out waiting for the NAT control socket: {0}")]
    ControlSocketTimeout(String),
    #[error("port forwarding requires outbound networking to be enabled")]
    OutboundNotEnabled,
    #[error("malformed control protocol response: {0}")]
    ControlProtocolError(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("operation exceeded {0:?}")]
    Timeout(std::time::Duration),
    #[error("command exited with status {0}")]
    NonZeroExit(i32),
    #[error("stdin is not available for this process")]
    StdinUnavailable,
    #[error("the process is not running in PTY mode")]
    NotPty,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("{0} was not found on PATH")]
    LauncherMissing(&'static str),
    #[error("PTY mode cannot be combined with explicit pipe flags")]
    PtyWithPipes,
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Overlay(#[from] OverlayError),
    #[error(transparent)]
    Fabric(#[from] FabricError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = SandboxError> = std::result::Result<T, E>;
