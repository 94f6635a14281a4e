//! `sandkit`: a sandbox lifecycle engine for running untrusted shell commands
//! and scripts in lightweight, unprivileged Linux sandboxes.
//!
//! The crate composes a handful of pre-existing OS tools — `bwrap`
//! (isolation launcher), `fuse-overlayfs` (writable overlay), and
//! `slirp4netns` (user-mode NAT) — into a reusable lifecycle:
//!
//!   - [`archive`] extracts a compressed rootfs tarball into a content-addressed cache.
//!   - [`overlay`] stacks a writable upper layer over that rootfs.
//!   - [`network`] pins an unprivileged user+net namespace and optionally attaches
//!     outbound NAT with dynamic port-forwarding.
//!   - [`process`] wraps a spawned child with timeout-aware wait/communicate/stream.
//!   - [`sandbox`] is the façade tying the above together per invocation.
//!
//! Library code never installs a global `tracing` subscriber; call
//! [`observability::init_tracing`] from a binary's `main` if you want logs.

pub mod archive;
pub mod error;
pub mod network;
pub mod observability;
pub mod overlay;
pub mod process;
pub mod sandbox;

mod assembler;

pub use error::{Result, SandboxError};
pub use sandbox::{Sandbox, SandboxOptions};
