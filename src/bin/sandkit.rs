//! Reference CLI reproducing spec.md §6's `run` / `rootfs` / `clear-cache`
//! surface on top of the `sandkit` library.

use std::io::IsTerminal;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use sandkit::network::{NetworkFabricOptions, Proto};
use sandkit::observability::init_tracing;
use sandkit::{Sandbox, SandboxOptions};

nix::ioctl_read_bad!(tiocgwinsz, nix::libc::TIOCGWINSZ, nix::libc::winsize);

/// Reads the host terminal's size via `TIOCGWINSZ` on stdin, falling back to
/// 24x80 when stdin isn't a TTY or the ioctl fails, per spec.md §4.F.
fn host_terminal_size() -> (u16, u16) {
    let mut ws: nix::libc::winsize = unsafe { std::mem::zeroed() };
    let fd = std::io::stdin().as_raw_fd();
    match unsafe { tiocgwinsz(fd, &mut ws) } {
        Ok(_) if ws.ws_row > 0 && ws.ws_col > 0 => (ws.ws_row, ws.ws_col),
        _ => (24, 80),
    }
}

#[derive(Parser)]
#[command(name = "sandkit", about = "Run commands inside unprivileged Linux sandboxes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command inside a fresh sandbox.
    Run {
        #[arg(long)]
        rootfs: Option<PathBuf>,
        #[arg(long = "work-dir")]
        work_dir: Option<PathBuf>,
        #[arg(long = "rootfs-path")]
        rootfs_path: Option<PathBuf>,
        #[arg(long = "rootfs-overlay")]
        rootfs_overlay: bool,
        #[arg(long = "rootfs-overlay-path")]
        rootfs_overlay_path: Option<PathBuf>,
        #[arg(long = "persist-overlayfs")]
        persist_overlayfs: bool,
        #[arg(long = "no-outbound")]
        no_outbound: bool,
        #[arg(long = "allow-host-loopback")]
        allow_host_loopback: bool,
        #[arg(long = "forward-port")]
        forward_port: Option<String>,
        #[arg(long = "share-net")]
        share_net: bool,
        #[arg(long = "net-share-pid")]
        net_share_pid: Option<u32>,
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Build a rootfs tarball from a Dockerfile via the external container builder.
    Rootfs {
        dockerfile: PathBuf,
        output: PathBuf,
        #[arg(long = "compress-level", default_value_t = 19)]
        compress_level: i32,
    },
    /// Remove the per-user rootfs cache.
    ClearCache,
}

const EXIT_ARG_ERROR: i32 = 1;
const EXIT_TIMEOUT: i32 = 124;

#[tokio::main]
async fn main() {
    let _ = init_tracing();
    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run { .. } => run_command(cli.command).await,
        Commands::Rootfs {
            dockerfile,
            output,
            compress_level,
        } => rootfs_command(&dockerfile, &output, compress_level).await,
        Commands::ClearCache => clear_cache_command(),
    };
    std::process::exit(code);
}

async fn run_command(command: Commands) -> i32 {
    let Commands::Run {
        rootfs,
        work_dir,
        rootfs_path,
        rootfs_overlay,
        rootfs_overlay_path,
        persist_overlayfs,
        no_outbound,
        allow_host_loopback,
        forward_port,
        share_net,
        net_share_pid,
        timeout,
        command,
    } = command
    else {
        unreachable!()
    };

    if net_share_pid.is_some() {
        eprintln!("Error: --net-share-pid is not supported by this build");
        return EXIT_ARG_ERROR;
    }
    if rootfs_overlay && persist_overlayfs && rootfs_overlay_path.is_none() {
        eprintln!("Error: --persist-overlayfs requires --rootfs-overlay-path");
        return EXIT_ARG_ERROR;
    }

    let archive_path = match rootfs.or(rootfs_path) {
        Some(p) => p,
        None => default_archive_path(),
    };

    let forward_specs = match forward_port.as_deref().map(parse_forward_port_spec) {
        Some(Ok(specs)) => specs,
        Some(Err(message)) => {
            eprintln!("Error: {message}");
            return EXIT_ARG_ERROR;
        }
        None => Vec::new(),
    };

    let mut opts = SandboxOptions::new(archive_path);
    opts.rootfs_target = rootfs_path;
    opts.overlay = rootfs_overlay;
    opts.overlay_path = rootfs_overlay_path;
    opts.persist_overlayfs = persist_overlayfs;
    opts.default_timeout = timeout.map(Duration::from_secs);
    opts.work_dir = work_dir;
    if share_net {
        opts.network = Some(NetworkFabricOptions {
            enable_outbound: !no_outbound,
            allow_host_loopback,
        });
    }

    let mut sandbox = match Sandbox::start(opts).await {
        Ok(s) => s,
        Err(err) => {
            eprintln!("Error: {err}");
            return EXIT_ARG_ERROR;
        }
    };

    for (guest, host) in &forward_specs {
        if let Err(err) = sandbox.forward_port(*guest, *host, Proto::Tcp).await {
            eprintln!("Error: {err}");
            sandbox.close().await;
            return EXIT_ARG_ERROR;
        }
    }

    let interactive = std::io::stdin().is_terminal();
    let pty_size = if interactive { Some(host_terminal_size()) } else { None };

    let mut handle = match sandbox.run(&command, pty_size).await {
        Ok(h) => h,
        Err(err) => {
            eprintln!("Error: {err}");
            sandbox.close().await;
            return EXIT_ARG_ERROR;
        }
    };

    let exit_code = if interactive {
        proxy_pty(&mut handle).await
    } else {
        run_piped(&mut handle).await
    };

    sandbox.close().await;
    exit_code
}

fn parse_forward_port_spec(spec: &str) -> Result<Vec<(u16, u16)>, String> {
    spec.split(',')
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (guest, host) = pair
                .split_once(':')
                .ok_or_else(|| format!("malformed forward-port entry: {pair}"))?;
            let guest: u16 = guest
                .parse()
                .map_err(|_| format!("malformed guest port: {guest}"))?;
            let host: u16 = host
                .parse()
                .map_err(|_| format!("malformed host port: {host}"))?;
            Ok((guest, host))
        })
        .collect()
}

fn default_archive_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.join("data").join("default.tar.zst")))
        .unwrap_or_else(|| PathBuf::from("data/default.tar.zst"))
}

/// Non-interactive path: drain stdout/stderr, then wait and propagate
/// timeouts as exit code 124 per spec.md §6.
async fn run_piped(handle: &mut sandkit::process::ProcessHandle) -> i32 {
    use std::io::Write;

    if let Ok(mut stream) = handle.stream(4096) {
        while let Some(chunk) = stream.next().await {
            match chunk.stream {
                sandkit::process::StreamName::Stdout => {
                    let _ = std::io::stdout().write_all(&chunk.data);
                }
                sandkit::process::StreamName::Stderr => {
                    let _ = std::io::stderr().write_all(&chunk.data);
                }
            }
        }
        let _ = std::io::stdout().flush();
    }

    match handle.wait(None, false).await {
        Ok(code) => code,
        Err(sandkit::error::ProcessError::Timeout(_)) => EXIT_TIMEOUT,
        Err(_) => EXIT_ARG_ERROR,
    }
}

/// Interactive path: raw-mode the terminal, forward stdin bytes to the PTY
/// and PTY bytes to stdout, resizing on `SIGWINCH`, until the child exits.
async fn proxy_pty(handle: &mut sandkit::process::ProcessHandle) -> i32 {
    use std::io::Write;

    let mut stream = match handle.stream(4096) {
        Ok(s) => s,
        Err(_) => return EXIT_ARG_ERROR,
    };

    let mut sigwinch = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change()) {
        Ok(s) => s,
        Err(_) => return EXIT_ARG_ERROR,
    };

    let (stdin_tx, mut stdin_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(16);
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match std::io::Read::read(&mut stdin, &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        tokio::select! {
            chunk = stream.next() => {
                match chunk {
                    Some(c) => {
                        let _ = std::io::stdout().write_all(&c.data);
                        let _ = std::io::stdout().flush();
                    }
                    None => break,
                }
            }
            input = stdin_rx.recv() => {
                match input {
                    Some(bytes) => { let _ = handle.send(&bytes).await; }
                    None => {}
                }
            }
            _ = sigwinch.recv() => {
                let (rows, cols) = host_terminal_size();
                let _ = handle.set_terminal_size(rows, cols);
            }
        }
    }

    match handle.wait(None, false).await {
        Ok(code) => code,
        Err(sandkit::error::ProcessError::Timeout(_)) => EXIT_TIMEOUT,
        Err(_) => EXIT_ARG_ERROR,
    }
}

/// Shells out to the container-builder pipeline (`docker build` + `docker
/// export` piped into `zstd`), matching spec.md §1's non-goal of
/// reimplementing an image builder.
async fn rootfs_command(dockerfile: &std::path::Path, output: &std::path::Path, compress_level: i32) -> i32 {
    let tag = format!("sandkit-rootfs-{}", uuid::Uuid::new_v4());
    let build = tokio::process::Command::new("docker")
        .args(["build", "-f"])
        .arg(dockerfile)
        .args(["-t", &tag])
        .arg(dockerfile.parent().unwrap_or(std::path::Path::new(".")))
        .status()
        .await;
    if !matches!(build, Ok(status) if status.success()) {
        eprintln!("Error: docker build failed");
        return EXIT_ARG_ERROR;
    }

    let container_name = format!("sandkit-export-{}", uuid::Uuid::new_v4());
    let create = tokio::process::Command::new("docker")
        .args(["create", "--name", &container_name, &tag])
        .status()
        .await;
    if !matches!(create, Ok(status) if status.success()) {
        eprintln!("Error: docker create failed");
        return EXIT_ARG_ERROR;
    }

    let export_result = (async {
        let export_output = tokio::process::Command::new("docker")
            .args(["export", &container_name])
            .output()
            .await?;
        let mut out_file = std::fs::File::create(output)?;
        let mut encoder =
            zstd::stream::write::Encoder::new(&mut out_file, compress_level)?.auto_finish();
        std::io::Write::write_all(&mut encoder, &export_output.stdout)?;
        Ok::<(), std::io::Error>(())
    })
    .await;

    let _ = tokio::process::Command::new("docker")
        .args(["rm", "-f", &container_name])
        .status()
        .await;

    if let Err(err) = export_result {
        eprintln!("Error: {err}");
        return EXIT_ARG_ERROR;
    }
    0
}

fn clear_cache_command() -> i32 {
    match sandkit::archive::ArchiveStore::clear_cache() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {err}");
            EXIT_ARG_ERROR
        }
    }
}
