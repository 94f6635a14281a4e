//! Builds the `bwrap` argv for one sandboxed command, per spec.md §4.D.

use std::path::Path;

/// Everything the assembler needs to know about one launch, already decided
/// by [`crate::sandbox::Sandbox`] (PATH lookups, overlay-vs-plain rootfs
/// choice, network bind args) before the argv is built.
pub struct LaunchPlan<'a> {
    pub rootfs_root: &'a Path,
    pub overlay: bool,
    pub work_dir: &'a Path,
    pub scratch_tmp: &'a Path,
    pub uid: u32,
    pub hostname: &'a str,
    pub user: &'a str,
    pub env: &'a [(String, String)],
    pub network_bind_args: Option<Vec<String>>,
    pub use_pty: bool,
    pub command: &'a [String],
}

const BWRAP: &str = "bwrap";

/// Assembles the full `bwrap` argv (including the leading `bwrap` itself),
/// ready to hand to [`crate::process::spawn_piped`] or a PTY spawn.
pub fn build_argv(plan: &LaunchPlan) -> Vec<String> {
    let mut argv = vec![BWRAP.to_string()];

    argv.push("--unshare-all".to_string());
    argv.push("--die-with-parent".to_string());
    argv.push("--uid".to_string());
    argv.push(plan.uid.to_string());
    argv.push("--hostname".to_string());
    argv.push(plan.hostname.to_string());

    if plan.overlay {
        argv.push("--bind".to_string());
    } else {
        argv.push("--ro-bind".to_string());
    }
    argv.push(plan.rootfs_root.display().to_string());
    argv.push("/".to_string());

    let home_dir = if plan.user == "root" {
        "/root".to_string()
    } else {
        format!("/home/{}", plan.user)
    };
    argv.push("--bind".to_string());
    argv.push(plan.work_dir.display().to_string());
    argv.push(home_dir.clone());

    argv.push("--dev".to_string());
    argv.push("/dev".to_string());
    argv.push("--proc".to_string());
    argv.push("/proc".to_string());

    argv.push("--bind".to_string());
    argv.push(plan.scratch_tmp.display().to_string());
    argv.push("/tmp".to_string());

    argv.push("--clearenv".to_string());
    argv.push("--setenv".to_string());
    argv.push("HOME".to_string());
    argv.push(home_dir.clone());
    argv.push("--setenv".to_string());
    argv.push("PATH".to_string());
    argv.push("/usr/bin:/bin:/usr/local/bin:/sbin".to_string());
    for (key, value) in plan.env {
        argv.push("--setenv".to_string());
        argv.push(key.clone());
        argv.push(value.clone());
    }
    argv.push("--chdir".to_string());
    argv.push(home_dir);

    if !plan.use_pty {
        argv.push("--new-session".to_string());
    }

    if let Some(net_args) = &plan.network_bind_args {
        argv.extend(net_args.iter().cloned());
    }

    argv.push("--".to_string());
    argv.extend(plan.command.iter().cloned());

    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_plan<'a>(rootfs: &'a Path, work: &'a Path, tmp: &'a Path, command: &'a [String]) -> LaunchPlan<'a> {
        LaunchPlan {
            rootfs_root: rootfs,
            overlay: false,
            work_dir: work,
            scratch_tmp: tmp,
            uid: 1000,
            hostname: "sandbox",
            user: "sandbox",
            env: &[],
            network_bind_args: None,
            use_pty: false,
            command,
        }
    }

    #[test]
    fn non_pty_runs_include_new_session() {
        let rootfs = Path::new("/tmp/root");
        let work = Path::new("/tmp/work");
        let tmp = Path::new("/tmp/scratch");
        let command = vec!["bash".to_string(), "-c".to_string(), "true".to_string()];
        let plan = base_plan(rootfs, work, tmp, &command);
        let argv = build_argv(&plan);
        assert!(argv.contains(&"--new-session".to_string()));
        assert_eq!(argv[0], "bwrap");
        assert!(argv.windows(2).any(|w| w == ["--ro-bind", "/tmp/root"]));
    }

    #[test]
    fn pty_runs_omit_new_session() {
        let rootfs = Path::new("/tmp/root");
        let work = Path::new("/tmp/work");
        let tmp = Path::new("/tmp/scratch");
        let command = vec!["bash".to_string()];
        let mut plan = base_plan(rootfs, work, tmp, &command);
        plan.use_pty = true;
        let argv = build_argv(&plan);
        assert!(!argv.contains(&"--new-session".to_string()));
    }

    #[test]
    fn overlay_mode_uses_writable_bind_for_root() {
        let rootfs = Path::new("/tmp/root");
        let work = Path::new("/tmp/work");
        let tmp = Path::new("/tmp/scratch");
        let command = vec!["true".to_string()];
        let mut plan = base_plan(rootfs, work, tmp, &command);
        plan.overlay = true;
        let argv = build_argv(&plan);
        assert!(argv.windows(2).any(|w| w == ["--bind", "/tmp/root"]));
        assert!(!argv.windows(2).any(|w| w == ["--ro-bind", "/tmp/root"]));
    }

    #[test]
    fn root_user_gets_root_home() {
        let rootfs = Path::new("/tmp/root");
        let work = Path::new("/tmp/work");
        let tmp = Path::new("/tmp/scratch");
        let command = vec!["true".to_string()];
        let mut plan = base_plan(rootfs, work, tmp, &command);
        plan.user = "root";
        let argv = build_argv(&plan);
        assert!(argv.windows(2).any(|w| w == ["--bind", "/tmp/work"] || w == ["/tmp/work", "/root"]));
        assert!(argv.contains(&"/root".to_string()));
    }

    #[test]
    fn command_is_appended_after_separator() {
        let rootfs = Path::new("/tmp/root");
        let work = Path::new("/tmp/work");
        let tmp = Path::new("/tmp/scratch");
        let command = vec!["bash".to_string(), "-c".to_string(), "echo hi".to_string()];
        let plan = base_plan(rootfs, work, tmp, &command);
        let argv = build_argv(&plan);
        let sep = argv.iter().position(|a| a == "--").unwrap();
        assert_eq!(&argv[sep + 1..], command.as_slice());
    }
}
