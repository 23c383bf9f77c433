//! Runtime orchestrator (§4.14): composes every other module into the
//! `run` sequence — bundle creation, rootfs assembly, mount execution,
//! config generation, privilege drop, and external-runtime handoff.

use std::collections::{BTreeMap, HashMap};
use std::os::unix::process::ExitStatusExt as _;
use std::path::{Path, PathBuf};

use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};

use kiln_oci::Reference;
use kiln_repo::Repository;

use crate::config::Config;
use crate::configs::{self, CliOverrides, EnvironmentPolicy};
use crate::error::{Error, ErrorKind};
use crate::hooks::{self, EvalContext, Hook};
use crate::identity::{self, Identity};
use crate::mount::{self, DeviceMount, Mount, MountPolicy};
use crate::ociconfig::{self, BundleConfig, DeviceRule};
use crate::pathval;

/// Everything a `run` invocation supplies beyond the engine config and the
/// repository: the resolved reference, the invoking identity, and every
/// CLI-sourced override.
pub struct RunRequest {
    /// The image reference to run.
    pub reference: Reference,
    /// The identity of the invoking user, restored after privileged setup.
    pub user: Identity,
    /// Raw `--mount=<key>=<value>,...` requests supplied by the site
    /// configuration (executed before user mounts).
    pub site_mounts: Vec<HashMap<String, String>>,
    /// Raw `--mount` requests supplied on the command line.
    pub user_mounts: Vec<HashMap<String, String>>,
    /// Raw `--device=<src>[:<dst>[:<perms>]]` strings.
    pub devices: Vec<String>,
    /// CLI overrides feeding the configs merger.
    pub cli: CliOverrides,
    /// `--pid=private`.
    pub new_pid_namespace: bool,
    /// `--tty`.
    pub tty: bool,
}

/// A bundle directory and the mounts made into it, torn down on [`Drop`]
/// so an error anywhere in [`run`] leaves nothing mounted or on disk.
struct Bundle {
    dir: PathBuf,
    rootfs: PathBuf,
    mounts: Vec<PathBuf>,
    loop_mounted: bool,
    overlay_mounted: bool,
}

impl Bundle {
    fn create(oci_bundle_dir: &Path, rootfs_folder: &str, security_checks: bool) -> Result<Self, Error> {
        if security_checks {
            pathval::check_untamperable(oci_bundle_dir, pathval::Policy::Weak)?;
        }

        let dir = oci_bundle_dir.join(format!("kiln-{}", std::process::id()));
        let rootfs = dir.join(rootfs_folder);
        std::fs::create_dir_all(&rootfs)?;
        std::fs::create_dir_all(dir.join("overlay/upper"))?;
        std::fs::create_dir_all(dir.join("overlay/work"))?;
        std::fs::create_dir_all(dir.join("overlay/rootfs-lower"))?;
        Ok(Self {
            dir,
            rootfs,
            mounts: Vec::new(),
            loop_mounted: false,
            overlay_mounted: false,
        })
    }

    fn lower_dir(&self) -> PathBuf {
        self.dir.join("overlay/rootfs-lower")
    }

    fn upper_dir(&self) -> PathBuf {
        self.dir.join("overlay/upper")
    }

    fn work_dir(&self) -> PathBuf {
        self.dir.join("overlay/work")
    }
}

impl Drop for Bundle {
    /// Unmounts everything in reverse order and removes the bundle
    /// directory, tolerating already-gone mounts (the external runtime may
    /// have torn down its own namespace already).
    fn drop(&mut self) {
        for target in self.mounts.iter().rev() {
            if let Err(e) = nix::mount::umount2(target, nix::mount::MntFlags::MNT_DETACH) {
                tracing::warn!(target = %target.display(), error = %e, "failed to unmount during bundle teardown");
            }
        }
        if self.overlay_mounted {
            if let Err(e) = nix::mount::umount2(&self.rootfs, nix::mount::MntFlags::MNT_DETACH) {
                tracing::warn!(target = %self.rootfs.display(), error = %e, "failed to unmount overlay during bundle teardown");
            }
        }
        if self.loop_mounted {
            let lower = self.lower_dir();
            if let Err(e) = nix::mount::umount2(&lower, nix::mount::MntFlags::MNT_DETACH) {
                tracing::warn!(target = %lower.display(), error = %e, "failed to unmount squashfs loop mount during bundle teardown");
            }
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %self.dir.display(), error = %e, "failed to remove bundle directory during teardown");
            }
        }
    }
}

/// Runs `request` against `config` and `repository`: assembles the OCI
/// bundle, then forks — the child drops every privilege and execs the
/// external runtime (`runc`-class), the parent waits for it and tears the
/// bundle down — returning the child's exit status so the caller can
/// propagate it verbatim (§6: "exit code is the external runtime's exit
/// code on `run`").
pub fn run(
    request: &RunRequest,
    config: &Config,
    repository: &Repository,
) -> Result<std::process::ExitStatus, Error> {
    let stored_image = repository.get(&request.reference)?;
    let metadata_bytes = std::fs::read(&stored_image.metadata_path)?;
    let metadata: kiln_oci::ImageMetadata = serde_json::from_slice(&metadata_bytes)
        .map_err(|e| Error::from(ErrorKind::Config(format!("{}: {e}", stored_image.metadata_path.display()))))?;

    let mut bundle = Bundle::create(&config.oci_bundle_dir, &config.rootfs_folder, config.security_checks)?;

    mount::loop_mount_squashfs(&stored_image.squashfs_path, &bundle.lower_dir())?;
    bundle.loop_mounted = true;

    mount::mount_overlay_fs(
        &bundle.lower_dir(),
        &bundle.upper_dir(),
        &bundle.work_dir(),
        &bundle.rootfs,
    )?;
    bundle.overlay_mounted = true;

    let mount_policy = config.mount_policy();
    let mounts = execute_site_and_user_mounts(request, &mount_policy, &bundle.rootfs)?;
    for mount in &mounts {
        bundle.mounts.push(bundle.rootfs.join(mount.destination.strip_prefix("/").unwrap_or(&mount.destination)));
    }

    let device_mounts = execute_device_mounts(request, &mount_policy, &bundle.rootfs)?;
    for device in &device_mounts {
        bundle.mounts.push(
            bundle
                .rootfs
                .join(device.mount.destination.strip_prefix("/").unwrap_or(&device.mount.destination)),
        );
    }
    whitelist_devices(&device_mounts)?;

    let annotations = configs::build_annotations(&request.cli, &metadata);
    let workdir = configs::resolve_workdir(&request.cli, &metadata);
    let host_env: Vec<(String, String)> = std::env::vars().collect();
    let environment_policy: EnvironmentPolicy = config.environment.clone().into_policy()?;
    let env = configs::build_environment(
        &request.cli,
        &metadata,
        &environment_policy,
        &host_env,
        config.enable_pmi_xv3_support,
    );
    let argv = configs::resolve_command(&request.cli, &metadata)?;

    let active_hooks = load_active_hooks(config, &argv, &annotations, !mounts.is_empty())?;

    let tty_gid = ociconfig::find_gid_of_tty_group(Path::new("/etc/group"))?;
    let device_rules: Vec<DeviceRule> = device_mounts
        .iter()
        .map(|d| DeviceRule {
            allow: true,
            device_type: d.device_type,
            major: d.major,
            minor: d.minor,
            access: d.access.clone(),
        })
        .collect();

    let bundle_config = BundleConfig {
        rootfs: PathBuf::from(config.rootfs_folder.clone()),
        uid: request.user.uid,
        gid: request.user.gid,
        supplementary_gids: request.user.supplementary_gids.clone(),
        argv,
        env,
        workdir,
        allocate_pseudo_tty: request.tty,
        cpu_affinity: current_cpu_affinity()?,
        device_rules,
        create_new_pid_namespace: request.new_pid_namespace,
        active_hooks_by_stage: active_hooks,
        annotations,
        apparmor_profile: config.apparmor_profile.clone(),
        selinux_label: config.selinux_label.clone(),
        selinux_mount_label: config.selinux_mount_label.clone(),
        seccomp_profile_path: config.seccomp_profile.clone(),
        tty_gid,
    };

    let rendered = ociconfig::render(&bundle_config)?;
    let config_json_path = bundle.dir.join("config.json");
    write_owner_only(&config_json_path, &rendered)?;

    match unsafe { fork() }.map_err(|e| Error::from(ErrorKind::Subprocess(format!("fork: {e}"))))? {
        ForkResult::Child => {
            if let Err(e) = exec_runtime_as_user(config, &bundle.dir, &request.user) {
                tracing::error!(error = %e, "failed to exec external runtime");
                std::process::exit(1);
            }
            unreachable!("exec_runtime_as_user only returns on failure");
        }
        ForkResult::Parent { child } => {
            let status = wait_for_child(child)?;
            drop(bundle);
            Ok(status)
        }
    }
}

fn execute_site_and_user_mounts(
    request: &RunRequest,
    policy: &MountPolicy,
    rootfs: &Path,
) -> Result<Vec<Mount>, Error> {
    let mut mounts = Vec::with_capacity(request.site_mounts.len() + request.user_mounts.len());
    for raw in request.site_mounts.iter().chain(request.user_mounts.iter()) {
        let parsed = mount::parse_mount_request(raw, policy)?;
        parsed.execute(rootfs)?;
        mounts.push(parsed);
    }
    Ok(mounts)
}

fn execute_device_mounts(
    request: &RunRequest,
    policy: &MountPolicy,
    rootfs: &Path,
) -> Result<Vec<DeviceMount>, Error> {
    let mut devices = Vec::with_capacity(request.devices.len());
    for spec in &request.devices {
        let device = mount::parse_device_spec(spec, policy)?;
        device.mount.execute(rootfs)?;
        devices.push(device);
    }
    Ok(devices)
}

fn whitelist_devices(devices: &[DeviceMount]) -> Result<(), Error> {
    if devices.is_empty() {
        return Ok(());
    }
    let allow_file = mount::devices_cgroup_allow_file(std::process::id())?;
    for device in devices {
        mount::whitelist_device(device, &allow_file)?;
    }
    Ok(())
}

fn load_active_hooks(
    config: &Config,
    argv: &[String],
    annotations: &BTreeMap<String, String>,
    mounts_non_empty: bool,
) -> Result<BTreeMap<String, Vec<Hook>>, Error> {
    let Some(hooks_dir) = &config.hooks_dir else {
        return Ok(BTreeMap::new());
    };
    let all_hooks = hooks::load_hooks(hooks_dir)?;
    let ctx = EvalContext {
        annotations: annotations.clone(),
        argv: argv.to_vec(),
        mounts_empty: !mounts_non_empty,
    };

    let stages: std::collections::BTreeSet<&str> = all_hooks
        .iter()
        .flat_map(|hook| hook.stages.iter().map(String::as_str))
        .collect();

    let mut by_stage: BTreeMap<String, Vec<Hook>> = BTreeMap::new();
    for stage in stages {
        let active: Vec<Hook> = hooks::active_hooks_for_stage(&all_hooks, stage, &ctx)
            .into_iter()
            .cloned()
            .collect();
        if !active.is_empty() {
            by_stage.insert(stage.to_owned(), active);
        }
    }
    Ok(by_stage)
}

/// Reads the invoking process's own CPU affinity mask via
/// `sched_getaffinity`, forwarded into `config.json` so an external
/// scheduler's pin survives the runtime's own cgroup cpuset assignment.
fn current_cpu_affinity() -> Result<Vec<u32>, Error> {
    let mask = nix::sched::sched_getaffinity(Pid::from_raw(0))
        .map_err(|e| Error::from(ErrorKind::Config(format!("sched_getaffinity: {e}"))))?;
    let cpus = (0..libc::CPU_SETSIZE as usize)
        .filter(|&cpu| mask.is_set(cpu).unwrap_or(false))
        .map(|cpu| cpu as u32)
        .collect();
    Ok(cpus)
}

fn write_owner_only(path: &Path, value: &serde_json::Value) -> Result<(), Error> {
    use std::io::Write as _;
    use std::os::unix::fs::OpenOptionsExt as _;

    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| Error::from(ErrorKind::Config(format!("serializing {}: {e}", path.display()))))?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(&bytes)?;
    Ok(())
}

/// Drops every privilege to `target`, then execs the external OCI runtime
/// with the bundle directory (§4.14 step 9). Never returns on success.
fn exec_runtime_as_user(config: &Config, bundle_dir: &Path, target: &Identity) -> Result<(), Error> {
    identity::drop_all_privileges_and_exec_noexec(target)?;

    let runtime_path = std::ffi::CString::new(config.runc_path.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::from(ErrorKind::Config("runtime path contains a NUL byte".to_owned())))?;
    let bundle_arg = std::ffi::CString::new(bundle_dir.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::from(ErrorKind::Config("bundle path contains a NUL byte".to_owned())))?;
    let run_arg = std::ffi::CString::new("run").expect("static string has no NUL byte");
    let bundle_flag = std::ffi::CString::new("--bundle").expect("static string has no NUL byte");

    nix::unistd::execv(&runtime_path, &[runtime_path.clone(), run_arg, bundle_flag, bundle_arg])
        .map_err(|e| Error::from(ErrorKind::Subprocess(format!("exec {}: {e}", config.runc_path.display()))))?;
    unreachable!("execv only returns on error, which is mapped above")
}

fn wait_for_child(child: Pid) -> Result<std::process::ExitStatus, Error> {
    match waitpid(child, None)
        .map_err(|e| Error::from(ErrorKind::Subprocess(format!("waitpid: {e}"))))?
    {
        WaitStatus::Exited(_, code) => Ok(std::process::ExitStatus::from_raw(code)),
        WaitStatus::Signaled(_, signal, _) => Ok(std::process::ExitStatus::from_raw(128 + signal as i32)),
        other => Err(Error::from(ErrorKind::Subprocess(format!(
            "unexpected wait status: {other:?}"
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_create_populates_expected_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = Bundle::create(dir.path(), "rootfs", false).unwrap();
        assert!(bundle.rootfs.ends_with("rootfs"));
        assert!(bundle.lower_dir().ends_with("overlay/rootfs-lower"));
        assert!(bundle.upper_dir().is_dir());
        assert!(bundle.work_dir().is_dir());
    }

    #[test]
    fn bundle_drop_removes_directory_when_nothing_was_mounted() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = Bundle::create(dir.path(), "rootfs", false).unwrap();
        let bundle_dir = bundle.dir.clone();
        drop(bundle);
        assert!(!bundle_dir.exists());
    }
}
