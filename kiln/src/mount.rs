//! Mount request parsing and execution (§4.9/§4.10).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags, mount, umount2};

use crate::error::{Error, ErrorKind};

/// Source/destination restrictions applied by the parser (§4.9).
#[derive(Debug, Clone, Default)]
pub struct MountPolicy {
    /// Source paths starting with any of these prefixes are rejected.
    pub source_disallowed_prefixes: Vec<String>,
    /// Source paths exactly equal to any of these are rejected.
    pub source_disallowed_exact: Vec<String>,
    /// Destination paths starting with any of these prefixes are rejected.
    pub destination_disallowed_prefixes: Vec<String>,
    /// Destination paths exactly equal to any of these are rejected.
    pub destination_disallowed_exact: Vec<String>,
}

/// A validated bind mount request, ready to be executed against a rootfs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Host-side source path.
    pub source: PathBuf,
    /// Container-side destination path, relative to the bundle rootfs.
    pub destination: PathBuf,
    /// Mount flags, always including `MS_REC | MS_PRIVATE`, plus
    /// `MS_RDONLY` when the request asked for `readonly`.
    pub flags: MsFlags,
}

/// Parses a single mount request (the deserialized form of a repeated
/// `--mount=<key>=<value>,...` CLI argument) against `policy`.
///
/// Only `type=bind` requests are recognized. Recognized keys: `type`
/// (required), `source`/`src` (exactly one), `destination`/`dst`/`target`
/// (exactly one), and `readonly` (a flag, any value). Any other key is a
/// hard error.
pub fn parse_mount_request(
    request: &HashMap<String, String>,
    policy: &MountPolicy,
) -> Result<Mount, Error> {
    let mount_type = request.get("type").ok_or_else(|| {
        Error::from(ErrorKind::Mount(format!(
            "'type' must be specified: {}",
            describe(request)
        )))
    })?;
    if mount_type != "bind" {
        return Err(Error::from(ErrorKind::Mount(format!(
            "'{mount_type}' is not a valid mount type: {}",
            describe(request)
        ))));
    }

    let source = validated_source(request, policy)?;
    let destination = validated_destination(request, policy)?;
    let flags = bind_mount_flags(request)?;

    Ok(Mount {
        source,
        destination,
        flags,
    })
}

fn validated_source(
    request: &HashMap<String, String>,
    policy: &MountPolicy,
) -> Result<PathBuf, Error> {
    let has_source = request.contains_key("source");
    let has_src = request.contains_key("src");
    if has_source && has_src {
        return Err(mount_error(
            request,
            "multiple formats used to specify mount source; use either 'source' or 'src'",
        ));
    }
    let raw = request
        .get("source")
        .or_else(|| request.get("src"))
        .ok_or_else(|| {
            mount_error(
                request,
                "no source specified; use either 'source' or 'src'",
            )
        })?;

    validate_path(raw, request, "source", &policy.source_disallowed_prefixes, &policy.source_disallowed_exact)
}

fn validated_destination(
    request: &HashMap<String, String>,
    policy: &MountPolicy,
) -> Result<PathBuf, Error> {
    let count = ["destination", "dst", "target"]
        .iter()
        .filter(|k| request.contains_key(**k))
        .count();
    if count > 1 {
        return Err(mount_error(
            request,
            "multiple formats used to specify mount destination; use one of 'destination', 'dst' or 'target'",
        ));
    }
    let raw = request
        .get("destination")
        .or_else(|| request.get("dst"))
        .or_else(|| request.get("target"))
        .ok_or_else(|| {
            mount_error(
                request,
                "no destination specified; use either 'destination', 'dst' or 'target'",
            )
        })?;

    validate_path(
        raw,
        request,
        "destination",
        &policy.destination_disallowed_prefixes,
        &policy.destination_disallowed_exact,
    )
}

fn validate_path(
    raw: &str,
    request: &HashMap<String, String>,
    role: &str,
    disallowed_prefixes: &[String],
    disallowed_exact: &[String],
) -> Result<PathBuf, Error> {
    if raw.is_empty() {
        return Err(mount_error(request, &format!("{role} is empty")));
    }
    let path = Path::new(raw);
    if !path.is_absolute() {
        return Err(mount_error(request, &format!("{role} must be an absolute path")));
    }
    for prefix in disallowed_prefixes {
        if raw.starts_with(prefix.as_str()) {
            return Err(mount_error(
                request,
                &format!("{role} cannot be a subdirectory of '{prefix}'"),
            ));
        }
    }
    for exact in disallowed_exact {
        if raw == exact {
            return Err(mount_error(
                request,
                &format!("'{exact}' is not allowed as mount {role}"),
            ));
        }
    }
    Ok(path.to_path_buf())
}

fn bind_mount_flags(request: &HashMap<String, String>) -> Result<MsFlags, Error> {
    let mut flags = MsFlags::MS_REC | MsFlags::MS_PRIVATE;
    const RECOGNIZED: &[&str] = &["type", "source", "src", "destination", "dst", "target"];

    for key in request.keys() {
        if RECOGNIZED.contains(&key.as_str()) {
            continue;
        }
        if key == "readonly" {
            flags |= MsFlags::MS_RDONLY;
        } else {
            return Err(mount_error(
                request,
                &format!("'{key}' is not a valid bind mount option"),
            ));
        }
    }
    Ok(flags)
}

fn mount_error(request: &HashMap<String, String>, detail: &str) -> Error {
    Error::from(ErrorKind::Mount(format!(
        "invalid mount request '{}': {detail}",
        describe(request)
    )))
}

fn describe(request: &HashMap<String, String>) -> String {
    request
        .iter()
        .map(|(k, v)| if v.is_empty() { k.clone() } else { format!("{k}={v}") })
        .collect::<Vec<_>>()
        .join(",")
}

impl Mount {
    /// Executes this mount into `rootfs`: bind mount, remount with the
    /// requested flags, then set propagation private. Three separate
    /// `mount(2)` calls, since the kernel does not let a single call both
    /// create a bind mount and apply arbitrary remount flags to it.
    pub fn execute(&self, rootfs: &Path) -> Result<(), Error> {
        let target = rootfs.join(self.destination.strip_prefix("/").unwrap_or(&self.destination));
        std::fs::create_dir_all(
            target
                .parent()
                .ok_or_else(|| Error::from(ErrorKind::Mount("destination has no parent".into())))?,
        )
        .map_err(Error::from)?;
        if self.source.is_dir() {
            std::fs::create_dir_all(&target).map_err(Error::from)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(Error::from)?;
            }
            std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(&target)
                .map_err(Error::from)?;
        }

        mount(
            Some(&self.source),
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| mount_syscall_error(&target, "bind", e))?;

        let mut remount_flags =
            MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_NOSUID | MsFlags::MS_REC;
        if self.flags.contains(MsFlags::MS_RDONLY) {
            remount_flags |= MsFlags::MS_RDONLY;
        }
        mount(
            None::<&str>,
            &target,
            None::<&str>,
            remount_flags,
            None::<&str>,
        )
        .map_err(|e| mount_syscall_error(&target, "remount", e))?;

        mount(
            None::<&str>,
            &target,
            None::<&str>,
            MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| mount_syscall_error(&target, "set-private", e))?;

        Ok(())
    }

    /// Reverses [`Mount::execute`]: a lazy, recursive unmount.
    pub fn undo(&self, rootfs: &Path) -> Result<(), Error> {
        let target = rootfs.join(self.destination.strip_prefix("/").unwrap_or(&self.destination));
        umount2(&target, MntFlags::MNT_DETACH)
            .map_err(|e| mount_syscall_error(&target, "umount", e))?;
        Ok(())
    }
}

fn mount_syscall_error(target: &Path, step: &str, errno: nix::errno::Errno) -> Error {
    Error::from(ErrorKind::Mount(format!(
        "{step} {}: {errno}",
        target.display()
    )))
}

/// A validated device bind mount (§3 "Device Mount"): a [`Mount`] plus the
/// `type`/`major`/`minor` triple needed to whitelist the node in the
/// container's devices cgroup, derived by `stat`-ing the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMount {
    /// The underlying bind mount.
    pub mount: Mount,
    /// `'b'` for block, `'c'` for character.
    pub device_type: char,
    /// Device major number.
    pub major: i64,
    /// Device minor number.
    pub minor: i64,
    /// cgroup access string, e.g. `"rwm"`.
    pub access: String,
}

/// Parses a `--device=<src>[:<dst>[:<perms>]]` CLI argument into a
/// [`DeviceMount`], `stat`-ing `src` to derive its type/major/minor.
///
/// `dst` defaults to `src`; `perms` defaults to `"rwm"`. The source must be
/// an actual device file — a regular file or directory is rejected.
pub fn parse_device_spec(spec: &str, policy: &MountPolicy) -> Result<DeviceMount, Error> {
    let mut parts = spec.splitn(3, ':');
    let source = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| {
        Error::from(ErrorKind::Mount(format!("empty device source in '{spec}'")))
    })?;
    let destination = parts.next().filter(|s| !s.is_empty()).unwrap_or(source);
    let access = parts.next().filter(|s| !s.is_empty()).unwrap_or("rwm");

    let source_path = validate_path(
        source,
        &HashMap::new(),
        "source",
        &policy.source_disallowed_prefixes,
        &policy.source_disallowed_exact,
    )?;
    let destination_path = validate_path(
        destination,
        &HashMap::new(),
        "destination",
        &policy.destination_disallowed_prefixes,
        &policy.destination_disallowed_exact,
    )?;

    let metadata = std::fs::metadata(&source_path).map_err(|e| {
        Error::from(ErrorKind::Mount(format!("{}: {e}", source_path.display())))
    })?;
    let (device_type, major, minor) = device_identity(&metadata).ok_or_else(|| {
        Error::from(ErrorKind::Mount(format!(
            "{} is not a device file",
            source_path.display()
        )))
    })?;

    Ok(DeviceMount {
        mount: Mount {
            source: source_path,
            destination: destination_path,
            flags: MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        },
        device_type,
        major,
        minor,
        access: access.to_owned(),
    })
}

/// Extracts `(type, major, minor)` from a device file's metadata, or `None`
/// if it names neither a block nor a character device.
fn device_identity(metadata: &std::fs::Metadata) -> Option<(char, i64, i64)> {
    use std::os::unix::fs::FileTypeExt as _;
    use std::os::unix::fs::MetadataExt as _;

    let file_type = metadata.file_type();
    let device_type = if file_type.is_block_device() {
        'b'
    } else if file_type.is_char_device() {
        'c'
    } else {
        return None;
    };
    let rdev = metadata.rdev();
    // Mirrors the kernel's own major()/minor() macros for a 64-bit dev_t.
    let major = ((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff);
    let minor = (rdev & 0xff) | ((rdev >> 12) & !0xff);
    Some((device_type, major as i64, minor as i64))
}

/// Loop-mounts a squashfs file read-only onto `dir` (§4.10 auxiliary
/// primitive), attaching it to the next free `/dev/loopN` device first
/// since the `mount(2)` syscall itself has no notion of the `loop,nosuid,
/// nodev,ro -t squashfs` options `mount(8)` exposes.
pub fn loop_mount_squashfs(file: &Path, dir: &Path) -> Result<(), Error> {
    let control = loopdev::LoopControl::open()
        .map_err(|e| Error::from(ErrorKind::Mount(format!("opening loop control: {e}"))))?;
    let loop_device = control
        .next_free()
        .map_err(|e| Error::from(ErrorKind::Mount(format!("allocating loop device: {e}"))))?;
    loop_device
        .with()
        .read_only(true)
        .attach(file)
        .map_err(|e| Error::from(ErrorKind::Mount(format!("attaching {}: {e}", file.display()))))?;

    let loop_path = loop_device.path().ok_or_else(|| {
        Error::from(ErrorKind::Mount("loop device has no path".to_owned()))
    })?;

    std::fs::create_dir_all(dir)?;
    mount(
        Some(&loop_path),
        dir,
        Some("squashfs"),
        MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .map_err(|e| mount_syscall_error(dir, "loop-mount squashfs", e))?;

    Ok(())
}

/// Mounts an OverlayFS union of `lower` (read-only) and `upper`/`work`
/// (writable) onto `dest` (§4.10 auxiliary primitive, §4.14 step 4).
pub fn mount_overlay_fs(lower: &Path, upper: &Path, work: &Path, dest: &Path) -> Result<(), Error> {
    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        lower.display(),
        upper.display(),
        work.display()
    );
    std::fs::create_dir_all(dest)?;
    mount(
        Some("overlay"),
        dest,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .map_err(|e| mount_syscall_error(dest, "overlay-mount", e))
}

/// Locates the devices cgroup's `devices.allow` file for the process whose
/// bundle is being assembled (§4.13, §4.14 step 6).
///
/// Parses `/proc/1/mountinfo` for the `devices` controller's mount point and
/// the root's offset into the cgroup hierarchy, then `/proc/<pid>/cgroup`
/// for that process's own sub-path, joining the two — accounting for the
/// case where the controller's mount root is itself a prefix of the
/// process's cgroup path (a nested cgroup namespace).
pub fn devices_cgroup_allow_file(pid: u32) -> Result<PathBuf, Error> {
    let mountinfo = std::fs::read_to_string("/proc/1/mountinfo")?;
    let (mount_point, mount_root) = mountinfo
        .lines()
        .find_map(|line| parse_devices_mountinfo_line(line))
        .ok_or_else(|| {
            Error::from(ErrorKind::Mount(
                "no devices cgroup mount found in /proc/1/mountinfo".to_owned(),
            ))
        })?;

    let cgroup_file = std::fs::read_to_string(format!("/proc/{pid}/cgroup"))?;
    let process_path = cgroup_file
        .lines()
        .find_map(|line| parse_devices_cgroup_line(line))
        .ok_or_else(|| {
            Error::from(ErrorKind::Mount(format!(
                "no devices cgroup entry for pid {pid}"
            )))
        })?;

    let relative = process_path.strip_prefix(&mount_root).unwrap_or(&process_path);
    let relative = relative.trim_start_matches('/');

    Ok(mount_point.join(relative).join("devices.allow"))
}

/// Parses one `/proc/1/mountinfo` line, returning `(mount_point, root)` if
/// it is the `devices` cgroup controller mount.
fn parse_devices_mountinfo_line(line: &str) -> Option<(PathBuf, String)> {
    let (left, right) = line.split_once(" - ")?;
    let mut right_fields = right.split_whitespace();
    let fs_type = right_fields.next()?;
    if fs_type != "cgroup" {
        return None;
    }
    let super_options = right_fields.nth(1)?;
    if !super_options.split(',').any(|o| o == "devices") {
        return None;
    }

    let mut left_fields = left.split_whitespace();
    let root = left_fields.nth(3)?.to_owned();
    let mount_point = left_fields.next()?;
    Some((PathBuf::from(mount_point), root))
}

/// Parses one `/proc/<pid>/cgroup` line, returning the cgroup sub-path if
/// it is the `devices` controller's entry.
fn parse_devices_cgroup_line(line: &str) -> Option<PathBuf> {
    let mut fields = line.splitn(3, ':');
    let _id = fields.next()?;
    let controllers = fields.next()?;
    if !controllers.split(',').any(|c| c == "devices") {
        return None;
    }
    Some(PathBuf::from(fields.next()?))
}

/// Appends `"<type> <major>:<minor> <access>"` to the container's
/// `devices.allow`, whitelisting a device mount after it has been
/// bind-mounted in (§4.10).
pub fn whitelist_device(device: &DeviceMount, allow_file: &Path) -> Result<(), Error> {
    use std::io::Write as _;
    let line = format!(
        "{} {}:{} {}\n",
        device.device_type, device.major, device.minor, device.access
    );
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(allow_file)
        .map_err(|e| Error::from(ErrorKind::Mount(format!("{}: {e}", allow_file.display()))))?;
    file.write_all(line.as_bytes())
        .map_err(|e| Error::from(ErrorKind::Mount(format!("{}: {e}", allow_file.display()))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn parses_readonly_bind_mount() {
        let policy = MountPolicy::default();
        let request = map(&[("type", "bind"), ("source", "/src"), ("destination", "/dest"), ("readonly", "")]);
        let mount = parse_mount_request(&request, &policy).unwrap();
        assert_eq!(mount.source, PathBuf::from("/src"));
        assert_eq!(mount.destination, PathBuf::from("/dest"));
        assert!(mount.flags.contains(MsFlags::MS_RDONLY));
        assert!(mount.flags.contains(MsFlags::MS_REC));
        assert!(mount.flags.contains(MsFlags::MS_PRIVATE));
    }

    #[test]
    fn rejects_disallowed_destination_prefix() {
        let policy = MountPolicy {
            destination_disallowed_prefixes: vec!["/etc".to_owned()],
            ..Default::default()
        };
        let request = map(&[("type", "bind"), ("source", "/src"), ("destination", "/etc/foo")]);
        assert!(parse_mount_request(&request, &policy).is_err());
    }

    #[test]
    fn rejects_unknown_option() {
        let policy = MountPolicy::default();
        let request = map(&[("type", "bind"), ("source", "/src"), ("destination", "/dest"), ("bogus", "x")]);
        assert!(parse_mount_request(&request, &policy).is_err());
    }

    #[test]
    fn rejects_ambiguous_source_keys() {
        let policy = MountPolicy::default();
        let request = map(&[("type", "bind"), ("source", "/a"), ("src", "/b"), ("destination", "/dest")]);
        assert!(parse_mount_request(&request, &policy).is_err());
    }

    #[test]
    fn rejects_relative_source() {
        let policy = MountPolicy::default();
        let request = map(&[("type", "bind"), ("source", "rel"), ("destination", "/dest")]);
        assert!(parse_mount_request(&request, &policy).is_err());
    }

    #[test]
    fn parses_device_spec_with_defaults() {
        let policy = MountPolicy::default();
        let device = parse_device_spec("/dev/null", &policy).unwrap();
        assert_eq!(device.mount.source, PathBuf::from("/dev/null"));
        assert_eq!(device.mount.destination, PathBuf::from("/dev/null"));
        assert_eq!(device.device_type, 'c');
        assert_eq!(device.access, "rwm");
    }

    #[test]
    fn parses_device_spec_with_explicit_destination_and_access() {
        let policy = MountPolicy::default();
        let device = parse_device_spec("/dev/null:/dev/foo:r", &policy).unwrap();
        assert_eq!(device.mount.destination, PathBuf::from("/dev/foo"));
        assert_eq!(device.access, "r");
    }

    #[test]
    fn rejects_device_spec_naming_a_regular_file() {
        let policy = MountPolicy::default();
        assert!(parse_device_spec("/etc/hostname", &policy).is_err());
    }

    #[test]
    fn rejects_device_spec_with_disallowed_destination() {
        let policy = MountPolicy {
            destination_disallowed_prefixes: vec!["/etc".to_owned()],
            ..Default::default()
        };
        assert!(parse_device_spec("/dev/null:/etc/null", &policy).is_err());
    }

    #[test]
    fn parses_devices_mountinfo_line_for_devices_controller() {
        let line = "24 30 0:21 / /sys/fs/cgroup/devices rw,nosuid,nodev,noexec,relatime shared:10 - cgroup cgroup rw,devices";
        let parsed = parse_devices_mountinfo_line(line).unwrap();
        assert_eq!(parsed.0, PathBuf::from("/sys/fs/cgroup/devices"));
        assert_eq!(parsed.1, "/");
    }

    #[test]
    fn ignores_non_devices_mountinfo_lines() {
        let line = "25 30 0:22 / /sys/fs/cgroup/cpu rw,nosuid,nodev,noexec,relatime shared:11 - cgroup cgroup rw,cpu";
        assert!(parse_devices_mountinfo_line(line).is_none());
    }

    #[test]
    fn parses_devices_cgroup_line_for_pid() {
        let line = "4:devices:/user.slice/user-1000.slice";
        let parsed = parse_devices_cgroup_line(line).unwrap();
        assert_eq!(parsed, PathBuf::from("/user.slice/user-1000.slice"));
    }

    #[test]
    fn ignores_non_devices_cgroup_lines() {
        let line = "5:cpu,cpuacct:/user.slice";
        assert!(parse_devices_cgroup_line(line).is_none());
    }
}
