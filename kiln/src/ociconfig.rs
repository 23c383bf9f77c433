//! OCI runtime bundle `config.json` generation (§4.13).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};
use serde_json::{Map, Value, json};

use crate::error::{Error, ErrorKind};
use crate::hooks::Hook;

/// Everything needed to render a bundle's `config.json`, already resolved
/// by the caller (configs merge, mount executor, hook evaluation).
pub struct BundleConfig {
    pub rootfs: PathBuf,
    pub uid: Uid,
    pub gid: Gid,
    pub supplementary_gids: Vec<Gid>,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: String,
    pub allocate_pseudo_tty: bool,
    pub cpu_affinity: Vec<u32>,
    pub device_rules: Vec<DeviceRule>,
    pub create_new_pid_namespace: bool,
    pub active_hooks_by_stage: BTreeMap<String, Vec<Hook>>,
    pub annotations: BTreeMap<String, String>,
    pub apparmor_profile: Option<String>,
    pub selinux_label: Option<String>,
    pub selinux_mount_label: Option<String>,
    pub seccomp_profile_path: Option<PathBuf>,
    pub tty_gid: Option<u32>,
}

/// A single cgroup device-access rule (`linux.resources.devices[]`).
#[derive(Debug, Clone)]
pub struct DeviceRule {
    pub allow: bool,
    pub device_type: char,
    pub major: i64,
    pub minor: i64,
    pub access: String,
}

/// Renders `config.json` as a `serde_json::Value`, matching the OCI
/// Runtime Specification v1.0.0.
pub fn render(config: &BundleConfig) -> Result<Value, Error> {
    if let Some(profile) = &config.apparmor_profile {
        if !is_apparmor_profile_loaded(profile)? {
            return Err(Error::from(ErrorKind::Config(format!(
                "AppArmor profile '{profile}' was configured for use but it's not loaded into the kernel"
            ))));
        }
    }

    let mut document = Map::new();
    document.insert("ociVersion".into(), json!("1.0.0"));
    document.insert("process".into(), process_member(config));
    document.insert("root".into(), root_member(config));
    document.insert("mounts".into(), mounts_member(config.tty_gid));
    document.insert("linux".into(), linux_member(config)?);
    document.insert("hooks".into(), hooks_member(config));
    document.insert("annotations".into(), annotations_member(config));

    Ok(Value::Object(document))
}

fn process_member(config: &BundleConfig) -> Value {
    let mut process = Map::new();
    process.insert("terminal".into(), json!(config.allocate_pseudo_tty));

    let additional_gids: Vec<Value> = config
        .supplementary_gids
        .iter()
        .map(|g| json!(g.as_raw()))
        .collect();
    process.insert(
        "user".into(),
        json!({
            "uid": config.uid.as_raw(),
            "gid": config.gid.as_raw(),
            "additionalGids": additional_gids,
        }),
    );

    process.insert("args".into(), json!(config.argv));

    let env: Vec<String> = config
        .env
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    process.insert("env".into(), json!(env));
    process.insert("cwd".into(), json!(config.workdir));
    process.insert("capabilities".into(), json!({}));
    process.insert("noNewPrivileges".into(), json!(true));

    if let Some(profile) = &config.apparmor_profile {
        process.insert("apparmorProfile".into(), json!(profile));
    }
    if let Some(label) = &config.selinux_label {
        process.insert("selinuxLabel".into(), json!(label));
    }

    Value::Object(process)
}

fn root_member(config: &BundleConfig) -> Value {
    json!({
        "path": config.rootfs.to_string_lossy(),
        "readonly": false,
    })
}

fn mounts_member(tty_gid: Option<u32>) -> Value {
    let mut devpts_options = vec![
        "nosuid".to_owned(),
        "noexec".to_owned(),
        "newinstance".to_owned(),
        "ptmxmode=0666".to_owned(),
        "mode=0620".to_owned(),
    ];
    if let Some(gid) = tty_gid {
        devpts_options.push(format!("gid={gid}"));
    } else {
        tracing::warn!(
            "mounting /dev/pts without the gid=<tty group> option; programs like sshd may error"
        );
    }

    json!([
        {
            "destination": "/proc",
            "type": "proc",
            "source": "proc",
        },
        {
            "destination": "/dev/pts",
            "type": "devpts",
            "source": "devpts",
            "options": devpts_options,
        },
        {
            "destination": "/dev/shm",
            "type": "bind",
            "source": "/dev/shm",
            "options": ["nosuid", "noexec", "nodev", "rbind", "slave", "rw"],
        },
        {
            "destination": "/dev/mqueue",
            "type": "mqueue",
            "source": "mqueue",
            "options": ["nosuid", "noexec", "nodev"],
        },
        {
            "destination": "/sys",
            "type": "sysfs",
            "source": "sysfs",
            "options": ["nosuid", "noexec", "nodev", "ro"],
        },
        {
            "destination": "/sys/fs/cgroup",
            "type": "cgroup",
            "source": "cgroup",
            "options": ["nosuid", "noexec", "nodev", "relatime", "ro"],
        },
    ])
}

fn linux_member(config: &BundleConfig) -> Result<Value, Error> {
    let cpus = config
        .cpu_affinity
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let mut devices = vec![json!({"allow": false, "access": "rwm"})];
    for rule in &config.device_rules {
        devices.push(json!({
            "allow": rule.allow,
            "type": rule.device_type.to_string(),
            "major": rule.major,
            "minor": rule.minor,
            "access": rule.access,
        }));
    }

    let mut namespaces = vec![json!({"type": "mount"})];
    if config.create_new_pid_namespace {
        namespaces.push(json!({"type": "pid"}));
    }

    let mut linux_value = Map::new();
    linux_value.insert(
        "resources".into(),
        json!({
            "cpu": {"cpus": cpus},
            "devices": devices,
        }),
    );
    linux_value.insert("namespaces".into(), Value::Array(namespaces));
    linux_value.insert("rootfsPropagation".into(), json!("slave"));
    linux_value.insert(
        "maskedPaths".into(),
        json!([
            "/proc/kcore",
            "/proc/latency_stats",
            "/proc/timer_list",
            "/proc/timer_stats",
            "/proc/sched_debug",
            "/sys/firmware",
            "/proc/scsi",
        ]),
    );
    linux_value.insert(
        "readonlyPaths".into(),
        json!([
            "/proc/asound",
            "/proc/bus",
            "/proc/fs",
            "/proc/irq",
            "/proc/sys",
            "/proc/sysrq-trigger",
        ]),
    );

    if let Some(path) = &config.seccomp_profile_path {
        if !path.is_file() {
            return Err(Error::from(ErrorKind::Config(format!(
                "the configured seccomp profile path is not a regular file: {}",
                path.display()
            ))));
        }
        let data = std::fs::read(path)?;
        let profile: Value = serde_json::from_slice(&data)
            .map_err(|e| Error::from(ErrorKind::Config(format!("reading seccomp profile: {e}"))))?;
        linux_value.insert("seccomp".into(), profile);
    }

    if let Some(label) = &config.selinux_mount_label {
        linux_value.insert("mountLabel".into(), json!(label));
    }

    Ok(Value::Object(linux_value))
}

fn hooks_member(config: &BundleConfig) -> Value {
    let mut hooks = Map::new();
    for (stage, active) in &config.active_hooks_by_stage {
        if active.is_empty() {
            continue;
        }
        let entries: Vec<Value> = active.iter().map(|h| h.hook.clone()).collect();
        hooks.insert(stage.clone(), Value::Array(entries));
    }
    Value::Object(hooks)
}

fn annotations_member(config: &BundleConfig) -> Value {
    json!(config.annotations)
}

fn is_apparmor_profile_loaded(profile: &str) -> Result<bool, Error> {
    let loaded_profiles_path = Path::new("/sys/kernel/security/apparmor/profiles");
    if !loaded_profiles_path.exists() {
        return Err(Error::from(ErrorKind::Config(format!(
            "AppArmor profile use was configured but the loaded profiles list at {} does not exist; \
             ensure AppArmor is enabled and securityfs is mounted",
            loaded_profiles_path.display()
        ))));
    }
    let contents = std::fs::read_to_string(loaded_profiles_path)?;
    Ok(contents.lines().any(|line| {
        line.split_whitespace().next() == Some(profile)
    }))
}

/// Finds the gid of the `tty` group from the given `/etc/group`-format
/// file, used to mount `/dev/pts` with the right group ownership.
pub fn find_gid_of_tty_group(group_file: &Path) -> Result<Option<u32>, Error> {
    let contents = match std::fs::read_to_string(group_file) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::from(e)),
    };
    for line in contents.lines() {
        let mut fields = line.split(':');
        if fields.next() == Some("tty") {
            if let Some(gid) = fields.nth(1).and_then(|g| g.parse::<u32>().ok()) {
                return Ok(Some(gid));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> BundleConfig {
        BundleConfig {
            rootfs: PathBuf::from("/bundle/rootfs"),
            uid: Uid::from_raw(1000),
            gid: Gid::from_raw(1000),
            supplementary_gids: vec![],
            argv: vec!["/bin/sh".to_owned()],
            env: BTreeMap::from([("PATH".to_owned(), "/usr/bin".to_owned())]),
            workdir: "/".to_owned(),
            allocate_pseudo_tty: false,
            cpu_affinity: vec![0, 1],
            device_rules: vec![],
            create_new_pid_namespace: false,
            active_hooks_by_stage: BTreeMap::new(),
            annotations: BTreeMap::new(),
            apparmor_profile: None,
            selinux_label: None,
            selinux_mount_label: None,
            seccomp_profile_path: None,
            tty_gid: Some(5),
        }
    }

    #[test]
    fn renders_required_top_level_members() {
        let value = render(&minimal_config()).unwrap();
        let obj = value.as_object().unwrap();
        for key in ["ociVersion", "process", "root", "mounts", "linux", "hooks", "annotations"] {
            assert!(obj.contains_key(key), "missing {key}");
        }
    }

    #[test]
    fn root_path_and_readonly_match_source() {
        let value = render(&minimal_config()).unwrap();
        assert_eq!(value["root"]["path"], "/bundle/rootfs");
        assert_eq!(value["root"]["readonly"], false);
    }

    #[test]
    fn devpts_gets_tty_gid_option() {
        let value = render(&minimal_config()).unwrap();
        let options = value["mounts"][1]["options"].as_array().unwrap();
        assert!(options.iter().any(|o| o == "gid=5"));
    }

    #[test]
    fn pid_namespace_only_added_when_requested() {
        let mut config = minimal_config();
        let value = render(&config).unwrap();
        assert_eq!(value["linux"]["namespaces"].as_array().unwrap().len(), 1);

        config.create_new_pid_namespace = true;
        let value = render(&config).unwrap();
        assert_eq!(value["linux"]["namespaces"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn device_rules_follow_deny_all_default() {
        let mut config = minimal_config();
        config.device_rules.push(DeviceRule {
            allow: true,
            device_type: 'c',
            major: 195,
            minor: 0,
            access: "rw".to_owned(),
        });
        let value = render(&config).unwrap();
        let devices = value["linux"]["resources"]["devices"].as_array().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0]["allow"], false);
        assert_eq!(devices[1]["allow"], true);
        assert_eq!(devices[1]["major"], 195);
    }

    #[test]
    fn finds_tty_gid_from_group_file() {
        let dir = tempfile::tempdir().unwrap();
        let group_file = dir.path().join("group");
        std::fs::write(&group_file, "root:x:0:\ntty:x:5:\n").unwrap();
        assert_eq!(find_gid_of_tty_group(&group_file).unwrap(), Some(5));
    }

    #[test]
    fn missing_group_file_yields_no_gid() {
        let gid = find_gid_of_tty_group(Path::new("/nonexistent/group")).unwrap();
        assert_eq!(gid, None);
    }
}
