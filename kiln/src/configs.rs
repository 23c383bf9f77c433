//! Environment, annotation, and command merging (§4.11).
//!
//! Merge order is significant throughout this module: later steps are
//! allowed to override earlier ones, and the doc comment on each function
//! states the exact precedence chain it implements.

use std::collections::{BTreeMap, HashMap};

use kiln_oci::ImageMetadata;

/// User-supplied overrides collected from CLI flags, applied with the
/// highest priority at each merge step.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub entrypoint: Option<Vec<String>>,
    pub command: Vec<String>,
    pub workdir: Option<String>,
    pub env_set: Vec<(String, String)>,
    pub annotations: BTreeMap<String, String>,
    pub init: bool,
    pub mpi_type: Option<String>,
    pub glibc: bool,
    pub ssh: bool,
    pub slurm_global_sync: bool,
    pub logging_level: Option<String>,
}

/// Engine-config-level environment edits (`environment.{set,prepend,append,unset}`
/// in the engine config file).
#[derive(Debug, Clone, Default)]
pub struct EnvironmentPolicy {
    pub set: Vec<(String, String)>,
    pub prepend: Vec<(String, String)>,
    pub append: Vec<(String, String)>,
    pub unset: Vec<String>,
}

const PMIX_PREFIX: &str = "PMIX_";

/// Applies the NVIDIA/CUDA remap step described on [`build_environment`].
fn adjust_nvidia_vars(host_env: &[(String, String)], env: &mut BTreeMap<String, String>) {
    let host_cuda_visible_devices = host_env
        .iter()
        .find(|(k, _)| k == "CUDA_VISIBLE_DEVICES")
        .map(|(_, v)| v.as_str());

    match host_cuda_visible_devices {
        Some(devices) if devices != CUDA_NO_DEV_FILES => {
            env.insert("NVIDIA_VISIBLE_DEVICES".to_owned(), devices.to_owned());
            env.entry("NVIDIA_DRIVER_CAPABILITIES".to_owned())
                .or_insert_with(|| "all".to_owned());
            env.insert(
                "CUDA_VISIBLE_DEVICES".to_owned(),
                rank_within_sorted_list(devices),
            );
        }
        _ => {
            for key in [
                "CUDA_VERSION",
                "CUDA_VISIBLE_DEVICES",
                "NVIDIA_VISIBLE_DEVICES",
                "NVIDIA_DRIVER_CAPABILITIES",
            ] {
                env.remove(key);
            }
        }
    }
}

/// The `(host variable, MCA target variable)` pairs copied by
/// [`apply_pmix_v3_passthrough`].
const PMIX_V3_PAIRS: &[(&str, &str)] = &[
    ("PMIX_PTL_MODULE", "PMIX_MCA_ptl"),
    ("PMIX_SECURITY_MODE", "PMIX_MCA_psec"),
    ("PMIX_GDS_MODULE", "PMIX_MCA_gds"),
];

/// Copies each PMIx v3 host variable to its MCA target, only when the host
/// source is set and non-empty and the target is still unset or empty.
fn apply_pmix_v3_passthrough(host_env: &[(String, String)], env: &mut BTreeMap<String, String>) {
    for (source_key, target_key) in PMIX_V3_PAIRS {
        let source_value = host_env
            .iter()
            .find(|(k, _)| k == source_key)
            .map(|(_, v)| v.as_str())
            .unwrap_or("");
        if source_value.is_empty() {
            continue;
        }
        let target_is_empty = env.get(*target_key).is_none_or(|v| v.is_empty());
        if target_is_empty {
            env.insert((*target_key).to_owned(), source_value.to_owned());
        }
    }
}

/// Rewrites a comma-separated device list to each element's rank within
/// the list sorted ascending, e.g. `"3,1,5"` -> `"1,0,2"`.
fn rank_within_sorted_list(list: &str) -> String {
    let entries: Vec<&str> = list.split(',').collect();
    let mut sorted = entries.clone();
    sorted.sort_unstable();

    entries
        .iter()
        .map(|entry| {
            sorted
                .iter()
                .position(|candidate| candidate == entry)
                .unwrap_or(0)
                .to_string()
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Resolves the working directory: CLI override, else the image's
/// configured working directory, else `/`.
pub fn resolve_workdir(cli: &CliOverrides, metadata: &ImageMetadata) -> String {
    cli.workdir
        .clone()
        .or_else(|| metadata.workdir.clone())
        .unwrap_or_else(|| "/".to_owned())
}

/// Sentinel host `CUDA_VISIBLE_DEVICES` value meaning "no GPUs are visible",
/// distinct from the variable simply being unset.
const CUDA_NO_DEV_FILES: &str = "NoDevFiles";

/// Builds the final environment map for the container process.
///
/// Order (later wins on key collision):
/// 1. The engine process's own environment.
/// 2. The image's configured environment, excluding `PMIX_*` keys (those
///    belong to the launching MPI runtime on the host, not the image).
/// 3. NVIDIA/CUDA device remap (`adjustNvidiaVars`): if the host's
///    `CUDA_VISIBLE_DEVICES` is set and not `"NoDevFiles"`, its value is
///    copied verbatim into `NVIDIA_VISIBLE_DEVICES`,
///    `NVIDIA_DRIVER_CAPABILITIES` defaults to `"all"` if still unset, and
///    `CUDA_VISIBLE_DEVICES` itself is rewritten to each entry's rank
///    within the sorted host list (host `3,1,5` becomes `1,0,2`). If the
///    host variable is absent or `"NoDevFiles"`, all four NVIDIA/CUDA keys
///    are instead removed from the environment entirely.
/// 4. PMIx v3 MCA variable passthrough, if enabled in site config.
/// 5. `TINI_SUBREAPER=1`, if `init` was requested.
/// 6. Engine config `environment.set/prepend/append/unset`, applied in that
///    field order.
/// 7. CLI user environment (`--env`), which always wins.
pub fn build_environment(
    cli: &CliOverrides,
    metadata: &ImageMetadata,
    policy: &EnvironmentPolicy,
    host_env: &[(String, String)],
    enable_pmix_v3: bool,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = BTreeMap::new();

    for (k, v) in host_env {
        env.insert(k.clone(), v.clone());
    }

    for (k, v) in &metadata.env {
        if k.starts_with(PMIX_PREFIX) {
            continue;
        }
        env.insert(k.clone(), v.clone());
    }

    adjust_nvidia_vars(host_env, &mut env);

    if enable_pmix_v3 {
        apply_pmix_v3_passthrough(host_env, &mut env);
    }

    if cli.init {
        env.insert("TINI_SUBREAPER".to_owned(), "1".to_owned());
    }

    for (k, v) in &policy.set {
        env.insert(k.clone(), v.clone());
    }
    for (k, v) in &policy.prepend {
        env.entry(k.clone())
            .and_modify(|existing| *existing = format!("{v}:{existing}"))
            .or_insert_with(|| v.clone());
    }
    for (k, v) in &policy.append {
        env.entry(k.clone())
            .and_modify(|existing| {
                existing.push(':');
                existing.push_str(v);
            })
            .or_insert_with(|| v.clone());
    }
    for k in &policy.unset {
        env.remove(k);
    }

    for (k, v) in &cli.env_set {
        env.insert(k.clone(), v.clone());
    }

    env
}

/// Builds the final annotation map passed to hook condition evaluation and
/// into the OCI bundle config.
///
/// Order (later wins on key collision):
/// 1. Auto-derived hook-enable flags from CLI feature flags
///    (`com.hooks.{glibc,mpi,slurm-global-sync,ssh}.enabled`,
///    `com.hooks.mpi.type`, `com.hooks.logging.level`).
/// 2. CLI/engine-supplied annotations (`--annotation`), which override the
///    auto-derived flags.
/// 3. The image's own labels, inserted only where the key is still absent
///    — image labels can supply context but never override the run's own
///    annotations.
pub fn build_annotations(
    cli: &CliOverrides,
    metadata: &ImageMetadata,
) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();

    if cli.glibc {
        annotations.insert("com.hooks.glibc.enabled".to_owned(), "true".to_owned());
    }
    if let Some(mpi_type) = &cli.mpi_type {
        annotations.insert("com.hooks.mpi.enabled".to_owned(), "true".to_owned());
        annotations.insert("com.hooks.mpi.type".to_owned(), mpi_type.clone());
    }
    if cli.slurm_global_sync {
        annotations.insert(
            "com.hooks.slurm-global-sync.enabled".to_owned(),
            "true".to_owned(),
        );
    }
    if cli.ssh {
        annotations.insert("com.hooks.ssh.enabled".to_owned(), "true".to_owned());
    }
    if let Some(level) = &cli.logging_level {
        annotations.insert("com.hooks.logging.level".to_owned(), level.clone());
    }

    for (k, v) in &cli.annotations {
        annotations.insert(k.clone(), v.clone());
    }

    for (k, v) in &metadata.labels {
        annotations.entry(k.clone()).or_insert_with(|| v.clone());
    }

    annotations
}

/// Resolves the process entrypoint and argv.
///
/// Precedence: an optional `/dev/init --` prefix (when `init` requested),
/// then: CLI entrypoint + CLI args, else image entrypoint + CLI args (if
/// any CLI args were given), else image entrypoint + image cmd, else image
/// cmd alone. It is an error for no entrypoint or command to resolve at
/// all.
pub fn resolve_command(
    cli: &CliOverrides,
    metadata: &ImageMetadata,
) -> Result<Vec<String>, crate::error::Error> {
    let image_entry = metadata.entry.clone().unwrap_or_default();
    let image_cmd = metadata.cmd.clone().unwrap_or_default();

    let base: Vec<String> = if let Some(entrypoint) = &cli.entrypoint {
        let mut v = entrypoint.clone();
        v.extend(cli.command.iter().cloned());
        v
    } else if !cli.command.is_empty() {
        let mut v = image_entry;
        v.extend(cli.command.iter().cloned());
        v
    } else {
        let mut v = image_entry;
        v.extend(image_cmd);
        v
    };

    if base.is_empty() {
        return Err(crate::error::Error::from(crate::error::ErrorKind::Config(
            "no entrypoint or command resolved for the container process".to_owned(),
        )));
    }

    let mut argv: Vec<String> = Vec::new();
    if cli.init {
        argv.push("/dev/init".to_owned());
        argv.push("--".to_owned());
    }
    argv.extend(base);

    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata_with(entry: Option<Vec<&str>>, cmd: Option<Vec<&str>>) -> ImageMetadata {
        ImageMetadata {
            cmd: cmd.map(|v| v.into_iter().map(str::to_owned).collect()),
            entry: entry.map(|v| v.into_iter().map(str::to_owned).collect()),
            workdir: None,
            env: HashMap::new(),
            labels: HashMap::new(),
            image_id: "sha256:deadbeef".to_owned(),
        }
    }

    #[test]
    fn command_falls_back_to_image_entry_and_cmd() {
        let cli = CliOverrides::default();
        let metadata = metadata_with(Some(vec!["/bin/sh"]), Some(vec!["-c", "echo hi"]));
        let argv = resolve_command(&cli, &metadata).unwrap();
        assert_eq!(argv, vec!["/bin/sh", "-c", "echo hi"]);
    }

    #[test]
    fn cli_entrypoint_overrides_image_entry() {
        let cli = CliOverrides {
            entrypoint: Some(vec!["/bin/bash".to_owned()]),
            command: vec!["-lc".to_owned(), "true".to_owned()],
            ..Default::default()
        };
        let metadata = metadata_with(Some(vec!["/bin/sh"]), Some(vec!["-c", "echo hi"]));
        let argv = resolve_command(&cli, &metadata).unwrap();
        assert_eq!(argv, vec!["/bin/bash", "-lc", "true"]);
    }

    #[test]
    fn init_prefixes_dev_init() {
        let cli = CliOverrides {
            init: true,
            command: vec!["/bin/true".to_owned()],
            ..Default::default()
        };
        let metadata = metadata_with(None, None);
        let argv = resolve_command(&cli, &metadata).unwrap();
        assert_eq!(argv, vec!["/dev/init", "--", "/bin/true"]);
    }

    #[test]
    fn errors_when_nothing_resolves() {
        let cli = CliOverrides::default();
        let metadata = metadata_with(None, None);
        assert!(resolve_command(&cli, &metadata).is_err());
    }

    #[test]
    fn environment_excludes_pmix_by_default_and_adds_subreaper() {
        let cli = CliOverrides {
            init: true,
            ..Default::default()
        };
        let mut metadata = metadata_with(None, None);
        metadata.env = HashMap::from([
            ("PMIX_RANK".to_owned(), "0".to_owned()),
            ("FOO".to_owned(), "bar".to_owned()),
        ]);
        let policy = EnvironmentPolicy::default();
        let env = build_environment(&cli, &metadata, &policy, &[], false);
        assert!(!env.contains_key("PMIX_RANK"));
        assert_eq!(env.get("FOO"), Some(&"bar".to_owned()));
        assert_eq!(env.get("TINI_SUBREAPER"), Some(&"1".to_owned()));
    }

    #[test]
    fn prepend_and_append_policy_join_with_colon() {
        let cli = CliOverrides::default();
        let metadata = metadata_with(None, None);
        let policy = EnvironmentPolicy {
            prepend: vec![("PATH".to_owned(), "/opt/bin".to_owned())],
            append: vec![("LD_LIBRARY_PATH".to_owned(), "/opt/lib".to_owned())],
            ..Default::default()
        };
        let host_env = [
            ("PATH".to_owned(), "/usr/bin".to_owned()),
            ("LD_LIBRARY_PATH".to_owned(), "/usr/lib".to_owned()),
        ];
        let env = build_environment(&cli, &metadata, &policy, &host_env, false);
        assert_eq!(env.get("PATH"), Some(&"/opt/bin:/usr/bin".to_owned()));
        assert_eq!(
            env.get("LD_LIBRARY_PATH"),
            Some(&"/usr/lib:/opt/lib".to_owned())
        );
    }

    #[test]
    fn cli_env_wins_over_everything() {
        let cli = CliOverrides {
            env_set: vec![("FOO".to_owned(), "cli".to_owned())],
            ..Default::default()
        };
        let mut metadata = metadata_with(None, None);
        metadata.env = HashMap::from([("FOO".to_owned(), "image".to_owned())]);
        let policy = EnvironmentPolicy {
            set: vec![("FOO".to_owned(), "policy".to_owned())],
            ..Default::default()
        };
        let env = build_environment(&cli, &metadata, &policy, &[], false);
        assert_eq!(env.get("FOO"), Some(&"cli".to_owned()));
    }

    #[test]
    fn nvidia_devices_remap_by_rank_within_sorted_host_list() {
        let cli = CliOverrides::default();
        let mut metadata = metadata_with(None, None);
        metadata.env = HashMap::from([("NVIDIA_VISIBLE_DEVICES".to_owned(), "all".to_owned())]);
        let policy = EnvironmentPolicy::default();
        let host_env = [("CUDA_VISIBLE_DEVICES".to_owned(), "3,1,5".to_owned())];
        let env = build_environment(&cli, &metadata, &policy, &host_env, false);
        assert_eq!(env.get("CUDA_VISIBLE_DEVICES"), Some(&"1,0,2".to_owned()));
        assert_eq!(env.get("NVIDIA_VISIBLE_DEVICES"), Some(&"3,1,5".to_owned()));
        assert_eq!(env.get("NVIDIA_DRIVER_CAPABILITIES"), Some(&"all".to_owned()));
    }

    #[test]
    fn nvidia_vars_removed_when_host_has_no_dev_files() {
        let cli = CliOverrides::default();
        let mut metadata = metadata_with(None, None);
        metadata.env = HashMap::from([
            ("CUDA_VERSION".to_owned(), "12.2".to_owned()),
            ("NVIDIA_VISIBLE_DEVICES".to_owned(), "all".to_owned()),
        ]);
        let policy = EnvironmentPolicy::default();
        let host_env = [("CUDA_VISIBLE_DEVICES".to_owned(), "NoDevFiles".to_owned())];
        let env = build_environment(&cli, &metadata, &policy, &host_env, false);
        assert!(!env.contains_key("CUDA_VERSION"));
        assert!(!env.contains_key("NVIDIA_VISIBLE_DEVICES"));
        assert!(!env.contains_key("CUDA_VISIBLE_DEVICES"));
    }

    #[test]
    fn pmix_v3_passthrough_copies_only_when_target_unset() {
        let cli = CliOverrides::default();
        let metadata = metadata_with(None, None);
        let policy = EnvironmentPolicy::default();
        let host_env = [
            ("PMIX_PTL_MODULE".to_owned(), "ucx".to_owned()),
            ("PMIX_SECURITY_MODE".to_owned(), "".to_owned()),
        ];
        let env = build_environment(&cli, &metadata, &policy, &host_env, true);
        assert_eq!(env.get("PMIX_MCA_ptl"), Some(&"ucx".to_owned()));
        assert!(!env.contains_key("PMIX_MCA_psec"));
    }

    #[test]
    fn pmix_v3_passthrough_is_skipped_when_disabled() {
        let cli = CliOverrides::default();
        let metadata = metadata_with(None, None);
        let policy = EnvironmentPolicy::default();
        let host_env = [("PMIX_PTL_MODULE".to_owned(), "ucx".to_owned())];
        let env = build_environment(&cli, &metadata, &policy, &host_env, false);
        assert!(!env.contains_key("PMIX_MCA_ptl"));
    }

    #[test]
    fn annotations_image_labels_never_override() {
        let cli = CliOverrides {
            annotations: BTreeMap::from([("custom.key".to_owned(), "cli".to_owned())]),
            ..Default::default()
        };
        let mut metadata = metadata_with(None, None);
        metadata.labels = HashMap::from([
            ("custom.key".to_owned(), "image".to_owned()),
            ("other.key".to_owned(), "image".to_owned()),
        ]);
        let annotations = build_annotations(&cli, &metadata);
        assert_eq!(annotations.get("custom.key"), Some(&"cli".to_owned()));
        assert_eq!(annotations.get("other.key"), Some(&"image".to_owned()));
    }

    #[test]
    fn mpi_flag_sets_enabled_and_type_annotations() {
        let cli = CliOverrides {
            mpi_type: Some("mpich".to_owned()),
            ..Default::default()
        };
        let metadata = metadata_with(None, None);
        let annotations = build_annotations(&cli, &metadata);
        assert_eq!(
            annotations.get("com.hooks.mpi.enabled"),
            Some(&"true".to_owned())
        );
        assert_eq!(
            annotations.get("com.hooks.mpi.type"),
            Some(&"mpich".to_owned())
        );
    }
}
