//! The engine's own JSON configuration file (§6).
//!
//! Read once at startup, before any privileged operation, and treated as an
//! immutable value for the rest of the process's life. When
//! `security_checks` is set, [`Config::load`] runs the weak (file-only)
//! tamperability check over the config file itself before anything else on
//! disk is touched, per §4.2's "the config JSON itself is always checked
//! weakly ... and must be read before the check" rule — the file is read
//! first, then validated, closing the TOCTOU window on a schema file that
//! doesn't exist in this crate (no JSON-schema validation library is used,
//! per the Non-goals) but would otherwise apply to one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorKind};
use crate::mount::MountPolicy;

/// Default list of destination prefixes a `--mount`/`--device` request may
/// not target, mirroring the reference engine's stock disallow-list.
fn default_disallowed_prefixes() -> Vec<String> {
    vec![
        "/etc".to_owned(),
        "/var".to_owned(),
        "/opt/kiln".to_owned(),
    ]
}

/// Default list of destinations a mount may not exactly equal.
fn default_disallowed_exact() -> Vec<String> {
    vec!["/opt".to_owned()]
}

/// Engine-config-level environment edits (`environment.{set,prepend,append,unset}`).
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct EnvironmentConfig {
    /// `KEY=VALUE` pairs applied with `set` (overwrite) semantics.
    #[serde(default)]
    pub set: Vec<String>,
    /// `KEY=VALUE` pairs prepended to any existing value.
    #[serde(default)]
    pub prepend: Vec<String>,
    /// `KEY=VALUE` pairs appended to any existing value.
    #[serde(default)]
    pub append: Vec<String>,
    /// Variable names removed outright.
    #[serde(default)]
    pub unset: Vec<String>,
}

impl EnvironmentConfig {
    /// Converts the `"KEY=VALUE"` string lists read from JSON into the
    /// `(key, value)` pairs [`crate::configs::EnvironmentPolicy`] expects.
    pub fn into_policy(self) -> Result<crate::configs::EnvironmentPolicy, Error> {
        Ok(crate::configs::EnvironmentPolicy {
            set: split_pairs(&self.set)?,
            prepend: split_pairs(&self.prepend)?,
            append: split_pairs(&self.append)?,
            unset: self.unset,
        })
    }
}

fn split_pairs(entries: &[String]) -> Result<Vec<(String, String)>, Error> {
    entries
        .iter()
        .map(|entry| {
            entry.split_once('=').map(|(k, v)| (k.to_owned(), v.to_owned())).ok_or_else(|| {
                Error::from(ErrorKind::Config(format!(
                    "malformed environment entry (expected KEY=VALUE): {entry}"
                )))
            })
        })
        .collect()
}

/// The engine configuration file's deserialized shape (§6).
#[derive(Debug, Clone, serde::Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Root prefix the engine and its shipped tooling are installed under.
    pub prefix_dir: PathBuf,
    /// Scratch directory new OCI bundles are created under.
    #[serde(rename = "OCIBundleDir")]
    pub oci_bundle_dir: PathBuf,
    /// Name of the rootfs subdirectory within a bundle (normally `rootfs`).
    #[serde(default = "default_rootfs_folder")]
    pub rootfs_folder: String,
    /// Base directory per-user local repositories are rooted under.
    pub local_repository_base_dir: PathBuf,
    /// Site-wide centralized repository root, if configured.
    #[serde(default)]
    pub centralized_repository_dir: Option<PathBuf>,
    /// Scratch directory for temporary files (unpack staging, squash temp).
    pub temp_dir: PathBuf,
    /// Path to the `skopeo`-class puller/loader binary.
    pub skopeo_path: PathBuf,
    /// Path to the `umoci`-class unpacker binary.
    pub umoci_path: PathBuf,
    /// Path to `mksquashfs`.
    pub mksquashfs_path: PathBuf,
    /// Extra options passed verbatim to `mksquashfs`.
    #[serde(default)]
    pub mksquashfs_options: Vec<String>,
    /// Path to the external OCI runtime (`runc`-class) executed on `run`.
    pub runc_path: PathBuf,
    /// Path to the init binary bind-mounted in as `/dev/init` with `--init`.
    pub init_path: PathBuf,
    /// Directory of OCI hook descriptor JSON files.
    #[serde(default)]
    pub hooks_dir: Option<PathBuf>,
    /// Path to a seccomp profile JSON file, embedded verbatim into
    /// `linux.seccomp`.
    #[serde(default)]
    pub seccomp_profile: Option<PathBuf>,
    /// AppArmor profile name to request via `process.apparmorProfile`.
    #[serde(default)]
    pub apparmor_profile: Option<String>,
    /// SELinux process label.
    #[serde(default)]
    pub selinux_label: Option<String>,
    /// SELinux mount label.
    #[serde(default)]
    pub selinux_mount_label: Option<String>,
    /// Whether PMIx v3 MCA variable passthrough is enabled (§4.11 step 4).
    #[serde(default, rename = "enablePMIxv3Support")]
    pub enable_pmi_xv3_support: bool,
    /// Whether path tamperability checks (§4.2) run before mounting.
    pub security_checks: bool,
    /// Environment edits applied during the configs merge (§4.11 step 6).
    #[serde(default)]
    pub environment: EnvironmentConfig,
    /// Site-administered mounts applied to every container ahead of any
    /// user-requested `--mount`, in the same
    /// `{type,source,destination,...}` shape accepted on the CLI.
    #[serde(default)]
    pub site_mounts: Vec<HashMap<String, String>>,
    /// Destination prefixes a mount request may not target.
    #[serde(default = "default_disallowed_prefixes")]
    pub mount_disallowed_destination_prefixes: Vec<String>,
    /// Destinations a mount request may not exactly equal.
    #[serde(default = "default_disallowed_exact")]
    pub mount_disallowed_destination_exact: Vec<String>,
    /// Source prefixes a mount request may not read from.
    #[serde(default)]
    pub mount_disallowed_source_prefixes: Vec<String>,
    /// Sources a mount request may not exactly equal.
    #[serde(default)]
    pub mount_disallowed_source_exact: Vec<String>,
}

fn default_rootfs_folder() -> String {
    "rootfs".to_owned()
}

impl Config {
    /// Reads and parses the engine config file at `path`.
    ///
    /// The file is read into memory first, then (if `security_checks`
    /// enables it after parsing) checked for tamperability — the read
    /// must happen before the check is meaningful, since the check has
    /// nothing to examine otherwise; this is not a TOCTOU risk for the
    /// parse itself because the bytes validated are the exact bytes parsed.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let bytes = std::fs::read(path)?;
        let config: Config = serde_json::from_slice(&bytes)
            .map_err(|e| Error::from(ErrorKind::Config(format!("{}: {e}", path.display()))))?;

        if config.security_checks {
            crate::pathval::check_untamperable(path, crate::pathval::Policy::Weak)?;
        }

        Ok(config)
    }

    /// The [`MountPolicy`] derived from this config's disallow-lists.
    pub fn mount_policy(&self) -> MountPolicy {
        MountPolicy {
            source_disallowed_prefixes: self.mount_disallowed_source_prefixes.clone(),
            source_disallowed_exact: self.mount_disallowed_source_exact.clone(),
            destination_disallowed_prefixes: self.mount_disallowed_destination_prefixes.clone(),
            destination_disallowed_exact: self.mount_disallowed_destination_exact.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{
            "prefixDir": "/opt/kiln",
            "OCIBundleDir": "/var/kiln/bundles",
            "localRepositoryBaseDir": "/scratch/repos",
            "tempDir": "/var/kiln/tmp",
            "skopeoPath": "/usr/bin/skopeo",
            "umociPath": "/usr/bin/umoci",
            "mksquashfsPath": "/usr/bin/mksquashfs",
            "runcPath": "/usr/sbin/runc",
            "initPath": "/usr/libexec/kiln/init",
            "securityChecks": false
        }"#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.json");
        std::fs::write(&path, minimal_json()).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.rootfs_folder, "rootfs");
        assert!(!config.enable_pmi_xv3_support);
        assert!(config.mount_disallowed_destination_prefixes.contains(&"/etc".to_owned()));
    }

    #[test]
    fn environment_config_splits_key_value_pairs() {
        let env = EnvironmentConfig {
            set: vec!["FOO=bar".to_owned()],
            ..Default::default()
        };
        let policy = env.into_policy().unwrap();
        assert_eq!(policy.set, vec![("FOO".to_owned(), "bar".to_owned())]);
    }

    #[test]
    fn parses_site_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.json");
        let mut json: serde_json::Value = serde_json::from_str(minimal_json()).unwrap();
        json["siteMounts"] = serde_json::json!([
            {"type": "bind", "source": "/scratch", "destination": "/scratch"}
        ]);
        std::fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.site_mounts.len(), 1);
        assert_eq!(config.site_mounts[0].get("destination"), Some(&"/scratch".to_owned()));
    }

    #[test]
    fn malformed_environment_entry_is_rejected() {
        let env = EnvironmentConfig {
            set: vec!["no-equals-sign".to_owned()],
            ..Default::default()
        };
        assert!(env.into_policy().is_err());
    }
}
