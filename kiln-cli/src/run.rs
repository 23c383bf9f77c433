//! `kiln run` — assemble a bundle from a stored image and hand it to the
//! external OCI runtime.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context as _, Result};

use kiln::config::Config;
use kiln::configs::CliOverrides;
use kiln::identity::Identity;
use kiln::orchestrator::{self, RunRequest};
use kiln_oci::Reference;
use kiln_repo::Repository;

/// Arguments for `kiln run`.
///
/// Usage: `kiln run [OPTIONS] <reference> [COMMAND...]`
#[derive(clap::Args)]
#[command(trailing_var_arg = true)]
pub struct RunArgs {
    /// Image reference to run, as already pulled or loaded into a
    /// repository.
    reference: String,

    /// Command and arguments to run in place of the image's own
    /// entrypoint/cmd.
    #[arg(allow_hyphen_values = true)]
    command: Vec<String>,

    /// Bind mount, `type=bind,source=<path>,destination=<path>[,readonly]`.
    /// May be repeated.
    #[arg(long = "mount")]
    mounts: Vec<String>,

    /// Device passthrough, `<src>[:<dst>[:<perms>]]`. May be repeated.
    #[arg(long = "device")]
    devices: Vec<String>,

    /// Overrides the image's own entrypoint.
    #[arg(long)]
    entrypoint: Option<String>,

    /// Overrides the image's own working directory.
    #[arg(long)]
    workdir: Option<String>,

    /// Sets an environment variable, `KEY=VALUE`. May be repeated.
    #[arg(short = 'e', long = "env")]
    env: Vec<String>,

    /// Enables the MPI support hook, optionally naming its MPI flavor.
    #[arg(long, num_args = 0..=1, default_missing_value = "default")]
    mpi: Option<String>,

    /// Enables the glibc-replacement hook.
    #[arg(long)]
    glibc: bool,

    /// Enables the SSH-in-container hook.
    #[arg(long)]
    ssh: bool,

    /// Enables the Slurm global rank-synchronization hook.
    #[arg(long = "slurm-global-sync")]
    slurm_global_sync: bool,

    /// Bind-mounts the configured init binary as the container's PID 1.
    #[arg(long)]
    init: bool,

    /// Allocates a pseudo-TTY for the container's process.
    #[arg(long)]
    tty: bool,

    /// `private` requests a new PID namespace for the container.
    #[arg(long)]
    pid: Option<String>,

    /// Sets an annotation, `KEY=VALUE`. May be repeated.
    #[arg(long = "annotation")]
    annotations: Vec<String>,
}

impl RunArgs {
    pub fn run(self, config_path: &Path) -> Result<()> {
        let config = Config::load(config_path).context("loading engine configuration")?;
        let reference = Reference::parse(&self.reference).context("parsing image reference")?;
        let repository = crate::resolve_run_repository(&config, &reference)?;

        let user = Identity::current().context("reading invoking identity")?;

        let user_mounts = self
            .mounts
            .iter()
            .map(|raw| parse_mount_map(raw))
            .collect::<Result<Vec<_>>>()?;

        let env_set = self
            .env
            .iter()
            .map(|raw| split_key_value(raw))
            .collect::<Result<Vec<_>>>()?;
        let annotations = self
            .annotations
            .iter()
            .map(|raw| split_key_value(raw))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .collect();

        let cli = CliOverrides {
            entrypoint: self.entrypoint.map(|e| vec![e]),
            command: self.command,
            workdir: self.workdir,
            env_set,
            annotations,
            init: self.init,
            mpi_type: self.mpi,
            glibc: self.glibc,
            ssh: self.ssh,
            slurm_global_sync: self.slurm_global_sync,
            logging_level: None,
        };

        let request = RunRequest {
            reference,
            user,
            site_mounts: config.site_mounts.clone(),
            user_mounts,
            devices: self.devices,
            cli,
            new_pid_namespace: self.pid.as_deref() == Some("private"),
            tty: self.tty,
        };

        let status = orchestrator::run(&request, &config, &repository)?;
        std::process::exit(status.code().unwrap_or(1));
    }
}

/// Parses a repeated `--mount` argument's comma-separated `key=value` list
/// into the map [`kiln::mount::parse_mount_request`] expects.
fn parse_mount_map(raw: &str) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for entry in raw.split(',') {
        if entry == "readonly" {
            map.insert("readonly".to_owned(), "true".to_owned());
            continue;
        }
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("malformed --mount entry (expected key=value): {entry}"))?;
        map.insert(key.to_owned(), value.to_owned());
    }
    Ok(map)
}

/// Splits a `KEY=VALUE` argument, as used by `--env` and `--annotation`.
fn split_key_value(raw: &str) -> Result<(String, String)> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .with_context(|| format!("malformed KEY=VALUE argument: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mount_map_with_readonly_flag() {
        let map = parse_mount_map("type=bind,source=/a,destination=/b,readonly").unwrap();
        assert_eq!(map.get("type"), Some(&"bind".to_owned()));
        assert_eq!(map.get("source"), Some(&"/a".to_owned()));
        assert_eq!(map.get("readonly"), Some(&"true".to_owned()));
    }

    #[test]
    fn rejects_malformed_env_entry() {
        assert!(split_key_value("no-equals-sign").is_err());
    }
}
