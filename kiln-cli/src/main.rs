//! CLI entry point for the kiln HPC container engine (§6).
//!
//! A thin external collaborator over the `kiln`/`kiln-oci`/`kiln-repo`
//! core: argument parsing, engine-config loading, logging setup, and
//! dispatch. None of the core algorithms live here.

#![allow(clippy::print_stdout, clippy::print_stderr, clippy::missing_docs_in_private_items)]

mod run;

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use kiln::config::Config;
use kiln_oci::{LogLevel, Puller, Reference, SquashfsBuilder, Unpacker};
use kiln_repo::{Repository, StoredImage};

const DEFAULT_CONFIG_PATH: &str = "/etc/kiln/kiln.json";

#[derive(Parser)]
#[command(name = "kiln", version, about = "OCI-compatible container engine for HPC sites")]
struct Cli {
    /// Path to the engine configuration file.
    #[arg(long, env = "KILN_CONFIG", default_value = DEFAULT_CONFIG_PATH, global = true)]
    config: PathBuf,

    /// Enables debug-level logging (overridden by `KILN_LOG` if set).
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pull an image from a registry into the local repository.
    Pull {
        /// Image reference, e.g. `ubuntu:22.04`.
        reference: String,
    },

    /// Load a `docker save`-format tarball into the local repository.
    Load {
        /// Path to the archive.
        archive: PathBuf,
        /// Reference to record the loaded image under.
        reference: String,
    },

    /// List images in the local repository.
    Images {
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Remove one or more images from the local repository.
    Rmi {
        /// Image references to remove.
        #[arg(required = true, num_args = 1..)]
        references: Vec<String>,
    },

    /// Assemble a bundle from a stored image and run it via the external
    /// OCI runtime.
    Run(Box<run::RunArgs>),

    /// Print version information.
    Version,

    /// List configured runtime hooks, optionally filtered to one stage.
    Hooks {
        /// Restrict the listing to hooks active at this stage, e.g.
        /// `createRuntime`.
        stage: Option<String>,
    },

    /// Generate an SSH host key pair for the `--ssh` hook to bind-mount in.
    SshKeygen {
        /// Directory the generated key pair is written to.
        #[arg(long, default_value = "/etc/kiln/ssh")]
        output_dir: PathBuf,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for `images`.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = dispatch(cli) {
        eprintln!("kiln: {e:#}");
        std::process::exit(1);
    }
}

/// Initializes the process-wide `tracing` subscriber. `KILN_LOG` (an
/// `EnvFilter` directive string) takes priority over `--verbose`.
fn init_logging(verbose: bool) {
    let default_directive = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_env("KILN_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Pull { reference } => pull(&cli.config, &reference),
        Command::Load { archive, reference } => load(&cli.config, &archive, &reference),
        Command::Images { format } => images(&cli.config, format),
        Command::Rmi { references } => rmi(&cli.config, &references),
        Command::Run(args) => args.run(&cli.config),
        Command::Version => {
            println!("kiln {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Hooks { stage } => hooks(&cli.config, stage.as_deref()),
        Command::SshKeygen { output_dir } => ssh_keygen(&output_dir),
        Command::Completion { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "kiln", &mut std::io::stdout());
            Ok(())
        }
    }
}

/// Resolves the invoking user's login name and opens their local
/// repository under `config.local_repository_base_dir`.
///
/// `pull`/`load`/`rmi`/`images` only ever touch this repository — the
/// centralized, administrator-populated repository is out of scope for
/// every subcommand except `run`'s read-only fallback (§1 Non-goals:
/// "the centralized repository administration commands").
fn open_local_repository(config: &Config) -> Result<Repository> {
    let user = nix::unistd::User::from_uid(nix::unistd::getuid())
        .context("looking up invoking user")?
        .ok_or_else(|| anyhow::anyhow!("no passwd entry for the invoking uid"))?;
    Repository::open_local(&config.local_repository_base_dir, &user.name)
        .context("opening local image repository")
}

/// Resolves the repository `run` should read `reference` from: the local
/// repository if it has the image, otherwise a read-only fallback to the
/// centralized repository when one is configured.
fn resolve_run_repository(config: &Config, reference: &Reference) -> Result<Repository> {
    let local = open_local_repository(config)?;
    match local.get(reference) {
        Ok(_) => Ok(local),
        Err(kiln_repo::Error::NotFound(_)) => {
            let dir = config.centralized_repository_dir.clone().ok_or_else(|| {
                anyhow::anyhow!(
                    "image not found in local repository and no centralized repository is configured: {reference}"
                )
            })?;
            Repository::open_centralized(dir).context("opening centralized image repository")
        }
        Err(e) => Err(e.into()),
    }
}

fn pull(config_path: &Path, reference: &str) -> Result<()> {
    let config = Config::load(config_path).context("loading engine configuration")?;
    let reference = Reference::parse(reference).context("parsing image reference")?;
    let repository = open_local_repository(&config)?;

    let staging = tempfile::tempdir_in(&config.temp_dir).context("creating pull staging directory")?;
    let layout_dir = staging.path().join("layout");
    let rootfs_dir = staging.path().join("rootfs");

    let puller = Puller::new(config.skopeo_path.clone(), LogLevel::Info)?;
    let outcome = puller.pull(&reference, &layout_dir)?;

    let stored = ingest(&config, &repository, &reference, &layout_dir, &rootfs_dir, outcome.digest)?;
    println!("{}", stored.reference);
    Ok(())
}

fn load(config_path: &Path, archive: &Path, reference: &str) -> Result<()> {
    let config = Config::load(config_path).context("loading engine configuration")?;
    let reference = Reference::parse(reference).context("parsing image reference")?;
    let repository = open_local_repository(&config)?;

    let staging = tempfile::tempdir_in(&config.temp_dir).context("creating load staging directory")?;
    let layout_dir = staging.path().join("layout");
    let rootfs_dir = staging.path().join("rootfs");

    let puller = Puller::new(config.skopeo_path.clone(), LogLevel::Info)?;
    puller.load(archive, &layout_dir, reference.identifier_str())?;

    // There is no registry round-trip for a local load, so the image's own
    // config-blob digest stands in for the digest field a pull would get
    // from the registry (mirrors how engines show the image ID for images
    // with no known registry source).
    let metadata = kiln_oci::read_image_layout(&layout_dir).context("reading OCI image layout")?;
    let digest = metadata.image_id.clone();

    let stored = ingest(&config, &repository, &reference, &layout_dir, &rootfs_dir, digest)?;
    println!("{}", stored.reference);
    Ok(())
}

/// Shared `pull`/`load` tail: unpack the populated OCI layout into a
/// rootfs, build its squashfs, write the metadata sidecar, and record the
/// result in the repository.
fn ingest(
    config: &Config,
    repository: &Repository,
    reference: &Reference,
    layout_dir: &Path,
    rootfs_dir: &Path,
    digest: String,
) -> Result<StoredImage> {
    let metadata = kiln_oci::read_image_layout(layout_dir).context("reading OCI image layout")?;

    let unpacker = Unpacker::new(config.umoci_path.clone())?;
    unpacker.unpack(layout_dir, reference.identifier_str(), rootfs_dir)?;

    let squashfs_path = repository.squashfs_path_for(reference);
    let builder = SquashfsBuilder::new(config.mksquashfs_path.clone(), config.mksquashfs_options.clone())?;
    builder.build(rootfs_dir, &squashfs_path)?;

    let metadata_path = repository.metadata_path_for(reference);
    if let Some(parent) = metadata_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&metadata_path, serde_json::to_vec_pretty(&metadata)?)
        .context("writing image metadata sidecar")?;

    let size_bytes = std::fs::metadata(&squashfs_path)?.len();

    let stored = StoredImage {
        reference: reference.clone(),
        digest,
        size_bytes,
        created: chrono::Utc::now().to_rfc3339(),
        squashfs_path,
        metadata_path,
    };
    repository.insert(stored.clone())?;
    Ok(stored)
}

fn images(config_path: &Path, format: OutputFormat) -> Result<()> {
    let config = Config::load(config_path).context("loading engine configuration")?;
    let repository = open_local_repository(&config)?;
    let mut list = repository.list()?;
    list.sort_by(|a, b| a.reference.to_string().cmp(&b.reference.to_string()));

    if matches!(format, OutputFormat::Json) {
        #[derive(serde::Serialize)]
        struct Row<'a> {
            reference: String,
            digest: &'a str,
            size_bytes: u64,
            created: &'a str,
        }
        let rows: Vec<Row<'_>> = list
            .iter()
            .map(|image| Row {
                reference: image.reference.to_string(),
                digest: &image.digest,
                size_bytes: image.size_bytes,
                created: &image.created,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if list.is_empty() {
        println!("No images.");
        return Ok(());
    }
    println!("{:<50} {:<20} {:>10}  {}", "REFERENCE", "DIGEST", "SIZE", "CREATED");
    for image in &list {
        let short = &image.digest[..image.digest.len().min(19)];
        println!(
            "{:<50} {:<20} {:>10}  {}",
            image.reference.to_string(),
            short,
            human_size(image.size_bytes),
            image.created,
        );
    }
    Ok(())
}

fn rmi(config_path: &Path, references: &[String]) -> Result<()> {
    let config = Config::load(config_path).context("loading engine configuration")?;
    let repository = open_local_repository(&config)?;
    for raw in references {
        let reference = Reference::parse(raw).with_context(|| format!("parsing image reference {raw:?}"))?;
        repository.remove(&reference)?;
        println!("{raw}");
    }
    Ok(())
}

fn hooks(config_path: &Path, stage: Option<&str>) -> Result<()> {
    let config = Config::load(config_path).context("loading engine configuration")?;
    let Some(hooks_dir) = &config.hooks_dir else {
        println!("No hooks directory configured.");
        return Ok(());
    };
    let all_hooks = kiln::hooks::load_hooks(hooks_dir)?;
    if all_hooks.is_empty() {
        println!("No hooks configured.");
        return Ok(());
    }
    for hook in &all_hooks {
        if let Some(stage) = stage {
            if !hook.stages.iter().any(|s| s == stage) {
                continue;
            }
        }
        println!("{:<50} stages={}", hook.json_file.display(), hook.stages.join(","));
    }
    Ok(())
}

/// Generates an ed25519 SSH host key pair via the system `ssh-keygen`
/// binary for the shipped `--ssh` hook to bind-mount into the container.
/// The hook itself is a separate executable, out of scope here (§1
/// Non-goals) — this only prepares the key material it expects to find.
fn ssh_keygen(output_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(output_dir).context("creating SSH key output directory")?;
    let key_path = output_dir.join("ssh_host_ed25519_key");

    let status = std::process::Command::new("ssh-keygen")
        .args(["-t", "ed25519", "-f"])
        .arg(&key_path)
        .args(["-N", "", "-q"])
        .status()
        .context("spawning ssh-keygen")?;
    if !status.success() {
        anyhow::bail!("ssh-keygen exited with {status}");
    }
    println!("{}", key_path.display());
    Ok(())
}

/// Formats bytes into a human-readable size string.
#[allow(clippy::cast_precision_loss)]
fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} TB")
}
