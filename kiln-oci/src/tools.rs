//! Thin drivers around the three external tools the engine delegates to
//! (§4.6, §4.7, §4.8): a `skopeo`-class puller/loader, an `umoci`-class
//! unpacker, and `mksquashfs`. None of their behavior is reimplemented —
//! these types only compose a command line, run it, and translate its exit
//! status into a typed error.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// Engine-side log levels, mirrored here only to derive the external tool's
/// own verbosity flag — the canonical level lives in `kiln`'s logging setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[non_exhaustive]
pub enum LogLevel {
    /// Most verbose.
    Debug,
    /// Informational.
    Info,
    /// Warnings only.
    Warn,
    /// Errors only.
    Error,
}

/// Maps the engine's log level to the external tool's `--log=` value.
///
/// Per spec §9's Design Notes, the reference engine passes `--log=error`
/// to the external tool even when its own level is `WARN` — the external
/// tool has no intermediate level between `info` and `error`, so `WARN`
/// is rounded down rather than up. Reproduced verbatim rather than
/// "fixed", since fixing it would diverge from the documented behavior.
fn verbosity_flag(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn | LogLevel::Error => "error",
    }
}

/// Result of a successful pull: the registry-side digest alongside the
/// populated OCI image layout directory.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PullOutcome {
    /// The OCI image layout directory populated by the tool.
    pub layout_dir: PathBuf,
    /// Registry-reported manifest digest, from `inspect`.
    pub digest: String,
}

/// Verifies a configured external tool path exists and is a regular file.
///
/// This is a plain existence check, distinct from the ownership/tamperability
/// check in `kiln::pathval` (§4.2), which the orchestrator applies separately
/// before any of these tools are invoked.
fn require_regular_file(path: &Path) -> crate::Result<()> {
    let is_file = std::fs::metadata(path).map(|m| m.is_file()).unwrap_or(false);
    if is_file {
        Ok(())
    } else {
        Err(crate::Error::ToolNotFound(path.display().to_string()))
    }
}

fn run(tool: &'static str, bin: &Path, args: &[impl AsRef<OsStr>]) -> crate::Result<Output> {
    let output = Command::new(bin)
        .args(args)
        .output()
        .map_err(crate::Error::Io)?;
    if !output.status.success() {
        return Err(crate::Error::Subprocess {
            tool,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(output)
}

/// Scans a tool's stderr for the registry auth-rejection substrings the
/// puller must translate into [`crate::Error::Auth`].
fn is_auth_rejection(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("unauthorized") || lower.contains("denied")
}

/// Number of attempts the puller makes at the `copy` step before giving up,
/// per §5's "fixed retry budget (≥3 tries on HTTP failures)".
const PULL_RETRY_MAX: u32 = 3;

/// Orchestrates `skopeo`-class pull/load/inspect invocations (§4.6).
#[derive(Debug, Clone)]
pub struct Puller {
    /// Path to the `skopeo`-class binary, from engine config `skopeoPath`.
    pub tool_path: PathBuf,
    /// Verbosity passed through to the tool's own `--log` flag.
    pub log_level: LogLevel,
}

impl Puller {
    /// Creates a puller, verifying the tool path is a regular file.
    pub fn new(tool_path: PathBuf, log_level: LogLevel) -> crate::Result<Self> {
        require_regular_file(&tool_path)?;
        Ok(Self {
            tool_path,
            log_level,
        })
    }

    /// Copies `docker://<reference>` into an OCI layout directory tagged
    /// `tag`. Pulls by digest are rejected — see spec §4.6.
    pub fn pull(&self, reference: &crate::Reference, layout_dir: &Path) -> crate::Result<PullOutcome> {
        if reference.digest.is_some() {
            return Err(crate::Error::InvalidReference(
                "pulling by digest is not supported".into(),
            ));
        }
        let mut digest = self.inspect_digest(reference)?;

        let src = format!("docker://{reference}");
        let dst = format!(
            "oci:{}:{}",
            layout_dir.display(),
            reference.identifier_str()
        );
        let log_flag = format!("--log={}", verbosity_flag(self.log_level));

        let mut last_err = None;
        for attempt in 0..PULL_RETRY_MAX {
            if attempt > 0 {
                tracing::warn!(%reference, attempt, "retrying pull");
            }

            let output = Command::new(&self.tool_path)
                .args(["copy", &log_flag, &src, &dst])
                .output()
                .map_err(crate::Error::Io)?;
            if output.status.success() {
                return Ok(PullOutcome {
                    layout_dir: layout_dir.to_path_buf(),
                    digest,
                });
            }

            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            if is_auth_rejection(&stderr) {
                // The tool's own credential cache is stale; a fresh
                // `inspect` forces it to re-request a token before the
                // next `copy` attempt.
                digest = self.inspect_digest(reference).unwrap_or(digest);
                last_err = Some(crate::Error::Auth {
                    reference: reference.to_string(),
                    detail: stderr,
                });
                continue;
            }
            last_err = Some(crate::Error::Subprocess {
                tool: "skopeo",
                status: output.status.to_string(),
                stderr,
            });
        }

        Err(last_err.unwrap_or_else(|| crate::Error::Subprocess {
            tool: "skopeo",
            status: "exhausted retries".to_owned(),
            stderr: String::new(),
        }))
    }

    /// Copies a local `docker-archive:` tarball into an OCI layout directory.
    pub fn load(&self, archive: &Path, layout_dir: &Path, tag: &str) -> crate::Result<()> {
        let src = format!("docker-archive:{}", archive.display());
        let dst = format!("oci:{}:{tag}", layout_dir.display());
        let log_flag = format!("--log={}", verbosity_flag(self.log_level));
        run("skopeo", &self.tool_path, &["copy", &log_flag, &src, &dst])?;
        Ok(())
    }

    /// Obtains the registry-side digest via `inspect docker://<reference>`,
    /// parsing the tool's JSON output for `.Digest`.
    pub fn inspect_digest(&self, reference: &crate::Reference) -> crate::Result<String> {
        let src = format!("docker://{reference}");
        let output = run("skopeo", &self.tool_path, &["inspect", &src])?;
        #[derive(serde::Deserialize)]
        struct Inspect {
            #[serde(rename = "Digest")]
            digest: Option<String>,
        }
        let parsed: Inspect = serde_json::from_slice(&output.stdout)?;
        parsed
            .digest
            .ok_or_else(|| crate::Error::MalformedLayout("inspect output missing Digest".into()))
    }
}

/// Drives an `umoci`-class rootless unpack of an OCI layout into a directory
/// (§4.7). Flags are fixed, not derived from log level.
#[derive(Debug, Clone)]
pub struct Unpacker {
    /// Path to the `umoci`-class binary, from engine config `umociPath`.
    pub tool_path: PathBuf,
}

impl Unpacker {
    /// Creates an unpacker, verifying the tool path is a regular file.
    pub fn new(tool_path: PathBuf) -> crate::Result<Self> {
        require_regular_file(&tool_path)?;
        Ok(Self { tool_path })
    }

    /// Unpacks `<layout_dir>:<tag>` into `dest`, logging elapsed time at INFO.
    pub fn unpack(&self, layout_dir: &Path, tag: &str, dest: &Path) -> crate::Result<()> {
        let image_spec = format!("{}:{tag}", layout_dir.display());
        let started = std::time::Instant::now();
        run(
            "umoci",
            &self.tool_path,
            &[
                OsStr::new("raw"),
                OsStr::new("unpack"),
                OsStr::new("--rootless"),
                OsStr::new("--image"),
                OsStr::new(&image_spec),
                dest.as_os_str(),
            ],
        )?;
        tracing::info!(elapsed = ?started.elapsed(), dest = %dest.display(), "unpacked rootfs");
        Ok(())
    }
}

/// Drives `mksquashfs` to build a read-only image, renaming it into place
/// atomically (§4.8).
#[derive(Debug, Clone)]
pub struct SquashfsBuilder {
    /// Path to the `mksquashfs` binary, from engine config `mksquashfsPath`.
    pub tool_path: PathBuf,
    /// Extra options passed verbatim, from engine config `mksquashfsOptions`.
    pub extra_options: Vec<String>,
}

impl SquashfsBuilder {
    /// Creates a builder, verifying the tool path is a regular file.
    pub fn new(tool_path: PathBuf, extra_options: Vec<String>) -> crate::Result<Self> {
        require_regular_file(&tool_path)?;
        Ok(Self {
            tool_path,
            extra_options,
        })
    }

    /// Builds a squashfs image from `src` directory, writing first to a
    /// sibling temp file and renaming over `dest` (atomic on the same
    /// filesystem).
    pub fn build(&self, src: &Path, dest: &Path) -> crate::Result<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let suffix: u32 = std::process::id();
        let temp_dest = dest.with_extension(format!("tmp{suffix}"));

        let mut args: Vec<&OsStr> = vec![src.as_os_str(), temp_dest.as_os_str()];
        for opt in &self.extra_options {
            args.push(OsStr::new(opt));
        }
        run("mksquashfs", &self.tool_path, &args)?;
        std::fs::rename(&temp_dest, dest)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_rounds_warn_down_to_error() {
        assert_eq!(verbosity_flag(LogLevel::Warn), "error");
        assert_eq!(verbosity_flag(LogLevel::Error), "error");
        assert_eq!(verbosity_flag(LogLevel::Info), "info");
        assert_eq!(verbosity_flag(LogLevel::Debug), "debug");
    }

    #[test]
    fn detects_auth_rejection_case_insensitively() {
        assert!(is_auth_rejection("Error: UNAUTHORIZED: access denied"));
        assert!(is_auth_rejection("denied: requested access to resource"));
        assert!(!is_auth_rejection("connection refused"));
    }

    #[test]
    fn rejects_missing_tool_path() {
        let missing = PathBuf::from("/nonexistent/skopeo-does-not-exist");
        assert!(Puller::new(missing, LogLevel::Info).is_err());
    }

    #[test]
    fn pull_retry_budget_is_at_least_three() {
        assert!(PULL_RETRY_MAX >= 3);
    }
}
