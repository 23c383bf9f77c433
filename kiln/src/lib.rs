//! Runtime-assembly core of the kiln HPC container engine.
//!
//! Given a validated local image reference (resolved via `kiln-repo`), a
//! user identity, a CLI command, and a site configuration, this crate
//! assembles an OCI runtime bundle: a mounted rootfs plus a `config.json`
//! that is handed to an external, already-installed OCI runtime for actual
//! process launch. The engine itself never executes untrusted code — it
//! only ever execs into the external runtime, after dropping every
//! privilege it was started with.
//!
//! Module map, leaves first:
//! - [`identity`] — privilege switching (§4.1)
//! - [`pathval`] — tamperability checks and rootfs-confined path resolution (§4.2)
//! - [`mount`] — bind/device mount parsing and execution (§4.9/§4.10)
//! - [`configs`] — environment/argv/annotation merge (§4.11)
//! - [`hooks`] — OCI hook loading and activation (§4.12)
//! - [`ociconfig`] — `config.json` generation (§4.13)
//! - [`config`] — the engine's own JSON configuration file (§6)
//! - [`orchestrator`] — ties the above into the `run` sequence (§4.14)

pub mod config;
pub mod configs;
pub mod error;
pub mod hooks;
pub mod identity;
pub mod mount;
pub mod ociconfig;
pub mod orchestrator;
pub mod pathval;

pub use error::{Error, ErrorKind, Result};
