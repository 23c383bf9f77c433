//! OCI image handling for the kiln HPC container engine.
//!
//! Covers everything upstream of the locked repository (which lives in
//! `kiln-repo`): parsing image references, reading an OCI image layout into
//! [`ImageMetadata`], expanding layers into a rootfs tree with whiteout
//! handling, and driving the three external tools (`skopeo`-class puller,
//! `umoci`-class unpacker, `mksquashfs`) that do the actual heavy lifting.
//! None of these tools are reimplemented here — this crate is a thin,
//! typed layer over subprocess invocation and OCI-layout parsing.

mod extract;
mod layout;
mod reference;
mod tools;

pub use extract::{ArchiveSeverity, extract_layers};
pub use layout::{ImageMetadata, read_image_layout};
pub use reference::Reference;
pub use tools::{LogLevel, PullOutcome, Puller, SquashfsBuilder, Unpacker};

/// Result type for `kiln-oci` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from OCI image handling.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The image reference string could not be parsed.
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    /// The OCI image layout (`index.json`/manifest/config) was malformed.
    #[error("malformed OCI image layout: {0}")]
    MalformedLayout(String),

    /// An archive entry failed to read or extract.
    #[error("failed to extract {entry} from {archive}: {source}")]
    Extraction {
        /// Archive file the failing entry came from.
        archive: String,
        /// Path of the failing entry within the archive.
        entry: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An external tool (`skopeo`/`umoci`/`mksquashfs` class) exited non-zero
    /// or was terminated by a signal.
    #[error("{tool} exited with {status}: {stderr}")]
    Subprocess {
        /// Human-readable name of the external tool.
        tool: &'static str,
        /// Process exit status description.
        status: String,
        /// Captured standard error.
        stderr: String,
    },

    /// The registry rejected pull/login with `unauthorized`/`denied`.
    #[error("authentication failed pulling {reference}: {detail} (try --login)")]
    Auth {
        /// The reference being pulled.
        reference: String,
        /// Detail scraped from the tool's stderr.
        detail: String,
    },

    /// A configured external tool path does not exist or is not a regular file.
    #[error("configured tool path is not a regular file: {0}")]
    ToolNotFound(String),

    /// Filesystem I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
