//! Error taxonomy for the kiln runtime-assembly core (§7).
//!
//! Every error carries an appended trace of `(file, line, function,
//! message)` frames built up as it propagates, without discarding the
//! underlying classification. Call [`Error::with_frame`] (usually through
//! the [`trace!`] macro) at a call site that has context worth recording;
//! callers that have nothing to add just use `?`.

use std::fmt;

/// Result type for `kiln` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// One recorded propagation point.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Source file the frame was recorded in.
    pub file: &'static str,
    /// Line number the frame was recorded at.
    pub line: u32,
    /// Name of the function the frame was recorded in.
    pub function: &'static str,
    /// Caller-supplied context message.
    pub message: String,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} in {}: {}",
            self.file, self.line, self.function, self.message
        )
    }
}

/// An error from the core, classified by [`ErrorKind`] and annotated with a
/// trace of frames recorded as it propagated.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    trace: Vec<Frame>,
}

impl Error {
    /// Wraps a classified error with an empty trace.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            trace: Vec::new(),
        }
    }

    /// The error's classification.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Frames recorded as this error propagated, innermost first.
    pub fn trace(&self) -> &[Frame] {
        &self.trace
    }

    /// Appends a propagation frame and returns `self` for chaining at a
    /// `.map_err(|e| e.with_frame(...))?` call site.
    #[must_use]
    pub fn with_frame(
        mut self,
        file: &'static str,
        line: u32,
        function: &'static str,
        message: impl Into<String>,
    ) -> Self {
        self.trace.push(Frame {
            file,
            line,
            function,
            message: message.into(),
        });
        self
    }

    /// True for errors that always require restoring a saved identity
    /// before propagating further (§7, `IdentityError`).
    pub fn requires_identity_restoration(&self) -> bool {
        matches!(self.kind, ErrorKind::Identity(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::new(ErrorKind::Io(e))
    }
}

/// Classification of a core error (§7). Each non-recoverable variant maps
/// to a nonzero exit code only at the orchestrator's outermost frame; the
/// internal trace is only surfaced in user-facing messages at a debug log
/// level.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Malformed engine config or hook descriptor. Non-recoverable at run
    /// scope.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid image reference.
    #[error("invalid image reference: {0}")]
    Reference(String),

    /// Lock acquisition timeout, metadata corruption, or missing image.
    #[error("repository error: {0}")]
    Repository(String),

    /// Archive read/extract failure at or above the fatal severity
    /// threshold.
    #[error("layer extraction error: {0}")]
    Extraction(String),

    /// Mount validation failure (disallowed source/destination,
    /// cross-device, relative path) or `mount` syscall failure.
    #[error("mount error: {0}")]
    Mount(String),

    /// A credential syscall failed while switching identity. Always
    /// triggers a root-identity restoration attempt before propagating.
    #[error("identity error: {0}")]
    Identity(String),

    /// An external tool exited non-zero or was terminated by a signal.
    #[error("subprocess error: {0}")]
    Subprocess(String),

    /// Transient network failure from the puller, retriable within the
    /// retry budget.
    #[error("network error: {0}")]
    Network(String),

    /// The registry rejected pull/login with `unauthorized`/`denied`.
    #[error("authentication failed: {detail} (try --login)")]
    Auth {
        /// Detail scraped from the external tool's stderr.
        detail: String,
    },

    /// Hook condition evaluation or schema violation. A condition-
    /// evaluation failure disables that hook for the run (logged WARN,
    /// never fatal); a schema violation detected at load aborts the run.
    #[error("hook error: {0}")]
    Hook(String),

    /// A tamperability check failed on a trusted path. Always fatal,
    /// always checked before any mount is performed.
    #[error("security error: {0}")]
    Security(String),

    /// Filesystem I/O error with no more specific classification.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<kiln_oci::Error> for Error {
    fn from(e: kiln_oci::Error) -> Self {
        let kind = match &e {
            kiln_oci::Error::InvalidReference(_) => ErrorKind::Reference(e.to_string()),
            kiln_oci::Error::Extraction { .. } => ErrorKind::Extraction(e.to_string()),
            kiln_oci::Error::Subprocess { .. } => ErrorKind::Subprocess(e.to_string()),
            kiln_oci::Error::Auth { detail, .. } => ErrorKind::Auth {
                detail: detail.clone(),
            },
            kiln_oci::Error::ToolNotFound(_)
            | kiln_oci::Error::MalformedLayout(_)
            | kiln_oci::Error::Io(_)
            | kiln_oci::Error::Json(_) => ErrorKind::Config(e.to_string()),
        };
        Error::new(kind)
    }
}

impl From<kiln_repo::Error> for Error {
    fn from(e: kiln_repo::Error) -> Self {
        Error::new(ErrorKind::Repository(e.to_string()))
    }
}

/// Appends a propagation frame to a `kiln::Error` using the call site's
/// file, line, and enclosing function name.
#[macro_export]
macro_rules! trace {
    ($err:expr, $msg:expr) => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        let function: &'static str = &name[..name.len() - 3];
        $err.with_frame(file!(), line!(), function, $msg)
    }};
}
