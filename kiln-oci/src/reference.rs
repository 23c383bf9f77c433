//! Image reference parsing: `[<server>/]<namespace>/<image>[:<tag>][@<digest>]`.
//!
//! The grammar is informative only (ref. upstream's CLI argument parser, out
//! of scope here per the engine's non-goals) — this module is the one piece
//! of reference handling the core itself must own, because the repository
//! keys its on-disk layout by the parsed fields (`server`, `namespace`,
//! `image`, `tag`).

use std::fmt;

/// Placeholder used in storage paths when a reference carries no explicit
/// server or namespace segment.
pub const DEFAULT_SEGMENT: &str = "default";

/// Default tag applied when neither a tag nor a digest is present.
const DEFAULT_TAG: &str = "latest";

/// A parsed image reference.
///
/// `server` and `namespace` are `None` when the input did not specify them
/// (e.g. a bare `"localhost:1234"` with no slash is *not* a server — it is
/// parsed as `image:tag`, see the module tests). Invariant: `tag` is
/// `Some` unless `digest` is `Some` (a reference with neither defaults its
/// tag to `"latest"`).
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Reference {
    /// Registry server, e.g. `server.io:1234`. `None` if unspecified.
    pub server: Option<String>,
    /// Namespace path, e.g. `namespace0/namespace1`. `None` if unspecified.
    pub namespace: Option<String>,
    /// Image name, the final path segment.
    pub image: String,
    /// Tag, e.g. `latest`. Mutually non-absent with `digest` per the
    /// reference invariant (defaults to `latest` when both are absent).
    pub tag: Option<String>,
    /// Content digest, e.g. `sha256:abcd…`.
    pub digest: Option<String>,
}

impl Reference {
    /// Parses a reference string, rejecting any occurrence of `..`
    /// as a path-traversal defense.
    pub fn parse(input: &str) -> crate::Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(crate::Error::InvalidReference("empty reference".into()));
        }
        if trimmed.contains("..") {
            return Err(crate::Error::InvalidReference(format!(
                "reference must not contain '..': {trimmed}"
            )));
        }

        let (name, digest) = match trimmed.split_once('@') {
            Some((n, d)) => {
                if !d.contains(':') {
                    return Err(crate::Error::InvalidReference(format!(
                        "invalid digest: {d}"
                    )));
                }
                (n, Some(d.to_owned()))
            }
            None => (trimmed, None),
        };

        let segments: Vec<&str> = name.split('/').collect();
        let (server, namespace, image_and_tag) = if segments.len() == 1 {
            (None, None, segments[0])
        } else if is_registry(segments[0]) {
            let rest = &segments[1..];
            let (ns, last) = split_namespace(rest);
            (Some(segments[0].to_owned()), ns, last)
        } else {
            let (ns, last) = split_namespace(&segments);
            (None, ns, last)
        };

        let (image, tag) = match image_and_tag.rsplit_once(':') {
            Some((img, t)) => (img.to_owned(), Some(t.to_owned())),
            None => (image_and_tag.to_owned(), None),
        };

        if image.is_empty() {
            return Err(crate::Error::InvalidReference(format!(
                "no image name in reference: {trimmed}"
            )));
        }

        let tag = match (tag, &digest) {
            (Some(t), _) => Some(t),
            (None, Some(_)) => None,
            (None, None) => Some(DEFAULT_TAG.to_owned()),
        };

        Ok(Self {
            server,
            namespace,
            image,
            tag,
            digest,
        })
    }

    /// Returns the tag or digest string used as the final storage path
    /// component, matching the persisted layout in spec §6.
    pub fn identifier_str(&self) -> &str {
        self.tag
            .as_deref()
            .or(self.digest.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Returns the `(server, namespace, image, identifier)` path components
    /// used to key the repository's on-disk layout, substituting
    /// [`DEFAULT_SEGMENT`] for absent server/namespace fields.
    pub fn path_components(&self) -> (&str, &str, &str, &str) {
        (
            self.server.as_deref().unwrap_or(DEFAULT_SEGMENT),
            self.namespace.as_deref().unwrap_or(DEFAULT_SEGMENT),
            &self.image,
            self.identifier_str(),
        )
    }
}

/// Splits a slice of path segments into `(namespace, last_segment)`: the
/// joined segments but the last form the namespace, the last segment is the
/// `image[:tag]` piece.
fn split_namespace<'a>(segments: &[&'a str]) -> (Option<String>, &'a str) {
    match segments.split_last() {
        Some((last, [])) => (None, last),
        Some((last, rest)) => (Some(rest.join("/")), last),
        None => (None, ""),
    }
}

/// A segment is treated as a registry server, not a namespace component,
/// if it looks like a hostname: contains a dot, a colon (port), or is the
/// literal `localhost`.
fn is_registry(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(server) = &self.server {
            write!(f, "{server}/")?;
        }
        if let Some(namespace) = &self.namespace {
            write!(f, "{namespace}/")?;
        }
        write!(f, "{}", self.image)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_path_traversal() {
        assert!(Reference::parse("server.io/../etc/passwd").is_err());
    }

    #[test]
    fn full_reference_with_server_namespace_tag_and_digest() {
        let r = Reference::parse(
            "server.io:1234/namespace0/namespace1/image:tag@sha256:d4ff818577bc193b309b355b02ebc9220427090057b54a59e73b79bdfe139b83",
        )
        .unwrap();
        assert_eq!(r.server.as_deref(), Some("server.io:1234"));
        assert_eq!(r.namespace.as_deref(), Some("namespace0/namespace1"));
        assert_eq!(r.image, "image");
        assert_eq!(r.tag.as_deref(), Some("tag"));
        assert_eq!(
            r.digest.as_deref(),
            Some("sha256:d4ff818577bc193b309b355b02ebc9220427090057b54a59e73b79bdfe139b83")
        );
    }

    #[test]
    fn bare_name_with_colon_and_digest_is_image_and_tag() {
        let r = Reference::parse(
            "localhost:1234@sha256:d4ff818577bc193b309b355b02ebc9220427090057b54a59e73b79bdfe139b83",
        )
        .unwrap();
        assert!(r.server.is_none());
        assert!(r.namespace.is_none());
        assert_eq!(r.image, "localhost");
        assert_eq!(r.tag.as_deref(), Some("1234"));
        assert!(r.digest.is_some());
    }

    #[test]
    fn defaults_tag_to_latest() {
        let r = Reference::parse("ubuntu").unwrap();
        assert_eq!(r.image, "ubuntu");
        assert_eq!(r.tag.as_deref(), Some("latest"));
    }

    #[test]
    fn namespace_without_registry_server() {
        let r = Reference::parse("myuser/myapp:v1").unwrap();
        assert!(r.server.is_none());
        assert_eq!(r.namespace.as_deref(), Some("myuser"));
        assert_eq!(r.image, "myapp");
        assert_eq!(r.tag.as_deref(), Some("v1"));
    }

    #[test]
    fn display_roundtrip_modulo_default_tag() {
        let r = Reference::parse("ghcr.io/org/app:v2").unwrap();
        assert_eq!(r.to_string(), "ghcr.io/org/app:v2");

        let bare = Reference::parse("ubuntu").unwrap();
        assert_eq!(bare.to_string(), "ubuntu:latest");
    }
}
