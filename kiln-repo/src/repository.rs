//! Locked local and centralized repositories (§3 "Repository", §4.3, and the
//! persisted layout in §6): a directory tree of already-ingested images,
//! indexed by a JSON metadata file that is only ever mutated under an
//! exclusive [`Flock`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kiln_oci::Reference;

use crate::flock::{Flock, LockType};

/// Default time to wait for the metadata lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(120);
/// Default time waited before the first "still waiting" warning.
pub const DEFAULT_LOCK_WARN_AFTER: Duration = Duration::from_secs(10);

const METADATA_FILE: &str = "metadata.json";
const LOCK_FILE: &str = "metadata.json.lock";
const IMAGES_DIR: &str = "images";
const CACHE_DIR: &str = "cache";

/// Which kind of repository a [`Repository`] handle addresses.
///
/// A local repository lives under a user's home directory and requires no
/// privilege. A centralized repository is shared site-wide and may only be
/// opened by an effective-root process, since it is populated by
/// administrators and mounted read-only into every container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryKind {
    /// Per-user repository.
    Local,
    /// Site-wide, administrator-populated repository.
    Centralized,
}

/// A single ingested image's repository bookkeeping record (§3 "Stored
/// Image"): the reference it was ingested under, its digest, the squashfs
/// and sidecar metadata file paths, and size/creation-time accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct StoredImage {
    /// The reference this image was pulled or loaded under.
    pub reference: Reference,
    /// Manifest digest reported at pull/load time.
    pub digest: String,
    /// Size in bytes of the squashfs file.
    pub size_bytes: u64,
    /// RFC 3339 timestamp of when the image was ingested.
    pub created: String,
    /// Absolute path of the image's squashfs file.
    pub squashfs_path: PathBuf,
    /// Absolute path of the image's sidecar metadata (`ImageMetadata`) file.
    pub metadata_path: PathBuf,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Entry {
    digest: String,
    size_bytes: u64,
    created: String,
    squashfs_path: PathBuf,
    metadata_path: PathBuf,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct Index {
    #[serde(default)]
    images: BTreeMap<String, Entry>,
}

/// A locked image repository rooted at a directory containing
/// `metadata.json`, `metadata.json.lock`, `images/`, and `cache/`.
#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
    kind: RepositoryKind,
    lock_timeout: Duration,
    lock_warn_after: Duration,
}

impl Repository {
    /// Opens (creating if absent) the local repository for `username` under
    /// `base_dir`, e.g. `<base_dir>/<username>/.kiln`.
    pub fn open_local(base_dir: &Path, username: &str) -> crate::Result<Self> {
        let root = base_dir.join(username).join(".kiln");
        Self::open(root, RepositoryKind::Local)
    }

    /// Opens the local repository under the calling user's own home
    /// directory, the default base when no site-specific base is
    /// configured.
    pub fn open_local_in_home() -> crate::Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            crate::Error::Io(std::io::Error::other("could not determine home directory"))
        })?;
        Self::open(home.join(".kiln"), RepositoryKind::Local)
    }

    /// Opens the site-wide centralized repository rooted at `root`.
    ///
    /// Returns [`crate::Error::RequiresRoot`] unless the calling process's
    /// effective uid is 0 — the centralized repository is populated by
    /// administrators and must not be mutated by unprivileged users.
    pub fn open_centralized(root: PathBuf) -> crate::Result<Self> {
        if !nix::unistd::geteuid().is_root() {
            return Err(crate::Error::RequiresRoot);
        }
        Self::open(root, RepositoryKind::Centralized)
    }

    fn open(root: PathBuf, kind: RepositoryKind) -> crate::Result<Self> {
        std::fs::create_dir_all(root.join(IMAGES_DIR))?;
        std::fs::create_dir_all(root.join(CACHE_DIR))?;
        Ok(Self {
            root,
            kind,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_warn_after: DEFAULT_LOCK_WARN_AFTER,
        })
    }

    /// Overrides the default lock-wait timeout and warning interval.
    pub fn with_lock_timing(mut self, timeout: Duration, warn_after: Duration) -> Self {
        self.lock_timeout = timeout;
        self.lock_warn_after = warn_after;
        self
    }

    /// Which kind of repository this handle addresses.
    pub fn kind(&self) -> RepositoryKind {
        self.kind
    }

    /// Root directory of this repository.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the content-addressed layer tar cache.
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(CACHE_DIR)
    }

    /// Path a new image's squashfs file would be written to, derived from
    /// the reference's path components (§4.5/§6).
    pub fn squashfs_path_for(&self, reference: &Reference) -> PathBuf {
        let (server, namespace, image, tag) = reference.path_components();
        self.root
            .join(IMAGES_DIR)
            .join(server)
            .join(namespace)
            .join(image)
            .join(format!("{tag}.squashfs"))
    }

    /// Path a new image's sidecar metadata file would be written to.
    pub fn metadata_path_for(&self, reference: &Reference) -> PathBuf {
        let (server, namespace, image, tag) = reference.path_components();
        self.root
            .join(IMAGES_DIR)
            .join(server)
            .join(namespace)
            .join(image)
            .join(format!("{tag}.meta"))
    }

    fn lock(&self, lock_type: LockType) -> crate::Result<Flock> {
        Flock::acquire(
            &self.root.join(LOCK_FILE),
            lock_type,
            self.lock_timeout,
            self.lock_warn_after,
        )
    }

    fn read_index_locked(&self) -> crate::Result<Index> {
        let path = self.root.join(METADATA_FILE);
        match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => Ok(Index::default()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| {
                crate::Error::CorruptMetadata {
                    path: path.display().to_string(),
                    source,
                }
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Index::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes `index` to `metadata.json` atomically: serialize to a sibling
    /// temp file, then `rename` over the real path.
    fn write_index_locked(&self, index: &Index) -> crate::Result<()> {
        let path = self.root.join(METADATA_FILE);
        let temp_path = self.root.join(format!("{METADATA_FILE}.tmp{}", std::process::id()));
        let bytes = serde_json::to_vec_pretty(index)?;
        std::fs::write(&temp_path, bytes)?;
        std::fs::rename(&temp_path, &path)?;
        Ok(())
    }

    /// Lists every image currently recorded in the metadata index.
    pub fn list(&self) -> crate::Result<Vec<StoredImage>> {
        let _lock = self.lock(LockType::Read)?;
        let index = self.read_index_locked()?;
        index
            .images
            .into_iter()
            .map(|(key, entry)| to_stored_image(&key, entry))
            .collect()
    }

    /// Looks up a single stored image by reference.
    pub fn get(&self, reference: &Reference) -> crate::Result<StoredImage> {
        let _lock = self.lock(LockType::Read)?;
        let index = self.read_index_locked()?;
        let key = reference.to_string();
        let entry = index
            .images
            .get(&key)
            .cloned()
            .ok_or_else(|| crate::Error::NotFound(key.clone()))?;
        to_stored_image(&key, entry)
    }

    /// Inserts or replaces a stored image's record under an exclusive lock.
    pub fn insert(&self, image: StoredImage) -> crate::Result<()> {
        let _lock = self.lock(LockType::Write)?;
        let mut index = self.read_index_locked()?;
        index.images.insert(
            image.reference.to_string(),
            Entry {
                digest: image.digest,
                size_bytes: image.size_bytes,
                created: image.created,
                squashfs_path: image.squashfs_path,
                metadata_path: image.metadata_path,
            },
        );
        self.write_index_locked(&index)
    }

    /// Removes a stored image's record and its on-disk squashfs/metadata
    /// files under an exclusive lock. Missing files are tolerated.
    pub fn remove(&self, reference: &Reference) -> crate::Result<()> {
        let _lock = self.lock(LockType::Write)?;
        let mut index = self.read_index_locked()?;
        let key = reference.to_string();
        let entry = index
            .images
            .remove(&key)
            .ok_or_else(|| crate::Error::NotFound(key.clone()))?;
        self.write_index_locked(&index)?;

        for path in [&entry.squashfs_path, &entry.metadata_path] {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

fn to_stored_image(key: &str, entry: Entry) -> crate::Result<StoredImage> {
    let reference = Reference::parse(key)
        .map_err(|_| crate::Error::CorruptMetadata {
            path: key.to_owned(),
            source: serde::de::Error::custom("indexed key is not a valid reference"),
        })?;
    Ok(StoredImage {
        reference,
        digest: entry.digest,
        size_bytes: entry.size_bytes,
        created: entry.created,
        squashfs_path: entry.squashfs_path,
        metadata_path: entry.metadata_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(reference: &str) -> StoredImage {
        let r = Reference::parse(reference).unwrap();
        StoredImage {
            squashfs_path: PathBuf::from(format!("/tmp/{reference}.squashfs")),
            metadata_path: PathBuf::from(format!("/tmp/{reference}.meta")),
            reference: r,
            digest: "sha256:aaaa".to_owned(),
            size_bytes: 1024,
            created: "2026-01-01T00:00:00Z".to_owned(),
        }
    }

    #[test]
    fn insert_then_list_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::open_local(dir.path(), "alice").unwrap();

        let image = sample("registry.example/ns/tool:1.0");
        repo.insert(image.clone()).unwrap();

        let listed = repo.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].digest, image.digest);

        let fetched = repo.get(&image.reference).unwrap();
        assert_eq!(fetched.size_bytes, 1024);
    }

    #[test]
    fn get_missing_image_errors() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::open_local(dir.path(), "alice").unwrap();
        let reference = Reference::parse("ns/tool:1.0").unwrap();
        assert!(matches!(
            repo.get(&reference),
            Err(crate::Error::NotFound(_))
        ));
    }

    #[test]
    fn remove_deletes_record_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::open_local(dir.path(), "alice").unwrap();

        let image = sample("ns/tool:1.0");
        std::fs::write(&image.squashfs_path, b"fake").unwrap();
        std::fs::write(&image.metadata_path, b"{}").unwrap();
        repo.insert(image.clone()).unwrap();

        repo.remove(&image.reference).unwrap();
        assert!(repo.get(&image.reference).is_err());
        assert!(!image.squashfs_path.exists());
    }

    #[test]
    fn path_helpers_key_off_reference_components() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::open_local(dir.path(), "alice").unwrap();
        let reference = Reference::parse("server.io/ns/tool:1.0").unwrap();

        let squashfs = repo.squashfs_path_for(&reference);
        assert!(squashfs.ends_with("server.io/ns/tool/1.0.squashfs"));
    }
}
