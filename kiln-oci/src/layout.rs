//! OCI image layout reader (§4.5): `index.json` → manifest → config blob.

use std::path::Path;

use sha2::Digest as _;

/// Image metadata extracted from an OCI image config's `"config"` subobject.
///
/// `cmd`/`entrypoint`/`workdir` are `None` when absent *or empty* in the
/// source JSON — an empty `Cmd` array is treated as absent for the purposes
/// of the configs-merger argv-selection algorithm (spec §9 "Optionals").
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub struct ImageMetadata {
    /// Default command (`Cmd`).
    pub cmd: Option<Vec<String>>,
    /// Default entrypoint (`Entrypoint`).
    pub entry: Option<Vec<String>>,
    /// Default working directory (`WorkingDir`).
    pub workdir: Option<String>,
    /// Default environment variables, parsed from `"K=V"` strings.
    pub env: std::collections::HashMap<String, String>,
    /// Image labels (OCI heritage naming; semantically annotations).
    pub labels: std::collections::HashMap<String, String>,
    /// Digest of the raw config blob — the image ID.
    pub image_id: String,
}

#[derive(serde::Deserialize)]
struct Index {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    manifests: Vec<Descriptor>,
}

#[derive(serde::Deserialize)]
struct Descriptor {
    digest: String,
}

#[derive(serde::Deserialize)]
struct Manifest {
    config: Descriptor,
}

#[derive(serde::Deserialize, Default)]
struct RawConfig {
    #[serde(default, alias = "Cmd")]
    cmd: Option<Vec<String>>,
    #[serde(default, alias = "Entrypoint")]
    entrypoint: Option<Vec<String>>,
    #[serde(default, alias = "WorkingDir")]
    working_dir: Option<String>,
    #[serde(default, alias = "Env")]
    env: Option<Vec<String>>,
    #[serde(default, alias = "Labels")]
    labels: Option<std::collections::HashMap<String, String>>,
}

#[derive(serde::Deserialize)]
struct ConfigBlob {
    config: RawConfig,
}

/// Reads an OCI image layout directory (`index.json` + `blobs/sha256/…`)
/// and returns its [`ImageMetadata`].
///
/// Verifies `index.json.schemaVersion == 2`, follows `manifests[0].digest`
/// to the manifest blob, then `config.digest` to the config blob. The image
/// ID is the config blob's own SHA-256 digest.
pub fn read_image_layout(layout_dir: &Path) -> crate::Result<ImageMetadata> {
    let index: Index = read_json(&layout_dir.join("index.json"))?;
    if index.schema_version != 2 {
        return Err(crate::Error::MalformedLayout(format!(
            "unsupported index.json schemaVersion: {}",
            index.schema_version
        )));
    }
    let manifest_desc = index.manifests.first().ok_or_else(|| {
        crate::Error::MalformedLayout("index.json has no manifests entry".into())
    })?;
    let manifest: Manifest = read_blob_json(layout_dir, &manifest_desc.digest)?;

    let config_bytes = read_blob_bytes(layout_dir, &manifest.config.digest)?;
    let config_blob: ConfigBlob = serde_json::from_slice(&config_bytes)?;
    let image_id = format!("sha256:{}", hex_encode(&sha2::Sha256::digest(&config_bytes)));

    let env = config_blob
        .config
        .env
        .unwrap_or_default()
        .into_iter()
        .filter_map(|kv| kv.split_once('=').map(|(k, v)| (k.to_owned(), v.to_owned())))
        .collect();

    Ok(ImageMetadata {
        cmd: non_empty(config_blob.config.cmd),
        entry: non_empty(config_blob.config.entrypoint),
        workdir: config_blob.config.working_dir.filter(|w| !w.is_empty()),
        env,
        labels: config_blob.config.labels.unwrap_or_default(),
        image_id,
    })
}

/// Treats an empty argv array as absent (spec §9).
fn non_empty(v: Option<Vec<String>>) -> Option<Vec<String>> {
    v.filter(|v| !v.is_empty())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> crate::Result<T> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

fn digest_path(layout_dir: &Path, digest: &str) -> crate::Result<std::path::PathBuf> {
    let (algo, hex) = digest.split_once(':').ok_or_else(|| {
        crate::Error::MalformedLayout(format!("malformed digest: {digest}"))
    })?;
    Ok(layout_dir.join("blobs").join(algo).join(hex))
}

fn read_blob_bytes(layout_dir: &Path, digest: &str) -> crate::Result<Vec<u8>> {
    Ok(std::fs::read(digest_path(layout_dir, digest)?)?)
}

fn read_blob_json<T: serde::de::DeserializeOwned>(
    layout_dir: &Path,
    digest: &str,
) -> crate::Result<T> {
    let data = read_blob_bytes(layout_dir, digest)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Lowercase-hex encodes a byte slice without pulling in an extra dependency
/// for what `sha2`'s own output already needs only a format pass to render.
fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_layout(dir: &Path) -> String {
        let blobs = dir.join("blobs/sha256");
        std::fs::create_dir_all(&blobs).unwrap();

        let config_json = br#"{"config":{"Cmd":["/bin/sh"],"Env":["PATH=/usr/bin","FOO=bar"],"Labels":{"maintainer":"x"}}}"#;
        let config_digest = hex_encode(&sha2::Sha256::digest(config_json));
        std::fs::File::create(blobs.join(&config_digest))
            .unwrap()
            .write_all(config_json)
            .unwrap();

        let manifest_json =
            format!(r#"{{"config":{{"digest":"sha256:{config_digest}"}}}}"#).into_bytes();
        let manifest_digest = hex_encode(&sha2::Sha256::digest(&manifest_json));
        std::fs::File::create(blobs.join(&manifest_digest))
            .unwrap()
            .write_all(&manifest_json)
            .unwrap();

        let index_json = format!(
            r#"{{"schemaVersion":2,"manifests":[{{"digest":"sha256:{manifest_digest}"}}]}}"#
        );
        std::fs::write(dir.join("index.json"), index_json).unwrap();

        config_digest
    }

    #[test]
    fn reads_metadata_from_a_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config_digest = write_layout(dir.path());

        let meta = read_image_layout(dir.path()).unwrap();
        assert_eq!(meta.cmd, Some(vec!["/bin/sh".to_owned()]));
        assert_eq!(meta.env.get("FOO"), Some(&"bar".to_owned()));
        assert_eq!(meta.labels.get("maintainer"), Some(&"x".to_owned()));
        assert_eq!(meta.image_id, format!("sha256:{config_digest}"));
    }

    #[test]
    fn rejects_wrong_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.json"), r#"{"schemaVersion":1,"manifests":[]}"#)
            .unwrap();
        assert!(read_image_layout(dir.path()).is_err());
    }
}
