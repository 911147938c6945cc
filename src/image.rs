//! OCI archive handling: digest verification, unpacking and whiteout
//! conversion for downloaded service and layer images.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tar::Archive;
use tracing::debug;

use crate::error::{Error, Result};

const SHA256_PREFIX: &str = "sha256:";
const WHITEOUT_PREFIX: &str = ".wh.";
const WHITEOUT_OPAQUE_DIR: &str = ".wh..wh..opq";
const MANIFEST_FILE: &str = "manifest.json";

/// Content descriptor inside an image manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
}

/// OCI image manifest as found in service and layer archives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion", default)]
    pub schema_version: u32,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

/// Strips the `sha256:` prefix from a digest string.
pub fn digest_hex(digest: &str) -> &str {
    digest.strip_prefix(SHA256_PREFIX).unwrap_or(digest)
}

/// Computes the sha256 digest of a file, hex-encoded without prefix.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let mut file = File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 1024 * 1024];

        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }

            hasher.update(&buffer[..read]);
        }

        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|err| Error::Failed(format!("hash task failed: {err}")))?
}

/// Validates size and sha256 of a downloaded archive.
pub async fn check_file_info(path: &Path, expected_size: u64, expected_sha256: &str) -> Result<()> {
    let metadata = tokio::fs::metadata(path).await?;

    if expected_size != 0 && metadata.len() != expected_size {
        return Err(Error::Validation(format!(
            "size mismatch for {}: expected {expected_size}, got {}",
            path.display(),
            metadata.len()
        )));
    }

    let digest = sha256_file(path).await?;

    if digest != digest_hex(expected_sha256) {
        return Err(Error::Validation(format!(
            "sha256 mismatch for {}: expected {expected_sha256}, got {digest}",
            path.display()
        )));
    }

    Ok(())
}

/// Sums entry sizes of a gzipped tar archive without unpacking it.
pub async fn unpacked_archive_size(path: &Path) -> Result<u64> {
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let file = File::open(&path)?;
        let mut archive = Archive::new(GzDecoder::new(file));
        let mut total = 0u64;

        for entry in archive.entries()? {
            total += entry?.size();
        }

        Ok(total)
    })
    .await
    .map_err(|err| Error::Failed(format!("archive scan task failed: {err}")))?
}

/// Unpacks a gzipped tar archive into `dest`.
pub async fn unpack_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    debug!(archive = %archive_path.display(), dest = %dest.display(), "unpacking archive");

    tokio::fs::create_dir_all(dest).await?;

    let archive_path = archive_path.to_path_buf();
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let file = File::open(&archive_path)?;
        let mut archive = Archive::new(GzDecoder::new(file));

        archive
            .unpack(&dest)
            .map_err(|err| Error::Failed(format!("unpack failed: {err}")))
    })
    .await
    .map_err(|err| Error::Failed(format!("unpack task failed: {err}")))?
}

/// Loads `manifest.json` from an unpacked image directory.
pub async fn load_manifest(dir: &Path) -> Result<ImageManifest> {
    let text = tokio::fs::read_to_string(dir.join(MANIFEST_FILE))
        .await
        .map_err(|err| Error::Validation(format!("can't read image manifest: {err}")))?;

    serde_json::from_str(&text)
        .map_err(|err| Error::Validation(format!("invalid image manifest: {err}")))
}

/// Converts OCI tar whiteouts in an unpacked layer to overlayfs form:
/// `.wh..wh..opq` marks the directory opaque, `.wh.<name>` becomes a 0-mode
/// char device node masking `<name>`.
pub async fn whiteouts_to_overlay(dir: &Path, uid: u32, gid: u32) -> Result<()> {
    let dir = dir.to_path_buf();

    tokio::task::spawn_blocking(move || convert_whiteouts(&dir, uid, gid))
        .await
        .map_err(|err| Error::Failed(format!("whiteout task failed: {err}")))?
}

fn convert_whiteouts(dir: &Path, uid: u32, gid: u32) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if entry.file_type()?.is_dir() {
            convert_whiteouts(&path, uid, gid)?;
            continue;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
            continue;
        };

        if name == WHITEOUT_OPAQUE_DIR {
            set_opaque_xattr(dir)?;
            std::fs::remove_file(&path)?;
        } else if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
            let masked = dir.join(target);

            make_whiteout_node(&masked, uid, gid)?;
            std::fs::remove_file(&path)?;
        }
    }

    Ok(())
}

fn set_opaque_xattr(dir: &Path) -> Result<()> {
    let c_path = std::ffi::CString::new(dir.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::InvalidArgument(format!("bad path {}", dir.display())))?;
    let name = c"trusted.overlay.opaque";

    let res = unsafe {
        libc::setxattr(
            c_path.as_ptr(),
            name.as_ptr(),
            c"y".as_ptr() as *const libc::c_void,
            1,
            0,
        )
    };

    if res != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    Ok(())
}

/// Creates a 0-mode char device node masking `path` in an overlay mount.
pub fn make_whiteout_node(path: &Path, uid: u32, gid: u32) -> Result<()> {
    use nix::sys::stat::{mknod, Mode, SFlag};
    use nix::unistd::{chown, Gid, Uid};

    mknod(path, SFlag::S_IFCHR, Mode::empty(), 0)?;
    chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))?;

    Ok(())
}

/// Returns the install directory for a content-addressed item.
pub fn digest_path(base: &Path, digest: &str) -> PathBuf {
    base.join(digest_hex(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_archive(dir: &Path, files: &[(&str, &[u8])]) -> PathBuf {
        let archive_path = dir.join("test.tar.gz");
        let file = File::create(&archive_path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }

        builder.into_inner().unwrap().finish().unwrap();

        archive_path
    }

    #[tokio::test]
    async fn digest_and_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");

        let mut file = File::create(&path).unwrap();
        file.write_all(b"hello").unwrap();
        drop(file);

        let digest = sha256_file(&path).await.unwrap();
        // sha256("hello")
        assert_eq!(
            digest,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        check_file_info(&path, 5, &digest).await.unwrap();
        check_file_info(&path, 5, &format!("sha256:{digest}"))
            .await
            .unwrap();

        let err = check_file_info(&path, 5, "sha256:deadbeef").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = check_file_info(&path, 99, &digest).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn unpack_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let archive = make_archive(
            dir.path(),
            &[("manifest.json", br#"{"schemaVersion": 2, "config": {"digest": "sha256:abc", "size": 3}}"#)],
        );

        let size = unpacked_archive_size(&archive).await.unwrap();
        assert!(size > 0);

        let dest = dir.path().join("unpacked");
        unpack_archive(&archive, &dest).await.unwrap();

        let manifest = load_manifest(&dest).await.unwrap();
        assert_eq!(manifest.config.digest, "sha256:abc");
        assert_eq!(digest_hex(&manifest.config.digest), "abc");
    }

    #[tokio::test]
    async fn missing_manifest_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();

        let err = load_manifest(dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
