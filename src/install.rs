//! Artifact download and installation.
//!
//! A provider may declare a platform/version-specific artifact to fetch
//! before first start. Installation is a plain HTTP GET plus unzip/untar;
//! single-file artifacts are written verbatim as the executable.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use flate2::read::GzDecoder;
use tracing::{debug, info};

use crate::error::{HubError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMode {
    Zip,
    TarGz,
    /// The downloaded bytes are the executable itself.
    DontExtract,
}

#[derive(Debug, Clone)]
pub struct ArtifactSpec {
    pub url: String,
    /// File name of the executable the artifact yields inside the install dir.
    pub executable: String,
    pub extract: ExtractMode,
}

/// GET the artifact bytes. Any HTTP status >= 400 is a download error
/// carrying the status code.
pub async fn fetch(client: &reqwest::Client, url: &str) -> Result<Bytes> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| HubError::Download(format!("GET {url} failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(HubError::Download(format!(
            "download of {url} failed with status {}",
            status.as_u16()
        )));
    }

    response
        .bytes()
        .await
        .map_err(|e| HubError::Download(format!("reading body of {url} failed: {e}")))
}

/// Ensure the artifact's executable exists under `dest_dir`. No network
/// request is made when it is already present, unless `force` is set.
pub async fn ensure_installed(
    client: &reqwest::Client,
    spec: &ArtifactSpec,
    dest_dir: &Path,
    force: bool,
) -> Result<PathBuf> {
    let target = dest_dir.join(&spec.executable);
    if target.exists() && !force {
        debug!("Artifact already installed at {:?}", target);
        return Ok(target);
    }

    tokio::fs::create_dir_all(dest_dir).await?;
    info!("Downloading {} to {:?}", spec.url, dest_dir);
    let bytes = fetch(client, &spec.url).await?;

    let mode = spec.extract;
    let dir = dest_dir.to_path_buf();
    let executable = spec.executable.clone();
    tokio::task::spawn_blocking(move || unpack(mode, &bytes, &dir, &executable))
        .await
        .map_err(|e| HubError::Download(format!("extraction task panicked: {e}")))??;

    if !target.exists() {
        return Err(HubError::Download(format!(
            "artifact from {} did not contain executable '{}'",
            spec.url, spec.executable
        )));
    }
    mark_executable(&target)?;
    Ok(target)
}

fn unpack(mode: ExtractMode, bytes: &[u8], dest_dir: &Path, executable: &str) -> Result<()> {
    match mode {
        ExtractMode::Zip => {
            let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
                .map_err(|e| HubError::Download(format!("invalid zip archive: {e}")))?;
            archive
                .extract(dest_dir)
                .map_err(|e| HubError::Download(format!("unzip failed: {e}")))?;
        }
        ExtractMode::TarGz => {
            let mut archive = tar::Archive::new(GzDecoder::new(Cursor::new(bytes)));
            archive
                .unpack(dest_dir)
                .map_err(|e| HubError::Download(format!("untar failed: {e}")))?;
        }
        ExtractMode::DontExtract => {
            std::fs::write(dest_dir.join(executable), bytes)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_with(name: &str, contents: &[u8]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            writer
                .start_file(name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(contents).unwrap();
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    fn targz_with(name: &str, contents: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, name, contents).unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn unpack_zip_yields_executable() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = zip_with("chromedriver", b"#!/bin/sh\n");
        unpack(ExtractMode::Zip, &bytes, dir.path(), "chromedriver").unwrap();
        assert!(dir.path().join("chromedriver").exists());
    }

    #[test]
    fn unpack_targz_yields_executable() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = targz_with("geckodriver", b"#!/bin/sh\n");
        unpack(ExtractMode::TarGz, &bytes, dir.path(), "geckodriver").unwrap();
        assert!(dir.path().join("geckodriver").exists());
    }

    #[test]
    fn dont_extract_writes_bytes_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        unpack(ExtractMode::DontExtract, b"raw binary", dir.path(), "tunnel").unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("tunnel")).unwrap(),
            b"raw binary"
        );
    }

    #[test]
    fn unpack_rejects_corrupt_zip() {
        let dir = tempfile::tempdir().unwrap();
        let err = unpack(ExtractMode::Zip, b"not a zip", dir.path(), "x").unwrap_err();
        assert!(err.to_string().contains("zip"));
    }

    #[tokio::test]
    async fn already_installed_skips_network() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("chromedriver"), b"installed").unwrap();
        let spec = ArtifactSpec {
            // Nothing listens here; a network attempt would fail loudly.
            url: "http://127.0.0.1:9/archive.zip".to_string(),
            executable: "chromedriver".to_string(),
            extract: ExtractMode::Zip,
        };
        let client = reqwest::Client::new();
        let path = ensure_installed(&client, &spec, dir.path(), false)
            .await
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"installed");
    }

    #[tokio::test]
    async fn unreachable_url_surfaces_download_error() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ArtifactSpec {
            url: "http://127.0.0.1:9/archive.zip".to_string(),
            executable: "chromedriver".to_string(),
            extract: ExtractMode::Zip,
        };
        let client = reqwest::Client::new();
        let err = ensure_installed(&client, &spec, dir.path(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Download(_)));
    }
}
