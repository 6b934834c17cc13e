//! Package download with SHA-256 verification.
//!
//! Bytes stream into `<name>.partial` next to the final file and are hashed
//! on the way through. The partial file is renamed into place only after
//! the digest matches, so a half-written package is never mistaken for a
//! good one.

use brinst_common::errors::InstallError;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

const READ_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedPackage {
    pub path: PathBuf,
    /// Lowercase hex digest of the downloaded bytes.
    pub sha256: String,
    pub bytes: u64,
}

pub struct PackageDownloader {
    client: reqwest::Client,
    download_dir: PathBuf,
    timeout: Duration,
}

/// Incremental writer that hashes what it writes.
struct PartialFile {
    path: PathBuf,
    file: File,
    hasher: Sha256,
    bytes: u64,
}

impl PartialFile {
    async fn create(path: PathBuf) -> Result<Self, InstallError> {
        let file = File::create(&path)
            .await
            .map_err(|e| InstallError::io(format!("creating {}", path.display()), e))?;
        Ok(Self {
            path,
            file,
            hasher: Sha256::new(),
            bytes: 0,
        })
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), InstallError> {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| InstallError::io(format!("writing {}", self.path.display()), e))
    }

    async fn finish(mut self) -> Result<(PathBuf, String, u64), InstallError> {
        self.file
            .flush()
            .await
            .map_err(|e| InstallError::io(format!("flushing {}", self.path.display()), e))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| InstallError::io(format!("syncing {}", self.path.display()), e))?;
        Ok((self.path, hex::encode(self.hasher.finalize()), self.bytes))
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    target.with_file_name(name)
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Could not remove partial download");
    }
}

impl PackageDownloader {
    pub fn new(download_dir: impl Into<PathBuf>, timeout: Duration) -> Result<Self, InstallError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .user_agent(concat!("brinst/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| InstallError::Download(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            download_dir: download_dir.into(),
            timeout,
        })
    }

    /// Fetch `url` into the download directory as `file_name`.
    ///
    /// `file://` URLs are read from the local filesystem. With an
    /// `expected_sha256` the digest must match or the file is discarded.
    pub async fn download(
        &self,
        url: &str,
        expected_sha256: Option<&str>,
        file_name: &str,
    ) -> Result<DownloadedPackage, InstallError> {
        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| {
                InstallError::io(format!("creating {}", self.download_dir.display()), e)
            })?;
        let target = self.download_dir.join(file_name);
        let partial = partial_path(&target);

        let mut out = PartialFile::create(partial.clone()).await?;
        let fetched = match url.strip_prefix("file://") {
            Some(local) => self.copy_local(Path::new(local), &mut out).await,
            None => self.fetch_http(url, &mut out).await,
        };
        if let Err(e) = fetched {
            drop(out);
            discard(&partial).await;
            return Err(e);
        }
        let (partial, sha256, bytes) = out.finish().await?;

        if let Some(expected) = expected_sha256 {
            let expected = expected.trim().to_ascii_lowercase();
            if expected != sha256 {
                discard(&partial).await;
                return Err(InstallError::Integrity(format!(
                    "package digest {sha256} does not match expected {expected}"
                )));
            }
            debug!(%sha256, "Package digest verified");
        } else {
            warn!(%sha256, "No expected digest configured, package integrity not verified");
        }

        tokio::fs::rename(&partial, &target)
            .await
            .map_err(|e| InstallError::io(format!("moving package to {}", target.display()), e))?;
        info!(url, path = %target.display(), bytes, "Package downloaded");
        Ok(DownloadedPackage {
            path: target,
            sha256,
            bytes,
        })
    }

    async fn fetch_http(&self, url: &str, out: &mut PartialFile) -> Result<(), InstallError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.transport_error(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(InstallError::Download(format!(
                "{url} returned HTTP {}",
                status.as_u16()
            )));
        }

        loop {
            let chunk = tokio::time::timeout(self.timeout, response.chunk())
                .await
                .map_err(|_| {
                    InstallError::Timeout(format!("{url} stalled for {:?}", self.timeout))
                })?
                .map_err(|e| self.transport_error(url, e))?;
            match chunk {
                Some(chunk) => out.write(&chunk).await?,
                None => return Ok(()),
            }
        }
    }

    async fn copy_local(&self, source: &Path, out: &mut PartialFile) -> Result<(), InstallError> {
        let mut file = File::open(source).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                InstallError::Download(format!("{} does not exist", source.display()))
            } else {
                InstallError::io(format!("opening {}", source.display()), e)
            }
        })?;
        let mut buffer = vec![0u8; READ_BUFFER];
        loop {
            let read = file
                .read(&mut buffer)
                .await
                .map_err(|e| InstallError::io(format!("reading {}", source.display()), e))?;
            if read == 0 {
                return Ok(());
            }
            out.write(&buffer[..read]).await?;
        }
    }

    fn transport_error(&self, url: &str, err: reqwest::Error) -> InstallError {
        if err.is_timeout() {
            InstallError::Timeout(format!("{url} did not answer within {:?}", self.timeout))
        } else {
            InstallError::Download(format!("{url}: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn source(dir: &Path, data: &[u8]) -> String {
        let path = dir.join("source.bin");
        std::fs::write(&path, data).unwrap();
        format!("file://{}", path.display())
    }

    #[tokio::test]
    async fn test_local_download_verifies_digest() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![7u8; 200_000];
        let url = source(dir.path(), &data);
        let downloader =
            PackageDownloader::new(dir.path().join("downloads"), Duration::from_secs(5)).unwrap();

        let expected = sha256_hex(&data).to_uppercase();
        let package = downloader
            .download(&url, Some(&expected), "bridge-agent")
            .await
            .unwrap();

        assert_eq!(package.bytes, data.len() as u64);
        assert_eq!(package.sha256, sha256_hex(&data));
        assert_eq!(std::fs::read(&package.path).unwrap(), data);
        assert!(!partial_path(&package.path).exists());
    }

    #[tokio::test]
    async fn test_digest_mismatch_discards_file() {
        let dir = tempfile::tempdir().unwrap();
        let url = source(dir.path(), b"tampered payload");
        let downloads = dir.path().join("downloads");
        let downloader = PackageDownloader::new(&downloads, Duration::from_secs(5)).unwrap();

        let err = downloader
            .download(&url, Some(&sha256_hex(b"original payload")), "bridge-agent")
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::Integrity(_)), "{err}");
        assert_eq!(std::fs::read_dir(&downloads).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_local_source_is_download_error() {
        let dir = tempfile::tempdir().unwrap();
        let downloader =
            PackageDownloader::new(dir.path().join("downloads"), Duration::from_secs(5)).unwrap();
        let err = downloader
            .download("file:///nonexistent/bridge-agent", None, "bridge-agent")
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::Download(_)), "{err}");
        assert!(!dir.path().join("downloads").join("bridge-agent.partial").exists());
    }

    #[test]
    fn test_partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/tmp/d/agent.exe")),
            PathBuf::from("/tmp/d/agent.exe.partial")
        );
    }
}
