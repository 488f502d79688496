//! Artifact store: download, verify and unpack versioned NF artifacts.
//!
//! Artifacts are gzip-compressed tars published at
//! `<repo>/<name>/<version>/<platform>/<artifact>` and unpacked into
//! `<bpf_dir>/<name>/<version>/`. Unpacked artifacts outlive any single
//! program instance and are shared by version.

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use flate2::read::GzDecoder;
use log::info;
use nfchain_common::types::BpfProgram;
use nfchain_common::{Error, Result};
use reqwest::{Client, StatusCode, Url};
use tar::Archive;
use tokio::sync::OnceCell;

use crate::platform;

const COPY_BUF_SIZE: usize = 32 * 1024;

/// Scratch buffers reused across extractions to bound peak allocations.
#[derive(Debug, Default)]
struct BufPool {
    bufs: Mutex<Vec<Vec<u8>>>,
}

impl BufPool {
    fn get(&self) -> Vec<u8> {
        let mut bufs = self.bufs.lock().unwrap();
        bufs.pop().unwrap_or_else(|| vec![0u8; COPY_BUF_SIZE])
    }

    fn put(&self, buf: Vec<u8>) {
        let mut bufs = self.bufs.lock().unwrap();
        bufs.push(buf);
    }
}

/// Local cache of unpacked artifacts, safe to share across chains.
#[derive(Debug)]
pub struct ArtifactStore {
    bpf_dir: PathBuf,
    repo_url: String,
    client: Client,
    platform: OnceCell<String>,
    pool: BufPool,
}

impl ArtifactStore {
    /// `timeout` applies to the whole download request, headers included.
    pub fn new(bpf_dir: impl Into<PathBuf>, repo_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("http client: {e}")))?;

        Ok(Self {
            bpf_dir: bpf_dir.into(),
            repo_url: repo_url.into(),
            client,
            platform: OnceCell::new(),
            pool: BufPool::default(),
        })
    }

    /// Pin the platform segment instead of probing the host for it.
    pub fn with_platform(self, platform: impl Into<String>) -> Self {
        let _ = self.platform.set(platform.into());
        self
    }

    /// Directory the unpacked artifact lives in.
    pub fn artifact_path(&self, program: &BpfProgram) -> PathBuf {
        self.bpf_dir
            .join(&program.name)
            .join(&program.version)
            .join(program.artifact_stem())
    }

    /// Local path for the program's artifact, fetching it when absent.
    ///
    /// The artifact counts as present only when its canonical stem
    /// directory exists; partial files from an aborted extraction do not
    /// satisfy this check.
    pub async fn ensure(&self, program: &BpfProgram) -> Result<PathBuf> {
        let path = self.artifact_path(program);
        if path.is_dir() {
            return Ok(path);
        }
        self.fetch(program).await
    }

    /// Download and unpack the artifact, returning the unpacked root.
    pub async fn fetch(&self, program: &BpfProgram) -> Result<PathBuf> {
        let err = |reason: String| Error::ArtifactFetch {
            artifact: program.artifact.clone(),
            reason,
        };

        let platform = self
            .platform
            .get_or_try_init(platform::platform)
            .await?
            .clone();

        let mut url = Url::parse(&self.repo_url)
            .map_err(|e| err(format!("unknown repo url format: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| err("repository URL cannot carry a path".to_string()))?
            .extend([
                program.name.as_str(),
                program.version.as_str(),
                platform.as_str(),
                program.artifact.as_str(),
            ]);

        info!("downloading - {url}");
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| err(format!("download failed: {e}")))?;
        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| err(format!("download failed: {e}")))?;

        if status != StatusCode::OK {
            return Err(err(format!(
                "get request returned unexpected status code: {status}, response body: {}",
                String::from_utf8_lossy(&body)
            )));
        }

        let dest = self.bpf_dir.join(&program.name).join(&program.version);
        self.unpack(&body, &dest, &program.artifact)?;

        Ok(dest.join(program.artifact_stem()))
    }

    /// Extract a gzip-compressed tar into `dest`, applying archived modes.
    ///
    /// Entries escaping `dest` through `..` abort the extraction before
    /// anything of theirs is written.
    fn unpack(&self, bytes: &[u8], dest: &Path, artifact: &str) -> Result<()> {
        let err = |reason: String| Error::ArtifactFetch {
            artifact: artifact.to_string(),
            reason,
        };

        let mut archive = Archive::new(GzDecoder::new(bytes));
        let entries = archive
            .entries()
            .map_err(|e| err(format!("failed to read archive: {e}")))?;

        for entry in entries {
            let mut entry = entry.map_err(|e| err(format!("untar failed: {e}")))?;
            let path = entry
                .path()
                .map_err(|e| err(format!("untar failed: {e}")))?
                .into_owned();

            if path.components().any(|c| matches!(c, Component::ParentDir)) {
                return Err(err(format!(
                    "zipped file contains filepath {} that includes (..)",
                    path.display()
                )));
            }

            let target = dest.join(&path);
            let mode = entry
                .header()
                .mode()
                .map_err(|e| err(format!("untar failed: {e}")))?;

            if entry.header().entry_type().is_dir() {
                fs::create_dir_all(&target)
                    .map_err(|e| err(format!("untar failed to create directories: {e}")))?;
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                    .map_err(|e| err(format!("untar failed to set mode: {e}")))?;
                continue;
            }

            let mut file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .mode(mode)
                .open(&target)
                .map_err(|e| err(format!("untar failed to create file: {e}")))?;

            let mut buf = self.pool.get();
            let copied = copy_buffered(&mut entry, &mut file, &mut buf);
            self.pool.put(buf);
            copied.map_err(|e| err(format!("failed to copy files: {e}")))?;
        }

        Ok(())
    }
}

fn copy_buffered<R: Read, W: Write>(reader: &mut R, writer: &mut W, buf: &mut [u8]) -> std::io::Result<u64> {
    let mut total = 0u64;
    loop {
        let n = reader.read(buf)?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn store(dir: &Path) -> ArtifactStore {
        ArtifactStore::new(dir, "http://127.0.0.1:1/repo", Duration::from_secs(1))
            .unwrap()
            .with_platform("focal")
    }

    fn archive(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_path("foo/").unwrap();
        dir.set_mode(0o755);
        dir.set_size(0);
        dir.set_cksum();
        builder.append(&dir, std::io::empty()).unwrap();

        for (name, data, mode) in entries {
            let mut header = tar::Header::new_gnu();
            let name_bytes = name.as_bytes();
            let gnu = header.as_gnu_mut().unwrap();
            gnu.name[..name_bytes.len()].copy_from_slice(name_bytes);
            header.set_mode(*mode);
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_unpack_applies_modes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let bytes = archive(&[("foo/start.sh", b"#!/bin/sh\n", 0o755)]);

        store.unpack(&bytes, tmp.path(), "foo.tar.gz").unwrap();

        let script = tmp.path().join("foo/start.sh");
        let mode = fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(fs::read(&script).unwrap(), b"#!/bin/sh\n");
    }

    #[test]
    fn test_unpack_rejects_parent_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let bytes = archive(&[("foo/../../evil", b"boom", 0o644)]);

        let err = store.unpack(&bytes, tmp.path(), "foo.tar.gz").unwrap_err();
        assert!(err.to_string().contains("includes (..)"), "got: {err}");
        assert!(!tmp.path().join("evil").exists());
        assert!(!tmp.path().parent().unwrap().join("evil").exists());
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        assert!(store.unpack(b"not a gzip", tmp.path(), "foo.tar.gz").is_err());
    }

    #[tokio::test]
    async fn test_ensure_skips_fetch_when_present() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let program: BpfProgram = serde_json::from_value(serde_json::json!({
            "name": "foo",
            "version": "1.0",
            "artifact": "foo.tar.gz",
            "ebpf_type": "xdp"
        }))
        .unwrap();

        // the canonical stem directory marks the artifact as present; the
        // bogus repo URL would fail any actual fetch
        let unpacked = tmp.path().join("foo/1.0/foo");
        fs::create_dir_all(&unpacked).unwrap();

        let path = store.ensure(&program).await.unwrap();
        assert_eq!(path, unpacked);
    }

    #[tokio::test]
    async fn test_ensure_fetches_when_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let program: BpfProgram = serde_json::from_value(serde_json::json!({
            "name": "foo",
            "version": "1.0",
            "artifact": "foo.tar.gz",
            "ebpf_type": "xdp"
        }))
        .unwrap();

        // nothing cached: ensure falls through to fetch, which cannot
        // reach the bogus repo
        let err = store.ensure(&program).await.unwrap_err();
        assert!(matches!(err, Error::ArtifactFetch { .. }));
    }
}
