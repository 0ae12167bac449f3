use super::executor::{TaskInfo, UnitRunResult};
use super::{UploadPolicy, UploadRequest, Uploader};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

const RAPID_DIR: &str = ".rapid";
const COPY_BUF_SIZE: usize = 256 * 1024;

/// Uploader that stores archives under a local directory.
///
/// Content is indexed by blake3 digest in `<root>/.rapid`, so re-sending an
/// archive whose bytes the store already holds costs a store-side copy
/// instead of a transfer.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

/// What a single `LocalStore` upload did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Skipped,
    Unchanged,
    RapidUploaded,
    Transferred(u64),
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a `/`-separated remote path to a location under the root
    pub fn resolve(&self, remote: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        let mut pushed = false;
        for component in Path::new(remote).components() {
            match component {
                Component::Normal(part) => {
                    if part == RAPID_DIR {
                        bail!("remote path {} uses a reserved name", remote);
                    }
                    path.push(part);
                    pushed = true;
                }
                Component::RootDir | Component::CurDir => {}
                _ => bail!("remote path {} escapes the store", remote),
            }
        }
        if !pushed {
            bail!("remote path {} names no file", remote);
        }
        Ok(path)
    }

    fn rapid_path(&self, digest: &str) -> PathBuf {
        self.root.join(RAPID_DIR).join(digest)
    }

    /// Blocking body of an upload
    pub fn store(&self, request: &UploadRequest) -> Result<StoreOutcome> {
        let dest = self.resolve(&request.save_path)?;
        let digest = file_digest(&request.local_path)
            .with_context(|| format!("hashing {}", request.local_path.display()))?;

        if dest.exists() {
            match request.policy {
                UploadPolicy::Skip => {
                    info!("{} exists, skipping", request.save_path);
                    return Ok(StoreOutcome::Skipped);
                }
                UploadPolicy::Rsync => {
                    let remote = file_digest(&dest)
                        .with_context(|| format!("hashing {}", dest.display()))?;
                    if remote == digest {
                        info!("{} is up to date", request.save_path);
                        return Ok(StoreOutcome::Unchanged);
                    }
                }
                UploadPolicy::Overwrite => {}
            }
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let rapid = self.rapid_path(&digest);
        if !request.no_rapid_upload && rapid.is_file() {
            copy_atomic(&rapid, &dest, None)
                .with_context(|| format!("rapid upload to {}", dest.display()))?;
            info!("{} rapid uploaded ({})", request.save_path, &digest[..12]);
            return Ok(StoreOutcome::RapidUploaded);
        }

        let written = copy_atomic(&request.local_path, &dest, Some(request))
            .with_context(|| format!("uploading to {}", dest.display()))?;

        if let Err(e) = self.register(&dest, &rapid) {
            warn!("Failed to index {}: {:#}", dest.display(), e);
        }

        debug!("{} stored, {} bytes", request.save_path, written);
        Ok(StoreOutcome::Transferred(written))
    }

    // The index keeps its own copy; a link would follow edits to `dest`
    fn register(&self, dest: &Path, rapid: &Path) -> Result<()> {
        if rapid.exists() {
            return Ok(());
        }
        if let Some(parent) = rapid.parent() {
            fs::create_dir_all(parent)?;
        }
        copy_atomic(dest, rapid, None)?;
        Ok(())
    }
}

#[async_trait]
impl Uploader for LocalStore {
    async fn upload(&self, info: &TaskInfo, request: &UploadRequest) -> UnitRunResult {
        request.statistics.start_timer();

        let store = self.clone();
        let owned = request.clone();
        let joined = tokio::task::spawn_blocking(move || store.store(&owned)).await;

        match joined {
            Ok(Ok(outcome)) => {
                let message = match outcome {
                    StoreOutcome::Skipped => "skipped, remote exists".to_string(),
                    StoreOutcome::Unchanged => "remote up to date".to_string(),
                    StoreOutcome::RapidUploaded => "rapid uploaded".to_string(),
                    StoreOutcome::Transferred(bytes) => format!(
                        "uploaded {} in {}",
                        crate::utils::format::format_size(bytes),
                        crate::utils::format::format_duration(request.statistics.elapsed())
                    ),
                };
                debug!("[{}] {}", info.id(), message);
                UnitRunResult::success(message)
            }
            Ok(Err(e)) => UnitRunResult::retryable(e, "upload failed"),
            Err(e) => UnitRunResult::retryable(e.into(), "upload task aborted"),
        }
    }
}

fn file_digest(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::with_capacity(COPY_BUF_SIZE, File::open(path)?);
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// Copy through a `.part` file and rename into place; returns bytes written
fn copy_atomic(from: &Path, to: &Path, request: Option<&UploadRequest>) -> io::Result<u64> {
    let mut part_name = to.file_name().unwrap_or_default().to_os_string();
    part_name.push(".part");
    let part = to.with_file_name(part_name);

    let result = copy_counted(from, &part, request);
    match result {
        Ok(written) => {
            fs::rename(&part, to)?;
            Ok(written)
        }
        Err(e) => {
            let _ = fs::remove_file(&part);
            Err(e)
        }
    }
}

fn copy_counted(from: &Path, to: &Path, request: Option<&UploadRequest>) -> io::Result<u64> {
    let mut reader = File::open(from)?;
    let mut writer = BufWriter::new(File::create(to)?);
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut written = 0u64;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        written += n as u64;
        if let Some(request) = request {
            request.statistics.add_uploaded(n as u64);
        }
    }

    writer.flush()?;
    Ok(written)
}
