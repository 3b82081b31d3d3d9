/// On-disk layout of inputs and render artifacts
///
/// Inputs live at `<upload_dir>/<key>.blend`, artifacts at
/// `<output_dir>/<key>0001.<ext>`. New inputs are written to a hidden
/// staging file in the upload directory and renamed into place, so a
/// renderer that already opened the previous input keeps reading it.
use crate::config::loader::{PathsConfig, RendererConfig};
use crate::config::types::{RenderResource, RenderboxError, ResourceKey, Result};
use crate::exec::command::RENDER_FRAME;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Extension of stored render inputs
pub const INPUT_EXTENSION: &str = "blend";

const STAGING_PREFIX: &str = ".staging-";

#[derive(Debug, Clone)]
pub struct AssetStore {
    upload_dir: PathBuf,
    output_dir: PathBuf,
    incoming_dir: PathBuf,
    artifact_extension: String,
}

/// Row of `AssetStore::list_resources`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResource {
    pub resource: RenderResource,
    pub input_size: u64,
    pub has_artifact: bool,
}

/// Uploaded bytes not yet visible as a render input.
/// Dropping it without `commit` deletes the staging file.
#[derive(Debug)]
pub struct StagedAsset {
    key: ResourceKey,
    path: PathBuf,
    committed: bool,
}

impl AssetStore {
    pub fn new(paths: &PathsConfig, renderer: &RendererConfig) -> Self {
        Self {
            upload_dir: paths.upload_dir(),
            output_dir: paths.output_dir(),
            incoming_dir: paths.incoming_dir(),
            artifact_extension: renderer.artifact_extension.clone(),
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.upload_dir, &self.output_dir, &self.incoming_dir] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn incoming_dir(&self) -> &Path {
        &self.incoming_dir
    }

    pub fn input_path(&self, key: &ResourceKey) -> PathBuf {
        self.upload_dir
            .join(format!("{}.{}", key.as_str(), INPUT_EXTENSION))
    }

    /// Paths for `key`, whether or not its input exists
    pub fn describe(&self, key: &ResourceKey) -> RenderResource {
        RenderResource {
            key: key.clone(),
            input_path: self.input_path(key),
            output_prefix: self.output_dir.join(key.as_str()),
            artifact_path: self.output_dir.join(format!(
                "{}{:04}.{}",
                key.as_str(),
                RENDER_FRAME,
                self.artifact_extension
            )),
        }
    }

    /// Look up an accepted resource
    pub fn resource(&self, key: &ResourceKey) -> Result<RenderResource> {
        let resource = self.describe(key);
        if resource.input_path.is_file() {
            Ok(resource)
        } else {
            Err(RenderboxError::NotFound { key: key.clone() })
        }
    }

    /// Every stored input, sorted by key
    pub fn list_resources(&self) -> Result<Vec<StoredResource>> {
        let entries = match fs::read_dir(&self.upload_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut resources = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some(INPUT_EXTENSION) {
                continue;
            }
            let Some(key) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| ResourceKey::parse(s).ok())
            else {
                continue;
            };
            let metadata = match fs::metadata(&path) {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let resource = self.describe(&key);
            resources.push(StoredResource {
                has_artifact: resource.artifact_path.is_file(),
                input_size: metadata.len(),
                resource,
            });
        }
        resources.sort_by(|a, b| a.resource.key.cmp(&b.resource.key));
        Ok(resources)
    }

    /// Write `bytes` to a fresh staging file for `key`
    pub fn stage(&self, key: &ResourceKey, bytes: &[u8]) -> Result<StagedAsset> {
        fs::create_dir_all(&self.upload_dir)?;
        let path = self.upload_dir.join(format!(
            "{}{}-{}.tmp",
            STAGING_PREFIX,
            key.as_str(),
            Uuid::new_v4()
        ));

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        let staged = StagedAsset {
            key: key.clone(),
            path,
            committed: false,
        };
        write_all_synced(&mut file, bytes)?;
        Ok(staged)
    }

    /// Atomically move a staged asset to its input path
    pub fn commit(&self, mut staged: StagedAsset) -> Result<PathBuf> {
        let dest = self.input_path(&staged.key);
        fs::rename(&staged.path, &dest)?;
        staged.committed = true;
        Ok(dest)
    }
}

impl StagedAsset {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedAsset {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!(
                    "Failed to remove staging file {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

fn write_all_synced(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes)?;
    file.sync_all()
}
