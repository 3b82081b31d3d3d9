/// Mirror backed by a local (or mounted) directory
use crate::config::types::MirrorError;
use crate::mirror::{AssetMirror, MirrorResult, RemoteAsset};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct LocalDirMirror {
    root: PathBuf,
}

impl LocalDirMirror {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ids are plain file names directly under the root
    fn source_path(&self, id: &str) -> MirrorResult<PathBuf> {
        let flat = !id.is_empty()
            && !id.starts_with('.')
            && !id.contains('/')
            && !id.contains('\\')
            && !id.contains('\0');
        let path = self.root.join(id);
        if flat && path.is_file() {
            Ok(path)
        } else {
            Err(MirrorError::UnknownAsset { id: id.to_string() })
        }
    }
}

impl AssetMirror for LocalDirMirror {
    fn list(&self) -> MirrorResult<Vec<RemoteAsset>> {
        let mut assets = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            assets.push(RemoteAsset {
                id: name.clone(),
                name,
                size: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        assets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(assets)
    }

    fn fetch(&self, id: &str, dest_dir: &Path) -> MirrorResult<PathBuf> {
        let source = self.source_path(id)?;
        fs::create_dir_all(dest_dir)?;

        let dest = dest_dir.join(id);
        let partial = dest_dir.join(format!(".{}.part", id));
        fs::copy(&source, &partial)?;
        fs::rename(&partial, &dest)?;

        log::debug!("Fetched {} to {}", source.display(), dest.display());
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lists_plain_files_sorted() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("b.blend"), b"BLENDER-b").unwrap();
        fs::write(src.path().join("a.blend"), b"BLENDER-a").unwrap();
        fs::write(src.path().join(".hidden"), b"x").unwrap();
        fs::create_dir(src.path().join("subdir")).unwrap();

        let assets = LocalDirMirror::new(src.path()).list().unwrap();
        let names: Vec<_> = assets.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["a.blend", "b.blend"]);
        assert_eq!(assets[0].size, 9);
        assert!(assets[0].modified.is_some());
    }

    #[test]
    fn fetch_copies_into_destination() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(src.path().join("scene.blend"), b"BLENDER-scene").unwrap();

        let path = LocalDirMirror::new(src.path())
            .fetch("scene.blend", dest.path())
            .unwrap();
        assert_eq!(path, dest.path().join("scene.blend"));
        assert_eq!(fs::read(path).unwrap(), b"BLENDER-scene");
    }

    #[test]
    fn fetch_refuses_paths_outside_root() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let mirror = LocalDirMirror::new(src.path());

        for id in ["../etc/passwd", "", ".hidden", "missing.blend"] {
            assert!(matches!(
                mirror.fetch(id, dest.path()),
                Err(MirrorError::UnknownAsset { .. })
            ));
        }
    }
}
