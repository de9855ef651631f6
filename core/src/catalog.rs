//! Recursive local file enumeration into an id → descriptor mapping (C3).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_recursion::async_recursion;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{FileDescriptor, FileMetadata, FileType};

#[derive(Debug, Clone)]
struct CatalogEntry {
    descriptor: FileDescriptor,
    path: PathBuf,
}

/// Read-only (after construction) mapping from file id to descriptor, with
/// lazy file opening so scanning a large tree doesn't exhaust descriptors.
#[derive(Debug, Clone, Default)]
pub struct FileCatalog {
    entries: HashMap<Uuid, CatalogEntry>,
}

impl FileCatalog {
    /// Scans each input path. Regular files become one descriptor; directories
    /// are walked recursively without following symlinks.
    #[tracing::instrument(skip(paths))]
    pub async fn scan<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut entries = HashMap::new();
        for path in paths {
            let path = path.as_ref();
            let metadata = tokio::fs::symlink_metadata(path)
                .await
                .map_err(|e| Error::Config(format!("cannot access {}: {e}", path.display())))?;

            if metadata.is_file() {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| Error::Config(format!("invalid file name: {}", path.display())))?
                    .to_string();
                insert_entry(&mut entries, path.to_path_buf(), name).await?;
            } else if metadata.is_dir() {
                scan_dir(path, path, &mut entries).await?;
            } else {
                return Err(Error::Config(format!(
                    "{} is neither a regular file nor a directory",
                    path.display()
                )));
            }
        }

        if entries.is_empty() {
            return Err(Error::Config("no files found".to_string()));
        }

        tracing::info!(files = entries.len(), "scanned file catalog");
        Ok(Self { entries })
    }

    /// All descriptors, keyed by id, suitable for a `/prepare-upload` manifest.
    pub fn descriptors(&self) -> HashMap<Uuid, FileDescriptor> {
        self.entries
            .iter()
            .map(|(id, entry)| (*id, entry.descriptor.clone()))
            .collect()
    }

    pub fn get(&self, id: &Uuid) -> Option<&FileDescriptor> {
        self.entries.get(id).map(|entry| &entry.descriptor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Opens the underlying file for `id`, lazily.
    pub async fn open(&self, id: &Uuid) -> Result<tokio::fs::File> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| Error::Protocol(format!("unknown file id: {id}")))?;
        Ok(tokio::fs::File::open(&entry.path).await?)
    }
}

#[async_recursion]
async fn scan_dir(
    root: &Path,
    current: &Path,
    entries: &mut HashMap<Uuid, CatalogEntry>,
) -> Result<()> {
    let mut read_dir = tokio::fs::read_dir(current).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        let file_type = entry.file_type().await?;

        if file_type.is_symlink() {
            continue;
        } else if file_type.is_dir() {
            scan_dir(root, &path, entries).await?;
        } else if file_type.is_file() {
            let relative = path
                .strip_prefix(root)
                .map_err(|_| Error::Config(format!("failed to relativize {}", path.display())))?;
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            insert_entry(entries, path, name).await?;
        }
    }
    Ok(())
}

async fn insert_entry(
    entries: &mut HashMap<Uuid, CatalogEntry>,
    path: PathBuf,
    name: String,
) -> Result<()> {
    let metadata = tokio::fs::metadata(&path).await?;
    let descriptor = FileDescriptor {
        id: Uuid::new_v4(),
        file_type: FileType::from_name(&name),
        size: metadata.len(),
        metadata: Some(FileMetadata {
            modified_time: metadata.modified().ok().map(system_time_to_millis),
            accessed_time: metadata.accessed().ok().map(system_time_to_millis),
        }),
        name,
    };
    entries.insert(descriptor.id, CatalogEntry { descriptor, path });
    Ok(())
}

fn system_time_to_millis(time: std::time::SystemTime) -> String {
    time.duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn scans_single_file() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("doc.pdf");
        tokio::fs::write(&file_path, b"hello").await.unwrap();

        let catalog = FileCatalog::scan(&[file_path]).await.unwrap();
        assert_eq!(catalog.len(), 1);
        let descriptor = catalog.descriptors().into_values().next().unwrap();
        assert_eq!(descriptor.name, "doc.pdf");
        assert_eq!(descriptor.size, 5);
        assert_eq!(descriptor.file_type, FileType::Pdf);
    }

    #[tokio::test]
    async fn scans_directory_recursively_with_forward_slash_names() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("photos").join("vacation");
        tokio::fs::create_dir_all(&nested).await.unwrap();
        tokio::fs::write(nested.join("a.jpg"), b"data").await.unwrap();
        tokio::fs::write(dir.path().join("photos").join("b.jpg"), b"more")
            .await
            .unwrap();

        let catalog = FileCatalog::scan(&[dir.path()]).await.unwrap();
        assert_eq!(catalog.len(), 2);
        let names: Vec<String> = catalog
            .descriptors()
            .into_values()
            .map(|d| d.name)
            .collect();
        assert!(names.contains(&"photos/vacation/a.jpg".to_string()));
        assert!(names.contains(&"photos/b.jpg".to_string()));
    }

    #[tokio::test]
    async fn does_not_follow_symlinks() {
        let dir = tempdir().unwrap();
        let real = dir.path().join("real.txt");
        tokio::fs::write(&real, b"data").await.unwrap();
        let link = dir.path().join("link.txt");
        #[cfg(unix)]
        {
            tokio::fs::symlink(&real, &link).await.unwrap();
            let catalog = FileCatalog::scan(&[dir.path()]).await.unwrap();
            assert_eq!(catalog.len(), 1);
        }
    }

    #[tokio::test]
    async fn errors_when_no_files_found() {
        let dir = tempdir().unwrap();
        let result = FileCatalog::scan(&[dir.path()]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn open_reads_back_file_contents() {
        use tokio::io::AsyncReadExt;

        let dir = tempdir().unwrap();
        let file_path = dir.path().join("doc.txt");
        tokio::fs::write(&file_path, b"contents").await.unwrap();

        let catalog = FileCatalog::scan(&[file_path]).await.unwrap();
        let id = *catalog.descriptors().keys().next().unwrap();
        let mut file = catalog.open(&id).await.unwrap();
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"contents");
    }
}
