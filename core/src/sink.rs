//! The sink pipeline (§4.6.1): sanitize → remap → conflict-resolve →
//! containment-revalidate → size-cap → stream, applied to every file the
//! client receives.
//!
//! The sink's observable guarantee: no byte is ever written outside the
//! canonical destination root.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;

use crate::error::{Error, Result};

/// Hard cap on any single received file, enforced both a priori and mid-stream.
pub const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Splits `name` on both `/` and `\`, drops `.`/`..`/empty components.
/// Rejects the file if nothing remains.
pub fn sanitize(name: &str) -> Result<Vec<String>> {
    let components: Vec<String> = name
        .split(['/', '\\'])
        .filter(|c| !c.is_empty() && *c != "." && *c != "..")
        .map(|c| c.to_string())
        .collect();
    if components.is_empty() {
        return Err(Error::Transfer(format!(
            "file name '{name}' sanitizes to an empty path"
        )));
    }
    Ok(components)
}

/// Resolves the final on-disk path for an incoming file, applying the
/// sanitize → remap → conflict-resolve → containment-check steps of the
/// sink pipeline. `rename_map` persists top-level directory renames chosen
/// during the same transfer so later files are redirected consistently.
pub async fn resolve_sink_path(
    destination_root: &Path,
    name: &str,
    rename_map: &mut HashMap<String, String>,
) -> Result<PathBuf> {
    let mut components = sanitize(name)?;

    if components.len() > 1 {
        if let Some(chosen) = rename_map.get(&components[0]) {
            components[0] = chosen.clone();
        }
    }

    if components.len() == 1 {
        let candidate = destination_root.join(&components[0]);
        if path_exists(&candidate).await {
            let replacement = prompt_line(&format!(
                "'{}' already exists, enter a new name (blank to abort): ",
                components[0]
            ))
            .await?;
            if replacement.is_empty() {
                return Err(Error::User("declined to rename on conflict".to_string()));
            }
            let mut replacement_components = sanitize(&replacement)?;
            if replacement_components.len() != 1 {
                return Err(Error::Transfer(
                    "replacement name must be a single path component".to_string(),
                ));
            }
            let new_name = replacement_components.remove(0);
            let new_candidate = destination_root.join(&new_name);
            if path_exists(&new_candidate).await {
                return Err(Error::Transfer(format!("'{new_name}' already exists")));
            }
            components = vec![new_name];
        }
    } else {
        let top = components[0].clone();
        if !rename_map.contains_key(&top) {
            let top_path = destination_root.join(&top);
            if path_exists(&top_path).await {
                let replacement = prompt_line(&format!(
                    "directory '{top}' already exists, enter a new directory name (blank to abort): "
                ))
                .await?;
                if replacement.is_empty() {
                    return Err(Error::User("declined to rename on conflict".to_string()));
                }
                let replacement_components = sanitize(&replacement)?;
                if replacement_components.len() != 1 {
                    return Err(Error::Transfer(
                        "replacement directory name must be a single path component".to_string(),
                    ));
                }
                let new_top = replacement_components[0].clone();
                let new_top_path = destination_root.join(&new_top);
                if path_exists(&new_top_path).await {
                    return Err(Error::Transfer(format!("'{new_top}' already exists")));
                }
                rename_map.insert(top, new_top.clone());
                components[0] = new_top;
            }
        }
    }

    let target = destination_root.join(components.join("/"));
    revalidate_containment(destination_root, &target).await
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Computes the canonical destination root and canonical target, creating
/// intermediate directories as needed, and rejects the target if it escapes
/// the destination root.
async fn revalidate_containment(destination_root: &Path, target: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(destination_root).await?;
    let canonical_root = tokio::fs::canonicalize(destination_root).await?;

    let parent = target
        .parent()
        .ok_or_else(|| Error::Transfer("resolved sink path has no parent directory".to_string()))?;
    tokio::fs::create_dir_all(parent).await?;
    let canonical_parent = tokio::fs::canonicalize(parent).await?;

    let file_name = target
        .file_name()
        .ok_or_else(|| Error::Transfer("resolved sink path has no file name".to_string()))?;
    let canonical_target = canonical_parent.join(file_name);

    if !canonical_target.starts_with(&canonical_root) {
        return Err(Error::Transfer(format!(
            "path traversal attempt detected resolving '{}'",
            target.display()
        )));
    }

    Ok(canonical_target)
}

async fn prompt_line(prompt: &str) -> Result<String> {
    let prompt = prompt.to_string();
    tokio::task::spawn_blocking(move || -> Result<String> {
        print!("{prompt}");
        std::io::stdout().flush().ok();
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok(line.trim().to_string())
    })
    .await
    .map_err(|e| Error::Transfer(format!("prompt task panicked: {e}")))?
}

/// Streams `chunks` into `target`, enforcing the size cap both a priori
/// (`expected_size`) and mid-stream (running byte counter). On mid-stream
/// overflow, deletes the partial file before returning an error.
pub async fn stream_to_sink(
    mut chunks: impl tokio_stream::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
    target: &Path,
    expected_size: u64,
) -> Result<u64> {
    if expected_size > MAX_FILE_SIZE {
        return Err(Error::Transfer(format!(
            "'{}' exceeds the 10 GiB size cap ({} bytes advertised)",
            target.display(),
            expected_size
        )));
    }

    let mut file = tokio::fs::File::create(target).await?;
    let mut received: u64 = 0;

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| Error::Transfer(format!("network error mid-transfer: {e}")))?;
        received += chunk.len() as u64;
        if received > MAX_FILE_SIZE {
            drop(file);
            let _ = tokio::fs::remove_file(target).await;
            return Err(Error::Transfer(format!(
                "'{}' exceeded the 10 GiB size cap mid-stream",
                target.display()
            )));
        }
        file.write_all(&chunk).await?;
    }

    file.flush().await?;
    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sanitize_drops_dot_and_dotdot_components() {
        let components = sanitize("../../etc/passwd").unwrap();
        assert_eq!(components, vec!["etc", "passwd"]);
    }

    #[test]
    fn sanitize_handles_backslash_separators() {
        let components = sanitize("photos\\vacation\\a.jpg").unwrap();
        assert_eq!(components, vec!["photos", "vacation", "a.jpg"]);
    }

    #[test]
    fn sanitize_rejects_all_dotdot_path() {
        assert!(sanitize("../../..").is_err());
    }

    #[tokio::test]
    async fn resolve_sink_path_stays_within_destination_root() {
        let dir = tempdir().unwrap();
        let mut rename_map = HashMap::new();
        let path = resolve_sink_path(dir.path(), "doc.pdf", &mut rename_map)
            .await
            .unwrap();
        let canonical_root = tokio::fs::canonicalize(dir.path()).await.unwrap();
        assert!(path.starts_with(canonical_root));
        assert_eq!(path.file_name().unwrap(), "doc.pdf");
    }

    #[tokio::test]
    async fn resolve_sink_path_rejects_traversal_even_after_sanitization() {
        let dir = tempdir().unwrap();
        let mut rename_map = HashMap::new();
        // sanitize() strips the ".." components, so the result stays rooted;
        // this test documents that guarantee rather than exercising a raw escape.
        let path = resolve_sink_path(dir.path(), "../../etc/passwd", &mut rename_map)
            .await
            .unwrap();
        let canonical_root = tokio::fs::canonicalize(dir.path()).await.unwrap();
        assert!(path.starts_with(canonical_root));
    }

    #[tokio::test]
    async fn resolve_sink_path_preserves_nested_structure() {
        let dir = tempdir().unwrap();
        let mut rename_map = HashMap::new();
        let path = resolve_sink_path(dir.path(), "photos/vacation/a.jpg", &mut rename_map)
            .await
            .unwrap();
        assert!(path.ends_with("photos/vacation/a.jpg"));
    }

    #[tokio::test]
    async fn stream_to_sink_rejects_oversized_pre_size_check() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("huge.bin");
        let chunks: Vec<reqwest::Result<bytes::Bytes>> = vec![];
        let stream = tokio_stream::iter(chunks);
        let result = stream_to_sink(stream, &target, MAX_FILE_SIZE + 1).await;
        assert!(result.is_err());
        assert!(!target.exists());
    }

    mod proptests {
        use super::super::sanitize;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn sanitize_never_yields_dot_or_dotdot_components(name in "[a-zA-Z0-9/\\\\._-]{0,64}") {
                if let Ok(components) = sanitize(&name) {
                    for component in &components {
                        prop_assert_ne!(component.as_str(), ".");
                        prop_assert_ne!(component.as_str(), "..");
                        prop_assert!(!component.is_empty());
                        prop_assert!(!component.contains('/'));
                        prop_assert!(!component.contains('\\'));
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn stream_to_sink_writes_exact_bytes() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("doc.txt");
        let payload = bytes::Bytes::from_static(b"hello world");
        let chunks: Vec<reqwest::Result<bytes::Bytes>> = vec![Ok(payload.clone())];
        let stream = tokio_stream::iter(chunks);
        let received = stream_to_sink(stream, &target, payload.len() as u64)
            .await
            .unwrap();
        assert_eq!(received, payload.len() as u64);
        let on_disk = tokio::fs::read(&target).await.unwrap();
        assert_eq!(on_disk, payload.to_vec());
    }
}
