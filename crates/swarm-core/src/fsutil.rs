//! Atomic file replacement

use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::Result;

/// Suffix of in-progress writes; readers skip files carrying it
pub const TMP_SUFFIX: &str = ".tmp";

fn tmp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(
        ".{}.{}{}",
        name,
        Uuid::new_v4().simple(),
        TMP_SUFFIX
    ))
}

/// Replace `path` with `content` so readers see either the old or the new file
///
/// Writes a uniquely named sibling temp file, syncs it and renames it over the
/// target. Parent directories are created as needed.
pub async fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp_path = tmp_path_for(path);
    let mut file = fs::File::create(&tmp_path).await?;
    let written = async {
        file.write_all(content).await?;
        file.sync_all().await
    }
    .await;
    drop(file);

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }

    if let Err(e) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }

    debug!(path = %path.display(), "Atomic write completed");
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically
pub async fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &content).await
}

/// Whether a directory entry is a leftover temp file from an interrupted write
pub fn is_tmp_file(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().ends_with(TMP_SUFFIX))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_atomic_write_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/state.json");

        atomic_write(&path, b"first").await.unwrap();
        atomic_write(&path, b"second").await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| is_tmp_file(&e.path()))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_atomic_write_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("value.json");

        atomic_write_json(&path, &serde_json::json!({"a": 1})).await.unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["a"], 1);
    }
}
