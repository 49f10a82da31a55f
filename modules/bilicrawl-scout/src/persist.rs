// JSON state-file plumbing shared by the checkpoint, frontier, session and
// file-backed store.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::error::{CrawlError, Result};

/// Read a JSON state file.
///
/// A missing or blank file is `Ok(None)`. Unparsable content is
/// `CorruptState`, so callers decide whether to start over or halt.
pub(crate) async fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CrawlError::persistence(path, e)),
    };

    if raw.trim().is_empty() {
        return Ok(None);
    }

    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| CrawlError::CorruptState {
            path: path.to_path_buf(),
            source,
        })
}

/// Serialize `value` and replace `path` with it atomically.
///
/// Writes a sibling temp file, fsyncs it, then renames it over the target.
/// A crash at any point leaves either the old or the new file, never a
/// truncated one.
pub(crate) async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| {
        CrawlError::persistence(path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CrawlError::persistence(parent, e))?;
    }

    let tmp = temp_path(path);
    {
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| CrawlError::persistence(&tmp, e))?;
        f.write_all(&bytes)
            .await
            .map_err(|e| CrawlError::persistence(&tmp, e))?;
        f.sync_all()
            .await
            .map_err(|e| CrawlError::persistence(&tmp, e))?;
    }

    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| CrawlError::persistence(path, e))?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[tokio::test]
    async fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let got: Option<Vec<String>> = read_json_opt(&dir.path().join("absent.json"))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn blank_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blank.json");
        std::fs::write(&path, "  \n").unwrap();
        let got: Option<Vec<String>> = read_json_opt(&path).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn garbage_is_reported_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "[\"BV1\", ").unwrap();
        let err = read_json_opt::<Vec<String>>(&path).await.unwrap_err();
        assert!(matches!(err, CrawlError::CorruptState { .. }));
    }

    #[tokio::test]
    async fn atomic_write_replaces_content_and_cleans_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut first = BTreeMap::new();
        first.insert("BV1".to_string(), "one".to_string());
        write_json_atomic(&path, &first).await.unwrap();

        let mut second = first.clone();
        second.insert("BV2".to_string(), "two".to_string());
        write_json_atomic(&path, &second).await.unwrap();

        let got: BTreeMap<String, String> = read_json_opt(&path).await.unwrap().unwrap();
        assert_eq!(got, second);
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn temp_path_is_a_sibling() {
        let tmp = temp_path(Path::new("/state/used_ids.json"));
        assert_eq!(tmp, PathBuf::from("/state/used_ids.json.tmp"));
    }
}
