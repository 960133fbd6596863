//! Filesystem Gateway: bounded upload/list/download over a sandbox's
//! `work_dir`, with path-containment enforcement for downloads.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{KernelError, Result};

/// One entry in a `list_files` response.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
}

/// Writes `bytes` to `work_dir/rel_path` (or `work_dir/original_filename` if
/// `rel_path` is absent), creating intermediate directories. Returns the
/// absolute path actually written.
pub async fn upload(
    work_dir: &Path,
    rel_path: Option<&str>,
    original_filename: Option<&str>,
    bytes: &[u8],
) -> Result<PathBuf> {
    let chosen = rel_path
        .or(original_filename)
        .ok_or_else(|| KernelError::AccessDenied(PathBuf::from("<no filename given>")))?;

    let target = contain(work_dir, chosen)?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| KernelError::Io(parent.to_path_buf(), e))?;
    }

    let mut file = fs::File::create(&target)
        .await
        .map_err(|e| KernelError::Io(target.clone(), e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| KernelError::Io(target.clone(), e))?;

    Ok(target)
}

/// Recursively walks `work_dir`, returning every regular file with its size
/// and its path relative to `work_dir`.
pub async fn list(work_dir: PathBuf) -> Result<Vec<FileEntry>> {
    let join_error_dir = work_dir.clone();
    tokio::task::spawn_blocking(move || {
        let mut entries = Vec::new();
        for entry in walkdir::WalkDir::new(&work_dir).min_depth(1) {
            let entry = entry.map_err(|e| KernelError::Io(work_dir.clone(), e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&work_dir)
                .expect("walkdir entries are under work_dir");
            let size = entry
                .metadata()
                .map_err(|e| KernelError::Io(entry.path().to_path_buf(), e.into()))?
                .len();
            entries.push(FileEntry {
                path: portable_path(relative),
                size,
            });
        }
        Ok(entries)
    })
    .await
    .map_err(|e| KernelError::Io(join_error_dir, std::io::Error::other(e)))?
}

fn portable_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Resolves `rel_path` against `work_dir` (which must already be canonical)
/// and rejects anything that would escape it, purely lexically: `..`
/// components are popped against the accumulated path rather than followed
/// on disk, so this works whether or not the target exists yet (needed for
/// upload, where it usually doesn't).
pub fn contain(work_dir: &Path, rel_path: &str) -> Result<PathBuf> {
    let mut components: Vec<std::ffi::OsString> = Vec::new();
    for component in Path::new(rel_path).components() {
        match component {
            Component::Normal(part) => components.push(part.to_os_string()),
            Component::ParentDir => {
                if components.pop().is_none() {
                    return Err(KernelError::AccessDenied(PathBuf::from(rel_path)));
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }

    let mut target = work_dir.to_path_buf();
    for part in components {
        target.push(part);
    }

    if !target.starts_with(work_dir) {
        return Err(KernelError::AccessDenied(PathBuf::from(rel_path)));
    }
    Ok(target)
}

/// Resolves a download target: lexical containment first, then (if the
/// path exists) a second containment check against the fully
/// symlink-resolved path, so a symlink planted inside `work_dir` that
/// points outside it is still denied.
pub async fn resolve_for_download(work_dir: &Path, rel_path: &str) -> Result<PathBuf> {
    let target = contain(work_dir, rel_path)?;

    match fs::canonicalize(&target).await {
        Ok(real) => {
            if !real.starts_with(work_dir) {
                return Err(KernelError::AccessDenied(PathBuf::from(rel_path)));
            }
            Ok(real)
        }
        Err(_) => Err(KernelError::NotFound(PathBuf::from(rel_path))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn canonical_tmp() -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let canonical = fs::canonicalize(tmp.path()).await.unwrap();
        (tmp, canonical)
    }

    #[tokio::test]
    async fn upload_then_download_round_trips_bytes() {
        let (_tmp, work_dir) = canonical_tmp().await;
        let path = upload(&work_dir, Some("data/out.csv"), None, b"a,b\n1,2\n")
            .await
            .unwrap();
        assert_eq!(path, work_dir.join("data").join("out.csv"));

        let resolved = resolve_for_download(&work_dir, "data/out.csv").await.unwrap();
        let bytes = fs::read(resolved).await.unwrap();
        assert_eq!(bytes, b"a,b\n1,2\n");
    }

    #[tokio::test]
    async fn upload_without_rel_path_uses_original_filename() {
        let (_tmp, work_dir) = canonical_tmp().await;
        let path = upload(&work_dir, None, Some("report.txt"), b"hi")
            .await
            .unwrap();
        assert_eq!(path, work_dir.join("report.txt"));
    }

    #[tokio::test]
    async fn parent_dir_traversal_is_denied() {
        let (_tmp, work_dir) = canonical_tmp().await;
        let result = resolve_for_download(&work_dir, "../etc/passwd").await;
        assert!(matches!(result, Err(KernelError::AccessDenied(_))));
    }

    #[tokio::test]
    async fn symlink_escape_is_denied() {
        let (_tmp, work_dir) = canonical_tmp().await;
        let outside = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(outside.path(), b"secret").unwrap();

        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(outside.path(), work_dir.join("escape")).unwrap();
            let result = resolve_for_download(&work_dir, "escape").await;
            assert!(matches!(result, Err(KernelError::AccessDenied(_))));
        }
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let (_tmp, work_dir) = canonical_tmp().await;
        let result = resolve_for_download(&work_dir, "nope.txt").await;
        assert!(matches!(result, Err(KernelError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_returns_relative_paths_and_sizes() {
        let (_tmp, work_dir) = canonical_tmp().await;
        upload(&work_dir, Some("a.txt"), None, b"hi").await.unwrap();
        upload(&work_dir, Some("nested/b.txt"), None, b"hello")
            .await
            .unwrap();

        let mut entries = list(work_dir.clone()).await.unwrap();
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], FileEntry { path: "a.txt".into(), size: 2 });
        assert_eq!(entries[1], FileEntry { path: "nested/b.txt".into(), size: 5 });
    }
}
