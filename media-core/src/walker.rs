//! File Walker: deterministic, checkpointable directory traversal.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::warn;

use media_model::LibraryKind;

/// One discovered filesystem entry worth considering for the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub size: u64,
}

/// Filtering policy applied while walking a library's root.
#[derive(Debug, Clone)]
pub struct WalkFilter {
    pub allowed_extensions: Vec<String>,
    pub min_size_bytes: u64,
    /// Resume cursor: skip everything lexicographically `<=` this path.
    pub resume_after: Option<String>,
}

impl WalkFilter {
    pub fn for_library_kind(kind: LibraryKind) -> Self {
        Self {
            allowed_extensions: media_model::media_file::extensions_for(kind)
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_size_bytes: 1024,
            resume_after: None,
        }
    }

    fn is_hidden(path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(false)
    }

    fn is_trickplay(path: &Path) -> bool {
        let is_sidecar_dir = path
            .to_str()
            .map(|s| s.contains(".trickplay/") || s.ends_with(".trickplay"))
            .unwrap_or(false);
        let is_bif = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("bif"))
            .unwrap_or(false);
        is_sidecar_dir || is_bif
    }

    fn accepts(&self, path: &Path, size: u64) -> bool {
        if Self::is_hidden(path) || Self::is_trickplay(path) {
            return false;
        }
        if size < self.min_size_bytes {
            return false;
        }
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(ext))
    }
}

/// Walks a library root, yielding [`FileEntry`] values in a single stable,
/// deterministic full-path lexicographic order so checkpoint resume is
/// exact regardless of where in the tree the cursor lands.
pub struct Walker;

impl Walker {
    /// Walk `root`, streaming entries that pass `filter`. Cooperatively
    /// cancellable via `cancel`: checked between every directory entry.
    /// `discovered` is bumped for every entry sent, ahead of that entry
    /// being processed, so callers can observe in-flight discovery count
    /// diverge from the processed count.
    pub fn walk(
        root: PathBuf,
        filter: WalkFilter,
        cancel: tokio_util::sync::CancellationToken,
        discovered: Arc<AtomicU64>,
    ) -> UnboundedReceiverStream<FileEntry> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut visited_inodes = HashSet::new();
            Self::walk_dir(&root, &root, &filter, &cancel, &mut visited_inodes, &tx, &discovered).await;
        });

        UnboundedReceiverStream::new(rx)
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_dir<'a>(
        root: &'a Path,
        dir: &'a Path,
        filter: &'a WalkFilter,
        cancel: &'a tokio_util::sync::CancellationToken,
        visited_inodes: &'a mut HashSet<u64>,
        tx: &'a tokio::sync::mpsc::UnboundedSender<FileEntry>,
        discovered: &'a AtomicU64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return;
            }

            let mut entries = match tokio::fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(path = %dir.display(), error = %err, "failed to read directory, skipping");
                    return;
                }
            };

            let mut children: Vec<Child> = Vec::new();
            loop {
                let next = match entries.next_entry().await {
                    Ok(next) => next,
                    Err(err) => {
                        warn!(path = %dir.display(), error = %err, "failed to read directory entry, stopping");
                        break;
                    }
                };
                let Some(entry) = next else { break };
                let path = entry.path();

                let metadata = match tokio::fs::symlink_metadata(&path).await {
                    Ok(m) => m,
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "lstat failed, skipping");
                        continue;
                    }
                };

                if metadata.is_symlink() {
                    let Ok(resolved) = tokio::fs::canonicalize(&path).await else {
                        continue;
                    };
                    if !resolved.starts_with(root) {
                        continue;
                    }
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::MetadataExt;
                        if let Ok(target_meta) = tokio::fs::metadata(&resolved).await {
                            if !visited_inodes.insert(target_meta.ino()) {
                                continue;
                            }
                        }
                    }
                    if let Ok(target_meta) = tokio::fs::metadata(&resolved).await {
                        if target_meta.is_dir() {
                            children.push(Child::Dir(resolved));
                        } else {
                            children.push(Child::File(path, target_meta.len()));
                        }
                    }
                    continue;
                }

                if metadata.is_dir() {
                    children.push(Child::Dir(path));
                } else {
                    children.push(Child::File(path, metadata.len()));
                }
            }

            // Single global lexicographic order (not "all files, then all
            // dirs") so a resume cursor taken mid-walk never skips a path
            // that sorts before it but lives under a not-yet-visited
            // subdirectory.
            children.sort_by(|a, b| a.path().cmp(b.path()));

            for child in children {
                if cancel.is_cancelled() {
                    return;
                }
                match child {
                    Child::File(path, size) => {
                        if let Some(cursor) = &filter.resume_after {
                            if path.to_string_lossy().as_ref() <= cursor.as_str() {
                                continue;
                            }
                        }
                        if filter.accepts(&path, size) {
                            discovered.fetch_add(1, Ordering::SeqCst);
                            if tx.send(FileEntry { path, size }).is_err() {
                                return;
                            }
                        }
                    }
                    Child::Dir(dir) => {
                        Self::walk_dir(root, &dir, filter, cancel, visited_inodes, tx, discovered).await;
                    }
                }
            }
        })
    }
}

/// A directory child pending classification into the single sorted
/// traversal order.
enum Child {
    Dir(PathBuf),
    File(PathBuf, u64),
}

impl Child {
    fn path(&self) -> &Path {
        match self {
            Child::Dir(path) => path,
            Child::File(path, _) => path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::fs;

    fn filter() -> WalkFilter {
        WalkFilter {
            allowed_extensions: vec!["mkv".to_string(), "mp4".to_string()],
            min_size_bytes: 0,
            resume_after: None,
        }
    }

    fn counter() -> Arc<AtomicU64> {
        Arc::new(AtomicU64::new(0))
    }

    #[tokio::test]
    async fn walks_in_deterministic_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.mkv"), b"1234").unwrap();
        fs::write(dir.path().join("a.mkv"), b"1234").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("c.mp4"), b"1234").unwrap();

        let cancel = tokio_util::sync::CancellationToken::new();
        let stream = Walker::walk(dir.path().to_path_buf(), filter(), cancel, counter());
        let entries: Vec<_> = stream.collect().await;

        let names: Vec<_> = entries
            .iter()
            .map(|e| e.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.mkv", "b.mkv", "c.mp4"]);
    }

    #[tokio::test]
    async fn filters_hidden_and_unsupported_extensions() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".hidden.mkv"), b"1234").unwrap();
        fs::write(dir.path().join("readme.txt"), b"1234").unwrap();
        fs::write(dir.path().join("movie.mkv"), b"1234").unwrap();

        let cancel = tokio_util::sync::CancellationToken::new();
        let stream = Walker::walk(dir.path().to_path_buf(), filter(), cancel, counter());
        let entries: Vec<_> = stream.collect().await;

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path.file_name().unwrap(), "movie.mkv");
    }

    #[tokio::test]
    async fn sibling_directory_sorts_before_trailing_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("xyz.mkv"), b"1234").unwrap();
        fs::create_dir(dir.path().join("abc")).unwrap();
        fs::write(dir.path().join("abc").join("z.mkv"), b"1234").unwrap();

        let cancel = tokio_util::sync::CancellationToken::new();
        let stream = Walker::walk(dir.path().to_path_buf(), filter(), cancel, counter());
        let entries: Vec<_> = stream.collect().await;

        let paths: Vec<_> = entries.iter().map(|e| e.path.clone()).collect();
        assert_eq!(
            paths,
            vec![dir.path().join("abc").join("z.mkv"), dir.path().join("xyz.mkv")],
            "abc/z.mkv sorts before xyz.mkv in full-path lexicographic order"
        );
    }

    #[tokio::test]
    async fn resume_cursor_skips_already_processed_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.mkv"), b"1234").unwrap();
        fs::write(dir.path().join("b.mkv"), b"1234").unwrap();
        fs::write(dir.path().join("c.mkv"), b"1234").unwrap();

        let mut f = filter();
        f.resume_after = Some(dir.path().join("b.mkv").to_string_lossy().to_string());

        let cancel = tokio_util::sync::CancellationToken::new();
        let stream = Walker::walk(dir.path().to_path_buf(), f, cancel, counter());
        let entries: Vec<_> = stream.collect().await;

        let names: Vec<_> = entries
            .iter()
            .map(|e| e.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["c.mkv"]);
    }

    #[tokio::test]
    async fn discovered_counter_tracks_every_emitted_entry() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.mkv"), b"1234").unwrap();
        fs::write(dir.path().join("b.mkv"), b"1234").unwrap();
        fs::write(dir.path().join("skip.txt"), b"1234").unwrap();

        let discovered = counter();
        let cancel = tokio_util::sync::CancellationToken::new();
        let stream = Walker::walk(dir.path().to_path_buf(), filter(), cancel, discovered.clone());
        let entries: Vec<_> = stream.collect().await;

        assert_eq!(entries.len(), 2);
        assert_eq!(discovered.load(Ordering::SeqCst), 2);
    }
}
