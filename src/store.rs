//! Page store: atomic per-page and merged Markdown artifacts.
//!
//! Layout inside a document directory:
//!
//! ```text
//! <dir>/report.pdf        original document (never touched here)
//! <dir>/page_0001.png     rendered page images
//! <dir>/page_0001.md      one artifact per page
//! <dir>/report.md         merged document
//! ```
//!
//! Every write goes through a [`tempfile::NamedTempFile`] created in the
//! same directory and is renamed over the final path, so a reader sees either
//! the previous artifact or the complete new one, never a torn write.

use crate::error::Pdf2MdError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

static PAGE_ARTIFACT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^page_(\d{4,})\.md$").expect("valid page artifact regex"));

/// Stems that would collide with page artifacts if used for the merged file.
static RESERVED_STEM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^page_\d+$").expect("valid reserved stem regex"));

/// One merge lock per document directory, shared by every `PageStore` in
/// the process.
static MERGE_LOCKS: Lazy<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// File name of the artifact for a 1-indexed page: `page_0007.md`.
pub fn page_file_name(page_num: usize) -> String {
    format!("page_{:04}.md", page_num)
}

/// Parse a page number out of an artifact file name.
///
/// Only names [`page_file_name`] would produce are accepted: at least four
/// digits, no extra leading zeros (`page_01234.md` is rejected), no page 0.
pub fn parse_page_file_name(name: &str) -> Option<usize> {
    let caps = PAGE_ARTIFACT_RE.captures(name)?;
    let n: usize = caps[1].parse().ok()?;
    (n >= 1 && page_file_name(n) == name).then_some(n)
}

/// Marker placed before each page in the merged document.
pub fn page_marker(page_num: usize) -> String {
    format!("<!-- page {} -->", page_num)
}

/// Concatenate pages in the order given, each preceded by its marker.
///
/// Callers are responsible for passing pages sorted by page number.
pub fn assemble<'a, I>(pages: I) -> String
where
    I: IntoIterator<Item = (usize, &'a str)>,
{
    let parts: Vec<String> = pages
        .into_iter()
        .map(|(page_num, content)| format!("{}\n\n{}", page_marker(page_num), content))
        .collect();
    let mut doc = parts.join("\n\n");
    if !doc.is_empty() {
        doc.push('\n');
    }
    doc
}

/// File name of the merged document for a source document base name.
///
/// A base name shaped like a page artifact stem (`page_0001`) gets a
/// `merged_` prefix so the merged document never lands in the page set.
pub fn merged_file_name(base_name: &str) -> String {
    if RESERVED_STEM_RE.is_match(base_name) {
        format!("merged_{}.md", base_name)
    } else {
        format!("{}.md", base_name)
    }
}

/// Base name (stem) of a source document, used to name the merged artifact.
pub fn document_base_name(document: &Path) -> String {
    document
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string())
}

/// Artifact access for one document directory.
#[derive(Debug, Clone)]
pub struct PageStore {
    dir: PathBuf,
}

impl PageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted at the directory that holds `document`.
    pub fn for_document(document: &Path) -> Self {
        let dir = document
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn page_path(&self, page_num: usize) -> PathBuf {
        self.dir.join(page_file_name(page_num))
    }

    pub fn merged_path(&self, base_name: &str) -> PathBuf {
        self.dir.join(merged_file_name(base_name))
    }

    /// Exclusive access to this directory's merged document.
    ///
    /// Hold the guard across "write page, list pages, write merged" so the
    /// merged document always reflects the page artifacts written before it.
    pub async fn lock_merge(&self) -> OwnedMutexGuard<()> {
        let key = std::fs::canonicalize(&self.dir).unwrap_or_else(|_| self.dir.clone());
        let lock = {
            let mut locks = MERGE_LOCKS
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(key).or_default())
        };
        lock.lock_owned().await
    }

    /// Remove the artifact for `page_num`; a missing artifact is not an error.
    pub async fn remove_page(&self, page_num: usize) -> Result<(), Pdf2MdError> {
        let path = self.page_path(page_num);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Pdf2MdError::ArtifactWriteFailed { path, source }),
        }
    }

    /// Atomically replace the artifact for `page_num`.
    pub async fn write_page(&self, page_num: usize, content: &str) -> Result<PathBuf, Pdf2MdError> {
        let path = self.page_path(page_num);
        write_atomic(&self.dir, &path, content).await?;
        debug!("Page {}: artifact written to {}", page_num, path.display());
        Ok(path)
    }

    /// Read the artifact for `page_num`; `Ok(None)` when it does not exist.
    pub async fn read_page(&self, page_num: usize) -> Result<Option<String>, Pdf2MdError> {
        let path = self.page_path(page_num);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(Pdf2MdError::ArtifactReadFailed { path, source }),
        }
    }

    /// Atomically replace the merged document.
    pub async fn write_merged(&self, base_name: &str, content: &str) -> Result<PathBuf, Pdf2MdError> {
        let path = self.merged_path(base_name);
        write_atomic(&self.dir, &path, content).await?;
        debug!("Merged document written to {}", path.display());
        Ok(path)
    }

    /// Every page artifact on disk, sorted by page number.
    ///
    /// Files that look like page artifacts (`page_*.md`) but do not follow
    /// the fixed-width convention are logged and skipped; anything else in
    /// the directory is ignored.
    pub async fn list_pages(&self) -> Result<Vec<(usize, String)>, Pdf2MdError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|source| Pdf2MdError::ArtifactReadFailed {
                path: self.dir.clone(),
                source,
            })?;

        let mut numbered: Vec<(usize, PathBuf)> = Vec::new();
        loop {
            let entry = entries
                .next_entry()
                .await
                .map_err(|source| Pdf2MdError::ArtifactReadFailed {
                    path: self.dir.clone(),
                    source,
                })?;
            let Some(entry) = entry else { break };

            let name = entry.file_name().to_string_lossy().into_owned();
            match parse_page_file_name(&name) {
                Some(n) => numbered.push((n, entry.path())),
                None if name.starts_with("page_") && name.ends_with(".md") => {
                    warn!("Skipping unparseable page artifact '{}'", name);
                }
                None => {}
            }
        }

        numbered.sort_by_key(|(n, _)| *n);

        let mut pages = Vec::with_capacity(numbered.len());
        for (n, path) in numbered {
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| Pdf2MdError::ArtifactReadFailed { path, source })?;
            pages.push((n, content));
        }
        Ok(pages)
    }
}

/// Write `content` to a temp file in `dir`, then rename it over `path`.
async fn write_atomic(dir: &Path, path: &Path, content: &str) -> Result<(), Pdf2MdError> {
    let dir = dir.to_path_buf();
    let target = path.to_path_buf();
    let bytes = content.as_bytes().to_vec();

    tokio::task::spawn_blocking(move || -> Result<(), Pdf2MdError> {
        let fail = |source: std::io::Error| Pdf2MdError::ArtifactWriteFailed {
            path: target.clone(),
            source,
        };
        std::fs::create_dir_all(&dir).map_err(fail)?;
        let mut tmp = NamedTempFile::new_in(&dir).map_err(fail)?;
        tmp.write_all(&bytes).map_err(fail)?;
        tmp.as_file().sync_all().map_err(fail)?;
        // The temp file is removed automatically if persist fails.
        tmp.persist(&target).map_err(|e| fail(e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| Pdf2MdError::Internal(format!("Artifact write task panicked: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn page_names_are_fixed_width() {
        assert_eq!(page_file_name(7), "page_0007.md");
        assert_eq!(parse_page_file_name("page_0007.md"), Some(7));
        assert_eq!(parse_page_file_name("page_7.md"), None);
        assert_eq!(parse_page_file_name("page_10000.md"), Some(10000));
        assert_eq!(parse_page_file_name("page_01234.md"), None);
        assert_eq!(parse_page_file_name("page_0000.md"), None);
        assert_eq!(parse_page_file_name("page_0007.png"), None);
        assert_eq!(parse_page_file_name("report.md"), None);
    }

    #[test]
    fn assemble_frames_each_page() {
        let doc = assemble(vec![(1, "A"), (2, "B")]);
        assert_eq!(doc, "<!-- page 1 -->\n\nA\n\n<!-- page 2 -->\n\nB\n");
        assert_eq!(assemble(Vec::<(usize, &str)>::new()), "");
    }

    #[test]
    fn base_name_from_document() {
        assert_eq!(document_base_name(Path::new("/x/report.pdf")), "report");
        let store = PageStore::for_document(Path::new("/x/report.pdf"));
        assert_eq!(store.merged_path("report"), PathBuf::from("/x/report.md"));
    }

    #[test]
    fn merged_name_never_looks_like_a_page() {
        assert_eq!(merged_file_name("page_0001"), "merged_page_0001.md");
        assert_eq!(merged_file_name("page_12"), "merged_page_12.md");
        assert_eq!(merged_file_name("page_one"), "page_one.md");
        assert_eq!(parse_page_file_name(&merged_file_name("page_0001")), None);
    }

    #[tokio::test]
    async fn five_digit_pages_are_listed() {
        let tmp = TempDir::new().unwrap();
        let store = PageStore::new(tmp.path());
        store.write_page(9999, "a").await.unwrap();
        store.write_page(10000, "b").await.unwrap();

        let pages = store.list_pages().await.unwrap();
        assert_eq!(pages, vec![(9999, "a".to_string()), (10000, "b".to_string())]);
    }

    #[tokio::test]
    async fn merge_lock_is_shared_per_directory() {
        let tmp = TempDir::new().unwrap();
        let a = PageStore::new(tmp.path());
        let b = PageStore::new(tmp.path());

        let guard = a.lock_merge().await;
        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(50), b.lock_merge()).await;
        assert!(blocked.is_err(), "second store acquired a held lock");

        drop(guard);
        let _again = b.lock_merge().await;
    }

    #[tokio::test]
    async fn remove_page_tolerates_missing() {
        let tmp = TempDir::new().unwrap();
        let store = PageStore::new(tmp.path());
        store.write_page(1, "a").await.unwrap();
        store.remove_page(1).await.unwrap();
        store.remove_page(1).await.unwrap();
        assert_eq!(store.read_page(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn write_then_read_page() {
        let tmp = TempDir::new().unwrap();
        let store = PageStore::new(tmp.path());
        store.write_page(3, "hello").await.unwrap();
        assert_eq!(store.read_page(3).await.unwrap().as_deref(), Some("hello"));
        assert_eq!(store.read_page(4).await.unwrap(), None);

        store.write_page(3, "replaced").await.unwrap();
        assert_eq!(store.read_page(3).await.unwrap().as_deref(), Some("replaced"));
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_files() {
        let tmp = TempDir::new().unwrap();
        let store = PageStore::new(tmp.path());
        store.write_page(1, "a").await.unwrap();
        store.write_merged("doc", "merged").await.unwrap();

        let mut names: Vec<String> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["doc.md", "page_0001.md"]);
    }

    #[tokio::test]
    async fn list_pages_filters_and_sorts() {
        let tmp = TempDir::new().unwrap();
        let store = PageStore::new(tmp.path());
        store.write_page(10, "ten").await.unwrap();
        store.write_page(2, "two").await.unwrap();
        std::fs::write(tmp.path().join("report.md"), "merged").unwrap();
        std::fs::write(tmp.path().join("report.pdf"), "%PDF").unwrap();
        std::fs::write(tmp.path().join("page_0002.png"), "img").unwrap();
        std::fs::write(tmp.path().join("page_x.md"), "junk").unwrap();

        let pages = store.list_pages().await.unwrap();
        assert_eq!(
            pages,
            vec![(2, "two".to_string()), (10, "ten".to_string())]
        );
    }
}
