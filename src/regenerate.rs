//! Single-page regeneration and re-merge.
//!
//! Regeneration converts one page again, replaces its artifact and rebuilds
//! the merged document from every page artifact found on disk. The scan
//! (rather than any in-memory state) makes it correct for artifacts written
//! by an earlier run or another process.
//!
//! It is all-or-nothing for the target page: if the conversion fails,
//! nothing is written; if the merged document cannot be rewritten, the
//! page's previous artifact is put back. Regenerations of one document are
//! serialized on the store's merge lock, so the merged document written last
//! always matches the page artifacts on disk.

use crate::error::Pdf2MdError;
use crate::output::TokenUsage;
use crate::pipeline::llm::CompletionClient;
use crate::store::{self, PageStore};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// What a successful regeneration changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegenerationOutcome {
    pub page_num: usize,
    /// Tokens spent on this regeneration; add to the task's totals.
    pub usage: TokenUsage,
    pub page_path: PathBuf,
    pub merged_path: PathBuf,
    /// Pages found on disk and merged.
    pub merged_pages: usize,
}

/// Regenerate page `page_num` of `document` from `image_path`.
pub async fn regenerate_page(
    client: &CompletionClient,
    document: &Path,
    page_num: usize,
    image_path: &Path,
) -> Result<RegenerationOutcome, Pdf2MdError> {
    if page_num == 0 {
        return Err(Pdf2MdError::InvalidConfig(
            "page numbers start at 1".into(),
        ));
    }
    let store = PageStore::for_document(document);

    let transcription = client
        .convert(page_num, image_path)
        .await
        .map_err(|source| Pdf2MdError::RegenerationFailed {
            page: page_num,
            source,
        })?;

    let _merge = store.lock_merge().await;
    let previous = store.read_page(page_num).await?;
    let page_path = store.write_page(page_num, &transcription.markdown).await?;
    let (merged_path, merged_pages) = match remerge(&store, document).await {
        Ok(merged) => merged,
        Err(e) => {
            restore_page(&store, page_num, previous.as_deref()).await;
            return Err(e);
        }
    };

    info!(
        "Page {}: regenerated ({} input / {} output tokens), merged {} pages → {}",
        page_num,
        transcription.usage.input_tokens,
        transcription.usage.output_tokens,
        merged_pages,
        merged_path.display()
    );

    Ok(RegenerationOutcome {
        page_num,
        usage: transcription.usage,
        page_path,
        merged_path,
        merged_pages,
    })
}

/// Put back the artifact a failed regeneration replaced.
async fn restore_page(store: &PageStore, page_num: usize, previous: Option<&str>) {
    let restored = match previous {
        Some(content) => store.write_page(page_num, content).await.map(|_| ()),
        None => store.remove_page(page_num).await,
    };
    if let Err(e) = restored {
        error!("Page {}: could not restore previous artifact: {}", page_num, e);
    }
}

/// Rebuild the merged document for `document` from the page artifacts on
/// disk. Returns the merged path and the number of pages merged.
///
/// Callers that also write pages should hold [`PageStore::lock_merge`].
pub async fn remerge(store: &PageStore, document: &Path) -> Result<(PathBuf, usize), Pdf2MdError> {
    let pages = store.list_pages().await?;
    let merged = store::assemble(pages.iter().map(|(n, c)| (*n, c.as_str())));
    let path = store
        .write_merged(&store::document_base_name(document), &merged)
        .await?;
    Ok((path, pages.len()))
}
