//! Pipeline controller: one document from page images to merged Markdown.
//!
//! ## Flow
//!
//! ```text
//!  renderer thread          controller                 conversion units
//!  ───────────────          ──────────                 ────────────────
//!  next_page() ──► mpsc ──► spawn unit per page ──►  gate.acquire()
//!  next_page() ──► mpsc ──► spawn unit per page      client.convert()
//!      ...                  (never waits on gate)    store.write_page()
//!                                                    progress
//!  end ────────────────────► join all units
//!                            take the directory's merge lock
//!                            read artifacts 1..=N from disk
//!                            write merged, emit 100 %
//! ```
//!
//! Rendering is never throttled: the admission gate bounds only the number
//! of conversions in flight. The merged document is rebuilt from the page
//! artifacts on disk in ascending page order, so completion order never
//! affects the result.

use crate::config::ConversionConfig;
use crate::error::{PageError, Pdf2MdError};
use crate::output::{ConversionOutput, ConversionStats, PageImage, PageResult};
use crate::pipeline::llm::CompletionClient;
use crate::pipeline::render::{self, PageRenderer, PdfiumRenderer};
use crate::progress::{ProgressCallback, ProgressEvent};
use crate::store::{self, PageStore};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Content substituted for a page whose conversion failed.
pub fn error_placeholder(page_num: usize) -> String {
    format!("<!-- Error processing page {} -->", page_num)
}

/// Drives document runs. Cheap to share behind an `Arc`.
pub struct Pipeline {
    client: Arc<CompletionClient>,
    renderer: Arc<dyn PageRenderer>,
    config: ConversionConfig,
}

impl Pipeline {
    pub fn new(
        client: Arc<CompletionClient>,
        renderer: Arc<dyn PageRenderer>,
        config: ConversionConfig,
    ) -> Self {
        Self {
            client,
            renderer,
            config,
        }
    }

    /// Pipeline over the configured LLM provider and the pdfium renderer.
    pub fn from_config(config: ConversionConfig) -> Result<Self, Pdf2MdError> {
        let client = CompletionClient::from_config(&config)?;
        let renderer = PdfiumRenderer::from_config(&config);
        Ok(Self::new(Arc::new(client), Arc::new(renderer), config))
    }

    pub fn client(&self) -> &Arc<CompletionClient> {
        &self.client
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    /// Convert `document` with at most `concurrency` pages in flight.
    ///
    /// # Errors
    /// Fatal only: the document is unreadable, the renderer cannot open
    /// it, a dispatched page has no artifact at reassembly time, the merged
    /// document cannot be written, or the document deadline expired.
    /// Individual page failures become placeholders instead.
    pub async fn run(
        &self,
        task_id: &str,
        document: &Path,
        concurrency: usize,
        progress: ProgressCallback,
    ) -> Result<ConversionOutput, Pdf2MdError> {
        match self.config.document_timeout() {
            // Dropping the run future drops its JoinSet, which aborts every unit.
            Some(limit) => {
                let run = self.run_inner(task_id, document, concurrency, progress);
                tokio::time::timeout(limit, run).await.map_err(|_| {
                    error!("Task {}: document deadline of {:?} expired", task_id, limit);
                    Pdf2MdError::DocumentTimeout {
                        secs: limit.as_secs(),
                    }
                })?
            }
            None => self.run_inner(task_id, document, concurrency, progress).await,
        }
    }

    async fn run_inner(
        &self,
        task_id: &str,
        document: &Path,
        concurrency: usize,
        progress: ProgressCallback,
    ) -> Result<ConversionOutput, Pdf2MdError> {
        let start = Instant::now();
        let concurrency = concurrency.max(1);
        info!(
            "Task {}: starting {} (concurrency {})",
            task_id,
            document.display(),
            concurrency
        );

        // ── Step 1: Open the page producer ───────────────────────────────
        render::check_document(document)?;
        let store = PageStore::for_document(document);
        let base_name = store::document_base_name(document);

        let renderer = Arc::clone(&self.renderer);
        let doc_path = document.to_path_buf();
        let out_dir = store.dir().to_path_buf();
        let mut source = tokio::task::spawn_blocking(move || renderer.open(&doc_path, &out_dir))
            .await
            .map_err(|e| Pdf2MdError::Internal(format!("Renderer task panicked: {}", e)))??;

        let (tx, mut rx) = mpsc::unbounded_channel::<Result<PageImage, Pdf2MdError>>();
        let producer = tokio::task::spawn_blocking(move || {
            while let Some(item) = source.next_page() {
                let stop = item.is_err();
                if tx.send(item).is_err() || stop {
                    break;
                }
            }
        });

        // ── Step 2: Dispatch one unit per page ───────────────────────────
        let gate = Arc::new(Semaphore::new(concurrency));
        let produced = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        let mut units: JoinSet<UnitOutcome> = JoinSet::new();
        let mut dispatched: Vec<usize> = Vec::new();

        while let Some(item) = rx.recv().await {
            let image = match item {
                Ok(image) => image,
                Err(e) => {
                    error!("Task {}: rendering stopped early: {}", task_id, e);
                    break;
                }
            };
            let page_num = image.page_num();
            dispatched.push(page_num);

            if produced.fetch_add(1, Ordering::SeqCst) == 0 {
                progress.on_progress(ProgressEvent::processing(task_id, 0, 1));
            }
            debug!("Task {}: dispatching page {}", task_id, page_num);

            units.spawn(convert_unit(
                UnitContext {
                    task_id: task_id.to_string(),
                    client: Arc::clone(&self.client),
                    store: store.clone(),
                    gate: Arc::clone(&gate),
                    produced: Arc::clone(&produced),
                    completed: Arc::clone(&completed),
                    progress: Arc::clone(&progress),
                },
                image,
            ));
        }
        drop(rx);
        if let Err(e) = producer.await {
            warn!("Task {}: renderer thread ended abnormally: {}", task_id, e);
        }

        // ── Step 3: Await every unit ─────────────────────────────────────
        let mut pages = Vec::with_capacity(dispatched.len());
        let mut unpersisted: Vec<(usize, String)> = Vec::new();
        while let Some(joined) = units.join_next().await {
            match joined {
                Ok(outcome) => {
                    if let Some(detail) = outcome.persist_error {
                        unpersisted.push((outcome.result.page_num, detail));
                    }
                    pages.push(outcome.result);
                }
                // The page's artifact is missing; reassembly reports it.
                Err(e) => error!("Task {}: conversion unit aborted: {}", task_id, e),
            }
        }
        pages.sort_by_key(|p| p.page_num);
        let total_pages = dispatched.len();

        // ── Step 4: Reassemble from disk ─────────────────────────────────
        let _merge = store.lock_merge().await;
        let markdown = reassemble(&store, dispatched, unpersisted).await?;
        let merged_path = store.write_merged(&base_name, &markdown).await?;

        progress.on_progress(ProgressEvent::completed(task_id, total_pages));

        // ── Step 5: Totals ───────────────────────────────────────────────
        let failed_pages = pages.iter().filter(|p| !p.is_ok()).count();
        let stats = ConversionStats {
            total_pages,
            processed_pages: total_pages - failed_pages,
            failed_pages,
            total_input_tokens: pages.iter().map(|p| p.input_tokens).sum(),
            total_output_tokens: pages.iter().map(|p| p.output_tokens).sum(),
            total_duration_ms: start.elapsed().as_millis() as u64,
        };

        info!(
            "Task {}: {} pages ({} failed), {} input / {} output tokens, {}ms → {}",
            task_id,
            stats.total_pages,
            stats.failed_pages,
            stats.total_input_tokens,
            stats.total_output_tokens,
            stats.total_duration_ms,
            merged_path.display()
        );

        Ok(ConversionOutput {
            markdown,
            merged_path,
            pages,
            stats,
        })
    }
}

/// Read the artifact of every dispatched page, in page order, and assemble
/// them. Fails on the first page that was not persisted by this run or has
/// no artifact on disk.
async fn reassemble(
    store: &PageStore,
    mut dispatched: Vec<usize>,
    mut unpersisted: Vec<(usize, String)>,
) -> Result<String, Pdf2MdError> {
    unpersisted.sort_unstable();
    if let Some((page, detail)) = unpersisted.into_iter().next() {
        return Err(Pdf2MdError::PagePersistFailed { page, detail });
    }

    dispatched.sort_unstable();
    let mut contents = Vec::with_capacity(dispatched.len());
    for page_num in dispatched {
        match store.read_page(page_num).await? {
            Some(content) => contents.push((page_num, content)),
            None => {
                return Err(Pdf2MdError::PageArtifactMissing {
                    page: page_num,
                    dir: store.dir().to_path_buf(),
                })
            }
        }
    }
    Ok(store::assemble(contents.iter().map(|(n, c)| (*n, c.as_str()))))
}

struct UnitOutcome {
    result: PageResult,
    /// Set when the artifact write failed.
    persist_error: Option<String>,
}

struct UnitContext {
    task_id: String,
    client: Arc<CompletionClient>,
    store: PageStore,
    gate: Arc<Semaphore>,
    produced: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
    progress: ProgressCallback,
}

/// Convert, persist and report one page. Never fails: conversion errors
/// become a placeholder page, persist errors are handed to reassembly.
async fn convert_unit(ctx: UnitContext, image: PageImage) -> UnitOutcome {
    let page_num = image.page_num();

    // The gate is owned by this run and never closed.
    let permit = ctx.gate.acquire_owned().await.ok();
    let converted = ctx.client.convert(page_num, &image.path).await;
    drop(permit);

    let mut result = match converted {
        Ok(t) => PageResult {
            page_num,
            markdown: t.markdown,
            input_tokens: t.usage.input_tokens,
            output_tokens: t.usage.output_tokens,
            duration_ms: t.duration_ms,
            retries: t.retries,
            error: None,
        },
        Err(e) => {
            error!("{}", e);
            let retries = match &e {
                PageError::LlmFailed { attempts, .. } => attempts.saturating_sub(1),
                _ => 0,
            };
            PageResult {
                page_num,
                markdown: error_placeholder(page_num),
                input_tokens: 0,
                output_tokens: 0,
                duration_ms: 0,
                retries,
                error: Some(e),
            }
        }
    };

    let mut persist_error = None;
    if let Err(e) = ctx.store.write_page(page_num, &result.markdown).await {
        error!("Page {}: {}", page_num, e);
        if result.error.is_none() {
            result.error = Some(PageError::PersistFailed {
                page: page_num,
                detail: e.to_string(),
            });
        }
        persist_error = Some(e.to_string());
    }

    // Units report independently; `done` values may reach subscribers out of order.
    let done = ctx.completed.fetch_add(1, Ordering::SeqCst) + 1;
    let known = ctx.produced.load(Ordering::SeqCst).max(done);
    ctx.progress
        .on_progress(ProgressEvent::processing(ctx.task_id.as_str(), done, known));

    UnitOutcome {
        result,
        persist_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::llm::{Completion, CompletionRequest, ModelError, PageModel};
    use crate::pipeline::render::PageSource;
    use crate::progress::NoopProgressCallback;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    struct CountingModel {
        calls: AtomicU32,
    }

    #[async_trait]
    impl PageModel for CountingModel {
        async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Completion::new(format!("PAGE{}", request.page_num), 1, 1))
        }
    }

    struct BrokenRenderer;

    impl PageRenderer for BrokenRenderer {
        fn open(&self, document: &Path, _out_dir: &Path) -> Result<Box<dyn PageSource>, Pdf2MdError> {
            Err(Pdf2MdError::CorruptPdf {
                path: document.to_path_buf(),
                detail: "bad xref".into(),
            })
        }
    }

    /// Yields `ok` pages, then a render error.
    struct FailingAfter {
        ok: usize,
        next: usize,
        dir: PathBuf,
    }

    impl PageSource for FailingAfter {
        fn next_page(&mut self) -> Option<Result<PageImage, Pdf2MdError>> {
            let idx = self.next;
            self.next += 1;
            if idx < self.ok {
                let path = self.dir.join(render::page_image_name(idx + 1));
                std::fs::write(&path, b"img").ok()?;
                Some(Ok(PageImage::new(idx, path)))
            } else {
                Some(Err(Pdf2MdError::RasterisationFailed {
                    page: idx + 1,
                    detail: "boom".into(),
                }))
            }
        }
    }

    struct FailingAfterRenderer(usize);

    impl PageRenderer for FailingAfterRenderer {
        fn open(&self, _document: &Path, out_dir: &Path) -> Result<Box<dyn PageSource>, Pdf2MdError> {
            Ok(Box::new(FailingAfter {
                ok: self.0,
                next: 0,
                dir: out_dir.to_path_buf(),
            }))
        }
    }

    fn pipeline(renderer: Arc<dyn PageRenderer>, model: Arc<CountingModel>) -> Pipeline {
        let config = ConversionConfig::default();
        let client = CompletionClient::new(model, &config);
        Pipeline::new(Arc::new(client), renderer, config)
    }

    fn document(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("report.pdf");
        std::fs::write(&path, b"%PDF-1.7").unwrap();
        path
    }

    #[test]
    fn placeholder_names_the_page() {
        assert_eq!(error_placeholder(2), "<!-- Error processing page 2 -->");
    }

    #[tokio::test]
    async fn missing_document_fails_before_rendering() {
        let model = Arc::new(CountingModel {
            calls: AtomicU32::new(0),
        });
        let p = pipeline(Arc::new(FailingAfterRenderer(3)), model.clone());
        let err = p
            .run("t", Path::new("/nope/report.pdf"), 2, Arc::new(NoopProgressCallback))
            .await
            .unwrap_err();
        assert!(matches!(err, Pdf2MdError::FileNotFound { .. }));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn renderer_init_failure_dispatches_nothing() {
        let tmp = TempDir::new().unwrap();
        let model = Arc::new(CountingModel {
            calls: AtomicU32::new(0),
        });
        let p = pipeline(Arc::new(BrokenRenderer), model.clone());
        let err = p
            .run("t", &document(&tmp), 2, Arc::new(NoopProgressCallback))
            .await
            .unwrap_err();
        assert!(matches!(err, Pdf2MdError::CorruptPdf { .. }));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
        assert!(!tmp.path().join("report.md").exists());
    }

    #[tokio::test]
    async fn render_error_ends_production_but_keeps_earlier_pages() {
        let tmp = TempDir::new().unwrap();
        let model = Arc::new(CountingModel {
            calls: AtomicU32::new(0),
        });
        let p = pipeline(Arc::new(FailingAfterRenderer(2)), model.clone());
        let out = p
            .run("t", &document(&tmp), 2, Arc::new(NoopProgressCallback))
            .await
            .expect("pages produced before the error still merge");
        assert_eq!(out.stats.total_pages, 2);
        assert_eq!(
            out.markdown,
            "<!-- page 1 -->\n\nPAGE1\n\n<!-- page 2 -->\n\nPAGE2\n"
        );
    }

    #[tokio::test]
    async fn failed_write_over_stale_artifact_fails_the_run() {
        let tmp = TempDir::new().unwrap();
        let doc = document(&tmp);
        // A directory at the artifact path makes the atomic rename fail.
        std::fs::create_dir(tmp.path().join("page_0002.md")).unwrap();
        std::fs::write(tmp.path().join("page_0002.md").join("stale"), "old").unwrap();
        let model = Arc::new(CountingModel {
            calls: AtomicU32::new(0),
        });
        let p = pipeline(Arc::new(FailingAfterRenderer(3)), model);

        let err = p
            .run("t", &doc, 2, Arc::new(NoopProgressCallback))
            .await
            .unwrap_err();
        assert!(
            matches!(err, Pdf2MdError::PagePersistFailed { page: 2, .. }),
            "got {err:?}"
        );
        assert!(!tmp.path().join("report.md").exists());
    }

    #[tokio::test]
    async fn stale_artifact_is_not_merged_for_unpersisted_page() {
        let tmp = TempDir::new().unwrap();
        let store = PageStore::new(tmp.path());
        store.write_page(1, "fresh").await.unwrap();
        store.write_page(2, "from an earlier run").await.unwrap();

        let err = reassemble(&store, vec![2, 1], vec![(2, "disk full".into())])
            .await
            .unwrap_err();
        assert!(matches!(err, Pdf2MdError::PagePersistFailed { page: 2, .. }));

        let ok = reassemble(&store, vec![2, 1], vec![]).await.unwrap();
        assert_eq!(
            ok,
            "<!-- page 1 -->\n\nfresh\n\n<!-- page 2 -->\n\nfrom an earlier run\n"
        );
    }

    /// Deletes page 2's artifact as soon as it has been written.
    struct ArtifactThief {
        dir: PathBuf,
    }

    impl crate::progress::ConversionProgressCallback for ArtifactThief {
        fn on_progress(&self, _event: ProgressEvent) {
            let _ = std::fs::remove_file(self.dir.join("page_0002.md"));
        }
    }

    #[tokio::test]
    async fn missing_artifact_fails_the_run() {
        let tmp = TempDir::new().unwrap();
        let doc = document(&tmp);
        let model = Arc::new(CountingModel {
            calls: AtomicU32::new(0),
        });
        let p = pipeline(Arc::new(FailingAfterRenderer(3)), model);
        let thief = Arc::new(ArtifactThief {
            dir: tmp.path().to_path_buf(),
        });

        let err = p.run("t", &doc, 1, thief).await.unwrap_err();
        assert!(
            matches!(err, Pdf2MdError::PageArtifactMissing { page: 2, .. }),
            "got {err:?}"
        );
        assert!(!tmp.path().join("report.md").exists());
        assert!(tmp.path().join("page_0001.md").exists());
    }

    #[tokio::test]
    async fn page_shaped_document_name_keeps_artifacts_apart() {
        let tmp = TempDir::new().unwrap();
        let doc = tmp.path().join("page_0001.pdf");
        std::fs::write(&doc, b"%PDF-1.7").unwrap();
        let model = Arc::new(CountingModel {
            calls: AtomicU32::new(0),
        });
        let p = pipeline(Arc::new(FailingAfterRenderer(2)), model);

        let out = p
            .run("t", &doc, 2, Arc::new(NoopProgressCallback))
            .await
            .unwrap();
        assert_eq!(out.merged_path, tmp.path().join("merged_page_0001.md"));
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("page_0001.md")).unwrap(),
            "PAGE1"
        );
        let listed = PageStore::new(tmp.path()).list_pages().await.unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn no_pages_writes_empty_merge() {
        let tmp = TempDir::new().unwrap();
        let model = Arc::new(CountingModel {
            calls: AtomicU32::new(0),
        });
        let p = pipeline(Arc::new(FailingAfterRenderer(0)), model);
        let out = p
            .run("t", &document(&tmp), 1, Arc::new(NoopProgressCallback))
            .await
            .unwrap();
        assert_eq!(out.stats.total_pages, 0);
        assert_eq!(out.markdown, "");
        assert_eq!(std::fs::read_to_string(out.merged_path).unwrap(), "");
    }
}
