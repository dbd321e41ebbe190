//! Error types for the pdf2md pipeline.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`Pdf2MdError`] — **Fatal**: the run cannot proceed at all (document
//!   missing, renderer cannot open it, merged artifact cannot be written,
//!   a regeneration failed). Returned as `Err(Pdf2MdError)` from
//!   [`crate::convert::Pipeline::run`], [`crate::regenerate::regenerate_page`]
//!   and the [`crate::tasks::Scheduler`] entry points.
//!
//! * [`PageError`] — **Non-fatal**: a single page failed (unreadable image,
//!   model call exhausted its retries) but the document carries on with a
//!   placeholder for that page. Stored inside [`crate::output::PageResult`].

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pipeline.
#[derive(Debug, Error)]
pub enum Pdf2MdError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input document was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the document.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    // ── Rendering errors ──────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// pdfium-render returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Artifact errors ───────────────────────────────────────────────────
    /// Could not write a page or merged artifact.
    #[error("Failed to write artifact '{path}': {source}")]
    ArtifactWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not read an artifact that exists.
    #[error("Failed to read artifact '{path}': {source}")]
    ArtifactReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A page that was dispatched has no artifact on disk at reassembly time.
    #[error("Page {page} has no artifact in '{dir}'; refusing to merge an incomplete document")]
    PageArtifactMissing { page: usize, dir: PathBuf },

    /// A page's artifact write failed during the run, so whatever is on disk
    /// for it is stale or absent.
    #[error("Page {page} could not be persisted ({detail}); refusing to merge stale content")]
    PagePersistFailed { page: usize, detail: String },

    // ── Run errors ────────────────────────────────────────────────────────
    /// Regenerating a single page failed; previous artifacts are untouched.
    #[error("Regeneration of page {page} failed: {source}")]
    RegenerationFailed {
        page: usize,
        #[source]
        source: PageError,
    },

    /// The whole-document deadline expired before every page finished.
    #[error("Document processing exceeded its {secs}s deadline")]
    DocumentTimeout { secs: u64 },

    /// No task with this id is known to the registry.
    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single page.
///
/// The pipeline substitutes a placeholder for the page and keeps going.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// The page image could not be read. Never retried.
    #[error("Page {page}: image unreadable: {detail}")]
    ImageUnreadable { page: usize, detail: String },

    /// Model call failed on every attempt; carries the final attempt's error.
    #[error("Page {page}: LLM call failed after {attempts} attempts: {detail}")]
    LlmFailed {
        page: usize,
        attempts: u32,
        detail: String,
    },

    /// The page artifact could not be persisted.
    #[error("Page {page}: failed to persist artifact: {detail}")]
    PersistFailed { page: usize, detail: String },
}

impl PageError {
    /// 1-indexed page the error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::ImageUnreadable { page, .. }
            | PageError::LlmFailed { page, .. }
            | PageError::PersistFailed { page, .. } => *page,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_artifact_display() {
        let e = Pdf2MdError::PageArtifactMissing {
            page: 4,
            dir: PathBuf::from("/tmp/task"),
        };
        let msg = e.to_string();
        assert!(msg.contains("Page 4"), "got: {msg}");
        assert!(msg.contains("/tmp/task"), "got: {msg}");
    }

    #[test]
    fn regeneration_failure_carries_page_error() {
        let e = Pdf2MdError::RegenerationFailed {
            page: 2,
            source: PageError::LlmFailed {
                page: 2,
                attempts: 3,
                detail: "503".into(),
            },
        };
        assert!(e.to_string().contains("page 2"));
        let source = std::error::Error::source(&e).map(|s| s.to_string());
        assert_eq!(
            source.as_deref(),
            Some("Page 2: LLM call failed after 3 attempts: 503")
        );
    }

    #[test]
    fn page_error_reports_its_page() {
        let e = PageError::ImageUnreadable {
            page: 7,
            detail: "no such file".into(),
        };
        assert_eq!(e.page(), 7);
    }

    #[test]
    fn timeout_display() {
        let e = Pdf2MdError::DocumentTimeout { secs: 600 };
        assert!(e.to_string().contains("600s"));
    }
}
