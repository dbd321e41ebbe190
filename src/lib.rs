//! # pdf2md-pipeline
//!
//! Convert multi-page documents to Markdown with Vision Language Models,
//! one page image at a time.
//!
//! ## Why this crate?
//!
//! Text-extraction tools garble multi-column layouts, formulae and tables.
//! This crate renders each page to an image, lets a VLM transcribe it, and
//! reassembles the pages into one ordered document. Pages are converted
//! concurrently, persisted as they finish (so a partial preview is always
//! on disk), reported to live subscribers, and can be regenerated one at a
//! time afterwards.
//!
//! ## Pipeline Overview
//!
//! ```text
//! document
//!  │
//!  ├─ 1. Render    lazy page images (pdfium, one thread, never throttled)
//!  ├─ 2. Convert   ≤ N pages in flight, retries with linear backoff
//!  ├─ 3. Persist   page_0001.md … written atomically as each page finishes
//!  ├─ 4. Progress  events to every subscriber of the task
//!  └─ 5. Merge     page artifacts re-read from disk in page order → <name>.md
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdf2md_pipeline::{ConversionConfig, NoopProgressCallback, Pipeline};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / ...
//!     let config = ConversionConfig::default();
//!     let pipeline = Pipeline::from_config(config)?;
//!     let output = pipeline
//!         .run("task-1", "docs/report.pdf".as_ref(), 4, Arc::new(NoopProgressCallback))
//!         .await?;
//!     println!("{}", output.markdown);
//!     eprintln!("tokens: {} in / {} out",
//!         output.stats.total_input_tokens,
//!         output.stats.total_output_tokens);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2md` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pdf2md-pipeline = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod broadcast;
pub mod config;
pub mod convert;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod regenerate;
pub mod store;
pub mod tasks;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use broadcast::{Frame, HubStats, ProgressHub, Subscription};
pub use config::{ConversionConfig, ConversionConfigBuilder};
pub use convert::{error_placeholder, Pipeline};
pub use error::{PageError, Pdf2MdError};
pub use output::{ConversionOutput, ConversionStats, PageImage, PageResult, TokenUsage};
pub use pipeline::llm::{
    Completion, CompletionClient, CompletionRequest, LlmPageModel, ModelError, PageModel,
};
pub use pipeline::render::{PageRenderer, PageSource, PdfiumRenderer};
pub use progress::{
    ConversionProgressCallback, NoopProgressCallback, ProgressCallback, ProgressEvent,
    ProgressStatus,
};
pub use regenerate::{regenerate_page, RegenerationOutcome};
pub use store::PageStore;
pub use tasks::{Scheduler, TaskRecord, TaskRegistry, TaskStatus};
