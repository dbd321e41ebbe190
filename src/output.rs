//! Value types flowing through the pipeline.

use crate::error::PageError;
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};
use std::path::PathBuf;

/// One rendered page, handed from the renderer to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    /// 0-based position in the document.
    pub index: usize,
    /// Where the rendered image lives.
    pub path: PathBuf,
}

impl PageImage {
    pub fn new(index: usize, path: impl Into<PathBuf>) -> Self {
        Self {
            index,
            path: path.into(),
        }
    }

    /// 1-based page number used for artifacts and log lines.
    pub fn page_num(&self) -> usize {
        self.index + 1
    }
}

/// Input / output token counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: TokenUsage) {
        *self = *self + rhs;
    }
}

/// Outcome of converting one page.
///
/// Exactly one per dispatched page. A failed page still has a result: its
/// `markdown` holds the placeholder and `error` says why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    /// 1-indexed page number.
    pub page_num: usize,
    pub markdown: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
    /// Retries beyond the first attempt.
    pub retries: u32,
    pub error: Option<PageError>,
}

impl PageResult {
    pub fn usage(&self) -> TokenUsage {
        TokenUsage::new(self.input_tokens, self.output_tokens)
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Summary numbers for a finished run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionStats {
    /// Pages the renderer produced.
    pub total_pages: usize,
    pub processed_pages: usize,
    pub failed_pages: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_duration_ms: u64,
}

impl ConversionStats {
    pub fn usage(&self) -> TokenUsage {
        TokenUsage::new(self.total_input_tokens, self.total_output_tokens)
    }
}

/// Everything a successful run hands back to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionOutput {
    /// Merged document, as persisted.
    pub markdown: String,
    /// Where the merged document was written.
    pub merged_path: PathBuf,
    /// Per-page results sorted by page number.
    pub pages: Vec<PageResult>,
    pub stats: ConversionStats,
}
