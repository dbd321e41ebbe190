//! Per-page processing stages.
//!
//! ```text
//! render ──► encode ──► llm ──► postprocess
//! (lazy)     (base64)   (retry)  (cleanup)
//! ```
//!
//! [`render`] produces page images one at a time; the controller in
//! [`crate::convert`] fans each page out to the [`llm::CompletionClient`],
//! which encodes the image, calls the model and cleans the result.

pub mod encode;
pub mod llm;
pub mod postprocess;
pub mod render;
