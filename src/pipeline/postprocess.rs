//! Post-processing: light, deterministic cleanup of model output.
//!
//! Models sometimes wrap the whole answer in a ```` ```markdown ```` fence
//! despite being told not to, and some providers return CRLF line endings.
//! Both are fixed here so page artifacts stay uniform; content is otherwise
//! left untouched.

use once_cell::sync::Lazy;
use regex::Regex;

static OUTER_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\A\s*```(?:markdown|md)?[ \t]*\n(.*?)\n?```\s*\z")
        .expect("valid fence regex")
});

/// Clean raw model output into page content.
///
/// 1. Normalise line endings (CRLF → LF)
/// 2. Strip an outer code fence wrapping the entire output
/// 3. Trim surrounding whitespace
pub fn clean_output(raw: &str) -> String {
    let s = raw.replace("\r\n", "\n");
    let s = strip_outer_fence(&s);
    s.trim().to_string()
}

fn strip_outer_fence(input: &str) -> String {
    match OUTER_FENCE.captures(input) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}
