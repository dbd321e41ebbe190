//! Image encoding: page image file → base64 `ImageData`.
//!
//! VLM APIs accept images as base64 data embedded in the JSON request body.
//! The bytes are forwarded as rendered; only the MIME type is inferred from
//! the file extension. A missing or empty file is a precondition failure for
//! the page, reported as [`PageError::ImageUnreadable`] and never retried.

use crate::error::PageError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use std::path::Path;
use tracing::debug;

/// MIME type for an image path, by extension. Unknown extensions read as PNG.
pub fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/png",
    }
}

/// Read a page image and wrap it for the VLM request.
pub async fn encode_image_file(page_num: usize, path: &Path) -> Result<ImageData, PageError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| PageError::ImageUnreadable {
            page: page_num,
            detail: format!("{}: {}", path.display(), e),
        })?;

    if bytes.is_empty() {
        return Err(PageError::ImageUnreadable {
            page: page_num,
            detail: format!("{}: file is empty", path.display()),
        });
    }

    let b64 = STANDARD.encode(&bytes);
    debug!("Page {}: encoded image → {} bytes base64", page_num, b64.len());

    Ok(ImageData::new(b64, mime_for(path)).with_detail("high"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn mime_by_extension() {
        assert_eq!(mime_for(Path::new("a/page_0001.png")), "image/png");
        assert_eq!(mime_for(Path::new("a/page_0001.JPG")), "image/jpeg");
        assert_eq!(mime_for(Path::new("a/page_0001")), "image/png");
    }

    #[tokio::test]
    async fn encodes_existing_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("page_0001.jpg");
        std::fs::write(&path, b"\xff\xd8\xff fake jpeg").unwrap();

        let data = encode_image_file(1, &path).await.expect("encode should succeed");
        assert_eq!(data.mime_type, "image/jpeg");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(decoded, b"\xff\xd8\xff fake jpeg");
    }

    #[tokio::test]
    async fn missing_file_is_unreadable() {
        let err = encode_image_file(2, Path::new("/nope/page_0002.png"))
            .await
            .unwrap_err();
        assert_eq!(err.page(), 2);
        assert!(matches!(err, PageError::ImageUnreadable { .. }));
    }

    #[tokio::test]
    async fn empty_file_is_unreadable() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("page_0003.png");
        std::fs::write(&path, b"").unwrap();
        assert!(encode_image_file(3, &path).await.is_err());
    }
}
