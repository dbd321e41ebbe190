//! Page-image production: a lazy, strictly sequential page generator.
//!
//! The controller only ever sees [`PageRenderer`] and [`PageSource`]:
//! `open` validates the document and returns a source, `next_page` yields
//! one [`PageImage`] at a time until the document is exhausted. Sources are
//! driven from a single blocking thread, so implementations never need to be
//! thread-safe internally.
//!
//! ## Why a dedicated thread for pdfium?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state and borrows the library handle for the document's
//! lifetime. [`PdfiumRenderer`] therefore keeps the library, the document
//! and the render loop on one owned thread and hands pages over a
//! rendezvous channel: page N+1 is rendered only after page N was taken.

use crate::config::ConversionConfig;
use crate::error::Pdf2MdError;
use crate::output::PageImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use tracing::{debug, info};

/// A lazy page generator for one document.
pub trait PageSource: Send {
    /// Next page in index order, `None` once the document is exhausted.
    ///
    /// An `Err` ends production; pages already yielded remain valid.
    fn next_page(&mut self) -> Option<Result<PageImage, Pdf2MdError>>;
}

/// Opens documents for rendering.
pub trait PageRenderer: Send + Sync {
    /// Open `document`, writing page images into `out_dir`.
    ///
    /// Blocking. Failing here is fatal to the run: nothing is dispatched.
    fn open(&self, document: &Path, out_dir: &Path) -> Result<Box<dyn PageSource>, Pdf2MdError>;
}

/// File name of the rendered image for a 1-indexed page: `page_0007.png`.
pub fn page_image_name(page_num: usize) -> String {
    format!("page_{:04}.png", page_num)
}

/// Check the document exists and is readable before handing it to a renderer.
pub fn check_document(document: &Path) -> Result<(), Pdf2MdError> {
    match std::fs::File::open(document) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(Pdf2MdError::PermissionDenied {
                path: document.to_path_buf(),
            })
        }
        Err(_) => Err(Pdf2MdError::FileNotFound {
            path: document.to_path_buf(),
        }),
    }
}

// ── pdfium implementation ────────────────────────────────────────────────

/// Renders PDF pages to PNG files with pdfium.
#[derive(Debug, Clone)]
pub struct PdfiumRenderer {
    dpi: u32,
    max_pixels: u32,
    password: Option<String>,
}

impl PdfiumRenderer {
    pub fn new(dpi: u32, max_pixels: u32) -> Self {
        Self {
            dpi,
            max_pixels,
            password: None,
        }
    }

    pub fn from_config(config: &ConversionConfig) -> Self {
        Self {
            dpi: config.dpi,
            max_pixels: config.max_rendered_pixels,
            password: config.password.clone(),
        }
    }
}

impl PageRenderer for PdfiumRenderer {
    fn open(&self, document: &Path, out_dir: &Path) -> Result<Box<dyn PageSource>, Pdf2MdError> {
        check_document(document)?;

        let (init_tx, init_rx) = sync_channel::<Result<usize, Pdf2MdError>>(1);
        let (page_tx, page_rx) = sync_channel::<Result<PageImage, Pdf2MdError>>(0);
        let job = RenderJob {
            document: document.to_path_buf(),
            out_dir: out_dir.to_path_buf(),
            dpi: self.dpi,
            max_pixels: self.max_pixels,
            password: self.password.clone(),
        };

        std::thread::Builder::new()
            .name("pdf2md-render".into())
            .spawn(move || job.run(init_tx, page_tx))
            .map_err(|e| Pdf2MdError::Internal(format!("Failed to spawn render thread: {}", e)))?;

        let page_count = init_rx.recv().map_err(|_| {
            Pdf2MdError::Internal("Render thread exited before opening the document".into())
        })??;
        info!("PDF loaded: {} pages", page_count);

        Ok(Box::new(PdfiumPageSource { pages: page_rx }))
    }
}

struct PdfiumPageSource {
    pages: Receiver<Result<PageImage, Pdf2MdError>>,
}

impl PageSource for PdfiumPageSource {
    fn next_page(&mut self) -> Option<Result<PageImage, Pdf2MdError>> {
        // A closed channel means the render thread finished.
        self.pages.recv().ok()
    }
}

struct RenderJob {
    document: PathBuf,
    out_dir: PathBuf,
    dpi: u32,
    max_pixels: u32,
    password: Option<String>,
}

impl RenderJob {
    fn run(
        self,
        init: SyncSender<Result<usize, Pdf2MdError>>,
        pages_tx: SyncSender<Result<PageImage, Pdf2MdError>>,
    ) {
        let pdfium = match bind_pdfium() {
            Ok(p) => p,
            Err(e) => {
                let _ = init.send(Err(e));
                return;
            }
        };

        let document = match pdfium.load_pdf_from_file(&self.document, self.password.as_deref()) {
            Ok(doc) => doc,
            Err(e) => {
                let _ = init.send(Err(self.classify_load_error(e)));
                return;
            }
        };

        let pages = document.pages();
        let total = pages.len() as usize;
        if init.send(Ok(total)).is_err() {
            return;
        }

        for idx in 0..total {
            let item = self.render_one(&pages, idx);
            let failed = item.is_err();
            // The consumer hung up: stop rendering.
            if pages_tx.send(item).is_err() || failed {
                return;
            }
        }
    }

    fn render_one(&self, pages: &PdfPages, idx: usize) -> Result<PageImage, Pdf2MdError> {
        let page_num = idx + 1;
        let raster_err = |detail: String| Pdf2MdError::RasterisationFailed {
            page: page_num,
            detail,
        };

        let page = pages
            .get(idx as u16)
            .map_err(|e| raster_err(format!("{:?}", e)))?;

        let width_px = (page.width().to_inches() * self.dpi as f32).round() as i32;
        let target = width_px.clamp(1, self.max_pixels as i32);
        let render_config = PdfRenderConfig::new()
            .set_target_width(target)
            .set_maximum_height(self.max_pixels as i32);

        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| raster_err(format!("{:?}", e)))?;
        let image = bitmap.as_image();

        let path = self.out_dir.join(page_image_name(page_num));
        image
            .save(&path)
            .map_err(|e| raster_err(format!("Failed to save {}: {}", path.display(), e)))?;

        debug!(
            "Rendered page {} → {}x{} px",
            page_num,
            image.width(),
            image.height()
        );
        Ok(PageImage::new(idx, path))
    }

    fn classify_load_error(&self, e: PdfiumError) -> Pdf2MdError {
        let detail = format!("{:?}", e);
        let path = self.document.clone();
        if detail.to_lowercase().contains("password") {
            if self.password.is_some() {
                Pdf2MdError::WrongPassword { path }
            } else {
                Pdf2MdError::PasswordRequired { path }
            }
        } else {
            Pdf2MdError::CorruptPdf { path, detail }
        }
    }
}

/// Bind pdfium: `PDFIUM_LIB_PATH` first, then the working directory, then
/// the system library.
fn bind_pdfium() -> Result<Pdfium, Pdf2MdError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(path) if !path.is_empty() => Pdfium::bind_to_library(&path),
        _ => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| Pdf2MdError::PdfiumBindingFailed(format!("{:?}", e)))?;
    Ok(Pdfium::new(bindings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn image_names_are_fixed_width() {
        assert_eq!(page_image_name(1), "page_0001.png");
        assert_eq!(page_image_name(123), "page_0123.png");
    }

    #[test]
    fn missing_document_is_not_found() {
        let err = check_document(Path::new("/definitely/not/here.pdf")).unwrap_err();
        assert!(matches!(err, Pdf2MdError::FileNotFound { .. }));
    }

    #[test]
    fn pdfium_open_rejects_missing_document() {
        let tmp = TempDir::new().unwrap();
        let renderer = PdfiumRenderer::new(150, 2000);
        let result = renderer.open(&tmp.path().join("absent.pdf"), tmp.path());
        assert!(matches!(result, Err(Pdf2MdError::FileNotFound { .. })));
    }
}
