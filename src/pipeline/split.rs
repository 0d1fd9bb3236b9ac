//! pdfium-backed splitting, rotation and rasterisation.
//!
//! ## Why bind per call?
//!
//! pdfium keeps process-global state behind the `thread_safe` feature's lock,
//! and a [`Pdfium`] handle is cheap to create once the shared library is
//! loaded. Binding inside each blocking call keeps [`PdfiumEngine`] a plain
//! `Send + Sync` value and turns a missing library into a per-job
//! [`JobError::EngineUnavailable`] that the retry policy can wait out, rather
//! than a startup crash.
//!
//! ## Why `/Rotate` instead of re-rendering?
//!
//! Setting the page's rotation entry is lossless: text stays selectable and
//! vector content stays sharp. Re-rasterising a rotated page would turn every
//! output into a bitmap.
//!
//! Every method here is blocking; the worker calls them from
//! `tokio::task::spawn_blocking`.

use crate::engine::{PageUnit, Rotation, Rotator, Splitter};
use crate::error::JobError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Longest edge of a rasterised page, whatever the DPI asks for.
const MAX_RENDER_PIXELS: i32 = 6000;

/// Default [`Splitter`] and [`Rotator`], plus the page rasteriser used by
/// the tesseract orientation detector.
#[derive(Debug, Clone, Default)]
pub struct PdfiumEngine {
    lib_path: Option<PathBuf>,
}

impl PdfiumEngine {
    /// `lib_path` is the directory holding the pdfium shared library; `None`
    /// uses the system library search path.
    pub fn new(lib_path: Option<PathBuf>) -> Self {
        Self { lib_path }
    }

    fn bind(&self) -> Result<Pdfium, JobError> {
        let bindings = match &self.lib_path {
            Some(dir) => {
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir))
            }
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| JobError::EngineUnavailable {
            engine: "pdfium".to_string(),
            detail: format!("{:?}", e),
        })?;
        Ok(Pdfium::new(bindings))
    }

    /// Render a single-page PDF to an image at roughly `dpi`.
    pub fn rasterize(&self, page: &PageUnit, dpi: u32) -> Result<DynamicImage, JobError> {
        let pdfium = self.bind()?;
        let document = load_page(&pdfium, page)?;
        let pdf_page = document
            .pages()
            .get(0)
            .map_err(|e| page_error(page, "get page", e))?;

        // PDF user space is 72 points per inch.
        let width_px = (pdf_page.width().value * dpi as f32 / 72.0).round() as i32;
        let render_config = PdfRenderConfig::new()
            .set_target_width(width_px.clamp(1, MAX_RENDER_PIXELS))
            .set_maximum_height(MAX_RENDER_PIXELS);

        let image = pdf_page
            .render_with_config(&render_config)
            .map_err(|e| page_error(page, "render", e))?
            .as_image();
        debug!(
            "Rendered page {} at {} DPI → {}x{} px",
            page.page_num(),
            dpi,
            image.width(),
            image.height()
        );
        Ok(image)
    }
}

impl Splitter for PdfiumEngine {
    fn split(&self, source: &Path) -> Result<Vec<PageUnit>, JobError> {
        let pdfium = self.bind()?;
        let document =
            pdfium
                .load_pdf_from_file(source, None)
                .map_err(|e| JobError::CorruptInput {
                    path: source.to_path_buf(),
                    detail: format!("{:?}", e),
                })?;

        let total = document.pages().len();
        info!("PDF loaded: {} pages ({})", total, source.display());

        let mut units = Vec::with_capacity(usize::from(total));
        for idx in 0..total {
            let corrupt = |stage: &str, e: PdfiumError| JobError::CorruptInput {
                path: source.to_path_buf(),
                detail: format!("page {}: {} failed: {:?}", usize::from(idx) + 1, stage, e),
            };
            let mut single = pdfium
                .create_new_pdf()
                .map_err(|e| corrupt("create document", e))?;
            single
                .pages_mut()
                .copy_page_from_document(&document, idx, 0)
                .map_err(|e| corrupt("copy page", e))?;
            let bytes = single
                .save_to_bytes()
                .map_err(|e| corrupt("save page", e))?;
            units.push(PageUnit::new(usize::from(idx), bytes));
        }

        Ok(units)
    }
}

impl Rotator for PdfiumEngine {
    fn rotate(&self, page: &PageUnit, rotation: Rotation) -> Result<Vec<u8>, JobError> {
        if rotation == Rotation::Deg0 {
            return Ok(page.pdf.clone());
        }

        let pdfium = self.bind()?;
        let document = load_page(&pdfium, page)?;
        {
            let mut pdf_page = document
                .pages()
                .get(0)
                .map_err(|e| page_error(page, "get page", e))?;

            let current = pdf_page
                .rotation()
                .map(from_pdfium)
                .unwrap_or(Rotation::Deg0);
            let target = current.then(rotation);
            pdf_page.set_rotation(to_pdfium(target));
            debug!(
                "Page {}: /Rotate {} → {}",
                page.page_num(),
                current.degrees(),
                target.degrees()
            );
        }

        document
            .save_to_bytes()
            .map_err(|e| page_error(page, "save", e))
    }
}

fn load_page<'a>(pdfium: &'a Pdfium, page: &'a PageUnit) -> Result<PdfDocument<'a>, JobError> {
    pdfium
        .load_pdf_from_byte_slice(&page.pdf, None)
        .map_err(|e| page_error(page, "load", e))
}

fn page_error(page: &PageUnit, stage: &str, e: PdfiumError) -> JobError {
    JobError::CorruptInput {
        path: PathBuf::from(format!("<page {}>", page.page_num())),
        detail: format!("{} failed: {:?}", stage, e),
    }
}

fn from_pdfium(r: PdfPageRenderRotation) -> Rotation {
    match r {
        PdfPageRenderRotation::None => Rotation::Deg0,
        PdfPageRenderRotation::Degrees90 => Rotation::Deg90,
        PdfPageRenderRotation::Degrees180 => Rotation::Deg180,
        PdfPageRenderRotation::Degrees270 => Rotation::Deg270,
    }
}

fn to_pdfium(r: Rotation) -> PdfPageRenderRotation {
    match r {
        Rotation::Deg0 => PdfPageRenderRotation::None,
        Rotation::Deg90 => PdfPageRenderRotation::Degrees90,
        Rotation::Deg180 => PdfPageRenderRotation::Degrees180,
        Rotation::Deg270 => PdfPageRenderRotation::Degrees270,
    }
}
