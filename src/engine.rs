//! Collaborator seams: splitting, orientation detection and rotation.
//!
//! The service never touches PDF internals itself. It hands a source path to
//! a [`Splitter`], each resulting [`PageUnit`] to an [`OrientationDetector`],
//! and any page that needs correcting to a [`Rotator`]. The default
//! implementations live in [`crate::pipeline::split`] (pdfium) and
//! [`crate::pipeline::orient`] (tesseract); tests plug in fakes.
//!
//! All three traits are synchronous. pdfium and tesseract are blocking, so
//! the worker always calls them from `tokio::task::spawn_blocking`.

use crate::error::JobError;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// One page of a split document, as a standalone single-page PDF.
#[derive(Clone, PartialEq, Eq)]
pub struct PageUnit {
    /// 0-based position of the page in the source document.
    pub index: usize,
    /// Serialised single-page PDF.
    pub pdf: Vec<u8>,
}

impl PageUnit {
    pub fn new(index: usize, pdf: Vec<u8>) -> Self {
        Self { index, pdf }
    }

    /// 1-based page number, as used in output file names.
    pub fn page_num(&self) -> usize {
        self.index + 1
    }
}

impl fmt::Debug for PageUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageUnit")
            .field("index", &self.index)
            .field("pdf_bytes", &self.pdf.len())
            .finish()
    }
}

/// Clockwise correction needed to make a page upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rotation {
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Parse a degree value; anything other than a multiple of 90 is `None`.
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Rotation::Deg0),
            90 => Some(Rotation::Deg90),
            180 => Some(Rotation::Deg180),
            270 => Some(Rotation::Deg270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u16 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// Compose two clockwise rotations.
    pub fn then(self, other: Rotation) -> Rotation {
        // Both operands are multiples of 90, so the sum always parses.
        Rotation::from_degrees(i32::from(self.degrees()) + i32::from(other.degrees()))
            .unwrap_or(Rotation::Deg0)
    }
}

/// Result of orientation detection for one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// The page needs this clockwise correction (`Deg0` = already upright).
    Detected(Rotation),
    /// The engine ran but could not decide; the page is kept as-is.
    Unknown,
}

/// Split a source PDF into ordered single-page units.
pub trait Splitter: Send + Sync {
    /// # Errors
    /// [`JobError::CorruptInput`] if the source is not a valid PDF;
    /// [`JobError::EngineUnavailable`] if the PDF engine cannot be loaded.
    fn split(&self, source: &Path) -> Result<Vec<PageUnit>, JobError>;
}

/// Detect the text orientation of a page.
pub trait OrientationDetector: Send + Sync {
    /// # Errors
    /// [`JobError::EngineUnavailable`] if the OCR engine cannot run.
    fn detect(&self, page: &PageUnit) -> Result<Orientation, JobError>;
}

/// Rotate a single-page PDF clockwise by the given correction.
pub trait Rotator: Send + Sync {
    /// Returns the rotated page bytes. `Rotation::Deg0` returns the input unchanged.
    fn rotate(&self, page: &PageUnit, rotation: Rotation) -> Result<Vec<u8>, JobError>;
}

/// The three collaborators a worker needs, bundled for injection.
#[derive(Clone)]
pub struct Engines {
    pub splitter: Arc<dyn Splitter>,
    pub detector: Arc<dyn OrientationDetector>,
    pub rotator: Arc<dyn Rotator>,
}

impl Engines {
    pub fn new(
        splitter: Arc<dyn Splitter>,
        detector: Arc<dyn OrientationDetector>,
        rotator: Arc<dyn Rotator>,
    ) -> Self {
        Self {
            splitter,
            detector,
            rotator,
        }
    }
}

impl fmt::Debug for Engines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engines")
            .field("splitter", &"<dyn Splitter>")
            .field("detector", &"<dyn OrientationDetector>")
            .field("rotator", &"<dyn Rotator>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_from_degrees() {
        assert_eq!(Rotation::from_degrees(0), Some(Rotation::Deg0));
        assert_eq!(Rotation::from_degrees(180), Some(Rotation::Deg180));
        assert_eq!(Rotation::from_degrees(-90), Some(Rotation::Deg270));
        assert_eq!(Rotation::from_degrees(450), Some(Rotation::Deg90));
        assert_eq!(Rotation::from_degrees(45), None);
    }

    #[test]
    fn rotation_composes_modulo_360() {
        assert_eq!(Rotation::Deg90.then(Rotation::Deg270), Rotation::Deg0);
        assert_eq!(Rotation::Deg180.then(Rotation::Deg180), Rotation::Deg0);
        assert_eq!(Rotation::Deg270.then(Rotation::Deg180), Rotation::Deg90);
    }

    #[test]
    fn page_num_is_one_based() {
        let p = PageUnit::new(2, vec![1, 2, 3]);
        assert_eq!(p.page_num(), 3);
        assert!(format!("{p:?}").contains("pdf_bytes: 3"));
    }
}
