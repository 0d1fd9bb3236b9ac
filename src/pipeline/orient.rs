//! Orientation detection with tesseract OSD.
//!
//! Each page is rasterised and handed to `tesseract --psm 0` (orientation
//! and script detection only). Low-resolution renders of sparse or small
//! text often come back with a confidence too low to trust, so a weak
//! answer is retried at a higher DPI before giving up.
//!
//! ## Escalation
//!
//! ```text
//! trial 1: 200 DPI ─▶ conf ≥ 2.0? ─yes─▶ Detected(rotate)
//!                        │ no
//! trial 2: 300 DPI ─▶ ...
//! trial 3: 400 DPI ─▶ ... ─no─▶ Unknown
//! ```
//!
//! A tesseract run that exits non-zero on a page (blank page, too little
//! text) counts as a low-confidence trial. A tesseract binary that cannot be
//! started at all is [`JobError::EngineUnavailable`].

use crate::engine::{Orientation, OrientationDetector, PageUnit, Rotation};
use crate::error::JobError;
use crate::pipeline::split::PdfiumEngine;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_INITIAL_DPI: u32 = 200;
pub const DEFAULT_DPI_STEP: u32 = 100;
pub const DEFAULT_MAX_TRIALS: u32 = 3;
pub const DEFAULT_MIN_CONFIDENCE: f32 = 2.0;

static ROTATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*Rotate:\s*(-?\d+)").unwrap());
static CONFIDENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*Orientation confidence:\s*([0-9]*\.?[0-9]+)").unwrap());

/// One OSD answer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OsdReading {
    /// Clockwise degrees the page must be turned to read upright.
    pub rotate: i32,
    pub confidence: f32,
}

/// Parse tesseract's `--psm 0` report. `None` if either field is missing.
pub fn parse_osd(output: &str) -> Option<OsdReading> {
    let rotate = ROTATE_RE
        .captures(output)?
        .get(1)?
        .as_str()
        .parse::<i32>()
        .ok()?;
    let confidence = CONFIDENCE_RE
        .captures(output)?
        .get(1)?
        .as_str()
        .parse::<f32>()
        .ok()?;
    Some(OsdReading { rotate, confidence })
}

/// DPI schedule and acceptance threshold for OSD trials.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Escalation {
    pub initial_dpi: u32,
    pub dpi_step: u32,
    pub max_trials: u32,
    pub min_confidence: f32,
}

impl Default for Escalation {
    fn default() -> Self {
        Self {
            initial_dpi: DEFAULT_INITIAL_DPI,
            dpi_step: DEFAULT_DPI_STEP,
            max_trials: DEFAULT_MAX_TRIALS,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

impl Escalation {
    /// Run `trial` at increasing DPI until one reading is confident enough.
    ///
    /// `trial` returns `Ok(None)` when the engine ran but produced no usable
    /// reading; errors abort the escalation.
    pub fn run<F>(&self, page_num: usize, mut trial: F) -> Result<Orientation, JobError>
    where
        F: FnMut(u32) -> Result<Option<OsdReading>, JobError>,
    {
        let mut dpi = self.initial_dpi;
        for n in 1..=self.max_trials.max(1) {
            let reading = trial(dpi)?;
            debug!("Page {page_num}: trial {n} at {dpi} DPI → {reading:?}");

            if let Some(r) = reading.filter(|r| r.confidence >= self.min_confidence) {
                match Rotation::from_degrees(r.rotate) {
                    Some(rotation) => {
                        if n > 1 {
                            info!(
                                "Page {page_num}: orientation {}° stabilised at trial {n} ({dpi} DPI, confidence {:.2})",
                                r.rotate, r.confidence
                            );
                        }
                        return Ok(Orientation::Detected(rotation));
                    }
                    None => warn!("Page {page_num}: ignoring non-right-angle rotation {}", r.rotate),
                }
            } else if n < self.max_trials {
                warn!("Page {page_num}: low orientation confidence at {dpi} DPI; retrying higher");
            }
            dpi += self.dpi_step;
        }

        warn!(
            "Page {page_num}: no confident orientation after {} trials",
            self.max_trials
        );
        Ok(Orientation::Unknown)
    }
}

/// Default [`OrientationDetector`]: pdfium rasterisation + tesseract OSD.
#[derive(Debug, Clone)]
pub struct TesseractDetector {
    engine: Arc<PdfiumEngine>,
    cmd: PathBuf,
    escalation: Escalation,
}

impl TesseractDetector {
    pub fn new(engine: Arc<PdfiumEngine>, cmd: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            cmd: cmd.into(),
            escalation: Escalation::default(),
        }
    }

    pub fn with_escalation(mut self, escalation: Escalation) -> Self {
        self.escalation = escalation;
        self
    }

    /// Rasterise `page` at `dpi` and run one OSD pass over it.
    fn trial(&self, page: &PageUnit, dpi: u32) -> Result<Option<OsdReading>, JobError> {
        let image = self.engine.rasterize(page, dpi)?;

        let png = tempfile::Builder::new()
            .prefix("pdfsplit-osd-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| JobError::Internal(format!("temp file for OSD: {e}")))?;
        image
            .save_with_format(png.path(), image::ImageFormat::Png)
            .map_err(|e| JobError::Internal(format!("encode page image: {e}")))?;

        let output = Command::new(&self.cmd)
            .arg(png.path())
            .arg("stdout")
            .args(["--psm", "0"])
            .output()
            .map_err(|e| JobError::EngineUnavailable {
                engine: "tesseract".to_string(),
                detail: format!("{}: {}", self.cmd.display(), e),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            warn!(
                "tesseract OSD failed on page {} ({}): {}",
                page.page_num(),
                output.status,
                stderr.trim()
            );
            return Ok(None);
        }
        // Some tesseract builds print the OSD report on stderr.
        Ok(parse_osd(&stdout).or_else(|| parse_osd(&stderr)))
    }
}

impl OrientationDetector for TesseractDetector {
    fn detect(&self, page: &PageUnit) -> Result<Orientation, JobError> {
        self.escalation
            .run(page.page_num(), |dpi| self.trial(page, dpi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OSD_SAMPLE: &str = "Page number: 0\n\
        Orientation in degrees: 180\n\
        Rotate: 180\n\
        Orientation confidence: 11.43\n\
        Script: Latin\n\
        Script confidence: 2.22\n";

    fn reading(rotate: i32, confidence: f32) -> Option<OsdReading> {
        Some(OsdReading { rotate, confidence })
    }

    #[test]
    fn parses_osd_report() {
        assert_eq!(parse_osd(OSD_SAMPLE), reading(180, 11.43));
    }

    #[test]
    fn incomplete_report_is_none() {
        assert_eq!(parse_osd("Rotate: 90\n"), None);
        assert_eq!(parse_osd("Too few characters. Skipping this page\n"), None);
    }

    #[test]
    fn confident_first_trial_wins() {
        let mut dpis = Vec::new();
        let got = Escalation::default()
            .run(1, |dpi| {
                dpis.push(dpi);
                Ok(reading(90, 5.0))
            })
            .unwrap();
        assert_eq!(got, Orientation::Detected(Rotation::Deg90));
        assert_eq!(dpis, vec![200]);
    }

    #[test]
    fn low_confidence_escalates_dpi() {
        let mut dpis = Vec::new();
        let got = Escalation::default()
            .run(1, |dpi| {
                dpis.push(dpi);
                Ok(if dpi < 400 {
                    reading(270, 0.8)
                } else {
                    reading(270, 3.1)
                })
            })
            .unwrap();
        assert_eq!(got, Orientation::Detected(Rotation::Deg270));
        assert_eq!(dpis, vec![200, 300, 400]);
    }

    #[test]
    fn never_confident_is_unknown() {
        let mut calls = 0;
        let got = Escalation::default()
            .run(1, |_| {
                calls += 1;
                Ok(None)
            })
            .unwrap();
        assert_eq!(got, Orientation::Unknown);
        assert_eq!(calls, 3);
    }

    #[test]
    fn engine_error_aborts() {
        let err = Escalation::default()
            .run(1, |_| {
                Err(JobError::EngineUnavailable {
                    engine: "tesseract".into(),
                    detail: "not found".into(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, JobError::EngineUnavailable { .. }));
    }
}
