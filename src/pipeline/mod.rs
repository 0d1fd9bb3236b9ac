//! Pipeline stages for watching, splitting and orienting PDFs.
//!
//! Each submodule implements exactly one step. The service wires them
//! together; workers only see the [`crate::engine`] traits, so the pdfium
//! and tesseract implementations here can be swapped for fakes in tests.
//!
//! ## Data Flow
//!
//! ```text
//! watcher ──▶ debounce ──▶ (identity, queue) ──▶ input ──▶ split ──▶ orient ──▶ split (rotate) ──▶ output
//! (notify)   (quiet window)                      (%PDF)   (pdfium)  (tesseract)  (/Rotate)
//! ```
//!
//! 1. [`watcher`]  — filesystem notifications plus the startup scan
//! 2. [`debounce`] — collapse event bursts per path into one "settled" signal
//! 3. [`input`]    — readiness and magic-byte check on the source file
//! 4. [`split`]    — pdfium: one single-page PDF per page, lossless rotation,
//!    rasterisation for OSD
//! 5. [`orient`]   — tesseract OSD with DPI escalation

pub mod debounce;
pub mod input;
pub mod orient;
pub mod split;
pub mod watcher;
