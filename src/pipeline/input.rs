//! Input readiness: confirm a source PDF can be opened before splitting.
//!
//! A debounced path is usually complete, but a slow network copy or a
//! scanner that holds the file open can still leave it locked or
//! half-written. We open it, check the `%PDF` magic bytes, and report
//! problems as [`JobError`]s the retry policy understands: a locked or
//! unreadable file is transient, a vanished one is missing, and wrong magic
//! bytes mean the input is corrupt and will not get better.

use crate::error::JobError;
use std::io::Read;
use std::path::Path;
use tracing::debug;

const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// Check that `path` is a readable, non-empty file starting with `%PDF`.
pub fn check_ready(path: &Path) -> Result<(), JobError> {
    let mut file = std::fs::File::open(path).map_err(|e| JobError::from_source_io(path, &e))?;

    let meta = file
        .metadata()
        .map_err(|e| JobError::from_source_io(path, &e))?;
    if !meta.is_file() {
        return Err(JobError::SourceMissing {
            path: path.to_path_buf(),
        });
    }
    if meta.len() == 0 {
        // Zero bytes usually means the writer has created the file but not
        // filled it yet.
        return Err(JobError::TransientIo {
            path: path.to_path_buf(),
            detail: "file is empty".to_string(),
        });
    }

    let mut magic = [0u8; 4];
    let mut filled = 0;
    while filled < magic.len() {
        match file.read(&mut magic[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(JobError::from_source_io(path, &e)),
        }
    }

    if filled < magic.len() || &magic != PDF_MAGIC {
        return Err(JobError::CorruptInput {
            path: path.to_path_buf(),
            detail: format!("not a PDF (magic bytes: {:?})", &magic[..filled]),
        });
    }

    debug!("Source ready: {}", path.display());
    Ok(())
}

/// Async wrapper around [`check_ready`].
pub async fn wait_ready(path: &Path) -> Result<(), JobError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || check_ready(&owned))
        .await
        .map_err(|e| JobError::Internal(format!("Readiness task panicked: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn accepts_pdf_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ok.pdf");
        std::fs::write(&path, b"%PDF-1.7\n...").unwrap();
        assert!(check_ready(&path).is_ok());
    }

    #[test]
    fn wrong_magic_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fake.pdf");
        std::fs::write(&path, b"PK\x03\x04zip").unwrap();
        assert!(matches!(
            check_ready(&path),
            Err(JobError::CorruptInput { .. })
        ));
    }

    #[test]
    fn truncated_header_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.pdf");
        std::fs::write(&path, b"%P").unwrap();
        assert!(matches!(
            check_ready(&path),
            Err(JobError::CorruptInput { .. })
        ));
    }

    #[test]
    fn empty_file_is_transient() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.pdf");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(
            check_ready(&path),
            Err(JobError::TransientIo { .. })
        ));
    }

    #[test]
    fn missing_file_is_source_missing() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            check_ready(&dir.path().join("gone.pdf")),
            Err(JobError::SourceMissing { .. })
        ));
    }

    #[tokio::test]
    async fn async_wrapper_matches_blocking() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ok.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();
        assert!(wait_ready(&path).await.is_ok());
    }
}
