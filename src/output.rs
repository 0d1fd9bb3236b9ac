//! Output writer: commit per-page files under a mirrored, sanitised path.
//!
//! A source at `<watch>/Invoices/2026/Scan 01.pdf` lands in
//!
//! ```text
//! <output>/invoices/2026/scan_01/page_1.pdf
//! <output>/invoices/2026/scan_01/page_2.pdf
//! ```
//!
//! Every page is written to a temporary file in the destination directory
//! and renamed into place, so a reader never sees a half-written page.
//!
//! ## Collisions
//!
//! Each destination directory carries a `.pdfsplit-manifest` listing which
//! source produced which page file. A page file recorded for the same source
//! is ours and is replaced. Anything else at that name is foreign:
//! [`CollisionPolicy::Suffix`] moves on to `page_N_2.pdf`, `page_N_3.pdf`, …
//! (the first free or self-produced name); [`CollisionPolicy::Skip`] leaves
//! the foreign file untouched and omits the page. The manifest is updated
//! before the pages are written so a crash in between never turns our own
//! file into a foreign one.

use crate::config::CollisionPolicy;
use crate::error::JobError;
use crate::identity::relative_to;
use crate::queue::PdfJob;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// File name of the per-directory ownership manifest.
pub const MANIFEST_NAME: &str = ".pdfsplit-manifest";

/// Highest suffix tried before a collision is reported as a write error.
const MAX_SUFFIX: usize = 999;

/// A page ready to be committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPage {
    /// 1-based page number.
    pub page_num: usize,
    pub pdf: Vec<u8>,
}

/// Commits pages under the output root.
///
/// Commits into the same destination directory are serialised, so two
/// sources that sanitise to the same name never pick the same page file.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    watch_root: PathBuf,
    output_root: PathBuf,
    policy: CollisionPolicy,
    dir_locks: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>>,
}

impl OutputWriter {
    pub fn new(
        watch_root: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
        policy: CollisionPolicy,
    ) -> Self {
        Self {
            watch_root: watch_root.into(),
            output_root: output_root.into(),
            policy,
            dir_locks: Arc::default(),
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Directory that receives the pages of `source`.
    pub fn destination_dir(&self, source: &Path) -> PathBuf {
        let rel = relative_to(&self.watch_root, source);
        let mut dir = self.output_root.clone();
        if let Some(parent) = rel.parent() {
            for comp in parent.components() {
                if let Component::Normal(name) = comp {
                    dir.push(sanitize_component(&name.to_string_lossy()));
                }
            }
        }
        let stem = rel
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        dir.push(sanitize_component(&stem));
        dir
    }

    /// Write every page of `job` and return the paths actually written, in page order.
    ///
    /// Blocking; call from `spawn_blocking`.
    pub fn commit(&self, job: &PdfJob, pages: &[OutputPage]) -> Result<Vec<PathBuf>, JobError> {
        let dir = self.destination_dir(&job.source_path);
        let lock = self.lock_for(&dir);
        let result = {
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            self.commit_locked(&dir, job, pages)
        };
        self.unlock(&dir, lock);
        result
    }

    fn lock_for(&self, dir: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.dir_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(dir.to_path_buf()).or_default())
    }

    /// Drop the directory's lock entry once no other commit holds it.
    fn unlock(&self, dir: &Path, lock: Arc<Mutex<()>>) {
        let mut locks = self.dir_locks.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(dir);
        }
    }

    fn commit_locked(
        &self,
        dir: &Path,
        job: &PdfJob,
        pages: &[OutputPage],
    ) -> Result<Vec<PathBuf>, JobError> {
        std::fs::create_dir_all(dir).map_err(|e| JobError::output_write(dir, &e))?;

        let owner = manifest_key(&relative_to(&self.watch_root, &job.source_path));
        let mut manifest = read_manifest(dir)?;

        let mut plan: Vec<(PathBuf, &OutputPage)> = Vec::with_capacity(pages.len());
        for page in pages {
            match self.choose_name(dir, &manifest, &owner, page.page_num)? {
                Some(name) => {
                    manifest.insert(name.clone(), owner.clone());
                    plan.push((dir.join(name), page));
                }
                None => warn!(
                    "Skipping page {} of {}: '{}' exists and was not written by pdfsplit",
                    page.page_num,
                    job.source_path.display(),
                    dir.join(page_file_name(page.page_num, 1)).display()
                ),
            }
        }

        write_manifest(dir, &manifest)?;

        let mut written = Vec::with_capacity(plan.len());
        for (target, page) in plan {
            write_atomic(dir, &target, &page.pdf)?;
            debug!("Wrote {}", target.display());
            written.push(target);
        }

        info!(
            "Committed {} page(s) of {} to {}",
            written.len(),
            job.source_path.display(),
            dir.display()
        );
        Ok(written)
    }

    /// Pick the file name for one page, or `None` when the page must be skipped.
    fn choose_name(
        &self,
        dir: &Path,
        manifest: &BTreeMap<String, String>,
        owner: &str,
        page_num: usize,
    ) -> Result<Option<String>, JobError> {
        let usable = |name: &str| {
            manifest.get(name).is_some_and(|o| o == owner) || !dir.join(name).exists()
        };

        let primary = page_file_name(page_num, 1);
        if usable(&primary) {
            return Ok(Some(primary));
        }

        match self.policy {
            CollisionPolicy::Skip => Ok(None),
            CollisionPolicy::Suffix => {
                for n in 2..=MAX_SUFFIX {
                    let name = page_file_name(page_num, n);
                    if usable(&name) {
                        warn!(
                            "'{}' is occupied by a foreign file; writing page {} as '{}'",
                            dir.join(&primary).display(),
                            page_num,
                            name
                        );
                        return Ok(Some(name));
                    }
                }
                Err(JobError::OutputWrite {
                    path: dir.join(primary),
                    detail: format!("no free name after {MAX_SUFFIX} suffixes"),
                })
            }
        }
    }
}

/// `page_3.pdf` for `n == 1`, otherwise `page_3_<n>.pdf`.
pub fn page_file_name(page_num: usize, n: usize) -> String {
    if n <= 1 {
        format!("page_{page_num}.pdf")
    } else {
        format!("page_{page_num}_{n}.pdf")
    }
}

fn manifest_key(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

fn read_manifest(dir: &Path) -> Result<BTreeMap<String, String>, JobError> {
    let path = dir.join(MANIFEST_NAME);
    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(JobError::output_write(&path, &e)),
    };
    Ok(text
        .lines()
        .filter_map(|line| line.split_once('\t'))
        .map(|(name, owner)| (name.to_string(), owner.to_string()))
        .collect())
}

fn write_manifest(dir: &Path, manifest: &BTreeMap<String, String>) -> Result<(), JobError> {
    let body: String = manifest
        .iter()
        .map(|(name, owner)| format!("{name}\t{owner}\n"))
        .collect();
    write_atomic(dir, &dir.join(MANIFEST_NAME), body.as_bytes())
}

/// Write `bytes` to a temp file in `dir`, fsync it, and rename it onto `target`.
fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> Result<(), JobError> {
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| JobError::output_write(target, &e))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| JobError::output_write(target, &e))?;
    tmp.persist(target)
        .map_err(|e| JobError::output_write(target, &e.error))?;
    Ok(())
}

static RE_UNSAFE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9_]+").unwrap());
static RE_UNDERSCORES: Lazy<Regex> = Lazy::new(|| Regex::new(r"_{2,}").unwrap());

/// Longest sanitised component, in bytes (always ASCII).
const MAX_COMPONENT_LEN: usize = 120;

const RESERVED: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

/// Make one path component safe and deterministic.
///
/// Lower-cases, then turns every run of characters outside `[a-z0-9_]`
/// (whitespace, punctuation, dots, non-ASCII letters) into a single `_`,
/// collapses repeated `_` and trims it from both ends. Windows device names
/// get a trailing `_`; an empty result becomes `untitled`. The output is
/// always ASCII and sanitising it again changes nothing.
pub fn sanitize_component(name: &str) -> String {
    let lowered = name.to_lowercase();
    let replaced = RE_UNSAFE.replace_all(&lowered, "_");
    let collapsed = RE_UNDERSCORES.replace_all(&replaced, "_");

    let mut out = collapsed.trim_matches('_').to_string();
    if out.len() > MAX_COMPONENT_LEN {
        out.truncate(MAX_COMPONENT_LEN);
        out = out.trim_end_matches('_').to_string();
    }
    if out.is_empty() {
        return "untitled".to_string();
    }
    if RESERVED.contains(&out.as_str()) {
        out.push('_');
    }
    out
}
