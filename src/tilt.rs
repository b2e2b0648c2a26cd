//! The container facade: one `.tilt` path, packed or unpacked.
//!
//! ```no_run
//! use tilt::Tilt;
//!
//! let mut tilt = Tilt::open("sketch.tilt")?;
//! tilt.mutate_metadata(|meta| {
//!     meta["Authors"] = serde_json::json!(["someone"]);
//!     Ok(())
//! })?;
//! for stroke in &mut tilt.sketch()?.strokes {
//!     stroke.brush_size *= 2.0;
//! }
//! tilt.write_sketch()?;
//! # Ok::<(), tilt::TiltError>(())
//! ```

use serde_json::Value;
use std::fs;
use std::io::{self, Cursor};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::extension::{ExtensionError, Extensions};
use crate::header::HeaderError;
use crate::metadata::{MetadataError, MetadataStore};
use crate::sketch::{Sketch, SketchError};
use crate::transcode::{
    self, Compression, ConversionError, PackOptions, MEMBER_ORDER, METADATA_MEMBER, SKETCH_MEMBER,
};

/// File and directory names that are treated as containers.
pub const CONTAINER_EXTENSION: &str = "tilt";

#[derive(Error, Debug)]
pub enum TiltError {
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Sketch(#[from] SketchError),
    #[error(transparent)]
    Extension(#[from] ExtensionError),
    #[error("{} has no member {member}", .path.display())]
    MissingMember { path: PathBuf, member: String },
    #[error("{0:?} is not a writable container member")]
    NotWritable(String),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// An open container. Metadata is read on open; the sketch is parsed on
/// first use.
#[derive(Debug)]
pub struct Tilt {
    path:       PathBuf,
    metadata:   MetadataStore,
    sketch:     Option<Sketch>,
    extensions: Arc<Extensions>,
}

impl Tilt {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TiltError> {
        Self::open_with(path, Arc::new(Extensions::new()))
    }

    /// Open with caller-supplied extension engines, e.g. to share one plan
    /// cache across many containers.
    pub fn open_with<P: AsRef<Path>>(path: P, extensions: Arc<Extensions>) -> Result<Self, TiltError> {
        let path = path.as_ref().to_path_buf();
        let bytes = read_member_at(&path, METADATA_MEMBER)?;
        let metadata = MetadataStore::load(&bytes)?;
        Ok(Self { path, metadata, sketch: None, extensions })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_unpacked(&self) -> bool {
        self.path.is_dir()
    }

    // ── Members ──────────────────────────────────────────────────────────────

    pub fn read_member(&self, name: &str) -> Result<Vec<u8>, TiltError> {
        read_member_at(&self.path, name)
    }

    /// Replace a member. A packed container is unpacked, written and packed
    /// again with its original compression.
    ///
    /// Only the known members other than `header.bin` can be written; the
    /// name is matched case-insensitively and written under its canonical
    /// spelling.
    pub fn write_member(&self, name: &str, bytes: &[u8]) -> Result<(), TiltError> {
        let member = match transcode::member_rank(name) {
            Some(rank) if rank > 0 => MEMBER_ORDER[rank],
            _ => return Err(TiltError::NotWritable(name.to_owned())),
        };
        Self::with_directory(&self.path, |dir| {
            fs::write(dir.join(member), bytes)?;
            Ok(())
        })
    }

    /// Run `f` against the container in unpacked form.
    ///
    /// A packed container is unpacked first and always packed again
    /// afterwards, with the compression the unpack reported. If `f` fails its
    /// error is returned even when re-packing also fails.
    pub fn with_directory<P, F, T>(path: P, f: F) -> Result<T, TiltError>
    where
        P: AsRef<Path>,
        F: FnOnce(&Path) -> Result<T, TiltError>,
    {
        let path = path.as_ref();
        if path.is_dir() {
            return f(path);
        }

        let compressed = transcode::unpack(path)?;
        let result = f(path);
        let repacked = transcode::pack(path, &PackOptions::from(Compression::from_flag(compressed)));

        match (result, repacked) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e))     => Err(e.into()),
            (Err(e), Ok(()))    => Err(e),
            (Err(e), Err(pack_err)) => {
                warn!(path = %path.display(), error = %pack_err, "re-pack failed after error");
                Err(e)
            }
        }
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    /// The validation error logged when the container was opened, if any.
    pub fn metadata_warning(&self) -> Option<&MetadataError> {
        self.metadata.warning()
    }

    pub fn validate_metadata(&self) -> Result<(), MetadataError> {
        self.metadata.validate()
    }

    /// Start a metadata edit on a private copy. Nothing is written until
    /// [`MetadataTransaction::commit`]; dropping the transaction discards it.
    pub fn begin_metadata(&mut self) -> MetadataTransaction<'_> {
        let draft = self.metadata.value().clone();
        MetadataTransaction { tilt: self, draft }
    }

    /// Apply `f` to a copy of the metadata and commit it if `f` succeeds.
    /// Returns whether anything was written.
    pub fn mutate_metadata<F>(&mut self, f: F) -> Result<bool, TiltError>
    where
        F: FnOnce(&mut Value) -> Result<(), TiltError>,
    {
        let mut txn = self.begin_metadata();
        f(&mut *txn)?;
        txn.commit()
    }

    fn commit_metadata(&mut self, candidate: Value) -> Result<bool, TiltError> {
        let Some(json) = self.metadata.stage(&candidate)? else {
            return Ok(false);
        };
        self.write_member(METADATA_MEMBER, json.as_bytes())?;
        self.metadata.install(candidate);
        Ok(true)
    }

    // ── Sketch ───────────────────────────────────────────────────────────────

    /// The parsed sketch, reading `data.sketch` on first access.
    pub fn sketch(&mut self) -> Result<&mut Sketch, TiltError> {
        let sketch = match self.sketch.take() {
            Some(sketch) => sketch,
            None => {
                let bytes = self.read_member(SKETCH_MEMBER)?;
                Sketch::read_with(Cursor::new(bytes), Arc::clone(&self.extensions))?
            }
        };
        Ok(self.sketch.insert(sketch))
    }

    /// The sketch if it has already been parsed.
    pub fn loaded_sketch(&self) -> Option<&Sketch> {
        self.sketch.as_ref()
    }

    /// Drop the parsed sketch, discarding unsaved changes.
    pub fn invalidate_sketch(&mut self) {
        self.sketch = None;
    }

    pub fn reload_sketch(&mut self) -> Result<&mut Sketch, TiltError> {
        self.invalidate_sketch();
        self.sketch()
    }

    /// Serialize the sketch into `data.sketch`, parsing it first if needed.
    pub fn write_sketch(&mut self) -> Result<(), TiltError> {
        let bytes = self.sketch()?.to_bytes()?;
        self.write_member(SKETCH_MEMBER, &bytes)
    }

    // ── Discovery ────────────────────────────────────────────────────────────

    /// Every container below `root`, packed or unpacked, in path order.
    /// Unpacked containers are not descended into; ones that fail to open
    /// are skipped.
    pub fn walk<P: AsRef<Path>>(root: P) -> Walk {
        Walk { root: Some(root.as_ref().to_path_buf()), pending: Vec::new() }
    }
}

fn read_member_at(path: &Path, name: &str) -> Result<Vec<u8>, TiltError> {
    let missing = || TiltError::MissingMember { path: path.to_path_buf(), member: name.to_owned() };
    if path.is_dir() {
        return fs::read(path.join(name)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => missing(),
            _                       => TiltError::Io(e),
        });
    }
    transcode::read_packed_member(path, name)?.ok_or_else(missing)
}

// ── Metadata transaction ─────────────────────────────────────────────────────

/// A private copy of a container's metadata. Derefs to the JSON value.
#[derive(Debug)]
pub struct MetadataTransaction<'a> {
    tilt:  &'a mut Tilt,
    draft: Value,
}

impl MetadataTransaction<'_> {
    /// Validate the draft and persist it if it differs from the current
    /// metadata. Returns whether anything was written. On error nothing
    /// changes.
    pub fn commit(self) -> Result<bool, TiltError> {
        self.tilt.commit_metadata(self.draft)
    }

    pub fn abort(self) {}
}

impl Deref for MetadataTransaction<'_> {
    type Target = Value;
    fn deref(&self) -> &Value { &self.draft }
}

impl DerefMut for MetadataTransaction<'_> {
    fn deref_mut(&mut self) -> &mut Value { &mut self.draft }
}

// ── Walk ─────────────────────────────────────────────────────────────────────

/// Iterator returned by [`Tilt::walk`].
#[derive(Debug)]
pub struct Walk {
    root:    Option<PathBuf>,
    /// Paths still to visit, last one next.
    pending: Vec<PathBuf>,
}

impl Walk {
    fn expand(&mut self, dir: &Path) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(path = %dir.display(), error = %e, "skipping unreadable directory");
                return;
            }
        };
        let mut children: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
        children.sort_unstable_by(|a, b| b.cmp(a));
        self.pending.extend(children);
    }
}

fn is_container_name(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == CONTAINER_EXTENSION)
}

/// Symlinked directories are not followed.
fn is_real_dir(path: &Path) -> bool {
    fs::symlink_metadata(path).map_or(false, |m| m.file_type().is_dir())
}

impl Iterator for Walk {
    type Item = Tilt;

    fn next(&mut self) -> Option<Tilt> {
        if let Some(root) = self.root.take() {
            self.expand(&root);
        }
        while let Some(path) = self.pending.pop() {
            if is_container_name(&path) {
                match Tilt::open(&path) {
                    Ok(tilt) => return Some(tilt),
                    Err(e) => debug!(path = %path.display(), error = %e, "skipping container"),
                }
            } else if is_real_dir(&path) {
                self.expand(&path);
            }
        }
        None
    }
}
