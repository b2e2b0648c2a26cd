//! Conversion between the packed (header + zip) and unpacked (directory)
//! forms of a container.
//!
//! Both directions stage into a sibling path and then swap it over the
//! original, so a failure at any point leaves the original in place.
//!
//! ```text
//! unpack:  sketch.tilt        -> sketch.tilt._part/ -> sketch.tilt/
//! pack:    sketch.tilt/       -> sketch.tilt.part   -> sketch.tilt
//! backup:  sketch.tilt._prev  (only while swapping)
//! ```

pub mod staging;

use std::fs::{self, File};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::header::{HeaderError, TiltHeader};
use staging::{sibling, Staging, BACKUP_SUFFIX, PACK_SUFFIX, UNPACK_SUFFIX};

pub const HEADER_MEMBER:    &str = "header.bin";
pub const THUMBNAIL_MEMBER: &str = "thumbnail.png";
pub const METADATA_MEMBER:  &str = "metadata.json";
pub const MAIN_MEMBER:      &str = "main.json";
pub const SKETCH_MEMBER:    &str = "data.sketch";

/// Canonical archive order. `header.bin` only exists in unpacked form.
pub const MEMBER_ORDER: [&str; 5] = [
    HEADER_MEMBER,
    THUMBNAIL_MEMBER,
    METADATA_MEMBER,
    MAIN_MEMBER,
    SKETCH_MEMBER,
];

/// Position of `name` in [`MEMBER_ORDER`], ignoring ASCII case.
pub fn member_rank(name: &str) -> Option<usize> {
    MEMBER_ORDER.iter().position(|m| m.eq_ignore_ascii_case(name))
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("remove {} first", .0.display())]
    Conflict(PathBuf),
    #[error("{} does not exist", .0.display())]
    NotFound(PathBuf),
    #[error("cannot validate metadata.json: {0}")]
    MetadataUnreadable(#[source] io::Error),
    #[error("metadata.json is not valid utf-8: {0}")]
    MetadataNotUtf8(#[source] std::str::Utf8Error),
    #[error("metadata.json is not valid json: {0}")]
    MetadataNotJson(#[source] serde_json::Error),
    #[error("unknown file {0}; this is probably not a .tilt")]
    UnknownMember(String),
    #[error("zip member {0:?} would land outside the container")]
    UnsafeMemberName(String),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("zip: {0}")]
    Zip(#[from] ZipError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

// ── Options ──────────────────────────────────────────────────────────────────

/// Zip storage mode for packed members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    Stored,
    Deflated,
}

impl Compression {
    /// `Deflated` when an unpack reported compressed members.
    pub fn from_flag(compressed: bool) -> Self {
        if compressed { Compression::Deflated } else { Compression::Stored }
    }

    fn method(self) -> CompressionMethod {
        match self {
            Compression::Stored   => CompressionMethod::Stored,
            Compression::Deflated => CompressionMethod::Deflated,
        }
    }
}

/// Configuration for [`pack`].
#[derive(Debug, Clone, Default)]
pub struct PackOptions {
    pub compression: Compression,
    /// Deflate level; `None` uses the zip writer's default. Ignored when
    /// storing.
    pub level:       Option<i64>,
}

impl From<Compression> for PackOptions {
    fn from(compression: Compression) -> Self {
        Self { compression, level: None }
    }
}

impl PackOptions {
    fn file_options(&self) -> SimpleFileOptions {
        let options = SimpleFileOptions::default().compression_method(self.compression.method());
        match self.compression {
            Compression::Stored   => options,
            Compression::Deflated => options.compression_level(self.level),
        }
    }
}

/// What [`convert`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// Packed file became a directory; `compressed` reports whether any
    /// member was deflated.
    Unpacked { compressed: bool },
    /// Directory became a packed file.
    Packed,
}

// ── Unpack ───────────────────────────────────────────────────────────────────

/// Convert a packed container into a directory in place. Returns whether any
/// zip member was compressed, so the caller can re-pack the same way.
pub fn unpack<P: AsRef<Path>>(path: P) -> Result<bool, ConversionError> {
    let path = path.as_ref();
    let bytes = read_existing(path)?;
    let (header, body) = split_packed(&bytes)?;

    let staging_path = sibling(path, UNPACK_SUFFIX);
    refuse_existing(&staging_path)?;
    refuse_existing(&sibling(path, BACKUP_SUFFIX))?;

    fs::create_dir(&staging_path)?;
    let staging = Staging::new(staging_path);
    let compressed = extract(body, staging.path())?;
    fs::write(staging.path().join(HEADER_MEMBER), header.as_bytes())?;
    staging.commit(path)?;

    debug!(path = %path.display(), compressed, "unpacked container");
    Ok(compressed)
}

/// Split a packed container into its validated header and zip body.
pub(crate) fn split_packed(bytes: &[u8]) -> Result<(TiltHeader, &[u8]), HeaderError> {
    let header = TiltHeader::read(bytes)?;
    let body = &bytes[header.len()..];
    Ok((header, body))
}

fn extract(body: &[u8], dest: &Path) -> Result<bool, ConversionError> {
    if body.is_empty() {
        return Ok(false);
    }
    let mut archive = ZipArchive::new(Cursor::new(body))?;
    let mut compressed = false;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.compressed_size() != entry.size() {
            compressed = true;
        }
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| ConversionError::UnsafeMemberName(entry.name().to_owned()))?;
        let out_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;
    }
    Ok(compressed)
}

/// Read one member straight out of a packed container. `None` when the
/// archive has no such member.
pub(crate) fn read_packed_member(path: &Path, name: &str) -> Result<Option<Vec<u8>>, ConversionError> {
    let bytes = read_existing(path)?;
    let (_, body) = split_packed(&bytes)?;
    if body.is_empty() {
        return Ok(None);
    }
    let mut archive = ZipArchive::new(Cursor::new(body))?;
    let mut entry = match archive.by_name(name) {
        Ok(entry)                   => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e)                      => return Err(e.into()),
    };
    let mut out = Vec::new();
    entry.read_to_end(&mut out)?;
    Ok(Some(out))
}

// ── Pack ─────────────────────────────────────────────────────────────────────

/// A file found under the directory being packed.
#[derive(Debug)]
struct Member {
    rank:         usize,
    path:         PathBuf,
    /// Path relative to the container root, `/`-separated.
    archive_name: String,
}

/// Convert a container directory into a packed file in place.
pub fn pack<P: AsRef<Path>>(path: P, options: &PackOptions) -> Result<(), ConversionError> {
    let path = path.as_ref();
    if fs::symlink_metadata(path).is_err() {
        return Err(ConversionError::NotFound(path.to_path_buf()));
    }

    let staging_path = sibling(path, PACK_SUFFIX);
    refuse_existing(&staging_path)?;
    refuse_existing(&sibling(path, BACKUP_SUFFIX))?;
    check_metadata(path)?;

    let members = collect_members(path)?;
    let (header_bytes, body) = build_body(&members, options)?;
    let header = match header_bytes {
        Some(bytes) => TiltHeader::from_bytes(&bytes)?,
        None => {
            warn!(path = %path.display(), "missing {HEADER_MEMBER}; using default header");
            TiltHeader::default_v1()
        }
    };

    let staging = Staging::new(staging_path);
    let mut out = File::create(staging.path())?;
    header.write(&mut out)?;
    out.write_all(&body)?;
    out.sync_all()?;
    drop(out);
    staging.commit(path)?;

    debug!(path = %path.display(), compression = ?options.compression, "packed container");
    Ok(())
}

/// `metadata.json` must be UTF-8 JSON before the container is sealed.
fn check_metadata(dir: &Path) -> Result<(), ConversionError> {
    let bytes = fs::read(dir.join(METADATA_MEMBER)).map_err(ConversionError::MetadataUnreadable)?;
    let text = std::str::from_utf8(&bytes).map_err(ConversionError::MetadataNotUtf8)?;
    serde_json::from_str::<serde_json::Value>(text).map_err(ConversionError::MetadataNotJson)?;
    Ok(())
}

fn collect_members(root: &Path) -> Result<Vec<Member>, ConversionError> {
    let mut members = Vec::new();
    let mut dirs = vec![(root.to_path_buf(), Vec::<String>::new())];

    while let Some((dir, prefix)) = dirs.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let mut components = prefix.clone();
            components.push(file_name.clone());

            if entry.file_type()?.is_dir() {
                dirs.push((entry.path(), components));
                continue;
            }
            let rank = member_rank(&file_name)
                .ok_or_else(|| ConversionError::UnknownMember(file_name.clone()))?;
            members.push(Member { rank, path: entry.path(), archive_name: components.join("/") });
        }
    }

    members.sort_by_cached_key(|m| (m.rank, m.archive_name.to_lowercase()));
    Ok(members)
}

/// Zip every member except `header.bin`, whose contents are returned
/// separately.
fn build_body(members: &[Member], options: &PackOptions) -> Result<(Option<Vec<u8>>, Vec<u8>), ConversionError> {
    let file_options = options.file_options();
    let mut header = None;
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));

    for member in members {
        let data = fs::read(&member.path)?;
        if member.rank == 0 {
            header.get_or_insert(data);
            continue;
        }
        zip.start_file(member.archive_name.as_str(), file_options)?;
        zip.write_all(&data)?;
    }

    Ok((header, zip.finish()?.into_inner()))
}

// ── Convert ──────────────────────────────────────────────────────────────────

/// Pack a directory or unpack a file, whichever `path` currently is.
pub fn convert<P: AsRef<Path>>(path: P, options: &PackOptions) -> Result<Conversion, ConversionError> {
    let path = path.as_ref();
    let meta = fs::metadata(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ConversionError::NotFound(path.to_path_buf()),
        _                       => ConversionError::Io(e),
    })?;
    if meta.is_dir() {
        pack(path, options)?;
        Ok(Conversion::Packed)
    } else {
        let compressed = unpack(path)?;
        Ok(Conversion::Unpacked { compressed })
    }
}

fn read_existing(path: &Path) -> Result<Vec<u8>, ConversionError> {
    fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ConversionError::NotFound(path.to_path_buf()),
        _                       => ConversionError::Io(e),
    })
}

fn refuse_existing(path: &Path) -> Result<(), ConversionError> {
    if fs::symlink_metadata(path).is_ok() {
        return Err(ConversionError::Conflict(path.to_path_buf()));
    }
    Ok(())
}
