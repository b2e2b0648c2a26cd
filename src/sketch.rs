//! The `data.sketch` stroke stream.
//!
//! Layout (little-endian): `u32×3` opaque header, `u32` length + opaque
//! additional header, `i32` stroke count, then the strokes (see
//! [`crate::stroke`]).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::extension::{read_length_prefixed, ExtensionError, Extensions};
use crate::stroke::{Stroke, MAX_CONTROL_POINTS};

/// Exclusive upper bound on the stroke count; anything larger is taken to be
/// a corrupt length field.
pub const MAX_STROKES: i32 = 300_000;

#[derive(Error, Debug)]
pub enum SketchError {
    #[error("malformed sketch: stroke count {0} outside 0..{}", MAX_STROKES)]
    BadStrokeCount(i32),
    #[error("malformed sketch: control point count {0} outside 0..{}", MAX_CONTROL_POINTS)]
    BadControlPointCount(i32),
    #[error("malformed sketch: truncated stream: {0}")]
    Truncated(String),
    #[error(transparent)]
    Extension(#[from] ExtensionError),
    #[error("malformed sketch: {0}")]
    Io(io::Error),
}

impl From<io::Error> for SketchError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            SketchError::Truncated(e.to_string())
        } else {
            SketchError::Io(e)
        }
    }
}

/// Decoded stroke data.
#[derive(Debug, Clone)]
pub struct Sketch {
    /// Opaque; carried through unchanged.
    pub header:            [u32; 3],
    /// Opaque; carried through unchanged.
    pub additional_header: Vec<u8>,
    pub strokes:           Vec<Stroke>,
    extensions:            Arc<Extensions>,
}

impl Sketch {
    /// An empty sketch with its own extension engines.
    pub fn new(header: [u32; 3]) -> Self {
        Self::with_extensions(header, Arc::new(Extensions::new()))
    }

    pub fn with_extensions(header: [u32; 3], extensions: Arc<Extensions>) -> Self {
        Self { header, additional_header: Vec::new(), strokes: Vec::new(), extensions }
    }

    pub fn read<R: Read>(reader: R) -> Result<Self, SketchError> {
        Self::read_with(reader, Arc::new(Extensions::new()))
    }

    /// Parse with caller-supplied engines, so several sketches can share one
    /// plan cache.
    pub fn read_with<R: Read>(mut reader: R, extensions: Arc<Extensions>) -> Result<Self, SketchError> {
        let mut header = [0u32; 3];
        reader.read_u32_into::<LittleEndian>(&mut header)?;
        let additional_header = read_length_prefixed(&mut reader)?;

        let count = reader.read_i32::<LittleEndian>()?;
        if !(0..MAX_STROKES).contains(&count) {
            return Err(SketchError::BadStrokeCount(count));
        }
        // The count is only an upper bound until the strokes are actually read.
        let mut strokes = Vec::with_capacity((count as usize).min(4096));
        for _ in 0..count {
            strokes.push(Stroke::read(&mut reader, &extensions)?);
        }

        Ok(Self { header, additional_header, strokes, extensions })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SketchError> {
        Self::read(Cursor::new(bytes))
    }

    /// Parse a standalone `.sketch` file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SketchError> {
        let bytes = fs::read(path).map_err(SketchError::Io)?;
        Self::from_bytes(&bytes)
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        if self.strokes.len() >= MAX_STROKES as usize {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, format!(
                "sketch has {} strokes; readers reject {MAX_STROKES} or more",
                self.strokes.len()
            )));
        }
        let additional_len = u32::try_from(self.additional_header.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "additional header exceeds u32 length")
        })?;

        for word in &self.header {
            writer.write_u32::<LittleEndian>(*word)?;
        }
        writer.write_u32::<LittleEndian>(additional_len)?;
        writer.write_all(&self.additional_header)?;
        writer.write_i32::<LittleEndian>(self.strokes.len() as i32)?;
        for stroke in &self.strokes {
            stroke.write(&mut writer)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write(&mut out)?;
        Ok(out)
    }

    pub fn extensions(&self) -> &Arc<Extensions> {
        &self.extensions
    }

    /// A blank stroke that shares this sketch's engines. Not added to
    /// `strokes`.
    pub fn new_stroke(&self, brush_idx: i32, brush_color: [f32; 4], brush_size: f32) -> Stroke {
        Stroke::new(&self.extensions, brush_idx, brush_color, brush_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stroke::ControlPoint;

    fn sample() -> Sketch {
        let mut sketch = Sketch::new([0xc576a5cd, 5, 0]);
        sketch.additional_header = b"extra".to_vec();

        let mut stroke = sketch.new_stroke(0, [1.0, 0.0, 0.0, 1.0], 0.25);
        stroke.set_flags(0).unwrap();
        stroke.add_cp_extension("timestamp", 0u32).unwrap();
        let cps = stroke.controlpoints().unwrap();
        for i in 0..3u32 {
            let mut cp = ControlPoint::new([i as f32, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0]);
            cp.extension.push((i * 10).into());
            cps.push(cp);
        }
        sketch.strokes.push(stroke);
        let plain = sketch.new_stroke(1, [0.0, 1.0, 0.0, 1.0], 0.5);
        sketch.strokes.push(plain);
        sketch
    }

    #[test]
    fn write_then_read() {
        let bytes = sample().to_bytes().unwrap();
        let mut parsed = Sketch::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.header, [0xc576a5cd, 5, 0]);
        assert_eq!(parsed.additional_header, b"extra");
        assert_eq!(parsed.strokes.len(), 2);

        let stroke = &mut parsed.strokes[0];
        assert_eq!(stroke.flags(), Some(0));
        assert_eq!(stroke.cp_mask(), 0x2);
        let cps = stroke.controlpoints().unwrap().clone();
        assert_eq!(cps.len(), 3);
        assert_eq!(stroke.timestamp(&cps[2]), Some(20));

        assert_eq!(parsed.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn stroke_count_tracks_mutation() {
        let mut sketch = sample();
        sketch.strokes.pop();
        let parsed = Sketch::from_bytes(&sketch.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.strokes.len(), 1);
    }

    #[test]
    fn rejects_stroke_counts_at_the_ceiling() {
        let mut bytes = Sketch::new([0; 3]).to_bytes().unwrap();
        let at = bytes.len() - 4;
        bytes[at..].copy_from_slice(&MAX_STROKES.to_le_bytes());
        assert!(matches!(
            Sketch::from_bytes(&bytes),
            Err(SketchError::BadStrokeCount(MAX_STROKES))
        ));
        bytes[at..].copy_from_slice(&(-5i32).to_le_bytes());
        assert!(matches!(Sketch::from_bytes(&bytes), Err(SketchError::BadStrokeCount(-5))));
    }

    #[test]
    fn truncated_streams_fail() {
        let bytes = sample().to_bytes().unwrap();
        for cut in [3, 14, 30, bytes.len() - 1] {
            assert!(
                matches!(Sketch::from_bytes(&bytes[..cut]), Err(SketchError::Truncated(_))),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn oversized_additional_header_length_is_truncation() {
        let mut bytes = Vec::new();
        for w in [1u32, 2, 3, u32::MAX] {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        assert!(matches!(Sketch::from_bytes(&bytes), Err(SketchError::Truncated(_))));
    }
}
