//! Extension field engine: bitmask-selected optional fields on strokes and
//! control points.
//!
//! # Masks and plans
//! Every stroke carries two `u32` masks. Each set bit selects one optional
//! field that follows the record's fixed portion on the wire. Fields appear
//! in increasing bit order, whatever order the static table lists them in.
//!
//! An [`ExtensionPlan`] is the pure derivation of a mask: the ordered field
//! list, each field's wire type, a name → index table, and the matching
//! reader/writer pair. Plans are immutable, so records share them through
//! `Arc` and an [`ExtensionEngine`] caches them per mask.
//!
//! # Unknown bits
//! Bits missing from a table still get a field so that unknown data survives
//! a round trip. The name is synthesised from the bit position
//! (`stroke_ext_5`, `cp_ext_9`). Unknown stroke bits in the low 16 bits are
//! 4-byte unsigned integers; higher ones are `u32`-length-prefixed blobs.
//! Unknown control-point bits are always 4-byte unsigned integers.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Plans kept per engine before the oldest is evicted.
pub const DEFAULT_PLAN_CAPACITY: usize = 64;

// ── Wire types and values ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireType {
    /// Little-endian `u32`.
    U32,
    /// Little-endian IEEE-754 `f32`.
    F32,
    /// `u32` byte count followed by that many opaque bytes.
    Blob,
}

impl WireType {
    /// Encoded size, or `None` for variable-length blobs.
    #[inline]
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            WireType::U32  => Some(4),
            WireType::F32  => Some(4),
            WireType::Blob => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            WireType::U32  => "u32",
            WireType::F32  => "f32",
            WireType::Blob => "blob",
        }
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One decoded extension value.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtValue {
    U32(u32),
    F32(f32),
    Blob(Vec<u8>),
}

impl ExtValue {
    pub fn wire_type(&self) -> WireType {
        match self {
            ExtValue::U32(_)  => WireType::U32,
            ExtValue::F32(_)  => WireType::F32,
            ExtValue::Blob(_) => WireType::Blob,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            ExtValue::U32(v) => Some(*v),
            _                => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            ExtValue::F32(v) => Some(*v),
            _                => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            ExtValue::Blob(v) => Some(v),
            _                 => None,
        }
    }
}

impl From<u32> for ExtValue {
    fn from(v: u32) -> Self { ExtValue::U32(v) }
}

impl From<f32> for ExtValue {
    fn from(v: f32) -> Self { ExtValue::F32(v) }
}

impl From<Vec<u8>> for ExtValue {
    fn from(v: Vec<u8>) -> Self { ExtValue::Blob(v) }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtensionError {
    #[error("Unknown {kind} extension: {name}")]
    UnknownName { kind: &'static str, name: String },
    #[error("{kind} extension not present: {name}")]
    Absent { kind: &'static str, name: String },
    #[error("Extension {name} is {expected} on the wire, got a {actual} value")]
    TypeMismatch { name: String, expected: WireType, actual: WireType },
}

// ── Static tables ────────────────────────────────────────────────────────────

/// A table entry for a bit with a registered meaning.
#[derive(Debug)]
pub struct KnownExtension {
    pub bit:  u32,
    pub name: &'static str,
    pub wire: WireType,
}

/// Static description of one family of extensions (stroke or control point).
#[derive(Debug)]
pub struct ExtensionTable {
    /// Used in diagnostics only.
    pub kind:          &'static str,
    name_prefix:       &'static str,
    known:             &'static [KnownExtension],
    blobs_above_low16: bool,
}

pub static STROKE_EXTENSIONS: ExtensionTable = ExtensionTable {
    kind:        "stroke",
    name_prefix: "stroke_ext_",
    known: &[
        // Listed out of bit order; wire order still follows the bits.
        KnownExtension { bit: 0x2, name: "scale", wire: WireType::F32 },
        KnownExtension { bit: 0x1, name: "flags", wire: WireType::U32 },
    ],
    blobs_above_low16: true,
};

pub static CONTROL_POINT_EXTENSIONS: ExtensionTable = ExtensionTable {
    kind:        "control point",
    name_prefix: "cp_ext_",
    known: &[
        KnownExtension { bit: 0x1, name: "pressure",  wire: WireType::F32 },
        KnownExtension { bit: 0x2, name: "timestamp", wire: WireType::U32 },
    ],
    blobs_above_low16: false,
};

/// One optional field selected by a single mask bit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtensionField {
    pub bit:  u32,
    pub name: Cow<'static, str>,
    pub wire: WireType,
}

impl ExtensionTable {
    /// Describe the field for a single bit, falling back to a synthesised
    /// name and wire type for bits this table does not know.
    pub fn field(&self, bit: u32) -> ExtensionField {
        debug_assert_eq!(bit.count_ones(), 1, "field() takes exactly one bit");
        if let Some(k) = self.known.iter().find(|k| k.bit == bit) {
            return ExtensionField { bit, name: Cow::Borrowed(k.name), wire: k.wire };
        }
        let wire = if self.blobs_above_low16 && bit & 0xffff == 0 {
            WireType::Blob
        } else {
            WireType::U32
        };
        ExtensionField {
            bit,
            name: Cow::Owned(format!("{}{}", self.name_prefix, bit.trailing_zeros())),
            wire,
        }
    }

    /// Resolve a field name (registered or synthesised) back to its field.
    pub fn lookup(&self, name: &str) -> Option<ExtensionField> {
        if let Some(k) = self.known.iter().find(|k| k.name == name) {
            return Some(ExtensionField { bit: k.bit, name: Cow::Borrowed(k.name), wire: k.wire });
        }
        let position: u32 = name.strip_prefix(self.name_prefix)?.parse().ok()?;
        if position >= 32 {
            return None;
        }
        let bit = 1u32 << position;
        // Registered bits are only ever addressed by their registered name.
        if self.known.iter().any(|k| k.bit == bit) {
            return None;
        }
        // Only the canonical spelling: no leading zeros or sign.
        let field = self.field(bit);
        (field.name == name).then_some(field)
    }

    /// Derive the plan for `mask`. Pure: equal masks give equal plans.
    pub fn derive_plan(&'static self, mask: u32) -> ExtensionPlan {
        let mut fields = Vec::with_capacity(mask.count_ones() as usize);
        let mut rest = mask;
        while rest != 0 {
            let bit = rest & rest.wrapping_neg();
            rest ^= bit;
            fields.push(self.field(bit));
        }

        let lookup = fields.iter()
            .enumerate()
            .map(|(i, f)| (f.name.to_string(), i))
            .collect();
        let fixed_size = fields.iter()
            .map(|f| f.wire.fixed_size())
            .sum::<Option<usize>>();

        ExtensionPlan { table: self, mask, fields, lookup, fixed_size }
    }
}

// ── Plans ────────────────────────────────────────────────────────────────────

/// The fields selected by one mask, with their reader and writer.
#[derive(Debug)]
pub struct ExtensionPlan {
    table:      &'static ExtensionTable,
    mask:       u32,
    fields:     Vec<ExtensionField>,
    lookup:     HashMap<String, usize>,
    /// Total encoded size when every field is fixed-width.
    fixed_size: Option<usize>,
}

impl ExtensionPlan {
    pub fn table(&self) -> &'static ExtensionTable { self.table }
    pub fn mask(&self) -> u32 { self.mask }
    pub fn fields(&self) -> &[ExtensionField] { &self.fields }
    pub fn len(&self) -> usize { self.fields.len() }
    pub fn is_empty(&self) -> bool { self.fields.is_empty() }
    pub fn fixed_size(&self) -> Option<usize> { self.fixed_size }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_ref())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.lookup.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup.contains_key(name)
    }

    /// Read one value per field, in bit order.
    pub fn read<R: Read>(&self, reader: &mut R) -> io::Result<Vec<ExtValue>> {
        if self.fields.is_empty() {
            return Ok(Vec::new());
        }
        match self.fixed_size {
            Some(size) => {
                let mut buf = vec![0u8; size];
                reader.read_exact(&mut buf)?;
                Ok(self.fields.iter()
                    .zip(buf.chunks_exact(4))
                    .map(|(f, word)| match f.wire {
                        WireType::F32 => ExtValue::F32(LittleEndian::read_f32(word)),
                        _             => ExtValue::U32(LittleEndian::read_u32(word)),
                    })
                    .collect())
            }
            None => self.fields.iter().map(|f| read_value(reader, f.wire)).collect(),
        }
    }

    /// Write `values`, which must line up with this plan's fields.
    pub fn write<W: Write>(&self, writer: &mut W, values: &[ExtValue]) -> io::Result<()> {
        if values.len() != self.fields.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, format!(
                "{} extension mask {:#x} has {} fields, got {} values",
                self.table.kind, self.mask, self.fields.len(), values.len()
            )));
        }
        if let Some(size) = self.fixed_size {
            let mut buf = vec![0u8; size];
            for ((f, v), word) in self.fields.iter().zip(values).zip(buf.chunks_exact_mut(4)) {
                match v {
                    ExtValue::U32(x) if f.wire == WireType::U32 => LittleEndian::write_u32(word, *x),
                    ExtValue::F32(x) if f.wire == WireType::F32 => LittleEndian::write_f32(word, *x),
                    other => return Err(mismatch(f, other)),
                }
            }
            return writer.write_all(&buf);
        }
        for (f, v) in self.fields.iter().zip(values) {
            match v {
                ExtValue::U32(x) if f.wire == WireType::U32 => writer.write_u32::<LittleEndian>(*x)?,
                ExtValue::F32(x) if f.wire == WireType::F32 => writer.write_f32::<LittleEndian>(*x)?,
                ExtValue::Blob(b) if f.wire == WireType::Blob => {
                    let len = u32::try_from(b.len()).map_err(|_| io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("extension {} blob exceeds u32 length", f.name),
                    ))?;
                    writer.write_u32::<LittleEndian>(len)?;
                    writer.write_all(b)?;
                }
                other => return Err(mismatch(f, other)),
            }
        }
        Ok(())
    }

    /// Move values laid out for `from` into this plan's layout. Fields absent
    /// here are dropped; fields new here come from `added`.
    pub fn reproject(
        &self,
        from:   &ExtensionPlan,
        values: Vec<ExtValue>,
        added:  Option<(&str, ExtValue)>,
    ) -> Result<Vec<ExtValue>, ExtensionError> {
        let mut by_name: HashMap<&str, ExtValue> = from.names().zip(values).collect();
        if let Some((name, value)) = added {
            by_name.insert(name, value);
        }
        self.fields.iter()
            .map(|f| by_name.remove(&*f.name).ok_or_else(|| ExtensionError::Absent {
                kind: self.table.kind,
                name: f.name.to_string(),
            }))
            .collect()
    }
}

impl PartialEq for ExtensionPlan {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.table, other.table) && self.mask == other.mask
    }
}

fn read_value<R: Read>(reader: &mut R, wire: WireType) -> io::Result<ExtValue> {
    Ok(match wire {
        WireType::U32  => ExtValue::U32(reader.read_u32::<LittleEndian>()?),
        WireType::F32  => ExtValue::F32(reader.read_f32::<LittleEndian>()?),
        WireType::Blob => ExtValue::Blob(read_length_prefixed(reader)?),
    })
}

/// Read a `u32`-length-prefixed blob without trusting the length for the
/// allocation size.
pub(crate) fn read_length_prefixed<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = reader.read_u32::<LittleEndian>()? as u64;
    let mut out = Vec::new();
    let got = reader.take(len).read_to_end(&mut out)?;
    if (got as u64) < len {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, format!(
            "length-prefixed blob claims {len} bytes, only {got} available"
        )));
    }
    Ok(out)
}

fn mismatch(field: &ExtensionField, value: &ExtValue) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, ExtensionError::TypeMismatch {
        name:     field.name.to_string(),
        expected: field.wire,
        actual:   value.wire_type(),
    })
}

// ── Engine ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct PlanCache {
    plans: HashMap<u32, Arc<ExtensionPlan>>,
    /// Insertion order, oldest first.
    order: VecDeque<u32>,
}

/// Derives plans for one table and keeps a bounded cache of them.
#[derive(Debug)]
pub struct ExtensionEngine {
    table:    &'static ExtensionTable,
    capacity: usize,
    cache:    Mutex<PlanCache>,
}

impl ExtensionEngine {
    pub fn new(table: &'static ExtensionTable) -> Self {
        Self::with_capacity(table, DEFAULT_PLAN_CAPACITY)
    }

    pub fn with_capacity(table: &'static ExtensionTable, capacity: usize) -> Self {
        Self { table, capacity: capacity.max(1), cache: Mutex::new(PlanCache::default()) }
    }

    pub fn table(&self) -> &'static ExtensionTable { self.table }
    pub fn capacity(&self) -> usize { self.capacity }

    /// The plan for `mask`, derived on first request.
    pub fn plan(&self, mask: u32) -> Arc<ExtensionPlan> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(plan) = cache.plans.get(&mask) {
            return Arc::clone(plan);
        }
        let plan = Arc::new(self.table.derive_plan(mask));
        if cache.plans.len() >= self.capacity {
            if let Some(oldest) = cache.order.pop_front() {
                cache.plans.remove(&oldest);
            }
        }
        cache.plans.insert(mask, Arc::clone(&plan));
        cache.order.push_back(mask);
        plan
    }

    /// Number of plans currently cached.
    pub fn cached(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).plans.len()
    }

    pub fn clear(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.plans.clear();
        cache.order.clear();
    }
}

/// The engine pair a sketch parses with: one for stroke masks, one for
/// control-point masks.
#[derive(Debug)]
pub struct Extensions {
    pub stroke:        ExtensionEngine,
    pub control_point: ExtensionEngine,
}

impl Extensions {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PLAN_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            stroke:        ExtensionEngine::with_capacity(&STROKE_EXTENSIONS, capacity),
            control_point: ExtensionEngine::with_capacity(&CONTROL_POINT_EXTENSIONS, capacity),
        }
    }
}

impl Default for Extensions {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn fields_follow_bit_order_not_table_order() {
        let plan = STROKE_EXTENSIONS.derive_plan(0x3);
        let names: Vec<&str> = plan.names().collect();
        assert_eq!(names, ["flags", "scale"]);
        assert_eq!(plan.fields()[0].wire, WireType::U32);
        assert_eq!(plan.fields()[1].wire, WireType::F32);
        assert_eq!(plan.index_of("scale"), Some(1));
        assert_eq!(plan.fixed_size(), Some(8));
    }

    #[test]
    fn reads_flags_then_scale() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&7u32.to_le_bytes());
        bytes.extend_from_slice(&1.5f32.to_le_bytes());
        let plan = STROKE_EXTENSIONS.derive_plan(0x3);
        let values = plan.read(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(values, vec![ExtValue::U32(7), ExtValue::F32(1.5)]);

        let mut out = Vec::new();
        plan.write(&mut out, &values).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn unknown_bits_get_synthesised_fields() {
        let low = STROKE_EXTENSIONS.field(0x10);
        assert_eq!(low.name, "stroke_ext_4");
        assert_eq!(low.wire, WireType::U32);

        let high = STROKE_EXTENSIONS.field(0x2_0000);
        assert_eq!(high.name, "stroke_ext_17");
        assert_eq!(high.wire, WireType::Blob);

        let cp_high = CONTROL_POINT_EXTENSIONS.field(0x8000_0000);
        assert_eq!(cp_high.name, "cp_ext_31");
        assert_eq!(cp_high.wire, WireType::U32);
    }

    #[test]
    fn blob_fields_are_read_individually() {
        let plan = STROKE_EXTENSIONS.derive_plan(0x1 | 0x1_0000);
        assert_eq!(plan.fixed_size(), None);

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(b"abcd");
        let values = plan.read(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(values, vec![ExtValue::U32(3), ExtValue::Blob(b"abcd".to_vec())]);

        let mut out = Vec::new();
        plan.write(&mut out, &values).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn truncated_blob_is_an_eof() {
        let plan = STROKE_EXTENSIONS.derive_plan(0x1_0000);
        let mut bytes = 100u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"short");
        let err = plan.read(&mut Cursor::new(&bytes)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn writer_rejects_wrong_value_types() {
        let plan = STROKE_EXTENSIONS.derive_plan(0x2);
        let err = plan.write(&mut Vec::new(), &[ExtValue::U32(1)]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        let err = plan.write(&mut Vec::new(), &[]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn lookup_resolves_registered_and_synthesised_names() {
        assert_eq!(STROKE_EXTENSIONS.lookup("scale").map(|f| f.bit), Some(0x2));
        assert_eq!(STROKE_EXTENSIONS.lookup("stroke_ext_5").map(|f| f.bit), Some(0x20));
        assert!(STROKE_EXTENSIONS.lookup("stroke_ext_0").is_none());
        assert!(STROKE_EXTENSIONS.lookup("stroke_ext_32").is_none());
        assert!(STROKE_EXTENSIONS.lookup("pressure").is_none());
        assert!(STROKE_EXTENSIONS.lookup("stroke_ext_05").is_none());
        assert!(STROKE_EXTENSIONS.lookup("stroke_ext_+5").is_none());
        assert!(CONTROL_POINT_EXTENSIONS.lookup("cp_ext_007").is_none());
        assert_eq!(CONTROL_POINT_EXTENSIONS.lookup("timestamp").map(|f| f.bit), Some(0x2));
    }

    #[test]
    fn reproject_moves_values_by_name() {
        let old = STROKE_EXTENSIONS.derive_plan(0x1);
        let new = STROKE_EXTENSIONS.derive_plan(0x3);
        let values = new
            .reproject(&old, vec![ExtValue::U32(9)], Some(("scale", ExtValue::F32(2.0))))
            .unwrap();
        assert_eq!(values, vec![ExtValue::U32(9), ExtValue::F32(2.0)]);

        let back = old.reproject(&new, values, None).unwrap();
        assert_eq!(back, vec![ExtValue::U32(9)]);

        let err = new.reproject(&old, vec![ExtValue::U32(9)], None).unwrap_err();
        assert!(matches!(err, ExtensionError::Absent { .. }));
    }

    #[test]
    fn engine_caches_and_evicts_oldest() {
        let engine = ExtensionEngine::with_capacity(&STROKE_EXTENSIONS, 2);
        let a = engine.plan(0x1);
        let a_again = engine.plan(0x1);
        assert!(Arc::ptr_eq(&a, &a_again));

        engine.plan(0x2);
        engine.plan(0x3);
        assert_eq!(engine.cached(), 2);

        let a_rederived = engine.plan(0x1);
        assert!(!Arc::ptr_eq(&a, &a_rederived));
        assert_eq!(*a, *a_rederived);
    }
}
