//! Stroke and control point records of the `data.sketch` stream.
//!
//! # Stroke layout (little-endian)
//! `i32 brush_idx`, `f32×4 color`, `f32 size`, `u32 stroke_mask`,
//! `u32 cp_mask`, stroke extension fields, `i32 cp_count`, then `cp_count`
//! control points.
//!
//! # Control point layout
//! `f32×3 position`, `f32×4 orientation`, control point extension fields.
//!
//! Control points are kept as raw bytes until first accessed through
//! [`Stroke::controlpoints`]; a stroke that is never inspected is written
//! back from those same bytes.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;

use crate::extension::{ExtValue, ExtensionError, ExtensionPlan, Extensions, WireType};
use crate::sketch::SketchError;

/// Exclusive upper bound on a stroke's control point count.
pub const MAX_CONTROL_POINTS: i32 = 10_000;
/// Position (3 × f32) plus orientation (4 × f32).
pub const CONTROL_POINT_FIXED_SIZE: usize = 28;

// ── ControlPoint ─────────────────────────────────────────────────────────────

/// One sample along a stroke. Extension values are laid out by the owning
/// stroke's control-point plan.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlPoint {
    /// Decimeters.
    pub position:    [f32; 3],
    /// Controller orientation quaternion (x, y, z, w).
    pub orientation: [f32; 4],
    pub extension:   Vec<ExtValue>,
}

impl ControlPoint {
    pub fn new(position: [f32; 3], orientation: [f32; 4]) -> Self {
        Self { position, orientation, extension: Vec::new() }
    }

    pub fn read<R: Read>(reader: &mut R, plan: &ExtensionPlan) -> io::Result<Self> {
        let mut position = [0f32; 3];
        let mut orientation = [0f32; 4];
        reader.read_f32_into::<LittleEndian>(&mut position)?;
        reader.read_f32_into::<LittleEndian>(&mut orientation)?;
        let extension = plan.read(reader)?;
        Ok(Self { position, orientation, extension })
    }

    pub fn write<W: Write>(&self, writer: &mut W, plan: &ExtensionPlan) -> io::Result<()> {
        for v in self.position.iter().chain(&self.orientation) {
            writer.write_f32::<LittleEndian>(*v)?;
        }
        plan.write(writer, &self.extension)
    }
}

/// Control points as they came off the wire, not yet decoded.
#[derive(Debug, Clone)]
struct RawControlPoints {
    count: usize,
    bytes: Vec<u8>,
}

impl RawControlPoints {
    fn parse(&self, plan: &ExtensionPlan) -> io::Result<Vec<ControlPoint>> {
        let mut cursor = Cursor::new(self.bytes.as_slice());
        (0..self.count).map(|_| ControlPoint::read(&mut cursor, plan)).collect()
    }
}

// ── Stroke ───────────────────────────────────────────────────────────────────

/// One continuous brush gesture.
///
/// `Clone` is deep: extension values and control points are copied, the
/// immutable extension plans are shared.
#[derive(Debug, Clone)]
pub struct Stroke {
    /// Index into the metadata `BrushIndex` list.
    pub brush_idx:   i32,
    /// RGBA, each in `[0, 1]`.
    pub brush_color: [f32; 4],
    /// Base size in decimeters; multiply by [`Stroke::scale`] when present.
    pub brush_size:  f32,

    extensions:    Arc<Extensions>,
    stroke_plan:   Arc<ExtensionPlan>,
    cp_plan:       Arc<ExtensionPlan>,
    extension:     Vec<ExtValue>,
    controlpoints: Vec<ControlPoint>,
    /// Set until the control points are first decoded.
    pending:       Option<RawControlPoints>,
}

impl Stroke {
    /// A stroke with no extensions and no control points.
    pub fn new(extensions: &Arc<Extensions>, brush_idx: i32, brush_color: [f32; 4], brush_size: f32) -> Self {
        Self {
            brush_idx,
            brush_color,
            brush_size,
            stroke_plan:   extensions.stroke.plan(0),
            cp_plan:       extensions.control_point.plan(0),
            extensions:    Arc::clone(extensions),
            extension:     Vec::new(),
            controlpoints: Vec::new(),
            pending:       None,
        }
    }

    pub fn read<R: Read>(reader: &mut R, extensions: &Arc<Extensions>) -> Result<Self, SketchError> {
        let brush_idx = reader.read_i32::<LittleEndian>()?;
        let mut brush_color = [0f32; 4];
        reader.read_f32_into::<LittleEndian>(&mut brush_color)?;
        let brush_size = reader.read_f32::<LittleEndian>()?;
        let stroke_mask = reader.read_u32::<LittleEndian>()?;
        let cp_mask = reader.read_u32::<LittleEndian>()?;

        let stroke_plan = extensions.stroke.plan(stroke_mask);
        let extension = stroke_plan.read(reader)?;
        let cp_plan = extensions.control_point.plan(cp_mask);

        let count = reader.read_i32::<LittleEndian>()?;
        if !(0..MAX_CONTROL_POINTS).contains(&count) {
            return Err(SketchError::BadControlPointCount(count));
        }
        let count = count as usize;

        let (controlpoints, pending) = match cp_plan.fixed_size() {
            Some(ext_size) => {
                let mut bytes = vec![0u8; count * (CONTROL_POINT_FIXED_SIZE + ext_size)];
                reader.read_exact(&mut bytes)?;
                (Vec::new(), Some(RawControlPoints { count, bytes }))
            }
            // Variable-width records cannot be sliced without decoding them.
            None => {
                let cps = (0..count)
                    .map(|_| ControlPoint::read(reader, &cp_plan))
                    .collect::<io::Result<Vec<_>>>()?;
                (cps, None)
            }
        };

        Ok(Self {
            brush_idx,
            brush_color,
            brush_size,
            extensions: Arc::clone(extensions),
            stroke_plan,
            cp_plan,
            extension,
            controlpoints,
            pending,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let count = self.control_point_count();
        if count >= MAX_CONTROL_POINTS as usize {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, format!(
                "stroke has {count} control points; readers reject {MAX_CONTROL_POINTS} or more"
            )));
        }

        writer.write_i32::<LittleEndian>(self.brush_idx)?;
        for c in &self.brush_color {
            writer.write_f32::<LittleEndian>(*c)?;
        }
        writer.write_f32::<LittleEndian>(self.brush_size)?;
        writer.write_u32::<LittleEndian>(self.stroke_plan.mask())?;
        writer.write_u32::<LittleEndian>(self.cp_plan.mask())?;
        self.stroke_plan.write(writer, &self.extension)?;

        writer.write_i32::<LittleEndian>(count as i32)?;
        match &self.pending {
            Some(raw) => writer.write_all(&raw.bytes),
            None => {
                for cp in &self.controlpoints {
                    cp.write(writer, &self.cp_plan)?;
                }
                Ok(())
            }
        }
    }

    /// Copy everything except the control points. Extension values are
    /// copied; plans are shared.
    pub fn shallow_clone(&self) -> Self {
        Self {
            brush_idx:     self.brush_idx,
            brush_color:   self.brush_color,
            brush_size:    self.brush_size,
            extensions:    Arc::clone(&self.extensions),
            stroke_plan:   Arc::clone(&self.stroke_plan),
            cp_plan:       Arc::clone(&self.cp_plan),
            extension:     self.extension.clone(),
            controlpoints: Vec::new(),
            pending:       None,
        }
    }

    // ── Control points ───────────────────────────────────────────────────────

    pub fn control_point_count(&self) -> usize {
        match &self.pending {
            Some(raw) => raw.count,
            None      => self.controlpoints.len(),
        }
    }

    /// Whether the control points have been decoded yet.
    pub fn controlpoints_loaded(&self) -> bool {
        self.pending.is_none()
    }

    /// The control points, decoding them on first access.
    pub fn controlpoints(&mut self) -> Result<&mut Vec<ControlPoint>, SketchError> {
        if let Some(raw) = self.pending.take() {
            match raw.parse(&self.cp_plan) {
                Ok(cps) => self.controlpoints = cps,
                Err(e) => {
                    self.pending = Some(raw);
                    return Err(e.into());
                }
            }
        }
        Ok(&mut self.controlpoints)
    }

    // ── Stroke extensions ────────────────────────────────────────────────────

    pub fn stroke_mask(&self) -> u32 { self.stroke_plan.mask() }
    pub fn cp_mask(&self) -> u32 { self.cp_plan.mask() }
    pub fn stroke_plan(&self) -> &Arc<ExtensionPlan> { &self.stroke_plan }
    pub fn cp_plan(&self) -> &Arc<ExtensionPlan> { &self.cp_plan }

    /// Stroke extension values, in the stroke plan's field order.
    pub fn extension(&self) -> &[ExtValue] { &self.extension }

    pub fn has_extension(&self, name: &str) -> bool {
        self.stroke_plan.contains(name)
    }

    pub fn get_extension(&self, name: &str) -> Result<&ExtValue, ExtensionError> {
        self.stroke_plan.index_of(name)
            .and_then(|idx| self.extension.get(idx))
            .ok_or_else(|| absent(&self.stroke_plan, name))
    }

    /// Set a stroke extension, adding it to the mask if it is not present.
    pub fn set_extension(&mut self, name: &str, value: impl Into<ExtValue>) -> Result<(), ExtensionError> {
        let value = value.into();
        let table = self.stroke_plan.table();
        let field = table.lookup(name).ok_or_else(|| ExtensionError::UnknownName {
            kind: table.kind,
            name: name.to_owned(),
        })?;
        check_wire(&field.name, field.wire, &value)?;

        if let Some(idx) = self.stroke_plan.index_of(&field.name) {
            self.extension[idx] = value;
            return Ok(());
        }
        let plan = self.extensions.stroke.plan(self.stroke_plan.mask() | field.bit);
        self.extension = plan.reproject(&self.stroke_plan, self.extension.clone(), Some((&*field.name, value)))?;
        self.stroke_plan = plan;
        Ok(())
    }

    /// Remove a stroke extension, returning its value.
    pub fn remove_extension(&mut self, name: &str) -> Result<ExtValue, ExtensionError> {
        let idx = self.stroke_plan.index_of(name)
            .ok_or_else(|| absent(&self.stroke_plan, name))?;
        let bit = self.stroke_plan.fields()[idx].bit;
        let removed = self.extension.get(idx).cloned()
            .ok_or_else(|| absent(&self.stroke_plan, name))?;

        let plan = self.extensions.stroke.plan(self.stroke_plan.mask() & !bit);
        self.extension = plan.reproject(&self.stroke_plan, self.extension.clone(), None)?;
        self.stroke_plan = plan;
        Ok(removed)
    }

    pub fn flags(&self) -> Option<u32> {
        self.get_extension("flags").ok().and_then(ExtValue::as_u32)
    }

    pub fn set_flags(&mut self, flags: u32) -> Result<(), ExtensionError> {
        self.set_extension("flags", flags)
    }

    /// Size of the painter when the stroke was made; multiplies `brush_size`.
    pub fn scale(&self) -> Option<f32> {
        self.get_extension("scale").ok().and_then(ExtValue::as_f32)
    }

    pub fn set_scale(&mut self, scale: f32) -> Result<(), ExtensionError> {
        self.set_extension("scale", scale)
    }

    // ── Control point extensions ─────────────────────────────────────────────

    /// All control points of a stroke carry the same extensions.
    pub fn has_cp_extension(&self, name: &str) -> bool {
        self.cp_plan.contains(name)
    }

    pub fn get_cp_extension<'a>(&self, cp: &'a ControlPoint, name: &str) -> Result<&'a ExtValue, ExtensionError> {
        self.cp_plan.index_of(name)
            .and_then(|idx| cp.extension.get(idx))
            .ok_or_else(|| absent(&self.cp_plan, name))
    }

    /// Overwrite an extension value the control points already carry.
    pub fn set_cp_extension(&self, cp: &mut ControlPoint, name: &str, value: impl Into<ExtValue>) -> Result<(), ExtensionError> {
        let value = value.into();
        let idx = self.cp_plan.index_of(name)
            .ok_or_else(|| absent(&self.cp_plan, name))?;
        check_wire(name, self.cp_plan.fields()[idx].wire, &value)?;
        match cp.extension.get_mut(idx) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(absent(&self.cp_plan, name)),
        }
    }

    /// Add a control point extension to every control point, initialised to
    /// `value`. Overwrites the values if the extension is already present.
    pub fn add_cp_extension(&mut self, name: &str, value: impl Into<ExtValue>) -> Result<(), SketchError> {
        let value = value.into();
        let table = self.cp_plan.table();
        let field = table.lookup(name).ok_or_else(|| ExtensionError::UnknownName {
            kind: table.kind,
            name: name.to_owned(),
        })?;
        check_wire(&field.name, field.wire, &value)?;

        let old_plan = Arc::clone(&self.cp_plan);
        let new_plan = self.extensions.control_point.plan(old_plan.mask() | field.bit);
        self.reproject_controlpoints(&old_plan, &new_plan, Some((&*field.name, value)))
    }

    /// Drop a control point extension from every control point.
    pub fn remove_cp_extension(&mut self, name: &str) -> Result<(), SketchError> {
        let idx = self.cp_plan.index_of(name)
            .ok_or_else(|| absent(&self.cp_plan, name))?;
        let old_plan = Arc::clone(&self.cp_plan);
        let new_plan = self.extensions.control_point.plan(old_plan.mask() & !old_plan.fields()[idx].bit);
        self.reproject_controlpoints(&old_plan, &new_plan, None)
    }

    /// All-or-nothing: no control point changes unless every one re-projects.
    fn reproject_controlpoints(
        &mut self,
        old_plan: &ExtensionPlan,
        new_plan: &Arc<ExtensionPlan>,
        added:    Option<(&str, ExtValue)>,
    ) -> Result<(), SketchError> {
        let projected = self.controlpoints()?
            .iter()
            .map(|cp| new_plan.reproject(old_plan, cp.extension.clone(), added.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        for (cp, extension) in self.controlpoints.iter_mut().zip(projected) {
            cp.extension = extension;
        }
        self.cp_plan = Arc::clone(new_plan);
        Ok(())
    }

    /// Trigger pressure in `[0, 1]`.
    pub fn pressure(&self, cp: &ControlPoint) -> Option<f32> {
        self.get_cp_extension(cp, "pressure").ok().and_then(ExtValue::as_f32)
    }

    /// Milliseconds.
    pub fn timestamp(&self, cp: &ControlPoint) -> Option<u32> {
        self.get_cp_extension(cp, "timestamp").ok().and_then(ExtValue::as_u32)
    }
}

fn absent(plan: &ExtensionPlan, name: &str) -> ExtensionError {
    ExtensionError::Absent { kind: plan.table().kind, name: name.to_owned() }
}

fn check_wire(name: &str, expected: WireType, value: &ExtValue) -> Result<(), ExtensionError> {
    if value.wire_type() != expected {
        return Err(ExtensionError::TypeMismatch {
            name: name.to_owned(),
            expected,
            actual: value.wire_type(),
        });
    }
    Ok(())
}
