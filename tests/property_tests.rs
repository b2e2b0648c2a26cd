//! Property-based tests for the extension engine and the sketch codec.

use proptest::prelude::*;
use std::sync::Arc;

use tilt::extension::{ExtValue, Extensions, WireType, STROKE_EXTENSIONS};
use tilt::{ControlPoint, Sketch, Stroke};

/// A value of the given wire type.
fn value_for(wire: WireType) -> BoxedStrategy<ExtValue> {
    match wire {
        WireType::U32  => any::<u32>().prop_map(ExtValue::U32).boxed(),
        WireType::F32  => (-1.0e6f32..1.0e6).prop_map(ExtValue::F32).boxed(),
        WireType::Blob => prop::collection::vec(any::<u8>(), 0..16).prop_map(ExtValue::Blob).boxed(),
    }
}

/// A stroke mask with its matching extension values.
fn stroke_extensions() -> impl Strategy<Value = (u32, Vec<ExtValue>)> {
    any::<u32>().prop_flat_map(|mask| {
        let values: Vec<_> = STROKE_EXTENSIONS
            .derive_plan(mask)
            .fields()
            .iter()
            .map(|f| value_for(f.wire))
            .collect();
        (Just(mask), values)
    })
}

fn control_point() -> impl Strategy<Value = ([f32; 3], [f32; 4], f32, u32)> {
    (
        prop::array::uniform3(-100.0f32..100.0),
        prop::array::uniform4(-1.0f32..1.0),
        0.0f32..1.0,
        any::<u32>(),
    )
}

fn build_sketch(
    extensions: &Arc<Extensions>,
    strokes: &[((u32, Vec<ExtValue>), Vec<([f32; 3], [f32; 4], f32, u32)>)],
) -> Sketch {
    let mut sketch = Sketch::with_extensions([1, 2, 3], Arc::clone(extensions));
    for (i, ((mask, values), points)) in strokes.iter().enumerate() {
        let mut stroke = sketch.new_stroke(i as i32, [0.5; 4], 0.25);
        let plan = extensions.stroke.plan(*mask);
        for (field, value) in plan.fields().iter().zip(values) {
            stroke.set_extension(&field.name, value.clone()).unwrap();
        }
        stroke.add_cp_extension("pressure", 0.0f32).unwrap();
        stroke.add_cp_extension("timestamp", 0u32).unwrap();
        let cps = stroke.controlpoints().unwrap();
        for (position, orientation, pressure, timestamp) in points {
            let mut cp = ControlPoint::new(*position, *orientation);
            cp.extension = vec![ExtValue::F32(*pressure), ExtValue::U32(*timestamp)];
            cps.push(cp);
        }
        sketch.strokes.push(stroke);
    }
    sketch
}

proptest! {
    #[test]
    fn plan_derivation_is_pure(mask in any::<u32>()) {
        let a = STROKE_EXTENSIONS.derive_plan(mask);
        let b = STROKE_EXTENSIONS.derive_plan(mask);
        prop_assert_eq!(a.len(), mask.count_ones() as usize);
        let names_a: Vec<_> = a.names().collect();
        let names_b: Vec<_> = b.names().collect();
        prop_assert_eq!(names_a, names_b);
        let bits: Vec<_> = a.fields().iter().map(|f| f.bit).collect();
        prop_assert!(bits.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn engine_returns_the_same_plan_per_mask(mask in any::<u32>()) {
        let extensions = Extensions::new();
        let first = extensions.stroke.plan(mask);
        let second = extensions.stroke.plan(mask);
        prop_assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn add_then_remove_restores_the_stroke((mask, values) in stroke_extensions(), bit in 0u32..32) {
        let extensions = Arc::new(Extensions::new());
        let mut stroke = Stroke::new(&extensions, 0, [1.0; 4], 1.0);
        let plan = extensions.stroke.plan(mask);
        for (field, value) in plan.fields().iter().zip(&values) {
            stroke.set_extension(&field.name, value.clone()).unwrap();
        }
        let before_mask = stroke.stroke_mask();
        let before_values = stroke.extension().to_vec();

        let field = STROKE_EXTENSIONS.field(1 << bit);
        prop_assume!(!stroke.has_extension(&field.name));
        let added = match field.wire {
            WireType::U32  => ExtValue::U32(7),
            WireType::F32  => ExtValue::F32(7.0),
            WireType::Blob => ExtValue::Blob(vec![7]),
        };
        stroke.set_extension(&field.name, added.clone()).unwrap();
        prop_assert_eq!(stroke.stroke_mask(), before_mask | (1 << bit));
        prop_assert_eq!(stroke.get_extension(&field.name).unwrap(), &added);

        prop_assert_eq!(stroke.remove_extension(&field.name).unwrap(), added);
        prop_assert_eq!(stroke.stroke_mask(), before_mask);
        prop_assert_eq!(stroke.extension(), &before_values[..]);
    }

    #[test]
    fn reserialization_is_stable(
        strokes in prop::collection::vec(
            (stroke_extensions(), prop::collection::vec(control_point(), 0..8)),
            0..6,
        )
    ) {
        let extensions = Arc::new(Extensions::new());
        let bytes = build_sketch(&extensions, &strokes).to_bytes().unwrap();

        let parsed = Sketch::from_bytes(&bytes).unwrap();
        prop_assert_eq!(parsed.strokes.len(), strokes.len());
        prop_assert_eq!(parsed.to_bytes().unwrap(), bytes.clone());

        let mut decoded = Sketch::from_bytes(&bytes).unwrap();
        for stroke in &mut decoded.strokes {
            stroke.controlpoints().unwrap();
        }
        prop_assert_eq!(decoded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = Sketch::from_bytes(&bytes);
    }
}
