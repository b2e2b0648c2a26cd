//! The `metadata.json` member: validation, typed views and canonical
//! persistence.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const BRUSH_INDEX:        &str = "BrushIndex";
pub const ENVIRONMENT_PRESET: &str = "EnvironmentPreset";
pub const AUTHORS:            &str = "Authors";

pub const THUMBNAIL_TRANSFORM: &str = "ThumbnailCameraTransformInRoomSpace";
pub const SCENE_TRANSFORM:     &str = "SceneTransformInRoomSpace";
pub const CANVAS_TRANSFORM:    &str = "CanvasTransformInSceneSpace";
pub const TRANSFORM_KEYS: [&str; 3] = [THUMBNAIL_TRANSFORM, SCENE_TRANSFORM, CANVAS_TRANSFORM];

const ROOT: &str = "metadata";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("malformed metadata: missing {0}")]
    MissingKey(String),
    #[error("malformed metadata: {reason}: {path}")]
    Malformed { path: String, reason: String },
}

impl MetadataError {
    pub fn is_missing_key(&self) -> bool {
        matches!(self, MetadataError::MissingKey(_))
    }

    fn malformed(path: &str, reason: impl Into<String>) -> Self {
        MetadataError::Malformed { path: path.to_owned(), reason: reason.into() }
    }
}

// ── Validation ───────────────────────────────────────────────────────────────

/// Check the fields this crate interprets. Unknown keys are left alone.
pub fn validate_metadata(value: &Value) -> Result<(), MetadataError> {
    for key in TRANSFORM_KEYS {
        match lookup(value, ROOT, key) {
            Ok((path, xf))               => check_transform(&path, xf)?,
            Err(e) if e.is_missing_key() => {}
            Err(e)                       => return Err(e),
        }
    }

    let (path, brushes) = lookup(value, ROOT, BRUSH_INDEX)?;
    for (i, guid) in check_array(&path, brushes, None)?.iter().enumerate() {
        check_guid(&format!("{path}[{i}]"), guid)?;
    }

    let (path, preset) = lookup(value, ROOT, ENVIRONMENT_PRESET)?;
    check_guid(&path, preset)?;

    if let Ok((path, authors)) = lookup(value, ROOT, AUTHORS) {
        for (i, author) in check_array(&path, authors, None)?.iter().enumerate() {
            if !author.is_string() {
                return Err(MetadataError::malformed(&format!("{path}[{i}]"), "not string"));
            }
        }
    }
    Ok(())
}

fn lookup<'a>(parent: &'a Value, path: &str, key: &str) -> Result<(String, &'a Value), MetadataError> {
    let child_path = format!("{path}.{key}");
    let object = parent.as_object().ok_or_else(|| MetadataError::malformed(path, "not object"))?;
    match object.get(key) {
        Some(v) => Ok((child_path, v)),
        None    => Err(MetadataError::MissingKey(child_path)),
    }
}

fn check_array<'a>(path: &str, value: &'a Value, len: Option<usize>) -> Result<&'a [Value], MetadataError> {
    let items = value.as_array().ok_or_else(|| MetadataError::malformed(path, "not array"))?;
    if let Some(len) = len {
        if items.len() != len {
            return Err(MetadataError::malformed(path, format!("not length {len}")));
        }
    }
    Ok(items)
}

fn check_numbers(path: &str, value: &Value, len: usize) -> Result<(), MetadataError> {
    for (i, item) in check_array(path, value, Some(len))?.iter().enumerate() {
        if !item.is_number() {
            return Err(MetadataError::malformed(&format!("{path}[{i}]"), "not number"));
        }
    }
    Ok(())
}

fn check_guid(path: &str, value: &Value) -> Result<(), MetadataError> {
    let text = value.as_str().ok_or_else(|| MetadataError::malformed(path, "not UUID string"))?;
    Uuid::parse_str(text)
        .map(|_| ())
        .map_err(|e| MetadataError::malformed(path, format!("not UUID ({e})")))
}

/// Object form `{position, orientation, scale?}` or array form
/// `[position, orientation, scale?]`.
fn check_transform(path: &str, value: &Value) -> Result<(), MetadataError> {
    if let Some(items) = value.as_array() {
        if !(2..=3).contains(&items.len()) {
            return Err(MetadataError::malformed(path, "not length 2 or 3"));
        }
        check_numbers(&format!("{path}[0]"), &items[0], 3)?;
        check_numbers(&format!("{path}[1]"), &items[1], 4)?;
        if let Some(scale) = items.get(2) {
            if !scale.is_number() {
                return Err(MetadataError::malformed(&format!("{path}[2]"), "not number"));
            }
        }
        return Ok(());
    }

    let (p, position) = lookup(value, path, "position")?;
    check_numbers(&p, position, 3)?;
    let (p, orientation) = lookup(value, path, "orientation")?;
    check_numbers(&p, orientation, 4)?;
    match lookup(value, path, "scale") {
        Ok((p, scale)) if !scale.is_number() => Err(MetadataError::malformed(&p, "not number")),
        _ => Ok(()),
    }
}

// ── Typed views ──────────────────────────────────────────────────────────────

/// A rigid transform with optional uniform scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "TransformRepr")]
pub struct Transform {
    pub position:    [f32; 3],
    /// Quaternion (x, y, z, w).
    pub orientation: [f32; 4],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale:       Option<f32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TransformRepr {
    Object {
        position:    [f32; 3],
        orientation: [f32; 4],
        #[serde(default)]
        scale:       Option<f32>,
    },
    Scaled([f32; 3], [f32; 4], f32),
    Rigid([f32; 3], [f32; 4]),
}

impl From<TransformRepr> for Transform {
    fn from(repr: TransformRepr) -> Self {
        match repr {
            TransformRepr::Object { position, orientation, scale } => Self { position, orientation, scale },
            TransformRepr::Scaled(position, orientation, scale)    => Self { position, orientation, scale: Some(scale) },
            TransformRepr::Rigid(position, orientation)            => Self { position, orientation, scale: None },
        }
    }
}

// ── Store ────────────────────────────────────────────────────────────────────

/// Parsed metadata as loaded from a container, plus the validation failure
/// (if any) seen at load time.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    value:   Value,
    warning: Option<MetadataError>,
}

impl MetadataStore {
    /// Parse `metadata.json`. Invalid JSON fails; failed validation is only
    /// logged and remembered.
    pub fn load(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_slice(bytes)?;
        let warning = validate_metadata(&value).err();
        if let Some(e) = &warning {
            warn!(error = %e, "metadata failed validation");
        }
        Ok(Self { value, warning })
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// The validation error recorded at load time.
    pub fn warning(&self) -> Option<&MetadataError> {
        self.warning.as_ref()
    }

    pub fn validate(&self) -> Result<(), MetadataError> {
        validate_metadata(&self.value)
    }

    /// Validate `candidate` and, if it differs from the stored value, return
    /// the JSON to persist. `None` means nothing changed.
    pub fn stage(&self, candidate: &Value) -> Result<Option<String>, MetadataError> {
        validate_metadata(candidate)?;
        if *candidate == self.value {
            return Ok(None);
        }
        to_canonical_json(candidate)
            .map(Some)
            .map_err(|e| MetadataError::malformed(ROOT, e.to_string()))
    }

    /// Replace the stored value with one that has been staged and persisted.
    pub fn install(&mut self, value: Value) {
        self.value = value;
        self.warning = None;
    }

    pub fn brush_guids(&self) -> Result<Vec<Uuid>, MetadataError> {
        let (path, brushes) = lookup(&self.value, ROOT, BRUSH_INDEX)?;
        check_array(&path, brushes, None)?
            .iter()
            .enumerate()
            .map(|(i, v)| parse_guid(&format!("{path}[{i}]"), v))
            .collect()
    }

    pub fn environment_preset(&self) -> Result<Uuid, MetadataError> {
        let (path, preset) = lookup(&self.value, ROOT, ENVIRONMENT_PRESET)?;
        parse_guid(&path, preset)
    }

    /// Empty when the key is absent.
    pub fn authors(&self) -> Result<Vec<String>, MetadataError> {
        let (path, authors) = match lookup(&self.value, ROOT, AUTHORS) {
            Ok(found)                    => found,
            Err(e) if e.is_missing_key() => return Ok(Vec::new()),
            Err(e)                       => return Err(e),
        };
        serde_json::from_value(authors.clone()).map_err(|e| MetadataError::malformed(&path, e.to_string()))
    }

    /// The transform stored under `key` (one of [`TRANSFORM_KEYS`]), if any.
    pub fn transform(&self, key: &str) -> Result<Option<Transform>, MetadataError> {
        let (path, value) = match lookup(&self.value, ROOT, key) {
            Ok(found)                    => found,
            Err(e) if e.is_missing_key() => return Ok(None),
            Err(e)                       => return Err(e),
        };
        serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| MetadataError::malformed(&path, e.to_string()))
    }
}

fn parse_guid(path: &str, value: &Value) -> Result<Uuid, MetadataError> {
    let text = value.as_str().ok_or_else(|| MetadataError::malformed(path, "not UUID string"))?;
    Uuid::parse_str(text).map_err(|e| MetadataError::malformed(path, format!("not UUID ({e})")))
}

// ── Persistence ──────────────────────────────────────────────────────────────

/// Two-space indented, key-sorted JSON with every non-ASCII character
/// written as a `\uXXXX` escape.
pub fn to_canonical_json(value: &Value) -> Result<String, serde_json::Error> {
    let pretty = serde_json::to_string_pretty(value)?;
    if pretty.is_ascii() {
        return Ok(pretty);
    }
    let mut out = String::with_capacity(pretty.len() + 16);
    let mut units = [0u16; 2];
    for c in pretty.chars() {
        if c.is_ascii() {
            out.push(c);
            continue;
        }
        for unit in c.encode_utf16(&mut units) {
            out.push_str(&format!("\\u{unit:04x}"));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid() -> Value {
        json!({
            "BrushIndex": ["89d104cd-d012-426b-b5b3-bbaee63ac43c", "{0e87b49c-6546-3a34-3a44-8a556d7d6c3e}"],
            "EnvironmentPreset": "ab080599-e465-4a6d-8587-43bf495af68b",
            "SceneTransformInRoomSpace": [[0.0, 1.0, 2.0], [0.0, 0.0, 0.0, 1.0], 2.5],
            "ThumbnailCameraTransformInRoomSpace": {
                "position": [1, 2, 3],
                "orientation": [0, 0, 0, 1]
            },
            "SchemaVersion": 2
        })
    }

    #[test]
    fn accepts_both_transform_forms() {
        validate_metadata(&valid()).unwrap();
        let store = MetadataStore::load(valid().to_string().as_bytes()).unwrap();
        assert!(store.warning().is_none());

        let scene = store.transform(SCENE_TRANSFORM).unwrap().unwrap();
        assert_eq!(scene.position, [0.0, 1.0, 2.0]);
        assert_eq!(scene.scale, Some(2.5));
        let thumb = store.transform(THUMBNAIL_TRANSFORM).unwrap().unwrap();
        assert_eq!(thumb.orientation, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(thumb.scale, None);
        assert_eq!(store.transform(CANVAS_TRANSFORM).unwrap(), None);
    }

    #[test]
    fn reports_missing_and_malformed_fields() {
        let mut meta = valid();
        meta.as_object_mut().unwrap().remove(BRUSH_INDEX);
        let err = validate_metadata(&meta).unwrap_err();
        assert_eq!(err, MetadataError::MissingKey("metadata.BrushIndex".into()));

        let mut meta = valid();
        meta[ENVIRONMENT_PRESET] = json!("not-a-guid");
        let err = validate_metadata(&meta).unwrap_err();
        assert!(!err.is_missing_key());
        assert!(err.to_string().contains("metadata.EnvironmentPreset"));

        let mut meta = valid();
        meta[CANVAS_TRANSFORM] = json!({"position": [0, 0], "orientation": [0, 0, 0, 1]});
        assert!(matches!(
            validate_metadata(&meta),
            Err(MetadataError::Malformed { path, .. }) if path == "metadata.CanvasTransformInSceneSpace.position"
        ));

        let mut meta = valid();
        meta[AUTHORS] = json!(["someone", 7]);
        assert!(validate_metadata(&meta).is_err());
    }

    #[test]
    fn load_keeps_invalid_metadata_for_inspection() {
        let mut meta = valid();
        meta[ENVIRONMENT_PRESET] = json!("not-a-guid");
        let store = MetadataStore::load(meta.to_string().as_bytes()).unwrap();
        assert!(store.warning().is_some());
        assert_eq!(store.value()[ENVIRONMENT_PRESET], "not-a-guid");
        assert!(store.environment_preset().is_err());

        assert!(MetadataStore::load(b"{\"BrushIndex\": [").is_err());
    }

    #[test]
    fn stage_skips_unchanged_and_rejects_invalid() {
        let store = MetadataStore::load(valid().to_string().as_bytes()).unwrap();
        assert_eq!(store.stage(&valid()).unwrap(), None);

        let mut changed = valid();
        changed[AUTHORS] = json!(["Zoë"]);
        let json = store.stage(&changed).unwrap().unwrap();
        assert!(json.is_ascii());
        assert!(json.contains(r#""Authors": ["#));

        let mut broken = valid();
        broken[BRUSH_INDEX] = json!("nope");
        assert!(store.stage(&broken).is_err());
    }

    #[test]
    fn canonical_json_is_sorted_indented_and_ascii() {
        let value = json!({"b": "é😀", "a": [1, {}]});
        let text = to_canonical_json(&value).unwrap();
        assert_eq!(
            text,
            "{\n  \"a\": [\n    1,\n    {}\n  ],\n  \"b\": \"\\u00e9\\ud83d\\ude00\"\n}"
        );
    }

    #[test]
    fn typed_helpers() {
        let store = MetadataStore::load(valid().to_string().as_bytes()).unwrap();
        let guids = store.brush_guids().unwrap();
        assert_eq!(guids.len(), 2);
        assert_eq!(guids[1].to_string(), "0e87b49c-6546-3a34-3a44-8a556d7d6c3e");
        assert_eq!(store.authors().unwrap(), Vec::<String>::new());
    }
}
