//! Object model: canvas objects, shape variants, advisory leases, and the
//! sparse patch type used for field-level updates.
//!
//! DESIGN
//! ======
//! A `CanvasObject` is shared metadata plus a closed `Shape` sum type. The
//! shape is flattened into the same JSON document so the backend sees one
//! flat map per object, keyed by `id`. Operations that only make sense for
//! some variants (width/height vs radius vs points) are exhaustive matches,
//! never runtime "has field" probes.
//!
//! `ObjectPatch` is the unit of a field-level write: only present fields are
//! applied locally and only applied fields travel to the backend, so two
//! editors touching different fields of one object do not clobber each other.

#[cfg(test)]
#[path = "object_test.rs"]
mod object_test;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCode;

/// Unique identifier for a canvas object (UUID text).
pub type ObjectId = String;

/// Generate a fresh object id.
#[must_use]
pub fn new_object_id() -> ObjectId {
    Uuid::new_v4().to_string()
}

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

/// Normalize a rotation in degrees into `[0, 360)`.
#[must_use]
pub fn normalize_rotation(degrees: f64) -> f64 {
    let r = degrees.rem_euclid(360.0);
    if r >= 360.0 { 0.0 } else { r }
}

// =============================================================================
// LEASE
// =============================================================================

/// What the lease holder is doing with the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseKind {
    Select,
    Edit,
}

/// Short-lived advisory claim on an object. Never blocks anyone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub user_id: String,
    pub user_name: String,
    pub user_color: String,
    pub kind: LeaseKind,
    /// Wall-clock expiry in milliseconds since Unix epoch.
    pub expires_at: i64,
}

impl Lease {
    #[must_use]
    pub fn is_active_at(&self, now: i64) -> bool {
        now < self.expires_at
    }

    #[must_use]
    pub fn is_foreign(&self, user_id: &str) -> bool {
        self.user_id != user_id
    }

    /// True when someone other than `user_id` holds an unexpired lease.
    #[must_use]
    pub fn is_foreign_active_at(&self, user_id: &str, now: i64) -> bool {
        self.is_foreign(user_id) && self.is_active_at(now)
    }
}

/// Who is acting in this session. Stamped onto every lease it writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
    pub user_name: String,
    pub user_color: String,
}

impl UserIdentity {
    #[must_use]
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>, user_color: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), user_name: user_name.into(), user_color: user_color.into() }
    }

    #[must_use]
    pub fn lease(&self, kind: LeaseKind, expires_at: i64) -> Lease {
        Lease {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            user_color: self.user_color.clone(),
            kind,
            expires_at,
        }
    }
}

// =============================================================================
// PROVENANCE
// =============================================================================

/// Set only when the mutating actor is the automated command subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiProvenance {
    pub session_id: String,
    pub command: String,
    pub operation_id: String,
}

// =============================================================================
// SHAPES
// =============================================================================

/// Shape discriminant, used for counts and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    Rectangle,
    Circle,
    Line,
    Text,
    Image,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RectShape {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub fill: String,
    pub stroke: String,
    pub stroke_width: f64,
    pub rotation: f64,
}

/// Circle positioned by its center.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleShape {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
    pub fill: String,
    pub stroke: String,
    pub stroke_width: f64,
    pub rotation: f64,
}

/// Polyline. `points` is a flat `[x0, y0, x1, y1, ...]` list relative to `(x, y)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineShape {
    pub x: f64,
    pub y: f64,
    pub points: Vec<f64>,
    pub stroke: String,
    pub stroke_width: f64,
    pub rotation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextShape {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub text: String,
    pub font_size: f64,
    pub font_family: String,
    pub fill: String,
    pub rotation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageShape {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub src: String,
    pub rotation: f64,
}

/// Variant-specific geometry and style.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Shape {
    Rectangle(RectShape),
    Circle(CircleShape),
    Line(LineShape),
    Text(TextShape),
    Image(ImageShape),
}

/// Axis-aligned box in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Size of the shared surface. Objects are clamped inside it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CanvasBounds {
    pub width: f64,
    pub height: f64,
}

impl Shape {
    #[must_use]
    pub fn kind(&self) -> ShapeKind {
        match self {
            Self::Rectangle(_) => ShapeKind::Rectangle,
            Self::Circle(_) => ShapeKind::Circle,
            Self::Line(_) => ShapeKind::Line,
            Self::Text(_) => ShapeKind::Text,
            Self::Image(_) => ShapeKind::Image,
        }
    }

    #[must_use]
    pub fn position(&self) -> (f64, f64) {
        match self {
            Self::Rectangle(s) => (s.x, s.y),
            Self::Circle(s) => (s.x, s.y),
            Self::Line(s) => (s.x, s.y),
            Self::Text(s) => (s.x, s.y),
            Self::Image(s) => (s.x, s.y),
        }
    }

    /// Unrotated bounding box. Circles are boxed around their center.
    #[must_use]
    pub fn bounding_box(&self) -> BoundingBox {
        match self {
            Self::Rectangle(s) => BoundingBox { x: s.x, y: s.y, width: s.width, height: s.height },
            Self::Text(s) => BoundingBox { x: s.x, y: s.y, width: s.width, height: s.height },
            Self::Image(s) => BoundingBox { x: s.x, y: s.y, width: s.width, height: s.height },
            Self::Circle(s) => BoundingBox {
                x: s.x - s.radius,
                y: s.y - s.radius,
                width: s.radius * 2.0,
                height: s.radius * 2.0,
            },
            Self::Line(s) => {
                let (min_x, min_y, max_x, max_y) = points_extent(&s.points);
                BoundingBox { x: s.x + min_x, y: s.y + min_y, width: max_x - min_x, height: max_y - min_y }
            }
        }
    }

    /// Reject geometry that cannot be placed at all.
    ///
    /// # Errors
    ///
    /// Returns the first problem found: non-finite numbers, non-positive
    /// sizes, a line with fewer than two points, or a box lying entirely
    /// outside `bounds`.
    pub fn validate(&self, bounds: CanvasBounds) -> Result<(), ValidationError> {
        let (x, y) = self.position();
        finite("x", x)?;
        finite("y", y)?;
        match self {
            Self::Rectangle(s) => {
                positive("width", s.width)?;
                positive("height", s.height)?;
                finite("stroke_width", s.stroke_width)?;
                finite("rotation", s.rotation)?;
            }
            Self::Circle(s) => {
                positive("radius", s.radius)?;
                finite("stroke_width", s.stroke_width)?;
                finite("rotation", s.rotation)?;
            }
            Self::Line(s) => {
                if s.points.len() < 4 || s.points.len() % 2 != 0 {
                    return Err(ValidationError::BadPoints { len: s.points.len() });
                }
                for p in &s.points {
                    finite("points", *p)?;
                }
                finite("stroke_width", s.stroke_width)?;
                finite("rotation", s.rotation)?;
            }
            Self::Text(s) => {
                positive("width", s.width)?;
                positive("height", s.height)?;
                positive("font_size", s.font_size)?;
                finite("rotation", s.rotation)?;
            }
            Self::Image(s) => {
                positive("width", s.width)?;
                positive("height", s.height)?;
                finite("rotation", s.rotation)?;
            }
        }

        let bbox = self.bounding_box();
        let outside = bbox.x >= bounds.width
            || bbox.y >= bounds.height
            || bbox.x + bbox.width <= 0.0
            || bbox.y + bbox.height <= 0.0;
        if outside {
            return Err(ValidationError::OutOfBounds { x: bbox.x, y: bbox.y });
        }
        Ok(())
    }

    /// Pull the shape inside `bounds`, shrinking it when it is larger than
    /// the canvas, and normalize rotation. Assumes `validate` passed.
    pub fn clamp_to(&mut self, bounds: CanvasBounds) {
        match self {
            Self::Rectangle(s) => {
                clamp_box(&mut s.x, &mut s.width, bounds.width);
                clamp_box(&mut s.y, &mut s.height, bounds.height);
                s.rotation = normalize_rotation(s.rotation);
            }
            Self::Text(s) => {
                clamp_box(&mut s.x, &mut s.width, bounds.width);
                clamp_box(&mut s.y, &mut s.height, bounds.height);
                s.rotation = normalize_rotation(s.rotation);
            }
            Self::Image(s) => {
                clamp_box(&mut s.x, &mut s.width, bounds.width);
                clamp_box(&mut s.y, &mut s.height, bounds.height);
                s.rotation = normalize_rotation(s.rotation);
            }
            Self::Circle(s) => {
                s.radius = s.radius.min(bounds.width / 2.0).min(bounds.height / 2.0);
                s.x = s.x.max(s.radius).min(bounds.width - s.radius);
                s.y = s.y.max(s.radius).min(bounds.height - s.radius);
                s.rotation = normalize_rotation(s.rotation);
            }
            Self::Line(s) => {
                let (min_x, min_y, max_x, max_y) = points_extent(&s.points);
                s.x = shift_into(s.x + min_x, max_x - min_x, bounds.width) - min_x;
                s.y = shift_into(s.y + min_y, max_y - min_y, bounds.height) - min_y;
                s.rotation = normalize_rotation(s.rotation);
            }
        }
    }
}

fn finite(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() { Ok(()) } else { Err(ValidationError::NonFinite { field }) }
}

fn positive(field: &'static str, value: f64) -> Result<(), ValidationError> {
    finite(field, value)?;
    if value > 0.0 { Ok(()) } else { Err(ValidationError::NonPositive { field, value }) }
}

/// Shrink `size` to `limit`, then slide `origin` so `[origin, origin + size]`
/// lies inside `[0, limit]`.
fn clamp_box(origin: &mut f64, size: &mut f64, limit: f64) {
    *size = size.min(limit);
    *origin = origin.max(0.0).min(limit - *size);
}

/// Where a span of `size` starting at `origin` must start to fit `[0, limit]`.
/// Spans wider than the canvas are pinned to 0.
fn shift_into(origin: f64, size: f64, limit: f64) -> f64 {
    if size >= limit {
        return 0.0;
    }
    origin.max(0.0).min(limit - size)
}

fn points_extent(points: &[f64]) -> (f64, f64, f64, f64) {
    let mut min_x = f64::INFINITY;
    let mut min_y = f64::INFINITY;
    let mut max_x = f64::NEG_INFINITY;
    let mut max_y = f64::NEG_INFINITY;
    for pair in points.chunks_exact(2) {
        min_x = min_x.min(pair[0]);
        max_x = max_x.max(pair[0]);
        min_y = min_y.min(pair[1]);
        max_y = max_y.max(pair[1]);
    }
    if min_x > max_x {
        return (0.0, 0.0, 0.0, 0.0);
    }
    (min_x, min_y, max_x, max_y)
}

// =============================================================================
// VALIDATION ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("field `{field}` is not a finite number")]
    NonFinite { field: &'static str },
    #[error("field `{field}` must be positive, got {value}")]
    NonPositive { field: &'static str, value: f64 },
    #[error("line needs an even number of at least 4 coordinates, got {len}")]
    BadPoints { len: usize },
    #[error("object at ({x}, {y}) lies outside the canvas")]
    OutOfBounds { x: f64, y: f64 },
    #[error("batch exceeds the cap of {cap} objects")]
    BatchCapExceeded { cap: usize },
}

impl ErrorCode for ValidationError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NonFinite { .. } => "E_NON_FINITE",
            Self::NonPositive { .. } => "E_NON_POSITIVE",
            Self::BadPoints { .. } => "E_BAD_POINTS",
            Self::OutOfBounds { .. } => "E_OUT_OF_BOUNDS",
            Self::BatchCapExceeded { .. } => "E_BATCH_CAP",
        }
    }
}

// =============================================================================
// CANVAS OBJECT
// =============================================================================

/// One object on the shared canvas, as held locally and stored remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasObject {
    pub id: ObjectId,
    pub owner_id: String,
    /// Stacking order; higher values render above lower values.
    pub z_index: i64,
    #[serde(flatten)]
    pub shape: Shape,
    /// Persistent "do not drag" flag, independent of leases.
    #[serde(default)]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<Lease>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai: Option<AiProvenance>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl CanvasObject {
    /// Build an object with a fresh id. Timestamps are stamped by the store.
    #[must_use]
    pub fn new(owner_id: impl Into<String>, z_index: i64, shape: Shape) -> Self {
        Self {
            id: new_object_id(),
            owner_id: owner_id.into(),
            z_index,
            shape,
            locked: false,
            lock: None,
            ai: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[must_use]
    pub fn with_ai(mut self, ai: AiProvenance) -> Self {
        self.ai = Some(ai);
        self
    }

    #[must_use]
    pub fn kind(&self) -> ShapeKind {
        self.shape.kind()
    }

    #[must_use]
    pub fn created_by_ai(&self) -> bool {
        self.ai.is_some()
    }

    /// Lease held by someone other than `user_id` that has not expired.
    #[must_use]
    pub fn foreign_lease_at(&self, user_id: &str, now: i64) -> Option<&Lease> {
        self.lock
            .as_ref()
            .filter(|lease| lease.is_foreign_active_at(user_id, now))
    }

    /// Apply the fields of `patch` that make sense for this variant.
    ///
    /// Returns the effective patch: only the fields that were applied. Fields
    /// for other variants (e.g. `radius` on a rectangle) are dropped.
    pub fn apply_patch(&mut self, patch: &ObjectPatch) -> ObjectPatch {
        let mut applied = ObjectPatch::default();

        match &mut self.shape {
            Shape::Rectangle(s) => {
                set(&mut s.x, patch.x.as_ref(), &mut applied.x);
                set(&mut s.y, patch.y.as_ref(), &mut applied.y);
                set(&mut s.width, patch.width.as_ref(), &mut applied.width);
                set(&mut s.height, patch.height.as_ref(), &mut applied.height);
                set(&mut s.fill, patch.fill.as_ref(), &mut applied.fill);
                set(&mut s.stroke, patch.stroke.as_ref(), &mut applied.stroke);
                set(&mut s.stroke_width, patch.stroke_width.as_ref(), &mut applied.stroke_width);
                set_rotation(&mut s.rotation, patch.rotation, &mut applied.rotation);
            }
            Shape::Circle(s) => {
                set(&mut s.x, patch.x.as_ref(), &mut applied.x);
                set(&mut s.y, patch.y.as_ref(), &mut applied.y);
                set(&mut s.radius, patch.radius.as_ref(), &mut applied.radius);
                set(&mut s.fill, patch.fill.as_ref(), &mut applied.fill);
                set(&mut s.stroke, patch.stroke.as_ref(), &mut applied.stroke);
                set(&mut s.stroke_width, patch.stroke_width.as_ref(), &mut applied.stroke_width);
                set_rotation(&mut s.rotation, patch.rotation, &mut applied.rotation);
            }
            Shape::Line(s) => {
                set(&mut s.x, patch.x.as_ref(), &mut applied.x);
                set(&mut s.y, patch.y.as_ref(), &mut applied.y);
                set(&mut s.points, patch.points.as_ref(), &mut applied.points);
                set(&mut s.stroke, patch.stroke.as_ref(), &mut applied.stroke);
                set(&mut s.stroke_width, patch.stroke_width.as_ref(), &mut applied.stroke_width);
                set_rotation(&mut s.rotation, patch.rotation, &mut applied.rotation);
            }
            Shape::Text(s) => {
                set(&mut s.x, patch.x.as_ref(), &mut applied.x);
                set(&mut s.y, patch.y.as_ref(), &mut applied.y);
                set(&mut s.width, patch.width.as_ref(), &mut applied.width);
                set(&mut s.height, patch.height.as_ref(), &mut applied.height);
                set(&mut s.text, patch.text.as_ref(), &mut applied.text);
                set(&mut s.font_size, patch.font_size.as_ref(), &mut applied.font_size);
                set(&mut s.font_family, patch.font_family.as_ref(), &mut applied.font_family);
                set(&mut s.fill, patch.fill.as_ref(), &mut applied.fill);
                set_rotation(&mut s.rotation, patch.rotation, &mut applied.rotation);
            }
            Shape::Image(s) => {
                set(&mut s.x, patch.x.as_ref(), &mut applied.x);
                set(&mut s.y, patch.y.as_ref(), &mut applied.y);
                set(&mut s.width, patch.width.as_ref(), &mut applied.width);
                set(&mut s.height, patch.height.as_ref(), &mut applied.height);
                set(&mut s.src, patch.src.as_ref(), &mut applied.src);
                set_rotation(&mut s.rotation, patch.rotation, &mut applied.rotation);
            }
        }

        set(&mut self.z_index, patch.z_index.as_ref(), &mut applied.z_index);
        set(&mut self.locked, patch.locked.as_ref(), &mut applied.locked);
        set(&mut self.lock, patch.lock.as_ref(), &mut applied.lock);
        set(&mut self.ai, patch.ai.as_ref(), &mut applied.ai);
        set(&mut self.updated_at, patch.updated_at.as_ref(), &mut applied.updated_at);

        applied
    }
}

fn set<T: Clone>(target: &mut T, incoming: Option<&T>, applied: &mut Option<T>) {
    if let Some(value) = incoming {
        *target = value.clone();
        *applied = Some(value.clone());
    }
}

fn set_rotation(target: &mut f64, incoming: Option<f64>, applied: &mut Option<f64>) {
    if let Some(value) = incoming {
        let value = normalize_rotation(value);
        *target = value;
        *applied = Some(value);
    }
}

// =============================================================================
// PATCH
// =============================================================================

/// Sparse update for a canvas object. Only present fields are applied.
///
/// `lock` and `ai` are double options: `Some(None)` clears the field, which
/// serializes as an explicit `null` so the backend merge removes it too.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "nullable")]
    pub lock: Option<Option<Lease>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "nullable")]
    pub ai: Option<Option<AiProvenance>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl ObjectPatch {
    /// Patch that moves an object.
    #[must_use]
    pub fn position(x: f64, y: f64) -> Self {
        Self { x: Some(x), y: Some(y), ..Self::default() }
    }

    /// Patch that sets or clears the lease field.
    #[must_use]
    pub fn lease(lease: Option<Lease>) -> Self {
        Self { lock: Some(lease), ..Self::default() }
    }

    /// Patch that rewrites every user-editable field to match `snapshot`.
    ///
    /// Used to restore previous states on undo. The lease field is left out:
    /// leases belong to whoever holds them now, not to the recorded state.
    #[must_use]
    pub fn from_snapshot(snapshot: &CanvasObject) -> Self {
        let mut patch = Self {
            z_index: Some(snapshot.z_index),
            locked: Some(snapshot.locked),
            ai: Some(snapshot.ai.clone()),
            ..Self::default()
        };
        match &snapshot.shape {
            Shape::Rectangle(s) => {
                patch.x = Some(s.x);
                patch.y = Some(s.y);
                patch.width = Some(s.width);
                patch.height = Some(s.height);
                patch.fill = Some(s.fill.clone());
                patch.stroke = Some(s.stroke.clone());
                patch.stroke_width = Some(s.stroke_width);
                patch.rotation = Some(s.rotation);
            }
            Shape::Circle(s) => {
                patch.x = Some(s.x);
                patch.y = Some(s.y);
                patch.radius = Some(s.radius);
                patch.fill = Some(s.fill.clone());
                patch.stroke = Some(s.stroke.clone());
                patch.stroke_width = Some(s.stroke_width);
                patch.rotation = Some(s.rotation);
            }
            Shape::Line(s) => {
                patch.x = Some(s.x);
                patch.y = Some(s.y);
                patch.points = Some(s.points.clone());
                patch.stroke = Some(s.stroke.clone());
                patch.stroke_width = Some(s.stroke_width);
                patch.rotation = Some(s.rotation);
            }
            Shape::Text(s) => {
                patch.x = Some(s.x);
                patch.y = Some(s.y);
                patch.width = Some(s.width);
                patch.height = Some(s.height);
                patch.text = Some(s.text.clone());
                patch.font_size = Some(s.font_size);
                patch.font_family = Some(s.font_family.clone());
                patch.fill = Some(s.fill.clone());
                patch.rotation = Some(s.rotation);
            }
            Shape::Image(s) => {
                patch.x = Some(s.x);
                patch.y = Some(s.y);
                patch.width = Some(s.width);
                patch.height = Some(s.height);
                patch.src = Some(s.src.clone());
                patch.rotation = Some(s.rotation);
            }
        }
        patch
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Serde adapter for `Option<Option<T>>`: absent → `None`, `null` →
/// `Some(None)`, value → `Some(Some(v))`.
mod nullable {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S, T>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        match value {
            Some(Some(inner)) => inner.serialize(serializer),
            _ => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
