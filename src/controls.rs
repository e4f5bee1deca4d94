//! Typed control lists exchanged between the capture device, the ISP and the
//! tuning engine.
//!
//! A control is a stable numeric identifier paired with a typed value. Lists
//! are kept in a BTreeMap so lookups are order-independent while serialization
//! stays deterministic.

use std::collections::BTreeMap;

/// Stable numeric control identifier.
pub type ControlId = u32;

/// Identifiers the pipeline itself reads or writes. The tuning engine carries
/// many more; those pass through opaquely.
pub mod ids {
    /// Capture timestamp of the raw frame, in nanoseconds (Int64).
    pub const SENSOR_TIMESTAMP: u32 = 0x0101;
    /// Requested crop rectangle on the ISP input, {x, y, width, height} (Int32Array).
    pub const SCALER_CROP: u32 = 0x0102;
    /// Red/blue colour gains reported by the engine (FloatArray, len 2).
    pub const COLOUR_GAINS: u32 = 0x0103;
    /// Linear gains pushed back to sensors that take notify-gains, B/Gb/Gr/R order (Int32Array).
    pub const NOTIFY_GAINS: u32 = 0x0104;
    /// Lens-shading control; first element is the table dmabuf handle (Int32Array).
    pub const LENS_SHADING: u32 = 0x0105;
    /// Sensor exposure time in lines (Int32).
    pub const EXPOSURE_TIME: u32 = 0x0106;
    /// Sensor analogue gain code (Int32).
    pub const ANALOGUE_GAIN: u32 = 0x0107;
}

/// A typed control value. Each variant has a stable wire tag used by the
/// codec in [`crate::wire`].
#[derive(Debug, Clone, PartialEq)]
pub enum ControlValue {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Bytes(Vec<u8>),
    Int32Array(Vec<i32>),
    FloatArray(Vec<f32>),
}

impl ControlValue {
    /// Wire type discriminant.
    pub fn tag(&self) -> u8 {
        match self {
            ControlValue::Bool(_) => 1,
            ControlValue::Int32(_) => 2,
            ControlValue::Int64(_) => 3,
            ControlValue::Float(_) => 4,
            ControlValue::Bytes(_) => 5,
            ControlValue::Int32Array(_) => 6,
            ControlValue::FloatArray(_) => 7,
        }
    }
}

/// An ordered mapping from control identifier to value.
///
/// Identifiers are unique within one list; re-setting an id replaces its
/// value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlList {
    entries: BTreeMap<ControlId, ControlValue>,
}

impl ControlList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: ControlId, value: ControlValue) {
        self.entries.insert(id, value);
    }

    pub fn get(&self, id: ControlId) -> Option<&ControlValue> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: ControlId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Merge `other` into this list; entries in `other` win on conflict.
    pub fn merge(&mut self, other: &ControlList) {
        for (id, value) in &other.entries {
            self.entries.insert(*id, value.clone());
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ControlId, &ControlValue)> {
        self.entries.iter()
    }

    pub fn get_i32(&self, id: ControlId) -> Option<i32> {
        match self.get(id) {
            Some(ControlValue::Int32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_i64(&self, id: ControlId) -> Option<i64> {
        match self.get(id) {
            Some(ControlValue::Int64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_float_array(&self, id: ControlId) -> Option<&[f32]> {
        match self.get(id) {
            Some(ControlValue::FloatArray(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_i32_array(&self, id: ControlId) -> Option<&[i32]> {
        match self.get(id) {
            Some(ControlValue::Int32Array(v)) => Some(v),
            _ => None,
        }
    }
}

impl FromIterator<(ControlId, ControlValue)> for ControlList {
    fn from_iter<T: IntoIterator<Item = (ControlId, ControlValue)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Valid range for one control: minimum, maximum and default value, all of
/// the control's own type.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlInfo {
    pub min: ControlValue,
    pub max: ControlValue,
    pub def: ControlValue,
}

/// Schema for a control set: identifier to [`ControlInfo`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlInfoMap {
    entries: BTreeMap<ControlId, ControlInfo>,
}

impl ControlInfoMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ControlId, info: ControlInfo) {
        self.entries.insert(id, info);
    }

    pub fn get(&self, id: ControlId) -> Option<&ControlInfo> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ControlId, &ControlInfo)> {
        self.entries.iter()
    }
}

impl FromIterator<(ControlId, ControlInfo)> for ControlInfoMap {
    fn from_iter<T: IntoIterator<Item = (ControlId, ControlInfo)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_existing_id() {
        let mut list = ControlList::new();
        list.set(ids::EXPOSURE_TIME, ControlValue::Int32(100));
        list.set(ids::EXPOSURE_TIME, ControlValue::Int32(200));
        assert_eq!(list.len(), 1);
        assert_eq!(list.get_i32(ids::EXPOSURE_TIME), Some(200));
    }

    #[test]
    fn merge_overwrites_on_conflict() {
        let mut base = ControlList::new();
        base.set(1, ControlValue::Int32(1));
        base.set(2, ControlValue::Bool(false));

        let mut update = ControlList::new();
        update.set(2, ControlValue::Bool(true));
        update.set(3, ControlValue::Float(0.5));

        base.merge(&update);
        assert_eq!(base.len(), 3);
        assert_eq!(base.get(2), Some(&ControlValue::Bool(true)));
    }

    #[test]
    fn lookup_is_insertion_order_independent() {
        let a: ControlList = [(7, ControlValue::Int32(7)), (3, ControlValue::Int32(3))]
            .into_iter()
            .collect();
        let b: ControlList = [(3, ControlValue::Int32(3)), (7, ControlValue::Int32(7))]
            .into_iter()
            .collect();
        assert_eq!(a, b);
    }
}
