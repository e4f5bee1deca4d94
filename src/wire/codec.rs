//! Serialization of [`ControlList`] and [`ControlInfoMap`] to the flat wire
//! encoding.
//!
//! Layout: a u32 entry count followed by, per entry, {u32 id, u8 type tag,
//! payload}. Fixed-width payloads are implied by the tag; byte-array and
//! array payloads carry an explicit u32 element count. Info-map entries carry
//! three payloads of the entry's type: minimum, maximum, default. All scalars
//! are little-endian. There is no version field; both sides agree on the
//! schema out of band.

use crate::controls::{ControlInfo, ControlInfoMap, ControlList, ControlValue};

use super::region::{ReadRegion, WriteRegion};
use super::WireError;

const TAG_BOOL: u8 = 1;
const TAG_I32: u8 = 2;
const TAG_I64: u8 = 3;
const TAG_F32: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_I32_ARRAY: u8 = 6;
const TAG_F32_ARRAY: u8 = 7;

fn value_size(value: &ControlValue) -> usize {
    match value {
        ControlValue::Bool(_) => 1,
        ControlValue::Int32(_) | ControlValue::Float(_) => 4,
        ControlValue::Int64(_) => 8,
        ControlValue::Bytes(b) => 4 + b.len(),
        ControlValue::Int32Array(v) => 4 + 4 * v.len(),
        ControlValue::FloatArray(v) => 4 + 4 * v.len(),
    }
}

fn serialize_value(value: &ControlValue, out: &mut WriteRegion<'_>) -> Result<(), WireError> {
    match value {
        ControlValue::Bool(v) => out.write_u8(*v as u8),
        ControlValue::Int32(v) => out.write_i32(*v),
        ControlValue::Int64(v) => out.write_i64(*v),
        ControlValue::Float(v) => out.write_f32(*v),
        ControlValue::Bytes(b) => {
            out.write_u32(b.len() as u32)?;
            out.write_bytes(b)
        }
        ControlValue::Int32Array(v) => {
            out.write_u32(v.len() as u32)?;
            for elem in v {
                out.write_i32(*elem)?;
            }
            Ok(())
        }
        ControlValue::FloatArray(v) => {
            out.write_u32(v.len() as u32)?;
            for elem in v {
                out.write_f32(*elem)?;
            }
            Ok(())
        }
    }
}

fn deserialize_value(tag: u8, region: &mut ReadRegion<'_>) -> Result<ControlValue, WireError> {
    let value = match tag {
        TAG_BOOL => ControlValue::Bool(region.read_u8()? != 0),
        TAG_I32 => ControlValue::Int32(region.read_i32()?),
        TAG_I64 => ControlValue::Int64(region.read_i64()?),
        TAG_F32 => ControlValue::Float(region.read_f32()?),
        TAG_BYTES => {
            let len = region.read_u32()? as usize;
            ControlValue::Bytes(region.read_bytes(len)?.to_vec())
        }
        TAG_I32_ARRAY => {
            let len = region.read_u32()? as usize;
            let mut elems = region.carve_out(len.checked_mul(4).ok_or(
                WireError::MalformedPayload("array length overflows region"),
            )?)?;
            let mut values = Vec::with_capacity(len);
            for _ in 0..len {
                values.push(elems.read_i32()?);
            }
            ControlValue::Int32Array(values)
        }
        TAG_F32_ARRAY => {
            let len = region.read_u32()? as usize;
            let mut elems = region.carve_out(len.checked_mul(4).ok_or(
                WireError::MalformedPayload("array length overflows region"),
            )?)?;
            let mut values = Vec::with_capacity(len);
            for _ in 0..len {
                values.push(elems.read_f32()?);
            }
            ControlValue::FloatArray(values)
        }
        _ => return Err(WireError::MalformedPayload("unknown type tag")),
    };
    Ok(value)
}

/// Exact byte length [`serialize`] will produce for `list`. Computed in a
/// first pass so callers can carve out sub-regions before packing several
/// lists contiguously.
pub fn binary_size(list: &ControlList) -> usize {
    let mut size = 4;
    for (_, value) in list.iter() {
        size += 4 + 1 + value_size(value);
    }
    size
}

pub fn serialize(list: &ControlList, out: &mut WriteRegion<'_>) -> Result<(), WireError> {
    out.write_u32(list.len() as u32)?;
    for (id, value) in list.iter() {
        out.write_u32(*id)?;
        out.write_u8(value.tag())?;
        serialize_value(value, out)?;
    }
    Ok(())
}

pub fn deserialize(region: &mut ReadRegion<'_>) -> Result<ControlList, WireError> {
    let count = region.read_u32()?;
    let mut list = ControlList::new();
    for _ in 0..count {
        let id = region.read_u32()?;
        let tag = region.read_u8()?;
        list.set(id, deserialize_value(tag, region)?);
    }
    Ok(list)
}

/// Exact byte length [`serialize_info_map`] will produce for `map`.
pub fn info_map_binary_size(map: &ControlInfoMap) -> usize {
    let mut size = 4;
    for (_, info) in map.iter() {
        size += 4 + 1;
        size += value_size(&info.min) + value_size(&info.max) + value_size(&info.def);
    }
    size
}

pub fn serialize_info_map(map: &ControlInfoMap, out: &mut WriteRegion<'_>) -> Result<(), WireError> {
    out.write_u32(map.len() as u32)?;
    for (id, info) in map.iter() {
        out.write_u32(*id)?;
        out.write_u8(info.min.tag())?;
        serialize_value(&info.min, out)?;
        serialize_value(&info.max, out)?;
        serialize_value(&info.def, out)?;
    }
    Ok(())
}

pub fn deserialize_info_map(region: &mut ReadRegion<'_>) -> Result<ControlInfoMap, WireError> {
    let count = region.read_u32()?;
    let mut map = ControlInfoMap::new();
    for _ in 0..count {
        let id = region.read_u32()?;
        let tag = region.read_u8()?;
        let min = deserialize_value(tag, region)?;
        let max = deserialize_value(tag, region)?;
        let def = deserialize_value(tag, region)?;
        map.insert(id, ControlInfo { min, max, def });
    }
    Ok(map)
}
