// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Vectorized row operations: scatter columns into row memory, gather rows
//! back into arrays, and resolve join predicates against stored rows.

use std::cmp::Ordering;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float32Array, Float64Array, Int8Array, Int16Array,
    Int32Array, Int64Array, StringArray,
};
use arrow::datatypes::DataType;

use crate::exec::hashjoin::condition::JoinComparison;
use crate::exec::hashjoin::hash::{canonical_f32_bits, canonical_f64_bits};
use crate::exec::row::collection::{RowDataCollection, pack_heap_ref, unpack_heap_ref};
use crate::exec::row::layout::{RowLayout, is_var_len, read_u32, read_u64, write_u32, write_u64};

/// Typed view over one input column.
pub enum ColumnView<'a> {
    Boolean(&'a BooleanArray),
    Int8(&'a Int8Array),
    Int16(&'a Int16Array),
    Int32(&'a Int32Array),
    Int64(&'a Int64Array),
    Float32(&'a Float32Array),
    Float64(&'a Float64Array),
    Date32(&'a Date32Array),
    Utf8(&'a StringArray),
}

impl<'a> ColumnView<'a> {
    pub fn try_new(array: &'a ArrayRef) -> Result<Self, String> {
        macro_rules! view {
            ($variant:ident, $arr_ty:ty) => {
                Ok(ColumnView::$variant(
                    array
                        .as_any()
                        .downcast_ref::<$arr_ty>()
                        .ok_or_else(|| format!("column view downcast failed for {:?}", array.data_type()))?,
                ))
            };
        }
        match array.data_type() {
            DataType::Boolean => view!(Boolean, BooleanArray),
            DataType::Int8 => view!(Int8, Int8Array),
            DataType::Int16 => view!(Int16, Int16Array),
            DataType::Int32 => view!(Int32, Int32Array),
            DataType::Int64 => view!(Int64, Int64Array),
            DataType::Float32 => view!(Float32, Float32Array),
            DataType::Float64 => view!(Float64, Float64Array),
            DataType::Date32 => view!(Date32, Date32Array),
            DataType::Utf8 => view!(Utf8, StringArray),
            other => Err(format!("unsupported key/payload type: {other:?}")),
        }
    }

    pub fn try_new_all(arrays: &'a [ArrayRef]) -> Result<Vec<ColumnView<'a>>, String> {
        arrays.iter().map(ColumnView::try_new).collect()
    }

    pub fn is_null(&self, row: usize) -> bool {
        match self {
            ColumnView::Boolean(a) => a.is_null(row),
            ColumnView::Int8(a) => a.is_null(row),
            ColumnView::Int16(a) => a.is_null(row),
            ColumnView::Int32(a) => a.is_null(row),
            ColumnView::Int64(a) => a.is_null(row),
            ColumnView::Float32(a) => a.is_null(row),
            ColumnView::Float64(a) => a.is_null(row),
            ColumnView::Date32(a) => a.is_null(row),
            ColumnView::Utf8(a) => a.is_null(row),
        }
    }

    fn var_len_bytes(&self, row: usize) -> Result<&'a [u8], String> {
        match self {
            ColumnView::Utf8(a) => Ok(a.value(row).as_bytes()),
            _ => Err("variable-length access on fixed-width column".to_string()),
        }
    }

    /// Write the (non-null) fixed-width value into the row slot.
    fn write_fixed(&self, row: usize, dst: &mut [u8]) -> Result<(), String> {
        match self {
            ColumnView::Boolean(a) => dst[0] = a.value(row) as u8,
            ColumnView::Int8(a) => dst[0] = a.value(row) as u8,
            ColumnView::Int16(a) => dst.copy_from_slice(&a.value(row).to_le_bytes()),
            ColumnView::Int32(a) => dst.copy_from_slice(&a.value(row).to_le_bytes()),
            ColumnView::Int64(a) => dst.copy_from_slice(&a.value(row).to_le_bytes()),
            ColumnView::Float32(a) => {
                dst.copy_from_slice(&canonical_f32_bits(a.value(row)).to_le_bytes())
            }
            ColumnView::Float64(a) => {
                dst.copy_from_slice(&canonical_f64_bits(a.value(row)).to_le_bytes())
            }
            ColumnView::Date32(a) => dst.copy_from_slice(&a.value(row).to_le_bytes()),
            ColumnView::Utf8(_) => {
                return Err("write_fixed called on variable-length column".to_string());
            }
        }
        Ok(())
    }

    /// Compare the probe value at `row` against the stored row slot.
    /// Ordering reads "probe cmp build".
    fn compare_row(
        &self,
        row: usize,
        slot: &[u8],
        heap: &RowDataCollection,
    ) -> Result<Ordering, String> {
        let ord = match self {
            ColumnView::Boolean(a) => a.value(row).cmp(&(slot[0] != 0)),
            ColumnView::Int8(a) => a.value(row).cmp(&(slot[0] as i8)),
            ColumnView::Int16(a) => {
                a.value(row).cmp(&i16::from_le_bytes([slot[0], slot[1]]))
            }
            ColumnView::Int32(a) => a
                .value(row)
                .cmp(&i32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]])),
            ColumnView::Int64(a) => a.value(row).cmp(&i64::from_le_bytes(
                slot[..8].try_into().map_err(|_| "slot width".to_string())?,
            )),
            ColumnView::Float32(a) => {
                let stored = f32::from_bits(u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]));
                f32::from_bits(canonical_f32_bits(a.value(row))).total_cmp(&stored)
            }
            ColumnView::Float64(a) => {
                let stored = f64::from_bits(u64::from_le_bytes(
                    slot[..8].try_into().map_err(|_| "slot width".to_string())?,
                ));
                f64::from_bits(canonical_f64_bits(a.value(row))).total_cmp(&stored)
            }
            ColumnView::Date32(a) => a
                .value(row)
                .cmp(&i32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]])),
            ColumnView::Utf8(a) => {
                let len = read_u32(slot, 0) as usize;
                let heap_ref = read_u64(slot, 4);
                let stored = heap.blob(heap_ref, len)?;
                a.value(row).as_bytes().cmp(stored)
            }
        };
        Ok(ord)
    }
}

/// Scatter input columns into reserved row slots, copying variable-length
/// bytes into the heap. `ptrs[i]` receives input lane `sel[i]`.
pub fn scatter(
    views: &[ColumnView<'_>],
    layout: &RowLayout,
    data: &mut RowDataCollection,
    heap: &mut RowDataCollection,
    ptrs: &[u64],
    sel: &[u32],
) -> Result<(), String> {
    if views.len() != layout.column_count() {
        return Err(format!(
            "scatter column count mismatch: {} views for {} layout columns",
            views.len(),
            layout.column_count()
        ));
    }
    if ptrs.len() != sel.len() {
        return Err("scatter selection/address length mismatch".to_string());
    }

    // Reserve one contiguous heap blob per row before touching row memory.
    let mut blob_refs: Vec<u64> = Vec::new();
    if !layout.all_constant() {
        blob_refs.reserve(sel.len());
        for &lane in sel {
            let lane = lane as usize;
            let mut blob_size = 0usize;
            for col in layout.var_len_columns() {
                if !views[col].is_null(lane) {
                    blob_size += views[col].var_len_bytes(lane)?.len();
                }
            }
            blob_refs.push(heap.reserve_blob(blob_size)?);
        }
    }

    for (i, &lane) in sel.iter().enumerate() {
        let lane = lane as usize;
        let row_width = layout.row_width();
        {
            let row = data.row_mut(ptrs[i])?;
            row[..row_width].fill(0);
            if let Some(heap_offset) = layout.heap_offset() {
                write_u64(row, heap_offset, blob_refs[i]);
            }
        }
        let mut blob_cursor = 0u32;
        for col in 0..layout.column_count() {
            let view = &views[col];
            let valid = !view.is_null(lane);
            let offset = layout.offset(col);
            if is_var_len(&layout.types()[col]) {
                let (value_len, value_ref) = if valid {
                    let bytes = view.var_len_bytes(lane)?;
                    let (block_id, blob_offset) = unpack_heap_ref(blob_refs[i]);
                    let value_ref = pack_heap_ref(block_id, blob_offset + blob_cursor);
                    heap.blob_mut(value_ref, bytes.len())?.copy_from_slice(bytes);
                    blob_cursor += bytes.len() as u32;
                    (bytes.len() as u32, value_ref)
                } else {
                    let (block_id, blob_offset) = unpack_heap_ref(blob_refs[i]);
                    (0, pack_heap_ref(block_id, blob_offset + blob_cursor))
                };
                let row = data.row_mut(ptrs[i])?;
                RowLayout::set_valid(row, col, valid);
                write_u32(row, offset, value_len);
                write_u64(row, offset + 4, value_ref);
            } else {
                let row = data.row_mut(ptrs[i])?;
                RowLayout::set_valid(row, col, valid);
                if valid {
                    let width = super::layout::type_width(&layout.types()[col])?;
                    view.write_fixed(lane, &mut row[offset..offset + width])?;
                }
            }
        }
    }
    Ok(())
}

/// Gather one layout column from stored rows into an arrow array.
///
/// Without `out_positions`, output index `i` holds the value of row
/// `ptrs[ptr_sel[i]]` and `out_len == ptr_sel.len()`. With positions, value
/// `i` lands at `out_positions[i]` and every other slot is NULL.
pub fn gather_column(
    data: &RowDataCollection,
    heap: &RowDataCollection,
    layout: &RowLayout,
    ptrs: &[u64],
    ptr_sel: &[u32],
    out_positions: Option<&[u32]>,
    out_len: usize,
    col_no: usize,
) -> Result<ArrayRef, String> {
    if let Some(positions) = out_positions {
        if positions.len() != ptr_sel.len() {
            return Err("gather position/selection length mismatch".to_string());
        }
    } else if out_len != ptr_sel.len() {
        return Err("gather output length mismatch".to_string());
    }
    let offset = layout.offset(col_no);

    macro_rules! gather_fixed {
        ($ty:ty, $arr:ty, $read:expr) => {{
            let mut out: Vec<Option<$ty>> = vec![None; out_len];
            for (i, &lane) in ptr_sel.iter().enumerate() {
                let row = data.row(ptrs[lane as usize])?;
                let pos = out_positions.map(|p| p[i] as usize).unwrap_or(i);
                if RowLayout::is_valid(row, col_no) {
                    let slot = &row[offset..];
                    out[pos] = Some($read(slot));
                }
            }
            Ok(Arc::new(<$arr>::from(out)) as ArrayRef)
        }};
    }

    match &layout.types()[col_no] {
        DataType::Boolean => gather_fixed!(bool, BooleanArray, |s: &[u8]| s[0] != 0),
        DataType::Int8 => gather_fixed!(i8, Int8Array, |s: &[u8]| s[0] as i8),
        DataType::Int16 => {
            gather_fixed!(i16, Int16Array, |s: &[u8]| i16::from_le_bytes([s[0], s[1]]))
        }
        DataType::Int32 => gather_fixed!(i32, Int32Array, |s: &[u8]| i32::from_le_bytes([
            s[0], s[1], s[2], s[3]
        ])),
        DataType::Int64 => gather_fixed!(i64, Int64Array, |s: &[u8]| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&s[..8]);
            i64::from_le_bytes(buf)
        }),
        DataType::Float32 => gather_fixed!(f32, Float32Array, |s: &[u8]| f32::from_bits(
            u32::from_le_bytes([s[0], s[1], s[2], s[3]])
        )),
        DataType::Float64 => gather_fixed!(f64, Float64Array, |s: &[u8]| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&s[..8]);
            f64::from_bits(u64::from_le_bytes(buf))
        }),
        DataType::Date32 => gather_fixed!(i32, Date32Array, |s: &[u8]| i32::from_le_bytes([
            s[0], s[1], s[2], s[3]
        ])),
        DataType::Utf8 => {
            let mut out: Vec<Option<String>> = vec![None; out_len];
            for (i, &lane) in ptr_sel.iter().enumerate() {
                let row = data.row(ptrs[lane as usize])?;
                let pos = out_positions.map(|p| p[i] as usize).unwrap_or(i);
                if RowLayout::is_valid(row, col_no) {
                    let len = read_u32(row, offset) as usize;
                    let heap_ref = read_u64(row, offset + 4);
                    let bytes = heap.blob(heap_ref, len)?;
                    let text = std::str::from_utf8(bytes)
                        .map_err(|_| "stored string is not valid utf8".to_string())?;
                    out[pos] = Some(text.to_string());
                }
            }
            Ok(Arc::new(StringArray::from(out)) as ArrayRef)
        }
        other => Err(format!("gather unsupported type: {other:?}")),
    }
}

fn predicate_matches(
    comparison: JoinComparison,
    probe_null: bool,
    row_null: bool,
    ord: Option<Ordering>,
) -> bool {
    match comparison {
        JoinComparison::Equal => ord == Some(Ordering::Equal),
        JoinComparison::NotDistinctFrom => {
            if probe_null || row_null {
                probe_null && row_null
            } else {
                ord == Some(Ordering::Equal)
            }
        }
        JoinComparison::DistinctFrom => {
            if probe_null || row_null {
                !(probe_null && row_null)
            } else {
                ord != Some(Ordering::Equal)
            }
        }
        JoinComparison::NotEqual => matches!(ord, Some(o) if o != Ordering::Equal),
        JoinComparison::LessThan => ord == Some(Ordering::Less),
        JoinComparison::LessThanOrEqual => {
            matches!(ord, Some(Ordering::Less) | Some(Ordering::Equal))
        }
        JoinComparison::GreaterThan => ord == Some(Ordering::Greater),
        JoinComparison::GreaterThanOrEqual => {
            matches!(ord, Some(Ordering::Greater) | Some(Ordering::Equal))
        }
    }
}

/// Resolve every join predicate for the selected lanes against the rows their
/// pointers reference. Matching lanes are appended to `match_sel` (input
/// order preserved), the rest to `no_match_sel` when provided. Returns the
/// match count.
pub fn match_rows(
    views: &[ColumnView<'_>],
    predicates: &[JoinComparison],
    layout: &RowLayout,
    data: &RowDataCollection,
    heap: &RowDataCollection,
    ptrs: &[u64],
    sel_in: &[u32],
    match_sel: &mut Vec<u32>,
    mut no_match_sel: Option<&mut Vec<u32>>,
) -> Result<usize, String> {
    if views.len() < predicates.len() {
        return Err(format!(
            "match requires {} key columns, got {}",
            predicates.len(),
            views.len()
        ));
    }
    match_sel.clear();
    if let Some(no_match) = no_match_sel.as_mut() {
        no_match.clear();
    }

    'lanes: for &lane in sel_in {
        let row = data.row(ptrs[lane as usize])?;
        for (col, comparison) in predicates.iter().enumerate() {
            let probe_null = views[col].is_null(lane as usize);
            let row_null = !RowLayout::is_valid(row, col);
            let ord = if probe_null || row_null {
                None
            } else {
                Some(views[col].compare_row(lane as usize, &row[layout.offset(col)..], heap)?)
            };
            if !predicate_matches(*comparison, probe_null, row_null, ord) {
                if let Some(no_match) = no_match_sel.as_mut() {
                    no_match.push(lane);
                }
                continue 'lanes;
            }
        }
        match_sel.push(lane);
    }
    Ok(match_sel.len())
}
