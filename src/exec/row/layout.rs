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
//! Fixed-width tuple layout.
//!
//! A row is packed as: validity prefix, heap reference slot (var-length rows
//! only), key columns (equality prefix first, then extra predicate columns),
//! payload columns, 8-byte hash slot, 8-byte next slot. Offsets are computed
//! once and never change. The right/full-outer found flag lives in a
//! parallel atomic array owned by the hash table, not in the row.

use arrow::datatypes::DataType;

/// Inline width of a variable-length column slot: 4-byte length plus an
/// 8-byte heap reference.
pub const VAR_LEN_SLOT_WIDTH: usize = 12;

/// Byte width of a column inside a row.
pub fn type_width(data_type: &DataType) -> Result<usize, String> {
    match data_type {
        DataType::Boolean | DataType::Int8 => Ok(1),
        DataType::Int16 => Ok(2),
        DataType::Int32 | DataType::Float32 | DataType::Date32 => Ok(4),
        DataType::Int64 | DataType::Float64 => Ok(8),
        DataType::Utf8 => Ok(VAR_LEN_SLOT_WIDTH),
        other => Err(format!("row layout unsupported type: {other:?}")),
    }
}

pub fn is_var_len(data_type: &DataType) -> bool {
    matches!(data_type, DataType::Utf8)
}

/// Precomputed offsets for one tuple shape.
#[derive(Debug, Clone)]
pub struct RowLayout {
    types: Vec<DataType>,
    offsets: Vec<usize>,
    validity_bytes: usize,
    heap_offset: Option<usize>,
    hash_offset: usize,
    next_offset: usize,
    row_width: usize,
    all_constant: bool,
}

impl RowLayout {
    pub fn new(types: Vec<DataType>) -> Result<Self, String> {
        if types.is_empty() {
            return Err("row layout requires at least one column".to_string());
        }
        let all_constant = !types.iter().any(is_var_len);
        let validity_bytes = (types.len() + 7) / 8;

        let mut cursor = validity_bytes;
        let heap_offset = if all_constant {
            None
        } else {
            let offset = cursor;
            cursor += 8;
            Some(offset)
        };

        let mut offsets = Vec::with_capacity(types.len());
        for data_type in &types {
            offsets.push(cursor);
            cursor = cursor
                .checked_add(type_width(data_type)?)
                .ok_or_else(|| "row layout width overflow".to_string())?;
        }

        let hash_offset = cursor;
        cursor += 8;
        let next_offset = cursor;
        cursor += 8;

        Ok(Self {
            types,
            offsets,
            validity_bytes,
            heap_offset,
            hash_offset,
            next_offset,
            row_width: cursor,
            all_constant,
        })
    }

    pub fn types(&self) -> &[DataType] {
        &self.types
    }

    pub fn column_count(&self) -> usize {
        self.types.len()
    }

    pub fn offset(&self, col: usize) -> usize {
        self.offsets[col]
    }

    pub fn row_width(&self) -> usize {
        self.row_width
    }

    pub fn all_constant(&self) -> bool {
        self.all_constant
    }

    /// Offset of the row's heap reference slot; present iff any column is
    /// variable-length.
    pub fn heap_offset(&self) -> Option<usize> {
        self.heap_offset
    }

    pub fn hash_offset(&self) -> usize {
        self.hash_offset
    }

    pub fn next_offset(&self) -> usize {
        self.next_offset
    }

    pub fn validity_bytes(&self) -> usize {
        self.validity_bytes
    }

    pub fn set_valid(row: &mut [u8], col: usize, valid: bool) {
        let byte = col / 8;
        let bit = 1u8 << (col % 8);
        if valid {
            row[byte] |= bit;
        } else {
            row[byte] &= !bit;
        }
    }

    pub fn is_valid(row: &[u8], col: usize) -> bool {
        (row[col / 8] & (1u8 << (col % 8))) != 0
    }

    /// Indices of the variable-length columns, in layout order.
    pub fn var_len_columns(&self) -> impl Iterator<Item = usize> + '_ {
        self.types
            .iter()
            .enumerate()
            .filter(|(_, t)| is_var_len(t))
            .map(|(i, _)| i)
    }
}

pub fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

pub fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

pub fn write_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use arrow::datatypes::DataType;

    use super::{RowLayout, VAR_LEN_SLOT_WIDTH};

    #[test]
    fn test_all_constant_layout() {
        let layout = RowLayout::new(vec![DataType::Int64, DataType::Int32]).unwrap();
        assert!(layout.all_constant());
        assert_eq!(layout.validity_bytes(), 1);
        assert_eq!(layout.heap_offset(), None);
        assert_eq!(layout.offset(0), 1);
        assert_eq!(layout.offset(1), 9);
        assert_eq!(layout.hash_offset(), 13);
        assert_eq!(layout.next_offset(), 21);
        assert_eq!(layout.row_width(), 29);
    }

    #[test]
    fn test_var_len_layout_reserves_heap_slot() {
        let layout = RowLayout::new(vec![DataType::Int64, DataType::Utf8]).unwrap();
        assert!(!layout.all_constant());
        assert_eq!(layout.heap_offset(), Some(1));
        assert_eq!(layout.offset(0), 9);
        assert_eq!(layout.offset(1), 17);
        let cols_end = 17 + VAR_LEN_SLOT_WIDTH;
        assert_eq!(layout.hash_offset(), cols_end);
        assert_eq!(layout.next_offset(), cols_end + 8);
        assert_eq!(layout.row_width(), cols_end + 16);
        assert_eq!(layout.var_len_columns().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_validity_bits() {
        let mut row = vec![0u8; 4];
        RowLayout::set_valid(&mut row, 0, true);
        RowLayout::set_valid(&mut row, 9, true);
        assert!(RowLayout::is_valid(&row, 0));
        assert!(!RowLayout::is_valid(&row, 1));
        assert!(RowLayout::is_valid(&row, 9));
        RowLayout::set_valid(&mut row, 0, false);
        assert!(!RowLayout::is_valid(&row, 0));
    }
}
