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
//! Pointer swizzling for spill-ready row blocks.
//!
//! Unswizzled rows hold absolute heap references (stable block id + offset);
//! swizzled rows hold the blob's offset inside the paired heap block and
//! blob-relative value offsets. Data and heap blocks move together, so the
//! swizzled form survives any relocation.

use crate::exec::row::collection::{pack_heap_ref, unpack_heap_ref};
use crate::exec::row::layout::{RowLayout, read_u32, read_u64, write_u64};

/// Rewrite variable-length column references in the first `n` rows from
/// absolute heap references to offsets relative to the row's blob start.
/// The row heap slot itself still holds the absolute blob reference.
pub fn swizzle_columns(layout: &RowLayout, data: &mut [u8], n: usize) -> Result<(), String> {
    let heap_offset = match layout.heap_offset() {
        Some(offset) => offset,
        None => return Ok(()),
    };
    let width = layout.row_width();
    let var_cols: Vec<usize> = layout.var_len_columns().collect();
    for row_idx in 0..n {
        let row = &mut data[row_idx * width..(row_idx + 1) * width];
        let (blob_block, blob_offset) = unpack_heap_ref(read_u64(row, heap_offset));
        for &col in &var_cols {
            let slot = layout.offset(col);
            let (value_block, value_offset) = unpack_heap_ref(read_u64(row, slot + 4));
            if value_block != blob_block {
                return Err(format!(
                    "swizzle: value in heap block {} but blob in block {}",
                    value_block, blob_block
                ));
            }
            let relative = value_offset.checked_sub(blob_offset).ok_or_else(|| {
                format!(
                    "swizzle: value offset {} precedes blob offset {}",
                    value_offset, blob_offset
                )
            })?;
            write_u64(row, slot + 4, relative as u64);
        }
    }
    Ok(())
}

/// Rewrite the per-row heap slot of `n` rows starting at `first_row` from an
/// absolute reference to `bias + (offset - base_offset)`: the blob's position
/// inside the destination heap block. Rows in the run must reference one
/// source heap block, blobs starting at `base_offset`.
pub fn swizzle_heap_pointer(
    layout: &RowLayout,
    data: &mut [u8],
    first_row: usize,
    n: usize,
    base_offset: u32,
    bias: u64,
) -> Result<(), String> {
    let heap_offset = layout
        .heap_offset()
        .ok_or_else(|| "swizzle_heap_pointer on all-constant layout".to_string())?;
    let width = layout.row_width();
    for row_idx in first_row..first_row + n {
        let row = &mut data[row_idx * width..(row_idx + 1) * width];
        let (_, blob_offset) = unpack_heap_ref(read_u64(row, heap_offset));
        let relative = blob_offset.checked_sub(base_offset).ok_or_else(|| {
            format!(
                "swizzle: blob offset {} precedes run base {}",
                blob_offset, base_offset
            )
        })?;
        write_u64(row, heap_offset, bias + relative as u64);
    }
    Ok(())
}

/// Inverse of swizzling: rehydrate heap slots and value references of the
/// first `n` rows as absolute references into heap block `heap_block_id`.
/// Both the row block and its paired heap block must be resident.
pub fn unswizzle_pointers(
    layout: &RowLayout,
    data: &mut [u8],
    heap_block_id: u32,
    n: usize,
) -> Result<(), String> {
    let heap_offset = match layout.heap_offset() {
        Some(offset) => offset,
        None => return Ok(()),
    };
    let width = layout.row_width();
    let var_cols: Vec<usize> = layout.var_len_columns().collect();
    for row_idx in 0..n {
        let row = &mut data[row_idx * width..(row_idx + 1) * width];
        let blob_offset = read_u64(row, heap_offset);
        let blob_offset = u32::try_from(blob_offset)
            .map_err(|_| format!("unswizzle: blob offset {} out of range", blob_offset))?;
        write_u64(row, heap_offset, pack_heap_ref(heap_block_id, blob_offset));
        for &col in &var_cols {
            let slot = layout.offset(col);
            let relative = read_u64(row, slot + 4);
            let relative = u32::try_from(relative)
                .map_err(|_| format!("unswizzle: value offset {} out of range", relative))?;
            write_u64(
                row,
                slot + 4,
                pack_heap_ref(heap_block_id, blob_offset + relative),
            );
        }
    }
    Ok(())
}

/// Total heap bytes of a swizzled row: the sum of its variable-length value
/// lengths. Used by the partitioner to move blobs with their rows.
pub fn swizzled_blob_len(layout: &RowLayout, row: &[u8]) -> usize {
    let mut total = 0usize;
    for col in layout.var_len_columns() {
        total += read_u32(row, layout.offset(col)) as usize;
    }
    total
}
