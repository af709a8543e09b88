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
//! Append-only row block collections.
//!
//! A collection is an ordered list of fixed-capacity row blocks; a second,
//! width-1 collection serves as the byte heap for variable-length values.
//! Row references and heap references are packed u64 values, never
//! addresses, so blocks stay relocatable across merges and spill rounds.

use std::sync::Arc;

use hashbrown::HashMap;

use crate::runtime::buffer_manager::{BlockHandle, BufferManager};

/// Sentinel for "no row": the end of a hash chain.
pub const NULL_ROW: u64 = 0;

/// Pack a (block index, row index) pair. The block index is biased by one so
/// the packed value is never `NULL_ROW`.
pub fn pack_row_ptr(block: usize, row: usize) -> u64 {
    ((block as u64 + 1) << 32) | row as u64
}

pub fn unpack_row_ptr(ptr: u64) -> (usize, usize) {
    (((ptr >> 32) - 1) as usize, (ptr & 0xFFFF_FFFF) as usize)
}

/// Pack an absolute heap reference: process-unique block id plus byte offset.
/// Block ids survive merges, so row bytes never go stale when blocks move
/// between collections.
pub fn pack_heap_ref(block_id: u32, offset: u32) -> u64 {
    ((block_id as u64) << 32) | offset as u64
}

pub fn unpack_heap_ref(heap_ref: u64) -> (u32, u32) {
    ((heap_ref >> 32) as u32, (heap_ref & 0xFFFF_FFFF) as u32)
}

/// One block of rows (or heap bytes, for width-1 collections).
#[derive(Debug)]
pub struct RowBlock {
    handle: BlockHandle,
    /// Rows for data blocks, bytes for heap blocks.
    capacity: usize,
    /// Rows for data blocks, bytes for heap blocks.
    count: usize,
}

impl RowBlock {
    pub fn id(&self) -> u32 {
        self.handle.id()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn data(&self) -> &[u8] {
        self.handle.data()
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.handle.data_mut()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.handle.len()
    }
}

/// Ordered list of row blocks with append, atomic merge and clear.
#[derive(Debug)]
pub struct RowDataCollection {
    manager: Arc<BufferManager>,
    row_width: usize,
    /// Rows per block (data) or bytes per block (heap).
    block_capacity: usize,
    is_heap: bool,
    blocks: Vec<RowBlock>,
    count: usize,
    block_index_by_id: HashMap<u32, usize>,
}

impl RowDataCollection {
    pub fn new_rows(
        manager: Arc<BufferManager>,
        block_capacity: usize,
        row_width: usize,
    ) -> Result<Self, String> {
        if row_width == 0 || block_capacity == 0 {
            return Err("row collection requires positive width and capacity".to_string());
        }
        Ok(Self {
            manager,
            row_width,
            block_capacity,
            is_heap: false,
            blocks: Vec::new(),
            count: 0,
            block_index_by_id: HashMap::new(),
        })
    }

    pub fn new_heap(manager: Arc<BufferManager>, block_capacity_bytes: usize) -> Result<Self, String> {
        if block_capacity_bytes == 0 {
            return Err("heap collection requires positive block capacity".to_string());
        }
        Ok(Self {
            manager,
            row_width: 1,
            block_capacity: block_capacity_bytes,
            is_heap: true,
            blocks: Vec::new(),
            count: 0,
            block_index_by_id: HashMap::new(),
        })
    }

    /// A collection with identical configuration and no blocks.
    pub fn copy_empty(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            row_width: self.row_width,
            block_capacity: self.block_capacity,
            is_heap: self.is_heap,
            blocks: Vec::new(),
            count: 0,
            block_index_by_id: HashMap::new(),
        }
    }

    pub fn manager(&self) -> &Arc<BufferManager> {
        &self.manager
    }

    pub fn row_width(&self) -> usize {
        self.row_width
    }

    pub fn block_capacity(&self) -> usize {
        self.block_capacity
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, idx: usize) -> Result<&RowBlock, String> {
        self.blocks
            .get(idx)
            .ok_or_else(|| format!("block {} out of bounds ({} blocks)", idx, self.blocks.len()))
    }

    pub fn block_mut(&mut self, idx: usize) -> Result<&mut RowBlock, String> {
        let len = self.blocks.len();
        self.blocks
            .get_mut(idx)
            .ok_or_else(|| format!("block {} out of bounds ({} blocks)", idx, len))
    }

    pub fn blocks(&self) -> &[RowBlock] {
        &self.blocks
    }

    pub fn size_in_bytes(&self) -> usize {
        self.blocks.iter().map(|b| b.allocated_bytes()).sum()
    }

    fn register_block(&mut self, block: RowBlock) -> usize {
        let idx = self.blocks.len();
        self.block_index_by_id.insert(block.id(), idx);
        self.blocks.push(block);
        idx
    }

    /// Allocate a fresh block at the tail of this collection.
    pub fn start_new_block(&mut self) -> Result<usize, String> {
        let bytes = if self.is_heap {
            self.block_capacity
        } else {
            self.block_capacity
                .checked_mul(self.row_width)
                .ok_or_else(|| "block byte size overflow".to_string())?
        };
        let handle = self.manager.allocate(bytes)?;
        Ok(self.register_block(RowBlock {
            handle,
            capacity: self.block_capacity,
            count: 0,
        }))
    }

    /// Allocate a fresh heap block sized at least `min_bytes`. Used where a
    /// data block must pair with its own dedicated heap block.
    pub fn start_new_heap_block(&mut self, min_bytes: usize) -> Result<usize, String> {
        let bytes = self.block_capacity.max(min_bytes);
        let handle = self.manager.allocate(bytes)?;
        Ok(self.register_block(RowBlock {
            handle,
            capacity: bytes,
            count: 0,
        }))
    }

    /// Reserve `n` row slots, possibly spanning blocks; returns packed row
    /// pointers in order. Atomic: either all rows are reserved or none.
    pub fn append(&mut self, n: usize) -> Result<Vec<u64>, String> {
        if self.is_heap {
            return Err("append() is for row collections; use reserve_blob for heaps".to_string());
        }
        let mut ptrs = Vec::with_capacity(n);
        let mut remaining = n;
        // Probe the full allocation first so a failed block allocation cannot
        // leave a partial append behind.
        let mut planned: Vec<(usize, usize, usize)> = Vec::new();
        let mut virt_last = self.blocks.len().checked_sub(1);
        let mut virt_last_count = virt_last.map(|i| self.blocks[i].count).unwrap_or(0);
        let mut new_blocks = 0usize;
        while remaining > 0 {
            let (block_idx, free) = match virt_last {
                Some(idx) if virt_last_count < self.block_capacity => {
                    (idx, self.block_capacity - virt_last_count)
                }
                _ => {
                    let idx = self.blocks.len() + new_blocks;
                    new_blocks += 1;
                    virt_last = Some(idx);
                    virt_last_count = 0;
                    (idx, self.block_capacity)
                }
            };
            let take = remaining.min(free);
            planned.push((block_idx, virt_last_count, take));
            virt_last_count += take;
            remaining -= take;
        }
        for _ in 0..new_blocks {
            self.start_new_block()?;
        }
        for (block_idx, first_row, take) in planned {
            let block = self.block_mut(block_idx)?;
            debug_assert_eq!(block.count, first_row);
            for row in first_row..first_row + take {
                ptrs.push(pack_row_ptr(block_idx, row));
            }
            block.count += take;
        }
        self.count += n;
        Ok(ptrs)
    }

    pub fn row(&self, ptr: u64) -> Result<&[u8], String> {
        let (block_idx, row_idx) = unpack_row_ptr(ptr);
        let width = self.row_width;
        let block = self.block(block_idx)?;
        if row_idx >= block.count {
            return Err(format!(
                "row {} out of bounds in block {} (count={})",
                row_idx, block_idx, block.count
            ));
        }
        let offset = row_idx * width;
        Ok(&block.data()[offset..offset + width])
    }

    pub fn row_mut(&mut self, ptr: u64) -> Result<&mut [u8], String> {
        let (block_idx, row_idx) = unpack_row_ptr(ptr);
        let width = self.row_width;
        let block = self.block_mut(block_idx)?;
        if row_idx >= block.count {
            return Err(format!(
                "row {} out of bounds in block {} (count={})",
                row_idx, block_idx, block.count
            ));
        }
        let offset = row_idx * width;
        Ok(&mut block.data_mut()[offset..offset + width])
    }

    /// Reserve a contiguous blob of `size` heap bytes; the blob never spans
    /// blocks. Returns the absolute heap reference of its first byte.
    pub fn reserve_blob(&mut self, size: usize) -> Result<u64, String> {
        if !self.is_heap {
            return Err("reserve_blob() is for heap collections".to_string());
        }
        if size > u32::MAX as usize {
            return Err(format!("heap blob of {} bytes exceeds the reference range", size));
        }
        let needs_new = match self.blocks.last() {
            Some(block) => block.capacity - block.count < size,
            None => true,
        };
        if needs_new {
            self.start_new_heap_block(size)?;
        }
        let block = self.blocks.last_mut().expect("heap block present");
        let offset = block.count as u32;
        block.count += size;
        self.count += size;
        Ok(pack_heap_ref(block.id(), offset))
    }

    fn block_idx_by_id(&self, block_id: u32) -> Result<usize, String> {
        self.block_index_by_id
            .get(&block_id)
            .copied()
            .ok_or_else(|| format!("heap block id {} not in collection", block_id))
    }

    pub fn blob(&self, heap_ref: u64, len: usize) -> Result<&[u8], String> {
        let (block_id, offset) = unpack_heap_ref(heap_ref);
        let block = self.block(self.block_idx_by_id(block_id)?)?;
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .ok_or_else(|| "heap reference overflow".to_string())?;
        if end > block.count {
            return Err(format!(
                "heap reference {}..{} out of bounds in block {} (used={})",
                start, end, block_id, block.count
            ));
        }
        Ok(&block.data()[start..end])
    }

    pub fn blob_mut(&mut self, heap_ref: u64, len: usize) -> Result<&mut [u8], String> {
        let (block_id, offset) = unpack_heap_ref(heap_ref);
        let idx = self.block_idx_by_id(block_id)?;
        let block = self.block_mut(idx)?;
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .ok_or_else(|| "heap reference overflow".to_string())?;
        if end > block.count {
            return Err(format!(
                "heap reference {}..{} out of bounds in block {} (used={})",
                start, end, block_id, block.count
            ));
        }
        Ok(&mut block.data_mut()[start..end])
    }

    /// Append bytes into the collection's last heap block, growing it as
    /// needed. Used by the partitioner, which keeps a 1:1 pairing between
    /// each data block and the heap block opened with it.
    pub fn append_bytes_to_last_grow(&mut self, bytes: &[u8]) -> Result<u32, String> {
        if !self.is_heap {
            return Err("append_bytes_to_last_grow() is for heap collections".to_string());
        }
        if self.blocks.is_empty() {
            self.start_new_heap_block(bytes.len())?;
        }
        let manager = Arc::clone(&self.manager);
        let block = self.blocks.last_mut().expect("heap block present");
        let offset = block.count;
        let needed = offset + bytes.len();
        if needed > block.handle.len() {
            let additional = needed - block.handle.len();
            block.handle.grow(additional.max(4096), &manager)?;
            block.capacity = block.handle.len();
        }
        block.data_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
        block.count = needed;
        self.count += bytes.len();
        Ok(offset as u32)
    }

    /// Append `n` packed rows to the last block; the caller guarantees they
    /// fit (partitioner flush path, block capacity aligned to its buffer).
    pub fn append_rows_to_last(&mut self, rows: &[u8], n: usize) -> Result<(usize, usize), String> {
        if self.is_heap {
            return Err("append_rows_to_last() is for row collections".to_string());
        }
        if rows.len() != n * self.row_width {
            return Err(format!(
                "append_rows_to_last byte mismatch: {} bytes for {} rows of width {}",
                rows.len(),
                n,
                self.row_width
            ));
        }
        if self.blocks.is_empty() {
            self.start_new_block()?;
        }
        let block_idx = self.blocks.len() - 1;
        let width = self.row_width;
        let block = self.blocks.last_mut().expect("block present");
        if block.count + n > block.capacity {
            return Err(format!(
                "append_rows_to_last overflow: {} rows into block with {} free",
                n,
                block.capacity - block.count
            ));
        }
        let first_row = block.count;
        let offset = first_row * width;
        block.data_mut()[offset..offset + rows.len()].copy_from_slice(rows);
        block.count += n;
        self.count += n;
        Ok((block_idx, first_row))
    }

    pub fn last_block_remaining(&self) -> usize {
        match self.blocks.last() {
            Some(block) => block.capacity - block.count,
            None => 0,
        }
    }

    /// Move all blocks from `other` into this collection; `other` is empty on
    /// return. Configurations must match.
    pub fn merge(&mut self, other: &mut RowDataCollection) -> Result<(), String> {
        if self.row_width != other.row_width || self.is_heap != other.is_heap {
            return Err(format!(
                "cannot merge collections with different configuration: width {} vs {}",
                self.row_width, other.row_width
            ));
        }
        for block in other.blocks.drain(..) {
            self.block_index_by_id.insert(block.id(), self.blocks.len());
            self.blocks.push(block);
        }
        self.count += other.count;
        other.count = 0;
        other.block_index_by_id.clear();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.block_index_by_id.clear();
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use crate::runtime::buffer_manager::BufferManager;

    use super::{RowDataCollection, pack_heap_ref, pack_row_ptr, unpack_heap_ref, unpack_row_ptr};

    #[test]
    fn test_row_ptr_packing_is_never_null() {
        let ptr = pack_row_ptr(0, 0);
        assert_ne!(ptr, super::NULL_ROW);
        assert_eq!(unpack_row_ptr(ptr), (0, 0));
        assert_eq!(unpack_row_ptr(pack_row_ptr(7, 123)), (7, 123));
    }

    #[test]
    fn test_heap_ref_packing() {
        let r = pack_heap_ref(42, 1000);
        assert_eq!(unpack_heap_ref(r), (42, 1000));
    }

    #[test]
    fn test_append_spans_blocks() {
        let mgr = BufferManager::unbounded();
        let mut col = RowDataCollection::new_rows(mgr, 4, 8).unwrap();
        let ptrs = col.append(10).unwrap();
        assert_eq!(ptrs.len(), 10);
        assert_eq!(col.count(), 10);
        assert_eq!(col.num_blocks(), 3);
        // every row reachable exactly once, in order
        for (i, ptr) in ptrs.iter().enumerate() {
            let (block, row) = unpack_row_ptr(*ptr);
            assert_eq!(block, i / 4);
            assert_eq!(row, i % 4);
            assert_eq!(col.row(*ptr).unwrap().len(), 8);
        }
    }

    #[test]
    fn test_append_continues_partial_block() {
        let mgr = BufferManager::unbounded();
        let mut col = RowDataCollection::new_rows(mgr, 4, 8).unwrap();
        col.append(3).unwrap();
        let ptrs = col.append(2).unwrap();
        assert_eq!(unpack_row_ptr(ptrs[0]), (0, 3));
        assert_eq!(unpack_row_ptr(ptrs[1]), (1, 0));
        assert_eq!(col.num_blocks(), 2);
    }

    #[test]
    fn test_merge_moves_all_blocks() {
        let mgr = BufferManager::unbounded();
        let mut a = RowDataCollection::new_rows(mgr.clone(), 4, 8).unwrap();
        let mut b = a.copy_empty();
        a.append(2).unwrap();
        b.append(5).unwrap();
        a.merge(&mut b).unwrap();
        assert_eq!(a.count(), 7);
        assert_eq!(a.num_blocks(), 3);
        assert_eq!(b.count(), 0);
        assert_eq!(b.num_blocks(), 0);
    }

    #[test]
    fn test_heap_blobs_are_contiguous() {
        let mgr = BufferManager::unbounded();
        let mut heap = RowDataCollection::new_heap(mgr, 16).unwrap();
        let a = heap.reserve_blob(10).unwrap();
        heap.blob_mut(a, 10).unwrap().copy_from_slice(b"0123456789");
        // 10 bytes left out of 16 cannot host 10 more in the same block
        let b = heap.reserve_blob(10).unwrap();
        heap.blob_mut(b, 10).unwrap().copy_from_slice(b"abcdefghij");
        assert_eq!(heap.num_blocks(), 2);
        assert_eq!(heap.blob(a, 10).unwrap(), b"0123456789");
        assert_eq!(heap.blob(b, 10).unwrap(), b"abcdefghij");
        let (id_a, off_a) = unpack_heap_ref(a);
        let (id_b, _) = unpack_heap_ref(b);
        assert_ne!(id_a, id_b);
        assert_eq!(off_a, 0);
    }

    #[test]
    fn test_blob_survives_merge() {
        let mgr = BufferManager::unbounded();
        let mut a = RowDataCollection::new_heap(mgr.clone(), 16).unwrap();
        let mut b = RowDataCollection::new_heap(mgr, 16).unwrap();
        let other_ref = b.reserve_blob(4).unwrap();
        b.blob_mut(other_ref, 4).unwrap().copy_from_slice(b"abcd");
        a.reserve_blob(4).unwrap();
        a.merge(&mut b).unwrap();
        // the reference keyed by stable block id still resolves after the move
        assert_eq!(a.blob(other_ref, 4).unwrap(), b"abcd");
    }
}
