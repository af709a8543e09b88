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
//! Chained hash table over the row store.
//!
//! Build appends tuples into per-worker tables; finalize allocates a
//! power-of-two slot array and pushes every tuple onto its chain through the
//! in-row next slot (LIFO, so chain order is the reverse of insertion).
//! When the merged table exceeds the memory budget, the radix-partitioned
//! path swizzles blocks, partitions them by the top hash bits, and finalizes
//! one memory-sized group of partitions per round.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use arrow::array::{Array, ArrayRef, UInt32Array, new_null_array};
use arrow::compute::take;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

use crate::basalt_logging::debug;
use crate::common::config;
use crate::exec::chunk::Chunk;
use crate::exec::hashjoin::condition::{
    JoinComparison, JoinCondition, JoinType, join_type_str, validate_conditions,
};
use crate::exec::hashjoin::correlated_mark::CorrelatedMarkState;
use crate::exec::hashjoin::hash::hash_keys;
use crate::exec::hashjoin::radix::{self, Histogram, TMP_BUF_SIZE};
use crate::exec::hashjoin::scan_structure::ScanStructure;
use crate::exec::row::collection::{NULL_ROW, RowDataCollection, pack_row_ptr, unpack_row_ptr};
use crate::exec::row::layout::{RowLayout, read_u64, write_u64};
use crate::exec::row::ops::{ColumnView, gather_column, scatter};
use crate::exec::row::swizzle::{
    swizzle_columns, swizzle_heap_pointer, swizzled_blob_len, unswizzle_pointers,
};
use crate::runtime::buffer_manager::BufferManager;

#[derive(Debug, Default)]
struct PartitionSet {
    blocks: Vec<RowDataCollection>,
    heaps: Vec<RowDataCollection>,
}

/// Shared cursor for sequential scans over the stored tuples (full-outer
/// completion, re-reading sunk probe rows between external rounds).
#[derive(Debug, Default)]
pub struct JoinHTScanState {
    pos: Mutex<ScanPosition>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ScanPosition {
    block_position: usize,
    position: usize,
}

impl JoinHTScanState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        let mut pos = self.pos.lock().expect("scan state lock");
        *pos = ScanPosition::default();
    }
}

#[derive(Debug)]
pub struct JoinHashTable {
    pub(crate) buffer_manager: Arc<BufferManager>,
    pub(crate) conditions: Vec<JoinCondition>,
    pub(crate) predicates: Vec<JoinComparison>,
    pub(crate) null_values_are_equal: Vec<bool>,
    pub(crate) condition_types: Vec<DataType>,
    pub(crate) equality_count: usize,
    pub(crate) build_types: Vec<DataType>,
    pub(crate) join_type: JoinType,
    pub(crate) layout: RowLayout,
    pub(crate) vector_size: usize,
    memory_budget: usize,
    pub(crate) block_collection: RowDataCollection,
    pub(crate) string_heap: RowDataCollection,
    swizzled_block_collection: RowDataCollection,
    swizzled_string_heap: RowDataCollection,
    partitions: Mutex<PartitionSet>,
    histogram: Mutex<Histogram>,
    finalize_lock: Mutex<()>,
    finalized: AtomicBool,
    has_null: AtomicBool,
    pub(crate) hash_map: Vec<u64>,
    pub(crate) bitmask: u64,
    found_flags: Vec<AtomicU8>,
    block_row_offsets: Vec<usize>,
    pub(crate) partition_cutoff: usize,
    pub(crate) correlated_mark: Option<Mutex<CorrelatedMarkState>>,
}

impl JoinHashTable {
    pub fn new(
        buffer_manager: Arc<BufferManager>,
        conditions: Vec<JoinCondition>,
        build_types: Vec<DataType>,
        join_type: JoinType,
    ) -> Result<Self, String> {
        let equality_count = validate_conditions(&conditions)?;
        let predicates: Vec<JoinComparison> = conditions.iter().map(|c| c.comparison).collect();
        let null_values_are_equal: Vec<bool> = conditions
            .iter()
            .map(|c| c.comparison.null_values_are_equal())
            .collect();
        let condition_types: Vec<DataType> =
            conditions.iter().map(|c| c.data_type.clone()).collect();

        let mut layout_types = condition_types.clone();
        layout_types.extend(build_types.iter().cloned());
        let layout = RowLayout::new(layout_types)?;

        let vector_size = config::vector_size();
        let block_size = config::block_size_bytes();
        let initial_radix_bits = config::initial_radix_bits();
        let memory_budget = config::join_memory_budget_bytes();

        // Block capacity is a multiple of the radix tmp-buffer size so the
        // partitioner can emit whole buffers without tail bookkeeping.
        let mut block_capacity = vector_size.max(block_size / layout.row_width() + 1);
        block_capacity += TMP_BUF_SIZE - (block_capacity % TMP_BUF_SIZE);

        let block_collection =
            RowDataCollection::new_rows(Arc::clone(&buffer_manager), block_capacity, layout.row_width())?;
        let string_heap = RowDataCollection::new_heap(Arc::clone(&buffer_manager), block_size)?;
        let swizzled_block_collection = block_collection.copy_empty();
        let swizzled_string_heap = string_heap.copy_empty();

        Ok(Self {
            buffer_manager,
            conditions,
            predicates,
            null_values_are_equal,
            condition_types,
            equality_count,
            build_types,
            join_type,
            layout,
            vector_size,
            memory_budget,
            block_collection,
            string_heap,
            swizzled_block_collection,
            swizzled_string_heap,
            partitions: Mutex::new(PartitionSet::default()),
            histogram: Mutex::new(Histogram::new(initial_radix_bits)),
            finalize_lock: Mutex::new(()),
            finalized: AtomicBool::new(false),
            has_null: AtomicBool::new(false),
            hash_map: Vec::new(),
            bitmask: 0,
            found_flags: Vec::new(),
            block_row_offsets: Vec::new(),
            partition_cutoff: 0,
            correlated_mark: None,
        })
    }

    /// A fresh table with identical configuration (per-worker locals, probe
    /// sink tables).
    pub fn copy_empty(&self) -> Result<JoinHashTable, String> {
        JoinHashTable::new(
            Arc::clone(&self.buffer_manager),
            self.conditions.clone(),
            self.build_types.clone(),
            self.join_type,
        )
    }

    /// Enable the correlated mark companion; the key chunks then carry the
    /// correlated columns followed by the mark key column.
    pub fn init_correlated_mark(&mut self, correlated_types: Vec<DataType>) -> Result<(), String> {
        if self.join_type != JoinType::Mark {
            return Err("correlated companion requires a mark join".to_string());
        }
        if correlated_types.len() + 1 != self.condition_types.len() {
            return Err(format!(
                "correlated mark expects {} conditions for {} correlated columns",
                correlated_types.len() + 1,
                self.condition_types.len()
            ));
        }
        self.correlated_mark = Some(Mutex::new(CorrelatedMarkState::new(correlated_types)?));
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.block_collection.count()
    }

    pub fn swizzled_count(&self) -> usize {
        self.swizzled_block_collection.count()
    }

    /// Bytes used by the swizzled heap (string payload of sealed locals).
    pub fn swizzled_heap_bytes(&self) -> usize {
        self.swizzled_string_heap.count()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    pub fn has_null(&self) -> bool {
        self.has_null.load(Ordering::Acquire)
    }

    pub fn join_type(&self) -> JoinType {
        self.join_type
    }

    pub fn size_in_bytes(&self) -> usize {
        self.block_collection.size_in_bytes() + self.string_heap.size_in_bytes()
    }

    pub fn swizzled_size_in_bytes(&self) -> usize {
        self.swizzled_block_collection.size_in_bytes() + self.swizzled_string_heap.size_in_bytes()
    }

    pub fn memory_budget(&self) -> usize {
        self.memory_budget
    }

    /// Override the configured memory budget; the external path sizes its
    /// histogram reduction and per-round partition groups with this.
    pub fn set_memory_budget(&mut self, bytes: usize) {
        self.memory_budget = bytes;
    }

    pub fn current_radix_bits(&self) -> usize {
        self.histogram.lock().expect("histogram lock").bits()
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.lock().expect("partition lock").blocks.len()
    }

    pub fn partition_cutoff(&self) -> usize {
        self.partition_cutoff
    }

    /// Filter lanes carrying NULL in a column whose comparison does not treat
    /// NULL as equal. Right/full outer builds keep every row.
    fn prepare_keys(&self, keys: &Chunk, build_side: bool) -> Result<Vec<u32>, String> {
        let mut sel: Vec<u32> = (0..keys.len() as u32).collect();
        if build_side && self.join_type.is_right_outer() {
            return Ok(sel);
        }
        for col in 0..keys.num_columns().min(self.conditions.len()) {
            if self.null_values_are_equal[col] {
                continue;
            }
            let array = keys.column(col)?;
            if array.null_count() == 0 {
                continue;
            }
            let view = ColumnView::try_new(array)?;
            sel.retain(|&lane| !view.is_null(lane as usize));
        }
        Ok(sel)
    }

    fn check_key_types(&self, keys: &Chunk) -> Result<(), String> {
        if keys.num_columns() != self.condition_types.len() {
            return Err(format!(
                "key column count mismatch: expected {} got {}",
                self.condition_types.len(),
                keys.num_columns()
            ));
        }
        for (idx, expected) in self.condition_types.iter().enumerate() {
            let actual = keys.column(idx)?.data_type();
            if actual != expected {
                return Err(format!(
                    "key column {} type mismatch: expected {:?} got {:?}",
                    idx, expected, actual
                ));
            }
        }
        Ok(())
    }

    /// Append one build batch: key preparation, hashing over the equality
    /// prefix, scatter into row memory, histogram update.
    pub fn build(&mut self, keys: &Chunk, payload: &Chunk) -> Result<(), String> {
        if self.is_finalized() {
            return Err("hash table already finalized".to_string());
        }
        if keys.len() != payload.len() {
            return Err(format!(
                "build keys/payload cardinality mismatch: {} vs {}",
                keys.len(),
                payload.len()
            ));
        }
        if keys.is_empty() {
            return Ok(());
        }
        self.check_key_types(keys)?;
        if payload.num_columns() != self.build_types.len() {
            return Err(format!(
                "payload column count mismatch: expected {} got {}",
                self.build_types.len(),
                payload.num_columns()
            ));
        }

        if self.join_type == JoinType::Mark {
            if let Some(correlated) = self.correlated_mark.as_ref() {
                let mut state = correlated.lock().expect("correlated mark lock");
                let correlated_count = state.correlated_count();
                let groups = &keys.columns()[..correlated_count];
                let key_col = keys.column(correlated_count)?;
                state.add_chunk(groups, key_col)?;
            }
        }

        let sel = self.prepare_keys(keys, true)?;
        let added_count = sel.len();
        if added_count < keys.len() {
            self.has_null.store(true, Ordering::Release);
        }
        if added_count == 0 {
            return Ok(());
        }

        let ptrs = self.block_collection.append(added_count)?;

        let key_views = ColumnView::try_new_all(keys.columns())?;
        let mut hashes = vec![0u64; keys.len()];
        hash_keys(&key_views[..self.equality_count], &sel, &mut hashes);

        let payload_views = ColumnView::try_new_all(payload.columns())?;
        let mut all_views = key_views;
        all_views.extend(payload_views);
        scatter(
            &all_views,
            &self.layout,
            &mut self.block_collection,
            &mut self.string_heap,
            &ptrs,
            &sel,
        )?;

        // Hash and chain slots live outside the column area.
        let hash_offset = self.layout.hash_offset();
        let next_offset = self.layout.next_offset();
        for (i, &lane) in sel.iter().enumerate() {
            let row = self.block_collection.row_mut(ptrs[i])?;
            write_u64(row, hash_offset, hashes[lane as usize]);
            write_u64(row, next_offset, NULL_ROW);
        }

        self.histogram
            .lock()
            .expect("histogram lock")
            .update(&hashes, Some(&sel), added_count);
        Ok(())
    }

    /// Move all rows (and partitions) of `other` into this table.
    pub fn merge(&mut self, other: &mut JoinHashTable) -> Result<(), String> {
        self.block_collection.merge(&mut other.block_collection)?;
        self.swizzled_block_collection
            .merge(&mut other.swizzled_block_collection)?;
        if !self.layout.all_constant() {
            self.string_heap.merge(&mut other.string_heap)?;
            self.swizzled_string_heap
                .merge(&mut other.swizzled_string_heap)?;
        }
        self.merge_partitions(other)?;
        Ok(())
    }

    /// Merge only the partition collections; safe to call concurrently from
    /// partition tasks against a shared global table.
    pub fn merge_partitions(&self, other: &mut JoinHashTable) -> Result<(), String> {
        let mut mine = self.partitions.lock().expect("partition lock");
        let theirs = other.partitions.get_mut().expect("partition lock");
        if !theirs.blocks.is_empty() {
            if mine.blocks.is_empty() {
                mine.blocks = std::mem::take(&mut theirs.blocks);
                mine.heaps = std::mem::take(&mut theirs.heaps);
            } else {
                if mine.blocks.len() != theirs.blocks.len() {
                    return Err(format!(
                        "partition count mismatch in merge: {} vs {}",
                        mine.blocks.len(),
                        theirs.blocks.len()
                    ));
                }
                for (dst, src) in mine.blocks.iter_mut().zip(theirs.blocks.iter_mut()) {
                    dst.merge(src)?;
                }
                for (dst, src) in mine.heaps.iter_mut().zip(theirs.heaps.iter_mut()) {
                    dst.merge(src)?;
                }
            }
        }
        if other.has_null() {
            self.has_null.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Add another worker's histogram into this one. Both sides must still be
    /// at the initial radix width.
    pub fn merge_histogram(&self, other: &JoinHashTable) -> Result<(), String> {
        let mut mine = self.histogram.lock().expect("histogram lock");
        let theirs = other.histogram.lock().expect("histogram lock");
        mine.merge(&theirs)
    }

    /// Build the chained table: allocate the slot array and push every stored
    /// row onto its chain. Single-threaded.
    pub fn finalize(&mut self) -> Result<(), String> {
        if self.is_finalized() {
            return Err("hash table already finalized".to_string());
        }
        let count = self.count() as u64;
        let min_capacity = (config::block_size_bytes() / std::mem::size_of::<u64>() + 1) as u64;
        let capacity = (count * 2).max(min_capacity).next_power_of_two();
        self.bitmask = capacity - 1;
        self.hash_map = vec![NULL_ROW; capacity as usize];

        self.block_row_offsets.clear();
        let mut offset = 0usize;
        for block in self.block_collection.blocks() {
            self.block_row_offsets.push(offset);
            offset += block.count();
        }
        if self.join_type.is_right_outer() {
            self.found_flags = (0..offset).map(|_| AtomicU8::new(0)).collect();
        }

        let hash_offset = self.layout.hash_offset();
        let next_offset = self.layout.next_offset();
        let width = self.layout.row_width();
        for block_idx in 0..self.block_collection.num_blocks() {
            let block_count = self.block_collection.block(block_idx)?.count();
            for row_idx in 0..block_count {
                let ptr = pack_row_ptr(block_idx, row_idx);
                let row = self.block_collection.row(ptr)?;
                let hash = read_u64(row, hash_offset);
                let slot = (hash & self.bitmask) as usize;
                let head = self.hash_map[slot];
                let row_start = row_idx * width;
                let block = self.block_collection.block_mut(block_idx)?;
                write_u64(
                    &mut block.data_mut()[row_start..row_start + width],
                    next_offset,
                    head,
                );
                self.hash_map[slot] = ptr;
            }
        }

        self.finalized.store(true, Ordering::Release);
        debug!(
            "hash table finalized: join_type={} rows={} capacity={} blocks={}",
            join_type_str(self.join_type),
            count,
            capacity,
            self.block_collection.num_blocks()
        );
        Ok(())
    }

    pub(crate) fn next_row_ptr(&self, ptr: u64) -> Result<u64, String> {
        let row = self.block_collection.row(ptr)?;
        Ok(read_u64(row, self.layout.next_offset()))
    }

    pub(crate) fn set_found(&self, ptr: u64) -> Result<(), String> {
        let (block_idx, row_idx) = unpack_row_ptr(ptr);
        let offset = self
            .block_row_offsets
            .get(block_idx)
            .ok_or_else(|| "found flag block out of bounds".to_string())?;
        let flag = self
            .found_flags
            .get(offset + row_idx)
            .ok_or_else(|| "found flag row out of bounds".to_string())?;
        // Concurrent probes only ever write `true`; the pipeline barrier
        // before the full-outer scan orders these against the reads.
        flag.store(1, Ordering::Release);
        Ok(())
    }

    fn found(&self, seq: usize) -> bool {
        self.found_flags[seq].load(Ordering::Acquire) != 0
    }

    /// Probe one batch: prepare keys, hash, load chain heads. Lanes whose
    /// slot is empty drop out immediately.
    pub fn probe(&self, keys: &Chunk) -> Result<ScanStructure<'_>, String> {
        if !self.is_finalized() {
            return Err("probe requires a finalized hash table".to_string());
        }
        self.check_key_types(keys)?;
        let sel = self.prepare_keys(keys, false)?;
        let mut ss = ScanStructure::new(self, keys.clone(), sel);
        if self.count() > 0 && !ss.prepared_sel().is_empty() {
            let hashes = self.hash_probe_keys(keys, ss.prepared_sel())?;
            ss.init_pointers(&hashes);
        }
        Ok(ss)
    }

    fn hash_probe_keys(&self, keys: &Chunk, sel: &[u32]) -> Result<Vec<u64>, String> {
        let views = ColumnView::try_new_all(&keys.columns()[..self.equality_count])?;
        let mut hashes = vec![0u64; keys.len()];
        hash_keys(&views, sel, &mut hashes);
        Ok(hashes)
    }

    /// External probe: route lanes whose partition is loaded to the scan
    /// structure, sink the rest into `sink` for a later round.
    pub fn probe_and_build(
        &self,
        keys: &Chunk,
        payload: &Chunk,
        sink: &mut JoinHashTable,
    ) -> Result<ScanStructure<'_>, String> {
        if !self.is_finalized() {
            return Err("probe requires a finalized hash table".to_string());
        }
        self.check_key_types(keys)?;
        let sel = self.prepare_keys(keys, false)?;
        let mut ss = ScanStructure::new(self, keys.clone(), sel);
        if ss.prepared_sel().is_empty() {
            return Ok(ss);
        }
        let hashes = self.hash_probe_keys(keys, ss.prepared_sel())?;

        let bits = self.current_radix_bits();
        let mut true_sel = Vec::new();
        let mut false_sel = Vec::new();
        radix::select(
            &hashes,
            ss.prepared_sel(),
            bits,
            self.partition_cutoff,
            &mut true_sel,
            &mut false_sel,
        );

        if !false_sel.is_empty() {
            let sink_keys = take_chunk(keys, &false_sel)?;
            let sink_payload = take_chunk(payload, &false_sel)?;
            sink.build(&sink_keys, &sink_payload)?;
        }

        ss.set_prepared_sel(true_sel);
        if self.count() > 0 && !ss.prepared_sel().is_empty() {
            ss.init_pointers(&hashes);
        }
        Ok(ss)
    }

    /// Emit build rows never matched during probing, with the probe side
    /// NULL. Returns an empty chunk once the scan is exhausted.
    pub fn scan_full_outer(
        &self,
        state: &JoinHTScanState,
        left_types: &[DataType],
    ) -> Result<Chunk, String> {
        if !self.join_type.is_right_outer() {
            return Err("full-outer scan requires a right or full outer join".to_string());
        }
        if !self.is_finalized() {
            return Err("full-outer scan requires a finalized hash table".to_string());
        }
        let mut ptrs: Vec<u64> = Vec::with_capacity(self.vector_size);
        {
            let mut pos = state.pos.lock().expect("scan state lock");
            while pos.block_position < self.block_collection.num_blocks() {
                let block_count = self.block_collection.block(pos.block_position)?.count();
                let base = self.block_row_offsets[pos.block_position];
                while pos.position < block_count {
                    let row_idx = pos.position;
                    pos.position += 1;
                    if !self.found(base + row_idx) {
                        ptrs.push(pack_row_ptr(pos.block_position, row_idx));
                        if ptrs.len() == self.vector_size {
                            break;
                        }
                    }
                }
                if ptrs.len() == self.vector_size {
                    break;
                }
                if pos.position == block_count {
                    pos.block_position += 1;
                    pos.position = 0;
                }
            }
        }

        let found_entries = ptrs.len();
        let mut fields: Vec<Field> = left_types
            .iter()
            .enumerate()
            .map(|(i, t)| Field::new(format!("c{i}"), t.clone(), true))
            .collect();
        for (i, t) in self.build_types.iter().enumerate() {
            fields.push(Field::new(format!("rhs{i}"), t.clone(), true));
        }
        let schema: SchemaRef = Arc::new(Schema::new(fields));
        if found_entries == 0 {
            return Ok(Chunk::new(arrow::array::RecordBatch::new_empty(schema)));
        }

        let mut columns: Vec<ArrayRef> = left_types
            .iter()
            .map(|t| new_null_array(t, found_entries))
            .collect();
        let ptr_sel: Vec<u32> = (0..found_entries as u32).collect();
        for i in 0..self.build_types.len() {
            columns.push(gather_column(
                &self.block_collection,
                &self.string_heap,
                &self.layout,
                &ptrs,
                &ptr_sel,
                None,
                found_entries,
                self.condition_types.len() + i,
            )?);
        }
        let batch =
            arrow::array::RecordBatch::try_new(schema, columns).map_err(|e| e.to_string())?;
        Ok(Chunk::new(batch))
    }

    /// Advance the scan cursor by up to one vector of stored rows. Returns
    /// the snapshot to pass to `construct_probe_chunk`.
    pub fn get_scan_indices(&self, state: &JoinHTScanState) -> (usize, usize, usize) {
        let mut pos = state.pos.lock().expect("scan state lock");
        let start_block = pos.block_position;
        let start_row = pos.position;
        let mut count = 0usize;
        while pos.block_position < self.block_collection.num_blocks() && count < self.vector_size {
            let block_count = self
                .block_collection
                .block(pos.block_position)
                .map(|b| b.count())
                .unwrap_or(0);
            let take_rows = (block_count - pos.position).min(self.vector_size - count);
            pos.position += take_rows;
            count += take_rows;
            if pos.position == block_count {
                pos.block_position += 1;
                pos.position = 0;
            }
        }
        (start_block, start_row, count)
    }

    /// Materialize `count` stored tuples (keys then payload) starting at the
    /// given block/row position.
    pub fn construct_probe_chunk(
        &self,
        block_position: usize,
        position: usize,
        count: usize,
    ) -> Result<Chunk, String> {
        let mut ptrs = Vec::with_capacity(count);
        let mut block_idx = block_position;
        let mut row_idx = position;
        while ptrs.len() < count {
            let block_count = self.block_collection.block(block_idx)?.count();
            while row_idx < block_count && ptrs.len() < count {
                ptrs.push(pack_row_ptr(block_idx, row_idx));
                row_idx += 1;
            }
            if row_idx == block_count {
                block_idx += 1;
                row_idx = 0;
            }
        }
        let ptr_sel: Vec<u32> = (0..count as u32).collect();
        let mut columns = Vec::with_capacity(self.layout.column_count());
        for col in 0..self.layout.column_count() {
            columns.push(gather_column(
                &self.block_collection,
                &self.string_heap,
                &self.layout,
                &ptrs,
                &ptr_sel,
                None,
                count,
                col,
            )?);
        }
        Chunk::try_from_columns(columns)
    }

    /// Seal a local table for the external path: move data blocks into the
    /// swizzled collection, pairing each with a freshly built heap block and
    /// rewriting heap references to offsets.
    pub fn swizzle_collected_blocks(&mut self) -> Result<(), String> {
        if !self.swizzled_block_collection.is_empty() {
            return Err("blocks already swizzled".to_string());
        }
        self.swizzled_block_collection
            .merge(&mut self.block_collection)?;
        if self.layout.all_constant() {
            return Ok(());
        }

        let heap_offset = self
            .layout
            .heap_offset()
            .ok_or_else(|| "var-len layout missing heap slot".to_string())?;
        let width = self.layout.row_width();

        for block_idx in 0..self.swizzled_block_collection.num_blocks() {
            let n = self.swizzled_block_collection.block(block_idx)?.count();
            {
                let block = self.swizzled_block_collection.block_mut(block_idx)?;
                swizzle_columns(&self.layout, block.data_mut(), n)?;
            }

            // Group rows into runs over one source heap block; blobs within a
            // run are contiguous by construction.
            struct Run {
                src_block: usize,
                base_offset: u32,
                size: usize,
                first_row: usize,
                rows: usize,
            }
            let mut runs: Vec<Run> = Vec::new();
            {
                let block = self.swizzled_block_collection.block(block_idx)?;
                for row_idx in 0..n {
                    let row = &block.data()[row_idx * width..(row_idx + 1) * width];
                    let heap_ref = read_u64(row, heap_offset);
                    let (heap_block_id, blob_offset) =
                        crate::exec::row::collection::unpack_heap_ref(heap_ref);
                    let src_block = self
                        .string_heap
                        .blocks()
                        .iter()
                        .position(|b| b.id() == heap_block_id)
                        .ok_or_else(|| "heap block missing during swizzle".to_string())?;
                    let blob_len = swizzled_blob_len(&self.layout, row);
                    match runs.last_mut() {
                        Some(run) if run.src_block == src_block => {
                            run.size = (blob_offset as usize + blob_len) - run.base_offset as usize;
                            run.rows += 1;
                        }
                        _ => runs.push(Run {
                            src_block,
                            base_offset: blob_offset,
                            size: blob_len,
                            first_row: row_idx,
                            rows: 1,
                        }),
                    }
                }
            }

            let total: usize = runs.iter().map(|r| r.size).sum();
            self.swizzled_string_heap.start_new_heap_block(total)?;
            for run in &runs {
                let bytes = {
                    let src = self.string_heap.block(run.src_block)?;
                    src.data()[run.base_offset as usize..run.base_offset as usize + run.size]
                        .to_vec()
                };
                let bias = self.swizzled_string_heap.append_bytes_to_last_grow(&bytes)?;
                let block = self.swizzled_block_collection.block_mut(block_idx)?;
                swizzle_heap_pointer(
                    &self.layout,
                    block.data_mut(),
                    run.first_row,
                    run.rows,
                    run.base_offset,
                    bias as u64,
                )?;
            }
        }

        self.string_heap.clear();
        Ok(())
    }

    /// Rehydrate swizzled blocks: absolute heap references are restored from
    /// the 1:1 data/heap block pairing, then everything moves back into the
    /// resident collections.
    pub fn unswizzle_blocks(&mut self) -> Result<(), String> {
        if !self.layout.all_constant()
            && self.swizzled_block_collection.num_blocks() != self.swizzled_string_heap.num_blocks()
        {
            return Err(format!(
                "swizzled data/heap block pairing broken: {} vs {}",
                self.swizzled_block_collection.num_blocks(),
                self.swizzled_string_heap.num_blocks()
            ));
        }
        for block_idx in 0..self.swizzled_block_collection.num_blocks() {
            if !self.layout.all_constant() {
                let heap_block_id = self.swizzled_string_heap.block(block_idx)?.id();
                let block = self.swizzled_block_collection.block_mut(block_idx)?;
                let n = block.count();
                unswizzle_pointers(&self.layout, block.data_mut(), heap_block_id, n)?;
            }
        }
        self.block_collection
            .merge(&mut self.swizzled_block_collection)?;
        if !self.layout.all_constant() {
            self.string_heap.merge(&mut self.swizzled_string_heap)?;
        }
        Ok(())
    }

    /// Estimated partition fit check against the memory budget.
    pub(crate) fn partitions_fit_in_memory(&self, histogram: &Histogram, avg_row_size: usize) -> bool {
        histogram.max_count() as usize * avg_row_size <= self.memory_budget
    }

    /// Reduce the histogram to the coarsest split whose largest partition
    /// still fits the budget.
    pub fn reduce_histogram(&self, avg_string_size: usize) -> Result<(), String> {
        let avg_row_size = avg_string_size + self.layout.row_width();
        let mut hist = self.histogram.lock().expect("histogram lock");
        while hist.bits() > 1 {
            let reduced = hist.reduce(hist.bits() - 1)?;
            if self.partitions_fit_in_memory(&reduced, avg_row_size) {
                *hist = reduced;
            } else {
                break;
            }
        }
        debug!(
            "histogram reduced: radix_bits={} max_partition_rows={}",
            hist.bits(),
            hist.max_count()
        );
        Ok(())
    }

    /// Partition this (swizzled) local table by the global table's radix
    /// width, then hand the partitions to the global table.
    pub fn partition(&mut self, global: &JoinHashTable) -> Result<(), String> {
        {
            let parts = self.partitions.get_mut().expect("partition lock");
            if !parts.blocks.is_empty() {
                return Err("local table already partitioned".to_string());
            }
        }
        if !self.block_collection.is_empty() {
            return Err("partition requires swizzled blocks".to_string());
        }
        let bits = global.current_radix_bits();
        let pairs = radix::partition(
            &self.layout,
            &mut self.swizzled_block_collection,
            &mut self.swizzled_string_heap,
            bits,
        )?;
        let parts = self.partitions.get_mut().expect("partition lock");
        for (data, heap) in pairs {
            parts.blocks.push(data);
            parts.heaps.push(heap);
        }
        global.merge_partitions(self)?;
        Ok(())
    }

    /// Load the longest prefix of remaining partitions whose summed size fits
    /// the budget (always at least one) into the swizzled collections.
    fn pin_partitions(&mut self) -> Result<(), String> {
        let budget = self.memory_budget;
        let parts = self.partitions.get_mut().expect("partition lock");
        let start = self.partition_cutoff;
        if start >= parts.blocks.len() {
            return Err("no partitions left to pin".to_string());
        }
        let mut end = start;
        let mut total = 0usize;
        while end < parts.blocks.len() {
            let estimate = parts.blocks[end].count() * self.layout.row_width()
                + parts.heaps.get(end).map(|h| h.count()).unwrap_or(0);
            if end > start && total + estimate > budget {
                break;
            }
            total += estimate;
            end += 1;
        }
        for p in start..end {
            self.swizzled_block_collection.merge(&mut parts.blocks[p])?;
            if !self.layout.all_constant() {
                self.swizzled_string_heap.merge(&mut parts.heaps[p])?;
            }
        }
        debug!(
            "pinned partitions [{}, {}) of {} (~{} bytes)",
            start,
            end,
            parts.blocks.len(),
            total
        );
        self.partition_cutoff = end;
        Ok(())
    }

    /// First external round: pin a group of partitions, rehydrate them and
    /// build the chained table over just that group. Idempotent.
    pub fn finalize_external(&mut self) -> Result<(), String> {
        {
            let _guard = self.finalize_lock.lock().expect("finalize lock");
            if self.is_finalized() {
                return Ok(());
            }
        }
        self.pin_partitions()?;
        self.unswizzle_blocks()?;
        self.finalize()
    }

    /// True when partitions beyond the current cutoff still await a round.
    pub fn external_partitions_remaining(&self) -> bool {
        self.partition_cutoff < self.num_partitions()
    }

    /// Release the finalized round and build the table over the next group
    /// of partitions. Returns false when none remain.
    pub fn prepare_next_external_round(&mut self) -> Result<bool, String> {
        if !self.is_finalized() {
            return Err("prepare_next_external_round before finalize".to_string());
        }
        if !self.external_partitions_remaining() {
            return Ok(false);
        }
        self.block_collection.clear();
        self.string_heap.clear();
        self.hash_map = Vec::new();
        self.bitmask = 0;
        self.found_flags = Vec::new();
        self.block_row_offsets.clear();
        self.finalized.store(false, Ordering::Release);

        self.pin_partitions()?;
        self.unswizzle_blocks()?;
        self.finalize()?;
        Ok(true)
    }

    /// Sync the probe sink's cutoff with the build table and reset the scan
    /// over the sunk rows for the next round.
    pub fn prepare_partitioned_probe(
        &mut self,
        build_ht: &JoinHashTable,
        probe_state: &JoinHTScanState,
    ) -> Result<(), String> {
        probe_state.reset();
        self.partition_cutoff = build_ht.partition_cutoff;
        Ok(())
    }
}

/// Take the selected lanes from every column of a chunk.
pub(crate) fn take_chunk(chunk: &Chunk, sel: &[u32]) -> Result<Chunk, String> {
    if chunk.num_columns() == 0 {
        return Chunk::empty_rows(sel.len());
    }
    let indices = UInt32Array::from(sel.to_vec());
    let mut columns = Vec::with_capacity(chunk.num_columns());
    for col in chunk.columns() {
        columns.push(take(col, &indices, None).map_err(|e| e.to_string())?);
    }
    let batch = arrow::array::RecordBatch::try_new(chunk.schema(), columns)
        .map_err(|e| e.to_string())?;
    Ok(Chunk::new(batch))
}
