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
//! Radix partitioning over the high bits of the join hash.
//!
//! The slot bitmask probes the low bits, partition routing uses the top
//! `bits`, so the two never interfere. Partitioned rows stay swizzled so
//! partition blocks can be released independently.

use crate::exec::row::collection::RowDataCollection;
use crate::exec::row::layout::{RowLayout, read_u64, write_u64};
use crate::exec::row::swizzle::swizzled_blob_len;

pub const HASH_BITS: usize = 64;

/// Rows buffered per partition before a wholesale flush. Block capacities are
/// rounded to a multiple of this, so a full buffer always fits a block tail.
pub const TMP_BUF_SIZE: usize = 64;

/// The partition a hash routes to under `bits` radix bits.
pub fn partition_index(hash: u64, bits: usize) -> usize {
    if bits == 0 {
        0
    } else {
        (hash >> (HASH_BITS - bits)) as usize
    }
}

/// Per-partition row counters over the top `bits` of the hash.
#[derive(Debug, Clone)]
pub struct Histogram {
    counts: Vec<u64>,
    bits: usize,
}

impl Histogram {
    pub fn new(bits: usize) -> Self {
        Self {
            counts: vec![0; 1usize << bits],
            bits,
        }
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn num_partitions(&self) -> usize {
        self.counts.len()
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn max_count(&self) -> u64 {
        self.counts.iter().copied().max().unwrap_or(0)
    }

    /// Count the selected lanes' hashes. `hashes` is indexed by lane.
    pub fn update(&mut self, hashes: &[u64], sel: Option<&[u32]>, count: usize) {
        match sel {
            Some(sel) => {
                for &lane in &sel[..count] {
                    self.counts[partition_index(hashes[lane as usize], self.bits)] += 1;
                }
            }
            None => {
                for &hash in &hashes[..count] {
                    self.counts[partition_index(hash, self.bits)] += 1;
                }
            }
        }
    }

    pub fn merge(&mut self, other: &Histogram) -> Result<(), String> {
        if self.bits != other.bits {
            return Err(format!(
                "histogram bit mismatch: {} vs {}",
                self.bits, other.bits
            ));
        }
        for (dst, src) in self.counts.iter_mut().zip(other.counts.iter()) {
            *dst += *src;
        }
        Ok(())
    }

    /// Merge adjacent buckets down to `to_bits`. Totals are preserved:
    /// `new[i] = sum(old[i*k .. i*k + k])` with `k = 2^(from-to)`.
    pub fn reduce(&self, to_bits: usize) -> Result<Histogram, String> {
        if to_bits > self.bits {
            return Err(format!(
                "cannot reduce histogram from {} to {} bits",
                self.bits, to_bits
            ));
        }
        let factor = 1usize << (self.bits - to_bits);
        let mut reduced = Histogram::new(to_bits);
        for (i, count) in self.counts.iter().enumerate() {
            reduced.counts[i / factor] += *count;
        }
        Ok(reduced)
    }
}

/// Split the selected lanes into those routed to a partition below `cutoff`
/// (currently loaded) and the rest. Input order is preserved within each
/// side. Returns the true count.
pub fn select(
    hashes: &[u64],
    sel: &[u32],
    bits: usize,
    cutoff: usize,
    true_sel: &mut Vec<u32>,
    false_sel: &mut Vec<u32>,
) -> usize {
    true_sel.clear();
    false_sel.clear();
    for &lane in sel {
        if partition_index(hashes[lane as usize], bits) < cutoff {
            true_sel.push(lane);
        } else {
            false_sel.push(lane);
        }
    }
    true_sel.len()
}

struct PartitionWriter {
    data: RowDataCollection,
    heap: RowDataCollection,
    tmp_rows: Vec<u8>,
    tmp_blobs: Vec<(usize, usize, usize)>,
    tmp_count: usize,
}

impl PartitionWriter {
    fn flush(
        &mut self,
        layout: &RowLayout,
        src_heap: &RowDataCollection,
    ) -> Result<(), String> {
        if self.tmp_count == 0 {
            return Ok(());
        }
        // Data blocks pair 1:1 with heap blocks; opening one opens the other.
        if self.data.num_blocks() == 0 || self.data.last_block_remaining() < self.tmp_count {
            self.data.start_new_block()?;
            if !layout.all_constant() {
                self.heap.start_new_heap_block(0)?;
            }
        }
        if !layout.all_constant() {
            let width = layout.row_width();
            let heap_offset = layout
                .heap_offset()
                .ok_or_else(|| "partition: missing heap slot".to_string())?;
            for i in 0..self.tmp_count {
                let (src_block, blob_offset, blob_len) = self.tmp_blobs[i];
                let src_block = src_heap.block(src_block)?;
                let blob = &src_block.data()[blob_offset..blob_offset + blob_len];
                let new_offset = self.heap.append_bytes_to_last_grow(blob)?;
                let row = &mut self.tmp_rows[i * width..(i + 1) * width];
                write_u64(row, heap_offset, new_offset as u64);
            }
        }
        self.data
            .append_rows_to_last(&self.tmp_rows[..self.tmp_count * layout.row_width()], self.tmp_count)?;
        self.tmp_rows.clear();
        self.tmp_blobs.clear();
        self.tmp_count = 0;
        Ok(())
    }
}

/// Route every swizzled row of `src_blocks`/`src_heap` to the partition named
/// by the top `bits` of its stored hash, appending into fresh per-partition
/// collections. Rows keep their swizzled form; row order within a partition
/// follows the input order. The source collections are cleared.
pub fn partition(
    layout: &RowLayout,
    src_blocks: &mut RowDataCollection,
    src_heap: &mut RowDataCollection,
    bits: usize,
) -> Result<Vec<(RowDataCollection, RowDataCollection)>, String> {
    let num_partitions = 1usize << bits;
    let width = layout.row_width();
    let mut writers: Vec<PartitionWriter> = (0..num_partitions)
        .map(|_| PartitionWriter {
            data: src_blocks.copy_empty(),
            heap: src_heap.copy_empty(),
            tmp_rows: Vec::new(),
            tmp_blobs: Vec::new(),
            tmp_count: 0,
        })
        .collect();

    for block_idx in 0..src_blocks.num_blocks() {
        let block_count = src_blocks.block(block_idx)?.count();
        for row_idx in 0..block_count {
            let block = src_blocks.block(block_idx)?;
            let row = &block.data()[row_idx * width..(row_idx + 1) * width];
            let hash = read_u64(row, layout.hash_offset());
            let p = partition_index(hash, bits);

            let writer = &mut writers[p];
            writer.tmp_rows.extend_from_slice(row);
            if !layout.all_constant() {
                let heap_offset = layout
                    .heap_offset()
                    .ok_or_else(|| "partition: missing heap slot".to_string())?;
                let blob_offset = read_u64(row, heap_offset) as usize;
                let blob_len = swizzled_blob_len(layout, row);
                writer.tmp_blobs.push((block_idx, blob_offset, blob_len));
            }
            writer.tmp_count += 1;
            if writer.tmp_count == TMP_BUF_SIZE {
                writer.flush(layout, src_heap)?;
            }
        }
    }
    for writer in writers.iter_mut() {
        writer.flush(layout, src_heap)?;
    }

    src_blocks.clear();
    src_heap.clear();
    Ok(writers
        .into_iter()
        .map(|w| (w.data, w.heap))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::{HASH_BITS, Histogram, partition_index, select};

    #[test]
    fn test_partition_index_uses_top_bits() {
        let hash = 0b1010u64 << (HASH_BITS - 4);
        assert_eq!(partition_index(hash, 4), 0b1010);
        assert_eq!(partition_index(hash, 2), 0b10);
        assert_eq!(partition_index(hash, 0), 0);
        // low bits do not leak into the partition
        assert_eq!(partition_index(hash | 0xFFFF, 4), 0b1010);
    }

    #[test]
    fn test_histogram_update_and_reduce_preserves_total() {
        let mut hist = Histogram::new(3);
        let hashes: Vec<u64> = (0..32u64).map(|i| i << (HASH_BITS - 5)).collect();
        hist.update(&hashes, None, hashes.len());
        assert_eq!(hist.total(), 32);

        let reduced = hist.reduce(1).unwrap();
        assert_eq!(reduced.total(), 32);
        assert_eq!(reduced.num_partitions(), 2);
        // new[i] == sum old[i*k .. i*k+k]
        let k = 1 << (3 - 1);
        for i in 0..2 {
            let expected: u64 = hist.counts()[i * k..(i + 1) * k].iter().sum();
            assert_eq!(reduced.counts()[i], expected);
        }
    }

    #[test]
    fn test_empty_histogram_reduces_to_single_zero_bucket() {
        let hist = Histogram::new(4);
        let reduced = hist.reduce(0).unwrap();
        assert_eq!(reduced.counts(), &[0]);
    }

    #[test]
    fn test_histogram_merge_requires_same_bits() {
        let mut a = Histogram::new(2);
        let b = Histogram::new(3);
        assert!(a.merge(&b).is_err());
        let mut c = Histogram::new(2);
        c.update(&[0u64], None, 1);
        a.merge(&c).unwrap();
        assert_eq!(a.total(), 1);
    }

    #[test]
    fn test_select_preserves_input_order() {
        // partitions: lane0 -> 3, lane1 -> 0, lane2 -> 1, lane3 -> 2
        let hashes: Vec<u64> = [3u64, 0, 1, 2]
            .iter()
            .map(|p| p << (HASH_BITS - 2))
            .collect();
        let sel: Vec<u32> = vec![0, 1, 2, 3];
        let mut true_sel = Vec::new();
        let mut false_sel = Vec::new();
        let count = select(&hashes, &sel, 2, 2, &mut true_sel, &mut false_sel);
        assert_eq!(count, 2);
        assert_eq!(true_sel, vec![1, 2]);
        assert_eq!(false_sel, vec![0, 3]);
    }
}
