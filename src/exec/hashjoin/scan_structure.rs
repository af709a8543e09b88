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
//! Per-batch probe cursor and the per-join-kind state machines.
//!
//! Inner and right joins walk chains across multiple `next` calls; semi,
//! anti, mark and single joins exhaust their chains in one call. Matches are
//! emitted in probe input order; within one input row, matches follow chain
//! order (reverse build insertion).

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, RecordBatch, new_null_array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

use crate::exec::chunk::Chunk;
use crate::exec::hashjoin::condition::JoinType;
use crate::exec::hashjoin::join_hash_table::{JoinHashTable, take_chunk};
use crate::exec::row::collection::NULL_ROW;
use crate::exec::row::ops::{ColumnView, gather_column, match_rows};

pub struct ScanStructure<'a> {
    ht: &'a JoinHashTable,
    keys: Chunk,
    prepared_sel: Vec<u32>,
    pointers: Vec<u64>,
    sel: Vec<u32>,
    count: usize,
    found_match: Option<Vec<bool>>,
    finished: bool,
}

impl<'a> ScanStructure<'a> {
    pub(crate) fn new(ht: &'a JoinHashTable, keys: Chunk, prepared_sel: Vec<u32>) -> Self {
        let found_match = if ht.join_type != JoinType::Inner {
            Some(vec![false; keys.len()])
        } else {
            None
        };
        let lanes = keys.len();
        Self {
            ht,
            keys,
            prepared_sel,
            pointers: vec![NULL_ROW; lanes],
            sel: Vec::new(),
            count: 0,
            found_match,
            finished: false,
        }
    }

    pub(crate) fn prepared_sel(&self) -> &[u32] {
        &self.prepared_sel
    }

    pub(crate) fn set_prepared_sel(&mut self, sel: Vec<u32>) {
        self.prepared_sel = sel;
    }

    /// Load the chain head for each prepared lane; lanes whose slot is empty
    /// drop out of the active selection immediately.
    pub(crate) fn init_pointers(&mut self, hashes: &[u64]) {
        self.sel.clear();
        for &lane in &self.prepared_sel {
            let slot = (hashes[lane as usize] & self.ht.bitmask) as usize;
            let head = self.ht.hash_map[slot];
            if head != NULL_ROW {
                self.pointers[lane as usize] = head;
                self.sel.push(lane);
            }
        }
        self.count = self.sel.len();
    }

    /// Lanes still walking a chain.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Produce the next output batch for this probe batch. Returns an empty
    /// chunk once exhausted; single-pass join kinds finish after one call.
    pub fn next(&mut self, left: &Chunk) -> Result<Chunk, String> {
        if self.keys.len() != left.len() {
            return Err(format!(
                "probe keys/left cardinality mismatch: {} vs {}",
                self.keys.len(),
                left.len()
            ));
        }
        if self.finished {
            return empty_chunk(&self.output_schema(left));
        }
        match self.ht.join_type {
            JoinType::Inner | JoinType::Right => {
                let result = self.inner_step(left)?;
                if result.is_empty() {
                    self.finished = true;
                }
                Ok(result)
            }
            JoinType::Left | JoinType::Outer => self.next_left_join(left),
            JoinType::Semi => self.next_semi_or_anti_join(left, true),
            JoinType::Anti => self.next_semi_or_anti_join(left, false),
            JoinType::Mark => self.next_mark_join(left),
            JoinType::Single => self.next_single_join(left),
        }
    }

    fn output_schema(&self, left: &Chunk) -> SchemaRef {
        match self.ht.join_type {
            JoinType::Semi | JoinType::Anti => left.schema(),
            JoinType::Mark => mark_schema(left),
            _ => joined_schema(left, &self.ht.build_types),
        }
    }

    fn resolve_predicates(
        &self,
        match_sel: &mut Vec<u32>,
        no_match_sel: Option<&mut Vec<u32>>,
    ) -> Result<usize, String> {
        let views = ColumnView::try_new_all(self.keys.columns())?;
        match_rows(
            &views,
            &self.ht.predicates,
            &self.ht.layout,
            &self.ht.block_collection,
            &self.ht.string_heap,
            &self.pointers,
            &self.sel,
            match_sel,
            no_match_sel,
        )
    }

    /// Move the given lanes to their next chain entry, dropping lanes that
    /// reach the chain end.
    fn advance_pointers_on(&mut self, lanes: &[u32]) -> Result<(), String> {
        let mut new_sel = Vec::with_capacity(lanes.len());
        for &lane in lanes {
            let next = self.ht.next_row_ptr(self.pointers[lane as usize])?;
            if next != NULL_ROW {
                self.pointers[lane as usize] = next;
                new_sel.push(lane);
            }
        }
        self.sel = new_sel;
        self.count = self.sel.len();
        Ok(())
    }

    fn advance_pointers(&mut self) -> Result<(), String> {
        let lanes = std::mem::take(&mut self.sel);
        self.advance_pointers_on(&lanes)
    }

    /// Resolve predicates until some lanes match or every chain is
    /// exhausted. Returns the match count; `result_vector` holds the lanes.
    fn scan_inner_join(&mut self, result_vector: &mut Vec<u32>) -> Result<usize, String> {
        loop {
            if self.count == 0 {
                result_vector.clear();
                return Ok(0);
            }
            let result_count = self.resolve_predicates(result_vector, None)?;
            if let Some(found) = self.found_match.as_mut() {
                for &lane in result_vector.iter() {
                    found[lane as usize] = true;
                }
            }
            if result_count > 0 {
                return Ok(result_count);
            }
            self.advance_pointers()?;
        }
    }

    fn inner_step(&mut self, left: &Chunk) -> Result<Chunk, String> {
        let schema = joined_schema(left, &self.ht.build_types);
        let mut result_vector = Vec::new();
        let result_count = self.scan_inner_join(&mut result_vector)?;
        if result_count == 0 {
            return empty_chunk(&schema);
        }
        if self.ht.join_type.is_right_outer() {
            for &lane in &result_vector {
                self.ht.set_found(self.pointers[lane as usize])?;
            }
        }
        let left_taken = take_chunk(left, &result_vector)?;
        let mut columns: Vec<ArrayRef> = left_taken.columns().to_vec();
        for i in 0..self.ht.build_types.len() {
            columns.push(gather_column(
                &self.ht.block_collection,
                &self.ht.string_heap,
                &self.ht.layout,
                &self.pointers,
                &result_vector,
                None,
                result_count,
                self.ht.condition_types.len() + i,
            )?);
        }
        self.advance_pointers()?;
        let batch = RecordBatch::try_new(schema, columns).map_err(|e| e.to_string())?;
        Ok(Chunk::new(batch))
    }

    fn next_left_join(&mut self, left: &Chunk) -> Result<Chunk, String> {
        let result = self.inner_step(left)?;
        if !result.is_empty() {
            return Ok(result);
        }
        // Chains exhausted: emit one row per unmatched probe lane with the
        // build side NULL.
        self.finished = true;
        let found = self
            .found_match
            .as_ref()
            .ok_or_else(|| "left join missing found bitmap".to_string())?;
        let remaining: Vec<u32> = (0..left.len() as u32)
            .filter(|&lane| !found[lane as usize])
            .collect();
        let schema = joined_schema(left, &self.ht.build_types);
        if remaining.is_empty() {
            return empty_chunk(&schema);
        }
        let left_taken = take_chunk(left, &remaining)?;
        let mut columns: Vec<ArrayRef> = left_taken.columns().to_vec();
        for build_type in &self.ht.build_types {
            columns.push(new_null_array(build_type, remaining.len()));
        }
        let batch = RecordBatch::try_new(schema, columns).map_err(|e| e.to_string())?;
        Ok(Chunk::new(batch))
    }

    /// Chase every chain to the end, recording which lanes saw any match.
    /// Matched lanes stop walking; only unmatched lanes advance.
    fn scan_key_matches(&mut self) -> Result<(), String> {
        let mut match_sel = Vec::new();
        let mut no_match_sel = Vec::new();
        while self.count > 0 {
            self.resolve_predicates(&mut match_sel, Some(&mut no_match_sel))?;
            if let Some(found) = self.found_match.as_mut() {
                for &lane in &match_sel {
                    found[lane as usize] = true;
                }
            }
            let advance = std::mem::take(&mut no_match_sel);
            self.advance_pointers_on(&advance)?;
        }
        Ok(())
    }

    fn next_semi_or_anti_join(&mut self, left: &Chunk, want_match: bool) -> Result<Chunk, String> {
        self.scan_key_matches()?;
        self.finished = true;
        let found = self
            .found_match
            .as_ref()
            .ok_or_else(|| "semi/anti join missing found bitmap".to_string())?;
        let sel: Vec<u32> = (0..left.len() as u32)
            .filter(|&lane| found[lane as usize] == want_match)
            .collect();
        if sel.is_empty() {
            return empty_chunk(&left.schema());
        }
        take_chunk(left, &sel)
    }

    fn next_mark_join(&mut self, left: &Chunk) -> Result<Chunk, String> {
        self.scan_key_matches()?;
        self.finished = true;
        if self.ht.correlated_mark.is_some() {
            self.construct_correlated_mark_result(left)
        } else {
            self.construct_mark_join_result(left)
        }
    }

    /// Three-valued mark output: NULL when a non-null-equals probe key is
    /// NULL, or when no match was found and the build side stored any NULL.
    fn construct_mark_join_result(&self, left: &Chunk) -> Result<Chunk, String> {
        let found = self
            .found_match
            .as_ref()
            .ok_or_else(|| "mark join missing found bitmap".to_string())?;
        let n = left.len();
        let values: Vec<bool> = (0..n).map(|i| found[i]).collect();
        let mut valid = vec![true; n];
        for col in 0..self.ht.condition_types.len() {
            if self.ht.null_values_are_equal[col] {
                continue;
            }
            let array = self.keys.column(col)?;
            if array.null_count() == 0 {
                continue;
            }
            let view = ColumnView::try_new(array)?;
            for (i, v) in valid.iter_mut().enumerate() {
                if view.is_null(i) {
                    *v = false;
                }
            }
        }
        if self.ht.has_null() {
            for i in 0..n {
                if !values[i] {
                    valid[i] = false;
                }
            }
        }
        finish_mark_chunk(left, &values, &valid)
    }

    fn construct_correlated_mark_result(&self, left: &Chunk) -> Result<Chunk, String> {
        let found = self
            .found_match
            .as_ref()
            .ok_or_else(|| "mark join missing found bitmap".to_string())?;
        let correlated = self
            .ht
            .correlated_mark
            .as_ref()
            .ok_or_else(|| "correlated mark state missing".to_string())?;
        let state = correlated.lock().expect("correlated mark lock");
        let correlated_count = state.correlated_count();
        let groups = &self.keys.columns()[..correlated_count];
        let (count_star, count_key) = state.fetch_aggregates(groups)?;

        let n = left.len();
        let last_key = self.keys.column(correlated_count)?;
        let last_view = ColumnView::try_new(last_key)?;
        let values: Vec<bool> = (0..n).map(|i| found[i]).collect();
        let mut valid: Vec<bool> = (0..n).map(|i| !last_view.is_null(i)).collect();
        for i in 0..n {
            if !values[i] && count_star[i] > count_key[i] {
                // the group stores a NULL key: unmatched is unknown, not false
                valid[i] = false;
            }
            if count_star[i] == 0 {
                valid[i] = true;
            }
        }
        finish_mark_chunk(left, &values, &valid)
    }

    fn next_single_join(&mut self, left: &Chunk) -> Result<Chunk, String> {
        let mut result_sel: Vec<u32> = Vec::new();
        let mut match_sel = Vec::new();
        let mut no_match_sel = Vec::new();
        while self.count > 0 {
            self.resolve_predicates(&mut match_sel, Some(&mut no_match_sel))?;
            if let Some(found) = self.found_match.as_mut() {
                for &lane in &match_sel {
                    found[lane as usize] = true;
                    result_sel.push(lane);
                }
            }
            // matched lanes keep their first match; only unmatched continue
            let advance = std::mem::take(&mut no_match_sel);
            self.advance_pointers_on(&advance)?;
        }
        self.finished = true;

        let schema = joined_schema(left, &self.ht.build_types);
        let mut columns: Vec<ArrayRef> = left.columns().to_vec();
        for i in 0..self.ht.build_types.len() {
            columns.push(gather_column(
                &self.ht.block_collection,
                &self.ht.string_heap,
                &self.ht.layout,
                &self.pointers,
                &result_sel,
                Some(&result_sel),
                left.len(),
                self.ht.condition_types.len() + i,
            )?);
        }
        let batch = RecordBatch::try_new(schema, columns).map_err(|e| e.to_string())?;
        Ok(Chunk::new(batch))
    }
}

fn joined_schema(left: &Chunk, build_types: &[DataType]) -> SchemaRef {
    let mut fields: Vec<Field> = left
        .schema()
        .fields()
        .iter()
        .map(|f| f.as_ref().clone().with_nullable(true))
        .collect();
    for (i, build_type) in build_types.iter().enumerate() {
        fields.push(Field::new(format!("rhs{i}"), build_type.clone(), true));
    }
    Arc::new(Schema::new(fields))
}

fn mark_schema(left: &Chunk) -> SchemaRef {
    let mut fields: Vec<Field> = left
        .schema()
        .fields()
        .iter()
        .map(|f| f.as_ref().clone())
        .collect();
    fields.push(Field::new("mark", DataType::Boolean, true));
    Arc::new(Schema::new(fields))
}

fn empty_chunk(schema: &SchemaRef) -> Result<Chunk, String> {
    Ok(Chunk::new(RecordBatch::new_empty(Arc::clone(schema))))
}

fn finish_mark_chunk(left: &Chunk, values: &[bool], valid: &[bool]) -> Result<Chunk, String> {
    let mark: BooleanArray = values
        .iter()
        .zip(valid.iter())
        .map(|(&v, &ok)| if ok { Some(v) } else { None })
        .collect();
    let mut columns: Vec<ArrayRef> = left.columns().to_vec();
    columns.push(Arc::new(mark));
    let batch =
        RecordBatch::try_new(mark_schema(left), columns).map_err(|e| e.to_string())?;
    Ok(Chunk::new(batch))
}
