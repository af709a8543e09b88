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
//! Companion aggregate for correlated mark joins.
//!
//! Tracks `COUNT(*)` and `COUNT(key)` per correlated group. The probe side
//! uses the pair to distinguish NULL from false: a group whose star count
//! exceeds its key count stores a NULL key, so an unmatched probe row in that
//! group is unknown rather than false.

use arrow::array::ArrayRef;
use arrow::datatypes::DataType;
use hashbrown::HashMap;

use crate::exec::hashjoin::hash::{canonical_f32_bits, canonical_f64_bits};
use crate::exec::row::ops::ColumnView;

/// One correlated group key value. NULL is a legal group value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GroupValue {
    Null,
    Boolean(bool),
    Int(i64),
    /// Canonicalized float bits, so NaN groups with NaN.
    FloatBits(u64),
    Utf8(String),
}

fn group_value(view: &ColumnView<'_>, row: usize) -> GroupValue {
    if view.is_null(row) {
        return GroupValue::Null;
    }
    match view {
        ColumnView::Boolean(a) => GroupValue::Boolean(a.value(row)),
        ColumnView::Int8(a) => GroupValue::Int(a.value(row) as i64),
        ColumnView::Int16(a) => GroupValue::Int(a.value(row) as i64),
        ColumnView::Int32(a) => GroupValue::Int(a.value(row) as i64),
        ColumnView::Int64(a) => GroupValue::Int(a.value(row)),
        ColumnView::Date32(a) => GroupValue::Int(a.value(row) as i64),
        ColumnView::Float32(a) => GroupValue::FloatBits(canonical_f32_bits(a.value(row)) as u64),
        ColumnView::Float64(a) => GroupValue::FloatBits(canonical_f64_bits(a.value(row))),
        ColumnView::Utf8(a) => GroupValue::Utf8(a.value(row).to_string()),
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct GroupCounts {
    count_star: i64,
    count_key: i64,
}

/// Grouped COUNT(*) / COUNT(key) state keyed by the correlated columns.
#[derive(Debug)]
pub struct CorrelatedMarkState {
    correlated_types: Vec<DataType>,
    counts: HashMap<Vec<GroupValue>, GroupCounts>,
}

impl CorrelatedMarkState {
    pub fn new(correlated_types: Vec<DataType>) -> Result<Self, String> {
        if correlated_types.is_empty() {
            return Err("correlated mark join requires correlated columns".to_string());
        }
        Ok(Self {
            correlated_types,
            counts: HashMap::new(),
        })
    }

    pub fn correlated_count(&self) -> usize {
        self.correlated_types.len()
    }

    fn check_groups(&self, groups: &[ArrayRef]) -> Result<(), String> {
        if groups.len() != self.correlated_types.len() {
            return Err(format!(
                "correlated group count mismatch: expected {} got {}",
                self.correlated_types.len(),
                groups.len()
            ));
        }
        for (idx, (array, expected)) in groups.iter().zip(&self.correlated_types).enumerate() {
            if array.data_type() != expected {
                return Err(format!(
                    "correlated group {} type mismatch: expected {:?} got {:?}",
                    idx,
                    expected,
                    array.data_type()
                ));
            }
        }
        Ok(())
    }

    /// Feed one build batch: the correlated columns plus the key column.
    pub fn add_chunk(&mut self, groups: &[ArrayRef], key: &ArrayRef) -> Result<(), String> {
        self.check_groups(groups)?;
        let group_views = ColumnView::try_new_all(groups)?;
        let key_view = ColumnView::try_new(key)?;
        let rows = key.len();
        for row in 0..rows {
            let group_key: Vec<GroupValue> =
                group_views.iter().map(|v| group_value(v, row)).collect();
            let entry = self.counts.entry(group_key).or_default();
            entry.count_star += 1;
            if !key_view.is_null(row) {
                entry.count_key += 1;
            }
        }
        Ok(())
    }

    /// Look up the counts for each probe row's group. Unseen groups report
    /// zero for both counts.
    pub fn fetch_aggregates(
        &self,
        groups: &[ArrayRef],
    ) -> Result<(Vec<i64>, Vec<i64>), String> {
        self.check_groups(groups)?;
        let group_views = ColumnView::try_new_all(groups)?;
        let rows = groups.first().map(|a| a.len()).unwrap_or(0);
        let mut count_star = Vec::with_capacity(rows);
        let mut count_key = Vec::with_capacity(rows);
        for row in 0..rows {
            let group_key: Vec<GroupValue> =
                group_views.iter().map(|v| group_value(v, row)).collect();
            let counts = self.counts.get(&group_key).copied().unwrap_or_default();
            count_star.push(counts.count_star);
            count_key.push(counts.count_key);
        }
        Ok((count_star, count_key))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{ArrayRef, Int64Array};
    use arrow::datatypes::DataType;

    use super::CorrelatedMarkState;

    #[test]
    fn test_counts_by_group_with_null_keys() {
        let mut state = CorrelatedMarkState::new(vec![DataType::Int64]).unwrap();
        let groups: ArrayRef = Arc::new(Int64Array::from(vec![1, 1, 2, 2, 2]));
        let keys: ArrayRef =
            Arc::new(Int64Array::from(vec![Some(10), None, Some(20), Some(21), None]));
        state.add_chunk(&[groups], &keys).unwrap();

        let probe: ArrayRef = Arc::new(Int64Array::from(vec![1, 2, 3]));
        let (star, key) = state.fetch_aggregates(&[probe]).unwrap();
        assert_eq!(star, vec![2, 3, 0]);
        assert_eq!(key, vec![1, 2, 0]);
    }

    #[test]
    fn test_null_group_is_a_group() {
        let mut state = CorrelatedMarkState::new(vec![DataType::Int64]).unwrap();
        let groups: ArrayRef = Arc::new(Int64Array::from(vec![None, None, Some(1)]));
        let keys: ArrayRef = Arc::new(Int64Array::from(vec![Some(1), Some(2), Some(3)]));
        state.add_chunk(&[groups], &keys).unwrap();

        let probe: ArrayRef = Arc::new(Int64Array::from(vec![None, Some(1)]));
        let (star, key) = state.fetch_aggregates(&[probe]).unwrap();
        assert_eq!(star, vec![2, 1]);
        assert_eq!(key, vec![2, 1]);
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let state = CorrelatedMarkState::new(vec![DataType::Int64]).unwrap();
        let probe: ArrayRef = Arc::new(Int64Array::from(vec![1]));
        assert!(state.fetch_aggregates(&[probe.clone(), probe]).is_err());
    }
}
