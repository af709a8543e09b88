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
//! Join flavor and key comparison definitions.

use arrow::datatypes::DataType;

/// Join flavors supported by the hash table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    /// Full outer.
    Outer,
    Semi,
    Anti,
    Mark,
    Single,
}

impl JoinType {
    /// Right and full outer joins track per-tuple found flags on the build side.
    pub fn is_right_outer(self) -> bool {
        matches!(self, JoinType::Right | JoinType::Outer)
    }
}

pub fn join_type_str(join_type: JoinType) -> &'static str {
    match join_type {
        JoinType::Inner => "INNER",
        JoinType::Left => "LEFT",
        JoinType::Right => "RIGHT",
        JoinType::Outer => "FULL_OUTER",
        JoinType::Semi => "SEMI",
        JoinType::Anti => "ANTI",
        JoinType::Mark => "MARK",
        JoinType::Single => "SINGLE",
    }
}

/// Comparison applied between a probe key column and the stored build value.
///
/// `Equal`, `NotDistinctFrom` and `DistinctFrom` form the equality class and
/// must precede every other comparison in a condition list; the remaining
/// kinds are extra predicates resolved after the hash lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinComparison {
    Equal,
    NotDistinctFrom,
    DistinctFrom,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl JoinComparison {
    pub fn is_equality_class(self) -> bool {
        matches!(
            self,
            JoinComparison::Equal | JoinComparison::NotDistinctFrom | JoinComparison::DistinctFrom
        )
    }

    /// Whether NULL compares equal to NULL under this comparison.
    pub fn null_values_are_equal(self) -> bool {
        matches!(
            self,
            JoinComparison::NotDistinctFrom | JoinComparison::DistinctFrom
        )
    }
}

/// One join condition: the key column type and the comparison applied to it.
///
/// The probe and build key chunks carry one column per condition, equality
/// conditions first.
#[derive(Debug, Clone)]
pub struct JoinCondition {
    pub data_type: DataType,
    pub comparison: JoinComparison,
}

impl JoinCondition {
    pub fn new(data_type: DataType, comparison: JoinComparison) -> Self {
        Self {
            data_type,
            comparison,
        }
    }

    pub fn equal(data_type: DataType) -> Self {
        Self::new(data_type, JoinComparison::Equal)
    }

    pub fn not_distinct_from(data_type: DataType) -> Self {
        Self::new(data_type, JoinComparison::NotDistinctFrom)
    }
}

/// Validate the equality-prefix invariant and return the equality count.
pub fn validate_conditions(conditions: &[JoinCondition]) -> Result<usize, String> {
    if conditions.is_empty() {
        return Err("hash join requires at least one condition".to_string());
    }
    let mut equality_count = 0;
    let mut seen_other = false;
    for condition in conditions {
        if condition.comparison.is_equality_class() {
            if seen_other {
                return Err(
                    "hash join equality conditions must precede all other conditions".to_string(),
                );
            }
            equality_count += 1;
        } else {
            seen_other = true;
        }
    }
    if equality_count == 0 {
        return Err("hash join requires at least one equality condition".to_string());
    }
    Ok(equality_count)
}

#[cfg(test)]
mod tests {
    use arrow::datatypes::DataType;

    use super::{JoinComparison, JoinCondition, validate_conditions};

    #[test]
    fn test_equality_prefix_enforced() {
        let ok = vec![
            JoinCondition::equal(DataType::Int64),
            JoinCondition::new(DataType::Int64, JoinComparison::LessThan),
        ];
        assert_eq!(validate_conditions(&ok).unwrap(), 1);

        let bad = vec![
            JoinCondition::new(DataType::Int64, JoinComparison::LessThan),
            JoinCondition::equal(DataType::Int64),
        ];
        assert!(validate_conditions(&bad).is_err());
    }

    #[test]
    fn test_requires_equality() {
        let none = vec![JoinCondition::new(DataType::Int64, JoinComparison::LessThan)];
        assert!(validate_conditions(&none).is_err());
        assert!(validate_conditions(&[]).is_err());
    }

    #[test]
    fn test_null_equals_derivation() {
        assert!(!JoinComparison::Equal.null_values_are_equal());
        assert!(JoinComparison::NotDistinctFrom.null_values_are_equal());
        assert!(JoinComparison::DistinctFrom.null_values_are_equal());
    }
}
