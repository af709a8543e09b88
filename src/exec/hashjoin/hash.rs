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
//! Key hashing for build and probe sides.
//!
//! All workers share one seed so per-worker local tables agree on both the
//! slot bitmask (low bits) and the radix partition (high bits) of a key.

use arrow::array::Array;
use crate::exec::row::ops::ColumnView;

/// Process-wide join hash seed. Fixed: histograms merged across workers must
/// be computed from identical hashes.
pub const JOIN_HASH_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

pub fn combine_hash(acc: u64, value_hash: u64) -> u64 {
    acc ^ value_hash
        .wrapping_add(0x9e3779b97f4a7c15)
        .wrapping_add(acc << 6)
        .wrapping_add(acc >> 2)
}

pub fn hash_u64_with_seed(seed: u64, value: u64) -> u64 {
    mix_u64(seed ^ value)
}

pub fn hash_bytes_with_seed(seed: u64, bytes: &[u8]) -> u64 {
    let mut hash = seed ^ 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

pub fn hash_null_with_seed(seed: u64) -> u64 {
    hash_u64_with_seed(seed, 0x9e3779b97f4a7c15)
}

pub fn canonical_f64_bits(value: f64) -> u64 {
    if value.is_nan() {
        f64::NAN.to_bits()
    } else {
        value.to_bits()
    }
}

pub fn canonical_f32_bits(value: f32) -> u32 {
    if value.is_nan() {
        f32::NAN.to_bits()
    } else {
        value.to_bits()
    }
}

fn mix_u64(mut value: u64) -> u64 {
    value = value.wrapping_add(0x9e3779b97f4a7c15);
    value = (value ^ (value >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    value = (value ^ (value >> 27)).wrapping_mul(0x94d049bb133111eb);
    value ^ (value >> 31)
}

fn hash_column_value(view: &ColumnView<'_>, row: usize) -> u64 {
    match view {
        ColumnView::Boolean(arr) => {
            if arr.is_null(row) {
                hash_null_with_seed(JOIN_HASH_SEED)
            } else {
                hash_u64_with_seed(JOIN_HASH_SEED, arr.value(row) as u64)
            }
        }
        ColumnView::Int8(arr) => hash_int(arr.is_null(row), || arr.value(row) as i64),
        ColumnView::Int16(arr) => hash_int(arr.is_null(row), || arr.value(row) as i64),
        ColumnView::Int32(arr) => hash_int(arr.is_null(row), || arr.value(row) as i64),
        ColumnView::Int64(arr) => hash_int(arr.is_null(row), || arr.value(row)),
        ColumnView::Date32(arr) => hash_int(arr.is_null(row), || arr.value(row) as i64),
        ColumnView::Float32(arr) => {
            if arr.is_null(row) {
                hash_null_with_seed(JOIN_HASH_SEED)
            } else {
                hash_u64_with_seed(JOIN_HASH_SEED, canonical_f32_bits(arr.value(row)) as u64)
            }
        }
        ColumnView::Float64(arr) => {
            if arr.is_null(row) {
                hash_null_with_seed(JOIN_HASH_SEED)
            } else {
                hash_u64_with_seed(JOIN_HASH_SEED, canonical_f64_bits(arr.value(row)))
            }
        }
        ColumnView::Utf8(arr) => {
            if arr.is_null(row) {
                hash_null_with_seed(JOIN_HASH_SEED)
            } else {
                hash_bytes_with_seed(JOIN_HASH_SEED, arr.value(row).as_bytes())
            }
        }
    }
}

fn hash_int(is_null: bool, value: impl FnOnce() -> i64) -> u64 {
    if is_null {
        hash_null_with_seed(JOIN_HASH_SEED)
    } else {
        hash_u64_with_seed(JOIN_HASH_SEED, value() as u64)
    }
}

/// Hash the equality-key prefix for the selected lanes. `hashes` is indexed by
/// lane; only entries named by `sel` are written.
pub fn hash_keys(views: &[ColumnView<'_>], sel: &[u32], hashes: &mut [u64]) {
    for (col_idx, view) in views.iter().enumerate() {
        if col_idx == 0 {
            for &lane in sel {
                hashes[lane as usize] = hash_column_value(view, lane as usize);
            }
        } else {
            for &lane in sel {
                let value_hash = hash_column_value(view, lane as usize);
                hashes[lane as usize] = combine_hash(hashes[lane as usize], value_hash);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{ArrayRef, Int64Array, StringArray};

    use crate::exec::row::ops::ColumnView;

    use super::{JOIN_HASH_SEED, canonical_f64_bits, hash_bytes_with_seed, hash_keys};

    #[test]
    fn test_hash_is_deterministic_across_views() {
        let a: ArrayRef = Arc::new(Int64Array::from(vec![1, 2, 3]));
        let b: ArrayRef = Arc::new(Int64Array::from(vec![3, 2, 1]));
        let va = ColumnView::try_new(&a).unwrap();
        let vb = ColumnView::try_new(&b).unwrap();
        let sel: Vec<u32> = vec![0, 1, 2];
        let mut ha = vec![0u64; 3];
        let mut hb = vec![0u64; 3];
        hash_keys(std::slice::from_ref(&va), &sel, &mut ha);
        hash_keys(std::slice::from_ref(&vb), &sel, &mut hb);
        assert_eq!(ha[0], hb[2]);
        assert_eq!(ha[1], hb[1]);
        assert_ne!(ha[0], ha[1]);
    }

    #[test]
    fn test_multi_column_hash_combines() {
        let a: ArrayRef = Arc::new(Int64Array::from(vec![1]));
        let b: ArrayRef = Arc::new(StringArray::from(vec!["x"]));
        let views = vec![
            ColumnView::try_new(&a).unwrap(),
            ColumnView::try_new(&b).unwrap(),
        ];
        let mut combined = vec![0u64; 1];
        hash_keys(&views, &[0], &mut combined);
        let mut single = vec![0u64; 1];
        hash_keys(&views[..1], &[0], &mut single);
        assert_ne!(combined[0], single[0]);
    }

    #[test]
    fn test_nan_bits_are_canonical() {
        let a = canonical_f64_bits(f64::NAN);
        let b = canonical_f64_bits(-f64::NAN);
        assert_eq!(a, b);
    }

    #[test]
    fn test_byte_hash_differs_by_content() {
        let h1 = hash_bytes_with_seed(JOIN_HASH_SEED, b"abc");
        let h2 = hash_bytes_with_seed(JOIN_HASH_SEED, b"abd");
        assert_ne!(h1, h2);
    }
}
