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
//! Column-major batch wrapper used by build and probe paths.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, RecordBatch, RecordBatchOptions};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

/// A chunk of data, consisting of multiple rows. Wrapper around an Arrow
/// RecordBatch; columns are addressed positionally.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub batch: RecordBatch,
}

impl Chunk {
    pub fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    /// Build a chunk from columns, synthesizing field names `c0..cN`.
    pub fn try_from_columns(columns: Vec<ArrayRef>) -> Result<Self, String> {
        if columns.is_empty() {
            return Err("chunk requires at least one column".to_string());
        }
        let len = columns[0].len();
        for (idx, col) in columns.iter().enumerate() {
            if col.len() != len {
                return Err(format!(
                    "chunk column {} length mismatch: expected {} got {}",
                    idx,
                    len,
                    col.len()
                ));
            }
        }
        let fields: Vec<Field> = columns
            .iter()
            .enumerate()
            .map(|(idx, col)| Field::new(format!("c{idx}"), col.data_type().clone(), true))
            .collect();
        let schema = Arc::new(Schema::new(fields));
        let batch = RecordBatch::try_new(schema, columns).map_err(|e| e.to_string())?;
        Ok(Self { batch })
    }

    /// A zero-column chunk carrying only a row count (payload-less builds).
    pub fn empty_rows(len: usize) -> Result<Self, String> {
        let options = RecordBatchOptions::new().with_row_count(Some(len));
        let batch =
            RecordBatch::try_new_with_options(Arc::new(Schema::empty()), Vec::new(), &options)
                .map_err(|e| e.to_string())?;
        Ok(Self { batch })
    }

    /// An empty chunk with the given column types.
    pub fn empty_with_types(types: &[DataType]) -> Result<Self, String> {
        let fields: Vec<Field> = types
            .iter()
            .enumerate()
            .map(|(idx, t)| Field::new(format!("c{idx}"), t.clone(), true))
            .collect();
        let schema: SchemaRef = Arc::new(Schema::new(fields));
        let options = RecordBatchOptions::new().with_row_count(Some(0));
        let columns = types
            .iter()
            .map(|t| arrow::array::new_empty_array(t))
            .collect::<Vec<_>>();
        let batch = RecordBatch::try_new_with_options(schema, columns, &options)
            .map_err(|e| e.to_string())?;
        Ok(Self { batch })
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn len(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn columns(&self) -> &[ArrayRef] {
        self.batch.columns()
    }

    pub fn column(&self, idx: usize) -> Result<&ArrayRef, String> {
        self.batch.columns().get(idx).ok_or_else(|| {
            format!(
                "chunk column {} out of bounds (num_columns={})",
                idx,
                self.batch.num_columns()
            )
        })
    }

    pub fn num_columns(&self) -> usize {
        self.batch.num_columns()
    }

    pub fn slice(&self, offset: usize, length: usize) -> Self {
        Self {
            batch: self.batch.slice(offset, length),
        }
    }

    pub fn estimated_bytes(&self) -> usize {
        self.batch.get_array_memory_size()
    }
}

impl From<RecordBatch> for Chunk {
    fn from(batch: RecordBatch) -> Self {
        Self::new(batch)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{ArrayRef, Int64Array, StringArray};
    use arrow::datatypes::DataType;

    use super::Chunk;

    #[test]
    fn test_try_from_columns() {
        let a: ArrayRef = Arc::new(Int64Array::from(vec![1, 2, 3]));
        let b: ArrayRef = Arc::new(StringArray::from(vec!["x", "y", "z"]));
        let chunk = Chunk::try_from_columns(vec![a, b]).unwrap();
        assert_eq!(chunk.len(), 3);
        assert_eq!(chunk.num_columns(), 2);
        assert_eq!(chunk.column(0).unwrap().data_type(), &DataType::Int64);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let a: ArrayRef = Arc::new(Int64Array::from(vec![1, 2, 3]));
        let b: ArrayRef = Arc::new(Int64Array::from(vec![1]));
        let err = Chunk::try_from_columns(vec![a, b]).unwrap_err();
        assert!(err.contains("length mismatch"), "unexpected error: {err}");
    }

    #[test]
    fn test_empty_with_types() {
        let chunk = Chunk::empty_with_types(&[DataType::Int32, DataType::Utf8]).unwrap();
        assert!(chunk.is_empty());
        assert_eq!(chunk.num_columns(), 2);
    }
}
