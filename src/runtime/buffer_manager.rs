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
//! Block allocation against a tracked memory budget.
//!
//! Responsibilities:
//! - Hands out byte blocks accounted against a `MemTracker` hierarchy.
//! - Surfaces out-of-memory as an explicit error instead of aborting.
//!
//! Key exported interfaces:
//! - Types: `BufferManager`, `BlockHandle`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::runtime::mem_tracker::{MemTracker, TrackedBytes};

/// Allocates fixed byte blocks and accounts them against a budget.
///
/// Pinning in this engine is borrow-based: a `BlockHandle` owns its bytes and
/// access goes through `data`/`data_mut`. Swizzled row contents therefore use
/// block-relative offsets, never addresses, so blocks stay relocatable.
#[derive(Debug)]
pub struct BufferManager {
    tracker: Arc<MemTracker>,
    next_block_id: AtomicU32,
}

impl BufferManager {
    /// A buffer manager with a hard budget in bytes.
    pub fn with_budget(budget_bytes: usize) -> Arc<Self> {
        let limit = i64::try_from(budget_bytes).unwrap_or(i64::MAX);
        Arc::new(Self {
            tracker: MemTracker::new_root_with_limit("buffer_manager", limit),
            next_block_id: AtomicU32::new(1),
        })
    }

    /// An unbounded buffer manager (tests, small pipelines).
    pub fn unbounded() -> Arc<Self> {
        Arc::new(Self {
            tracker: MemTracker::new_root("buffer_manager"),
            next_block_id: AtomicU32::new(1),
        })
    }

    pub fn tracker(&self) -> &Arc<MemTracker> {
        &self.tracker
    }

    pub fn used_bytes(&self) -> i64 {
        self.tracker.current()
    }

    /// Allocate a zeroed block of `bytes`.
    pub fn allocate(&self, bytes: usize) -> Result<BlockHandle, String> {
        let signed = i64::try_from(bytes).map_err(|_| "block allocation size overflow".to_string())?;
        if self.tracker.would_exceed(signed) {
            return Err(format!(
                "out of memory: cannot allocate block of {} bytes (used={} limit={})",
                bytes,
                self.tracker.current(),
                self.tracker.limit()
            ));
        }
        let reservation = TrackedBytes::new(bytes, Arc::clone(&self.tracker));
        let id = self.next_block_id.fetch_add(1, Ordering::AcqRel);
        Ok(BlockHandle {
            id,
            buffer: vec![0u8; bytes],
            reservation,
        })
    }
}

/// An owned, accounted byte block. Dropping the handle releases the bytes.
#[derive(Debug)]
pub struct BlockHandle {
    id: u32,
    buffer: Vec<u8>,
    reservation: TrackedBytes,
}

impl BlockHandle {
    /// Process-unique block id; survives moves between collections.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Extend the block by `additional` zero bytes, growing the reservation.
    pub fn grow(&mut self, additional: usize, manager: &BufferManager) -> Result<(), String> {
        let signed =
            i64::try_from(additional).map_err(|_| "block grow size overflow".to_string())?;
        if manager.tracker.would_exceed(signed) {
            return Err(format!(
                "out of memory: cannot grow block by {} bytes (used={} limit={})",
                additional,
                manager.tracker.current(),
                manager.tracker.limit()
            ));
        }
        self.reservation.grow(additional);
        self.buffer.resize(self.buffer.len() + additional, 0);
        Ok(())
    }
}
