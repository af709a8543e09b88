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
//! External build coordination: the partition event.
//!
//! Per-worker local tables arrive swizzled. The coordinator merges their
//! histograms into the global table, reduces the histogram to the coarsest
//! split whose largest partition fits the memory budget, and runs one
//! partition task per local table on the pool. Finishing the event builds
//! the chained table over the first memory-sized group of partitions.

use std::sync::{Arc, Condvar, Mutex};

use threadpool::ThreadPool;

use crate::basalt_logging::debug;
use crate::exec::hashjoin::join_hash_table::JoinHashTable;
use crate::runtime::cancel::CancelToken;

struct EventState {
    pending: Mutex<usize>,
    done: Condvar,
    error: Mutex<Option<String>>,
}

impl EventState {
    fn finish_task(&self, result: Result<(), String>) {
        if let Err(err) = result {
            let mut slot = self.error.lock().expect("partition event error lock");
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        let mut pending = self.pending.lock().expect("partition event lock");
        *pending -= 1;
        if *pending == 0 {
            self.done.notify_all();
        }
    }
}

/// A scheduled partition event: one task per local table, each routing its
/// swizzled rows into per-partition collections and merging them into the
/// global table.
pub struct PartitionEvent {
    global: Arc<JoinHashTable>,
    state: Arc<EventState>,
    cancel: CancelToken,
}

/// Merge local histograms into `global`, reduce against the budget, and run
/// the partition tasks. Locals must already be swizzled
/// (`swizzle_collected_blocks`).
pub fn schedule_partition_tasks(
    pool: &ThreadPool,
    global: JoinHashTable,
    local_hts: Vec<JoinHashTable>,
    cancel: &CancelToken,
) -> Result<PartitionEvent, String> {
    let mut total_heap_bytes = 0usize;
    let mut total_rows = 0usize;
    for local in &local_hts {
        if local.count() != 0 {
            return Err("local tables must be swizzled before partitioning".to_string());
        }
        global.merge_histogram(local)?;
        total_heap_bytes += local.swizzled_heap_bytes();
        total_rows += local.swizzled_count();
    }
    let avg_string_size = if total_rows > 0 {
        total_heap_bytes / total_rows
    } else {
        0
    };
    global.reduce_histogram(avg_string_size)?;
    debug!(
        "partition event scheduled: locals={} rows={} radix_bits={}",
        local_hts.len(),
        total_rows,
        global.current_radix_bits()
    );

    let global = Arc::new(global);
    let state = Arc::new(EventState {
        pending: Mutex::new(local_hts.len()),
        done: Condvar::new(),
        error: Mutex::new(None),
    });
    for mut local in local_hts {
        let task_global = Arc::clone(&global);
        let task_state = Arc::clone(&state);
        let task_cancel = cancel.clone();
        pool.execute(move || {
            let result = task_cancel
                .check()
                .and_then(|_| local.partition(&task_global));
            // release the global reference before signalling completion so
            // finish_event can unwrap the Arc
            drop(task_global);
            task_state.finish_task(result);
        });
    }
    Ok(PartitionEvent {
        global,
        state,
        cancel: cancel.clone(),
    })
}

impl PartitionEvent {
    /// Wait for every partition task, then finalize the first round. Any
    /// task failure invalidates the whole build.
    pub fn finish_event(self) -> Result<JoinHashTable, String> {
        {
            let mut pending = self.state.pending.lock().expect("partition event lock");
            while *pending > 0 {
                pending = self
                    .state
                    .done
                    .wait(pending)
                    .expect("partition event lock");
            }
        }
        if let Some(err) = self
            .state
            .error
            .lock()
            .expect("partition event error lock")
            .take()
        {
            return Err(err);
        }
        self.cancel.check()?;
        let mut global = Arc::try_unwrap(self.global)
            .map_err(|_| "partition event still referenced".to_string())?;
        global.finalize_external()?;
        Ok(global)
    }
}
