//! Mark-sweep collection over committed code.
//!
//! A committed address may be a live return PC on any thread's stack at any
//! moment, so nothing can be freed until every thread has been asked. The
//! pass runs in three phases: redirect all entrypoints to the interpreter
//! bridge under the lock (stopping new invocations from entering
//! candidates), run a checkpoint in which each thread marks the allocations
//! its own stack still references, then sweep the unmarked entries and
//! restore the survivors. Entries on a stack survive even when nothing else
//! references them; retention is cheaper than invalidating a live return
//! address.

use std::ptr::NonNull;

use crate::header::{from_code_to_allocation, CodeHeader};
use crate::cache::CodeCache;
use crate::runtime::StackWalker;

impl CodeCache {
    /// Run one collection pass. If another thread's collection is already in
    /// flight, wait for it to finish and return without running a second
    /// one; the waiter's failed allocation retries against the freshly
    /// swept cache.
    pub fn garbage_collect(&self) {
        let registered_before;
        {
            let mut state = self.state.lock();
            if self.wait_for_collection_to_complete(&mut state) {
                return;
            }

            tracing::debug!(
                code_bytes = state.region.used_for_code(),
                data_bytes = state.region.used_for_data(),
                entries = state.registry.len(),
                "starting code cache collection"
            );

            // Growing is cheaper than collecting and the caller is here
            // because an allocation just failed; take any headroom first.
            state.region.increase_capacity();

            state.collection_in_progress = true;
            registered_before = state.registry.len();

            // Soft clobber: no code is freed yet, but new invocations go
            // back through the interpreter so they cannot enter candidates.
            for (_, method) in state.registry.iter_code() {
                method.set_entry_point(self.entry_points.interpreter_bridge);
            }
            for entry in state.registry.profiling_entries() {
                entry.method.set_profiling_info(None);
            }
        }

        // Mark. The lock is released: every thread (the requester included)
        // walks its own stack at its next safepoint and records, with an
        // atomic bit per allocation, the entries it still returns into. The
        // instrumentation shadow stack is consulted too, so frames hidden
        // behind exit trampolines are not missed.
        self.checkpoint.run_checkpoint(&|stack: &dyn StackWalker| {
            let mut mark = |pc: usize| {
                if !self.contains_pc(pc) {
                    return;
                }
                if let Some(header) = self.lookup_method_header(pc, None) {
                    self.live_bitmap
                        .atomic_test_and_set(from_code_to_allocation(header.entry_point()));
                }
            };
            stack.visit_frames(&mut mark);
            stack.visit_instrumentation_frames(&mut mark);
        });

        // Sweep.
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            debug_assert_eq!(registered_before, state.registry.len());

            let mut doomed = Vec::new();
            for (code_addr, method) in state.registry.iter_code() {
                if self.live_bitmap.test(from_code_to_allocation(code_addr)) {
                    // Still on some stack: put its own code back.
                    // Safety: the entry is live until this sweep frees it.
                    let header = unsafe { CodeHeader::from_code_ptr(code_addr as *const u8) };
                    method.set_entry_point(header.entry_point());
                } else {
                    method.reset_warmth();
                    doomed.push(code_addr);
                }
            }
            let collected = doomed.len();
            for code_addr in doomed {
                state.registry.remove(code_addr);
                Self::free_entry(&mut state.region, code_addr);
            }

            // Every record was detached in the clobber phase; free them all.
            for entry in state.registry.take_profiling_entries() {
                debug_assert!(entry.method.profiling_info().is_none());
                if let Some(data) = NonNull::new(entry.info.as_ptr() as *mut u8) {
                    state.region.free_data(data);
                }
            }

            self.live_bitmap.clear_all();
            state.collection_in_progress = false;
            self.collection_done.notify_all();

            tracing::debug!(
                collected,
                surviving = state.registry.len(),
                code_bytes = state.region.used_for_code(),
                data_bytes = state.region.used_for_data(),
                "finished code cache collection"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::cache::{CodeCache, CommitRequest};
    use crate::config::{CacheConfig, KB};
    use crate::header::FrameInfo;
    use crate::runtime::{
        AllocatorId, EntryPoints, Method, StackSnapshot, StaticCheckpoint,
    };

    const BRIDGE: usize = 0xB81D6E;

    fn make_cache(checkpoint: Arc<StaticCheckpoint>) -> CodeCache {
        CodeCache::new(
            CacheConfig {
                initial_capacity: 64 * KB,
                max_capacity: KB * KB,
                ..Default::default()
            },
            checkpoint,
            EntryPoints { interpreter_bridge: BRIDGE },
        )
        .unwrap()
    }

    fn make_method(name: &str) -> Arc<Method> {
        Arc::new(Method::new(name, AllocatorId(1), BRIDGE))
    }

    fn commit(cache: &CodeCache, method: &Arc<Method>, code_len: usize) -> usize {
        let code = vec![0xC3u8; code_len];
        cache
            .commit_code(
                method,
                &CommitRequest {
                    mapping_table: None,
                    vmap_table: None,
                    gc_map: None,
                    frame: FrameInfo::default(),
                    code: &code,
                    has_should_deoptimize_flag: false,
                },
            )
            .unwrap()
            .as_ptr() as usize
    }

    #[test]
    fn test_collection_frees_unreferenced_entries() {
        let checkpoint = Arc::new(StaticCheckpoint::default());
        let cache = make_cache(Arc::clone(&checkpoint));
        let method = make_method("A.dead");
        let code_ptr = commit(&cache, &method, 32);

        cache.garbage_collect();

        assert_eq!(cache.number_of_compiled_methods(), 0);
        assert_eq!(method.entry_point(), BRIDGE);
        assert!(cache.lookup_method_header(code_ptr + 4, None).is_none());
        assert_eq!(checkpoint.runs(), 1);
    }

    #[test]
    fn test_on_stack_entry_survives() {
        let checkpoint = Arc::new(StaticCheckpoint::default());
        let cache = make_cache(Arc::clone(&checkpoint));
        let live = make_method("A.live");
        let dead = make_method("A.dead");
        let live_ptr = commit(&cache, &live, 64);
        let dead_ptr = commit(&cache, &dead, 64);

        // A return PC in the middle of the live method's code.
        checkpoint.set_stacks(vec![StackSnapshot {
            frames: vec![live_ptr + 12],
            instrumentation: vec![],
        }]);

        cache.garbage_collect();

        assert_eq!(live.entry_point(), live_ptr);
        assert!(cache.lookup_method_header(live_ptr + 12, Some(&live)).is_some());
        assert_eq!(dead.entry_point(), BRIDGE);
        assert!(cache.lookup_method_header(dead_ptr + 12, None).is_none());
        assert_eq!(cache.number_of_compiled_methods(), 1);
    }

    #[test]
    fn test_instrumentation_shadow_stack_keeps_entries_alive() {
        let checkpoint = Arc::new(StaticCheckpoint::default());
        let cache = make_cache(Arc::clone(&checkpoint));
        let trampolined = make_method("A.trampolined");
        let ptr = commit(&cache, &trampolined, 48);

        checkpoint.set_stacks(vec![StackSnapshot {
            frames: vec![],
            instrumentation: vec![ptr + 8],
        }]);

        cache.garbage_collect();

        assert_eq!(trampolined.entry_point(), ptr);
        assert_eq!(cache.number_of_compiled_methods(), 1);
    }

    #[test]
    fn test_collection_detaches_and_frees_profiling_info() {
        let checkpoint = Arc::new(StaticCheckpoint::default());
        let cache = make_cache(Arc::clone(&checkpoint));
        let method = make_method("A.profiled");
        commit(&cache, &method, 32);
        cache.add_profiling_info(&method, &[1, 2, 3], false).unwrap();
        assert!(method.profiling_info().is_some());

        cache.garbage_collect();

        assert!(method.profiling_info().is_none());
        assert_eq!(cache.data_cache_size(), 0);
    }

    #[test]
    fn test_surviving_profiling_method_can_reprofile() {
        let checkpoint = Arc::new(StaticCheckpoint::default());
        let cache = make_cache(Arc::clone(&checkpoint));
        let method = make_method("A.again");
        let ptr = commit(&cache, &method, 32);
        cache.add_profiling_info(&method, &[7], false).unwrap();

        checkpoint.set_stacks(vec![StackSnapshot {
            frames: vec![ptr],
            instrumentation: vec![],
        }]);
        cache.garbage_collect();

        // The code survived but profiling was torn down; a fresh record can
        // be attached.
        assert_eq!(method.entry_point(), ptr);
        assert!(method.profiling_info().is_none());
        assert!(cache.add_profiling_info(&method, &[7], false).is_some());
    }

    #[test]
    fn test_collection_resets_warmth_of_collected_methods() {
        let checkpoint = Arc::new(StaticCheckpoint::default());
        let cache = make_cache(Arc::clone(&checkpoint));
        let method = make_method("A.cooling");
        method.increment_warmth();
        method.increment_warmth();
        commit(&cache, &method, 32);

        cache.garbage_collect();

        assert_eq!(method.warmth(), 0);
    }

    #[test]
    fn test_failed_commit_collects_then_succeeds() {
        let checkpoint = Arc::new(StaticCheckpoint::default());
        // 64 KiB total, so 32 KiB of code space and no growth headroom.
        let cache = CodeCache::new(
            CacheConfig {
                initial_capacity: 64 * KB,
                max_capacity: 64 * KB,
                ..Default::default()
            },
            checkpoint.clone(),
            EntryPoints { interpreter_bridge: BRIDGE },
        )
        .unwrap();

        let first = make_method("A.first");
        commit(&cache, &first, 20 * KB);

        // Does not fit next to the first entry; the cache must collect the
        // (unreferenced) first entry to make room.
        let second = make_method("A.second");
        let second_ptr = commit(&cache, &second, 20 * KB);

        assert_eq!(checkpoint.runs(), 1);
        assert_eq!(first.entry_point(), BRIDGE);
        assert_eq!(second.entry_point(), second_ptr);
        assert_eq!(cache.number_of_compiled_methods(), 1);
    }
}
