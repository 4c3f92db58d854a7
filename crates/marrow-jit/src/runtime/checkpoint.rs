//! Cross-thread checkpoint interface.
//!
//! Collection needs every mutator thread, the requester included, to report
//! the return PCs on its own stack before anything is freed. The runtime
//! owns the threads and the safepoint machinery, so the cache only states
//! the contract: deliver the task to every thread at its next safepoint and
//! block until all of them have run it.

/// One thread's stack, as visible at a safepoint.
pub trait StackWalker {
    /// Visit the return PC of every non-inlined compiled frame, innermost
    /// first.
    fn visit_frames(&self, visitor: &mut dyn FnMut(usize));

    /// Visit PCs parked on the instrumentation shadow stack: frames whose
    /// return address was redirected through a trampoline and which a plain
    /// walk would miss.
    fn visit_instrumentation_frames(&self, visitor: &mut dyn FnMut(usize)) {
        let _ = visitor;
    }
}

/// The runtime's "run this on every thread and wait" primitive.
pub trait ThreadCheckpoint: Send + Sync {
    /// Run `task` against every mutator thread's stack at its next
    /// safepoint, including the requesting thread's own stack. Returns only
    /// once every thread has reported.
    fn run_checkpoint(&self, task: &(dyn Fn(&dyn StackWalker) + Sync));
}

/// A pre-captured stack: return PCs plus instrumentation shadow entries.
#[derive(Debug, Clone, Default)]
pub struct StackSnapshot {
    pub frames: Vec<usize>,
    pub instrumentation: Vec<usize>,
}

impl StackWalker for StackSnapshot {
    fn visit_frames(&self, visitor: &mut dyn FnMut(usize)) {
        for &pc in &self.frames {
            visitor(pc);
        }
    }

    fn visit_instrumentation_frames(&self, visitor: &mut dyn FnMut(usize)) {
        for &pc in &self.instrumentation {
            visitor(pc);
        }
    }
}

/// Checkpoint over a fixed set of pre-captured stacks.
///
/// Runtimes with live threads deliver the task through their safepoint
/// mechanism instead; this implementation serves tests and single-threaded
/// embedders, where the stacks are known when collection starts.
#[derive(Default)]
pub struct StaticCheckpoint {
    stacks: parking_lot::Mutex<Vec<StackSnapshot>>,
    runs: std::sync::atomic::AtomicUsize,
}

impl StaticCheckpoint {
    pub fn new(stacks: Vec<StackSnapshot>) -> Self {
        StaticCheckpoint {
            stacks: parking_lot::Mutex::new(stacks),
            runs: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Replace the captured stacks for the next collection.
    pub fn set_stacks(&self, stacks: Vec<StackSnapshot>) {
        *self.stacks.lock() = stacks;
    }

    /// How many checkpoints have run.
    pub fn runs(&self) -> usize {
        self.runs.load(std::sync::atomic::Ordering::Acquire)
    }
}

impl ThreadCheckpoint for StaticCheckpoint {
    fn run_checkpoint(&self, task: &(dyn Fn(&dyn StackWalker) + Sync)) {
        let stacks = self.stacks.lock();
        for stack in stacks.iter() {
            task(stack);
        }
        self.runs.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_checkpoint_visits_every_stack() {
        let checkpoint = StaticCheckpoint::new(vec![
            StackSnapshot { frames: vec![1, 2], instrumentation: vec![] },
            StackSnapshot { frames: vec![3], instrumentation: vec![4] },
        ]);
        let seen = parking_lot::Mutex::new(Vec::new());
        checkpoint.run_checkpoint(&|stack| {
            stack.visit_frames(&mut |pc| seen.lock().push(pc));
            stack.visit_instrumentation_frames(&mut |pc| seen.lock().push(pc));
        });
        let mut seen = seen.into_inner();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3, 4]);
        assert_eq!(checkpoint.runs(), 1);
    }

    #[test]
    fn test_empty_checkpoint_still_counts_a_run() {
        let checkpoint = StaticCheckpoint::default();
        checkpoint.run_checkpoint(&|_| {});
        assert_eq!(checkpoint.runs(), 1);
    }
}
