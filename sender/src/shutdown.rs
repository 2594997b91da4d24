use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Stand-in for the `multiprocessing.Event` the original uses to tell a
/// dispatcher or the sender pool to quit (§5 "Cancellation and
/// timeouts"). Cheap to clone; every holder observes the same flag.
#[derive(Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        ShutdownSignal(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
