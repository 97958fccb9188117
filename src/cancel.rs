use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Global stop signal shared by the coordinator, generation workers and sort tasks.
///
/// Cloning is cheap; all clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
