//! Compensating actions for multi-step operations.
//!
//! Steps that create external state push an undo action; on success the
//! stack is disarmed. Otherwise the actions run in reverse order exactly
//! once, either through [`CleanupStack::run`] or on drop, which covers a
//! future being dropped after a termination signal.

type Action = Box<dyn FnOnce() -> crate::Result<()> + Send>;

/// Ordered list of undo actions.
#[derive(Default)]
pub struct CleanupStack {
    actions: Vec<(String, Action)>,
}

impl CleanupStack {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an undo action.
    pub fn push<F>(&mut self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> crate::Result<()> + Send + 'static,
    {
        self.actions.push((label.into(), Box::new(action)));
    }

    /// Number of pending actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Forget every pending action; the operation succeeded.
    pub fn disarm(mut self) {
        self.actions.clear();
    }

    /// Run pending actions newest-first. Failures are logged, not returned.
    pub fn run(mut self) {
        self.run_pending();
    }

    fn run_pending(&mut self) {
        while let Some((label, action)) = self.actions.pop() {
            tracing::debug!(action = %label, "running cleanup");
            if let Err(e) = action() {
                tracing::warn!(action = %label, error = %e, "cleanup failed");
            }
        }
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        self.run_pending();
    }
}
