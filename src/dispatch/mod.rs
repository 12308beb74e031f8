//! Result delivery onto the caller's execution context
//!
//! Worker tasks never run listeners themselves. They hand a [`Job`] to a
//! [`Dispatcher`], which decides where it runs: typically the single UI
//! thread draining a [`DispatchQueue`].

pub mod channel;

pub use channel::{ChannelDispatcher, DispatchQueue};

/// A listener invocation waiting to run
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Marshals jobs onto an execution context
pub trait Dispatcher: Send + Sync {
    /// Schedule `job` to run on this dispatcher's context
    fn dispatch(&self, job: Job);
}

/// Runs every job immediately on the dispatching thread
///
/// Useful for headless callers with no UI thread to marshal onto.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch(&self, job: Job) {
        job();
    }
}
