//! Channel-backed dispatcher
//!
//! The dispatcher half is cloned into the cache; the queue half stays with
//! the thread that owns UI state and drains it from its event loop.

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use super::{Dispatcher, Job};

/// Sending half; cheap to clone
#[derive(Clone)]
pub struct ChannelDispatcher {
    sender: UnboundedSender<Job>,
}

/// Receiving half, owned by the context that runs the jobs
pub struct DispatchQueue {
    receiver: UnboundedReceiver<Job>,
}

impl ChannelDispatcher {
    /// Create a connected dispatcher/queue pair
    pub fn new() -> (Self, DispatchQueue) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, DispatchQueue { receiver })
    }
}

impl Dispatcher for ChannelDispatcher {
    fn dispatch(&self, job: Job) {
        // The queue owner is gone; nobody is left to observe the result
        if self.sender.send(job).is_err() {
            trace!("Dispatch queue closed, dropping job");
        }
    }
}

impl DispatchQueue {
    /// Run every job that is ready without waiting
    ///
    /// Returns the number of jobs run.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        loop {
            match self.receiver.try_recv() {
                Ok(job) => {
                    job();
                    ran += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return ran,
            }
        }
    }

    /// Wait for the next job and run it
    ///
    /// Returns false once every dispatcher has been dropped and the queue is empty.
    pub async fn next(&mut self) -> bool {
        match self.receiver.recv().await {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Blocking variant of [`DispatchQueue::next`] for plain OS threads
    ///
    /// Panics if called from inside an async runtime.
    pub fn blocking_next(&mut self) -> bool {
        match self.receiver.blocking_recv() {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }
}
