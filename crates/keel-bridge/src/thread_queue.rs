// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Dedicated-thread script queue.
//
// One OS thread drains an unbounded channel in FIFO order.  The thread is
// plain `std::thread` because JavaScript engines are not `Send` across await
// points and must stay pinned to a single thread.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::thread::{self, JoinHandle, ThreadId};

use keel_core::error::{KeelError, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::traits::{ScriptQueue, Task};

/// A `ScriptQueue` backed by its own thread.
pub struct ThreadScriptQueue {
    name: String,
    thread_id: ThreadId,
    sender: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadScriptQueue {
    /// Start the queue thread.
    pub fn spawn(name: impl Into<String>, stack_size: Option<usize>) -> Result<Self> {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();

        let mut builder = thread::Builder::new().name(name.clone());
        if let Some(size) = stack_size {
            builder = builder.stack_size(size);
        }

        let thread_name = name.clone();
        let handle = builder
            .spawn(move || {
                debug!(queue = %thread_name, "script queue thread started");
                while let Some(task) = receiver.blocking_recv() {
                    // A panicking task must not take the whole queue down.
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!(queue = %thread_name, "script queue task panicked");
                    }
                }
                debug!(queue = %thread_name, "script queue thread exiting");
            })
            .map_err(|e| KeelError::Queue(format!("spawn {name}: {e}")))?;

        info!(queue = %name, "script queue started");
        Ok(Self {
            name,
            thread_id: handle.thread().id(),
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl ScriptQueue for ThreadScriptQueue {
    fn run_on_queue(&self, task: Task) -> Result<()> {
        let guard = self.sender.lock().expect("queue sender lock poisoned");
        let sender = guard
            .as_ref()
            .ok_or_else(|| KeelError::Queue(format!("{} has quit", self.name)))?;
        sender
            .send(task)
            .map_err(|_| KeelError::Queue(format!("{} thread is gone", self.name)))
    }

    fn is_on_queue(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Close the channel and wait for already-queued tasks to drain.
    ///
    /// From the queue's own thread this only closes the channel.
    fn quit(&self) {
        let sender = self
            .sender
            .lock()
            .expect("queue sender lock poisoned")
            .take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        if self.is_on_queue() {
            return;
        }
        let handle = self.handle.lock().expect("queue handle lock poisoned").take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(queue = %self.name, "script queue thread panicked on exit");
            }
        }
        info!(queue = %self.name, "script queue stopped");
    }
}

impl Drop for ThreadScriptQueue {
    fn drop(&mut self) {
        self.quit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc as std_mpsc;

    #[test]
    fn tasks_run_in_submission_order() {
        let queue = ThreadScriptQueue::spawn("test-fifo", None).expect("spawn");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let seen = Arc::clone(&seen);
            queue
                .run_on_queue(Box::new(move || seen.lock().unwrap().push(i)))
                .expect("submit");
        }
        queue.quit();
        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn tasks_run_on_the_queue_thread() {
        let queue = Arc::new(ThreadScriptQueue::spawn("test-affinity", None).expect("spawn"));
        assert!(!queue.is_on_queue());

        let (tx, rx) = std_mpsc::channel();
        let inner = Arc::clone(&queue);
        queue
            .run_on_queue(Box::new(move || {
                tx.send((inner.is_on_queue(), thread::current().name().map(str::to_owned)))
                    .unwrap();
            }))
            .expect("submit");
        let (on_queue, name) = rx.recv().expect("task ran");
        assert!(on_queue);
        assert_eq!(name.as_deref(), Some("test-affinity"));
    }

    #[test]
    fn submit_after_quit_fails() {
        let queue = ThreadScriptQueue::spawn("test-quit", None).expect("spawn");
        queue.quit();
        queue.quit();
        let err = queue.run_on_queue(Box::new(|| {})).unwrap_err();
        assert!(matches!(err, KeelError::Queue(_)));
    }

    #[test]
    fn panicking_task_does_not_stop_the_queue() {
        let queue = ThreadScriptQueue::spawn("test-panic", None).expect("spawn");
        let (tx, rx) = std_mpsc::channel();
        queue
            .run_on_queue(Box::new(|| panic!("boom")))
            .expect("submit");
        queue
            .run_on_queue(Box::new(move || tx.send(()).unwrap()))
            .expect("submit");
        rx.recv().expect("second task ran");
    }
}
