use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};

type Job = Box<dyn FnOnce() + Send>;

enum Work {
    Run(Job),
    Stop,
}

/// Single-threaded execution context.
///
/// Jobs posted to a context run one at a time, in post order, on the context's
/// own thread. Worker contexts route every handler through one of these so the
/// state they own is never touched concurrently.
pub struct ContextLoop {
    handle: ContextHandle,
    thread: Option<JoinHandle<()>>,
}

/// Cloneable sender side of a [`ContextLoop`].
#[derive(Clone)]
pub struct ContextHandle {
    name: Arc<str>,
    sender: Sender<Work>,
}

impl ContextLoop {
    pub fn spawn(name: impl Into<String>) -> io::Result<Self> {
        Self::spawn_with_stack(name, None)
    }

    /// Spawns the context thread, optionally with an explicit stack size.
    pub fn spawn_with_stack(name: impl Into<String>, stack_size: Option<usize>) -> io::Result<Self> {
        let name: String = name.into();
        let (sender, receiver) = unbounded();
        let mut builder = thread::Builder::new().name(name.clone());
        if let Some(size) = stack_size {
            builder = builder.stack_size(size);
        }
        let loop_name = name.clone();
        let thread = builder.spawn(move || run(&loop_name, receiver))?;
        Ok(Self {
            handle: ContextHandle {
                name: name.into(),
                sender,
            },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle.clone()
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    /// Lets queued jobs finish, then joins the context thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.handle.sender.send(Work::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                tracing::error!("context {} terminated abnormally", self.handle.name);
            }
        }
    }
}

impl Drop for ContextLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ContextHandle {
    /// Queues a job; returns false once the context has stopped.
    pub fn post<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender.send(Work::Run(Box::new(job))).is_ok()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn run(name: &str, receiver: Receiver<Work>) {
    tracing::debug!("context {name} started");
    while let Ok(work) = receiver.recv() {
        match work {
            Work::Run(job) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!("job panicked on context {name}");
                }
            }
            Work::Stop => break,
        }
    }
    tracing::debug!("context {name} stopped");
}
