use crate::core::{DbError, Result};
use std::cell::Cell;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;

thread_local! {
    static CURRENT_LOOP: Cell<Option<usize>> = const { Cell::new(None) };
}

struct LoopThread {
    stop_tx: oneshot::Sender<()>,
    thread: JoinHandle<()>,
}

/// Fixed pool of single-threaded event loops.
///
/// Each loop is an OS thread driving its own current-thread runtime, so a
/// command and all its continuations stay on the loop it was handed to.
/// Sockets created on a loop belong to that loop's reactor.
pub struct EventLoopGroup {
    handles: Vec<Handle>,
    next: AtomicUsize,
    threads: Mutex<Vec<LoopThread>>,
}

impl EventLoopGroup {
    pub fn start(count: usize) -> Result<Self> {
        if count == 0 {
            return Err(DbError::InvalidConfig("event loop count must be > 0".to_string()));
        }

        let mut handles = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);
        for index in 0..count {
            let (handle_tx, handle_rx) = std::sync::mpsc::channel();
            let (stop_tx, stop_rx) = oneshot::channel::<()>();

            let thread = thread::Builder::new()
                .name(format!("kv-event-loop-{}", index))
                .spawn(move || {
                    let runtime = match Builder::new_current_thread().enable_all().build() {
                        Ok(runtime) => runtime,
                        Err(err) => {
                            let _ = handle_tx.send(Err(err.to_string()));
                            return;
                        }
                    };
                    CURRENT_LOOP.with(|current| current.set(Some(index)));
                    let _ = handle_tx.send(Ok(runtime.handle().clone()));
                    runtime.block_on(async {
                        let _ = stop_rx.await;
                    });
                })
                .map_err(|e| DbError::Fatal(format!("spawn event loop {}: {}", index, e)))?;

            let handle = handle_rx
                .recv()
                .map_err(|_| DbError::Fatal(format!("event loop {} exited during start", index)))?
                .map_err(|e| DbError::Fatal(format!("event loop {} runtime: {}", index, e)))?;

            handles.push(handle);
            threads.push(LoopThread { stop_tx, thread });
        }

        log::debug!("started {} event loop(s)", count);
        Ok(Self {
            handles,
            next: AtomicUsize::new(0),
            threads: Mutex::new(threads),
        })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Round-robin choice for commands submitted from outside any loop.
    pub fn next(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len().max(1)
    }

    /// Index of the loop the calling thread runs, if any.
    pub fn current() -> Option<usize> {
        CURRENT_LOOP.with(Cell::get)
    }

    pub fn handle(&self, index: usize) -> Result<&Handle> {
        self.handles.get(index).ok_or_else(|| {
            DbError::InvalidArgument(format!(
                "event loop {} out of range ({} loops)",
                index,
                self.handles.len()
            ))
        })
    }

    pub fn spawn_on<F>(&self, index: usize, future: F) -> Result<tokio::task::JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        Ok(self.handle(index)?.spawn(future))
    }

    /// Stops every loop and waits for its thread, except the caller's own.
    pub fn shutdown(&self) {
        let threads = match self.threads.lock() {
            Ok(mut threads) => std::mem::take(&mut *threads),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        let own = thread::current().id();
        for LoopThread { stop_tx, thread } in threads {
            let _ = stop_tx.send(());
            if thread.thread().id() != own && thread.join().is_err() {
                log::warn!("event loop thread panicked");
            }
        }
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasks_run_on_their_loop() {
        let group = EventLoopGroup::start(3).unwrap();
        assert_eq!(group.len(), 3);
        assert_eq!(EventLoopGroup::current(), None);

        for index in 0..3 {
            let task = group
                .spawn_on(index, async { EventLoopGroup::current() })
                .unwrap();
            let seen = tokio_test::block_on(task).unwrap();
            assert_eq!(seen, Some(index));
        }
        group.shutdown();
    }

    #[test]
    fn test_round_robin_wraps() {
        let group = EventLoopGroup::start(2).unwrap();
        let picks: Vec<usize> = (0..4).map(|_| group.next()).collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);
        assert!(group.spawn_on(5, async {}).is_err());
    }
}
