//! One-shot completion for a pending connect
//!
//! The worker resolves it; the caller blocks, registers a callback or
//! awaits. A completer dropped without resolving reports
//! [`Error::ConnectionClosed`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::connection::Connection;
use crate::error::{Error, Result};

type Callback = Box<dyn FnOnce(Result<Connection>) + Send>;

#[derive(Default)]
struct Slot {
    result: Option<Result<Connection>>,
    resolved: bool,
    waker: Option<Waker>,
    callback: Option<Callback>,
}

#[derive(Default)]
struct Shared {
    slot: Mutex<Slot>,
    ready: Condvar,
}

pub(crate) fn completion() -> (Completer, PendingConnection) {
    let shared = Arc::new(Shared::default());
    (
        Completer {
            shared: Some(Arc::clone(&shared)),
        },
        PendingConnection { shared },
    )
}

/// Worker-side half.
pub(crate) struct Completer {
    shared: Option<Arc<Shared>>,
}

impl Completer {
    pub(crate) fn complete(mut self, result: Result<Connection>) {
        if let Some(shared) = self.shared.take() {
            resolve(&shared, result);
        }
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            resolve(&shared, Err(Error::ConnectionClosed));
        }
    }
}

fn resolve(shared: &Shared, result: Result<Connection>) {
    let mut slot = shared.slot.lock();
    slot.resolved = true;
    if let Some(callback) = slot.callback.take() {
        drop(slot);
        callback(result);
        return;
    }
    slot.result = Some(result);
    let waker = slot.waker.take();
    drop(slot);
    shared.ready.notify_all();
    if let Some(w) = waker {
        w.wake();
    }
}

/// Caller-side half returned by `connect`.
pub struct PendingConnection {
    shared: Arc<Shared>,
}

impl PendingConnection {
    pub fn is_done(&self) -> bool {
        self.shared.slot.lock().resolved
    }

    /// Block until the handshake finishes or fails.
    pub fn wait(self) -> Result<Connection> {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(result) = slot.result.take() {
                return result;
            }
            if slot.resolved {
                return Err(Error::ConnectionClosed);
            }
            self.shared.ready.wait(&mut slot);
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, returning
    /// `None` and leaving the connect running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Connection>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(result) = slot.result.take() {
                return Some(result);
            }
            if slot.resolved {
                return Some(Err(Error::ConnectionClosed));
            }
            if self.shared.ready.wait_until(&mut slot, deadline).timed_out() {
                return slot.result.take();
            }
        }
    }

    /// Run `callback` with the outcome; immediately if already resolved,
    /// otherwise on the worker thread.
    pub fn on_complete<F>(self, callback: F)
    where
        F: FnOnce(Result<Connection>) + Send + 'static,
    {
        let mut slot = self.shared.slot.lock();
        if let Some(result) = slot.result.take() {
            drop(slot);
            callback(result);
        } else if slot.resolved {
            drop(slot);
            callback(Err(Error::ConnectionClosed));
        } else {
            slot.callback = Some(Box::new(callback));
        }
    }
}

impl Future for PendingConnection {
    type Output = Result<Connection>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.shared.slot.lock();
        if let Some(result) = slot.result.take() {
            return Poll::Ready(result);
        }
        if slot.resolved {
            return Poll::Ready(Err(Error::ConnectionClosed));
        }
        slot.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::task::Wake;
    use std::thread;

    #[test]
    fn test_dropped_completer_unblocks_wait() {
        let (completer, pending) = completion();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(completer);
        });
        assert!(matches!(pending.wait(), Err(Error::ConnectionClosed)));
        handle.join().unwrap();
    }

    #[test]
    fn test_failure_reaches_waiter() {
        let (completer, pending) = completion();
        completer.complete(Err(Error::AuthTimeout));
        assert!(pending.is_done());
        assert!(matches!(pending.wait(), Err(Error::AuthTimeout)));
    }

    #[test]
    fn test_wait_timeout_then_resolve() {
        let (completer, pending) = completion();
        assert!(pending.wait_timeout(Duration::from_millis(10)).is_none());
        completer.complete(Err(Error::AuthenticationFailed("no".into())));
        assert!(matches!(
            pending.wait_timeout(Duration::from_millis(10)),
            Some(Err(Error::AuthenticationFailed(_)))
        ));
    }

    #[test]
    fn test_callback_runs_on_resolve() {
        let (completer, pending) = completion();
        let (tx, rx) = mpsc::channel();
        pending.on_complete(move |r| {
            tx.send(r.is_err()).unwrap();
        });
        assert!(rx.try_recv().is_err());
        completer.complete(Err(Error::ConnectionClosed));
        assert!(rx.recv().unwrap());
    }

    struct Flag(Mutex<bool>);

    impl Wake for Flag {
        fn wake(self: Arc<Self>) {
            *self.0.lock() = true;
        }
    }

    #[test]
    fn test_future_wakes() {
        let (completer, mut pending) = completion();
        let flag = Arc::new(Flag(Mutex::new(false)));
        let waker = Waker::from(Arc::clone(&flag));
        let mut cx = Context::from_waker(&waker);

        assert!(Pin::new(&mut pending).poll(&mut cx).is_pending());
        completer.complete(Err(Error::AuthTimeout));
        assert!(*flag.0.lock());
        assert!(matches!(
            Pin::new(&mut pending).poll(&mut cx),
            Poll::Ready(Err(Error::AuthTimeout))
        ));
    }
}
