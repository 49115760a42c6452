//! Live view-state: a handle that always holds the latest value of some
//! remote-backed state and wakes consumers when it changes. Backpressure is
//! drop-and-replace-with-latest; slow consumers skip intermediate states
//! instead of queueing them. Dropping the handle aborts the feeding task,
//! which releases the underlying store listener.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_stream::wrappers::WatchStream;

pub struct Live<T> {
    rx: watch::Receiver<T>,
    task: Option<JoinHandle<()>>,
}

impl<T: Clone + Send + Sync + 'static> Live<T> {
    pub(crate) fn new(rx: watch::Receiver<T>, task: JoinHandle<()>) -> Self {
        Self {
            rx,
            task: Some(task),
        }
    }

    /// The latest value.
    pub fn current(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Wait until the value changes. Returns `false` once no further
    /// updates can arrive.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Derive a live view by applying `f` to every emitted value. The source
    /// handle stays alive inside the derived task, so teardown still cascades
    /// from the outermost handle.
    pub fn map<U, F>(mut self, mut f: F) -> Live<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnMut(&T) -> U + Send + 'static,
    {
        let (tx, rx) = watch::channel(f(&self.current()));
        let task = tokio::spawn(async move {
            while self.changed().await {
                let next = f(&self.rx.borrow());
                if tx.send(next).is_err() {
                    break;
                }
            }
        });
        Live::new(rx, task)
    }

    /// Turn the handle into a stream that yields the current value first and
    /// every change after it.
    pub fn into_stream(mut self) -> LiveStream<T> {
        let rx = self.rx.clone();
        LiveStream {
            inner: WatchStream::new(rx),
            task: self.task.take(),
        }
    }
}

impl<T> Drop for Live<T> {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

pub struct LiveStream<T> {
    inner: WatchStream<T>,
    task: Option<JoinHandle<()>>,
}

impl<T: Clone + Send + Sync + 'static> Stream for LiveStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<T> Drop for LiveStream<T> {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
