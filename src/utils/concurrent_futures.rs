use std::{
    collections::VecDeque,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{
    future::BoxFuture,
    stream::{FuturesUnordered, Stream},
    Future,
    FutureExt,
};
use pin_project::pin_project;
use tokio::task::JoinError;

/// `ConcurrentFutures` runs at most `max_in_flight` spawned tasks at a time and yields their
/// results as they finish, each tagged with the slot it was pushed with. Tasks pushed while the
/// limit is reached wait in a FIFO queue.
///
/// The slot survives a panicking task, so the caller always knows which unit of work a
/// [`JoinError`] belongs to.
#[pin_project]
pub struct ConcurrentFutures<T>
where
    T: Future + Send + 'static,
    T::Output: Send + 'static,
{
    /// in-flight tasks
    #[pin]
    running: FuturesUnordered<BoxFuture<'static, (usize, Result<T::Output, JoinError>)>>,
    /// queued tasks
    pending: VecDeque<(usize, T)>,
    max_in_flight: usize,
}

impl<T> ConcurrentFutures<T>
where
    T: Future + Send + 'static,
    T::Output: Send + 'static,
{
    /// Creates an empty pool. A limit of `0` is treated as `1`.
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            running: FuturesUnordered::new(),
            pending: VecDeque::new(),
            max_in_flight: max_in_flight.max(1),
        }
    }

    pub fn push(&mut self, slot: usize, task: T) {
        self.pending.push_back((slot, task))
    }

    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    pub fn queued(&self) -> usize {
        self.pending.len()
    }
}

impl<T> Stream for ConcurrentFutures<T>
where
    T: Future + Send + 'static,
    T::Output: Send + 'static,
{
    type Item = (usize, Result<T::Output, JoinError>);

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        while this.running.len() < *this.max_in_flight {
            match this.pending.pop_front() {
                Some((slot, task)) => {
                    let handle = tokio::spawn(task);
                    this.running
                        .push(async move { (slot, handle.await) }.boxed());
                }
                None => break,
            }
        }
        this.running.poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use tokio::time::delay_for;

    use super::*;

    type Task = BoxFuture<'static, u8>;

    fn task(ms: u64, value: u8) -> Task {
        async move {
            delay_for(Duration::from_millis(ms)).await;
            value
        }
        .boxed()
    }

    #[tokio::test]
    async fn test_limits_tasks_in_flight() {
        let mut stream = ConcurrentFutures::<Task>::new(2);
        stream.push(0, task(10, 1));
        stream.push(1, task(25, 2));
        stream.push(2, task(12, 3));
        stream.push(3, task(1, 4));

        // poll_next hasn't been called yet so nothing is running
        assert_eq!(stream.in_flight(), 0);
        assert_eq!(stream.queued(), 4);

        let (slot, value) = stream.next().await.unwrap();
        assert_eq!((slot, value.unwrap()), (0, 1));
        assert_eq!(stream.in_flight(), 1);
        assert_eq!(stream.queued(), 2);

        let (slot, value) = stream.next().await.unwrap();
        assert_eq!((slot, value.unwrap()), (2, 3));
        assert_eq!(stream.in_flight(), 1);
        assert_eq!(stream.queued(), 1);

        let (slot, value) = stream.next().await.unwrap();
        assert_eq!((slot, value.unwrap()), (3, 4));

        let (slot, value) = stream.next().await.unwrap();
        assert_eq!((slot, value.unwrap()), (1, 2));
        assert_eq!(stream.in_flight(), 0);
        assert_eq!(stream.queued(), 0);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_panicking_task_keeps_its_slot() {
        let mut stream = ConcurrentFutures::<Task>::new(1);
        stream.push(7, async { panic!("boom") }.boxed());
        let (slot, result) = stream.next().await.unwrap();
        assert_eq!(slot, 7);
        assert!(result.is_err());
    }
}
