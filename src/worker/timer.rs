use futures_util::Stream;
use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::{self, Instant, Sleep};

/// Handle of a scheduled timeout, used to cancel it.
#[derive(Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Debug)]
pub(crate) struct Timeout {
    deadline: Instant,
    id: u64,
}

/// Stream of values that become ready at their scheduled deadline, earliest first.
pub(crate) struct Timer<T> {
    next_id: u64,
    queue: BTreeMap<Timeout, T>,
    // Armed for the earliest entry of the queue.
    sleep: Option<(Timeout, Pin<Box<Sleep>>)>,
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            queue: BTreeMap::new(),
            sleep: None,
        }
    }

    /// Has the timer no scheduled timeouts?
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn schedule_in(&mut self, delay: Duration, value: T) -> Timeout {
        self.schedule_at(Instant::now() + delay, value)
    }

    pub fn schedule_at(&mut self, deadline: Instant, value: T) -> Timeout {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let key = Timeout { deadline, id };
        self.queue.insert(key, value);

        key
    }

    pub fn cancel(&mut self, timeout: Timeout) -> Option<T> {
        self.queue.remove(&timeout)
    }
}

impl<T: Unpin> Stream for Timer<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        loop {
            let first = match this.queue.keys().next() {
                Some(first) => *first,
                None => {
                    this.sleep = None;
                    return Poll::Ready(None);
                }
            };

            match &mut this.sleep {
                Some((armed, sleep)) if *armed == first => match sleep.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        this.sleep = None;
                        if let Some(value) = this.queue.remove(&first) {
                            return Poll::Ready(Some(value));
                        }
                    }
                    Poll::Pending => return Poll::Pending,
                },
                _ => {
                    this.sleep = Some((first, Box::pin(time::sleep_until(first.deadline))));
                }
            }
        }
    }
}
