//! A single-producer, multi-subscriber broadcast sequence.
//!
//! [`channel`] returns a producer handle and a subscribable stream backed by
//! one bounded buffer of `(ElementID, element)` pairs. Every subscriber
//! carries its own read cursor, so subscribers observe the same elements in
//! the same order while progressing at their own pace. The buffer holds at
//! most `buffer_size` elements; when a write would exceed that, the slowest
//! subscribers either cause the producer to wait (if *every* subscriber
//! still needs the oldest element) or are dropped for consuming too slowly
//! (if only some of them do).
//!
//! This is the primitive behind retries and hedging: a request stream is
//! written once and replayed to up to a handful of concurrent attempts,
//! each attempt being one subscriber.
//!
//! All mutations happen inside a single mutex over the shared state. A
//! mutation never completes a waiter while holding the lock; it collects
//! the affected one-shot senders into an [`Actions`] record which is
//! performed after the guard is released. Completing a one-shot sender
//! consumes it, so every waiter is resumed at most once by construction.

use crate::error::Error;
use crate::Result;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::debug;

/// Creates a broadcast sequence with the given buffer capacity.
///
/// # Panics
///
/// Panics if `buffer_size` is zero.
pub fn channel<T>(buffer_size: usize) -> (BroadcastSource<T>, BroadcastStream<T>) {
    assert!(buffer_size > 0, "buffer_size must be at least 1");
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            phase: Phase::Initial,
            buffer: VecDeque::new(),
            capacity: buffer_size,
            lowest_id: 0,
            next_subscriber_id: 0,
            next_producer_token: 0,
            subscriptions: HashMap::new(),
            marked_slow: HashSet::new(),
            suspended_producers: Vec::new(),
            result: None,
        }),
    });
    let source = BroadcastSource {
        shared: shared.clone(),
    };
    let stream = BroadcastStream { shared };
    (source, stream)
}

/// The producer half of a broadcast sequence.
///
/// Dropping the source without calling [`finish`](Self::finish) terminates
/// the sequence with [`Error::ProductionAlreadyFinished`], which current
/// and future waiters observe.
#[derive(Debug)]
pub struct BroadcastSource<T> {
    shared: Arc<Shared<T>>,
}

/// The consumer half of a broadcast sequence. Cheap to clone; every
/// [`subscribe`](Self::subscribe) call creates an independent cursor.
#[derive(Debug)]
pub struct BroadcastStream<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BroadcastStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// One consumer attached to a broadcast sequence.
///
/// Dropping the subscription cancels any pending wait and wakes a producer
/// that was blocked on this subscriber being a laggard.
#[derive(Debug)]
pub struct Subscription<T> {
    shared: Arc<Shared<T>>,
    id: u64,
    /// Once the subscription has seen its terminal result it keeps
    /// returning it instead of consulting the shared state.
    terminal: Option<NextResult<T>>,
}

type NextResult<T> = Result<Option<T>>;

#[derive(Debug)]
struct Shared<T> {
    state: Mutex<State<T>>,
}

/// Lifecycle of the sequence as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// No element produced, no subscriber attached yet.
    Initial,
    /// Subscribers exist but nothing has been produced.
    Subscribed,
    /// At least one element has been produced.
    Streaming,
    /// The producer finished. Terminal; buffered elements may still drain.
    Finished,
}

#[derive(Debug)]
struct State<T> {
    phase: Phase,
    /// Buffered elements; the front carries `lowest_id`.
    buffer: VecDeque<T>,
    capacity: usize,
    /// ElementID of the front of `buffer`. Starts at zero and only grows
    /// when an element is evicted.
    lowest_id: u64,
    next_subscriber_id: u64,
    next_producer_token: u64,
    subscriptions: HashMap<u64, SubscriberState<T>>,
    /// Subscribers dropped as laggards whose next `next()` call must fail
    /// with `ConsumingTooSlow`.
    marked_slow: HashSet<u64>,
    /// Writes waiting for a laggard to advance, in token (and therefore
    /// element) order. The element is not published until resumption.
    suspended_producers: Vec<SuspendedProducer<T>>,
    /// Set when the producer finished: `Ok(())` for a clean end, the error
    /// otherwise.
    result: Option<std::result::Result<(), Error>>,
}

#[derive(Debug)]
struct SubscriberState<T> {
    /// The ElementID this subscriber needs next.
    next_id: u64,
    /// At most one pending `next()` continuation.
    waiter: Option<oneshot::Sender<NextResult<T>>>,
}

#[derive(Debug)]
struct SuspendedProducer<T> {
    token: u64,
    element: T,
    tx: oneshot::Sender<std::result::Result<(), Error>>,
}

/// Continuations to complete once the state lock has been released.
#[derive(Debug)]
struct Actions<T> {
    subscribers: Vec<(oneshot::Sender<NextResult<T>>, NextResult<T>)>,
    producers: Vec<(
        oneshot::Sender<std::result::Result<(), Error>>,
        std::result::Result<(), Error>,
    )>,
}

impl<T> Actions<T> {
    fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            producers: Vec::new(),
        }
    }

    /// Completes every collected continuation. Must be called after the
    /// state guard has been dropped.
    fn perform(self) {
        for (tx, result) in self.subscribers {
            let _ = tx.send(result);
        }
        for (tx, result) in self.producers {
            let _ = tx.send(result);
        }
    }
}

enum WriteOutcome {
    Done(std::result::Result<(), Error>),
    Wait(u64, oneshot::Receiver<std::result::Result<(), Error>>),
}

enum NextOutcome<T> {
    Ready(NextResult<T>),
    Wait(oneshot::Receiver<NextResult<T>>),
}

impl<T> State<T> {
    /// One past the highest buffered ElementID.
    fn next_element_id(&self) -> u64 {
        self.lowest_id + self.buffer.len() as u64
    }

    fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    /// Subscribers whose cursor sits on the oldest buffered element.
    /// Evicting that element would strand them.
    fn laggards(&self) -> Vec<u64> {
        self.subscriptions
            .iter()
            .filter(|(_, sub)| sub.next_id == self.lowest_id)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Resumes every suspended write: their elements are published in token
    /// order and the producers complete with `Ok`.
    ///
    /// Writes only ever suspend while every subscriber is a laggard, and a
    /// laggard always has a buffered element available, so no subscriber
    /// can be waiting here.
    fn resume_suspended_producers(&mut self, actions: &mut Actions<T>) {
        if self.suspended_producers.is_empty() {
            return;
        }
        debug_assert!(self
            .subscriptions
            .values()
            .all(|sub| sub.waiter.is_none()));
        for producer in std::mem::take(&mut self.suspended_producers) {
            self.buffer.push_back(producer.element);
            self.phase = Phase::Streaming;
            actions.producers.push((producer.tx, Ok(())));
        }
    }

    /// Drops front elements that every subscriber has consumed, while the
    /// buffer is over capacity.
    fn evict_consumed(&mut self) {
        while self.buffer.len() > self.capacity {
            let all_past_front = !self.subscriptions.is_empty()
                && self
                    .subscriptions
                    .values()
                    .all(|sub| sub.next_id > self.lowest_id);
            if !all_past_front {
                break;
            }
            self.buffer.pop_front();
            self.lowest_id += 1;
        }
    }

    /// Detaches every subscriber currently waiting and hands it the
    /// terminal result.
    fn fail_waiters(
        &mut self,
        result: &std::result::Result<(), Error>,
        actions: &mut Actions<T>,
    ) {
        let waiting: Vec<u64> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.waiter.is_some())
            .map(|(id, _)| *id)
            .collect();
        for id in waiting {
            if let Some(mut sub) = self.subscriptions.remove(&id) {
                if let Some(tx) = sub.waiter.take() {
                    let outcome = match result {
                        Ok(()) => Ok(None),
                        Err(error) => Err(error.clone()),
                    };
                    actions.subscribers.push((tx, outcome));
                }
            }
        }
    }
}

impl<T: Clone> State<T> {
    /// Appends an element, waking subscribers that were waiting for it.
    fn publish(&mut self, element: T, actions: &mut Actions<T>) {
        let id = self.next_element_id();
        for sub in self.subscriptions.values_mut() {
            if let Some(tx) = sub.waiter.take() {
                // A waiter only ever waits for the element one past the
                // highest, which is exactly the one being appended.
                debug_assert_eq!(sub.next_id, id);
                sub.next_id = id + 1;
                actions.subscribers.push((tx, Ok(Some(element.clone()))));
            }
        }
        self.buffer.push_back(element);
        self.phase = Phase::Streaming;
    }
}

impl<T> Shared<T> {
    fn subscribe(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        let next_id = state.lowest_id;
        state.subscriptions.insert(
            id,
            SubscriberState {
                next_id,
                waiter: None,
            },
        );
        if state.phase == Phase::Initial {
            state.phase = Phase::Subscribed;
        }
        id
    }

    fn cancel_suspended_write(&self, token: u64) {
        let mut state = self.state.lock().unwrap();
        // The element was never published; it vanishes with the entry.
        state.suspended_producers.retain(|p| p.token != token);
    }

    /// Cancels a pending `next()`: the subscription goes away and any
    /// producer blocked on it being a laggard resumes.
    fn cancel_next_wait(&self, id: u64) {
        let mut actions = Actions::new();
        {
            let mut state = self.state.lock().unwrap();
            match state.subscriptions.get(&id) {
                Some(sub) if sub.waiter.is_some() => {
                    state.subscriptions.remove(&id);
                    state.resume_suspended_producers(&mut actions);
                    state.evict_consumed();
                }
                // The wait already completed; nothing to undo.
                _ => {}
            }
        }
        actions.perform();
    }

    /// Detaches a subscription entirely (the handle was dropped).
    fn remove_subscription(&self, id: u64) {
        let mut actions = Actions::new();
        {
            let mut state = self.state.lock().unwrap();
            state.marked_slow.remove(&id);
            if let Some(mut sub) = state.subscriptions.remove(&id) {
                if let Some(tx) = sub.waiter.take() {
                    actions.subscribers.push((tx, Err(Error::Cancelled)));
                }
                state.resume_suspended_producers(&mut actions);
                state.evict_consumed();
            }
        }
        actions.perform();
    }

    fn finish(&self, result: std::result::Result<(), Error>) {
        let mut actions = Actions::new();
        {
            let mut state = self.state.lock().unwrap();
            if state.is_finished() {
                return;
            }
            debug!(ok = result.is_ok(), "broadcast finished");
            state.phase = Phase::Finished;
            state.result = Some(result.clone());

            // Waiters will never see another element: they observe the
            // terminal result now and detach.
            state.fail_waiters(&result, &mut actions);

            // Suspended writes fail: their elements were never published.
            for producer in std::mem::take(&mut state.suspended_producers) {
                actions
                    .producers
                    .push((producer.tx, Err(Error::ProductionAlreadyFinished)));
            }
        }
        actions.perform();
    }

    fn invalidate_all_subscriptions(&self) {
        let mut actions = Actions::new();
        {
            let mut state = self.state.lock().unwrap();
            for (_, mut sub) in state.subscriptions.drain() {
                if let Some(tx) = sub.waiter.take() {
                    actions
                        .subscribers
                        .push((tx, Err(Error::ConsumingTooSlow)));
                }
            }
            state.resume_suspended_producers(&mut actions);
            state.evict_consumed();
        }
        actions.perform();
    }

    fn is_safe_for_next_subscriber(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.subscriptions.is_empty() && state.lowest_id == 0
    }
}

impl<T: Clone> Shared<T> {
    fn write_or_wait(&self, element: T) -> WriteOutcome {
        let mut actions = Actions::new();
        let outcome = {
            let mut state = self.state.lock().unwrap();
            if state.is_finished() {
                WriteOutcome::Done(Err(Error::ProductionAlreadyFinished))
            } else if state.buffer.len() < state.capacity {
                state.publish(element, &mut actions);
                WriteOutcome::Done(Ok(()))
            } else {
                let laggards = state.laggards();
                if laggards.is_empty() {
                    // Nobody is stranded by evicting the oldest element;
                    // this covers the zero-subscriber case as well.
                    state.buffer.pop_front();
                    state.lowest_id += 1;
                    state.publish(element, &mut actions);
                    WriteOutcome::Done(Ok(()))
                } else if laggards.len() == state.subscriptions.len() {
                    // Every subscriber still needs the oldest element:
                    // hold the write until one of them advances.
                    let token = state.next_producer_token;
                    state.next_producer_token += 1;
                    let (tx, rx) = oneshot::channel();
                    state.suspended_producers.push(SuspendedProducer {
                        token,
                        element,
                        tx,
                    });
                    debug!(token, "producer suspended, all subscribers are laggards");
                    WriteOutcome::Wait(token, rx)
                } else {
                    // A proper subset is lagging: drop those subscribers so
                    // the rest keep making progress.
                    for id in laggards {
                        if let Some(sub) = state.subscriptions.remove(&id) {
                            debug!(subscriber = id, "dropping laggard subscriber");
                            // A laggard has a buffered element available,
                            // so it cannot be waiting.
                            debug_assert!(sub.waiter.is_none());
                            state.marked_slow.insert(id);
                        }
                    }
                    state.buffer.pop_front();
                    state.lowest_id += 1;
                    state.publish(element, &mut actions);
                    WriteOutcome::Done(Ok(()))
                }
            }
        };
        actions.perform();
        outcome
    }

    fn next_or_wait(&self, id: u64) -> NextOutcome<T> {
        let mut actions = Actions::new();
        let outcome = {
            let mut state = self.state.lock().unwrap();

            if state.marked_slow.remove(&id) {
                NextOutcome::Ready(Err(Error::ConsumingTooSlow))
            } else if !state.subscriptions.contains_key(&id) {
                // Unknown and unmarked: the sequence finished and this
                // subscriber was already detached by the finish path.
                match &state.result {
                    Some(Ok(())) => NextOutcome::Ready(Ok(None)),
                    Some(Err(error)) => NextOutcome::Ready(Err(error.clone())),
                    None => NextOutcome::Ready(Err(Error::ConsumingTooSlow)),
                }
            } else {
                let next_id = state.subscriptions[&id].next_id;
                if next_id < state.lowest_id {
                    state.subscriptions.remove(&id);
                    NextOutcome::Ready(Err(Error::ConsumingTooSlow))
                } else if next_id < state.next_element_id() {
                    let index = (next_id - state.lowest_id) as usize;
                    let element = state.buffer[index].clone();
                    if let Some(sub) = state.subscriptions.get_mut(&id) {
                        sub.next_id += 1;
                    }
                    // If writes are suspended, every subscriber (this one
                    // included) was a laggard; its advance unblocks them.
                    state.resume_suspended_producers(&mut actions);
                    state.evict_consumed();
                    NextOutcome::Ready(Ok(Some(element)))
                } else if state.is_finished() {
                    state.subscriptions.remove(&id);
                    match &state.result {
                        Some(Ok(())) => NextOutcome::Ready(Ok(None)),
                        Some(Err(error)) => NextOutcome::Ready(Err(error.clone())),
                        None => NextOutcome::Ready(Err(Error::Internal(
                            "finished without a result".to_string(),
                        ))),
                    }
                } else {
                    let (tx, rx) = oneshot::channel();
                    if let Some(sub) = state.subscriptions.get_mut(&id) {
                        sub.waiter = Some(tx);
                    }
                    NextOutcome::Wait(rx)
                }
            }
        };
        actions.perform();
        outcome
    }
}

impl<T: Clone> BroadcastSource<T> {
    /// Writes one element to the sequence.
    ///
    /// Waits while the buffer is full and every subscriber still needs the
    /// oldest buffered element. Cancelling the wait (by dropping the
    /// future) withdraws the element without publishing it.
    ///
    /// # Errors
    ///
    /// [`Error::ProductionAlreadyFinished`] if [`finish`](Self::finish) was
    /// already called, or if the sequence finished while this write was
    /// waiting.
    pub async fn write(&self, element: T) -> Result<()> {
        match self.shared.write_or_wait(element) {
            WriteOutcome::Done(result) => result,
            WriteOutcome::Wait(token, rx) => {
                let mut guard = ProducerWaitGuard {
                    shared: &self.shared,
                    token,
                    armed: true,
                };
                let result = rx.await;
                guard.armed = false;
                drop(guard);
                // The sender side never goes away without sending, but
                // losing that race is not worth a panic.
                result.unwrap_or(Err(Error::Cancelled))
            }
        }
    }

    /// Finishes the sequence successfully. Subscribers drain whatever is
    /// buffered and then observe the end. Calling this twice is a no-op.
    pub fn finish(&self) {
        self.shared.finish(Ok(()));
    }

    /// Finishes the sequence with a failure every subscriber will observe
    /// once it has drained the buffer.
    pub fn finish_with_error(&self, error: Error) {
        self.shared.finish(Err(error));
    }
}

impl<T> Drop for BroadcastSource<T> {
    fn drop(&mut self) {
        // A no-op if the producer finished properly; otherwise waiters must
        // not hang forever.
        self.shared.finish(Err(Error::ProductionAlreadyFinished));
    }
}

impl<T: Clone> BroadcastStream<T> {
    /// Attaches a new subscriber whose cursor starts at the oldest
    /// buffered element.
    ///
    /// Use [`is_safe_for_next_subscriber`](Self::is_safe_for_next_subscriber)
    /// to learn whether that means the very beginning of the sequence.
    pub fn subscribe(&self) -> Subscription<T> {
        let id = self.shared.subscribe();
        Subscription {
            shared: self.shared.clone(),
            id,
            terminal: None,
        }
    }

    /// `true` when a subscriber attached now would observe the sequence
    /// from its first element: nobody else is subscribed and nothing has
    /// been evicted from the buffer.
    pub fn is_safe_for_next_subscriber(&self) -> bool {
        self.shared.is_safe_for_next_subscriber()
    }

    /// Detaches every current subscriber. Each one observes
    /// [`Error::ConsumingTooSlow`] on its pending or next `next()` call.
    pub fn invalidate_all_subscriptions(&self) {
        self.shared.invalidate_all_subscriptions();
    }
}

impl<T: Clone> Subscription<T> {
    /// Returns the next element, `Ok(None)` once the producer has finished
    /// and the buffer is drained, or the terminal error.
    ///
    /// # Errors
    ///
    /// [`Error::ConsumingTooSlow`] if this subscriber fell off the back of
    /// the buffer; the error the producer finished with, if any.
    pub async fn next(&mut self) -> Result<Option<T>> {
        if let Some(terminal) = &self.terminal {
            return terminal.clone();
        }
        let result = match self.shared.next_or_wait(self.id) {
            NextOutcome::Ready(result) => result,
            NextOutcome::Wait(rx) => {
                let mut guard = NextWaitGuard {
                    shared: &self.shared,
                    id: self.id,
                    armed: true,
                };
                let received = rx.await;
                guard.armed = false;
                drop(guard);
                received.unwrap_or(Err(Error::Cancelled))
            }
        };
        match &result {
            Ok(Some(_)) => {}
            terminal => self.terminal = Some(terminal.clone()),
        }
        result
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.shared.remove_subscription(self.id);
    }
}

/// Undoes a pending `next()` registration when its future is dropped
/// before completion.
struct NextWaitGuard<'a, T> {
    shared: &'a Shared<T>,
    id: u64,
    armed: bool,
}

impl<T> Drop for NextWaitGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.cancel_next_wait(self.id);
        }
    }
}

/// Withdraws a suspended write when its future is dropped before
/// completion.
struct ProducerWaitGuard<'a, T> {
    shared: &'a Shared<T>,
    token: u64,
    armed: bool,
}

impl<T> Drop for ProducerWaitGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.cancel_suspended_write(self.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::task;

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn basic_write_then_drain() {
        let (source, stream) = channel::<u32>(8);
        let mut sub = stream.subscribe();

        source.write(1).await.unwrap();
        source.write(2).await.unwrap();
        source.write(3).await.unwrap();
        source.finish();

        assert_eq!(sub.next().await.unwrap(), Some(1));
        assert_eq!(sub.next().await.unwrap(), Some(2));
        assert_eq!(sub.next().await.unwrap(), Some(3));
        assert_eq!(sub.next().await.unwrap(), None);
        // Terminal results repeat.
        assert_eq!(sub.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped() {
        let (source, stream) = channel::<u32>(2);
        let mut s1 = stream.subscribe();
        let mut s2 = stream.subscribe();

        source.write(1).await.unwrap();
        source.write(2).await.unwrap();
        assert_eq!(s1.next().await.unwrap(), Some(1));

        // The buffer is full; s2 alone still needs element 1, so the write
        // drops s2 and evicts the element to make room.
        source.write(3).await.unwrap();

        assert_eq!(s2.next().await.unwrap_err(), Error::ConsumingTooSlow);
        assert_eq!(s1.next().await.unwrap(), Some(2));
        assert_eq!(s1.next().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn producer_suspends_while_all_subscribers_lag() {
        let (source, stream) = channel::<u32>(2);
        let mut s1 = stream.subscribe();
        let mut s2 = stream.subscribe();

        source.write(1).await.unwrap();
        source.write(2).await.unwrap();

        // Both subscribers still need element 1: the third write must wait.
        let mut write = task::spawn(source.write(3));
        assert!(write.poll().is_pending());

        // One consumer advancing resumes the producer.
        assert_eq!(s1.next().await.unwrap(), Some(1));
        assert!(write.is_woken());
        match write.poll() {
            std::task::Poll::Ready(result) => result.unwrap(),
            std::task::Poll::Pending => panic!("write should have resumed"),
        }

        // The element the producer was holding was not published before
        // resumption, so the slow subscriber still sees the full prefix.
        assert_eq!(s2.next().await.unwrap(), Some(1));
        assert_eq!(s2.next().await.unwrap(), Some(2));
        assert_eq!(s2.next().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn subscribers_observe_the_same_order() {
        let (source, stream) = channel::<u32>(16);
        let mut s1 = stream.subscribe();
        let mut s2 = stream.subscribe();

        for n in 0..10 {
            source.write(n).await.unwrap();
        }
        source.finish();

        let mut seen1 = Vec::new();
        while let Some(n) = s1.next().await.unwrap() {
            seen1.push(n);
        }
        let mut seen2 = Vec::new();
        while let Some(n) = s2.next().await.unwrap() {
            seen2.push(n);
        }
        assert_eq!(seen1, (0..10).collect::<Vec<_>>());
        assert_eq!(seen1, seen2);
    }

    #[tokio::test]
    async fn write_after_finish_fails() {
        let (source, _stream) = channel::<u32>(4);
        source.write(1).await.unwrap();
        source.finish();
        assert_eq!(
            source.write(2).await.unwrap_err(),
            Error::ProductionAlreadyFinished
        );
    }

    #[tokio::test]
    async fn finish_with_error_reaches_every_subscriber() {
        let (source, stream) = channel::<u32>(4);
        let mut s1 = stream.subscribe();
        let mut s2 = stream.subscribe();

        source.write(7).await.unwrap();
        source.finish_with_error(Error::Unavailable("peer went away".into()));

        // Buffered elements drain before the terminal error.
        assert_eq!(s1.next().await.unwrap(), Some(7));
        assert!(matches!(
            s1.next().await.unwrap_err(),
            Error::Unavailable(_)
        ));
        assert_eq!(s2.next().await.unwrap(), Some(7));
        assert!(matches!(
            s2.next().await.unwrap_err(),
            Error::Unavailable(_)
        ));
    }

    #[tokio::test]
    async fn waiting_subscriber_resumes_on_write() {
        let (source, stream) = channel::<u32>(4);
        let mut sub = stream.subscribe();

        let mut next = task::spawn(async { sub.next().await });
        assert!(next.poll().is_pending());

        source.write(42).await.unwrap();
        assert!(next.is_woken());
        match next.poll() {
            std::task::Poll::Ready(result) => assert_eq!(result.unwrap(), Some(42)),
            std::task::Poll::Pending => panic!("next should have resumed"),
        }
    }

    #[tokio::test]
    async fn waiting_subscriber_fails_when_source_dropped() {
        let (source, stream) = channel::<u32>(4);
        let mut sub = stream.subscribe();

        let mut next = task::spawn(async { sub.next().await });
        assert!(next.poll().is_pending());

        drop(source);
        assert!(next.is_woken());
        match next.poll() {
            std::task::Poll::Ready(result) => {
                assert_eq!(result.unwrap_err(), Error::ProductionAlreadyFinished);
            }
            std::task::Poll::Pending => panic!("next should have resumed"),
        }
    }

    #[tokio::test]
    async fn cancelled_next_wakes_suspended_producer() {
        let (source, stream) = channel::<u32>(1);
        let mut s1 = stream.subscribe();

        source.write(1).await.unwrap();
        let mut write = task::spawn(source.write(2));
        assert!(write.poll().is_pending());

        // Cancel the subscriber's pending interest by dropping it: the
        // producer is no longer blocked on anyone.
        {
            let mut next = task::spawn(s1.next());
            // Not pending: an element is available, so consume it first.
            match next.poll() {
                std::task::Poll::Ready(result) => assert_eq!(result.unwrap(), Some(1)),
                std::task::Poll::Pending => panic!("element was buffered"),
            }
        }
        assert!(write.is_woken());
        match write.poll() {
            std::task::Poll::Ready(result) => result.unwrap(),
            std::task::Poll::Pending => panic!("write should have resumed"),
        }
    }

    #[tokio::test]
    async fn dropping_subscription_wakes_suspended_producer() {
        let (source, stream) = channel::<u32>(1);
        let s1 = stream.subscribe();

        source.write(1).await.unwrap();
        let mut write = task::spawn(source.write(2));
        assert!(write.poll().is_pending());

        drop(s1);
        assert!(write.is_woken());
        match write.poll() {
            std::task::Poll::Ready(result) => result.unwrap(),
            std::task::Poll::Pending => panic!("write should have resumed"),
        }
    }

    #[tokio::test]
    async fn cancelled_write_withdraws_its_element() {
        let (source, stream) = channel::<u32>(1);
        let mut s1 = stream.subscribe();

        source.write(1).await.unwrap();
        {
            let mut write = task::spawn(source.write(2));
            assert!(write.poll().is_pending());
            // Dropping the pending write must not publish element 2.
        }
        assert_eq!(s1.next().await.unwrap(), Some(1));

        source.write(3).await.unwrap();
        assert_eq!(s1.next().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn safe_for_next_subscriber_tracks_drops_and_evictions() {
        let (source, stream) = channel::<u32>(1);
        assert!(stream.is_safe_for_next_subscriber());

        let sub = stream.subscribe();
        assert!(!stream.is_safe_for_next_subscriber());
        drop(sub);
        assert!(stream.is_safe_for_next_subscriber());

        // With no subscribers, overflowing the buffer evicts element 0;
        // a fresh subscriber can no longer see the whole sequence.
        source.write(1).await.unwrap();
        assert!(stream.is_safe_for_next_subscriber());
        source.write(2).await.unwrap();
        assert!(!stream.is_safe_for_next_subscriber());
    }

    #[tokio::test]
    async fn invalidate_fails_pending_and_future_next() {
        let (source, stream) = channel::<u32>(4);
        let mut waiting = stream.subscribe();
        let mut idle = stream.subscribe();

        let mut next = task::spawn(waiting.next());
        assert!(next.poll().is_pending());

        stream.invalidate_all_subscriptions();
        assert!(next.is_woken());
        match next.poll() {
            std::task::Poll::Ready(result) => {
                assert_eq!(result.unwrap_err(), Error::ConsumingTooSlow);
            }
            std::task::Poll::Pending => panic!("next should have resumed"),
        }
        drop(next);

        // A subscriber that was not waiting fails on its next call. Nothing
        // was produced, so the sequence never finished; the subscriber is
        // simply gone.
        assert_eq!(idle.next().await.unwrap_err(), Error::ConsumingTooSlow);
        drop(source);
    }

    #[tokio::test]
    async fn late_subscriber_starts_at_oldest_buffered_element() {
        let (source, stream) = channel::<u32>(2);
        // No subscribers: writes beyond capacity evict the oldest.
        source.write(1).await.unwrap();
        source.write(2).await.unwrap();
        source.write(3).await.unwrap();
        source.finish();

        let mut sub = stream.subscribe();
        assert_eq!(sub.next().await.unwrap(), Some(2));
        assert_eq!(sub.next().await.unwrap(), Some(3));
        assert_eq!(sub.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn second_finish_is_a_no_op() {
        let (source, stream) = channel::<u32>(4);
        let mut sub = stream.subscribe();
        source.finish();
        source.finish_with_error(Error::Cancelled);
        assert_eq!(sub.next().await.unwrap(), None);
    }
}
