//! Typed publish/subscribe channels.
//!
//! A handler stays registered for as long as its [`Subscription`] lives.
//! Dropping (or [`Subscription::unsubscribe`]-ing) the handle removes the
//! handler and waits for invocations already running on other threads, so no
//! invocation starts or is still running once the release returns.
//!
//! A release made from inside a handler (of any channel) only stops new
//! invocations and does not wait. Two handlers on different threads may
//! therefore release each other's subscriptions without deadlocking, and a
//! handler may release its own subscription from inside its body.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use tracing::error;

type Handler<T> = dyn Fn(&T) + Send + Sync;

thread_local! {
    /// Handlers currently running on this thread, across all channels.
    static DISPATCH_DEPTH: Cell<usize> = const { Cell::new(0) };
}

fn dispatching() -> bool {
    DISPATCH_DEPTH.with(|depth| depth.get() > 0)
}

/// Locks `mutex`, recovering the guard if a previous holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct SlotState {
    active: bool,
    in_flight: Vec<ThreadId>,
}

struct Slot<T> {
    id: u64,
    handler: Box<Handler<T>>,
    state: Mutex<SlotState>,
    idle: Condvar,
}

impl<T> Slot<T> {
    fn invoke(&self, value: &T) -> bool {
        let me = thread::current().id();
        {
            let mut state = lock_unpoisoned(&self.state);
            if !state.active {
                return false;
            }
            state.in_flight.push(me);
        }

        DISPATCH_DEPTH.with(|depth| depth.set(depth.get() + 1));
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (self.handler)(value)));
        DISPATCH_DEPTH.with(|depth| depth.set(depth.get() - 1));

        {
            let mut state = lock_unpoisoned(&self.state);
            if let Some(position) = state.in_flight.iter().position(|t| *t == me) {
                state.in_flight.swap_remove(position);
            }
        }
        self.idle.notify_all();

        if outcome.is_err() {
            error!(subscription = self.id, "event handler panicked; continuing with remaining handlers");
        }
        true
    }

    fn deactivate(&self) {
        let mut state = lock_unpoisoned(&self.state);
        state.active = false;
        // Inside a handler, the invocation being waited on may itself be
        // waiting on this thread.
        if dispatching() {
            return;
        }
        while !state.in_flight.is_empty() {
            state = self
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct ChannelInner<T> {
    next_id: u64,
    slots: Vec<Arc<Slot<T>>>,
}

/// Multi-subscriber event channel. Publication is synchronous, in
/// subscription order, with no backpressure.
pub struct EventChannel<T> {
    inner: Arc<Mutex<ChannelInner<T>>>,
}

impl<T> EventChannel<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ChannelInner {
                next_id: 1,
                slots: Vec::new(),
            })),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut inner = lock_unpoisoned(&self.inner);
        let id = inner.next_id;
        inner.next_id = inner.next_id.wrapping_add(1);

        let slot = Arc::new(Slot {
            id,
            handler: Box::new(handler),
            state: Mutex::new(SlotState {
                active: true,
                in_flight: Vec::new(),
            }),
            idle: Condvar::new(),
        });
        inner.slots.push(Arc::clone(&slot));

        Subscription {
            channel: Arc::downgrade(&self.inner),
            slot: Some(slot),
        }
    }

    /// Invokes every live handler with `value` and returns how many ran.
    ///
    /// The channel lock is released before any handler runs, so handlers may
    /// subscribe, unsubscribe or publish re-entrantly.
    pub fn publish(&self, value: &T) -> usize {
        let slots: Vec<Arc<Slot<T>>> = lock_unpoisoned(&self.inner).slots.clone();
        slots.iter().filter(|slot| slot.invoke(value)).count()
    }

    pub fn subscriber_count(&self) -> usize {
        lock_unpoisoned(&self.inner).slots.len()
    }

    /// Releases every subscription, waiting for in-flight handlers.
    pub fn clear(&self) {
        let slots = core::mem::take(&mut lock_unpoisoned(&self.inner).slots);
        for slot in slots {
            slot.deactivate();
        }
    }

    /// Read-only view that can subscribe but not publish.
    pub fn source(&self) -> EventSource<'_, T> {
        EventSource { channel: self }
    }
}

impl<T> Default for EventChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscribe-only handle onto an [`EventChannel`].
pub struct EventSource<'a, T> {
    channel: &'a EventChannel<T>,
}

impl<'a, T> EventSource<'a, T> {
    pub fn subscribe<F>(&self, handler: F) -> Subscription<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.channel.subscribe(handler)
    }

    pub fn subscriber_count(&self) -> usize {
        self.channel.subscriber_count()
    }
}

/// Registration handle returned by [`EventChannel::subscribe`].
#[must_use = "dropping a Subscription unregisters its handler immediately"]
pub struct Subscription<T> {
    channel: Weak<Mutex<ChannelInner<T>>>,
    slot: Option<Arc<Slot<T>>>,
}

impl<T> Subscription<T> {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    pub fn is_active(&self) -> bool {
        self.slot
            .as_ref()
            .map(|slot| lock_unpoisoned(&slot.state).active)
            .unwrap_or(false)
    }

    fn release(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        if let Some(inner) = self.channel.upgrade() {
            lock_unpoisoned(&inner)
                .slots
                .retain(|candidate| !Arc::ptr_eq(candidate, &slot));
        }
        slot.deactivate();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T> core::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.slot.as_ref().map(|slot| slot.id))
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[test]
    fn test_publish_reaches_all_subscribers_in_order() {
        let channel = EventChannel::<u32>::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let first_log = Arc::clone(&log);
        let _first = channel.subscribe(move |v| first_log.lock().unwrap().push(("first", *v)));
        let second_log = Arc::clone(&log);
        let _second = channel.subscribe(move |v| second_log.lock().unwrap().push(("second", *v)));

        assert_eq!(channel.publish(&7), 2);
        assert_eq!(*log.lock().unwrap(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let channel = EventChannel::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let subscription = channel.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        channel.publish(&1);
        drop(subscription);
        channel.publish(&2);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[test]
    fn test_panicking_handler_does_not_block_others() {
        let channel = EventChannel::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let _bad = channel.subscribe(|_| panic!("handler failure"));
        let counter = Arc::clone(&hits);
        let _good = channel.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        channel.publish(&1);
        channel.publish(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(channel.subscriber_count(), 2);
    }

    #[test]
    fn test_handler_can_release_itself() {
        let channel = Arc::new(EventChannel::<u32>::new());
        let holder: Arc<Mutex<Option<Subscription<u32>>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(AtomicUsize::new(0));

        let inner_holder = Arc::clone(&holder);
        let counter = Arc::clone(&hits);
        let subscription = channel.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            inner_holder.lock().unwrap().take();
        });
        *holder.lock().unwrap() = Some(subscription);

        channel.publish(&1);
        channel.publish(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handlers_can_release_each_other_across_threads() {
        let left = Arc::new(EventChannel::<u32>::new());
        let right = Arc::new(EventChannel::<u32>::new());
        let left_holder: Arc<Mutex<Option<Subscription<u32>>>> = Arc::new(Mutex::new(None));
        let right_holder: Arc<Mutex<Option<Subscription<u32>>>> = Arc::new(Mutex::new(None));
        let both_running = Arc::new(Barrier::new(2));

        let (barrier, other) = (Arc::clone(&both_running), Arc::clone(&right_holder));
        *left_holder.lock().unwrap() = Some(left.subscribe(move |_| {
            barrier.wait();
            let taken = other.lock().unwrap().take();
            drop(taken);
        }));
        let (barrier, other) = (Arc::clone(&both_running), Arc::clone(&left_holder));
        *right_holder.lock().unwrap() = Some(right.subscribe(move |_| {
            barrier.wait();
            let taken = other.lock().unwrap().take();
            drop(taken);
        }));

        let publisher = Arc::clone(&left);
        let left_thread = thread::spawn(move || publisher.publish(&1));
        let publisher = Arc::clone(&right);
        let right_thread = thread::spawn(move || publisher.publish(&2));

        assert_eq!(left_thread.join().unwrap(), 1);
        assert_eq!(right_thread.join().unwrap(), 1);
        assert_eq!(left.subscriber_count(), 0);
        assert_eq!(right.subscriber_count(), 0);
        assert_eq!(left.publish(&3) + right.publish(&4), 0);
        assert!(!dispatching());
    }

    #[test]
    fn test_clear_releases_everything() {
        let channel = EventChannel::<u32>::new();
        let subscription = channel.subscribe(|_| {});
        channel.clear();
        assert!(!subscription.is_active());
        assert_eq!(channel.publish(&1), 0);
    }
}
