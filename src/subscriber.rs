//! The subscriber contract and the subscription record that binds a
//! subscriber's callbacks to one publisher topic.
//!
//! Grounded in `antevents/base.py`'s `DefaultSubscriber`, `CallableAsSubscriber`
//! and the `_Subscription` namedtuple. The original resolves `on_next` /
//! `on_completed` / `on_error` by composing a method name from the topic
//! (`on_%s_next` etc.) and doing attribute lookup at `subscribe()` time. This
//! crate replaces that string-keyed reflection with a typed trait whose
//! methods take the topic name as an ordinary argument, and freezes which
//! subscriber instance and which topic name a subscription refers to at
//! `subscribe()` time (see [`crate::publisher::Publisher::subscribe`]) — the
//! same "resolved once, not re-resolved on every dispatch" invariant the
//! original relied on bound Python methods for.
//!
//! Callbacks return [`Result<()>`] rather than raising: a `FatalError` return
//! propagates synchronously out of dispatch, the idiomatic rendering of "an
//! exception other than a handled in-band error crossing the callback
//! boundary" from spec §7, without reaching for `std::panic::catch_unwind`.

use crate::error::{DynError, FatalError, Result};
use crate::topic::DEFAULT_TOPIC;
use std::sync::{Arc, Mutex};

/// Implemented by anything that can receive events on one or more named
/// topics. A type implementing this trait is always wrapped in
/// `Arc<Mutex<_>>` before being subscribed, since the spec requires that a
/// subscriber be shared across multiple publishers concurrently.
pub trait Subscriber<E>: Send + 'static {
    /// Declares which `sub_topic` names this subscriber accepts. The
    /// default accepts only `"default"`, matching the `DefaultSubscriber`
    /// convention in the original.
    fn has_topic(&self, sub_topic: &str) -> bool {
        sub_topic == DEFAULT_TOPIC
    }

    fn on_next(&mut self, sub_topic: &str, event: E) -> Result<()>;

    fn on_completed(&mut self, _sub_topic: &str) -> Result<()> {
        Ok(())
    }

    /// Default behavior mirrors the original's `CallableAsSubscriber`
    /// default error handler: propagate fatal errors, log everything else.
    fn on_error(&mut self, sub_topic: &str, err: DynError) -> Result<()> {
        default_on_error(sub_topic, err)
    }

    /// Debugging hook for [`crate::publisher::Publisher::print_downstream`]:
    /// a subscriber that is itself upstream of its own publisher (e.g.
    /// [`crate::filter::Filter`]) continues the path dump from `prefix`
    /// into its own downstream graph. Leaf subscribers keep the default,
    /// which ends the path at this subscriber.
    fn downstream_dump(&self, _prefix: &str) -> Option<String> {
        None
    }
}

/// The default `on_error` behavior shared by the closure adapter and by
/// `Subscriber::on_error`'s default body.
pub fn default_on_error(sub_topic: &str, err: DynError) -> Result<()> {
    match err.downcast::<FatalError>() {
        Ok(fatal) => Err(*fatal),
        Err(err) => {
            log::error!("on_error('{sub_topic}'): {err}");
            Ok(())
        }
    }
}

/// Wraps a bare `FnMut(E) -> Result<()>` closure as a [`Subscriber`],
/// matching `CallableAsSubscriber` in the original: only `on_next` is
/// supplied, and `on_completed`/`on_error` fall back to the trait defaults.
pub struct ClosureSubscriber<F> {
    on_next: F,
}

impl<F> ClosureSubscriber<F> {
    pub fn new(on_next: F) -> Self {
        Self { on_next }
    }
}

impl<E, F> Subscriber<E> for ClosureSubscriber<F>
where
    F: FnMut(E) -> Result<()> + Send + 'static,
    E: 'static,
{
    fn on_next(&mut self, _sub_topic: &str, event: E) -> Result<()> {
        (self.on_next)(event)
    }
}

/// A live binding from one publisher topic to one subscriber's three
/// callbacks, frozen at `subscribe()` time. Mirrors the `_Subscription`
/// namedtuple in the original (`on_next`, `on_completed`, `on_error`,
/// `subscriber`, `sub_topic`).
///
/// The callback fields are `Fn`, not `FnMut`: they close over an
/// `Arc<Mutex<S>>` and reach the subscriber through `.lock()`, so they don't
/// need their own mutable captured state. That lets a `Publisher` invoke
/// them through a shared `Arc<Vec<Arc<Subscription<E>>>>` snapshot — needed
/// both for inline dispatch and for capture-by-clone into a task posted
/// across the thread-safe trampoline.
pub struct Subscription<E> {
    pub(crate) id: u64,
    pub(crate) on_next: Box<dyn Fn(E) -> Result<()> + Send + Sync>,
    pub(crate) on_completed: Box<dyn Fn() -> Result<()> + Send + Sync>,
    pub(crate) on_error: Box<dyn Fn(DynError) -> Result<()> + Send + Sync>,
    pub(crate) downstream_dump: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
    pub(crate) sub_topic: String,
    pub(crate) debug_name: String,
}

fn next_subscription_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

impl<E> Subscription<E>
where
    E: 'static,
{
    pub(crate) fn bind<S>(subscriber: Arc<Mutex<S>>, sub_topic: &str) -> Self
    where
        S: Subscriber<E>,
    {
        let id = next_subscription_id();
        let debug_name = std::any::type_name::<S>().to_string();
        let topic_for_next = sub_topic.to_string();
        let topic_for_completed = sub_topic.to_string();
        let topic_for_error = sub_topic.to_string();
        let s1 = Arc::clone(&subscriber);
        let s2 = Arc::clone(&subscriber);
        let s3 = Arc::clone(&subscriber);
        let s4 = subscriber;
        Subscription {
            id,
            on_next: Box::new(move |event| {
                s1.lock()
                    .expect("subscriber mutex poisoned")
                    .on_next(&topic_for_next, event)
            }),
            on_completed: Box::new(move || {
                s2.lock()
                    .expect("subscriber mutex poisoned")
                    .on_completed(&topic_for_completed)
            }),
            on_error: Box::new(move |err| {
                s3.lock()
                    .expect("subscriber mutex poisoned")
                    .on_error(&topic_for_error, err)
            }),
            downstream_dump: Box::new(move |prefix| {
                s4.lock()
                    .expect("subscriber mutex poisoned")
                    .downstream_dump(prefix)
            }),
            sub_topic: sub_topic.to_string(),
            debug_name,
        }
    }
}

/// A handle that cancels exactly one subscription. Calling it twice is a
/// safe no-op the second time, matching the spec's idempotence requirement.
/// Safe to call from inside another subscriber's `on_next` — the
/// copy-on-write subscriber list makes that safe, see `publisher.rs`.
pub struct Dispose {
    inner: Box<dyn FnMut() + Send>,
}

impl Dispose {
    pub(crate) fn new(inner: impl FnMut() + Send + 'static) -> Self {
        Dispose {
            inner: Box::new(inner),
        }
    }

    /// Remove the subscription this handle refers to. Safe to call more
    /// than once; safe to call from inside a dispatch in progress.
    pub fn dispose(&mut self) {
        (self.inner)()
    }
}
