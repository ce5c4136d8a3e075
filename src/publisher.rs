//! The publisher core: topic set, subscriber lists, dispatch, and topic
//! closure. Grounded in `antevents/base.py`'s `Publisher` class.

use crate::error::{DynError, FatalError, Result};
use crate::subscriber::{Dispose, Subscriber, Subscription};
use crate::topic::DEFAULT_TOPIC;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// A thread-safe trampoline that posts a task to the main loop from any
/// thread. Set by the scheduler via `schedule_attach` before a worker-thread
/// source's first call; `None` for main-loop-driven sources. A task that
/// returns `Err(FatalError)` is the deferred equivalent of an inline
/// dispatch propagating a fatal error: the scheduler's run loop treats it
/// the same as a `DirectSource::observe` returning `Err`.
pub type EnqueueFn = Arc<dyn Fn(Box<dyn FnOnce() -> Result<()> + Send>) + Send + Sync>;

type SubList<E> = Arc<Vec<Arc<Subscription<E>>>>;

/// Shared, interior-mutable publisher state. `Publisher<E>` wraps this in an
/// `Arc<Mutex<_>>` so that filters, the scheduler, and adapter code can all
/// hold a handle to the same publisher.
struct PublisherState<E> {
    topics: HashSet<String>,
    subscribers: HashMap<String, SubList<E>>,
    closed_topics: HashSet<String>,
    unschedule_hook: Option<Box<dyn FnOnce() + Send>>,
    enqueue_fn: Option<EnqueueFn>,
}

/// The publisher core shared by every source, filter, and adapter in this
/// crate. Owns the topic set and subscriber lists, performs dispatch, and
/// tracks closed topics.
///
/// `Publisher<E>` is cheap to clone (it's an `Arc` around the core); clones
/// refer to the same underlying topic/subscriber state, matching the
/// original's single `Publisher` instance shared by reference.
pub struct Publisher<E> {
    state: Arc<Mutex<PublisherState<E>>>,
}

impl<E> Clone for Publisher<E> {
    fn clone(&self) -> Self {
        Publisher {
            state: Arc::clone(&self.state),
        }
    }
}

impl<E> Default for Publisher<E>
where
    E: Send + 'static,
{
    fn default() -> Self {
        Self::new(&[DEFAULT_TOPIC])
    }
}

impl<E> Publisher<E>
where
    E: Send + 'static,
{
    /// Create a publisher with the given, fixed topic set. The set may only
    /// shrink afterward (by closure), never grow.
    pub fn new(topics: &[&str]) -> Self {
        let topics: HashSet<String> = topics.iter().map(|t| t.to_string()).collect();
        let mut subscribers = HashMap::new();
        for topic in &topics {
            subscribers.insert(topic.clone(), Arc::new(Vec::new()));
        }
        Publisher {
            state: Arc::new(Mutex::new(PublisherState {
                topics,
                subscribers,
                closed_topics: HashSet::new(),
                unschedule_hook: None,
                enqueue_fn: None,
            })),
        }
    }

    /// The currently open topic names.
    pub fn topics(&self) -> HashSet<String> {
        self.state
            .lock()
            .expect("publisher mutex poisoned")
            .topics
            .clone()
    }

    /// Subscribe `subscriber` to `pub_topic`, routing events to the
    /// subscriber's `sub_topic`. `None` defaults both sides to `"default"`.
    ///
    /// Safe to call from inside another subscriber's `on_next`: the
    /// subscriber list for `pub_topic` is replaced wholesale (copy-on-write)
    /// rather than mutated in place, so a dispatch iterating the old list
    /// snapshot is unaffected.
    pub fn subscribe<S>(
        &self,
        subscriber: Arc<Mutex<S>>,
        topic_mapping: Option<(&str, &str)>,
    ) -> Result<Dispose>
    where
        S: Subscriber<E>,
    {
        let (pub_topic, sub_topic) = topic_mapping.unwrap_or((DEFAULT_TOPIC, DEFAULT_TOPIC));

        {
            let guard = subscriber.lock().expect("subscriber mutex poisoned");
            if !guard.has_topic(sub_topic) {
                return Err(FatalError::InvalidTopic(format!(
                    "no route for subscribe topic '{sub_topic}' on subscriber"
                )));
            }
        }

        let subscription = Arc::new(Subscription::bind(subscriber, sub_topic));
        let id = subscription.id;
        let pub_topic = pub_topic.to_string();

        let mut state = self.state.lock().expect("publisher mutex poisoned");
        if !state.topics.contains(&pub_topic) {
            return Err(FatalError::InvalidTopic(format!(
                "invalid publish topic '{pub_topic}', valid topics are {:?}",
                state.topics
            )));
        }
        let current = state
            .subscribers
            .get(&pub_topic)
            .cloned()
            .unwrap_or_default();
        let mut new_list: Vec<Arc<Subscription<E>>> = (*current).clone();
        new_list.push(subscription);
        state
            .subscribers
            .insert(pub_topic.clone(), Arc::new(new_list));
        drop(state);

        let state_ref = Arc::clone(&self.state);
        Ok(Dispose::new(move || {
            let mut state = state_ref.lock().expect("publisher mutex poisoned");
            if let Some(current) = state.subscribers.get(&pub_topic) {
                if current.iter().any(|s| s.id == id) {
                    let mut new_list: Vec<Arc<Subscription<E>>> = (**current).clone();
                    new_list.retain(|s| s.id != id);
                    state
                        .subscribers
                        .insert(pub_topic.clone(), Arc::new(new_list));
                }
            }
        }))
    }

    /// Register the scheduler's unschedule hook and thread-safe trampoline.
    /// Called by the scheduler via `schedule_attach`, before `observe` can
    /// run.
    pub fn schedule_attach(
        &self,
        unschedule_hook: Option<Box<dyn FnOnce() + Send>>,
        enqueue_fn: Option<EnqueueFn>,
    ) {
        let mut state = self.state.lock().expect("publisher mutex poisoned");
        state.unschedule_hook = unschedule_hook;
        state.enqueue_fn = enqueue_fn;
    }

    fn subscribers_for(&self, topic: &str) -> Result<SubList<E>> {
        let state = self.state.lock().expect("publisher mutex poisoned");
        match state.subscribers.get(topic) {
            Some(list) => Ok(Arc::clone(list)),
            None if state.closed_topics.contains(topic) => Err(FatalError::TopicAlreadyClosed(
                format!("topic '{topic}' on publisher already had a terminal event"),
            )),
            None => Err(FatalError::UnknownTopic(format!(
                "unknown topic '{topic}' in publisher"
            ))),
        }
    }

    fn enqueue_fn(&self) -> Option<EnqueueFn> {
        self.state
            .lock()
            .expect("publisher mutex poisoned")
            .enqueue_fn
            .clone()
    }

    /// Dispatch one event on `topic`, in subscription order. A subscriber
    /// returning `Err(FatalError)` aborts the cascade and propagates
    /// immediately — the rest of the subscriber list is not notified, the
    /// Rust rendering of "an exception other than a handled in-band error
    /// crosses the callback boundary and terminates the run".
    ///
    /// When the publisher has a thread-safe trampoline installed (set by the
    /// scheduler for sources observed off the main thread), each
    /// subscriber's `on_next` is instead posted as its own task so the main
    /// loop interleaves delivery with other scheduled work; a fatal error
    /// surfaces later, to the scheduler's run loop, rather than to this
    /// call.
    pub fn dispatch_next(&self, topic: &str, event: E) -> Result<()>
    where
        E: Clone,
    {
        let subscribers = self.subscribers_for(topic)?;
        if subscribers.is_empty() {
            return Ok(());
        }
        if let Some(enqueue) = self.enqueue_fn() {
            for sub in subscribers.iter() {
                let sub = Arc::clone(sub);
                let event = event.clone();
                enqueue(Box::new(move || (sub.on_next)(event)));
            }
            return Ok(());
        }
        for sub in subscribers.iter() {
            (sub.on_next)(event.clone())?;
        }
        Ok(())
    }

    /// Dispatch `completed` on `topic`, then close it. Closing happens
    /// whether or not a subscriber's `on_completed` returns an error.
    pub fn dispatch_completed(&self, topic: &str) -> Result<()> {
        let subscribers = self.subscribers_for(topic)?;
        let result = if let Some(enqueue) = self.enqueue_fn() {
            for sub in subscribers.iter() {
                let sub = Arc::clone(sub);
                enqueue(Box::new(move || (sub.on_completed)()));
            }
            Ok(())
        } else {
            let mut result = Ok(());
            for sub in subscribers.iter() {
                if let Err(err) = (sub.on_completed)() {
                    result = Err(err);
                    break;
                }
            }
            result
        };
        self.close_topic(topic);
        result
    }

    /// Dispatch `error` on `topic`, then close it. `DynError` isn't
    /// `Clone`; see [`SharedDynError`] for how one error is fanned out to
    /// several subscribers.
    pub fn dispatch_error(&self, topic: &str, err: DynError) -> Result<()> {
        let subscribers = self.subscribers_for(topic)?;
        let shared = SharedDynError::new(err);
        let result = if let Some(enqueue) = self.enqueue_fn() {
            for sub in subscribers.iter() {
                let sub = Arc::clone(sub);
                let shared = shared.clone();
                enqueue(Box::new(move || (sub.on_error)(shared.take())));
            }
            Ok(())
        } else {
            let mut result = Ok(());
            for sub in subscribers.iter() {
                if let Err(err) = (sub.on_error)(shared.take()) {
                    result = Err(err);
                    break;
                }
            }
            result
        };
        self.close_topic(topic);
        result
    }

    /// Pretty-print the subscriber table: one line per topic, one indented
    /// line per subscription naming its `sub_topic` and subscriber type.
    /// Debugging aid, matching the original's `pp_subscribers`.
    pub fn pp_subscribers(&self) -> String {
        let state = self.state.lock().expect("publisher mutex poisoned");
        let mut out = String::new();
        let header = format!("***** Subscribers for {:p} *****", Arc::as_ptr(&self.state));
        out.push_str(&header);
        out.push('\n');
        let mut topics: Vec<_> = state.subscribers.keys().cloned().collect();
        topics.sort();
        for topic in topics {
            out.push_str(&format!("  Topic {topic}\n"));
            for sub in state.subscribers[&topic].iter() {
                out.push_str(&format!("    [{}] => {}\n", sub.sub_topic, sub.debug_name));
            }
        }
        out.push_str(&"*".repeat(header.len()));
        out.push('\n');
        out
    }

    /// Recursively describe every path from this publisher down through
    /// whatever further publishers its subscribers expose via
    /// [`crate::subscriber::Subscriber::downstream_dump`] (e.g. a chain of
    /// `Filter`s). Debugging aid, matching the original's `print_downstream`.
    pub fn print_downstream(&self) -> String {
        let mut out = String::new();
        let root = format!("<publisher {:p}>", Arc::as_ptr(&self.state));
        out.push_str(&format!("***** Dump of all paths from {root} *****\n"));
        self.print_from(&format!("  {root}"), &mut out);
        out.push_str(&"*".repeat(12 + root.len()));
        out.push('\n');
        out
    }

    /// Continue a path dump from `prefix` through this publisher's own
    /// subscriber table. `pub(crate)` so [`crate::filter::Filter`] (and any
    /// other subscriber-that-is-itself-a-publisher) can splice its own
    /// downstream graph into a caller's `print_downstream` via
    /// `Subscriber::downstream_dump`.
    pub(crate) fn print_from(&self, prefix: &str, out: &mut String) {
        let state = self.state.lock().expect("publisher mutex poisoned");
        let mut any = false;
        let mut topics: Vec<_> = state.subscribers.keys().cloned().collect();
        topics.sort();
        for topic in &topics {
            for sub in state.subscribers[topic].iter() {
                any = true;
                let next = if topic == DEFAULT_TOPIC && sub.sub_topic == DEFAULT_TOPIC {
                    format!("{prefix} => {}", sub.debug_name)
                } else {
                    format!("{prefix} [{topic}]=>[{}] {}", sub.sub_topic, sub.debug_name)
                };
                match (sub.downstream_dump)(&next) {
                    Some(dump) => out.push_str(&dump),
                    None => {
                        out.push_str(&next);
                        out.push('\n');
                    }
                }
            }
        }
        if !any {
            out.push_str(prefix);
            out.push('\n');
        }
    }

    /// Called internally when a topic receives a terminal event. Removes
    /// the topic from the open set; when the last topic closes, fires the
    /// unschedule hook exactly once.
    fn close_topic(&self, topic: &str) {
        let mut state = self.state.lock().expect("publisher mutex poisoned");
        state.subscribers.remove(topic);
        state.topics.remove(topic);
        state.closed_topics.insert(topic.to_string());
        if state.topics.is_empty() {
            if let Some(hook) = state.unschedule_hook.take() {
                state.enqueue_fn = None;
                drop(state);
                hook();
            }
        }
    }
}

/// `on_error` is dispatched to every subscriber on a topic, but a
/// [`DynError`] isn't `Clone`. In practice exactly one subscriber's handler
/// does anything interesting with the payload; this wraps the single error
/// in a `Mutex<Option<_>>` shared by all per-subscriber dispatch closures —
/// the first one to run takes it, any later one (a second subscriber on the
/// same topic, or a retry) gets a placeholder noting the real error already
/// went to an earlier subscriber. This keeps the `on_error` fan-out uniform
/// with `on_next`/`on_completed` without requiring error payloads to be
/// `Clone`.
#[derive(Clone)]
struct SharedDynError(Arc<Mutex<Option<DynError>>>);

impl SharedDynError {
    fn new(err: DynError) -> Self {
        SharedDynError(Arc::new(Mutex::new(Some(err))))
    }

    fn take(&self) -> DynError {
        let mut guard = self.0.lock().expect("shared error mutex poisoned");
        guard.take().unwrap_or_else(|| {
            Box::new(std::io::Error::other(
                "error already delivered to an earlier subscriber on this topic",
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::ClosureSubscriber;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn subscribe_rejects_unknown_topic() {
        let publisher: Publisher<i32> = Publisher::new(&["default"]);
        let sub = Arc::new(StdMutex::new(ClosureSubscriber::new(|_: i32| Ok(()))));
        let err = publisher
            .subscribe(sub, Some(("nope", "default")))
            .unwrap_err();
        assert!(matches!(err, FatalError::InvalidTopic(_)));
    }

    #[test]
    fn dispatch_after_close_is_fatal() {
        let publisher: Publisher<i32> = Publisher::new(&["default"]);
        publisher.dispatch_completed("default").unwrap();
        let err = publisher.dispatch_next("default", 1).unwrap_err();
        assert!(matches!(err, FatalError::TopicAlreadyClosed(_)));
    }

    #[test]
    fn dispatch_unknown_topic_is_fatal() {
        let publisher: Publisher<i32> = Publisher::new(&["default"]);
        let err = publisher.dispatch_next("nope", 1).unwrap_err();
        assert!(matches!(err, FatalError::UnknownTopic(_)));
    }

    #[test]
    fn dispose_removes_exactly_one_subscription_and_is_idempotent() {
        let publisher: Publisher<i32> = Publisher::new(&["default"]);
        let received = Arc::new(StdMutex::new(Vec::new()));
        let received2 = Arc::clone(&received);
        let sub = Arc::new(StdMutex::new(ClosureSubscriber::new(move |x: i32| {
            received2.lock().unwrap().push(x);
            Ok(())
        })));
        let mut dispose = publisher.subscribe(sub, None).unwrap();
        publisher.dispatch_next("default", 1).unwrap();
        dispose.dispose();
        dispose.dispose(); // idempotent
        publisher.dispatch_next("default", 2).unwrap();
        assert_eq!(*received.lock().unwrap(), vec![1]);
    }

    #[test]
    fn fatal_error_from_subscriber_propagates_and_halts_cascade() {
        let publisher: Publisher<i32> = Publisher::new(&["default"]);
        let calls = Arc::new(StdMutex::new(0));
        let calls2 = Arc::clone(&calls);
        let first = Arc::new(StdMutex::new(ClosureSubscriber::new(move |_: i32| {
            *calls2.lock().unwrap() += 1;
            Err(FatalError::ScheduleError("boom".into()))
        })));
        let calls3 = Arc::clone(&calls);
        let second = Arc::new(StdMutex::new(ClosureSubscriber::new(move |_: i32| {
            *calls3.lock().unwrap() += 1;
            Ok(())
        })));
        publisher.subscribe(first, None).unwrap();
        publisher.subscribe(second, None).unwrap();
        let err = publisher.dispatch_next("default", 1).unwrap_err();
        assert!(matches!(err, FatalError::ScheduleError(_)));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn pp_subscribers_lists_each_topic_and_subscription() {
        let publisher: Publisher<i32> = Publisher::new(&["default"]);
        let sub = Arc::new(StdMutex::new(ClosureSubscriber::new(|_: i32| Ok(()))));
        publisher.subscribe(sub, None).unwrap();
        let dump = publisher.pp_subscribers();
        assert!(dump.contains("Topic default"));
        assert!(dump.contains("ClosureSubscriber"));
    }

    #[test]
    fn print_downstream_follows_a_filter_chain() {
        let upstream: Publisher<i32> = Publisher::new(&["default"]);
        let filter = crate::filter::Filter::new(&upstream, |x: i32| Ok(Some(x))).unwrap();
        let downstream = filter.lock().unwrap().downstream();
        let sink = Arc::new(StdMutex::new(ClosureSubscriber::new(|_: i32| Ok(()))));
        downstream.subscribe(sink, None).unwrap();

        let dump = upstream.print_downstream();
        assert!(dump.contains("Filter"));
        assert!(dump.contains("ClosureSubscriber"));
    }

    #[test]
    fn unschedule_hook_fires_once_when_last_topic_closes() {
        let publisher: Publisher<i32> = Publisher::new(&["a", "b"]);
        let fire_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count = Arc::clone(&fire_count);
        publisher.schedule_attach(
            Some(Box::new(move || {
                count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })),
            None,
        );
        publisher.dispatch_completed("a").unwrap();
        assert_eq!(fire_count.load(std::sync::atomic::Ordering::SeqCst), 0);
        publisher.dispatch_completed("b").unwrap();
        assert_eq!(fire_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
