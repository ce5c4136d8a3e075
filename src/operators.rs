//! `take`, `take_last`, and `last`: free functions that attach a stateful
//! subscriber between an upstream publisher and a fresh downstream one.
//!
//! Grounded line-for-line in `antevents/linq/take.py`.

use crate::error::{DynError, FatalError, Result};
use crate::publisher::Publisher;
use crate::subscriber::Subscriber;
use crate::topic::DEFAULT_TOPIC;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Forward at most `count` events, then complete downstream and stop
/// forwarding (upstream is left subscribed past that point, matching the
/// original, which never disposes `take`'s upstream subscription either).
///
/// `count == 0` short-circuits to an already-completed publisher.
/// `count < 0` is a [`FatalError::ArgumentOutOfRange`].
pub fn take<E>(upstream: &Publisher<E>, count: i64) -> Result<Publisher<E>>
where
    E: Send + Clone + 'static,
{
    if count < 0 {
        return Err(FatalError::ArgumentOutOfRange(format!(
            "take(count) requires count >= 0, got {count}"
        )));
    }
    let downstream = Publisher::new(&[DEFAULT_TOPIC]);
    if count == 0 {
        downstream.dispatch_completed(DEFAULT_TOPIC)?;
        return Ok(downstream);
    }
    let take = Arc::new(Mutex::new(Take {
        downstream: downstream.clone(),
        remaining: count as u64,
        completed: false,
    }));
    let _upstream_dispose = upstream.subscribe(take, None)?;
    Ok(downstream)
}

struct Take<E> {
    downstream: Publisher<E>,
    remaining: u64,
    completed: bool,
}

impl<E> Subscriber<E> for Take<E>
where
    E: Send + Clone + 'static,
{
    fn on_next(&mut self, _sub_topic: &str, event: E) -> Result<()> {
        if self.remaining > 0 {
            self.remaining -= 1;
            self.downstream.dispatch_next(DEFAULT_TOPIC, event)?;
            if self.remaining == 0 {
                self.completed = true;
                self.downstream.dispatch_completed(DEFAULT_TOPIC)?;
            }
        }
        Ok(())
    }

    fn on_completed(&mut self, _sub_topic: &str) -> Result<()> {
        // We may already have signaled completion on hitting `count`
        // elements; only notify again if the underlying sequence was
        // shorter than `count`.
        if !self.completed {
            self.downstream.dispatch_completed(DEFAULT_TOPIC)?;
        }
        Ok(())
    }

    fn on_error(&mut self, _sub_topic: &str, err: DynError) -> Result<()> {
        self.downstream.dispatch_error(DEFAULT_TOPIC, err)
    }

    fn downstream_dump(&self, prefix: &str) -> Option<String> {
        let mut out = String::new();
        self.downstream.print_from(prefix, &mut out);
        Some(out)
    }
}

/// Buffer the last `count` events and emit them, in order, only once
/// upstream completes — delaying all output to the very end of the stream.
pub fn take_last<E>(upstream: &Publisher<E>, count: usize) -> Result<Publisher<E>>
where
    E: Send + Clone + 'static,
{
    let downstream = Publisher::new(&[DEFAULT_TOPIC]);
    let state = Arc::new(Mutex::new(TakeLast {
        downstream: downstream.clone(),
        buffer: VecDeque::with_capacity(count),
        capacity: count,
    }));
    let _upstream_dispose = upstream.subscribe(state, None)?;
    Ok(downstream)
}

struct TakeLast<E> {
    downstream: Publisher<E>,
    buffer: VecDeque<E>,
    capacity: usize,
}

impl<E> Subscriber<E> for TakeLast<E>
where
    E: Send + Clone + 'static,
{
    fn on_next(&mut self, _sub_topic: &str, event: E) -> Result<()> {
        self.buffer.push_back(event);
        if self.buffer.len() > self.capacity {
            self.buffer.pop_front();
        }
        Ok(())
    }

    fn on_completed(&mut self, _sub_topic: &str) -> Result<()> {
        while let Some(event) = self.buffer.pop_front() {
            self.downstream.dispatch_next(DEFAULT_TOPIC, event)?;
        }
        self.downstream.dispatch_completed(DEFAULT_TOPIC)
    }

    fn on_error(&mut self, _sub_topic: &str, err: DynError) -> Result<()> {
        self.downstream.dispatch_error(DEFAULT_TOPIC, err)
    }

    fn downstream_dump(&self, prefix: &str) -> Option<String> {
        let mut out = String::new();
        self.downstream.print_from(prefix, &mut out);
        Some(out)
    }
}

/// Emit only the final event of upstream, once it completes. With no
/// `default` and an empty upstream sequence, completing with nothing seen
/// dispatches [`FatalError::SequenceContainsNoElements`] instead.
pub fn last<E>(upstream: &Publisher<E>, default: Option<E>) -> Result<Publisher<E>>
where
    E: Send + Clone + 'static,
{
    let downstream = Publisher::new(&[DEFAULT_TOPIC]);
    let state = Arc::new(Mutex::new(Last {
        downstream: downstream.clone(),
        value: None,
        default,
    }));
    let _upstream_dispose = upstream.subscribe(state, None)?;
    Ok(downstream)
}

struct Last<E> {
    downstream: Publisher<E>,
    value: Option<E>,
    default: Option<E>,
}

impl<E> Subscriber<E> for Last<E>
where
    E: Send + Clone + 'static,
{
    fn on_next(&mut self, _sub_topic: &str, event: E) -> Result<()> {
        self.value = Some(event);
        Ok(())
    }

    fn on_completed(&mut self, _sub_topic: &str) -> Result<()> {
        match self.value.take().or_else(|| self.default.take()) {
            Some(value) => {
                self.downstream.dispatch_next(DEFAULT_TOPIC, value)?;
                self.downstream.dispatch_completed(DEFAULT_TOPIC)
            }
            None => {
                let err: DynError = Box::new(SequenceEmpty);
                self.downstream.dispatch_error(DEFAULT_TOPIC, err)
            }
        }
    }

    fn on_error(&mut self, _sub_topic: &str, err: DynError) -> Result<()> {
        self.downstream.dispatch_error(DEFAULT_TOPIC, err)
    }

    fn downstream_dump(&self, prefix: &str) -> Option<String> {
        let mut out = String::new();
        self.downstream.print_from(prefix, &mut out);
        Some(out)
    }
}

/// In-band payload carried by `last()`'s `on_error` when the upstream
/// sequence produced nothing and no default was given. Downcasts to
/// [`FatalError::SequenceContainsNoElements`] for a subscriber that wants
/// to treat it as fatal, per the default `on_error` handler in
/// `subscriber.rs`.
#[derive(Debug)]
struct SequenceEmpty;

impl std::fmt::Display for SequenceEmpty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", FatalError::SequenceContainsNoElements)
    }
}

impl std::error::Error for SequenceEmpty {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::ClosureSubscriber;

    fn collecting_sink<E: Send + 'static>() -> (Arc<Mutex<Vec<E>>>, Arc<Mutex<ClosureSubscriber<impl FnMut(E) -> Result<()>>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = Arc::clone(&received);
        let sink = Arc::new(Mutex::new(ClosureSubscriber::new(move |x: E| {
            received2.lock().unwrap().push(x);
            Ok(())
        })));
        (received, sink)
    }

    #[test]
    fn take_zero_is_immediately_completed() {
        let upstream: Publisher<i32> = Publisher::new(&[DEFAULT_TOPIC]);
        let downstream = take(&upstream, 0).unwrap();
        assert!(downstream.topics().is_empty());
    }

    #[test]
    fn take_negative_is_argument_out_of_range() {
        let upstream: Publisher<i32> = Publisher::new(&[DEFAULT_TOPIC]);
        let err = take(&upstream, -1).unwrap_err();
        assert!(matches!(err, FatalError::ArgumentOutOfRange(_)));
    }

    #[test]
    fn take_forwards_exactly_count_then_completes() {
        let upstream: Publisher<i32> = Publisher::new(&[DEFAULT_TOPIC]);
        let downstream = take(&upstream, 2).unwrap();
        let (received, sink) = collecting_sink();
        downstream.subscribe(sink, None).unwrap();

        for x in 1..=5 {
            upstream.dispatch_next(DEFAULT_TOPIC, x).unwrap();
        }
        assert_eq!(*received.lock().unwrap(), vec![1, 2]);
        assert!(downstream.topics().is_empty());
    }

    #[test]
    fn take_last_buffers_and_flushes_on_completion() {
        let upstream: Publisher<i32> = Publisher::new(&[DEFAULT_TOPIC]);
        let downstream = take_last(&upstream, 2).unwrap();
        let (received, sink) = collecting_sink();
        downstream.subscribe(sink, None).unwrap();

        for x in 1..=4 {
            upstream.dispatch_next(DEFAULT_TOPIC, x).unwrap();
        }
        assert!(received.lock().unwrap().is_empty());
        upstream.dispatch_completed(DEFAULT_TOPIC).unwrap();
        assert_eq!(*received.lock().unwrap(), vec![3, 4]);
    }

    #[test]
    fn last_with_no_default_on_empty_stream_is_fatal() {
        let upstream: Publisher<i32> = Publisher::new(&[DEFAULT_TOPIC]);
        let downstream = last(&upstream, None).unwrap();
        let err_seen = Arc::new(Mutex::new(false));
        let err_seen2 = Arc::clone(&err_seen);
        struct ErrSink {
            seen: Arc<Mutex<bool>>,
        }
        impl Subscriber<i32> for ErrSink {
            fn on_next(&mut self, _sub_topic: &str, _event: i32) -> Result<()> {
                Ok(())
            }
            fn on_error(&mut self, _sub_topic: &str, err: DynError) -> Result<()> {
                assert!(err.downcast_ref::<SequenceEmpty>().is_some());
                *self.seen.lock().unwrap() = true;
                Ok(())
            }
        }
        downstream
            .subscribe(Arc::new(Mutex::new(ErrSink { seen: err_seen2 })), None)
            .unwrap();
        upstream.dispatch_completed(DEFAULT_TOPIC).unwrap();
        assert!(*err_seen.lock().unwrap());
    }

    #[test]
    fn last_emits_final_value() {
        let upstream: Publisher<i32> = Publisher::new(&[DEFAULT_TOPIC]);
        let downstream = last(&upstream, None).unwrap();
        let (received, sink) = collecting_sink();
        downstream.subscribe(sink, None).unwrap();

        for x in 1..=3 {
            upstream.dispatch_next(DEFAULT_TOPIC, x).unwrap();
        }
        upstream.dispatch_completed(DEFAULT_TOPIC).unwrap();
        assert_eq!(*received.lock().unwrap(), vec![3]);
    }
}
