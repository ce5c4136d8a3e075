//! Bridges a publisher's dispatch calls across to a dedicated worker
//! thread, for subscribers whose handlers may block (file I/O, network
//! writes, anything that shouldn't stall the main loop).
//!
//! Grounded in `antevents/base.py`'s `BlockingSubscriber` +
//! `_ThreadForBlockingSubscriber`: a queue plus a sentinel stop message,
//! drained by a worker thread that runs the user's handlers and reports
//! back to the scheduler when it exits.

use crate::error::{DynError, FatalError, Result};
use crate::scheduler::Scheduler;
use crate::subscriber::Subscriber;
use crate::topic::DEFAULT_TOPIC;
use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Implemented by handlers that may block while processing an event —
/// writing to a socket, a file, or anything else that shouldn't run on the
/// scheduler's main thread.
pub trait BlockingSubscriber<E>: Send + 'static {
    fn handle_next(&mut self, sub_topic: &str, event: E) -> Result<()>;
    fn handle_completed(&mut self, _sub_topic: &str) -> Result<()> {
        Ok(())
    }
    fn handle_error(&mut self, sub_topic: &str, err: DynError) -> Result<()> {
        log::error!("blocking subscriber on_error('{sub_topic}'): {err}");
        Ok(())
    }
    /// Called once, after the last topic closes or `request_stop` fires,
    /// before the worker thread exits.
    fn close(&mut self) {}
}

enum BridgeMsg<E> {
    Next(String, E),
    Completed(String),
    Error(String, DynError),
    Stop,
}

enum BridgeSender<E> {
    Unbounded(Sender<BridgeMsg<E>>),
    Bounded(SyncSender<BridgeMsg<E>>),
}

impl<E> BridgeSender<E> {
    fn send(&self, msg: BridgeMsg<E>) -> std::result::Result<(), mpsc::SendError<BridgeMsg<E>>> {
        match self {
            BridgeSender::Unbounded(tx) => tx.send(msg),
            BridgeSender::Bounded(tx) => tx.send(msg).map_err(|e| mpsc::SendError(e.0)),
        }
    }
}

/// A [`Subscriber`] that forwards every callback to a worker thread running
/// a user-supplied [`BlockingSubscriber`]. The main-thread side never
/// blocks on the handler: it only enqueues.
///
/// Uses an unbounded `std::sync::mpsc::channel` by default, matching the
/// original's plain `queue.Queue()` — there is no backpressure, so a
/// handler slower than its producer accumulates an unbounded backlog in
/// memory. Use [`BlockingSubscriberBridge::with_capacity`] for a bounded
/// `sync_channel` instead: its overflow policy is "blocks the enqueuing
/// side" (the thread calling `dispatch_next`), trading a possibly-stalled
/// main loop for bounded memory.
pub struct BlockingSubscriberBridge<E> {
    sender: BridgeSender<E>,
    worker: Option<JoinHandle<()>>,
    topics: HashSet<String>,
}

impl<E> BlockingSubscriberBridge<E>
where
    E: Send + 'static,
{
    /// Registers with `scheduler` as an active schedule (see
    /// [`Scheduler::register_external_worker`]) and spawns the worker
    /// thread, declaring a single `"default"` topic.
    pub fn new<H>(scheduler: &mut Scheduler, handler: H) -> Self
    where
        H: BlockingSubscriber<E>,
    {
        Self::with_topics(scheduler, handler, &[DEFAULT_TOPIC])
    }

    /// Like [`BlockingSubscriberBridge::new`], but declares the full set of
    /// `sub_topic`s this bridge accepts — `has_topic` only admits these, and
    /// the worker thread only exits once every one of them has received a
    /// terminal event (`Completed` or `Error`), matching the original's
    /// `BlockingSubscriber(scheduler, topics=...)` and its
    /// `num_closed_topics` count against `len(self.topics)`.
    pub fn with_topics<H>(scheduler: &mut Scheduler, handler: H, topics: &[&str]) -> Self
    where
        H: BlockingSubscriber<E>,
    {
        let (tx, rx) = mpsc::channel();
        let topics: HashSet<String> = topics.iter().map(|t| t.to_string()).collect();
        let stop_tx = tx.clone();
        let (_id, finished) = scheduler.register_external_worker(Arc::new(move || {
            let _ = stop_tx.send(BridgeMsg::Stop);
        }));
        let worker = spawn_worker(handler, rx, topics.clone(), finished);
        BlockingSubscriberBridge {
            sender: BridgeSender::Unbounded(tx),
            worker: Some(worker),
            topics,
        }
    }

    /// A bounded variant: the channel holds at most `capacity` messages,
    /// after which `dispatch_*` calls on the enqueuing thread block until
    /// the worker drains one.
    pub fn with_capacity<H>(scheduler: &mut Scheduler, handler: H, capacity: usize) -> Self
    where
        H: BlockingSubscriber<E>,
    {
        Self::with_capacity_and_topics(scheduler, handler, capacity, &[DEFAULT_TOPIC])
    }

    /// [`BlockingSubscriberBridge::with_capacity`] plus an explicit topic
    /// set, as [`BlockingSubscriberBridge::with_topics`].
    pub fn with_capacity_and_topics<H>(
        scheduler: &mut Scheduler,
        handler: H,
        capacity: usize,
        topics: &[&str],
    ) -> Self
    where
        H: BlockingSubscriber<E>,
    {
        let (tx, rx) = mpsc::sync_channel(capacity);
        let topics: HashSet<String> = topics.iter().map(|t| t.to_string()).collect();
        let stop_tx = tx.clone();
        let (_id, finished) = scheduler.register_external_worker(Arc::new(move || {
            let _ = stop_tx.send(BridgeMsg::Stop);
        }));
        let worker = spawn_worker(handler, rx, topics.clone(), finished);
        BlockingSubscriberBridge {
            sender: BridgeSender::Bounded(tx),
            worker: Some(worker),
            topics,
        }
    }

    /// Ask the worker thread to stop without waiting for its topics to
    /// close naturally, matching the original's `request_stop`.
    pub fn request_stop(&self) {
        let _ = self.sender.send(BridgeMsg::Stop);
    }

    /// Block until the worker thread has drained and exited.
    pub fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Drains `rx` until every topic in `remaining_topics` has received a
/// terminal event or `Stop` arrives, then closes the handler and reports
/// the outcome to `finished` — mirroring `_ThreadForBlockingSubscriber.run`:
/// a handler error is treated the same as an uncaught exception there (the
/// worker stops and the scheduler is told), not logged-and-ignored.
fn spawn_worker<E, H>(
    mut handler: H,
    rx: Receiver<BridgeMsg<E>>,
    mut remaining_topics: HashSet<String>,
    finished: Arc<dyn Fn(Result<()>) + Send + Sync>,
) -> JoinHandle<()>
where
    E: Send + 'static,
    H: BlockingSubscriber<E>,
{
    std::thread::spawn(move || {
        let result = (|| -> Result<()> {
            while let Ok(msg) = rx.recv() {
                match msg {
                    BridgeMsg::Next(topic, event) => handler.handle_next(&topic, event)?,
                    BridgeMsg::Completed(topic) => {
                        handler.handle_completed(&topic)?;
                        remaining_topics.remove(&topic);
                        if remaining_topics.is_empty() {
                            break;
                        }
                    }
                    BridgeMsg::Error(topic, err) => {
                        handler.handle_error(&topic, err)?;
                        remaining_topics.remove(&topic);
                        if remaining_topics.is_empty() {
                            break;
                        }
                    }
                    BridgeMsg::Stop => break,
                }
            }
            Ok(())
        })();
        handler.close();
        finished(result);
    })
}

impl<E> Subscriber<E> for BlockingSubscriberBridge<E>
where
    E: Send + 'static,
{
    fn has_topic(&self, sub_topic: &str) -> bool {
        self.topics.contains(sub_topic)
    }

    fn on_next(&mut self, sub_topic: &str, event: E) -> Result<()> {
        self.sender
            .send(BridgeMsg::Next(sub_topic.to_string(), event))
            .map_err(|_| FatalError::ScheduleError("blocking subscriber worker has exited".into()))
    }

    fn on_completed(&mut self, sub_topic: &str) -> Result<()> {
        self.sender
            .send(BridgeMsg::Completed(sub_topic.to_string()))
            .map_err(|_| FatalError::ScheduleError("blocking subscriber worker has exited".into()))
    }

    fn on_error(&mut self, sub_topic: &str, err: DynError) -> Result<()> {
        self.sender
            .send(BridgeMsg::Error(sub_topic.to_string(), err))
            .map_err(|_| FatalError::ScheduleError("blocking subscriber worker has exited".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::Publisher;
    use crate::topic::DEFAULT_TOPIC;
    use std::sync::{Arc, Mutex};

    struct Collector {
        events: Arc<Mutex<Vec<i32>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl BlockingSubscriber<i32> for Collector {
        fn handle_next(&mut self, _sub_topic: &str, event: i32) -> Result<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }

        fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    #[test]
    fn bridge_forwards_events_to_worker_thread() {
        let mut scheduler = Scheduler::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        let bridge = Arc::new(Mutex::new(BlockingSubscriberBridge::new(
            &mut scheduler,
            Collector {
                events: Arc::clone(&events),
                closed: Arc::clone(&closed),
            },
        )));

        let publisher: Publisher<i32> = Publisher::new(&[DEFAULT_TOPIC]);
        publisher.subscribe(Arc::clone(&bridge), None).unwrap();
        for x in 1..=3 {
            publisher.dispatch_next(DEFAULT_TOPIC, x).unwrap();
        }
        publisher.dispatch_completed(DEFAULT_TOPIC).unwrap();
        bridge.lock().unwrap().join();

        assert_eq!(*events.lock().unwrap(), vec![1, 2, 3]);
        assert!(*closed.lock().unwrap());
    }

    #[test]
    fn request_stop_exits_worker_before_completion() {
        let mut scheduler = Scheduler::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        let mut bridge = BlockingSubscriberBridge::with_capacity(
            &mut scheduler,
            Collector {
                events: Arc::clone(&events),
                closed: Arc::clone(&closed),
            },
            4,
        );
        bridge.request_stop();
        bridge.join();
        assert!(*closed.lock().unwrap());
    }

    #[test]
    fn worker_exits_only_after_every_declared_topic_closes() {
        let mut scheduler = Scheduler::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        let bridge = Arc::new(Mutex::new(BlockingSubscriberBridge::with_topics(
            &mut scheduler,
            Collector {
                events: Arc::clone(&events),
                closed: Arc::clone(&closed),
            },
            &["a", "b"],
        )));

        let publisher: Publisher<i32> = Publisher::new(&["a", "b"]);
        publisher
            .subscribe(Arc::clone(&bridge), Some(("a", "a")))
            .unwrap();
        publisher
            .subscribe(Arc::clone(&bridge), Some(("b", "b")))
            .unwrap();

        publisher.dispatch_completed("a").unwrap();
        publisher.dispatch_completed("b").unwrap();
        bridge.lock().unwrap().join();

        assert!(*closed.lock().unwrap());
    }

    struct FailingHandler;

    impl BlockingSubscriber<i32> for FailingHandler {
        fn handle_next(&mut self, _sub_topic: &str, _event: i32) -> Result<()> {
            Err(FatalError::ScheduleError("handler boom".into()))
        }
    }

    #[test]
    fn handler_error_reports_a_fatal_schedule_error_to_the_scheduler() {
        let mut scheduler = Scheduler::new();
        let bridge = Arc::new(Mutex::new(BlockingSubscriberBridge::new(
            &mut scheduler,
            FailingHandler,
        )));
        let publisher: Publisher<i32> = Publisher::new(&[DEFAULT_TOPIC]);
        publisher.subscribe(Arc::clone(&bridge), None).unwrap();
        publisher.dispatch_next(DEFAULT_TOPIC, 1).unwrap();

        let err = scheduler.run_forever().unwrap_err();
        assert!(matches!(err, FatalError::ScheduleError(_)));
        bridge.lock().unwrap().join();
    }
}
