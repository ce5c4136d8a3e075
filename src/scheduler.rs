//! The cooperative event loop: a timer min-heap plus a thread-safe
//! trampoline, driving the five scheduling disciplines.
//!
//! Grounded in `antevents/base.py`'s `Scheduler`, `_ThreadForIndirectPublisher`,
//! and `_ThreadForBlockingSubscriber`. Where the original wraps an asyncio
//! event loop (`call_soon`/`call_later`/`call_soon_threadsafe`), this is the
//! hand-rolled Rust rendering: a `BinaryHeap<TimerEntry>` keyed by
//! `Instant` deadline stands in for `call_later`, and a single
//! `mpsc::Receiver<SchedulerEvent>`, drained and blocked on at the top of
//! every iteration, stands in for `call_soon_threadsafe` — carrying both
//! posted dispatch tasks and worker-thread completion/failure reports, so
//! the loop never blocks on one while the other has something waiting.

use crate::error::{FatalError, Result};
use crate::publisher::EnqueueFn;
use crate::sources::{DirectSource, IndirectSource, PrivateLoopSource};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identifies one call to a `schedule_*` method, for later cancellation via
/// [`Scheduler::unschedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduleId(u64);

/// How to cancel one active schedule. A `Timer` schedule is removed from
/// the timer heap and task table; a `Stop` schedule (backed by a worker
/// thread) is asked to exit via its stop callback — the REDESIGN FLAGS
/// tagged-variant rendering of the original's duck-typed "either an event
/// handle with `.cancel()`, or a thunk to call directly".
enum ScheduleHandle {
    Timer,
    Stop(Arc<dyn Fn() + Send + Sync>),
}

trait ScheduledTask: Send {
    /// Run one tick. `Ok(Some(delay))` reschedules after `delay`;
    /// `Ok(None)` retires the schedule; `Err` is fatal.
    fn tick(&mut self) -> Result<Option<Duration>>;
}

struct RecurringTask<S> {
    source: S,
}

impl<S: DirectSource + Send> ScheduledTask for RecurringTask<S> {
    fn tick(&mut self) -> Result<Option<Duration>> {
        Ok(self.source.observe()?.then_some(Duration::ZERO))
    }
}

struct PeriodicTask<S> {
    source: S,
    interval: Duration,
}

impl<S: DirectSource + Send> ScheduledTask for PeriodicTask<S> {
    fn tick(&mut self) -> Result<Option<Duration>> {
        Ok(self.source.observe()?.then_some(self.interval))
    }
}

struct OneTimeTask<S> {
    source: S,
}

impl<S: DirectSource + Send> ScheduledTask for OneTimeTask<S> {
    fn tick(&mut self) -> Result<Option<Duration>> {
        self.source.observe()?;
        Ok(None)
    }
}

struct TimerEntry {
    deadline: Instant,
    id: ScheduleId,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

type Task = Box<dyn FnOnce() -> Result<()> + Send>;

/// Everything that can wake the main loop: a posted dispatch task from the
/// trampoline, or a worker thread reporting that its schedule finished (or
/// died). Unified into one channel so `run_forever`'s blocking wait never
/// misses a worker's completion while parked waiting on dispatch traffic —
/// two separate channels meant a worker-only schedule with nothing pending
/// on the trampoline could finish and never wake the main loop up to notice.
enum SchedulerEvent {
    Task(Task),
    Finished(ScheduleId, Result<()>),
}

/// Mixes a single-threaded cooperative loop (timer-driven direct sources)
/// with auxiliary worker threads (indirect/private-loop sources, blocking
/// sinks), bridged back to the main thread by a thread-safe trampoline.
pub struct Scheduler {
    tasks: HashMap<ScheduleId, Box<dyn ScheduledTask>>,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    active_schedules: HashMap<ScheduleId, ScheduleHandle>,
    event_tx: Sender<SchedulerEvent>,
    event_rx: Receiver<SchedulerEvent>,
    next_id: u64,
    fatal_error: Option<FatalError>,
    stop_requested: bool,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::channel();
        Scheduler {
            tasks: HashMap::new(),
            timers: BinaryHeap::new(),
            active_schedules: HashMap::new(),
            event_tx,
            event_rx,
            next_id: 0,
            fatal_error: None,
            stop_requested: false,
        }
    }

    fn next_id(&mut self) -> ScheduleId {
        self.next_id += 1;
        ScheduleId(self.next_id)
    }

    /// A thread-safe trampoline a worker thread can use to post a task
    /// back onto this scheduler's main loop. Hand to a publisher's
    /// `schedule_attach` before moving its source onto a worker thread.
    pub fn enqueue_fn(&self) -> EnqueueFn {
        let tx = self.event_tx.clone();
        Arc::new(move |task| {
            let _ = tx.send(SchedulerEvent::Task(task));
        })
    }

    /// A sender worker threads use to report that their schedule finished
    /// (`Ok`) or died (`Err`), on the same channel as dispatch tasks so the
    /// main loop always wakes up to see it.
    fn finished_sender(&self) -> Sender<SchedulerEvent> {
        self.event_tx.clone()
    }

    fn schedule_direct(&mut self, task: Box<dyn ScheduledTask>, first_delay: Duration) -> ScheduleId {
        let id = self.next_id();
        let deadline = Instant::now() + first_delay;
        self.tasks.insert(id, task);
        self.timers.push(Reverse(TimerEntry { deadline, id }));
        self.active_schedules.insert(id, ScheduleHandle::Timer);
        id
    }

    /// Repeatedly calls `source.observe()`, requeuing immediately (`call_soon`
    /// style) as long as it returns `Ok(true)`. Only appropriate for a
    /// source whose `observe()` never blocks.
    pub fn schedule_recurring<S>(&mut self, source: S) -> ScheduleId
    where
        S: DirectSource + Send + 'static,
    {
        self.schedule_direct(Box::new(RecurringTask { source }), Duration::ZERO)
    }

    /// Like [`Scheduler::schedule_recurring`], but requeues after `interval`
    /// rather than immediately.
    pub fn schedule_periodic<S>(&mut self, source: S, interval: Duration) -> ScheduleId
    where
        S: DirectSource + Send + 'static,
    {
        self.schedule_direct(Box::new(PeriodicTask { source, interval }), interval)
    }

    /// Calls `source.observe()` exactly once, after `delay`.
    pub fn schedule_later_one_time<S>(&mut self, source: S, delay: Duration) -> ScheduleId
    where
        S: DirectSource + Send + 'static,
    {
        self.schedule_direct(Box::new(OneTimeTask { source }), delay)
    }

    /// Runs `source.observe_and_enqueue()` on a dedicated worker thread,
    /// sleeping out the remainder of `interval` between calls. `attach` is
    /// called once, synchronously, with the trampoline `EnqueueFn` this
    /// source's publisher should route its dispatches through (since the
    /// scheduler has no way to reach into a generic `Publisher<E>` itself).
    pub fn schedule_periodic_on_separate_thread<S>(
        &mut self,
        mut source: S,
        attach: impl FnOnce(EnqueueFn) + Send + 'static,
        interval: Duration,
    ) -> ScheduleId
    where
        S: IndirectSource + 'static,
    {
        let id = self.next_id();
        let enqueue_fn = self.enqueue_fn();
        let finished_tx = self.finished_sender();
        let stop_requested = Arc::new(AtomicBool::new(false));
        let stop_requested_worker = Arc::clone(&stop_requested);
        attach(enqueue_fn);
        std::thread::spawn(move || {
            let result = (|| -> Result<()> {
                loop {
                    if stop_requested_worker.load(Ordering::Relaxed) {
                        return Ok(());
                    }
                    let start = Instant::now();
                    if !source.observe_and_enqueue()? {
                        return Ok(());
                    }
                    let elapsed = start.elapsed();
                    if elapsed < interval {
                        std::thread::sleep(interval - elapsed);
                    }
                }
            })();
            let _ = finished_tx.send(SchedulerEvent::Finished(id, result));
        });
        self.active_schedules.insert(
            id,
            ScheduleHandle::Stop(Arc::new(move || {
                stop_requested.store(true, Ordering::Relaxed);
            })),
        );
        id
    }

    /// Runs `source.run_loop()` on a dedicated worker thread until it
    /// returns (or `unschedule` calls its stop handle). `attach` wires the
    /// trampoline into the source's own publisher, same as
    /// `schedule_periodic_on_separate_thread`.
    pub fn schedule_on_private_event_loop<S>(
        &mut self,
        mut source: S,
        attach: impl FnOnce(EnqueueFn) + Send + 'static,
    ) -> ScheduleId
    where
        S: PrivateLoopSource + 'static,
    {
        let id = self.next_id();
        let enqueue_fn = self.enqueue_fn();
        let finished_tx = self.finished_sender();
        let stop_handle = source.stop_handle();
        attach(enqueue_fn);
        std::thread::spawn(move || {
            let result = source.run_loop();
            let _ = finished_tx.send(SchedulerEvent::Finished(id, result));
        });
        self.active_schedules.insert(id, ScheduleHandle::Stop(stop_handle));
        id
    }

    /// Registers an externally-driven worker (e.g. a blocking-subscriber
    /// bridge's dedicated thread) as an active schedule: the scheduler
    /// counts it toward `run_forever`'s "something still running" check and
    /// asks it to stop via `stop_handle` when the scheduler itself stops.
    /// Returns the callback the worker must call exactly once, on exit, with
    /// its outcome — `Err` is treated as a fatal schedule error, same as a
    /// private-event-loop source's worker dying, mirroring the original's
    /// `_ThreadForBlockingSubscriber.run`'s `die()`/`done()`.
    pub fn register_external_worker(
        &mut self,
        stop_handle: Arc<dyn Fn() + Send + Sync>,
    ) -> (ScheduleId, Arc<dyn Fn(Result<()>) + Send + Sync>) {
        let id = self.next_id();
        self.active_schedules.insert(id, ScheduleHandle::Stop(stop_handle));
        let finished_tx = self.finished_sender();
        let finished = Arc::new(move |result: Result<()>| {
            let _ = finished_tx.send(SchedulerEvent::Finished(id, result));
        });
        (id, finished)
    }

    /// Cancel an active schedule. Matches the original's `cancel()` thunks:
    /// an error if `id` has no active schedule (already retired or never
    /// valid).
    pub fn unschedule(&mut self, id: ScheduleId) -> Result<()> {
        match self.active_schedules.remove(&id) {
            Some(ScheduleHandle::Timer) => {
                self.tasks.remove(&id);
                Ok(())
            }
            Some(ScheduleHandle::Stop(stop)) => {
                stop();
                Ok(())
            }
            None => Err(FatalError::ScheduleError(format!(
                "attempt to unschedule {id:?}, which has no active schedule"
            ))),
        }
    }

    fn run_task(&mut self, task: Task) {
        if let Err(fatal) = task() {
            self.fatal_error = Some(fatal);
            self.stop();
        }
    }

    fn handle_finished(&mut self, id: ScheduleId, result: Result<()>) {
        self.active_schedules.remove(&id);
        if let Err(fatal) = result {
            self.fatal_error = Some(fatal);
            self.stop();
        }
    }

    fn handle_event(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Task(task) => self.run_task(task),
            SchedulerEvent::Finished(id, result) => self.handle_finished(id, result),
        }
    }

    fn drain_trampoline(&mut self) {
        while let Ok(event) = self.event_rx.try_recv() {
            self.handle_event(event);
            if self.stop_requested {
                return;
            }
        }
    }

    /// Run until every schedule has retired, `stop()` is called (directly,
    /// or indirectly via a fatal error), or there is nothing left to wait
    /// on. Returns the fatal error, if the loop exited because of one.
    pub fn run_forever(&mut self) -> Result<()> {
        loop {
            self.drain_trampoline();
            if self.stop_requested || self.active_schedules.is_empty() {
                break;
            }

            let next_deadline = self.timers.peek().map(|Reverse(entry)| entry.deadline);
            match next_deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline > now {
                        match self.event_rx.recv_timeout(deadline - now) {
                            Ok(event) => self.handle_event(event),
                            Err(mpsc::RecvTimeoutError::Timeout) => {}
                            Err(mpsc::RecvTimeoutError::Disconnected) => {}
                        }
                        continue;
                    }
                    let Reverse(entry) = self.timers.pop().expect("peeked entry must pop");
                    if !matches!(self.active_schedules.get(&entry.id), Some(ScheduleHandle::Timer)) {
                        continue; // cancelled since it was scheduled
                    }
                    let mut task = match self.tasks.remove(&entry.id) {
                        Some(task) => task,
                        None => continue,
                    };
                    match task.tick() {
                        Ok(Some(delay)) => {
                            self.timers.push(Reverse(TimerEntry {
                                deadline: Instant::now() + delay,
                                id: entry.id,
                            }));
                            self.tasks.insert(entry.id, task);
                        }
                        Ok(None) => {
                            self.active_schedules.remove(&entry.id);
                        }
                        Err(fatal) => {
                            self.fatal_error = Some(fatal);
                            self.stop();
                        }
                    }
                }
                None => match self.event_rx.recv() {
                    Ok(event) => self.handle_event(event),
                    Err(_) => break,
                },
            }
        }
        match self.fatal_error.take() {
            Some(fatal) => Err(fatal),
            None => Ok(()),
        }
    }

    /// Retire every active schedule (cancelling timers, asking worker
    /// threads to stop) and make `run_forever` return on its next
    /// iteration.
    pub fn stop(&mut self) {
        for (_, handle) in self.active_schedules.drain() {
            if let ScheduleHandle::Stop(stop) = handle {
                stop();
            }
        }
        self.tasks.clear();
        self.timers.clear();
        self.stop_requested = true;
    }

    /// A caller's own interrupt handler (installing one is out of this
    /// crate's scope) can call this to print the active schedules before
    /// re-raising, matching the original's keyboard-interrupt behavior.
    pub fn dump_active_schedules(&self) -> String {
        if self.active_schedules.is_empty() {
            return "(no active schedules)".to_string();
        }
        self.active_schedules
            .keys()
            .map(|id| format!("{id:?}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::Publisher;
    use crate::sources::IterableSource;
    use crate::subscriber::ClosureSubscriber;
    use crate::topic::DEFAULT_TOPIC;
    use std::sync::Mutex;

    #[test]
    fn basic_periodic_pull_drains_an_iterable_source() {
        let mut scheduler = Scheduler::new();
        let mut source = IterableSource::new(vec![1, 2, 3].into_iter());
        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = Arc::clone(&received);
        let sink = Arc::new(Mutex::new(ClosureSubscriber::new(move |x: i32| {
            received2.lock().unwrap().push(x);
            Ok(())
        })));
        source.publisher().subscribe(sink, None).unwrap();

        scheduler.schedule_recurring(source);
        scheduler.run_forever().unwrap();

        assert_eq!(*received.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn slow_source_periodic_still_drains_fully() {
        let mut scheduler = Scheduler::new();
        let source = IterableSource::new(vec![1, 2].into_iter());
        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = Arc::clone(&received);
        let sink = Arc::new(Mutex::new(ClosureSubscriber::new(move |x: i32| {
            received2.lock().unwrap().push(x);
            Ok(())
        })));
        source.publisher().subscribe(sink, None).unwrap();

        scheduler.schedule_periodic(source, Duration::from_millis(5));
        scheduler.run_forever().unwrap();

        assert_eq!(*received.lock().unwrap(), vec![1, 2]);
    }

    struct FailingSource {
        fired: bool,
    }

    impl DirectSource for FailingSource {
        fn observe(&mut self) -> Result<bool> {
            if self.fired {
                return Ok(false);
            }
            self.fired = true;
            Err(FatalError::ScheduleError("boom from private loop".into()))
        }
    }

    struct OnceLoop {
        source: FailingSource,
        stop: Arc<AtomicBool>,
    }

    impl PrivateLoopSource for OnceLoop {
        fn run_loop(&mut self) -> Result<()> {
            self.source.observe()?;
            Ok(())
        }

        fn stop_handle(&self) -> Arc<dyn Fn() + Send + Sync> {
            let stop = Arc::clone(&self.stop);
            Arc::new(move || stop.store(true, Ordering::Relaxed))
        }
    }

    #[test]
    fn fatal_error_in_private_loop_stops_the_scheduler() {
        let mut scheduler = Scheduler::new();
        let publisher: Publisher<i32> = Publisher::new(&[DEFAULT_TOPIC]);
        let source = FailingSource { fired: false };
        let loop_source = OnceLoop {
            source,
            stop: Arc::new(AtomicBool::new(false)),
        };
        scheduler.schedule_on_private_event_loop(loop_source, move |enqueue_fn| {
            publisher.schedule_attach(None, Some(enqueue_fn));
        });

        let err = scheduler.run_forever().unwrap_err();
        assert!(matches!(err, FatalError::ScheduleError(_)));
    }

    #[test]
    fn unschedule_unknown_id_is_an_error() {
        let mut scheduler = Scheduler::new();
        let err = scheduler.unschedule(ScheduleId(999)).unwrap_err();
        assert!(matches!(err, FatalError::ScheduleError(_)));
    }

    #[test]
    fn empty_scheduler_returns_promptly() {
        let mut scheduler = Scheduler::new();
        scheduler.run_forever().unwrap();
    }
}
