//! Fan-out of fallible work units onto owned threads.
//!
//! A [`TaskGroup`] runs every submitted work unit on its own thread, remembers the first failure
//! and broadcasts *every* failure to the channels handed out by [`TaskGroup::subscribe`].
//! [`TaskGroup::wait`] joins all of it: it blocks until the work is done, flushes pending
//! broadcasts, closes every subscription and returns the first failure.

use std::{
    any::Any,
    collections::BTreeMap,
    fmt,
    panic::{self, resume_unwind, AssertUnwindSafe},
    sync::Arc,
    thread,
};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::{
    error::GroupError,
    sync::{Condvar, Mutex, MutexGuard},
};

type PanicPayload = Box<dyn Any + Send + 'static>;

/// A builder object that can be used to configure and create a [`TaskGroup`].
#[derive(Clone, Debug, Default)]
pub struct TaskGroupBuilder {
    name: Option<String>,
    capacity: usize,
}

impl TaskGroupBuilder {
    /// Sets the base name of the group.
    ///
    /// Task threads are named `{name}-task-{n}`, broadcast threads `{name}-deliver-{id}`. The name
    /// also shows up in log messages.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the channel capacity of every subscription created by [`TaskGroup::subscribe`].
    ///
    /// By default, a capacity of 0 is used: every failure is handed over to the subscriber
    /// directly, and [`TaskGroup::wait`] will not return before the subscriber has received all
    /// of them.
    ///
    /// With a larger capacity, failures are buffered in the channel and [`TaskGroup::wait`] can
    /// return before the subscriber has drained it.
    #[inline]
    pub fn capacity(self, capacity: usize) -> Self {
        Self { capacity, ..self }
    }

    /// Creates an empty [`TaskGroup`] with this configuration.
    pub fn build<E>(self) -> TaskGroup<E> {
        TaskGroup {
            shared: Arc::new(Shared {
                name: self.name,
                capacity: self.capacity,
                state: Mutex::new(State {
                    pending: 0,
                    in_flight: 0,
                    drain: Drain::Open,
                    first_error: None,
                    panic: None,
                    subscribers: BTreeMap::new(),
                    next_subscriber: 0,
                    next_task: 0,
                }),
                condvar: Condvar::new(),
            }),
        }
    }
}

/// The lifecycle stage of a [`TaskGroup`], as reported by [`TaskGroup::phase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No work is running and the group has not been drained.
    Idle,
    /// At least one work unit is still running.
    Running,
    /// All work has finished and [`TaskGroup::wait`] is closing the subscriptions.
    Draining,
    /// The group has been drained. No more work or subscriptions are accepted.
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drain {
    Open,
    Draining,
    Drained,
}

struct State<E> {
    /// Work units that have been spawned but not finished.
    pending: usize,
    /// Broadcast sends that have not completed yet.
    in_flight: usize,
    drain: Drain,
    first_error: Option<E>,
    /// Payload of the first work unit that panicked, forwarded by `wait`.
    panic: Option<PanicPayload>,
    subscribers: BTreeMap<u64, Sender<E>>,
    next_subscriber: u64,
    next_task: u64,
}

struct Shared<E> {
    name: Option<String>,
    capacity: usize,
    state: Mutex<State<E>>,
    /// Signaled whenever `pending` or `in_flight` drop to zero, and when the drain finishes.
    condvar: Condvar,
}

/// Runs work units concurrently and collects their failures.
///
/// Every call to [`TaskGroup::go`] spawns a thread for the work unit. If the unit returns an
/// error, the group records it as the group's result if it is the first one, and forwards it to
/// every subscriber registered with [`TaskGroup::subscribe`].
///
/// [`TaskGroup::wait`] blocks until all work units have finished and then *drains* the group:
/// it waits for every outstanding broadcast, closes all subscriptions and marks the group as
/// finished. A drained group rejects new work. If a work unit panicked, `wait` propagates the
/// panic to its caller after the drain.
///
/// `TaskGroup` is a cheap handle: clones refer to the same group, so work units may hold a clone
/// to submit more work.
pub struct TaskGroup<E> {
    shared: Arc<Shared<E>>,
}

impl TaskGroup<()> {
    /// Returns a builder that can be used to configure and create a [`TaskGroup`].
    #[inline]
    pub fn builder() -> TaskGroupBuilder {
        TaskGroupBuilder::default()
    }
}

impl<E> TaskGroup<E> {
    /// Creates an empty [`TaskGroup`] with default configuration.
    pub fn new() -> Self {
        TaskGroupBuilder::default().build()
    }

    /// Returns a channel that receives every failure reported after this call.
    ///
    /// Subscribe **before** submitting the work whose failures you need: failures that were
    /// reported earlier are not replayed. The channel is closed once the group has been drained
    /// by [`TaskGroup::wait`], so iterating over it terminates.
    ///
    /// The subscriber is expected to keep draining the channel. With the default capacity of 0,
    /// [`TaskGroup::wait`] only returns once every failure has been received (or the receiver
    /// has been dropped). A slow subscriber never delays other subscribers or the work units.
    ///
    /// If the group is already draining or drained, the returned channel is closed and will
    /// never yield anything.
    pub fn subscribe(&self) -> Receiver<E> {
        let (sender, receiver) = crossbeam_channel::bounded(self.shared.capacity);
        let mut state = self.shared.state.lock();
        if state.drain != Drain::Open {
            log::debug!(
                "'{}' no longer accepts subscribers, handing out a closed channel",
                self.shared.label()
            );
            return receiver;
        }

        let id = state.next_subscriber;
        state.next_subscriber += 1;
        state.subscribers.insert(id, sender);
        log::debug!("'{}' registered subscriber {id}", self.shared.label());
        receiver
    }

    /// Returns the number of work units that have been started but not finished.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending
    }

    /// Returns the number of open subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.shared.state.lock().subscribers.len()
    }

    /// Returns the current [`Phase`] of the group.
    pub fn phase(&self) -> Phase {
        let state = self.shared.state.lock();
        match state.drain {
            Drain::Open if state.pending > 0 => Phase::Running,
            Drain::Open => Phase::Idle,
            Drain::Draining => Phase::Draining,
            Drain::Drained => Phase::Drained,
        }
    }
}

impl<E: Clone> TaskGroup<E> {
    /// Blocks until every work unit has finished, then drains the group.
    ///
    /// Returns the first failure reported by any work unit, or `Ok(())` if all of them succeeded.
    /// "First" is decided by whichever failing unit reported first, not by submission order.
    ///
    /// The drain happens exactly once. Calling `wait` again (or from several threads) is fine:
    /// later callers block until the drain is complete and then return the same result.
    ///
    /// If a work unit panicked, the panic is resumed on the calling thread once the group is
    /// drained. Only the first panic is forwarded, and only to one caller of `wait`.
    pub fn wait(&self) -> Result<(), E> {
        let mut state = self.shared.drain();
        let panic = state.panic.take();
        let result = match &state.first_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        };
        drop(state);

        if let Some(payload) = panic {
            resume_unwind(payload);
        }
        result
    }
}

impl<E: Clone + Send + 'static> TaskGroup<E> {
    /// Runs `work` on a new thread.
    ///
    /// This does not wait for `work` to start or finish. If `work` returns an error, it is
    /// recorded (see [`TaskGroup::wait`]) and sent to every current subscriber.
    ///
    /// # Errors
    ///
    /// Returns [`GroupError::Drained`] if [`TaskGroup::wait`] has already drained the group, and
    /// [`GroupError::Spawn`] if the thread could not be spawned. In both cases `work` is dropped
    /// without being run.
    pub fn go<F>(&self, work: F) -> Result<(), GroupError>
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
    {
        let task = {
            let mut state = self.shared.state.lock();
            if state.drain != Drain::Open {
                return Err(GroupError::Drained);
            }
            state.pending += 1;
            state.next_task += 1;
            state.next_task
        };

        let shared = self.shared.clone();
        let spawned = self.shared.thread_builder("task", task).spawn(move || {
            let _guard = TaskGuard {
                shared: &*shared,
                task,
            };
            log::trace!("'{}' task {task} starting", shared.label());
            match panic::catch_unwind(AssertUnwindSafe(work)) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => shared.report(error),
                Err(payload) => shared.record_panic(task, payload),
            }
        });

        if let Err(err) = spawned {
            self.shared.finish_task();
            return Err(err.into());
        }
        Ok(())
    }
}

impl<E> Clone for TaskGroup<E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<E> Default for TaskGroup<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for TaskGroup<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroup")
            .field("name", &self.shared.name)
            .field("capacity", &self.shared.capacity)
            .field("phase", &self.phase())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl<E> Shared<E> {
    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }

    fn thread_builder(&self, kind: &str, index: u64) -> thread::Builder {
        let mut builder = thread::Builder::new();
        if let Some(name) = &self.name {
            builder = builder.name(format!("{name}-{kind}-{index}"));
        }
        builder
    }

    fn finish_task(&self) {
        let mut state = self.state.lock();
        state.pending -= 1;
        if state.pending == 0 {
            self.condvar.notify_all();
        }
    }

    fn finish_delivery(&self) {
        let mut state = self.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.condvar.notify_all();
        }
    }

    fn record_panic(&self, task: u64, payload: PanicPayload) {
        let mut state = self.state.lock();
        if state.panic.is_none() {
            log::debug!("'{}' task {task} panicked", self.label());
            state.panic = Some(payload);
        } else {
            log::debug!(
                "'{}' task {task} panicked, but an earlier panic is already pending",
                self.label()
            );
        }
    }

    /// Runs the drain sequence (or waits for another thread to finish it) and returns the locked,
    /// drained state.
    fn drain(&self) -> MutexGuard<'_, State<E>> {
        let mut state = self.condvar.wait_while(self.state.lock(), |s| s.pending > 0);
        match state.drain {
            Drain::Open => {
                state.drain = Drain::Draining;
                log::debug!(
                    "draining '{}' ({} broadcasts in flight, {} subscribers)",
                    self.label(),
                    state.in_flight,
                    state.subscribers.len(),
                );
                // No new broadcasts can start: all tasks are done and `go` is now rejected.
                state = self.condvar.wait_while(state, |s| s.in_flight > 0);
                // Dropping the last `Sender` closes each subscription.
                state.subscribers.clear();
                state.drain = Drain::Drained;
                self.condvar.notify_all();
            }
            Drain::Draining => {
                state = self.condvar.wait_while(state, |s| s.drain != Drain::Drained);
            }
            Drain::Drained => {}
        }
        state
    }
}

impl<E: Clone + Send + 'static> Shared<E> {
    fn report(self: &Arc<Self>, error: E) {
        let targets: Vec<(u64, Sender<E>)> = {
            let mut state = self.state.lock();
            if state.first_error.is_none() {
                state.first_error = Some(error.clone());
            }
            let targets: Vec<_> = state
                .subscribers
                .iter()
                .map(|(&id, sender)| (id, sender.clone()))
                .collect();
            // Counted before the reporting task finishes, so the drain cannot miss them.
            state.in_flight += targets.len();
            targets
        };

        for (id, sender) in targets {
            self.deliver(id, sender, error.clone());
        }
    }

    /// Sends `error` to one subscriber without blocking the caller.
    ///
    /// If the channel can take the value right away it is sent inline, otherwise a dedicated
    /// thread performs the blocking send.
    fn deliver(self: &Arc<Self>, subscriber: u64, sender: Sender<E>, error: E) {
        let error = match sender.try_send(error) {
            Ok(()) => {
                drop(sender);
                self.finish_delivery();
                return;
            }
            Err(TrySendError::Disconnected(_)) => {
                log::debug!(
                    "'{}' subscriber {subscriber} is gone, dropping failure",
                    self.label()
                );
                drop(sender);
                self.finish_delivery();
                return;
            }
            Err(TrySendError::Full(error)) => error,
        };

        let shared = self.clone();
        let spawned = self
            .thread_builder("deliver", subscriber)
            .spawn(move || {
                if sender.send(error).is_err() {
                    log::debug!(
                        "'{}' subscriber {subscriber} is gone, dropping failure",
                        shared.label()
                    );
                }
                drop(sender);
                shared.finish_delivery();
            });

        if let Err(err) = spawned {
            log::error!(
                "'{}' could not spawn a thread to notify subscriber {subscriber}: {err}",
                self.label()
            );
            self.finish_delivery();
        }
    }
}

/// Marks a task as finished when dropped, including when the task thread unwinds.
struct TaskGuard<'a, E> {
    shared: &'a Shared<E>,
    task: u64,
}

impl<E> Drop for TaskGuard<'_, E> {
    fn drop(&mut self) {
        log::trace!("'{}' task {} exiting", self.shared.label(), self.task);
        self.shared.finish_task();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::catch_unwind,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use crossbeam_channel::{RecvError, RecvTimeoutError};

    use super::*;
    use crate::test::{assert_send_sync, collect_sorted, silent_panic};

    fn wait_until_idle<E>(group: &TaskGroup<E>) {
        while group.pending() > 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn wait_without_work_succeeds() {
        let group = TaskGroup::<i32>::new();
        assert_eq!(group.phase(), Phase::Idle);
        assert_eq!(group.wait(), Ok(()));
        assert_eq!(group.phase(), Phase::Drained);
    }

    #[test]
    fn runs_every_work_unit() {
        let group = TaskGroup::<i32>::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let count = count.clone();
            group
                .go(move || {
                    count.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                })
                .unwrap();
        }

        assert_eq!(group.wait(), Ok(()));
        assert_eq!(count.load(Ordering::Relaxed), 10);
        assert_eq!(group.pending(), 0);
    }

    #[test]
    fn wait_returns_one_of_the_failures() {
        let group = TaskGroup::new();
        for i in 0..10 {
            group
                .go(move || if i % 3 == 0 { Err(i) } else { Ok(()) })
                .unwrap();
        }

        let error = group.wait().unwrap_err();
        assert!([0, 3, 6, 9].contains(&error), "unexpected error {error}");
    }

    #[test]
    fn subscriber_receives_every_failure() {
        let group = TaskGroup::new();
        let collector = collect_sorted(group.subscribe());
        for i in 0..10 {
            group.go(move || Err(i)).unwrap();
        }

        assert!(group.wait().is_err());
        assert_eq!(collector.join().unwrap(), (0..10).collect::<Vec<_>>());
        assert_eq!(group.subscriber_count(), 0);
    }

    #[test]
    fn failures_are_broadcast_to_all_subscribers() {
        let group = TaskGroup::new();
        let collectors: Vec<_> = (0..3).map(|_| collect_sorted(group.subscribe())).collect();
        assert_eq!(group.subscriber_count(), 3);
        for i in 0..5 {
            group.go(move || Err(i)).unwrap();
            group.go(|| Ok(())).unwrap();
        }

        assert!(group.wait().is_err());
        for collector in collectors {
            assert_eq!(collector.join().unwrap(), [0, 1, 2, 3, 4]);
        }
    }

    #[test]
    fn slow_subscriber_does_not_block_others() {
        let group = TaskGroup::new();
        let slow = group.subscribe();
        let fast = group.subscribe();
        for i in 0..5 {
            group.go(move || Err(i)).unwrap();
        }

        let mut seen: Vec<i32> = (0..5).map(|_| fast.recv().unwrap()).collect();
        seen.sort();
        assert_eq!(seen, [0, 1, 2, 3, 4]);

        // Every work unit finishes even though `slow` has not received anything yet.
        wait_until_idle(&group);

        let slow = collect_sorted(slow);
        let fast = collect_sorted(fast);
        assert!(group.wait().is_err());
        assert_eq!(slow.join().unwrap(), [0, 1, 2, 3, 4]);
        assert!(fast.join().unwrap().is_empty());
    }

    #[test]
    fn subscription_closes_only_after_drain() {
        let group = TaskGroup::new();
        let errors = group.subscribe();
        group.go(|| Err(1)).unwrap();

        assert_eq!(errors.recv(), Ok(1));
        assert_eq!(
            errors.recv_timeout(Duration::from_millis(20)),
            Err(RecvTimeoutError::Timeout)
        );

        assert_eq!(group.wait(), Err(1));
        assert_eq!(errors.recv(), Err(RecvError));
    }

    #[test]
    fn late_subscriber_misses_earlier_failures() {
        let group = TaskGroup::new();
        group.go(|| Err(1)).unwrap();
        wait_until_idle(&group);

        let collector = collect_sorted(group.subscribe());
        assert_eq!(group.wait(), Err(1));
        assert!(collector.join().unwrap().is_empty());
    }

    #[test]
    fn subscribing_after_drain_yields_closed_channel() {
        let group = TaskGroup::<i32>::new();
        group.wait().unwrap();

        let errors = group.subscribe();
        assert_eq!(errors.recv(), Err(RecvError));
        assert_eq!(group.subscriber_count(), 0);
    }

    #[test]
    fn repeated_wait_returns_remembered_result() {
        let group = TaskGroup::new();
        group.go(|| Err("boom")).unwrap();
        assert_eq!(group.wait(), Err("boom"));
        assert_eq!(group.wait(), Err("boom"));
    }

    #[test]
    fn concurrent_waiters_see_same_result() {
        let group = TaskGroup::new();
        let (release, gate) = crossbeam_channel::bounded::<()>(0);
        group
            .go(move || {
                gate.recv().ok();
                Err(5)
            })
            .unwrap();

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let group = group.clone();
                thread::spawn(move || group.wait())
            })
            .collect();
        release.send(()).unwrap();

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Err(5));
        }
    }

    #[test]
    fn go_after_drain_is_rejected() {
        let group = TaskGroup::<i32>::new();
        group.wait().unwrap();
        assert!(matches!(group.go(|| Ok(())), Err(GroupError::Drained)));
        assert_eq!(group.pending(), 0);
    }

    #[test]
    fn dropped_subscriber_does_not_stall_wait() {
        let group = TaskGroup::new();
        drop(group.subscribe());
        for i in 0..3 {
            group.go(move || Err(i)).unwrap();
        }
        assert!(group.wait().is_err());
    }

    #[test]
    fn buffered_subscription_needs_no_consumer() {
        let group = TaskGroup::builder().capacity(16).build();
        let errors = group.subscribe();
        for i in 0..10 {
            group.go(move || Err(i)).unwrap();
        }

        assert!(group.wait().is_err());
        let mut all: Vec<i32> = errors.iter().collect();
        all.sort();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn panic_is_forwarded_to_waiter() {
        let group = TaskGroup::<i32>::new();
        group
            .go(|| {
                silent_panic("task panic".into());
                Ok(())
            })
            .unwrap();
        group.go(|| Err(3)).unwrap();

        catch_unwind(AssertUnwindSafe(|| group.wait())).unwrap_err();
        assert_eq!(group.pending(), 0);
        assert_eq!(group.wait(), Err(3));
    }

    #[test]
    fn work_can_submit_more_work() {
        let group = TaskGroup::new();
        let inner = group.clone();
        group
            .go(move || {
                inner.go(|| Err(2)).unwrap();
                Ok(())
            })
            .unwrap();

        assert_eq!(group.wait(), Err(2));
    }

    #[test]
    fn phase_tracks_running_work() {
        let group = TaskGroup::<i32>::new();
        let (release, gate) = crossbeam_channel::bounded::<()>(0);
        group
            .go(move || {
                gate.recv().ok();
                Ok(())
            })
            .unwrap();

        assert_eq!(group.phase(), Phase::Running);
        assert_eq!(group.pending(), 1);
        release.send(()).unwrap();
        assert_eq!(group.wait(), Ok(()));
        assert_eq!(group.phase(), Phase::Drained);
    }

    #[test]
    fn named_group_names_task_threads() {
        let group = TaskGroup::builder().name("fanout").build();
        group
            .go(|| match thread::current().name() {
                Some("fanout-task-1") => Ok(()),
                other => Err(format!("{other:?}")),
            })
            .unwrap();

        assert_eq!(group.wait(), Ok(()));
    }

    #[test]
    fn group_is_send_sync() {
        assert_send_sync::<TaskGroup<String>>();
    }
}
