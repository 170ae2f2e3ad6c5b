// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The parallel-pipeline primitive: a scoped worker pool that fans a round
//! of independent sub-range tasks out to its threads and fans their partial
//! outputs back in to the invoking thread.

use crossbeam_utils::CachePadded;
use std::cell::Cell;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{Scope, ScopedJoinHandle};

/// A builder for [`ThreadPool`].
pub struct ThreadPoolBuilder {
    /// Number of worker threads to spawn in the pool.
    pub num_threads: NonZeroUsize,
}

impl ThreadPoolBuilder {
    /// Spawns a scoped thread pool whose workers each run the reducer
    /// produced by `new_reducer`, and passes the pool to `f`.
    ///
    /// Tying the pool to a [`std::thread::scope`] lets tasks borrow data
    /// from the caller's environment, such as a benchmark fixture built
    /// before the pool.
    ///
    /// ```rust
    /// # use squarebench::{TaskReducer, ThreadPoolBuilder};
    /// # use std::num::NonZeroUsize;
    /// /// Sums the values of one sub-slice.
    /// struct SumReducer;
    ///
    /// impl TaskReducer<&[u64], u64> for SumReducer {
    ///     fn process(&self, task: &[u64]) -> u64 {
    ///         task.iter().sum()
    ///     }
    /// }
    ///
    /// let input = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
    /// let pool_builder = ThreadPoolBuilder {
    ///     num_threads: NonZeroUsize::try_from(4).unwrap(),
    /// };
    /// let sum: u64 = pool_builder.scope(
    ///     || SumReducer,
    ///     |thread_pool| thread_pool.process_tasks(input.chunks(3)).sum(),
    /// );
    /// assert_eq!(sum, 5 * 11);
    /// ```
    pub fn scope<Task: Send, Output: Send, Red, R>(
        &self,
        new_reducer: impl Fn() -> Red,
        f: impl FnOnce(ThreadPool<Task, Output>) -> R,
    ) -> R
    where
        Red: TaskReducer<Task, Output> + Send,
    {
        std::thread::scope(|scope| {
            let thread_pool = ThreadPool::new(scope, self.num_threads, new_reducer);
            f(thread_pool)
        })
    }
}

/// Trait representing a function that reduces one task into one output.
///
/// One reducer instance is created per worker thread; each round, a worker
/// holding a task processes it into a partial output.
pub trait TaskReducer<Task, Output> {
    /// Reduces the given task into an output.
    fn process(&self, task: Task) -> Output;
}

/// Status of the main thread.
#[derive(Clone, Copy, PartialEq, Eq)]
enum MainStatus {
    /// The main thread is waiting for the worker threads to finish a round.
    Waiting,
    /// The main thread is ready to prepare the next round.
    Ready,
    /// One of the worker threads panicked.
    WorkerPanic,
}

/// Status sent to the worker threads.
#[derive(Clone, Copy, PartialEq, Eq)]
enum WorkerStatus {
    /// The threads need to compute a round of the given color.
    Round(RoundColor),
    /// There is nothing more to do and the threads must exit.
    Finished,
}

/// A 2-element enumeration to distinguish successive rounds. The "colors"
/// are only illustrative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundColor {
    Blue,
    Red,
}

impl RoundColor {
    /// Flips to the other color.
    fn toggle(&mut self) {
        *self = match self {
            RoundColor::Blue => RoundColor::Red,
            RoundColor::Red => RoundColor::Blue,
        }
    }
}

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Attempts to set the status to the given value and notifies one
    /// waiting thread.
    ///
    /// Fails if the [`Mutex`] is poisoned.
    fn try_notify_one(&self, t: T) -> Result<(), PoisonError<MutexGuard<'_, T>>> {
        *self.mutex.lock()? = t;
        self.condvar.notify_one();
        Ok(())
    }

    /// If the predicate is true on this status, sets the status to the given
    /// value and notifies one waiting thread.
    fn notify_one_if(&self, predicate: impl Fn(&T) -> bool, t: T) {
        let mut locked = self.mutex.lock().unwrap();
        if predicate(&*locked) {
            *locked = t;
            self.condvar.notify_one();
        }
    }

    /// Sets the status to the given value and notifies all waiting threads.
    fn notify_all(&self, t: T) {
        *self.mutex.lock().unwrap() = t;
        self.condvar.notify_all();
    }

    /// Waits until the predicate is true on this status.
    ///
    /// This returns a [`MutexGuard`], allowing to further inspect or modify
    /// the status.
    fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<'_, T> {
        self.condvar
            .wait_while(self.mutex.lock().unwrap(), predicate)
            .unwrap()
    }
}

/// A thread pool tied to a scope, that can process rounds of tasks into
/// outputs of the given types.
///
/// Within a round, tasks have no dependencies on each other and may execute
/// in any order or interleaving; the fan-in step waits for all workers
/// before yielding any partial output.
pub struct ThreadPool<'scope, Task, Output> {
    /// Handles to all the worker threads in the pool.
    threads: Vec<WorkerThreadHandle<'scope, Task, Output>>,
    /// Number of worker threads active in the current round.
    num_active_threads: Arc<CachePadded<AtomicUsize>>,
    /// Color of the current round.
    round: Cell<RoundColor>,
    /// Status of the worker threads.
    worker_status: Arc<Status<WorkerStatus>>,
    /// Status of the main thread.
    main_status: Arc<Status<MainStatus>>,
}

/// Handle to a worker thread in the pool.
struct WorkerThreadHandle<'scope, Task, Output> {
    /// Thread handle object.
    handle: ScopedJoinHandle<'scope, ()>,
    /// Slot holding this thread's task for the current round.
    task: Arc<Mutex<Option<Task>>>,
    /// Storage for this thread's computation output.
    output: Arc<Mutex<Option<Output>>>,
}

impl<'scope, Task: Send, Output: Send> ThreadPool<'scope, Task, Output> {
    /// Creates a new pool tied to the given scope, spawning the given number
    /// of threads.
    ///
    /// Only construction requires `Task: 'scope`; keeping the bound off the
    /// impl block lets closures that are generic over the scope lifetime
    /// still call [`process_tasks()`](Self::process_tasks).
    fn new<'env, Red>(
        thread_scope: &'scope Scope<'scope, 'env>,
        num_threads: NonZeroUsize,
        new_reducer: impl Fn() -> Red,
    ) -> Self
    where
        Task: 'scope,
        Output: 'scope,
        Red: TaskReducer<Task, Output> + Send + 'scope,
    {
        let color = RoundColor::Blue;
        let num_active_threads = Arc::new(CachePadded::new(AtomicUsize::new(0)));
        let worker_status = Arc::new(Status::new(WorkerStatus::Round(color)));
        let main_status = Arc::new(Status::new(MainStatus::Waiting));

        let threads = (0..num_threads.into())
            .map(|id| {
                let task = Arc::new(Mutex::new(None));
                let output = Arc::new(Mutex::new(None));
                let context = ThreadContext {
                    id,
                    num_active_threads: num_active_threads.clone(),
                    worker_status: worker_status.clone(),
                    main_status: main_status.clone(),
                    task: task.clone(),
                    output: output.clone(),
                    reducer: new_reducer(),
                };
                WorkerThreadHandle {
                    handle: thread_scope.spawn(move || context.run()),
                    task,
                    output,
                }
            })
            .collect();
        log::debug!("[main thread] Spawned threads");

        Self {
            threads,
            num_active_threads,
            round: Cell::new(color),
            worker_status,
            main_status,
        }
    }

    /// Returns the number of worker threads that have been spawned in this
    /// thread pool.
    pub fn num_threads(&self) -> NonZeroUsize {
        self.threads.len().try_into().unwrap()
    }

    /// Performs a computation round, distributing the tasks to the worker
    /// threads and returning an iterator over the partial outputs.
    ///
    /// There must be at most as many tasks as worker threads; workers
    /// without a task still participate in the round but contribute no
    /// output. An empty task set yields an empty output iterator.
    ///
    /// # Panics
    ///
    /// Panics if any worker thread panicked while processing its task.
    pub fn process_tasks(
        &self,
        tasks: impl IntoIterator<Item = Task>,
    ) -> impl Iterator<Item = Output> + '_ {
        let mut tasks = tasks.into_iter();
        let mut num_tasks = 0;
        for thread in &self.threads {
            match tasks.next() {
                Some(task) => {
                    *thread.task.lock().unwrap() = Some(task);
                    num_tasks += 1;
                }
                None => break,
            }
        }
        assert!(tasks.next().is_none(), "more tasks than worker threads");

        let num_threads = self.threads.len();
        self.num_active_threads
            .store(num_threads, Ordering::SeqCst);

        let mut round = self.round.get();
        round.toggle();
        self.round.set(round);

        log::debug!("[main thread, round {round:?}] Ready to compute a round of {num_tasks} tasks.");
        self.worker_status.notify_all(WorkerStatus::Round(round));

        log::debug!("[main thread, round {round:?}] Waiting for all threads to finish this round.");
        let mut guard = self
            .main_status
            .wait_while(|status| *status == MainStatus::Waiting);
        if *guard == MainStatus::WorkerPanic {
            log::error!("[main thread] A worker thread panicked!");
            panic!("A worker thread panicked!");
        }
        *guard = MainStatus::Waiting;
        drop(guard);

        log::debug!("[main thread, round {round:?}] All threads have now finished this round.");
        self.threads
            .iter()
            .filter_map(move |t| t.output.lock().unwrap().take())
    }
}

impl<Task, Output> Drop for ThreadPool<'_, Task, Output> {
    /// Joins all the threads in the pool.
    #[allow(clippy::single_match, clippy::unused_enumerate_index)]
    fn drop(&mut self) {
        log::debug!("[main thread] Notifying threads to finish...");
        self.worker_status.notify_all(WorkerStatus::Finished);

        log::debug!("[main thread] Joining threads in the pool...");
        for (i, t) in self.threads.drain(..).enumerate() {
            let result = t.handle.join();
            match result {
                Ok(_) => log::debug!("[main thread] Thread {i} joined with result: {result:?}"),
                Err(_) => log::error!("[main thread] Thread {i} joined with result: {result:?}"),
            }
        }
        log::debug!("[main thread] Joined threads.");
    }
}

/// Context object owned by a worker thread.
struct ThreadContext<Task, Output, Red: TaskReducer<Task, Output>> {
    /// Thread index.
    id: usize,
    /// Number of worker threads active in the current round.
    num_active_threads: Arc<CachePadded<AtomicUsize>>,
    /// Status of the worker threads.
    worker_status: Arc<Status<WorkerStatus>>,
    /// Status of the main thread.
    main_status: Arc<Status<MainStatus>>,
    /// Slot holding this thread's task for the current round.
    task: Arc<Mutex<Option<Task>>>,
    /// Output that this thread writes to.
    output: Arc<Mutex<Option<Output>>>,
    /// Function to reduce a task into an output.
    reducer: Red,
}

impl<Task, Output, Red: TaskReducer<Task, Output>> ThreadContext<Task, Output, Red> {
    /// Main function run by this thread.
    fn run(&self) {
        let mut round = RoundColor::Blue;
        loop {
            round.toggle();
            log::debug!("[thread {}, round {round:?}] Waiting for start signal", self.id);

            let worker_status: WorkerStatus =
                *self.worker_status.wait_while(|status| match status {
                    WorkerStatus::Finished => false,
                    WorkerStatus::Round(r) => *r != round,
                });
            match worker_status {
                WorkerStatus::Finished => {
                    log::debug!("[thread {}, round {round:?}] Received finish signal", self.id);
                    break;
                }
                WorkerStatus::Round(r) => {
                    assert_eq!(round, r);
                    log::debug!(
                        "[thread {}, round {round:?}] Received start signal. Processing...",
                        self.id
                    );

                    // Processing a task may panic, and we want to notify the
                    // main thread in that case to avoid a deadlock.
                    let panic_notifier = PanicNotifier {
                        id: self.id,
                        main_status: &self.main_status,
                    };
                    if let Some(task) = self.task.lock().unwrap().take() {
                        *self.output.lock().unwrap() = Some(self.reducer.process(task));
                    }
                    std::mem::forget(panic_notifier);

                    let thread_count = self.num_active_threads.fetch_sub(1, Ordering::SeqCst);
                    assert!(thread_count > 0);
                    log::debug!(
                        "[thread {}, round {round:?}] Decremented the counter: {}.",
                        self.id,
                        thread_count - 1
                    );
                    if thread_count == 1 {
                        // We're the last thread.
                        log::debug!(
                            "[thread {}, round {round:?}] We're the last thread. Notifying the main thread.",
                            self.id
                        );

                        self.main_status.notify_one_if(
                            |&status| status == MainStatus::Waiting,
                            MainStatus::Ready,
                        );

                        log::debug!(
                            "[thread {}, round {round:?}] Notified the main thread.",
                            self.id
                        );
                    } else {
                        log::debug!(
                            "[thread {}, round {round:?}] Waiting for other threads to finish.",
                            self.id
                        );
                    }
                }
            }
        }
    }
}

/// Object whose destructor notifies the main thread that a panic happened.
///
/// The way to use this is to create an instance before a section that may
/// panic, and to [`std::mem::forget()`] it at the end of the section. That
/// way:
/// - If a panic happens, the [`std::mem::forget()`] call will be skipped but
///   the destructor will run due to RAII.
/// - If no panic happens, the destructor won't run because this object will
///   be forgotten.
struct PanicNotifier<'a> {
    /// Thread index.
    id: usize,
    /// Status of the main thread.
    main_status: &'a Status<MainStatus>,
}

impl Drop for PanicNotifier<'_> {
    fn drop(&mut self) {
        log::error!(
            "[thread {}] Detected panic in this thread, notifying the main thread",
            self.id
        );
        if let Err(e) = self.main_status.try_notify_one(MainStatus::WorkerPanic) {
            log::error!(
                "[thread {}] Failed to notify the main thread, the mutex was poisoned: {e:?}",
                self.id
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Example of reducer that sums the values of one sub-slice.
    struct SumReducer;

    impl TaskReducer<&[u64], u64> for SumReducer {
        fn process(&self, task: &[u64]) -> u64 {
            task.iter().sum()
        }
    }

    /// Example of reducer that sums the values of one sub-slice, but panics
    /// on one input.
    struct SumReducerOnePanic;

    impl TaskReducer<&[u64], u64> for SumReducerOnePanic {
        fn process(&self, task: &[u64]) -> u64 {
            task.iter()
                .map(|&x| if x == 0 { panic!("arithmetic panic") } else { x })
                .sum()
        }
    }

    fn four_threads() -> NonZeroUsize {
        NonZeroUsize::try_from(4).unwrap()
    }

    #[test]
    fn test_sum_integers() {
        let input = (0..=10_000).collect::<Vec<u64>>();
        let sum: u64 = ThreadPoolBuilder {
            num_threads: four_threads(),
        }
        .scope(
            || SumReducer,
            |thread_pool| thread_pool.process_tasks(input.chunks(2_501)).sum(),
        );
        assert_eq!(sum, 5_000 * 10_001);
    }

    #[test]
    fn test_sum_twice() {
        let input = (0..=10_000).collect::<Vec<u64>>();
        let (sum1, sum2) = ThreadPoolBuilder {
            num_threads: four_threads(),
        }
        .scope(
            || SumReducer,
            |thread_pool| {
                // The same pool can process multiple rounds.
                let sum1: u64 = thread_pool.process_tasks(input.chunks(2_501)).sum();
                let sum2: u64 = thread_pool.process_tasks(input.chunks(2_501)).sum();
                (sum1, sum2)
            },
        );
        assert_eq!(sum1, 5_000 * 10_001);
        assert_eq!(sum2, 5_000 * 10_001);
    }

    #[test]
    fn test_fewer_tasks_than_threads() {
        let input = (0..=10_000).collect::<Vec<u64>>();
        let sum: u64 = ThreadPoolBuilder {
            num_threads: four_threads(),
        }
        .scope(
            || SumReducer,
            |thread_pool| thread_pool.process_tasks([input.as_slice()]).sum(),
        );
        assert_eq!(sum, 5_000 * 10_001);
    }

    #[test]
    fn test_empty_round() {
        let sum: u64 = ThreadPoolBuilder {
            num_threads: four_threads(),
        }
        .scope(
            || SumReducer,
            |thread_pool| thread_pool.process_tasks([]).sum(),
        );
        assert_eq!(sum, 0);
    }

    #[test]
    #[should_panic(expected = "more tasks than worker threads")]
    fn test_too_many_tasks() {
        let input = (0..=10_000).collect::<Vec<u64>>();
        ThreadPoolBuilder {
            num_threads: NonZeroUsize::try_from(2).unwrap(),
        }
        .scope(
            || SumReducer,
            |thread_pool| thread_pool.process_tasks(input.chunks(100)).sum::<u64>(),
        );
    }

    #[test]
    #[should_panic(expected = "A worker thread panicked!")]
    fn test_worker_panic() {
        let input = (0..=10_000).collect::<Vec<u64>>();
        ThreadPoolBuilder {
            num_threads: four_threads(),
        }
        .scope(
            || SumReducerOnePanic,
            |thread_pool| thread_pool.process_tasks(input.chunks(2_501)).sum::<u64>(),
        );
    }

    #[test]
    fn test_num_threads() {
        ThreadPoolBuilder {
            num_threads: four_threads(),
        }
        .scope(
            || SumReducer,
            |thread_pool: ThreadPool<&[u64], u64>| {
                assert_eq!(thread_pool.num_threads(), four_threads());
            },
        );
    }
}
