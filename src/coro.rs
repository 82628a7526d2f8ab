//! Cooperative task substrate.
//!
//! Every connection gets one [`Task`]: a linear flow of control that reads
//! and writes as if the socket were blocking, while the worker's reactor
//! multiplexes thousands of them on a single thread. A task suspends only
//! at explicit [`TaskHandle::pause`] points; the reactor resumes it when
//! the yielded condition (readiness, timer, reschedule) is satisfied.
//!
//! Cleanup is a LIFO deferred-action registry instead of unwinding: actions
//! registered with [`TaskHandle::defer`] fire in reverse insertion order
//! when the task is reset, cancelled, or dropped. A [`Task::generation`]
//! snapshot scopes cleanup to a section of the task's lifetime.

use std::{
    cell::{Cell, RefCell},
    convert::Infallible,
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, RawWaker, RawWakerVTable, Waker},
};

/// Conditions a task may surrender control with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Yield {
    /// The socket returned `WouldBlock` on read; resume on readable.
    WantRead,
    /// The socket returned `WouldBlock` on write; resume on writable.
    WantWrite,
    /// Resume when the socket is readable or writable (upgraded connections).
    WantReadWrite,
    /// Voluntary reschedule; resume on the next reactor turn.
    Reschedule,
    /// Sleep on the worker's timer; the sleep duration travels out of band.
    SuspendTimer,
    /// Tear the connection down. The reactor stops resuming and destroys
    /// the task, which runs every deferred action.
    Abort,
}

/// Result of driving a task forward once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// The task suspended with the given condition.
    Yielded(Yield),
    /// The task's entry function returned; the value is its return value.
    Finished(i32),
}

type Deferred = Box<dyn FnOnce()>;

#[derive(Default)]
struct Shared {
    yielded: Cell<Option<Yield>>,
    resumed: Cell<i32>,
    deferred: RefCell<Vec<Deferred>>,
}

impl Shared {
    fn run_deferred_to(&self, generation: usize) {
        // Popping before calling keeps the registry unborrowed, so a
        // deferred action may itself register further cleanup.
        while self.deferred.borrow().len() > generation {
            let action = self.deferred.borrow_mut().pop();
            if let Some(action) = action {
                action();
            }
        }
    }
}

/// The scheduler-side half of a task. See the module docs.
pub struct Task {
    shared: Rc<Shared>,
    fut: Option<Pin<Box<dyn Future<Output = i32>>>>,
}

/// The inside half: handed to the entry function, cheap to clone.
#[derive(Clone)]
pub struct TaskHandle {
    shared: Rc<Shared>,
}

impl Task {
    /// Creates a task around `entry`. Nothing runs until the first resume.
    pub fn new<F, Fut>(entry: F) -> Self
    where
        F: FnOnce(TaskHandle) -> Fut,
        Fut: Future<Output = i32> + 'static,
    {
        let shared = Rc::new(Shared::default());
        let handle = TaskHandle {
            shared: shared.clone(),
        };

        Task {
            shared,
            fut: Some(Box::pin(entry(handle))),
        }
    }

    /// Runs every deferred action, clears the registry, and rebinds the
    /// entry function. Reusing a task this way is a hot path: workers keep
    /// one task alive across sequential keep-alive connections instead of
    /// reallocating per accept.
    pub fn reset<F, Fut>(&mut self, entry: F)
    where
        F: FnOnce(TaskHandle) -> Fut,
        Fut: Future<Output = i32> + 'static,
    {
        self.cancel();

        let handle = TaskHandle {
            shared: self.shared.clone(),
        };
        self.fut = Some(Box::pin(entry(handle)));
    }

    /// Destroys the task body and runs all deferred actions (generation 0).
    /// Equivalent to what `Drop` does, for call sites that want teardown
    /// before the next reuse.
    pub fn cancel(&mut self) {
        self.fut = None;
        self.shared.yielded.set(None);
        self.shared.run_deferred_to(0);
    }

    /// Drives the task until its next suspension point or completion.
    #[inline]
    pub fn resume(&mut self) -> Resume {
        self.resume_with(0)
    }

    /// Like [`resume`](Self::resume), but the paused `pause().await`
    /// observes `value` as its result.
    ///
    /// A pend on a foreign future (anything other than [`TaskHandle::pause`])
    /// is reported as `Yielded(Reschedule)`; reactor-embedded drivers should
    /// use [`resume_async`](Self::resume_async) instead so the real waker
    /// reaches it.
    pub fn resume_with(&mut self, value: i32) -> Resume {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        match self.poll_resume(&mut cx, value) {
            Poll::Ready(resume) => resume,
            Poll::Pending => Resume::Yielded(Yield::Reschedule),
        }
    }

    /// Resume variant for drivers running inside an async reactor: a pend
    /// on a foreign future suspends the driver itself with the caller's
    /// waker instead of spinning.
    pub async fn resume_async(&mut self, value: i32) -> Resume {
        std::future::poll_fn(|cx| self.poll_resume(cx, value)).await
    }

    fn poll_resume(&mut self, cx: &mut Context<'_>, value: i32) -> Poll<Resume> {
        self.shared.resumed.set(value);

        let Some(fut) = self.fut.as_mut() else {
            return Poll::Ready(Resume::Finished(0));
        };

        match fut.as_mut().poll(cx) {
            Poll::Ready(value) => {
                self.fut = None;
                Poll::Ready(Resume::Finished(value))
            }
            Poll::Pending => match self.shared.yielded.take() {
                Some(value) => Poll::Ready(Resume::Yielded(value)),
                None => Poll::Pending,
            },
        }
    }

    /// Snapshot of the deferred-registry length.
    #[inline(always)]
    pub fn generation(&self) -> usize {
        self.shared.deferred.borrow().len()
    }

    /// Fires (in reverse insertion order) and removes every deferred action
    /// registered after the `generation` snapshot.
    #[inline]
    pub fn run_deferred_to(&mut self, generation: usize) {
        self.shared.run_deferred_to(generation);
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("finished", &self.fut.is_none())
            .field("generation", &self.generation())
            .finish()
    }
}

impl TaskHandle {
    /// Surrenders control with `value`; completes with the value passed to
    /// the next `resume_with`.
    #[inline]
    pub fn pause(&self, value: Yield) -> Pause<'_> {
        Pause {
            shared: &self.shared,
            value,
            yielded: false,
        }
    }

    /// Registers a cleanup action. Actions run LIFO when the task is reset,
    /// cancelled, or dropped, or when `run_deferred_to` unwinds past them.
    ///
    /// Registration cannot fail: the registry is a `Vec`, and allocation
    /// failure aborts the process rather than dropping the action.
    #[inline]
    pub fn defer(&self, action: impl FnOnce() + 'static) {
        self.shared.deferred.borrow_mut().push(Box::new(action));
    }

    /// Snapshot of the deferred-registry length, from inside the task.
    #[inline(always)]
    pub fn generation(&self) -> usize {
        self.shared.deferred.borrow().len()
    }

    /// Yields `Abort` forever. The reactor stops at the first `Abort` and
    /// destroys the task, so this never completes; the `Infallible` output
    /// lets callers mark the path unreachable with `match`.
    pub(crate) async fn closed(&self) -> Infallible {
        loop {
            self.pause(Yield::Abort).await;
        }
    }

    #[cfg(test)]
    pub(crate) fn standalone() -> Self {
        TaskHandle {
            shared: Rc::new(Shared::default()),
        }
    }
}

/// Future returned by [`TaskHandle::pause`].
pub struct Pause<'a> {
    shared: &'a Shared,
    value: Yield,
    yielded: bool,
}

impl Future for Pause<'_> {
    type Output = i32;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<i32> {
        let this = self.get_mut();

        if this.yielded {
            return Poll::Ready(this.shared.resumed.get());
        }

        this.shared.yielded.set(Some(this.value));
        this.yielded = true;
        Poll::Pending
    }
}

fn noop_waker() -> Waker {
    const VTABLE: RawWakerVTable = RawWakerVTable::new(|_| RAW, |_| {}, |_| {}, |_| {});
    const RAW: RawWaker = RawWaker::new(std::ptr::null(), &VTABLE);

    // SAFETY: the vtable ignores its data pointer entirely.
    unsafe { Waker::from_raw(RAW) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn resume_and_yield_values() {
        let mut task = Task::new(|handle| async move {
            let first = handle.pause(Yield::Reschedule).await;
            let second = handle.pause(Yield::WantRead).await;
            first + second
        });

        assert_eq!(task.resume(), Resume::Yielded(Yield::Reschedule));
        assert_eq!(task.resume_with(3), Resume::Yielded(Yield::WantRead));
        assert_eq!(task.resume_with(4), Resume::Finished(7));

        // Resuming a finished task is a no-op.
        assert_eq!(task.resume(), Resume::Finished(0));
    }

    #[test]
    fn deferred_run_in_reverse_order_exactly_once() {
        let log = Rc::new(RefCell::new(Vec::new()));

        let entry_log = log.clone();
        let mut task = Task::new(|handle| async move {
            for i in 0..4 {
                let log = entry_log.clone();
                handle.defer(move || log.borrow_mut().push(i));
            }
            handle.pause(Yield::Reschedule).await;
            0
        });

        assert_eq!(task.resume(), Resume::Yielded(Yield::Reschedule));
        assert!(log.borrow().is_empty());

        drop(task);
        assert_eq!(*log.borrow(), vec![3, 2, 1, 0]);
    }

    #[test]
    fn generation_scopes_cleanup() {
        let log = Rc::new(RefCell::new(Vec::new()));

        let entry_log = log.clone();
        let mut task = Task::new(|handle| async move {
            let log = entry_log.clone();
            handle.defer(move || log.borrow_mut().push("outer"));

            let log = entry_log.clone();
            handle.defer(move || log.borrow_mut().push("inner a"));
            let log = entry_log.clone();
            handle.defer(move || log.borrow_mut().push("inner b"));

            handle.pause(Yield::Reschedule).await;
            0
        });

        let outer = task.generation();
        assert_eq!(outer, 0);
        assert_eq!(task.resume(), Resume::Yielded(Yield::Reschedule));
        assert_eq!(task.generation(), 3);

        task.run_deferred_to(1);
        assert_eq!(*log.borrow(), vec!["inner b", "inner a"]);
        assert_eq!(task.generation(), 1);

        // Already-run actions never fire again.
        task.run_deferred_to(1);
        assert_eq!(log.borrow().len(), 2);

        drop(task);
        assert_eq!(*log.borrow(), vec!["inner b", "inner a", "outer"]);
    }

    #[test]
    fn reset_runs_deferred_and_rebinds() {
        let log = Rc::new(RefCell::new(Vec::new()));

        let entry_log = log.clone();
        let mut task = Task::new(|handle| async move {
            let log = entry_log.clone();
            handle.defer(move || log.borrow_mut().push(1));
            handle.pause(Yield::WantRead).await;
            10
        });

        assert_eq!(task.resume(), Resume::Yielded(Yield::WantRead));

        task.reset(|_| async move { 20 });
        assert_eq!(*log.borrow(), vec![1]);
        assert_eq!(task.generation(), 0);
        assert_eq!(task.resume(), Resume::Finished(20));
    }

    #[test]
    fn abort_keeps_yielding() {
        let mut task = Task::new(|handle| async move {
            handle.closed().await;
            0
        });

        assert_eq!(task.resume(), Resume::Yielded(Yield::Abort));
        assert_eq!(task.resume(), Resume::Yielded(Yield::Abort));
    }

    #[test]
    fn deferred_registered_during_teardown_still_run() {
        let log = Rc::new(RefCell::new(Vec::new()));

        let entry_log = log.clone();
        let mut task = Task::new(|handle| async move {
            let log = entry_log.clone();
            let inner = handle.clone();
            handle.defer(move || {
                log.borrow_mut().push("first");
                let log = log.clone();
                inner.defer(move || log.borrow_mut().push("nested"));
            });
            handle.pause(Yield::Reschedule).await;
            0
        });

        assert_eq!(task.resume(), Resume::Yielded(Yield::Reschedule));
        task.cancel();
        assert_eq!(*log.borrow(), vec!["first", "nested"]);
    }
}
