//! Per-thread state machine serializing interrupt, resume, evaluate and
//! paused-thread work against a remote thread.
//!
//! Callers treat these as ordinary concurrent operations. The coordinator
//! queues them and runs at most one global transition (interrupting, resuming
//! or evaluating) at a time. Unsolicited `paused`/`resumed` notifications from
//! the debuggee always win over whatever the coordinator believed.

use std::{collections::VecDeque, fmt, future::Future, pin::Pin, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use rdp_wire::{ActorError, Evaluation, ExceptionBreakpoints, StepKind};

use crate::{
    error::{CoordinatorError, CoordinatorResult},
    pause_coordinator::{PauseType, ThreadId, ThreadPauseCoordinator},
};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Work that must finish right before the resume request goes out, such as
/// releasing pause-lifetime object grips.
pub type Cleanup = Box<dyn FnOnce() -> BoxFuture<()> + Send>;

/// The remote operations a coordinator drives.
pub trait ThreadControl: Send + Sync + 'static {
    fn interrupt(&self) -> impl Future<Output = Result<(), ActorError>> + Send;

    fn resume(
        &self,
        exceptions: ExceptionBreakpoints,
        step: Option<StepKind>,
    ) -> impl Future<Output = Result<(), ActorError>> + Send;

    fn evaluate(
        &self,
        expression: String,
        frame_actor: Option<String>,
    ) -> impl Future<Output = Result<Evaluation, ActorError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Paused,
    Resuming,
    Running,
    Interrupting,
    Evaluating,
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreadState::Paused => "paused",
            ThreadState::Resuming => "resuming",
            ThreadState::Running => "running",
            ThreadState::Interrupting => "interrupting",
            ThreadState::Evaluating => "evaluating",
        };
        f.write_str(name)
    }
}

type Waiter = oneshot::Sender<CoordinatorResult<()>>;

enum Dispatch {
    Run,
    Reject(CoordinatorError),
}

/// A queued paused-thread task or evaluation. Called exactly once: with
/// `Run` it hands back the work to spawn, with `Reject` it fails its caller.
type Job = Box<dyn FnOnce(Dispatch) -> Option<BoxFuture<()>> + Send>;

struct QueuedInterrupt {
    waiters: Vec<Waiter>,
    pause_type: PauseType,
}

#[derive(Default)]
struct QueuedResume {
    waiters: Vec<Waiter>,
    cleanups: Vec<Cleanup>,
    step: Option<StepKind>,
}

struct State {
    thread_state: ThreadState,
    /// Bumped on every unsolicited notification. Operations started under an
    /// older epoch must not overwrite `thread_state` when they complete.
    epoch: u64,
    closed: bool,
    queued_interrupt: Option<QueuedInterrupt>,
    queued_resume: Option<QueuedResume>,
    in_flight: Vec<Waiter>,
    /// Pause type reported to the arbiter when the in-flight interrupt lands.
    interrupt_type: PauseType,
    paused_tasks: VecDeque<Job>,
    running_tasks: usize,
    evaluations: VecDeque<Job>,
    /// Set when the coordinator interrupted the thread on its own to run
    /// paused-thread tasks and owes it a resume.
    auto_resume: bool,
    exceptions: ExceptionBreakpoints,
}

struct Inner<C> {
    thread_id: ThreadId,
    thread_name: String,
    control: Arc<C>,
    pauses: Arc<ThreadPauseCoordinator>,
    state: Mutex<State>,
}

pub struct ThreadCoordinator<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for ThreadCoordinator<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: ThreadControl> ThreadCoordinator<C> {
    /// A coordinator for a thread that was just attached, and is therefore
    /// paused.
    pub fn new(
        thread_id: ThreadId,
        thread_name: impl Into<String>,
        control: C,
        pauses: Arc<ThreadPauseCoordinator>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                thread_id,
                thread_name: thread_name.into(),
                control: Arc::new(control),
                pauses,
                state: Mutex::new(State {
                    thread_state: ThreadState::Paused,
                    epoch: 0,
                    closed: false,
                    queued_interrupt: None,
                    queued_resume: None,
                    in_flight: Vec::new(),
                    interrupt_type: PauseType::User,
                    paused_tasks: VecDeque::new(),
                    running_tasks: 0,
                    evaluations: VecDeque::new(),
                    auto_resume: false,
                    exceptions: ExceptionBreakpoints::default(),
                }),
            }),
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.inner.thread_id
    }

    pub fn thread_name(&self) -> &str {
        &self.inner.thread_name
    }

    pub fn control(&self) -> &Arc<C> {
        &self.inner.control
    }

    pub fn state(&self) -> ThreadState {
        self.inner.state.lock().thread_state
    }

    pub fn exception_breakpoints(&self) -> ExceptionBreakpoints {
        self.inner.state.lock().exceptions
    }

    /// Pause the thread. Succeeds without a remote request when it already is.
    pub async fn interrupt(&self) -> CoordinatorResult<()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(CoordinatorError::Shutdown);
            }
            let thread_state = state.thread_state;
            match thread_state {
                ThreadState::Paused => {
                    // Keep an automatic pause as the user's own.
                    let promote = std::mem::take(&mut state.auto_resume);
                    drop(state);
                    if promote {
                        self.inner.pauses.promote_to_user_pause(self.inner.thread_id);
                    }
                    return Ok(());
                }
                ThreadState::Interrupting => {
                    state.auto_resume = false;
                    state.interrupt_type = PauseType::User;
                    state.in_flight.push(tx);
                }
                _ => {
                    state.auto_resume = false;
                    let queued = state.queued_interrupt.get_or_insert_with(|| QueuedInterrupt {
                        waiters: Vec::new(),
                        pause_type: PauseType::User,
                    });
                    queued.pause_type = PauseType::User;
                    queued.waiters.push(tx);
                }
            }
        }
        self.inner.do_next();
        wait(rx).await
    }

    /// Resume the thread, stepping when `step` is given.
    ///
    /// `cleanup` runs exactly once, right before the resume request is sent.
    /// It is dropped without running when the thread is already running or a
    /// resume is already on the wire.
    pub async fn resume(
        &self,
        cleanup: Option<Cleanup>,
        step: Option<StepKind>,
    ) -> CoordinatorResult<()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(CoordinatorError::Shutdown);
            }
            match state.thread_state {
                ThreadState::Running => return Ok(()),
                ThreadState::Resuming => state.in_flight.push(tx),
                _ => {
                    state.auto_resume = false;
                    let queued = state.queued_resume.get_or_insert_with(QueuedResume::default);
                    queued.waiters.push(tx);
                    queued.cleanups.extend(cleanup);
                    if step.is_some() {
                        queued.step = step;
                    }
                }
            }
        }
        self.inner.do_next();
        wait(rx).await
    }

    /// Change the exception filter. A running thread picks it up with its
    /// next resume, so one is forced through a no-op paused-thread task.
    pub fn set_exception_breakpoints(&self, exceptions: ExceptionBreakpoints) {
        let needs_resume = {
            let mut state = self.inner.state.lock();
            state.exceptions = exceptions;
            !state.closed
                && matches!(
                    state.thread_state,
                    ThreadState::Running | ThreadState::Resuming
                )
        };
        if !needs_resume {
            return;
        }
        tracing::debug!(
            target: "rdp.bridge",
            thread = %self.inner.thread_name,
            ?exceptions,
            "forcing a pause to apply exception breakpoints"
        );
        let job: Job = Box::new(|dispatch: Dispatch| match dispatch {
            Dispatch::Run => {
                let work: BoxFuture<()> = Box::pin(async {});
                Some(work)
            }
            Dispatch::Reject(_) => None,
        });
        self.inner.enqueue_paused_task(job, false);
    }

    /// Run `task` while the thread is paused, pausing and resuming it around
    /// the task if necessary.
    pub async fn run_on_paused_thread<T, F, Fut>(&self, task: F) -> CoordinatorResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CoordinatorResult<T>> + Send + 'static,
    {
        self.run_on_paused_thread_with(task, |value| async move { Ok(value) }, true)
            .await
    }

    /// Like [`ThreadCoordinator::run_on_paused_thread`], with a `postprocess`
    /// step that completes before any queued resume is sent. With
    /// `reject_if_resuming`, fails right away if the thread is resuming or a
    /// user resume is queued.
    pub async fn run_on_paused_thread_with<T, F, Fut, P, PFut>(
        &self,
        task: F,
        postprocess: P,
        reject_if_resuming: bool,
    ) -> CoordinatorResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CoordinatorResult<T>> + Send + 'static,
        P: FnOnce(T) -> PFut + Send + 'static,
        PFut: Future<Output = CoordinatorResult<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |dispatch: Dispatch| match dispatch {
            Dispatch::Run => {
                let work: BoxFuture<()> = Box::pin(async move {
                    let result = match task().await {
                        Ok(value) => postprocess(value).await,
                        Err(err) => Err(err),
                    };
                    let _ = tx.send(result);
                });
                Some(work)
            }
            Dispatch::Reject(err) => {
                let _ = tx.send(Err(err));
                None
            }
        });
        self.inner.enqueue_paused_task(job, reject_if_resuming);
        rx.await.map_err(|_| CoordinatorError::Shutdown)?
    }

    /// Evaluate `expression` on the paused thread, in `frame_actor` when
    /// given. Evaluations run one at a time in call order.
    pub async fn evaluate<T, V, VFut, P, PFut>(
        &self,
        expression: String,
        frame_actor: Option<String>,
        convert: V,
        postprocess: P,
    ) -> CoordinatorResult<T>
    where
        T: Send + 'static,
        V: FnOnce(Evaluation) -> VFut + Send + 'static,
        VFut: Future<Output = CoordinatorResult<T>> + Send + 'static,
        P: FnOnce(T) -> PFut + Send + 'static,
        PFut: Future<Output = CoordinatorResult<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let control = Arc::clone(&self.inner.control);
        let job: Job = Box::new(move |dispatch: Dispatch| match dispatch {
            Dispatch::Run => {
                let work: BoxFuture<()> = Box::pin(async move {
                    let result = match control.evaluate(expression, frame_actor).await {
                        Ok(evaluation) => match convert(evaluation).await {
                            Ok(value) => postprocess(value).await,
                            Err(err) => Err(err),
                        },
                        Err(err) => Err(err.into()),
                    };
                    let _ = tx.send(result);
                });
                Some(work)
            }
            Dispatch::Reject(err) => {
                let _ = tx.send(Err(err));
                None
            }
        });
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(CoordinatorError::Shutdown);
            }
            match state.thread_state {
                ThreadState::Running => return Err(CoordinatorError::ThreadRunning),
                ThreadState::Resuming => return Err(CoordinatorError::ThreadResuming),
                _ => state.evaluations.push_back(job),
            }
        }
        self.inner.do_next();
        rx.await.map_err(|_| CoordinatorError::Shutdown)?
    }

    /// The debuggee reported the thread paused without being asked to.
    pub fn on_paused(&self) {
        let inner = &self.inner;
        let (in_flight, queued_interrupt, queued_resume) = {
            let mut state = inner.state.lock();
            if state.thread_state == ThreadState::Evaluating {
                // The evaluated code hit a breakpoint or debugger statement.
                // Its result is what the caller is waiting for, so let it run on.
                let exceptions = state.exceptions;
                drop(state);
                tracing::debug!(
                    target: "rdp.bridge",
                    thread = %inner.thread_name,
                    "resuming a pause hit during evaluation"
                );
                let control = Arc::clone(&inner.control);
                let thread = inner.thread_name.clone();
                tokio::spawn(async move {
                    if let Err(err) = control.resume(exceptions, None).await {
                        tracing::warn!(
                            target: "rdp.bridge",
                            %thread,
                            error = %err,
                            "failed to resume a pause hit during evaluation"
                        );
                    }
                });
                return;
            }

            let in_flight = if state.thread_state == ThreadState::Interrupting {
                std::mem::take(&mut state.in_flight)
            } else {
                Vec::new()
            };
            state.thread_state = ThreadState::Paused;
            state.epoch += 1;
            state.auto_resume = false;
            (
                in_flight,
                state.queued_interrupt.take(),
                state.queued_resume.take(),
            )
        };

        tracing::debug!(target: "rdp.bridge", thread = %inner.thread_name, "thread paused");
        resolve(in_flight, Ok(()));
        if let Some(interrupt) = queued_interrupt {
            resolve(interrupt.waiters, Ok(()));
        }
        if let Some(resume) = queued_resume {
            resolve(resume.waiters, Err(CoordinatorError::Preempted));
        }
        inner
            .pauses
            .notify_paused(inner.thread_id, &inner.thread_name, PauseType::User);
        inner.do_next();
    }

    /// The debuggee reported the thread running without being asked to.
    pub fn on_resumed(&self) {
        let inner = &self.inner;
        let (in_flight, queued_resume) = {
            let mut state = inner.state.lock();
            if state.running_tasks > 0 {
                tracing::warn!(
                    target: "rdp.bridge",
                    thread = %inner.thread_name,
                    tasks = state.running_tasks,
                    "thread resumed while paused-thread tasks were running"
                );
            }
            if state.thread_state == ThreadState::Evaluating {
                tracing::warn!(
                    target: "rdp.bridge",
                    thread = %inner.thread_name,
                    "ignoring resumed notification during evaluation"
                );
                return;
            }
            let in_flight = if state.thread_state == ThreadState::Resuming {
                std::mem::take(&mut state.in_flight)
            } else {
                Vec::new()
            };
            state.thread_state = ThreadState::Running;
            state.epoch += 1;
            (in_flight, state.queued_resume.take())
        };

        tracing::debug!(target: "rdp.bridge", thread = %inner.thread_name, "thread resumed");
        resolve(in_flight, Ok(()));
        if let Some(resume) = queued_resume {
            resolve(resume.waiters, Ok(()));
        }
        inner
            .pauses
            .notify_resumed(inner.thread_id, &inner.thread_name);
        inner.do_next();
    }

    /// The thread is gone: fail everything still queued and drop it from the
    /// pause arbiter.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        let (waiters, jobs) = {
            let mut state = inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let mut waiters = std::mem::take(&mut state.in_flight);
            if let Some(interrupt) = state.queued_interrupt.take() {
                waiters.extend(interrupt.waiters);
            }
            if let Some(resume) = state.queued_resume.take() {
                waiters.extend(resume.waiters);
            }
            let mut jobs: Vec<Job> = state.paused_tasks.drain(..).collect();
            jobs.extend(state.evaluations.drain(..));
            (waiters, jobs)
        };
        tracing::debug!(target: "rdp.bridge", thread = %inner.thread_name, "thread coordinator shut down");
        resolve(waiters, Err(CoordinatorError::Shutdown));
        for job in jobs {
            let _ = job(Dispatch::Reject(CoordinatorError::Shutdown));
        }
        inner.pauses.forget_thread(inner.thread_id);
    }
}

impl<C: ThreadControl> Inner<C> {
    fn enqueue_paused_task(self: &Arc<Self>, job: Job, reject_if_resuming: bool) {
        {
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                let _ = job(Dispatch::Reject(CoordinatorError::Shutdown));
                return;
            }
            if reject_if_resuming
                && (state.thread_state == ThreadState::Resuming || state.queued_resume.is_some())
            {
                drop(state);
                let _ = job(Dispatch::Reject(CoordinatorError::ThreadResuming));
                return;
            }
            state.paused_tasks.push_back(job);
        }
        self.do_next();
    }

    fn is_stale(&self, epoch: u64) -> bool {
        self.state.lock().epoch != epoch
    }

    fn do_next(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.closed
            || matches!(
                state.thread_state,
                ThreadState::Interrupting | ThreadState::Resuming | ThreadState::Evaluating
            )
        {
            return;
        }

        if let Some(interrupt) = state.queued_interrupt.take() {
            if state.thread_state == ThreadState::Running {
                self.start_interrupt(&mut state, interrupt);
                return;
            }
            resolve(interrupt.waiters, Ok(()));
        }

        if !state.paused_tasks.is_empty() {
            if state.thread_state == ThreadState::Running {
                state.auto_resume = true;
                let interrupt = QueuedInterrupt {
                    waiters: Vec::new(),
                    pause_type: PauseType::Auto,
                };
                self.start_interrupt(&mut state, interrupt);
                return;
            }
            let jobs: Vec<Job> = state.paused_tasks.drain(..).collect();
            for job in jobs {
                if let Some(work) = job(Dispatch::Run) {
                    state.running_tasks += 1;
                    self.spawn_paused_task(work);
                }
            }
        }

        if state.running_tasks > 0 {
            return;
        }

        if !state.evaluations.is_empty() {
            if state.thread_state == ThreadState::Paused {
                while let Some(job) = state.evaluations.pop_front() {
                    if let Some(work) = job(Dispatch::Run) {
                        state.thread_state = ThreadState::Evaluating;
                        self.spawn_evaluation(work);
                        return;
                    }
                }
            } else {
                for job in state.evaluations.drain(..) {
                    let _ = job(Dispatch::Reject(CoordinatorError::ThreadRunning));
                }
            }
        }

        if state.thread_state == ThreadState::Paused {
            let resume = match state.queued_resume.take() {
                Some(resume) => Some(resume),
                None if state.auto_resume => Some(QueuedResume::default()),
                None => None,
            };
            if let Some(resume) = resume {
                state.auto_resume = false;
                self.start_resume(&mut state, resume);
            }
        } else if let Some(resume) = state.queued_resume.take() {
            resolve(resume.waiters, Ok(()));
        }
    }

    fn spawn_paused_task(self: &Arc<Self>, work: BoxFuture<()>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            work.await;
            {
                let mut state = this.state.lock();
                state.running_tasks = state.running_tasks.saturating_sub(1);
            }
            this.do_next();
        });
    }

    fn spawn_evaluation(self: &Arc<Self>, work: BoxFuture<()>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            work.await;
            {
                let mut state = this.state.lock();
                if state.thread_state == ThreadState::Evaluating {
                    state.thread_state = ThreadState::Paused;
                }
            }
            this.do_next();
        });
    }

    fn start_interrupt(self: &Arc<Self>, state: &mut State, interrupt: QueuedInterrupt) {
        let QueuedInterrupt {
            waiters,
            pause_type,
        } = interrupt;
        state.thread_state = ThreadState::Interrupting;
        state.interrupt_type = pause_type;
        state.in_flight.extend(waiters);
        let epoch = state.epoch;
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_interrupt(epoch, pause_type).await });
    }

    fn start_resume(self: &Arc<Self>, state: &mut State, resume: QueuedResume) {
        let QueuedResume {
            waiters,
            cleanups,
            step,
        } = resume;
        state.thread_state = ThreadState::Resuming;
        state.in_flight.extend(waiters);
        let epoch = state.epoch;
        let exceptions = state.exceptions;
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_resume(epoch, exceptions, cleanups, step).await });
    }

    async fn run_interrupt(self: Arc<Self>, epoch: u64, pause_type: PauseType) {
        let permit = self
            .pauses
            .request_pause(self.thread_id, &self.thread_name, pause_type);
        let result = match permit.granted().await {
            Ok(()) if self.is_stale(epoch) => {
                // A notification overtook the request while it waited.
                self.pauses.notify_pause_failed(self.thread_id);
                Ok(())
            }
            Ok(()) => {
                tracing::debug!(
                    target: "rdp.bridge",
                    thread = %self.thread_name,
                    ?pause_type,
                    "interrupting thread"
                );
                let result = self.control.interrupt().await;
                let (stale, pause_type) = {
                    let state = self.state.lock();
                    (state.epoch != epoch, state.interrupt_type)
                };
                if !stale {
                    match &result {
                        Ok(()) => {
                            self.pauses
                                .notify_paused(self.thread_id, &self.thread_name, pause_type)
                        }
                        Err(_) => self.pauses.notify_pause_failed(self.thread_id),
                    }
                }
                result.map_err(CoordinatorError::from)
            }
            Err(err) => Err(err),
        };

        let (waiters, result) = {
            let mut state = self.state.lock();
            let waiters = std::mem::take(&mut state.in_flight);
            let result = if state.epoch == epoch {
                match &result {
                    Ok(()) => state.thread_state = ThreadState::Paused,
                    Err(err) => {
                        state.thread_state = ThreadState::Running;
                        state.auto_resume = false;
                        for job in state.paused_tasks.drain(..) {
                            let _ = job(Dispatch::Reject(err.clone()));
                        }
                    }
                }
                result
            } else if state.thread_state == ThreadState::Paused {
                Ok(())
            } else {
                result
            };
            (waiters, result)
        };
        if let Err(err) = &result {
            tracing::warn!(
                target: "rdp.bridge",
                thread = %self.thread_name,
                error = %err,
                "interrupt failed"
            );
        }
        resolve(waiters, result);
        self.do_next();
    }

    async fn run_resume(
        self: Arc<Self>,
        epoch: u64,
        exceptions: ExceptionBreakpoints,
        cleanups: Vec<Cleanup>,
        step: Option<StepKind>,
    ) {
        let result: CoordinatorResult<()> = async {
            let permit = self
                .pauses
                .request_resume(self.thread_id, &self.thread_name)?;
            permit.granted().await?;
            if self.is_stale(epoch) {
                self.pauses.notify_resume_failed(self.thread_id);
                return Err(CoordinatorError::Preempted);
            }
            for cleanup in cleanups {
                cleanup().await;
            }
            tracing::debug!(
                target: "rdp.bridge",
                thread = %self.thread_name,
                ?step,
                ?exceptions,
                "resuming thread"
            );
            let result = self.control.resume(exceptions, step).await;
            if !self.is_stale(epoch) {
                match &result {
                    Ok(()) => self.pauses.notify_resumed(self.thread_id, &self.thread_name),
                    Err(_) => self.pauses.notify_resume_failed(self.thread_id),
                }
            }
            result.map_err(CoordinatorError::from)
        }
        .await;

        let (waiters, result) = {
            let mut state = self.state.lock();
            let waiters = std::mem::take(&mut state.in_flight);
            let result = if state.epoch == epoch {
                state.thread_state = if result.is_ok() {
                    ThreadState::Running
                } else {
                    ThreadState::Paused
                };
                result
            } else if state.thread_state == ThreadState::Running {
                Ok(())
            } else {
                result
            };
            (waiters, result)
        };
        if let Err(err) = &result {
            tracing::warn!(
                target: "rdp.bridge",
                thread = %self.thread_name,
                error = %err,
                "resume failed"
            );
        }
        resolve(waiters, result);
        self.do_next();
    }
}

fn resolve(waiters: Vec<Waiter>, result: CoordinatorResult<()>) {
    for waiter in waiters {
        let _ = waiter.send(result.clone());
    }
}

async fn wait(rx: oneshot::Receiver<CoordinatorResult<()>>) -> CoordinatorResult<()> {
    rx.await.map_err(|_| CoordinatorError::Shutdown)?
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rdp_wire::Grip;
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct Script {
        calls: Mutex<Vec<String>>,
        evaluate_gate: Mutex<Option<oneshot::Receiver<()>>>,
        fail_interrupt: Mutex<bool>,
    }

    impl Script {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[derive(Clone, Default)]
    struct FakeThread(Arc<Script>);

    impl ThreadControl for FakeThread {
        fn interrupt(&self) -> impl Future<Output = Result<(), ActorError>> + Send {
            let script = Arc::clone(&self.0);
            async move {
                script.record("interrupt");
                if *script.fail_interrupt.lock() {
                    return Err(ActorError::Remote {
                        error: "wrongState".into(),
                        message: None,
                    });
                }
                Ok(())
            }
        }

        fn resume(
            &self,
            exceptions: ExceptionBreakpoints,
            step: Option<StepKind>,
        ) -> impl Future<Output = Result<(), ActorError>> + Send {
            let script = Arc::clone(&self.0);
            async move {
                // Only non-default filters show up in the log.
                let mut call = String::from("resume");
                if let Some(step) = step {
                    call.push(' ');
                    call.push_str(step.resume_limit());
                }
                if exceptions != ExceptionBreakpoints::None {
                    call.push_str(&format!(" {exceptions:?}"));
                }
                script.record(call);
                Ok(())
            }
        }

        fn evaluate(
            &self,
            expression: String,
            _frame_actor: Option<String>,
        ) -> impl Future<Output = Result<Evaluation, ActorError>> + Send {
            let script = Arc::clone(&self.0);
            let gate = script.evaluate_gate.lock().take();
            async move {
                script.record(format!("evaluate {expression}"));
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                Ok(Evaluation {
                    result: Grip(json!(expression.len())),
                    exception: None,
                    exception_message: None,
                })
            }
        }
    }

    fn coordinator() -> (ThreadCoordinator<FakeThread>, Arc<Script>) {
        let fake = FakeThread::default();
        let script = Arc::clone(&fake.0);
        let pauses = Arc::new(ThreadPauseCoordinator::new());
        pauses.notify_paused(1, "Main Thread", PauseType::User);
        (
            ThreadCoordinator::new(1, "Main Thread", fake, pauses),
            script,
        )
    }

    async fn running_coordinator() -> (ThreadCoordinator<FakeThread>, Arc<Script>) {
        let (coordinator, script) = coordinator();
        coordinator.resume(None, None).await.unwrap();
        script.calls.lock().clear();
        (coordinator, script)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn grip_to_string(evaluation: Evaluation) -> impl Future<Output = CoordinatorResult<String>> {
        async move { Ok(evaluation.result.0.to_string()) }
    }

    fn unchanged(value: String) -> impl Future<Output = CoordinatorResult<String>> {
        async move { Ok(value) }
    }

    #[tokio::test]
    async fn evaluate_while_running_fails_without_a_remote_request() {
        let (coordinator, script) = running_coordinator().await;

        let err = coordinator
            .evaluate("1 + 1".into(), None, grip_to_string, unchanged)
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinatorError::ThreadRunning), "{err:?}");
        assert!(script.calls().is_empty());
    }

    #[tokio::test]
    async fn evaluate_while_paused_runs_and_converts() {
        let (coordinator, script) = coordinator();

        let value = coordinator
            .evaluate(
                "abc".into(),
                Some("frame1".into()),
                grip_to_string,
                |value| async move { Ok(format!("<{value}>")) },
            )
            .await
            .unwrap();

        assert_eq!(value, "<3>");
        assert_eq!(script.calls(), ["evaluate abc"]);
        assert_eq!(coordinator.state(), ThreadState::Paused);
    }

    #[tokio::test]
    async fn nested_pause_during_evaluation_is_resumed() {
        let (coordinator, script) = coordinator();
        let (release, gate) = oneshot::channel();
        *script.evaluate_gate.lock() = Some(gate);

        let eval = tokio::spawn({
            let coordinator = coordinator.clone();
            async move {
                coordinator
                    .evaluate("hitsBreakpoint()".into(), None, grip_to_string, unchanged)
                    .await
            }
        });
        settle().await;
        assert_eq!(coordinator.state(), ThreadState::Evaluating);

        coordinator.on_paused();
        settle().await;
        assert_eq!(coordinator.state(), ThreadState::Evaluating);
        assert_eq!(script.calls(), ["evaluate hitsBreakpoint()", "resume"]);

        release.send(()).unwrap();
        eval.await.unwrap().unwrap();
        assert_eq!(coordinator.state(), ThreadState::Paused);
    }

    #[tokio::test]
    async fn interrupt_while_paused_is_a_no_op() {
        let (coordinator, script) = coordinator();

        coordinator.interrupt().await.unwrap();
        coordinator.interrupt().await.unwrap();

        assert!(script.calls().is_empty());
        assert_eq!(coordinator.state(), ThreadState::Paused);
    }

    #[tokio::test]
    async fn interrupt_and_resume_round_trip() {
        let (coordinator, script) = coordinator();

        coordinator.resume(None, Some(StepKind::Over)).await.unwrap();
        assert_eq!(coordinator.state(), ThreadState::Running);
        coordinator.resume(None, None).await.unwrap();
        coordinator.interrupt().await.unwrap();
        assert_eq!(coordinator.state(), ThreadState::Paused);

        assert_eq!(script.calls(), ["resume next", "interrupt"]);
    }

    #[tokio::test]
    async fn cleanup_runs_before_resume_is_sent() {
        let (coordinator, script) = coordinator();
        let cleanup: Cleanup = Box::new({
            let script = Arc::clone(&script);
            move || {
                Box::pin(async move {
                    tokio::task::yield_now().await;
                    script.record("cleanup");
                })
            }
        });

        coordinator.resume(Some(cleanup), None).await.unwrap();

        assert_eq!(script.calls(), ["cleanup", "resume"]);
    }

    #[tokio::test]
    async fn paused_task_interrupts_and_resumes_a_running_thread() {
        let (coordinator, script) = running_coordinator().await;

        let value = coordinator
            .run_on_paused_thread({
                let script = Arc::clone(&script);
                move || async move {
                    script.record("task");
                    Ok(7)
                }
            })
            .await
            .unwrap();
        settle().await;

        assert_eq!(value, 7);
        assert_eq!(script.calls(), ["interrupt", "task", "resume"]);
        assert_eq!(coordinator.state(), ThreadState::Running);
    }

    #[tokio::test]
    async fn user_interrupt_cancels_the_automatic_resume() {
        let (coordinator, script) = running_coordinator().await;
        let (release, gate) = oneshot::channel::<()>();

        let task = tokio::spawn({
            let coordinator = coordinator.clone();
            let script = Arc::clone(&script);
            async move {
                coordinator
                    .run_on_paused_thread(move || async move {
                        let _ = gate.await;
                        script.record("task");
                        Ok(())
                    })
                    .await
            }
        });
        settle().await;
        coordinator.interrupt().await.unwrap();
        release.send(()).unwrap();
        task.await.unwrap().unwrap();
        settle().await;

        assert_eq!(script.calls(), ["interrupt", "task"]);
        assert_eq!(coordinator.state(), ThreadState::Paused);
    }

    #[tokio::test]
    async fn postprocess_completes_before_queued_resume() {
        let (coordinator, script) = coordinator();
        let (release, gate) = oneshot::channel::<()>();

        let task = tokio::spawn({
            let coordinator = coordinator.clone();
            let task_script = Arc::clone(&script);
            let post_script = Arc::clone(&script);
            async move {
                coordinator
                    .run_on_paused_thread_with(
                        move || async move {
                            task_script.record("task");
                            Ok(())
                        },
                        move |()| async move {
                            let _ = gate.await;
                            post_script.record("postprocess");
                            Ok(())
                        },
                        true,
                    )
                    .await
            }
        });
        settle().await;
        let resume = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.resume(None, None).await }
        });
        settle().await;
        assert_eq!(script.calls(), ["task"]);

        release.send(()).unwrap();
        task.await.unwrap().unwrap();
        resume.await.unwrap().unwrap();

        assert_eq!(script.calls(), ["task", "postprocess", "resume"]);
    }

    #[tokio::test]
    async fn paused_task_is_rejected_once_a_resume_is_queued() {
        let (coordinator, _script) = coordinator();
        let (release, gate) = oneshot::channel::<()>();

        let blocker = tokio::spawn({
            let coordinator = coordinator.clone();
            async move {
                coordinator
                    .run_on_paused_thread(move || async move {
                        let _ = gate.await;
                        Ok(())
                    })
                    .await
            }
        });
        settle().await;
        let resume = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.resume(None, None).await }
        });
        settle().await;

        let err = coordinator
            .run_on_paused_thread(|| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::ThreadResuming), "{err:?}");

        release.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        resume.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn queued_evaluations_are_rejected_when_the_thread_resumes() {
        let (coordinator, script) = coordinator();
        let (release, gate) = oneshot::channel::<()>();

        let blocker = tokio::spawn({
            let coordinator = coordinator.clone();
            async move {
                coordinator
                    .run_on_paused_thread(move || async move {
                        let _ = gate.await;
                        Ok(())
                    })
                    .await
            }
        });
        settle().await;
        let eval = tokio::spawn({
            let coordinator = coordinator.clone();
            async move {
                coordinator
                    .evaluate("x".into(), None, grip_to_string, unchanged)
                    .await
            }
        });
        settle().await;

        coordinator.on_resumed();
        assert_eq!(coordinator.state(), ThreadState::Running);
        release.send(()).unwrap();
        blocker.await.unwrap().unwrap();

        let err = eval.await.unwrap().unwrap_err();
        assert!(matches!(err, CoordinatorError::ThreadRunning), "{err:?}");
        assert!(script.calls().is_empty());
    }

    #[tokio::test]
    async fn remote_pause_preempts_a_queued_resume() {
        let (coordinator, _script) = running_coordinator().await;
        coordinator.on_paused();
        assert_eq!(coordinator.state(), ThreadState::Paused);

        let (release, gate) = oneshot::channel::<()>();
        let blocker = tokio::spawn({
            let coordinator = coordinator.clone();
            async move {
                coordinator
                    .run_on_paused_thread(move || async move {
                        let _ = gate.await;
                        Ok(())
                    })
                    .await
            }
        });
        settle().await;
        let resume = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.resume(None, None).await }
        });
        settle().await;

        coordinator.on_paused();
        let err = resume.await.unwrap().unwrap_err();
        assert!(matches!(err, CoordinatorError::Preempted), "{err:?}");

        release.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        settle().await;
        assert_eq!(coordinator.state(), ThreadState::Paused);
    }

    #[tokio::test]
    async fn failed_interrupt_rejects_paused_tasks() {
        let (coordinator, script) = running_coordinator().await;
        *script.fail_interrupt.lock() = true;

        let err = coordinator
            .run_on_paused_thread(|| async { Ok(()) })
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinatorError::Actor(_)), "{err:?}");
        assert_eq!(coordinator.state(), ThreadState::Running);
    }

    #[tokio::test]
    async fn exception_breakpoints_force_a_resume_with_the_new_filter() {
        let (coordinator, script) = running_coordinator().await;

        coordinator.set_exception_breakpoints(ExceptionBreakpoints::All);
        tokio::time::timeout(Duration::from_secs(1), async {
            while script.calls().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(script.calls(), ["interrupt", "resume All"]);
        assert_eq!(coordinator.exception_breakpoints(), ExceptionBreakpoints::All);

        // Later resumes keep sending the new filter.
        coordinator.interrupt().await.unwrap();
        coordinator.resume(None, None).await.unwrap();
        assert_eq!(script.calls()[2..], ["interrupt", "resume All"]);
    }

    #[tokio::test]
    async fn shutdown_fails_queued_work() {
        let (coordinator, _script) = running_coordinator().await;
        coordinator.shutdown();

        let err = coordinator.interrupt().await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Shutdown), "{err:?}");
    }
}
