//! Process-wide arbiter deciding which thread may pause or resume next.
//!
//! Debuggees that share one event loop between threads (a page and its
//! workers, for example) cannot resume an older pause while a newer one is
//! still active. Pauses therefore form a stack, and every coordinator asks
//! here for permission before interrupting or resuming its thread.

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{CoordinatorError, CoordinatorResult};

pub type ThreadId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseType {
    /// Paused by the bridge itself to run paused-thread work; resumed again
    /// without user involvement.
    Auto,
    /// Paused on user request or by the debuggee (breakpoint, step, exception).
    User,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PauseRecord {
    pub thread_id: ThreadId,
    pub thread_name: String,
    pub pause_type: PauseType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Pausing(ThreadId),
    Resuming(ThreadId),
}

impl Transition {
    fn thread_id(self) -> ThreadId {
        match self {
            Transition::Pausing(id) | Transition::Resuming(id) => id,
        }
    }
}

struct PauseRequest {
    thread_id: ThreadId,
    pause_type: PauseType,
    grant: oneshot::Sender<()>,
}

struct ResumeRequest {
    thread_id: ThreadId,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct State {
    /// Paused threads, most recently paused last.
    pauses: Vec<PauseRecord>,
    /// Pending pause requests, most recently requested last.
    pause_requests: Vec<PauseRequest>,
    resume_requests: Vec<ResumeRequest>,
    transitioning: Option<Transition>,
}

/// Resolves once the arbiter lets the requester go ahead.
///
/// The holder must report the outcome (`notify_*` or `notify_*_failed`) once
/// the permission has been granted, otherwise no other thread can transition.
#[derive(Debug)]
pub struct Permit {
    rx: oneshot::Receiver<()>,
}

impl Permit {
    fn granted_now() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(());
        Self { rx }
    }

    pub async fn granted(self) -> CoordinatorResult<()> {
        self.rx.await.map_err(|_| CoordinatorError::Shutdown)
    }
}

#[derive(Default)]
pub struct ThreadPauseCoordinator {
    state: Mutex<State>,
}

impl ThreadPauseCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_pause(&self, thread_id: ThreadId, thread_name: &str, pause_type: PauseType) -> Permit {
        let (grant, rx) = oneshot::channel();
        let mut state = self.state.lock();
        tracing::trace!(target: "rdp.bridge", thread_id, thread = thread_name, ?pause_type, "pause requested");
        state.pause_requests.push(PauseRequest {
            thread_id,
            pause_type,
            grant,
        });
        do_next(&mut state);
        Permit { rx }
    }

    /// Ask to resume `thread_id`.
    ///
    /// Fails up front if the thread's pause is a user pause and a more recent
    /// user pause of another thread is still active.
    pub fn request_resume(&self, thread_id: ThreadId, thread_name: &str) -> CoordinatorResult<Permit> {
        let mut state = self.state.lock();
        let Some(idx) = state.pauses.iter().position(|p| p.thread_id == thread_id) else {
            tracing::warn!(
                target: "rdp.bridge",
                thread_id,
                thread = thread_name,
                "resume requested for a thread that is not paused"
            );
            return Ok(Permit::granted_now());
        };

        if state.pauses[idx].pause_type == PauseType::User {
            let blocking: Vec<String> = state.pauses[idx + 1..]
                .iter()
                .filter(|p| p.pause_type == PauseType::User)
                .map(|p| p.thread_name.clone())
                .collect();
            if !blocking.is_empty() {
                return Err(CoordinatorError::HinderedResume {
                    thread: thread_name.to_string(),
                    blocking,
                });
            }
        }

        let (grant, rx) = oneshot::channel();
        state.resume_requests.push(ResumeRequest { thread_id, grant });
        do_next(&mut state);
        Ok(Permit { rx })
    }

    pub fn notify_paused(&self, thread_id: ThreadId, thread_name: &str, pause_type: PauseType) {
        let mut state = self.state.lock();
        let mut was_resuming = false;
        match state.transitioning {
            Some(Transition::Pausing(id)) if id == thread_id => state.transitioning = None,
            Some(Transition::Resuming(id)) if id == thread_id => {
                // The thread stopped again (e.g. a step finished) before the
                // resume was acknowledged.
                tracing::debug!(target: "rdp.bridge", thread_id, "paused while resuming");
                state.transitioning = None;
                was_resuming = true;
            }
            _ => {}
        }

        if let Some(idx) = state.pauses.iter().position(|p| p.thread_id == thread_id) {
            state.pauses.remove(idx);
            if !was_resuming {
                tracing::warn!(
                    target: "rdp.bridge",
                    thread_id,
                    thread = thread_name,
                    "paused notification for a thread already recorded as paused"
                );
            }
        }
        state.pauses.push(PauseRecord {
            thread_id,
            thread_name: thread_name.to_string(),
            pause_type,
        });
        do_next(&mut state);
    }

    pub fn notify_resumed(&self, thread_id: ThreadId, thread_name: &str) {
        let mut state = self.state.lock();
        match state.transitioning {
            Some(Transition::Resuming(id)) if id == thread_id => state.transitioning = None,
            Some(Transition::Pausing(id)) if id == thread_id => {
                tracing::warn!(target: "rdp.bridge", thread_id, thread = thread_name, "resumed while pausing");
                state.transitioning = None;
            }
            _ => {}
        }

        match state.pauses.iter().position(|p| p.thread_id == thread_id) {
            Some(idx) => {
                if idx + 1 != state.pauses.len() {
                    tracing::warn!(
                        target: "rdp.bridge",
                        thread_id,
                        thread = thread_name,
                        "thread resumed while more recently paused threads are still paused"
                    );
                }
                state.pauses.remove(idx);
            }
            None => {
                tracing::warn!(
                    target: "rdp.bridge",
                    thread_id,
                    thread = thread_name,
                    "resumed notification for a thread not recorded as paused"
                );
            }
        }
        do_next(&mut state);
    }

    /// A user asked for a pause the bridge had already made on its own.
    pub fn promote_to_user_pause(&self, thread_id: ThreadId) {
        let mut state = self.state.lock();
        if let Some(record) = state.pauses.iter_mut().find(|p| p.thread_id == thread_id) {
            record.pause_type = PauseType::User;
        }
    }

    /// The granted pause could not be carried out.
    pub fn notify_pause_failed(&self, thread_id: ThreadId) {
        self.release(thread_id, Transition::Pausing(thread_id));
    }

    /// The granted resume could not be carried out; the thread stays paused.
    pub fn notify_resume_failed(&self, thread_id: ThreadId) {
        self.release(thread_id, Transition::Resuming(thread_id));
    }

    fn release(&self, thread_id: ThreadId, expected: Transition) {
        let mut state = self.state.lock();
        if state.transitioning == Some(expected) {
            state.transitioning = None;
        } else {
            tracing::warn!(
                target: "rdp.bridge",
                thread_id,
                transitioning = ?state.transitioning.map(Transition::thread_id),
                "transition failure reported for a thread that was not transitioning"
            );
        }
        do_next(&mut state);
    }

    /// Drop every trace of a thread that went away.
    pub fn forget_thread(&self, thread_id: ThreadId) {
        let mut state = self.state.lock();
        state.pauses.retain(|p| p.thread_id != thread_id);
        state.pause_requests.retain(|r| r.thread_id != thread_id);
        state.resume_requests.retain(|r| r.thread_id != thread_id);
        if state.transitioning.map(Transition::thread_id) == Some(thread_id) {
            state.transitioning = None;
        }
        do_next(&mut state);
    }

    /// Snapshot of the pause stack, most recently paused last.
    pub fn paused_threads(&self) -> Vec<PauseRecord> {
        self.state.lock().pauses.clone()
    }
}

fn do_next(state: &mut State) {
    loop {
        if state.transitioning.is_some() {
            return;
        }

        if let Some(top) = state.pauses.last() {
            let (top_id, top_type) = (top.thread_id, top.pause_type);

            if let Some(idx) = state.resume_requests.iter().position(|r| r.thread_id == top_id) {
                let request = state.resume_requests.remove(idx);
                if request.grant.send(()).is_ok() {
                    state.transitioning = Some(Transition::Resuming(top_id));
                    return;
                }
                // The requester gave up; look again.
                continue;
            }

            if top_type == PauseType::Auto {
                if let Some(idx) = state
                    .pause_requests
                    .iter()
                    .rposition(|r| r.pause_type == PauseType::Auto)
                {
                    let request = state.pause_requests.remove(idx);
                    if request.grant.send(()).is_ok() {
                        state.transitioning = Some(Transition::Pausing(request.thread_id));
                        return;
                    }
                    continue;
                }
            }
        }

        let Some(request) = state.pause_requests.pop() else {
            return;
        };
        if request.grant.send(()).is_ok() {
            state.transitioning = Some(Transition::Pausing(request.thread_id));
            return;
        }
    }
}
