use std::sync::Arc;

use rdp_wire::{
    actors::{ConsoleActorProxy, ThreadActorProxy},
    ActorError, Evaluation, ExceptionBreakpoints, StepKind,
};

use crate::thread_coordinator::ThreadControl;

/// [`ThreadControl`] over a thread actor and the console actor of its tab.
#[derive(Clone)]
pub struct RemoteThread {
    thread: Arc<ThreadActorProxy>,
    console: Option<Arc<ConsoleActorProxy>>,
}

impl RemoteThread {
    pub fn new(thread: Arc<ThreadActorProxy>, console: Option<Arc<ConsoleActorProxy>>) -> Self {
        Self { thread, console }
    }

    pub fn thread(&self) -> &Arc<ThreadActorProxy> {
        &self.thread
    }
}

impl ThreadControl for RemoteThread {
    async fn interrupt(&self) -> Result<(), ActorError> {
        let paused = self.thread.interrupt().await?;
        tracing::trace!(target: "rdp.bridge", why = %paused.why, "interrupt acknowledged");
        Ok(())
    }

    async fn resume(
        &self,
        exceptions: ExceptionBreakpoints,
        step: Option<StepKind>,
    ) -> Result<(), ActorError> {
        self.thread.resume(exceptions, step).await
    }

    async fn evaluate(
        &self,
        expression: String,
        frame_actor: Option<String>,
    ) -> Result<Evaluation, ActorError> {
        let console = self
            .console
            .as_ref()
            .ok_or(ActorError::Unavailable("console actor"))?;
        console.evaluate(&expression, frame_actor.as_deref()).await
    }
}
