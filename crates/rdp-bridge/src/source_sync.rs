//! Per-source breakpoint reconciliation.
//!
//! Each source converges its installed breakpoints to the desired set in a
//! background task. Only one reconciliation runs per source; updates that
//! arrive meanwhile are picked up by another pass once it finishes.

use std::{future::Future, sync::Arc};

use parking_lot::Mutex;
use tokio::task::JoinSet;

use rdp_wire::{actors::BreakpointPositions, SourcePosition};

use crate::{
    breakpoints::{resolve_position, BreakpointInfo, BreakpointSink, Verifier},
    error::CoordinatorResult,
};

/// How breakpoints are put into and taken out of one remote source.
pub trait BreakpointBackend: Send + Sync + 'static {
    type Handle: Send + 'static;

    /// Settable positions, in the coordinates breakpoints are requested in.
    fn positions(&self) -> impl Future<Output = CoordinatorResult<BreakpointPositions>> + Send;

    /// Install `info` at `position`; returns the handle and the position the
    /// debuggee reports it ended up at.
    fn add(
        &self,
        info: Arc<BreakpointInfo>,
        position: SourcePosition,
    ) -> impl Future<Output = CoordinatorResult<(Self::Handle, SourcePosition)>> + Send;

    fn remove(&self, handle: Self::Handle) -> impl Future<Output = CoordinatorResult<()>> + Send;
}

struct Installed<H> {
    info: Arc<BreakpointInfo>,
    handle: H,
}

struct SyncState<H> {
    desired: Vec<Arc<BreakpointInfo>>,
    generation: u64,
    syncing: bool,
    disposed: bool,
    installed: Vec<Installed<H>>,
}

struct SyncInner<B: BreakpointBackend> {
    key: String,
    backend: B,
    verifier: Verifier,
    state: Mutex<SyncState<B::Handle>>,
}

pub struct SourceBreakpoints<B: BreakpointBackend> {
    inner: Arc<SyncInner<B>>,
}

impl<B: BreakpointBackend> SourceBreakpoints<B> {
    pub fn new(key: impl Into<String>, backend: B, verifier: Verifier) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                key: key.into(),
                backend,
                verifier,
                state: Mutex::new(SyncState {
                    desired: Vec::new(),
                    generation: 0,
                    syncing: false,
                    disposed: false,
                    installed: Vec::new(),
                }),
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// Ids of the breakpoints currently installed remotely.
    pub fn installed(&self) -> Vec<u64> {
        self.inner
            .state
            .lock()
            .installed
            .iter()
            .map(|installed| installed.info.id())
            .collect()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.state.lock().syncing
    }
}

impl<B: BreakpointBackend> BreakpointSink for SourceBreakpoints<B> {
    fn source_key(&self) -> &str {
        &self.inner.key
    }

    fn update_breakpoints(&self, breakpoints: Vec<Arc<BreakpointInfo>>) {
        let start = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.desired = breakpoints;
            state.generation += 1;
            !std::mem::replace(&mut state.syncing, true)
        };
        if start {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.sync_loop().await });
        }
    }

    fn dispose(&self) {
        let mut state = self.inner.state.lock();
        state.disposed = true;
        state.desired.clear();
        state.installed.clear();
    }
}

impl<B: BreakpointBackend> SyncInner<B> {
    async fn sync_loop(self: Arc<Self>) {
        loop {
            let (desired, generation, installed) = {
                let mut state = self.state.lock();
                if state.disposed {
                    state.syncing = false;
                    return;
                }
                (
                    state.desired.clone(),
                    state.generation,
                    std::mem::take(&mut state.installed),
                )
            };

            let installed = Arc::clone(&self).reconcile(desired, installed).await;

            let settled = {
                let mut state = self.state.lock();
                if !state.disposed {
                    state.installed = installed;
                }
                if state.disposed || state.generation == generation {
                    state.syncing = false;
                    true
                } else {
                    false
                }
            };
            if settled {
                return;
            }
            tracing::debug!(target: "rdp.bridge", source = %self.key, "breakpoints changed during sync");
        }
    }

    async fn reconcile(
        self: Arc<Self>,
        desired: Vec<Arc<BreakpointInfo>>,
        installed: Vec<Installed<B::Handle>>,
    ) -> Vec<Installed<B::Handle>> {
        // Pair every installed breakpoint with at most one equivalent desired one.
        let mut claimed = vec![false; desired.len()];
        let mut keep = Vec::new();
        let mut delete = Vec::new();
        for entry in installed {
            let matched = desired.iter().enumerate().position(|(idx, info)| {
                !claimed[idx] && info.is_equivalent(&entry.info)
            });
            match matched {
                Some(idx) => {
                    claimed[idx] = true;
                    let info = &desired[idx];
                    if !Arc::ptr_eq(info, &entry.info) {
                        if let Some(actual) = entry.info.verification().actual {
                            self.verifier.verify(info, actual);
                        }
                    }
                    keep.push(Installed {
                        info: Arc::clone(info),
                        handle: entry.handle,
                    });
                }
                None => delete.push(entry),
            }
        }
        let add: Vec<Arc<BreakpointInfo>> = desired
            .into_iter()
            .zip(claimed)
            .filter(|(_, claimed)| !claimed)
            .map(|(info, _)| info)
            .collect();

        tracing::debug!(
            target: "rdp.bridge",
            source = %self.key,
            keep = keep.len(),
            delete = delete.len(),
            add = add.len(),
            "reconciling breakpoints"
        );

        if !delete.is_empty() {
            let mut removals = JoinSet::new();
            for entry in delete {
                let this = Arc::clone(&self);
                removals.spawn(async move {
                    let id = entry.info.id();
                    (id, this.backend.remove(entry.handle).await)
                });
            }
            while let Some(joined) = removals.join_next().await {
                match joined {
                    Ok((_, Ok(()))) => {}
                    Ok((id, Err(err))) => tracing::warn!(
                        target: "rdp.bridge",
                        source = %self.key,
                        id,
                        error = %err,
                        "failed to remove breakpoint"
                    ),
                    Err(err) => tracing::warn!(
                        target: "rdp.bridge",
                        source = %self.key,
                        error = %err,
                        "breakpoint removal task failed"
                    ),
                }
            }
        }

        let mut installed = keep;
        if add.is_empty() {
            return installed;
        }

        // Without a positions map the debuggee places breakpoints itself and
        // reports where they landed.
        let positions = match self.backend.positions().await {
            Ok(positions) if !positions.is_empty() => Some(positions),
            Ok(_) => None,
            Err(err) => {
                tracing::debug!(
                    target: "rdp.bridge",
                    source = %self.key,
                    error = %err,
                    "breakpoint positions unavailable; installing at requested positions"
                );
                None
            }
        };

        let mut additions = JoinSet::new();
        for info in add {
            let requested = info.position();
            let position = match &positions {
                Some(positions) => resolve_position(requested, positions),
                None => Some(requested),
            };
            let Some(position) = position else {
                tracing::debug!(
                    target: "rdp.bridge",
                    source = %self.key,
                    id = info.id(),
                    "no settable position for breakpoint"
                );
                continue;
            };
            let this = Arc::clone(&self);
            additions.spawn(async move {
                let result = this.backend.add(Arc::clone(&info), position).await;
                (info, result)
            });
        }
        while let Some(joined) = additions.join_next().await {
            match joined {
                Ok((info, Ok((handle, actual)))) => {
                    self.verifier.verify(&info, actual);
                    installed.push(Installed { info, handle });
                }
                Ok((info, Err(err))) => tracing::warn!(
                    target: "rdp.bridge",
                    source = %self.key,
                    id = info.id(),
                    error = %err,
                    "failed to install breakpoint"
                ),
                Err(err) => tracing::warn!(
                    target: "rdp.bridge",
                    source = %self.key,
                    error = %err,
                    "breakpoint install task failed"
                ),
            }
        }
        installed
    }
}
