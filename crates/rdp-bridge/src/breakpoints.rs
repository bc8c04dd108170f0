//! Desired breakpoints per source key and their verification state.
//!
//! The manager owns what the client asked for. Each loaded source registers a
//! [`BreakpointSink`] under its key and converges the remote side towards the
//! desired set on its own (see [`crate::source_sync`]).

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use rdp_wire::{actors::BreakpointPositions, IdGenerator, SourcePosition};

/// A breakpoint as requested by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceBreakpoint {
    pub line: u32,
    #[serde(default)]
    pub column: Option<u32>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub hit_condition: Option<String>,
    #[serde(default)]
    pub log_message: Option<String>,
}

impl SourceBreakpoint {
    pub fn at_line(line: u32) -> Self {
        Self {
            line,
            ..Self::default()
        }
    }

    pub fn position(&self) -> SourcePosition {
        SourcePosition {
            line: self.line,
            column: self.column.unwrap_or(0),
        }
    }

    /// Hit conditions are counted locally (see [`BreakpointInfo::register_hit`])
    /// and do not affect what is installed remotely.
    pub fn is_equivalent(&self, other: &SourceBreakpoint) -> bool {
        self.line == other.line
            && self.column == other.column
            && self.condition == other.condition
            && self.log_message == other.log_message
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Verification {
    pub verified: bool,
    pub actual: Option<SourcePosition>,
}

/// When a breakpoint hit actually stops the thread, given how often the
/// breakpoint has been hit (1-based).
///
/// Accepts `N` (same as `>= N`), `= N`/`== N`, `> N`, `>= N`, `< N`, `<= N`
/// and `% N` (every Nth hit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitCondition {
    Equal(u64),
    Greater(u64),
    AtLeast(u64),
    Less(u64),
    AtMost(u64),
    Every(u64),
}

impl HitCondition {
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let split = text
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(text.len());
        let (op, count) = text.split_at(split);
        let count: u64 = count.trim().parse().ok()?;
        let condition = match op.trim() {
            "" | ">=" => HitCondition::AtLeast(count),
            "=" | "==" => HitCondition::Equal(count),
            ">" => HitCondition::Greater(count),
            "<" => HitCondition::Less(count),
            "<=" => HitCondition::AtMost(count),
            "%" if count > 0 => HitCondition::Every(count),
            _ => return None,
        };
        Some(condition)
    }

    pub fn matches(self, hits: u64) -> bool {
        match self {
            HitCondition::Equal(n) => hits == n,
            HitCondition::Greater(n) => hits > n,
            HitCondition::AtLeast(n) => hits >= n,
            HitCondition::Less(n) => hits < n,
            HitCondition::AtMost(n) => hits <= n,
            HitCondition::Every(n) => hits % n == 0,
        }
    }
}

#[derive(Debug, Default)]
struct HitCounter {
    condition: Option<String>,
    hits: u64,
}

#[derive(Debug)]
pub struct BreakpointInfo {
    id: u64,
    /// Everything that is installed remotely; the hit condition lives in
    /// `hits` so it can change without a new id.
    requested: SourceBreakpoint,
    hits: Mutex<HitCounter>,
    verification: Mutex<Verification>,
}

impl BreakpointInfo {
    pub fn new(id: u64, mut requested: SourceBreakpoint) -> Self {
        let condition = requested.hit_condition.take();
        Self {
            id,
            requested,
            hits: Mutex::new(HitCounter { condition, hits: 0 }),
            verification: Mutex::new(Verification::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The request as last set by the client.
    pub fn requested(&self) -> SourceBreakpoint {
        SourceBreakpoint {
            hit_condition: self.hits.lock().condition.clone(),
            ..self.requested.clone()
        }
    }

    pub fn position(&self) -> SourcePosition {
        self.requested.position()
    }

    /// Same remote installation as `other`.
    pub fn is_equivalent(&self, other: &BreakpointInfo) -> bool {
        self.requested.is_equivalent(&other.requested)
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.lock().hits
    }

    /// Replace the hit condition. A changed condition restarts the count.
    pub fn set_hit_condition(&self, condition: Option<String>) {
        let mut hits = self.hits.lock();
        if hits.condition != condition {
            hits.condition = condition;
            hits.hits = 0;
        }
    }

    /// Count one hit and report whether the thread should stay paused.
    /// Unparseable conditions always stop.
    pub fn register_hit(&self) -> bool {
        let mut counter = self.hits.lock();
        counter.hits += 1;
        let Some(text) = counter.condition.as_deref() else {
            return true;
        };
        match HitCondition::parse(text) {
            Some(condition) => condition.matches(counter.hits),
            None => {
                tracing::warn!(
                    target: "rdp.bridge",
                    id = self.id,
                    "unparseable hit condition; stopping on every hit"
                );
                true
            }
        }
    }

    pub fn verification(&self) -> Verification {
        *self.verification.lock()
    }

    pub fn is_verified(&self) -> bool {
        self.verification.lock().verified
    }
}

/// Emitted whenever a breakpoint's verified flag or resolved position changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointChanged {
    pub id: u64,
    pub verified: bool,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

/// Records verification results and announces the ones that changed.
#[derive(Clone)]
pub struct Verifier {
    changes: broadcast::Sender<BreakpointChanged>,
}

impl Verifier {
    pub fn verify(&self, info: &BreakpointInfo, actual: SourcePosition) {
        self.update(
            info,
            Verification {
                verified: true,
                actual: Some(actual),
            },
        );
    }

    pub fn unverify(&self, info: &BreakpointInfo) {
        self.update(info, Verification::default());
    }

    fn update(&self, info: &BreakpointInfo, next: Verification) {
        {
            let mut current = info.verification.lock();
            if *current == next {
                return;
            }
            *current = next;
        }
        tracing::debug!(
            target: "rdp.bridge",
            id = info.id,
            verified = next.verified,
            actual = ?next.actual,
            "breakpoint verification changed"
        );
        // Nobody listening is fine.
        let _ = self.changes.send(BreakpointChanged {
            id: info.id,
            verified: next.verified,
            line: next.actual.map(|p| p.line),
            column: next.actual.map(|p| p.column),
        });
    }
}

/// A loaded source that installs breakpoints for one source key.
pub trait BreakpointSink: Send + Sync + 'static {
    fn source_key(&self) -> &str;

    /// Replace the desired set. Returns immediately; installation happens in
    /// the background.
    fn update_breakpoints(&self, breakpoints: Vec<Arc<BreakpointInfo>>);

    /// The source went away. Installed handles are forgotten without remote
    /// calls.
    fn dispose(&self);
}

#[derive(Default)]
struct ManagerState {
    desired: HashMap<String, Vec<Arc<BreakpointInfo>>>,
    sources: HashMap<String, Vec<Arc<dyn BreakpointSink>>>,
}

pub struct BreakpointsManager {
    ids: IdGenerator,
    state: Mutex<ManagerState>,
    verifier: Verifier,
}

impl BreakpointsManager {
    pub fn new(event_channel_size: usize) -> Self {
        let (changes, _) = broadcast::channel(event_channel_size.max(1));
        Self {
            ids: IdGenerator::default(),
            state: Mutex::new(ManagerState::default()),
            verifier: Verifier { changes },
        }
    }

    pub fn verifier(&self) -> Verifier {
        self.verifier.clone()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<BreakpointChanged> {
        self.verifier.changes.subscribe()
    }

    /// Replace the breakpoints of `source_key`. Entries equivalent to a
    /// previous request keep their info (and id); the rest get fresh ids.
    pub fn set_breakpoints(
        &self,
        source_key: &str,
        breakpoints: Vec<SourceBreakpoint>,
    ) -> Vec<Arc<BreakpointInfo>> {
        let (infos, sinks) = {
            let mut state = self.state.lock();
            let mut previous = state.desired.remove(source_key).unwrap_or_default();
            let infos: Vec<Arc<BreakpointInfo>> = breakpoints
                .into_iter()
                .map(|requested| {
                    match previous
                        .iter()
                        .position(|info| info.requested.is_equivalent(&requested))
                    {
                        Some(idx) => {
                            let info = previous.swap_remove(idx);
                            info.set_hit_condition(requested.hit_condition);
                            info
                        }
                        None => Arc::new(BreakpointInfo::new(self.ids.next(), requested)),
                    }
                })
                .collect();
            if !infos.is_empty() {
                state.desired.insert(source_key.to_string(), infos.clone());
            }
            let sinks = state.sources.get(source_key).cloned().unwrap_or_default();
            (infos, sinks)
        };

        tracing::debug!(
            target: "rdp.bridge",
            source = source_key,
            breakpoints = infos.len(),
            sources = sinks.len(),
            "breakpoints set"
        );
        for sink in sinks {
            sink.update_breakpoints(infos.clone());
        }
        infos
    }

    /// The breakpoints currently requested for `source_key`.
    pub fn breakpoints(&self, source_key: &str) -> Vec<Arc<BreakpointInfo>> {
        self.state
            .lock()
            .desired
            .get(source_key)
            .cloned()
            .unwrap_or_default()
    }

    /// The breakpoints of `source_key` the debuggee placed on `line`.
    pub fn breakpoints_at(&self, source_key: &str, line: u32) -> Vec<Arc<BreakpointInfo>> {
        self.breakpoints(source_key)
            .into_iter()
            .filter(|info| {
                let verification = info.verification();
                verification.verified && verification.actual.map(|p| p.line) == Some(line)
            })
            .collect()
    }

    /// Register a newly loaded source and hand it whatever was already
    /// requested for its key.
    pub fn on_new_source(&self, sink: Arc<dyn BreakpointSink>) {
        let desired = {
            let mut state = self.state.lock();
            let key = sink.source_key().to_string();
            let desired = state.desired.get(&key).cloned().unwrap_or_default();
            state.sources.entry(key).or_default().push(Arc::clone(&sink));
            desired
        };
        if !desired.is_empty() {
            sink.update_breakpoints(desired);
        }
    }

    /// Drop every source registered under `source_key`, e.g. on navigation.
    pub fn remove_source(&self, source_key: &str) {
        let sinks = self.state.lock().sources.remove(source_key);
        for sink in sinks.into_iter().flatten() {
            sink.dispose();
        }
    }

    /// Dispose every registered source.
    pub fn clear_sources(&self) {
        let sinks: Vec<_> = self.state.lock().sources.drain().collect();
        for sink in sinks.into_iter().flat_map(|(_, sinks)| sinks) {
            sink.dispose();
        }
    }
}

/// Map a requested position onto a settable one: the smallest line at or
/// after the requested line (the largest line when none follows), then the
/// smallest column at or after the requested column on that line (its first
/// column when none follows).
pub fn resolve_position(
    requested: SourcePosition,
    positions: &BreakpointPositions,
) -> Option<SourcePosition> {
    let (&line, columns) = positions
        .range(requested.line..)
        .next()
        .or_else(|| positions.iter().next_back())?;
    let column = columns
        .iter()
        .copied()
        .find(|&column| column >= requested.column)
        .or_else(|| columns.first().copied())
        .unwrap_or(0);
    Some(SourcePosition { line, column })
}
