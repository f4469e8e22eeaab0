//! Per-operation timeouts and success/failure telemetry.
//!
//! Every outbound request is classified by an [`OpKind`] that carries a
//! default deadline. [`Telemetry`] counts outcomes per kind and decides when
//! the failure rate is high enough to restart the server.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Operation categories with their own timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// `textDocument/codeAction`.
    CodeAction,
    /// `textDocument/completion`.
    Completion,
    /// `textDocument/definition`.
    Definition,
    /// `workspace/executeCommand`.
    ExecuteCommand,
    /// Whole-document and range formatting.
    Formatting,
    /// Semantic tokens.
    Highlighting,
    /// `textDocument/hover`.
    Hover,
    /// The `initialize` handshake.
    Init,
    /// `textDocument/references`.
    References,
    /// The `shutdown` request.
    Shutdown,
    /// Workspace and document symbols.
    Symbols,
}

impl OpKind {
    /// All operation kinds, in declaration order.
    pub const ALL: [Self; 11] = [
        Self::CodeAction,
        Self::Completion,
        Self::Definition,
        Self::ExecuteCommand,
        Self::Formatting,
        Self::Highlighting,
        Self::Hover,
        Self::Init,
        Self::References,
        Self::Shutdown,
        Self::Symbols,
    ];

    /// The built-in timeout in milliseconds.
    pub const fn default_millis(self) -> u64 {
        match self {
            Self::Completion => 1000,
            Self::Init => 10_000,
            Self::Shutdown => 5000,
            Self::CodeAction
            | Self::Definition
            | Self::ExecuteCommand
            | Self::Formatting
            | Self::Highlighting
            | Self::Hover
            | Self::References
            | Self::Symbols => 2000,
        }
    }

    /// Stable name used in configuration and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CodeAction => "code_action",
            Self::Completion => "completion",
            Self::Definition => "definition",
            Self::ExecuteCommand => "execute_command",
            Self::Formatting => "formatting",
            Self::Highlighting => "highlighting",
            Self::Hover => "hover",
            Self::Init => "init",
            Self::References => "references",
            Self::Shutdown => "shutdown",
            Self::Symbols => "symbols",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown operation kind '{s}'"))
    }
}

/// Process-wide timeout table, readable from any task.
#[derive(Debug)]
pub struct Timeouts {
    values: RwLock<HashMap<OpKind, u64>>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            values: RwLock::new(
                OpKind::ALL
                    .into_iter()
                    .map(|kind| (kind, kind.default_millis()))
                    .collect(),
            ),
        }
    }
}

impl Timeouts {
    /// Creates a table with the default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table with every default multiplied by `factor`.
    pub fn scaled(factor: u64) -> Self {
        let timeouts = Self::default();
        for kind in OpKind::ALL {
            timeouts.set(kind, kind.default_millis().saturating_mul(factor.max(1)));
        }
        timeouts
    }

    /// The timeout for an operation kind.
    pub fn get(&self, kind: OpKind) -> Duration {
        Duration::from_millis(self.millis(kind))
    }

    /// The timeout for an operation kind, in milliseconds.
    pub fn millis(&self, kind: OpKind) -> u64 {
        self.values
            .read()
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_millis())
    }

    /// Overrides one timeout.
    pub fn set(&self, kind: OpKind, millis: u64) {
        self.values.write().insert(kind, millis);
    }

    /// Overrides several timeouts at once.
    pub fn set_all(&self, overrides: impl IntoIterator<Item = (OpKind, u64)>) {
        let mut values = self.values.write();
        for (kind, millis) in overrides {
            values.insert(kind, millis);
        }
    }

    /// A sorted copy of the table.
    pub fn snapshot(&self) -> BTreeMap<OpKind, u64> {
        self.values.read().iter().map(|(k, v)| (*k, *v)).collect()
    }
}

/// When and how fast a crashed or failing server is restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Failures within `window` that trigger a restart; 0 disables
    /// failure-driven restarts.
    pub max_failures: u32,
    /// Sliding window for counting failures.
    #[serde(with = "millis")]
    pub window: Duration,
    /// Delay before the first restart attempt.
    #[serde(with = "millis")]
    pub initial_backoff: Duration,
    /// Upper bound for the restart delay.
    #[serde(with = "millis")]
    pub max_backoff: Duration,
    /// Consecutive restart attempts before the connection rests crashed.
    pub max_restarts: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_failures: 5,
            window: Duration::from_secs(60),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_restarts: 5,
        }
    }
}

impl RestartPolicy {
    /// Delay before restart attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << shift)
            .min(self.max_backoff)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Outcome counters for one operation kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OpStats {
    /// Requests that returned within their deadline.
    pub successes: u64,
    /// Requests that timed out or failed.
    pub failures: u64,
}

#[derive(Debug, Default)]
struct StatsEntry {
    stats: OpStats,
    recent_failures: VecDeque<Instant>,
}

/// Per-connection request outcome tracking.
#[derive(Debug)]
pub struct Telemetry {
    policy: RestartPolicy,
    entries: Mutex<HashMap<OpKind, StatsEntry>>,
}

impl Telemetry {
    /// Creates telemetry governed by a restart policy.
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The restart policy in effect.
    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Records a successful request.
    pub fn notify_success(&self, kind: OpKind) {
        self.entries.lock().entry(kind).or_default().stats.successes += 1;
    }

    /// Records a failed or timed out request.
    ///
    /// Returns true when the failures inside the policy window reach the
    /// threshold; the window is then cleared so one burst triggers one
    /// restart.
    pub fn notify_failure(&self, kind: OpKind) -> bool {
        self.notify_failure_at(kind, Instant::now())
    }

    fn notify_failure_at(&self, kind: OpKind, now: Instant) -> bool {
        let mut entries = self.entries.lock();
        let entry = entries.entry(kind).or_default();
        entry.stats.failures += 1;
        entry.recent_failures.push_back(now);
        while entry
            .recent_failures
            .front()
            .is_some_and(|at| now.duration_since(*at) > self.policy.window)
        {
            entry.recent_failures.pop_front();
        }
        let exceeded = self.policy.max_failures > 0
            && entry.recent_failures.len() >= usize::try_from(self.policy.max_failures).unwrap_or(usize::MAX);
        if exceeded {
            entry.recent_failures.clear();
        }
        exceeded
    }

    /// Counters for one kind.
    pub fn stats(&self, kind: OpKind) -> OpStats {
        self.entries
            .lock()
            .get(&kind)
            .map(|entry| entry.stats)
            .unwrap_or_default()
    }

    /// Counters for every kind that saw traffic.
    pub fn snapshot(&self) -> BTreeMap<OpKind, OpStats> {
        self.entries
            .lock()
            .iter()
            .map(|(kind, entry)| (*kind, entry.stats))
            .collect()
    }
}
