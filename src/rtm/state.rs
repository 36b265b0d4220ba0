//! Mutable connection state shared by the manager's loops.
//!
//! Every field lives behind one mutex and is only reachable through the
//! read-modify-write methods below. The lock is never held across an await.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::time::Instant;

/// Lifecycle phase of a connection manager.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ManagerState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Terminated,
}

impl std::fmt::Display for ManagerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Outstanding liveness probes, oldest first.
///
/// Probes leave the table only when acknowledged or when the connection is
/// declared dead, so the oldest entry always ages into a timeout. A full
/// table refuses new probes.
#[derive(Debug)]
pub(crate) struct PingTable {
    capacity: usize,
    entries: VecDeque<(u64, Instant)>,
}

impl PingTable {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Records a probe. Returns `false` without recording when the table is
    /// full.
    pub(crate) fn insert(&mut self, id: u64, sent_at: Instant) -> bool {
        if self.entries.len() >= self.capacity {
            return false;
        }
        self.entries.push_back((id, sent_at));
        true
    }

    /// Removes an acknowledged probe and returns when it was sent.
    pub(crate) fn ack(&mut self, id: u64) -> Option<Instant> {
        let index = self.entries.iter().position(|(entry, _)| *entry == id)?;
        self.entries.remove(index).map(|(_, sent_at)| sent_at)
    }

    pub(crate) fn oldest(&self) -> Option<(u64, Instant)> {
        self.entries.front().copied()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug)]
struct Inner {
    phase: ManagerState,
    started: bool,
    is_connected: bool,
    was_intentional: bool,
    has_connected: bool,
    connection_count: u64,
    pings: PingTable,
}

#[derive(Debug)]
pub(crate) struct ConnectionState {
    inner: Mutex<Inner>,
    phase_tx: watch::Sender<ManagerState>,
}

impl ConnectionState {
    pub(crate) fn new(ping_capacity: usize) -> Self {
        let (phase_tx, _) = watch::channel(ManagerState::Idle);
        Self {
            inner: Mutex::new(Inner {
                phase: ManagerState::Idle,
                started: false,
                is_connected: false,
                was_intentional: true,
                has_connected: false,
                connection_count: 0,
                pings: PingTable::new(ping_capacity),
            }),
            phase_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, inner: &mut Inner, phase: ManagerState) {
        inner.phase = phase;
        self.phase_tx.send_replace(phase);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ManagerState> {
        self.phase_tx.subscribe()
    }

    pub(crate) fn phase(&self) -> ManagerState {
        self.lock().phase
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.lock().is_connected
    }

    pub(crate) fn has_connected(&self) -> bool {
        self.lock().has_connected
    }

    pub(crate) fn connection_count(&self) -> u64 {
        self.lock().connection_count
    }

    /// Claims the right to run the supervisor. Fails once started or after
    /// termination.
    pub(crate) fn start(&self) -> bool {
        let mut inner = self.lock();
        if inner.started || inner.phase == ManagerState::Terminated {
            return false;
        }
        inner.started = true;
        inner.was_intentional = false;
        true
    }

    /// Enters `Connecting` unless a disconnect has been requested.
    pub(crate) fn begin_connect(&self) -> bool {
        let mut inner = self.lock();
        if inner.was_intentional || inner.phase == ManagerState::Terminated {
            return false;
        }
        self.set_phase(&mut inner, ManagerState::Connecting);
        true
    }

    /// Drops back to `Idle` between connect attempts.
    pub(crate) fn mark_idle(&self) {
        let mut inner = self.lock();
        if inner.phase != ManagerState::Terminated {
            self.set_phase(&mut inner, ManagerState::Idle);
        }
    }

    /// Enters `Connected` and returns the new connection count.
    pub(crate) fn mark_connected(&self) -> u64 {
        let mut inner = self.lock();
        inner.pings.clear();
        inner.is_connected = true;
        inner.has_connected = true;
        inner.connection_count += 1;
        self.set_phase(&mut inner, ManagerState::Connected);
        inner.connection_count
    }

    /// Enters `Disconnecting` and reports whether the caller asked for it.
    pub(crate) fn mark_disconnecting(&self) -> bool {
        let mut inner = self.lock();
        inner.is_connected = false;
        inner.pings.clear();
        self.set_phase(&mut inner, ManagerState::Disconnecting);
        inner.was_intentional
    }

    /// Settles after a disconnect: `Terminated` when intentional or
    /// `terminal`, `Idle` otherwise.
    pub(crate) fn finish_disconnect(&self, terminal: bool) -> ManagerState {
        let mut inner = self.lock();
        let next = if terminal || inner.was_intentional {
            ManagerState::Terminated
        } else {
            ManagerState::Idle
        };
        self.set_phase(&mut inner, next);
        next
    }

    /// Flags the disconnect as intentional. Returns `true` when no supervisor
    /// is running, in which case the state is moved straight to `Terminated`.
    pub(crate) fn request_disconnect(&self) -> bool {
        let mut inner = self.lock();
        inner.was_intentional = true;
        if inner.phase == ManagerState::Terminated {
            return false;
        }
        if !inner.started {
            inner.started = true;
            self.set_phase(&mut inner, ManagerState::Terminated);
            return true;
        }
        false
    }

    pub(crate) fn record_ping(&self, id: u64, sent_at: Instant) -> bool {
        self.lock().pings.insert(id, sent_at)
    }

    pub(crate) fn ack_ping(&self, id: u64) -> Option<Instant> {
        self.lock().pings.ack(id)
    }

    pub(crate) fn oldest_ping(&self) -> Option<(u64, Instant)> {
        self.lock().pings.oldest()
    }

    pub(crate) fn outstanding_pings(&self) -> usize {
        self.lock().pings.len()
    }
}
