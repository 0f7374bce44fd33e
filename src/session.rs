use crate::machine::Machine;
use crate::models::{MachineId, MachineSummary, SessionId, SessionSummary};
use crate::network::SessionNetwork;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// A fully provisioned session: its network plus one running machine per id.
///
/// Sessions are only ever constructed after provisioning succeeded, so a
/// `Session` value always owns exactly the machines it was created with.
pub struct Session {
    id: SessionId,
    network: SessionNetwork,
    machines: BTreeMap<MachineId, Machine>,
    created_at: DateTime<Utc>,
    last_active: Mutex<Instant>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        network: SessionNetwork,
        machines: BTreeMap<MachineId, Machine>,
    ) -> Self {
        Self {
            id,
            network,
            machines,
            created_at: Utc::now(),
            last_active: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn network(&self) -> &SessionNetwork {
        &self.network
    }

    pub fn machine(&self, id: MachineId) -> Option<&Machine> {
        self.machines.get(&id)
    }

    pub fn machines(&self) -> impl Iterator<Item = &Machine> {
        self.machines.values()
    }

    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active())
    }

    pub fn summary(&self) -> SessionSummary {
        let machines = self
            .machines
            .values()
            .map(|machine| MachineSummary {
                machine: machine.id(),
                tap_interface: self
                    .network
                    .tap(machine.id())
                    .unwrap_or_default()
                    .to_string(),
                pid: machine.pid(),
                status: machine.status(),
            })
            .collect();

        SessionSummary {
            id: self.id.to_string(),
            bridge_interface: self.network.bridge().to_string(),
            machines,
            created_at: self.created_at,
            idle_seconds: self.idle_for(Instant::now()).as_secs(),
        }
    }

    /// Stops every machine. Each stop is attempted even if an earlier one failed.
    pub(crate) fn stop_machines(&self) -> TeardownReport {
        let mut report = TeardownReport::default();
        for machine in self.machines.values() {
            report.merge(machine.stop());
        }
        report
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("network", &self.network)
            .field("machines", &self.machines.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TeardownFailure {
    pub step: String,
    pub error: String,
}

/// Outcome of a best-effort teardown. Every step runs; failures are collected.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TeardownReport {
    failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn record(&mut self, step: impl Into<String>, error: impl fmt::Display) {
        self.failures.push(TeardownFailure {
            step: step.into(),
            error: error.to_string(),
        });
    }

    pub fn merge(&mut self, other: TeardownReport) {
        self.failures.extend(other.failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[TeardownFailure] {
        &self.failures
    }
}
