use crate::errors::{SessionError, SessionResult};
use crate::machine::{Machine, MachineSupervisor};
use crate::models::{MachineId, SessionId, SessionSummary};
use crate::network::{NetworkProvisioner, SessionNetwork};
use crate::session::{Session, TeardownReport};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

const MAX_ID_ATTEMPTS: usize = 16;

struct RegistryInner {
    sessions: HashMap<SessionId, Arc<Session>>,
    /// Ids whose provisioning is in flight; not visible to lookups
    reserved: HashSet<SessionId>,
    accepting: bool,
}

impl Default for RegistryInner {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
            reserved: HashSet::new(),
            accepting: true,
        }
    }
}

impl RegistryInner {
    fn is_taken(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id) || self.reserved.contains(id)
    }
}

struct Shared {
    inner: Mutex<RegistryInner>,
    /// Provisioning and teardown work; runs to completion even when the
    /// request that started it goes away
    tasks: Mutex<JoinSet<TeardownReport>>,
    network: NetworkProvisioner,
    supervisor: MachineSupervisor,
    machines: Vec<MachineId>,
}

/// Releases an id reservation however provisioning ends.
struct Reservation {
    shared: Arc<Shared>,
    id: SessionId,
}

/// Tasks taken out of the registry to be awaited. They keep running if the
/// waiter goes away.
struct Draining(JoinSet<TeardownReport>);

impl Drop for Draining {
    fn drop(&mut self) {
        self.0.detach_all();
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.shared.inner.lock().reserved.remove(&self.id);
    }
}

/// Owns every live session.
///
/// The internal lock guards only the id → session map and is never held
/// across an await. Provisioning and teardown run on tracked background
/// tasks, so a slow `ip` call never blocks lookups and a dropped request
/// never leaves half-built or half-removed sessions behind.
pub struct SessionRegistry {
    shared: Arc<Shared>,
}

impl SessionRegistry {
    pub fn new(network: NetworkProvisioner, supervisor: MachineSupervisor) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(RegistryInner::default()),
                tasks: Mutex::new(JoinSet::new()),
                network,
                supervisor,
                machines: MachineId::ALL.to_vec(),
            }),
        }
    }

    /// Provisions a new session and registers it.
    ///
    /// On any failure, everything created so far is torn down and the
    /// session never becomes visible. If the caller stops waiting, the work
    /// still finishes: a failed attempt is rolled back and a successful one
    /// is registered, where the idle reaper eventually claims it.
    pub async fn create(&self) -> SessionResult<Arc<Session>> {
        let reservation = self.reserve_id()?;
        let (done_tx, done_rx) = oneshot::channel();
        let shared = self.shared.clone();

        self.spawn_tracked(async move {
            let (result, report) = shared.provision(reservation).await;
            let _ = done_tx.send(result);
            report
        });

        done_rx
            .await
            .unwrap_or_else(|_| Err(SessionError::Internal("session creation was interrupted".into())))
    }

    fn reserve_id(&self) -> SessionResult<Reservation> {
        let mut inner = self.shared.inner.lock();
        if !inner.accepting {
            return Err(SessionError::Unavailable("registry is shutting down".into()));
        }
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = SessionId::generate();
            if !inner.is_taken(&id) {
                inner.reserved.insert(id.clone());
                return Ok(Reservation {
                    shared: self.shared.clone(),
                    id,
                });
            }
        }
        Err(SessionError::Internal(
            "unable to generate a unique session id".into(),
        ))
    }

    fn spawn_tracked<F>(&self, work: F)
    where
        F: Future<Output = TeardownReport> + Send + 'static,
    {
        let mut tasks = self.shared.tasks.lock();
        // Finished tasks already logged their outcome
        while tasks.try_join_next().is_some() {}
        tasks.spawn(work);
    }

    pub async fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        let inner = self.shared.inner.lock();
        inner.sessions.get(&SessionId::from(id)).cloned()
    }

    /// Refreshes the activity timestamp. Returns false for unknown sessions.
    pub async fn touch(&self, id: &str) -> bool {
        let inner = self.shared.inner.lock();
        match inner.sessions.get(&SessionId::from(id)) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Unregisters the session and hands it back for teardown.
    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let mut inner = self.shared.inner.lock();
        inner.sessions.remove(&SessionId::from(id))
    }

    /// Removes one session and tears it down on a tracked task.
    ///
    /// Removal and scheduling happen before the first await, so once a
    /// close has started its teardown always completes.
    pub async fn close(&self, id: &str) -> SessionResult<TeardownReport> {
        let session = self
            .shared
            .inner
            .lock()
            .sessions
            .remove(&SessionId::from(id))
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        let (done_tx, done_rx) = oneshot::channel();
        let shared = self.shared.clone();
        self.spawn_tracked(async move {
            let report = shared.teardown(session).await;
            let _ = done_tx.send(report.clone());
            report
        });

        let report = done_rx
            .await
            .map_err(|_| SessionError::Internal("session teardown was interrupted".into()))?;
        info!(session = %id, "session terminated by client request");
        Ok(report)
    }

    pub async fn teardown(&self, session: Arc<Session>) -> TeardownReport {
        self.shared.teardown(session).await
    }

    /// Evicts every session idle for longer than `timeout` and returns how
    /// many were evicted.
    ///
    /// Removal and teardown scheduling happen under the lock, so a racing
    /// close request finds the session already gone. Each teardown runs on
    /// its own tracked task.
    pub async fn reap_expired(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.shared.inner.lock();
        let expired: Vec<SessionId> = inner
            .sessions
            .iter()
            .filter(|(_, session)| session.idle_for(now) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let mut evicted = 0;
        for id in expired {
            if let Some(session) = inner.sessions.remove(&id) {
                info!(session = %id, ?timeout, "session inactive past timeout, removing");
                let shared = self.shared.clone();
                self.spawn_tracked(async move { shared.teardown(session).await });
                evicted += 1;
            }
        }
        evicted
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<Session>> = {
            let inner = self.shared.inner.lock();
            inner.sessions.values().cloned().collect()
        };
        let mut summaries: Vec<SessionSummary> =
            sessions.iter().map(|session| session.summary()).collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    pub async fn len(&self) -> usize {
        self.shared.inner.lock().sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Waits for every in-flight provisioning and teardown task, including
    /// ones started while waiting.
    pub async fn wait_for_tasks(&self) -> TeardownReport {
        let mut combined = TeardownReport::default();
        loop {
            let mut draining = Draining(std::mem::take(&mut *self.shared.tasks.lock()));
            if draining.0.is_empty() {
                return combined;
            }
            while let Some(joined) = draining.0.join_next().await {
                match joined {
                    Ok(report) => combined.merge(report),
                    Err(error) => combined.record("background session task", error),
                }
            }
        }
    }

    /// Stops accepting new sessions, lets in-flight work finish, then tears
    /// down every registered session concurrently.
    pub async fn shutdown(&self) -> TeardownReport {
        self.shared.inner.lock().accepting = false;
        let mut combined = self.wait_for_tasks().await;

        let sessions: Vec<Arc<Session>> = {
            let mut inner = self.shared.inner.lock();
            inner.sessions.drain().map(|(_, session)| session).collect()
        };
        if !sessions.is_empty() {
            info!(count = sessions.len(), "tearing down sessions on shutdown");
        }

        let reports = join_all(
            sessions
                .into_iter()
                .map(|session| self.shared.teardown(session)),
        )
        .await;
        for report in reports {
            combined.merge(report);
        }
        combined
    }
}

impl Shared {
    /// Builds the network and machines for a reserved id, rolling back on
    /// failure. The second value carries any rollback failures.
    async fn provision(
        &self,
        reservation: Reservation,
    ) -> (SessionResult<Arc<Session>>, TeardownReport) {
        let id = reservation.id.clone();
        let network = match SessionNetwork::for_session(&id, &self.machines) {
            Ok(network) => network,
            Err(error) => return (Err(error), TeardownReport::default()),
        };

        if let Err(error) = self.network.setup(&network).await {
            error!(session = %id, "network setup failed: {error}");
            let report = self.network.cleanup(&network).await;
            log_rollback(&id, &report);
            return (Err(SessionError::provisioning("set up network", error)), report);
        }

        let mut machines: BTreeMap<MachineId, Machine> = BTreeMap::new();
        for machine in &self.machines {
            let started = network
                .tap(*machine)
                .ok_or_else(|| SessionError::Internal(format!("no tap for machine {machine}")))
                .and_then(|tap| self.supervisor.start(&id, *machine, tap));

            match started {
                Ok(handle) => {
                    machines.insert(*machine, handle);
                }
                Err(error) => {
                    error!(session = %id, %machine, "machine launch failed: {error}");
                    let running: Vec<Machine> = machines.into_values().collect();
                    let mut report = stop_blocking(move || {
                        let mut report = TeardownReport::default();
                        for machine in &running {
                            report.merge(machine.stop());
                        }
                        report
                    })
                    .await;
                    report.merge(self.network.cleanup(&network).await);
                    log_rollback(&id, &report);
                    return (Err(error), report);
                }
            }
        }

        let session = Arc::new(Session::new(id.clone(), network, machines));
        {
            let mut inner = self.inner.lock();
            inner.sessions.insert(id.clone(), session.clone());
        }
        drop(reservation);
        info!(session = %id, "session created");
        (Ok(session), TeardownReport::default())
    }

    /// Stops every machine, then removes the network. All steps always run.
    async fn teardown(&self, session: Arc<Session>) -> TeardownReport {
        let id = session.id().clone();

        let stopping = session.clone();
        let mut report = stop_blocking(move || stopping.stop_machines()).await;

        let network_report = self.network.cleanup(session.network()).await;
        if network_report.is_clean() {
            info!(session = %id, "network cleaned up");
        }
        report.merge(network_report);

        for failure in report.failures() {
            warn!(session = %id, step = %failure.step, "teardown step failed: {}", failure.error);
        }
        info!(session = %id, "session removed");
        report
    }
}

/// Runs machine shutdown off the async workers; killing a process can
/// sleep while the signal escalates.
async fn stop_blocking<F>(stop: F) -> TeardownReport
where
    F: FnOnce() -> TeardownReport + Send + 'static,
{
    match tokio::task::spawn_blocking(stop).await {
        Ok(report) => report,
        Err(error) => {
            let mut report = TeardownReport::default();
            report.record("stop machines", error);
            report
        }
    }
}

fn log_rollback(id: &SessionId, report: &TeardownReport) {
    for failure in report.failures() {
        warn!(session = %id, step = %failure.step, "rollback step failed: {}", failure.error);
    }
}
