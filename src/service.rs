use crate::errors::{SessionError, SessionResult};
use crate::machine::Console;
use crate::models::{CreateSessionResponse, MachineId, SessionSummary};
use crate::registry::SessionRegistry;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::error;

/// Called for every message a client sends, to keep its session alive.
pub type ActivityHook = Arc<dyn Fn() + Send + Sync>;

/// What a WebSocket handler needs to bridge a client to one machine.
pub struct ConsoleAttachment {
    pub console: Console,
    pub on_activity: ActivityHook,
}

#[async_trait]
pub trait SessionService: Send + Sync + 'static {
    async fn create(&self) -> SessionResult<CreateSessionResponse>;
    async fn close(&self, id: String) -> SessionResult<()>;
    async fn list(&self) -> SessionResult<Vec<SessionSummary>>;
    /// Resolves the session and machine before any WebSocket upgrade happens.
    async fn open_console(&self, id: String, machine: MachineId)
        -> SessionResult<ConsoleAttachment>;
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<dyn SessionService>,
}

impl AppState {
    pub fn new(service: Arc<dyn SessionService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl SessionService for SessionRegistry {
    async fn create(&self) -> SessionResult<CreateSessionResponse> {
        let session = SessionRegistry::create(self).await?;
        Ok(CreateSessionResponse {
            session_id: session.id().to_string(),
        })
    }

    async fn close(&self, id: String) -> SessionResult<()> {
        let report = SessionRegistry::close(self, &id).await?;
        if !report.is_clean() {
            error!(session = %id, failures = report.failures().len(), "session closed with teardown failures");
        }
        Ok(())
    }

    async fn list(&self) -> SessionResult<Vec<SessionSummary>> {
        Ok(SessionRegistry::list(self).await)
    }

    async fn open_console(
        &self,
        id: String,
        machine: MachineId,
    ) -> SessionResult<ConsoleAttachment> {
        let session = self
            .lookup(&id)
            .await
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        let console = session
            .machine(machine)
            .ok_or_else(|| SessionError::NotFound(format!("{id}/{machine}")))?
            .open_console()?;
        session.touch();

        // Holds the session only weakly so a detached client cannot keep it alive
        let weak = Arc::downgrade(&session);
        let on_activity: ActivityHook = Arc::new(move || {
            if let Some(session) = weak.upgrade() {
                session.touch();
            }
        });

        Ok(ConsoleAttachment {
            console,
            on_activity,
        })
    }
}

/// Stands in when the host cannot run sessions, so the API still answers.
pub struct UnavailableSessionService {
    reason: String,
}

impl UnavailableSessionService {
    pub fn new(reason: String) -> Self {
        Self { reason }
    }

    fn error(&self, operation: &str) -> SessionError {
        SessionError::Unavailable(format!(
            "{operation} unavailable: session service failed to start ({})",
            self.reason
        ))
    }
}

#[async_trait]
impl SessionService for UnavailableSessionService {
    async fn create(&self) -> SessionResult<CreateSessionResponse> {
        Err(self.error("create session"))
    }

    async fn close(&self, _id: String) -> SessionResult<()> {
        Err(self.error("close session"))
    }

    async fn list(&self) -> SessionResult<Vec<SessionSummary>> {
        Err(self.error("list sessions"))
    }

    async fn open_console(
        &self,
        _id: String,
        _machine: MachineId,
    ) -> SessionResult<ConsoleAttachment> {
        Err(self.error("attach console"))
    }
}
