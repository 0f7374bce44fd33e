use crate::command::CommandRunner;
use crate::errors::{SessionError, SessionResult};
use crate::models::{MachineId, SessionId};
use crate::session::TeardownReport;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Linux `IFNAMSIZ` minus the trailing NUL.
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

const BRIDGE_PREFIX: &str = "br";
const TAP_PREFIX: &str = "tap";

// Substrings `ip` prints when the named interface is already gone.
const MISSING_DEVICE_MARKERS: [&str; 3] = ["does not exist", "Cannot find device", "No such device"];

/// Interface names owned by one session, derived from its id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionNetwork {
    bridge: String,
    taps: BTreeMap<MachineId, String>,
}

impl SessionNetwork {
    pub fn for_session(id: &SessionId, machines: &[MachineId]) -> SessionResult<Self> {
        let bridge = format!("{BRIDGE_PREFIX}-{id}");
        let taps: BTreeMap<MachineId, String> = machines
            .iter()
            .map(|machine| (*machine, format!("{TAP_PREFIX}{machine}-{id}")))
            .collect();

        let network = Self { bridge, taps };
        if let Some(name) = network
            .interfaces()
            .find(|name| name.len() > MAX_INTERFACE_NAME_LEN)
        {
            return Err(SessionError::InterfaceNameTooLong(name.to_string()));
        }
        Ok(network)
    }

    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    pub fn tap(&self, machine: MachineId) -> Option<&str> {
        self.taps.get(&machine).map(String::as_str)
    }

    pub fn taps(&self) -> impl Iterator<Item = (MachineId, &str)> {
        self.taps.iter().map(|(id, name)| (*id, name.as_str()))
    }

    /// Every interface name of the session: taps first, bridge last.
    pub fn interfaces(&self) -> impl Iterator<Item = &str> {
        self.taps
            .values()
            .map(String::as_str)
            .chain(std::iter::once(self.bridge.as_str()))
    }
}

/// Whether a failed `ip` invocation means the interface simply is not there.
pub fn is_missing_device(error: &SessionError) -> bool {
    match error {
        SessionError::CommandFailed { message, .. } => MISSING_DEVICE_MARKERS
            .iter()
            .any(|marker| message.contains(marker)),
        _ => false,
    }
}

/// Creates and removes the bridge + tap interfaces of a session with `ip`.
pub struct NetworkProvisioner {
    runner: Arc<dyn CommandRunner>,
    ip_path: String,
}

impl NetworkProvisioner {
    pub fn new(runner: Arc<dyn CommandRunner>, ip_path: impl Into<String>) -> Self {
        Self {
            runner,
            ip_path: ip_path.into(),
        }
    }

    async fn ip(&self, args: &[&str]) -> SessionResult<String> {
        self.runner.run(&self.ip_path, args).await
    }

    pub async fn interface_exists(&self, name: &str) -> SessionResult<bool> {
        match self.ip(&["link", "show", name]).await {
            Ok(_) => Ok(true),
            Err(error) if is_missing_device(&error) => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Builds the session's bridge and attaches one tap per machine.
    ///
    /// Stops at the first failing step. The caller must run [`Self::cleanup`]
    /// to remove whatever was created before the failure.
    pub async fn setup(&self, network: &SessionNetwork) -> SessionResult<()> {
        let bridge = network.bridge();

        self.reclaim_stale(bridge, &["link", "delete", bridge, "type", "bridge"])
            .await?;
        for (_, tap) in network.taps() {
            self.reclaim_stale(tap, &["link", "delete", tap]).await?;
        }

        info!(interface = %bridge, "creating bridge");
        self.ip(&["link", "add", bridge, "type", "bridge"])
            .await
            .map_err(|e| SessionError::provisioning(format!("create bridge {bridge}"), e))?;
        self.ip(&["link", "set", bridge, "up"])
            .await
            .map_err(|e| SessionError::provisioning(format!("bring up bridge {bridge}"), e))?;

        for (machine, tap) in network.taps() {
            info!(interface = %tap, %machine, "creating tap device");
            self.ip(&["tuntap", "add", "mode", "tap", tap])
                .await
                .map_err(|e| SessionError::provisioning(format!("create tap device {tap}"), e))?;
            self.ip(&["link", "set", tap, "master", bridge])
                .await
                .map_err(|e| {
                    SessionError::provisioning(
                        format!("attach tap device {tap} to bridge {bridge}"),
                        e,
                    )
                })?;
            self.ip(&["link", "set", tap, "up"])
                .await
                .map_err(|e| SessionError::provisioning(format!("bring up tap device {tap}"), e))?;
        }

        info!(interface = %bridge, "network setup completed");
        Ok(())
    }

    async fn reclaim_stale(&self, name: &str, delete_args: &[&str]) -> SessionResult<()> {
        let exists = self
            .interface_exists(name)
            .await
            .map_err(|e| SessionError::provisioning(format!("check existence of {name}"), e))?;
        if !exists {
            return Ok(());
        }

        warn!(interface = %name, "interface already exists, deleting");
        self.ip(delete_args)
            .await
            .map_err(|e| SessionError::provisioning(format!("delete stale interface {name}"), e))?;
        Ok(())
    }

    /// Brings down and deletes every interface of the session.
    ///
    /// Interfaces that are already gone count as removed, so calling this
    /// repeatedly is safe. Other failures are logged and recorded; the
    /// remaining interfaces are still processed.
    pub async fn cleanup(&self, network: &SessionNetwork) -> TeardownReport {
        let bridge = network.bridge();
        let mut commands: Vec<Vec<&str>> = Vec::new();
        for (_, tap) in network.taps() {
            commands.push(vec!["link", "set", tap, "down"]);
            commands.push(vec!["link", "delete", tap]);
        }
        commands.push(vec!["link", "set", bridge, "down"]);
        commands.push(vec!["link", "delete", bridge, "type", "bridge"]);

        let mut report = TeardownReport::default();
        for args in commands {
            let step = format!("ip {}", args.join(" "));
            match self.ip(&args).await {
                Ok(_) => debug!(%step, "cleanup step succeeded"),
                Err(error) if is_missing_device(&error) => {
                    debug!(%step, "interface already removed")
                }
                Err(error) => {
                    warn!(%step, "cleanup step failed: {error}");
                    report.record(step, error);
                }
            }
        }
        report
    }
}
