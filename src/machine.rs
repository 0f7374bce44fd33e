//! VM process supervision.
//!
//! Every machine runs under its own pseudoterminal. A single reader thread
//! drains the pty for the machine's whole lifetime and broadcasts chunks to
//! whichever bridges are attached at that moment; a writer thread feeds guest
//! keystrokes from a bounded channel. When the pty read stream ends, for any
//! reason, the machine's console is considered closed and its cancellation
//! token fires.

use crate::config::VmConfig;
use crate::errors::{SessionError, SessionResult};
use crate::models::{MachineId, MachineStatus, SessionId};
use crate::session::TeardownReport;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CONSOLE_READ_BUFFER_SIZE: usize = 4096;
const CONSOLE_OUTPUT_CAPACITY: usize = 1024;
const CONSOLE_INPUT_CAPACITY: usize = 256;

/// Builds the command that boots one machine attached to `tap`.
pub trait MachineLauncher: Send + Sync + 'static {
    fn command(&self, machine: MachineId, tap: &str) -> CommandBuilder;
}

/// Boots machines with QEMU: tap networking, serial console on stdio,
/// throwaway disk writes and no display.
#[derive(Clone, Debug)]
pub struct QemuLauncher {
    config: VmConfig,
}

impl QemuLauncher {
    pub fn new(config: VmConfig) -> Self {
        Self { config }
    }

    pub fn args(&self, machine: MachineId, tap: &str) -> Vec<String> {
        let netdev = format!("net{machine}");
        let mut args = vec![
            "-accel".to_string(),
            self.config.accel.clone(),
            "-drive".to_string(),
            format!(
                "file={},format={},if=virtio",
                self.config.disk_image.display(),
                self.config.disk_format
            ),
            "-display".to_string(),
            "none".to_string(),
            "-netdev".to_string(),
            format!("tap,ifname={tap},id={netdev},script=no,downscript=no"),
            "-device".to_string(),
            format!(
                "virtio-net-pci,netdev={netdev},mac={}",
                mac_address(&self.config.mac_prefix, machine)
            ),
            "-chardev".to_string(),
            "stdio,id=char0,signal=off".to_string(),
            "-serial".to_string(),
            "chardev:char0".to_string(),
            "-m".to_string(),
            self.config.memory_mb.to_string(),
            "-snapshot".to_string(),
        ];
        if self.config.seccomp {
            args.push("-sandbox".to_string());
            args.push("on".to_string());
        }
        args
    }
}

impl MachineLauncher for QemuLauncher {
    fn command(&self, machine: MachineId, tap: &str) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.config.binary);
        cmd.args(self.args(machine, tap));
        // portable-pty falls back to $HOME; keep relative disk paths working
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }
        cmd
    }
}

/// Guest NIC address. The last octet is `100 + machine number`, so machines of
/// one session never share an address.
pub fn mac_address(prefix: &str, machine: MachineId) -> String {
    format!("{prefix}:{:02x}", 100 + u16::from(machine.number()))
}

/// Channels a bridge uses to talk to one machine's console.
pub struct Console {
    pub(crate) output: broadcast::Receiver<Vec<u8>>,
    pub(crate) input: mpsc::Sender<Vec<u8>>,
    pub(crate) closed: CancellationToken,
}

impl Console {
    pub fn new(
        output: broadcast::Receiver<Vec<u8>>,
        input: mpsc::Sender<Vec<u8>>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            output,
            input,
            closed,
        }
    }
}

/// One running VM process and the pty its console is attached to.
pub struct Machine {
    id: MachineId,
    pid: Option<u32>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    input_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    output_tx: broadcast::Sender<Vec<u8>>,
    console_closed: CancellationToken,
}

impl Machine {
    pub fn spawn(id: MachineId, command: CommandBuilder) -> SessionResult<Self> {
        let start_error = |message: String| SessionError::MachineStart {
            machine: id,
            message,
        };

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| start_error(format!("failed to open pty: {e}")))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| start_error(format!("failed to clone pty reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| start_error(format!("failed to take pty writer: {e}")))?;

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| start_error(format!("failed to spawn process: {e}")))?;
        let pid = child.process_id();
        // Release slave so reads fail once the process exits
        drop(pair.slave);

        let (output_tx, _) = broadcast::channel(CONSOLE_OUTPUT_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(CONSOLE_INPUT_CAPACITY);
        let console_closed = CancellationToken::new();

        spawn_console_reader(id, reader, output_tx.clone(), console_closed.clone());
        spawn_console_writer(id, writer, input_rx);

        Ok(Self {
            id,
            pid,
            child: Arc::new(Mutex::new(child)),
            master: Mutex::new(Some(pair.master)),
            input_tx: Mutex::new(Some(input_tx)),
            output_tx,
            console_closed,
        })
    }

    pub fn id(&self) -> MachineId {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn status(&self) -> MachineStatus {
        match self.child.lock().try_wait() {
            Ok(None) => MachineStatus::Running,
            Ok(Some(_)) => MachineStatus::Exited,
            Err(_) => MachineStatus::Unknown,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status() == MachineStatus::Running
    }

    /// Token that fires once the pty read stream has ended or the machine was stopped.
    pub fn console_closed(&self) -> CancellationToken {
        self.console_closed.clone()
    }

    /// Subscribes a new bridge to the console. Only output produced from now on is seen.
    pub fn open_console(&self) -> SessionResult<Console> {
        let input = self
            .input_tx
            .lock()
            .clone()
            .ok_or(SessionError::ConsoleClosed(self.id))?;
        Ok(Console::new(
            self.output_tx.subscribe(),
            input,
            self.console_closed.clone(),
        ))
    }

    /// Kills the process if it is still running and closes the pty.
    ///
    /// Both steps are best-effort; a process that already exited on its own
    /// is not a failure. Safe to call more than once. Blocks while the kill
    /// escalates, so async callers go through `spawn_blocking`.
    pub fn stop(&self) -> TeardownReport {
        let report = terminate(self.id, self.pid, &mut **self.child.lock());
        self.close_console();
        report
    }

    fn close_console(&self) {
        drop(self.input_tx.lock().take());
        if self.master.lock().take().is_none() {
            debug!(machine = %self.id, "pty already closed");
        }
        self.console_closed.cancel();
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        if self.master.get_mut().is_none() {
            return;
        }
        self.close_console();

        let (machine, pid, child) = (self.id, self.pid, self.child.clone());
        let reap = move || {
            terminate(machine, pid, &mut **child.lock());
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(reap);
            }
            Err(_) => reap(),
        }
    }
}

fn terminate(
    machine: MachineId,
    pid: Option<u32>,
    child: &mut (dyn portable_pty::Child + Send + Sync),
) -> TeardownReport {
    let mut report = TeardownReport::default();
    match child.try_wait() {
        Ok(Some(status)) => debug!(%machine, ?status, "machine already exited"),
        _ => match child.kill() {
            Ok(()) => {
                if let Err(error) = child.wait() {
                    warn!(%machine, ?pid, "failed to reap machine process: {error}");
                }
                info!(%machine, ?pid, "machine terminated");
            }
            Err(error) => {
                warn!(%machine, "failed to terminate machine: {error}");
                report.record(format!("terminate machine {machine}"), error);
            }
        },
    }
    report
}

fn spawn_console_reader(
    machine: MachineId,
    mut reader: Box<dyn Read + Send>,
    output_tx: broadcast::Sender<Vec<u8>>,
    closed: CancellationToken,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; CONSOLE_READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    // Nobody attached is fine: output is not replayed later
                    let _ = output_tx.send(buf[..n].to_vec());
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => {
                    debug!(%machine, "pty read ended: {error}");
                    break;
                }
            }
        }
        info!(%machine, "machine console closed");
        closed.cancel();
    });
}

fn spawn_console_writer(
    machine: MachineId,
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
) {
    std::thread::spawn(move || {
        while let Some(data) = input_rx.blocking_recv() {
            if let Err(error) = writer.write_all(&data).and_then(|_| writer.flush()) {
                warn!(%machine, "failed to write to machine pty: {error}");
                break;
            }
        }
        debug!(%machine, "console writer finished");
    });
}

/// Starts one machine per id and hands ownership to the caller.
pub struct MachineSupervisor {
    launcher: Arc<dyn MachineLauncher>,
}

impl MachineSupervisor {
    pub fn new(launcher: Arc<dyn MachineLauncher>) -> Self {
        Self { launcher }
    }

    pub fn start(
        &self,
        session: &SessionId,
        machine: MachineId,
        tap: &str,
    ) -> SessionResult<Machine> {
        let command = self.launcher.command(machine, tap);
        let started = Machine::spawn(machine, command)?;
        info!(%session, %machine, %tap, pid = ?started.pid(), "virtual machine started");
        Ok(started)
    }
}
