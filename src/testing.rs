//! Test doubles shared by the unit tests.

use crate::command::{format_command, CommandRunner};
use crate::errors::{SessionError, SessionResult};
use crate::machine::MachineLauncher;
use crate::models::MachineId;
use async_trait::async_trait;
use portable_pty::CommandBuilder;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Clone, Debug, Default)]
struct FakeInterface {
    up: bool,
    master: Option<String>,
}

#[derive(Default)]
struct FakeState {
    interfaces: BTreeMap<String, FakeInterface>,
    commands: Vec<String>,
    fail_rules: Vec<String>,
}

/// Emulates the kernel interface table and the `ip` tool's error text.
#[derive(Default)]
pub struct FakeIpRunner {
    state: Mutex<FakeState>,
}

impl FakeIpRunner {
    pub fn add_interface(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .interfaces
            .insert(name.to_string(), FakeInterface::default());
    }

    /// Every command containing `pattern` fails with a permission error.
    pub fn fail_on(&self, pattern: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_rules
            .push(pattern.to_string());
    }

    pub fn has_interface(&self, name: &str) -> bool {
        self.state.lock().unwrap().interfaces.contains_key(name)
    }

    pub fn interfaces(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .interfaces
            .keys()
            .cloned()
            .collect()
    }

    pub fn master_of(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .interfaces
            .get(name)
            .and_then(|iface| iface.master.clone())
    }

    pub fn is_up(&self, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .interfaces
            .get(name)
            .map(|iface| iface.up)
            .unwrap_or(false)
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }
}

fn failure(command: &str, output: String) -> SessionError {
    SessionError::CommandFailed {
        command: command.to_string(),
        message: format!("exit status: 1, output: {output}"),
    }
}

#[async_trait]
impl CommandRunner for FakeIpRunner {
    async fn run(&self, program: &str, args: &[&str]) -> SessionResult<String> {
        let command = format_command(program, args);
        let mut state = self.state.lock().unwrap();
        state.commands.push(command.clone());

        if state.fail_rules.iter().any(|rule| command.contains(rule)) {
            return Err(failure(
                &command,
                "RTNETLINK answers: Operation not permitted".into(),
            ));
        }

        let missing = |name: &str| failure(&command, format!("Cannot find device \"{name}\""));
        match args {
            ["link", "show", name] => match state.interfaces.get(*name) {
                Some(_) => Ok(format!("1: {name}: <BROADCAST,MULTICAST> mtu 1500")),
                None => Err(failure(
                    &command,
                    format!("Device \"{name}\" does not exist."),
                )),
            },
            ["link", "add", name, "type", "bridge"] | ["tuntap", "add", "mode", "tap", name] => {
                if state.interfaces.contains_key(*name) {
                    return Err(failure(&command, "RTNETLINK answers: File exists".into()));
                }
                state
                    .interfaces
                    .insert(name.to_string(), FakeInterface::default());
                Ok(String::new())
            }
            ["link", "set", name, "master", bridge] => {
                if !state.interfaces.contains_key(*bridge) {
                    return Err(missing(bridge));
                }
                let iface = state.interfaces.get_mut(*name).ok_or_else(|| missing(name))?;
                iface.master = Some(bridge.to_string());
                Ok(String::new())
            }
            ["link", "set", name, updown @ ("up" | "down")] => {
                let iface = state.interfaces.get_mut(*name).ok_or_else(|| missing(name))?;
                iface.up = *updown == "up";
                Ok(String::new())
            }
            ["link", "delete", name, ..] => {
                state.interfaces.remove(*name).ok_or_else(|| missing(name))?;
                Ok(String::new())
            }
            _ => Ok(String::new()),
        }
    }
}

/// Runs `cat` under the pty, so console input comes straight back out.
pub struct CatLauncher;

impl MachineLauncher for CatLauncher {
    fn command(&self, _machine: MachineId, _tap: &str) -> CommandBuilder {
        CommandBuilder::new("cat")
    }
}

pub struct MissingBinaryLauncher;

impl MachineLauncher for MissingBinaryLauncher {
    fn command(&self, _machine: MachineId, _tap: &str) -> CommandBuilder {
        CommandBuilder::new("/nonexistent/vmterm-qemu")
    }
}

/// Starts `cat` for every machine except `failing`, whose launch fails.
pub struct FailingMachineLauncher {
    pub failing: MachineId,
}

impl MachineLauncher for FailingMachineLauncher {
    fn command(&self, machine: MachineId, tap: &str) -> CommandBuilder {
        if machine == self.failing {
            MissingBinaryLauncher.command(machine, tap)
        } else {
            CatLauncher.command(machine, tap)
        }
    }
}
