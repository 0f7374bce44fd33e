#![allow(dead_code)]

use async_trait::async_trait;
use portable_pty::CommandBuilder;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use vmterm::command::{format_command, CommandRunner};
use vmterm::errors::{SessionError, SessionResult};
use vmterm::machine::{MachineLauncher, MachineSupervisor};
use vmterm::models::MachineId;
use vmterm::network::NetworkProvisioner;
use vmterm::{build_router, SessionRegistry};

// Integration tests only see the public API, and the richer in-crate doubles
// in `src/testing.rs` are compiled for unit tests only. This fake covers just
// what the end-to-end flows touch: interface existence, add and delete.

/// Keeps a set of interface names and answers like `ip` does.
#[derive(Default)]
pub struct FakeIp {
    interfaces: Mutex<BTreeSet<String>>,
}

impl FakeIp {
    pub fn exists(&self, name: &str) -> bool {
        self.interfaces.lock().unwrap().contains(name)
    }

    pub fn add(&self, name: &str) {
        self.interfaces.lock().unwrap().insert(name.to_string());
    }

    pub fn all(&self) -> Vec<String> {
        self.interfaces.lock().unwrap().iter().cloned().collect()
    }
}

#[async_trait]
impl CommandRunner for FakeIp {
    async fn run(&self, program: &str, args: &[&str]) -> SessionResult<String> {
        let command = format_command(program, args);
        let fail = |output: String| SessionError::CommandFailed {
            command: command.clone(),
            message: format!("exit status: 1, output: {output}"),
        };

        let mut interfaces = self.interfaces.lock().unwrap();
        match args {
            ["link", "show", name] if !interfaces.contains(*name) => {
                Err(fail(format!("Device \"{name}\" does not exist.")))
            }
            ["link", "add", name, ..] | ["tuntap", "add", "mode", "tap", name] => {
                if !interfaces.insert(name.to_string()) {
                    return Err(fail("RTNETLINK answers: File exists".into()));
                }
                Ok(String::new())
            }
            ["link", "delete", name, ..] => {
                if !interfaces.remove(*name) {
                    return Err(fail(format!("Cannot find device \"{name}\"")));
                }
                Ok(String::new())
            }
            ["link", "set", name, ..] if !interfaces.contains(*name) => {
                Err(fail(format!("Cannot find device \"{name}\"")))
            }
            _ => Ok(String::new()),
        }
    }
}

/// Every machine is `cat`, so keystrokes come back as console output.
pub struct CatLauncher;

impl MachineLauncher for CatLauncher {
    fn command(&self, _machine: MachineId, _tap: &str) -> CommandBuilder {
        CommandBuilder::new("cat")
    }
}

pub fn registry(ip: Arc<FakeIp>, launcher: impl MachineLauncher) -> Arc<SessionRegistry> {
    Arc::new(SessionRegistry::new(
        NetworkProvisioner::new(ip, "ip"),
        MachineSupervisor::new(Arc::new(launcher)),
    ))
}

/// Serves the API for `registry` on an ephemeral local port.
pub async fn serve(registry: Arc<SessionRegistry>) -> SocketAddr {
    let app = build_router(registry);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Whether any process on the host has `marker` in its command line.
pub fn process_with_marker_exists(marker: &str) -> bool {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return false;
    };
    entries.flatten().any(|entry| {
        std::fs::read(entry.path().join("cmdline"))
            .map(|cmdline| String::from_utf8_lossy(&cmdline).contains(marker))
            .unwrap_or(false)
    })
}
