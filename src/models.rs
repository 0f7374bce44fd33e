use crate::errors::SessionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

/// Number of hex characters in a generated session id.
pub const SESSION_ID_LEN: usize = 6;

/// One of the fixed machines every session is created with.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, ToSchema,
)]
pub enum MachineId {
    #[serde(rename = "1")]
    One,
    #[serde(rename = "2")]
    Two,
}

impl MachineId {
    pub const ALL: [MachineId; 2] = [MachineId::One, MachineId::Two];

    pub fn number(self) -> u8 {
        match self {
            MachineId::One => 1,
            MachineId::Two => 2,
        }
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

impl FromStr for MachineId {
    type Err = SessionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "1" => Ok(MachineId::One),
            "2" => Ok(MachineId::Two),
            other => Err(SessionError::InvalidRequest(format!(
                "invalid machine id: {other}"
            ))),
        }
    }
}

/// Opaque session handle. Also the namespace for derived interface names.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        let mut buffer = Uuid::encode_buffer();
        let encoded = Uuid::new_v4().as_simple().encode_lower(&mut buffer);
        Self(encoded[..SESSION_ID_LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for SessionId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct CreateSessionResponse {
    #[serde(rename = "sessionID")]
    #[schema(example = "3fa9c1")]
    pub session_id: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
pub enum MachineStatus {
    Running,
    Exited,
    Unknown,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct MachineSummary {
    pub machine: MachineId,
    pub tap_interface: String,
    pub pid: Option<u32>,
    pub status: MachineStatus,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct SessionSummary {
    pub id: String,
    pub bridge_interface: String,
    pub machines: Vec<MachineSummary>,
    pub created_at: DateTime<Utc>,
    /// Seconds since the last byte crossed any bridge of this session
    pub idle_seconds: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}
