//! Worker wire protocol
//!
//! Newline-delimited JSON over the worker's stdin (requests) and stdout
//! (handshake, then responses).
//!
//! 1. Worker writes one [`Handshake`] line.
//! 2. Parent sends [`Request`]s; the worker answers each with a
//!    [`Response`] carrying the same `id`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::WireError;
use crate::provider::Timeouts;

/// Bumped on any incompatible change to the messages below.
pub const PROTOCOL_VERSION: u32 = 1;

/// Leading argument that switches the executable into worker mode.
pub const WORKER_ARG: &str = "__dns-challenge-provider-worker";

/// Environment variable carrying the shared secret.
pub const MAGIC_COOKIE_KEY: &str = "DNS_CHALLENGE_PLUGIN_COOKIE";

/// Shared secret a worker must find in its environment and echo back.
pub const MAGIC_COOKIE_VALUE: &str =
    "6d1f0e4c2b8a49f7a3c5e9d2b7f14a60c8e3d5b9a2f7461e0c9b3d8a5f2e7c14";

/// Per-spawn nonce, echoed in the handshake.
pub const SESSION_KEY: &str = "DNS_CHALLENGE_PLUGIN_SESSION";

/// First line a worker writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub protocol_version: u32,
    pub cookie: String,
    pub session: String,
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Call {
    Configure {
        provider: String,
        config: BTreeMap<String, String>,
    },
    Present {
        domain: String,
        token: String,
        key_auth: String,
    },
    CleanUp {
        domain: String,
        token: String,
        key_auth: String,
    },
    /// Diagnostic: read a variable from the worker's environment.
    Getenv { key: String },
}

impl Call {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Configure { .. } => "configure",
            Self::Present { .. } => "present",
            Self::CleanUp { .. } => "clean_up",
            Self::Getenv { .. } => "getenv",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub call: Call,
}

/// What a configured provider declares about its timing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    #[serde(default)]
    pub timeout: Option<Timeouts>,
    #[serde(default)]
    pub sequence_interval: Option<Duration>,
}

impl ProviderInfo {
    pub fn new(timeout: Option<Timeouts>, sequential: Option<Duration>) -> Self {
        Self {
            timeout,
            sequence_interval: sequential,
        }
    }

    pub fn sequential(&self) -> Option<Duration> {
        self.sequence_interval
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Configured(ProviderInfo),
    Done,
    Value(Option<String>),
    Error(WireError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub reply: Reply,
}
