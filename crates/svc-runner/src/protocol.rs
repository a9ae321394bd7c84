//! Messages exchanged with a service process.
//!
//! On the wire every message is one JSON object per line, tagged by its
//! `type` field:
//!
//! ```text
//! -> {"type":"initialized","service":"Echo","version":"1.0.0","api_version":5}
//! <- {"type":"allocate","allocation":1,"context":{...}}
//! -> {"type":"allocated","allocation":1,"instance":17}
//! <- {"type":"invoke","instance":17,"tid":3,"function":"echo","args":{"text":"hi"}}
//! -> {"type":"invoke_result","tid":3,"result":"hi"}
//! ```
//!
//! A process must send `initialized` before the host sends it anything.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sent by a service process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceMessage {
    /// Handshake. Nothing is sent to the process before this arrives.
    Initialized {
        service: String,
        version: String,
        api_version: u32,
    },
    /// Answer to [`HostMessage::Describe`].
    Described { interface: Value },
    /// An allocation succeeded; `instance` is the process-local handle.
    Allocated { allocation: u32, instance: u32 },
    InvokeResult { tid: u32, result: Value },
    InvokeError { tid: u32, code: String, message: String },
    /// Mid-call callback into the caller. The transaction stays open.
    Callback { tid: u32, callback: u32, params: Value },
    /// Out-of-band request to show `dialog` to the user.
    Prompt {
        tid: u32,
        prompt: u32,
        dialog: PathBuf,
        args: Value,
    },
}

/// Per-instance context handed to the process on allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationContext {
    pub uri: String,
    pub data_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub locale: String,
    pub user_agent: String,
    pub client_pid: u32,
}

/// Sent by the host to a service process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    Describe,
    Allocate {
        allocation: u32,
        context: AllocationContext,
    },
    Invoke {
        instance: u32,
        tid: u32,
        function: String,
        args: Value,
    },
    Destroy { instance: u32 },
    PromptResponse { prompt: u32, response: Value },
    Shutdown,
}

/// Why a process went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The process exited on its own, with its exit code if it had one.
    Exited(Option<i32>),
    /// The host killed it.
    Killed,
    /// The pipe to the process broke.
    Io(String),
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Exited(Some(code)) => write!(f, "exited with status {code}"),
            ExitReason::Exited(None) => f.write_str("terminated by signal"),
            ExitReason::Killed => f.write_str("killed"),
            ExitReason::Io(e) => write!(f, "I/O failure: {e}"),
        }
    }
}

/// Everything a controller can learn about its process.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Message(ServiceMessage),
    Ended(ExitReason),
}
