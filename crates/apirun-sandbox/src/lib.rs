#![warn(missing_docs)]

//! # apirun-sandbox
//!
//! QuickJS sandbox for apirun provider scripts.
//!
//! A provider script declares commands on a single default-exported object:
//!
//! ```js
//! export default {
//!   "account.get": {
//!     desc: "Get account details",
//!     args: [],
//!     run: () => fetch(env("BASE_URL") + "/v2/account", {
//!       headers: { Authorization: "Bearer " + secret("token") },
//!     }),
//!   },
//! };
//! ```
//!
//! [`ScriptHost::describe`] lists the commands without running any of them;
//! [`ScriptHost::invoke`] runs one and coerces its return value into an
//! [`ExecutionResult`].
//!
//! ## Sandbox model
//!
//! - **Fresh runtime per call**: nothing a script does survives the call
//! - **Hard limits**: wall-clock timeout via the interrupt handler, memory via
//!   the allocator ceiling
//! - **Four capabilities only**: `fetch`, `secret`, `env`, `sleep`; no
//!   filesystem, process or module access
//! - **Opaque failures**: scripts see plain thrown `Error`s, the host sees the
//!   typed [`ScriptError`]

pub mod audit;
mod bridge;
mod coerce;
pub mod context;
mod describe;
pub mod error;
mod heap;
pub mod executor;
pub mod prepare;
pub mod redact;

use serde::Serialize;

pub use context::{ExecutionContext, ParamError, Params};
pub use error::{ResourceLimit, ScriptError};
pub use executor::{SandboxConfig, ScriptHost};

/// Metadata for one command, read without running it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandDescriptor {
    /// Property name on the default export.
    pub name: String,
    /// The `desc` field, or empty.
    pub description: String,
    /// The `args` field, in order, or empty.
    pub args: Vec<String>,
}

impl CommandDescriptor {
    fn size(&self) -> usize {
        self.name.len() + self.description.len() + self.args.iter().map(String::len).sum::<usize>()
    }
}

/// The normalized outcome of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    /// Status the script reported, if any.
    pub status: Option<i32>,
    /// Textual body.
    pub body: String,
    /// Serialized JSON, present for structured returns.
    pub json: Option<String>,
}

impl ExecutionResult {
    /// Whether the caller should treat this as a failure (`status >= 400`).
    pub fn is_failure(&self) -> bool {
        self.status.is_some_and(|s| s >= 400)
    }

    /// Bytes of output carried.
    pub fn size(&self) -> usize {
        self.body.len() + self.json.as_ref().map_or(0, String::len)
    }
}
