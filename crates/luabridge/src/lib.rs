//! luabridge: interop bridge between a Rust host and embedded Lua
//!
//! Host functions and host structs are handed to scripts as opaque handles.
//! Scripts call them, read and write their fields, and call their methods;
//! every crossing goes through one kind-directed coercion routine.
//!
//! # Architecture
//!
//! ```text
//! Host code ──► Engine::lock() ──► Session ──► mlua / Lua 5.4
//!                                     │              │
//!                                     ▼              ▼ metamethods
//!                                  Registry ◄── callbacks ──► marshal ──► reflect
//! ```
//!
//! # Modules
//!
//! - `engine`: engine instances, the engine lock, lifecycle
//! - `session`: evaluation stack and operations valid under the lock
//! - `registry`: handle → host value map
//! - `value`: kinds, host values, script value snapshots
//! - `reflect`: capability tables for host structs
//! - `marshal`: coercion between script and host values, method adapters
//! - `callbacks`: entry points Lua calls back into
//! - `stack`: host-side value stack with Lua-style indexing
//! - `instances`: process-wide index of live engines
//! - `tasks`: per-engine asynchronous task queue
//! - `config`: TOML configuration
//! - `logging`: tracing subscriber setup
//!
//! # Example
//!
//! ```no_run
//! use luabridge::{Describe, Engine, Exposed, HostStruct};
//!
//! struct Player {
//!     name: String,
//! }
//!
//! impl HostStruct for Player {
//!     fn describe(d: &mut Describe<Self>) {
//!         d.field("Name", |p| &mut p.name);
//!     }
//! }
//!
//! # fn main() -> luabridge::Result<()> {
//! let engine = Engine::with_defaults()?;
//! let player = Exposed::new(Player { name: "X".into() });
//! engine.expose("Obj", &player)?;
//! engine.do_string("Obj.Name = Obj.Name .. 'Y'")?;
//! assert_eq!(player.lock().name, "XY");
//! # Ok(())
//! # }
//! ```
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod callbacks;
pub mod config;
pub mod engine;
pub mod error;
pub mod instances;
pub mod logging;
pub mod marshal;
pub mod reflect;
pub mod registry;
pub mod session;
pub mod stack;
pub mod tasks;
pub mod value;

pub use config::{BridgeConfig, WorkerConfig};
pub use engine::Engine;
pub use error::{
    AccessError, CoercionError, Error, Result, ScriptError, StackEntry, StatusCode, SubmitError,
};
pub use instances::InstanceId;
pub use reflect::{Describe, Exposed, FieldSlot, HostStruct, Marshal, Opaque, StructRef};
pub use registry::{Entry, EntryKind, Handle, HostFunction, Registry};
pub use session::Session;
pub use tasks::TaskStatsSnapshot;
pub use value::{HostValue, Kind, ScriptFunction, ScriptRef, ScriptType, ScriptValue};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
