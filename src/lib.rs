pub mod actions;
pub mod config;
pub mod container;
pub mod events;
pub mod host;
pub mod input;
pub mod persist;
pub mod registry;
pub mod rhai_runtime;
pub mod runtime;
pub mod storage;
pub mod time;
pub mod timers;
pub mod value;

pub use host::{HostContext, HostOptions, ScriptHost, UiSink, WorldModel};
pub use value::{ObjectId, ScriptValue};
