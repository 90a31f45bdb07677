use anyhow::Result;

use crate::events::EventTarget;
use crate::time::TimerKind;
use crate::value::ScriptValue;

/// Privilege domain a script environment is instantiated for. Player scripts
/// get the elevated surface (input, UI); global scripts run unbound to any
/// object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptDomain {
    Global,
    Local,
    Player,
}

/// Result of invoking a named handler. A script simply not defining the
/// handler is normal and must be distinguishable from a runtime fault.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Handled(ScriptValue),
    NoHandler,
}

/// Side effects a script asked for during a handler call. The interpreter
/// binding records them; the orchestrator drains and applies them at the
/// call boundary, so the interpreter never mutates host state directly.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptRequest {
    PostEvent { target: EventTarget, name: String, payload: ScriptValue },
    ScheduleTimer { kind: TimerKind, fire_time: f64, handler: String, arg: ScriptValue },
    DeferAction { handler: String, arg: ScriptValue },
    TeleportPlayer { destination: ScriptValue },
    UiMessage(String),
    ConsolePrint(String),
}

/// Capability interface over one opaque script environment instance. The
/// orchestration core depends only on this trait; the concrete interpreter
/// lives behind it.
pub trait ScriptRuntime {
    fn call_handler(&mut self, name: &str, args: &[ScriptValue]) -> Result<HandlerOutcome>;

    /// Side effects recorded since the last drain, in request order.
    fn drain_requests(&mut self) -> Vec<ScriptRequest>;

    /// Snapshot of the script's own state for persistence.
    fn serialize_state(&mut self) -> Result<ScriptValue>;

    fn restore_state(&mut self, state: &ScriptValue) -> Result<()>;

    /// Instructions executed since the last call; resets the counter.
    fn take_instruction_count(&mut self) -> u64;

    fn memory_usage(&self) -> u64;

    fn collect_garbage(&mut self) {}
}

/// Instantiates script environments by configured script path.
pub trait RuntimeFactory {
    fn instantiate(&self, path: &str, domain: ScriptDomain) -> Result<Box<dyn ScriptRuntime>>;

    /// Invalidates any compiled-script cache; used by full script reload.
    fn drop_cache(&self) {}
}
