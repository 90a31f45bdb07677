use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{anyhow, bail, Context, Result};
use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, Scope, AST};

use crate::events::EventTarget;
use crate::runtime::{HandlerOutcome, RuntimeFactory, ScriptDomain, ScriptRequest, ScriptRuntime};
use crate::storage::KvStore;
use crate::time::{Clocks, TimerKind};
use crate::value::{ObjectId, ScriptValue};

#[derive(Debug, Clone)]
pub struct RhaiOptions {
    /// Per-handler-call instruction budget; 0 disables the limit.
    pub max_operations: u64,
    /// Directory script paths are resolved against when loading from disk.
    pub script_root: Option<PathBuf>,
}

impl Default for RhaiOptions {
    fn default() -> Self {
        Self { max_operations: 1_000_000, script_root: None }
    }
}

type Outbox = Rc<RefCell<Vec<ScriptRequest>>>;

/// Compiles and instantiates rhai script environments. Sources can come
/// from disk (rooted at `script_root`) or be registered in memory, which is
/// how tests feed scripts in.
pub struct RhaiScriptFactory {
    options: RhaiOptions,
    sources: RefCell<HashMap<String, String>>,
    cache: RefCell<HashMap<String, AST>>,
    clocks: Option<Rc<RefCell<Clocks>>>,
    global_storage: Option<Rc<RefCell<KvStore>>>,
    player_storage: Option<Rc<RefCell<KvStore>>>,
}

impl RhaiScriptFactory {
    pub fn new(options: RhaiOptions) -> Self {
        Self {
            options,
            sources: RefCell::new(HashMap::new()),
            cache: RefCell::new(HashMap::new()),
            clocks: None,
            global_storage: None,
            player_storage: None,
        }
    }

    pub fn bind_clocks(&mut self, clocks: Rc<RefCell<Clocks>>) {
        self.clocks = Some(clocks);
    }

    pub fn bind_storage(&mut self, global: Rc<RefCell<KvStore>>, player: Rc<RefCell<KvStore>>) {
        self.global_storage = Some(global);
        self.player_storage = Some(player);
    }

    pub fn register_source(&self, path: impl Into<String>, source: impl Into<String>) {
        self.sources.borrow_mut().insert(path.into(), source.into());
    }

    fn source_for(&self, path: &str) -> Result<String> {
        if let Some(source) = self.sources.borrow().get(path) {
            return Ok(source.clone());
        }
        let file = match &self.options.script_root {
            Some(root) => root.join(path),
            None => PathBuf::from(path),
        };
        fs::read_to_string(&file).with_context(|| format!("reading script '{}'", file.display()))
    }

    fn build_engine(&self, domain: ScriptDomain, outbox: &Outbox, ops: &Rc<Cell<u64>>) -> Engine {
        let mut engine = Engine::new();
        engine.set_fast_operators(true);
        if self.options.max_operations > 0 {
            engine.set_max_operations(self.options.max_operations);
        }
        let counter = Rc::clone(ops);
        engine.on_progress(move |_| {
            counter.set(counter.get() + 1);
            None
        });
        register_object_type(&mut engine);
        register_api(&mut engine, domain, outbox, self.clocks.clone());
        if let Some(storage) = &self.global_storage {
            register_storage(&mut engine, "storage_get", "storage_set", storage);
        }
        if domain == ScriptDomain::Player {
            if let Some(storage) = &self.player_storage {
                register_storage(&mut engine, "player_storage_get", "player_storage_set", storage);
            }
        }
        engine
    }
}

impl RuntimeFactory for RhaiScriptFactory {
    fn instantiate(&self, path: &str, domain: ScriptDomain) -> Result<Box<dyn ScriptRuntime>> {
        let outbox: Outbox = Rc::new(RefCell::new(Vec::new()));
        let ops = Rc::new(Cell::new(0u64));
        let engine = self.build_engine(domain, &outbox, &ops);

        let cached = self.cache.borrow().get(path).cloned();
        let ast = match cached {
            Some(ast) => ast,
            None => {
                let source = self.source_for(path)?;
                let ast = engine
                    .compile(&source)
                    .map_err(|err| anyhow!("compiling script '{path}': {err}"))?;
                self.cache.borrow_mut().insert(path.to_string(), ast.clone());
                ast
            }
        };

        let mut scope = Scope::new();
        engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|err| anyhow!("running top level of script '{path}': {err}"))?;

        Ok(Box::new(RhaiRuntime {
            path: path.to_string(),
            engine,
            ast,
            scope,
            state: Dynamic::from(rhai::Map::new()),
            outbox,
            ops,
        }))
    }

    fn drop_cache(&self) {
        self.cache.borrow_mut().clear();
    }
}

/// One live script environment. Script state lives in the `this` map bound
/// to every handler call, which is what gets persisted.
pub struct RhaiRuntime {
    path: String,
    engine: Engine,
    ast: AST,
    scope: Scope<'static>,
    state: Dynamic,
    outbox: Outbox,
    ops: Rc<Cell<u64>>,
}

impl ScriptRuntime for RhaiRuntime {
    fn call_handler(&mut self, name: &str, args: &[ScriptValue]) -> Result<HandlerOutcome> {
        let dyn_args: Vec<Dynamic> = args.iter().map(value_to_dynamic).collect();
        let options = CallFnOptions::new()
            .eval_ast(false)
            .rewind_scope(true)
            .bind_this_ptr(&mut self.state);
        let result: Result<Dynamic, Box<EvalAltResult>> =
            self.engine.call_fn_with_options(options, &mut self.scope, &self.ast, name, dyn_args);
        match result {
            Ok(value) => {
                let value = dynamic_to_value(&value).unwrap_or(ScriptValue::Unit);
                Ok(HandlerOutcome::Handled(value))
            }
            Err(err) => match err.as_ref() {
                EvalAltResult::ErrorFunctionNotFound(signature, _) if signature.starts_with(name) => {
                    Ok(HandlerOutcome::NoHandler)
                }
                _ => Err(anyhow!("script '{}': {err}", self.path)),
            },
        }
    }

    fn drain_requests(&mut self) -> Vec<ScriptRequest> {
        std::mem::take(&mut *self.outbox.borrow_mut())
    }

    fn serialize_state(&mut self) -> Result<ScriptValue> {
        dynamic_to_value(&self.state)
    }

    fn restore_state(&mut self, state: &ScriptValue) -> Result<()> {
        self.state = value_to_dynamic(state);
        Ok(())
    }

    fn take_instruction_count(&mut self) -> u64 {
        self.ops.replace(0)
    }

    fn memory_usage(&self) -> u64 {
        // rhai does not meter allocations; approximate with the encoded
        // size of the script's state.
        dynamic_to_value(&self.state)
            .ok()
            .and_then(|value| bincode::serialized_size(&value).ok())
            .unwrap_or(0)
    }
}

fn register_object_type(engine: &mut Engine) {
    engine.register_type_with_name::<ObjectId>("GameObject");
    engine.register_get("index", |id: &mut ObjectId| id.index as i64);
    engine.register_get("content_file", |id: &mut ObjectId| id.content_file as i64);
    engine.register_fn("==", |a: ObjectId, b: ObjectId| a == b);
    engine.register_fn("!=", |a: ObjectId, b: ObjectId| a != b);
    engine.register_fn("to_string", |id: &mut ObjectId| id.to_string());
}

fn register_api(
    engine: &mut Engine,
    domain: ScriptDomain,
    outbox: &Outbox,
    clocks: Option<Rc<RefCell<Clocks>>>,
) {
    engine.register_fn("log", |message: &str| log::info!(target: "script", "{message}"));

    {
        let clocks = clocks.clone();
        engine.register_fn("simulation_time", move || {
            clocks.as_ref().map_or(0.0, |c| c.borrow().simulation_time)
        });
    }
    {
        let clocks = clocks;
        engine
            .register_fn("game_time", move || clocks.as_ref().map_or(0.0, |c| c.borrow().game_time));
    }

    let push_event = |outbox: &Outbox, target: EventTarget, name: &str, payload: Dynamic| {
        match dynamic_to_value(&payload) {
            Ok(payload) => outbox.borrow_mut().push(ScriptRequest::PostEvent {
                target,
                name: name.to_string(),
                payload,
            }),
            Err(err) => log::warn!("dropping event '{name}': {err:#}"),
        }
    };
    {
        let outbox = Rc::clone(outbox);
        engine.register_fn("send_global_event", move |name: &str, payload: Dynamic| {
            push_event(&outbox, EventTarget::Global, name, payload);
        });
    }
    {
        let outbox = Rc::clone(outbox);
        engine.register_fn("send_event_to", move |target: ObjectId, name: &str, payload: Dynamic| {
            push_event(&outbox, EventTarget::Object(target), name, payload);
        });
    }
    {
        let outbox = Rc::clone(outbox);
        engine.register_fn("broadcast_event", move |name: &str, payload: Dynamic| {
            push_event(&outbox, EventTarget::BroadcastLocal, name, payload);
        });
    }

    let push_timer = |outbox: &Outbox, kind: TimerKind, at: f64, handler: &str, arg: Dynamic| {
        match dynamic_to_value(&arg) {
            Ok(arg) => outbox.borrow_mut().push(ScriptRequest::ScheduleTimer {
                kind,
                fire_time: at,
                handler: handler.to_string(),
                arg,
            }),
            Err(err) => log::warn!("dropping timer '{handler}': {err:#}"),
        }
    };
    {
        let outbox = Rc::clone(outbox);
        engine.register_fn("set_simulation_timer", move |at: f64, handler: &str, arg: Dynamic| {
            push_timer(&outbox, TimerKind::Simulation, at, handler, arg);
        });
    }
    {
        let outbox = Rc::clone(outbox);
        engine.register_fn("set_game_timer", move |at: f64, handler: &str, arg: Dynamic| {
            push_timer(&outbox, TimerKind::Game, at, handler, arg);
        });
    }

    {
        let outbox = Rc::clone(outbox);
        engine.register_fn("defer", move |handler: &str, arg: Dynamic| match dynamic_to_value(&arg) {
            Ok(arg) => outbox
                .borrow_mut()
                .push(ScriptRequest::DeferAction { handler: handler.to_string(), arg }),
            Err(err) => log::warn!("dropping deferred call '{handler}': {err:#}"),
        });
    }
    {
        let outbox = Rc::clone(outbox);
        engine.register_fn("teleport_player", move |destination: Dynamic| {
            match dynamic_to_value(&destination) {
                Ok(destination) => {
                    outbox.borrow_mut().push(ScriptRequest::TeleportPlayer { destination })
                }
                Err(err) => log::warn!("dropping teleport request: {err:#}"),
            }
        });
    }
    if domain != ScriptDomain::Local {
        let outbox = Rc::clone(outbox);
        engine.register_fn("message_box", move |text: &str| {
            outbox.borrow_mut().push(ScriptRequest::UiMessage(text.to_string()));
        });
    }
    {
        let outbox = Rc::clone(outbox);
        engine.register_fn("print_console", move |text: &str| {
            outbox.borrow_mut().push(ScriptRequest::ConsolePrint(text.to_string()));
        });
    }
}

fn register_storage(engine: &mut Engine, get_name: &str, set_name: &str, store: &Rc<RefCell<KvStore>>) {
    {
        let store = Rc::clone(store);
        engine.register_fn(get_name, move |key: &str| match store.borrow().get(key) {
            Some(value) => value_to_dynamic(value),
            None => Dynamic::UNIT,
        });
    }
    {
        let store = Rc::clone(store);
        engine.register_fn(set_name, move |key: &str, value: Dynamic, persistent: bool| {
            match dynamic_to_value(&value) {
                Ok(value) => store.borrow_mut().set(key, value, persistent),
                Err(err) => log::warn!("dropping storage write '{key}': {err:#}"),
            }
        });
    }
}

pub fn value_to_dynamic(value: &ScriptValue) -> Dynamic {
    match value {
        ScriptValue::Unit => Dynamic::UNIT,
        ScriptValue::Bool(b) => (*b).into(),
        ScriptValue::Int(i) => (*i).into(),
        ScriptValue::Float(f) => (*f).into(),
        ScriptValue::Str(s) => s.clone().into(),
        ScriptValue::Array(items) => {
            Dynamic::from(items.iter().map(value_to_dynamic).collect::<rhai::Array>())
        }
        ScriptValue::Map(entries) => {
            let mut map = rhai::Map::new();
            for (key, value) in entries {
                map.insert(key.as_str().into(), value_to_dynamic(value));
            }
            Dynamic::from(map)
        }
        ScriptValue::ObjectRef(id) => Dynamic::from(*id),
    }
}

pub fn dynamic_to_value(value: &Dynamic) -> Result<ScriptValue> {
    if value.is::<()>() {
        return Ok(ScriptValue::Unit);
    }
    if let Ok(b) = value.as_bool() {
        return Ok(ScriptValue::Bool(b));
    }
    if let Ok(i) = value.as_int() {
        return Ok(ScriptValue::Int(i));
    }
    if let Ok(f) = value.as_float() {
        return Ok(ScriptValue::Float(f));
    }
    if value.is::<ObjectId>() {
        return Ok(ScriptValue::ObjectRef(value.clone().cast::<ObjectId>()));
    }
    if let Some(array) = value.clone().try_cast::<rhai::Array>() {
        let items = array.iter().map(dynamic_to_value).collect::<Result<Vec<_>>>()?;
        return Ok(ScriptValue::Array(items));
    }
    if let Some(map) = value.clone().try_cast::<rhai::Map>() {
        let mut entries = BTreeMap::new();
        for (key, value) in &map {
            entries.insert(key.to_string(), dynamic_to_value(value)?);
        }
        return Ok(ScriptValue::Map(entries));
    }
    if let Ok(s) = value.clone().into_string() {
        return Ok(ScriptValue::Str(s));
    }
    bail!("unsupported script value type '{}'", value.type_name())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_dispatch_and_state_survive_roundtrip() {
        let factory = RhaiScriptFactory::new(RhaiOptions::default());
        factory.register_source(
            "counter.rhai",
            r#"
                fn init(data) { this.count = 0; }
                fn bump(n) { this.count += n; this.count }
            "#,
        );
        let mut runtime =
            factory.instantiate("counter.rhai", ScriptDomain::Local).expect("instantiate");
        runtime.call_handler("init", &[ScriptValue::Unit]).expect("init");
        let outcome = runtime.call_handler("bump", &[ScriptValue::Int(3)]).expect("bump");
        assert_eq!(outcome, HandlerOutcome::Handled(ScriptValue::Int(3)));
        assert_eq!(runtime.call_handler("missing", &[]).expect("missing"), HandlerOutcome::NoHandler);

        let state = runtime.serialize_state().expect("state");
        let mut clone =
            factory.instantiate("counter.rhai", ScriptDomain::Local).expect("instantiate");
        clone.restore_state(&state).expect("restore");
        let outcome = clone.call_handler("bump", &[ScriptValue::Int(1)]).expect("bump");
        assert_eq!(outcome, HandlerOutcome::Handled(ScriptValue::Int(4)));
    }

    #[test]
    fn api_calls_land_in_the_outbox() {
        let factory = RhaiScriptFactory::new(RhaiOptions::default());
        factory.register_source(
            "emitter.rhai",
            r#"
                fn poke() {
                    send_global_event("ping", 7);
                    set_simulation_timer(2.5, "on_timer", "later");
                }
            "#,
        );
        let mut runtime =
            factory.instantiate("emitter.rhai", ScriptDomain::Local).expect("instantiate");
        runtime.call_handler("poke", &[]).expect("poke");
        let requests = runtime.drain_requests();
        assert_eq!(requests.len(), 2);
        assert!(matches!(
            &requests[0],
            ScriptRequest::PostEvent { target: EventTarget::Global, name, payload: ScriptValue::Int(7) }
                if name == "ping"
        ));
        assert!(matches!(
            &requests[1],
            ScriptRequest::ScheduleTimer { kind: TimerKind::Simulation, fire_time, handler, .. }
                if *fire_time == 2.5 && handler == "on_timer"
        ));
        assert!(runtime.drain_requests().is_empty());
    }
}
