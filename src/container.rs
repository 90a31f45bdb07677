use anyhow::{bail, Context, Result};

use crate::config::{AutoStartEntry, ScriptsConfiguration};
use crate::persist::{ContainerRecord, SavedDataCodec, SavedScript};
use crate::runtime::{HandlerOutcome, RuntimeFactory, ScriptDomain, ScriptRequest, ScriptRuntime};
use crate::time::Clocks;
use crate::timers::TimerQueue;
use crate::value::{ObjectId, ScriptValue};

/// A side effect some script asked for, annotated with the script that
/// raised it so the host can route timers and actions back to it.
#[derive(Debug)]
pub struct PendingRequest {
    pub script_index: usize,
    pub request: ScriptRequest,
}

/// Per-script resource accounting, refreshed on the frame stats snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptStats {
    pub avg_instruction_count: f64,
    pub memory_usage: u64,
}

struct ScriptInstance {
    index: usize,
    path: String,
    enabled: bool,
    runtime: Box<dyn ScriptRuntime>,
    stats: ScriptStats,
}

/// One script environment set bound to one simulation object, or to the
/// global scope when `owner` is absent. The script set only grows through
/// auto-start configuration or explicit attach; it shrinks only on full
/// unload.
pub struct ScriptContainer {
    domain: ScriptDomain,
    owner: Option<ObjectId>,
    scripts: Vec<ScriptInstance>,
    timers: TimerQueue,
    active: bool,
    auto_start: Vec<AutoStartEntry>,
}

impl ScriptContainer {
    pub fn new(domain: ScriptDomain, owner: Option<ObjectId>, auto_start: Vec<AutoStartEntry>) -> Self {
        Self { domain, owner, scripts: Vec::new(), timers: TimerQueue::new(), active: false, auto_start }
    }

    pub fn domain(&self) -> ScriptDomain {
        self.domain
    }

    pub fn owner(&self) -> Option<ObjectId> {
        self.owner
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn has_script(&self, index: usize) -> bool {
        self.scripts.iter().any(|s| s.index == index)
    }

    pub fn script_indices(&self) -> Vec<usize> {
        self.scripts.iter().map(|s| s.index).collect()
    }

    pub fn set_script_enabled(&mut self, index: usize, enabled: bool) -> bool {
        match self.scripts.iter_mut().find(|s| s.index == index) {
            Some(script) => {
                script.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn add_auto_started_scripts(
        &mut self,
        config: &ScriptsConfiguration,
        factory: &dyn RuntimeFactory,
    ) -> Result<Vec<PendingRequest>> {
        let mut out = Vec::new();
        for entry in self.auto_start.clone() {
            out.extend(self.add_script(entry.index, entry.init_data.as_ref(), config, factory)?);
        }
        Ok(out)
    }

    /// Attaches one configured script. Idempotent: an already attached index
    /// is left untouched.
    pub fn add_script(
        &mut self,
        index: usize,
        init_data: Option<&ScriptValue>,
        config: &ScriptsConfiguration,
        factory: &dyn RuntimeFactory,
    ) -> Result<Vec<PendingRequest>> {
        if self.has_script(index) {
            return Ok(Vec::new());
        }
        let entry = config
            .entry(index)
            .with_context(|| format!("script index {index} is not in the current configuration"))?;
        let runtime = factory
            .instantiate(&entry.path, self.domain)
            .with_context(|| format!("starting script '{}' for {}", entry.path, self.describe()))?;
        self.scripts.push(ScriptInstance {
            index,
            path: entry.path.clone(),
            enabled: true,
            runtime,
            stats: ScriptStats::default(),
        });
        let init_arg = init_data.cloned().unwrap_or(ScriptValue::Unit);
        let mut out = Vec::new();
        let slot = self.scripts.len() - 1;
        self.call_instance(slot, "init", &[init_arg], &mut out);
        Ok(out)
    }

    /// Invokes a handler on every enabled script, in attach order. Handler
    /// errors are logged per script and never abort the sweep.
    pub fn call_handler_all(&mut self, name: &str, args: &[ScriptValue]) -> Vec<PendingRequest> {
        let mut out = Vec::new();
        for slot in 0..self.scripts.len() {
            self.call_instance(slot, name, args, &mut out);
        }
        out
    }

    /// Like `call_handler_all`, but also reports whether any script answered
    /// the handler with `true` (console command consumption).
    pub fn call_handler_consuming(
        &mut self,
        name: &str,
        args: &[ScriptValue],
    ) -> (bool, Vec<PendingRequest>) {
        let mut out = Vec::new();
        let mut consumed = false;
        for slot in 0..self.scripts.len() {
            if let Some(HandlerOutcome::Handled(value)) = self.call_instance(slot, name, args, &mut out)
            {
                if value.as_bool() == Some(true) {
                    consumed = true;
                }
            }
        }
        (consumed, out)
    }

    pub fn call_handler_on(
        &mut self,
        script_index: usize,
        name: &str,
        args: &[ScriptValue],
        out: &mut Vec<PendingRequest>,
    ) {
        if let Some(slot) = self.scripts.iter().position(|s| s.index == script_index) {
            self.call_instance(slot, name, args, out);
        }
    }

    pub fn schedule_timer(
        &mut self,
        script_index: usize,
        kind: crate::time::TimerKind,
        fire_time: f64,
        handler: impl Into<String>,
        arg: ScriptValue,
    ) {
        self.timers.schedule(kind, fire_time, script_index, handler, arg);
    }

    /// Fires every due timer immediately, each removed from the queue before
    /// its handler runs. Re-arming requires the handler to schedule a new
    /// timer.
    pub fn process_timers(&mut self, clocks: &Clocks) -> Vec<PendingRequest> {
        let mut out = Vec::new();
        for timer in self.timers.pop_due(clocks) {
            self.call_handler_on(timer.script_index, &timer.handler, &[timer.arg], &mut out);
        }
        out
    }

    pub fn update(&mut self, dt: f64) -> Vec<PendingRequest> {
        self.call_handler_all("on_update", &[ScriptValue::Float(dt)])
    }

    pub fn collect_garbage(&mut self) {
        for script in &mut self.scripts {
            script.runtime.collect_garbage();
        }
    }

    /// Rolls per-script counters into the sliding averages. Called once per
    /// frame before any handler runs.
    pub fn stats_next_frame(&mut self) {
        for script in &mut self.scripts {
            let ops = script.runtime.take_instruction_count() as f64;
            script.stats.avg_instruction_count = script.stats.avg_instruction_count * 0.95 + ops * 0.05;
            script.stats.memory_usage = script.runtime.memory_usage();
        }
    }

    pub fn collect_stats(&self, out: &mut Vec<(usize, ScriptStats)>) {
        for script in &self.scripts {
            out.push((script.index, script.stats));
        }
    }

    pub fn remove_all_scripts(&mut self) {
        self.scripts.clear();
        self.timers.clear();
    }

    pub fn save(&mut self) -> Result<ContainerRecord> {
        let mut scripts = Vec::with_capacity(self.scripts.len());
        for script in &mut self.scripts {
            let data = script
                .runtime
                .serialize_state()
                .with_context(|| format!("serializing state of script '{}'", script.path))?;
            scripts.push(SavedScript {
                path: script.path.clone(),
                data,
                timers: self.timers.save_for_script(script.index),
            });
        }
        Ok(ContainerRecord { scripts })
    }

    /// Rebuilds the script set from a record. A saved global script missing
    /// from the current configuration is fatal (mandatory scripts must not
    /// be dropped silently); a missing per-object script only loses its own
    /// entry.
    pub fn load(
        &mut self,
        record: &ContainerRecord,
        config: &ScriptsConfiguration,
        factory: &dyn RuntimeFactory,
        codec: &SavedDataCodec<'_>,
    ) -> Result<()> {
        self.remove_all_scripts();
        for saved in &record.scripts {
            let Some(index) = config.index_of_path(&saved.path) else {
                if self.domain == ScriptDomain::Global {
                    bail!(
                        "saved global script '{}' is not in the current configuration",
                        saved.path
                    );
                }
                log::warn!(
                    "dropping saved script '{}' of {}: not in the current configuration",
                    saved.path,
                    self.describe()
                );
                continue;
            };
            let mut runtime = factory
                .instantiate(&saved.path, self.domain)
                .with_context(|| format!("restoring script '{}' for {}", saved.path, self.describe()))?;
            runtime
                .restore_state(&codec.decode(saved.data.clone()))
                .with_context(|| format!("restoring state of script '{}'", saved.path))?;
            self.scripts.push(ScriptInstance {
                index,
                path: saved.path.clone(),
                enabled: true,
                runtime,
                stats: ScriptStats::default(),
            });
            self.timers.restore(index, saved.timers.clone(), codec);
        }
        Ok(())
    }

    pub fn describe(&self) -> String {
        match (self.domain, self.owner) {
            (ScriptDomain::Global, _) => "global scripts".to_string(),
            (ScriptDomain::Player, Some(id)) => format!("player scripts ({id})"),
            (_, Some(id)) => format!("scripts of {id}"),
            (_, None) => "detached scripts".to_string(),
        }
    }

    fn call_instance(
        &mut self,
        slot: usize,
        name: &str,
        args: &[ScriptValue],
        out: &mut Vec<PendingRequest>,
    ) -> Option<HandlerOutcome> {
        let describe = self.describe();
        let script = &mut self.scripts[slot];
        if !script.enabled {
            return None;
        }
        let outcome = match script.runtime.call_handler(name, args) {
            Ok(outcome) => outcome,
            Err(err) => {
                log::error!("error in {describe}, script '{}', handler '{name}': {err:#}", script.path);
                HandlerOutcome::NoHandler
            }
        };
        let index = script.index;
        out.extend(
            script
                .runtime
                .drain_requests()
                .into_iter()
                .map(|request| PendingRequest { script_index: index, request }),
        );
        Some(outcome)
    }
}
