use std::cell::RefCell;
use std::fmt::Write as _;
use std::path::Path;
use std::rc::Rc;

use anyhow::{Context, Result};

use crate::actions::{log_action_failure, ActionKind, ActionQueue, DelayedAction};
use crate::config::{ObjectKind, ScriptsConfiguration};
use crate::container::PendingRequest;
use crate::events::{
    EngineEvent, EngineEventQueue, EventTarget, LocalEvent, LocalEventBus,
};
use crate::input::InputEvent;
use crate::persist::{
    ContainerRecord, ContentFileMap, SavedDataCodec, SessionRecord, SESSION_RECORD_TAG,
    SESSION_RECORD_VERSION,
};
use crate::registry::ContainerRegistry;
use crate::rhai_runtime::RhaiScriptFactory;
use crate::runtime::{RuntimeFactory, ScriptDomain, ScriptRequest};
use crate::storage::KvStore;
use crate::time::Clocks;
use crate::value::{ObjectId, ScriptValue};

const GLOBAL_STORAGE_FILE: &str = "global_storage.bin";
const PLAYER_STORAGE_FILE: &str = "player_storage.bin";

/// Read access to the simulation the scripts run against. The host engine
/// implements this; the scripting core never owns world state.
pub trait WorldModel {
    fn object_exists(&self, id: ObjectId) -> bool;

    fn object_in_scene(&self, id: ObjectId) -> bool;

    fn object_kind(&self, id: ObjectId) -> Option<ObjectKind>;

    fn record_id(&self, id: ObjectId) -> Option<String>;

    /// Content-file names in load order; indices here are the non-negative
    /// `content_file` halves of object ids.
    fn content_files(&self) -> Vec<String>;

    fn last_generated(&self) -> ObjectId;

    fn set_last_generated(&mut self, id: ObjectId);

    fn teleport_player(&mut self, destination: &ScriptValue) -> Result<()>;

    fn in_menu_mode(&self) -> bool {
        false
    }

    fn in_console_mode(&self) -> bool {
        false
    }

    fn in_modal_ui(&self) -> bool {
        false
    }
}

/// Where player-facing script output goes.
pub trait UiSink {
    fn message_box(&mut self, text: &str);

    fn print_to_console(&mut self, text: &str);
}

/// Borrowed host services handed into every call that can touch the world
/// or the UI. Passed explicitly so the core holds no engine references
/// between frames.
pub struct HostContext<'a> {
    pub world: &'a mut dyn WorldModel,
    pub ui: &'a mut dyn UiSink,
}

#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Per-object containers garbage-collected per frame (round robin); the
    /// global container is collected every frame.
    pub gc_containers_per_frame: usize,
    /// Record enqueue sites for delayed actions so failures can name them.
    pub debug_trace: bool,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self { gc_containers_per_frame: 4, debug_trace: cfg!(feature = "action_trace") }
    }
}

/// The orchestration core: owns every script container, both event
/// channels, the timer clocks, the action queue and the two key-value
/// stores, and drives them in a fixed per-frame order.
pub struct ScriptHost {
    config: ScriptsConfiguration,
    factory: Box<dyn RuntimeFactory>,
    registry: ContainerRegistry,
    events: LocalEventBus,
    engine_events: EngineEventQueue,
    actions: ActionQueue,
    clocks: Rc<RefCell<Clocks>>,
    global_storage: Rc<RefCell<KvStore>>,
    player_storage: Rc<RefCell<KvStore>>,
    input_queue: Vec<InputEvent>,
    ui_messages: Vec<String>,
    console_prints: Vec<String>,
    options: HostOptions,
    remap: Option<ContentFileMap>,
    initialized: bool,
    new_game_pending: bool,
    global_scripts_started: bool,
    last_dt: f64,
    paused: bool,
    gc_cursor: usize,
}

impl ScriptHost {
    pub fn new(
        config: ScriptsConfiguration,
        factory: Box<dyn RuntimeFactory>,
        options: HostOptions,
    ) -> Self {
        Self::with_shared(
            config,
            factory,
            options,
            Rc::new(RefCell::new(Clocks::new())),
            Rc::new(RefCell::new(KvStore::new())),
            Rc::new(RefCell::new(KvStore::new())),
        )
    }

    /// Builds a host backed by the rhai interpreter, with the clocks and
    /// both stores shared into the script API. The factory is taken over
    /// here so callers can register in-memory sources first.
    pub fn with_rhai(
        config: ScriptsConfiguration,
        mut factory: RhaiScriptFactory,
        options: HostOptions,
    ) -> Self {
        let clocks = Rc::new(RefCell::new(Clocks::new()));
        let global_storage = Rc::new(RefCell::new(KvStore::new()));
        let player_storage = Rc::new(RefCell::new(KvStore::new()));
        factory.bind_clocks(Rc::clone(&clocks));
        factory.bind_storage(Rc::clone(&global_storage), Rc::clone(&player_storage));
        Self::with_shared(config, Box::new(factory), options, clocks, global_storage, player_storage)
    }

    fn with_shared(
        config: ScriptsConfiguration,
        factory: Box<dyn RuntimeFactory>,
        options: HostOptions,
        clocks: Rc<RefCell<Clocks>>,
        global_storage: Rc<RefCell<KvStore>>,
        player_storage: Rc<RefCell<KvStore>>,
    ) -> Self {
        let registry = ContainerRegistry::new(config.global_entries());
        Self {
            config,
            factory,
            registry,
            events: LocalEventBus::new(),
            engine_events: EngineEventQueue::new(),
            actions: ActionQueue::new(),
            clocks,
            global_storage,
            player_storage,
            input_queue: Vec::new(),
            ui_messages: Vec::new(),
            console_prints: Vec::new(),
            options,
            remap: None,
            initialized: false,
            new_game_pending: false,
            global_scripts_started: false,
            last_dt: 0.0,
            paused: false,
            gc_cursor: 0,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn clocks(&self) -> Clocks {
        *self.clocks.borrow()
    }

    pub fn registry(&self) -> &ContainerRegistry {
        &self.registry
    }

    pub fn global_storage(&self) -> &Rc<RefCell<KvStore>> {
        &self.global_storage
    }

    pub fn player_storage(&self) -> &Rc<RefCell<KvStore>> {
        &self.player_storage
    }

    // ---- frame loop ----------------------------------------------------

    /// The simulation-side step. Runs once per frame, before the world
    /// advances; a no-op until a session exists.
    pub fn update(&mut self, ctx: &mut HostContext<'_>, dt: f64, paused: bool) {
        self.last_dt = dt;
        self.paused = paused;
        if !self.initialized {
            return;
        }
        self.run_gc_step();
        self.prune_and_reconcile(ctx);
        self.snapshot_stats();
        if !paused {
            self.clocks.borrow_mut().advance(dt);
        }
        self.events.finalize_batch();
        if !paused {
            self.process_timers();
        }
        self.dispatch_local_events();
        self.dispatch_engine_events();
        if !paused {
            self.update_containers(dt);
        }
    }

    /// The main-thread step: new-game one-shot, input delivery, the player
    /// per-frame hook, UI flush, and the delayed-action drain. Runs after
    /// `update` each frame.
    pub fn synchronized_update(&mut self, ctx: &mut HostContext<'_>) {
        if !self.initialized {
            return;
        }
        if self.new_game_pending {
            self.new_game_pending = false;
            let pending = self.registry.global_mut().call_handler_all("on_new_game", &[]);
            self.apply_requests(None, pending);
        }

        let inputs = std::mem::take(&mut self.input_queue);
        if !ctx.world.in_menu_mode() {
            for event in inputs {
                self.deliver_to_player("on_input", &[event.to_value()]);
            }
        }

        let dt = if self.paused { 0.0 } else { self.last_dt };
        self.deliver_to_player("on_frame", &[ScriptValue::Float(dt)]);

        for text in std::mem::take(&mut self.ui_messages) {
            ctx.ui.message_box(&text);
        }
        for text in std::mem::take(&mut self.console_prints) {
            ctx.ui.print_to_console(&text);
        }

        self.drain_actions(ctx);
    }

    // ---- lifecycle -----------------------------------------------------

    /// Registers the player object and starts its configured scripts. The
    /// container stays inactive until `object_added_to_scene` reports the
    /// player in scene. A second player with a different id is a broken
    /// session and fatal.
    pub fn setup_player(&mut self, id: ObjectId) -> Result<()> {
        let auto_start = self.config.player_entries();
        let container = self.registry.attach(id, ScriptDomain::Player, auto_start);
        let pending = container.add_auto_started_scripts(&self.config, self.factory.as_ref())?;
        self.apply_requests(Some(id), pending);
        Ok(())
    }

    /// Starts a fresh session: global scripts start now, the `on_new_game`
    /// hook fires at the next synchronized update.
    pub fn new_game_started(&mut self) -> Result<()> {
        self.registry.set_global_auto_start(self.config.global_entries());
        let pending =
            self.registry.global_mut().add_auto_started_scripts(&self.config, self.factory.as_ref())?;
        self.apply_requests(None, pending);
        self.initialized = true;
        self.new_game_pending = true;
        self.global_scripts_started = true;
        Ok(())
    }

    /// Marks a loaded session live; the actual state arrives through
    /// `read_session_record` and the per-object loads. Saves written before
    /// scripting existed carry no session record at all, so the configured
    /// global scripts are auto-started here if nothing started them yet.
    pub fn game_loaded(&mut self) -> Result<()> {
        if !self.global_scripts_started {
            self.registry.set_global_auto_start(self.config.global_entries());
            let pending = self
                .registry
                .global_mut()
                .add_auto_started_scripts(&self.config, self.factory.as_ref())?;
            self.apply_requests(None, pending);
            self.global_scripts_started = true;
        }
        self.initialized = true;
        self.new_game_pending = false;
        Ok(())
    }

    /// Full session teardown. Persistent storage entries survive; every
    /// container, queue, subscription and temporary entry goes.
    pub fn clear(&mut self) {
        self.registry.clear();
        self.events.clear();
        self.engine_events.clear();
        self.actions.clear();
        self.input_queue.clear();
        self.ui_messages.clear();
        self.console_prints.clear();
        self.global_storage.borrow_mut().clear_temporary_and_remove_callbacks();
        self.player_storage.borrow_mut().clear_temporary_and_remove_callbacks();
        *self.clocks.borrow_mut() = Clocks::new();
        self.remap = None;
        self.initialized = false;
        self.new_game_pending = false;
        self.global_scripts_started = false;
        self.gc_cursor = 0;
    }

    // ---- scene hooks ---------------------------------------------------

    /// Creates (or reactivates) the object's container, auto-starting the
    /// configured scripts on first sight. Static scenery never gets a
    /// container.
    pub fn object_added_to_scene(&mut self, ctx: &mut HostContext<'_>, id: ObjectId) -> Result<()> {
        let kind = ctx
            .world
            .object_kind(id)
            .with_context(|| format!("{id} entered the scene but the world does not know it"))?;
        if kind == ObjectKind::Static {
            return Ok(());
        }
        if !self.registry.contains(id) {
            let (domain, auto_start) = if self.registry.player_id() == Some(id) {
                (ScriptDomain::Player, self.config.player_entries())
            } else {
                let record = ctx.world.record_id(id);
                (ScriptDomain::Local, self.config.local_entries(kind, record.as_deref(), id))
            };
            let container = self.registry.attach(id, domain, auto_start);
            let pending = container.add_auto_started_scripts(&self.config, self.factory.as_ref())?;
            self.apply_requests(Some(id), pending);
        }
        if self.registry.set_active(id, true) {
            self.engine_events.push(EngineEvent::ObjectActive(id));
        }
        Ok(())
    }

    /// Deactivates the container; it stays attached with its state and
    /// timers. The inactive notification only fires while the object still
    /// exists, so permanent removal stays silent.
    pub fn object_removed_from_scene(&mut self, ctx: &mut HostContext<'_>, id: ObjectId) {
        self.deactivate_if_left_scene(ctx, id);
    }

    /// Drops the container and its timers without any notification.
    pub fn object_permanently_removed(&mut self, id: ObjectId) {
        self.registry.detach(id);
    }

    /// The player is notified immediately (its scripts may need to react
    /// before the next frame); everyone else is queued.
    pub fn object_teleported(&mut self, id: ObjectId) {
        if self.registry.player_id() == Some(id) {
            self.deliver_to_player("on_teleported", &[]);
        } else {
            self.engine_events.push(EngineEvent::Teleported(id));
        }
    }

    pub fn quest_updated(&mut self, quest: impl Into<String>, stage: i64) {
        self.engine_events.push(EngineEvent::QuestUpdated { quest: quest.into(), stage });
    }

    pub fn topic_selected(&mut self, topic: impl Into<String>, actor: ObjectId) {
        self.engine_events.push(EngineEvent::TopicSelected { topic: topic.into(), actor });
    }

    /// Queues one input event for the player scripts. Dropped outright
    /// while the console or a modal UI owns the input.
    pub fn input_event(&mut self, ctx: &HostContext<'_>, event: InputEvent) {
        if ctx.world.in_console_mode() || ctx.world.in_modal_ui() {
            return;
        }
        self.input_queue.push(event);
    }

    pub fn ui_mode_changed(&mut self, in_menu: bool) {
        self.deliver_to_player("on_ui_mode_changed", &[ScriptValue::Bool(in_menu)]);
    }

    /// Explicitly attaches one configured script to an object, outside the
    /// auto-start rules. Attaching to static scenery is a programming
    /// error, not a recoverable condition.
    pub fn add_custom_local_script(
        &mut self,
        ctx: &mut HostContext<'_>,
        id: ObjectId,
        script_index: usize,
        init_data: Option<&ScriptValue>,
    ) -> Result<()> {
        if ctx.world.object_kind(id) == Some(ObjectKind::Static) {
            panic!("scripts cannot be attached to static scenery ({id})");
        }
        let domain = if self.registry.player_id() == Some(id) {
            ScriptDomain::Player
        } else {
            ScriptDomain::Local
        };
        let container = self.registry.attach(id, domain, Vec::new());
        let pending =
            container.add_script(script_index, init_data, &self.config, self.factory.as_ref())?;
        self.apply_requests(Some(id), pending);
        Ok(())
    }

    /// Enables or disables one attached script without detaching it. `None`
    /// addresses the global container.
    pub fn set_script_enabled(
        &mut self,
        owner: Option<ObjectId>,
        script_index: usize,
        enabled: bool,
    ) -> bool {
        let container = match owner {
            Some(id) => match self.registry.get_mut(id) {
                Some(container) => container,
                None => return false,
            },
            None => self.registry.global_mut(),
        };
        container.set_script_enabled(script_index, enabled)
    }

    // ---- console -------------------------------------------------------

    /// Routes a console command to the selected object's scripts, or to the
    /// player and global scripts when nothing is selected. Prints distinct
    /// diagnostics for "no session", "nothing to run the command", and
    /// "every script declined it".
    pub fn handle_console_command(
        &mut self,
        ctx: &mut HostContext<'_>,
        mode: &str,
        command: &str,
        selected: Option<ObjectId>,
    ) -> bool {
        if !self.initialized {
            ctx.ui.print_to_console("No active game session; scripts are not running.");
            return false;
        }
        let args = [ScriptValue::from(mode), ScriptValue::from(command)];
        let consumed = match selected {
            Some(id) => {
                let Some(container) = self.registry.get_mut(id) else {
                    ctx.ui.print_to_console("Selected object has no attached scripts.");
                    return false;
                };
                let (consumed, pending) = container.call_handler_consuming("on_console_command", &args);
                self.apply_requests(Some(id), pending);
                consumed
            }
            None => {
                let mut consumed = false;
                if let Some(id) = self.registry.player_id() {
                    if let Some(container) = self.registry.get_mut(id) {
                        let (c, pending) = container.call_handler_consuming("on_console_command", &args);
                        self.apply_requests(Some(id), pending);
                        consumed |= c;
                    }
                }
                let (c, pending) = self.registry.global_mut().call_handler_consuming("on_console_command", &args);
                self.apply_requests(None, pending);
                consumed | c
            }
        };
        if !consumed {
            ctx.ui.print_to_console("The command was not handled by any script.");
        }
        self.flush_console_prints(ctx);
        consumed
    }

    // ---- persistence ---------------------------------------------------

    /// Snapshot of everything this core owns session-wide: clocks, the
    /// generated-id counter, content-file order, global scripts, and the
    /// event backlog. Per-object containers are saved separately with
    /// their objects.
    pub fn write_session_record(&mut self, ctx: &HostContext<'_>) -> Result<SessionRecord> {
        let clocks = *self.clocks.borrow();
        let record = SessionRecord {
            tag: SESSION_RECORD_TAG,
            version: SESSION_RECORD_VERSION,
            simulation_time: clocks.simulation_time,
            game_time: clocks.game_time,
            last_generated: ctx.world.last_generated(),
            content_files: ctx.world.content_files(),
            global: self.registry.global_mut().save()?,
            events: self.events.save(),
        };
        record.validate()?;
        Ok(record)
    }

    /// Restores the session-wide state and remembers the content-file
    /// remap table for the per-object loads that follow.
    pub fn read_session_record(
        &mut self,
        ctx: &mut HostContext<'_>,
        record: &SessionRecord,
    ) -> Result<()> {
        record.validate()?;
        self.clear();
        let map = ContentFileMap::build(&record.content_files, &ctx.world.content_files());
        {
            let codec = SavedDataCodec::remapping(&map);
            let mut clocks = self.clocks.borrow_mut();
            clocks.simulation_time = record.simulation_time;
            clocks.game_time = record.game_time;
            drop(clocks);
            self.registry.set_global_auto_start(self.config.global_entries());
            self.registry
                .global_mut()
                .load(&record.global, &self.config, self.factory.as_ref(), &codec)
                .context("restoring global scripts")?;
            self.events.load(record.events.clone(), &codec);
        }
        ctx.world.set_last_generated(map.remap(record.last_generated));
        self.remap = Some(map);
        self.initialized = true;
        self.global_scripts_started = true;
        Ok(())
    }

    pub fn save_object_scripts(&mut self, id: ObjectId) -> Result<Option<ContainerRecord>> {
        match self.registry.get_mut(id) {
            Some(container) => Ok(Some(container.save()?)),
            None => Ok(None),
        }
    }

    /// Restores one object's container from its saved record, remapping
    /// content-file indices through the table captured by
    /// `read_session_record`.
    pub fn load_object_scripts(&mut self, id: ObjectId, record: &ContainerRecord) -> Result<()> {
        let domain = if self.registry.player_id() == Some(id) {
            ScriptDomain::Player
        } else {
            ScriptDomain::Local
        };
        let remap = self.remap.take();
        let codec = match &remap {
            Some(map) => SavedDataCodec::remapping(map),
            None => SavedDataCodec::plain(),
        };
        let container = self.registry.attach(id, domain, Vec::new());
        let result = container
            .load(record, &self.config, self.factory.as_ref(), &codec)
            .with_context(|| format!("restoring scripts of {id}"));
        self.remap = remap;
        result
    }

    pub fn save_permanent_storage(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        self.global_storage.borrow().save(dir.join(GLOBAL_STORAGE_FILE))?;
        self.player_storage.borrow().save(dir.join(PLAYER_STORAGE_FILE))?;
        Ok(())
    }

    pub fn load_permanent_storage(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        self.global_storage.borrow_mut().load(dir.join(GLOBAL_STORAGE_FILE))?;
        self.player_storage.borrow_mut().load(dir.join(PLAYER_STORAGE_FILE))?;
        Ok(())
    }

    /// In-place script reload for development: every container's state is
    /// saved, the compiled-script cache dropped, temporaries and
    /// subscriptions cleared, then every container is rebuilt from its own
    /// snapshot against the freshly compiled sources.
    pub fn reload_all_scripts(&mut self) -> Result<()> {
        self.factory.drop_cache();
        self.global_storage.borrow_mut().clear_temporary_and_remove_callbacks();
        self.player_storage.borrow_mut().clear_temporary_and_remove_callbacks();
        let codec = SavedDataCodec::plain();
        let record = self.registry.global_mut().save()?;
        self.registry
            .global_mut()
            .load(&record, &self.config, self.factory.as_ref(), &codec)
            .context("reloading global scripts")?;
        for id in self.registry.ids() {
            let Some(container) = self.registry.get_mut(id) else { continue };
            let record = container.save()?;
            container
                .load(&record, &self.config, self.factory.as_ref(), &codec)
                .with_context(|| format!("reloading scripts of {id}"))?;
        }
        Ok(())
    }

    // ---- diagnostics ---------------------------------------------------

    /// Per-script resource table over the sliding per-frame averages.
    pub fn format_resource_usage(&self) -> String {
        let mut per_script: Vec<(f64, u64, usize)> = vec![(0.0, 0, 0); self.config.len()];
        let mut stats = Vec::new();
        self.registry.global().collect_stats(&mut stats);
        for id in self.registry.ids() {
            if let Some(container) = self.registry.get(id) {
                container.collect_stats(&mut stats);
            }
        }
        for (index, s) in stats {
            if let Some(slot) = per_script.get_mut(index) {
                slot.0 += s.avg_instruction_count;
                slot.1 += s.memory_usage;
                slot.2 += 1;
            }
        }
        let mut out = String::new();
        let _ = writeln!(out, "{:<40} {:>10} {:>14} {:>8}", "script", "instances", "avg ops/frame", "memory");
        for (index, (ops, memory, instances)) in per_script.iter().enumerate() {
            if *instances == 0 {
                continue;
            }
            let path = self.config.entry(index).map_or("?", |e| e.path.as_str());
            let _ = writeln!(out, "{path:<40} {instances:>10} {ops:>14.1} {memory:>8}");
        }
        out
    }

    // ---- internals -----------------------------------------------------

    fn run_gc_step(&mut self) {
        self.registry.global_mut().collect_garbage();
        let ids = self.registry.ids();
        if ids.is_empty() || self.options.gc_containers_per_frame == 0 {
            return;
        }
        let steps = self.options.gc_containers_per_frame.min(ids.len());
        for _ in 0..steps {
            self.gc_cursor = (self.gc_cursor + 1) % ids.len();
            if let Some(container) = self.registry.get_mut(ids[self.gc_cursor]) {
                container.collect_garbage();
            }
        }
    }

    /// Drops containers whose owner no longer exists and deactivates the
    /// ones whose owner left the scene without a removal notification.
    fn prune_and_reconcile(&mut self, ctx: &HostContext<'_>) {
        let removed = self.registry.prune_dead(|id| ctx.world.object_exists(id));
        for id in removed {
            log::debug!("dropped scripts of vanished {id}");
        }
        for id in self.registry.active_ids() {
            if !ctx.world.object_in_scene(id) {
                self.deactivate_if_left_scene(ctx, id);
            }
        }
    }

    fn deactivate_if_left_scene(&mut self, ctx: &HostContext<'_>, id: ObjectId) {
        if self.registry.set_active(id, false) && ctx.world.object_exists(id) {
            self.engine_events.push(EngineEvent::ObjectInactive(id));
        }
    }

    fn snapshot_stats(&mut self) {
        self.registry.global_mut().stats_next_frame();
        for id in self.registry.ids() {
            if let Some(container) = self.registry.get_mut(id) {
                container.stats_next_frame();
            }
        }
    }

    fn process_timers(&mut self) {
        let clocks = *self.clocks.borrow();
        let pending = self.registry.global_mut().process_timers(&clocks);
        self.apply_requests(None, pending);
        for id in self.registry.active_ids() {
            if let Some(container) = self.registry.get_mut(id) {
                let pending = container.process_timers(&clocks);
                self.apply_requests(Some(id), pending);
            }
        }
    }

    fn dispatch_local_events(&mut self) {
        for event in self.events.take_finalized() {
            self.deliver_local_event(event);
        }
    }

    fn deliver_local_event(&mut self, event: LocalEvent) {
        let args = [event.payload];
        match event.target {
            EventTarget::Global => {
                let pending = self.registry.global_mut().call_handler_all(&event.name, &args);
                self.apply_requests(None, pending);
            }
            EventTarget::Object(id) => match self.registry.get_mut(id) {
                Some(container) => {
                    let pending = container.call_handler_all(&event.name, &args);
                    self.apply_requests(Some(id), pending);
                }
                None => log::debug!("event '{}' dropped: {id} has no scripts", event.name),
            },
            EventTarget::BroadcastLocal => {
                for id in self.registry.active_ids() {
                    if let Some(container) = self.registry.get_mut(id) {
                        let pending = container.call_handler_all(&event.name, &args);
                        self.apply_requests(Some(id), pending);
                    }
                }
            }
        }
    }

    fn dispatch_engine_events(&mut self) {
        for event in self.engine_events.drain() {
            let handler = event.handler();
            match event {
                EngineEvent::ObjectActive(id)
                | EngineEvent::ObjectInactive(id)
                | EngineEvent::Teleported(id) => {
                    if let Some(container) = self.registry.get_mut(id) {
                        let pending = container.call_handler_all(handler, &[]);
                        self.apply_requests(Some(id), pending);
                    }
                }
                EngineEvent::QuestUpdated { quest, stage } => {
                    self.deliver_to_player(handler, &[ScriptValue::Str(quest), ScriptValue::Int(stage)]);
                }
                EngineEvent::TopicSelected { topic, actor } => {
                    self.deliver_to_player(
                        handler,
                        &[ScriptValue::Str(topic), ScriptValue::ObjectRef(actor)],
                    );
                }
            }
        }
    }

    fn update_containers(&mut self, dt: f64) {
        for id in self.registry.active_ids() {
            if let Some(container) = self.registry.get_mut(id) {
                let pending = container.update(dt);
                self.apply_requests(Some(id), pending);
            }
        }
        let pending = self.registry.global_mut().update(dt);
        self.apply_requests(None, pending);
    }

    fn deliver_to_player(&mut self, name: &str, args: &[ScriptValue]) {
        let Some(id) = self.registry.player_id() else { return };
        let Some(container) = self.registry.get_mut(id) else { return };
        let pending = container.call_handler_all(name, args);
        self.apply_requests(Some(id), pending);
    }

    /// Routes the side effects drained from script handlers. Deferring an
    /// action from inside the action drain panics in the queue, which is
    /// exactly the contract.
    fn apply_requests(&mut self, owner: Option<ObjectId>, pending: Vec<PendingRequest>) {
        for PendingRequest { script_index, request } in pending {
            match request {
                ScriptRequest::PostEvent { target, name, payload } => {
                    self.events.post(LocalEvent { source: owner, target, name, payload });
                }
                ScriptRequest::ScheduleTimer { kind, fire_time, handler, arg } => {
                    let container = match owner {
                        Some(id) => self.registry.get_mut(id),
                        None => Some(self.registry.global_mut()),
                    };
                    if let Some(container) = container {
                        container.schedule_timer(script_index, kind, fire_time, handler, arg);
                    }
                }
                ScriptRequest::DeferAction { handler, arg } => {
                    let trace = self.options.debug_trace.then(|| match owner {
                        Some(id) => format!("script {script_index} of {id}"),
                        None => format!("global script {script_index}"),
                    });
                    self.actions.enqueue(DelayedAction::with_trace(
                        handler.clone(),
                        trace,
                        ActionKind::HandlerCall { owner, script_index, handler, arg },
                    ));
                }
                ScriptRequest::TeleportPlayer { destination } => {
                    self.actions.set_teleport(DelayedAction::new(
                        "teleport player",
                        ActionKind::TeleportPlayer { destination },
                    ));
                }
                ScriptRequest::UiMessage(text) => self.ui_messages.push(text),
                ScriptRequest::ConsolePrint(text) => self.console_prints.push(text),
            }
        }
    }

    fn drain_actions(&mut self, ctx: &mut HostContext<'_>) {
        let (actions, teleport) = self.actions.begin_drain();
        for action in actions.into_iter().chain(teleport) {
            let result = match action.kind {
                ActionKind::Closure(f) => f(),
                ActionKind::HandlerCall { owner, script_index, handler, arg } => {
                    let container = match owner {
                        Some(id) => self.registry.get_mut(id),
                        None => Some(self.registry.global_mut()),
                    };
                    let mut out = Vec::new();
                    if let Some(container) = container {
                        container.call_handler_on(script_index, &handler, &[arg], &mut out);
                    }
                    self.apply_requests(owner, out);
                    Ok(())
                }
                ActionKind::TeleportPlayer { destination } => {
                    match ctx.world.teleport_player(&destination) {
                        Ok(()) => {
                            self.deliver_to_player("on_teleported", &[]);
                            Ok(())
                        }
                        Err(err) => Err(err),
                    }
                }
            };
            if let Err(err) = result {
                log_action_failure(&action.name, action.caller_trace.as_deref(), &err);
            }
        }
        self.actions.finish_drain();
    }

    fn flush_console_prints(&mut self, ctx: &mut HostContext<'_>) {
        for text in std::mem::take(&mut self.console_prints) {
            ctx.ui.print_to_console(&text);
        }
    }
}
