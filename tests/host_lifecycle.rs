use std::collections::HashMap;

use anyhow::Result;
use simscript::config::{ObjectKind, ScriptEntry, ScriptFlags, ScriptsConfiguration};
use simscript::host::{HostContext, HostOptions, ScriptHost, UiSink, WorldModel};
use simscript::rhai_runtime::{RhaiOptions, RhaiScriptFactory};
use simscript::value::{ObjectId, ScriptValue};

struct TestWorld {
    objects: HashMap<ObjectId, (ObjectKind, String, bool)>,
    content_files: Vec<String>,
    last_generated: ObjectId,
}

impl TestWorld {
    fn new(content_files: &[&str]) -> Self {
        Self {
            objects: HashMap::new(),
            content_files: content_files.iter().map(|s| s.to_string()).collect(),
            last_generated: ObjectId::generated(0),
        }
    }

    fn add(&mut self, id: ObjectId, kind: ObjectKind, record: &str) {
        self.objects.insert(id, (kind, record.to_string(), true));
    }
}

impl WorldModel for TestWorld {
    fn object_exists(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    fn object_in_scene(&self, id: ObjectId) -> bool {
        self.objects.get(&id).is_some_and(|o| o.2)
    }

    fn object_kind(&self, id: ObjectId) -> Option<ObjectKind> {
        self.objects.get(&id).map(|o| o.0)
    }

    fn record_id(&self, id: ObjectId) -> Option<String> {
        self.objects.get(&id).map(|o| o.1.clone())
    }

    fn content_files(&self) -> Vec<String> {
        self.content_files.clone()
    }

    fn last_generated(&self) -> ObjectId {
        self.last_generated
    }

    fn set_last_generated(&mut self, id: ObjectId) {
        self.last_generated = id;
    }

    fn teleport_player(&mut self, _destination: &ScriptValue) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct TestUi {
    messages: Vec<String>,
    console: Vec<String>,
}

impl UiSink for TestUi {
    fn message_box(&mut self, text: &str) {
        self.messages.push(text.to_string());
    }

    fn print_to_console(&mut self, text: &str) {
        self.console.push(text.to_string());
    }
}

fn local_entry(path: &str, kind: ObjectKind) -> ScriptEntry {
    ScriptEntry {
        path: path.to_string(),
        flags: ScriptFlags::LOCAL,
        kinds: vec![kind],
        records: Vec::new(),
        refs: Vec::new(),
        init_data: None,
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const COUNTER_SCRIPT: &str = r#"
    fn init(data) {
        this.ticks = 0;
        set_simulation_timer(1.0, "on_timer", ());
    }
    fn on_timer(arg) {
        this.ticks += 1;
        storage_set("ticks", this.ticks, true);
    }
    fn on_console_command(mode, command) {
        if command == "ticks" {
            print_console("ticks=" + this.ticks);
            true
        } else {
            false
        }
    }
"#;

fn counter_host() -> ScriptHost {
    let config =
        ScriptsConfiguration::from_entries(vec![local_entry("counter.rhai", ObjectKind::Npc)]);
    let factory = RhaiScriptFactory::new(RhaiOptions::default());
    factory.register_source("counter.rhai", COUNTER_SCRIPT);
    ScriptHost::with_rhai(config, factory, HostOptions::default())
}

#[test]
fn timer_fires_once_and_state_survives_reordered_reload() {
    init_logging();
    let npc = ObjectId::new(0, 7);
    let mut world = TestWorld::new(&["base.esm", "extra.esm"]);
    world.add(npc, ObjectKind::Npc, "guard");
    let mut ui = TestUi::default();
    let mut host = counter_host();
    {
        let mut ctx = HostContext { world: &mut world, ui: &mut ui };
        host.new_game_started().expect("new game");
        host.object_added_to_scene(&mut ctx, npc).expect("add to scene");
        host.update(&mut ctx, 0.5, false);
        host.synchronized_update(&mut ctx);
        assert_eq!(host.global_storage().borrow().get("ticks"), None, "timer must not fire early");

        host.update(&mut ctx, 0.5, false);
        host.synchronized_update(&mut ctx);
        host.update(&mut ctx, 0.5, false);
        host.synchronized_update(&mut ctx);
    }
    assert_eq!(
        host.global_storage().borrow().get("ticks"),
        Some(&ScriptValue::Int(1)),
        "timer fires exactly once"
    );
    let container = host.registry().get(npc).expect("container");
    assert_eq!(container.pending_timers(), 0);

    let object_record =
        host.save_object_scripts(npc).expect("save object").expect("container record");
    let session = {
        let ctx = HostContext { world: &mut world, ui: &mut ui };
        host.write_session_record(&ctx).expect("session record")
    };

    // Fresh session with the content files in a different load order; the
    // object keeps its identity through the name-based remap.
    let npc_reloaded = ObjectId::new(1, 7);
    let mut world = TestWorld::new(&["extra.esm", "base.esm"]);
    world.add(npc_reloaded, ObjectKind::Npc, "guard");
    let mut ui = TestUi::default();
    let mut host = counter_host();
    let mut ctx = HostContext { world: &mut world, ui: &mut ui };
    host.read_session_record(&mut ctx, &session).expect("read session record");
    host.load_object_scripts(npc_reloaded, &object_record).expect("load object scripts");

    let container = host.registry().get(npc_reloaded).expect("container after load");
    assert_eq!(container.script_indices(), vec![0]);
    assert_eq!(container.pending_timers(), 0, "the fired timer must not come back");
    assert_eq!(host.clocks().simulation_time, 1.5);

    host.handle_console_command(&mut ctx, "script", "ticks", Some(npc_reloaded));
    assert_eq!(ui.console, vec!["ticks=1"], "script state survived the reload");
}

#[test]
fn attach_is_idempotent() {
    init_logging();
    let npc = ObjectId::new(0, 3);
    let mut world = TestWorld::new(&["base.esm"]);
    world.add(npc, ObjectKind::Npc, "guard");
    let mut ui = TestUi::default();
    let mut host = counter_host();
    let mut ctx = HostContext { world: &mut world, ui: &mut ui };
    host.new_game_started().expect("new game");
    host.object_added_to_scene(&mut ctx, npc).expect("first add");
    host.object_added_to_scene(&mut ctx, npc).expect("second add");
    assert_eq!(host.registry().get(npc).expect("container").script_indices(), vec![0]);
}

#[test]
fn game_loaded_without_record_starts_global_scripts() {
    init_logging();
    let config = ScriptsConfiguration::from_entries(vec![ScriptEntry {
        path: "global.rhai".to_string(),
        flags: ScriptFlags::GLOBAL,
        kinds: Vec::new(),
        records: Vec::new(),
        refs: Vec::new(),
        init_data: None,
    }]);
    let factory = RhaiScriptFactory::new(RhaiOptions::default());
    factory.register_source("global.rhai", "fn init(data) { storage_set(\"started\", true, false); }");
    let mut host = ScriptHost::with_rhai(config, factory, HostOptions::default());
    let mut world = TestWorld::new(&["base.esm"]);
    let mut ui = TestUi::default();
    let mut ctx = HostContext { world: &mut world, ui: &mut ui };

    // A save written before scripting existed carries no session record,
    // so game_loaded alone must bring the configured global scripts up.
    host.game_loaded().expect("game loaded");
    host.update(&mut ctx, 0.1, false);
    host.synchronized_update(&mut ctx);
    assert_eq!(host.global_storage().borrow().get("started"), Some(&ScriptValue::Bool(true)));
}

#[test]
#[should_panic(expected = "player container is initialized twice")]
fn second_player_is_fatal() {
    let mut host = counter_host();
    host.setup_player(ObjectId::new(0, 1)).expect("first player");
    let _ = host.setup_player(ObjectId::new(0, 2));
}

#[test]
fn global_events_become_visible_one_frame_later() {
    init_logging();
    let config = ScriptsConfiguration::from_entries(vec![ScriptEntry {
        path: "global.rhai".to_string(),
        flags: ScriptFlags::GLOBAL,
        kinds: Vec::new(),
        records: Vec::new(),
        refs: Vec::new(),
        init_data: None,
    }]);
    let factory = RhaiScriptFactory::new(RhaiOptions::default());
    factory.register_source(
        "global.rhai",
        r#"
            fn init(data) { }
            fn on_new_game() { send_global_event("ping", 1); }
            fn ping(n) { storage_set("pinged", n, false); }
        "#,
    );
    let mut host = ScriptHost::with_rhai(config, factory, HostOptions::default());
    let mut world = TestWorld::new(&["base.esm"]);
    let mut ui = TestUi::default();
    let mut ctx = HostContext { world: &mut world, ui: &mut ui };

    host.new_game_started().expect("new game");
    host.update(&mut ctx, 0.1, false);
    host.synchronized_update(&mut ctx);
    assert_eq!(host.global_storage().borrow().get("pinged"), None, "event posted this frame");

    host.update(&mut ctx, 0.1, false);
    host.synchronized_update(&mut ctx);
    assert_eq!(host.global_storage().borrow().get("pinged"), Some(&ScriptValue::Int(1)));
}
