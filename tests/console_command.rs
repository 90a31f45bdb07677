use anyhow::Result;
use simscript::config::{ObjectKind, ScriptEntry, ScriptFlags, ScriptsConfiguration};
use simscript::host::{HostContext, HostOptions, ScriptHost, UiSink, WorldModel};
use simscript::rhai_runtime::{RhaiOptions, RhaiScriptFactory};
use simscript::value::{ObjectId, ScriptValue};

struct BareWorld;

impl WorldModel for BareWorld {
    fn object_exists(&self, _id: ObjectId) -> bool {
        true
    }

    fn object_in_scene(&self, _id: ObjectId) -> bool {
        true
    }

    fn object_kind(&self, _id: ObjectId) -> Option<ObjectKind> {
        Some(ObjectKind::Npc)
    }

    fn record_id(&self, _id: ObjectId) -> Option<String> {
        None
    }

    fn content_files(&self) -> Vec<String> {
        vec!["base.esm".to_string()]
    }

    fn last_generated(&self) -> ObjectId {
        ObjectId::generated(0)
    }

    fn set_last_generated(&mut self, _id: ObjectId) {}

    fn teleport_player(&mut self, _destination: &ScriptValue) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingUi {
    console: Vec<String>,
}

impl UiSink for RecordingUi {
    fn message_box(&mut self, _text: &str) {}

    fn print_to_console(&mut self, text: &str) {
        self.console.push(text.to_string());
    }
}

fn host_with_global(source: &str) -> ScriptHost {
    let config = ScriptsConfiguration::from_entries(vec![ScriptEntry {
        path: "global.rhai".to_string(),
        flags: ScriptFlags::GLOBAL,
        kinds: Vec::new(),
        records: Vec::new(),
        refs: Vec::new(),
        init_data: None,
    }]);
    let factory = RhaiScriptFactory::new(RhaiOptions::default());
    factory.register_source("global.rhai", source);
    ScriptHost::with_rhai(config, factory, HostOptions::default())
}

#[test]
fn command_outside_a_session_gets_a_diagnostic() {
    let mut host = host_with_global("fn init(data) { }");
    let mut world = BareWorld;
    let mut ui = RecordingUi::default();
    let mut ctx = HostContext { world: &mut world, ui: &mut ui };
    host.handle_console_command(&mut ctx, "script", "whatever", None);
    assert_eq!(ui.console, vec!["No active game session; scripts are not running."]);
}

#[test]
fn selected_object_without_scripts_gets_a_diagnostic() {
    let mut host = host_with_global("fn init(data) { }");
    let mut world = BareWorld;
    let mut ui = RecordingUi::default();
    let mut ctx = HostContext { world: &mut world, ui: &mut ui };
    host.game_loaded().expect("game loaded");
    host.handle_console_command(&mut ctx, "script", "whatever", Some(ObjectId::new(0, 9)));
    assert_eq!(ui.console, vec!["Selected object has no attached scripts."]);
}

#[test]
fn unhandled_command_gets_a_diagnostic() {
    let mut host = host_with_global(
        r#"
            fn init(data) { }
            fn on_console_command(mode, command) { false }
        "#,
    );
    let mut world = BareWorld;
    let mut ui = RecordingUi::default();
    {
        let mut ctx = HostContext { world: &mut world, ui: &mut ui };
        host.new_game_started().expect("new game");
        host.handle_console_command(&mut ctx, "script", "whatever", None);
    }
    assert_eq!(ui.console, vec!["The command was not handled by any script."]);
}

#[test]
fn consumed_command_is_silent_and_prints_script_output() {
    let mut host = host_with_global(
        r#"
            fn init(data) { }
            fn on_console_command(mode, command) {
                print_console(mode + ": " + command);
                true
            }
        "#,
    );
    let mut world = BareWorld;
    let mut ui = RecordingUi::default();
    {
        let mut ctx = HostContext { world: &mut world, ui: &mut ui };
        host.new_game_started().expect("new game");
        host.handle_console_command(&mut ctx, "script", "roll 1d6", None);
    }
    assert_eq!(ui.console, vec!["script: roll 1d6"]);
}
