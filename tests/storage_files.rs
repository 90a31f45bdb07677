use simscript::config::ScriptsConfiguration;
use simscript::host::{HostOptions, ScriptHost};
use simscript::rhai_runtime::{RhaiOptions, RhaiScriptFactory};
use simscript::storage::KvStore;
use simscript::value::{ObjectId, ScriptValue};

fn empty_host() -> ScriptHost {
    ScriptHost::with_rhai(
        ScriptsConfiguration::default(),
        RhaiScriptFactory::new(RhaiOptions::default()),
        HostOptions::default(),
    )
}

#[test]
fn only_persistent_entries_survive_the_files() {
    let dir = tempfile::tempdir().expect("temp dir");
    let host = empty_host();
    host.global_storage().borrow_mut().set("world_seed", ScriptValue::Int(1234), true);
    host.global_storage().borrow_mut().set("scratch", ScriptValue::Int(1), false);
    host.player_storage().borrow_mut().set(
        "home",
        ScriptValue::ObjectRef(ObjectId::new(0, 42)),
        true,
    );
    host.save_permanent_storage(dir.path()).expect("save storage");

    let host = empty_host();
    host.load_permanent_storage(dir.path()).expect("load storage");
    let global = host.global_storage().borrow();
    assert_eq!(global.get("world_seed"), Some(&ScriptValue::Int(1234)));
    assert_eq!(global.get("scratch"), None);
    let player = host.player_storage().borrow();
    assert_eq!(player.get("home"), Some(&ScriptValue::ObjectRef(ObjectId::new(0, 42))));
}

#[test]
fn absent_files_leave_the_stores_empty() {
    let dir = tempfile::tempdir().expect("temp dir");
    let host = empty_host();
    host.load_permanent_storage(dir.path()).expect("load from empty dir");
    assert!(host.global_storage().borrow().is_empty());
    assert!(host.player_storage().borrow().is_empty());
}

#[test]
fn store_file_roundtrip_is_directly_usable() {
    let dir = tempfile::tempdir().expect("temp dir");
    let file = dir.path().join("store.bin");
    let mut store = KvStore::new();
    store.set("kept", ScriptValue::Str("yes".to_string()), true);
    store.save(&file).expect("save");

    let mut loaded = KvStore::new();
    loaded.load(&file).expect("load");
    assert_eq!(loaded.get("kept"), Some(&ScriptValue::Str("yes".to_string())));
    assert!(loaded.is_persistent("kept"));
}
