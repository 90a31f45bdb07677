use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::ScriptValue;

/// Host input events routed to the player container. Only the shapes the
/// core forwards; capture and device handling stay on the host side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum InputEvent {
    KeyPressed { code: u32 },
    KeyReleased { code: u32 },
    MouseButtonPressed { button: u16 },
    MouseButtonReleased { button: u16 },
}

impl InputEvent {
    pub fn to_value(&self) -> ScriptValue {
        let (kind, code) = match self {
            InputEvent::KeyPressed { code } => ("key_pressed", *code as i64),
            InputEvent::KeyReleased { code } => ("key_released", *code as i64),
            InputEvent::MouseButtonPressed { button } => ("mouse_button_pressed", *button as i64),
            InputEvent::MouseButtonReleased { button } => ("mouse_button_released", *button as i64),
        };
        ScriptValue::Map(BTreeMap::from([
            ("kind".to_string(), ScriptValue::Str(kind.to_string())),
            ("code".to_string(), ScriptValue::Int(code)),
        ]))
    }
}
