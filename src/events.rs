use serde::{Deserialize, Serialize};

use crate::persist::SavedDataCodec;
use crate::value::{ObjectId, ScriptValue};

/// Where an inter-script event is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTarget {
    Global,
    Object(ObjectId),
    /// Every currently active per-object container.
    BroadcastLocal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEvent {
    pub source: Option<ObjectId>,
    pub target: EventTarget,
    pub name: String,
    pub payload: ScriptValue,
}

/// Persisted event backlog: the batch already closed but not yet delivered,
/// plus events still in the open batch at save time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavedEvents {
    pub finalized: Vec<LocalEvent>,
    pub open: Vec<LocalEvent>,
}

/// Inter-script event channel with a one-frame batching discipline: events
/// posted while the current batch is being handled are not visible until the
/// next `finalize_batch`, never re-entrantly within the same flush.
#[derive(Default)]
pub struct LocalEventBus {
    open: Vec<LocalEvent>,
    finalized: Vec<LocalEvent>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&mut self, event: LocalEvent) {
        self.open.push(event);
    }

    /// Closes the currently open batch. Must run before `take_finalized`
    /// within the same update cycle.
    pub fn finalize_batch(&mut self) {
        self.finalized.append(&mut self.open);
    }

    /// Hands over the closed batch for delivery, leaving the open batch to
    /// accumulate events raised by the handlers themselves.
    pub fn take_finalized(&mut self) -> Vec<LocalEvent> {
        std::mem::take(&mut self.finalized)
    }

    pub fn pending_finalized(&self) -> usize {
        self.finalized.len()
    }

    pub fn pending_open(&self) -> usize {
        self.open.len()
    }

    pub fn clear(&mut self) {
        self.open.clear();
        self.finalized.clear();
    }

    pub fn save(&self) -> SavedEvents {
        SavedEvents { finalized: self.finalized.clone(), open: self.open.clone() }
    }

    pub fn load(&mut self, mut saved: SavedEvents, codec: &SavedDataCodec<'_>) {
        for event in saved.finalized.iter_mut().chain(saved.open.iter_mut()) {
            event.payload = codec.decode(std::mem::take(&mut event.payload));
            if let Some(source) = event.source.as_mut() {
                *source = codec.remap_id(*source);
            }
            if let EventTarget::Object(id) = &mut event.target {
                *id = codec.remap_id(*id);
            }
        }
        self.finalized = saved.finalized;
        self.open = saved.open;
    }
}

/// Engine-originated events, delivered to fixed handler names in queue
/// order. Not persisted; the host re-raises scene state after a load.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    ObjectActive(ObjectId),
    ObjectInactive(ObjectId),
    Teleported(ObjectId),
    QuestUpdated { quest: String, stage: i64 },
    TopicSelected { topic: String, actor: ObjectId },
}

impl EngineEvent {
    pub fn handler(&self) -> &'static str {
        match self {
            EngineEvent::ObjectActive(_) => "on_active",
            EngineEvent::ObjectInactive(_) => "on_inactive",
            EngineEvent::Teleported(_) => "on_teleported",
            EngineEvent::QuestUpdated { .. } => "on_quest_update",
            EngineEvent::TopicSelected { .. } => "on_topic_select",
        }
    }
}

#[derive(Default)]
pub struct EngineEventQueue {
    queue: Vec<EngineEvent>,
}

impl EngineEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: EngineEvent) {
        self.queue.push(event);
    }

    pub fn drain(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.queue)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
