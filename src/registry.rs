use std::collections::HashMap;

use crate::config::AutoStartEntry;
use crate::container::ScriptContainer;
use crate::runtime::ScriptDomain;
use crate::value::ObjectId;

/// Maps object identity to its script container and tracks the active set
/// (containers eligible for per-frame updates and event delivery). Active
/// iteration order is insertion order; nothing outside this module may rely
/// on ordering across containers.
pub struct ContainerRegistry {
    containers: HashMap<ObjectId, ScriptContainer>,
    global: ScriptContainer,
    player: Option<ObjectId>,
    active: Vec<ObjectId>,
}

impl ContainerRegistry {
    pub fn new(global_auto_start: Vec<AutoStartEntry>) -> Self {
        Self {
            containers: HashMap::new(),
            global: ScriptContainer::new(ScriptDomain::Global, None, global_auto_start),
            player: None,
            active: Vec::new(),
        }
    }

    pub fn global(&self) -> &ScriptContainer {
        &self.global
    }

    pub fn global_mut(&mut self) -> &mut ScriptContainer {
        &mut self.global
    }

    pub fn player_id(&self) -> Option<ObjectId> {
        self.player
    }

    pub fn player_mut(&mut self) -> Option<&mut ScriptContainer> {
        let id = self.player?;
        self.containers.get_mut(&id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&ScriptContainer> {
        self.containers.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut ScriptContainer> {
        self.containers.get_mut(&id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.containers.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        self.containers.keys().copied().collect()
    }

    /// Creates or returns the container for an object. Idempotent for
    /// non-player objects; creating a second player container is a broken
    /// invariant that would corrupt every later frame, so it is fatal.
    pub fn attach(
        &mut self,
        id: ObjectId,
        domain: ScriptDomain,
        auto_start: Vec<AutoStartEntry>,
    ) -> &mut ScriptContainer {
        if domain == ScriptDomain::Player {
            match self.player {
                None => self.player = Some(id),
                Some(existing) if existing == id => {}
                Some(_) => panic!("player container is initialized twice"),
            }
        }
        self.containers
            .entry(id)
            .or_insert_with(|| ScriptContainer::new(domain, Some(id), auto_start))
    }

    /// Drops a container and its timers on permanent object removal. No
    /// event fires.
    pub fn detach(&mut self, id: ObjectId) -> Option<ScriptContainer> {
        self.active.retain(|a| *a != id);
        if self.player == Some(id) {
            self.player = None;
        }
        self.containers.remove(&id)
    }

    /// Returns true when membership actually changed.
    pub fn set_active(&mut self, id: ObjectId, active: bool) -> bool {
        let Some(container) = self.containers.get_mut(&id) else {
            return false;
        };
        container.set_active(active);
        if active {
            if self.active.contains(&id) {
                return false;
            }
            self.active.push(id);
            true
        } else {
            let before = self.active.len();
            self.active.retain(|a| *a != id);
            self.active.len() != before
        }
    }

    pub fn is_active(&self, id: ObjectId) -> bool {
        self.active.contains(&id)
    }

    pub fn active_ids(&self) -> Vec<ObjectId> {
        self.active.clone()
    }

    /// Removes containers whose owner is gone from the world. The player
    /// container survives cell transitions because its identity is stable;
    /// it is only dropped on `clear`.
    pub fn prune_dead(&mut self, exists: impl Fn(ObjectId) -> bool) -> Vec<ObjectId> {
        let mut removed = Vec::new();
        let player = self.player;
        self.containers.retain(|id, _| {
            if Some(*id) == player || exists(*id) {
                true
            } else {
                removed.push(*id);
                false
            }
        });
        self.active.retain(|id| !removed.contains(id));
        removed
    }

    /// Full session reset: drops every per-object container (player
    /// included) and all global scripts.
    pub fn clear(&mut self) {
        self.containers.clear();
        self.active.clear();
        self.player = None;
        self.global.remove_all_scripts();
        self.global.set_active(false);
    }

    pub fn set_global_auto_start(&mut self, auto_start: Vec<AutoStartEntry>) {
        self.global = ScriptContainer::new(ScriptDomain::Global, None, auto_start);
    }
}
