use anyhow::Result;

use crate::value::{ObjectId, ScriptValue};

/// What a drained action actually does. Host code defers arbitrary closures;
/// scripts defer a handler call on their own container.
pub enum ActionKind {
    Closure(Box<dyn FnOnce() -> Result<()>>),
    HandlerCall { owner: Option<ObjectId>, script_index: usize, handler: String, arg: ScriptValue },
    TeleportPlayer { destination: ScriptValue },
}

/// A callback postponed to the fixed safe point of the frame.
pub struct DelayedAction {
    pub name: String,
    /// Enqueue-site description, captured only when debug tracing is on.
    pub caller_trace: Option<String>,
    pub kind: ActionKind,
}

impl DelayedAction {
    pub fn new(name: impl Into<String>, kind: ActionKind) -> Self {
        Self { name: name.into(), caller_trace: None, kind }
    }

    pub fn with_trace(name: impl Into<String>, trace: Option<String>, kind: ActionKind) -> Self {
        Self { name: name.into(), caller_trace: trace, kind }
    }
}

/// FIFO queue of deferred actions plus the single reserved player-teleport
/// slot. Scheduling a second teleport before the drain point overwrites the
/// first; that is deliberate policy inherited from the original design, not
/// an accident.
#[derive(Default)]
pub struct ActionQueue {
    queue: Vec<DelayedAction>,
    teleport: Option<DelayedAction>,
    draining: bool,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Panics if called while the queue is draining: an action scheduling
    /// another action would allow unbounded chains to starve the frame loop.
    pub fn enqueue(&mut self, action: DelayedAction) {
        if self.draining {
            panic!("a delayed action is not allowed to schedule another delayed action");
        }
        self.queue.push(action);
    }

    pub fn set_teleport(&mut self, action: DelayedAction) {
        self.teleport = Some(action);
    }

    /// Takes everything queued for this drain and marks the queue as
    /// draining so late `enqueue` calls fail fast. Callers must pair this
    /// with `finish_drain`.
    pub fn begin_drain(&mut self) -> (Vec<DelayedAction>, Option<DelayedAction>) {
        self.draining = true;
        (std::mem::take(&mut self.queue), self.teleport.take())
    }

    pub fn finish_drain(&mut self) {
        self.draining = false;
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.teleport.is_none()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.teleport = None;
        self.draining = false;
    }
}

/// Logs one failed action without aborting the rest of the drain.
pub fn log_action_failure(name: &str, caller_trace: Option<&str>, err: &anyhow::Error) {
    log::error!("error in delayed action '{name}': {err:#}");
    match caller_trace {
        Some(trace) => log::error!("scheduled from {trace}"),
        None => log::error!("enable debug tracing to record action call sites"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn closure_action(name: &str, log: &Rc<RefCell<Vec<String>>>, fail: bool) -> DelayedAction {
        let log = Rc::clone(log);
        let tag = name.to_string();
        DelayedAction::new(
            name,
            ActionKind::Closure(Box::new(move || {
                log.borrow_mut().push(tag);
                if fail {
                    anyhow::bail!("boom");
                }
                Ok(())
            })),
        )
    }

    #[test]
    fn drains_fifo_then_teleport_exactly_once() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut queue = ActionQueue::new();
        queue.enqueue(closure_action("a", &log, false));
        queue.enqueue(closure_action("b", &log, true));
        queue.enqueue(closure_action("c", &log, false));
        queue.set_teleport(closure_action("tp1", &log, false));
        queue.set_teleport(closure_action("tp2", &log, false));

        let (actions, teleport) = queue.begin_drain();
        for action in actions.into_iter().chain(teleport) {
            if let ActionKind::Closure(f) = action.kind {
                if let Err(err) = f() {
                    log_action_failure(&action.name, action.caller_trace.as_deref(), &err);
                }
            }
        }
        queue.finish_drain();

        // The failed action did not stop later ones, and the second teleport
        // overwrote the first.
        assert_eq!(*log.borrow(), vec!["a", "b", "c", "tp2"]);
        assert!(queue.is_empty());
    }

    #[test]
    #[should_panic(expected = "not allowed to schedule another delayed action")]
    fn enqueue_during_drain_is_fatal() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut queue = ActionQueue::new();
        queue.enqueue(closure_action("a", &log, false));
        let _taken = queue.begin_drain();
        queue.enqueue(closure_action("late", &log, false));
    }
}
