use smallvec::SmallVec;

use crate::persist::{SavedDataCodec, SavedTimer};
use crate::time::{Clocks, TimerKind};
use crate::value::ScriptValue;

/// One pending timer. `seq` preserves insertion order among timers with the
/// same fire time.
#[derive(Debug, Clone)]
pub struct Timer {
    pub kind: TimerKind,
    pub fire_time: f64,
    pub script_index: usize,
    pub handler: String,
    pub arg: ScriptValue,
    seq: u64,
}

/// Per-container timer queue over both clocks. Timers fire in ascending
/// fire-time order per kind, ties broken by insertion order, and are removed
/// from the queue before their callback runs.
#[derive(Default)]
pub struct TimerQueue {
    timers: Vec<Timer>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(
        &mut self,
        kind: TimerKind,
        fire_time: f64,
        script_index: usize,
        handler: impl Into<String>,
        arg: ScriptValue,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let timer = Timer { kind, fire_time, script_index, handler: handler.into(), arg, seq };
        // Keep ascending (kind-local) order on insert so the due sweep stays
        // a stable front-to-back scan.
        let pos = self
            .timers
            .iter()
            .position(|t| t.kind == timer.kind && t.fire_time > timer.fire_time)
            .unwrap_or(self.timers.len());
        self.timers.insert(pos, timer);
    }

    /// Removes and returns every timer whose threshold has been reached,
    /// ordered by fire time then insertion order across both kinds.
    pub fn pop_due(&mut self, clocks: &Clocks) -> SmallVec<[Timer; 4]> {
        let mut due: SmallVec<[Timer; 4]> = SmallVec::new();
        let mut i = 0;
        while i < self.timers.len() {
            if self.timers[i].fire_time <= clocks.get(self.timers[i].kind) {
                due.push(self.timers.remove(i));
            } else {
                i += 1;
            }
        }
        due.sort_by(|a, b| {
            a.fire_time.total_cmp(&b.fire_time).then_with(|| a.seq.cmp(&b.seq))
        });
        due
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }

    pub fn remove_script(&mut self, script_index: usize) {
        self.timers.retain(|t| t.script_index != script_index);
    }

    pub fn save_for_script(&self, script_index: usize) -> Vec<SavedTimer> {
        self.timers
            .iter()
            .filter(|t| t.script_index == script_index)
            .map(|t| SavedTimer {
                kind: t.kind,
                fire_time: t.fire_time,
                handler: t.handler.clone(),
                arg: t.arg.clone(),
            })
            .collect()
    }

    pub fn restore(&mut self, script_index: usize, saved: Vec<SavedTimer>, codec: &SavedDataCodec<'_>) {
        for timer in saved {
            self.schedule(
                timer.kind,
                timer.fire_time,
                script_index,
                timer.handler,
                codec.decode(timer.arg),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clocks(sim: f64, game: f64) -> Clocks {
        Clocks { simulation_time: sim, game_time: game, game_time_scale: 1.0 }
    }

    #[test]
    fn fires_once_in_order_with_insertion_ties() {
        let mut queue = TimerQueue::new();
        queue.schedule(TimerKind::Simulation, 2.0, 0, "late", ScriptValue::Unit);
        queue.schedule(TimerKind::Simulation, 1.0, 0, "first", ScriptValue::Unit);
        queue.schedule(TimerKind::Simulation, 1.0, 0, "second", ScriptValue::Unit);

        assert!(queue.pop_due(&clocks(0.5, 0.0)).is_empty());

        let due: Vec<String> =
            queue.pop_due(&clocks(1.5, 0.0)).into_iter().map(|t| t.handler).collect();
        assert_eq!(due, vec!["first", "second"]);
        assert_eq!(queue.len(), 1);

        let due: Vec<String> =
            queue.pop_due(&clocks(5.0, 0.0)).into_iter().map(|t| t.handler).collect();
        assert_eq!(due, vec!["late"]);
        assert!(queue.pop_due(&clocks(10.0, 10.0)).is_empty());
    }

    #[test]
    fn game_timers_key_off_the_game_clock() {
        let mut queue = TimerQueue::new();
        queue.schedule(TimerKind::Game, 3.0, 1, "game", ScriptValue::Unit);
        assert!(queue.pop_due(&clocks(10.0, 2.0)).is_empty());
        assert_eq!(queue.pop_due(&clocks(10.0, 3.0)).len(), 1);
    }
}
