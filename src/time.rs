use serde::{Deserialize, Serialize};

/// Which clock a timer is keyed to. Simulation time stops while the host is
/// paused; game time additionally scales with the in-world time rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    Simulation,
    Game,
}

/// Session clocks. The host advances them from `update()` while unpaused and
/// sets them outright when a session record is loaded.
#[derive(Debug, Clone, Copy)]
pub struct Clocks {
    pub simulation_time: f64,
    pub game_time: f64,
    pub game_time_scale: f64,
}

impl Default for Clocks {
    fn default() -> Self {
        Self { simulation_time: 0.0, game_time: 0.0, game_time_scale: 1.0 }
    }
}

impl Clocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, dt: f64) {
        self.simulation_time += dt;
        self.game_time += dt * self.game_time_scale;
    }

    pub fn get(&self, kind: TimerKind) -> f64 {
        match kind {
            TimerKind::Simulation => self.simulation_time,
            TimerKind::Game => self.game_time,
        }
    }
}
