//! Application state shared by handlers.

use std::time::Instant;

use crate::service::Orchestrator;

pub struct AppState {
    pub orchestrator: Orchestrator,
    /// Server start time
    pub start_time: Instant,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            start_time: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
