pub mod cache;
pub mod statrec;

pub use cache::{AccessKind, Cache, MissClass, StallReason};
pub use statrec::StatRec;

use serde::{Deserialize, Serialize};

/// Top-level simulation summary.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sim {
    pub cycles: u64,
    pub accesses: u64,
    pub completed: u64,
    pub elapsed_millis: u128,
}

impl std::ops::AddAssign for Sim {
    fn add_assign(&mut self, other: Self) {
        self.cycles = self.cycles.max(other.cycles);
        self.accesses += other.accesses;
        self.completed += other.completed;
        self.elapsed_millis += other.elapsed_millis;
    }
}
