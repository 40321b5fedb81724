//! # ScriptBeat Scheduler
//!
//! The live side of the system: a registration map from task identity to a
//! parsed cron schedule plus its next predicted firing, and a one-second
//! clock that dispatches each due firing as an independent tokio task.
//!
//! ```text
//! Scheduler (tokio interval, 1s resolution)
//!   ├── registration map: task id → { Schedule, next_fire }   (RwLock)
//!   └── on firing → spawn:
//!         stamp lastRun → run script (ScriptRunner, 10min ceiling)
//!         → persist RunLog → stamp script lastRun
//!         → recompute nextRun (if still registered) → notify
//! ```
//!
//! Cron dialect: six fields with seconds — `SEC MIN HOUR DOM MON DOW`.

pub mod cron;
pub mod engine;

pub use cron::Schedule;
pub use engine::Scheduler;
