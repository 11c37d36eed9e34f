//! Scheduling -- cron-driven report publication and trend scans.
//!
//! Schedules persist in SQLite so they survive restarts; the engine polls
//! for due work every ten seconds.

pub mod cron;
pub mod engine;

pub use self::cron::{JobSpec, ScheduleEntry, Scheduler};
pub use self::engine::run_scheduler_loop;
