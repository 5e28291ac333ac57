//! # chronod scheduler
//!
//! The daemon half of chronod: durable schedule state, process supervision,
//! and the single-logical-thread dispatcher loop.
//!
//! ## Architecture
//! ```text
//! Dispatcher (current-thread tokio loop, owns all state)
//!   ├── ScheduleRegistry: per (user, name) trigger state + rolling stats
//!   ├── CalendarEngine (per schedule): next trigger instants
//!   ├── start queue → admission control (max_running / max_queue / max_procs)
//!   ├── ProcessSupervisor: spawn, sequence, coalesce output, kill policies
//!   ├── NotifyRouter: log / webhook notifier dispatch
//!   └── StateStore: two JSON documents, atomically rewritten on flush
//!
//! Gateway readers/writers and job pipe readers run as separate tasks but
//! only move bytes and typed events through channels; every piece of shared
//! state is mutated inside the dispatcher loop.
//! ```

pub mod dispatcher;
pub mod events;
pub mod notify;
pub mod persistence;
pub mod registry;
pub mod schedule;
pub mod supervisor;

pub use dispatcher::Daemon;
pub use events::{ClientRequest, Event, OutputStream};
pub use notify::{Notifier, NotifyEvent, NotifyRecord, NotifyRouter};
pub use persistence::StateStore;
pub use registry::{ScheduleKey, ScheduleRegistry, StatWindow, TriggerState};
pub use schedule::{ScheduleDef, ScheduleRule};
pub use supervisor::ProcessSupervisor;
