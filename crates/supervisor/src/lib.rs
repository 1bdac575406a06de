//! Per-worker capture process supervision.
//!
//! [`ProcessSupervisor::tick`] reconciles the OS process table against the
//! live targets assigned to this worker: it deduplicates, adopts processes it
//! did not start, restarts captures that stopped producing segments and
//! retires captures whose broadcast ended. Every decision takes `now`
//! explicitly; the OS and filesystem sit behind [`ProcessControl`] and
//! [`ActivityProbe`].

pub mod activity;
pub mod error;
pub mod lock;
pub mod process;
pub mod supervisor;

pub use activity::{Activity, ActivityProbe, SegmentActivity, StaleReason};
pub use error::SupervisorError;
pub use lock::InstanceLock;
pub use process::{OsProcesses, ProcessControl, ProcessInfo, SpawnCommand};
pub use supervisor::{LiveView, ProcessSupervisor, SlotState, SupervisorSettings, TickReport};
