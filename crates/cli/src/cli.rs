use clap::{Parser, Subcommand};

use tapedeck_core::{WorkerStatus, WorkerType};

/// Operator tool for the tapedeck fleet registry and assignments.
#[derive(Parser, Debug)]
#[command(name = "tapedeck", version, about)]
pub struct CliArgs {
    /// Print machine-readable JSON instead of tables.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Worker instance registry.
    Instances {
        #[command(subcommand)]
        action: InstanceAction,
    },
    /// Target-to-worker assignments.
    Assignments {
        #[command(subcommand)]
        action: AssignmentAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum InstanceAction {
    /// List every registered instance.
    List,
    /// Current load of active workers of one type.
    Load {
        #[arg(long = "type", default_value = "capture")]
        worker_type: WorkerType,
    },
    /// Register or update an instance.
    Register {
        instance_id: String,
        #[arg(long = "type")]
        worker_type: WorkerType,
        #[arg(long, default_value_t = 10)]
        capacity: i32,
        #[arg(long)]
        name: Option<String>,
    },
    /// Set an instance's status (active, inactive, maintenance).
    Status { instance_id: String, status: WorkerStatus },
    /// Record a heartbeat for an instance now.
    Heartbeat { instance_id: String },
    Delete { instance_id: String },
}

#[derive(Subcommand, Debug)]
pub enum AssignmentAction {
    /// List assignments, optionally for one worker.
    Show {
        #[arg(long)]
        worker: Option<String>,
    },
    /// Pin a target to a worker. Replaces any enabled assignment.
    Pin {
        target_id: String,
        worker_id: String,
        #[arg(long = "type", default_value = "capture")]
        worker_type: WorkerType,
    },
    /// Remove a manual pin.
    Unpin {
        target_id: String,
        #[arg(long = "type", default_value = "capture")]
        worker_type: WorkerType,
    },
    /// Remove automatic assignments of a target.
    Clear {
        target_id: String,
        #[arg(long = "type", default_value = "capture")]
        worker_type: WorkerType,
    },
}
