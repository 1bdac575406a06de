//! Subcommand handlers. Output goes to any writer so the handlers can be
//! exercised against the in-memory store.

use std::io::Write;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};

use tapedeck_core::{WorkerInstance, WorkerStatus, AUTO_ON_LIVE, MANUAL};
use tapedeck_store::{AssignmentRepo, InstanceRepo};

use crate::cli::{AssignmentAction, InstanceAction};

fn age(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    match at {
        None => "never".to_string(),
        Some(at) => {
            let secs = (now - at).num_seconds().max(0);
            match secs {
                0..=119 => format!("{secs}s ago"),
                120..=7199 => format!("{}m ago", secs / 60),
                _ => format!("{}h ago", secs / 3600),
            }
        }
    }
}

pub async fn instances(
    repo: &dyn InstanceRepo,
    loads: &dyn AssignmentRepo,
    action: InstanceAction,
    json: bool,
    out: &mut impl Write,
) -> Result<()> {
    let now = Utc::now();
    match action {
        InstanceAction::List => {
            let list = repo.list_instances().await?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&list)?)?;
                return Ok(());
            }
            writeln!(out, "{:<20} {:<8} {:<12} {:>8}  HEARTBEAT", "INSTANCE", "TYPE", "STATUS", "CAPACITY")?;
            for i in &list {
                writeln!(
                    out,
                    "{:<20} {:<8} {:<12} {:>8}  {}",
                    i.instance_id,
                    i.worker_type,
                    i.status,
                    i.max_capacity,
                    age(i.last_heartbeat, now)
                )?;
            }
        }
        InstanceAction::Load { worker_type } => {
            let list = loads.worker_loads(worker_type).await?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&list)?)?;
                return Ok(());
            }
            if list.is_empty() {
                writeln!(out, "no active {worker_type} workers")?;
                return Ok(());
            }
            writeln!(out, "{:<20} {:>6} {:>8} {:>7}", "INSTANCE", "LOAD", "CAPACITY", "USED")?;
            for l in &list {
                let flag = if l.is_saturated() { "  full" } else { "" };
                writeln!(
                    out,
                    "{:<20} {:>6} {:>8} {:>6.0}%{flag}",
                    l.instance_id,
                    l.current_load,
                    l.max_capacity,
                    l.load_percent()
                )?;
            }
        }
        InstanceAction::Register { instance_id, worker_type, capacity, name } => {
            if capacity < 0 {
                bail!("capacity must not be negative");
            }
            repo.register(&WorkerInstance {
                instance_id: instance_id.clone(),
                worker_type,
                display_name: name,
                max_capacity: capacity,
                status: WorkerStatus::Active,
                last_heartbeat: None,
            })
            .await?;
            writeln!(out, "registered {instance_id} ({worker_type}, capacity {capacity})")?;
        }
        InstanceAction::Status { instance_id, status } => {
            if !repo.set_status(&instance_id, status).await? {
                bail!("no instance {instance_id}");
            }
            writeln!(out, "{instance_id} is now {status}")?;
        }
        InstanceAction::Heartbeat { instance_id } => {
            if !repo.heartbeat(&instance_id, now).await? {
                bail!("no instance {instance_id}");
            }
            writeln!(out, "heartbeat recorded for {instance_id}")?;
        }
        InstanceAction::Delete { instance_id } => {
            if !repo.delete_instance(&instance_id).await? {
                bail!("no instance {instance_id}");
            }
            writeln!(out, "deleted {instance_id}")?;
        }
    }
    Ok(())
}

pub async fn assignments(
    repo: &dyn AssignmentRepo,
    action: AssignmentAction,
    json: bool,
    out: &mut impl Write,
) -> Result<()> {
    match action {
        AssignmentAction::Show { worker } => {
            let list = repo.list_assignments(worker.as_deref()).await?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&list)?)?;
                return Ok(());
            }
            writeln!(out, "{:<28} {:<20} {:<8} {:<8} {:<13} ASSIGNED", "TARGET", "WORKER", "TYPE", "ENABLED", "BY")?;
            for a in &list {
                writeln!(
                    out,
                    "{:<28} {:<20} {:<8} {:<8} {:<13} {}",
                    a.target_id,
                    a.worker_id,
                    a.worker_type,
                    a.enabled,
                    a.assigned_by,
                    a.assigned_at.format("%Y-%m-%d %H:%M:%S")
                )?;
            }
        }
        AssignmentAction::Pin { target_id, worker_id, worker_type } => {
            let replaced = repo.delete_assignments(&target_id, worker_type, None).await?;
            let pinned = repo.insert_assignment(&target_id, &worker_id, worker_type, MANUAL).await?;
            writeln!(
                out,
                "pinned {} to {} ({} replaced)",
                pinned.target_id, pinned.worker_id, replaced
            )?;
        }
        AssignmentAction::Unpin { target_id, worker_type } => {
            let removed = repo.delete_assignments(&target_id, worker_type, Some(MANUAL)).await?;
            writeln!(out, "removed {removed} manual assignment(s) for {target_id}")?;
        }
        AssignmentAction::Clear { target_id, worker_type } => {
            let removed = repo.delete_assignments(&target_id, worker_type, Some(AUTO_ON_LIVE)).await?;
            writeln!(out, "removed {removed} automatic assignment(s) for {target_id}")?;
        }
    }
    Ok(())
}
