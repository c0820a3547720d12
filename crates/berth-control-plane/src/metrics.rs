//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use berth_core::{HostKind, TaskStatus};

use crate::connection::ReachabilityState;
use crate::state::AppState;
use crate::store::TaskStore;

/// Collect all metrics from AppState and format as Prometheus text.
pub async fn collect_metrics(state: &Arc<AppState>) -> String {
    let mut output = String::new();

    collect_host_metrics(state, &mut output).await;
    collect_task_metrics(state, &mut output).await;
    collect_webhook_metrics(state, &mut output);

    output
}

/// Collect host metrics by kind and reachability.
async fn collect_host_metrics(state: &Arc<AppState>, output: &mut String) {
    let hosts = state.registry.list().await;
    let reachability = state.connections.reachability().snapshot().await;

    let kinds = [HostKind::Agent, HostKind::Ssh, HostKind::Portainer];
    let mut counts = [[0u64; 3]; 3];

    for host in &hosts {
        let kind = kinds.iter().position(|k| *k == host.kind()).unwrap_or(0);
        let reach = match reachability.get(&host.id).map(|r| r.state) {
            Some(ReachabilityState::Connected) => 0,
            Some(ReachabilityState::Unreachable) => 1,
            None => 2,
        };
        counts[kind][reach] += 1;
    }

    writeln!(
        output,
        "# HELP berth_hosts Number of registered hosts by kind and reachability"
    )
    .ok();
    writeln!(output, "# TYPE berth_hosts gauge").ok();
    for (kind, row) in kinds.iter().zip(counts.iter()) {
        for (reach, count) in ["connected", "unreachable", "unknown"].iter().zip(row.iter()) {
            writeln!(
                output,
                "berth_hosts{{kind=\"{kind}\",reachability=\"{reach}\"}} {count}"
            )
            .ok();
        }
    }

    let sessions = state.connections.hub().connected_count().await;
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP berth_agent_sessions Number of open agent channels"
    )
    .ok();
    writeln!(output, "# TYPE berth_agent_sessions gauge").ok();
    writeln!(output, "berth_agent_sessions {sessions}").ok();
}

/// Collect task metrics by status.
async fn collect_task_metrics(state: &Arc<AppState>, output: &mut String) {
    let tasks = state.store.list_tasks(None).await;

    let mut queued = 0u64;
    let mut running = 0u64;
    let mut succeeded = 0u64;
    let mut failed = 0u64;
    let mut cancelled = 0u64;

    for task in &tasks {
        match task.status {
            TaskStatus::Queued => queued += 1,
            TaskStatus::Running => running += 1,
            TaskStatus::Succeeded => succeeded += 1,
            TaskStatus::Failed => failed += 1,
            TaskStatus::Cancelled => cancelled += 1,
        }
    }

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP berth_tasks_total Total number of tasks by status"
    )
    .ok();
    writeln!(output, "# TYPE berth_tasks_total gauge").ok();
    writeln!(output, "berth_tasks_total{{status=\"queued\"}} {queued}").ok();
    writeln!(output, "berth_tasks_total{{status=\"running\"}} {running}").ok();
    writeln!(
        output,
        "berth_tasks_total{{status=\"succeeded\"}} {succeeded}"
    )
    .ok();
    writeln!(output, "berth_tasks_total{{status=\"failed\"}} {failed}").ok();
    writeln!(
        output,
        "berth_tasks_total{{status=\"cancelled\"}} {cancelled}"
    )
    .ok();
}

/// Collect webhook delivery counters by outcome.
fn collect_webhook_metrics(state: &Arc<AppState>, output: &mut String) {
    let stats = state.webhooks.stats();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP berth_webhook_deliveries_total Webhook deliveries by outcome"
    )
    .ok();
    writeln!(output, "# TYPE berth_webhook_deliveries_total counter").ok();
    for (outcome, counter) in [
        ("accepted", &stats.accepted),
        ("ignored", &stats.ignored),
        ("rejected", &stats.rejected),
    ] {
        writeln!(
            output,
            "berth_webhook_deliveries_total{{outcome=\"{outcome}\"}} {}",
            counter.load(Ordering::Relaxed)
        )
        .ok();
    }
}
