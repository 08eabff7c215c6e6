use chrono::{DateTime, Utc};
use eyre::Result;
use futures::stream::{self, StreamExt};

use crate::portset::{self, FALLBACK_PORTS};
use crate::queue::{publish_json, MessageQueue};
use crate::store::Store;
use crate::types::{AdHocScanEvent, Cadence, PortSetName, ScanTask, Schedule, TickEvent};

pub const DEFAULT_MAX_IPS: usize = 100;
pub const DEFAULT_BATCH_SIZE: usize = 4000;
pub const FULL_RANGE_BATCH_SIZE: usize = 10_000;

const DEFAULT_TIMEOUT_MS: u64 = 500;
const DEFAULT_TASK_CONCURRENCY: i32 = 50;
const DEFAULT_RETRY_COUNT: i32 = 2;

// Bound on concurrent per-IP dispatches in a bulk ad-hoc request.
const BULK_DISPATCH_CONCURRENCY: usize = 10;

/// What one scan dispatch produced.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub ip_address: String,
    pub scan_id: String,
    pub ports: usize,
    pub total_batches: usize,
    pub enqueued_batches: usize,
}

/// One cadence tick over the due schedules.
#[derive(Debug, Clone)]
pub struct TickSummary {
    pub cadence: Cadence,
    pub due: usize,
    pub dispatched: usize,
    pub tasks_enqueued: usize,
}

/// Stable ID shared by every batch of one logical scan.
pub fn mint_scan_id(ip: &str, now: DateTime<Utc>) -> String {
    format!("scan-{}-{}", ip, now.timestamp())
}

pub fn split_into_batches(ports: &[u16], batch_size: usize) -> Vec<Vec<u16>> {
    let batch_size = if batch_size == 0 { DEFAULT_BATCH_SIZE } else { batch_size };
    ports.chunks(batch_size).map(|chunk| chunk.to_vec()).collect()
}

/// Full-range scans get larger batches; everything else the default.
pub fn batch_size_for(set: PortSetName) -> usize {
    match set {
        PortSetName::Full65k => FULL_RANGE_BATCH_SIZE,
        _ => DEFAULT_BATCH_SIZE,
    }
}

/// Resolve a port set to a concrete list. `previous_open` reads the
/// IP's open-port set and falls back to the common ports when the IP
/// has never shown anything open; a store error is treated the same
/// way so a flaky read cannot kill the schedule.
pub async fn resolve_ports(store: &dyn Store, ip: &str, set: PortSetName) -> Vec<u16> {
    match set {
        PortSetName::PreviousOpen => {
            let known = match store.open_ports(ip).await {
                Ok(ports) => ports,
                Err(error) => {
                    log::error!("[scheduler] open_ports_lookup_failed: ip={} error={}", ip, error);
                    Default::default()
                }
            };

            if known.is_empty() {
                log::debug!("[scheduler] previous_open_fallback: ip={}", ip);
                FALLBACK_PORTS.to_vec()
            } else {
                known.into_iter().collect()
            }
        }
        other => portset::ports_for(other),
    }
}

/// Chunk the port list and enqueue one task per batch. Publish
/// failures are logged and skipped: a missed batch is rediscovered on
/// the next cycle, never retried here.
async fn enqueue_scan(
    tasks: &dyn MessageQueue,
    ip: &str,
    ports: Vec<u16>,
    batch_size: usize,
    schedule_type: Option<Cadence>,
) -> DispatchOutcome {
    let scan_id = mint_scan_id(ip, Utc::now());
    let port_count = ports.len();
    let batches = split_into_batches(&ports, batch_size);
    let total_batches = batches.len();

    let mut enqueued_batches = 0;
    for (batch_id, batch) in batches.into_iter().enumerate() {
        let task = ScanTask {
            ip_address: ip.to_string(),
            ports_to_scan: batch,
            batch_id,
            total_batches,
            scan_id: scan_id.clone(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            concurrency: DEFAULT_TASK_CONCURRENCY,
            retry_count: DEFAULT_RETRY_COUNT,
            schedule_type,
        };

        match publish_json(tasks, &task).await {
            Ok(()) => {
                enqueued_batches += 1;
                log::debug!(
                    "[scheduler] task_enqueued: ip={} scan_id={} batch={}/{}",
                    ip,
                    scan_id,
                    batch_id,
                    total_batches
                );
            }
            Err(error) => {
                log::error!(
                    "[scheduler] enqueue_failed: ip={} scan_id={} batch={} error={}",
                    ip,
                    scan_id,
                    batch_id,
                    error
                );
            }
        }
    }

    DispatchOutcome {
        ip_address: ip.to_string(),
        scan_id,
        ports: port_count,
        total_batches,
        enqueued_batches,
    }
}

async fn dispatch_schedule(
    store: &dyn Store,
    tasks: &dyn MessageQueue,
    schedule: &Schedule,
) -> DispatchOutcome {
    let ports = resolve_ports(store, &schedule.ip_address, schedule.port_set).await;
    enqueue_scan(
        tasks,
        &schedule.ip_address,
        ports,
        batch_size_for(schedule.port_set),
        Some(schedule.cadence),
    )
    .await
}

/// One scheduler pass for a cadence bucket: find due schedules, expand
/// each into batched tasks, and advance `next_run_at` only for
/// schedules that got at least one batch onto the queue. The advance
/// happens after enqueue, not after scan completion, so worker crashes
/// are the queue's problem, not the scheduler's.
pub async fn run_tick(
    store: &dyn Store,
    tasks: &dyn MessageQueue,
    event: &TickEvent,
) -> Result<TickSummary> {
    let now = Utc::now();
    let max_ips = event.max_ips.unwrap_or(DEFAULT_MAX_IPS);
    let due = store.due_schedules(event.schedule_type, now, max_ips).await?;

    log::info!(
        "[scheduler] tick: cadence={} due={} max_ips={}",
        event.schedule_type,
        due.len(),
        max_ips
    );

    let mut dispatched = 0;
    let mut tasks_enqueued = 0;
    for schedule in &due {
        let outcome = dispatch_schedule(store, tasks, schedule).await;

        if outcome.enqueued_batches == 0 {
            // Nothing made it onto the queue; leave next_run_at alone so
            // the next tick picks this schedule up again.
            log::warn!(
                "[scheduler] dispatch_skipped: schedule={} ip={}",
                schedule.schedule_id,
                schedule.ip_address
            );
            continue;
        }

        dispatched += 1;
        tasks_enqueued += outcome.enqueued_batches;

        if let Err(error) = store
            .mark_schedule_dispatched(&schedule.schedule_id, Utc::now())
            .await
        {
            log::error!(
                "[scheduler] schedule_update_failed: schedule={} error={}",
                schedule.schedule_id,
                error
            );
        }
    }

    Ok(TickSummary {
        cadence: event.schedule_type,
        due: due.len(),
        dispatched,
        tasks_enqueued,
    })
}

/// Ad-hoc scan: one IP with explicit ports or a port set, or a list of
/// IPs sharing a port set. No schedule is touched.
pub async fn run_adhoc(
    store: &dyn Store,
    tasks: &dyn MessageQueue,
    event: &AdHocScanEvent,
) -> Result<Vec<DispatchOutcome>> {
    if let Some(ips) = event.ips.as_ref().filter(|ips| !ips.is_empty()) {
        let set = event
            .port_set
            .ok_or_else(|| eyre::eyre!("bulk scan requires a port set"))?;

        log::info!("[scheduler] bulk_scan: ips={} port_set={}", ips.len(), set);

        let outcomes = stream::iter(ips.iter())
            .map(|ip| async move {
                let ports = resolve_ports(store, ip, set).await;
                enqueue_scan(tasks, ip, ports, batch_size_for(set), None).await
            })
            .buffer_unordered(BULK_DISPATCH_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;

        return Ok(outcomes);
    }

    let ip = event
        .ip
        .as_ref()
        .ok_or_else(|| eyre::eyre!("scan event carries neither ip nor ips"))?;

    let (ports, batch_size) = match (&event.ports, event.port_set) {
        (Some(explicit), _) if !explicit.is_empty() => (explicit.clone(), DEFAULT_BATCH_SIZE),
        (_, Some(set)) => (resolve_ports(store, ip, set).await, batch_size_for(set)),
        _ => return Err(eyre::eyre!("scan event carries neither ports nor a port set")),
    };

    Ok(vec![enqueue_scan(tasks, ip, ports, batch_size, None).await])
}
