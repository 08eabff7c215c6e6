pub mod memory;

pub use memory::MemoryStore;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::Result;

use crate::types::{Cadence, IpRecord, PortSetName, ScanRecord, Schedule};

pub const DEFAULT_RESULT_LIMIT: usize = 10;

/// Key-addressed persistence seam used by the scheduler and processor.
/// Any key-value or document store can satisfy it; every operation is
/// expected to be idempotent so queue redeliveries stay harmless.
#[async_trait]
pub trait Store: Send + Sync {
    // Target IPs
    async fn add_ip(&self, ip: &str) -> Result<IpRecord>;
    /// Removes the IP and, best-effort, everything keyed by it:
    /// schedules, the open-port set, scan records, enrichment records.
    /// Partial cascade failures are logged, not returned.
    async fn delete_ip(&self, ip: &str) -> Result<()>;
    async fn get_ip(&self, ip: &str) -> Result<Option<IpRecord>>;
    async fn list_ips(&self, limit: usize, offset: usize) -> Result<Vec<IpRecord>>;
    async fn touch_last_scanned(&self, ip: &str, at: DateTime<Utc>) -> Result<()>;

    // Schedules
    async fn create_schedule(
        &self,
        ip: &str,
        cadence: Cadence,
        port_set: PortSetName,
        enabled: bool,
    ) -> Result<Schedule>;
    async fn update_schedule(
        &self,
        schedule_id: &str,
        cadence: Cadence,
        port_set: PortSetName,
        enabled: bool,
    ) -> Result<Schedule>;
    async fn set_schedule_enabled(&self, schedule_id: &str, enabled: bool) -> Result<()>;
    async fn delete_schedule(&self, schedule_id: &str) -> Result<()>;
    async fn get_schedule(&self, schedule_id: &str) -> Result<Option<Schedule>>;
    async fn schedules_for_ip(&self, ip: &str) -> Result<Vec<Schedule>>;
    /// Schedules with `enabled && next_run_at <= now` for the cadence,
    /// oldest due first, at most `limit`.
    async fn due_schedules(
        &self,
        cadence: Cadence,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Schedule>>;
    /// Stamp a successful dispatch: `last_run_at = now`,
    /// `next_run_at = now + interval(cadence)`.
    async fn mark_schedule_dispatched(&self, schedule_id: &str, now: DateTime<Utc>) -> Result<()>;

    // Open-port sets
    async fn open_ports(&self, ip: &str) -> Result<BTreeSet<u16>>;
    /// Set-union merge; returns the merged set. Commutative and
    /// idempotent, so redelivered batches cannot corrupt the set.
    async fn merge_open_ports(&self, ip: &str, ports: &[u16]) -> Result<BTreeSet<u16>>;
    /// Explicit replacement. Never taken by the result processor.
    async fn replace_open_ports(&self, ip: &str, ports: &[u16]) -> Result<()>;

    // Scan records
    async fn put_scan_record(&self, record: ScanRecord) -> Result<()>;
    /// Final summaries are keyed by `scan_id`: a retry overwrites the
    /// existing summary instead of duplicating it.
    async fn put_final_summary(&self, record: ScanRecord) -> Result<()>;
    async fn scan_records(&self, ip: &str) -> Result<Vec<ScanRecord>>;
    async fn delete_scan_records(&self, ip: &str) -> Result<()>;

    // Enrichment records: out of core, only the delete cascade matters.
    async fn delete_enrichments(&self, ip: &str) -> Result<()>;
}

/// One result row per scan for an IP, newest first.
///
/// Groups the raw records by `scan_id`; a group's final summary wins
/// when present, otherwise a consolidated view is synthesized: latest
/// batch's metadata, union of every batch's open ports, summed
/// `ports_scanned`.
pub async fn consolidated_results(
    store: &dyn Store,
    ip: &str,
    limit: usize,
) -> Result<Vec<ScanRecord>> {
    let limit = if limit == 0 { DEFAULT_RESULT_LIMIT } else { limit };
    let records = store.scan_records(ip).await?;

    let mut groups: HashMap<String, Vec<ScanRecord>> = HashMap::new();
    for record in records {
        groups.entry(record.scan_id.clone()).or_default().push(record);
    }

    let mut results = Vec::with_capacity(groups.len());
    for (_, group) in groups {
        if let Some(summary) = group
            .iter()
            .filter(|r| r.is_final_summary)
            .max_by_key(|r| r.scan_timestamp)
        {
            results.push(summary.clone());
            continue;
        }

        // No summary yet: synthesize one from the batches seen so far.
        let Some(mut latest) = group.iter().max_by_key(|r| r.scan_timestamp).cloned() else {
            continue;
        };

        let mut by_number = BTreeMap::new();
        let mut total_ports_scanned = 0;
        for record in &group {
            total_ports_scanned += record.ports_scanned;
            for port in &record.open_ports {
                by_number.entry(port.number).or_insert_with(|| port.clone());
            }
        }

        latest.open_ports = by_number.into_values().collect();
        latest.ports_scanned = total_ports_scanned;
        results.push(latest);
    }

    results.sort_by(|a, b| b.scan_timestamp.cmp(&a.scan_timestamp));
    results.truncate(limit);
    Ok(results)
}
