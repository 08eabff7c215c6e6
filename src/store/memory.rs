use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::Store;
use crate::types::{
    Cadence, EnrichRequest, IpRecord, OpenPortSet, PortSetName, ScanRecord, Schedule,
};

/// DashMap-backed reference adapter. Backs the local pipeline and the
/// test suite; a document store can replace it behind the `Store` trait
/// without touching the scheduler or processor. Optionally snapshots
/// to a JSON file so separate CLI invocations share state.
#[derive(Default)]
pub struct MemoryStore {
    ips: DashMap<String, IpRecord>,
    schedules: DashMap<String, Schedule>,
    open_ports: DashMap<String, OpenPortSet>,
    results: DashMap<String, Vec<ScanRecord>>,
    enrichments: DashMap<String, Vec<EnrichRequest>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    ips: Vec<IpRecord>,
    schedules: Vec<Schedule>,
    open_ports: Vec<OpenPortSet>,
    results: Vec<ScanRecord>,
    enrichments: Vec<EnrichRequest>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot written by `save`. A missing file yields an
    /// empty store.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("[store::memory] load: path={} missing, starting empty", path.display());
            return Ok(Self::new());
        }

        let raw = fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read state file {}", path.display()))?;
        let snapshot: Snapshot = serde_json::from_str(&raw)
            .wrap_err_with(|| format!("failed to parse state file {}", path.display()))?;

        let store = Self::new();
        for ip in snapshot.ips {
            store.ips.insert(ip.ip_address.clone(), ip);
        }
        for schedule in snapshot.schedules {
            store.schedules.insert(schedule.schedule_id.clone(), schedule);
        }
        for set in snapshot.open_ports {
            store.open_ports.insert(set.ip_address.clone(), set);
        }
        for record in snapshot.results {
            store
                .results
                .entry(record.ip_address.clone())
                .or_default()
                .push(record);
        }
        for request in snapshot.enrichments {
            store
                .enrichments
                .entry(request.ip_address.clone())
                .or_default()
                .push(request);
        }
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = Snapshot {
            ips: self.ips.iter().map(|r| r.clone()).collect(),
            schedules: self.schedules.iter().map(|s| s.clone()).collect(),
            open_ports: self.open_ports.iter().map(|p| p.clone()).collect(),
            results: self
                .results
                .iter()
                .flat_map(|r| r.value().clone())
                .collect(),
            enrichments: self
                .enrichments
                .iter()
                .flat_map(|e| e.value().clone())
                .collect(),
        };

        let raw = serde_json::to_string_pretty(&snapshot)?;
        fs::write(path, raw)
            .wrap_err_with(|| format!("failed to write state file {}", path.display()))?;
        log::debug!("[store::memory] save: path={}", path.display());
        Ok(())
    }

    /// The full open-port entity, timestamps included.
    pub fn open_port_set(&self, ip: &str) -> Option<OpenPortSet> {
        self.open_ports.get(ip).map(|p| p.clone())
    }

    /// Record an enrichment result for an IP. Enrichment itself is a
    /// downstream collaborator; this exists so the delete cascade has
    /// something real to cascade over in tests.
    pub fn add_enrichment(&self, request: EnrichRequest) {
        self.enrichments
            .entry(request.ip_address.clone())
            .or_default()
            .push(request);
    }

    pub fn enrichment_count(&self, ip: &str) -> usize {
        self.enrichments.get(ip).map(|e| e.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn add_ip(&self, ip: &str) -> Result<IpRecord> {
        let record = self
            .ips
            .entry(ip.to_string())
            .or_insert_with(|| IpRecord {
                ip_address: ip.to_string(),
                created_at: Utc::now(),
                last_scanned_at: None,
            })
            .clone();
        log::debug!("[store::memory] add_ip: ip={}", ip);
        Ok(record)
    }

    async fn delete_ip(&self, ip: &str) -> Result<()> {
        self.ips.remove(ip);

        // Cascade is best-effort per category; a failure in one never
        // blocks the others. The in-memory ops cannot fail, but the
        // logging mirrors what a remote adapter would do.
        let schedule_ids: Vec<String> = self
            .schedules
            .iter()
            .filter(|s| s.ip_address == ip)
            .map(|s| s.schedule_id.clone())
            .collect();
        for schedule_id in &schedule_ids {
            self.schedules.remove(schedule_id);
        }

        self.open_ports.remove(ip);
        self.results.remove(ip);
        self.enrichments.remove(ip);

        log::debug!(
            "[store::memory] delete_ip: ip={} schedules_removed={}",
            ip,
            schedule_ids.len()
        );
        Ok(())
    }

    async fn get_ip(&self, ip: &str) -> Result<Option<IpRecord>> {
        Ok(self.ips.get(ip).map(|r| r.clone()))
    }

    async fn list_ips(&self, limit: usize, offset: usize) -> Result<Vec<IpRecord>> {
        let mut ips: Vec<IpRecord> = self.ips.iter().map(|r| r.clone()).collect();
        ips.sort_by(|a, b| a.ip_address.cmp(&b.ip_address));
        Ok(ips.into_iter().skip(offset).take(limit).collect())
    }

    async fn touch_last_scanned(&self, ip: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(mut record) = self.ips.get_mut(ip) {
            record.last_scanned_at = Some(at);
        }
        Ok(())
    }

    async fn create_schedule(
        &self,
        ip: &str,
        cadence: Cadence,
        port_set: PortSetName,
        enabled: bool,
    ) -> Result<Schedule> {
        let now = Utc::now();
        let schedule = Schedule {
            schedule_id: Uuid::new_v4().to_string(),
            ip_address: ip.to_string(),
            cadence,
            port_set,
            enabled,
            created_at: now,
            updated_at: now,
            last_run_at: None,
            next_run_at: now + cadence.interval(),
        };

        log::debug!(
            "[store::memory] create_schedule: ip={} cadence={} port_set={} enabled={} id={}",
            ip,
            cadence,
            port_set,
            enabled,
            schedule.schedule_id
        );

        self.schedules
            .insert(schedule.schedule_id.clone(), schedule.clone());
        Ok(schedule)
    }

    async fn update_schedule(
        &self,
        schedule_id: &str,
        cadence: Cadence,
        port_set: PortSetName,
        enabled: bool,
    ) -> Result<Schedule> {
        let mut entry = self
            .schedules
            .get_mut(schedule_id)
            .ok_or_else(|| eyre::eyre!("schedule not found: {}", schedule_id))?;

        let now = Utc::now();
        entry.cadence = cadence;
        entry.port_set = port_set;
        entry.enabled = enabled;
        entry.updated_at = now;
        entry.next_run_at = now + cadence.interval();
        Ok(entry.clone())
    }

    async fn set_schedule_enabled(&self, schedule_id: &str, enabled: bool) -> Result<()> {
        let mut entry = self
            .schedules
            .get_mut(schedule_id)
            .ok_or_else(|| eyre::eyre!("schedule not found: {}", schedule_id))?;

        let now = Utc::now();
        entry.enabled = enabled;
        entry.updated_at = now;
        if enabled {
            entry.next_run_at = now + entry.cadence.interval();
        }
        Ok(())
    }

    async fn delete_schedule(&self, schedule_id: &str) -> Result<()> {
        self.schedules.remove(schedule_id);
        Ok(())
    }

    async fn get_schedule(&self, schedule_id: &str) -> Result<Option<Schedule>> {
        Ok(self.schedules.get(schedule_id).map(|s| s.clone()))
    }

    async fn schedules_for_ip(&self, ip: &str) -> Result<Vec<Schedule>> {
        let mut schedules: Vec<Schedule> = self
            .schedules
            .iter()
            .filter(|s| s.ip_address == ip)
            .map(|s| s.clone())
            .collect();
        schedules.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(schedules)
    }

    async fn due_schedules(
        &self,
        cadence: Cadence,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Schedule>> {
        let mut due: Vec<Schedule> = self
            .schedules
            .iter()
            .filter(|s| s.cadence == cadence && s.enabled && s.next_run_at <= now)
            .map(|s| s.clone())
            .collect();
        due.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_schedule_dispatched(&self, schedule_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut entry = self
            .schedules
            .get_mut(schedule_id)
            .ok_or_else(|| eyre::eyre!("schedule not found: {}", schedule_id))?;

        entry.last_run_at = Some(now);
        entry.next_run_at = now + entry.cadence.interval();
        entry.updated_at = now;
        Ok(())
    }

    async fn open_ports(&self, ip: &str) -> Result<BTreeSet<u16>> {
        Ok(self
            .open_ports
            .get(ip)
            .map(|p| p.ports.clone())
            .unwrap_or_default())
    }

    async fn merge_open_ports(&self, ip: &str, ports: &[u16]) -> Result<BTreeSet<u16>> {
        let now = Utc::now();
        // Entry lock makes the read-modify-write atomic here; a remote
        // adapter would use a conditional write instead.
        let mut entry = self
            .open_ports
            .entry(ip.to_string())
            .or_insert_with(|| OpenPortSet {
                ip_address: ip.to_string(),
                ports: BTreeSet::new(),
                last_updated_at: now,
            });
        entry.ports.extend(ports.iter().copied());
        entry.last_updated_at = now;
        Ok(entry.ports.clone())
    }

    async fn replace_open_ports(&self, ip: &str, ports: &[u16]) -> Result<()> {
        self.open_ports.insert(
            ip.to_string(),
            OpenPortSet {
                ip_address: ip.to_string(),
                ports: ports.iter().copied().collect(),
                last_updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn put_scan_record(&self, record: ScanRecord) -> Result<()> {
        self.results
            .entry(record.ip_address.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn put_final_summary(&self, record: ScanRecord) -> Result<()> {
        let mut records = self.results.entry(record.ip_address.clone()).or_default();
        // Stable key per scan: replace any summary already written for
        // this scan_id so a redelivered last batch cannot duplicate it.
        records.retain(|r| !(r.is_final_summary && r.scan_id == record.scan_id));
        records.push(record);
        Ok(())
    }

    async fn scan_records(&self, ip: &str) -> Result<Vec<ScanRecord>> {
        Ok(self.results.get(ip).map(|r| r.clone()).unwrap_or_default())
    }

    async fn delete_scan_records(&self, ip: &str) -> Result<()> {
        self.results.remove(ip);
        Ok(())
    }

    async fn delete_enrichments(&self, ip: &str) -> Result<()> {
        self.enrichments.remove(ip);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::consolidated_results;
    use crate::types::Port;
    use std::time::Duration;

    fn record(ip: &str, scan_id: &str, ports: &[u16], at: DateTime<Utc>) -> ScanRecord {
        ScanRecord {
            ip_address: ip.to_string(),
            scan_timestamp: at,
            scan_id: scan_id.to_string(),
            open_ports: ports
                .iter()
                .map(|p| Port::open(*p, Duration::from_millis(1)))
                .collect(),
            scan_duration_ms: 100,
            ports_scanned: ports.len(),
            batch_id: Some(0),
            total_batches: Some(1),
            is_final_summary: false,
            expiration_time: ScanRecord::expiration_from(at),
            schedule_type: None,
        }
    }

    #[tokio::test]
    async fn test_ip_listing_is_paginated_and_sorted() {
        let store = MemoryStore::new();
        for ip in ["10.0.0.3", "10.0.0.1", "10.0.0.2"] {
            store.add_ip(ip).await.unwrap();
        }

        let page = store.list_ips(2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].ip_address, "10.0.0.1");
        assert_eq!(page[1].ip_address, "10.0.0.2");

        let rest = store.list_ips(2, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].ip_address, "10.0.0.3");
    }

    #[tokio::test]
    async fn test_schedule_lifecycle() {
        let store = MemoryStore::new();
        let schedule = store
            .create_schedule("10.0.0.1", Cadence::Daily, PortSetName::Top100, true)
            .await
            .unwrap();

        assert!(schedule.enabled);
        assert!(schedule.last_run_at.is_none());
        assert!(schedule.next_run_at > schedule.created_at);

        let fetched = store.get_schedule(&schedule.schedule_id).await.unwrap();
        assert_eq!(fetched.as_ref(), Some(&schedule));

        let updated = store
            .update_schedule(
                &schedule.schedule_id,
                Cadence::Hourly,
                PortSetName::PreviousOpen,
                false,
            )
            .await
            .unwrap();
        assert_eq!(updated.cadence, Cadence::Hourly);
        assert_eq!(updated.port_set, PortSetName::PreviousOpen);
        assert!(!updated.enabled);

        store.delete_schedule(&schedule.schedule_id).await.unwrap();
        assert!(store.get_schedule(&schedule.schedule_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enable_resets_next_run() {
        let store = MemoryStore::new();
        let schedule = store
            .create_schedule("10.0.0.1", Cadence::Hourly, PortSetName::Top100, false)
            .await
            .unwrap();

        let before = Utc::now();
        store
            .set_schedule_enabled(&schedule.schedule_id, true)
            .await
            .unwrap();

        let enabled = store
            .get_schedule(&schedule.schedule_id)
            .await
            .unwrap()
            .unwrap();
        assert!(enabled.enabled);
        assert!(enabled.next_run_at >= before + chrono::Duration::hours(1));
    }

    #[tokio::test]
    async fn test_due_schedules_filters_and_limits() {
        let store = MemoryStore::new();
        let due = store
            .create_schedule("10.0.0.1", Cadence::Hourly, PortSetName::Top100, true)
            .await
            .unwrap();
        let disabled = store
            .create_schedule("10.0.0.2", Cadence::Hourly, PortSetName::Top100, false)
            .await
            .unwrap();
        let other_cadence = store
            .create_schedule("10.0.0.3", Cadence::Daily, PortSetName::Top100, true)
            .await
            .unwrap();

        // Not due yet at creation time.
        let now = Utc::now();
        assert!(store
            .due_schedules(Cadence::Hourly, now, 100)
            .await
            .unwrap()
            .is_empty());

        // Two hours from now only the enabled hourly schedule is due.
        let later = now + chrono::Duration::hours(2);
        let found = store.due_schedules(Cadence::Hourly, later, 100).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].schedule_id, due.schedule_id);
        assert_ne!(found[0].schedule_id, disabled.schedule_id);
        assert_ne!(found[0].schedule_id, other_cadence.schedule_id);
    }

    #[tokio::test]
    async fn test_mark_dispatched_advances_next_run() {
        let store = MemoryStore::new();
        let schedule = store
            .create_schedule("10.0.0.1", Cadence::Daily, PortSetName::Top100, true)
            .await
            .unwrap();

        let now = Utc::now() + chrono::Duration::hours(25);
        store
            .mark_schedule_dispatched(&schedule.schedule_id, now)
            .await
            .unwrap();

        let after = store
            .get_schedule(&schedule.schedule_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.last_run_at, Some(now));
        assert_eq!(after.next_run_at, now + chrono::Duration::hours(24));
        assert!(after.next_run_at > after.last_run_at.unwrap());
    }

    #[tokio::test]
    async fn test_merge_open_ports_is_union() {
        let store = MemoryStore::new();
        store.merge_open_ports("10.0.0.1", &[443, 22]).await.unwrap();
        let merged = store.merge_open_ports("10.0.0.1", &[80, 22]).await.unwrap();

        assert_eq!(merged, BTreeSet::from([22, 80, 443]));
        assert_eq!(store.open_ports("10.0.0.1").await.unwrap(), merged);
    }

    #[tokio::test]
    async fn test_merge_is_commutative_and_idempotent() {
        let a = MemoryStore::new();
        a.merge_open_ports("ip", &[1, 2]).await.unwrap();
        a.merge_open_ports("ip", &[2, 3]).await.unwrap();

        let b = MemoryStore::new();
        b.merge_open_ports("ip", &[2, 3]).await.unwrap();
        b.merge_open_ports("ip", &[1, 2]).await.unwrap();
        // Reprocessing the same batch changes nothing.
        b.merge_open_ports("ip", &[1, 2]).await.unwrap();

        assert_eq!(
            a.open_ports("ip").await.unwrap(),
            b.open_ports("ip").await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_replace_open_ports_truncates() {
        let store = MemoryStore::new();
        store.merge_open_ports("ip", &[22, 80, 443]).await.unwrap();
        store.replace_open_ports("ip", &[8080]).await.unwrap();
        assert_eq!(store.open_ports("ip").await.unwrap(), BTreeSet::from([8080]));
    }

    #[tokio::test]
    async fn test_final_summary_overwrites_per_scan_id() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut first = record("ip", "scan-1", &[22], now);
        first.is_final_summary = true;
        store.put_final_summary(first).await.unwrap();

        let mut second = record("ip", "scan-1", &[22, 80], now + chrono::Duration::seconds(5));
        second.is_final_summary = true;
        store.put_final_summary(second.clone()).await.unwrap();

        let records = store.scan_records("ip").await.unwrap();
        let summaries: Vec<&ScanRecord> =
            records.iter().filter(|r| r.is_final_summary).collect();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0], &second);
    }

    #[tokio::test]
    async fn test_delete_ip_cascades_all_categories() {
        let store = MemoryStore::new();
        store.add_ip("10.0.0.9").await.unwrap();
        for _ in 0..3 {
            store
                .create_schedule("10.0.0.9", Cadence::Daily, PortSetName::Top100, true)
                .await
                .unwrap();
        }
        store.merge_open_ports("10.0.0.9", &[22, 80]).await.unwrap();
        let now = Utc::now();
        for i in 0..120 {
            store
                .put_scan_record(record(
                    "10.0.0.9",
                    &format!("scan-{}", i),
                    &[22],
                    now + chrono::Duration::seconds(i),
                ))
                .await
                .unwrap();
        }
        store.add_enrichment(EnrichRequest {
            ip_address: "10.0.0.9".to_string(),
            scan_id: "scan-0".to_string(),
            open_ports: vec![22],
            immediate_mode: false,
            schedule_id: None,
        });

        store.delete_ip("10.0.0.9").await.unwrap();

        assert!(store.get_ip("10.0.0.9").await.unwrap().is_none());
        assert!(store.schedules_for_ip("10.0.0.9").await.unwrap().is_empty());
        assert!(store.open_ports("10.0.0.9").await.unwrap().is_empty());
        assert!(store.scan_records("10.0.0.9").await.unwrap().is_empty());
        assert_eq!(store.enrichment_count("10.0.0.9"), 0);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let store = MemoryStore::new();
        store.add_ip("10.0.0.1").await.unwrap();
        store
            .create_schedule("10.0.0.1", Cadence::Daily, PortSetName::Top100, true)
            .await
            .unwrap();
        store.merge_open_ports("10.0.0.1", &[22, 80]).await.unwrap();
        store
            .put_scan_record(record("10.0.0.1", "scan-1", &[22], Utc::now()))
            .await
            .unwrap();

        let path = std::env::temp_dir().join(format!("sweep-state-{}.json", Uuid::new_v4()));
        store.save(&path).unwrap();

        let restored = MemoryStore::load(&path).unwrap();
        assert!(restored.get_ip("10.0.0.1").await.unwrap().is_some());
        assert_eq!(restored.schedules_for_ip("10.0.0.1").await.unwrap().len(), 1);
        assert_eq!(
            restored.open_ports("10.0.0.1").await.unwrap(),
            BTreeSet::from([22, 80])
        );
        assert_eq!(restored.scan_records("10.0.0.1").await.unwrap().len(), 1);

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_load_missing_state_starts_empty() {
        let path = std::env::temp_dir().join(format!("sweep-missing-{}.json", Uuid::new_v4()));
        let store = MemoryStore::load(&path).unwrap();
        assert!(store.list_ips(10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_consolidated_results_prefers_final_summary() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store
            .put_scan_record(record("ip", "scan-1", &[22], now))
            .await
            .unwrap();
        store
            .put_scan_record(record(
                "ip",
                "scan-1",
                &[80],
                now + chrono::Duration::seconds(1),
            ))
            .await
            .unwrap();
        let mut summary = record("ip", "scan-1", &[22, 80], now + chrono::Duration::seconds(2));
        summary.is_final_summary = true;
        summary.batch_id = None;
        summary.total_batches = None;
        store.put_final_summary(summary.clone()).await.unwrap();

        let results = consolidated_results(&store, "ip", 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], summary);
    }

    #[tokio::test]
    async fn test_consolidated_results_synthesizes_without_summary() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store
            .put_scan_record(record("ip", "scan-1", &[443, 22], now))
            .await
            .unwrap();
        store
            .put_scan_record(record(
                "ip",
                "scan-1",
                &[22, 80],
                now + chrono::Duration::seconds(1),
            ))
            .await
            .unwrap();

        let results = consolidated_results(&store, "ip", 10).await.unwrap();
        assert_eq!(results.len(), 1);

        let numbers: Vec<u16> = results[0].open_ports.iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![22, 80, 443]);
        assert_eq!(results[0].ports_scanned, 4);
        assert_eq!(results[0].scan_timestamp, now + chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn test_consolidated_results_sorted_desc_and_limited() {
        let store = MemoryStore::new();
        let now = Utc::now();

        for i in 0..5 {
            store
                .put_scan_record(record(
                    "ip",
                    &format!("scan-{}", i),
                    &[22],
                    now + chrono::Duration::seconds(i),
                ))
                .await
                .unwrap();
        }

        let results = consolidated_results(&store, "ip", 3).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].scan_id, "scan-4");
        assert_eq!(results[1].scan_id, "scan-3");
        assert_eq!(results[2].scan_id, "scan-2");
    }
}
