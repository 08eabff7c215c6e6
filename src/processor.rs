use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use eyre::Result;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::enricher::EnricherTrigger;
use crate::queue::{decode_message, MessageQueue};
use crate::store::Store;
use crate::types::{BatchResult, EnrichRequest, Port, ScanRecord};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Latency stamped on final-summary ports. Per-connect latencies are
/// not tracked across batches, so summaries carry a nominal 1 ms.
const SUMMARY_PORT_LATENCY: Duration = Duration::from_millis(1);

/// Apply one batch result: persist the per-batch record, union the
/// open ports into the IP's open-port set, and on the last batch write
/// the final summary and fire the enricher.
///
/// Reprocessing the same batch is harmless: per-batch records are
/// timestamped inserts (the TTL prunes the extras), the union merge is
/// idempotent, and the final summary overwrites per `scan_id`.
pub async fn process_batch(
    store: &dyn Store,
    enricher: &dyn EnricherTrigger,
    result: &BatchResult,
) -> Result<()> {
    let now = Utc::now();

    store
        .put_scan_record(ScanRecord {
            ip_address: result.ip_address.clone(),
            scan_timestamp: now,
            scan_id: result.scan_id.clone(),
            open_ports: result.open_ports.clone(),
            scan_duration_ms: result.scan_duration.as_millis() as u64,
            ports_scanned: result.ports_scanned,
            batch_id: Some(result.batch_id),
            total_batches: Some(result.total_batches),
            is_final_summary: false,
            expiration_time: ScanRecord::expiration_from(now),
            schedule_type: result.schedule_type,
        })
        .await?;

    store.touch_last_scanned(&result.ip_address, now).await?;

    let numbers: Vec<u16> = result.open_ports.iter().map(|p| p.number).collect();
    let merged = store.merge_open_ports(&result.ip_address, &numbers).await?;

    log::debug!(
        "[processor] batch_processed: ip={} scan_id={} batch={}/{} open={} known_open={}",
        result.ip_address,
        result.scan_id,
        result.batch_id,
        result.total_batches,
        numbers.len(),
        merged.len()
    );

    if result.batch_id + 1 != result.total_batches {
        return Ok(());
    }

    // Last batch: the summary reflects the post-merge open-port set,
    // not just this batch's discoveries.
    let summary_ports: Vec<Port> = merged
        .iter()
        .map(|number| Port::open(*number, SUMMARY_PORT_LATENCY))
        .collect();

    log::info!(
        "[processor] final_summary: ip={} scan_id={} open_ports={}",
        result.ip_address,
        result.scan_id,
        summary_ports.len()
    );

    store
        .put_final_summary(ScanRecord {
            ip_address: result.ip_address.clone(),
            scan_timestamp: now,
            scan_id: result.scan_id.clone(),
            open_ports: summary_ports,
            scan_duration_ms: result.scan_duration.as_millis() as u64,
            ports_scanned: result.ports_scanned,
            batch_id: None,
            total_batches: None,
            is_final_summary: true,
            expiration_time: ScanRecord::expiration_from(now),
            schedule_type: result.schedule_type,
        })
        .await?;

    if merged.is_empty() {
        return Ok(());
    }

    let request = EnrichRequest {
        ip_address: result.ip_address.clone(),
        scan_id: result.scan_id.clone(),
        open_ports: merged.into_iter().collect(),
        immediate_mode: result.schedule_type.is_none(),
        schedule_id: result.schedule_type.map(|c| c.as_str().to_string()),
    };

    // Enrichment is best-effort; a failed trigger never fails the scan.
    if let Err(error) = enricher.trigger(request).await {
        log::error!(
            "[processor] enricher_trigger_failed: ip={} scan_id={} error={}",
            result.ip_address,
            result.scan_id,
            error
        );
    }

    Ok(())
}

/// Consume the result queue until cancelled. Processing failures nack
/// for redelivery; malformed bodies are dropped.
pub async fn run_processor(
    cancel: CancellationToken,
    store: Arc<dyn Store>,
    results: Arc<dyn MessageQueue>,
    enricher: Arc<dyn EnricherTrigger>,
) {
    log::info!("[processor] started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let delivery = match results.receive().await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(POLL_INTERVAL) => continue,
                }
            }
            Err(error) => {
                log::error!("[processor] receive_failed: error={}", error);
                sleep(POLL_INTERVAL).await;
                continue;
            }
        };

        let result: BatchResult = match decode_message(&delivery.body) {
            Ok(result) => result,
            Err(error) => {
                log::error!("[processor] malformed_result_dropped: error={}", error);
                if let Err(error) = results.ack(delivery.receipt).await {
                    log::warn!("[processor] ack_failed: error={}", error);
                }
                continue;
            }
        };

        match process_batch(store.as_ref(), enricher.as_ref(), &result).await {
            Ok(()) => {
                if let Err(error) = results.ack(delivery.receipt).await {
                    log::warn!("[processor] ack_failed: error={}", error);
                }
            }
            Err(error) => {
                log::error!(
                    "[processor] process_failed: ip={} scan_id={} receive_count={} error={}",
                    result.ip_address,
                    result.scan_id,
                    delivery.receive_count,
                    error
                );
                if let Err(error) = results.nack(delivery.receipt).await {
                    log::warn!("[processor] nack_failed: error={}", error);
                }
            }
        }
    }

    log::info!("[processor] stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enricher::MemoryEnricher;
    use crate::queue::{publish_json, MemoryQueue};
    use crate::store::{consolidated_results, MemoryStore};
    use std::collections::BTreeSet;

    fn batch(ip: &str, scan_id: &str, ports: &[u16], batch_id: usize, total: usize) -> BatchResult {
        BatchResult {
            ip_address: ip.to_string(),
            scan_id: scan_id.to_string(),
            open_ports: ports
                .iter()
                .map(|p| Port::open(*p, Duration::from_millis(2)))
                .collect(),
            scan_duration: Duration::from_millis(120),
            batch_id,
            total_batches: total,
            ports_scanned: ports.len().max(1),
            scan_complete: true,
            schedule_type: None,
        }
    }

    #[tokio::test]
    async fn test_all_closed_scan_writes_empty_summary_without_enrichment() {
        let store = MemoryStore::new();
        let enricher = MemoryEnricher::new("test");

        process_batch(&store, &enricher, &batch("203.0.113.1", "scan-a", &[], 0, 1))
            .await
            .unwrap();

        let records = store.scan_records("203.0.113.1").await.unwrap();
        assert_eq!(records.len(), 2);

        let summary = records.iter().find(|r| r.is_final_summary).unwrap();
        assert!(summary.open_ports.is_empty());

        assert!(store.open_ports("203.0.113.1").await.unwrap().is_empty());
        assert!(enricher.triggered().await.is_empty());
    }

    #[tokio::test]
    async fn test_final_summary_unions_all_batches() {
        let store = MemoryStore::new();
        let enricher = MemoryEnricher::new("test");

        process_batch(&store, &enricher, &batch("ip", "scan-a", &[22, 80], 0, 2))
            .await
            .unwrap();
        process_batch(&store, &enricher, &batch("ip", "scan-a", &[443], 1, 2))
            .await
            .unwrap();

        let records = store.scan_records("ip").await.unwrap();
        let summary = records.iter().find(|r| r.is_final_summary).unwrap();
        let numbers: Vec<u16> = summary.open_ports.iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![22, 80, 443]);

        let triggered = enricher.triggered().await;
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].open_ports, vec![22, 80, 443]);
        assert!(triggered[0].immediate_mode);
    }

    #[tokio::test]
    async fn test_summary_is_subset_of_batch_union() {
        let store = MemoryStore::new();
        let enricher = MemoryEnricher::new("test");

        let batches = [
            batch("ip", "scan-a", &[22, 8080], 0, 3),
            batch("ip", "scan-a", &[], 1, 3),
            batch("ip", "scan-a", &[443, 22], 2, 3),
        ];
        let mut union = BTreeSet::new();
        for b in &batches {
            union.extend(b.open_ports.iter().map(|p| p.number));
            process_batch(&store, &enricher, b).await.unwrap();
        }

        let records = store.scan_records("ip").await.unwrap();
        let summary = records.iter().find(|r| r.is_final_summary).unwrap();
        for port in &summary.open_ports {
            assert!(union.contains(&port.number));
        }
    }

    #[tokio::test]
    async fn test_out_of_order_last_batch_still_converges() {
        let store = MemoryStore::new();
        let enricher = MemoryEnricher::new("test");

        // Last batch first: summary is written immediately.
        process_batch(&store, &enricher, &batch("ip", "scan-a", &[443], 1, 2))
            .await
            .unwrap();
        let records = store.scan_records("ip").await.unwrap();
        assert!(records.iter().any(|r| r.is_final_summary));

        // The earlier batch still unions into the open-port set.
        process_batch(&store, &enricher, &batch("ip", "scan-a", &[22], 0, 2))
            .await
            .unwrap();
        assert_eq!(
            store.open_ports("ip").await.unwrap(),
            BTreeSet::from([22, 443])
        );
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent() {
        let store = MemoryStore::new();
        let enricher = MemoryEnricher::new("test");

        let b = batch("ip", "scan-a", &[22], 1, 2);
        process_batch(&store, &enricher, &b).await.unwrap();
        let ports_after_first = store.open_ports("ip").await.unwrap();

        process_batch(&store, &enricher, &b).await.unwrap();

        // Open-port set unchanged, exactly one summary, two batch rows.
        assert_eq!(store.open_ports("ip").await.unwrap(), ports_after_first);
        let records = store.scan_records("ip").await.unwrap();
        assert_eq!(records.iter().filter(|r| r.is_final_summary).count(), 1);
        assert_eq!(records.iter().filter(|r| !r.is_final_summary).count(), 2);
    }

    #[tokio::test]
    async fn test_scheduled_batch_carries_schedule_id_to_enricher() {
        let store = MemoryStore::new();
        let enricher = MemoryEnricher::new("test");

        let mut b = batch("ip", "scan-a", &[80], 0, 1);
        b.schedule_type = Some(crate::types::Cadence::Daily);
        process_batch(&store, &enricher, &b).await.unwrap();

        let triggered = enricher.triggered().await;
        assert_eq!(triggered.len(), 1);
        assert!(!triggered[0].immediate_mode);
        assert_eq!(triggered[0].schedule_id.as_deref(), Some("daily"));
    }

    #[tokio::test]
    async fn test_processed_batch_touches_last_scanned() {
        let store = MemoryStore::new();
        let enricher = MemoryEnricher::new("test");
        store.add_ip("ip").await.unwrap();

        process_batch(&store, &enricher, &batch("ip", "scan-a", &[], 0, 1))
            .await
            .unwrap();

        let record = store.get_ip("ip").await.unwrap().unwrap();
        assert!(record.last_scanned_at.is_some());
    }

    #[tokio::test]
    async fn test_end_to_end_all_closed_scan() {
        use crate::scheduler;
        use crate::types::AdHocScanEvent;
        use crate::worker::run_worker;

        let store = Arc::new(MemoryStore::new());
        let tasks = Arc::new(MemoryQueue::new("tasks"));
        let results = Arc::new(MemoryQueue::new("results"));
        let enricher = Arc::new(MemoryEnricher::new("test"));
        let cancel = CancellationToken::new();

        // Ports where nothing listens on loopback.
        let closed: Vec<u16> = {
            let a = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let b = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            vec![a.local_addr().unwrap().port(), b.local_addr().unwrap().port()]
        };

        let outcomes = scheduler::run_adhoc(
            store.as_ref(),
            tasks.as_ref(),
            &AdHocScanEvent {
                immediate: true,
                ip: Some("127.0.0.1".to_string()),
                ports: Some(closed),
                port_set: None,
                ips: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].total_batches, 1);
        assert_eq!(tasks.depth().await, 1);

        let worker_handle = tokio::spawn(run_worker(
            cancel.clone(),
            tasks.clone() as Arc<dyn MessageQueue>,
            results.clone() as Arc<dyn MessageQueue>,
        ));
        let processor_handle = tokio::spawn(run_processor(
            cancel.clone(),
            store.clone() as Arc<dyn Store>,
            results.clone() as Arc<dyn MessageQueue>,
            enricher.clone() as Arc<dyn EnricherTrigger>,
        ));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let drained = tasks.depth().await == 0
                && tasks.in_flight_count().await == 0
                && results.depth().await == 0
                && results.in_flight_count().await == 0;
            if drained && !store.scan_records("127.0.0.1").await.unwrap().is_empty() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "pipeline did not drain");
            sleep(Duration::from_millis(20)).await;
        }

        cancel.cancel();
        worker_handle.await.unwrap();
        processor_handle.await.unwrap();

        // One batch record, one empty final summary, nothing open, no
        // enrichment trigger.
        let records = store.scan_records("127.0.0.1").await.unwrap();
        assert_eq!(records.len(), 2);
        let summary = records.iter().find(|r| r.is_final_summary).unwrap();
        assert!(summary.open_ports.is_empty());
        assert!(store.open_ports("127.0.0.1").await.unwrap().is_empty());
        assert!(enricher.triggered().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_processor_drains_queue() {
        let store = Arc::new(MemoryStore::new());
        let results = Arc::new(MemoryQueue::new("results"));
        let enricher = Arc::new(MemoryEnricher::new("test"));
        let cancel = CancellationToken::new();

        publish_json(results.as_ref(), &batch("ip", "scan-a", &[22], 0, 1))
            .await
            .unwrap();
        // A malformed body is dropped, not dead-lettered.
        results.publish("{not json".to_string()).await.unwrap();

        let handle = tokio::spawn(run_processor(
            cancel.clone(),
            store.clone() as Arc<dyn Store>,
            results.clone() as Arc<dyn MessageQueue>,
            enricher.clone() as Arc<dyn EnricherTrigger>,
        ));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.scan_records("ip").await.unwrap().is_empty()
            || results.depth().await > 0
            || results.in_flight_count().await > 0
        {
            assert!(tokio::time::Instant::now() < deadline, "processor did not drain");
            sleep(Duration::from_millis(20)).await;
        }

        cancel.cancel();
        handle.await.unwrap();

        assert!(results.dead_letters().await.is_empty());
        let consolidated = consolidated_results(store.as_ref(), "ip", 10).await.unwrap();
        assert_eq!(consolidated.len(), 1);
        assert!(consolidated[0].is_final_summary);
    }
}
