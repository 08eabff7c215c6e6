use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::queue::{decode_message, publish_json, MessageQueue};
use crate::scanner;
use crate::types::ScanTask;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pull scan tasks, run the port scanner, publish batch results. The
/// worker owns nothing persistent: a task that fails stays on the
/// queue (nack) until the queue dead-letters it, and duplicate
/// deliveries are absorbed by the idempotent processor downstream.
pub async fn run_worker(
    cancel: CancellationToken,
    tasks: Arc<dyn MessageQueue>,
    results: Arc<dyn MessageQueue>,
) {
    log::info!("[worker] started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let delivery = match tasks.receive().await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(POLL_INTERVAL) => continue,
                }
            }
            Err(error) => {
                log::error!("[worker] receive_failed: error={}", error);
                sleep(POLL_INTERVAL).await;
                continue;
            }
        };

        let task: ScanTask = match decode_message(&delivery.body) {
            Ok(task) => task,
            Err(error) => {
                log::error!("[worker] malformed_task_dropped: error={}", error);
                if let Err(error) = tasks.ack(delivery.receipt).await {
                    log::warn!("[worker] ack_failed: error={}", error);
                }
                continue;
            }
        };

        log::debug!(
            "[worker] task_received: ip={} scan_id={} batch={}/{} ports={} receive_count={}",
            task.ip_address,
            task.scan_id,
            task.batch_id,
            task.total_batches,
            task.ports_to_scan.len(),
            delivery.receive_count
        );

        let outcome = match scanner::scan_ports(&cancel, &task).await {
            Ok(outcome) => outcome,
            Err(error) => {
                log::error!(
                    "[worker] scan_failed: ip={} scan_id={} batch={} error={}",
                    task.ip_address,
                    task.scan_id,
                    task.batch_id,
                    error
                );
                if let Err(error) = tasks.nack(delivery.receipt).await {
                    log::warn!("[worker] nack_failed: error={}", error);
                }
                continue;
            }
        };

        let open_count = outcome.open_ports.len();
        let result = outcome.into_batch_result(&task);

        // A result we cannot publish means the batch was not processed;
        // leave the task for redelivery.
        if let Err(error) = publish_json(results.as_ref(), &result).await {
            log::error!(
                "[worker] publish_failed: ip={} scan_id={} batch={} error={}",
                task.ip_address,
                task.scan_id,
                task.batch_id,
                error
            );
            if let Err(error) = tasks.nack(delivery.receipt).await {
                log::warn!("[worker] nack_failed: error={}", error);
            }
            continue;
        }

        if let Err(error) = tasks.ack(delivery.receipt).await {
            log::warn!("[worker] ack_failed: error={}", error);
        }

        log::debug!(
            "[worker] task_complete: ip={} scan_id={} batch={}/{} open={}",
            task.ip_address,
            task.scan_id,
            task.batch_id,
            task.total_batches,
            open_count
        );
    }

    log::info!("[worker] stopped");
}
