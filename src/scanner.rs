use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use eyre::{Result, WrapErr};
use futures::stream::{self, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::types::{BatchResult, Port, ScanTask};

pub const DEFAULT_CONCURRENCY: usize = 50;

const PRE_RETRY_DELAY: Duration = Duration::from_millis(5);
const RETRY_BACKOFF_STEP_MS: u64 = 20;

/// Scanner output for one batch of ports against one IP.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub open_ports: Vec<Port>,
    pub scan_duration: Duration,
    pub ports_scanned: usize,
    pub complete: bool,
}

impl BatchOutcome {
    /// Pair the outcome with its originating task for the result queue.
    pub fn into_batch_result(self, task: &ScanTask) -> BatchResult {
        BatchResult {
            ip_address: task.ip_address.clone(),
            scan_id: task.scan_id.clone(),
            open_ports: self.open_ports,
            scan_duration: self.scan_duration,
            batch_id: task.batch_id,
            total_batches: task.total_batches,
            ports_scanned: self.ports_scanned,
            scan_complete: self.complete,
            schedule_type: task.schedule_type,
        }
    }
}

pub(crate) fn effective_concurrency(requested: i32) -> usize {
    if requested <= 0 {
        DEFAULT_CONCURRENCY
    } else {
        requested as usize
    }
}

pub(crate) fn effective_retries(requested: i32) -> u32 {
    requested.max(0) as u32
}

async fn connect_once(addr: SocketAddr, connect_timeout: Duration) -> Option<Duration> {
    let start = Instant::now();
    match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            // Connect succeeded, close immediately; no banner grab.
            drop(stream);
            Some(start.elapsed())
        }
        // Refused or timed out: not open from this vantage point.
        _ => None,
    }
}

/// Probe a single port. Returns the connect latency when the port is
/// open, `None` when it is closed/filtered or the probe was cancelled.
/// Connect failures are retried up to `retry_count` more times with a
/// short delay before the first retry and linear backoff between the
/// rest.
pub async fn probe_port(
    cancel: &CancellationToken,
    ip: IpAddr,
    port: u16,
    connect_timeout: Duration,
    retry_count: u32,
) -> Option<Duration> {
    if cancel.is_cancelled() {
        return None;
    }

    let addr = SocketAddr::new(ip, port);

    if let Some(latency) = connect_once(addr, connect_timeout).await {
        return Some(latency);
    }

    if retry_count == 0 {
        return None;
    }

    sleep(PRE_RETRY_DELAY).await;

    for attempt in 0..retry_count {
        if cancel.is_cancelled() {
            return None;
        }

        if let Some(latency) = connect_once(addr, connect_timeout).await {
            return Some(latency);
        }

        if attempt + 1 < retry_count {
            sleep(Duration::from_millis(
                RETRY_BACKOFF_STEP_MS * (attempt as u64 + 1),
            ))
            .await;
        }
    }

    None
}

/// Scan every port in the task against its IP with bounded concurrency.
/// Closed and filtered ports are silently absent from the output; only
/// cancellation cuts a scan short, and the ports discovered before the
/// cut are still returned.
pub async fn scan_ports(cancel: &CancellationToken, task: &ScanTask) -> Result<BatchOutcome> {
    let started = Instant::now();

    let ip: IpAddr = task
        .ip_address
        .parse()
        .wrap_err_with(|| format!("invalid ip address '{}'", task.ip_address))?;

    let connect_timeout = Duration::from_millis(task.timeout_ms.max(1));
    let concurrency = effective_concurrency(task.concurrency);
    let retry_count = effective_retries(task.retry_count);

    log::debug!(
        "[scanner] scan_ports: ip={} scan_id={} batch={}/{} ports={} concurrency={} timeout_ms={} retries={}",
        task.ip_address,
        task.scan_id,
        task.batch_id,
        task.total_batches,
        task.ports_to_scan.len(),
        concurrency,
        connect_timeout.as_millis(),
        retry_count
    );

    let probes = stream::iter(task.ports_to_scan.iter().copied())
        .map(|port| {
            let cancel = cancel.clone();
            async move {
                probe_port(&cancel, ip, port, connect_timeout, retry_count)
                    .await
                    .map(|latency| Port::open(port, latency))
            }
        })
        .buffer_unordered(concurrency)
        .collect::<Vec<_>>()
        .await;

    let mut open_ports: Vec<Port> = probes.into_iter().flatten().collect();
    open_ports.sort_by_key(|p| p.number);

    let complete = !cancel.is_cancelled();
    let scan_duration = started.elapsed();

    log::debug!(
        "[scanner] scan_complete: ip={} scan_id={} batch={}/{} open={} duration_ms={} complete={}",
        task.ip_address,
        task.scan_id,
        task.batch_id,
        task.total_batches,
        open_ports.len(),
        scan_duration.as_millis(),
        complete
    );

    Ok(BatchOutcome {
        open_ports,
        scan_duration,
        ports_scanned: task.ports_to_scan.len(),
        complete,
    })
}
