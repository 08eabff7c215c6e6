use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use eyre::{Result, WrapErr};
use tokio_util::sync::CancellationToken;

use sweep::cli::{self, Command};
use sweep::config::AppConfig;
use sweep::enricher::{EnricherTrigger, MemoryEnricher};
use sweep::queue::{MemoryQueue, MessageQueue};
use sweep::store::{consolidated_results, MemoryStore, Store};
use sweep::types::{AdHocScanEvent, Cadence, PortSetName, TickEvent};
use sweep::{logging, processor, scheduler, worker};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::parse();

    if cli.verbose {
        env_logger::init();
    } else if let Err(error) = logging::init_logging() {
        eprintln!("warning: file logging disabled: {}", error);
    }

    let config = AppConfig::load();
    let state_path = cli.state.clone().or_else(|| config.state_file.clone());
    let store = Arc::new(match state_path.as_deref() {
        Some(path) => MemoryStore::load(path)?,
        None => MemoryStore::new(),
    });

    match cli.command {
        Command::Run { workers } => {
            let workers = workers.unwrap_or(config.workers);
            run_pipeline(&config, store.clone(), workers).await?;
        }

        Command::Tick { cadence, max_ips } => {
            let cadence: Cadence = cadence.parse()?;
            let tasks = MemoryQueue::new(&config.tasks_queue_url);
            let event = TickEvent {
                schedule_type: cadence,
                max_ips,
            };
            let summary = scheduler::run_tick(store.as_ref(), &tasks, &event).await?;
            println!(
                "cadence={} due={} dispatched={} tasks_enqueued={}",
                summary.cadence, summary.due, summary.dispatched, summary.tasks_enqueued
            );
        }

        Command::Scan {
            ip,
            port_set,
            ports,
        } => {
            scan_once(&config, store.clone(), ip, &port_set, ports.as_deref()).await?;
        }

        Command::Results { ip, limit } => {
            let results = consolidated_results(store.as_ref(), &ip, limit).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }

        Command::AddIp { ip } => {
            validate_ip(&ip)?;
            let record = store.add_ip(&ip).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }

        Command::DelIp { ip } => {
            store.delete_ip(&ip).await?;
            println!("deleted {}", ip);
        }

        Command::AddSchedule {
            ip,
            cadence,
            port_set,
            disabled,
        } => {
            validate_ip(&ip)?;
            let cadence: Cadence = cadence.parse()?;
            let port_set: PortSetName = port_set.parse()?;
            store.add_ip(&ip).await?;
            let schedule = store
                .create_schedule(&ip, cadence, port_set, !disabled)
                .await?;
            println!("{}", serde_json::to_string_pretty(&schedule)?);
        }

        Command::Schedules { ip } => {
            let schedules = store.schedules_for_ip(&ip).await?;
            println!("{}", serde_json::to_string_pretty(&schedules)?);
        }
    }

    if let Some(path) = state_path.as_deref() {
        save_state(store.as_ref(), path);
    }

    Ok(())
}

fn validate_ip(ip: &str) -> Result<()> {
    ip.parse::<std::net::IpAddr>()
        .map(|_| ())
        .wrap_err_with(|| format!("invalid ip address '{}'", ip))
}

fn parse_port_list(raw: &str) -> Result<Vec<u16>> {
    raw.split(',')
        .map(|part| {
            part.trim()
                .parse::<u16>()
                .wrap_err_with(|| format!("invalid port '{}'", part.trim()))
        })
        .collect()
}

fn save_state(store: &MemoryStore, path: &Path) {
    if let Err(error) = store.save(path) {
        log::error!("[main] state_save_failed: path={} error={}", path.display(), error);
        eprintln!("warning: failed to save state: {}", error);
    }
}

/// Long-running mode: one ticker per cadence feeding the task queue,
/// a pool of scan workers, and the result processor.
async fn run_pipeline(config: &AppConfig, store: Arc<MemoryStore>, workers: usize) -> Result<()> {
    let tasks = Arc::new(MemoryQueue::new(&config.tasks_queue_url));
    let results = Arc::new(MemoryQueue::new(&config.results_queue_url));
    let enricher = Arc::new(MemoryEnricher::new(&config.enricher_function));
    let cancel = CancellationToken::new();

    let mut handles = Vec::new();

    for _ in 0..workers.max(1) {
        handles.push(tokio::spawn(worker::run_worker(
            cancel.clone(),
            tasks.clone() as Arc<dyn MessageQueue>,
            results.clone() as Arc<dyn MessageQueue>,
        )));
    }

    handles.push(tokio::spawn(processor::run_processor(
        cancel.clone(),
        store.clone() as Arc<dyn Store>,
        results.clone() as Arc<dyn MessageQueue>,
        enricher.clone() as Arc<dyn EnricherTrigger>,
    )));

    for cadence in Cadence::ALL {
        let store = store.clone();
        let tasks = tasks.clone();
        let cancel = cancel.clone();
        let max_ips = config.max_ips_per_tick;

        handles.push(tokio::spawn(async move {
            let period = cadence
                .interval()
                .to_std()
                .unwrap_or(Duration::from_secs(3600));
            let mut ticker = tokio::time::interval(period);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let event = TickEvent {
                            schedule_type: cadence,
                            max_ips: Some(max_ips),
                        };
                        if let Err(error) =
                            scheduler::run_tick(store.as_ref(), tasks.as_ref(), &event).await
                        {
                            log::error!(
                                "[main] tick_failed: cadence={} error={}",
                                cadence,
                                error
                            );
                        }
                    }
                }
            }
        }));
    }

    println!("sweep pipeline running ({} workers); press Ctrl-C to stop", workers.max(1));
    tokio::signal::ctrl_c().await?;
    log::info!("[main] shutdown_requested");
    cancel.cancel();

    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

/// One-shot ad-hoc scan: dispatch, drive a worker and the processor
/// until the queues drain, then print the consolidated result.
async fn scan_once(
    config: &AppConfig,
    store: Arc<MemoryStore>,
    ip: String,
    port_set: &str,
    ports: Option<&str>,
) -> Result<()> {
    validate_ip(&ip)?;

    let tasks = Arc::new(MemoryQueue::new(&config.tasks_queue_url));
    let results = Arc::new(MemoryQueue::new(&config.results_queue_url));
    let enricher = Arc::new(MemoryEnricher::new(&config.enricher_function));
    let cancel = CancellationToken::new();

    store.add_ip(&ip).await?;

    let explicit = ports.map(parse_port_list).transpose()?;
    let event = AdHocScanEvent {
        immediate: true,
        ip: Some(ip.clone()),
        ports: explicit,
        port_set: Some(port_set.parse()?),
        ips: None,
    };

    let outcomes = scheduler::run_adhoc(store.as_ref(), tasks.as_ref(), &event).await?;
    for outcome in &outcomes {
        println!(
            "dispatched scan_id={} ports={} batches={}",
            outcome.scan_id, outcome.ports, outcome.total_batches
        );
    }

    let worker_handle = tokio::spawn(worker::run_worker(
        cancel.clone(),
        tasks.clone() as Arc<dyn MessageQueue>,
        results.clone() as Arc<dyn MessageQueue>,
    ));
    let processor_handle = tokio::spawn(processor::run_processor(
        cancel.clone(),
        store.clone() as Arc<dyn Store>,
        results.clone() as Arc<dyn MessageQueue>,
        enricher.clone() as Arc<dyn EnricherTrigger>,
    ));

    // Tasks were enqueued before the loops started, so empty queues
    // with nothing in flight means the scan is fully processed.
    loop {
        if tasks.depth().await == 0
            && tasks.in_flight_count().await == 0
            && results.depth().await == 0
            && results.in_flight_count().await == 0
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    cancel.cancel();
    let _ = worker_handle.await;
    let _ = processor_handle.await;

    let consolidated = consolidated_results(store.as_ref(), &ip, 1).await?;
    println!("{}", serde_json::to_string_pretty(&consolidated)?);
    Ok(())
}
