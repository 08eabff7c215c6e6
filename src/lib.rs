pub mod cli;
pub mod config;
pub mod enricher;
pub mod logging;
pub mod portset;
pub mod processor;
pub mod queue;
pub mod scanner;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod worker;

// Re-export key types and functions at the crate root
pub use config::AppConfig;
pub use enricher::{EnricherTrigger, MemoryEnricher};
pub use queue::{MemoryQueue, MessageQueue};
pub use scanner::{scan_ports, BatchOutcome};
pub use store::{consolidated_results, MemoryStore, Store};
pub use types::{BatchResult, Cadence, Port, PortSetName, ScanTask, Schedule};
