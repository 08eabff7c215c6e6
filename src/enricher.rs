use async_trait::async_trait;
use eyre::Result;
use tokio::sync::Mutex;

use crate::types::EnrichRequest;

/// Seam to the HTTP/TLS enrichment collaborator. The core only fires
/// the trigger; enrichment itself happens downstream, and a failed
/// trigger never fails the scan that produced it.
#[async_trait]
pub trait EnricherTrigger: Send + Sync {
    async fn trigger(&self, request: EnrichRequest) -> Result<()>;
}

/// Local stand-in for the function named by `ENRICHER_FUNCTION`: logs
/// each trigger and keeps it for inspection.
pub struct MemoryEnricher {
    function: String,
    triggered: Mutex<Vec<EnrichRequest>>,
}

impl MemoryEnricher {
    pub fn new(function: &str) -> Self {
        Self {
            function: function.to_string(),
            triggered: Mutex::new(Vec::new()),
        }
    }

    pub async fn triggered(&self) -> Vec<EnrichRequest> {
        self.triggered.lock().await.clone()
    }
}

#[async_trait]
impl EnricherTrigger for MemoryEnricher {
    async fn trigger(&self, request: EnrichRequest) -> Result<()> {
        log::info!(
            "[enricher] trigger: function={} ip={} scan_id={} open_ports={} immediate={}",
            self.function,
            request.ip_address,
            request.scan_id,
            request.open_ports.len(),
            request.immediate_mode
        );
        self.triggered.lock().await.push(request);
        Ok(())
    }
}
