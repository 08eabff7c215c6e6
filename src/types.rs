use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// TTL applied to persisted scan records, in days.
pub const RESULT_TTL_DAYS: i64 = 30;

/// Serialize a `Duration` as integer nanoseconds on the wire.
pub mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Open,
}

/// A single open port as reported by the scanner. Closed and filtered
/// ports are never reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub number: u16,
    pub state: PortState,
    #[serde(with = "duration_nanos")]
    pub latency: Duration,
}

impl Port {
    pub fn open(number: u16, latency: Duration) -> Self {
        Self {
            number,
            state: PortState::Open,
            latency,
        }
    }
}

/// Scan frequency bucket. One scheduler tick fires per cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cadence {
    #[serde(rename = "hourly")]
    Hourly,
    #[serde(rename = "12hour")]
    TwelveHour,
    #[serde(rename = "daily")]
    Daily,
    #[serde(rename = "weekly")]
    Weekly,
    #[serde(rename = "monthly")]
    Monthly,
}

impl Cadence {
    pub const ALL: [Cadence; 5] = [
        Cadence::Hourly,
        Cadence::TwelveHour,
        Cadence::Daily,
        Cadence::Weekly,
        Cadence::Monthly,
    ];

    /// Interval between runs. No drift correction: the next run is
    /// always `now + interval` at dispatch time.
    pub fn interval(&self) -> chrono::Duration {
        match self {
            Cadence::Hourly => chrono::Duration::hours(1),
            Cadence::TwelveHour => chrono::Duration::hours(12),
            Cadence::Daily => chrono::Duration::hours(24),
            Cadence::Weekly => chrono::Duration::days(7),
            Cadence::Monthly => chrono::Duration::days(30),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Hourly => "hourly",
            Cadence::TwelveHour => "12hour",
            Cadence::Daily => "daily",
            Cadence::Weekly => "weekly",
            Cadence::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(Cadence::Hourly),
            "12hour" => Ok(Cadence::TwelveHour),
            "daily" => Ok(Cadence::Daily),
            "weekly" => Ok(Cadence::Weekly),
            "monthly" => Ok(Cadence::Monthly),
            other => Err(eyre::eyre!(
                "invalid cadence '{}': must be one of hourly, 12hour, daily, weekly, monthly",
                other
            )),
        }
    }
}

/// Named port list attached to a schedule or ad-hoc request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortSetName {
    #[serde(rename = "previous_open")]
    PreviousOpen,
    #[serde(rename = "top_100")]
    Top100,
    #[serde(rename = "custom_3500")]
    Custom3500,
    #[serde(rename = "full_65k")]
    Full65k,
}

impl PortSetName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortSetName::PreviousOpen => "previous_open",
            PortSetName::Top100 => "top_100",
            PortSetName::Custom3500 => "custom_3500",
            PortSetName::Full65k => "full_65k",
        }
    }
}

impl fmt::Display for PortSetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PortSetName {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "previous_open" => Ok(PortSetName::PreviousOpen),
            "top_100" => Ok(PortSetName::Top100),
            "custom_3500" => Ok(PortSetName::Custom3500),
            "full_65k" => Ok(PortSetName::Full65k),
            other => Err(eyre::eyre!(
                "invalid port set '{}': must be one of previous_open, top_100, custom_3500, full_65k",
                other
            )),
        }
    }
}

/// One IP × one port batch, published to the task queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanTask {
    pub ip_address: String,
    pub ports_to_scan: Vec<u16>,
    pub batch_id: usize,
    pub total_batches: usize,
    pub scan_id: String,
    pub timeout_ms: u64,
    pub concurrency: i32,
    pub retry_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_type: Option<Cadence>,
}

/// Per-batch scanner output, published to the result queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub ip_address: String,
    pub scan_id: String,
    pub open_ports: Vec<Port>,
    #[serde(rename = "duration", with = "duration_nanos")]
    pub scan_duration: Duration,
    pub batch_id: usize,
    pub total_batches: usize,
    pub ports_scanned: usize,
    pub scan_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_type: Option<Cadence>,
}

/// A registered target IP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpRecord {
    pub ip_address: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scanned_at: Option<DateTime<Utc>>,
}

/// A scan schedule for one IP. `next_run_at` is always set; the
/// scheduler owns all mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub schedule_id: String,
    pub ip_address: String,
    pub cadence: Cadence,
    pub port_set: PortSetName,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
}

/// Persistent per-IP set of ports seen open at least once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPortSet {
    pub ip_address: String,
    pub ports: BTreeSet<u16>,
    pub last_updated_at: DateTime<Utc>,
}

/// Persisted scan record: one row per processed batch, plus exactly one
/// final-summary row per scan in steady state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    pub ip_address: String,
    pub scan_timestamp: DateTime<Utc>,
    pub scan_id: String,
    pub open_ports: Vec<Port>,
    pub scan_duration_ms: u64,
    pub ports_scanned: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_batches: Option<usize>,
    #[serde(default)]
    pub is_final_summary: bool,
    /// Unix epoch seconds after which the record may be pruned.
    pub expiration_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_type: Option<Cadence>,
}

impl ScanRecord {
    pub fn expiration_from(now: DateTime<Utc>) -> i64 {
        (now + chrono::Duration::days(RESULT_TTL_DAYS)).timestamp()
    }
}

/// Scheduler tick event: one cadence bucket fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickEvent {
    pub schedule_type: Cadence,
    #[serde(rename = "maxIPs", default, skip_serializing_if = "Option::is_none")]
    pub max_ips: Option<usize>,
}

/// Ad-hoc scan request: one IP (with a port set or explicit ports) or a
/// list of IPs sharing a port set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdHocScanEvent {
    pub immediate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_set: Option<PortSetName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<String>>,
}

/// Payload handed to the enrichment collaborator after a final summary
/// with open ports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichRequest {
    pub ip_address: String,
    pub scan_id: String,
    pub open_ports: Vec<u16>,
    pub immediate_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
}
