use std::collections::BTreeSet;

use crate::types::PortSetName;

/// Common ports scanned when `previous_open` resolves to an empty set.
pub const FALLBACK_PORTS: [u16; 4] = [22, 80, 443, 3389];

/// Number of ports in the mid-size curated set.
const CUSTOM_SET_SIZE: usize = 3500;

// 100 most commonly exposed TCP ports, sorted ascending.
const TOP_100_PORTS: [u16; 100] = [
    20, 21, 22, 23, 25, 53, 69, 79, 80, 88,
    102, 110, 111, 113, 119, 123, 135, 137, 138, 139,
    143, 389, 427, 443, 445, 464, 465, 513, 514, 515,
    543, 544, 548, 554, 587, 631, 636, 646, 873, 990,
    993, 995, 1025, 1026, 1027, 1028, 1029, 1110, 1433, 1720,
    1723, 1755, 1900, 2000, 2001, 2049, 2121, 2717, 3000, 3128,
    3306, 3389, 3986, 4899, 5000, 5009, 5051, 5060, 5101, 5190,
    5357, 5432, 5631, 5666, 5800, 5900, 6000, 6001, 6646, 7070,
    8000, 8008, 8009, 8080, 8081, 8086, 8087, 8222, 8443, 8888,
    9100, 9999, 10000, 32768, 49152, 49153, 49154, 49155, 49156, 49157,
];

// High ports worth probing beyond the well-known range: databases,
// caches, message brokers, remote access, and common alt-HTTP ports.
const HIGH_SERVICE_PORTS: [u16; 60] = [
    1080, 1433, 1434, 1521, 1723, 1883, 2049, 2082, 2083, 2181,
    2375, 2376, 3128, 3306, 3389, 4369, 4444, 4899, 5000, 5060,
    5432, 5601, 5672, 5900, 5938, 5984, 6379, 6443, 6667, 7001,
    7077, 7199, 8000, 8080, 8081, 8086, 8088, 8161, 8443, 8888,
    9000, 9042, 9090, 9092, 9100, 9200, 9300, 9418, 9999, 10000,
    11211, 15672, 27017, 27018, 28017, 32768, 49152, 50000, 50070, 61616,
];

/// The 100 most common ports.
pub fn top_100() -> Vec<u16> {
    TOP_100_PORTS.to_vec()
}

/// Mid-size curated set: the full well-known range (1-1024), the
/// high-value service ports, then ascending fill to exactly 3,500
/// unique ports.
pub fn custom_3500() -> Vec<u16> {
    let mut set: BTreeSet<u16> = (1..=1024).collect();
    set.extend(HIGH_SERVICE_PORTS);

    let mut fill: u16 = 1025;
    while set.len() < CUSTOM_SET_SIZE {
        set.insert(fill);
        fill += 1;
    }

    set.into_iter().collect()
}

/// Every TCP port.
pub fn full_65k() -> Vec<u16> {
    (1..=65535).collect()
}

/// Resolve a static port set to its port list. `previous_open` is
/// dynamic (it depends on the store) and is resolved by the scheduler;
/// here it maps to the fallback set.
pub fn ports_for(set: PortSetName) -> Vec<u16> {
    match set {
        PortSetName::PreviousOpen => FALLBACK_PORTS.to_vec(),
        PortSetName::Top100 => top_100(),
        PortSetName::Custom3500 => custom_3500(),
        PortSetName::Full65k => full_65k(),
    }
}
