//! Per-interface link state.
//!
//! Incoming probes are stored as they arrive; ratios, transmission
//! probabilities and ETX values are derived on demand. Every read goes
//! through [`LinkStore::view`], which evicts stale probes first.

use crate::config::ProbeTiming;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::time::Instant;

/// ETX reported for a neighbor without a usable link.
pub const ETX_UNREACHABLE: f64 = -1.0;

/// Probe counts a node reports for one of its neighbors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProbeCounts {
    /// Probes the reporting node received from the neighbor
    pub received: u32,
    /// Probes the neighbor said it received from the reporting node
    pub reported: u32,
}

/// Two-hop table gossiped by a neighbor, keyed by that neighbor's neighbors.
pub type TwoHopTable = BTreeMap<Ipv4Addr, ProbeCounts>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Transmission probability in `(0, 1]`
    Probability,
    /// Expected transmission count, `>= 1`
    Etx,
}

#[derive(Debug)]
pub struct LinkStore {
    self_addr: Ipv4Addr,
    timing: ProbeTiming,
    macs: HashMap<Ipv4Addr, String>,
    // arrival times per neighbor, oldest first
    received: BTreeMap<Ipv4Addr, VecDeque<Instant>>,
    // a key exists here only while `received` has live timestamps for it
    twohop: HashMap<Ipv4Addr, TwoHopTable>,
}

impl LinkStore {
    pub fn new(self_addr: Ipv4Addr, timing: ProbeTiming) -> Self {
        Self {
            self_addr,
            timing,
            macs: HashMap::new(),
            received: BTreeMap::new(),
            twohop: HashMap::new(),
        }
    }

    pub fn self_addr(&self) -> Ipv4Addr {
        self.self_addr
    }

    /// Stores a probe received from `neighbor`.
    ///
    /// The neighbor's two-hop table is replaced, not merged.
    pub fn record_probe(
        &mut self,
        neighbor: Ipv4Addr,
        mac: String,
        table: TwoHopTable,
        timestamp: Instant,
    ) {
        self.macs.insert(neighbor, mac);
        self.twohop.insert(neighbor, table);

        let arrivals = self.received.entry(neighbor).or_default();
        let timestamp = match arrivals.back() {
            Some(last) if *last > timestamp => *last,
            _ => timestamp,
        };
        arrivals.push_back(timestamp);
    }

    /// Drops timestamps older than one window before `now`. Neighbors left
    /// without timestamps lose their two-hop table too; MAC entries stay.
    ///
    /// Returns the number of timestamps removed.
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let window = self.timing.window();
        let mut removed = 0;
        let mut emptied = Vec::new();

        for (neighbor, arrivals) in self.received.iter_mut() {
            while let Some(oldest) = arrivals.front() {
                // an expiry past the end of the clock never comes
                match oldest.checked_add(window) {
                    Some(expiry) if expiry < now => {}
                    _ => break,
                }
                arrivals.pop_front();
                removed += 1;
            }
            if arrivals.is_empty() {
                emptied.push(*neighbor);
            }
        }

        for neighbor in emptied {
            self.received.remove(&neighbor);
            self.twohop.remove(&neighbor);
        }
        removed
    }

    pub fn expected_probe_count(&self) -> u64 {
        self.timing.expected_probe_count()
    }

    pub fn lookup_mac(&self, neighbor: Ipv4Addr) -> Option<&str> {
        self.macs.get(&neighbor).map(String::as_str)
    }

    #[cfg(test)]
    pub fn forget_mac(&mut self, neighbor: Ipv4Addr) {
        self.macs.remove(&neighbor);
    }

    /// Evicts stale probes and returns a read-only view of what is left.
    pub fn view(&mut self, now: Instant) -> LinkView<'_> {
        self.evict_stale(now);
        LinkView { store: self }
    }

    fn ratio(&self, count: usize) -> f64 {
        let expected = self.expected_probe_count();
        if expected == 0 {
            return 0.0;
        }
        // jitter can deliver more probes than expected
        (count as f64 / expected as f64).min(1.0)
    }

    fn received_from(&self, neighbor: Ipv4Addr) -> usize {
        self.received.get(&neighbor).map_or(0, VecDeque::len)
    }

    fn reported_by(&self, neighbor: Ipv4Addr) -> usize {
        self.twohop
            .get(&neighbor)
            .and_then(|table| table.get(&self.self_addr))
            .map_or(0, |counts| counts.received as usize)
    }
}

/// Link metrics over a freshly evicted store.
pub struct LinkView<'a> {
    store: &'a LinkStore,
}

impl LinkView<'_> {
    pub fn self_addr(&self) -> Ipv4Addr {
        self.store.self_addr
    }

    /// Fraction of our probes the neighbor says it received.
    pub fn forward_ratio(&self, neighbor: Ipv4Addr) -> f64 {
        self.store.ratio(self.store.reported_by(neighbor))
    }

    /// Fraction of the neighbor's probes we received.
    pub fn reverse_ratio(&self, neighbor: Ipv4Addr) -> f64 {
        self.store.ratio(self.store.received_from(neighbor))
    }

    /// Probability that a packet reaches the neighbor and its ACK comes back.
    pub fn transmission_probability(&self, neighbor: Ipv4Addr) -> f64 {
        self.forward_ratio(neighbor) * self.reverse_ratio(neighbor)
    }

    pub fn etx(&self, neighbor: Ipv4Addr) -> f64 {
        let p = self.transmission_probability(neighbor);
        if p > 0.0 {
            1.0 / p
        } else {
            ETX_UNREACHABLE
        }
    }

    /// Neighbors with a usable link and their metric.
    pub fn neighbors(&self, metric: Metric) -> BTreeMap<Ipv4Addr, f64> {
        self.store
            .received
            .keys()
            .filter_map(|&neighbor| {
                let value = match metric {
                    Metric::Probability => self.transmission_probability(neighbor),
                    Metric::Etx => self.etx(neighbor),
                };
                (value > 0.0).then_some((neighbor, value))
            })
            .collect()
    }

    /// Counts broadcast in our next probe.
    pub fn probe_snapshot(&self) -> TwoHopTable {
        self.store
            .received
            .iter()
            .map(|(&neighbor, arrivals)| {
                let counts = ProbeCounts {
                    received: arrivals.len() as u32,
                    reported: self.store.reported_by(neighbor) as u32,
                };
                (neighbor, counts)
            })
            .collect()
    }

    /// Transmission probability between `neighbor` and one of its own
    /// neighbors, taken from the table `neighbor` last gossiped.
    pub fn twohop_transmission_probability(&self, neighbor: Ipv4Addr, twohop: Ipv4Addr) -> f64 {
        let Some(counts) = self
            .store
            .twohop
            .get(&neighbor)
            .and_then(|table| table.get(&twohop))
        else {
            return 0.0;
        };
        let forward = self.store.ratio(counts.received as usize);
        let reverse = self.store.ratio(counts.reported as usize);
        forward * reverse
    }

    /// Every `(neighbor, twohop, probability)` the neighbors gossiped,
    /// excluding links back to us.
    pub fn twohop_links(&self) -> Vec<(Ipv4Addr, Ipv4Addr, f64)> {
        self.store
            .twohop
            .iter()
            .flat_map(|(&neighbor, table)| table.keys().map(move |&twohop| (neighbor, twohop)))
            .filter(|&(_, twohop)| twohop != self.store.self_addr)
            .map(|(neighbor, twohop)| {
                (neighbor, twohop, self.twohop_transmission_probability(neighbor, twohop))
            })
            .collect()
    }

    pub fn lookup_mac(&self, neighbor: Ipv4Addr) -> Option<&str> {
        self.store.lookup_mac(neighbor)
    }

    pub fn debug_summary(&self, neighbor: Ipv4Addr) -> String {
        let expected = self.store.expected_probe_count();
        format!(
            "{} - {}: reverse {}/{}, dr={}, forward {}/{}, df={}",
            self.store.self_addr,
            neighbor,
            self.store.received_from(neighbor),
            expected,
            self.reverse_ratio(neighbor),
            self.store.reported_by(neighbor),
            expected,
            self.forward_ratio(neighbor),
        )
    }
}
