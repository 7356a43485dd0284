//! Nameserver reputation and election.
//!
//! Scores come from a small RTT cache keyed by socket address. A timeout
//! is recorded as the sentinel maximum RTT, which takes the address out of
//! the running until its entry ages out.

use crate::rplan::NsChoice;
use crate::zonecut::ZoneCut;
use std::net::SocketAddr;
use std::time::Duration;

/// Candidate addresses carried per elected nameserver.
pub const NS_MAXADDR: usize = 4;

/// Baseline score; anything below is not worth contacting.
pub const NS_VALID: i32 = 0;
pub const NS_INVALID: i32 = -1;

/// Sentinel RTT recorded against timed-out addresses.
pub const NS_TIMEOUT: u32 = 3_000;

/// Optimistic RTT assumed for an address never measured, so new servers
/// get probed ahead of mediocre known ones.
const NS_UNKNOWN_RTT: u32 = 50;

const RTT_CACHE_CAPACITY: u64 = 16 * 1024;
const RTT_CACHE_TTL: Duration = Duration::from_secs(600);

pub struct RttCache {
    inner: moka::sync::Cache<SocketAddr, u32>,
}

impl Default for RttCache {
    fn default() -> Self {
        Self::new(RTT_CACHE_CAPACITY)
    }
}

impl RttCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: moka::sync::Cache::builder()
                .max_capacity(capacity)
                .time_to_live(RTT_CACHE_TTL)
                .build(),
        }
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<u32> {
        self.inner.get(addr)
    }

    /// Record a measured round trip, smoothed against history.
    pub fn update(&self, addr: SocketAddr, rtt_ms: u32) {
        let smoothed = match self.inner.get(&addr) {
            Some(known) => (known + rtt_ms) / 2,
            None => rtt_ms,
        };
        self.inner.insert(addr, smoothed);
    }

    /// Flag an address as timed out; no smoothing, the penalty is the point.
    pub fn timeout(&self, addr: SocketAddr) {
        self.inner.insert(addr, NS_TIMEOUT);
    }
}

fn score_addr(rtt: &RttCache, addr: &SocketAddr) -> i32 {
    match rtt.get(addr) {
        Some(measured) if measured >= NS_TIMEOUT => NS_INVALID,
        Some(measured) => NS_VALID + (NS_TIMEOUT - measured) as i32,
        None => NS_VALID + (NS_TIMEOUT - NS_UNKNOWN_RTT) as i32,
    }
}

/// Elect the best nameserver from a zone cut. Servers with usable
/// addresses win by lowest expected RTT; a server whose addresses are all
/// unknown still scores the baseline so its lookup gets planned. `None`
/// when the nsset is empty.
pub fn elect(cut: &ZoneCut, rtt: &RttCache) -> Option<NsChoice> {
    let mut best: Option<NsChoice> = None;
    for (ns, addrs) in &cut.nsset {
        let mut scored: Vec<(i32, SocketAddr)> = addrs
            .iter()
            .map(|&addr| (score_addr(rtt, &addr), addr))
            .filter(|(score, _)| *score > NS_INVALID)
            .collect();
        scored.sort_by_key(|(score, _)| std::cmp::Reverse(*score));

        let choice = if scored.is_empty() {
            NsChoice {
                name: ns.clone(),
                addrs: Vec::new(),
                // Address still unknown or all candidates penalized.
                score: if addrs.is_empty() { NS_VALID } else { NS_INVALID },
            }
        } else {
            NsChoice {
                name: ns.clone(),
                score: scored[0].0,
                addrs: scored
                    .into_iter()
                    .take(NS_MAXADDR)
                    .map(|(_, addr)| addr)
                    .collect(),
            }
        };

        match &best {
            Some(known) if known.score >= choice.score => {}
            _ => best = Some(choice),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::{elect, RttCache, NS_INVALID, NS_TIMEOUT, NS_VALID};
    use crate::zonecut::ZoneCut;
    use std::net::SocketAddr;

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([192, 0, 2, last], 53))
    }

    #[test]
    fn should_prefer_measured_fast_server() {
        let rtt = RttCache::new(16);
        rtt.update(addr(1), 10);
        rtt.update(addr(2), 400);

        let mut cut = ZoneCut::new("example.com");
        cut.add("slow.example.com", Some(addr(2)));
        cut.add("fast.example.com", Some(addr(1)));

        let choice = elect(&cut, &rtt).unwrap();
        assert_eq!(choice.name, "fast.example.com");
        assert!(choice.score > NS_VALID);
    }

    #[test]
    fn should_invalidate_timed_out_addresses() {
        let rtt = RttCache::new(16);
        rtt.timeout(addr(1));

        let mut cut = ZoneCut::new("example.com");
        cut.add("ns.example.com", Some(addr(1)));

        let choice = elect(&cut, &rtt).unwrap();
        assert_eq!(choice.score, NS_INVALID);
        assert!(choice.addrs.is_empty());
    }

    #[test]
    fn should_keep_addressless_server_electable() {
        let rtt = RttCache::new(16);
        let mut cut = ZoneCut::new("example.com");
        cut.add("lame.example.com", None);

        let choice = elect(&cut, &rtt).unwrap();
        assert_eq!(choice.score, NS_VALID);
        assert!(choice.addrs.is_empty());
    }

    #[test]
    fn should_elect_nothing_from_empty_cut() {
        let rtt = RttCache::new(16);
        assert!(elect(&ZoneCut::new("example.com"), &rtt).is_none());
    }

    #[test]
    fn should_smooth_measurements_but_not_penalties() {
        let rtt = RttCache::new(16);
        let target = addr(1);
        rtt.update(target, 100);
        rtt.update(target, 300);
        assert_eq!(rtt.get(&target), Some(200));

        rtt.timeout(target);
        assert_eq!(rtt.get(&target), Some(NS_TIMEOUT));
    }
}
