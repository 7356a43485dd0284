//! Delegation state: the zone cut a query currently works under and the
//! nameserver set that serves it.

use crate::cache::Txn;
use recursor_proto::name;
use recursor_proto::packet::record::Record;
use recursor_proto::packet::{Packet, RType};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

/// Port glue and cached addresses resolve to; root hints may carry any.
pub const DNS_PORT: u16 = 53;

/// A delegation boundary: origin name plus the nameservers authoritative
/// below it, each with the addresses known so far.
#[derive(Debug, Clone, Default)]
pub struct ZoneCut {
    /// Origin of the cut, lowercase; empty string is the root.
    pub name: String,
    pub nsset: BTreeMap<String, Vec<SocketAddr>>,
}

impl ZoneCut {
    pub fn new(name: &str) -> Self {
        Self {
            name: name::normalize(name),
            nsset: BTreeMap::new(),
        }
    }

    /// Seed the root cut from configured hints.
    pub fn root(hints: &[(String, SocketAddr)]) -> Self {
        let mut cut = Self::new("");
        for (ns, addr) in hints {
            cut.add(ns, Some(*addr));
        }
        cut
    }

    /// No nameserver known; the cut still has to be discovered.
    pub fn is_empty(&self) -> bool {
        self.nsset.is_empty()
    }

    /// Add a nameserver, optionally with one of its addresses.
    pub fn add(&mut self, ns: &str, addr: Option<SocketAddr>) {
        let entry = self.nsset.entry(name::normalize(ns)).or_default();
        if let Some(addr) = addr {
            if !entry.contains(&addr) {
                entry.push(addr);
            }
        }
    }

    /// Drop one address of a nameserver; a server with no addresses left
    /// is dropped entirely so the election cannot cycle on it.
    pub fn del(&mut self, ns: &str, addr: SocketAddr) {
        let ns = name::normalize(ns);
        if let Some(entry) = self.nsset.get_mut(&ns) {
            entry.retain(|&known| known != addr);
            if entry.is_empty() {
                self.nsset.remove(&ns);
            }
        }
    }

    /// Drop a nameserver and everything known about it.
    pub fn del_ns(&mut self, ns: &str) {
        self.nsset.remove(&name::normalize(ns));
    }
}

/// True when `name` lies inside the zone rooted at `origin`.
pub fn name_in_zone(name: &str, origin: &str) -> bool {
    let name = name::normalize(name);
    let origin = name::normalize(origin);
    origin.is_empty() || name == origin || name.ends_with(&format!(".{origin}"))
}

/// Read a referral out of a response: NS records in the authority section
/// delegating a zone at or below the query name, deeper than the cut the
/// query already works under. Glue from the additional section fills in
/// server addresses.
pub fn referral_cut(sname: &str, current_origin: &str, pkt: &Packet) -> Option<ZoneCut> {
    let current = name::normalize(current_origin);
    let mut owner: Option<String> = None;
    for record in &pkt.authorities {
        if let Record::NS { owner: seen, .. } = record {
            let seen = name::normalize(seen);
            // The delegation must contain the query name and descend below
            // the cut already in use, or the same servers get asked again.
            if !name_in_zone(sname, &seen)
                || !name_in_zone(&seen, &current)
                || seen.len() <= current.len()
            {
                continue;
            }
            if owner.as_deref().map_or(true, |known| seen.len() > known.len()) {
                owner = Some(seen);
            }
        }
    }
    let owner = owner?;

    let mut cut = ZoneCut::new(&owner);
    for record in &pkt.authorities {
        if let Record::NS { owner: seen, host, .. } = record {
            if name::normalize(seen) != owner {
                continue;
            }
            cut.add(host, None);
            for glue in &pkt.resources {
                if name::equal(glue.owner(), host) {
                    if let Some(addr) = glue.addr() {
                        cut.add(host, Some(SocketAddr::from((addr, DNS_PORT))));
                    }
                }
            }
        }
    }
    if cut.is_empty() {
        None
    } else {
        Some(cut)
    }
}

/// Find the deepest cached zone cut enclosing `sname`: walk label by label
/// toward the root until a live NS set turns up, then attach whatever glue
/// the cache has for its servers.
pub fn from_cache(txn: &Txn<'_>, sname: &str, now: u32) -> Option<ZoneCut> {
    let mut walk = name::normalize(sname);
    loop {
        if let Ok(peeked) = txn.peek_rrset(&walk, RType::NS.into_num(), now) {
            let mut cut = ZoneCut::new(&walk);
            for record in &peeked.records {
                if let Record::NS { host, .. } = record {
                    cut.add(host, None);
                    for rtype in [RType::A, RType::AAAA] {
                        if let Ok(glue) = txn.peek_rrset(host, rtype.into_num(), now) {
                            for addr in glue.records.iter().filter_map(Record::addr) {
                                cut.add(host, Some(SocketAddr::from((addr, DNS_PORT))));
                            }
                        }
                    }
                }
            }
            if !cut.is_empty() {
                return Some(cut);
            }
        }
        walk = name::parent(&walk)?.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::ZoneCut;
    use crate::cache::{Cache, Rank};
    use recursor_proto::packet::record::Record;
    use similar_asserts::assert_eq;
    use std::net::{Ipv4Addr, SocketAddr};

    #[test]
    fn should_collect_and_invalidate_addresses() {
        let mut cut = ZoneCut::new("Example.COM");
        assert_eq!(cut.name, "example.com");
        assert!(cut.is_empty());

        let addr = SocketAddr::from(([192, 0, 2, 53], 53));
        cut.add("NS1.example.com", None);
        cut.add("ns1.example.com", Some(addr));
        assert_eq!(cut.nsset["ns1.example.com"], vec![addr]);

        cut.del("ns1.example.com", addr);
        assert!(cut.is_empty());
    }

    #[test]
    fn should_seed_root_from_hints() {
        let hints = vec![(
            "a.root-servers.net".to_string(),
            SocketAddr::from(([198, 41, 0, 4], 53)),
        )];
        let cut = ZoneCut::root(&hints);
        assert_eq!(cut.name, "");
        assert_eq!(cut.nsset.len(), 1);
    }

    #[test]
    fn should_find_deepest_cached_cut() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path().join("cache.redb")).unwrap();

        let mut txn = cache.begin_write().unwrap();
        txn.insert_rrset(
            &[Record::NS {
                owner: "com".into(),
                host: "a.gtld-servers.net".into(),
                ttl: 172800,
            }],
            Rank::NonAuth,
            0,
            1000,
        )
        .unwrap();
        txn.insert_rrset(
            &[Record::A {
                owner: "a.gtld-servers.net".into(),
                addr: Ipv4Addr::new(192, 5, 6, 30),
                ttl: 172800,
            }],
            Rank::NonAuth,
            0,
            1000,
        )
        .unwrap();
        txn.commit().unwrap();

        let txn = cache.begin_read().unwrap();
        let cut = super::from_cache(&txn, "www.example.com", 1000).unwrap();
        assert_eq!(cut.name, "com");
        assert_eq!(
            cut.nsset["a.gtld-servers.net"],
            vec![SocketAddr::from((Ipv4Addr::new(192, 5, 6, 30), 53))]
        );

        // Nothing cached above an unrelated tld: no cut to find.
        assert!(super::from_cache(&txn, "example.org", 1000).is_none());
    }
}
