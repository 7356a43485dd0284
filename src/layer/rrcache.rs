//! The cache reader: answers queries from the record cache ahead of the
//! iterator, and writes back what responses bring in.

use super::{Context, Layer, Outbound, State};
use crate::cache::{self, materialize, Rank, TAG_RECORD, TAG_RRSIG};
use crate::resolve::{satisfy, satisfy_negative, Request};
use crate::rplan::QueryFlags;
use crate::zonecut::ZoneCut;
use recursor_proto::name;
use recursor_proto::packet::header::Rcode;
use recursor_proto::packet::record::Record;
use recursor_proto::packet::{Packet, RType};
use recursor_proto::MAX_PKTSIZE;
use std::collections::BTreeMap;
use std::rc::Rc;

const TSIG_TYPE: u16 = 250;

pub struct RrCache {
    ctx: Rc<Context>,
}

impl RrCache {
    pub fn new(ctx: Rc<Context>) -> Self {
        Self { ctx }
    }
}

/// Records of a response worth keeping, grouped into record sets.
fn gather_rrsets(pkt: &Packet) -> BTreeMap<(String, u16), Vec<Record>> {
    let mut sets: BTreeMap<(String, u16), Vec<Record>> = BTreeMap::new();
    for record in pkt.answers.iter().chain(pkt.authorities.iter()) {
        let rtype = record.rtype_num();
        if record.rtype() == RType::OPT || rtype == TSIG_TYPE {
            continue;
        }
        sets.entry((name::normalize(record.owner()), rtype))
            .or_default()
            .push(record.clone());
    }
    sets
}

impl Layer for RrCache {
    fn produce(&self, req: &mut Request, _out: &mut Outbound) -> State {
        let Some(cache) = self.ctx.cache.clone() else {
            return State::Noop;
        };
        let Some(qid) = req.plan.current() else {
            return State::Noop;
        };
        if req.plan.get(qid).is_resolved() {
            return State::Noop;
        }
        let Ok(txn) = cache.begin_read() else {
            return State::Noop;
        };
        let now = cache::now();
        let (sname, stype) = {
            let query = req.plan.get(qid);
            (query.sname.clone(), query.stype)
        };

        // A cached negative packet answers without any planning.
        if let Ok((wire, drift)) = txn.peek_packet(&sname, stype.into_num(), now) {
            if let Ok(pkt) = Packet::parse(&wire) {
                let authorities = pkt
                    .authorities
                    .iter()
                    .map(|record| record.with_ttl(record.ttl().saturating_sub(drift)))
                    .collect();
                req.plan.get_mut(qid).flags.insert(QueryFlags::CACHED);
                satisfy_negative(req, qid, authorities, pkt.header.rcode);
                return State::Done;
            }
        }

        // A live record set satisfies the query directly.
        if let Ok(peeked) = txn.peek_rrset(&sname, stype.into_num(), now) {
            let records = materialize(&peeked.records, peeked.drift);
            if !records.is_empty() {
                req.plan.get_mut(qid).flags.insert(QueryFlags::CACHED);
                satisfy(req, qid, records, Rcode::NoError);
                return State::Done;
            }
        }

        // Or a cached alias redirects it.
        if stype != RType::CNAME {
            if let Ok(peeked) = txn.peek_rrset(&sname, RType::CNAME.into_num(), now) {
                let records = materialize(&peeked.records, peeked.drift);
                if let Some(Record::CNAME { host, .. }) = records.first() {
                    let target = name::normalize(host);
                    if req.plan.get(qid).parent().is_none() {
                        req.answer.answers.extend(records.clone());
                    }
                    let query = req.plan.get_mut(qid);
                    query.flags.insert(QueryFlags::CACHED);
                    query.sname = target;
                    query.zone_cut = ZoneCut::default();
                    return State::Produce;
                }
            }
        }

        State::Noop
    }

    fn consume(&self, req: &mut Request, pkt: Option<&Packet>) -> State {
        let Some(cache) = self.ctx.cache.clone() else {
            return State::Noop;
        };
        let Some(pkt) = pkt else {
            return State::Noop;
        };
        let Some(qid) = req.plan.current() else {
            return State::Noop;
        };
        if req.plan.get(qid).flags.contains(QueryFlags::CACHED) {
            // Synthesized from this very cache; nothing new to learn.
            return State::Noop;
        }

        let now = cache::now();
        let rank = if pkt.header.authoritative {
            Rank::Auth
        } else {
            Rank::NonAuth
        };
        let Ok(mut txn) = cache.begin_write() else {
            return State::Noop;
        };

        for ((owner, rtype), records) in gather_rrsets(pkt) {
            // Existing data of a higher rank dominates; leave it alone.
            let (tag, keyed_type) = if rtype == RType::RRSIG.into_num() {
                let covered = match records.first() {
                    Some(Record::Unknown { rdata, .. }) if rdata.len() >= 2 => {
                        u16::from_be_bytes([rdata[0], rdata[1]])
                    }
                    _ => continue,
                };
                (TAG_RRSIG, covered)
            } else {
                (TAG_RECORD, rtype)
            };
            if let Ok(existing) = txn.peek_rank(tag, &owner, keyed_type, now) {
                if existing > rank {
                    continue;
                }
            }
            let stored = if tag == TAG_RRSIG {
                txn.insert_rrsig(&records, rank, now)
            } else {
                txn.insert_rrset(&records, rank, 0, now)
            };
            if let Err(error) = stored {
                tracing::debug!("couldn't cache {owner}/{rtype}: {error:?}");
            }
        }

        // Negative answers are cached as whole packets, bounded by the
        // SOA minimum.
        let (sname, stype) = {
            let query = req.plan.get(qid);
            (query.sname.clone(), query.stype)
        };
        let negative = pkt.header.rcode == Rcode::NameError
            || (pkt.header.rcode == Rcode::NoError && pkt.answers.is_empty());
        if negative {
            let soa_ttl = pkt.authorities.iter().find_map(|record| match record {
                Record::SOA { minimum, ttl, .. } => Some((*minimum).min(*ttl)),
                _ => None,
            });
            if let Some(soa_ttl) = soa_ttl {
                let ttl = soa_ttl.min(self.ctx.negative_ttl);
                let wire = pkt
                    .clone()
                    .create_buffer(MAX_PKTSIZE)
                    .map(|buffer| buffer.buf);
                if let Ok(wire) = wire {
                    if let Err(error) =
                        txn.insert_packet(&sname, stype.into_num(), &wire, ttl, rank, now)
                    {
                        tracing::debug!("couldn't cache negative answer: {error:?}");
                    }
                }
            }
        }

        if let Err(error) = txn.commit() {
            tracing::debug!("cache write lost: {error:?}");
        }
        State::Noop
    }
}

#[cfg(test)]
mod tests {
    use super::RrCache;
    use crate::cache::{Cache, Rank};
    use crate::layer::{Context, Layer, Outbound, State};
    use crate::nsrep::RttCache;
    use crate::resolve::Request;
    use crate::rplan::QueryFlags;
    use recursor_proto::packet::header::{Header, Rcode};
    use recursor_proto::packet::question::{Class, Question};
    use recursor_proto::packet::record::Record;
    use recursor_proto::packet::{Packet, RType};
    use similar_asserts::assert_eq;
    use std::net::Ipv4Addr;
    use std::rc::Rc;

    fn context(dir: &tempfile::TempDir) -> Rc<Context> {
        Rc::new(Context {
            cache: Some(Rc::new(
                Cache::open(dir.path().join("cache.redb")).unwrap(),
            )),
            rtt: RttCache::default(),
            roots: Vec::new(),
            negative_ttl: 900,
        })
    }

    fn request_with_query(sname: &str, stype: RType) -> (Request, usize) {
        let query = Packet::new(Header::question(7))
            .with_question(Question::new(sname.to_string(), stype));
        let mut req = Request::new(&query, QueryFlags::empty(), None, 512);
        let qid = req
            .plan
            .push(None, sname, Class::Internet, stype, QueryFlags::empty());
        (req, qid)
    }

    fn a_record(ttl: u32) -> Record {
        Record::A {
            owner: "example.com".into(),
            addr: Ipv4Addr::new(192, 0, 2, 1),
            ttl,
        }
    }

    #[test]
    fn should_answer_from_cache_without_planning() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let cache = ctx.cache.clone().unwrap();
        let layer = RrCache::new(ctx);

        let mut txn = cache.begin_write().unwrap();
        txn.insert_rrset(&[a_record(300)], Rank::Auth, 0, crate::cache::now())
            .unwrap();
        txn.commit().unwrap();

        let (mut req, qid) = request_with_query("example.com", RType::A);
        let state = layer.produce(&mut req, &mut Outbound::default());

        assert_eq!(state, State::Done);
        assert!(req.plan.get(qid).flags.contains(QueryFlags::CACHED));
        assert_eq!(req.answer.answers.len(), 1);
        assert_eq!(cache.stats().hit, 1);
    }

    #[test]
    fn should_stay_quiet_on_cache_miss() {
        let dir = tempfile::tempdir().unwrap();
        let layer = RrCache::new(context(&dir));

        let (mut req, _) = request_with_query("example.com", RType::A);
        assert_eq!(
            layer.produce(&mut req, &mut Outbound::default()),
            State::Noop
        );
        assert!(req.answer.answers.is_empty());
    }

    #[test]
    fn should_store_response_rrsets() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let cache = ctx.cache.clone().unwrap();
        let layer = RrCache::new(ctx);

        let (mut req, qid) = request_with_query("example.com", RType::A);
        let mut response = Packet::new(Header::response(req.plan.get(qid).id))
            .with_question(Question::new("example.com".into(), RType::A))
            .with_answer(a_record(300));
        response.header.authoritative = true;

        assert_eq!(layer.consume(&mut req, Some(&response)), State::Noop);

        let txn = cache.begin_read().unwrap();
        let peeked = txn
            .peek_rrset("example.com", 1, crate::cache::now())
            .unwrap();
        assert_eq!(peeked.rank, Rank::Auth);
        assert_eq!(peeked.records.len(), 1);
    }

    #[test]
    fn should_not_downgrade_higher_ranked_entries() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let cache = ctx.cache.clone().unwrap();
        let layer = RrCache::new(ctx);

        let mut txn = cache.begin_write().unwrap();
        txn.insert_rrset(&[a_record(300)], Rank::Auth, 0, crate::cache::now())
            .unwrap();
        txn.commit().unwrap();

        // A non-authoritative copy must not replace the authoritative one.
        let (mut req, qid) = request_with_query("example.com", RType::A);
        let response = Packet::new(Header::response(req.plan.get(qid).id))
            .with_question(Question::new("example.com".into(), RType::A))
            .with_answer(a_record(7));
        layer.consume(&mut req, Some(&response));

        let txn = cache.begin_read().unwrap();
        let peeked = txn
            .peek_rrset("example.com", 1, crate::cache::now())
            .unwrap();
        assert_eq!(peeked.rank, Rank::Auth);
        assert_eq!(peeked.records[0].ttl(), 300);
    }

    #[test]
    fn should_cache_and_replay_negative_answers() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let layer = RrCache::new(ctx);

        let (mut req, qid) = request_with_query("missing.example.com", RType::A);
        let mut negative = Packet::new(Header::response(req.plan.get(qid).id))
            .with_question(Question::new("missing.example.com".into(), RType::A))
            .with_authority(Record::SOA {
                owner: "example.com".into(),
                mname: "ns1.example.com".into(),
                rname: "hostmaster.example.com".into(),
                serial: 1,
                refresh: 7200,
                retry: 3600,
                expire: 1209600,
                minimum: 600,
                ttl: 3600,
            });
        negative.header.rcode = Rcode::NameError;
        layer.consume(&mut req, Some(&negative));

        // A second client asking the same thing is served from the cache.
        let (mut req, qid) = request_with_query("missing.example.com", RType::A);
        let state = layer.produce(&mut req, &mut Outbound::default());
        assert_eq!(state, State::Done);
        assert!(req.plan.get(qid).flags.contains(QueryFlags::CACHED));
        assert_eq!(req.answer.header.rcode, Rcode::NameError);
        assert_eq!(req.answer.authorities.len(), 1);
    }

    #[test]
    fn should_follow_cached_alias() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let cache = ctx.cache.clone().unwrap();
        let layer = RrCache::new(ctx);

        let mut txn = cache.begin_write().unwrap();
        txn.insert_rrset(
            &[Record::CNAME {
                owner: "www.example.com".into(),
                host: "example.com".into(),
                ttl: 300,
            }],
            Rank::Auth,
            0,
            crate::cache::now(),
        )
        .unwrap();
        txn.commit().unwrap();

        let (mut req, qid) = request_with_query("www.example.com", RType::A);
        let state = layer.produce(&mut req, &mut Outbound::default());

        assert_eq!(state, State::Produce);
        assert_eq!(req.plan.get(qid).sname, "example.com");
        assert_eq!(req.answer.answers.len(), 1);
    }
}
