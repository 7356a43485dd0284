//! The iterator: drives a query down the delegation tree, one nameserver
//! round trip at a time.

use super::{Context, Layer, Outbound, SockType, State};
use crate::cache;
use crate::nsrep::{self, NS_VALID};
use crate::resolve::{satisfy, satisfy_negative, Request};
use crate::rplan::{QueryFlags, QueryId};
use crate::zonecut::{self, ZoneCut};
use recursor_proto::name;
use recursor_proto::packet::header::{Header, Rcode};
use recursor_proto::packet::question::{Class, Question};
use recursor_proto::packet::record::Record;
use recursor_proto::packet::{Packet, RType};
use recursor_proto::EDNS_PAYLOAD;
use std::rc::Rc;

/// Longest alias chain followed within a single response.
const CNAME_CHAIN_LIMIT: usize = 8;

pub struct Iterate {
    ctx: Rc<Context>,
}

impl Iterate {
    pub fn new(ctx: Rc<Context>) -> Self {
        Self { ctx }
    }

    /// Deepest cached zone cut enclosing the name, the root hints failing
    /// that.
    fn find_cut(&self, sname: &str) -> ZoneCut {
        if let Some(cache) = &self.ctx.cache {
            if let Ok(txn) = cache.begin_read() {
                if let Some(cut) = zonecut::from_cache(&txn, sname, cache::now()) {
                    return cut;
                }
            }
        }
        ZoneCut::root(&self.ctx.roots)
    }

    /// Park the query and plan lookups for its nameserver's addresses.
    fn resolve_ns_addr(&self, req: &mut Request, qid: QueryId, ns: &str) -> State {
        let looping = req.plan.satisfies(qid, ns, Class::Internet, RType::A)
            || req.plan.satisfies(qid, ns, Class::Internet, RType::AAAA)
            || req.plan.get(qid).flags.contains(QueryFlags::AWAIT_ADDR);
        if looping {
            tracing::debug!("dependency loop resolving '{ns}', bailing out");
            return dead_end(req, qid);
        }

        let options = req.options;
        req.plan.get_mut(qid).flags.insert(QueryFlags::AWAIT_ADDR);
        req.plan.push(Some(qid), ns, Class::Internet, RType::AAAA, options);
        req.plan.push(Some(qid), ns, Class::Internet, RType::A, options);
        State::Produce
    }

    /// Follow the answer section from the query name through any CNAME
    /// links. Returns the records of the final type and, when the chain
    /// dangles, the last alias target.
    fn walk_answers(
        &self,
        req: &mut Request,
        qid: QueryId,
        pkt: &Packet,
    ) -> (Vec<Record>, Option<String>) {
        let (mut at, stype, is_client_query) = {
            let query = req.plan.get(qid);
            (query.sname.clone(), query.stype, query.parent().is_none())
        };

        let mut finals = Vec::new();
        let mut hops = 0;
        loop {
            // An in-packet alias cycle must not spin the walk forever.
            hops += 1;
            if hops > CNAME_CHAIN_LIMIT {
                return (Vec::new(), None);
            }
            finals.extend(
                pkt.answers
                    .iter()
                    .filter(|record| {
                        record.rtype() == stype && name::equal(record.owner(), &at)
                    })
                    .cloned(),
            );
            if !finals.is_empty() {
                return (finals, None);
            }

            let alias = pkt.answers.iter().find_map(|record| match record {
                Record::CNAME { owner, host, .. } if name::equal(owner, &at) => {
                    Some((record.clone(), host.clone()))
                }
                _ => None,
            });
            let Some((link, host)) = alias else {
                return (finals, None);
            };
            if is_client_query {
                req.answer.answers.push(link);
            }
            at = name::normalize(&host);

            // A second lap over the same name cannot terminate.
            if pkt
                .answers
                .iter()
                .filter(|record| name::equal(record.owner(), &at))
                .count()
                == 0
            {
                return (Vec::new(), Some(at));
            }
        }
    }
}

/// A query that can go nowhere: fatal for the client's own query, a plain
/// pop for a dependency.
fn dead_end(req: &mut Request, qid: QueryId) -> State {
    if req.plan.get(qid).parent().is_none() {
        State::Fail
    } else {
        State::Done
    }
}

impl Layer for Iterate {
    fn produce(&self, req: &mut Request, out: &mut Outbound) -> State {
        let Some(qid) = req.plan.current() else {
            return State::Noop;
        };
        if req.plan.get(qid).is_resolved() {
            return State::Done;
        }

        // Establish the delegation to work under.
        if req.plan.get(qid).zone_cut.is_empty() {
            let cut = self.find_cut(&req.plan.get(qid).sname);
            if cut.is_empty() {
                tracing::warn!("no root hints configured, cannot iterate");
                return State::Fail;
            }
            req.plan.get_mut(qid).zone_cut = cut;
        }

        // Elect the best nameserver candidate.
        let choice = match nsrep::elect(&req.plan.get(qid).zone_cut, &self.ctx.rtt) {
            Some(choice) if choice.score >= NS_VALID => choice,
            _ => {
                tracing::debug!("no valid nameserver left for '{}'", req.plan.get(qid).sname);
                return dead_end(req, qid);
            }
        };
        if choice.addrs.is_empty() {
            tracing::debug!("nameserver '{}' missing A/AAAA, fetching", choice.name);
            return self.resolve_ns_addr(req, qid, &choice.name);
        }

        let query = req.plan.get_mut(qid);
        query.ns = choice;

        let mut pkt = Packet::new(Header::question(query.id));
        pkt.questions.push(Question {
            name: name::apply_secret(&query.sname, query.secret),
            rtype: query.stype,
            class: query.sclass,
        });
        pkt.set_edns(EDNS_PAYLOAD as u16);

        out.pktbuf = Some(pkt);
        out.sock_type = if query.flags.contains(QueryFlags::TCP) {
            SockType::Stream
        } else {
            SockType::Dgram
        };
        out.addrlist = query.ns.addrs.clone();
        if !query.flags.contains(QueryFlags::NO_THROTTLE) {
            // Under pressure, fan out to a single candidate.
            out.addrlist.truncate(1);
        }
        State::Consume
    }

    fn consume(&self, req: &mut Request, pkt: Option<&Packet>) -> State {
        let Some(qid) = req.plan.current() else {
            return State::Noop;
        };

        let Some(pkt) = pkt else {
            // Timed out or the exchange broke down: forget the elected
            // server and let the next produce pick another.
            let ns = req.plan.get(qid).ns.name.clone();
            let query = req.plan.get_mut(qid);
            if !ns.is_empty() {
                query.zone_cut.del_ns(&ns);
            }
            query.flags.remove(QueryFlags::TCP);
            return State::Produce;
        };

        // The response must match the subquery in flight.
        {
            let query = req.plan.get(qid);
            let matches = pkt.header.id == query.id
                && pkt.question().is_some_and(|question| {
                    name::equal(&question.name, &query.sname)
                        && question.rtype == query.stype
                });
            if !matches {
                tracing::debug!("mismatched response for '{}'", query.sname);
                return State::Produce;
            }
        }

        if pkt.header.truncated && !req.plan.get(qid).flags.contains(QueryFlags::TCP) {
            tracing::debug!("truncated answer, retrying over tcp");
            req.plan.get_mut(qid).flags.insert(QueryFlags::TCP);
            return State::Produce;
        }

        // Terminal answer?
        let (finals, dangling_alias) = self.walk_answers(req, qid, pkt);
        if !finals.is_empty() {
            satisfy(req, qid, finals, Rcode::NoError);
            return State::Done;
        }
        if let Some(target) = dangling_alias {
            let query = req.plan.get_mut(qid);
            query.sname = target;
            query.zone_cut = ZoneCut::default();
            return State::Produce;
        }

        // Negative answer?
        let soa: Vec<Record> = pkt
            .authorities
            .iter()
            .filter(|record| record.rtype() == RType::SOA)
            .cloned()
            .collect();
        if pkt.header.rcode == Rcode::NameError {
            satisfy_negative(req, qid, soa, Rcode::NameError);
            return State::Done;
        }
        if pkt.answers.is_empty() && !soa.is_empty() {
            satisfy_negative(req, qid, soa, Rcode::NoError);
            return State::Done;
        }

        // Referral to a deeper delegation?
        let cut = {
            let query = req.plan.get(qid);
            zonecut::referral_cut(&query.sname, &query.zone_cut.name, pkt)
        };
        if let Some(cut) = cut {
            tracing::debug!("descending to zone cut '{}'", cut.name);
            req.plan.get_mut(qid).zone_cut = cut;
            return State::Produce;
        }

        // Lame response: drop the server and try elsewhere.
        let ns = req.plan.get(qid).ns.name.clone();
        if !ns.is_empty() {
            req.plan.get_mut(qid).zone_cut.del_ns(&ns);
        }
        State::Produce
    }
}
