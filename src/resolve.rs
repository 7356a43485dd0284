//! One resolver request: the client query bound to its resolution plan,
//! the answer under construction, and the pipeline driving both.

use crate::layer::{Outbound, Pipeline, State};
use crate::rplan::{Plan, QueryFlags, QueryId};
use recursor_proto::packet::header::Rcode;
use recursor_proto::packet::question::Class;
use recursor_proto::packet::record::Record;
use recursor_proto::packet::{Packet, RType};
use std::net::SocketAddr;

const TSIG_TYPE: u16 = 250;

pub struct Request {
    /// Answer packet being assembled for the client.
    pub answer: Packet,
    pub plan: Plan,
    /// Options inherited by every planned query.
    pub options: QueryFlags,
    /// Client source address; internal self-queries have none.
    pub qsource: Option<SocketAddr>,
    /// TSIG record carried on the client query, echoed on the answer.
    pub tsig: Option<Record>,
    /// Negotiated ceiling for the encoded answer.
    pub answer_max: usize,
}

impl Request {
    pub fn new(
        query: &Packet,
        options: QueryFlags,
        qsource: Option<SocketAddr>,
        answer_max: usize,
    ) -> Self {
        let mut answer = Packet::response_to(query);
        if let Some(question) = query.question() {
            answer.questions.push(question.clone());
        }
        let tsig = query
            .resources
            .iter()
            .find(|record| record.rtype_num() == TSIG_TYPE)
            .cloned();
        Self {
            answer,
            plan: Plan::new(),
            options,
            qsource,
            tsig,
            answer_max,
        }
    }
}

/// Push the root query and run the begin hooks.
pub fn begin(
    pipeline: &Pipeline,
    req: &mut Request,
    qname: &str,
    qclass: Class,
    qtype: RType,
) -> State {
    req.plan.push(None, qname, qclass, qtype, req.options);
    pipeline.begin_fold(req)
}

/// Feed a received packet (or a timeout, as `None`) through the layers.
pub fn consume(pipeline: &Pipeline, req: &mut Request, pkt: Option<&Packet>) -> State {
    let state = pipeline.consume_fold(req, pkt);
    map_progress(req, state)
}

/// One planning pass: either an outbound subquery lands in `out`
/// (`Consume`), the plan advanced (`Produce`), or the request is over.
pub fn produce(pipeline: &Pipeline, req: &mut Request, out: &mut Outbound) -> State {
    if req.plan.current().is_none() {
        return State::Done;
    }
    match pipeline.produce_fold(req, out) {
        State::Consume => State::Consume,
        State::Produce => State::Produce,
        State::Fail => State::Fail,
        State::Done => map_progress(req, State::Done),
        // No layer can make progress; planning is stuck.
        State::Noop => State::Fail,
    }
}

/// Run the finish hooks and compose the final answer.
pub fn finish(pipeline: &Pipeline, req: &mut Request, state: State) -> State {
    pipeline.finish_fold(req, state);

    let header = &mut req.answer.header;
    header.response = true;
    header.authoritative = false;
    header.recursion_available = true;
    if state == State::Fail && header.rcode == Rcode::NoError {
        header.rcode = Rcode::ServerFailure;
    }
    if let Some(tsig) = req.tsig.clone() {
        req.answer.resources.push(tsig);
    }
    state
}

fn map_progress(req: &mut Request, state: State) -> State {
    match state {
        State::Done => {
            if let Some(qid) = req.plan.current() {
                req.plan.pop(qid);
            }
            if req.plan.is_empty() {
                State::Done
            } else {
                State::Produce
            }
        }
        State::Fail => State::Fail,
        _ => State::Produce,
    }
}

/// Complete a query with the records that answer it. For the client's own
/// query the records join the answer section; for an address subquery they
/// feed the parent's zone cut and unpark it.
pub(crate) fn satisfy(req: &mut Request, qid: QueryId, records: Vec<Record>, rcode: Rcode) {
    let (parent, sname, stype) = {
        let query = req.plan.get(qid);
        (query.parent(), query.sname.clone(), query.stype)
    };
    match parent {
        None => {
            if req.answer.header.rcode == Rcode::NoError {
                req.answer.header.rcode = rcode;
            }
            req.answer.answers.extend(records);
        }
        Some(parent) if matches!(stype, RType::A | RType::AAAA) => {
            let mut fed = false;
            for addr in records.iter().filter_map(Record::addr) {
                let addr = SocketAddr::from((addr, crate::zonecut::DNS_PORT));
                req.plan.get_mut(parent).zone_cut.add(&sname, Some(addr));
                fed = true;
            }
            if fed {
                req.plan
                    .get_mut(parent)
                    .flags
                    .remove(QueryFlags::AWAIT_ADDR);
            }
        }
        Some(_) => {}
    }
    req.plan.get_mut(qid).flags.insert(QueryFlags::RESOLVED);
}

/// Complete a query negatively: the authority records (typically the SOA)
/// explain the denial on the client answer.
pub(crate) fn satisfy_negative(
    req: &mut Request,
    qid: QueryId,
    authorities: Vec<Record>,
    rcode: Rcode,
) {
    if req.plan.get(qid).parent().is_none() {
        if req.answer.header.rcode == Rcode::NoError {
            req.answer.header.rcode = rcode;
        }
        req.answer.authorities.extend(authorities);
    }
    req.plan.get_mut(qid).flags.insert(QueryFlags::RESOLVED);
}

#[cfg(test)]
mod tests {
    use super::{satisfy, Request};
    use crate::rplan::QueryFlags;
    use recursor_proto::packet::header::{Header, Rcode};
    use recursor_proto::packet::question::{Class, Question};
    use recursor_proto::packet::record::Record;
    use recursor_proto::packet::{Packet, RType};
    use similar_asserts::assert_eq;
    use std::net::Ipv4Addr;

    fn request() -> Request {
        let query = Packet::new(Header::question(7))
            .with_question(Question::new("example.com".into(), RType::A));
        Request::new(&query, QueryFlags::empty(), None, 512)
    }

    #[test]
    fn should_copy_answer_records_for_the_client_query() {
        let mut req = request();
        let qid = req
            .plan
            .push(None, "example.com", Class::Internet, RType::A, QueryFlags::empty());
        satisfy(
            &mut req,
            qid,
            vec![Record::A {
                owner: "example.com".into(),
                addr: Ipv4Addr::new(192, 0, 2, 1),
                ttl: 60,
            }],
            Rcode::NoError,
        );

        assert_eq!(req.answer.answers.len(), 1);
        assert!(req.plan.get(qid).is_resolved());
    }

    #[test]
    fn should_feed_addresses_into_parent_zone_cut() {
        let mut req = request();
        let parent = req
            .plan
            .push(None, "example.com", Class::Internet, RType::A, QueryFlags::empty());
        req.plan.get_mut(parent).flags.insert(QueryFlags::AWAIT_ADDR);
        let child = req.plan.push(
            Some(parent),
            "ns1.example.net",
            Class::Internet,
            RType::A,
            QueryFlags::empty(),
        );

        satisfy(
            &mut req,
            child,
            vec![Record::A {
                owner: "ns1.example.net".into(),
                addr: Ipv4Addr::new(192, 0, 2, 53),
                ttl: 60,
            }],
            Rcode::NoError,
        );

        let cut = &req.plan.get(parent).zone_cut;
        assert_eq!(cut.nsset["ns1.example.net"].len(), 1);
        assert!(!req.plan.get(parent).flags.contains(QueryFlags::AWAIT_ADDR));
        assert!(req.answer.answers.is_empty());
    }

    #[test]
    fn should_preserve_tsig_on_the_answer() {
        let tsig = Record::Unknown {
            owner: "key.example".into(),
            rtype: super::TSIG_TYPE,
            ttl: 0,
            rdata: vec![1, 2, 3],
        };
        let query = Packet::new(Header::question(7))
            .with_question(Question::new("example.com".into(), RType::A))
            .with_resource(tsig.clone());
        let req = Request::new(&query, QueryFlags::empty(), None, 512);
        assert_eq!(req.tsig, Some(tsig));
    }
}
