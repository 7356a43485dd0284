//! The worker drives every client query through its
//! `produce → send → recv → consume` cycle: one cooperative loop, many
//! overlapped exchanges, identical outstanding subrequests coalesced
//! behind a single leader.

use crate::error::Result;
use crate::layer::{Context, Outbound, Pipeline, SockType, State};
use crate::resolve::{self, Request};
use crate::rplan::QueryFlags;
use recursor_proto::name::{self, lookup_form};
use recursor_proto::packet::header::Header;
use recursor_proto::packet::question::{Class, Question};
use recursor_proto::packet::{Packet, RType};
use recursor_proto::{EDNS_PAYLOAD, MAX_PKTSIZE, MIN_PKTSIZE};
use recursor_server::prelude::{Message, Transport};
use recursor_server::Handler;
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Planning passes allowed per task; beyond this the query is broken.
pub const ITER_LIMIT: u16 = 50;
/// Fast retransmit cadence over the UDP candidate list.
pub const CONN_RETRY: Duration = Duration::from_millis(300);
/// Overall deadline for one outbound exchange.
pub const CONN_RTT_MAX: Duration = Duration::from_millis(3_000);
/// Transmissions allowed within one exchange window.
const MAX_PENDING: usize = crate::nsrep::NS_MAXADDR + crate::nsrep::NS_MAXADDR / 2;
/// Above this many concurrent tasks, new queries lose `NO_THROTTLE` and
/// downstream layers clamp their fan-out.
const QUERY_RATE_THRESHOLD: u64 = 100;

#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerStats {
    pub queries: u64,
    pub concurrent: u64,
    pub dropped: u64,
    pub timeout: u64,
    pub udp: u64,
    pub tcp: u64,
    pub ipv4: u64,
    pub ipv6: u64,
}

/// What a coalescing leader hands its followers: the message id and case
/// secret its exchange ran under, plus the response, if any arrived.
#[derive(Clone, Debug)]
struct SubreqOutcome {
    id: u16,
    secret: u64,
    response: Option<(SocketAddr, Vec<u8>)>,
}

/// Identity of an outstanding subrequest: qname in lookup form, qtype,
/// qclass.
fn fingerprint(sname: &str, sclass: Class, stype: RType) -> Result<Vec<u8>> {
    let mut key = lookup_form(sname)?;
    key.extend_from_slice(&stype.into_num().to_le_bytes());
    key.extend_from_slice(&sclass.into_num().to_le_bytes());
    Ok(key)
}

pub struct Worker {
    ctx: Rc<Context>,
    pipeline: RefCell<Pipeline>,
    outstanding: RefCell<HashMap<Vec<u8>, broadcast::Sender<SubreqOutcome>>>,
    stats: RefCell<WorkerStats>,
}

/// Clears the outstanding-table entry even when the leader's future is
/// dropped mid-exchange, so followers can never chain onto a dead leader.
struct LeaderGuard<'a> {
    worker: &'a Worker,
    key: Vec<u8>,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        self.worker.outstanding.borrow_mut().remove(&self.key);
    }
}

impl Worker {
    pub fn new(ctx: Rc<Context>) -> Self {
        let pipeline = Pipeline::standard(&ctx);
        Self {
            ctx,
            pipeline: RefCell::new(pipeline),
            outstanding: RefCell::new(HashMap::new()),
            stats: RefCell::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        *self.stats.borrow()
    }

    /// Loaded pipeline modules, in execution order.
    pub fn modules(&self) -> Vec<String> {
        self.pipeline.borrow().list()
    }

    pub fn load_module(&self, name: &str, layer: Rc<dyn crate::layer::Layer>) {
        self.pipeline.borrow_mut().load(name, layer);
    }

    pub fn unload_module(&self, name: &str) -> bool {
        self.pipeline.borrow_mut().unload(name)
    }

    /// Resolve a query made by the daemon itself, with no client socket
    /// behind it.
    pub async fn resolve(
        &self,
        qname: &str,
        qtype: RType,
        options: QueryFlags,
    ) -> Option<Packet> {
        let query = Packet::new(Header::question(rand::random()))
            .with_question(Question::new(qname.to_string(), qtype));
        let req = self
            .resolve_task(&query, None, Transport::Udp, options)
            .await?;
        Some(req.answer)
    }

    async fn resolve_task(
        &self,
        query: &Packet,
        qsource: Option<SocketAddr>,
        transport: Transport,
        extra_options: QueryFlags,
    ) -> Option<Request> {
        let question = query.question()?.clone();
        {
            let mut stats = self.stats.borrow_mut();
            stats.queries += 1;
            stats.concurrent += 1;
        }

        // Throttle outbound fan-out only under high pressure.
        let mut options = extra_options;
        if self.stats.borrow().concurrent < QUERY_RATE_THRESHOLD {
            options |= QueryFlags::NO_THROTTLE;
        }

        // How much can the client handle?
        let answer_max = match (transport, query.edns_payload()) {
            (Transport::Tcp, _) => MAX_PKTSIZE,
            (Transport::Udp, Some(payload)) => {
                (payload as usize).clamp(MIN_PKTSIZE, EDNS_PAYLOAD)
            }
            (Transport::Udp, None) => MIN_PKTSIZE,
        };

        let mut req = Request::new(query, options, qsource, answer_max);
        let pipeline = self.pipeline.borrow().clone();

        let state = match resolve::begin(
            &pipeline,
            &mut req,
            &question.name,
            question.class,
            question.rtype,
        ) {
            State::Fail => State::Fail,
            _ => self.drive(&pipeline, &mut req).await,
        };
        resolve::finish(&pipeline, &mut req, state);

        let mut stats = self.stats.borrow_mut();
        stats.concurrent = stats.concurrent.saturating_sub(1);
        Some(req)
    }

    /// The step cycle: plan until an outbound subquery is ready, exchange
    /// it, feed the outcome back, repeat until the plan drains or breaks.
    async fn drive(&self, pipeline: &Pipeline, req: &mut Request) -> State {
        let mut iter_count: u16 = 0;
        loop {
            let mut out = Outbound::default();
            let state = loop {
                let state = resolve::produce(pipeline, req, &mut out);
                iter_count += 1;
                if iter_count > ITER_LIMIT {
                    tracing::debug!("iteration limit reached, failing task");
                    return State::Fail;
                }
                if state != State::Produce {
                    break state;
                }
                out = Outbound::default();
            };

            match state {
                State::Done | State::Fail => return state,
                State::Consume => {}
                _ => return State::Fail,
            }

            if out.addrlist.is_empty() || out.pktbuf.is_none() {
                // Nowhere to send; let the layers adapt as on a timeout.
                let state = resolve::consume(pipeline, req, None);
                if matches!(state, State::Done | State::Fail) {
                    return state;
                }
                continue;
            }

            let response = match out.sock_type {
                SockType::Dgram => self.exchange_udp(req, &out).await,
                SockType::Stream => self.exchange_tcp(&out).await,
            };
            let parsed = response
                .and_then(|(src, wire)| Packet::parse(&wire).ok().map(|pkt| (src, pkt)));
            let state = match &parsed {
                Some((_, pkt)) => resolve::consume(pipeline, req, Some(pkt)),
                None => resolve::consume(pipeline, req, None),
            };
            if matches!(state, State::Done | State::Fail) {
                return state;
            }
        }
    }

    /// UDP exchange with fast retransmit and single-flight coalescing: an
    /// identical outstanding subrequest makes this task a follower that
    /// waits for the leader's response instead of sending its own.
    async fn exchange_udp(
        &self,
        req: &mut Request,
        out: &Outbound,
    ) -> Option<(SocketAddr, Vec<u8>)> {
        let qid = req.plan.current()?;
        let (sname, sclass, stype, id, secret) = {
            let query = req.plan.get(qid);
            (
                query.sname.clone(),
                query.sclass,
                query.stype,
                query.id,
                query.secret,
            )
        };
        let key = fingerprint(&sname, sclass, stype).ok()?;

        let waiting = self
            .outstanding
            .borrow()
            .get(&key)
            .map(|leader| leader.subscribe());
        if let Some(mut follower) = waiting {
            return match follower.recv().await {
                Ok(outcome) => {
                    // Align with the leader's exchange so its response
                    // validates against this plan too.
                    let query = req.plan.get_mut(qid);
                    query.id = outcome.id;
                    query.secret = outcome.secret;
                    outcome.response
                }
                // Leader went away without publishing; same as a timeout.
                Err(_) => None,
            };
        }

        let (publisher, _own_rx) = broadcast::channel(1);
        self.outstanding
            .borrow_mut()
            .insert(key.clone(), publisher.clone());
        let guard = LeaderGuard { worker: self, key };

        let response = self.exchange_udp_leader(&sname, id, secret, out).await;

        drop(guard);
        let _ = publisher.send(SubreqOutcome {
            id,
            secret,
            response: response.clone(),
        });
        // The case encoding is spent once shared; the next exchange of
        // this query runs plain.
        req.plan.get_mut(qid).secret = 0;

        response
    }

    async fn exchange_udp_leader(
        &self,
        sname: &str,
        id: u16,
        secret: u64,
        out: &Outbound,
    ) -> Option<(SocketAddr, Vec<u8>)> {
        let wire = out
            .pktbuf
            .clone()?
            .create_buffer(EDNS_PAYLOAD)
            .ok()?
            .buf;
        let bind: SocketAddr = if out.addrlist.first()?.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let socket = match tokio::net::UdpSocket::bind(bind).await {
            Ok(socket) => socket,
            Err(error) => {
                tracing::debug!("couldn't open subrequest socket: {error:?}");
                return None;
            }
        };

        let started = Instant::now();
        let mut turn = 0;
        let mut sends = 1;
        let mut tried: Vec<SocketAddr> = Vec::new();
        self.transmit(&socket, &wire, out.addrlist[turn], &mut tried).await;
        turn = (turn + 1) % out.addrlist.len();

        let deadline = tokio::time::sleep(CONN_RTT_MAX);
        tokio::pin!(deadline);
        let mut retry = tokio::time::interval_at(started + CONN_RETRY, CONN_RETRY);
        let mut buf = vec![0u8; MAX_PKTSIZE];

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    // Every address tried in this window gets flagged.
                    for &addr in &tried {
                        self.ctx.rtt.timeout(addr);
                    }
                    self.stats.borrow_mut().timeout += 1;
                    return None;
                }
                _ = retry.tick() => {
                    if sends < MAX_PENDING {
                        sends += 1;
                        self.transmit(&socket, &wire, out.addrlist[turn], &mut tried).await;
                        turn = (turn + 1) % out.addrlist.len();
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    let Ok((size, src)) = received else {
                        return None;
                    };
                    // Responses must come from a server we actually asked.
                    if !out.addrlist.contains(&src) || size < 12 {
                        continue;
                    }
                    if u16::from_be_bytes([buf[0], buf[1]]) != id {
                        continue;
                    }
                    let Ok(pkt) = Packet::parse(&buf[..size]) else {
                        // Garbage from the right address; penalize it and
                        // keep waiting for a real answer or the deadline.
                        self.ctx.rtt.timeout(src);
                        continue;
                    };
                    if let Some(question) = pkt.question() {
                        // The echoed question must carry our exact case.
                        if question.name != name::apply_secret(sname, secret) {
                            continue;
                        }
                    }
                    self.ctx.rtt.update(src, started.elapsed().as_millis() as u32);
                    return Some((src, buf[..size].to_vec()));
                }
            }
        }
    }

    async fn transmit(
        &self,
        socket: &tokio::net::UdpSocket,
        wire: &[u8],
        target: SocketAddr,
        tried: &mut Vec<SocketAddr>,
    ) {
        match socket.send_to(wire, target).await {
            Ok(_) => {
                let mut stats = self.stats.borrow_mut();
                stats.udp += 1;
                if target.is_ipv6() {
                    stats.ipv6 += 1;
                } else {
                    stats.ipv4 += 1;
                }
                if !tried.contains(&target) {
                    tried.push(target);
                }
            }
            Err(error) => {
                tracing::debug!("send to {target:?} failed: {error:?}");
            }
        }
    }

    /// TCP exchange: connect, write the length-prefixed query, reassemble
    /// the length-prefixed answer. Stream subrequests are never coalesced.
    async fn exchange_tcp(&self, out: &Outbound) -> Option<(SocketAddr, Vec<u8>)> {
        let wire = out
            .pktbuf
            .clone()?
            .create_buffer(MAX_PKTSIZE)
            .ok()?
            .buf;
        let started = Instant::now();

        let attempt = async {
            for &addr in &out.addrlist {
                let Ok(mut stream) = tokio::net::TcpStream::connect(addr).await else {
                    // Connect failure: quietly try the next candidate.
                    continue;
                };
                let _ = stream.set_nodelay(true);
                {
                    let mut stats = self.stats.borrow_mut();
                    stats.tcp += 1;
                    if addr.is_ipv6() {
                        stats.ipv6 += 1;
                    } else {
                        stats.ipv4 += 1;
                    }
                }

                let size = (wire.len() as u16).to_be_bytes();
                if stream.write_all(&size).await.is_err()
                    || stream.write_all(&wire).await.is_err()
                {
                    continue;
                }

                let mut prefix = [0u8; 2];
                if stream.read_exact(&mut prefix).await.is_err() {
                    continue;
                }
                let nbytes = u16::from_be_bytes(prefix) as usize;
                if nbytes < 12 {
                    continue;
                }
                let mut body = vec![0u8; nbytes];
                if stream.read_exact(&mut body).await.is_err() {
                    continue;
                }
                return Some((addr, body));
            }
            None
        };

        match tokio::time::timeout(CONN_RTT_MAX, attempt).await {
            Ok(Some((addr, body))) => {
                self.ctx
                    .rtt
                    .update(addr, started.elapsed().as_millis() as u32);
                Some((addr, body))
            }
            Ok(None) => None,
            Err(_) => {
                for &addr in &out.addrlist {
                    self.ctx.rtt.timeout(addr);
                }
                self.stats.borrow_mut().timeout += 1;
                None
            }
        }
    }
}

#[async_trait::async_trait(?Send)]
impl Handler for Worker {
    async fn handle(&self, message: Message) -> Option<Message> {
        let query = match Packet::parse(&message.bytes) {
            Ok(query) => query,
            Err(error) => {
                tracing::debug!("dropping malformed query: {error:?}");
                self.stats.borrow_mut().dropped += 1;
                return None;
            }
        };
        // Responses and questionless noise on a listening socket are not
        // answered at all.
        if query.header.response || query.question().is_none() {
            self.stats.borrow_mut().dropped += 1;
            return None;
        }

        let req = self
            .resolve_task(
                &query,
                Some(message.address),
                message.transport,
                QueryFlags::empty(),
            )
            .await?;
        let mut answer = req.answer;
        let bytes = answer.create_buffer_capped(req.answer_max).ok()?.buf;
        Some(Message {
            address: message.address,
            bytes,
            transport: message.transport,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{fingerprint, Worker};
    use crate::layer::Context;
    use crate::nsrep::RttCache;
    use recursor_proto::packet::header::Header;
    use recursor_proto::packet::question::{Class, Question};
    use recursor_proto::packet::{Packet, RType};
    use recursor_server::prelude::{Message, Transport};
    use recursor_server::Handler;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::rc::Rc;

    fn worker() -> Worker {
        Worker::new(Rc::new(Context {
            cache: None,
            rtt: RttCache::default(),
            roots: Vec::new(),
            negative_ttl: 900,
        }))
    }

    fn message(bytes: Vec<u8>) -> Message {
        Message {
            address: SocketAddr::from((IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 40000)),
            bytes,
            transport: Transport::Udp,
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn should_drop_malformed_queries_silently() {
        let worker = worker();
        let result = worker.handle(message(vec![0xFF, 0x01])).await;
        assert!(result.is_none());
        assert_eq!(worker.stats().dropped, 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn should_drop_responses_on_listening_sockets() {
        let worker = worker();
        let mut response = Packet::new(Header::response(9))
            .with_question(Question::new("example.com".into(), RType::A));
        let bytes = response.create_buffer(512).unwrap().buf;

        let result = worker.handle(message(bytes)).await;
        assert!(result.is_none());
        assert_eq!(worker.stats().dropped, 1);
        assert_eq!(worker.stats().queries, 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn should_servfail_without_root_hints() {
        // No hints and no cache: planning cannot even start.
        let worker = worker();
        let mut query = Packet::new(Header::question(77))
            .with_question(Question::new("example.com".into(), RType::A));
        let bytes = query.create_buffer(512).unwrap().buf;

        let answer = worker.handle(message(bytes)).await.unwrap();
        let parsed = Packet::parse(&answer.bytes).unwrap();
        assert_eq!(parsed.header.id, 77);
        assert!(parsed.header.response);
        assert_eq!(
            parsed.header.rcode,
            recursor_proto::packet::header::Rcode::ServerFailure
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn should_servfail_when_planning_never_converges() {
        struct Restless;
        impl crate::layer::Layer for Restless {
            fn produce(
                &self,
                _req: &mut crate::resolve::Request,
                _out: &mut crate::layer::Outbound,
            ) -> crate::layer::State {
                crate::layer::State::Produce
            }
        }

        let worker = worker();
        worker.unload_module("rrcache");
        worker.unload_module("iterate");
        worker.load_module("restless", Rc::new(Restless));

        let answer = worker
            .resolve("spin.test", RType::A, crate::rplan::QueryFlags::empty())
            .await
            .unwrap();
        assert_eq!(
            answer.header.rcode,
            recursor_proto::packet::header::Rcode::ServerFailure
        );
    }

    #[test]
    fn should_fingerprint_case_insensitively() {
        let one = fingerprint("Example.COM", Class::Internet, RType::A).unwrap();
        let two = fingerprint("example.com", Class::Internet, RType::A).unwrap();
        let other = fingerprint("example.com", Class::Internet, RType::AAAA).unwrap();
        assert_eq!(one, two);
        assert_ne!(one, other);
    }
}
