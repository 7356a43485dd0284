//! The processing pipeline: an ordered chain of stages applied to every
//! packet entering or leaving a request.

pub mod iterate;
pub mod rrcache;

use crate::cache::Cache;
use crate::nsrep::RttCache;
use crate::resolve::Request;
use recursor_proto::packet::Packet;
use std::net::SocketAddr;
use std::rc::Rc;

/// Per-subquery pipeline state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// No state change.
    Noop,
    /// Waiting to absorb a received response.
    Consume,
    /// Asked to generate the next outbound query.
    Produce,
    /// The current subquery is resolved.
    Done,
    /// Abort resolution.
    Fail,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SockType {
    #[default]
    Dgram,
    Stream,
}

/// What `produce` hands the worker for the next outbound subquery.
#[derive(Debug, Default)]
pub struct Outbound {
    pub addrlist: Vec<SocketAddr>,
    pub sock_type: SockType,
    pub pktbuf: Option<Packet>,
}

/// Shared resolver state the layers work against.
pub struct Context {
    pub cache: Option<Rc<Cache>>,
    pub rtt: RttCache,
    /// Root hints: nameserver name and address pairs.
    pub roots: Vec<(String, SocketAddr)>,
    /// Cap for negative answer lifetimes.
    pub negative_ttl: u32,
}

/// One pipeline stage. Every capability has a no-op default, so a stage
/// implements only the hooks it cares about.
pub trait Layer {
    fn begin(&self, _req: &mut Request) -> State {
        State::Noop
    }

    fn reset(&self, _req: &mut Request) {}

    fn consume(&self, _req: &mut Request, _pkt: Option<&Packet>) -> State {
        State::Noop
    }

    fn produce(&self, _req: &mut Request, _out: &mut Outbound) -> State {
        State::Noop
    }

    fn finish(&self, _req: &mut Request, _state: State) -> State {
        State::Noop
    }
}

/// Fixed, ordered chain of stages. The cache reader runs ahead of the
/// iterator so cached data preempts network traffic; user modules load
/// behind both.
#[derive(Clone)]
pub struct Pipeline {
    layers: Vec<(String, Rc<dyn Layer>)>,
}

impl Pipeline {
    pub fn standard(ctx: &Rc<Context>) -> Self {
        let mut pipeline = Self { layers: Vec::new() };
        pipeline.load("rrcache", Rc::new(rrcache::RrCache::new(ctx.clone())));
        pipeline.load("iterate", Rc::new(iterate::Iterate::new(ctx.clone())));
        pipeline
    }

    pub fn list(&self) -> Vec<String> {
        self.layers.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn load(&mut self, name: &str, layer: Rc<dyn Layer>) {
        self.unload(name);
        self.layers.push((name.to_string(), layer));
    }

    pub fn unload(&mut self, name: &str) -> bool {
        let before = self.layers.len();
        self.layers.retain(|(known, _)| known != name);
        self.layers.len() != before
    }

    pub(crate) fn begin_fold(&self, req: &mut Request) -> State {
        let mut result = State::Noop;
        for (_, layer) in &self.layers {
            match layer.begin(req) {
                State::Noop => {}
                State::Fail => return State::Fail,
                state => result = state,
            }
        }
        result
    }

    /// Every stage sees the packet; the last non-noop verdict wins, a
    /// failure wins immediately.
    pub(crate) fn consume_fold(&self, req: &mut Request, pkt: Option<&Packet>) -> State {
        let mut result = State::Noop;
        for (_, layer) in &self.layers {
            match layer.consume(req, pkt) {
                State::Noop => {}
                State::Fail => return State::Fail,
                state => result = state,
            }
        }
        result
    }

    /// First stage with something to say wins; earlier stages preempt
    /// later ones.
    pub(crate) fn produce_fold(&self, req: &mut Request, out: &mut Outbound) -> State {
        for (_, layer) in &self.layers {
            match layer.produce(req, out) {
                State::Noop => {}
                state => return state,
            }
        }
        State::Noop
    }

    pub(crate) fn finish_fold(&self, req: &mut Request, state: State) -> State {
        let mut result = State::Noop;
        for (_, layer) in &self.layers {
            match layer.finish(req, state) {
                State::Noop => {}
                State::Fail => return State::Fail,
                other => result = other,
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::{Context, Layer, Pipeline};
    use crate::nsrep::RttCache;
    use std::rc::Rc;

    fn context() -> Rc<Context> {
        Rc::new(Context {
            cache: None,
            rtt: RttCache::default(),
            roots: Vec::new(),
            negative_ttl: 900,
        })
    }

    struct Quiet;
    impl Layer for Quiet {}

    #[test]
    fn should_list_standard_layers_in_order() {
        let pipeline = Pipeline::standard(&context());
        assert_eq!(pipeline.list(), vec!["rrcache", "iterate"]);
    }

    #[test]
    fn should_load_and_unload_user_modules() {
        let mut pipeline = Pipeline::standard(&context());
        pipeline.load("quiet", Rc::new(Quiet));
        assert_eq!(pipeline.list(), vec!["rrcache", "iterate", "quiet"]);

        assert!(pipeline.unload("quiet"));
        assert!(!pipeline.unload("quiet"));
        assert_eq!(pipeline.list(), vec!["rrcache", "iterate"]);
    }

    #[test]
    fn should_replace_module_on_reload() {
        let mut pipeline = Pipeline::standard(&context());
        pipeline.load("iterate", Rc::new(Quiet));
        assert_eq!(pipeline.list(), vec!["rrcache", "iterate"]);
    }
}
