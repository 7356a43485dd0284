//! Resolution plan: the stack of sub-queries generated while resolving one
//! client query, plus the trail of already resolved ones.

use crate::zonecut::ZoneCut;
use recursor_proto::name;
use recursor_proto::packet::question::Class;
use recursor_proto::packet::RType;
use std::net::SocketAddr;
use std::time::SystemTime;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueryFlags: u32 {
        /// Use a stream socket for this query.
        const TCP = 1 << 0;
        /// Parked until a dependent address lookup finishes.
        const AWAIT_ADDR = 1 << 1;
        /// Answered; to be moved off the pending stack.
        const RESOLVED = 1 << 2;
        /// Fan-out not clamped; withheld under query pressure.
        const NO_THROTTLE = 1 << 3;
        /// Satisfied from the cache, no network involved.
        const CACHED = 1 << 4;
    }
}

/// Handle into the plan's query arena.
pub type QueryId = usize;

/// Nameserver chosen for a query: name, candidate addresses and the score
/// the election gave it.
#[derive(Debug, Clone, Default)]
pub struct NsChoice {
    pub name: String,
    pub addrs: Vec<SocketAddr>,
    pub score: i32,
}

#[derive(Debug)]
pub struct Query {
    /// Query name, kept in lowercase.
    pub sname: String,
    pub sclass: Class,
    pub stype: RType,
    pub flags: QueryFlags,
    /// Delegation the query currently works under.
    pub zone_cut: ZoneCut,
    /// Elected nameserver, empty until produce picks one.
    pub ns: NsChoice,
    /// Wall-clock inception of this query.
    pub timestamp: SystemTime,
    /// Message id used on the outbound subquery.
    pub id: u16,
    /// 0x20 case-randomization secret; zero means already decoded.
    pub secret: u64,
    parent: Option<QueryId>,
}

impl Query {
    pub fn parent(&self) -> Option<QueryId> {
        self.parent
    }

    pub fn is_resolved(&self) -> bool {
        self.flags.contains(QueryFlags::RESOLVED)
    }
}

/// Owns every query of one request. Queries never leave the arena; the
/// pending stack and resolved list track them by handle, and a handle is
/// in exactly one of the two.
#[derive(Debug, Default)]
pub struct Plan {
    queries: Vec<Query>,
    pending: Vec<QueryId>,
    resolved: Vec<QueryId>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan a new query on top of the pending stack.
    pub fn push(
        &mut self,
        parent: Option<QueryId>,
        sname: &str,
        sclass: Class,
        stype: RType,
        options: QueryFlags,
    ) -> QueryId {
        let qid = self.queries.len();
        self.queries.push(Query {
            sname: name::normalize(sname),
            sclass,
            stype,
            flags: options,
            zone_cut: ZoneCut::default(),
            ns: NsChoice::default(),
            timestamp: SystemTime::now(),
            id: rand::random(),
            secret: rand::random(),
            parent,
        });
        self.pending.push(qid);
        tracing::debug!("plan '{}' type {:?}", self.queries[qid].sname, stype);
        qid
    }

    /// Move a query from pending to the resolved trail.
    pub fn pop(&mut self, qid: QueryId) {
        if let Some(at) = self.pending.iter().rposition(|&id| id == qid) {
            self.pending.remove(at);
            self.resolved.push(qid);
        }
    }

    /// Query currently in flight: the top of the pending stack.
    pub fn current(&self) -> Option<QueryId> {
        self.pending.last().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Most recently resolved query.
    pub fn resolved(&self) -> Option<QueryId> {
        self.resolved.last().copied()
    }

    pub fn get(&self, qid: QueryId) -> &Query {
        &self.queries[qid]
    }

    pub fn get_mut(&mut self, qid: QueryId) -> &mut Query {
        &mut self.queries[qid]
    }

    /// Walk the parent chain from `closure` looking for a query with the
    /// given identifiers. Catches immediate dependency cycles, e.g.
    /// resolving the A of an NS whose A is the very thing being resolved.
    pub fn satisfies(&self, closure: QueryId, sname: &str, sclass: Class, stype: RType) -> bool {
        let sname = name::normalize(sname);
        let mut walk = Some(closure);
        while let Some(qid) = walk {
            let query = &self.queries[qid];
            if query.sclass == sclass && query.stype == stype && query.sname == sname {
                return true;
            }
            walk = query.parent;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::{Plan, QueryFlags};
    use recursor_proto::packet::question::Class;
    use recursor_proto::packet::RType;

    #[test]
    fn should_move_popped_queries_to_resolved() {
        let mut plan = Plan::new();
        let first = plan.push(None, "example.com", Class::Internet, RType::A, QueryFlags::empty());
        let second = plan.push(
            Some(first),
            "ns1.example.com",
            Class::Internet,
            RType::A,
            QueryFlags::empty(),
        );

        assert_eq!(plan.current(), Some(second));
        plan.pop(second);
        assert_eq!(plan.current(), Some(first));
        assert_eq!(plan.resolved(), Some(second));

        plan.pop(first);
        assert!(plan.is_empty());
        assert_eq!(plan.resolved(), Some(first));
    }

    #[test]
    fn should_keep_push_pop_balance() {
        let mut plan = Plan::new();
        let root = plan.push(None, "example.com", Class::Internet, RType::A, QueryFlags::empty());
        let before = plan.current();

        let child = plan.push(Some(root), "a.example", Class::Internet, RType::NS, QueryFlags::empty());
        plan.pop(child);

        assert_eq!(plan.current(), before);
        assert_eq!(plan.resolved(), Some(child));
    }

    #[test]
    fn should_lowercase_planned_names() {
        let mut plan = Plan::new();
        let qid = plan.push(None, "ExAmPlE.Com", Class::Internet, RType::A, QueryFlags::empty());
        assert_eq!(plan.get(qid).sname, "example.com");
    }

    #[test]
    fn should_detect_ancestor_queries() {
        let mut plan = Plan::new();
        let root = plan.push(None, "example.com", Class::Internet, RType::A, QueryFlags::empty());
        let child = plan.push(
            Some(root),
            "ns1.example.net",
            Class::Internet,
            RType::AAAA,
            QueryFlags::empty(),
        );

        assert!(plan.satisfies(child, "EXAMPLE.COM", Class::Internet, RType::A));
        assert!(plan.satisfies(child, "ns1.example.net", Class::Internet, RType::AAAA));
        assert!(!plan.satisfies(child, "example.com", Class::Internet, RType::NS));
        assert!(!plan.satisfies(root, "ns1.example.net", Class::Internet, RType::AAAA));
    }

    #[test]
    fn should_inherit_request_options() {
        let mut plan = Plan::new();
        let qid = plan.push(
            None,
            "example.com",
            Class::Internet,
            RType::A,
            QueryFlags::NO_THROTTLE,
        );
        assert!(plan.get(qid).flags.contains(QueryFlags::NO_THROTTLE));
    }
}
