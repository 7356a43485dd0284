pub mod header;
pub mod question;
pub mod record;

use crate::buffer::{PacketBuffer, ReaderError, WriterError};

#[derive(PartialEq, Eq, Debug, Clone, Hash, Copy)]
#[allow(clippy::upper_case_acronyms)]
pub enum RType {
    Unknown(u16),
    /// a host address
    A, // 1
    /// an authoritative name server
    NS, // 2
    /// the canonical name for an alias
    CNAME, // 5
    /// start of a zone of authority
    SOA, // 6
    /// mail exchange
    MX, // 15
    /// text strings
    TXT, // 16
    /// an IPv6 host address
    AAAA, // 28
    /// EDNS0 pseudo-record
    OPT, // 41
    /// signature over another record set
    RRSIG, // 46
}

impl RType {
    pub fn into_num(self) -> u16 {
        match self {
            RType::Unknown(x) => x,
            RType::A => 1,
            RType::NS => 2,
            RType::CNAME => 5,
            RType::SOA => 6,
            RType::MX => 15,
            RType::TXT => 16,
            RType::AAAA => 28,
            RType::OPT => 41,
            RType::RRSIG => 46,
        }
    }

    pub fn from_num(num: u16) -> RType {
        match num {
            1 => RType::A,
            2 => RType::NS,
            5 => RType::CNAME,
            6 => RType::SOA,
            15 => RType::MX,
            16 => RType::TXT,
            28 => RType::AAAA,
            41 => RType::OPT,
            46 => RType::RRSIG,
            _ => RType::Unknown(num),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    pub header: header::Header,
    pub questions: Vec<question::Question>,
    pub answers: Vec<record::Record>,
    pub authorities: Vec<record::Record>,
    pub resources: Vec<record::Record>,
}

impl TryFrom<PacketBuffer> for Packet {
    type Error = ReaderError;

    fn try_from(mut buffer: PacketBuffer) -> Result<Self, Self::Error> {
        buffer.pos = 0;
        let header = header::Header::read(&mut buffer)?;

        let mut questions = Vec::with_capacity(header.questions as usize);
        for _ in 0..header.questions {
            questions.push(question::Question::read(&mut buffer)?);
        }

        let mut answers = Vec::with_capacity(header.answers as usize);
        for _ in 0..header.answers {
            answers.push(record::Record::read(&mut buffer)?);
        }

        let mut authorities = Vec::with_capacity(header.authorities as usize);
        for _ in 0..header.authorities {
            authorities.push(record::Record::read(&mut buffer)?);
        }

        let mut resources = Vec::with_capacity(header.resources as usize);
        for _ in 0..header.resources {
            resources.push(record::Record::read(&mut buffer)?);
        }

        Ok(Packet {
            header,
            questions,
            answers,
            authorities,
            resources,
        })
    }
}

impl Packet {
    pub fn new(header: header::Header) -> Self {
        Self {
            header,
            ..Default::default()
        }
    }

    /// Parse a wire message.
    pub fn parse(wire: &[u8]) -> Result<Self, ReaderError> {
        Self::try_from(PacketBuffer::from_wire(wire.to_vec()))
    }

    /// Start a response to the given query: id and rd are copied over,
    /// qr and ra are set, nothing else is.
    pub fn response_to(query: &Packet) -> Self {
        let mut header = header::Header::response(query.header.id);
        header.recursion_desired = query.header.recursion_desired;
        header.recursion_available = true;
        Self::new(header)
    }

    pub fn with_question(mut self, question: question::Question) -> Self {
        self.questions.push(question);
        self
    }

    pub fn with_answer(mut self, record: record::Record) -> Self {
        self.answers.push(record);
        self
    }

    pub fn with_answers(mut self, records: Vec<record::Record>) -> Self {
        self.answers.extend(records);
        self
    }

    pub fn with_authority(mut self, record: record::Record) -> Self {
        self.authorities.push(record);
        self
    }

    pub fn with_resource(mut self, record: record::Record) -> Self {
        self.resources.push(record);
        self
    }

    /// First (in the normal case: only) question.
    pub fn question(&self) -> Option<&question::Question> {
        self.questions.first()
    }

    /// Payload size advertised through an OPT pseudo-record, if any.
    pub fn edns_payload(&self) -> Option<u16> {
        self.resources.iter().find_map(|record| match record {
            record::Record::OPT { payload, .. } => Some(*payload),
            _ => None,
        })
    }

    /// Advertise an EDNS0 payload size on this message.
    pub fn set_edns(&mut self, payload: u16) {
        self.resources.retain(|record| record.rtype() != RType::OPT);
        self.resources.push(record::Record::OPT {
            payload,
            ext: 0,
            rdata: Vec::new(),
        });
    }

    /// Encode the message, bounded by `limit` bytes.
    pub fn create_buffer(&mut self, limit: usize) -> Result<PacketBuffer, WriterError> {
        let mut buffer = PacketBuffer::with_limit(limit);
        self.header.questions = self.questions.len() as u16;
        self.header.answers = self.answers.len() as u16;
        self.header.authorities = self.authorities.len() as u16;
        self.header.resources = self.resources.len() as u16;

        self.header.write(&mut buffer)?;

        for question in &self.questions {
            question.write(&mut buffer)?;
        }
        for record in &self.answers {
            record.write(&mut buffer)?;
        }
        for record in &self.authorities {
            record.write(&mut buffer)?;
        }
        for record in &self.resources {
            record.write(&mut buffer)?;
        }

        Ok(buffer)
    }

    /// Encode the message; when the record sections overflow `limit`, fall
    /// back to a truncated reply carrying only the question, so a client
    /// knows to retry over TCP.
    pub fn create_buffer_capped(&mut self, limit: usize) -> Result<PacketBuffer, WriterError> {
        match self.create_buffer(limit) {
            Ok(buffer) => Ok(buffer),
            Err(WriterError::EndOfBuffer) => {
                let mut truncated = Packet::new(self.header.clone());
                truncated.header.truncated = true;
                truncated.questions = self.questions.clone();
                truncated.create_buffer(limit)
            }
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::header::Header;
    use super::question::Question;
    use super::record::Record;
    use super::{Packet, RType};
    use similar_asserts::assert_eq;
    use std::net::Ipv4Addr;

    #[test]
    fn should_negotiate_edns_payload() {
        let mut packet = Packet::new(Header::question(7))
            .with_question(Question::new("example.com".into(), RType::A));
        assert_eq!(packet.edns_payload(), None);
        packet.set_edns(4096);
        assert_eq!(packet.edns_payload(), Some(4096));

        let parsed = Packet::try_from(packet.create_buffer(crate::MIN_PKTSIZE).unwrap()).unwrap();
        assert_eq!(parsed.edns_payload(), Some(4096));
    }

    #[test]
    fn should_truncate_oversized_answers() {
        let mut packet = Packet::new(Header::response(7))
            .with_question(Question::new("example.com".into(), RType::TXT));
        for _ in 0..32 {
            packet = packet.with_answer(Record::TXT {
                owner: "example.com".into(),
                text: vec!["x".repeat(200)],
                ttl: 60,
            });
        }

        let buffer = packet.create_buffer_capped(crate::MIN_PKTSIZE).unwrap();
        let parsed = Packet::try_from(buffer).unwrap();
        assert!(parsed.header.truncated);
        assert!(parsed.answers.is_empty());
        assert_eq!(parsed.questions.len(), 1);
    }

    #[test]
    fn should_copy_id_and_rd_into_response() {
        let mut query = Packet::new(Header::question(4242))
            .with_question(Question::new("perdu.com".into(), RType::A));
        query.header.recursion_desired = true;

        let response = Packet::response_to(&query).with_answer(Record::A {
            owner: "perdu.com".into(),
            addr: Ipv4Addr::new(10, 0, 0, 1),
            ttl: 42,
        });
        assert_eq!(response.header.id, 4242);
        assert!(response.header.response);
        assert!(response.header.recursion_desired);
        assert!(response.header.recursion_available);
    }
}
