pub mod buffer;
pub mod name;
pub mod packet;

/// Largest answer that fits a plain UDP response without EDNS.
pub const MIN_PKTSIZE: usize = 512;
/// Default EDNS0 payload advertised on outbound queries.
pub const EDNS_PAYLOAD: usize = 4096;
/// Hard ceiling for TCP and EDNS alike.
pub const MAX_PKTSIZE: usize = 65535;

#[cfg(test)]
mod tests {
    use crate::buffer::PacketBuffer;
    use crate::packet::header::Header;
    use crate::packet::question::Question;
    use crate::packet::record::Record;
    use crate::packet::{Packet, RType};
    use similar_asserts::assert_eq;
    use std::net::Ipv4Addr;

    #[test]
    fn should_round_trip_query_packet() {
        let mut packet = Packet::new(Header::question(38005))
            .with_question(Question::new("google.com".into(), RType::A));
        packet.header.recursion_desired = true;

        let buffer = packet.create_buffer(crate::MIN_PKTSIZE).unwrap();
        let parsed = Packet::try_from(buffer).unwrap();

        assert_eq!(parsed.header.id, 38005);
        assert!(parsed.header.recursion_desired);
        assert_eq!(parsed.questions.len(), 1);
        assert_eq!(parsed.questions[0].name, "google.com");
        assert_eq!(parsed.questions[0].rtype, RType::A);
        assert!(parsed.answers.is_empty());
    }

    #[test]
    fn should_round_trip_response_packet() {
        let mut packet = Packet::new(Header::response(38005))
            .with_question(Question::new("google.com".into(), RType::A))
            .with_answer(Record::A {
                owner: "google.com".into(),
                addr: Ipv4Addr::new(172, 217, 20, 206),
                ttl: 8,
            });
        packet.header.recursion_available = true;

        let buffer = packet.create_buffer(crate::MIN_PKTSIZE).unwrap();
        let parsed = Packet::try_from(buffer).unwrap();

        assert!(parsed.header.response);
        assert!(parsed.header.recursion_available);
        assert_eq!(parsed.answers.len(), 1);
        assert_eq!(
            parsed.answers[0],
            Record::A {
                owner: "google.com".into(),
                addr: Ipv4Addr::new(172, 217, 20, 206),
                ttl: 8,
            }
        );
    }

    #[test]
    fn should_parse_wire_query() {
        // 'example.com A IN' query assembled by hand.
        let mut wire = vec![
            0x12, 0x34, // id
            0x01, 0x00, // rd
            0x00, 0x01, // one question
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        wire.extend_from_slice(b"\x07example\x03com\x00");
        wire.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);

        let parsed = Packet::try_from(PacketBuffer::from_wire(wire)).unwrap();
        assert_eq!(parsed.header.id, 0x1234);
        assert!(!parsed.header.response);
        assert_eq!(parsed.questions[0].name, "example.com");
        assert_eq!(parsed.questions[0].rtype, RType::A);
    }

    #[test]
    fn should_keep_unknown_rdata_verbatim() {
        let record = Record::Unknown {
            owner: "signed.example".into(),
            rtype: 46,
            ttl: 300,
            rdata: vec![0x00, 0x01, 0x05, 0x03, 0xde, 0xad, 0xbe, 0xef],
        };
        let mut packet = Packet::new(Header::response(1))
            .with_question(Question::new("signed.example".into(), RType::RRSIG))
            .with_answer(record.clone());

        let buffer = packet.create_buffer(crate::MIN_PKTSIZE).unwrap();
        let parsed = Packet::try_from(buffer).unwrap();
        assert_eq!(parsed.answers[0], record);
    }
}
