use super::question::Class;
use super::RType;
use crate::buffer::reader::ReaderError;
use crate::buffer::writer::WriterError;
use crate::buffer::PacketBuffer;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(clippy::upper_case_acronyms)]
pub enum Record {
    /// Unrecognized type carried verbatim, so records like RRSIG or TSIG
    /// survive a parse/build cycle untouched.
    Unknown {
        owner: String,
        rtype: u16,
        ttl: u32,
        rdata: Vec<u8>,
    }, // 0
    A {
        owner: String,
        addr: Ipv4Addr,
        ttl: u32,
    }, // 1
    NS {
        owner: String,
        host: String,
        ttl: u32,
    }, // 2
    CNAME {
        owner: String,
        host: String,
        ttl: u32,
    }, // 5
    SOA {
        owner: String,
        mname: String,
        rname: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
        ttl: u32,
    }, // 6
    MX {
        owner: String,
        priority: u16,
        host: String,
        ttl: u32,
    }, // 15
    TXT {
        owner: String,
        text: Vec<String>,
        ttl: u32,
    }, // 16
    AAAA {
        owner: String,
        addr: Ipv6Addr,
        ttl: u32,
    }, // 28
    /// EDNS0 pseudo-record; the class field carries the payload size and
    /// the ttl field the extended rcode and flags.
    OPT {
        payload: u16,
        ext: u32,
        rdata: Vec<u8>,
    }, // 41
}

impl Record {
    pub fn owner(&self) -> &str {
        match self {
            Self::Unknown { owner, .. } => owner,
            Self::A { owner, .. } => owner,
            Self::NS { owner, .. } => owner,
            Self::CNAME { owner, .. } => owner,
            Self::SOA { owner, .. } => owner,
            Self::MX { owner, .. } => owner,
            Self::TXT { owner, .. } => owner,
            Self::AAAA { owner, .. } => owner,
            Self::OPT { .. } => "",
        }
    }

    pub fn ttl(&self) -> u32 {
        match self {
            Self::Unknown { ttl, .. } => *ttl,
            Self::A { ttl, .. } => *ttl,
            Self::NS { ttl, .. } => *ttl,
            Self::CNAME { ttl, .. } => *ttl,
            Self::SOA { ttl, .. } => *ttl,
            Self::MX { ttl, .. } => *ttl,
            Self::TXT { ttl, .. } => *ttl,
            Self::AAAA { ttl, .. } => *ttl,
            Self::OPT { ext, .. } => *ext,
        }
    }

    /// Same record with its ttl aged to the given value.
    pub fn with_ttl(&self, ttl: u32) -> Self {
        let mut copy = self.clone();
        match &mut copy {
            Self::Unknown { ttl: t, .. } => *t = ttl,
            Self::A { ttl: t, .. } => *t = ttl,
            Self::NS { ttl: t, .. } => *t = ttl,
            Self::CNAME { ttl: t, .. } => *t = ttl,
            Self::SOA { ttl: t, .. } => *t = ttl,
            Self::MX { ttl: t, .. } => *t = ttl,
            Self::TXT { ttl: t, .. } => *t = ttl,
            Self::AAAA { ttl: t, .. } => *t = ttl,
            Self::OPT { .. } => {}
        }
        copy
    }

    pub fn rtype_num(&self) -> u16 {
        match self {
            Self::Unknown { rtype, .. } => *rtype,
            Self::A { .. } => 1,
            Self::NS { .. } => 2,
            Self::CNAME { .. } => 5,
            Self::SOA { .. } => 6,
            Self::MX { .. } => 15,
            Self::TXT { .. } => 16,
            Self::AAAA { .. } => 28,
            Self::OPT { .. } => 41,
        }
    }

    pub fn rtype(&self) -> RType {
        RType::from_num(self.rtype_num())
    }

    /// Address payload of A and AAAA records.
    pub fn addr(&self) -> Option<IpAddr> {
        match self {
            Self::A { addr, .. } => Some(IpAddr::V4(*addr)),
            Self::AAAA { addr, .. } => Some(IpAddr::V6(*addr)),
            _ => None,
        }
    }

    pub fn read(buffer: &mut PacketBuffer) -> Result<Record, ReaderError> {
        // NAME, TYPE, CLASS, TTL, RDLENGTH, then RDATA.
        let owner = buffer.read_qname()?;
        let rtype_num = buffer.read_u16()?;
        let class = buffer.read_u16()?;
        let ttl = buffer.read_u32()?;
        let data_len = buffer.read_u16()?;

        let rdata_start = buffer.pos();
        if rdata_start + data_len as usize > buffer.len() {
            return Err(ReaderError::BadRdataLength(data_len));
        }

        let record = match RType::from_num(rtype_num) {
            RType::A => {
                let raw = buffer.read_u32()?;
                Record::A {
                    owner,
                    addr: Ipv4Addr::from(raw),
                    ttl,
                }
            }
            RType::AAAA => {
                let mut octets = [0u8; 16];
                for chunk in octets.chunks_mut(4) {
                    chunk.copy_from_slice(&buffer.read_u32()?.to_be_bytes());
                }
                Record::AAAA {
                    owner,
                    addr: Ipv6Addr::from(octets),
                    ttl,
                }
            }
            RType::NS => Record::NS {
                owner,
                host: buffer.read_qname()?,
                ttl,
            },
            RType::CNAME => Record::CNAME {
                owner,
                host: buffer.read_qname()?,
                ttl,
            },
            RType::SOA => Record::SOA {
                owner,
                mname: buffer.read_qname()?,
                rname: buffer.read_qname()?,
                serial: buffer.read_u32()?,
                refresh: buffer.read_u32()?,
                retry: buffer.read_u32()?,
                expire: buffer.read_u32()?,
                minimum: buffer.read_u32()?,
                ttl,
            },
            RType::MX => Record::MX {
                owner,
                priority: buffer.read_u16()?,
                host: buffer.read_qname()?,
                ttl,
            },
            RType::TXT => {
                let mut text = Vec::new();
                while buffer.pos() < rdata_start + data_len as usize {
                    let len = buffer.read()? as usize;
                    let bytes = buffer.get_range(buffer.pos(), len)?.to_vec();
                    buffer.step(len)?;
                    text.push(String::from_utf8_lossy(&bytes).into_owned());
                }
                Record::TXT { owner, text, ttl }
            }
            RType::OPT => Record::OPT {
                payload: class,
                ext: ttl,
                rdata: buffer.get_range(rdata_start, data_len as usize)?.to_vec(),
            },
            _ => Record::Unknown {
                owner,
                rtype: rtype_num,
                ttl,
                rdata: buffer.get_range(rdata_start, data_len as usize)?.to_vec(),
            },
        };

        // Skip whatever the rdata claims, even if the typed parse consumed
        // a different amount through a compression pointer.
        buffer.pos = rdata_start + data_len as usize;

        Ok(record)
    }

    pub fn write(&self, buffer: &mut PacketBuffer) -> Result<(), WriterError> {
        buffer.write_qname(self.owner())?;
        buffer.write_u16(self.rtype_num())?;
        match self {
            Self::OPT { payload, ext, .. } => {
                buffer.write_u16(*payload)?;
                buffer.write_u32(*ext)?;
            }
            other => {
                buffer.write_u16(Class::Internet.into_num())?;
                buffer.write_u32(other.ttl())?;
            }
        }

        // RDLENGTH is patched once the rdata is in place.
        let len_pos = buffer.pos();
        buffer.write_u16(0)?;
        let rdata_start = buffer.pos();

        match self {
            Self::Unknown { rdata, .. } | Self::OPT { rdata, .. } => {
                buffer.write_bytes(rdata)?;
            }
            Self::A { addr, .. } => {
                buffer.write_u32(u32::from(*addr))?;
            }
            Self::AAAA { addr, .. } => {
                for segment in addr.segments() {
                    buffer.write_u16(segment)?;
                }
            }
            Self::NS { host, .. } | Self::CNAME { host, .. } => {
                buffer.write_qname(host)?;
            }
            Self::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
                ..
            } => {
                buffer.write_qname(mname)?;
                buffer.write_qname(rname)?;
                buffer.write_u32(*serial)?;
                buffer.write_u32(*refresh)?;
                buffer.write_u32(*retry)?;
                buffer.write_u32(*expire)?;
                buffer.write_u32(*minimum)?;
            }
            Self::MX {
                priority, host, ..
            } => {
                buffer.write_u16(*priority)?;
                buffer.write_qname(host)?;
            }
            Self::TXT { text, .. } => {
                for chunk in text {
                    let bytes = chunk.as_bytes();
                    if bytes.len() > 255 {
                        return Err(WriterError::SingleLabelLength);
                    }
                    buffer.write_u8(bytes.len() as u8)?;
                    buffer.write_bytes(bytes)?;
                }
            }
        }

        buffer.set_u16(len_pos, (buffer.pos() - rdata_start) as u16)?;

        Ok(())
    }

    /// Serialize only the rdata, uncompressed, for the cache entry layout.
    pub fn rdata_bytes(&self) -> Result<Vec<u8>, WriterError> {
        let mut buffer = PacketBuffer::with_limit(crate::MAX_PKTSIZE);
        match self {
            Self::Unknown { rdata, .. } | Self::OPT { rdata, .. } => {
                buffer.write_bytes(rdata)?;
            }
            Self::A { addr, .. } => buffer.write_u32(u32::from(*addr))?,
            Self::AAAA { addr, .. } => {
                for segment in addr.segments() {
                    buffer.write_u16(segment)?;
                }
            }
            Self::NS { host, .. } | Self::CNAME { host, .. } => {
                write_plain_name(&mut buffer, host)?;
            }
            Self::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
                ..
            } => {
                write_plain_name(&mut buffer, mname)?;
                write_plain_name(&mut buffer, rname)?;
                buffer.write_u32(*serial)?;
                buffer.write_u32(*refresh)?;
                buffer.write_u32(*retry)?;
                buffer.write_u32(*expire)?;
                buffer.write_u32(*minimum)?;
            }
            Self::MX {
                priority, host, ..
            } => {
                buffer.write_u16(*priority)?;
                write_plain_name(&mut buffer, host)?;
            }
            Self::TXT { text, .. } => {
                for chunk in text {
                    let bytes = chunk.as_bytes();
                    if bytes.len() > 255 {
                        return Err(WriterError::SingleLabelLength);
                    }
                    buffer.write_u8(bytes.len() as u8)?;
                    buffer.write_bytes(bytes)?;
                }
            }
        }
        Ok(buffer.buf)
    }

    /// Rebuild a record from a cache rdata blob written by `rdata_bytes`.
    pub fn from_rdata(
        owner: String,
        rtype_num: u16,
        ttl: u32,
        rdata: &[u8],
    ) -> Result<Record, ReaderError> {
        let mut buffer = PacketBuffer::from_wire(rdata.to_vec());
        let record = match RType::from_num(rtype_num) {
            RType::A => Record::A {
                owner,
                addr: Ipv4Addr::from(buffer.read_u32()?),
                ttl,
            },
            RType::AAAA => {
                let mut octets = [0u8; 16];
                for chunk in octets.chunks_mut(4) {
                    chunk.copy_from_slice(&buffer.read_u32()?.to_be_bytes());
                }
                Record::AAAA {
                    owner,
                    addr: Ipv6Addr::from(octets),
                    ttl,
                }
            }
            RType::NS => Record::NS {
                owner,
                host: buffer.read_qname()?,
                ttl,
            },
            RType::CNAME => Record::CNAME {
                owner,
                host: buffer.read_qname()?,
                ttl,
            },
            RType::SOA => Record::SOA {
                owner,
                mname: buffer.read_qname()?,
                rname: buffer.read_qname()?,
                serial: buffer.read_u32()?,
                refresh: buffer.read_u32()?,
                retry: buffer.read_u32()?,
                expire: buffer.read_u32()?,
                minimum: buffer.read_u32()?,
                ttl,
            },
            RType::MX => Record::MX {
                owner,
                priority: buffer.read_u16()?,
                host: buffer.read_qname()?,
                ttl,
            },
            RType::TXT => {
                let mut text = Vec::new();
                while buffer.pos() < rdata.len() {
                    let len = buffer.read()? as usize;
                    let bytes = buffer.get_range(buffer.pos(), len)?.to_vec();
                    buffer.step(len)?;
                    text.push(String::from_utf8_lossy(&bytes).into_owned());
                }
                Record::TXT { owner, text, ttl }
            }
            _ => Record::Unknown {
                owner,
                rtype: rtype_num,
                ttl,
                rdata: rdata.to_vec(),
            },
        };
        Ok(record)
    }
}

/// Uncompressed label sequence, used inside cache blobs where there is no
/// surrounding message to point into.
fn write_plain_name(buffer: &mut PacketBuffer, name: &str) -> Result<(), WriterError> {
    if name.is_empty() {
        return buffer.write_u8(0);
    }
    for label in name.trim_end_matches('.').split('.') {
        let bytes = label.as_bytes();
        if bytes.len() > 0x3F {
            return Err(WriterError::SingleLabelLength);
        }
        buffer.write_u8(bytes.len() as u8)?;
        buffer.write_bytes(bytes)?;
    }
    buffer.write_u8(0)
}

#[cfg(test)]
mod tests {
    use super::Record;
    use crate::buffer::PacketBuffer;
    use similar_asserts::assert_eq;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn round_trip(record: Record) {
        let mut buffer = PacketBuffer::with_limit(crate::MAX_PKTSIZE);
        record.write(&mut buffer).unwrap();
        buffer.pos = 0;
        assert_eq!(Record::read(&mut buffer).unwrap(), record);
    }

    #[test]
    fn should_round_trip_address_records() {
        round_trip(Record::A {
            owner: "perdu.com".into(),
            addr: Ipv4Addr::new(1, 2, 3, 4),
            ttl: 60,
        });
        round_trip(Record::AAAA {
            owner: "perdu.com".into(),
            addr: Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1),
            ttl: 60,
        });
    }

    #[test]
    fn should_round_trip_soa() {
        round_trip(Record::SOA {
            owner: "example.com".into(),
            mname: "ns1.example.com".into(),
            rname: "hostmaster.example.com".into(),
            serial: 2023010101,
            refresh: 7200,
            retry: 3600,
            expire: 1209600,
            minimum: 900,
            ttl: 900,
        });
    }

    #[test]
    fn should_round_trip_txt() {
        round_trip(Record::TXT {
            owner: "example.com".into(),
            text: vec!["v=spf1 -all".into(), "second".into()],
            ttl: 120,
        });
    }

    #[test]
    fn should_round_trip_rdata_blob() {
        let records = vec![
            Record::NS {
                owner: "com".into(),
                host: "a.gtld-servers.net".into(),
                ttl: 172800,
            },
            Record::MX {
                owner: "example.com".into(),
                priority: 10,
                host: "mail.example.com".into(),
                ttl: 300,
            },
        ];
        for record in records {
            let blob = record.rdata_bytes().unwrap();
            let rebuilt = Record::from_rdata(
                record.owner().to_string(),
                record.rtype_num(),
                record.ttl(),
                &blob,
            )
            .unwrap();
            assert_eq!(rebuilt, record);
        }
    }

    #[test]
    fn should_reject_lying_rdata_length() {
        let mut buffer = PacketBuffer::with_limit(crate::MAX_PKTSIZE);
        Record::A {
            owner: "a.example".into(),
            addr: Ipv4Addr::new(1, 2, 3, 4),
            ttl: 60,
        }
        .write(&mut buffer)
        .unwrap();
        // Inflate RDLENGTH past the end of the message.
        let len_pos = buffer.pos() - 6;
        buffer.set_u16(len_pos, 0xFF).unwrap();
        buffer.pos = 0;
        assert_eq!(
            Record::read(&mut buffer).unwrap_err(),
            crate::buffer::ReaderError::BadRdataLength(0xFF),
        );
    }
}
