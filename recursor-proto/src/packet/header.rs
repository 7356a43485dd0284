use crate::buffer::{PacketBuffer, ReaderError, WriterError};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Rcode {
    /// No error condition
    NoError = 0,
    /// Format error - The name server was unable to interpret the query.
    FormatError = 1,
    /// Server failure - The name server was unable to process this query
    /// due to a problem with the name server.
    ServerFailure = 2,
    /// Name Error - the domain name referenced in the query does not exist.
    /// Only meaningful from an authoritative name server (NXDOMAIN).
    NameError = 3,
    /// Not Implemented - The name server does not support the requested
    /// kind of query.
    NotImplemented = 4,
    /// Refused - The name server refuses to perform the specified operation
    /// for policy reasons.
    Refused = 5,
}

impl Default for Rcode {
    fn default() -> Self {
        Self::NoError
    }
}

impl Rcode {
    pub fn from_num(num: u8) -> Rcode {
        match num {
            1 => Rcode::FormatError,
            2 => Rcode::ServerFailure,
            3 => Rcode::NameError,
            4 => Rcode::NotImplemented,
            5 => Rcode::Refused,
            _ => Rcode::NoError,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    /// A 16 bit identifier assigned by the program that generates the
    /// query, copied into the corresponding reply.
    pub id: u16, // 16 bits

    /// RD - directs the name server to pursue the query recursively.
    pub recursion_desired: bool, // 1 bit
    /// TC - the message was truncated by the transmission channel.
    pub truncated: bool, // 1 bit
    /// AA - the responding name server is an authority for the name.
    pub authoritative: bool, // 1 bit
    /// OPCODE - kind of query, 0 for a standard query.
    pub opcode: u8, // 4 bits
    /// QR - query (0) or response (1).
    pub response: bool, // 1 bit

    pub rcode: Rcode, // 4 bits
    /// CD - checking disabled by the requester.
    pub checking_disabled: bool, // 1 bit
    /// AD - all data in the response has been authenticated.
    pub authed_data: bool, // 1 bit
    /// Z - reserved, must be zero.
    pub z: bool, // 1 bit
    /// RA - recursive query support is available.
    pub recursion_available: bool, // 1 bit

    pub questions: u16, // 16 bits
    pub answers: u16, // 16 bits
    pub authorities: u16, // 16 bits
    pub resources: u16, // 16 bits
}

impl Header {
    /// Header for an outbound question.
    pub fn question(id: u16) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Header for a response carrying the given id.
    pub fn response(id: u16) -> Self {
        Self {
            id,
            response: true,
            ..Default::default()
        }
    }

    pub fn read(buffer: &mut PacketBuffer) -> Result<Self, ReaderError> {
        let id = buffer.read_u16()?;

        let flags = buffer.read_u16()?;
        let head = (flags >> 8) as u8;
        let tail = (flags & 0xFF) as u8;

        let questions = buffer.read_u16()?;
        let answers = buffer.read_u16()?;
        let authorities = buffer.read_u16()?;
        let resources = buffer.read_u16()?;

        Ok(Self {
            id,
            recursion_desired: (head & (1 << 0)) > 0,
            truncated: (head & (1 << 1)) > 0,
            authoritative: (head & (1 << 2)) > 0,
            opcode: (head >> 3) & 0x0F,
            response: (head & (1 << 7)) > 0,
            rcode: Rcode::from_num(tail & 0x0F),
            checking_disabled: (tail & (1 << 4)) > 0,
            authed_data: (tail & (1 << 5)) > 0,
            z: (tail & (1 << 6)) > 0,
            recursion_available: (tail & (1 << 7)) > 0,
            questions,
            answers,
            authorities,
            resources,
        })
    }

    pub fn write(&self, buffer: &mut PacketBuffer) -> Result<(), WriterError> {
        buffer.write_u16(self.id)?;

        buffer.write_u8(
            (self.recursion_desired as u8)
                | ((self.truncated as u8) << 1)
                | ((self.authoritative as u8) << 2)
                | (self.opcode << 3)
                | ((self.response as u8) << 7),
        )?;

        buffer.write_u8(
            (self.rcode as u8)
                | ((self.checking_disabled as u8) << 4)
                | ((self.authed_data as u8) << 5)
                | ((self.z as u8) << 6)
                | ((self.recursion_available as u8) << 7),
        )?;

        buffer.write_u16(self.questions)?;
        buffer.write_u16(self.answers)?;
        buffer.write_u16(self.authorities)?;
        buffer.write_u16(self.resources)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Header;
    use crate::buffer::PacketBuffer;

    #[test]
    fn should_round_trip_flags() {
        let mut header = Header::response(0xBEEF);
        header.recursion_desired = true;
        header.recursion_available = true;
        header.authoritative = true;
        header.rcode = super::Rcode::NameError;

        let mut buffer = PacketBuffer::default();
        header.write(&mut buffer).unwrap();
        buffer.pos = 0;
        let parsed = Header::read(&mut buffer).unwrap();
        assert_eq!(parsed, header);
    }
}
