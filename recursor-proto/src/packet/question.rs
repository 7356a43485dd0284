use super::RType;
use crate::buffer::reader::ReaderError;
use crate::buffer::writer::WriterError;
use crate::buffer::PacketBuffer;

/// CLASS fields appear in questions and resource records. Kept total so an
/// unusual class never fails a parse; OPT pseudo-records smuggle a payload
/// size through this field.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Class {
    /// IN - the Internet
    Internet,
    /// CH - the CHAOS class
    Chaos,
    /// HS - Hesiod
    Hesiod,
    Other(u16),
}

impl Default for Class {
    fn default() -> Self {
        Self::Internet
    }
}

impl Class {
    pub fn into_num(self) -> u16 {
        match self {
            Self::Internet => 1,
            Self::Chaos => 3,
            Self::Hesiod => 4,
            Self::Other(num) => num,
        }
    }

    pub fn from_num(num: u16) -> Self {
        match num {
            1 => Self::Internet,
            3 => Self::Chaos,
            4 => Self::Hesiod,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// QNAME, a sequence of dot-separated labels. Case is preserved as
    /// received so 0x20-encoded responses can be verified.
    pub name: String,
    /// QTYPE, the record type asked for.
    pub rtype: RType,
    /// QCLASS, IN for the Internet.
    pub class: Class,
}

impl Default for Question {
    fn default() -> Self {
        Self {
            name: String::default(),
            rtype: RType::Unknown(0),
            class: Class::Internet,
        }
    }
}

impl Question {
    pub fn new(name: String, rtype: RType) -> Self {
        Self {
            name,
            rtype,
            class: Class::default(),
        }
    }

    pub fn read(buffer: &mut PacketBuffer) -> Result<Self, ReaderError> {
        let name = buffer.read_qname()?;
        let rtype = RType::from_num(buffer.read_u16()?);
        let class = Class::from_num(buffer.read_u16()?);

        Ok(Self { name, rtype, class })
    }

    pub fn write(&self, buffer: &mut PacketBuffer) -> Result<(), WriterError> {
        buffer.write_qname(&self.name)?;
        buffer.write_u16(self.rtype.into_num())?;
        buffer.write_u16(self.class.into_num())?;

        Ok(())
    }
}
