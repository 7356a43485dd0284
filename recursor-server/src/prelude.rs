use std::net::SocketAddr;

/// Transport a message arrived on; answers are sized accordingly.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// One framed DNS message together with its source.
#[derive(Clone, Debug)]
pub struct Message {
    pub address: SocketAddr,
    pub bytes: Vec<u8>,
    pub transport: Transport,
}
