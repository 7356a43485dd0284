//! Bound endpoints and the socket plumbing behind them.

use crate::tcp::TcpServer;
use crate::{Handler, UdpServer};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use tokio::task::JoinHandle;

/// Datagram waves the receive buffer should absorb ahead of the loop.
const RECV_BATCH: usize = 4;
const TCP_BACKLOG: i32 = 16;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Proto: u8 {
        const UDP = 1;
        const TCP = 2;
    }
}

pub fn bind_udp(address: SocketAddr) -> std::io::Result<tokio::net::UdpSocket> {
    let domain = if address.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if address.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    // Buffer a few whole datagram waves in advance; the kernel may clamp.
    let want = RECV_BATCH * 65535 * 2;
    if socket.recv_buffer_size()? < want {
        let _ = socket.set_recv_buffer_size(want);
    }
    if socket.send_buffer_size()? < want {
        let _ = socket.set_send_buffer_size(want);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&address.into())?;
    tokio::net::UdpSocket::from_std(socket.into())
}

pub fn bind_tcp(address: SocketAddr) -> std::io::Result<tokio::net::TcpListener> {
    let domain = if address.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if address.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&address.into())?;
    socket.listen(TCP_BACKLOG)?;
    tokio::net::TcpListener::from_std(socket.into())
}

struct Endpoint {
    port: u16,
    flags: Proto,
    tasks: Vec<JoinHandle<()>>,
}

impl Endpoint {
    fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}

/// Listening endpoints, grouped by address string. Each endpoint owns the
/// listener tasks for the socket kinds it was opened with.
pub struct Network<H> {
    handler: Rc<H>,
    endpoints: HashMap<String, Vec<Endpoint>>,
}

impl<H: Handler + 'static> Network<H> {
    pub fn new(handler: Rc<H>) -> Self {
        Self {
            handler,
            endpoints: HashMap::new(),
        }
    }

    /// Addresses and ports currently listened on.
    pub fn list(&self) -> Vec<(String, u16, Proto)> {
        let mut out = Vec::new();
        for (addr, endpoints) in &self.endpoints {
            for endpoint in endpoints {
                out.push((addr.clone(), endpoint.port, endpoint.flags));
            }
        }
        out
    }

    /// Bind the requested socket kinds and start serving them. Must run
    /// inside a `LocalSet`; the spawned listener tasks stay on this loop.
    pub fn listen(&mut self, addr: &str, port: u16, flags: Proto) -> std::io::Result<()> {
        let ip: std::net::IpAddr = addr
            .parse()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad address"))?;
        let address = SocketAddr::from((ip, port));

        let mut endpoint = Endpoint {
            port,
            flags,
            tasks: Vec::new(),
        };
        if flags.contains(Proto::UDP) {
            let server = UdpServer::new(bind_udp(address)?);
            let handler = self.handler.clone();
            endpoint.tasks.push(tokio::task::spawn_local(async move {
                if let Err(error) = server.run(handler).await {
                    tracing::error!("udp endpoint failed: {error:?}");
                }
            }));
        }
        if flags.contains(Proto::TCP) {
            let server = TcpServer::new(bind_tcp(address)?);
            let handler = self.handler.clone();
            endpoint.tasks.push(tokio::task::spawn_local(async move {
                if let Err(error) = server.run(handler).await {
                    tracing::error!("tcp endpoint failed: {error:?}");
                }
            }));
        }

        tracing::info!("listening on {addr}:{port} ({flags:?})");
        self.endpoints
            .entry(addr.to_string())
            .or_default()
            .push(endpoint);
        Ok(())
    }

    /// Close every endpoint matching the address and port. The map entry
    /// collapses once an address has no endpoint left.
    pub fn close(&mut self, addr: &str, port: u16) -> bool {
        let Some(endpoints) = self.endpoints.get_mut(addr) else {
            return false;
        };
        let before = endpoints.len();
        endpoints.retain_mut(|endpoint| {
            if endpoint.port == port {
                endpoint.close();
                false
            } else {
                true
            }
        });
        let closed = endpoints.len() != before;
        if endpoints.is_empty() {
            self.endpoints.remove(addr);
        }
        closed
    }
}
