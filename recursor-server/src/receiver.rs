use crate::prelude::{Message, Transport};
use async_stream::stream;
use futures_core::stream::Stream;
use std::rc::Rc;
use tokio::net::UdpSocket;

/// Largest datagram a peer can hand us.
const WIRE_BUF: usize = 65535;

#[derive(Debug)]
pub struct Receiver {
    socket: Rc<UdpSocket>,
}

impl Receiver {
    pub fn new(socket: Rc<UdpSocket>) -> Self {
        Self { socket }
    }

    async fn receive(&self, wire_buf: &mut [u8]) -> std::io::Result<Message> {
        // The receive buffer is shared across datagrams; the bytes a task
        // keeps must be copied out before the next read lands.
        let (size, address) = self.socket.recv_from(wire_buf).await?;
        Ok(Message {
            address,
            bytes: wire_buf[..size].to_vec(),
            transport: Transport::Udp,
        })
    }

    pub fn into_stream(self) -> impl Stream<Item = Message> {
        stream! {
            let mut wire_buf = vec![0u8; WIRE_BUF];
            loop {
                match self.receive(&mut wire_buf).await {
                    Ok(message) => {
                        tracing::debug!("received message from {:?}", message.address);
                        yield message;
                    }
                    Err(error) => {
                        tracing::debug!("udp receive failed: {error:?}");
                        break;
                    }
                }
            }
        }
    }
}
