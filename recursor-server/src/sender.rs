use crate::prelude::Message;
use std::rc::Rc;
use tokio::net::UdpSocket;

#[derive(Debug)]
pub struct Sender {
    socket: Rc<UdpSocket>,
}

impl Sender {
    pub fn new(socket: Rc<UdpSocket>) -> Self {
        Self { socket }
    }

    pub async fn send(&self, message: &Message) -> std::io::Result<()> {
        tracing::debug!("sending message to {:?}", message.address);
        self.socket.send_to(&message.bytes, message.address).await?;
        Ok(())
    }
}
