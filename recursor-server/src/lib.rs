use futures::stream::StreamExt;
use prelude::Message;
use std::rc::Rc;
use tokio::net::UdpSocket;

pub mod frame;
pub mod network;
pub mod prelude;
pub mod receiver;
pub mod sender;
pub mod tcp;

/// How many queries may be in flight per listener. Parallelism comes from
/// overlapping their I/O on one loop, not from threads, so the handler
/// futures are not required to be `Send`.
const CONCURRENT_QUERIES: usize = 64;

#[async_trait::async_trait(?Send)]
pub trait Handler {
    /// Resolve one inbound message into an optional reply. `None` means
    /// drop silently.
    async fn handle(&self, message: Message) -> Option<Message>;
}

pub struct UdpServer {
    socket: UdpSocket,
}

impl UdpServer {
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }

    pub fn bind_sync(address: std::net::SocketAddr) -> std::io::Result<Self> {
        Ok(Self::new(network::bind_udp(address)?))
    }

    pub async fn run<H: Handler>(self, handler: Rc<H>) -> std::io::Result<()> {
        let socket = Rc::new(self.socket);

        let receiver = receiver::Receiver::new(socket.clone());
        let sender = sender::Sender::new(socket);

        let stream = receiver
            .into_stream()
            .map(|item| {
                let handler = handler.clone();
                async move { handler.handle(item).await }
            })
            .buffer_unordered(CONCURRENT_QUERIES);

        tokio::pin!(stream);

        while let Some(item) = stream.next().await {
            let Some(item) = item else { continue };
            if let Err(error) = sender.send(&item).await {
                tracing::error!("couldn't send message to {:?}: {error:?}", item.address);
            }
        }

        Ok(())
    }
}
