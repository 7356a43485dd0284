use crate::frame::{Feed, StreamAssembly};
use crate::prelude::{Message, Transport};
use crate::Handler;
use std::rc::Rc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Hard ceiling on an assembled DNS/TCP message.
const MAX_MESSAGE: usize = 65535;
const READ_CHUNK: usize = 4096;

pub struct TcpServer {
    listener: TcpListener,
}

impl TcpServer {
    pub fn new(listener: TcpListener) -> Self {
        Self { listener }
    }

    pub fn bind_sync(address: std::net::SocketAddr) -> std::io::Result<Self> {
        Ok(Self::new(crate::network::bind_tcp(address)?))
    }

    pub async fn run<H: Handler + 'static>(self, handler: Rc<H>) -> std::io::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            if let Err(error) = stream.set_nodelay(true) {
                tracing::debug!("couldn't set nodelay on {peer:?}: {error:?}");
            }
            let handler = handler.clone();
            tokio::task::spawn_local(async move {
                if let Err(error) = serve_stream(stream, handler).await {
                    tracing::debug!("tcp connection {peer:?} closed: {error:?}");
                }
            });
        }
    }
}

/// Drive one accepted connection. Reads stop while a message resolves:
/// the answer is written back before the next chunk is pulled, so a slow
/// or flooding peer cannot pile up unanswered queries.
async fn serve_stream<H: Handler>(
    mut stream: TcpStream,
    handler: Rc<H>,
) -> std::io::Result<()> {
    let peer = stream.peer_addr()?;
    let mut assembly = StreamAssembly::new(MAX_MESSAGE);
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let nread = stream.read(&mut chunk).await?;
        if nread == 0 {
            // Peer closed; a message mid-assembly is abandoned with it.
            return Ok(());
        }

        let bytes = match assembly.feed(&chunk[..nread]) {
            Ok(Feed::Complete(view)) => view.to_vec(),
            Ok(Feed::Assembled(bytes)) => bytes,
            Ok(Feed::Pending(_)) => continue,
            Err(error) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    error,
                ));
            }
        };

        let message = Message {
            address: peer,
            bytes,
            transport: Transport::Tcp,
        };
        if let Some(answer) = handler.handle(message).await {
            let size = (answer.bytes.len() as u16).to_be_bytes();
            stream.write_all(&size).await?;
            stream.write_all(&answer.bytes).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TcpServer;
    use crate::prelude::Message;
    use crate::Handler;
    use std::rc::Rc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Echo;

    #[async_trait::async_trait(?Send)]
    impl Handler for Echo {
        async fn handle(&self, message: Message) -> Option<Message> {
            Some(message)
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn should_answer_fragmented_message() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                let address = listener.local_addr().unwrap();
                tokio::task::spawn_local(async move {
                    let _ = TcpServer::new(listener).run(Rc::new(Echo)).await;
                });

                let mut client = tokio::net::TcpStream::connect(address).await.unwrap();
                // Length prefix first, then the payload in three segments.
                client.write_all(&[0x00, 0x06]).await.unwrap();
                for part in [b"ab".as_slice(), b"cd".as_slice(), b"ef".as_slice()] {
                    client.write_all(part).await.unwrap();
                }

                let mut prefix = [0u8; 2];
                client.read_exact(&mut prefix).await.unwrap();
                assert_eq!(u16::from_be_bytes(prefix), 6);
                let mut body = [0u8; 6];
                client.read_exact(&mut body).await.unwrap();
                assert_eq!(&body, b"abcdef");
            })
            .await;
    }
}
