//! Loopback fake server for connection tests.

use parking_lot::Mutex;
use resplink_protocol::{Decoder, ReplyShape};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Replies for one command on connection `n`. `None` drops the connection.
pub(crate) type Handler = dyn Fn(usize, &[String]) -> Option<Vec<u8>> + Send + Sync;

pub(crate) struct FakeServer {
    pub addr: String,
    log: Arc<Mutex<Vec<(usize, Vec<String>)>>>,
}

impl FakeServer {
    pub async fn start(
        handler: impl Fn(usize, &[String]) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let server_log = log.clone();
        tokio::spawn(async move {
            let mut index = 0;
            while let Ok((mut socket, _)) = listener.accept().await {
                let handler = handler.clone();
                let log = server_log.clone();
                let conn = index;
                index += 1;
                tokio::spawn(async move {
                    let mut decoder = Decoder::new();
                    let mut buf = vec![0u8; 4096];
                    loop {
                        let n = match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        decoder.extend(&buf[..n]);
                        let shape = ReplyShape::default();
                        while let Ok(Some(command)) = decoder.decode_next(&shape) {
                            let args: Vec<String> = command
                                .into_value()
                                .into_array()
                                .unwrap_or_default()
                                .iter()
                                .filter_map(|arg| arg.as_str().map(str::to_string))
                                .collect();
                            log.lock().push((conn, args.clone()));
                            let Some(reply) = handler(conn, &args) else {
                                return;
                            };
                            if socket.write_all(&reply).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });

        Self { addr, log }
    }

    /// Commands received so far, as `(connection, args)`.
    pub fn commands(&self) -> Vec<(usize, Vec<String>)> {
        self.log.lock().clone()
    }
}

/// A minimal RESP3 server.
pub(crate) fn redis_like(args: &[String]) -> Vec<u8> {
    let name = args.first().map(|a| a.to_ascii_uppercase()).unwrap_or_default();
    let reply: &[u8] = match name.as_str() {
        "HELLO" => b"%2\r\n+server\r\n+redis\r\n+proto\r\n:3\r\n",
        "PING" => b"+PONG\r\n",
        "SET" | "SELECT" | "AUTH" | "CLIENT" | "WATCH" => b"+OK\r\n",
        "GET" => b"$5\r\nhello\r\n",
        "DEL" | "PUBLISH" => b":1\r\n",
        "MULTI" => b"+OK\r\n",
        "INCR" => b"+QUEUED\r\n",
        "EXEC" => b"*1\r\n:1\r\n",
        "SUBSCRIBE" => {
            let channel = args.get(1).map(String::as_str).unwrap_or_default();
            return format!(
                ">3\r\n$9\r\nsubscribe\r\n${}\r\n{}\r\n:1\r\n>3\r\n$7\r\nmessage\r\n${}\r\n{}\r\n$5\r\nhello\r\n",
                channel.len(),
                channel,
                channel.len(),
                channel
            )
            .into_bytes();
        }
        "UNSUBSCRIBE" => {
            let channel = args.get(1).map(String::as_str).unwrap_or_default();
            return format!(
                ">3\r\n$11\r\nunsubscribe\r\n${}\r\n{}\r\n:0\r\n",
                channel.len(),
                channel
            )
            .into_bytes();
        }
        _ => b"-ERR unknown command\r\n",
    };
    reply.to_vec()
}
