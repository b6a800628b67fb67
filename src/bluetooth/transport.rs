// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Message transport over one connected socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{Message, CHUNK_SIZE};
use super::radio::BoxedSocket;
use crate::error::ChatError;

/// Messages buffered between the read task and the stream consumer.
const INBOX_CAPACITY: usize = 16;

/// Stream of messages decoded from the peer.
pub type MessageStream = BoxStream<'static, Result<Message, ChatError>>;

/// Reads and writes chat messages on a connected socket.
///
/// The session does not decide when the socket goes away: the connection
/// manager closes it through [`close`](TransportSession::close) or by
/// dropping the last reference. Closing releases both halves of the
/// socket even while a receive stream is still held.
pub struct TransportSession {
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedSocket>>>,
    reader: parking_lot::Mutex<Option<ReadHalf<BoxedSocket>>>,
    connected: Arc<AtomicBool>,
    peer_name: String,
    chunk_size: usize,
    cancel: CancellationToken,
}

impl TransportSession {
    /// Create a session with the default read chunk size.
    pub fn new(socket: BoxedSocket, peer_name: impl Into<String>) -> Self {
        Self::with_chunk_size(socket, peer_name, CHUNK_SIZE, CancellationToken::new())
    }

    /// Create a session whose reads stop when `cancel` fires.
    pub fn with_chunk_size(
        socket: BoxedSocket,
        peer_name: impl Into<String>,
        chunk_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        let connected = socket.is_connected();
        let (reader, writer) = tokio::io::split(socket);

        Self {
            writer: tokio::sync::Mutex::new(Some(writer)),
            reader: parking_lot::Mutex::new(Some(reader)),
            connected: Arc::new(AtomicBool::new(connected)),
            peer_name: peer_name.into(),
            chunk_size: chunk_size.max(1),
            cancel,
        }
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    /// Write `bytes` once and flush.
    ///
    /// Returns false on I/O failure; the session stays open either way.
    pub async fn send(&self, bytes: &[u8]) -> bool {
        if self.cancel.is_cancelled() {
            debug!("Send on closed transport dropped");
            return false;
        }

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            debug!("Send on closed transport dropped");
            return false;
        };

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = async {
                writer.write_all(bytes).await?;
                writer.flush().await
            } => Some(result),
        };
        let Some(result) = outcome else {
            // close() could not take the writer while this send held it
            guard.take();
            debug!("Send to {} interrupted by close", self.peer_name);
            return false;
        };

        match result {
            Ok(()) => {
                debug!("Sent {} bytes to {}", bytes.len(), self.peer_name);
                true
            }
            Err(e) => {
                warn!("Send to {} failed: {}", self.peer_name, e);
                false
            }
        }
    }

    /// Messages from the peer, one per socket read.
    ///
    /// Reads run on a task owned by the session, so closing the session
    /// releases the socket whether or not the stream is being polled.
    /// Ends with `TransferFailed` when the read fails or the peer hangs
    /// up, and ends quietly when the session is closed. Only the first
    /// call gets the socket; later calls yield `ReceiverTaken`.
    pub fn receive_stream(&self) -> MessageStream {
        if !self.is_connected() {
            return stream::once(async { Err(ChatError::NotConnected) }).boxed();
        }
        let Some(reader) = self.reader.lock().take() else {
            return stream::once(async { Err(ChatError::ReceiverTaken) }).boxed();
        };

        info!("Listening for messages from {}", self.peer_name);
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        tokio::spawn(
            ReadLoop {
                reader,
                buf: vec![0u8; self.chunk_size],
                sender: self.peer_name.clone(),
                connected: self.connected.clone(),
                cancel: self.cancel.clone(),
                tx,
            }
            .run(),
        );

        stream::unfold(rx, |mut rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        })
        .boxed()
    }

    /// Stop reads and release both halves of the socket.
    pub fn close(&self) {
        self.cancel.cancel();
        self.connected.store(false, Ordering::Release);
        self.reader.lock().take();
        // A send in progress holds the lock and drops the writer itself.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Read side of the socket, owned by the receive task.
struct ReadLoop {
    reader: ReadHalf<BoxedSocket>,
    buf: Vec<u8>,
    sender: String,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    tx: mpsc::Sender<Result<Message, ChatError>>,
}

impl ReadLoop {
    async fn run(mut self) {
        loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Receive loop for {} cancelled", self.sender);
                    return;
                }
                read = self.reader.read(&mut self.buf) => read,
            };

            let (item, done) = match read {
                Ok(0) => {
                    info!("Connection closed by {}", self.sender);
                    self.connected.store(false, Ordering::Release);
                    let err = ChatError::TransferFailed("connection closed by peer".into());
                    (Err(err), true)
                }
                Ok(n) => {
                    debug!("Received {} bytes from {}", n, self.sender);
                    (Ok(Message::from_chunk(&self.buf[..n], self.sender.clone())), false)
                }
                Err(e) => {
                    warn!("Read from {} failed: {}", self.sender, e);
                    self.connected.store(false, Ordering::Release);
                    (Err(ChatError::transfer(&e)), true)
                }
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                sent = self.tx.send(item) => {
                    if sent.is_err() {
                        debug!("Receive stream from {} dropped", self.sender);
                        return;
                    }
                }
            }
            if done {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::memory::MemorySocket;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn session(socket: MemorySocket) -> TransportSession {
        TransportSession::new(Box::new(socket), "peer")
    }

    #[tokio::test]
    async fn test_send_writes_once_in_order() {
        let (local, mut remote) = MemorySocket::pair();
        let transport = session(local);

        assert!(transport.send(b"hello").await);
        assert!(transport.send(b" world").await);
        drop(transport);

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello world");
    }

    #[tokio::test]
    async fn test_send_after_peer_drop_returns_false() {
        let (local, remote) = MemorySocket::pair();
        let transport = session(local);
        drop(remote);

        assert!(!transport.send(b"anyone there?").await);
    }

    #[tokio::test]
    async fn test_each_read_is_one_message() {
        let (local, mut remote) = MemorySocket::pair();
        let transport = session(local);
        let mut messages = transport.receive_stream();

        remote.write_all(b"hi").await.unwrap();
        let msg = messages.next().await.unwrap().unwrap();
        assert_eq!(msg.body, "hi");
        assert_eq!(msg.sender, "peer");
        assert!(!msg.is_local);
    }

    #[tokio::test]
    async fn test_long_body_is_split_at_chunk_size() {
        let (local, mut remote) = MemorySocket::pair();
        let transport = session(local);
        let mut messages = transport.receive_stream();

        let body = "a".repeat(3000);
        remote.write_all(body.as_bytes()).await.unwrap();

        let mut total = 0;
        let mut count = 0;
        while total < body.len() {
            let msg = messages.next().await.unwrap().unwrap();
            assert!(msg.body.len() <= CHUNK_SIZE);
            total += msg.body.len();
            count += 1;
        }
        assert_eq!(total, 3000);
        assert!(count >= 3);
    }

    #[tokio::test]
    async fn test_unconnected_socket_fails_immediately() {
        let transport = session(MemorySocket::unconnected());
        let items: Vec<_> = transport.receive_stream().collect().await;
        assert_eq!(items, vec![Err(ChatError::NotConnected)]);
    }

    #[tokio::test]
    async fn test_peer_drop_ends_with_transfer_failed() {
        let (local, mut remote) = MemorySocket::pair();
        let transport = session(local);
        let mut messages = transport.receive_stream();

        remote.write_all(b"bye").await.unwrap();
        assert_eq!(messages.next().await.unwrap().unwrap().body, "bye");

        drop(remote);
        let err = messages.next().await.unwrap().unwrap_err();
        assert!(matches!(err, ChatError::TransferFailed(_)));
        assert!(messages.next().await.is_none());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_stream_is_single_use() {
        let (local, _remote) = MemorySocket::pair();
        let transport = session(local);
        let _first = transport.receive_stream();

        let items: Vec<_> = transport.receive_stream().collect().await;
        assert_eq!(items, vec![Err(ChatError::ReceiverTaken)]);
    }

    #[tokio::test]
    async fn test_close_ends_stream_quietly() {
        let (local, _remote) = MemorySocket::pair();
        let transport = session(local);
        let mut messages = transport.receive_stream();

        transport.close();
        assert!(messages.next().await.is_none());
        assert!(!transport.send(b"late").await);
    }

    #[tokio::test]
    async fn test_close_releases_socket_with_idle_stream() {
        let (local, mut remote) = MemorySocket::pair();
        let transport = session(local);
        // held but never polled
        let _messages = transport.receive_stream();

        transport.close();

        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(std::time::Duration::from_secs(1), remote.read(&mut buf))
            .await
            .expect("peer never saw the close");
        assert_eq!(read.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_without_stream_releases_socket() {
        let (local, mut remote) = MemorySocket::pair();
        let transport = session(local);

        transport.close();

        let mut buf = [0u8; 8];
        assert_eq!(remote.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dropping_session_stops_read_task() {
        let (local, mut remote) = MemorySocket::pair();
        let transport = session(local);
        let _messages = transport.receive_stream();

        drop(transport);

        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(std::time::Duration::from_secs(1), remote.read(&mut buf))
            .await
            .unwrap();
        assert_eq!(read.unwrap(), 0);
    }
}
