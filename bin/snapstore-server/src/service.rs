//! Connection handling and request dispatch
//!
//! Socket work is fully async: one reader and one writer task per
//! connection, feeding a single event queue. The store itself is owned
//! by the event loop running on the server's entry future, so request
//! handling needs no locking around metadata at all; the per-chunk
//! lock table only arbitrates between snapshot readers and origin
//! writers.
//!
//! Replies to a mutating request are sent only after the store has
//! committed, so a client never acts on state a crash could take back.

use bytes::Bytes;
use snapstore_common::{Error, Owner};
use snapstore_engine::{ClientId, LockTable, Pending, SnapStore};
use snapstore_proto::{ChunkRange, RangeBuilder, Reply, Request, HEADER_SIZE, MAX_BODY};
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

enum Event {
    Connected {
        client: ClientId,
        replies: mpsc::UnboundedSender<Bytes>,
    },
    Request {
        client: ClientId,
        code: u32,
        body: Vec<u8>,
    },
    Oversized {
        client: ClientId,
        code: u32,
        len: usize,
    },
    Disconnected {
        client: ClientId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

struct Conn {
    replies: mpsc::UnboundedSender<Bytes>,
    identity: Option<Owner>,
}

struct Server {
    store: SnapStore,
    locks: LockTable,
    conns: HashMap<ClientId, Conn>,
}

/// Run the server until a shutdown request arrives or the store hits a
/// fatal error. Marks the store busy for the duration.
pub async fn serve(listener: TcpListener, mut store: SnapStore) -> anyhow::Result<()> {
    store.set_busy(true);
    store.commit()?;

    let (events, mut inbox) = mpsc::unbounded_channel();
    let acceptor = tokio::spawn(accept_loop(listener, events));

    let mut server = Server {
        store,
        locks: LockTable::new(),
        conns: HashMap::new(),
    };
    while let Some(event) = inbox.recv().await {
        if server.handle_event(event)? == Flow::Shutdown {
            break;
        }
    }

    acceptor.abort();
    server.store.set_busy(false);
    server.store.commit()?;
    info!("server shut down");
    Ok(())
}

impl Server {
    fn handle_event(&mut self, event: Event) -> anyhow::Result<Flow> {
        match event {
            Event::Connected { client, replies } => {
                self.conns.insert(
                    client,
                    Conn {
                        replies,
                        identity: None,
                    },
                );
                Ok(Flow::Continue)
            }
            Event::Disconnected { client } => {
                info!(client, "client disconnected");
                self.conns.remove(&client);
                let ready = self.locks.release_client(client);
                self.send_ready(ready);
                self.store.commit()?;
                Ok(Flow::Continue)
            }
            Event::Oversized { client, code, len } => {
                warn!(client, code, len, "oversized message body");
                self.send(
                    client,
                    Reply::Error {
                        message: Error::BodyTooLarge(len).to_string(),
                    }
                    .encode(),
                );
                Ok(Flow::Continue)
            }
            Event::Request { client, code, body } => {
                match self.handle_request(client, code, &body) {
                    Ok(flow) => Ok(flow),
                    Err(err) if err.is_fatal() => Err(err.into()),
                    Err(err) => {
                        warn!(client, code, %err, "request failed");
                        self.send(
                            client,
                            Reply::Error {
                                message: err.to_string(),
                            }
                            .encode(),
                        );
                        Ok(Flow::Continue)
                    }
                }
            }
        }
    }

    fn handle_request(&mut self, client: ClientId, code: u32, body: &[u8]) -> Result<Flow, Error> {
        match Request::decode(code, body)? {
            Request::Identify { id, snapshot } => {
                let owner = if snapshot < 0 {
                    Owner::Origin
                } else {
                    let tag = snapshot as u32;
                    let bit = self
                        .store
                        .snapshot_bit(tag)
                        .ok_or(Error::SnapshotNotFound(tag))?;
                    Owner::Snapshot(bit)
                };
                info!(client, id, ?owner, "client identified");
                self.conn_mut(client)?.identity = Some(owner);
                self.send(
                    client,
                    Reply::Identify {
                        chunk_size_bits: self.store.chunk_size_bits(),
                    }
                    .encode(),
                );
                Ok(Flow::Continue)
            }
            Request::QueryWrite { id, ranges } => {
                self.check_ranges(&ranges)?;
                match self.identity(client)? {
                    Owner::Origin => self.origin_write(client, id, &ranges)?,
                    Owner::Snapshot(bit) => self.snapshot_write(client, id, bit, &ranges)?,
                }
                Ok(Flow::Continue)
            }
            Request::QuerySnapshotRead { id, ranges } => {
                self.check_ranges(&ranges)?;
                let Owner::Snapshot(bit) = self.identity(client)? else {
                    return Err(Error::protocol("snapshot read from an origin client"));
                };
                self.snapshot_read(client, id, bit, &ranges)?;
                Ok(Flow::Continue)
            }
            Request::FinishSnapshotRead { id: _, ranges } => {
                for range in &ranges {
                    for chunk in range.chunk..range.chunk + u64::from(range.count) {
                        let ready = self.locks.release(chunk, client);
                        self.send_ready(ready);
                    }
                }
                Ok(Flow::Continue)
            }
            Request::CreateSnapshot { tag } => {
                self.store.create_snapshot(tag)?;
                self.store.commit()?;
                self.send(client, Reply::CreateSnapshot.encode());
                Ok(Flow::Continue)
            }
            Request::DeleteSnapshot { tag } => {
                self.store.delete_snapshot(tag)?;
                self.store.commit()?;
                self.send(client, Reply::DeleteSnapshot.encode());
                Ok(Flow::Continue)
            }
            Request::DumpTree => {
                let dump = self.store.dump_tree()?;
                info!(client, "tree dump requested\n{dump}");
                Ok(Flow::Continue)
            }
            Request::InitializeSnapstore => {
                warn!(client, "reinitializing snapshot store");
                self.store.format()?;
                Ok(Flow::Continue)
            }
            Request::Shutdown => {
                info!(client, "shutdown requested");
                Ok(Flow::Shutdown)
            }
        }
    }

    /// Make every chunk in the request unique to the origin. The reply
    /// echoes the ranges but is withheld until no snapshot client is
    /// still reading any of the copied-out chunks from the origin.
    fn origin_write(&mut self, client: ClientId, id: u32, ranges: &[ChunkRange]) -> Result<(), Error> {
        let pending = Pending::new(client);
        for range in ranges {
            for chunk in range.chunk..range.chunk + u64::from(range.count) {
                let outcome = self.store.make_unique(chunk, None)?;
                if outcome.copied {
                    self.locks.wait_for(chunk, &pending);
                }
            }
        }
        self.store.commit()?;

        let reply = Reply::OriginWrite {
            id,
            ranges: ranges.to_vec(),
        }
        .encode();
        if pending.borrow_mut().release_one() {
            self.send(client, reply);
        } else {
            pending.borrow_mut().set_message(reply);
        }
        Ok(())
    }

    /// Make every chunk unique to the writing snapshot and tell the
    /// client where each one now lives in the store.
    fn snapshot_write(
        &mut self,
        client: ClientId,
        id: u32,
        bit: u8,
        ranges: &[ChunkRange],
    ) -> Result<(), Error> {
        let mut builder = RangeBuilder::new(true);
        for range in ranges {
            for chunk in range.chunk..range.chunk + u64::from(range.count) {
                let outcome = self.store.make_unique(chunk, Some(bit))?;
                builder.push(chunk, Some(outcome.exception));
            }
        }
        self.store.commit()?;

        let groups = builder.finish();
        if groups.is_empty() {
            self.send(
                client,
                Reply::SnapshotWrite {
                    id,
                    ranges: Vec::new(),
                }
                .encode(),
            );
            return Ok(());
        }
        for ranges in groups {
            self.send(client, Reply::SnapshotWrite { id, ranges }.encode());
        }
        Ok(())
    }

    /// Resolve each chunk to either its exception in the store or the
    /// origin itself. Chunks read from the origin are locked until the
    /// client sends a finish message.
    fn snapshot_read(
        &mut self,
        client: ClientId,
        id: u32,
        bit: u8,
        ranges: &[ChunkRange],
    ) -> Result<(), Error> {
        let mut excepted = RangeBuilder::new(true);
        let mut origin = RangeBuilder::new(false);
        for range in ranges {
            for chunk in range.chunk..range.chunk + u64::from(range.count) {
                match self.store.snapshot_exception(chunk, bit)? {
                    Some(exception) => excepted.push(chunk, Some(exception)),
                    None => {
                        self.locks.hold(chunk, client);
                        origin.push(chunk, None);
                    }
                }
            }
        }

        let empty = excepted.is_empty() && origin.is_empty();
        for ranges in excepted.finish() {
            self.send(client, Reply::SnapshotRead { id, ranges }.encode());
        }
        for ranges in origin.finish() {
            self.send(client, Reply::SnapshotReadOrigin { id, ranges }.encode());
        }
        if empty {
            self.send(
                client,
                Reply::SnapshotRead {
                    id,
                    ranges: Vec::new(),
                }
                .encode(),
            );
        }
        Ok(())
    }

    fn conn_mut(&mut self, client: ClientId) -> Result<&mut Conn, Error> {
        self.conns
            .get_mut(&client)
            .ok_or_else(|| Error::protocol("unknown connection"))
    }

    fn identity(&self, client: ClientId) -> Result<Owner, Error> {
        self.conns
            .get(&client)
            .and_then(|c| c.identity)
            .ok_or_else(|| Error::protocol("chunk query before identify"))
    }

    fn send(&self, client: ClientId, message: Bytes) {
        if let Some(conn) = self.conns.get(&client) {
            // a send failure means the connection is going away; its
            // disconnect event does the cleanup
            let _ = conn.replies.send(message);
        }
    }

    fn send_ready(&self, ready: Vec<(ClientId, Bytes)>) {
        for (client, message) in ready {
            self.send(client, message);
        }
    }

    fn check_ranges(&self, ranges: &[ChunkRange]) -> Result<(), Error> {
        let limit = self.store.origin_chunks();
        for range in ranges {
            let end = range
                .chunk
                .checked_add(u64::from(range.count))
                .ok_or_else(|| Error::protocol("chunk range overflows"))?;
            if end > limit {
                return Err(Error::protocol(format!(
                    "chunk range {}..{end} beyond origin of {limit} chunks",
                    range.chunk
                )));
            }
        }
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<Event>) {
    let mut next_client: ClientId = 1;
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let client = next_client;
                next_client += 1;
                info!(client, %peer, "client connected");
                let (replies, outbox) = mpsc::unbounded_channel();
                if events.send(Event::Connected { client, replies }).is_err() {
                    return;
                }
                tokio::spawn(connection(socket, client, events.clone(), outbox));
            }
            Err(err) => {
                error!(%err, "accept failed");
                return;
            }
        }
    }
}

/// Per-connection socket plumbing: a spawned writer draining the reply
/// queue, and a read loop forwarding framed messages to the event
/// loop. Decoding happens centrally so protocol errors get uniform
/// handling.
async fn connection(
    socket: TcpStream,
    client: ClientId,
    events: mpsc::UnboundedSender<Event>,
    mut outbox: mpsc::UnboundedReceiver<Bytes>,
) {
    let (mut reader, mut writer) = socket.into_split();
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            if writer.write_all(&message).await.is_err() {
                break;
            }
        }
    });

    loop {
        let mut header = [0u8; HEADER_SIZE];
        if reader.read_exact(&mut header).await.is_err() {
            break;
        }
        let code = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let len = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
        if len > MAX_BODY {
            // swallow the body so the stream stays framed, then let
            // the dispatcher answer with an error reply
            if drain(&mut reader, len).await.is_err() {
                break;
            }
            if events.send(Event::Oversized { client, code, len }).is_err() {
                break;
            }
            continue;
        }
        let mut body = vec![0u8; len];
        if reader.read_exact(&mut body).await.is_err() {
            break;
        }
        if events.send(Event::Request { client, code, body }).is_err() {
            break;
        }
    }
    let _ = events.send(Event::Disconnected { client });
    writer_task.abort();
}

async fn drain<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    mut remaining: usize,
) -> std::io::Result<()> {
    let mut scratch = [0u8; 512];
    while remaining > 0 {
        let take = remaining.min(scratch.len());
        reader.read_exact(&mut scratch[..take]).await?;
        remaining -= take;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapstore_engine::BlockDevice;
    use snapstore_proto::ExceptionRange;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    const CHUNK: u64 = 4096;

    fn new_store(chunks: u64) -> (NamedTempFile, NamedTempFile, SnapStore) {
        let snap_file = NamedTempFile::new().unwrap();
        let origin_file = NamedTempFile::new().unwrap();
        let snapdev = BlockDevice::create(snap_file.path(), chunks * CHUNK).unwrap();
        let origindev = BlockDevice::create(origin_file.path(), chunks * CHUNK).unwrap();
        let store = SnapStore::create(snapdev, origindev, 12).unwrap();
        (snap_file, origin_file, store)
    }

    async fn send_request(stream: &mut TcpStream, request: Request) {
        stream.write_all(&request.encode()).await.unwrap();
    }

    async fn read_reply(stream: &mut TcpStream) -> Reply {
        let mut header = [0u8; HEADER_SIZE];
        stream.read_exact(&mut header).await.unwrap();
        let code = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let len = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        Reply::decode(code, &body).unwrap()
    }

    #[tokio::test]
    async fn test_origin_write_session() {
        let (_s, _o, store) = new_store(256);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            send_request(&mut stream, Request::Identify { id: 1, snapshot: -1 }).await;
            assert_eq!(
                read_reply(&mut stream).await,
                Reply::Identify { chunk_size_bits: 12 }
            );

            send_request(&mut stream, Request::CreateSnapshot { tag: 3 }).await;
            assert_eq!(read_reply(&mut stream).await, Reply::CreateSnapshot);

            let ranges = vec![ChunkRange { chunk: 10, count: 2 }];
            send_request(
                &mut stream,
                Request::QueryWrite {
                    id: 7,
                    ranges: ranges.clone(),
                },
            )
            .await;
            assert_eq!(
                read_reply(&mut stream).await,
                Reply::OriginWrite { id: 7, ranges }
            );

            send_request(&mut stream, Request::Shutdown).await;
        };

        let (served, ()) = tokio::join!(serve(listener, store), client);
        served.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_read_blocks_origin_write() {
        let (_s, _o, mut store) = new_store(256);
        store.create_snapshot(1).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = async move {
            let mut snap = TcpStream::connect(addr).await.unwrap();
            send_request(&mut snap, Request::Identify { id: 1, snapshot: 1 }).await;
            read_reply(&mut snap).await;

            let ranges = vec![ChunkRange { chunk: 5, count: 1 }];
            send_request(
                &mut snap,
                Request::QuerySnapshotRead {
                    id: 1,
                    ranges: ranges.clone(),
                },
            )
            .await;
            assert_eq!(
                read_reply(&mut snap).await,
                Reply::SnapshotReadOrigin {
                    id: 1,
                    ranges: vec![ExceptionRange {
                        chunk: 5,
                        count: 1,
                        exceptions: vec![],
                    }],
                }
            );

            let mut origin = TcpStream::connect(addr).await.unwrap();
            send_request(&mut origin, Request::Identify { id: 2, snapshot: -1 }).await;
            read_reply(&mut origin).await;
            send_request(
                &mut origin,
                Request::QueryWrite {
                    id: 9,
                    ranges: ranges.clone(),
                },
            )
            .await;

            // withheld while the snapshot still reads chunk 5 from the
            // origin
            let early = tokio::time::timeout(
                Duration::from_millis(100),
                read_reply(&mut origin),
            )
            .await;
            assert!(early.is_err());

            send_request(
                &mut snap,
                Request::FinishSnapshotRead {
                    id: 1,
                    ranges: ranges.clone(),
                },
            )
            .await;
            assert_eq!(
                read_reply(&mut origin).await,
                Reply::OriginWrite {
                    id: 9,
                    ranges: ranges.clone(),
                }
            );

            // chunk 5 is copied out now, so the snapshot reads it from
            // the store
            send_request(
                &mut snap,
                Request::QuerySnapshotRead { id: 2, ranges },
            )
            .await;
            match read_reply(&mut snap).await {
                Reply::SnapshotRead { id, ranges } => {
                    assert_eq!(id, 2);
                    assert_eq!(ranges.len(), 1);
                    assert_eq!(ranges[0].chunk, 5);
                    assert_eq!(ranges[0].exceptions.len(), 1);
                }
                other => panic!("unexpected reply: {other:?}"),
            }

            send_request(&mut origin, Request::Shutdown).await;
        };

        let (served, ()) = tokio::join!(serve(listener, store), client);
        served.unwrap();
    }

    #[tokio::test]
    async fn test_protocol_errors_get_error_replies() {
        let (_s, _o, store) = new_store(256);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();

            // query before identify
            send_request(
                &mut stream,
                Request::QueryWrite {
                    id: 1,
                    ranges: vec![ChunkRange { chunk: 0, count: 1 }],
                },
            )
            .await;
            assert!(matches!(read_reply(&mut stream).await, Reply::Error { .. }));

            // identify against a snapshot that does not exist
            send_request(&mut stream, Request::Identify { id: 1, snapshot: 42 }).await;
            assert!(matches!(read_reply(&mut stream).await, Reply::Error { .. }));

            // range beyond the origin
            send_request(&mut stream, Request::Identify { id: 1, snapshot: -1 }).await;
            read_reply(&mut stream).await;
            send_request(
                &mut stream,
                Request::QueryWrite {
                    id: 2,
                    ranges: vec![ChunkRange {
                        chunk: 100_000,
                        count: 1,
                    }],
                },
            )
            .await;
            assert!(matches!(read_reply(&mut stream).await, Reply::Error { .. }));

            send_request(&mut stream, Request::Shutdown).await;
        };

        let (served, ()) = tokio::join!(serve(listener, store), client);
        served.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_body_keeps_connection_open() {
        let (_s, _o, store) = new_store(256);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();

            let mut frame = Vec::new();
            frame.extend_from_slice(&3u32.to_le_bytes());
            frame.extend_from_slice(&600u32.to_le_bytes());
            frame.extend_from_slice(&[0u8; 600]);
            stream.write_all(&frame).await.unwrap();
            assert!(matches!(read_reply(&mut stream).await, Reply::Error { .. }));

            // the stream is still framed and usable
            send_request(&mut stream, Request::Identify { id: 1, snapshot: -1 }).await;
            assert_eq!(
                read_reply(&mut stream).await,
                Reply::Identify { chunk_size_bits: 12 }
            );

            send_request(&mut stream, Request::Shutdown).await;
        };

        let (served, ()) = tokio::join!(serve(listener, store), client);
        served.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_releases_read_locks() {
        let (_s, _o, mut store) = new_store(256);
        store.create_snapshot(1).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = async move {
            let ranges = vec![ChunkRange { chunk: 8, count: 1 }];
            let mut snap = TcpStream::connect(addr).await.unwrap();
            send_request(&mut snap, Request::Identify { id: 1, snapshot: 1 }).await;
            read_reply(&mut snap).await;
            send_request(
                &mut snap,
                Request::QuerySnapshotRead {
                    id: 1,
                    ranges: ranges.clone(),
                },
            )
            .await;
            read_reply(&mut snap).await;

            let mut origin = TcpStream::connect(addr).await.unwrap();
            send_request(&mut origin, Request::Identify { id: 2, snapshot: -1 }).await;
            read_reply(&mut origin).await;
            send_request(
                &mut origin,
                Request::QueryWrite {
                    id: 3,
                    ranges: ranges.clone(),
                },
            )
            .await;

            // dropping the reader connection releases its lock and
            // frees the write reply
            drop(snap);
            assert_eq!(
                read_reply(&mut origin).await,
                Reply::OriginWrite { id: 3, ranges }
            );

            send_request(&mut origin, Request::Shutdown).await;
        };

        let (served, ()) = tokio::join!(serve(listener, store), client);
        served.unwrap();
    }
}
