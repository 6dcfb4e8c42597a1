use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::codec::FrameReader;
use crate::config::Config;
use crate::connection::keepalive::run_keepalive;
use crate::connection::ping::{IdlePingOp, PingOp};
use crate::connection::shared::Shared;
use crate::connection::write_op::WriteOp;
use crate::connection::{ConnectionState, Role, WriterId};
use crate::error::{Error, Result};
use crate::message::{CloseCode, CloseFrame, Message};
use crate::protocol::OpCode;

/// A WebSocket connection over an async byte stream.
///
/// Every method takes `&self`, so a connection can be shared (for example
/// behind an `Arc`) between a task that reads and any number of tasks that
/// write. Writers are serialized by an internal lock: frames never
/// interleave on the wire, and when the lock is released it is handed to the
/// highest-priority waiting writer (close, ping, idle ping, read-side
/// replies, then application data).
///
/// Dropping the connection aborts every pending writer with
/// [`Error::Aborted`].
///
/// ## Example
///
/// ```rust,ignore
/// use wsmux::{Config, Connection, Message, Role};
///
/// let stream = tokio::net::TcpStream::connect("example.com:80").await?;
/// let conn = Connection::new(stream, Role::Client, Config::default());
///
/// conn.send(Message::text("Hello")).await?;
/// conn.send_ping(b"are you there").await?;
/// while let Some(msg) = conn.recv().await? {
///     println!("Received: {:?}", msg);
/// }
/// ```
pub struct Connection<T> {
    shared: Arc<Shared<WriteHalf<T>>>,
    reader: tokio::sync::Mutex<FrameReader<ReadHalf<T>>>,
}

impl<T> Connection<T> {
    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Check if the connection is in an open state.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Which side of the connection this endpoint is.
    pub fn role(&self) -> Role {
        self.shared.role()
    }

    /// Returns `true` while an idle keep-alive ping is queued or being
    /// written.
    pub fn is_idle_pinging(&self) -> bool {
        self.shared.is_idle_pinging()
    }

    /// The most recent error seen by any writer, including idle pings whose
    /// failures are otherwise not reported.
    pub fn last_error(&self) -> Option<Error> {
        self.shared.last_error()
    }

    /// Like [`last_error`](Self::last_error), but clears it.
    pub fn take_last_error(&self) -> Option<Error> {
        self.shared.take_last_error()
    }
}

impl<T: AsyncRead + AsyncWrite> Connection<T> {
    /// Wrap a stream on which the WebSocket handshake has already completed.
    pub fn new(io: T, role: Role, config: Config) -> Self {
        let (read, write) = tokio::io::split(io);
        Self {
            reader: tokio::sync::Mutex::new(FrameReader::new(read, role, config.clone())),
            shared: Arc::new(Shared::new(write, role, config)),
        }
    }

    async fn write_as(&self, id: WriterId, frame: bytes::Bytes) -> Result<()> {
        WriteOp::new(Arc::downgrade(&self.shared), id).run(frame).await
    }

    /// Send a ping and wait until it has been written.
    ///
    /// ## Errors
    ///
    /// - `Error::ControlFrameTooLarge` if `payload` exceeds 125 bytes
    /// - `Error::AlreadyInProgress` if another ping or pong is already
    ///   waiting for the write lock
    /// - `Error::Aborted` if the connection is dropped or closed meanwhile
    /// - I/O errors from the underlying stream
    pub async fn send_ping(&self, payload: &[u8]) -> Result<()> {
        PingOp::new(&self.shared, OpCode::Ping, payload)?.run().await
    }

    /// Send an unsolicited pong. Shares the ping writer slot.
    ///
    /// ## Errors
    ///
    /// Same as [`send_ping`](Self::send_ping).
    pub async fn send_pong(&self, payload: &[u8]) -> Result<()> {
        PingOp::new(&self.shared, OpCode::Pong, payload)?.run().await
    }

    /// Send an application message under the data writer.
    ///
    /// Control messages are routed to [`send_ping`](Self::send_ping),
    /// [`send_pong`](Self::send_pong) and [`close`](Self::close).
    ///
    /// ## Errors
    ///
    /// - `Error::ConnectionClosed` once a close has started
    /// - `Error::MessageTooLarge` / `Error::FrameTooLarge` from the limits
    /// - `Error::AlreadyInProgress` if another data write is already waiting
    /// - I/O errors from the underlying stream
    pub async fn send(&self, message: Message) -> Result<()> {
        let (opcode, payload) = match &message {
            Message::Text(text) => (OpCode::Text, text.as_bytes()),
            Message::Binary(data) => (OpCode::Binary, data.as_slice()),
            Message::Ping(data) => return self.send_ping(data).await,
            Message::Pong(data) => return self.send_pong(data).await,
            Message::Close(Some(frame)) => return self.close(frame.code, &frame.reason).await,
            Message::Close(None) => return self.close(CloseCode::Normal, "").await,
        };

        if !self.state().can_send() {
            return Err(Error::ConnectionClosed(None));
        }
        let limits = &self.shared.config().limits;
        limits.check_message_size(payload.len())?;
        limits.check_frame_size(payload.len())?;

        let frame = self.shared.encode(opcode, payload);
        self.write_as(WriterId::Write, frame).await
    }

    /// Start the close handshake.
    ///
    /// The close frame jumps ahead of every other queued writer. Does nothing
    /// if a close is already underway. If the close frame could not be
    /// written and the stream is still usable, the connection goes back to
    /// `Open` so the close can be retried.
    ///
    /// ## Errors
    ///
    /// - `Error::InvalidCloseCode` for reserved codes
    /// - `Error::ControlFrameTooLarge` if the reason is too long
    /// - `Error::Aborted` once the connection is closed or failed
    /// - I/O errors from the underlying stream
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        let payload = CloseFrame::new(code, reason).encode()?;
        let frame = self.shared.encode_control(OpCode::Close, &payload)?;
        if !self
            .shared
            .transition(ConnectionState::Open, ConnectionState::Closing)
        {
            return match self.state() {
                ConnectionState::Failed => Err(Error::Aborted),
                _ => Ok(()),
            };
        }
        let result = self.write_as(WriterId::Close, frame).await;
        if result.is_err()
            && self
                .shared
                .transition(ConnectionState::Closing, ConnectionState::Open)
        {
            debug!("close frame not sent, connection reopened");
        }
        result
    }

    /// Receive the next message.
    ///
    /// Pings are answered and a peer close is echoed before the message is
    /// returned; both replies go through the write lock like any other
    /// writer. A reply that fails is logged and left in
    /// [`last_error`](Self::last_error); the received message is still
    /// returned. Returns `Ok(None)` once the stream has ended or the
    /// connection has failed.
    ///
    /// ## Errors
    ///
    /// - Protocol errors (invalid frame, UTF-8 violation, etc.)
    /// - I/O errors from the underlying stream
    pub async fn recv(&self) -> Result<Option<Message>> {
        if !self.state().can_receive() {
            return Ok(None);
        }

        let frame = {
            let mut reader = self.reader.lock().await;
            match reader.read_frame().await {
                Ok(frame) => frame,
                Err(Error::ConnectionClosed(_)) => {
                    self.shared.set_state(ConnectionState::Closed);
                    return Ok(None);
                }
                Err(err) => return Err(err),
            }
        };

        match frame.opcode {
            OpCode::Ping => {
                let pong = self.shared.encode_control(OpCode::Pong, frame.payload())?;
                if let Err(err) = self.write_as(WriterId::Read, pong).await {
                    debug!(error = %err, "pong reply failed");
                }
                Ok(Some(Message::Ping(frame.into_payload())))
            }
            OpCode::Close => {
                let close = CloseFrame::decode(frame.payload());
                if self
                    .shared
                    .transition(ConnectionState::Open, ConnectionState::Closing)
                {
                    let payload = close
                        .as_ref()
                        .and_then(|cf| cf.encode().ok())
                        .unwrap_or_default();
                    let echo = self.shared.encode_control(OpCode::Close, &payload)?;
                    if let Err(err) = self.write_as(WriterId::Read, echo).await {
                        debug!(error = %err, "close echo failed");
                    }
                }
                self.shared.set_state(ConnectionState::Closed);
                Ok(Some(Message::Close(close)))
            }
            _ => Message::from_frame(frame).map(Some),
        }
    }
}

impl<T: AsyncRead + AsyncWrite + Send + 'static> Connection<T> {
    /// Send a ping in the background and report the outcome to `completion`.
    ///
    /// The payload is validated and serialized before this returns;
    /// `completion` is called exactly once, also when validation fails.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn async_send_ping<F>(&self, payload: &[u8], completion: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.spawn_ping(OpCode::Ping, payload, completion)
    }

    /// Background variant of [`send_pong`](Self::send_pong).
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn async_send_pong<F>(&self, payload: &[u8], completion: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.spawn_ping(OpCode::Pong, payload, completion)
    }

    fn spawn_ping<F>(&self, opcode: OpCode, payload: &[u8], completion: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let op = PingOp::new(&self.shared, opcode, payload);
        tokio::spawn(async move {
            let result = match op {
                Ok(op) => op.run().await,
                Err(err) => Err(err),
            };
            completion(result);
        })
    }

    /// Queue an empty keep-alive ping unless one is already in flight.
    ///
    /// Fire-and-forget: failures only show up in
    /// [`last_error`](Self::last_error).
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn trigger_idle_ping(&self) {
        if let Some(op) = IdlePingOp::start(&self.shared) {
            tokio::spawn(op.run());
        }
    }

    /// Spawn the periodic keep-alive task if the config enables one.
    ///
    /// The task ends on its own once the connection closes or is dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn_keepalive(&self) -> Option<JoinHandle<()>> {
        let period = self.shared.config().keepalive_interval()?;
        debug!(?period, "starting keepalive");
        Some(tokio::spawn(run_keepalive(
            Arc::downgrade(&self.shared),
            period,
        )))
    }
}

impl<T> Drop for Connection<T> {
    fn drop(&mut self) {
        self.shared.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Frame;
    use parking_lot::Mutex;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::ReadBuf;
    use tokio::sync::oneshot;

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum WriteMode {
        /// Accept everything at once.
        Ready,
        /// One byte per write, with a pending poll in between.
        Trickle,
        /// Every write fails.
        Fail,
        /// Writes never complete.
        Stall,
    }

    struct MockStream {
        read_data: Cursor<Vec<u8>>,
        written: Arc<Mutex<Vec<u8>>>,
        mode: WriteMode,
        yielded: bool,
    }

    impl MockStream {
        fn new(read: Vec<u8>, mode: WriteMode) -> (Self, Arc<Mutex<Vec<u8>>>) {
            let written = Arc::new(Mutex::new(Vec::new()));
            let stream = Self {
                read_data: Cursor::new(read),
                written: written.clone(),
                mode,
                yielded: false,
            };
            (stream, written)
        }
    }

    impl AsyncRead for MockStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let pos = self.read_data.position() as usize;
            let data = self.read_data.get_ref();
            if pos >= data.len() {
                return Poll::Ready(Ok(()));
            }
            let remaining = &data[pos..];
            let to_copy = std::cmp::min(remaining.len(), buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.read_data.set_position((pos + to_copy) as u64);
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for MockStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            match self.mode {
                WriteMode::Ready => {
                    self.written.lock().extend_from_slice(buf);
                    Poll::Ready(Ok(buf.len()))
                }
                WriteMode::Trickle => {
                    if !self.yielded {
                        self.yielded = true;
                        cx.waker().wake_by_ref();
                        return Poll::Pending;
                    }
                    self.yielded = false;
                    self.written.lock().push(buf[0]);
                    Poll::Ready(Ok(1))
                }
                WriteMode::Fail => Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into())),
                WriteMode::Stall => Poll::Pending,
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn server(mode: WriteMode) -> (Connection<MockStream>, Arc<Mutex<Vec<u8>>>) {
        let (stream, written) = MockStream::new(vec![], mode);
        (Connection::new(stream, Role::Server, Config::default()), written)
    }

    fn frames(bytes: &[u8]) -> Vec<Frame> {
        let mut out = Vec::new();
        let mut rest = bytes;
        while !rest.is_empty() {
            let (frame, used) = Frame::parse(rest).unwrap();
            out.push(frame);
            rest = &rest[used..];
        }
        out
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..10_000 {
            if cond() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition never became true");
    }

    fn hold(conn: &Connection<MockStream>, id: WriterId) {
        assert!(conn.shared.write_lock().try_lock(id));
    }

    fn release(conn: &Connection<MockStream>, id: WriterId) -> Option<WriterId> {
        conn.shared.write_lock().release(id)
    }

    fn is_waiting(conn: &Connection<MockStream>, id: WriterId) -> bool {
        conn.shared.write_lock().is_waiting(id)
    }

    #[test]
    fn test_connection_new() {
        let (conn, _) = server(WriteMode::Ready);
        assert_eq!(conn.state(), ConnectionState::Open);
        assert!(conn.is_open());
        assert_eq!(conn.role(), Role::Server);
        assert!(!conn.is_idle_pinging());
        assert_eq!(conn.last_error(), None);
    }

    #[tokio::test]
    async fn test_send_ping_unlocked() {
        let (conn, written) = server(WriteMode::Ready);
        conn.send_ping(b"hi").await.unwrap();
        assert_eq!(written.lock().as_slice(), &[0x89, 0x02, b'h', b'i']);
        assert_eq!(conn.shared.write_lock().owner(), None);
    }

    #[tokio::test]
    async fn test_send_pong() {
        let (conn, written) = server(WriteMode::Ready);
        conn.send_pong(b"ok").await.unwrap();
        assert_eq!(written.lock().as_slice(), &[0x8a, 0x02, b'o', b'k']);
    }

    #[tokio::test]
    async fn test_ping_payload_limit() {
        let (conn, written) = server(WriteMode::Ready);
        conn.send_ping(&[0u8; 125]).await.unwrap();

        let err = conn.send_ping(&[0u8; 126]).await.unwrap_err();
        assert_eq!(err, Error::ControlFrameTooLarge(126));
        assert_eq!(written.lock().len(), 2 + 125);
        assert_eq!(conn.shared.write_lock().owner(), None);
        assert!(!is_waiting(&conn, WriterId::Ping));
    }

    #[tokio::test]
    async fn test_client_ping_is_masked() {
        let (stream, written) = MockStream::new(vec![], WriteMode::Ready);
        let conn = Connection::new(stream, Role::Client, Config::default());
        conn.send_ping(b"abc").await.unwrap();

        let bytes = written.lock().clone();
        assert_eq!(bytes[1] & 0x80, 0x80);
        let parsed = frames(&bytes);
        assert_eq!(parsed[0].opcode, OpCode::Ping);
        assert_eq!(parsed[0].payload(), b"abc");
    }

    #[tokio::test]
    async fn test_ping_waits_for_held_write_lock() {
        let (conn, written) = server(WriteMode::Ready);
        let conn = Arc::new(conn);
        hold(&conn, WriterId::Write);

        let task = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send_ping(b"p").await }
        });
        wait_until(|| is_waiting(&conn, WriterId::Ping)).await;
        assert!(written.lock().is_empty());

        assert_eq!(release(&conn, WriterId::Write), Some(WriterId::Ping));
        task.await.unwrap().unwrap();
        assert_eq!(written.lock().as_slice(), &[0x89, 0x01, b'p']);
        assert_eq!(conn.shared.write_lock().owner(), None);
    }

    #[tokio::test]
    async fn test_second_ping_while_one_waits() {
        let (conn, _) = server(WriteMode::Ready);
        let conn = Arc::new(conn);
        hold(&conn, WriterId::Write);

        let first = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send_ping(b"1").await }
        });
        wait_until(|| is_waiting(&conn, WriterId::Ping)).await;

        assert_eq!(
            conn.send_pong(b"2").await,
            Err(Error::AlreadyInProgress(WriterId::Ping))
        );

        release(&conn, WriterId::Write);
        first.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_frames_never_interleave() {
        let (conn, written) = server(WriteMode::Trickle);
        let conn = Arc::new(conn);

        let data = tokio::spawn({
            let conn = conn.clone();
            async move {
                for i in 0..20 {
                    conn.send(Message::text(format!("message {i}"))).await.unwrap();
                }
            }
        });
        let pings = tokio::spawn({
            let conn = conn.clone();
            async move {
                for i in 0..20u8 {
                    conn.send_ping(&[i; 7]).await.unwrap();
                }
            }
        });
        let idle = tokio::spawn({
            let conn = conn.clone();
            async move {
                for _ in 0..20 {
                    conn.trigger_idle_ping();
                    tokio::task::yield_now().await;
                }
            }
        });
        data.await.unwrap();
        pings.await.unwrap();
        idle.await.unwrap();
        wait_until(|| !conn.is_idle_pinging()).await;

        let bytes = written.lock().clone();
        let parsed = frames(&bytes);
        let texts: Vec<_> = parsed.iter().filter(|f| f.opcode == OpCode::Text).collect();
        let pings: Vec<_> = parsed
            .iter()
            .filter(|f| f.opcode == OpCode::Ping && !f.payload().is_empty())
            .collect();
        let idle = parsed
            .iter()
            .filter(|f| f.opcode == OpCode::Ping && f.payload().is_empty())
            .count();

        assert_eq!(texts.len(), 20);
        assert_eq!(pings.len(), 20);
        assert!(idle >= 1);
        assert_eq!(parsed.len(), 40 + idle);
        for (i, frame) in texts.iter().enumerate() {
            assert_eq!(frame.payload(), format!("message {i}").as_bytes());
        }
        for (i, frame) in pings.iter().enumerate() {
            assert_eq!(frame.payload(), &[i as u8; 7]);
        }
    }

    #[tokio::test]
    async fn test_idle_ping_suppressed_while_in_flight() {
        let (conn, written) = server(WriteMode::Ready);
        hold(&conn, WriterId::Write);

        conn.trigger_idle_ping();
        conn.trigger_idle_ping();
        wait_until(|| is_waiting(&conn, WriterId::IdlePing)).await;
        assert!(conn.is_idle_pinging());
        conn.trigger_idle_ping();

        assert_eq!(release(&conn, WriterId::Write), Some(WriterId::IdlePing));
        wait_until(|| !conn.is_idle_pinging()).await;
        assert_eq!(written.lock().as_slice(), &[0x89, 0x00]);
        assert_eq!(conn.shared.write_lock().owner(), None);
    }

    #[tokio::test]
    async fn test_close_preempts_ping_after_idle_release() {
        let (conn, written) = server(WriteMode::Ready);
        let conn = Arc::new(conn);
        hold(&conn, WriterId::IdlePing);

        let ping = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send_ping(b"p").await }
        });
        wait_until(|| is_waiting(&conn, WriterId::Ping)).await;
        let close = tokio::spawn({
            let conn = conn.clone();
            async move { conn.close(CloseCode::Normal, "").await }
        });
        wait_until(|| is_waiting(&conn, WriterId::Close)).await;

        assert_eq!(release(&conn, WriterId::IdlePing), Some(WriterId::Close));
        close.await.unwrap().unwrap();
        ping.await.unwrap().unwrap();

        let parsed = frames(&written.lock());
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].opcode, OpCode::Close);
        assert_eq!(parsed[1].opcode, OpCode::Ping);
    }

    #[tokio::test]
    async fn test_hand_off_order() {
        let (conn, written) = server(WriteMode::Ready);
        let conn = Arc::new(conn);
        hold(&conn, WriterId::Write);

        let data = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Message::text("late")).await }
        });
        wait_until(|| is_waiting(&conn, WriterId::Write)).await;
        conn.trigger_idle_ping();
        wait_until(|| is_waiting(&conn, WriterId::IdlePing)).await;
        let ping = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send_ping(b"p").await }
        });
        wait_until(|| is_waiting(&conn, WriterId::Ping)).await;
        let close = tokio::spawn({
            let conn = conn.clone();
            async move { conn.close(CloseCode::GoingAway, "bye").await }
        });
        wait_until(|| is_waiting(&conn, WriterId::Close)).await;

        release(&conn, WriterId::Write);
        close.await.unwrap().unwrap();
        ping.await.unwrap().unwrap();
        assert_eq!(data.await.unwrap(), Err(Error::ConnectionClosed(None)));
        wait_until(|| !conn.is_idle_pinging()).await;

        let parsed = frames(&written.lock());
        let kinds: Vec<_> = parsed.iter().map(|f| (f.opcode, f.payload().len())).collect();
        assert_eq!(
            kinds,
            vec![(OpCode::Close, 5), (OpCode::Ping, 1), (OpCode::Ping, 0)]
        );
        assert_eq!(conn.shared.write_lock().owner(), None);
    }

    #[tokio::test]
    async fn test_explicit_ping_not_blocked_by_idle_ping() {
        let (conn, written) = server(WriteMode::Ready);
        let conn = Arc::new(conn);
        hold(&conn, WriterId::Write);

        conn.trigger_idle_ping();
        wait_until(|| is_waiting(&conn, WriterId::IdlePing)).await;
        let ping = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send_ping(b"explicit").await }
        });
        wait_until(|| is_waiting(&conn, WriterId::Ping)).await;

        release(&conn, WriterId::Write);
        ping.await.unwrap().unwrap();
        wait_until(|| !conn.is_idle_pinging()).await;

        let parsed = frames(&written.lock());
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].payload(), b"explicit");
        assert!(parsed[1].payload().is_empty());
    }

    #[tokio::test]
    async fn test_drop_aborts_waiting_ping() {
        let (conn, written) = server(WriteMode::Ready);
        hold(&conn, WriterId::Write);

        let (tx, rx) = oneshot::channel();
        conn.async_send_ping(b"x", move |result| {
            let _ = tx.send(result);
        });
        wait_until(|| is_waiting(&conn, WriterId::Ping)).await;

        drop(conn);
        assert_eq!(rx.await.unwrap(), Err(Error::Aborted));
        assert!(written.lock().is_empty());
    }

    #[tokio::test]
    async fn test_drop_silences_waiting_idle_ping() {
        let (conn, written) = server(WriteMode::Ready);
        hold(&conn, WriterId::Write);

        conn.trigger_idle_ping();
        wait_until(|| is_waiting(&conn, WriterId::IdlePing)).await;
        drop(conn);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(written.lock().is_empty());
    }

    #[tokio::test]
    async fn test_drop_aborts_in_flight_write() {
        let (conn, _) = server(WriteMode::Stall);
        let (tx, rx) = oneshot::channel();
        conn.async_send_ping(b"x", move |result| {
            let _ = tx.send(result);
        });
        wait_until(|| conn.shared.write_lock().is_locked(WriterId::Ping)).await;

        drop(conn);
        assert_eq!(rx.await.unwrap(), Err(Error::Aborted));
    }

    #[tokio::test]
    async fn test_async_send_reports_validation_failure() {
        let (conn, written) = server(WriteMode::Ready);
        let (tx, rx) = oneshot::channel();
        conn.async_send_pong(&[0u8; 200], move |result| {
            let _ = tx.send(result);
        })
        .await
        .unwrap();
        assert_eq!(rx.await.unwrap(), Err(Error::ControlFrameTooLarge(200)));
        assert!(written.lock().is_empty());
    }

    #[tokio::test]
    async fn test_idle_flag_cleared_on_success() {
        let (conn, written) = server(WriteMode::Ready);
        conn.trigger_idle_ping();
        wait_until(|| !conn.is_idle_pinging()).await;
        assert_eq!(written.lock().as_slice(), &[0x89, 0x00]);

        conn.trigger_idle_ping();
        wait_until(|| written.lock().len() == 4).await;
        wait_until(|| !conn.is_idle_pinging()).await;
    }

    #[tokio::test]
    async fn test_idle_flag_cleared_on_failure() {
        let (conn, _) = server(WriteMode::Fail);
        conn.trigger_idle_ping();
        assert!(conn.is_idle_pinging());
        wait_until(|| !conn.is_idle_pinging()).await;

        let err = conn.take_last_error().unwrap();
        assert!(matches!(
            err,
            Error::Io {
                kind: std::io::ErrorKind::BrokenPipe,
                ..
            }
        ));
        assert_eq!(conn.shared.write_lock().owner(), None);

        conn.trigger_idle_ping();
        assert!(conn.is_idle_pinging());
        wait_until(|| !conn.is_idle_pinging()).await;
        assert!(conn.last_error().is_some());
    }

    #[tokio::test]
    async fn test_transport_failure_releases_lock() {
        let (conn, _) = server(WriteMode::Fail);
        let err = conn.send_ping(b"x").await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(conn.shared.write_lock().owner(), None);
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(conn.last_error(), Some(err));
    }

    #[tokio::test]
    async fn test_dropped_send_mid_frame_fails_connection() {
        let (conn, written) = server(WriteMode::Trickle);
        {
            let send = conn.send(Message::binary(vec![7u8; 64]));
            tokio::pin!(send);
            tokio::select! {
                _ = &mut send => panic!("frame finished before it was dropped"),
                _ = wait_until(|| written.lock().len() >= 4) => {}
            }
        }

        let partial = written.lock().len();
        assert!(partial < 2 + 64);
        assert_eq!(conn.state(), ConnectionState::Failed);
        assert_eq!(conn.shared.write_lock().owner(), None);

        assert_eq!(conn.send_ping(b"p").await, Err(Error::Aborted));
        assert_eq!(conn.close(CloseCode::Normal, "").await, Err(Error::Aborted));
        assert_eq!(written.lock().len(), partial);
        assert_eq!(conn.recv().await, Ok(None));
    }

    #[tokio::test]
    async fn test_waiting_writer_aborts_after_cut_short_frame() {
        let (conn, written) = server(WriteMode::Trickle);
        let conn = Arc::new(conn);

        let send = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Message::binary(vec![1u8; 200])).await }
        });
        wait_until(|| written.lock().len() >= 2).await;
        let ping = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send_ping(b"p").await }
        });
        wait_until(|| is_waiting(&conn, WriterId::Ping)).await;

        send.abort();
        assert!(send.await.unwrap_err().is_cancelled());
        assert_eq!(ping.await.unwrap(), Err(Error::Aborted));
        assert_eq!(conn.state(), ConnectionState::Failed);
        assert!(written.lock().len() < 2 + 200);
    }

    #[tokio::test]
    async fn test_send_text_message() {
        let (conn, written) = server(WriteMode::Ready);
        conn.send(Message::text("Hello")).await.unwrap();
        let written = written.lock();
        assert_eq!(written[0], 0x81);
        assert_eq!(written[1], 0x05);
        assert_eq!(&written[2..7], b"Hello");
    }

    #[tokio::test]
    async fn test_send_binary_message() {
        let (conn, written) = server(WriteMode::Ready);
        conn.send(Message::binary(vec![1, 2, 3])).await.unwrap();
        assert_eq!(written.lock().as_slice(), &[0x82, 0x03, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_send_control_messages_route_to_writers() {
        let (conn, written) = server(WriteMode::Ready);
        conn.send(Message::Ping(b"a".to_vec())).await.unwrap();
        conn.send(Message::Pong(b"b".to_vec())).await.unwrap();
        conn.send(Message::Close(None)).await.unwrap();

        let parsed = frames(&written.lock());
        assert_eq!(parsed[0].opcode, OpCode::Ping);
        assert_eq!(parsed[1].opcode, OpCode::Pong);
        assert_eq!(parsed[2].opcode, OpCode::Close);
        assert_eq!(parsed[2].payload(), &[0x03, 0xe8]);
        assert_eq!(conn.state(), ConnectionState::Closing);
    }

    #[tokio::test]
    async fn test_send_respects_limits() {
        let (stream, _) = MockStream::new(vec![], WriteMode::Ready);
        let config = Config::default().with_limits(crate::config::Limits::new(4, 4));
        let conn = Connection::new(stream, Role::Server, config);
        assert!(matches!(
            conn.send(Message::binary(vec![0u8; 5])).await,
            Err(Error::MessageTooLarge { size: 5, max: 4 })
        ));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (conn, written) = server(WriteMode::Ready);
        conn.close(CloseCode::Normal, "bye").await.unwrap();
        assert_eq!(written.lock()[0], 0x88);
        assert_eq!(conn.state(), ConnectionState::Closing);

        assert_eq!(
            conn.send(Message::text("test")).await,
            Err(Error::ConnectionClosed(None))
        );
        // A second close is a no-op.
        conn.close(CloseCode::Normal, "again").await.unwrap();
        assert_eq!(frames(&written.lock()).len(), 1);
    }

    #[tokio::test]
    async fn test_close_reopens_after_failed_write() {
        let (conn, _) = server(WriteMode::Fail);
        let err = conn.close(CloseCode::Normal, "").await.unwrap_err();
        assert!(err.is_transport());
        assert!(conn.is_open());

        // The retry reaches the transport again.
        let err = conn.close(CloseCode::Normal, "").await.unwrap_err();
        assert!(err.is_transport());
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn test_close_rejects_reserved_code() {
        let (conn, written) = server(WriteMode::Ready);
        assert_eq!(
            conn.close(CloseCode::Other(1005), "").await,
            Err(Error::InvalidCloseCode(1005))
        );
        assert!(conn.is_open());
        assert!(written.lock().is_empty());
    }

    #[tokio::test]
    async fn test_recv_message() {
        // Masked "Hello": mask [0x37, 0xfa, 0x21, 0x3d]
        let data = vec![
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        let (stream, _) = MockStream::new(data, WriteMode::Ready);
        let conn = Connection::new(stream, Role::Server, Config::default());

        let msg = conn.recv().await.unwrap().unwrap();
        assert!(matches!(msg, Message::Text(s) if s == "Hello"));
    }

    #[tokio::test]
    async fn test_recv_ping_answers_with_pong() {
        let ping_frame = vec![0x89, 0x84, 0x00, 0x00, 0x00, 0x00, b'p', b'i', b'n', b'g'];
        let (stream, written) = MockStream::new(ping_frame, WriteMode::Ready);
        let conn = Connection::new(stream, Role::Server, Config::default());

        let msg = conn.recv().await.unwrap().unwrap();
        assert_eq!(msg, Message::Ping(b"ping".to_vec()));
        assert_eq!(written.lock().as_slice(), &[0x8a, 0x04, b'p', b'i', b'n', b'g']);
    }

    #[tokio::test]
    async fn test_recv_returns_ping_when_pong_fails() {
        let ping_frame = vec![0x89, 0x82, 0x00, 0x00, 0x00, 0x00, b'h', b'i'];
        let (stream, _) = MockStream::new(ping_frame, WriteMode::Fail);
        let conn = Connection::new(stream, Role::Server, Config::default());

        assert_eq!(conn.recv().await, Ok(Some(Message::Ping(b"hi".to_vec()))));
        assert!(conn.last_error().unwrap().is_transport());
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn test_recv_rejects_first_fragment() {
        let data = vec![0x01, 0x82, 0x00, 0x00, 0x00, 0x00, b'h', b'i'];
        let (stream, _) = MockStream::new(data, WriteMode::Ready);
        let conn = Connection::new(stream, Role::Server, Config::default());
        assert!(matches!(
            conn.recv().await,
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_recv_pong_reply_waits_behind_write() {
        let ping_frame = vec![0x89, 0x80, 0x00, 0x00, 0x00, 0x00];
        let (stream, written) = MockStream::new(ping_frame, WriteMode::Ready);
        let conn = Arc::new(Connection::new(stream, Role::Server, Config::default()));
        hold(&conn, WriterId::Write);

        let recv = tokio::spawn({
            let conn = conn.clone();
            async move { conn.recv().await }
        });
        wait_until(|| is_waiting(&conn, WriterId::Read)).await;
        assert!(written.lock().is_empty());

        assert_eq!(release(&conn, WriterId::Write), Some(WriterId::Read));
        assert_eq!(recv.await.unwrap(), Ok(Some(Message::Ping(vec![]))));
        assert_eq!(written.lock().as_slice(), &[0x8a, 0x00]);
    }

    #[tokio::test]
    async fn test_recv_close_echoes_and_closes() {
        let close_frame = vec![0x88, 0x82, 0x00, 0x00, 0x00, 0x00, 0x03, 0xe8];
        let (stream, written) = MockStream::new(close_frame, WriteMode::Ready);
        let conn = Connection::new(stream, Role::Server, Config::default());

        let msg = conn.recv().await.unwrap().unwrap();
        match msg {
            Message::Close(Some(cf)) => assert_eq!(cf.code, CloseCode::Normal),
            other => panic!("Expected close message, got {other:?}"),
        }
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(written.lock().as_slice(), &[0x88, 0x02, 0x03, 0xe8]);

        assert_eq!(conn.recv().await, Ok(None));
        assert_eq!(conn.send_ping(b"late").await, Err(Error::Aborted));
    }

    #[tokio::test]
    async fn test_recv_eof_closes() {
        let (conn, _) = server(WriteMode::Ready);
        assert_eq!(conn.recv().await, Ok(None));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_pings_when_configured() {
        let (stream, written) = MockStream::new(vec![], WriteMode::Ready);
        let config = Config::default().with_idle_ping_interval(Duration::from_secs(10));
        let conn = Connection::new(stream, Role::Server, config);

        let handle = conn.spawn_keepalive().unwrap();
        tokio::time::sleep(Duration::from_secs(25)).await;
        wait_until(|| !conn.is_idle_pinging()).await;
        assert_eq!(written.lock().as_slice(), &[0x89, 0x00, 0x89, 0x00]);

        drop(conn);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_keepalive_disabled_without_interval() {
        let (conn, _) = server(WriteMode::Ready);
        assert!(conn.spawn_keepalive().is_none());
    }
}
