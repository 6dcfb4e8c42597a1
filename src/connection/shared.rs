//! State shared between a [`Connection`](crate::Connection) and the writers
//! it spawns.
//!
//! Writers only ever hold a `Weak` reference to this; the connection holds
//! the single long-lived `Arc`. Lock bookkeeping goes through a
//! `parking_lot::Mutex` that is never held across an `.await`.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch};
use tracing::{trace, warn};

use crate::codec::FrameEncoder;
use crate::config::Config;
use crate::connection::{ConnectionState, Role, WriteLock, WriterId};
use crate::error::{Error, Result};
use crate::protocol::OpCode;

pub(crate) struct Shared<W> {
    write_lock: Mutex<WriteLock>,
    state: Mutex<ConnectionState>,
    idle_pinging: AtomicBool,
    encoder: Mutex<FrameEncoder>,
    transport: tokio::sync::Mutex<W>,
    config: Config,
    last_error: Mutex<Option<Error>>,
    shutdown: watch::Sender<bool>,
}

impl<W> Shared<W> {
    pub(crate) fn new(transport: W, role: Role, config: Config) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            write_lock: Mutex::new(WriteLock::new()),
            state: Mutex::new(ConnectionState::Open),
            idle_pinging: AtomicBool::new(false),
            encoder: Mutex::new(FrameEncoder::new(role)),
            transport: tokio::sync::Mutex::new(transport),
            config,
            last_error: Mutex::new(None),
            shutdown,
        }
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn role(&self) -> Role {
        self.encoder.lock().role()
    }

    pub(crate) fn write_lock(&self) -> MutexGuard<'_, WriteLock> {
        self.write_lock.lock()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Move from `from` to `to` if the state is still `from`.
    pub(crate) fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        *state = to;
        true
    }

    /// Stop-condition check run before and after every transport write.
    pub(crate) fn check_stop_now(&self, id: WriterId) -> Result<()> {
        self.state.lock().check_stop(id)
    }

    /// Mark the connection closed and abort any in-flight transport write.
    pub(crate) fn teardown(&self) {
        self.set_state(ConnectionState::Closed);
        self.shutdown.send_replace(true);
    }

    /// Mark the stream unusable after a frame was cut short. A connection
    /// that is already closed stays closed.
    pub(crate) fn fail(&self, id: WriterId) {
        let mut state = self.state.lock();
        if *state == ConnectionState::Closed {
            return;
        }
        *state = ConnectionState::Failed;
        warn!(writer = %id, "frame write cut short, connection failed");
    }

    pub(crate) fn encode(&self, opcode: OpCode, payload: &[u8]) -> Bytes {
        self.encoder.lock().encode(opcode, payload)
    }

    pub(crate) fn encode_control(&self, opcode: OpCode, payload: &[u8]) -> Result<Bytes> {
        self.encoder.lock().encode_control(opcode, payload)
    }

    /// Claim the idle-ping flag. Returns `false` if an idle ping is already
    /// in flight.
    pub(crate) fn begin_idle_ping(&self) -> bool {
        self.idle_pinging
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_idle_pinging(&self) -> bool {
        self.idle_pinging.load(Ordering::Acquire)
    }

    pub(crate) fn record_error(&self, id: WriterId, err: &Error) {
        trace!(writer = %id, error = %err, "recording last error");
        *self.last_error.lock() = Some(err.clone());
    }

    pub(crate) fn last_error(&self) -> Option<Error> {
        self.last_error.lock().clone()
    }

    pub(crate) fn take_last_error(&self) -> Option<Error> {
        self.last_error.lock().take()
    }

    /// Release path shared by every writer, on success, failure or
    /// cancellation.
    ///
    /// `waiter` is the writer's parked continuation if it was still waiting
    /// for the lock. If the dispatcher already fired it, the writer owns the
    /// lock and must hand it on.
    pub(crate) fn finish_writer(
        &self,
        id: WriterId,
        owns: bool,
        waiter: Option<oneshot::Receiver<()>>,
    ) {
        let mut lock = self.write_lock();
        let mut owns = owns;
        if let Some(mut waiter) = waiter {
            match waiter.try_recv() {
                Ok(()) => owns = true,
                Err(oneshot::error::TryRecvError::Empty) => lock.cancel(id),
                Err(oneshot::error::TryRecvError::Closed) => {}
            }
        }

        if id == WriterId::IdlePing {
            self.idle_pinging.store(false, Ordering::Release);
        }

        if owns {
            match lock.release(id) {
                Some(next) => trace!(writer = %id, next = %next, "write lock handed off"),
                None => trace!(writer = %id, "write lock released"),
            }
        }
    }
}

impl<W: AsyncWrite + Unpin> Shared<W> {
    /// Write one serialized frame to the transport.
    ///
    /// Must only be called by the current lock owner. Fails with
    /// `Error::Aborted` if the connection is torn down mid-write, and with
    /// a `TimedOut` transport error when the configured write timeout
    /// elapses. If the write fails after part of the frame went out, the
    /// connection is marked [`ConnectionState::Failed`].
    pub(crate) async fn write_frame(&self, id: WriterId, frame: &Bytes) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        let mut written = 0usize;

        let result = {
            let write = async {
                let mut io = self.transport.lock().await;
                while written < frame.len() {
                    match io.write(&frame[written..]).await? {
                        0 => return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into()),
                        n => written += n,
                    }
                }
                io.flush().await?;
                Ok::<(), Error>(())
            };
            let write = async {
                match self.config.timeouts.as_ref() {
                    Some(timeouts) => tokio::time::timeout(timeouts.write, write)
                        .await
                        .unwrap_or_else(|_| Err(std::io::Error::from(std::io::ErrorKind::TimedOut).into())),
                    None => write.await,
                }
            };

            tokio::select! {
                biased;
                _ = shutdown.wait_for(|down| *down) => Err(Error::Aborted),
                result = write => result,
            }
        };

        match &result {
            Ok(()) => trace!(writer = %id, bytes = frame.len(), "frame written"),
            Err(err) => {
                if err.is_transport() {
                    warn!(writer = %id, error = %err, written, "transport write failed");
                }
                if written > 0 {
                    self.fail(id);
                }
            }
        }
        result
    }
}
