//! The composed write operation every writer runs.
//!
//! acquire lock -> stop check -> one transport write -> stop check ->
//! release and resume the next waiter. The release step runs exactly once,
//! whether the operation completes, fails or is dropped mid-flight. Dropping
//! it during the transport write leaves a partial frame behind, so that
//! fails the connection before the lock is passed on.

use std::sync::Weak;

use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio::sync::oneshot;
use tracing::trace;

use crate::connection::WriterId;
use crate::connection::shared::Shared;
use crate::error::{Error, Result};

pub(crate) struct WriteOp<W> {
    shared: Weak<Shared<W>>,
    id: WriterId,
    waiter: Option<oneshot::Receiver<()>>,
    owns: bool,
    writing: bool,
    finished: bool,
}

impl<W> WriteOp<W> {
    pub(crate) fn new(shared: Weak<Shared<W>>, id: WriterId) -> Self {
        Self {
            shared,
            id,
            waiter: None,
            owns: false,
            writing: false,
            finished: false,
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let owns = std::mem::take(&mut self.owns);
        if let Some(shared) = self.shared.upgrade() {
            if std::mem::take(&mut self.writing) {
                shared.fail(self.id);
            }
            shared.finish_writer(self.id, owns, self.waiter.take());
        }
    }
}

impl<W: AsyncWrite + Unpin> WriteOp<W> {
    /// Write `frame` once the lock is held.
    ///
    /// # Errors
    ///
    /// - `Error::Aborted` if the connection went away or was torn down
    /// - `Error::ConnectionClosed` for user writes after a close started
    /// - `Error::AlreadyInProgress` if this writer's slot is taken
    /// - transport errors, unchanged
    pub(crate) async fn run(mut self, frame: Bytes) -> Result<()> {
        let result = match self.acquire().await {
            Ok(()) => self.transmit(&frame).await,
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            if let Some(shared) = self.shared.upgrade() {
                shared.record_error(self.id, err);
            }
        }
        self.finish();
        result
    }

    async fn acquire(&mut self) -> Result<()> {
        let shared = self.shared.upgrade().ok_or(Error::Aborted)?;
        let parked = shared.write_lock().try_lock_or_enqueue(self.id)?;
        drop(shared);

        let Some(rx) = parked else {
            self.owns = true;
            trace!(writer = %self.id, "write lock acquired");
            return Ok(());
        };

        trace!(writer = %self.id, "waiting for write lock");
        let waiter = self.waiter.insert(rx);
        waiter.await.map_err(|_| Error::Aborted)?;
        self.waiter = None;
        self.owns = true;

        let shared = self.shared.upgrade().ok_or(Error::Aborted)?;
        shared.write_lock().lock(self.id);
        drop(shared);
        trace!(writer = %self.id, "write lock handed over");

        tokio::task::yield_now().await;
        Ok(())
    }

    async fn transmit(&mut self, frame: &Bytes) -> Result<()> {
        let shared = self.shared.upgrade().ok_or(Error::Aborted)?;
        shared.check_stop_now(self.id)?;
        self.writing = true;
        let written = shared.write_frame(self.id, frame).await;
        self.writing = false;
        written?;
        shared.check_stop_now(self.id)
    }
}

impl<W> Drop for WriteOp<W> {
    fn drop(&mut self) {
        self.finish();
    }
}
