//! Per-session read and write loops.
//!
//! Each accepted socket is split in two. The read loop forwards every chunk
//! it reads to the manager; the write loop drains the session mailbox, asks
//! the responder for a reply and writes it back on the same socket.
//!
//! Any read or write failure is a [`SessionFault`]: the session is
//! unregistered and the socket closed. When the write loop ends, for any
//! reason, the read loop stops too.

use super::manager::ManagerHandle;
use super::registry::SessionId;
use crate::responder::Responder;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Maximum bytes taken from the socket per read.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Socket deadlines for a session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionSettings {
    /// Close the session after this long without inbound bytes.
    pub idle_timeout: Option<Duration>,
    /// Close the session if a reply cannot be written within this long.
    pub write_timeout: Option<Duration>,
}

/// Why a session ended.
#[derive(Debug)]
pub enum SessionFault {
    /// Peer closed the connection.
    Closed,
    Read(std::io::Error),
    IdleTimeout,
    Write(std::io::Error),
    WriteTimeout,
}

impl std::fmt::Display for SessionFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionFault::Closed => write!(f, "connection closed by peer"),
            SessionFault::Read(e) => write!(f, "read error: {e}"),
            SessionFault::IdleTimeout => write!(f, "idle timeout"),
            SessionFault::Write(e) => write!(f, "write error: {e}"),
            SessionFault::WriteTimeout => write!(f, "write timeout"),
        }
    }
}

impl std::error::Error for SessionFault {}

/// A registered session and everything its loops need.
///
/// `done` is held by both tasks; it is dropped once the session has fully
/// ended, which lets the server wait for sessions to drain.
pub struct Session {
    pub id: SessionId,
    pub mailbox: mpsc::Receiver<Bytes>,
    pub manager: ManagerHandle,
    pub responder: Arc<Responder>,
    pub settings: SessionSettings,
    pub done: mpsc::Sender<()>,
}

impl Session {
    /// Spawn the read and write loops over the two socket halves.
    pub fn spawn<R, W>(self, reader: R, writer: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Session {
            id,
            mailbox,
            manager,
            responder,
            settings,
            done,
        } = self;
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let read_manager = manager.clone();
        let read_done = done.clone();
        tokio::spawn(async move {
            run_reader(id, reader, read_manager, settings.idle_timeout, stop_rx).await;
            drop(read_done);
        });

        tokio::spawn(async move {
            run_writer(id, writer, mailbox, manager, responder, settings.write_timeout).await;
            // Dropping the sender stops the read loop
            drop(stop_tx);
            drop(done);
        });
    }
}

/// Read loop wrapper: unregisters the session on fault.
pub async fn run_reader<R>(
    id: SessionId,
    reader: R,
    manager: ManagerHandle,
    idle_timeout: Option<Duration>,
    mut stop: oneshot::Receiver<()>,
) where
    R: AsyncRead + Unpin,
{
    tokio::select! {
        result = read_loop(id, reader, &manager, idle_timeout) => {
            if let Err(fault) = result {
                debug!(session = %id, reason = %fault, "Session read side ended");
            }
            manager.unregister(id).await;
        }
        _ = &mut stop => {
            trace!(session = %id, "Write side ended, stopping reader");
        }
    }
}

/// Write loop wrapper: unregisters the session on fault.
pub async fn run_writer<W>(
    id: SessionId,
    writer: W,
    mailbox: mpsc::Receiver<Bytes>,
    manager: ManagerHandle,
    responder: Arc<Responder>,
    write_timeout: Option<Duration>,
) where
    W: AsyncWrite + Unpin,
{
    if let Err(fault) = write_loop(id, writer, mailbox, &responder, write_timeout).await {
        debug!(session = %id, reason = %fault, "Session write side ended");
        manager.unregister(id).await;
    }
}

/// Forward socket reads to the manager until the socket fails.
///
/// Always ends in a fault; a clean close is [`SessionFault::Closed`].
async fn read_loop<R>(
    id: SessionId,
    mut reader: R,
    manager: &ManagerHandle,
    idle_timeout: Option<Duration>,
) -> Result<(), SessionFault>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        let n = match idle_timeout {
            Some(limit) => tokio::time::timeout(limit, reader.read(&mut chunk))
                .await
                .map_err(|_| SessionFault::IdleTimeout)?,
            None => reader.read(&mut chunk).await,
        }
        .map_err(SessionFault::Read)?;

        if n == 0 {
            return Err(SessionFault::Closed);
        }

        trace!(session = %id, bytes = n, "RECEIVED");
        manager
            .dispatch(id, Bytes::copy_from_slice(&chunk[..n]))
            .await;
    }
}

/// Reply to each mailbox message until the mailbox closes.
///
/// A closed mailbox means the session was removed; the socket is shut down
/// and the loop ends cleanly.
async fn write_loop<W>(
    id: SessionId,
    mut writer: W,
    mut mailbox: mpsc::Receiver<Bytes>,
    responder: &Responder,
    write_timeout: Option<Duration>,
) -> Result<(), SessionFault>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = mailbox.recv().await {
        let response = responder.respond(&message);
        debug!(session = %id, reply = ?response.reply, bytes = response.frame.len(), "Sending reply");

        // An empty frame is still written, it is a no-op on the wire
        let write = async {
            writer.write_all(&response.frame).await?;
            writer.flush().await
        };
        match write_timeout {
            Some(limit) => tokio::time::timeout(limit, write)
                .await
                .map_err(|_| SessionFault::WriteTimeout)?,
            None => write.await,
        }
        .map_err(SessionFault::Write)?;
    }

    trace!(session = %id, "Mailbox closed");
    let _ = writer.shutdown().await;
    Ok(())
}
