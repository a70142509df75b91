//! Byte relay between the client and its upstream
//!
//! Two one-directional pumps run side by side. The first pump to see
//! end-of-stream shuts down the write half it was feeding and the relay
//! returns, dropping every half so both connections close even when the
//! other peer never speaks again. An I/O error in either pump does the same.

use crate::connector::DatagramStream;
use crate::error::Error;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// RELAY_BUFFER_SIZE is large enough for any single datagram
const RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// Activity records when bytes last moved in either direction
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

/// Activity implementation block
impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.start + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

/// relay copies bytes both ways between a and b until either side closes,
/// returning the byte counts (a to b, b to a)
pub async fn relay<A, B>(a: A, b: B, idle: Option<Duration>) -> Result<(u64, u64), Error>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let activity = Activity::new();
    let a_to_b = AtomicU64::new(0);
    let b_to_a = AtomicU64::new(0);

    // Halves are dropped on return, closing whatever is still open
    tokio::select! {
        result = pump(a_read, b_write, &activity, &a_to_b) => {
            result.map_err(Error::Relay)?;
            debug!("first side closed");
        }
        result = pump(b_read, a_write, &activity, &b_to_a) => {
            result.map_err(Error::Relay)?;
            debug!("second side closed");
        }
        _ = watchdog(&activity, idle) => return Err(Error::Relay(idle_error())),
    }

    let (a_to_b, b_to_a) = (a_to_b.load(Ordering::Relaxed), b_to_a.load(Ordering::Relaxed));
    debug!("relay finished: {} bytes out, {} bytes in", a_to_b, b_to_a);
    Ok((a_to_b, b_to_a))
}

/// relay_datagrams moves bytes between a client stream and a connected
/// datagram socket, one datagram per client read and per reply
///
/// Empty datagrams are legal and do not end the relay. It ends when the
/// client closes, on an I/O error, or when the idle period elapses.
pub async fn relay_datagrams<A>(
    client: A,
    upstream: DatagramStream,
    idle: Option<Duration>,
) -> Result<(u64, u64), Error>
where
    A: AsyncRead + AsyncWrite + Unpin,
{
    let (client_read, client_write) = tokio::io::split(client);
    let activity = Activity::new();
    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);

    tokio::select! {
        result = datagrams_out(client_read, &upstream, &activity, &sent) => {
            result.map_err(Error::Relay)?;
        }
        result = datagrams_in(&upstream, client_write, &activity, &received) => {
            result.map_err(Error::Relay)?;
        }
        _ = watchdog(&activity, idle) => return Err(Error::Relay(idle_error())),
    }

    let sent = sent.load(Ordering::Relaxed);
    let received = received.load(Ordering::Relaxed);
    debug!("datagram relay finished: {} bytes out, {} bytes in", sent, received);
    Ok((sent, received))
}

// pump moves bytes from reader to writer until end-of-stream, then shuts
// the writer down so its peer sees end-of-stream as well
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    activity: &Activity,
    moved: &AtomicU64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        activity.touch();
        moved.fetch_add(n as u64, Ordering::Relaxed);
    }

    writer.shutdown().await
}

// datagrams_out sends each client read as one datagram until the client
// closes
async fn datagrams_out<R>(
    mut reader: R,
    upstream: &DatagramStream,
    activity: &Activity,
    moved: &AtomicU64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        upstream.send(&buf[..n]).await?;
        activity.touch();
        moved.fetch_add(n as u64, Ordering::Relaxed);
    }
}

// datagrams_in forwards every datagram to the client; a zero-length read is
// an empty datagram, not end-of-stream
async fn datagrams_in<W>(
    upstream: &DatagramStream,
    mut writer: W,
    activity: &Activity,
    moved: &AtomicU64,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        let n = upstream.recv(&mut buf).await?;
        activity.touch();
        if n > 0 {
            writer.write_all(&buf[..n]).await?;
            moved.fetch_add(n as u64, Ordering::Relaxed);
        }
    }
}

// watchdog resolves once nothing has moved for the idle period; without
// one it never resolves
async fn watchdog(activity: &Activity, idle: Option<Duration>) {
    let Some(idle) = idle else {
        return std::future::pending().await;
    };

    loop {
        let deadline = activity.last() + idle;
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(deadline.into()).await;
    }
}

fn idle_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "relay idle timeout")
}
