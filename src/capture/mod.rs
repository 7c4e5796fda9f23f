//! Live packet capture.
//!
//! A [`PacketSource`] yields raw frames; [`spawn_capture`] runs the blocking
//! read loop on a tokio blocking thread, decodes frames, applies the capture
//! filter and feeds [`DecodedPacket`]s into a bounded channel. The channel
//! closes when the capture duration elapses, the source closes, a read fails
//! or the consumer goes away.
//!
//! The `PacketSource` trait mirrors the sender abstraction used elsewhere:
//! a real Linux implementation ([`AfPacketSource`]) and an in-memory mock for
//! unprivileged tests.

pub mod af_packet;
pub mod filter;

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::handshake::{decode_frame, DecodedPacket, LinkType};

pub use af_packet::AfPacketSource;
pub use filter::{CaptureFilter, FilterError};

/// Capacity of the producer → classifier channel.
pub const CHANNEL_CAPACITY: usize = 4096;

/// Longest single wait on the source, so the deadline is checked regularly.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on a capture window; longer requests are clamped.
pub const MAX_CAPTURE_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Error from capture operations.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("insufficient permissions to capture on '{interface}' (requires CAP_NET_RAW)")]
    PermissionDenied { interface: String },

    #[error("network interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("capture socket error: {0}")]
    Socket(String),

    #[error("no capture interface given and none could be detected: {0}")]
    NoInterface(String),

    #[error("live capture requires Linux AF_PACKET sockets")]
    Unsupported,
}

impl CaptureError {
    /// Operator hint for errors that have a known fix.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::PermissionDenied { .. } => Some(
                "packet capture usually requires root privileges; run with sudo or grant \
                 the binary capabilities: sudo setcap cap_net_raw,cap_net_admin=eip ./tcpdiag",
            ),
            Self::InterfaceNotFound(_) => Some("run 'tcpdiag interfaces' to list capture interfaces"),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Source abstraction
// ─────────────────────────────────────────────────────────────────────────────

/// A single captured frame.
#[derive(Debug, Clone)]
pub struct RxFrame {
    /// Raw bytes starting at the link-layer header.
    pub data: Vec<u8>,
}

/// Outcome of one read attempt.
#[derive(Debug)]
pub enum FrameRead {
    /// A frame arrived.
    Frame(RxFrame),
    /// Nothing arrived within the timeout.
    Idle,
    /// The source has no more frames.
    Closed,
}

/// Blocking source of raw link-layer frames.
pub trait PacketSource: Send {
    /// Wait up to `timeout` for the next frame.
    fn poll_frame(&mut self, timeout: Duration) -> Result<FrameRead, CaptureError>;

    /// Framing of frames returned by `poll_frame`.
    fn link_type(&self) -> LinkType;

    /// Interface name, for logging.
    fn interface(&self) -> &str;

    /// Return `self` as `&dyn Any` to enable downcasting in tests.
    fn as_any(&self) -> &dyn Any;
}

/// In-memory source that replays queued frames, then reports `Closed`.
#[derive(Debug)]
pub struct MockPacketSource {
    reads: VecDeque<Result<FrameRead, CaptureError>>,
    link: LinkType,
    interface: String,
    /// Number of `poll_frame` calls made.
    pub polls: usize,
}

impl MockPacketSource {
    pub fn new(link: LinkType) -> Self {
        Self {
            reads: VecDeque::new(),
            link,
            interface: "mock0".to_string(),
            polls: 0,
        }
    }

    /// Queue a frame.
    pub fn queue_frame(&mut self, data: Vec<u8>) {
        self.reads.push_back(Ok(FrameRead::Frame(RxFrame { data })));
    }

    /// Queue an idle read.
    pub fn queue_idle(&mut self) {
        self.reads.push_back(Ok(FrameRead::Idle));
    }

    /// Queue a read error.
    pub fn queue_error(&mut self, err: CaptureError) {
        self.reads.push_back(Err(err));
    }
}

impl PacketSource for MockPacketSource {
    fn poll_frame(&mut self, _timeout: Duration) -> Result<FrameRead, CaptureError> {
        self.polls += 1;
        self.reads.pop_front().unwrap_or(Ok(FrameRead::Closed))
    }

    fn link_type(&self) -> LinkType {
        self.link
    }

    fn interface(&self) -> &str {
        &self.interface
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Producer task
// ─────────────────────────────────────────────────────────────────────────────

/// Why a capture stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStop {
    DurationElapsed,
    SourceClosed,
    ConsumerGone,
}

/// Handle to a running capture.
pub struct CaptureHandle {
    captured: Arc<AtomicU64>,
    task: JoinHandle<Result<CaptureStop, CaptureError>>,
}

impl CaptureHandle {
    /// Packets delivered to the channel so far.
    pub fn packets_captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    /// Wait for the producer to stop.
    pub async fn join(self) -> Result<CaptureStop, CaptureError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(CaptureError::Socket(format!("capture task failed: {e}"))),
        }
    }
}

/// Start capturing from `source` for `duration`.
///
/// Returns the handle and the receiving end of the packet channel. Frames
/// rejected by `filter` are neither counted nor delivered.
pub fn spawn_capture<S>(
    source: S,
    filter: CaptureFilter,
    duration: Duration,
) -> (CaptureHandle, mpsc::Receiver<DecodedPacket>)
where
    S: PacketSource + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let captured = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&captured);
    let deadline = capture_deadline(Instant::now(), duration);

    let task = tokio::task::spawn_blocking(move || {
        capture_loop(source, &filter, deadline, &tx, &counter)
    });

    (CaptureHandle { captured, task }, rx)
}

fn capture_deadline(start: Instant, duration: Duration) -> Instant {
    if duration > MAX_CAPTURE_DURATION {
        tracing::warn!(
            requested_secs = duration.as_secs(),
            max_secs = MAX_CAPTURE_DURATION.as_secs(),
            "capture duration clamped"
        );
    }
    start
        .checked_add(duration.min(MAX_CAPTURE_DURATION))
        .unwrap_or(start)
}

fn capture_loop<S: PacketSource>(
    mut source: S,
    filter: &CaptureFilter,
    deadline: Instant,
    tx: &mpsc::Sender<DecodedPacket>,
    captured: &AtomicU64,
) -> Result<CaptureStop, CaptureError> {
    let link = source.link_type();
    tracing::debug!(interface = %source.interface(), filter = %filter, "capture started");

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(CaptureStop::DurationElapsed);
        }
        let wait = (deadline - now).min(POLL_INTERVAL);

        let frame = match source.poll_frame(wait)? {
            FrameRead::Frame(frame) => frame,
            FrameRead::Idle => continue,
            FrameRead::Closed => return Ok(CaptureStop::SourceClosed),
        };

        let packet = decode_frame(&frame.data, link);
        if !filter.matches(&frame.data, link, &packet) {
            continue;
        }
        if tx.blocking_send(packet).is_err() {
            return Ok(CaptureStop::ConsumerGone);
        }
        captured.fetch_add(1, Ordering::Relaxed);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Interfaces
// ─────────────────────────────────────────────────────────────────────────────

/// A network interface available for capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub rx_bytes: u64,
    pub rx_packets: u64,
}

impl std::fmt::Display for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:<16}{:>14} packets {:>16} bytes",
            self.name, self.rx_packets, self.rx_bytes
        )
    }
}

/// List interfaces from `/proc/net/dev`.
pub fn list_interfaces() -> Result<Vec<Interface>, CaptureError> {
    let content = std::fs::read_to_string("/proc/net/dev")
        .map_err(|e| CaptureError::Socket(format!("cannot read /proc/net/dev: {e}")))?;
    Ok(parse_proc_net_dev(&content))
}

/// Parse `/proc/net/dev` content. The two header lines are skipped.
pub fn parse_proc_net_dev(content: &str) -> Vec<Interface> {
    content
        .lines()
        .skip(2)
        .filter_map(|line| {
            let (name, stats) = line.split_once(':')?;
            let mut fields = stats.split_whitespace();
            let rx_bytes = fields.next()?.parse().ok()?;
            let rx_packets = fields.next()?.parse().ok()?;
            Some(Interface {
                name: name.trim().to_string(),
                rx_bytes,
                rx_packets,
            })
        })
        .collect()
}

/// Detect the default network interface from `/proc/net/route`.
///
/// Prefers the interface holding the default route (destination `00000000`),
/// then the first non-loopback interface.
pub fn detect_default_interface() -> Result<String, CaptureError> {
    let content = std::fs::read_to_string("/proc/net/route")
        .map_err(|e| CaptureError::NoInterface(format!("cannot read /proc/net/route: {e}")))?;
    default_interface_from_route(&content).ok_or_else(|| {
        CaptureError::NoInterface("no usable interface in /proc/net/route".to_string())
    })
}

fn default_interface_from_route(content: &str) -> Option<String> {
    let routes: Vec<(&str, &str)> = content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            Some((cols.next()?, cols.next()?))
        })
        .collect();

    routes
        .iter()
        .find(|(_, destination)| *destination == "00000000")
        .or_else(|| routes.iter().find(|(iface, _)| *iface != "lo"))
        .map(|(iface, _)| iface.to_string())
}
