use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A single echo reply, original or duplicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketEvent {
    pub byte_count: usize,
    pub source: IpAddr,
    pub sequence: u16,
    pub rtt: Duration,
    pub ttl: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunStatistics {
    pub address: String,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub duplicates_received: u64,
    pub packet_loss_percent: f64,
    pub min_rtt: Duration,
    pub avg_rtt: Duration,
    pub max_rtt: Duration,
    pub std_dev_rtt: Duration,
}

impl RunStatistics {
    pub fn empty(address: impl Into<String>) -> Self {
        RunStatistics {
            address: address.into(),
            packets_sent: 0,
            packets_received: 0,
            duplicates_received: 0,
            packet_loss_percent: 0.0,
            min_rtt: Duration::ZERO,
            avg_rtt: Duration::ZERO,
            max_rtt: Duration::ZERO,
            std_dev_rtt: Duration::ZERO,
        }
    }
}

#[derive(Debug, Error)]
#[error("cannot resolve host {host:?}: {source}")]
pub struct HostResolutionError {
    pub host: String,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("cannot open {mode} ICMP socket: {source}")]
    Socket {
        mode: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("sendto: {0}")]
    Send(#[source] io::Error),
    #[error("recvmsg: {0}")]
    Receive(#[source] io::Error),
}

/// Callbacks invoked by an [`Engine`] in the order packets are processed.
pub trait EventHandler {
    fn on_recv(&mut self, packet: &PacketEvent);
    fn on_duplicate(&mut self, packet: &PacketEvent);
    fn on_finish(&mut self, stats: &RunStatistics);
}

/// Cancellation token shared between the run loop and whoever wants it
/// to stop (the Ctrl-C handler).
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

pub trait Engine {
    /// Blocks until the run finishes, is stopped, or fails.
    fn run(&mut self, handler: &mut dyn EventHandler) -> Result<RunStatistics, RunError>;

    fn stop_handle(&self) -> StopHandle;

    /// Statistics accumulated so far; zeroed if the run never started.
    fn statistics(&self) -> RunStatistics;

    /// Host as given on the command line.
    fn addr(&self) -> &str;

    fn ip_addr(&self) -> IpAddr;
}
