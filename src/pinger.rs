use crate::args::RunConfig;
use crate::engine::{
    Engine, EventHandler, HostResolutionError, PacketEvent, RunError, RunStatistics, StopHandle,
};
use crate::icmp::{parse_echo_reply, strip_ipv4_header, IcmpType};
use crate::packet::{tracker_of, Packet};
use crate::stats::StatsAccumulator;
use log::{debug, info, trace};
use rand::random;
use socket2::{Domain, MaybeUninitSlice, MsgHdrMut, Protocol, SockAddr, Socket, Type};
use std::collections::{HashMap, HashSet};
use std::io;
use std::mem::{self, MaybeUninit};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

/// Upper bound on how long the run loop goes without checking for a stop.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MIN_WAIT: Duration = Duration::from_millis(1);
/// Room for an IPv4 header with options on raw sockets.
const RECV_HEADROOM: usize = 128;
const CONTROL_LEN: usize = 128;

#[derive(Debug)]
struct Received {
    len: usize,
    source: Option<IpAddr>,
    ttl: Option<u8>,
}

#[derive(Debug)]
enum Reply {
    Original(PacketEvent),
    Duplicate(PacketEvent),
}

/// ICMP echo engine over a raw (privileged) or datagram (unprivileged)
/// socket.
pub struct Pinger {
    addr: String,
    ip: IpAddr,
    count: i64,
    interval: Duration,
    timeout: Duration,
    privileged: bool,
    size: usize,
    identifier: u16,
    tracker: u64,
    stop: StopHandle,
    stats: StatsAccumulator,
    sent_at: HashMap<u16, Instant>,
    seen: HashSet<u16>,
}

impl Pinger {
    pub fn new(host: &str) -> Result<Pinger, HostResolutionError> {
        let ip = resolve(host)?;
        debug!("resolved {} to {}", host, ip);
        Ok(Pinger {
            addr: host.to_string(),
            ip,
            count: -1,
            interval: Duration::from_secs(1),
            timeout: Duration::MAX,
            privileged: false,
            size: 64,
            identifier: random(),
            tracker: random(),
            stop: StopHandle::new(),
            stats: StatsAccumulator::new(),
            sent_at: HashMap::new(),
            seen: HashSet::new(),
        })
    }

    pub fn configure(&mut self, config: &RunConfig) {
        self.count = config.count;
        self.interval = config.interval;
        self.timeout = config.timeout;
        self.privileged = config.privileged;
        self.size = config.size;
    }

    fn family(&self) -> IcmpType {
        IcmpType::for_addr(self.ip)
    }

    fn mode(&self) -> &'static str {
        if self.privileged {
            "privileged"
        } else {
            "unprivileged"
        }
    }

    fn open_socket(&self) -> Result<Socket, RunError> {
        let socket_error = |source| RunError::Socket {
            mode: self.mode(),
            source,
        };
        let (domain, protocol) = match self.family() {
            IcmpType::V4 => (Domain::IPV4, Protocol::ICMPV4),
            IcmpType::V6 => (Domain::IPV6, Protocol::ICMPV6),
        };
        let ty = if self.privileged { Type::RAW } else { Type::DGRAM };
        let socket = Socket::new(domain, ty, Some(protocol)).map_err(socket_error)?;
        enable_ttl_reporting(&socket, self.family()).map_err(socket_error)?;
        debug!("opened {} {:?} socket for {}", self.mode(), domain, self.ip);
        Ok(socket)
    }

    fn finished(&self) -> bool {
        // count == 0 sends nothing, so it is finished before it starts
        self.count >= 0 && self.stats.received() >= self.count.unsigned_abs()
    }

    fn may_send(&self) -> bool {
        self.count < 0 || self.stats.sent() < self.count.unsigned_abs()
    }

    fn reset(&mut self) {
        self.stats = StatsAccumulator::new();
        self.sent_at.clear();
        self.seen.clear();
    }

    fn run_loop(
        &mut self,
        socket: &Socket,
        handler: &mut dyn EventHandler,
    ) -> Result<(), RunError> {
        let mut packet = Packet::new(self.family(), self.identifier, self.tracker, self.size);
        let target = SockAddr::from(SocketAddr::new(self.ip, 0));
        let mut buf = vec![0u8; self.size + RECV_HEADROOM];
        let started = Instant::now();
        let mut next_send = Some(started);

        loop {
            if self.stop.is_stopped() {
                info!("stop requested, ending run");
                return Ok(());
            }
            if self.finished() {
                return Ok(());
            }
            let now = Instant::now();
            let elapsed = now.duration_since(started);
            if elapsed >= self.timeout {
                debug!("timeout of {:?} reached", self.timeout);
                return Ok(());
            }

            if self.may_send() && next_send.is_some_and(|at| now >= at) {
                self.send(socket, &packet, &target)?;
                packet.increment_sequence();
                next_send = now.checked_add(self.interval);
            }

            let mut wait = POLL_INTERVAL.min(self.timeout - elapsed);
            if let Some(at) = next_send.filter(|_| self.may_send()) {
                wait = wait.min(at.saturating_duration_since(Instant::now()));
            }
            socket
                .set_read_timeout(Some(wait.max(MIN_WAIT)))
                .map_err(RunError::Receive)?;

            match recv_with_ttl(socket, self.family(), &mut buf) {
                Ok(received) => {
                    let at = Instant::now();
                    let data = &buf[..received.len.min(buf.len())];
                    match self.classify(data, received.source, received.ttl, at) {
                        Some(Reply::Original(event)) => handler.on_recv(&event),
                        Some(Reply::Duplicate(event)) => handler.on_duplicate(&event),
                        None => {}
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(RunError::Receive(e)),
            }
        }
    }

    fn send(&mut self, socket: &Socket, packet: &Packet, target: &SockAddr) -> Result<(), RunError> {
        let seq = packet.sequence();
        match socket.send_to(&packet.to_bytes(), target) {
            Ok(_) => {
                trace!("sent icmp_seq={} to {}", seq, self.ip);
                self.record_send(seq, Instant::now());
                Ok(())
            }
            Err(e) if is_transient_send_error(&e) => {
                debug!("dropping icmp_seq={}: {}", seq, e);
                self.stats.record_sent();
                Ok(())
            }
            Err(e) => Err(RunError::Send(e)),
        }
    }

    fn record_send(&mut self, seq: u16, at: Instant) {
        // Sequence numbers wrap; a reused number starts fresh.
        self.seen.remove(&seq);
        self.sent_at.insert(seq, at);
        self.stats.record_sent();
    }

    fn classify(
        &mut self,
        data: &[u8],
        source: Option<IpAddr>,
        control_ttl: Option<u8>,
        at: Instant,
    ) -> Option<Reply> {
        let raw_v4 = self.privileged && self.family() == IcmpType::V4;
        let (message, header_ttl) = if raw_v4 {
            let (header, message) = strip_ipv4_header(data)?;
            (message, Some(header.ttl))
        } else {
            (data, None)
        };

        let Some(reply) = parse_echo_reply(message, self.family()) else {
            trace!("ignoring non-echo-reply message of {} bytes", message.len());
            return None;
        };
        // Datagram sockets get their identifier rewritten by the kernel.
        if self.privileged && reply.identifier != self.identifier {
            trace!("ignoring reply for identifier {}", reply.identifier);
            return None;
        }
        if tracker_of(reply.payload) != Some(self.tracker) {
            trace!("ignoring reply with foreign tracker, icmp_seq={}", reply.sequence);
            return None;
        }
        let Some(sent) = self.sent_at.get(&reply.sequence) else {
            trace!("ignoring reply for unsent icmp_seq={}", reply.sequence);
            return None;
        };

        let rtt = at.saturating_duration_since(*sent);
        let event = PacketEvent {
            byte_count: reply.len,
            source: source.unwrap_or(self.ip),
            sequence: reply.sequence,
            rtt,
            ttl: header_ttl.or(control_ttl).unwrap_or(0),
        };
        if self.seen.insert(reply.sequence) {
            self.stats.record_reply(rtt);
            Some(Reply::Original(event))
        } else {
            self.stats.record_duplicate();
            Some(Reply::Duplicate(event))
        }
    }
}

impl Engine for Pinger {
    fn run(&mut self, handler: &mut dyn EventHandler) -> Result<RunStatistics, RunError> {
        self.reset();
        let socket = self.open_socket()?;
        self.run_loop(&socket, handler)?;
        let stats = self.statistics();
        handler.on_finish(&stats);
        Ok(stats)
    }

    fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn statistics(&self) -> RunStatistics {
        self.stats.snapshot(&self.addr)
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    fn ip_addr(&self) -> IpAddr {
        self.ip
    }
}

fn resolve(host: &str) -> Result<IpAddr, HostResolutionError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let failed = |source| HostResolutionError {
        host: host.to_string(),
        source,
    };
    (host, 0)
        .to_socket_addrs()
        .map_err(failed)?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| failed(io::Error::new(io::ErrorKind::NotFound, "no addresses found")))
}

fn is_transient_send_error(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::ENOBUFS)
}

fn enable_ttl_reporting(socket: &Socket, family: IcmpType) -> io::Result<()> {
    if family == IcmpType::V6 {
        return socket.set_recv_hoplimit_v6(true);
    }
    // socket2 has no IP_RECVTTL setter.
    let enable: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_RECVTTL,
            (&enable as *const libc::c_int).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Control message buffer aligned for `cmsghdr`.
#[repr(C, align(8))]
struct ControlBuffer([MaybeUninit<u8>; CONTROL_LEN]);

fn recv_with_ttl(socket: &Socket, family: IcmpType, buf: &mut [u8]) -> io::Result<Received> {
    let unspecified = match family {
        IcmpType::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IcmpType::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let mut from = SockAddr::from(SocketAddr::new(unspecified, 0));
    let mut control = ControlBuffer([MaybeUninit::uninit(); CONTROL_LEN]);
    // SAFETY: `MaybeUninit<u8>` has the layout of `u8` and recvmsg only
    // writes initialised bytes into the buffer.
    let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
    let mut buffers = [MaybeUninitSlice::new(uninit)];

    let mut msg = MsgHdrMut::new()
        .with_addr(&mut from)
        .with_buffers(&mut buffers)
        .with_control(&mut control.0);
    let len = socket.recvmsg(&mut msg, 0)?;
    let control_len = msg.control_len();
    drop(msg);

    let source = from
        .as_socket()
        .map(|addr| addr.ip())
        .filter(|ip| !ip.is_unspecified());
    let ttl = control_ttl(&mut control, control_len);
    Ok(Received { len, source, ttl })
}

/// Finds the `IP_TTL` / `IPV6_HOPLIMIT` value among the first
/// `control_len` bytes of control data filled in by `recvmsg`.
fn control_ttl(control: &mut ControlBuffer, control_len: usize) -> Option<u8> {
    if control_len == 0 {
        return None;
    }
    let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
    hdr.msg_control = control.0.as_mut_ptr().cast();
    hdr.msg_controllen = control_len.min(CONTROL_LEN) as _;

    // SAFETY: the CMSG_* walk stays inside `control_len` bytes, which the
    // kernel initialised, and the buffer is aligned for `cmsghdr`.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&hdr);
        while !cmsg.is_null() {
            let header = &*cmsg;
            let is_ttl = (header.cmsg_level == libc::IPPROTO_IP
                && header.cmsg_type == libc::IP_TTL)
                || (header.cmsg_level == libc::IPPROTO_IPV6
                    && header.cmsg_type == libc::IPV6_HOPLIMIT);
            if is_ttl {
                let value = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::c_int);
                return u8::try_from(value).ok();
            }
            cmsg = libc::CMSG_NXTHDR(&hdr, cmsg);
        }
    }
    None
}
