use crate::duration::format_duration;
use crate::engine::{EventHandler, PacketEvent, RunStatistics};
use chrono::{DateTime, Local};
use log::warn;
use std::ffi::CStr;
use std::io::{self, Write};
use std::mem::MaybeUninit;
use std::time::Duration;

pub(crate) fn local_timestamp() -> String {
    let now = Local::now();
    format_timestamp(&now, zone_abbreviation(&now).as_deref())
}

/// `Mon Jan  2 15:04:05 MST 2006`; the numeric offset stands in when no
/// zone abbreviation is known.
fn format_timestamp(at: &DateTime<Local>, zone: Option<&str>) -> String {
    match zone {
        Some(zone) => format!("{} {} {}", at.format("%a %b %e %H:%M:%S"), zone, at.format("%Y")),
        None => at.format("%a %b %e %H:%M:%S %:z %Y").to_string(),
    }
}

/// Zone abbreviation (`CEST`, `PST`, ...) the C library reports for `at`.
fn zone_abbreviation(at: &DateTime<Local>) -> Option<String> {
    let secs = libc::time_t::try_from(at.timestamp()).ok()?;
    let mut tm = MaybeUninit::<libc::tm>::zeroed();
    // SAFETY: localtime_r fills `tm` on success; `tm_zone` then points at
    // static zone-name storage owned by the C library.
    unsafe {
        if libc::localtime_r(&secs, tm.as_mut_ptr()).is_null() {
            return None;
        }
        let tm = tm.assume_init();
        if tm.tm_zone.is_null() {
            return None;
        }
        let zone = CStr::from_ptr(tm.tm_zone).to_str().ok()?;
        (!zone.is_empty()).then(|| zone.to_string())
    }
}

/// Prints slow replies, optionally every reply, duplicates and the final
/// summary. Lines are written as events arrive; nothing is buffered here.
pub(crate) struct Reporter<W: Write> {
    out: W,
    threshold: Duration,
    full_log: bool,
    clock: fn() -> String,
}

impl<W: Write> Reporter<W> {
    pub(crate) fn new(out: W, threshold: Duration, full_log: bool) -> Self {
        Reporter {
            out,
            threshold,
            full_log,
            clock: local_timestamp,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_clock(mut self, clock: fn() -> String) -> Self {
        self.clock = clock;
        self
    }

    pub(crate) fn out(&mut self) -> &mut W {
        &mut self.out
    }

    fn emit(&mut self, line: std::fmt::Arguments<'_>) {
        if let Err(e) = self.out.write_fmt(line).and_then(|()| self.out.flush()) {
            warn!("failed to write report line: {}", e);
        }
    }
}

impl<W: Write> EventHandler for Reporter<W> {
    fn on_recv(&mut self, packet: &PacketEvent) {
        if packet.rtt > self.threshold {
            let now = (self.clock)();
            self.emit(format_args!(
                "{} ~~ {} bytes from {}: icmp_seq={} rtt={} ttl={}\n",
                now,
                packet.byte_count,
                packet.source,
                packet.sequence,
                format_duration(packet.rtt),
                packet.ttl
            ));
        }
        if self.full_log {
            self.emit(format_args!(
                "{} bytes from {}: icmp_seq={} time={} ttl={}\n",
                packet.byte_count,
                packet.source,
                packet.sequence,
                format_duration(packet.rtt),
                packet.ttl
            ));
        }
    }

    fn on_duplicate(&mut self, packet: &PacketEvent) {
        self.emit(format_args!(
            "{} bytes from {}: icmp_seq={} time={} ttl={} (DUP!)\n",
            packet.byte_count,
            packet.source,
            packet.sequence,
            format_duration(packet.rtt),
            packet.ttl
        ));
    }

    fn on_finish(&mut self, stats: &RunStatistics) {
        if let Err(e) = write_summary(&mut self.out, stats) {
            warn!("failed to write summary: {}", e);
        }
    }
}

pub(crate) fn write_summary<W: Write>(out: &mut W, stats: &RunStatistics) -> io::Result<()> {
    writeln!(out, "\n--- {} ping statistics ---", stats.address)?;
    writeln!(
        out,
        "{} packets transmitted, {} packets received, {} duplicates, {}% packet loss",
        stats.packets_sent, stats.packets_received, stats.duplicates_received, stats.packet_loss_percent
    )?;
    writeln!(
        out,
        "round-trip min/avg/max/stddev = {}/{}/{}/{}",
        format_duration(stats.min_rtt),
        format_duration(stats.avg_rtt),
        format_duration(stats.max_rtt),
        format_duration(stats.std_dev_rtt)
    )?;
    out.flush()
}
