use crate::duration::parse_duration;
use clap::Parser;
use log::debug;
use std::time::Duration;

pub(crate) const USAGE: &str = "
Usage:
    ping [-c count] [-i interval] [-t timeout] [-z fail threshold] [-f full log] [--privileged] host
Examples:
	# logs when RTT (round trip time) exceeds 100ms with full log
	$ pingdy -f -i 200ms -z 100ms 192.168.99.20

	# logs when RTT exceeds 187ms for 100 packets
	$ pingdy -c 100 -i 400ms -z 187ms 192.168.99.20

	# logs when RTT exceeds 0.890ms aka 890microseconds
	pingdy -i 200ms -z 0.890ms 192.168.99.20

	# logs when RTT exceeds 2000ms aka 2seconds
	pingdy -i 200ms -z 1000ms 192.168.99.20

	# will try for 3s and quit if no reply
	pingdy -t 3s -i 500ms -z 187ms  192.168.99.20
";

#[derive(Parser, Debug)]
#[command(name = "pingdy", about = "Logs ICMP echo replies whose RTT exceeds a threshold")]
pub(crate) struct Args {
    /// Number of echo requests to send; negative means until interrupted
    #[arg(short, default_value_t = -1, allow_negative_numbers = true)]
    pub(crate) count: i64,
    /// Wait between echo requests
    #[arg(short, value_parser = parse_duration, default_value = "1s")]
    pub(crate) interval: Duration,
    /// Give up after this long regardless of replies
    #[arg(short, value_parser = parse_duration, default_value = "100000s")]
    pub(crate) timeout: Duration,
    /// Log replies whose RTT exceeds this
    #[arg(short = 'z', value_parser = parse_duration, default_value = "1ms")]
    pub(crate) threshold: Duration,
    /// Print every reply, not only the slow ones
    #[arg(short = 'f')]
    pub(crate) full: bool,
    /// Use a raw socket (needs root or CAP_NET_RAW)
    #[arg(long)]
    pub(crate) privileged: bool,
    /// Payload size in bytes
    #[arg(short, default_value_t = 64, value_parser = clap::value_parser!(u16).range(8..=65500))]
    pub(crate) size: u16,
    /// Host to ping; anything after it is ignored, flags included
    #[arg(trailing_var_arg = true, num_args = 1..)]
    pub(crate) destination: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RunConfig {
    pub(crate) target_host: String,
    pub(crate) count: i64,
    pub(crate) interval: Duration,
    pub(crate) timeout: Duration,
    pub(crate) privileged: bool,
    pub(crate) threshold: Duration,
    pub(crate) full_log: bool,
    pub(crate) size: usize,
}

impl Args {
    /// `None` when no host was given and usage should be shown instead.
    pub(crate) fn into_config(self) -> Option<RunConfig> {
        let mut destination = self.destination.into_iter();
        let target_host = destination.next()?;
        let ignored: Vec<String> = destination.collect();
        if !ignored.is_empty() {
            debug!("ignoring arguments after host: {:?}", ignored);
        }
        Some(RunConfig {
            target_host,
            count: self.count,
            interval: self.interval,
            timeout: self.timeout,
            privileged: self.privileged,
            threshold: self.threshold,
            full_log: self.full,
            size: usize::from(self.size),
        })
    }
}
