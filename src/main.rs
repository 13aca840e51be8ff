mod args;
mod duration;
mod engine;
mod icmp;
mod packet;
mod pinger;
mod report;
mod stats;

use crate::args::{Args, RunConfig, USAGE};
use crate::duration::format_duration;
use crate::engine::{Engine, StopHandle};
use crate::pinger::Pinger;
use crate::report::{write_summary, Reporter};
use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use std::io::{self, Write};
use std::process::ExitCode;

fn main() -> Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let Some(config) = Args::parse().into_config() else {
        print!("{}", USAGE);
        return Ok(ExitCode::SUCCESS);
    };
    debug!("{:?}", config);

    let mut pinger = match Pinger::new(&config.target_host) {
        Ok(pinger) => pinger,
        Err(e) => {
            println!("ERROR: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };
    pinger.configure(&config);
    forward_interrupts(pinger.stop_handle())?;

    let succeeded = execute(&mut pinger, &config, io::stdout()).context("writing to stdout")?;
    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Ctrl-C asks the engine to stop; every further Ctrl-C asks again.
fn forward_interrupts(stop: StopHandle) -> Result<()> {
    ctrlc::set_handler(move || {
        info!("interrupt received");
        stop.stop();
    })
    .context("failed to install Ctrl-C handler")
}

/// Prints the banner, runs the engine to completion and prints whatever
/// statistics exist afterwards. Returns `false` if the run failed.
fn execute<E: Engine, W: Write>(engine: &mut E, config: &RunConfig, out: W) -> io::Result<bool> {
    let mut reporter = Reporter::new(out, config.threshold, config.full_log);
    writeln!(
        reporter.out(),
        "Pingdy -----> {} ({}):",
        engine.addr(),
        engine.ip_addr()
    )?;
    writeln!(
        reporter.out(),
        "To log on threshold : {}",
        format_duration(config.threshold)
    )?;
    reporter.out().flush()?;

    let succeeded = match engine.run(&mut reporter) {
        Ok(_) => true,
        Err(e) => {
            writeln!(reporter.out(), "Failed to ping target host: {}", e)?;
            write_summary(reporter.out(), &engine.statistics())?;
            false
        }
    };

    let stats = engine.statistics();
    writeln!(reporter.out(), "{}", format_duration(stats.max_rtt))?;
    reporter.out().flush()?;
    Ok(succeeded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EventHandler, PacketEvent, RunError, RunStatistics};
    use std::net::{IpAddr, Ipv4Addr};
    use std::thread;
    use std::time::{Duration, Instant};

    enum Script {
        Replies(Vec<(u16, u64, bool)>),
        Fail,
        UntilStopped,
    }

    struct StubEngine {
        script: Script,
        stop: StopHandle,
        stats: RunStatistics,
    }

    impl StubEngine {
        fn new(script: Script) -> Self {
            StubEngine {
                script,
                stop: StopHandle::new(),
                stats: RunStatistics::empty("stub.example"),
            }
        }

        fn packet(seq: u16, rtt_ms: u64) -> PacketEvent {
            PacketEvent {
                byte_count: 72,
                source: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                sequence: seq,
                rtt: Duration::from_millis(rtt_ms),
                ttl: 64,
            }
        }
    }

    impl Engine for StubEngine {
        fn run(&mut self, handler: &mut dyn EventHandler) -> Result<RunStatistics, RunError> {
            match &self.script {
                Script::Replies(replies) => {
                    for &(seq, rtt_ms, duplicate) in replies {
                        let packet = Self::packet(seq, rtt_ms);
                        if duplicate {
                            self.stats.duplicates_received += 1;
                            handler.on_duplicate(&packet);
                        } else {
                            self.stats.packets_sent += 1;
                            self.stats.packets_received += 1;
                            self.stats.max_rtt = self.stats.max_rtt.max(packet.rtt);
                            handler.on_recv(&packet);
                        }
                    }
                }
                Script::Fail => {
                    return Err(RunError::Socket {
                        mode: "privileged",
                        source: io::Error::from(io::ErrorKind::PermissionDenied),
                    })
                }
                Script::UntilStopped => {
                    let deadline = Instant::now() + Duration::from_secs(10);
                    let mut seq = 0;
                    while !self.stop.is_stopped() && Instant::now() < deadline {
                        self.stats.packets_sent += 1;
                        self.stats.packets_received += 1;
                        handler.on_recv(&Self::packet(seq, 1));
                        seq += 1;
                        thread::sleep(Duration::from_millis(5));
                    }
                }
            }
            handler.on_finish(&self.stats);
            Ok(self.stats.clone())
        }

        fn stop_handle(&self) -> StopHandle {
            self.stop.clone()
        }

        fn statistics(&self) -> RunStatistics {
            self.stats.clone()
        }

        fn addr(&self) -> &str {
            "stub.example"
        }

        fn ip_addr(&self) -> IpAddr {
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
        }
    }

    fn config(threshold_ms: u64, full_log: bool) -> RunConfig {
        RunConfig {
            target_host: "stub.example".to_string(),
            count: -1,
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(100_000),
            privileged: false,
            threshold: Duration::from_millis(threshold_ms),
            full_log,
            size: 64,
        }
    }

    fn run(engine: &mut StubEngine, config: &RunConfig) -> (bool, Vec<String>) {
        let mut out = Vec::new();
        let ok = execute(engine, config, &mut out).unwrap();
        let lines = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        (ok, lines)
    }

    #[test]
    fn successful_run_prints_banner_events_summary_and_max() {
        let mut engine = StubEngine::new(Script::Replies(vec![
            (0, 50, false),
            (1, 150, false),
            (1, 160, true),
        ]));
        let (ok, lines) = run(&mut engine, &config(100, false));
        assert!(ok);
        assert_eq!(lines[0], "Pingdy -----> stub.example (10.0.0.1):");
        assert_eq!(lines[1], "To log on threshold : 100ms");
        assert!(lines[2].ends_with("~~ 72 bytes from 10.0.0.1: icmp_seq=1 rtt=150ms ttl=64"));
        assert_eq!(lines[3], "72 bytes from 10.0.0.1: icmp_seq=1 time=160ms ttl=64 (DUP!)");
        assert_eq!(lines[4], "");
        assert_eq!(lines[5], "--- stub.example ping statistics ---");
        assert_eq!(
            lines[6],
            "2 packets transmitted, 2 packets received, 1 duplicates, 0% packet loss"
        );
        assert_eq!(lines[8], "150ms");
        assert_eq!(lines.len(), 9);
    }

    #[test]
    fn full_log_prints_every_original_reply_once() {
        let replies = (0..5).map(|seq| (seq, 10, false)).collect();
        let mut engine = StubEngine::new(Script::Replies(replies));
        let (_, lines) = run(&mut engine, &config(1000, true));
        let logged = lines.iter().filter(|l| l.contains(" time=")).count();
        assert_eq!(logged, 5);
        assert!(!lines.iter().any(|l| l.contains("~~")));
    }

    #[test]
    fn failed_run_reports_error_then_partial_statistics() {
        let mut engine = StubEngine::new(Script::Fail);
        let (ok, lines) = run(&mut engine, &config(1, false));
        assert!(!ok);
        assert!(lines[2].starts_with("Failed to ping target host: cannot open privileged ICMP socket"));
        assert_eq!(lines[4], "--- stub.example ping statistics ---");
        assert_eq!(
            lines[5],
            "0 packets transmitted, 0 packets received, 0 duplicates, 0% packet loss"
        );
        assert_eq!(lines.last().unwrap(), "0s");
        assert_eq!(
            lines.iter().filter(|l| l.contains("ping statistics")).count(),
            1
        );
    }

    #[test]
    fn stop_ends_run_and_summary_still_prints() {
        let mut engine = StubEngine::new(Script::UntilStopped);
        let stop = engine.stop_handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stop.stop();
        });
        let started = Instant::now();
        let (ok, lines) = run(&mut engine, &config(1000, false));
        stopper.join().unwrap();
        assert!(ok);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(lines.iter().any(|l| l.contains("ping statistics")));
        let sent = engine.statistics().packets_sent;
        assert!(sent > 0);
        assert!(lines
            .iter()
            .any(|l| l.starts_with(&format!("{} packets transmitted", sent))));
    }
}
