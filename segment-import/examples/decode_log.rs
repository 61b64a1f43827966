//! Standalone segment log dump tool
//!
//! Decodes an rlog file without touching a database and prints messages,
//! decoded CAN signals and a summary.
//!
//! Usage:
//!   decode_log <rlog> [--dbc <file.dbc>]... [--limit <count>]
//!
//! Example:
//!   decode_log /data/0000abcd--5f3a2b1c--0/rlog --dbc vehicle.dbc --limit 100

use segment_import::{load_dbc_files, BusDefinitionSet, MessagePayload, RlogReader, TimeSynchronizer};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Default)]
struct DumpStats {
    messages: usize,
    can_frames: usize,
    signals_decoded: usize,
    unique_addresses: HashMap<u32, usize>,
    message_types: HashMap<String, usize>,
}

impl DumpStats {
    fn print_summary(&self) {
        println!("\n=== DECODING SUMMARY ===");
        println!("Messages: {}", self.messages);
        println!("CAN frames: {}", self.can_frames);
        println!("Signals decoded: {}", self.signals_decoded);
        println!("Unique CAN addresses: {}", self.unique_addresses.len());

        if !self.message_types.is_empty() {
            println!("\nMessage types:");
            let mut sorted: Vec<_> = self.message_types.iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(a.1));
            for (name, count) in sorted {
                println!("  {}: {}", name, count);
            }
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let mut log_path: Option<PathBuf> = None;
    let mut dbc_files = Vec::new();
    let mut limit = usize::MAX;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--dbc" => dbc_files.push(PathBuf::from(args.next().ok_or("--dbc needs a file")?)),
            "--limit" => limit = args.next().ok_or("--limit needs a count")?.parse()?,
            _ => log_path = Some(PathBuf::from(arg)),
        }
    }
    let log_path = log_path.ok_or("usage: decode_log <rlog> [--dbc <file.dbc>]... [--limit <count>]")?;

    let mut set = BusDefinitionSet::new();
    let report = load_dbc_files(&mut set, &dbc_files);
    for (path, err) in &report.rejected {
        eprintln!("Skipping {}: {}", path.display(), err);
    }

    let mut reader = RlogReader::open(&log_path)?;
    let mut sync = TimeSynchronizer::new(Duration::from_secs(60));
    let mut stats = DumpStats::default();

    for message in reader.by_ref() {
        let message = message?;
        sync.observe(&message);
        stats.messages += 1;
        *stats
            .message_types
            .entry(message.message_type().to_string())
            .or_insert(0) += 1;

        let verbose = stats.messages <= limit;
        if verbose {
            println!("[{:>14}] {}", message.mono_time_ns, message.message_type());
        }

        if let MessagePayload::Can(frames) = &message.payload {
            for frame in frames {
                stats.can_frames += 1;
                *stats.unique_addresses.entry(frame.address).or_insert(0) += 1;
                for signal in set.decode(frame.address, &frame.data) {
                    stats.signals_decoded += 1;
                    if verbose {
                        println!(
                            "    0x{:03X} {} = {} {}",
                            frame.address,
                            signal.name,
                            signal.value,
                            signal.unit.as_deref().unwrap_or("")
                        );
                    }
                }
            }
        }
    }

    stats.print_summary();

    let clock = sync.finish();
    println!("\nWall clock source: {}", clock.source);
    if let Some(start) = clock.start_mono_ns.and_then(|t| clock.real_time(t)) {
        println!("Segment start: {}", start.to_rfc3339());
    }
    let decode = reader.stats();
    if decode.warnings() > 0 {
        println!(
            "Skipped frames: {} unknown, {} malformed, {} bad CAN entries",
            decode.unknown_frame_types, decode.malformed_payloads, decode.malformed_can_entries
        );
    }
    Ok(())
}
