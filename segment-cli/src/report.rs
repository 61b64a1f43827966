//! Human-readable summaries of imports, deletions and store contents

use segment_import::storage::{
    DeletionOutcome, RouteRecord, SegmentRecord, SignalSummary, StoreStats,
};
use segment_import::{CustomSignal, ImportReport, ImportStatus, Result as ImportResult};
use std::fmt::Write;
use std::path::PathBuf;

const RULE: &str = "───────────────────────────────────────────────";

/// One line per import plus a totals footer
pub fn import_summary(results: &[(PathBuf, ImportResult<ImportReport>)]) -> String {
    let mut out = String::new();
    let mut failed = 0;
    let mut warnings = 0;

    let _ = writeln!(out, "{RULE}");
    for (path, result) in results {
        match ImportStatus::of(result) {
            ImportStatus::Success => {}
            ImportStatus::SuccessWithWarnings(n) => warnings += n,
            ImportStatus::Failed(_) => failed += 1,
        }
        match result {
            Ok(report) => {
                let _ = writeln!(
                    out,
                    "✓ {}--{}  id={}  {} messages  {} samples  {} CAN  {} logs  {} frames  clock={}{}",
                    report.identity.route_id,
                    report.identity.segment_number,
                    report.segment_id,
                    report.messages_processed,
                    report.rows.samples,
                    report.rows.can_frames,
                    report.rows.log_messages,
                    report.rows.video_frames,
                    report.clock.source,
                    match report.warnings() {
                        0 => String::new(),
                        n => format!("  ({n} warnings)"),
                    }
                );
            }
            Err(e) => {
                let _ = writeln!(out, "✗ {}: {}", path.display(), e);
            }
        }
    }
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(
        out,
        "{} imported, {} failed, {} warnings",
        results.len() - failed,
        failed,
        warnings
    );
    out
}

pub fn deletion_summary(outcome: &DeletionOutcome) -> String {
    if !outcome.route_existed {
        return format!("Route {} not found; nothing deleted", outcome.route_id);
    }
    format!(
        "Deleted route {}: {} segments, {} samples, {} CAN frames, {} log messages, {} frame timestamps",
        outcome.route_id,
        outcome.segments,
        outcome.removed.samples,
        outcome.removed.can_frames,
        outcome.removed.log_messages,
        outcome.removed.video_frames
    )
}

pub fn routes_table(routes: &[RouteRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<36} {:>8} {:>10}  {:<20} {}", "ROUTE", "SEGMENTS", "EVENTS", "CREATED", "DBC");
    for route in routes {
        let _ = writeln!(
            out,
            "{:<36} {:>8} {:>10}  {:<20} {}",
            route.route_id,
            route.total_segments,
            route.total_events,
            route.created_at.format("%Y-%m-%d %H:%M:%S"),
            route.dbc_file.as_deref().unwrap_or("-")
        );
    }
    out
}

pub fn segments_table(segments: &[SegmentRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:>6} {:>4} {:>10} {:>10}  {:<10} {}", "ID", "NUM", "DURATION", "EVENTS", "CLOCK", "START (UTC)");
    for segment in segments {
        let clock = segment.clock();
        let start = segment
            .start_time_ns
            .and_then(|start| clock.real_time(start))
            .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "{:>6} {:>4} {:>9.1}s {:>10}  {:<10} {}",
            segment.segment_id,
            segment.segment_number,
            segment.duration_secs.unwrap_or(0.0),
            segment.total_events,
            segment.wall_clock_source,
            start
        );
    }
    out
}

pub fn signals_table(signals: &[SignalSummary]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<48} {:>8} {:<8}", "SIGNAL", "SAMPLES", "UNIT");
    for signal in signals {
        let _ = writeln!(
            out,
            "{:<48} {:>8} {:<8}",
            signal.signal_name,
            signal.samples,
            signal.unit.as_deref().unwrap_or("")
        );
    }
    out
}

pub fn custom_signals_table(signals: &[CustomSignal]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<32} {:<8} {}", "CALCULATED SIGNAL", "UNIT", "FORMULA");
    for signal in signals {
        let _ = writeln!(
            out,
            "{:<32} {:<8} {}",
            signal.signal_name,
            signal.unit.as_deref().unwrap_or(""),
            signal.formula
        );
    }
    out
}

pub fn stats_summary(stats: &StoreStats) -> String {
    format!(
        "Routes:               {}\n\
         Segments:             {}\n\
         Samples:              {}\n\
         CAN frames:           {}\n\
         Log messages:         {}\n\
         Frame timestamps:     {}\n\
         Signal definitions:   {} structured, {} CAN\n\
         Calculated signals:   {}",
        stats.routes,
        stats.segments,
        stats.rows.samples,
        stats.rows.can_frames,
        stats.rows.log_messages,
        stats.rows.video_frames,
        stats.structured_definitions,
        stats.can_definitions,
        stats.custom_signals
    )
}
