//! Offline tap detection over recorded sample files.

use anyhow::Result;
use log::{debug, info};
use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use crate::config::DetectorSettings;
use crate::detector::TapDetector;
use crate::sample::read_samples;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub samples: u64,
    pub events: BTreeMap<String, u64>,
}

/// Runs one detector over every sample in `reader` and writes each tap event
/// to `out`, as text or one JSON object per line. Stops at the first bad line.
pub fn replay<R: BufRead, W: Write>(
    reader: R,
    settings: &DetectorSettings,
    json: bool,
    out: &mut W,
) -> Result<ReplaySummary> {
    let mut detector = TapDetector::from_settings(settings);
    let mut summary = ReplaySummary::default();
    debug!(
        "detector: threshold^2={} peak_min_separation={} group_max_separation={}",
        detector.threshold_sq(),
        detector.peak_min_separation(),
        detector.group_max_separation()
    );

    for row in read_samples(reader) {
        let (line, sample) = row?;
        let index = detector.sample_count();
        let ev = detector.process(sample);
        summary.samples += 1;
        if !ev.is_tap() {
            continue;
        }
        *summary.events.entry(ev.to_string()).or_default() += 1;
        if json {
            let row = serde_json::json!({"sample": index, "line": line, "event": ev});
            writeln!(out, "{row}")?;
        } else {
            writeln!(out, "sample {index:>6} (line {line}): {ev}")?;
        }
    }

    info!(
        "replayed {} samples, {} tap events",
        summary.samples,
        summary.events.values().sum::<u64>()
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn settings() -> DetectorSettings {
        DetectorSettings {
            min_tap_gap_s: 0.05,
            max_group_gap_s: 0.3,
            sample_rate_hz: 100.0,
            slope_threshold: 50.0,
        }
    }

    fn recording() -> String {
        let mut s = String::from("# x,y,z\n0,0,0\n100,0,0\n");
        for _ in 0..35 {
            s.push_str("100,0,0\n");
        }
        s
    }

    #[test]
    fn reports_single_tap_as_text() {
        let mut out = Vec::new();
        let summary = replay(Cursor::new(recording()), &settings(), false, &mut out).unwrap();
        assert_eq!(summary.samples, 37);
        assert_eq!(summary.events.get("tap"), Some(&1));
        assert_eq!(summary.events.get("single tap"), Some(&1));
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("(line 3): tap"), "{}", lines[0]);
        assert!(lines[1].contains("sample     32"), "{}", lines[1]);
        assert!(lines[1].ends_with("single tap"), "{}", lines[1]);
    }

    #[test]
    fn json_rows() {
        let mut out = Vec::new();
        replay(Cursor::new(recording()), &settings(), true, &mut out).unwrap();
        let rows: Vec<serde_json::Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(rows[0]["event"], "tap_occurred");
        assert_eq!(rows[0]["sample"], 1);
        assert_eq!(rows[1]["event"], "single_tap");
        assert_eq!(rows[1]["line"], 34);
    }

    #[test]
    fn bad_line_aborts() {
        let mut out = Vec::new();
        let err = replay(Cursor::new("0,0,0\n1,2\n"), &settings(), false, &mut out).unwrap_err();
        assert!(err.to_string().contains("line 2"), "{err}");
    }
}
