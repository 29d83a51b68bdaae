//! Slope-threshold tap detector over 3-axis accelerometer samples.

use serde::Serialize;
use std::fmt;

use crate::config::DetectorSettings;
use crate::sample::Sample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TapEvent {
    NoTap,
    /// A peak just opened a new group.
    TapOccurred,
    SingleTap,
    DoubleTap,
    TripleTap,
}

impl TapEvent {
    /// Key used by `[bindings]` in a profile. `None` for `NoTap`.
    pub fn binding_key(self) -> Option<&'static str> {
        match self {
            TapEvent::NoTap => None,
            TapEvent::TapOccurred => Some("tap"),
            TapEvent::SingleTap => Some("single"),
            TapEvent::DoubleTap => Some("double"),
            TapEvent::TripleTap => Some("triple"),
        }
    }

    pub fn is_tap(self) -> bool {
        self != TapEvent::NoTap
    }
}

impl fmt::Display for TapEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TapEvent::NoTap => "no tap",
            TapEvent::TapOccurred => "tap",
            TapEvent::SingleTap => "single tap",
            TapEvent::DoubleTap => "double tap",
            TapEvent::TripleTap => "triple tap",
        };
        f.write_str(s)
    }
}

/// Largest group we report; reaching it closes the group immediately.
const MAX_GROUP: u8 = 3;

#[derive(Debug, Clone)]
pub struct TapDetector {
    previous: Sample,
    sample_count: u64,
    threshold_sq: f64,
    // None = no peak yet, i.e. infinitely far in the past
    previous_peak: Option<u64>,
    peak_min_separation: u64,
    group_max_separation: u64,
    pending: u8,
    started: bool,
}

impl TapDetector {
    /// `slope_threshold` is the raw per-sample delta magnitude; it is squared
    /// here so `process_sample` never takes a square root. Inputs are not
    /// validated.
    pub fn new(
        min_tap_gap_s: f32,
        max_group_gap_s: f32,
        sample_rate_hz: f32,
        slope_threshold: f32,
    ) -> Self {
        let threshold = slope_threshold as f64;
        Self {
            previous: Sample::default(),
            sample_count: 0,
            threshold_sq: threshold * threshold,
            previous_peak: None,
            peak_min_separation: seconds_to_samples(min_tap_gap_s, sample_rate_hz),
            group_max_separation: seconds_to_samples(max_group_gap_s, sample_rate_hz),
            pending: 0,
            started: false,
        }
    }

    pub fn from_settings(s: &DetectorSettings) -> Self {
        Self::new(
            s.min_tap_gap_s,
            s.max_group_gap_s,
            s.sample_rate_hz,
            s.slope_threshold,
        )
    }

    pub fn process_sample(&mut self, x: i32, y: i32, z: i32) -> TapEvent {
        let cur = Sample::new(x, y, z);
        if !self.started {
            self.started = true;
            self.advance(cur);
            return TapEvent::NoTap;
        }

        let mut event = TapEvent::NoTap;

        let mag = self.previous.slope_sq(&cur);
        if mag as f64 > self.threshold_sq && self.samples_since_peak() > self.peak_min_separation {
            if self.pending == 0 {
                event = TapEvent::TapOccurred;
            }
            self.pending += 1;
            self.previous_peak = Some(self.sample_count);
        }

        // group closure is checked on every sample, peak or not
        let gap_expired = self.samples_since_peak() > self.group_max_separation;
        match self.pending {
            1 if gap_expired => {
                event = TapEvent::SingleTap;
                self.pending = 0;
            }
            2 if gap_expired => {
                event = TapEvent::DoubleTap;
                self.pending = 0;
            }
            MAX_GROUP => {
                event = TapEvent::TripleTap;
                self.pending = 0;
            }
            _ => {}
        }

        self.advance(cur);
        event
    }

    pub fn process(&mut self, s: Sample) -> TapEvent {
        self.process_sample(s.x, s.y, s.z)
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn pending_taps(&self) -> u8 {
        self.pending
    }

    pub fn peak_min_separation(&self) -> u64 {
        self.peak_min_separation
    }

    pub fn group_max_separation(&self) -> u64 {
        self.group_max_separation
    }

    pub fn threshold_sq(&self) -> f64 {
        self.threshold_sq
    }

    fn samples_since_peak(&self) -> u64 {
        match self.previous_peak {
            Some(p) => self.sample_count - p,
            None => u64::MAX,
        }
    }

    fn advance(&mut self, cur: Sample) {
        self.sample_count += 1;
        self.previous = cur;
    }
}

/// Truncates to whole samples. Negative or NaN products saturate to 0.
fn seconds_to_samples(seconds: f32, rate_hz: f32) -> u64 {
    (seconds as f64 * rate_hz as f64) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn example() -> TapDetector {
        TapDetector::new(0.05, 0.3, 100.0, 50.0)
    }

    /// Feeds `n` copies of `s`, returns every non-NoTap event with its call offset.
    fn feed(d: &mut TapDetector, s: (i32, i32, i32), n: usize) -> Vec<(usize, TapEvent)> {
        (0..n)
            .filter_map(|i| {
                let e = d.process_sample(s.0, s.1, s.2);
                e.is_tap().then_some((i, e))
            })
            .collect()
    }

    /// Alternates between 0 and 100 on x to produce a peak every `spacing` samples.
    fn tap_train(d: &mut TapDetector, taps: usize, spacing: usize) -> Vec<TapEvent> {
        let mut out = vec![];
        let mut level = 0;
        for _ in 0..taps {
            level = if level == 0 { 100 } else { 0 };
            let e = d.process_sample(level, 0, 0);
            if e.is_tap() {
                out.push(e);
            }
            out.extend(feed(d, (level, 0, 0), spacing - 1).into_iter().map(|(_, e)| e));
        }
        out
    }

    #[test]
    fn concrete_example_parameters() {
        let d = example();
        assert_eq!(d.threshold_sq(), 2500.0);
        assert_eq!(d.peak_min_separation(), 5);
        assert_eq!(d.group_max_separation(), 30);
    }

    #[test]
    fn fractional_separations_truncate() {
        let d = TapDetector::new(0.056, 0.299, 100.0, 50.0);
        assert_eq!(d.peak_min_separation(), 5);
        assert_eq!(d.group_max_separation(), 29);
        let d = TapDetector::new(-0.1, f32::NAN, 100.0, 50.0);
        assert_eq!(d.peak_min_separation(), 0);
        assert_eq!(d.group_max_separation(), 0);
    }

    #[test]
    fn concrete_example_single_tap() {
        let mut d = example();
        assert_eq!(d.process_sample(0, 0, 0), TapEvent::NoTap);
        assert_eq!(d.process_sample(100, 0, 0), TapEvent::TapOccurred);
        let events = feed(&mut d, (100, 0, 0), 35);
        // offset 30 is the 31st call
        assert_eq!(events, vec![(30, TapEvent::SingleTap)]);
        assert_eq!(d.pending_taps(), 0);
    }

    #[test]
    fn first_sample_only_seeds() {
        let mut d = example();
        assert_eq!(d.process_sample(i32::MAX, i32::MIN, 12345), TapEvent::NoTap);
        assert_eq!(d.sample_count(), 1);
        assert_eq!(d.pending_taps(), 0);
    }

    #[test]
    fn extreme_deltas_do_not_overflow() {
        let mut d = example();
        d.process_sample(i32::MIN, i32::MIN, i32::MIN);
        assert_eq!(
            d.process_sample(i32::MAX, i32::MAX, i32::MAX),
            TapEvent::TapOccurred
        );
    }

    #[test]
    fn quiet_stream_never_taps() {
        let mut d = example();
        d.process_sample(0, 0, 0);
        // delta 50 on one axis: 2500 is not strictly above the threshold
        let mut level = 0;
        for _ in 0..200 {
            level = if level == 0 { 50 } else { 0 };
            assert_eq!(d.process_sample(level, 0, 0), TapEvent::NoTap);
        }
        assert_eq!(d.sample_count(), 201);
    }

    #[test]
    fn double_tap_groups_two_peaks() {
        let mut d = example();
        d.process_sample(0, 0, 0);
        let mut events = tap_train(&mut d, 2, 10);
        events.extend(feed(&mut d, (0, 0, 0), 40).into_iter().map(|(_, e)| e));
        assert_eq!(events, vec![TapEvent::TapOccurred, TapEvent::DoubleTap]);
    }

    #[test]
    fn triple_tap_closes_on_third_peak() {
        let mut d = example();
        d.process_sample(0, 0, 0);
        let mut level = 0;
        let mut events = vec![];
        for i in 0..3 {
            level = if level == 0 { 100 } else { 0 };
            let e = d.process_sample(level, 0, 0);
            if i == 2 {
                assert_eq!(e, TapEvent::TripleTap);
            }
            events.push(e);
            events.extend(feed(&mut d, (level, 0, 0), 9).into_iter().map(|(_, e)| e));
        }
        assert_eq!(events, vec![TapEvent::TapOccurred, TapEvent::NoTap, TapEvent::TripleTap]);
        assert_eq!(d.pending_taps(), 0);
    }

    #[test]
    fn fourth_peak_starts_new_group() {
        let mut d = example();
        d.process_sample(0, 0, 0);
        let mut events = tap_train(&mut d, 4, 10);
        events.extend(feed(&mut d, (0, 0, 0), 40).into_iter().map(|(_, e)| e));
        assert_eq!(
            events,
            vec![
                TapEvent::TapOccurred,
                TapEvent::TripleTap,
                TapEvent::TapOccurred,
                TapEvent::SingleTap,
            ]
        );
    }

    #[test]
    fn close_peaks_are_debounced() {
        let mut d = example();
        d.process_sample(0, 0, 0);
        assert_eq!(d.process_sample(100, 0, 0), TapEvent::TapOccurred);
        // 3 samples later, still inside peak_min_separation
        feed(&mut d, (100, 0, 0), 2);
        assert_eq!(d.process_sample(0, 0, 0), TapEvent::NoTap);
        assert_eq!(d.pending_taps(), 1);
        // the debounced peak did not move the group window
        let events = feed(&mut d, (0, 0, 0), 40);
        assert_eq!(events, vec![(27, TapEvent::SingleTap)]);
    }

    #[test]
    fn instances_do_not_share_group_state() {
        let mut a = example();
        let mut b = example();
        a.process_sample(0, 0, 0);
        b.process_sample(0, 0, 0);
        assert_eq!(a.process_sample(100, 0, 0), TapEvent::TapOccurred);
        assert_eq!(b.process_sample(100, 0, 0), TapEvent::TapOccurred);
        assert_eq!(a.pending_taps(), 1);
        assert_eq!(b.pending_taps(), 1);
        let ea = feed(&mut a, (100, 0, 0), 40);
        assert_eq!(ea, vec![(30, TapEvent::SingleTap)]);
        assert_eq!(b.pending_taps(), 1);
    }

    #[test]
    fn binding_keys() {
        assert_eq!(TapEvent::NoTap.binding_key(), None);
        assert_eq!(TapEvent::TapOccurred.binding_key(), Some("tap"));
        assert_eq!(TapEvent::DoubleTap.binding_key(), Some("double"));
        assert_eq!(
            serde_json::to_string(&TapEvent::TripleTap).unwrap(),
            "\"triple_tap\""
        );
    }

    proptest! {
        #[test]
        fn same_state_same_sample_same_result(
            prefix in proptest::collection::vec((-500i32..500, -500i32..500, -500i32..500), 0..80),
            next in (any::<i32>(), any::<i32>(), any::<i32>()),
        ) {
            let mut d = example();
            for (x, y, z) in prefix {
                d.process_sample(x, y, z);
            }
            let mut a = d.clone();
            let mut b = d.clone();
            let ea = a.process_sample(next.0, next.1, next.2);
            let eb = b.process_sample(next.0, next.1, next.2);
            prop_assert_eq!(ea, eb);
            prop_assert_eq!(format!("{a:?}"), format!("{b:?}"));
            prop_assert_eq!(a.sample_count(), d.sample_count() + 1);
        }

        #[test]
        fn pending_never_exceeds_two_between_calls(
            samples in proptest::collection::vec((-300i32..300, -300i32..300, -300i32..300), 1..300),
        ) {
            let mut d = example();
            for (x, y, z) in samples {
                d.process_sample(x, y, z);
                prop_assert!(d.pending_taps() < MAX_GROUP);
            }
        }
    }
}
