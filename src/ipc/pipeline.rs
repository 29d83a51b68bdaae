use anyhow::{Result, anyhow};
use log::{debug, error, info, warn};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::{
    thread,
    time::{Duration, Instant},
};

use evdev::{Device, InputEvent};

use super::server::DaemonEvent;
use crate::actions::UinputSink;
use crate::config::{DetectorSettings, Profile};
use crate::detector::{TapDetector, TapEvent};
use crate::input::{self, FrameAssembler};
use crate::sample::Sample;

const RESCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Turns one sensor's sparse evdev frames into a sample stream at the
/// profile's rate. The kernel drops unchanged ABS values, so a device at rest
/// goes silent; `tick` then feeds the last sample again once per period so the
/// detector's group timeouts still expire.
#[derive(Debug)]
pub struct SensorFeed {
    frames: FrameAssembler,
    detector: TapDetector,
    period: Option<Duration>,
    // longest catch-up run after a stall; beyond it repeats change nothing
    max_repeats: u64,
    last: Option<Sample>,
    last_fed: Instant,
}

impl SensorFeed {
    pub fn new(settings: &DetectorSettings, now: Instant) -> Self {
        let detector = TapDetector::from_settings(settings);
        let max_repeats = detector
            .group_max_separation()
            .max(detector.peak_min_separation())
            .saturating_add(2);
        Self {
            frames: FrameAssembler::new(),
            detector,
            period: Duration::try_from_secs_f64(1.0 / settings.sample_rate_hz as f64).ok(),
            max_repeats,
            last: None,
            last_fed: now,
        }
    }

    /// Fresh detector for new settings; the last known sample is kept.
    pub fn reset(&mut self, settings: &DetectorSettings, now: Instant) {
        let last = self.last;
        *self = Self::new(settings, now);
        self.last = last;
    }

    pub fn detector(&self) -> &TapDetector {
        &self.detector
    }

    pub fn on_event(&mut self, ev: &InputEvent, now: Instant) -> Option<TapEvent> {
        let sample = self.frames.push(ev)?;
        Some(self.feed(sample, now))
    }

    /// Repeat the last sample for every full period since anything was fed.
    pub fn tick(&mut self, now: Instant) -> Vec<TapEvent> {
        let (Some(period), Some(last)) = (self.period, self.last) else {
            return vec![];
        };
        let mut out = vec![];
        let mut repeats = 0;
        while now.saturating_duration_since(self.last_fed) >= period {
            if repeats == self.max_repeats {
                self.last_fed = now;
                break;
            }
            self.last_fed += period;
            repeats += 1;
            let ev = self.detector.process(last);
            if ev.is_tap() {
                out.push(ev);
            }
        }
        out
    }

    fn feed(&mut self, sample: Sample, now: Instant) -> TapEvent {
        self.last = Some(sample);
        self.last_fed = now;
        self.detector.process(sample)
    }
}

/// One opened accelerometer; detectors never share grouping state across
/// devices.
struct Sensor {
    path: String,
    dev: Device,
    feed: SensorFeed,
}

fn open_sensors(settings: &DetectorSettings) -> Vec<Sensor> {
    let mut out = vec![];
    for d in input::discover_accelerometers() {
        match Device::open(&d.path) {
            Ok(mut dev) => {
                if let Err(e) = dev.set_nonblocking(true) {
                    warn!("{}: set_nonblocking failed: {e}", d.path);
                }
                info!("opened accelerometer '{}' at {}", d.name, d.path);
                out.push(Sensor {
                    path: d.path,
                    dev,
                    feed: SensorFeed::new(settings, Instant::now()),
                });
            }
            Err(e) => warn!("failed to open {}: {e}", d.path),
        }
    }
    out
}

fn current_settings(profile: &Arc<Mutex<Profile>>) -> Result<DetectorSettings> {
    let p = profile
        .lock()
        .map_err(|_| anyhow!("profile lock poisoned"))?;
    Ok(p.detector.clone())
}

struct Dispatcher {
    profile: Arc<Mutex<Profile>>,
    tx_evt: Sender<DaemonEvent>,
    sink: UinputSink,
    enabled: bool,
}

impl Dispatcher {
    fn handle(&mut self, path: &str, feed: &SensorFeed, tap: TapEvent) {
        debug!(
            "{path}: {tap} at sample {} ({} pending)",
            feed.detector().sample_count(),
            feed.detector().pending_taps()
        );
        let _ = self.tx_evt.send(DaemonEvent::Tap {
            device: path.to_string(),
            event: tap,
        });
        if let Err(e) = super::dispatch::dispatch_tap(tap, &self.profile, &mut self.sink) {
            error!("dispatch failed: {e}");
        }
        if self.sink.is_enabled() != self.enabled {
            self.enabled = self.sink.is_enabled();
            let _ = self.tx_evt.send(DaemonEvent::Enabled(self.enabled));
        }
    }
}

pub fn run_pipeline(profile: Arc<Mutex<Profile>>, tx_evt: Sender<DaemonEvent>) -> Result<()> {
    let mut settings = current_settings(&profile)?;
    let mut sensors = open_sensors(&settings);
    let sink = UinputSink::new_or_noop();
    if sink.is_noop() {
        warn!("no virtual input device; taps are detected but bindings do nothing");
    }
    let mut out = Dispatcher {
        profile: profile.clone(),
        tx_evt,
        enabled: sink.is_enabled(),
        sink,
    };

    loop {
        if sensors.is_empty() {
            warn!("no accelerometers detected; rescanning in {RESCAN_INTERVAL:?}");
            thread::sleep(RESCAN_INTERVAL);
            sensors = open_sensors(&settings);
            continue;
        }

        // a reload may have changed detector settings; start fresh detectors
        let latest = current_settings(&profile)?;
        if latest != settings {
            info!("detector settings changed; resetting {} detector(s)", sensors.len());
            let now = Instant::now();
            for s in sensors.iter_mut() {
                s.feed.reset(&latest, now);
            }
            settings = latest;
        }

        let mut any_event = false;
        let mut lost = vec![];
        for (i, s) in sensors.iter_mut().enumerate() {
            match s.dev.fetch_events() {
                Ok(events) => {
                    for ev in events {
                        any_event = true;
                        if let Some(tap) = s.feed.on_event(&ev, Instant::now()) {
                            if tap.is_tap() {
                                out.handle(&s.path, &s.feed, tap);
                            }
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    warn!("{}: read failed ({e}); dropping device", s.path);
                    lost.push(i);
                    continue;
                }
            }
            for tap in s.feed.tick(Instant::now()) {
                out.handle(&s.path, &s.feed, tap);
            }
        }
        for i in lost.into_iter().rev() {
            sensors.remove(i);
        }

        if !any_event {
            thread::sleep(Duration::from_millis(4));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evdev::{AbsoluteAxisCode, EventType, SynchronizationCode};

    fn settings() -> DetectorSettings {
        DetectorSettings {
            min_tap_gap_s: 0.05,
            max_group_gap_s: 0.3,
            sample_rate_hz: 100.0,
            slope_threshold: 50.0,
        }
    }

    /// One full evdev frame; returns the event from its SYN_REPORT.
    fn frame(feed: &mut SensorFeed, s: (i32, i32, i32), now: Instant) -> Option<TapEvent> {
        for (code, v) in [
            (AbsoluteAxisCode::ABS_X, s.0),
            (AbsoluteAxisCode::ABS_Y, s.1),
            (AbsoluteAxisCode::ABS_Z, s.2),
        ] {
            assert_eq!(
                feed.on_event(&InputEvent::new(EventType::ABSOLUTE.0, code.0, v), now),
                None
            );
        }
        let syn = InputEvent::new(
            EventType::SYNCHRONIZATION.0,
            SynchronizationCode::SYN_REPORT.0,
            0,
        );
        feed.on_event(&syn, now)
    }

    #[test]
    fn resting_sensor_still_closes_single_tap() {
        let t0 = Instant::now();
        let ms = |n: u64| t0 + Duration::from_millis(n);
        let mut feed = SensorFeed::new(&settings(), t0);

        assert_eq!(frame(&mut feed, (0, 0, 0), ms(0)), Some(TapEvent::NoTap));
        assert_eq!(frame(&mut feed, (100, 0, 0), ms(10)), Some(TapEvent::TapOccurred));
        assert_eq!(feed.detector().pending_taps(), 1);

        // no more frames: the device is at rest
        assert!(feed.tick(ms(15)).is_empty());
        assert!(feed.tick(ms(300)).is_empty());
        assert_eq!(feed.tick(ms(320)), vec![TapEvent::SingleTap]);
        assert_eq!(feed.detector().pending_taps(), 0);
        // 2 frames plus one repeat per 10 ms since the tap
        assert_eq!(feed.detector().sample_count(), 2 + 31);
    }

    #[test]
    fn real_frames_reset_the_repeat_clock() {
        let t0 = Instant::now();
        let ms = |n: u64| t0 + Duration::from_millis(n);
        let mut feed = SensorFeed::new(&settings(), t0);

        frame(&mut feed, (0, 0, 0), ms(0));
        assert!(feed.tick(ms(9)).is_empty());
        assert_eq!(feed.detector().sample_count(), 1);
        frame(&mut feed, (1, 0, 0), ms(9));
        assert!(feed.tick(ms(18)).is_empty());
        assert_eq!(feed.detector().sample_count(), 2);
        feed.tick(ms(19));
        assert_eq!(feed.detector().sample_count(), 3);
    }

    #[test]
    fn nothing_repeats_before_first_frame() {
        let t0 = Instant::now();
        let mut feed = SensorFeed::new(&settings(), t0);
        assert!(feed.tick(t0 + Duration::from_secs(1)).is_empty());
        assert_eq!(feed.detector().sample_count(), 0);
    }

    #[test]
    fn long_stall_catch_up_is_bounded() {
        let t0 = Instant::now();
        let mut feed = SensorFeed::new(&settings(), t0);
        frame(&mut feed, (0, 0, 0), t0);
        frame(&mut feed, (100, 0, 0), t0);
        let events = feed.tick(t0 + Duration::from_secs(3600));
        assert_eq!(events, vec![TapEvent::SingleTap]);
        assert_eq!(feed.detector().sample_count(), 2 + 32);
        // the clock jumped to `now`, no backlog left
        assert!(feed.tick(t0 + Duration::from_millis(3_600_005)).is_empty());
    }
}
