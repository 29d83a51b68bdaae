//! Accelerometer discovery & frame assembly (evdev 0.13.2 compatible)

use evdev::{AbsoluteAxisCode, Device, EventType, InputEvent, PropType, SynchronizationCode};

use crate::sample::Sample;

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
}

pub fn discover_accelerometers() -> Vec<DeviceInfo> {
    let mut out = vec![];
    let Ok(rd) = std::fs::read_dir("/dev/input") else {
        return out;
    };
    for e in rd.flatten() {
        let p = e.path();
        let is_event_node = p
            .file_name()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.starts_with("event"));
        if !is_event_node {
            continue;
        }
        let Ok(dev) = Device::open(&p) else {
            continue;
        };
        if is_accelerometer(&dev) {
            out.push(DeviceInfo {
                path: p.display().to_string(),
                name: dev.name().unwrap_or("unknown").to_string(),
            });
        }
    }
    out.sort_by(|a, b| a.path.cmp(&b.path));
    out
}

fn is_accelerometer(dev: &Device) -> bool {
    let has_abs = dev.supported_events().contains(EventType::ABSOLUTE);
    let has_prop = dev.properties().contains(PropType::ACCELEROMETER);
    let has_xyz = dev.supported_absolute_axes().is_some_and(|a| {
        a.contains(AbsoluteAxisCode::ABS_X)
            && a.contains(AbsoluteAxisCode::ABS_Y)
            && a.contains(AbsoluteAxisCode::ABS_Z)
    });
    has_abs && has_prop && has_xyz
}

/// Folds per-axis ABS events into whole samples, one per SYN_REPORT.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    x: Option<i32>,
    y: Option<i32>,
    z: Option<i32>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event. Returns a sample on SYN_REPORT once every axis has
    /// reported at least once; axes that did not change keep their last value.
    pub fn push(&mut self, ev: &InputEvent) -> Option<Sample> {
        if ev.event_type() == EventType::ABSOLUTE {
            match ev.code() {
                c if c == AbsoluteAxisCode::ABS_X.0 => self.x = Some(ev.value()),
                c if c == AbsoluteAxisCode::ABS_Y.0 => self.y = Some(ev.value()),
                c if c == AbsoluteAxisCode::ABS_Z.0 => self.z = Some(ev.value()),
                _ => {}
            }
            None
        } else if ev.event_type() == EventType::SYNCHRONIZATION
            && ev.code() == SynchronizationCode::SYN_REPORT.0
        {
            Some(Sample::new(self.x?, self.y?, self.z?))
        } else {
            None
        }
    }
}
