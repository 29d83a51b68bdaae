use anyhow::{Result, anyhow};
use log::{info, warn};

/// Virtual input device that tap bindings are replayed through.
pub struct UinputSink {
    enabled: bool,
    linux: Option<Box<LinuxUinput>>,
}

impl UinputSink {
    pub fn new() -> Result<Self> {
        #[cfg(target_os = "linux")]
        {
            let dev = LinuxUinput::create()?;
            return Ok(Self {
                enabled: true,
                linux: Some(Box::new(dev)),
            });
        }
        #[allow(unreachable_code)]
        {
            warn!("uinput not available; running in NO-OP mode");
            Ok(Self::noop())
        }
    }

    /// `new()`, falling back to NO-OP mode when the device can't be created.
    pub fn new_or_noop() -> Self {
        Self::new().unwrap_or_else(|e| {
            warn!("uinput: {e}; running in NO-OP mode");
            Self::noop()
        })
    }

    pub fn noop() -> Self {
        Self {
            enabled: true,
            linux: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_noop(&self) -> bool {
        self.linux.is_none()
    }

    pub fn toggle(&mut self) -> bool {
        self.enabled = !self.enabled;
        info!(
            "actions {}",
            if self.enabled { "enabled" } else { "disabled" }
        );
        self.enabled
    }

    pub fn scroll_vertical(&mut self, steps: i32) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        #[cfg(target_os = "linux")]
        if let Some(dev) = self.linux.as_mut() {
            dev.scroll_vertical(steps)?;
        }
        Ok(())
    }

    pub fn click_mouse(&mut self, which: &str) -> Result<()> {
        let button = MouseButton::parse(which)?;
        if !self.enabled {
            return Ok(());
        }
        #[cfg(target_os = "linux")]
        if let Some(dev) = self.linux.as_mut() {
            dev.click(button)?;
        }
        #[cfg(not(target_os = "linux"))]
        let _ = button;
        Ok(())
    }

    /// Send a chord like "CTRL+Z" or a single "SPACE"
    pub fn key_chord(&mut self, chord: &str) -> Result<()> {
        let keys = parse_chord(chord)?;
        if !self.enabled {
            return Ok(());
        }
        #[cfg(target_os = "linux")]
        if let Some(dev) = self.linux.as_mut() {
            // press in order
            for k in &keys {
                dev.key_send(*k, 1)?;
            }
            dev.sync()?;
            // release in reverse
            for k in keys.iter().rev() {
                dev.key_send(*k, 0)?;
            }
            dev.sync()?;
        }
        #[cfg(not(target_os = "linux"))]
        let _ = keys;
        Ok(())
    }
}

/// A parsed binding action string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Mouse(String),
    Scroll(i32),
    Key(String),
    Toggle,
    Command(String),
}

pub fn parse_action(action: &str) -> Result<Action> {
    if action == "toggle" {
        return Ok(Action::Toggle);
    }
    if let Some(rest) = action.strip_prefix("mouse:") {
        return Ok(Action::Mouse(rest.trim().to_string()));
    }
    if let Some(rest) = action.strip_prefix("scroll:") {
        // scroll:vertical@-3
        let (axis, steps) = rest.split_once('@').unwrap_or((rest, "+1"));
        if !axis.trim().eq_ignore_ascii_case("vertical") {
            return Err(anyhow!("unsupported scroll axis '{}'", axis.trim()));
        }
        let steps: i32 = steps
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid scroll steps '{}'", steps.trim()))?;
        return Ok(Action::Scroll(steps));
    }
    if let Some(rest) = action.strip_prefix("key:") {
        return Ok(Action::Key(rest.trim().to_string()));
    }
    if let Some(rest) = action.strip_prefix("cmd:") {
        let cmd = rest.trim();
        if cmd.is_empty() {
            return Err(anyhow!("empty command"));
        }
        return Ok(Action::Command(cmd.to_string()));
    }
    Err(anyhow!("unknown action '{action}'"))
}

/// Parse `action` and check that its button or key chord is one the sink
/// can actually emit.
pub fn validate_action(action: &str) -> Result<Action> {
    let parsed = parse_action(action)?;
    match &parsed {
        Action::Mouse(btn) => {
            MouseButton::parse(btn)?;
        }
        Action::Key(chord) => {
            parse_chord(chord)?;
        }
        Action::Scroll(_) | Action::Toggle | Action::Command(_) => {}
    }
    Ok(parsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

impl MouseButton {
    fn parse(which: &str) -> Result<Self> {
        match which.trim().to_ascii_lowercase().as_str() {
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            "middle" => Ok(Self::Middle),
            other => Err(anyhow!("unknown mouse button: {other}")),
        }
    }
}

/// Keys the virtual device registers. Chords may only use these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Ctrl,
    Alt,
    Shift,
    Super,
    Tab,
    Space,
    Enter,
    Esc,
    Minus,
    Equal,
    Up,
    Down,
    Left,
    Right,
    Letter(char),
}

const LETTERS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";

fn map_key(tok: &str) -> Result<Key> {
    let k = match tok {
        "CTRL" | "CONTROL" => Key::Ctrl,
        "ALT" => Key::Alt,
        "SHIFT" => Key::Shift,
        "SUPER" | "META" | "WIN" => Key::Super,
        "TAB" => Key::Tab,
        "SPACE" => Key::Space,
        "ENTER" | "RETURN" => Key::Enter,
        "ESC" | "ESCAPE" => Key::Esc,
        "MINUS" | "-" => Key::Minus,
        "EQUAL" | "=" => Key::Equal,
        "UP" => Key::Up,
        "DOWN" => Key::Down,
        "LEFT" => Key::Left,
        "RIGHT" => Key::Right,
        s if s.len() == 1 && LETTERS.contains(s) => Key::Letter(s.as_bytes()[0] as char),
        other => return Err(anyhow!("unsupported key token: {other}")),
    };
    Ok(k)
}

pub fn parse_chord(chord: &str) -> Result<Vec<Key>> {
    chord
        .split('+')
        .map(|s| map_key(&s.trim().to_ascii_uppercase()))
        .collect()
}

#[cfg(target_os = "linux")]
struct LinuxUinput {
    dev: uinput::device::Device,
}

#[cfg(target_os = "linux")]
impl LinuxUinput {
    fn create() -> Result<Self> {
        use uinput::event::{controller::Mouse, relative};

        let mut builder = uinput::default()?
            .name("Tapctl Virtual Input")?
            .event(relative::Position::X)?
            .event(relative::Position::Y)?
            .event(relative::Wheel::Vertical)?
            .event(Mouse::Left)?
            .event(Mouse::Right)?
            .event(Mouse::Middle)?;
        for k in [
            Key::Ctrl,
            Key::Alt,
            Key::Shift,
            Key::Super,
            Key::Tab,
            Key::Space,
            Key::Enter,
            Key::Esc,
            Key::Minus,
            Key::Equal,
            Key::Up,
            Key::Down,
            Key::Left,
            Key::Right,
        ]
        .into_iter()
        .chain(LETTERS.chars().map(Key::Letter))
        {
            builder = builder.event(uinput_key(k))?;
        }
        let dev = builder.create()?;

        info!("uinput: created virtual device");
        Ok(Self { dev })
    }

    fn sync(&mut self) -> Result<()> {
        self.dev.synchronize()?;
        Ok(())
    }

    fn key_send(&mut self, key: Key, val: i32) -> Result<()> {
        self.dev.send(uinput_key(key), val)?;
        Ok(())
    }

    fn click(&mut self, button: MouseButton) -> Result<()> {
        use uinput::event::controller::Mouse;
        let m = match button {
            MouseButton::Left => Mouse::Left,
            MouseButton::Right => Mouse::Right,
            MouseButton::Middle => Mouse::Middle,
        };
        self.dev.send(m, 1)?;
        self.sync()?;
        self.dev.send(m, 0)?;
        self.sync()
    }

    fn scroll_vertical(&mut self, steps: i32) -> Result<()> {
        use uinput::event::relative::Wheel;
        self.dev.send(Wheel::Vertical, steps)?;
        self.sync()
    }
}

#[cfg(target_os = "linux")]
fn uinput_key(k: Key) -> uinput::event::keyboard::Key {
    use uinput::event::keyboard::Key as K;
    match k {
        Key::Ctrl => K::LeftControl,
        Key::Alt => K::LeftAlt,
        Key::Shift => K::LeftShift,
        Key::Super => K::LeftMeta,
        Key::Tab => K::Tab,
        Key::Space => K::Space,
        Key::Enter => K::Enter,
        Key::Esc => K::Esc,
        Key::Minus => K::Minus,
        Key::Equal => K::Equal,
        Key::Up => K::Up,
        Key::Down => K::Down,
        Key::Left => K::Left,
        Key::Right => K::Right,
        Key::Letter(c) => match c {
            'A' => K::A,
            'B' => K::B,
            'C' => K::C,
            'D' => K::D,
            'E' => K::E,
            'F' => K::F,
            'G' => K::G,
            'H' => K::H,
            'I' => K::I,
            'J' => K::J,
            'K' => K::K,
            'L' => K::L,
            'M' => K::M,
            'N' => K::N,
            'O' => K::O,
            'P' => K::P,
            'Q' => K::Q,
            'R' => K::R,
            'S' => K::S,
            'T' => K::T,
            'U' => K::U,
            'V' => K::V,
            'W' => K::W,
            'X' => K::X,
            'Y' => K::Y,
            _ => K::Z,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chords_parse_in_order() {
        assert_eq!(parse_chord("ctrl+z").unwrap(), vec![Key::Ctrl, Key::Letter('Z')]);
        assert_eq!(parse_chord(" SPACE ").unwrap(), vec![Key::Space]);
        assert!(parse_chord("CTRL+F13").is_err());
        assert!(parse_chord("").is_err());
    }

    #[test]
    fn actions_parse() {
        assert_eq!(parse_action("toggle").unwrap(), Action::Toggle);
        assert_eq!(parse_action("mouse: right").unwrap(), Action::Mouse("right".into()));
        assert_eq!(parse_action("scroll:vertical").unwrap(), Action::Scroll(1));
        assert_eq!(parse_action("scroll:vertical@-3").unwrap(), Action::Scroll(-3));
        assert!(parse_action("scroll:horizontal@2").is_err());
        assert!(parse_action("scroll:vertical@lots").is_err());
        assert_eq!(parse_action("cmd: echo hi").unwrap(), Action::Command("echo hi".into()));
        assert!(parse_action("cmd:  ").is_err());
        assert!(parse_action("beep").is_err());
    }

    #[test]
    fn validation_checks_buttons_and_keys() {
        assert_eq!(validate_action("key:CTRL+Z").unwrap(), Action::Key("CTRL+Z".into()));
        assert!(validate_action("key:F13").is_err());
        assert!(validate_action("mouse:back").is_err());
        assert!(validate_action("mouse:middle").is_ok());
        assert!(validate_action("scroll:horizontal").is_err());
    }

    #[test]
    fn disabled_noop_sink_still_validates() {
        let mut sink = UinputSink::noop();
        assert!(sink.is_noop());
        assert!(!sink.toggle());
        assert!(sink.click_mouse("left").is_ok());
        assert!(sink.click_mouse("back").is_err());
        assert!(sink.key_chord("ALT+TAB").is_ok());
    }
}
