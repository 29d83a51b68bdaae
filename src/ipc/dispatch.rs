use crate::actions::{Action, UinputSink, parse_action};
use crate::config::Profile;
use crate::detector::TapEvent;
use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread;

/// Returns the bound action for `ev`, if the profile binds one.
pub fn binding_for(ev: TapEvent, profile: &Profile) -> Option<(&'static str, String)> {
    let key = ev.binding_key()?;
    let action = profile.bindings.get(key)?;
    Some((key, action.clone()))
}

pub fn dispatch_tap(
    ev: TapEvent,
    profile_arc: &Arc<Mutex<Profile>>,
    sink: &mut UinputSink,
) -> Result<()> {
    let (binding, allow_commands) = {
        let p = profile_arc
            .lock()
            .map_err(|_| anyhow!("profile lock poisoned"))?;
        (binding_for(ev, &p), p.meta.allow_commands)
    };
    let Some((key, action)) = binding else {
        return Ok(());
    };
    debug!("{ev} -> {key} = '{action}'");

    match parse_action(&action).map_err(|e| anyhow!("binding '{key}': {e}"))? {
        Action::Toggle => {
            sink.toggle();
        }
        Action::Mouse(btn) => sink.click_mouse(&btn)?,
        Action::Scroll(steps) => sink.scroll_vertical(steps)?,
        Action::Key(chord) => sink.key_chord(&chord)?,
        Action::Command(cmd) => {
            if !allow_commands {
                return Err(anyhow!("binding '{key}' uses cmd: but allow_commands=false"));
            }
            if sink.is_enabled() {
                spawn_command(&cmd)?;
            }
        }
    }
    Ok(())
}

/// Run `cmd` through `sh -c` without blocking; a detached thread reaps it.
fn spawn_command(cmd: &str) -> Result<()> {
    let mut child = Command::new("sh").arg("-c").arg(cmd).spawn()?;
    let pid = child.id();
    info!("spawned '{cmd}' (pid={pid})");
    let cmd = cmd.to_string();
    thread::spawn(move || match child.wait() {
        Ok(status) if status.success() => debug!("'{cmd}' (pid={pid}) exited"),
        Ok(status) => warn!("'{cmd}' (pid={pid}) exited with {status}"),
        Err(e) => warn!("failed to wait for '{cmd}' (pid={pid}): {e}"),
    });
    Ok(())
}
