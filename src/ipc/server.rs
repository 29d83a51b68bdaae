use anyhow::{Result, anyhow};
use log::{debug, error, info, warn};
use notify::{EventKind, RecursiveMode, Watcher};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use std::{
    collections::BTreeMap,
    io::{BufRead, BufReader, Write},
    os::unix::net::{UnixListener, UnixStream},
    path::PathBuf,
    sync::{
        Arc, Mutex,
        mpsc::{self, Sender},
    },
    thread,
    time::Duration,
};

use super::pipeline::run_pipeline;
use super::runtime::socket_path;
use crate::config::{DaemonConfigState, Profile};
use crate::detector::TapEvent;

pub fn run_daemon() -> Result<()> {
    // socket
    let sock = socket_path()?;
    if sock.exists() {
        if UnixStream::connect(&sock).is_ok() {
            return Err(anyhow!("tapctl daemon already running at {}", sock.display()));
        }
        let _ = std::fs::remove_file(&sock);
    }
    let listener = UnixListener::bind(&sock)?;
    info!("daemon: listening on {}", sock.display());

    // state
    let mut state = DaemonState::from_config(
        DaemonConfigState::load_or_install_default()?,
        sock.clone(),
    );
    info!("daemon: active profile '{}'", state.cfg.active_name);

    // channels
    let (tx_req, rx_req) = mpsc::channel::<IpcMsg>();
    let (tx_evt, rx_evt) = mpsc::channel::<DaemonEvent>();

    let pipeline = PipelineThread::start(state.cfg.profile.clone(), tx_evt);
    let _watcher = watch_profiles(&state.cfg, tx_req.clone())?;
    watch_signals(tx_req.clone())?;

    // accept loop
    listener.set_nonblocking(true)?;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                let tx = tx_req.clone();
                let st_snapshot = state.clone_shallow();
                thread::spawn(move || {
                    if let Err(e) = handle_client(stream, st_snapshot, tx) {
                        error!("ipc client error: {e}");
                    }
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("accept failed: {e}"),
        }

        while let Ok(evt) = rx_evt.try_recv() {
            match evt {
                DaemonEvent::Tap { device, event } => {
                    info!("[tap] {device}: {event}");
                    *state.tap_counts.entry(event.to_string()).or_default() += 1;
                }
                DaemonEvent::Enabled(en) => state.enabled = en,
            }
        }

        while let Ok(msg) = rx_req.try_recv() {
            match msg {
                IpcMsg::Reload => {
                    if let Err(e) = state.cfg.reload() {
                        error!("reload failed (keeping last good profile): {e}");
                    } else {
                        pipeline.update_profile(state.cfg.profile.clone());
                        info!("profile reloaded");
                    }
                }
                IpcMsg::UseProfile(name) => {
                    if let Err(e) = state.cfg.set_active(&name) {
                        error!("use profile failed: {e}");
                    } else {
                        pipeline.update_profile(state.cfg.profile.clone());
                        info!("switched active profile to {}", state.cfg.active_name);
                    }
                }
                IpcMsg::Shutdown => {
                    info!("daemon: shutting down");
                    let _ = std::fs::remove_file(&sock);
                    return Ok(());
                }
            }
        }

        thread::sleep(Duration::from_millis(5));
    }
}

fn handle_client(mut stream: UnixStream, st: DaemonState, tx_req: Sender<IpcMsg>) -> Result<()> {
    // the listener is non-blocking; clients are served blocking
    stream.set_nonblocking(false)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim().is_empty() {
        return Ok(());
    }
    let req: serde_json::Value = serde_json::from_str(&line)?;
    let op = req.get("op").and_then(|v| v.as_str()).unwrap_or("");
    debug!("ipc request: {op}");

    let resp = match op {
        "status" => serde_json::json!({"ok": true, "data": {
            "enabled": st.enabled,
            "active_profile": st.cfg.active_name,
            "socket": st.socket,
            "accelerometers": st.cfg.detected_devices,
            "taps": st.tap_counts,
            "pid": std::process::id(),
        }}),
        "reload" => {
            let _ = tx_req.send(IpcMsg::Reload);
            serde_json::json!({"ok": true, "data": {"active_profile": st.cfg.active_name}})
        }
        "use" => {
            let name = req.get("profile").and_then(|v| v.as_str()).unwrap_or("");
            // validate here so the client hears about a bad profile
            match st.cfg.peek_profile(name) {
                Ok(_) => {
                    let _ = tx_req.send(IpcMsg::UseProfile(name.to_string()));
                    serde_json::json!({"ok": true, "data": {"active_profile": name}})
                }
                Err(e) => serde_json::json!({"ok": false, "error": e.to_string()}),
            }
        }
        "list" => {
            let list = st.cfg.list_profiles();
            serde_json::json!({"ok": true, "data": {"profiles": list, "active": st.cfg.active_name}})
        }
        "doctor" => {
            let report = st.cfg.doctor_report();
            serde_json::json!({"ok": true, "data": report})
        }
        "shutdown" => {
            let _ = tx_req.send(IpcMsg::Shutdown);
            serde_json::json!({"ok": true, "data": "shutting down"})
        }
        _ => serde_json::json!({"ok": false, "error": format!("unknown op: {op}")}),
    };

    writeln!(stream, "{resp}")?;
    Ok(())
}

struct DaemonState {
    enabled: bool,
    cfg: DaemonConfigState,
    socket: PathBuf,
    tap_counts: BTreeMap<String, u64>,
}

impl DaemonState {
    fn from_config(cfg: DaemonConfigState, socket: PathBuf) -> Self {
        Self {
            enabled: true,
            cfg,
            socket,
            tap_counts: BTreeMap::new(),
        }
    }
    fn clone_shallow(&self) -> Self {
        Self {
            enabled: self.enabled,
            cfg: self.cfg.clone(),
            socket: self.socket.clone(),
            tap_counts: self.tap_counts.clone(),
        }
    }
}

#[derive(Debug)]
enum IpcMsg {
    Reload,
    UseProfile(String),
    Shutdown,
}

pub enum DaemonEvent {
    Tap { device: String, event: TapEvent },
    Enabled(bool),
}

struct PipelineThread {
    profile: Arc<Mutex<Profile>>,
    _thread: thread::JoinHandle<()>,
}

impl PipelineThread {
    fn start(profile: Profile, tx_evt: Sender<DaemonEvent>) -> Self {
        let profile_arc = Arc::new(Mutex::new(profile));
        let prof_clone = profile_arc.clone();
        let handle = thread::spawn(move || {
            if let Err(e) = run_pipeline(prof_clone, tx_evt) {
                error!("tap pipeline failed: {e}");
            }
        });
        Self {
            profile: profile_arc,
            _thread: handle,
        }
    }
    fn update_profile(&self, new_profile: Profile) {
        if let Ok(mut p) = self.profile.lock() {
            *p = new_profile;
        }
    }
}

/// Any write to the profiles directory triggers a reload.
fn watch_profiles(
    cfg: &DaemonConfigState,
    tx_req: Sender<IpcMsg>,
) -> Result<notify::RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(ev) if matches!(ev.kind, EventKind::Create(_) | EventKind::Modify(_)) => {
                debug!("profiles changed: {:?}", ev.paths);
                let _ = tx_req.send(IpcMsg::Reload);
            }
            Ok(_) => {}
            Err(e) => warn!("profile watcher error: {e}"),
        }
    })?;
    watcher.watch(&cfg.profiles_dir, RecursiveMode::NonRecursive)?;
    info!("watching {} for changes", cfg.profiles_dir.display());
    Ok(watcher)
}

fn watch_signals(tx_req: Sender<IpcMsg>) -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!("received signal {sig}");
            let _ = tx_req.send(IpcMsg::Shutdown);
        }
    });
    Ok(())
}

// client helper
pub fn client_request(req: serde_json::Value) -> Result<serde_json::Value> {
    let sock = socket_path()?;
    if !sock.exists() {
        return Err(anyhow!(
            "tapctl daemon is not running (socket missing at {})",
            sock.display()
        ));
    }
    let mut stream = UnixStream::connect(sock)?;
    let line = serde_json::to_string(&req)? + "\n";
    stream.write_all(line.as_bytes())?;
    let mut reader = BufReader::new(stream);
    let mut resp = String::new();
    reader.read_line(&mut resp)?;
    let v: serde_json::Value = serde_json::from_str(&resp)?;
    Ok(v)
}
