use anyhow::{Context, Result, anyhow};
use pico_args::Arguments;
use std::{
    env, fs,
    io::{self, BufReader},
    path::PathBuf,
    process::Command,
};

use crate::config::DaemonConfigState;
use crate::{ipc, replay};

pub fn run() -> Result<()> {
    let mut pargs = Arguments::from_env();

    // Hidden daemon mode (spawned by `start`)
    if pargs.contains("--daemon") {
        return ipc::run_daemon();
    }

    if env::args().len() == 1 {
        print_help();
        return Ok(());
    }

    if pargs.contains(["-h", "--help"]) {
        print_help();
        return Ok(());
    }

    let subcmd: Option<String> = pargs.free_from_str().ok();

    match subcmd.as_deref() {
        Some("help") => {
            let topic: Option<String> = pargs.free_from_str().ok();
            match topic {
                Some(t) => print_subcmd_help(&t),
                None => print_help(),
            }
            Ok(())
        }

        Some("start") => {
            let exe = env::current_exe()?;
            let child = Command::new(exe).arg("--daemon").spawn()?;
            println!("tapctl: started daemon (pid={})", child.id());
            Ok(())
        }

        Some("run") => ipc::run_daemon(),

        Some("stop") => request(serde_json::json!({"op":"shutdown"})),
        Some("status") => request(serde_json::json!({"op":"status"})),
        Some("reload") => request(serde_json::json!({"op":"reload"})),
        Some("list") => request(serde_json::json!({"op":"list"})),
        Some("doctor") => request(serde_json::json!({"op":"doctor"})),

        Some("use") => {
            let name: String = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: tapctl use <profile_name>"))?;
            request(serde_json::json!({"op":"use","profile":name}))
        }

        Some("replay") => {
            // usage:
            //   tapctl replay recording.csv
            //   tapctl replay --profile desk --json < recording.csv
            let profile: Option<String> = pargs.opt_value_from_str("--profile")?;
            let json = pargs.contains("--json");
            let file: Option<PathBuf> = pargs.opt_free_from_str()?;

            let cfg = DaemonConfigState::load_or_install_default()?;
            let settings = match profile {
                Some(name) => cfg.peek_profile(&name)?.detector,
                None => cfg.profile.detector.clone(),
            };

            let stdout = io::stdout();
            let mut out = stdout.lock();
            let summary = match file {
                Some(path) => {
                    let f = fs::File::open(&path)
                        .with_context(|| format!("failed to open {}", path.display()))?;
                    replay::replay(BufReader::new(f), &settings, json, &mut out)?
                }
                None => replay::replay(io::stdin().lock(), &settings, json, &mut out)?,
            };
            if !json {
                println!("{} samples", summary.samples);
                for (event, n) in &summary.events {
                    println!("  {event}: {n}");
                }
            }
            Ok(())
        }

        Some("emit") => {
            // usage:
            //   tapctl emit click right
            //   tapctl emit scroll 3
            //   tapctl emit key CTRL+Z
            let what: String = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: tapctl emit <click|scroll|key> ..."))?;
            let mut sink = crate::actions::UinputSink::new()?;
            match what.as_str() {
                "click" => {
                    let btn: String = pargs
                        .free_from_str()
                        .map_err(|_| anyhow!("usage: tapctl emit click <left|right|middle>"))?;
                    sink.click_mouse(&btn)?;
                    println!("ok: clicked {btn}");
                }
                "scroll" => {
                    let steps: i32 = pargs
                        .free_from_str()
                        .map_err(|_| anyhow!("usage: tapctl emit scroll <steps>"))?;
                    sink.scroll_vertical(steps)?;
                    println!("ok: scrolled vertical {steps}");
                }
                "key" => {
                    let chord: String = pargs
                        .free_from_str()
                        .map_err(|_| anyhow!("usage: tapctl emit key CTRL+Z"))?;
                    sink.key_chord(&chord)?;
                    println!("ok: sent key chord {chord}");
                }
                other => return Err(anyhow!("unknown emit kind: {other}")),
            }
            Ok(())
        }

        Some(other) => {
            eprintln!("unknown subcommand: {other}\n");
            print_help();
            Ok(())
        }

        None => {
            print_help();
            Ok(())
        }
    }
}

fn request(req: serde_json::Value) -> Result<()> {
    let r = ipc::client_request(req)?;
    println!("{}", serde_json::to_string_pretty(&r).unwrap_or_default());
    Ok(())
}

fn print_help() {
    println!(
        r#"tapctl — accelerometer tap gestures for Linux

USAGE:
  tapctl help [command]                   Show general or command-specific help
  tapctl start                            Start the daemon in the background
  tapctl run                              Run the daemon in the foreground
  tapctl stop                             Stop the daemon
  tapctl status                           Show daemon state and tap counters
  tapctl reload                           Reload active profile
  tapctl use <name>                       Switch active profile
  tapctl list                             List profiles
  tapctl doctor                           Diagnose permissions/devices
  tapctl replay [file] [--profile <name>] [--json]
                                          Detect taps in recorded x,y,z samples
  tapctl emit click <left|right|middle>   Emit a mouse click
  tapctl emit scroll <steps>              Emit vertical scroll (+/- steps)
  tapctl emit key CTRL+Z                  Emit a key or chord

TIPS:
  - Profiles: ~/.config/tapctl/profiles (edits are picked up automatically)
  - Active profile pointer: ~/.config/tapctl/active
  - Logging: RUST_LOG=debug tapctl run
"#
    );
}

fn print_subcmd_help(cmd: &str) {
    match cmd {
        "start" => println!("usage: tapctl start\nStarts the background daemon."),
        "run" => println!("usage: tapctl run\nRuns the daemon attached to the terminal."),
        "stop" => println!("usage: tapctl stop\nStops the running daemon."),
        "status" => println!(
            "usage: tapctl status\nShows enabled flag, active profile, accelerometers, tap counts, PID."
        ),
        "reload" => println!(
            "usage: tapctl reload\nReloads the current profile; keeps last good on error."
        ),
        "use" => {
            println!("usage: tapctl use <name>\nSwitches active profile to <name> and reloads.")
        }
        "list" => println!("usage: tapctl list\nLists available profiles."),
        "doctor" => println!(
            "usage: tapctl doctor\nChecks permissions and lists detected accelerometers."
        ),
        "replay" => println!(
            "usage: tapctl replay [file] [--profile <name>] [--json]\n\
             Reads one 'x,y,z' sample per line (stdin if no file; '#' starts a comment)\n\
             and prints every tap event with its sample index."
        ),
        "emit" => println!(
            "usage:\n  tapctl emit click <left|right|middle>\n  tapctl emit scroll <steps>\n  tapctl emit key CTRL+Z"
        ),
        _ => {
            eprintln!("unknown command: {cmd}\n");
            print_help();
        }
    }
}
