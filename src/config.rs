use anyhow::{Context, Result, anyhow};
use directories::UserDirs;
use log::info;
use serde::{Deserialize, Deserializer};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

use crate::actions::{self, Action};
use crate::input;

#[derive(Debug, Clone, Deserialize)]
pub struct Meta {
    pub name: Option<String>,
    #[serde(default)]
    pub allow_commands: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DetectorSettings {
    pub min_tap_gap_s: f32,
    pub max_group_gap_s: f32,
    pub sample_rate_hz: f32,
    pub slope_threshold: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub meta: Meta,
    pub detector: DetectorSettings,

    // nested tables are flattened into "a.b" -> "value"
    #[serde(default, deserialize_with = "deserialize_bindings_flat")]
    pub bindings: HashMap<String, String>,
}

/// Keys a `[bindings]` table may use, one per reported tap event.
pub const BINDING_KEYS: [&str; 4] = ["tap", "single", "double", "triple"];

#[derive(Debug, Error, PartialEq)]
pub enum ProfileError {
    #[error("detector.{0} must be a positive number")]
    NotPositive(&'static str),
    #[error("detector.max_group_gap_s must not be shorter than detector.min_tap_gap_s")]
    GroupShorterThanGap,
    #[error("unknown binding '{0}' (expected one of: tap, single, double, triple)")]
    UnknownBinding(String),
    #[error("binding '{0}' has empty action")]
    EmptyAction(String),
    #[error("binding '{0}' has invalid action '{1}': {2}")]
    InvalidAction(String, String, String),
    #[error("binding '{0}' uses cmd: but allow_commands=false")]
    CommandsDisabled(String),
    #[error("invalid profile name '{0}'")]
    BadName(String),
}

fn deserialize_bindings_flat<'de, D>(
    de: D,
) -> std::result::Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = toml::Value::deserialize(de)?;
    let table = match val {
        toml::Value::Table(t) => t,
        other => {
            return Err(serde::de::Error::custom(format!(
                "bindings must be a table, got {:?}",
                other.type_str()
            )));
        }
    };

    let mut out = HashMap::new();
    flatten_table("", &table, &mut out).map_err(serde::de::Error::custom)?;
    Ok(out)
}

fn flatten_table(
    prefix: &str,
    table: &toml::value::Table,
    out: &mut HashMap<String, String>,
) -> std::result::Result<(), String> {
    for (k, v) in table {
        let key = if prefix.is_empty() {
            k.clone()
        } else {
            format!("{prefix}.{k}")
        };
        match v {
            toml::Value::String(s) => {
                out.insert(key, s.clone());
            }
            toml::Value::Table(sub) => {
                flatten_table(&key, sub, out)?;
            }
            other => {
                return Err(format!(
                    "binding '{}' value must be a string, got {}",
                    key,
                    other.type_str()
                ));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DaemonConfigState {
    pub active_name: String,
    pub profile: Profile,
    pub config_dir: PathBuf,
    pub profiles_dir: PathBuf,
    pub active_ptr: PathBuf,
    pub detected_devices: Vec<String>,
}

pub fn config_dir() -> Result<PathBuf> {
    let dirs = UserDirs::new().ok_or_else(|| anyhow!("cannot determine home directory"))?;
    Ok(dirs.home_dir().join(".config").join("tapctl"))
}

fn default_profile_text() -> &'static str {
    include_str!("../profiles/default.toml")
}

impl DaemonConfigState {
    pub fn load_or_install_default() -> Result<Self> {
        Self::load_from(config_dir()?)
    }

    /// Load (installing the default profile if missing) from an explicit
    /// config directory.
    pub fn load_from(cfgdir: PathBuf) -> Result<Self> {
        let profdir = cfgdir.join("profiles");
        fs::create_dir_all(&profdir)
            .with_context(|| format!("failed to create {}", profdir.display()))?;

        let def_path = profdir.join("default.toml");
        if !def_path.exists() {
            fs::write(&def_path, default_profile_text())?;
            info!("installed default profile at {}", def_path.display());
        }

        let active_ptr = cfgdir.join("active");
        if !active_ptr.exists() {
            fs::write(&active_ptr, b"default")?;
        }

        let active_name = fs::read_to_string(&active_ptr)?.trim().to_string();
        let profile = load_profile(&profdir, &active_name)?;
        let detected_devices = input::discover_accelerometers()
            .into_iter()
            .map(|d| format!("{} ({})", d.name, d.path))
            .collect();

        Ok(Self {
            active_name,
            profile,
            config_dir: cfgdir,
            profiles_dir: profdir,
            active_ptr,
            detected_devices,
        })
    }

    /// Re-read the active profile. On error the last good profile is kept.
    pub fn reload(&mut self) -> Result<()> {
        self.profile = load_profile(&self.profiles_dir, &self.active_name)?;
        Ok(())
    }

    pub fn set_active(&mut self, name: &str) -> Result<()> {
        check_profile_name(name)?;
        let p = self.profiles_dir.join(format!("{name}.toml"));
        if !p.exists() {
            return Err(anyhow!("profile not found: {}", p.display()));
        }
        let profile = load_profile(&self.profiles_dir, name)?;
        fs::write(&self.active_ptr, name.as_bytes())?;
        self.active_name = name.to_string();
        self.profile = profile;
        Ok(())
    }

    pub fn list_profiles(&self) -> Vec<String> {
        let mut v = Vec::new();
        if let Ok(rd) = fs::read_dir(&self.profiles_dir) {
            for e in rd.flatten() {
                let path = e.path();
                if path.extension().is_some_and(|ext| ext == "toml") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        v.push(stem.to_string());
                    }
                }
            }
        }
        v.sort();
        v
    }

    /// Load a profile by name from this config's profile directory without
    /// making it active.
    pub fn peek_profile(&self, name: &str) -> Result<Profile> {
        load_profile(&self.profiles_dir, name)
    }

    pub fn doctor_report(&self) -> serde_json::Value {
        let uinput_ok = Path::new("/dev/uinput").exists();
        let in_input_group = check_in_input_group();
        let d = &self.profile.detector;
        serde_json::json!({
            "uinput_present": uinput_ok,
            "input_group_member": in_input_group,
            "profiles_dir": self.profiles_dir,
            "active_profile": self.active_name,
            "accelerometers": self.detected_devices,
            "detector": {
                "min_tap_gap_s": d.min_tap_gap_s,
                "max_group_gap_s": d.max_group_gap_s,
                "sample_rate_hz": d.sample_rate_hz,
                "slope_threshold": d.slope_threshold,
            },
            "hints": {
                "udev_rule": "/etc/udev/rules.d/80-uinput.rules",
                "add_user_to_input_group": "sudo usermod -aG input $USER && newgrp input"
            }
        })
    }
}

/// Profile names are bare file stems inside the profiles directory.
pub fn check_profile_name(name: &str) -> std::result::Result<(), ProfileError> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
        || name.contains("..");
    if bad {
        return Err(ProfileError::BadName(name.to_string()));
    }
    Ok(())
}

fn load_profile(dir: &Path, name: &str) -> Result<Profile> {
    check_profile_name(name)?;
    let path = dir.join(format!("{name}.toml"));
    let txt = fs::read_to_string(&path)
        .map_err(|e| anyhow!("failed to read {}: {e}", path.display()))?;
    let profile = parse_profile(&txt).map_err(|e| anyhow!("{}: {e}", path.display()))?;
    Ok(profile)
}

pub fn parse_profile(txt: &str) -> Result<Profile> {
    let profile: Profile = toml::from_str(txt).map_err(|e| anyhow!("failed to parse: {e}"))?;
    validate_profile(&profile)?;
    Ok(profile)
}

pub fn validate_profile(p: &Profile) -> std::result::Result<(), ProfileError> {
    let d = &p.detector;
    // written as !(x > 0) so NaN is rejected too
    for (name, v) in [
        ("min_tap_gap_s", d.min_tap_gap_s),
        ("max_group_gap_s", d.max_group_gap_s),
        ("sample_rate_hz", d.sample_rate_hz),
        ("slope_threshold", d.slope_threshold),
    ] {
        if !(v > 0.0) {
            return Err(ProfileError::NotPositive(name));
        }
    }
    if d.max_group_gap_s < d.min_tap_gap_s {
        return Err(ProfileError::GroupShorterThanGap);
    }

    for (k, v) in &p.bindings {
        if !BINDING_KEYS.contains(&k.as_str()) {
            return Err(ProfileError::UnknownBinding(k.clone()));
        }
        if v.trim().is_empty() {
            return Err(ProfileError::EmptyAction(k.clone()));
        }

        let action = actions::validate_action(v)
            .map_err(|e| ProfileError::InvalidAction(k.clone(), v.clone(), e.to_string()))?;
        if matches!(action, Action::Command(_)) && !p.meta.allow_commands {
            return Err(ProfileError::CommandsDisabled(k.clone()));
        }
    }
    Ok(())
}

fn check_in_input_group() -> bool {
    let Ok(s) = fs::read_to_string("/etc/group") else {
        return false;
    };
    let user = whoami::username();
    s.lines()
        .filter(|line| line.starts_with("input:"))
        .any(|line| {
            line.split(':')
                .nth(3)
                .unwrap_or("")
                .split(',')
                .any(|u| u == user)
        })
}
