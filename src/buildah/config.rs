//! Container configuration and snapshot diffing.
//!
//! A [`Container`](super::Container) keeps two copies of its configuration:
//! the public, freely mutable one and a snapshot of what buildah last
//! acknowledged. [`ContainerConfig::diff`] turns the difference into
//! `buildah config` directives. Maps and sets are ordered so the emitted
//! argument vector is deterministic.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::error::{Error, Result};

/// Mutable image configuration of a working container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerConfig {
    pub env: BTreeMap<String, String>,
    pub command: Vec<String>,
    pub entrypoint: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub volumes: BTreeSet<String>,
    pub workdir: String,
}

/// A single `buildah config` change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigDirective {
    Command(Vec<String>),
    Entrypoint(Vec<String>),
    WorkingDir(String),
    SetEnv { key: String, value: String },
    UnsetEnv(String),
    SetLabel { key: String, value: String },
    UnsetLabel(String),
    AddVolume(String),
    RemoveVolume(String),
}

impl ConfigDirective {
    /// Flag and value for this directive.
    pub fn to_args(&self) -> [String; 2] {
        match self {
            Self::Command(cmd) => ["--cmd".to_string(), join_shell_words(cmd)],
            Self::Entrypoint(ep) => [
                "--entrypoint".to_string(),
                // A Vec<String> always serializes.
                serde_json::to_string(ep).unwrap_or_else(|_| "[]".to_string()),
            ],
            Self::WorkingDir(dir) => ["--workingdir".to_string(), dir.clone()],
            Self::SetEnv { key, value } => ["--env".to_string(), format!("{key}={value}")],
            Self::UnsetEnv(key) => ["--env".to_string(), format!("{key}-")],
            Self::SetLabel { key, value } => ["--label".to_string(), format!("{key}={value}")],
            Self::UnsetLabel(key) => ["--label".to_string(), format!("{key}-")],
            Self::AddVolume(vol) => ["--volume".to_string(), vol.clone()],
            Self::RemoveVolume(vol) => ["--volume".to_string(), format!("{vol}-")],
        }
    }
}

/// Flattens directives into a `buildah config` argument list.
pub fn directive_args(directives: &[ConfigDirective]) -> Vec<String> {
    directives.iter().flat_map(ConfigDirective::to_args).collect()
}

/// Quotes each word for buildah's shell-words parser.
///
/// Every word is single-quoted; embedded single quotes become `'\''`.
pub fn join_shell_words<S: AsRef<str>>(words: &[S]) -> String {
    words
        .iter()
        .map(|w| format!("'{}'", w.as_ref().replace('\'', r"'\''")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Changed-or-added keys and removed keys between two maps.
fn map_diff<'a>(
    old: &'a BTreeMap<String, String>,
    new: &'a BTreeMap<String, String>,
) -> (Vec<(&'a String, &'a String)>, Vec<&'a String>) {
    let changed = new
        .iter()
        .filter(|(k, v)| old.get(*k) != Some(*v))
        .collect();
    let removed = old.keys().filter(|k| !new.contains_key(*k)).collect();
    (changed, removed)
}

impl ContainerConfig {
    /// Directives that turn `snapshot` into `self`. Empty when equal.
    pub fn diff(&self, snapshot: &ContainerConfig) -> Vec<ConfigDirective> {
        let mut out = Vec::new();

        if self.command != snapshot.command {
            out.push(ConfigDirective::Command(self.command.clone()));
        }
        if self.entrypoint != snapshot.entrypoint {
            out.push(ConfigDirective::Entrypoint(self.entrypoint.clone()));
        }
        if self.workdir != snapshot.workdir {
            out.push(ConfigDirective::WorkingDir(self.workdir.clone()));
        }

        let (changed, removed) = map_diff(&snapshot.env, &self.env);
        out.extend(changed.into_iter().map(|(k, v)| ConfigDirective::SetEnv {
            key: k.clone(),
            value: v.clone(),
        }));
        out.extend(removed.into_iter().cloned().map(ConfigDirective::UnsetEnv));

        let (changed, removed) = map_diff(&snapshot.labels, &self.labels);
        out.extend(changed.into_iter().map(|(k, v)| ConfigDirective::SetLabel {
            key: k.clone(),
            value: v.clone(),
        }));
        out.extend(removed.into_iter().cloned().map(ConfigDirective::UnsetLabel));

        out.extend(
            self.volumes
                .difference(&snapshot.volumes)
                .cloned()
                .map(ConfigDirective::AddVolume),
        );
        out.extend(
            snapshot
                .volumes
                .difference(&self.volumes)
                .cloned()
                .map(ConfigDirective::RemoveVolume),
        );

        out
    }

    /// Reads configuration out of `buildah inspect --type container` output.
    ///
    /// The `Config` field is itself a JSON document (possibly empty) whose
    /// `config` object carries the OCI image settings.
    pub fn from_inspect(id: &str, info: &Value) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidMetadata {
            id: id.to_string(),
            reason,
        };

        let raw = match info.get("Config") {
            None | Some(Value::Null) => return Ok(Self::default()),
            Some(Value::String(s)) if s.trim().is_empty() => return Ok(Self::default()),
            Some(Value::String(s)) => s,
            Some(other) => return Err(invalid(format!("Config is not a string: {other}"))),
        };
        let doc: Value = serde_json::from_str(raw)
            .map_err(|e| invalid(format!("Config is not JSON: {e}")))?;
        let config = match doc.get("config") {
            Some(Value::Object(_)) => &doc["config"],
            _ => return Ok(Self::default()),
        };

        let env = string_list(config.get("Env"))
            .into_iter()
            .map(|item| match item.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (item, String::new()),
            })
            .collect();

        let labels = match config.get("Labels") {
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| {
                    let v = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                    (k.clone(), v)
                })
                .collect(),
            _ => BTreeMap::new(),
        };

        let volumes = match config.get("Volumes") {
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            _ => BTreeSet::new(),
        };

        Ok(Self {
            env,
            command: string_list(config.get("Cmd")),
            entrypoint: string_list(config.get("Entrypoint")),
            labels,
            volumes,
            workdir: config
                .get("WorkingDir")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}
