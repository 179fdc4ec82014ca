// Copyright 2024 The sshlogd Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Declarative plugin configuration (C8): the `actions`/`events` YAML
//! documents that wire filters and actions to event kinds. A config root is
//! a directory holding one `sshlogd.yaml` plus every `*.yaml`/`*.yml` file
//! under its `conf.d/`; all of them are read and their `actions`/`events`
//! lists concatenated before validation runs once over the merged result.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde_derive::Deserialize;
use sshlogd_protocol::EventKind;

use crate::plugins::{actions, filters};

/// One `actions:` entry: a named, reusable action definition.
#[derive(Deserialize, Debug, Clone)]
pub struct ActionDef {
    pub action: String,
    pub plugin: String,
    #[serde(flatten)]
    pub params: serde_yaml::Mapping,
}

/// One action reference inside an `events[].actions` list: the name of a
/// declared [`ActionDef`] plus inline parameter overrides merged on top of
/// it at initialization time.
#[derive(Deserialize, Debug, Clone)]
pub struct ActionRef {
    pub action: String,
    #[serde(flatten)]
    pub overrides: serde_yaml::Mapping,
}

/// One `events:` entry.
#[derive(Deserialize, Debug, Clone)]
pub struct EventRule {
    pub event: String,
    pub triggers: Vec<EventKind>,
    #[serde(default)]
    pub filters: HashMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub actions: Vec<ActionRef>,
}

#[derive(Deserialize, Debug, Clone, Default)]
struct Document {
    #[serde(default)]
    actions: Vec<ActionDef>,
    #[serde(default)]
    events: Vec<EventRule>,
}

/// The merged, not-yet-validated configuration.
#[derive(Debug, Clone, Default)]
pub struct RootConfig {
    pub actions: Vec<ActionDef>,
    pub events: Vec<EventRule>,
}

/// Reads `<config_root>/sshlogd.yaml` (if present) plus every
/// `<config_root>/conf.d/*.yaml` and `*.yml` file, in sorted filename order
/// so merges are deterministic, and concatenates their `actions`/`events`
/// lists. A missing config root is not an error: a daemon with no plugin
/// config simply runs no rules.
pub fn load(config_root: &Path) -> anyhow::Result<RootConfig> {
    let mut merged = RootConfig::default();

    let root_file = config_root.join(crate::consts::CONFIG_ROOT_FILE_NAME);
    if root_file.exists() {
        merge_file(&root_file, &mut merged)?;
    }

    let conf_d = config_root.join(crate::consts::CONFIG_CONF_D_DIR_NAME);
    if conf_d.is_dir() {
        let mut entries: Vec<_> = fs::read_dir(&conf_d)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| is_yaml(p))
            .collect();
        entries.sort();
        for path in entries {
            merge_file(&path, &mut merged)?;
        }
    }

    Ok(merged)
}

fn is_yaml(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"))
}

fn merge_file(path: &Path, into: &mut RootConfig) -> anyhow::Result<()> {
    let contents = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading config file {}: {}", path.display(), e))?;
    let doc: Document = serde_yaml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("parsing config file {}: {}", path.display(), e))?;
    into.actions.extend(doc.actions);
    into.events.extend(doc.events);
    Ok(())
}

/// Validates `cfg` against the plugin registries, returning every error
/// found (not just the first) so the daemon can log each one before
/// refusing to start, per the `ConfigError` taxonomy.
pub fn validate(cfg: &RootConfig) -> Vec<String> {
    let mut errors = Vec::new();

    let mut action_names: HashMap<&str, usize> = HashMap::new();
    for action in &cfg.actions {
        *action_names.entry(action.action.as_str()).or_insert(0) += 1;
        if !actions::is_known_plugin(&action.plugin) {
            errors.push(format!("action '{}' references unknown plugin '{}'", action.action, action.plugin));
        }
    }
    for (name, count) in &action_names {
        if *count > 1 {
            errors.push(format!("duplicate action name '{name}'"));
        }
    }

    let mut event_names: HashMap<&str, usize> = HashMap::new();
    for event in &cfg.events {
        *event_names.entry(event.event.as_str()).or_insert(0) += 1;

        if event.triggers.is_empty() {
            errors.push(format!("event '{}' must declare at least one trigger", event.event));
        }

        for (filter_name, arg) in &event.filters {
            match filters::triggers_for(filter_name, arg) {
                Ok(filter_triggers) => {
                    let intersects = event.triggers.iter().any(|t| filter_triggers.contains(t));
                    if !intersects {
                        errors.push(format!(
                            "filter '{}' on event '{}' shares no triggers with the event (filter triggers {:?}, event triggers {:?})",
                            filter_name, event.event, filter_triggers, event.triggers
                        ));
                    }
                }
                Err(_) => {
                    errors.push(format!(
                        "event '{}' references unknown filter plugin '{}'",
                        event.event, filter_name
                    ));
                }
            }
        }

        for action_ref in &event.actions {
            if !action_names.contains_key(action_ref.action.as_str()) {
                errors.push(format!(
                    "event '{}' references undeclared action '{}'",
                    event.event, action_ref.action
                ));
            }
        }
    }
    for (name, count) in &event_names {
        if *count > 1 {
            errors.push(format!("duplicate event name '{name}'"));
        }
    }

    errors
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    #[test]
    fn loads_root_and_conf_d_and_concatenates() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("sshlogd.yaml"),
            r#"
actions:
  - action: log_all
    plugin: logfile_action
    log_file_path: /tmp/a.log
events:
  - event: any_command
    triggers: [command_start]
    actions:
      - action: log_all
"#,
        )
        .unwrap();
        fs::create_dir(dir.path().join("conf.d")).unwrap();
        fs::write(
            dir.path().join("conf.d/extra.yaml"),
            r#"
events:
  - event: uploads
    triggers: [file_upload]
"#,
        )
        .unwrap();

        let cfg = load(dir.path()).unwrap();
        assert_eq!(cfg.actions.len(), 1);
        assert_eq!(cfg.events.len(), 2);
        assert!(validate(&cfg).is_empty());
    }

    #[test]
    fn missing_config_root_yields_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load(&dir.path().join("does-not-exist")).unwrap();
        assert!(cfg.actions.is_empty());
        assert!(cfg.events.is_empty());
    }

    #[test]
    fn duplicate_action_names_are_rejected() {
        let cfg = RootConfig {
            actions: vec![
                ActionDef {
                    action: "a".into(),
                    plugin: "logfile_action".into(),
                    params: Default::default(),
                },
                ActionDef {
                    action: "a".into(),
                    plugin: "logfile_action".into(),
                    params: Default::default(),
                },
            ],
            events: vec![],
        };
        let errors = validate(&cfg);
        assert!(errors.iter().any(|e| e.contains("duplicate action")));
    }

    #[test]
    fn event_referencing_undeclared_action_is_rejected() {
        let cfg = RootConfig {
            actions: vec![],
            events: vec![EventRule {
                event: "e".into(),
                triggers: vec![EventKind::CommandStart],
                filters: Default::default(),
                actions: vec![ActionRef { action: "missing".into(), overrides: Default::default() }],
            }],
        };
        let errors = validate(&cfg);
        assert!(errors.iter().any(|e| e.contains("undeclared action")));
    }

    #[test]
    fn filter_with_no_trigger_overlap_is_rejected() {
        let mut filters = HashMap::new();
        filters.insert("upload_file_path_filter".to_string(), serde_yaml::Value::String("/tmp/x".into()));
        let cfg = RootConfig {
            actions: vec![],
            events: vec![EventRule {
                event: "e".into(),
                triggers: vec![EventKind::CommandStart],
                filters,
                actions: vec![],
            }],
        };
        let errors = validate(&cfg);
        assert!(errors.iter().any(|e| e.contains("shares no triggers")));
    }
}
