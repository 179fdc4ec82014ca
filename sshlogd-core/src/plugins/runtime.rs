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

//! Wires loaded, validated plugin configuration to the event bus: one
//! [`EventSubscription`] per configured event rule, actions dispatched on a
//! shared worker pool.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_yaml::Mapping;
use sshlogd_protocol::{Event, EventKind};
use tracing::warn;

use crate::config::{self, RootConfig};
use crate::event_bus::{EventBus, EventSubscriber};
use crate::plugins::actions::{self, Action};
use crate::plugins::filters::{self, Filter};
use crate::plugins::pool::WorkerPool;

/// The bus subscriber for one `events:` rule: evaluates its filters in
/// configured order, then submits every action's execution to the shared
/// pool. Exceptions from a filter or action are logged and isolated — they
/// never propagate back into the bus's `publish` call.
struct EventSubscription {
    name: String,
    filters: Vec<Box<dyn Filter>>,
    actions: Vec<Arc<dyn Action>>,
    pool: Arc<WorkerPool>,
}

impl EventSubscriber for EventSubscription {
    fn on_event(&self, kind: EventKind, event: &Event) {
        for filter in &self.filters {
            if !filter.triggers().contains(&kind) {
                continue;
            }
            match filter.evaluate(event) {
                Ok(true) => {}
                Ok(false) => return,
                Err(err) => {
                    warn!("filter error on event rule '{}': {:?}; dropping", self.name, err);
                    return;
                }
            }
        }

        for action in &self.actions {
            let action = action.clone();
            let event = event.clone();
            let name = self.name.clone();
            self.pool.submit(move || {
                if let Err(err) = action.execute(&event) {
                    warn!("action failed for event rule '{}': {:?}", name, err);
                }
            });
        }
    }
}

/// The live runtime: owns the worker pool and every [`EventSubscription`],
/// plus the bus reference needed to unsubscribe them on shutdown.
pub struct PluginRuntime {
    bus: Arc<EventBus>,
    subscriptions: Vec<(Vec<EventKind>, Arc<dyn EventSubscriber>)>,
    actions: Vec<Arc<dyn Action>>,
    pool: Arc<WorkerPool>,
}

impl PluginRuntime {
    /// Loads and validates the plugin configuration rooted at `config_root`.
    /// Returns every validation error found (possibly across several files)
    /// without constructing anything, so the caller can log them all and
    /// refuse to start per the `ConfigError` taxonomy.
    pub fn load(config_root: &Path) -> Result<RootConfig, Vec<String>> {
        let cfg = config::load(config_root).map_err(|e| vec![e.to_string()])?;
        let errors = config::validate(&cfg);
        if errors.is_empty() {
            Ok(cfg)
        } else {
            Err(errors)
        }
    }

    /// Builds and subscribes one [`EventSubscription`] per event rule in
    /// `cfg` (already validated by [`PluginRuntime::load`]).
    pub fn start(cfg: RootConfig, bus: Arc<EventBus>) -> anyhow::Result<PluginRuntime> {
        let pool = Arc::new(WorkerPool::default_sized());

        let mut action_defs = HashMap::new();
        for def in &cfg.actions {
            action_defs.insert(def.action.as_str(), def);
        }

        let mut subscriptions = Vec::new();
        let mut all_actions = Vec::new();
        for rule in &cfg.events {
            let mut filter_objs = Vec::new();
            for (filter_name, arg) in &rule.filters {
                filter_objs.push(filters::build(filter_name, arg)?);
            }

            let mut action_objs = Vec::new();
            for action_ref in &rule.actions {
                let def = action_defs
                    .get(action_ref.action.as_str())
                    .ok_or_else(|| anyhow::anyhow!("undeclared action '{}'", action_ref.action))?;
                let merged = merge_params(&def.params, &action_ref.overrides);
                let action: Arc<dyn Action> = Arc::from(actions::build(&def.plugin, &action_ref.action, &merged)?);
                action_objs.push(action.clone());
                all_actions.push(action);
            }

            let sub: Arc<dyn EventSubscriber> = Arc::new(EventSubscription {
                name: rule.event.clone(),
                filters: filter_objs,
                actions: action_objs,
                pool: pool.clone(),
            });
            bus.subscribe(sub.clone(), Some(&rule.triggers));
            subscriptions.push((rule.triggers.clone(), sub));
        }

        Ok(PluginRuntime { bus, subscriptions, actions: all_actions, pool })
    }

    /// Unsubscribes every rule from the bus, shuts the worker pool down
    /// (draining already-queued action work first), then calls `shutdown`
    /// on every action instance.
    pub fn shutdown(mut self) {
        for (triggers, sub) in &self.subscriptions {
            self.bus.unsubscribe(sub, Some(triggers));
        }
        // drop our own references too, so each EventSubscription (and the
        // pool clone it holds) goes away and the pool below is uniquely ours.
        self.subscriptions.clear();

        match Arc::try_unwrap(self.pool) {
            Ok(pool) => pool.shutdown(),
            Err(pool) => {
                // a delivery still in flight is holding a clone; nothing
                // more will be submitted, so just let it drain on its own.
                warn!("action pool still referenced at shutdown; submitted work will still drain");
                drop(pool);
            }
        }
        for action in &self.actions {
            action.shutdown();
        }
    }
}

fn merge_params(base: &Mapping, overrides: &Mapping) -> Mapping {
    let mut merged = base.clone();
    for (k, v) in overrides {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tracker::Tracker;
    use std::fs;

    #[test]
    fn end_to_end_rule_runs_action_on_matching_event() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("out.log");
        fs::write(
            dir.path().join("sshlogd.yaml"),
            format!(
                r#"
actions:
  - action: log_all
    plugin: logfile_action
    log_file_path: {:?}
events:
  - event: commands
    triggers: [command_start]
    filters:
      command_name_filter: bash
    actions:
      - action: log_all
"#,
                log_path.to_str().unwrap()
            ),
        )
        .unwrap();

        let cfg = PluginRuntime::load(dir.path()).unwrap();
        let tracker = Arc::new(Tracker::new());
        tracker.on_event(
            EventKind::ConnectionEstablished,
            &Event { ptm_pid: 1, username: "a".into(), ..Default::default() },
        );
        let bus = Arc::new(EventBus::new(tracker));
        let runtime = PluginRuntime::start(cfg, bus.clone()).unwrap();

        bus.publish(
            EventKind::CommandStart,
            Event { ptm_pid: 1, filename: "bash".into(), username: "a".into(), ..Default::default() },
        );
        bus.publish(
            EventKind::CommandStart,
            Event { ptm_pid: 1, filename: "zsh".into(), username: "a".into(), ..Default::default() },
        );

        runtime.shutdown();

        let contents = fs::read_to_string(&log_path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("\"filename\":\"bash\""));
    }

    #[test]
    fn config_with_validation_errors_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("sshlogd.yaml"),
            r#"
events:
  - event: bad
    triggers: [command_start]
    actions:
      - action: nonexistent
"#,
        )
        .unwrap();

        let errors = PluginRuntime::load(dir.path()).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("undeclared action")));
    }
}
