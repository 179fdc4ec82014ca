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

//! Built-in filter plugins. A filter's name in `events[].filters` is its
//! plugin name verbatim (e.g. `command_name_filter`), matching the closed
//! set enumerated in the specification.

use anyhow::{anyhow, bail};
use regex::Regex;
use serde_yaml::Value;
use sshlogd_protocol::{Event, EventKind};

use crate::consts::IGNORE_EXISTING_LOGIN_THRESHOLD;

pub trait Filter: Send + Sync {
    /// Event kinds this filter knows how to evaluate. Only consulted for
    /// events whose kind is in this set; configuration validation requires
    /// a non-empty intersection with the owning event rule's triggers.
    fn triggers(&self) -> Vec<EventKind>;

    /// `Ok(true)` lets the event continue through the pipeline, `Ok(false)`
    /// drops it. `Err` is treated identically to `Ok(false)` by the caller,
    /// but is logged first.
    fn evaluate(&self, event: &Event) -> anyhow::Result<bool>;
}

const COMMAND_TRIGGERS: [EventKind; 2] = [EventKind::CommandStart, EventKind::CommandFinish];
const UPLOAD_TRIGGERS: [EventKind; 1] = [EventKind::FileUpload];
const CONNECTION_TRIGGERS: [EventKind; 3] =
    [EventKind::ConnectionEstablished, EventKind::ConnectionAuthFailed, EventKind::ConnectionClose];

/// Returns the set of triggers the named filter, constructed with `arg`,
/// would declare — used by config validation to check the filter/event
/// trigger intersection without fully constructing (and thus without first
/// having a session tracker wired up). Returns `Err` for an unknown name.
pub fn triggers_for(name: &str, arg: &Value) -> anyhow::Result<Vec<EventKind>> {
    Ok(build(name, arg)?.triggers())
}

/// Constructs the named filter plugin from its configured argument.
pub fn build(name: &str, arg: &Value) -> anyhow::Result<Box<dyn Filter>> {
    Ok(match name {
        "command_name_filter" => Box::new(StringMatchFilter::new(COMMAND_TRIGGERS.to_vec(), Field::Filename, arg)?),
        "command_name_regex_filter" => {
            Box::new(RegexMatchFilter::new(COMMAND_TRIGGERS.to_vec(), Field::Filename, arg)?)
        }
        "command_exit_code_filter" => Box::new(CommandExitCodeFilter::new(arg)?),
        "command_output_contains_filter" => {
            Box::new(ContainsMatchFilter::new(vec![EventKind::CommandFinish], Field::Stdout, arg)?)
        }
        "command_output_contains_regex_filter" => {
            Box::new(RegexMatchFilter::new(vec![EventKind::CommandFinish], Field::Stdout, arg)?)
        }
        "upload_file_path_filter" => {
            Box::new(CanonicalPathMatchFilter::new(UPLOAD_TRIGGERS.to_vec(), Field::TargetPath, arg)?)
        }
        "upload_file_path_regex_filter" => {
            Box::new(RegexMatchFilter::new(UPLOAD_TRIGGERS.to_vec(), Field::TargetPath, arg)?)
        }
        "username_filter" => Box::new(UsernameFilter::new(arg)?),
        "username_regex_filter" => {
            Box::new(RegexMatchFilter::new(sshlogd_protocol::ALL_SUBSCRIBABLE_EVENT_KINDS.to_vec(), Field::Username, arg)?)
        }
        "require_tty_filter" => Box::new(RequireTtyFilter::new(arg)),
        "ignore_existing_logins_filter" => Box::new(IgnoreExistingLoginsFilter),
        other => bail!("unknown filter plugin '{other}'"),
    })
}

#[derive(Clone, Copy)]
enum Field {
    Filename,
    Stdout,
    TargetPath,
    Username,
}

impl Field {
    fn get<'a>(&self, event: &'a Event) -> &'a str {
        match self {
            Field::Filename => &event.filename,
            Field::Stdout => &event.stdout,
            Field::TargetPath => &event.target_path,
            Field::Username => &event.username,
        }
    }
}

/// Matches a field against a literal string or a list of literal strings.
struct StringMatchFilter {
    triggers: Vec<EventKind>,
    field: Field,
    candidates: Vec<String>,
}

impl StringMatchFilter {
    fn new(triggers: Vec<EventKind>, field: Field, arg: &Value) -> anyhow::Result<StringMatchFilter> {
        let candidates = match arg {
            Value::String(s) => vec![s.clone()],
            Value::Sequence(items) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string).ok_or_else(|| anyhow!("list entries must be strings")))
                .collect::<anyhow::Result<Vec<_>>>()?,
            other => bail!("expected a string or list of strings, got {other:?}"),
        };
        Ok(StringMatchFilter { triggers, field, candidates })
    }
}

impl Filter for StringMatchFilter {
    fn triggers(&self) -> Vec<EventKind> {
        self.triggers.clone()
    }

    fn evaluate(&self, event: &Event) -> anyhow::Result<bool> {
        let value = self.field.get(event);
        Ok(self.candidates.iter().any(|c| c == value))
    }
}

/// Matches a field by substring, not equality (e.g. stdout containing one of
/// the configured needles anywhere in it).
struct ContainsMatchFilter {
    triggers: Vec<EventKind>,
    field: Field,
    candidates: Vec<String>,
}

impl ContainsMatchFilter {
    fn new(triggers: Vec<EventKind>, field: Field, arg: &Value) -> anyhow::Result<ContainsMatchFilter> {
        let candidates = match arg {
            Value::String(s) => vec![s.clone()],
            Value::Sequence(items) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string).ok_or_else(|| anyhow!("list entries must be strings")))
                .collect::<anyhow::Result<Vec<_>>>()?,
            other => bail!("expected a string or list of strings, got {other:?}"),
        };
        Ok(ContainsMatchFilter { triggers, field, candidates })
    }
}

impl Filter for ContainsMatchFilter {
    fn triggers(&self) -> Vec<EventKind> {
        self.triggers.clone()
    }

    fn evaluate(&self, event: &Event) -> anyhow::Result<bool> {
        let value = self.field.get(event);
        Ok(self.candidates.iter().any(|c| value.contains(c.as_str())))
    }
}

/// Matches a field against a literal path (or list of paths), canonicalizing
/// both sides before comparing so `/a/./b` and a symlinked equivalent still
/// match. A path that fails to canonicalize (e.g. it doesn't exist) falls
/// back to the literal string.
struct CanonicalPathMatchFilter {
    triggers: Vec<EventKind>,
    field: Field,
    candidates: Vec<String>,
}

impl CanonicalPathMatchFilter {
    fn new(triggers: Vec<EventKind>, field: Field, arg: &Value) -> anyhow::Result<CanonicalPathMatchFilter> {
        let candidates = match arg {
            Value::String(s) => vec![canonicalize_lossy(s)],
            Value::Sequence(items) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(canonicalize_lossy)
                        .ok_or_else(|| anyhow!("list entries must be strings"))
                })
                .collect::<anyhow::Result<Vec<_>>>()?,
            other => bail!("expected a string or list of strings, got {other:?}"),
        };
        Ok(CanonicalPathMatchFilter { triggers, field, candidates })
    }
}

fn canonicalize_lossy(path: &str) -> String {
    std::fs::canonicalize(path)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string())
}

impl Filter for CanonicalPathMatchFilter {
    fn triggers(&self) -> Vec<EventKind> {
        self.triggers.clone()
    }

    fn evaluate(&self, event: &Event) -> anyhow::Result<bool> {
        let value = canonicalize_lossy(self.field.get(event));
        Ok(self.candidates.iter().any(|c| c == &value))
    }
}

/// Matches a field against a regex.
struct RegexMatchFilter {
    triggers: Vec<EventKind>,
    field: Field,
    re: Regex,
}

impl RegexMatchFilter {
    fn new(triggers: Vec<EventKind>, field: Field, arg: &Value) -> anyhow::Result<RegexMatchFilter> {
        let pattern = arg.as_str().ok_or_else(|| anyhow!("expected a regex string"))?;
        Ok(RegexMatchFilter { triggers, field, re: Regex::new(pattern)? })
    }
}

impl Filter for RegexMatchFilter {
    fn triggers(&self) -> Vec<EventKind> {
        self.triggers.clone()
    }

    fn evaluate(&self, event: &Event) -> anyhow::Result<bool> {
        Ok(self.re.is_match(self.field.get(event)))
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Op {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Op {
    fn parse(s: &str) -> anyhow::Result<Op> {
        Ok(match s {
            "<" => Op::Lt,
            "<=" => Op::Le,
            ">" => Op::Gt,
            ">=" => Op::Ge,
            "=" => Op::Eq,
            "!=" => Op::Ne,
            other => bail!("unknown comparison operator '{other}'"),
        })
    }

    fn apply(&self, lhs: i64, rhs: i64) -> bool {
        match self {
            Op::Lt => lhs < rhs,
            Op::Le => lhs <= rhs,
            Op::Gt => lhs > rhs,
            Op::Ge => lhs >= rhs,
            Op::Eq => lhs == rhs,
            Op::Ne => lhs != rhs,
        }
    }
}

enum ExitCodeMatch {
    List(Vec<i64>),
    Comparison(Op, i64),
}

struct CommandExitCodeFilter {
    matcher: ExitCodeMatch,
}

impl CommandExitCodeFilter {
    fn new(arg: &Value) -> anyhow::Result<CommandExitCodeFilter> {
        let matcher = match arg {
            Value::Sequence(items) => ExitCodeMatch::List(
                items.iter().map(|v| v.as_i64().ok_or_else(|| anyhow!("exit code list entries must be numbers"))).collect::<anyhow::Result<_>>()?,
            ),
            Value::Number(n) => {
                // bare number means equality
                let n = n.as_i64().ok_or_else(|| anyhow!("exit code must be an integer"))?;
                ExitCodeMatch::Comparison(Op::Eq, n)
            }
            Value::Mapping(m) => {
                let op = m
                    .get(Value::String("op".to_string()))
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("comparison form requires 'op'"))?;
                let number = m
                    .get(Value::String("number".to_string()))
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| anyhow!("comparison form requires integer 'number'"))?;
                ExitCodeMatch::Comparison(Op::parse(op)?, number)
            }
            other => bail!("unsupported exit code filter argument {other:?}"),
        };
        Ok(CommandExitCodeFilter { matcher })
    }
}

impl Filter for CommandExitCodeFilter {
    fn triggers(&self) -> Vec<EventKind> {
        vec![EventKind::CommandFinish]
    }

    fn evaluate(&self, event: &Event) -> anyhow::Result<bool> {
        Ok(match &self.matcher {
            ExitCodeMatch::List(values) => values.contains(&event.exit_code),
            ExitCodeMatch::Comparison(op, n) => op.apply(event.exit_code, *n),
        })
    }
}

enum UsernameMatch {
    Wildcard,
    Literals(Vec<String>),
}

struct UsernameFilter {
    matcher: UsernameMatch,
}

impl UsernameFilter {
    fn new(arg: &Value) -> anyhow::Result<UsernameFilter> {
        let matcher = match arg {
            Value::Null => UsernameMatch::Wildcard,
            Value::String(s) if s == "*" || s.is_empty() => UsernameMatch::Wildcard,
            Value::String(s) => UsernameMatch::Literals(vec![s.clone()]),
            Value::Sequence(items) => UsernameMatch::Literals(
                items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string).ok_or_else(|| anyhow!("usernames must be strings")))
                    .collect::<anyhow::Result<_>>()?,
            ),
            other => bail!("unsupported username filter argument {other:?}"),
        };
        Ok(UsernameFilter { matcher })
    }
}

impl Filter for UsernameFilter {
    fn triggers(&self) -> Vec<EventKind> {
        sshlogd_protocol::ALL_SUBSCRIBABLE_EVENT_KINDS.to_vec()
    }

    fn evaluate(&self, event: &Event) -> anyhow::Result<bool> {
        Ok(match &self.matcher {
            UsernameMatch::Wildcard => true,
            UsernameMatch::Literals(names) => names.iter().any(|n| n == &event.username),
        })
    }
}

struct RequireTtyFilter {
    require: bool,
}

impl RequireTtyFilter {
    fn new(arg: &Value) -> RequireTtyFilter {
        // default true: any non-`false` argument (including absent/null) requires a tty.
        RequireTtyFilter { require: arg.as_bool().unwrap_or(true) }
    }
}

impl Filter for RequireTtyFilter {
    fn triggers(&self) -> Vec<EventKind> {
        sshlogd_protocol::ALL_SUBSCRIBABLE_EVENT_KINDS.to_vec()
    }

    fn evaluate(&self, event: &Event) -> anyhow::Result<bool> {
        Ok(!self.require || event.tty_id >= 0)
    }
}

struct IgnoreExistingLoginsFilter;

impl Filter for IgnoreExistingLoginsFilter {
    fn triggers(&self) -> Vec<EventKind> {
        CONNECTION_TRIGGERS.to_vec()
    }

    fn evaluate(&self, event: &Event) -> anyhow::Result<bool> {
        let now = chrono::Utc::now().timestamp_millis();
        let age = now - event.start_time;
        Ok(age <= IGNORE_EXISTING_LOGIN_THRESHOLD.as_millis() as i64)
    }
}
