//! Three-way merge of TOML configuration documents.
//!
//! The user's deviation from the previously shipped defaults is replayed on
//! top of the newly shipped defaults. Arrays are atomic values.

use std::collections::BTreeSet;

use kitup_core::{ConfigConflict, UpgradeError};
use toml::{Table, Value};

/// Key path used for conflicts that concern the whole document.
pub const DOCUMENT_KEY: &str = "<document>";

#[derive(Debug, Clone, PartialEq)]
pub struct MergedConfig {
    pub merged: Table,
    /// Keys whose user value survived the merge.
    pub kept_user_keys: Vec<String>,
    /// Keys the incoming defaults added, changed, or dropped.
    pub incoming_changes: Vec<String>,
}

impl MergedConfig {
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(&self.merged)
    }
}

/// Merges already-parsed documents. On failure every colliding key is
/// reported; nothing is picked silently.
pub fn merge_config(
    base: &Table,
    user: &Table,
    incoming: &Table,
) -> Result<MergedConfig, Vec<ConfigConflict>> {
    let mut state = MergeState::default();
    let merged = merge_tables("", Some(base), user, incoming, &mut state);
    check_schema("", &merged, incoming, &mut state.conflicts);

    if state.conflicts.is_empty() {
        if let Err(reason) = reserializes(&merged) {
            state.conflicts.push(ConfigConflict {
                key_path: DOCUMENT_KEY.to_string(),
                user: None,
                incoming: None,
                reason,
            });
        }
    }

    if !state.conflicts.is_empty() {
        return Err(state.conflicts);
    }
    Ok(MergedConfig {
        merged,
        kept_user_keys: state.kept_user_keys,
        incoming_changes: state.incoming_changes,
    })
}

/// Parses the three documents and merges them, reporting problems against
/// `path`.
pub fn merge_config_str(
    path: &str,
    base: &str,
    user: &str,
    incoming: &str,
) -> Result<MergedConfig, UpgradeError> {
    let parse = |label: &str, raw: &str| {
        toml::from_str::<Table>(raw).map_err(|err| UpgradeError::MergeConflict {
            path: path.to_string(),
            conflicts: vec![ConfigConflict {
                key_path: DOCUMENT_KEY.to_string(),
                user: None,
                incoming: None,
                reason: format!("{label} document does not parse: {}", err.message()),
            }],
        })
    };
    let base = parse("base", base)?;
    let user = parse("user", user)?;
    let incoming = parse("incoming", incoming)?;

    merge_config(&base, &user, &incoming).map_err(|conflicts| UpgradeError::MergeConflict {
        path: path.to_string(),
        conflicts,
    })
}

#[derive(Default)]
struct MergeState {
    kept_user_keys: Vec<String>,
    incoming_changes: Vec<String>,
    conflicts: Vec<ConfigConflict>,
}

fn merge_tables(
    prefix: &str,
    base: Option<&Table>,
    user: &Table,
    incoming: &Table,
    state: &mut MergeState,
) -> Table {
    let keys: BTreeSet<&String> = base
        .into_iter()
        .flat_map(|table| table.keys())
        .chain(user.keys())
        .chain(incoming.keys())
        .collect();

    let mut merged = Table::new();
    for key in keys {
        let key_path = join_key(prefix, key);
        let base_value = base.and_then(|table| table.get(key));
        let user_value = user.get(key);
        let incoming_value = incoming.get(key);

        let chosen = if options_equal(user_value, base_value) {
            if !options_equal(incoming_value, base_value) {
                state.incoming_changes.push(key_path);
            }
            incoming_value.cloned()
        } else if options_equal(incoming_value, base_value)
            || options_equal(user_value, incoming_value)
        {
            state.kept_user_keys.push(key_path);
            user_value.cloned()
        } else if let (Some(Value::Table(user_table)), Some(Value::Table(incoming_table))) =
            (user_value, incoming_value)
        {
            let base_table = base_value.and_then(Value::as_table);
            Some(Value::Table(merge_tables(
                &key_path,
                base_table,
                user_table,
                incoming_table,
                state,
            )))
        } else {
            state.conflicts.push(ConfigConflict {
                key_path,
                user: user_value.map(render_value),
                incoming: incoming_value.map(render_value),
                reason: "changed by both the user and the new release".to_string(),
            });
            user_value.cloned()
        };

        if let Some(value) = chosen {
            merged.insert(key.clone(), value);
        }
    }
    merged
}

/// Keys shared with the incoming defaults must keep the incoming type.
fn check_schema(prefix: &str, merged: &Table, incoming: &Table, conflicts: &mut Vec<ConfigConflict>) {
    for (key, incoming_value) in incoming {
        let Some(merged_value) = merged.get(key) else {
            continue;
        };
        let key_path = join_key(prefix, key);
        match (merged_value, incoming_value) {
            (Value::Table(merged_table), Value::Table(incoming_table)) => {
                check_schema(&key_path, merged_table, incoming_table, conflicts);
            }
            _ if merged_value.same_type(incoming_value) => {}
            _ => conflicts.push(ConfigConflict {
                key_path,
                user: Some(render_value(merged_value)),
                incoming: Some(render_value(incoming_value)),
                reason: format!(
                    "value of type {} does not match the shipped type {}",
                    merged_value.type_str(),
                    incoming_value.type_str()
                ),
            }),
        }
    }
}

fn reserializes(merged: &Table) -> Result<(), String> {
    let encoded =
        toml::to_string(merged).map_err(|err| format!("merged document does not serialize: {err}"))?;
    let decoded = toml::from_str::<Table>(&encoded)
        .map_err(|err| format!("merged document does not re-parse: {}", err.message()))?;
    if !tables_equal(&decoded, merged) {
        return Err("merged document changes when re-parsed".to_string());
    }
    Ok(())
}

/// Structural equality where a NaN float equals any other NaN, so an
/// untouched `nan` setting never reads as an edit.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Float(left), Value::Float(right)) => {
            left == right || (left.is_nan() && right.is_nan())
        }
        (Value::Array(left), Value::Array(right)) => {
            left.len() == right.len()
                && left.iter().zip(right).all(|(left, right)| values_equal(left, right))
        }
        (Value::Table(left), Value::Table(right)) => tables_equal(left, right),
        _ => left == right,
    }
}

pub(crate) fn tables_equal(left: &Table, right: &Table) -> bool {
    left.len() == right.len()
        && left.iter().all(|(key, value)| {
            right
                .get(key)
                .is_some_and(|other| values_equal(value, other))
        })
}

fn options_equal(left: Option<&Value>, right: Option<&Value>) -> bool {
    match (left, right) {
        (Some(left), Some(right)) => values_equal(left, right),
        (None, None) => true,
        _ => false,
    }
}

fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn render_value(value: &Value) -> String {
    value.to_string()
}
