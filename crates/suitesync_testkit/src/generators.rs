//! Property-based test generators using proptest.
//!
//! Histories only touch suite fields that stay valid under any sequence of
//! edits, so every generated update applies cleanly to a typed [`Suite`].
//!
//! [`Suite`]: suitesync_protocol::Suite

use crate::fixtures::suite_doc;
use proptest::prelude::*;
use serde_json::json;
use suitesync_protocol::{Collection, Fields, JsonValue, UpdateChange};

/// One field edit within an update.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldEdit {
    /// Assign a value.
    Set(&'static str, JsonValue),
    /// Remove the field.
    Delete(&'static str),
}

/// Strategy for a single edit of a suite field.
pub fn suite_edit_strategy() -> impl Strategy<Value = FieldEdit> {
    prop_oneof![
        "[a-z]{1,8}".prop_map(|name| FieldEdit::Set("name", json!(name))),
        prop::collection::vec("[a-z]{1,4}", 0..3)
            .prop_map(|tags| FieldEdit::Set("tags", json!(tags))),
        (0u64..100).prop_map(|n| FieldEdit::Set("planned_cases", json!(n))),
        prop_oneof![Just("passed"), Just("failed")]
            .prop_map(|r| FieldEdit::Set("result", json!(r))),
        prop_oneof![Just("started"), Just("finished"), Just("disconnected")]
            .prop_map(|s| FieldEdit::Set("status", json!(s))),
        prop_oneof![
            Just("name"),
            Just("tags"),
            Just("planned_cases"),
            Just("result")
        ]
        .prop_map(FieldEdit::Delete),
    ]
}

/// Strategy for the updates a suite receives after its insert at version 1.
///
/// Versions run 2, 3, ... in server order.
pub fn suite_history_strategy(
    id: impl Into<String>,
    max_updates: usize,
) -> impl Strategy<Value = Vec<UpdateChange>> {
    let id = id.into();
    prop::collection::vec(
        prop::collection::vec(suite_edit_strategy(), 1..4),
        1..max_updates.max(2),
    )
    .prop_map(move |edits| {
        edits
            .into_iter()
            .enumerate()
            .map(|(i, edits)| build_update(Collection::Suites, &id, i as u64 + 2, edits))
            .collect()
    })
}

/// A history plus the version a snapshot row was taken at and where in the
/// feed that row lands.
pub fn snapshot_race_strategy(
    id: impl Into<String>,
    max_updates: usize,
) -> impl Strategy<Value = (Vec<UpdateChange>, u64, usize)> {
    suite_history_strategy(id, max_updates).prop_flat_map(|history| {
        let versions = 1..=history.len() as u64 + 1;
        let positions = 0..=history.len();
        (Just(history), versions, positions)
    })
}

/// Builds an update from a list of edits.
pub fn build_update(
    collection: Collection,
    id: &str,
    version: u64,
    edits: Vec<FieldEdit>,
) -> UpdateChange {
    edits
        .into_iter()
        .fold(UpdateChange::new(collection, id, version), |update, edit| {
            match edit {
                FieldEdit::Set(field, value) => update.set(field, value),
                FieldEdit::Delete(field) => update.delete(field),
            }
        })
}

/// Applies `updates` in order to `doc`, the way the server does.
pub fn replay(doc: &JsonValue, updates: &[UpdateChange]) -> JsonValue {
    let mut fields = match doc {
        JsonValue::Object(fields) => fields.clone(),
        _ => Fields::new(),
    };
    for update in updates {
        update.apply_fields(&mut fields);
        fields.insert("version".into(), JsonValue::from(update.version));
    }
    JsonValue::Object(fields)
}

/// The server's copy of suite `id` at `version`, given its history.
pub fn suite_at(id: &str, history: &[UpdateChange], version: u64) -> JsonValue {
    let applied = history.iter().take_while(|u| u.version <= version).count();
    replay(&suite_doc(id, 1), &history[..applied])
}

#[cfg(test)]
mod tests {
    use super::*;
    use suitesync_protocol::{Record, Suite};

    proptest! {
        #[test]
        fn histories_apply_to_typed_suites(history in suite_history_strategy("s1", 8)) {
            let mut suite = Suite::from_json(suite_doc("s1", 1)).unwrap();
            for update in &history {
                suite = suite.with_update(update).unwrap();
            }
            prop_assert_eq!(suite.version, history.len() as u64 + 1);

            let replayed = Suite::from_json(replay(&suite_doc("s1", 1), &history)).unwrap();
            prop_assert_eq!(suite, replayed);
        }

        #[test]
        fn race_parameters_in_range((history, version, position) in snapshot_race_strategy("s1", 6)) {
            prop_assert!(version >= 1 && version <= history.len() as u64 + 1);
            prop_assert!(position <= history.len());
            let doc = suite_at("s1", &history, version);
            prop_assert_eq!(doc["version"].as_u64(), Some(version));
        }
    }
}
