//! Trimming of redundant raw event sequences within one native batch.

use std::path::PathBuf;

use fnv::FnvHashMap;

use crate::types::{RawAction, RawEvent};

/// Collapses known-redundant same-path pairs in a raw batch.
///
/// For a path with exactly two back-to-back events:
/// - `Deleted` then `Created` becomes a single `Modified` (atomic save),
/// - `Created` then `Deleted` disappears entirely.
///
/// Every other group is passed through, and survivors keep their order.
pub fn trim_change_events(mut events: Vec<RawEvent>) -> Vec<RawEvent> {
    if events.len() < 2 {
        return events;
    }

    let mut groups: FnvHashMap<PathBuf, Vec<usize>> = FnvHashMap::default();
    for (index, event) in events.iter().enumerate() {
        if let Some(path) = event.path() {
            groups.entry(path).or_default().push(index);
        }
    }

    let mut drop_index = vec![false; events.len()];
    for indices in groups.values() {
        let [first, second] = indices.as_slice() else {
            continue;
        };
        if second - first != 1 {
            continue;
        }
        match (events[*first].action, events[*second].action) {
            (RawAction::Deleted, RawAction::Created) => {
                events[*first].action = RawAction::Modified;
                drop_index[*second] = true;
            }
            (RawAction::Created, RawAction::Deleted) => {
                drop_index[*first] = true;
                drop_index[*second] = true;
            }
            _ => {}
        }
    }

    events
        .into_iter()
        .zip(drop_index)
        .filter_map(|(event, dropped)| (!dropped).then_some(event))
        .collect()
}
