// =============================================================================
// Matrixon Inbound Federation - Utils Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// Graph utilities over bags of events linked by prev_events. Used by the
// missing-events resolver to reconstruct the chain between a pushed event
// and the forward extremities this server already knows.
//
// =============================================================================

use std::collections::{HashMap, HashSet};

use ruma::OwnedEventId;
use tracing::trace;

use crate::types::Pdu;

/// Finds a path from `from` back to any of `targets` using only events in
/// `events`.
///
/// Performs an iterative depth-first search over prev_events links, with a
/// visited set to survive cycles in malicious input. On success the returned
/// sequence contains the intermediate events ordered oldest first: the first
/// element cites a member of `targets` among its prev_events, each later
/// element cites the one before it, and the last element is cited by `from`.
/// That ordering is exactly what the event processor needs, since later
/// events may depend on state introduced by earlier ones.
///
/// Returns an empty vector when no usable path exists within `events`.
pub fn find_path(events: &[Pdu], from: &Pdu, targets: &[OwnedEventId]) -> Vec<Pdu> {
    let by_id: HashMap<OwnedEventId, &Pdu> = events
        .iter()
        .map(|event| (event.event_id.clone(), event))
        .collect();
    let target_set: HashSet<&OwnedEventId> = targets.iter().collect();

    // parent[x] is the bag event that cited x among its prev_events; None
    // marks ids cited directly by `from`
    let mut parent: HashMap<OwnedEventId, Option<OwnedEventId>> = HashMap::new();
    let mut stack: Vec<OwnedEventId> = Vec::new();
    let mut seen: HashSet<OwnedEventId> = HashSet::new();

    for prev_id in &from.prev_events {
        parent.insert(prev_id.clone(), None);
        stack.push(prev_id.clone());
    }

    while let Some(next) = stack.pop() {
        if !seen.insert(next.clone()) {
            continue;
        }

        if target_set.contains(&next) {
            // Walk the parent links back up towards `from`. The first link
            // is the event adjacent to the target, so the collected order is
            // already oldest first.
            let mut path = Vec::new();
            let mut cursor = parent.get(&next).cloned().flatten();
            while let Some(id) = cursor {
                let event = by_id
                    .get(&id)
                    .expect("parent links only ever point at bag events");
                path.push((*event).clone());
                cursor = parent.get(&id).cloned().flatten();
            }

            if path.is_empty() {
                // `from` cites this extremity directly; the gap is on another
                // branch, keep searching.
                continue;
            }

            trace!(len = path.len(), "found path through missing events");
            return path;
        }

        let Some(event) = by_id.get(&next) else {
            // Unknown to the bag; dead end.
            continue;
        };

        for prev_id in &event.prev_events {
            if !seen.contains(prev_id) && !parent.contains_key(prev_id) {
                parent.insert(prev_id.clone(), Some(next.clone()));
                stack.push(prev_id.clone());
            }
        }
    }

    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruma::OwnedEventId;
    use test_log::test;

    fn event(id: &str, prev: &[&str]) -> Pdu {
        let prev_events: Vec<String> = prev.iter().map(|p| format!("\"${p}:test\"")).collect();
        serde_json::from_str(&format!(
            r#"{{
                "event_id": "${id}:test",
                "room_id": "!room:test",
                "type": "m.room.message",
                "sender": "@alice:test",
                "origin_server_ts": 0,
                "prev_events": [{}],
                "depth": 1,
                "content": {{}}
            }}"#,
            prev_events.join(",")
        ))
        .expect("valid event json")
    }

    fn id(name: &str) -> OwnedEventId {
        format!("${name}:test").try_into().expect("valid event id")
    }

    fn ids(path: &[Pdu]) -> Vec<OwnedEventId> {
        path.iter().map(|event| event.event_id.clone()).collect()
    }

    #[test]
    fn test_linear_chain_oldest_first() {
        // extremity <- p1 <- p2 <- from
        let bag = vec![event("p1", &["extremity"]), event("p2", &["p1"])];
        let from = event("from", &["p2"]);

        let path = find_path(&bag, &from, &[id("extremity")]);
        assert_eq!(ids(&path), vec![id("p1"), id("p2")]);

        // adjacency: first element cites the target, each later element
        // cites the one before it
        assert!(path[0].prev_events.contains(&id("extremity")));
        assert!(path[1].prev_events.contains(&path[0].event_id));
    }

    #[test]
    fn test_no_path_returns_empty() {
        let bag = vec![event("p1", &["elsewhere"])];
        let from = event("from", &["p1"]);
        assert!(find_path(&bag, &from, &[id("extremity")]).is_empty());
    }

    #[test]
    fn test_cycle_terminates() {
        let bag = vec![event("a", &["b"]), event("b", &["a"])];
        let from = event("from", &["a"]);
        assert!(find_path(&bag, &from, &[id("extremity")]).is_empty());
    }

    #[test]
    fn test_branching_picks_reachable_branch() {
        // from cites two parents; only one branch reaches the extremity
        let bag = vec![
            event("dead", &["nowhere"]),
            event("alive", &["extremity"]),
        ];
        let from = event("from", &["dead", "alive"]);

        let path = find_path(&bag, &from, &[id("extremity")]);
        assert_eq!(ids(&path), vec![id("alive")]);
    }

    #[test]
    fn test_direct_extremity_reference_is_not_a_path() {
        // from already cites the extremity; there are no intermediate events
        // to process, so no path is reported
        let from = event("from", &["extremity"]);
        assert!(find_path(&[], &from, &[id("extremity")]).is_empty());
    }

    #[test]
    fn test_empty_bag() {
        let from = event("from", &["p1"]);
        assert!(find_path(&[], &from, &[id("extremity")]).is_empty());
    }
}
