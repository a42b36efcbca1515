//! Building, compressing and rebasing local changes.

use crate::change::{ChangeOp, LocalChange};
use crate::ghost::Ghost;
use ghostsync_diff::{ConflictPolicy, DiffResult, JsonDiff, ObjectOperationSet};
use serde_json::Value;

/// Builds a change moving `ghost` to `target`.
///
/// A remove carries no diff. A modify carries `object_diff(ghost.data, target)`
/// and starts from the ghost's version once it has been synced.
pub fn build_change(
    jd: &JsonDiff,
    op: ChangeOp,
    id: &str,
    target: &Value,
    ghost: &Ghost,
) -> LocalChange {
    match op {
        ChangeOp::Remove => LocalChange::remove(id),
        ChangeOp::Modify => {
            let diff = jd.object_diff(&ghost.data, target);
            let sv = ghost.is_synced().then_some(ghost.version);
            LocalChange::modify(id, diff, sv, target.clone())
        }
    }
}

/// Folds a run of changes, each chained on the previous one, into a single
/// diff from `origin`.
///
/// Any remove collapses the run to `None`. An empty run is an empty diff and
/// a single change keeps its diff verbatim.
pub fn compress_changes(
    jd: &JsonDiff,
    changes: &[LocalChange],
    origin: &Value,
) -> DiffResult<Option<ObjectOperationSet>> {
    if changes.iter().any(LocalChange::is_remove) {
        return Ok(None);
    }
    match changes {
        [] => Ok(Some(ObjectOperationSet::new())),
        [single] => Ok(Some(single.diff.clone().unwrap_or_default())),
        _ => {
            let mut folded = origin.clone();
            for change in changes {
                if let Some(diff) = &change.diff {
                    folded = jd.apply_object_diff(&folded, diff)?;
                }
            }
            Ok(Some(jd.object_diff(origin, &folded)))
        }
    }
}

/// Rebases a local diff so it applies after a concurrent remote diff.
pub fn rebase(
    jd: &JsonDiff,
    local: &ObjectOperationSet,
    remote: &ObjectOperationSet,
    origin: &Value,
    policy: ConflictPolicy,
) -> DiffResult<ObjectOperationSet> {
    jd.transform_object_diff_with(local, remote, origin, policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn jd() -> JsonDiff {
        JsonDiff::default()
    }

    fn chained(ghost: &Ghost, steps: &[Value]) -> Vec<LocalChange> {
        let mut base = ghost.clone();
        steps
            .iter()
            .map(|target| {
                let change = build_change(&jd(), ChangeOp::Modify, &ghost.key, target, &base);
                base = Ghost::new(ghost.key.clone(), ghost.version, target.clone());
                change
            })
            .collect()
    }

    #[test]
    fn build_modify_and_remove() {
        let ghost = Ghost::new("n", 4, json!({"t": "AC"}));
        let change = build_change(&jd(), ChangeOp::Modify, "n", &json!({"t": "ACD"}), &ghost);
        assert_eq!(change.sv, Some(4));
        assert_eq!(change.diff.as_ref().unwrap().len(), 1);
        assert_eq!(change.target, json!({"t": "ACD"}));

        let fresh = build_change(&jd(), ChangeOp::Modify, "n", &json!({"a": 1}), &Ghost::empty("n"));
        assert_eq!(fresh.sv, None);

        let remove = build_change(&jd(), ChangeOp::Remove, "n", &Value::Null, &ghost);
        assert!(remove.is_remove());
        assert!(remove.diff.is_none());
    }

    #[test]
    fn compress_folds_chained_changes() {
        let ghost = Ghost::new("n", 1, json!({"t": "A", "n": 1}));
        let changes = chained(
            &ghost,
            &[
                json!({"t": "AB", "n": 1}),
                json!({"t": "ABC", "n": 2}),
                json!({"t": "ABC", "n": 2, "x": true}),
            ],
        );

        let folded = compress_changes(&jd(), &changes, &ghost.data).unwrap().unwrap();
        assert_eq!(
            jd().apply_object_diff(&ghost.data, &folded).unwrap(),
            json!({"t": "ABC", "n": 2, "x": true})
        );
    }

    #[test]
    fn compress_edge_cases() {
        let origin = json!({"a": 1});
        assert_eq!(
            compress_changes(&jd(), &[], &origin).unwrap(),
            Some(ObjectOperationSet::new())
        );

        let ghost = Ghost::new("n", 1, origin.clone());
        let single = chained(&ghost, &[json!({"a": 2})]);
        assert_eq!(
            compress_changes(&jd(), &single, &origin).unwrap(),
            single[0].diff.clone()
        );

        let mut with_remove = chained(&ghost, &[json!({"a": 2})]);
        with_remove.push(LocalChange::remove("n"));
        assert_eq!(compress_changes(&jd(), &with_remove, &origin).unwrap(), None);
    }

    #[test]
    fn rebase_delegates_to_transform() {
        let origin = json!({"t": "AC"});
        let local = jd().object_diff(&origin, &json!({"t": "ACD"}));
        let remote = jd().object_diff(&origin, &json!({"t": "ABC"}));
        let rebased = rebase(&jd(), &local, &remote, &origin, ConflictPolicy::ClientWins).unwrap();
        assert_eq!(
            jd().apply_object_diff(&json!({"t": "ABC"}), &rebased).unwrap(),
            json!({"t": "ABCD"})
        );
    }
}
