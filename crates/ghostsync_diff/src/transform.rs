//! Operational transform of diffs computed from a common origin.
//!
//! Given `local` and `remote`, both derived from `origin`, the transform
//! produces a diff with `local`'s intent that applies on top of
//! `apply(origin, remote)`.

use crate::delta::{DiffDelta, ListOperationSet, ObjectOperationSet};
use crate::diff::{out_of_range, JsonDiff};
use crate::error::{DiffError, DiffResult};
use crate::text::{apply_ops, apply_text_delta, parse_delta, text_diff, transform_ops};
use crate::value::equals;
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Resolution for concurrent edits that have no dedicated merge rule,
/// such as a local `Replace` against a remote `Replace` or a local `Remove`
/// against a remote edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// The rebased diff moves the remote result to the local intended value.
    #[default]
    ClientWins,
    /// The local operation on a conflicting slot is dropped.
    ServerWins,
}

impl ConflictPolicy {
    /// Converts to a code.
    pub fn to_code(&self) -> u8 {
        match self {
            ConflictPolicy::ClientWins => 1,
            ConflictPolicy::ServerWins => 2,
        }
    }

    /// Converts from a code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ConflictPolicy::ClientWins),
            2 => Some(ConflictPolicy::ServerWins),
            _ => None,
        }
    }
}

impl JsonDiff {
    /// Rebases `local` over `remote` with [`ConflictPolicy::ClientWins`].
    pub fn transform_object_diff(
        &self,
        local: &ObjectOperationSet,
        remote: &ObjectOperationSet,
        origin: &Value,
    ) -> DiffResult<ObjectOperationSet> {
        self.transform_object_diff_with(local, remote, origin, ConflictPolicy::default())
    }

    /// Rebases `local` over `remote`, resolving unmatched combinations with `policy`.
    pub fn transform_object_diff_with(
        &self,
        local: &ObjectOperationSet,
        remote: &ObjectOperationSet,
        origin: &Value,
        policy: ConflictPolicy,
    ) -> DiffResult<ObjectOperationSet> {
        let empty = Map::new();
        let origin = origin.as_object().unwrap_or(&empty);

        let mut out = ObjectOperationSet::new();
        for (key, l) in local {
            let rebased = match remote.get(key) {
                None => Some(l.clone()),
                Some(r) => self.transform_slot(l, r, origin.get(key), policy)?,
            };
            if let Some(delta) = rebased {
                out.insert(key.clone(), delta);
            }
        }
        Ok(out)
    }

    /// Rebases positional `local` deltas over `remote` ones.
    ///
    /// Both sets are first unfolded into one step per origin element plus
    /// the insertions between them, then walked side by side. Concurrent
    /// insertions at the same gap are both kept, ordered by their encoded
    /// value so `transform(a, b)` and `transform(b, a)` converge. An element
    /// touched by both sides follows the per-slot rules of
    /// [`JsonDiff::transform_object_diff`].
    pub fn transform_list_diff(
        &self,
        local: &ListOperationSet,
        remote: &ListOperationSet,
        origin: &Value,
        policy: ConflictPolicy,
    ) -> DiffResult<ListOperationSet> {
        let origin: &[Value] = origin.as_array().map(Vec::as_slice).unwrap_or(&[]);
        let mut ls = self.unfold_list_diff(origin, local)?.into_iter();
        let mut rs = self.unfold_list_diff(origin, remote)?.into_iter();

        let mut out = Vec::new();
        let mut at = 0usize;
        let mut l = ls.next();
        let mut r = rs.next();
        loop {
            match (l.take(), r.take()) {
                (None, None) => break,
                (Some(Step::Insert(a)), Some(Step::Insert(b))) => {
                    if insert_order(&a, &b) != Ordering::Greater {
                        out.push(Step::Insert(a));
                        l = ls.next();
                        r = Some(Step::Insert(b));
                    } else {
                        out.extend(b.iter().map(|_| Step::Keep));
                        l = Some(Step::Insert(a));
                        r = rs.next();
                    }
                }
                (Some(Step::Insert(a)), other) => {
                    out.push(Step::Insert(a));
                    l = ls.next();
                    r = other;
                }
                (other, Some(Step::Insert(b))) => {
                    out.extend(b.iter().map(|_| Step::Keep));
                    l = other;
                    r = rs.next();
                }
                (Some(a), Some(b)) => {
                    if let Some(step) = self.transform_step(a, b, origin.get(at), policy)? {
                        out.push(step);
                    }
                    at += 1;
                    l = ls.next();
                    r = rs.next();
                }
                _ => return Err(DiffError::invalid_diff("list diffs span different lengths")),
            }
        }
        Ok(fold_steps(out))
    }

    /// Replays `ops` over `origin` and returns one step per origin element,
    /// with insertions placed in the gaps they land in.
    fn unfold_list_diff(&self, origin: &[Value], ops: &ListOperationSet) -> DiffResult<Vec<Step>> {
        enum Slot {
            Origin(usize, Option<DiffDelta>),
            New(Value),
        }

        let mut list: Vec<Slot> = (0..origin.len()).map(|i| Slot::Origin(i, None)).collect();
        let mut deleted = 0usize;
        for (index, delta) in ops {
            let at = index.checked_sub(deleted).ok_or_else(|| {
                DiffError::invalid_diff(format!("list index {index} precedes a removal"))
            })?;
            match delta {
                DiffDelta::Add(value) => {
                    if at > list.len() {
                        return Err(out_of_range(*index, list.len()));
                    }
                    list.insert(at, Slot::New(value.clone()));
                }
                DiffDelta::Remove => {
                    if at >= list.len() {
                        return Err(out_of_range(*index, list.len()));
                    }
                    list.remove(at);
                    deleted += 1;
                }
                other => {
                    let len = list.len();
                    match list.get_mut(at).ok_or_else(|| out_of_range(*index, len))? {
                        Slot::New(value) => *value = self.patch_value(value, other)?,
                        Slot::Origin(i, edit) => {
                            let merged = match edit.take() {
                                None => other.clone(),
                                Some(previous) => {
                                    let value = self.patch_value(&origin[*i], &previous)?;
                                    DiffDelta::Replace(self.patch_value(&value, other)?)
                                }
                            };
                            *edit = Some(merged);
                        }
                    }
                }
            }
        }

        // Origin elements keep their relative order, so every index skipped
        // between two survivors was removed.
        let mut steps = Vec::with_capacity(list.len() + deleted);
        let mut next = 0usize;
        for slot in list {
            match slot {
                Slot::New(value) => match steps.last_mut() {
                    Some(Step::Insert(block)) => block.push(value),
                    _ => steps.push(Step::Insert(vec![value])),
                },
                Slot::Origin(i, edit) => {
                    steps.extend((next..i).map(|_| Step::Drop));
                    steps.push(edit.map_or(Step::Keep, Step::Edit));
                    next = i + 1;
                }
            }
        }
        steps.extend((next..origin.len()).map(|_| Step::Drop));
        Ok(steps)
    }

    /// Rebases one local step over the remote step for the same origin element.
    fn transform_step(
        &self,
        local: Step,
        remote: Step,
        origin: Option<&Value>,
        policy: ConflictPolicy,
    ) -> DiffResult<Option<Step>> {
        let remote_kept = !matches!(remote, Step::Drop);
        let (local, remote) = match (local, remote) {
            (Step::Keep, _) => return Ok(remote_kept.then_some(Step::Keep)),
            (Step::Drop, Step::Drop) => return Ok(None),
            (step, Step::Keep) => return Ok(Some(step)),
            (local, remote) => (local.into_delta(), remote.into_delta()),
        };

        let rebased = self.transform_slot(&local, &remote, origin, policy)?;
        Ok(match (rebased, remote_kept) {
            (None, kept) => kept.then_some(Step::Keep),
            (Some(DiffDelta::Remove), kept) => kept.then_some(Step::Drop),
            (Some(DiffDelta::Add(value)), true) => Some(Step::Edit(DiffDelta::Replace(value))),
            (Some(delta), true) => Some(Step::Edit(delta)),
            (Some(delta), false) => self
                .apply_delta(origin, &delta)?
                .map(|value| Step::Insert(vec![value])),
        })
    }

    fn transform_slot(
        &self,
        local: &DiffDelta,
        remote: &DiffDelta,
        origin: Option<&Value>,
        policy: ConflictPolicy,
    ) -> DiffResult<Option<DiffDelta>> {
        match (local, remote) {
            (DiffDelta::Add(l), DiffDelta::Add(r)) => {
                if equals(l, r) {
                    Ok(None)
                } else {
                    Ok(self.diff(r, l))
                }
            }
            (DiffDelta::Remove, DiffDelta::Remove) => Ok(None),
            (l, DiffDelta::Remove) if l.is_modification() => {
                Ok(self.apply_delta(origin, l)?.map(DiffDelta::Add))
            }
            (DiffDelta::ObjectDiff(l), DiffDelta::ObjectDiff(r)) => {
                let origin = origin.unwrap_or(&Value::Null);
                let ops = self.transform_object_diff_with(l, r, origin, policy)?;
                Ok((!ops.is_empty()).then_some(DiffDelta::ObjectDiff(ops)))
            }
            (DiffDelta::ListDiff(l), DiffDelta::ListDiff(r)) => {
                let origin = origin.unwrap_or(&Value::Null);
                let ops = self.transform_list_diff(l, r, origin, policy)?;
                Ok((!ops.is_empty()).then_some(DiffDelta::ListDiff(ops)))
            }
            (DiffDelta::TextDelta(l), DiffDelta::TextDelta(r)) => {
                let Some(Value::String(text)) = origin else {
                    return Err(DiffError::invalid_diff("text deltas over a non-string origin"));
                };
                merge_text(text, l, r)
            }
            (DiffDelta::Increment(_), DiffDelta::Increment(_)) => Ok(Some(local.clone())),
            _ => self.resolve_conflict(local, remote, origin, policy),
        }
    }

    fn resolve_conflict(
        &self,
        local: &DiffDelta,
        remote: &DiffDelta,
        origin: Option<&Value>,
        policy: ConflictPolicy,
    ) -> DiffResult<Option<DiffDelta>> {
        if policy == ConflictPolicy::ServerWins {
            return Ok(None);
        }
        let remote_final = self.apply_delta(origin, remote)?;
        let local_final = self.apply_delta(origin, local)?;
        Ok(match (remote_final, local_final) {
            (None, None) => None,
            (Some(_), None) => Some(DiffDelta::Remove),
            (None, Some(value)) => Some(DiffDelta::Add(value)),
            (Some(r), Some(l)) => self.diff(&r, &l),
        })
    }
}

/// What a list diff does at one origin element, or in the gap before it.
enum Step {
    Keep,
    Edit(DiffDelta),
    Drop,
    /// A run of consecutive insertions.
    Insert(Vec<Value>),
}

impl Step {
    /// The delta of an element step. Only edits and drops reach a slot merge.
    fn into_delta(self) -> DiffDelta {
        match self {
            Step::Edit(delta) => delta,
            Step::Keep | Step::Drop | Step::Insert(_) => DiffDelta::Remove,
        }
    }
}

/// Orders concurrent insertion runs by their encoded elements.
fn insert_order(a: &[Value], b: &[Value]) -> Ordering {
    a.iter().map(Value::to_string).cmp(b.iter().map(Value::to_string))
}

/// Folds steps back into positional deltas over the list they apply to.
fn fold_steps(steps: Vec<Step>) -> ListOperationSet {
    let mut ops = ListOperationSet::new();
    let mut pos = 0usize;
    let mut deleted = 0usize;
    for step in steps {
        match step {
            Step::Keep => pos += 1,
            Step::Edit(delta) => {
                ops.insert(pos + deleted, delta);
                pos += 1;
            }
            Step::Drop => {
                ops.insert(pos + deleted, DiffDelta::Remove);
                deleted += 1;
            }
            Step::Insert(values) => {
                for value in values {
                    ops.insert(pos + deleted, DiffDelta::Add(value));
                    pos += 1;
                }
            }
        }
    }
    ops
}

/// Three-way text merge: remote's patch first, then local's patch rebased
/// over it; the result is re-diffed against the remote text.
fn merge_text(origin: &str, local: &str, remote: &str) -> DiffResult<Option<DiffDelta>> {
    let remote_text = apply_text_delta(origin, remote)?;
    let local_ops = parse_delta(local)?;
    apply_ops(origin, &local_ops)?;
    let remote_ops = parse_delta(remote)?;

    let rebased = transform_ops(&local_ops, &remote_ops);
    let merged = apply_ops(&remote_text, &rebased)?;
    if merged == remote_text {
        return Ok(None);
    }
    Ok(text_diff(&remote_text, &merged).map(DiffDelta::TextDelta))
}
