//! Operation transformation between concurrent edits.
//!
//! An edit is a `(position, deleted_len, inserted_text)` triple over
//! character offsets. When a client submits an edit computed against a
//! stale version, [`transform`] re-expresses it against each newer edit
//! already applied, in version order, so that applying the result to the
//! current content matches the editor's intent.
//!
//! Overlapping concurrent edits are resolved by a deterministic
//! tie-break: the participant with the lower identifier keeps its anchor,
//! the other edit's overlapping span is dropped and its insertion is
//! re-anchored after the winner's replacement. Overlaps are never merged
//! character-by-character.
//!
//! Whole-document [`Payload::Replace`] is the degenerate mode the wire
//! also accepts; see [`Payload`] for its last-write-wins semantics.

use serde::{Deserialize, Serialize};

use crate::error::ConflictReason;

/// A positional edit: delete `deleted_len` characters at `position`,
/// then insert `inserted_text` there. Offsets count characters, not bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edit {
    pub position: usize,
    #[serde(default)]
    pub deleted_len: usize,
    #[serde(default)]
    pub inserted_text: String,
}

impl Edit {
    /// Pure insertion at `position`.
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        Self {
            position,
            deleted_len: 0,
            inserted_text: text.into(),
        }
    }

    /// Pure deletion of `len` characters at `position`.
    pub fn delete(position: usize, len: usize) -> Self {
        Self {
            position,
            deleted_len: len,
            inserted_text: String::new(),
        }
    }

    /// Replace `len` characters at `position` with `text`.
    pub fn replace(position: usize, len: usize, text: impl Into<String>) -> Self {
        Self {
            position,
            deleted_len: len,
            inserted_text: text.into(),
        }
    }

    /// Character length of the inserted text.
    pub fn inserted_len(&self) -> usize {
        self.inserted_text.chars().count()
    }

    /// Net change in document length when this edit is applied.
    pub fn len_delta(&self) -> isize {
        self.inserted_len() as isize - self.deleted_len as isize
    }
}

/// Edit payload carried by a `code-edit` submission.
///
/// `Patch` is the canonical representation and the one the transform
/// algorithm operates on. `Replace` (full content, the mode the original
/// clients send) is accepted as a degenerate fallback: when transformed
/// against intervening operations it degrades to last-write-wins against
/// the transformed base, which is lossy by design and documented as such.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Payload {
    Replace { content: String },
    Patch { edit: Edit },
}

/// Apply an edit to `content`, returning the new content.
///
/// Rejects edits whose position or deletion span runs past the end of
/// the text; a malformed span must never silently clamp and corrupt.
pub fn apply(content: &str, edit: &Edit) -> Result<String, ConflictReason> {
    let char_len = content.chars().count();
    let end = edit.position.checked_add(edit.deleted_len);
    match end {
        Some(end) if end <= char_len => {}
        _ => {
            return Err(ConflictReason::MalformedPayload {
                detail: format!(
                    "edit span {}..{} exceeds document length {char_len}",
                    edit.position,
                    edit.position + edit.deleted_len,
                ),
            })
        }
    }

    let mut out = String::with_capacity(content.len() + edit.inserted_text.len());
    let mut chars = content.chars();
    out.extend(chars.by_ref().take(edit.position));
    out.push_str(&edit.inserted_text);
    out.extend(chars.skip(edit.deleted_len));
    Ok(out)
}

/// Transform `incoming` (computed against the state before `applied`)
/// so it can be applied after `applied`.
///
/// `incoming_actor` / `applied_actor` are the originating participant
/// identifiers, used only for the deterministic overlap tie-break.
pub fn transform(incoming: &Edit, incoming_actor: &str, applied: &Edit, applied_actor: &str) -> Edit {
    let a1 = incoming.position;
    let a2 = a1 + incoming.deleted_len;
    let b1 = applied.position;
    let b2 = b1 + applied.deleted_len;
    let ins = applied.inserted_len();

    // Concurrent insertions at the same point: lower participant id goes
    // first, the other lands after its text.
    if a1 == b1 && incoming.deleted_len == 0 && applied.deleted_len == 0 {
        if incoming_actor < applied_actor {
            return incoming.clone();
        }
        return Edit {
            position: a1 + ins,
            ..incoming.clone()
        };
    }

    // Applied edit entirely at or before the incoming position: shift by
    // the net length delta of the applied edit.
    if b2 <= a1 {
        let shifted = (a1 as isize + applied.len_delta()).max(0) as usize;
        return Edit {
            position: shifted,
            ..incoming.clone()
        };
    }

    // Applied edit entirely after the incoming span: untouched.
    if b1 >= a2 {
        return incoming.clone();
    }

    // Overlap. The span both edits touch was already consumed by the
    // applied edit; it is dropped from the incoming deletion, never
    // re-deleted from the replacement text.
    if a1 < b1 {
        // Incoming starts first: its surviving prefix deletion stays
        // anchored; the tail past the applied span is discontiguous after
        // the applied insertion and is dropped.
        return Edit {
            position: a1,
            deleted_len: b1 - a1,
            inserted_text: incoming.inserted_text.clone(),
        };
    }

    // Incoming starts inside the applied span.
    if incoming_actor < applied_actor {
        // Winner anchors before the applied insertion; its deletion span
        // is gone, only the insertion survives.
        Edit {
            position: b1,
            deleted_len: 0,
            inserted_text: incoming.inserted_text.clone(),
        }
    } else {
        // Loser re-anchors after the applied insertion and keeps the
        // contiguous tail of its deletion.
        Edit {
            position: b1 + ins,
            deleted_len: a2.saturating_sub(b2),
            inserted_text: incoming.inserted_text.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_insert() {
        let out = apply("hello world", &Edit::insert(5, ",")).unwrap();
        assert_eq!(out, "hello, world");
    }

    #[test]
    fn apply_delete() {
        let out = apply("hello world", &Edit::delete(5, 6)).unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn apply_replace() {
        let out = apply("const x = 1;", &Edit::replace(10, 1, "42")).unwrap();
        assert_eq!(out, "const x = 42;");
    }

    #[test]
    fn apply_at_end() {
        let out = apply("abc", &Edit::insert(3, "d")).unwrap();
        assert_eq!(out, "abcd");
    }

    #[test]
    fn apply_to_empty() {
        let out = apply("", &Edit::insert(0, "let x;")).unwrap();
        assert_eq!(out, "let x;");
    }

    #[test]
    fn apply_counts_characters_not_bytes() {
        // "héllo" is 6 bytes but 5 chars
        let out = apply("héllo", &Edit::insert(5, "!")).unwrap();
        assert_eq!(out, "héllo!");
        let out = apply("日本語", &Edit::delete(1, 1)).unwrap();
        assert_eq!(out, "日語");
    }

    #[test]
    fn apply_rejects_out_of_bounds_position() {
        let err = apply("abc", &Edit::insert(4, "x")).unwrap_err();
        assert!(matches!(err, ConflictReason::MalformedPayload { .. }));
    }

    #[test]
    fn apply_rejects_overlong_deletion() {
        let err = apply("abc", &Edit::delete(1, 5)).unwrap_err();
        assert!(matches!(err, ConflictReason::MalformedPayload { .. }));
    }

    #[test]
    fn transform_shifts_after_earlier_insert() {
        // B inserted 4 chars at 0; A's edit at 10 moves to 14.
        let a = Edit::insert(10, "x");
        let b = Edit::insert(0, "abcd");
        let t = transform(&a, "u2", &b, "u1");
        assert_eq!(t, Edit::insert(14, "x"));
    }

    #[test]
    fn transform_shifts_after_earlier_delete() {
        let a = Edit::insert(10, "x");
        let b = Edit::delete(0, 4);
        let t = transform(&a, "u2", &b, "u1");
        assert_eq!(t, Edit::insert(6, "x"));
    }

    #[test]
    fn transform_untouched_by_later_edit() {
        let a = Edit::insert(2, "x");
        let b = Edit::replace(10, 3, "yy");
        let t = transform(&a, "u2", &b, "u1");
        assert_eq!(t, a);
    }

    #[test]
    fn transform_same_point_insert_tie_break() {
        let a = Edit::insert(5, "AAA");
        let b = Edit::insert(5, "BB");
        // Lower participant id keeps the spot.
        let winner = transform(&a, "u1", &b, "u2");
        assert_eq!(winner.position, 5);
        let loser = transform(&a, "u3", &b, "u2");
        assert_eq!(loser.position, 7);
    }

    #[test]
    fn transform_same_point_inserts_converge() {
        // Whichever order the server serializes them in, the final text
        // is identical: the lower id's text ends up first.
        let base = "xxyy";
        let a = Edit::insert(2, "A"); // from participant "u1"
        let b = Edit::insert(2, "B"); // from participant "u2"

        // a applied first, b transformed against it
        let one = apply(base, &a).unwrap();
        let bt = transform(&b, "u2", &a, "u1");
        let one = apply(&one, &bt).unwrap();

        // b applied first, a transformed against it
        let two = apply(base, &b).unwrap();
        let at = transform(&a, "u1", &b, "u2");
        let two = apply(&two, &at).unwrap();

        assert_eq!(one, two);
        assert_eq!(one, "xxAByy");
    }

    #[test]
    fn transform_overlapping_deletes_drop_overlap() {
        // base: "0123456789"; B deleted 3..7, A wanted 5..9.
        // A starts inside B's span: the shared 5..7 is gone, A keeps the
        // contiguous tail 7..9 (re-anchored after B's span).
        let a = Edit::delete(5, 4);
        let b = Edit::delete(3, 4);
        let t = transform(&a, "u2", &b, "u1");
        assert_eq!(t, Edit::delete(3, 2));
        let after_b = apply("0123456789", &b).unwrap();
        assert_eq!(after_b, "012789");
        assert_eq!(apply(&after_b, &t).unwrap(), "0129");
    }

    #[test]
    fn transform_overlap_prefix_survives() {
        // A deletes 2..6, B deleted 4..8: A keeps its prefix 2..4.
        let a = Edit::delete(2, 4);
        let b = Edit::delete(4, 4);
        let t = transform(&a, "u2", &b, "u1");
        assert_eq!(t, Edit::delete(2, 2));
    }

    #[test]
    fn transform_insert_inside_replaced_span() {
        // B replaced 2..6 with "XY". A's insert at 4 sits inside the
        // replaced span: winner anchors before "XY", loser after it.
        let b = Edit::replace(2, 4, "XY");
        let a = Edit::insert(4, "zz");

        let winner = transform(&a, "u1", &b, "u2");
        assert_eq!(winner, Edit::insert(2, "zz"));

        let loser = transform(&a, "u3", &b, "u2");
        assert_eq!(loser, Edit::insert(4, "zz"));
    }

    #[test]
    fn transform_disjoint_edits_converge() {
        // Non-overlapping edits converge regardless of serialization order.
        let base = "fn main() { println!(); }";
        let a = Edit::insert(3, "x"); // "fnx main..."? position 3 is after "fn "
        let b = Edit::insert(12, "y");

        let one = apply(&apply(base, &a).unwrap(), &transform(&b, "u2", &a, "u1")).unwrap();
        let two = apply(&apply(base, &b).unwrap(), &transform(&a, "u1", &b, "u2")).unwrap();
        assert_eq!(one, two);
    }

    #[test]
    fn len_delta() {
        assert_eq!(Edit::insert(0, "abc").len_delta(), 3);
        assert_eq!(Edit::delete(0, 2).len_delta(), -2);
        assert_eq!(Edit::replace(0, 2, "abc").len_delta(), 1);
    }

    #[test]
    fn payload_patch_wire_shape() {
        let payload = Payload::Patch {
            edit: Edit::insert(3, "x"),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["patch"]["edit"]["position"], 3);
        let back: Payload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}
