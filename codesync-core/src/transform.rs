//! Transform engine: apply, compose and compact.
//!
//! All three functions are pure and deterministic. Failures come back as
//! [`OtError`] values; nothing here panics on client-supplied input.

use crate::error::OtError;
use crate::operation::{Operation, Step};

/// Apply `op` to `text`.
///
/// Characters after the last consuming step are kept as-is, so an operation
/// may cover only a prefix of the text. Consuming past the end is an error.
pub fn apply(op: &Operation, text: &str) -> Result<String, OtError> {
    let len = text.chars().count();
    let consumed = op.base_len();
    if consumed > len {
        return Err(OtError::InvalidOperation { cursor: consumed, len });
    }

    let inserted: usize = op
        .steps()
        .iter()
        .map(|s| match s {
            Step::Insert(t) => t.len(),
            _ => 0,
        })
        .sum();
    let mut out = String::with_capacity(text.len() + inserted);
    let mut rest = text;

    for step in op.steps() {
        match step {
            Step::Retain(n) => {
                let (head, tail) = split_at_char(rest, *n);
                out.push_str(head);
                rest = tail;
            }
            Step::Insert(t) => out.push_str(t),
            Step::Delete(n) => {
                rest = split_at_char(rest, *n).1;
            }
        }
    }

    out.push_str(rest);
    Ok(out)
}

/// Compose two causally ordered operations into one.
///
/// `second` must have been produced against the output of `first`, i.e.
/// `second.base_len() == first.target_len()`; callers normalize partial
/// operations with [`Operation::normalized`] first. The result satisfies
/// `apply(compose(a, b), t) == apply(b, apply(a, t))`.
pub fn compose(first: &Operation, second: &Operation) -> Result<Operation, OtError> {
    let mismatch = || OtError::ComposeMismatch {
        expected: first.target_len(),
        actual: second.base_len(),
    };
    if first.target_len() != second.base_len() {
        return Err(mismatch());
    }

    let mut result = Operation::new();
    let mut left = first.steps().iter().cloned();
    let mut right = second.steps().iter().cloned();
    let mut a = left.next();
    let mut b = right.next();

    loop {
        match (a.take(), b.take()) {
            (None, None) => break,

            // Deletes from the first operand never reach the second.
            (Some(Step::Delete(n)), other) => {
                result.push(Step::Delete(n));
                a = left.next();
                b = other;
            }

            // Text typed by the second operand passes straight through.
            (other, Some(Step::Insert(text))) => {
                result.push(Step::Insert(text));
                a = other;
                b = right.next();
            }

            (None, Some(_)) | (Some(_), None) => return Err(mismatch()),

            (Some(Step::Retain(n)), Some(Step::Retain(m))) => {
                let k = n.min(m);
                result.push(Step::Retain(k));
                a = remainder(Step::Retain(n), k).or_else(|| left.next());
                b = remainder(Step::Retain(m), k).or_else(|| right.next());
            }

            (Some(Step::Retain(n)), Some(Step::Delete(m))) => {
                let k = n.min(m);
                result.push(Step::Delete(k));
                a = remainder(Step::Retain(n), k).or_else(|| left.next());
                b = remainder(Step::Delete(m), k).or_else(|| right.next());
            }

            (Some(Step::Insert(text)), Some(Step::Retain(m))) => {
                let k = text.chars().count().min(m);
                let (kept, _) = split_at_char(&text, k);
                result.push(Step::Insert(kept.to_string()));
                a = remainder(Step::Insert(text), k).or_else(|| left.next());
                b = remainder(Step::Retain(m), k).or_else(|| right.next());
            }

            // Inserted by the first operand, removed by the second: cancels out.
            (Some(Step::Insert(text)), Some(Step::Delete(m))) => {
                let k = text.chars().count().min(m);
                a = remainder(Step::Insert(text), k).or_else(|| left.next());
                b = remainder(Step::Delete(m), k).or_else(|| right.next());
            }
        }
    }

    Ok(compact(&result))
}

/// Merge adjacent steps of the same kind. Never reorders; idempotent.
pub fn compact(op: &Operation) -> Operation {
    let mut steps: Vec<Step> = Vec::with_capacity(op.len());
    for step in op.steps() {
        match (steps.last_mut(), step) {
            (Some(Step::Retain(acc)), Step::Retain(n)) => *acc = acc.saturating_add(*n),
            (Some(Step::Delete(acc)), Step::Delete(n)) => *acc = acc.saturating_add(*n),
            (Some(Step::Insert(acc)), Step::Insert(t)) => acc.push_str(t),
            _ => steps.push(step.clone()),
        }
    }
    let mut out = Operation::new();
    for step in steps {
        out.push(step);
    }
    out
}

impl Operation {
    /// See [`apply`].
    pub fn apply(&self, text: &str) -> Result<String, OtError> {
        apply(self, text)
    }

    /// See [`compose`].
    pub fn compose(&self, next: &Operation) -> Result<Operation, OtError> {
        compose(self, next)
    }

    /// See [`compact`].
    pub fn compact(&self) -> Operation {
        compact(self)
    }
}

/// What is left of `step` after `consumed` characters of it were used.
fn remainder(step: Step, consumed: usize) -> Option<Step> {
    match step {
        Step::Retain(n) if n > consumed => Some(Step::Retain(n - consumed)),
        Step::Delete(n) if n > consumed => Some(Step::Delete(n - consumed)),
        Step::Insert(text) => {
            let rest = split_at_char(&text, consumed).1;
            (!rest.is_empty()).then(|| Step::Insert(rest.to_string()))
        }
        _ => None,
    }
}

fn split_at_char(s: &str, n: usize) -> (&str, &str) {
    match s.char_indices().nth(n) {
        Some((idx, _)) => s.split_at(idx),
        None => (s, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_retain_insert_delete() {
        let op = Operation::new().retain(5).insert("X").delete(2);
        assert_eq!(apply(&op, "helloworld").unwrap(), "helloXrld");
    }

    #[test]
    fn test_apply_full_length() {
        let op = Operation::new().delete(5).insert("goodbye").retain(6);
        assert_eq!(apply(&op, "hello world").unwrap(), "goodbye world");
    }

    #[test]
    fn test_apply_empty_text() {
        let op = Operation::new().insert("fn main() {}");
        assert_eq!(apply(&op, "").unwrap(), "fn main() {}");
        assert_eq!(apply(&Operation::new(), "").unwrap(), "");
    }

    #[test]
    fn test_apply_past_end_fails() {
        let op = Operation::new().retain(3).delete(5);
        assert_eq!(
            apply(&op, "short"),
            Err(OtError::InvalidOperation { cursor: 8, len: 5 })
        );
    }

    #[test]
    fn test_apply_multibyte() {
        let op = Operation::new().retain(1).delete(1).insert("ü");
        assert_eq!(apply(&op, "añb").unwrap(), "aüb");
    }

    #[test]
    fn test_compose_sequential_inserts() {
        let text = "abc";
        let a = Operation::new().retain(1).insert("X").retain(2);
        let b = Operation::new().retain(4).insert("Y");
        let composed = compose(&a, &b).unwrap();
        assert_eq!(apply(&composed, text).unwrap(), "aXbcY");
        assert_eq!(
            apply(&composed, text).unwrap(),
            apply(&b, &apply(&a, text).unwrap()).unwrap()
        );
    }

    #[test]
    fn test_compose_delete_of_inserted_text_cancels() {
        let a = Operation::new().retain(2).insert("tmp");
        let b = Operation::new().retain(2).delete(3);
        let composed = compose(&a, &b).unwrap();
        assert_eq!(composed.steps(), &[Step::Retain(2)]);
        assert_eq!(apply(&composed, "ok").unwrap(), "ok");
    }

    #[test]
    fn test_compose_delete_dominates_retain() {
        let a = Operation::new().retain(6);
        let b = Operation::new().delete(3).retain(3);
        let composed = compose(&a, &b).unwrap();
        assert_eq!(composed.steps(), &[Step::Delete(3), Step::Retain(3)]);
    }

    #[test]
    fn test_compose_first_delete_passes_through() {
        let a = Operation::new().delete(2).retain(3);
        let b = Operation::new().retain(3).insert("!");
        let composed = compose(&a, &b).unwrap();
        assert_eq!(apply(&composed, "xxabc").unwrap(), "abc!");
    }

    #[test]
    fn test_compose_length_mismatch() {
        let a = Operation::new().retain(3).insert("x");
        let b = Operation::new().retain(2);
        assert_eq!(
            compose(&a, &b),
            Err(OtError::ComposeMismatch { expected: 4, actual: 2 })
        );
    }

    #[test]
    fn test_compact_merges_neighbours() {
        let op = Operation::from_steps(vec![
            Step::Retain(2),
            Step::Retain(3),
            Step::Insert("a".into()),
            Step::Insert("b".into()),
            Step::Delete(1),
            Step::Delete(1),
            Step::Retain(1),
        ])
        .unwrap();
        let compacted = compact(&op);
        assert_eq!(
            compacted.steps(),
            &[
                Step::Retain(5),
                Step::Insert("ab".into()),
                Step::Delete(2),
                Step::Retain(1),
            ]
        );
        assert_eq!(compact(&compacted), compacted);
    }

    #[test]
    fn test_compact_does_not_reorder() {
        let op = Operation::new().insert("a").delete(1).insert("b");
        assert_eq!(compact(&op), op);
    }

    #[test]
    fn test_method_forms() {
        let op = Operation::new().retain(1).insert("z");
        assert_eq!(op.apply("ab").unwrap(), "azb");
        let next = Operation::new().retain(3).insert("!");
        assert_eq!(op.normalized(2).unwrap().compose(&next).unwrap().apply("ab").unwrap(), "azb!");
    }
}
