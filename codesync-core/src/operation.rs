//! Edit operations: an ordered list of retain / insert / delete steps.
//!
//! Wire format (JSON, mixed array):
//! ```text
//! [5, "X", -2]
//!  │   │    └── delete 2 characters
//!  │   └─────── insert "X"
//!  └─────────── retain 5 characters
//! ```
//!
//! All lengths count Unicode scalar values, never bytes.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::error::OtError;

/// One primitive step of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Copy the next `n` characters of the input.
    Retain(usize),
    /// Emit literal text without consuming input.
    Insert(String),
    /// Skip the next `n` characters of the input.
    Delete(usize),
}

impl Step {
    /// Decode the integer form used on the wire: positive = retain, negative = delete.
    pub fn from_count(count: i64) -> Result<Self, OtError> {
        match count {
            0 => Err(OtError::InvalidStep("zero-length step".to_string())),
            n if n > 0 => Ok(Step::Retain(count_to_len(n.unsigned_abs())?)),
            n => Ok(Step::Delete(count_to_len(n.unsigned_abs())?)),
        }
    }

    /// Number of characters this step covers.
    pub fn len(&self) -> usize {
        match self {
            Step::Retain(n) | Step::Delete(n) => *n,
            Step::Insert(text) => text.chars().count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the step advances the input cursor.
    pub fn consumes_input(&self) -> bool {
        matches!(self, Step::Retain(_) | Step::Delete(_))
    }

    fn validate(&self) -> Result<(), OtError> {
        match self {
            Step::Retain(0) => Err(OtError::InvalidStep("retain of zero characters".to_string())),
            Step::Delete(0) => Err(OtError::InvalidStep("delete of zero characters".to_string())),
            Step::Insert(text) if text.is_empty() => {
                Err(OtError::InvalidStep("empty insert".to_string()))
            }
            _ => Ok(()),
        }
    }
}

fn count_to_len(count: u64) -> Result<usize, OtError> {
    usize::try_from(count).map_err(|_| OtError::InvalidStep(format!("step count {count} out of range")))
}

/// Sum of the selected step lengths, `None` on overflow.
fn checked_total(steps: &[Step], select: impl Fn(&Step) -> bool) -> Option<usize> {
    steps
        .iter()
        .filter(|&s| select(s))
        .try_fold(0usize, |total, s| total.checked_add(s.len()))
}

fn saturating_total(steps: &[Step], select: impl Fn(&Step) -> bool) -> usize {
    steps
        .iter()
        .filter(|&s| select(s))
        .fold(0usize, |total, s| total.saturating_add(s.len()))
}

impl Serialize for Step {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Step::Retain(n) => serializer.serialize_i64(*n as i64),
            Step::Delete(n) => serializer.serialize_i64(-(*n as i64)),
            Step::Insert(text) => serializer.serialize_str(text),
        }
    }
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawStep {
            Count(i64),
            Text(String),
        }

        let step = match RawStep::deserialize(deserializer)? {
            RawStep::Count(n) => Step::from_count(n).map_err(de::Error::custom)?,
            RawStep::Text(text) => Step::Insert(text),
        };
        step.validate().map_err(de::Error::custom)?;
        Ok(step)
    }
}

/// An immutable edit: steps are walked left to right against an input cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Step>", into = "Vec<Step>")]
pub struct Operation {
    steps: Vec<Step>,
}

impl Operation {
    /// Empty operation (identity on any text).
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Build from client-provided steps, rejecting zero-length ones and
    /// step counts whose totals do not fit in `usize`.
    pub fn from_steps(steps: Vec<Step>) -> Result<Self, OtError> {
        for step in &steps {
            step.validate()?;
        }
        if checked_total(&steps, Step::consumes_input).is_none()
            || checked_total(&steps, |s| !matches!(s, Step::Delete(_))).is_none()
        {
            return Err(OtError::InvalidStep("operation length overflows".to_string()));
        }
        Ok(Self { steps })
    }

    /// Decode the JSON step array form.
    pub fn from_json(value: serde_json::Value) -> Result<Self, OtError> {
        serde_json::from_value(value).map_err(|e| OtError::InvalidStep(e.to_string()))
    }

    /// Encode to the JSON step array form.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.steps
                .iter()
                .map(|step| match step {
                    Step::Retain(n) => serde_json::Value::from(*n as i64),
                    Step::Delete(n) => serde_json::Value::from(-(*n as i64)),
                    Step::Insert(text) => serde_json::Value::from(text.as_str()),
                })
                .collect(),
        )
    }

    #[must_use]
    pub fn retain(mut self, count: usize) -> Self {
        if count > 0 {
            self.steps.push(Step::Retain(count));
        }
        self
    }

    #[must_use]
    pub fn insert(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        if !text.is_empty() {
            self.steps.push(Step::Insert(text));
        }
        self
    }

    #[must_use]
    pub fn delete(mut self, count: usize) -> Self {
        if count > 0 {
            self.steps.push(Step::Delete(count));
        }
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<Step> {
        self.steps
    }

    /// Number of steps (not characters).
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Characters of input consumed (retains + deletes). Saturates at
    /// `usize::MAX`, which no text can satisfy.
    pub fn base_len(&self) -> usize {
        saturating_total(&self.steps, Step::consumes_input)
    }

    /// Characters produced from the consumed input (retains + inserts).
    pub fn target_len(&self) -> usize {
        saturating_total(&self.steps, |s| !matches!(s, Step::Delete(_)))
    }

    /// True when applying the operation can never change a text.
    pub fn is_noop(&self) -> bool {
        self.steps.iter().all(|s| matches!(s, Step::Retain(_)))
    }

    /// Make the implicit trailing retain explicit so that `base_len() == len`.
    pub fn normalized(&self, len: usize) -> Result<Self, OtError> {
        let consumed = self.base_len();
        if consumed > len {
            return Err(OtError::InvalidOperation { cursor: consumed, len });
        }
        Ok(self.clone().retain(len - consumed))
    }

    pub(crate) fn push(&mut self, step: Step) {
        self.steps.push(step);
    }
}

impl From<Operation> for Vec<Step> {
    fn from(op: Operation) -> Self {
        op.steps
    }
}

impl TryFrom<Vec<Step>> for Operation {
    type Error = OtError;

    fn try_from(steps: Vec<Step>) -> Result<Self, Self::Error> {
        Operation::from_steps(steps)
    }
}
