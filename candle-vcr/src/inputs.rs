//! The tensors a reader provides for one batch of the VCR task.
use crate::detections::Detections;
use candle::{DType, Result, Tensor};
use std::collections::HashMap;

/// Number of candidate answers (or rationales) per question.
pub const NUM_CHOICES: usize = 4;

pub mod fields {
    pub const NUM_DETECTIONS: &str = "num_detections";
    pub const DETECTION_BOXES: &str = "detection_boxes";
    pub const DETECTION_CLASSES: &str = "detection_classes";
    pub const DETECTION_SCORES: &str = "detection_scores";
    pub const DETECTION_FEATURES: &str = "detection_features";

    pub const ANSWER_LABEL: &str = "answer_label";
    pub const MIXED_ANSWER_CHOICES: &str = "mixed_answer_choices";
    pub const MIXED_ANSWER_CHOICES_TAG: &str = "mixed_answer_choices_tag";
    pub const MIXED_ANSWER_CHOICES_LEN: &str = "mixed_answer_choices_len";

    pub const RATIONALE_LABEL: &str = "rationale_label";
    pub const MIXED_RATIONALE_CHOICES: &str = "mixed_rationale_choices";
    pub const MIXED_RATIONALE_CHOICES_TAG: &str = "mixed_rationale_choices_tag";
    pub const MIXED_RATIONALE_CHOICES_LEN: &str = "mixed_rationale_choices_len";
}

/// Names of the choice fields for either the answer or the rationale task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChoiceFields {
    pub label: &'static str,
    pub choices: &'static str,
    pub choices_tag: &'static str,
    pub choices_len: &'static str,
}

impl ChoiceFields {
    pub const ANSWER: Self = Self {
        label: fields::ANSWER_LABEL,
        choices: fields::MIXED_ANSWER_CHOICES,
        choices_tag: fields::MIXED_ANSWER_CHOICES_TAG,
        choices_len: fields::MIXED_ANSWER_CHOICES_LEN,
    };

    pub const RATIONALE: Self = Self {
        label: fields::RATIONALE_LABEL,
        choices: fields::MIXED_RATIONALE_CHOICES,
        choices_tag: fields::MIXED_RATIONALE_CHOICES_TAG,
        choices_len: fields::MIXED_RATIONALE_CHOICES_LEN,
    };

    pub fn new(rationale_model: bool) -> Self {
        if rationale_model {
            Self::RATIONALE
        } else {
            Self::ANSWER
        }
    }
}

#[derive(Debug, Clone)]
pub struct VcrInputs {
    pub detections: Detections,
    /// `[batch, NUM_CHOICES, max_len]` u32 token ids.
    pub choice_ids: Tensor,
    /// `[batch, NUM_CHOICES, max_len]` i64 detection index per token, `-1` when untagged.
    pub choice_tag_ids: Tensor,
    /// `[batch, NUM_CHOICES]` u32 valid token counts.
    pub choice_lengths: Tensor,
    /// `[batch]` u32 index of the correct choice, absent at inference time.
    pub label: Option<Tensor>,
}

fn required<'a>(tensors: &'a HashMap<String, Tensor>, name: &str) -> Result<&'a Tensor> {
    match tensors.get(name) {
        Some(t) => Ok(t),
        None => candle::bail!("missing input field {name}"),
    }
}

impl VcrInputs {
    /// Picks the detection fields and the choice fields of the selected task out of `tensors`.
    pub fn from_tensors(
        tensors: &HashMap<String, Tensor>,
        choice_fields: ChoiceFields,
    ) -> Result<Self> {
        let detections = Detections {
            num_detections: required(tensors, fields::NUM_DETECTIONS)?.to_dtype(DType::U32)?,
            boxes: required(tensors, fields::DETECTION_BOXES)?.to_dtype(DType::F32)?,
            classes: required(tensors, fields::DETECTION_CLASSES)?.to_dtype(DType::U32)?,
            scores: required(tensors, fields::DETECTION_SCORES)?.to_dtype(DType::F32)?,
            features: required(tensors, fields::DETECTION_FEATURES)?.to_dtype(DType::F32)?,
        };
        let label = match tensors.get(choice_fields.label) {
            None => None,
            Some(label) => Some(label.to_dtype(DType::U32)?),
        };
        let inputs = Self {
            detections,
            choice_ids: required(tensors, choice_fields.choices)?.to_dtype(DType::U32)?,
            choice_tag_ids: required(tensors, choice_fields.choices_tag)?.to_dtype(DType::I64)?,
            choice_lengths: required(tensors, choice_fields.choices_len)?.to_dtype(DType::U32)?,
            label,
        };
        inputs.validate()?;
        Ok(inputs)
    }

    pub fn batch_size(&self) -> Result<usize> {
        self.detections.batch_size()
    }

    /// Checks the shapes of every field against the detections' batch size.
    pub fn validate(&self) -> Result<()> {
        self.detections.validate()?;
        let batch_size = self.batch_size()?;
        let (b, num_choices, max_len) = self.choice_ids.dims3()?;
        if b != batch_size {
            candle::bail!("choices batch size {b} does not match detections {batch_size}")
        }
        if num_choices == 0 {
            candle::bail!("empty choice set")
        }
        if num_choices != NUM_CHOICES {
            candle::bail!("expected {NUM_CHOICES} choices, got {num_choices}")
        }
        if self.choice_tag_ids.dims3()? != (batch_size, num_choices, max_len) {
            candle::bail!(
                "choice tags have shape {:?}, expected ({batch_size}, {num_choices}, {max_len})",
                self.choice_tag_ids.shape()
            )
        }
        if self.choice_lengths.dims2()? != (batch_size, num_choices) {
            candle::bail!(
                "choice lengths have shape {:?}, expected ({batch_size}, {num_choices})",
                self.choice_lengths.shape()
            )
        }
        if let Some(label) = &self.label {
            if label.dims1()? != batch_size {
                candle::bail!("labels have shape {:?}, expected ({batch_size},)", label.shape())
            }
        }
        Ok(())
    }
}
