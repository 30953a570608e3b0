//! Fine-tuning of a detection-grounded BERT on visual commonsense reasoning.
//!
//! Every choice of a question is paired with the image detections into one mixed sequence:
//!
//! ```text
//! [CLS] [DET_1] ... [DET_M] [SEP] [TOKEN_1] ... [TOKEN_L] [SEP]
//! ```
//!
//! The same encoder scores all choices, a linear layer turns each pooled output into a logit
//! and the choice with the highest logit is the prediction. Optionally the projected detection
//! features are decoded back into detector labels through the tied word embeddings, as an
//! auxiliary objective.
use super::vbert::{self, HiddenActLayer, VBertModel};
use super::with_tracing::{layer_norm, linear, LayerNorm, Linear};
use crate::checkpoint::{init_from_checkpoint, Restoration};
use crate::detections::{ground_detection_features, preprocess_tags, sequence_mask, Detections};
use crate::inputs::{ChoiceFields, VcrInputs, NUM_CHOICES};
use crate::loss::{self, Accuracy};
use crate::params::VarPartition;
use crate::sequence::{Caption, MixedSequence, TaggedEncoder};
use candle::{IndexOp, Module, Result, Tensor, D};
use candle_nn::{Dropout, VarBuilder, VarMap};
use serde::Deserialize;
use std::path::PathBuf;

/// Prefix of the encoder variables, used when restoring a pretrained BERT checkpoint.
pub const BERT_SCOPE: &str = "bert.";
/// Prefix of the hidden layer of the detection MLP, restored from its own checkpoint.
pub const DETECTION_PROJECT_SCOPE: &str = "detection.project.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionAdaptation {
    /// A single affine map to the hidden size.
    Linear,
    /// `relu(dense)`, dropout, then an affine map to the hidden size.
    Mlp,
}

fn default_max_num_detections() -> usize {
    10
}

fn default_dropout_keep_prob() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    pub bert_config_file: PathBuf,
    #[serde(default)]
    pub bert_checkpoint_file: Option<PathBuf>,
    #[serde(default)]
    pub detection_mlp_checkpoint_file: Option<PathBuf>,
    #[serde(default = "default_max_num_detections")]
    pub max_num_detections: usize,
    pub detection_adaptation: DetectionAdaptation,
    #[serde(default)]
    pub detection_mlp_hidden_units: usize,
    #[serde(default = "default_dropout_keep_prob")]
    pub dropout_keep_prob: f64,
    #[serde(default)]
    pub use_sigmoid_loss: bool,
    #[serde(default)]
    pub use_detection_loss: bool,
    #[serde(default)]
    pub frozen_variable_patterns: Vec<String>,
    #[serde(default)]
    pub rationale_model: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bert_config_file: PathBuf::from("bert_config.json"),
            bert_checkpoint_file: None,
            detection_mlp_checkpoint_file: None,
            max_num_detections: default_max_num_detections(),
            detection_adaptation: DetectionAdaptation::Linear,
            detection_mlp_hidden_units: 0,
            dropout_keep_prob: default_dropout_keep_prob(),
            use_sigmoid_loss: false,
            use_detection_loss: false,
            frozen_variable_patterns: vec![],
            rationale_model: false,
        }
    }
}

impl Config {
    pub fn from_json_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = std::fs::read_to_string(path)
            .map_err(|err| candle::Error::wrap(err).context(format!("reading {path:?}")))?;
        let config: Self = serde_json::from_str(&config).map_err(candle::Error::wrap)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_num_detections == 0 {
            candle::bail!("max_num_detections should be positive")
        }
        if !(self.dropout_keep_prob > 0.0 && self.dropout_keep_prob <= 1.0) {
            candle::bail!("dropout_keep_prob should be in (0, 1], got {}", self.dropout_keep_prob)
        }
        if self.detection_adaptation == DetectionAdaptation::Mlp
            && self.detection_mlp_hidden_units == 0
        {
            candle::bail!("the mlp detection adaptation requires detection_mlp_hidden_units")
        }
        Ok(())
    }

    /// Loads the encoder configuration referenced by `bert_config_file`.
    pub fn bert_config(&self) -> Result<vbert::Config> {
        vbert::Config::from_json_file(&self.bert_config_file)
    }

    pub fn choice_fields(&self) -> ChoiceFields {
        ChoiceFields::new(self.rationale_model)
    }
}

enum DetectionProjection {
    Linear {
        adaptation: Linear,
    },
    Mlp {
        project: Linear,
        dropout: Dropout,
        adaptation: Linear,
    },
}

impl DetectionProjection {
    fn load(
        feature_dims: usize,
        config: &Config,
        bert_config: &vbert::Config,
        vb: VarBuilder,
    ) -> Result<Self> {
        let init = bert_config.initializer_range;
        let hidden_size = bert_config.hidden_size;
        match config.detection_adaptation {
            DetectionAdaptation::Linear => {
                let adaptation = linear(feature_dims, hidden_size, init, vb.pp("adaptation"))?;
                Ok(Self::Linear { adaptation })
            }
            DetectionAdaptation::Mlp => {
                let units = config.detection_mlp_hidden_units;
                let project = linear(feature_dims, units, init, vb.pp("project"))?;
                let adaptation = linear(units, hidden_size, init, vb.pp("adaptation"))?;
                let dropout = Dropout::new((1.0 - config.dropout_keep_prob) as f32);
                Ok(Self::Mlp {
                    project,
                    dropout,
                    adaptation,
                })
            }
        }
    }

    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::Linear { adaptation } => adaptation.forward(xs),
            Self::Mlp {
                project,
                dropout,
                adaptation,
            } => {
                let xs = project.forward(xs)?.relu()?;
                let xs = dropout.forward(&xs, train)?;
                adaptation.forward(&xs)
            }
        }
    }
}

/// Predicts detector labels from projected detection features, sharing its output projection
/// with the encoder word embeddings.
struct DetectionPredictionHead {
    transform: Linear,
    transform_act: HiddenActLayer,
    layer_norm: LayerNorm,
    decoder: Linear,
    vocab_size: usize,
    span: tracing::Span,
}

impl DetectionPredictionHead {
    fn load(vb: VarBuilder, config: &vbert::Config, embedding_table: &Tensor) -> Result<Self> {
        let transform = linear(
            config.hidden_size,
            config.hidden_size,
            config.initializer_range,
            vb.pp("transform.dense"),
        )?;
        let layer_norm = layer_norm(
            config.hidden_size,
            config.layer_norm_eps,
            vb.pp("transform.LayerNorm"),
        )?;
        // The decoder weight is the word embedding table, only the bias is owned by the head.
        let output_bias =
            vb.get_with_hints(config.vocab_size, "output_bias", candle_nn::init::ZERO)?;
        let decoder = Linear::from_weights(embedding_table.clone(), Some(output_bias));
        Ok(Self {
            transform,
            transform_act: HiddenActLayer::new(config.hidden_act),
            layer_norm,
            decoder,
            vocab_size: config.vocab_size,
            span: tracing::span!(tracing::Level::TRACE, "detection-prediction"),
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b_size, max_detections, _) = xs.dims3()?;
        if max_detections == 0 {
            return Tensor::zeros((b_size, 0, self.vocab_size), xs.dtype(), xs.device());
        }
        xs.apply(&self.transform)?
            .apply(&self.transform_act)?
            .apply(&self.layer_norm)?
            .apply(&self.decoder)
    }
}

/// Per-choice inputs, every tensor has leading dimensions `[batch, num_choices]`.
#[derive(Debug, Clone)]
pub struct Choices {
    pub ids: Tensor,
    pub tag_ids: Tensor,
    pub tag_features: Tensor,
    pub lengths: Tensor,
}

impl Choices {
    pub fn num_choices(&self) -> Result<usize> {
        self.ids.dim(1)
    }

    pub fn caption(&self, index: usize) -> Result<Caption> {
        Ok(Caption {
            ids: self.ids.i((.., index))?,
            tag_ids: self.tag_ids.i((.., index))?,
            tag_features: self.tag_features.i((.., index))?,
            lengths: self.lengths.i((.., index))?,
        })
    }
}

/// Encodes every choice against the same detections and stacks the pooled outputs into a
/// `[batch, num_choices, hidden]` tensor.
///
/// All choices go through the same `encoder`, so its parameters receive the gradients of every
/// choice.
pub fn encode_choices<E: TaggedEncoder>(
    encoder: &E,
    detections: &Detections,
    choices: &Choices,
    train: bool,
) -> Result<Tensor> {
    let num_choices = choices.num_choices()?;
    if num_choices == 0 {
        candle::bail!("empty choice set")
    }
    let pooled_outputs = (0..num_choices)
        .map(|index| {
            let caption = choices.caption(index)?;
            let sequence = MixedSequence::new(detections, &caption)?;
            Ok(encoder.encode(&sequence, train)?.pooled_output)
        })
        .collect::<Result<Vec<_>>>()?;
    Tensor::stack(&pooled_outputs, 1)
}

#[derive(Debug, Clone)]
pub struct Predictions {
    /// `[batch, NUM_CHOICES]` choice logits.
    pub answer_prediction: Tensor,
    /// `[batch]` detection counts after truncation.
    pub num_detections: Tensor,
    /// `[batch, max_detections]` detector labels after truncation.
    pub detection_classes: Tensor,
    /// `[batch, max_detections, vocab_size]` detector label logits.
    pub detection_prediction: Tensor,
}

#[derive(Debug, Clone)]
pub struct Losses {
    pub crossentropy: Tensor,
    pub detection_loss: Option<Tensor>,
}

impl Losses {
    /// Sum of the enabled losses, the quantity to minimize.
    pub fn total(&self) -> Result<Tensor> {
        match &self.detection_loss {
            None => Ok(self.crossentropy.clone()),
            Some(detection_loss) => &self.crossentropy + detection_loss,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metrics {
    pub accuracy: Accuracy,
    pub detection_accuracy: Option<Accuracy>,
}

impl Metrics {
    pub fn merge(&mut self, other: &Metrics) {
        self.accuracy.merge(&other.accuracy);
        if let Some(other) = &other.detection_accuracy {
            self.detection_accuracy
                .get_or_insert_with(Accuracy::new)
                .merge(other)
        }
    }
}

pub struct VBertFt {
    config: Config,
    detection_projection: DetectionProjection,
    bert: VBertModel,
    itm_logits: Linear,
    detection_prediction: DetectionPredictionHead,
    hidden_size: usize,
    span: tracing::Span,
}

impl VBertFt {
    /// Builds the model, `feature_dims` being the width of the raw detection features.
    pub fn new(
        config: &Config,
        bert_config: &vbert::Config,
        feature_dims: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        config.validate()?;
        let detection_projection =
            DetectionProjection::load(feature_dims, config, bert_config, vb.pp("detection"))?;
        let bert = VBertModel::load(vb.pp("bert"), bert_config)?;
        let itm_logits = linear(
            bert_config.hidden_size,
            1,
            bert_config.initializer_range,
            vb.pp("itm.logits"),
        )?;
        let detection_prediction = DetectionPredictionHead::load(
            vb.pp("cls.predictions"),
            bert_config,
            bert.embedding_table(),
        )?;
        Ok(Self {
            config: config.clone(),
            detection_projection,
            bert,
            itm_logits,
            detection_prediction,
            hidden_size: bert_config.hidden_size,
            span: tracing::span!(tracing::Level::TRACE, "vbert-ft"),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bert(&self) -> &VBertModel {
        &self.bert
    }

    /// Maps `[batch, max_detections, feature_dims]` features to the encoder hidden size.
    pub fn project_detection_features(&self, features: &Tensor, train: bool) -> Result<Tensor> {
        let (b_size, max_detections, _) = features.dims3()?;
        if max_detections == 0 {
            return Tensor::zeros(
                (b_size, 0, self.hidden_size),
                features.dtype(),
                features.device(),
            );
        }
        self.detection_projection.forward(features, train)
    }

    pub fn predict(&self, inputs: &VcrInputs, train: bool) -> Result<Predictions> {
        let _enter = self.span.enter();
        inputs.validate()?;
        let detections = inputs.detections.truncate(self.config.max_num_detections)?;
        let max_detections = detections.max_detections()?;

        let detection_features = self.project_detection_features(&detections.features, train)?;
        let detections = detections.with_features(detection_features);

        let tag_ids = preprocess_tags(&inputs.choice_tag_ids, max_detections)?;
        let tag_features = ground_detection_features(&detections.features, &tag_ids)?;
        let choices = Choices {
            ids: inputs.choice_ids.clone(),
            tag_ids,
            tag_features,
            lengths: inputs.choice_lengths.clone(),
        };
        let features = encode_choices(&self.bert, &detections, &choices, train)?;

        let detection_prediction = self.detection_prediction.forward(&detections.features)?;
        let answer_prediction = self.itm_logits.forward(&features)?.squeeze(D::Minus1)?;

        Ok(Predictions {
            answer_prediction,
            num_detections: detections.num_detections,
            detection_classes: detections.classes,
            detection_prediction,
        })
    }

    fn labels<'a>(&self, inputs: &'a VcrInputs) -> Result<&'a Tensor> {
        match &inputs.label {
            Some(label) => Ok(label),
            None => candle::bail!(
                "the inputs carry no {} field",
                self.config.choice_fields().label
            ),
        }
    }

    /// Validity of the detection slots, excluding slot 0 which stands for the full image.
    fn detection_masks(predictions: &Predictions) -> Result<Option<Tensor>> {
        let max_detections = predictions.detection_classes.dim(1)?;
        if max_detections <= 1 {
            return Ok(None);
        }
        let masks = sequence_mask(&predictions.num_detections, max_detections)?;
        Ok(Some(masks.narrow(1, 1, max_detections - 1)?))
    }

    pub fn build_losses(&self, inputs: &VcrInputs, predictions: &Predictions) -> Result<Losses> {
        let logits = &predictions.answer_prediction;
        let labels = loss::one_hot(self.labels(inputs)?, NUM_CHOICES)?;
        let crossentropy = if self.config.use_sigmoid_loss {
            loss::sigmoid_cross_entropy_with_logits(logits, &labels)?.mean_all()?
        } else {
            loss::softmax_cross_entropy_with_logits(logits, &labels)?.mean_all()?
        };

        let detection_loss = if self.config.use_detection_loss {
            let detection_loss = match Self::detection_masks(predictions)? {
                None => Tensor::zeros((), logits.dtype(), logits.device())?,
                Some(masks) => {
                    let max_detections = predictions.detection_classes.dim(1)?;
                    let losses = loss::sparse_softmax_cross_entropy_with_logits(
                        &predictions.detection_prediction,
                        &predictions.detection_classes,
                    )?;
                    let losses = losses.narrow(1, 1, max_detections - 1)?;
                    loss::masked_avg(&losses, &masks, 1)?.mean_all()?
                }
            };
            Some(detection_loss)
        } else {
            None
        };
        Ok(Losses {
            crossentropy,
            detection_loss,
        })
    }

    pub fn build_metrics(&self, inputs: &VcrInputs, predictions: &Predictions) -> Result<Metrics> {
        let y_pred = predictions.answer_prediction.argmax(D::Minus1)?;
        let (correct, total) = loss::accuracy_counts(&y_pred, self.labels(inputs)?, None)?;
        let mut accuracy = Accuracy::new();
        accuracy.update_state(correct, total);

        let detection_accuracy = if self.config.use_detection_loss {
            let mut detection_accuracy = Accuracy::new();
            if let Some(masks) = Self::detection_masks(predictions)? {
                let max_detections = predictions.detection_classes.dim(1)?;
                let detection_predictions = predictions
                    .detection_prediction
                    .argmax(D::Minus1)?
                    .narrow(1, 1, max_detections - 1)?;
                let detection_classes = predictions
                    .detection_classes
                    .narrow(1, 1, max_detections - 1)?;
                let (correct, total) = loss::accuracy_counts(
                    &detection_predictions,
                    &detection_classes,
                    Some(&masks),
                )?;
                detection_accuracy.update_state(correct, total);
            }
            Some(detection_accuracy)
        } else {
            None
        };
        Ok(Metrics {
            accuracy,
            detection_accuracy,
        })
    }

    /// Restores the pretrained encoder and, when configured, the detection MLP.
    pub fn restore_from_checkpoints(&self, varmap: &VarMap) -> Result<Vec<Restoration>> {
        let mut restorations = vec![];
        match &self.config.bert_checkpoint_file {
            Some(path) => restorations.push(init_from_checkpoint(varmap, path, BERT_SCOPE)?),
            None => {
                tracing::warn!("no bert checkpoint configured, the encoder starts from scratch")
            }
        }
        if let Some(path) = &self.config.detection_mlp_checkpoint_file {
            restorations.push(init_from_checkpoint(varmap, path, DETECTION_PROJECT_SCOPE)?)
        }
        Ok(restorations)
    }

    /// Splits the variables into the ones to optimize and the ones matched by
    /// `frozen_variable_patterns`.
    pub fn variables_to_train(&self, varmap: &VarMap) -> VarPartition {
        VarPartition::from_patterns(varmap, &self.config.frozen_variable_patterns)
    }
}
