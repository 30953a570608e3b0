//! Assembly of the mixed image/text token sequence fed to the encoder.
//!
//! ```text
//! [CLS] [DET_1] ... [DET_M] [SEP] [TOKEN_1] ... [TOKEN_L] [SEP]
//! ```
//!
//! Detection slots carry the detection class id but their embedding is always replaced by the
//! detection feature. Caption tokens carrying a tag have their embedding replaced by the feature
//! of the referenced detection.
use crate::detections::{sequence_mask, Detections};
use candle::{DType, Result, Tensor};

pub const CLS_ID: u32 = 101;
pub const SEP_ID: u32 = 102;

/// One candidate text for every example of the batch.
#[derive(Debug, Clone)]
pub struct Caption {
    /// `[batch, max_len]` token ids.
    pub ids: Tensor,
    /// `[batch, max_len]` i64 resolved tags, see [`crate::detections::preprocess_tags`].
    pub tag_ids: Tensor,
    /// `[batch, max_len, dims]` grounded tag features.
    pub tag_features: Tensor,
    /// `[batch]` number of valid tokens.
    pub lengths: Tensor,
}

/// The four parallel tensors describing an encoder input, all of length
/// `1 + max_detections + 1 + max_len + 1` along the sequence axis.
#[derive(Debug, Clone)]
pub struct MixedSequence {
    /// `[batch, seq_len]` u32.
    pub input_ids: Tensor,
    /// `[batch, seq_len]` u8, set for real content and the structural markers.
    pub input_mask: Tensor,
    /// `[batch, seq_len]` u8, set where the embedding is replaced by `tag_features`.
    pub tag_mask: Tensor,
    /// `[batch, seq_len, dims]`, zero where `tag_mask` is unset.
    pub tag_features: Tensor,
}

// Tensor::cat does not accept parts that are empty along the concatenation axis.
fn cat_non_empty(parts: &[&Tensor], dim: usize) -> Result<Tensor> {
    let parts = parts
        .iter()
        .filter(|t| t.dim(dim).map_or(true, |size| size > 0))
        .copied()
        .collect::<Vec<_>>();
    Tensor::cat(&parts, dim)
}

impl MixedSequence {
    pub fn new(detections: &Detections, caption: &Caption) -> Result<Self> {
        let _enter = tracing::span!(tracing::Level::TRACE, "mixed-sequence").entered();
        let batch_size = detections.batch_size()?;
        let max_detections = detections.max_detections()?;
        let dims = detections.feature_dims()?;
        let (caption_batch_size, max_len) = caption.ids.dims2()?;
        if caption_batch_size != batch_size {
            candle::bail!(
                "caption batch size {caption_batch_size} does not match detections {batch_size}"
            )
        }
        if caption.tag_ids.dims2()? != (batch_size, max_len) {
            candle::bail!(
                "caption tags have shape {:?}, expected ({batch_size}, {max_len})",
                caption.tag_ids.shape()
            )
        }
        if caption.tag_features.dims3()? != (batch_size, max_len, dims) {
            candle::bail!(
                "caption tag features have shape {:?}, expected ({batch_size}, {max_len}, {dims})",
                caption.tag_features.shape()
            )
        }
        let device = detections.classes.device();

        let cls = Tensor::full(CLS_ID, (batch_size, 1), device)?;
        let sep = Tensor::full(SEP_ID, (batch_size, 1), device)?;
        let input_ids = cat_non_empty(
            &[
                &cls,
                &detections.classes.to_dtype(DType::U32)?,
                &sep,
                &caption.ids.to_dtype(DType::U32)?,
                &sep,
            ],
            1,
        )?;

        let mask_true = Tensor::ones((batch_size, 1), DType::U8, device)?;
        let mask_false = Tensor::zeros((batch_size, 1), DType::U8, device)?;
        let detection_mask = sequence_mask(&detections.num_detections, max_detections)?;
        let caption_mask = sequence_mask(&caption.lengths, max_len)?;
        let input_mask = cat_non_empty(
            &[&mask_true, &detection_mask, &mask_true, &caption_mask, &mask_true],
            1,
        )?;

        let caption_tag_mask = caption.tag_ids.ge(0i64)?;
        let tag_mask = cat_non_empty(
            &[
                &mask_false,
                &detection_mask,
                &mask_false,
                &caption_tag_mask,
                &mask_false,
            ],
            1,
        )?;

        let zeros = Tensor::zeros((batch_size, 1, dims), detections.features.dtype(), device)?;
        let tag_features = cat_non_empty(
            &[
                &zeros,
                &detections.features,
                &zeros,
                &caption.tag_features.to_dtype(detections.features.dtype())?,
                &zeros,
            ],
            1,
        )?;

        Ok(Self {
            input_ids,
            input_mask,
            tag_mask,
            tag_features,
        })
    }

    pub fn seq_len(&self) -> Result<usize> {
        self.input_ids.dim(1)
    }
}

/// What the fine-tuning model needs from an encoder run on a [`MixedSequence`].
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// `[batch, seq_len, hidden]`.
    pub sequence_output: Tensor,
    /// `[batch, hidden]` summary of the whole sequence.
    pub pooled_output: Tensor,
}

/// A text encoder able to take externally supplied embeddings at masked positions.
pub trait TaggedEncoder {
    fn encode(&self, sequence: &MixedSequence, train: bool) -> Result<EncoderOutput>;

    /// The `[vocab_size, hidden]` word embedding table.
    fn embedding_table(&self) -> &Tensor;
}
