//! Object detections attached to an image, and the helpers that tie caption tags to them.
//!
//! Detection arrays are padded to a common length along their second dimension; the entries
//! past `num_detections[i]` are padding and only ever read through a mask.
use candle::{DType, Result, Tensor};

/// Tag value used for caption tokens that do not refer to any detection.
pub const NO_TAG: i64 = -1;

/// A batch of detections, all tensors share the leading `[batch, max_detections]` dimensions.
#[derive(Debug, Clone)]
pub struct Detections {
    /// `[batch]` u32.
    pub num_detections: Tensor,
    /// `[batch, max_detections, 4]` f32.
    pub boxes: Tensor,
    /// `[batch, max_detections]` u32, the detector label ids.
    pub classes: Tensor,
    /// `[batch, max_detections]` f32.
    pub scores: Tensor,
    /// `[batch, max_detections, dims]` f32.
    pub features: Tensor,
}

impl Detections {
    pub fn batch_size(&self) -> Result<usize> {
        self.num_detections.dims1()
    }

    /// The padded detection count, i.e. the second dimension of every per-detection array.
    pub fn max_detections(&self) -> Result<usize> {
        self.classes.dim(1)
    }

    pub fn feature_dims(&self) -> Result<usize> {
        self.features.dim(2)
    }

    /// Checks that the five arrays agree on the batch size and the padded detection count.
    pub fn validate(&self) -> Result<()> {
        let batch_size = self.batch_size()?;
        let (b, m) = self.classes.dims2()?;
        if b != batch_size {
            candle::bail!(
                "detection_classes batch size {b} does not match num_detections {batch_size}"
            )
        }
        let (boxes_b, boxes_m, coords) = self.boxes.dims3()?;
        if (boxes_b, boxes_m, coords) != (batch_size, m, 4) {
            candle::bail!(
                "detection_boxes has shape {:?}, expected ({batch_size}, {m}, 4)",
                self.boxes.shape()
            )
        }
        if self.scores.dims2()? != (batch_size, m) {
            candle::bail!(
                "detection_scores has shape {:?}, expected ({batch_size}, {m})",
                self.scores.shape()
            )
        }
        let (features_b, features_m, _) = self.features.dims3()?;
        if (features_b, features_m) != (batch_size, m) {
            candle::bail!(
                "detection_features has shape {:?}, expected ({batch_size}, {m}, _)",
                self.features.shape()
            )
        }
        Ok(())
    }

    /// Trims the batch to at most `max_num_detections` detections.
    ///
    /// The new padded count is `min(max_i num_detections[i], max_num_detections)`, every
    /// per-detection array is cut to that width and the per-example counts are clamped to it.
    pub fn truncate(&self, max_num_detections: usize) -> Result<Self> {
        self.validate()?;
        let _enter = tracing::span!(tracing::Level::TRACE, "remove-detections").entered();
        let counts = self.num_detections.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        let padded = self.max_detections()?;
        let largest = counts.iter().copied().max().unwrap_or(0) as usize;
        if largest > padded {
            candle::bail!("num_detections reaches {largest} but detections are padded to {padded}")
        }
        let max_detections = largest.min(max_num_detections);
        let num_detections = self
            .num_detections
            .to_dtype(DType::U32)?
            .minimum(max_detections as u32)?;
        Ok(Self {
            num_detections,
            boxes: self.boxes.narrow(1, 0, max_detections)?,
            classes: self.classes.narrow(1, 0, max_detections)?,
            scores: self.scores.narrow(1, 0, max_detections)?,
            features: self.features.narrow(1, 0, max_detections)?,
        })
    }

    /// Returns a copy of the detections using `features` as the per-detection features.
    pub fn with_features(&self, features: Tensor) -> Self {
        Self {
            features,
            ..self.clone()
        }
    }
}

/// Boolean (u8) mask of shape `[batch, maxlen]` that is set where `position < lengths[i]`.
pub fn sequence_mask(lengths: &Tensor, maxlen: usize) -> Result<Tensor> {
    let batch_size = lengths.dims1()?;
    if maxlen == 0 {
        return Tensor::zeros((batch_size, 0), DType::U8, lengths.device());
    }
    let positions = Tensor::arange(0u32, maxlen as u32, lengths.device())?.unsqueeze(0)?;
    let lengths = lengths.to_dtype(DType::U32)?.unsqueeze(1)?;
    positions.broadcast_lt(&lengths)
}

/// Rewrites tags that point past the kept detections to [`NO_TAG`].
///
/// `tags` is an i64 tensor of any shape. Values in `[0, max_num_detections)` and the `NO_TAG`
/// sentinel pass through, anything below the sentinel is rejected.
pub fn preprocess_tags(tags: &Tensor, max_num_detections: usize) -> Result<Tensor> {
    if tags.dtype() != DType::I64 {
        candle::bail!("tag ids are expected to be i64, got {:?}", tags.dtype())
    }
    if tags.elem_count() > 0 {
        let smallest = tags.flatten_all()?.min(0)?.to_scalar::<i64>()?;
        if smallest < NO_TAG {
            candle::bail!("invalid tag id {smallest}, tags must be {NO_TAG} or a detection index")
        }
    }
    let no_tag = Tensor::full(NO_TAG, tags.shape(), tags.device())?;
    tags.ge(max_num_detections as i64)?.where_cond(&no_tag, tags)
}

/// Looks up the detection feature referenced by every tag.
///
/// `detection_features` is `[batch, max_detections, dims]` and `tags` is
/// `[batch, num_choices, max_len]` with values in `[0, max_detections)` or [`NO_TAG`]. The result
/// is `[batch, num_choices, max_len, dims]`, zero wherever the tag is `NO_TAG`.
///
/// A zero row is appended to each example's feature table and untagged positions are pointed at
/// it, so every lookup is a plain gather.
pub fn ground_detection_features(detection_features: &Tensor, tags: &Tensor) -> Result<Tensor> {
    let _enter = tracing::span!(tracing::Level::TRACE, "ground-detections").entered();
    let (batch_size, max_detections, dims) = detection_features.dims3()?;
    let (tags_batch_size, num_choices, max_len) = tags.dims3()?;
    if tags_batch_size != batch_size {
        candle::bail!("tags batch size {tags_batch_size} does not match detections {batch_size}")
    }
    let padding = Tensor::zeros(
        (batch_size, 1, dims),
        detection_features.dtype(),
        detection_features.device(),
    )?;
    let table = if max_detections == 0 {
        padding
    } else {
        Tensor::cat(&[detection_features, &padding], 1)?
    };
    let table = table.reshape((batch_size * (max_detections + 1), dims))?;

    let padding_index = Tensor::full(max_detections as i64, tags.shape(), tags.device())?;
    let tags = tags
        .lt(0i64)?
        .where_cond(&padding_index, tags)?
        .to_dtype(DType::U32)?;
    let offsets = (0..batch_size)
        .map(|i| (i * (max_detections + 1)) as u32)
        .collect::<Vec<_>>();
    let offsets = Tensor::from_vec(offsets, (batch_size, 1, 1), tags.device())?;
    let indices = tags.broadcast_add(&offsets)?.flatten_all()?;
    table
        .index_select(&indices, 0)?
        .reshape((batch_size, num_choices, max_len, dims))
}
