//! Losses and accuracy helpers used by the multiple-choice objective.
use candle::{DType, Result, Tensor, D};

const SMALL_NUMBER: f64 = 1e-8;

/// One-hot encodes `labels` (`[N]`, integer) into a `[N, depth]` f32 tensor.
pub fn one_hot(labels: &Tensor, depth: usize) -> Result<Tensor> {
    let n = labels.dims1()?;
    let labels = labels.to_dtype(DType::U32)?;
    let largest = if n == 0 {
        0
    } else {
        labels.max(0)?.to_scalar::<u32>()? as usize + 1
    };
    if largest > depth {
        candle::bail!("label {} is out of range for {depth} classes", largest - 1)
    }
    let classes = Tensor::arange(0u32, depth as u32, labels.device())?.unsqueeze(0)?;
    classes
        .broadcast_eq(&labels.unsqueeze(1)?)?
        .to_dtype(DType::F32)
}

/// Softmax cross-entropy between raw `logits` and a probability distribution `labels`, both of
/// shape `[N, C]`. Returns the per-row losses `[N]`.
pub fn softmax_cross_entropy_with_logits(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    if logits.rank() != 2 {
        candle::bail!("softmax_cross_entropy_with_logits expects an input tensor of rank 2")
    }
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    (labels.to_dtype(log_probs.dtype())? * log_probs)?
        .sum(D::Minus1)?
        .neg()
}

/// Element-wise sigmoid cross-entropy, `max(x, 0) - x * z + log(1 + exp(-|x|))`.
///
/// This is the numerically stable form of `-z * log(sigmoid(x)) - (1 - z) * log(1 - sigmoid(x))`.
pub fn sigmoid_cross_entropy_with_logits(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let labels = labels.to_dtype(logits.dtype())?;
    let log1p_exp = logits.abs()?.neg()?.exp()?.affine(1., 1.)?.log()?;
    (logits.relu()? - (logits * labels)?)? + log1p_exp
}

/// Sparse softmax cross-entropy over the last dimension.
///
/// `logits` is `[..., C]` and `labels` is `[...]` with class indices, the result has the shape
/// of `labels`.
pub fn sparse_softmax_cross_entropy_with_logits(
    logits: &Tensor,
    labels: &Tensor,
) -> Result<Tensor> {
    if logits.rank() != labels.rank() + 1 {
        candle::bail!(
            "logits of shape {:?} do not match labels of shape {:?}",
            logits.shape(),
            labels.shape()
        )
    }
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let labels = labels
        .to_dtype(DType::U32)?
        .unsqueeze(D::Minus1)?
        .contiguous()?;
    log_probs.gather(&labels, D::Minus1)?.squeeze(D::Minus1)?.neg()
}

/// Average of `data` along `dim` restricted to the positions where `mask` is one.
///
/// Rows with an empty mask average to zero.
pub fn masked_avg(data: &Tensor, mask: &Tensor, dim: usize) -> Result<Tensor> {
    let mask = mask.to_dtype(data.dtype())?;
    let sums = (data * &mask)?.sum_keepdim(dim)?;
    let counts = mask.sum_keepdim(dim)?.maximum(SMALL_NUMBER)?;
    sums.broadcast_div(&counts)
}

/// Counts the positions where `predictions` equals `targets`, restricted to `mask` when given.
///
/// Returns `(correct, total)`.
pub fn accuracy_counts(
    predictions: &Tensor,
    targets: &Tensor,
    mask: Option<&Tensor>,
) -> Result<(usize, usize)> {
    if predictions.shape() != targets.shape() {
        candle::bail!(
            "predictions of shape {:?} do not match targets of shape {:?}",
            predictions.shape(),
            targets.shape()
        )
    }
    let hits = predictions
        .to_dtype(DType::U32)?
        .eq(&targets.to_dtype(DType::U32)?)?
        .to_dtype(DType::F32)?;
    let (hits, total) = match mask {
        None => (hits, predictions.elem_count() as f32),
        Some(mask) => {
            let mask = mask.to_dtype(DType::F32)?;
            let total = mask.sum_all()?.to_scalar::<f32>()?;
            ((hits * mask)?, total)
        }
    };
    let correct = hits.sum_all()?.to_scalar::<f32>()?;
    Ok((correct as usize, total as usize))
}

/// Streaming accuracy, accumulating correct and total counts over several batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Accuracy {
    correct: usize,
    total: usize,
}

impl Accuracy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_state(&mut self, correct: usize, total: usize) {
        self.correct += correct;
        self.total += total;
    }

    pub fn merge(&mut self, other: &Accuracy) {
        self.update_state(other.correct, other.total)
    }

    pub fn correct(&self) -> usize {
        self.correct
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// The fraction of correct predictions, zero when nothing has been seen yet.
    pub fn result(&self) -> f64 {
        if self.total == 0 {
            0.
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default()
    }
}
