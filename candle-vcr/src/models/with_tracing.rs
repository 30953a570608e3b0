use candle::{Module, Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// Truncated-normal style initializer used by BERT checkpoints, `N(0, initializer_range)`.
pub fn bert_init(initializer_range: f64) -> Init {
    Init::Randn {
        mean: 0.,
        stdev: initializer_range,
    }
}

#[derive(Debug, Clone)]
pub struct Embedding {
    inner: candle_nn::Embedding,
    span: tracing::Span,
}

impl Embedding {
    pub fn new(d1: usize, d2: usize, initializer_range: f64, vb: VarBuilder) -> Result<Self> {
        let embeddings = vb.get_with_hints((d1, d2), "weight", bert_init(initializer_range))?;
        let inner = candle_nn::Embedding::new(embeddings, d2);
        let span = tracing::span!(tracing::Level::TRACE, "embedding");
        Ok(Self { inner, span })
    }

    pub fn embeddings(&self) -> &Tensor {
        self.inner.embeddings()
    }
}

impl Module for Embedding {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        self.inner.forward(xs)
    }
}

#[derive(Debug, Clone)]
pub struct Linear {
    inner: candle_nn::Linear,
    span: tracing::Span,
}

impl Linear {
    pub fn from_weights(weights: Tensor, bias: Option<Tensor>) -> Self {
        let inner = candle_nn::Linear::new(weights, bias);
        let span = tracing::span!(tracing::Level::TRACE, "linear");
        Self { inner, span }
    }
}

/// A linear layer whose weight is drawn from `N(0, initializer_range)` and whose bias starts at
/// zero, the way fresh BERT heads are initialized.
pub fn linear(d1: usize, d2: usize, initializer_range: f64, vb: VarBuilder) -> Result<Linear> {
    let ws = vb.get_with_hints((d2, d1), "weight", bert_init(initializer_range))?;
    let bs = vb.get_with_hints(d2, "bias", candle_nn::init::ZERO)?;
    Ok(Linear::from_weights(ws, Some(bs)))
}

impl Module for Linear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        self.inner.forward(xs)
    }
}

// The fused candle_nn layer norm has no backward pass, this one is built from differentiable ops.
#[derive(Clone, Debug)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
    span: tracing::Span,
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        candle_nn::ops::layer_norm_slow(xs, &self.weight, &self.bias, self.eps as f32)
    }
}

pub fn layer_norm(size: usize, eps: f64, vb: VarBuilder) -> Result<LayerNorm> {
    let weight = vb.get_with_hints(size, "weight", Init::Const(1.))?;
    let bias = vb.get_with_hints(size, "bias", Init::Const(0.))?;
    let span = tracing::span!(tracing::Level::TRACE, "layer-norm");
    Ok(LayerNorm {
        weight,
        bias,
        eps,
        span,
    })
}
