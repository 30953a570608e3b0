//! BERT encoder whose word embeddings can be overridden by visual features.
//!
//! Parameter names follow the BERT checkpoint layout (`embeddings.word_embeddings.weight`,
//! `encoder.layer.0.attention.self.query.weight`, `pooler.dense.weight`, ...) so pretrained
//! weights can be restored on top of a freshly built model.
use super::with_tracing::{layer_norm, linear, Embedding, LayerNorm, Linear};
use crate::sequence::{EncoderOutput, MixedSequence, TaggedEncoder};
use candle::{DType, IndexOp, Module, Result, Tensor, D};
use candle_nn::{Dropout, VarBuilder};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HiddenAct {
    Gelu,
    Relu,
    Tanh,
}

pub(crate) struct HiddenActLayer {
    act: HiddenAct,
    span: tracing::Span,
}

impl HiddenActLayer {
    pub(crate) fn new(act: HiddenAct) -> Self {
        let span = tracing::span!(tracing::Level::TRACE, "hidden-act");
        Self { act, span }
    }
}

impl Module for HiddenActLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        match self.act {
            HiddenAct::Gelu => xs.gelu(),
            HiddenAct::Relu => xs.relu(),
            HiddenAct::Tanh => xs.tanh(),
        }
    }
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

// https://github.com/google-research/bert/blob/master/modeling.py#L31
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub hidden_act: HiddenAct,
    pub hidden_dropout_prob: f64,
    pub attention_probs_dropout_prob: f64,
    pub max_position_embeddings: usize,
    pub type_vocab_size: usize,
    pub initializer_range: f64,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vocab_size: 30522,
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            hidden_act: HiddenAct::Gelu,
            hidden_dropout_prob: 0.1,
            attention_probs_dropout_prob: 0.1,
            max_position_embeddings: 512,
            type_vocab_size: 2,
            initializer_range: 0.02,
            layer_norm_eps: default_layer_norm_eps(),
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
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            candle::bail!(
                "hidden_size {} is not a multiple of num_attention_heads {}",
                self.hidden_size,
                self.num_attention_heads
            )
        }
        for (name, p) in [
            ("hidden_dropout_prob", self.hidden_dropout_prob),
            ("attention_probs_dropout_prob", self.attention_probs_dropout_prob),
        ] {
            if !(0.0..1.0).contains(&p) {
                candle::bail!("{name} should be in [0, 1), got {p}")
            }
        }
        Ok(())
    }
}

struct BertEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    layer_norm: LayerNorm,
    dropout: Dropout,
    max_position_embeddings: usize,
    span: tracing::Span,
}

impl BertEmbeddings {
    fn load(vb: VarBuilder, config: &Config) -> Result<Self> {
        let init = config.initializer_range;
        let word_embeddings = Embedding::new(
            config.vocab_size,
            config.hidden_size,
            init,
            vb.pp("word_embeddings"),
        )?;
        let position_embeddings = Embedding::new(
            config.max_position_embeddings,
            config.hidden_size,
            init,
            vb.pp("position_embeddings"),
        )?;
        let token_type_embeddings = Embedding::new(
            config.type_vocab_size,
            config.hidden_size,
            init,
            vb.pp("token_type_embeddings"),
        )?;
        let layer_norm = layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("LayerNorm"))?;
        Ok(Self {
            word_embeddings,
            position_embeddings,
            token_type_embeddings,
            layer_norm,
            dropout: Dropout::new(config.hidden_dropout_prob as f32),
            max_position_embeddings: config.max_position_embeddings,
            span: tracing::span!(tracing::Level::TRACE, "embeddings"),
        })
    }

    fn forward(
        &self,
        input_ids: &Tensor,
        tag_mask: &Tensor,
        tag_features: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (_bsize, seq_len) = input_ids.dims2()?;
        if seq_len > self.max_position_embeddings {
            candle::bail!(
                "sequence of length {seq_len} exceeds max_position_embeddings {}",
                self.max_position_embeddings
            )
        }
        let word_embeddings = self.word_embeddings.forward(input_ids)?;
        let tag_mask = tag_mask
            .unsqueeze(D::Minus1)?
            .broadcast_as(word_embeddings.shape())?;
        let tag_features = tag_features.to_dtype(word_embeddings.dtype())?;
        let input_embeddings = tag_mask.where_cond(&tag_features, &word_embeddings)?;

        let position_ids = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let token_type_ids = input_ids.zeros_like()?;
        let embeddings = input_embeddings
            .broadcast_add(&self.position_embeddings.forward(&position_ids)?)?
            .add(&self.token_type_embeddings.forward(&token_type_ids)?)?;
        let embeddings = self.layer_norm.forward(&embeddings)?;
        self.dropout.forward(&embeddings, train)
    }
}

struct BertSelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    dropout: Dropout,
    num_attention_heads: usize,
    attention_head_size: usize,
    span: tracing::Span,
}

impl BertSelfAttention {
    fn load(vb: VarBuilder, config: &Config) -> Result<Self> {
        let attention_head_size = config.hidden_size / config.num_attention_heads;
        let all_head_size = config.num_attention_heads * attention_head_size;
        let hidden_size = config.hidden_size;
        let init = config.initializer_range;
        let query = linear(hidden_size, all_head_size, init, vb.pp("query"))?;
        let key = linear(hidden_size, all_head_size, init, vb.pp("key"))?;
        let value = linear(hidden_size, all_head_size, init, vb.pp("value"))?;
        Ok(Self {
            query,
            key,
            value,
            dropout: Dropout::new(config.attention_probs_dropout_prob as f32),
            num_attention_heads: config.num_attention_heads,
            attention_head_size,
            span: tracing::span!(tracing::Level::TRACE, "self-attn"),
        })
    }

    fn transpose_for_scores(&self, xs: &Tensor) -> Result<Tensor> {
        let (bs, seq_len, _) = xs.dims3()?;
        xs.reshape((bs, seq_len, self.num_attention_heads, self.attention_head_size))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (bs, seq_len, _) = hidden_states.dims3()?;
        let q = self.transpose_for_scores(&self.query.forward(hidden_states)?)?;
        let k = self.transpose_for_scores(&self.key.forward(hidden_states)?)?;
        let v = self.transpose_for_scores(&self.value.forward(hidden_states)?)?;

        let q = (q / (self.attention_head_size as f64).sqrt())?;
        let scores = q
            .matmul(&k.t()?.contiguous()?)?
            .broadcast_add(attention_mask)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let probs = self.dropout.forward(&probs, train)?;

        probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((bs, seq_len, self.num_attention_heads * self.attention_head_size))
    }
}

/// Dense projection followed by dropout, residual and layer norm, shared by the attention output
/// and the feed-forward output.
struct BertOutput {
    dense: Linear,
    layer_norm: LayerNorm,
    dropout: Dropout,
    span: tracing::Span,
}

impl BertOutput {
    fn load(in_size: usize, vb: VarBuilder, config: &Config) -> Result<Self> {
        let dense = linear(in_size, config.hidden_size, config.initializer_range, vb.pp("dense"))?;
        let layer_norm = layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("LayerNorm"))?;
        Ok(Self {
            dense,
            layer_norm,
            dropout: Dropout::new(config.hidden_dropout_prob as f32),
            span: tracing::span!(tracing::Level::TRACE, "output"),
        })
    }

    fn forward(
        &self,
        hidden_states: &Tensor,
        input_tensor: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let hidden_states = self.dense.forward(hidden_states)?;
        let hidden_states = self.dropout.forward(&hidden_states, train)?;
        self.layer_norm.forward(&(hidden_states + input_tensor)?)
    }
}

struct BertLayer {
    attention: BertSelfAttention,
    attention_output: BertOutput,
    intermediate: Linear,
    intermediate_act: HiddenActLayer,
    output: BertOutput,
    span: tracing::Span,
}

impl BertLayer {
    fn load(vb: VarBuilder, config: &Config) -> Result<Self> {
        let attention = BertSelfAttention::load(vb.pp("attention.self"), config)?;
        let attention_output =
            BertOutput::load(config.hidden_size, vb.pp("attention.output"), config)?;
        let intermediate = linear(
            config.hidden_size,
            config.intermediate_size,
            config.initializer_range,
            vb.pp("intermediate.dense"),
        )?;
        let output = BertOutput::load(config.intermediate_size, vb.pp("output"), config)?;
        Ok(Self {
            attention,
            attention_output,
            intermediate,
            intermediate_act: HiddenActLayer::new(config.hidden_act),
            output,
            span: tracing::span!(tracing::Level::TRACE, "layer"),
        })
    }

    fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let attention_output = self.attention.forward(hidden_states, attention_mask, train)?;
        let attention_output = self
            .attention_output
            .forward(&attention_output, hidden_states, train)?;
        let intermediate_output = attention_output
            .apply(&self.intermediate)?
            .apply(&self.intermediate_act)?;
        self.output.forward(&intermediate_output, &attention_output, train)
    }
}

/// The encoder used by [`super::vbert_ft::VBertFt`], built under the `bert` prefix.
pub struct VBertModel {
    embeddings: BertEmbeddings,
    layers: Vec<BertLayer>,
    pooler: Linear,
    span: tracing::Span,
}

impl VBertModel {
    pub fn load(vb: VarBuilder, config: &Config) -> Result<Self> {
        config.validate()?;
        let embeddings = BertEmbeddings::load(vb.pp("embeddings"), config)?;
        let layers = (0..config.num_hidden_layers)
            .map(|index| BertLayer::load(vb.pp(format!("encoder.layer.{index}")), config))
            .collect::<Result<Vec<_>>>()?;
        let pooler = linear(
            config.hidden_size,
            config.hidden_size,
            config.initializer_range,
            vb.pp("pooler.dense"),
        )?;
        Ok(Self {
            embeddings,
            layers,
            pooler,
            span: tracing::span!(tracing::Level::TRACE, "vbert"),
        })
    }

    /// Runs the encoder, returning the `[batch, seq_len, hidden]` sequence output.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        input_mask: &Tensor,
        tag_mask: &Tensor,
        tag_features: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let mut hidden_states = self
            .embeddings
            .forward(input_ids, tag_mask, tag_features, train)?;
        // Padding positions get a large negative bias before the softmax.
        let attention_mask = input_mask
            .to_dtype(hidden_states.dtype())?
            .affine(10000., -10000.)?
            .unsqueeze(1)?
            .unsqueeze(1)?;
        for layer in self.layers.iter() {
            hidden_states = layer.forward(&hidden_states, &attention_mask, train)?;
        }
        Ok(hidden_states)
    }

    /// `tanh(dense(hidden[:, 0]))`, the summary of the whole sequence.
    pub fn pool(&self, sequence_output: &Tensor) -> Result<Tensor> {
        sequence_output.i((.., 0))?.apply(&self.pooler)?.tanh()
    }
}

impl TaggedEncoder for VBertModel {
    fn encode(&self, sequence: &MixedSequence, train: bool) -> Result<EncoderOutput> {
        if sequence.input_mask.dtype() != DType::U8 || sequence.tag_mask.dtype() != DType::U8 {
            candle::bail!("sequence masks are expected to be u8")
        }
        let sequence_output = self.forward(
            &sequence.input_ids,
            &sequence.input_mask,
            &sequence.tag_mask,
            &sequence.tag_features,
            train,
        )?;
        let pooled_output = self.pool(&sequence_output)?;
        Ok(EncoderOutput {
            sequence_output,
            pooled_output,
        })
    }

    fn embedding_table(&self) -> &Tensor {
        self.embeddings.word_embeddings.embeddings()
    }
}
