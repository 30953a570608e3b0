#![allow(dead_code)]

use candle::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_vcr::detections::Detections;
use candle_vcr::inputs::{VcrInputs, NUM_CHOICES};
use candle_vcr::models::vbert::{self, HiddenAct};
use candle_vcr::models::vbert_ft::{Config, VBertFt};

pub const FEATURE_DIMS: usize = 6;
pub const VOCAB_SIZE: usize = 110;
pub const HIDDEN_SIZE: usize = 8;

pub fn tiny_bert_config() -> vbert::Config {
    vbert::Config {
        vocab_size: VOCAB_SIZE,
        hidden_size: HIDDEN_SIZE,
        num_hidden_layers: 2,
        num_attention_heads: 2,
        intermediate_size: 16,
        hidden_act: HiddenAct::Gelu,
        hidden_dropout_prob: 0.1,
        attention_probs_dropout_prob: 0.1,
        max_position_embeddings: 32,
        type_vocab_size: 2,
        initializer_range: 0.5,
        layer_norm_eps: 1e-12,
    }
}

pub fn tiny_model(config: &Config, varmap: &VarMap) -> Result<VBertFt> {
    let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
    VBertFt::new(config, &tiny_bert_config(), FEATURE_DIMS, vb)
}

/// Two examples padded to five detections, with 2 and 5 actual detections.
pub fn detections(dev: &Device) -> Result<Detections> {
    Ok(Detections {
        num_detections: Tensor::new(&[2u32, 5], dev)?,
        boxes: Tensor::zeros((2, 5, 4), DType::F32, dev)?,
        classes: Tensor::new(&[[1u32, 2, 3, 4, 5], [6, 7, 8, 9, 10]], dev)?,
        scores: Tensor::ones((2, 5), DType::F32, dev)?,
        features: Tensor::arange(0f32, 60., dev)?.reshape((2, 5, FEATURE_DIMS))?,
    })
}

pub fn inputs(dev: &Device) -> Result<VcrInputs> {
    let choice_ids = Tensor::new(
        &[
            [[20u32, 21, 22, 0], [23, 24, 0, 0], [25, 26, 27, 28], [29, 0, 0, 0]],
            [[30, 31, 32, 33], [34, 35, 0, 0], [36, 37, 38, 0], [39, 40, 0, 0]],
        ],
        dev,
    )?;
    let choice_tag_ids = Tensor::new(
        &[
            [[0i64, -1, 1, -1], [4, -1, -1, -1], [-1, -1, -1, -1], [1, -1, -1, -1]],
            [[2, 0, -1, 7], [-1, 1, -1, -1], [-1, -1, 2, -1], [3, -1, -1, -1]],
        ],
        dev,
    )?;
    let choice_lengths = Tensor::new(&[[3u32, 2, 4, 1], [4, 2, 3, 2]], dev)?;
    assert_eq!(choice_ids.dim(1)?, NUM_CHOICES);
    Ok(VcrInputs {
        detections: detections(dev)?,
        choice_ids,
        choice_tag_ids,
        choice_lengths,
        label: Some(Tensor::new(&[1u32, 3], dev)?),
    })
}

/// The same caption repeated for every choice.
pub fn identical_choice_inputs(dev: &Device) -> Result<VcrInputs> {
    let inputs = inputs(dev)?;
    let repeat = |t: &Tensor| -> Result<Tensor> {
        let first = t.narrow(1, 0, 1)?;
        Tensor::cat(&vec![&first; NUM_CHOICES], 1)
    };
    Ok(VcrInputs {
        choice_ids: repeat(&inputs.choice_ids)?,
        choice_tag_ids: repeat(&inputs.choice_tag_ids)?,
        choice_lengths: repeat(&inputs.choice_lengths)?,
        ..inputs
    })
}
