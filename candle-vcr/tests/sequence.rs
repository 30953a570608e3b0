mod common;

use candle::{DType, Device, IndexOp, Result, Tensor};
use candle_vcr::detections::{ground_detection_features, Detections, NO_TAG};
use candle_vcr::sequence::{Caption, MixedSequence, CLS_ID, SEP_ID};

fn caption(detections: &Detections, dev: &Device) -> Result<Caption> {
    let tag_ids = Tensor::new(&[[0i64, NO_TAG, 1], [NO_TAG, NO_TAG, NO_TAG]], dev)?;
    let tag_features =
        ground_detection_features(&detections.features, &tag_ids.unsqueeze(1)?)?.squeeze(1)?;
    Ok(Caption {
        ids: Tensor::new(&[[20u32, 21, 22], [23, 24, 0]], dev)?,
        tag_ids,
        tag_features,
        lengths: Tensor::new(&[3u32, 2], dev)?,
    })
}

#[test]
fn sequence_layout() -> Result<()> {
    let dev = Device::Cpu;
    let detections = common::detections(&dev)?;
    let caption = caption(&detections, &dev)?;
    let sequence = MixedSequence::new(&detections, &caption)?;

    // [CLS] + 5 detections + [SEP] + 3 tokens + [SEP]
    assert_eq!(sequence.seq_len()?, 11);
    assert_eq!(sequence.input_ids.dims(), [2, 11]);
    assert_eq!(sequence.input_mask.dims(), [2, 11]);
    assert_eq!(sequence.tag_mask.dims(), [2, 11]);
    assert_eq!(sequence.tag_features.dims(), [2, 11, common::FEATURE_DIMS]);

    let (cls, sep) = (CLS_ID, SEP_ID);
    assert_eq!(
        sequence.input_ids.to_vec2::<u32>()?,
        [
            [cls, 1, 2, 3, 4, 5, sep, 20, 21, 22, sep],
            [cls, 6, 7, 8, 9, 10, sep, 23, 24, 0, sep],
        ]
    );
    assert_eq!(
        sequence.input_mask.to_vec2::<u8>()?,
        [
            [1, 1, 1, 0, 0, 0, 1, 1, 1, 1, 1],
            [1, 1, 1, 1, 1, 1, 1, 1, 1, 0, 1],
        ]
    );
    assert_eq!(
        sequence.tag_mask.to_vec2::<u8>()?,
        [
            [0, 1, 1, 0, 0, 0, 0, 1, 0, 1, 0],
            [0, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0],
        ]
    );
    Ok(())
}

#[test]
fn sequence_tag_features() -> Result<()> {
    let dev = Device::Cpu;
    let detections = common::detections(&dev)?;
    let caption = caption(&detections, &dev)?;
    let sequence = MixedSequence::new(&detections, &caption)?;

    // Detection slots carry the detection features.
    for slot in 0..5 {
        assert_eq!(
            sequence.tag_features.i((1, slot + 1))?.to_vec1::<f32>()?,
            detections.features.i((1, slot))?.to_vec1::<f32>()?
        );
    }
    // Tagged tokens carry the feature of the referenced detection.
    assert_eq!(
        sequence.tag_features.i((0, 7))?.to_vec1::<f32>()?,
        detections.features.i((0, 0))?.to_vec1::<f32>()?
    );
    assert_eq!(
        sequence.tag_features.i((0, 9))?.to_vec1::<f32>()?,
        detections.features.i((0, 1))?.to_vec1::<f32>()?
    );
    // Structural markers and untagged tokens are zero.
    for position in [0, 6, 8, 10] {
        let row = sequence.tag_features.i((0, position))?;
        assert_eq!(row.abs()?.sum_all()?.to_scalar::<f32>()?, 0.);
    }
    Ok(())
}

#[test]
fn sequence_without_detections() -> Result<()> {
    let dev = Device::Cpu;
    let detections = Detections {
        num_detections: Tensor::new(&[0u32, 0], &dev)?,
        boxes: Tensor::zeros((2, 0, 4), DType::F32, &dev)?,
        classes: Tensor::zeros((2, 0), DType::U32, &dev)?,
        scores: Tensor::zeros((2, 0), DType::F32, &dev)?,
        features: Tensor::zeros((2, 0, 3), DType::F32, &dev)?,
    };
    let caption = Caption {
        ids: Tensor::new(&[[20u32, 21], [22, 0]], &dev)?,
        tag_ids: Tensor::full(NO_TAG, (2, 2), &dev)?,
        tag_features: Tensor::zeros((2, 2, 3), DType::F32, &dev)?,
        lengths: Tensor::new(&[2u32, 1], &dev)?,
    };
    let sequence = MixedSequence::new(&detections, &caption)?;
    assert_eq!(sequence.seq_len()?, 5);
    assert_eq!(
        sequence.input_ids.to_vec2::<u32>()?,
        [[CLS_ID, SEP_ID, 20, 21, SEP_ID], [CLS_ID, SEP_ID, 22, 0, SEP_ID]]
    );
    assert_eq!(
        sequence.input_mask.to_vec2::<u8>()?,
        [[1, 1, 1, 1, 1], [1, 1, 1, 0, 1]]
    );
    assert_eq!(sequence.tag_mask.sum_all()?.to_dtype(DType::U32)?.to_scalar::<u32>()?, 0);
    assert_eq!(sequence.tag_features.dims(), [2, 5, 3]);
    Ok(())
}

#[test]
fn sequence_rejects_mismatched_caption() -> Result<()> {
    let dev = Device::Cpu;
    let detections = common::detections(&dev)?;
    let mut caption = caption(&detections, &dev)?;
    caption.tag_features = Tensor::zeros((2, 3, 2), DType::F32, &dev)?;
    assert!(MixedSequence::new(&detections, &caption).is_err());

    let caption = Caption {
        ids: Tensor::zeros((3, 3), DType::U32, &dev)?,
        ..self::caption(&detections, &dev)?
    };
    assert!(MixedSequence::new(&detections, &caption).is_err());
    Ok(())
}
