use candle::test_utils::{to_vec0_round, to_vec1_round, to_vec2_round};
use candle::{Device, Result, Tensor};
use candle_vcr::loss::{self, Accuracy};

#[test]
fn one_hot() -> Result<()> {
    let dev = Device::Cpu;
    let labels = Tensor::new(&[1u32, 3, 0], &dev)?;
    assert_eq!(
        loss::one_hot(&labels, 4)?.to_vec2::<f32>()?,
        [[0., 1., 0., 0.], [0., 0., 0., 1.], [1., 0., 0., 0.]]
    );
    let labels = Tensor::new(&[4u32], &dev)?;
    assert!(loss::one_hot(&labels, 4).is_err());
    Ok(())
}

#[test]
fn softmax_cross_entropy() -> Result<()> {
    let dev = Device::Cpu;
    let logits = Tensor::new(&[[1f32, 2., 3., 4.], [0., 0., 0., 0.]], &dev)?;
    let labels = Tensor::new(&[[0f32, 0., 0., 1.], [1., 0., 0., 0.]], &dev)?;
    let losses = loss::softmax_cross_entropy_with_logits(&logits, &labels)?;
    assert_eq!(to_vec1_round(&losses, 4)?, [0.4402, 1.3863]);

    let logits = Tensor::new(&[1f32, 2.], &dev)?;
    assert!(loss::softmax_cross_entropy_with_logits(&logits, &logits).is_err());
    Ok(())
}

#[test]
fn sigmoid_cross_entropy() -> Result<()> {
    let dev = Device::Cpu;
    let logits = Tensor::new(&[[0f32, 2.], [-50., 50.]], &dev)?;
    let labels = Tensor::new(&[[1f32, 0.], [0., 1.]], &dev)?;
    let losses = loss::sigmoid_cross_entropy_with_logits(&logits, &labels)?;
    assert_eq!(to_vec2_round(&losses, 4)?, [[0.6931, 2.1269], [0., 0.]]);
    Ok(())
}

#[test]
fn sparse_softmax_cross_entropy() -> Result<()> {
    let dev = Device::Cpu;
    let logits = Tensor::new(&[[[0f32, 0.], [0., 1.]]], &dev)?;
    let labels = Tensor::new(&[[1u32, 1]], &dev)?;
    let losses = loss::sparse_softmax_cross_entropy_with_logits(&logits, &labels)?;
    assert_eq!(losses.dims(), [1, 2]);
    assert_eq!(to_vec2_round(&losses, 4)?, [[0.6931, 0.3133]]);

    let labels = Tensor::new(&[1u32], &dev)?;
    assert!(loss::sparse_softmax_cross_entropy_with_logits(&logits, &labels).is_err());
    Ok(())
}

#[test]
fn masked_avg() -> Result<()> {
    let dev = Device::Cpu;
    let data = Tensor::new(&[[1f32, 2., 3.], [4., 5., 6.]], &dev)?;
    let mask = Tensor::new(&[[1u8, 1, 0], [0, 0, 0]], &dev)?;
    let avg = loss::masked_avg(&data, &mask, 1)?;
    assert_eq!(avg.dims(), [2, 1]);
    assert_eq!(to_vec2_round(&avg, 4)?, [[1.5], [0.]]);

    let mask = Tensor::new(&[[1u8, 0, 1], [1, 0, 0]], &dev)?;
    let avg = loss::masked_avg(&data, &mask, 0)?;
    assert_eq!(to_vec2_round(&avg, 4)?, [[2.5, 0., 3.]]);
    assert_eq!(to_vec0_round(&avg.mean_all()?, 4)?, 1.8333);
    Ok(())
}

#[test]
fn accuracy_counts() -> Result<()> {
    let dev = Device::Cpu;
    let predictions = Tensor::new(&[0u32, 1, 2], &dev)?;
    let targets = Tensor::new(&[0u32, 1, 1], &dev)?;
    assert_eq!(loss::accuracy_counts(&predictions, &targets, None)?, (2, 3));

    let mask = Tensor::new(&[1u8, 0, 1], &dev)?;
    assert_eq!(
        loss::accuracy_counts(&predictions, &targets, Some(&mask))?,
        (1, 2)
    );

    let targets = Tensor::new(&[0u32, 1], &dev)?;
    assert!(loss::accuracy_counts(&predictions, &targets, None).is_err());
    Ok(())
}

#[test]
fn streaming_accuracy() {
    let mut accuracy = Accuracy::new();
    assert_eq!(accuracy.result(), 0.);
    accuracy.update_state(3, 4);
    let mut other = Accuracy::new();
    other.update_state(1, 4);
    accuracy.merge(&other);
    assert_eq!((accuracy.correct(), accuracy.total()), (4, 8));
    assert_eq!(accuracy.result(), 0.5);
    accuracy.reset();
    assert_eq!(accuracy, Accuracy::default());
}
