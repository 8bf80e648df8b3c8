use super::LayerPast;
use candle_core::{DType, Device, Tensor};
use static_assertions::assert_impl_all;

assert_impl_all!(LayerPast: Send, Sync, Clone);

fn allclose(a: &Tensor, b: &Tensor, tol: f32) {
    let diff = a
        .to_dtype(DType::F32)
        .unwrap()
        .sub(&b.to_dtype(DType::F32).unwrap())
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    let max = diff.into_iter().fold(0.0_f32, |acc, v| acc.max(v));
    assert!(max <= tol, "max diff {max} exceeded tolerance {tol}");
}

#[test]
fn prefill_then_decode_appends_along_sequence() {
    let device = Device::Cpu;
    let keys = Tensor::rand(0.0f32, 1.0, (2, 3, 5, 4), &device).unwrap();
    let values = Tensor::rand(0.0f32, 1.0, (2, 3, 5, 4), &device).unwrap();
    let mut past = LayerPast::new(keys.clone(), values.clone());
    assert_eq!(past.seq_len(), 5);

    for step in 0..3 {
        let step_keys = Tensor::rand(0.0f32, 1.0, (2, 3, 1, 4), &device).unwrap();
        let step_values = Tensor::rand(0.0f32, 1.0, (2, 3, 1, 4), &device).unwrap();
        past = past.append(&step_keys, &step_values).unwrap();
        assert_eq!(past.seq_len(), 6 + step);

        let last_key = past.key.narrow(2, 5 + step, 1).unwrap();
        allclose(&last_key, &step_keys, 0.0);
        let last_value = past.value.narrow(2, 5 + step, 1).unwrap();
        allclose(&last_value, &step_values, 0.0);
    }

    let prefix = past.key.narrow(2, 0, 5).unwrap();
    allclose(&prefix, &keys, 0.0);
}

#[test]
fn append_rejects_mismatched_heads() {
    let device = Device::Cpu;
    let past = LayerPast::new(
        Tensor::zeros((1, 2, 3, 4), DType::F32, &device).unwrap(),
        Tensor::zeros((1, 2, 3, 4), DType::F32, &device).unwrap(),
    );
    let wrong = Tensor::zeros((1, 3, 1, 4), DType::F32, &device).unwrap();
    assert!(past.append(&wrong, &wrong).is_err());
}

#[test]
fn tuple_conversion_keeps_order() {
    let device = Device::Cpu;
    let key = Tensor::ones((1, 1, 2, 2), DType::F32, &device).unwrap();
    let value = Tensor::zeros((1, 1, 2, 2), DType::F32, &device).unwrap();
    let (k, v) = LayerPast::from((key, value)).into_parts();
    assert_eq!(k.sum_all().unwrap().to_vec0::<f32>().unwrap(), 4.0);
    assert_eq!(v.sum_all().unwrap().to_vec0::<f32>().unwrap(), 0.0);
}
