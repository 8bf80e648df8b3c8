use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use attention::LayerPast;
use candle_core::{DType, Device, Tensor};
use inference::{
    AttentionInputs, AttentionOutput, BuildContext, ComponentBuilder, EnvDistributed,
    FeedForwardBlock, ForwardOptions, InferenceConfig, InferenceError, LayerFactory, LayerOutput,
    LegacyForwardArgs, ParallelGroup, QuantizationSettings, SelfAttention,
    TransformerInferenceLayer,
};
use kernels::{
    InferenceKernels, KernelError, KernelSource, ReferenceKernels, WorkspaceKind, WorkspacePlan,
    WorkspaceRequest,
};
use layers::{PrecisionMode, PrecisionPolicy};
use static_assertions::assert_impl_all;

const HIDDEN: usize = 8;

assert_impl_all!(LayerFactory: Send, Sync);
assert_impl_all!(TransformerInferenceLayer: Send);

/// Reference kernels that record every workspace request.
#[derive(Default)]
struct CountingKernels {
    inner: ReferenceKernels,
    requests: Mutex<Vec<(WorkspaceKind, WorkspaceRequest)>>,
}

impl CountingKernels {
    fn requests(&self) -> Vec<(WorkspaceKind, WorkspaceRequest)> {
        self.requests.lock().unwrap().clone()
    }
}

impl InferenceKernels for CountingKernels {
    fn name(&self) -> &str {
        "counting"
    }

    fn allocate_workspace(
        &self,
        kind: WorkspaceKind,
        request: &WorkspaceRequest,
    ) -> kernels::Result<WorkspacePlan> {
        self.requests.lock().unwrap().push((kind, request.clone()));
        self.inner.allocate_workspace(kind, request)
    }

    fn layer_norm(
        &self,
        kind: WorkspaceKind,
        input: &Tensor,
        weight: &Tensor,
        bias: &Tensor,
        epsilon: f64,
    ) -> kernels::Result<Tensor> {
        self.inner.layer_norm(kind, input, weight, bias, epsilon)
    }
}

/// What the fake sub-modules observed.
#[derive(Default)]
struct Observed {
    past_lengths: Vec<Option<usize>>,
    attention_dtypes: Vec<DType>,
    attention_groups: Vec<usize>,
    mlp_groups: Vec<usize>,
}

/// Attention stand-in: zero output and one cache slot per token.
struct FakeAttention {
    observed: Arc<Mutex<Observed>>,
    bias: Tensor,
}

impl SelfAttention for FakeAttention {
    fn forward(&self, inputs: AttentionInputs<'_>) -> inference::Result<AttentionOutput> {
        let hidden = inputs.hidden;
        let (batch, seq, _) = hidden.dims3()?;
        {
            let mut observed = self.observed.lock().unwrap();
            observed
                .past_lengths
                .push(inputs.layer_past.map(LayerPast::seq_len));
            observed.attention_dtypes.push(hidden.dtype());
        }
        let fresh = Tensor::zeros((batch, 1, seq, 1), hidden.dtype(), hidden.device())?;
        let (key, value) = match inputs.layer_past {
            Some(past) => past.append(&fresh, &fresh)?.into_parts(),
            None => (fresh.clone(), fresh),
        };
        Ok(AttentionOutput {
            output: hidden.zeros_like()?,
            key,
            value,
            context: hidden.zeros_like()?,
            input_norm: hidden.clone(),
        })
    }

    fn output_bias(&self) -> &Tensor {
        &self.bias
    }
}

/// MLP stand-in returning `2 * input + 1`.
struct FakeMlp;

impl FeedForwardBlock for FakeMlp {
    fn forward(
        &self,
        _attention_output: &Tensor,
        input: &Tensor,
        _input_norm: &Tensor,
        _attention_bias: &Tensor,
    ) -> inference::Result<Tensor> {
        Ok(input.affine(2.0, 1.0)?)
    }
}

#[derive(Default)]
struct FakeComponents {
    observed: Arc<Mutex<Observed>>,
}

impl ComponentBuilder for FakeComponents {
    fn build_attention(&self, ctx: &BuildContext<'_>) -> inference::Result<Box<dyn SelfAttention>> {
        self.observed
            .lock()
            .unwrap()
            .attention_groups
            .push(ctx.quantization.groups);
        let bias = Tensor::zeros(
            ctx.config.hidden_size,
            ctx.config.parameter_dtype(),
            ctx.device,
        )?;
        Ok(Box::new(FakeAttention {
            observed: Arc::clone(&self.observed),
            bias,
        }))
    }

    fn build_mlp(&self, ctx: &BuildContext<'_>) -> inference::Result<Box<dyn FeedForwardBlock>> {
        self.observed
            .lock()
            .unwrap()
            .mlp_groups
            .push(ctx.quantization.groups);
        Ok(Box::new(FakeMlp))
    }
}

struct Harness {
    kernels: Arc<CountingKernels>,
    observed: Arc<Mutex<Observed>>,
    factory: LayerFactory,
}

fn harness() -> Harness {
    let kernels = Arc::new(CountingKernels::default());
    let components = FakeComponents::default();
    let observed = Arc::clone(&components.observed);
    let factory = LayerFactory::with_kernels(kernels.clone()).with_builder(Arc::new(components));
    Harness {
        kernels,
        observed,
        factory,
    }
}

fn config(configure: impl FnOnce(&mut InferenceConfig)) -> Arc<InferenceConfig> {
    let mut config = InferenceConfig::new(HIDDEN, 2);
    config.precision = PrecisionMode::Fp32;
    config.max_out_tokens = 64;
    configure(&mut config);
    Arc::new(config)
}

fn hidden(batch: usize, seq: usize) -> Result<Tensor> {
    Ok(Tensor::randn(0f32, 1.0, (batch, seq, HIDDEN), &Device::Cpu)?)
}

fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a.to_dtype(DType::F32)?
        .sub(&b.to_dtype(DType::F32)?)?
        .abs()?
        .max_all()?
        .to_vec0::<f32>()?)
}

#[test]
fn layer_indices_start_at_zero_and_increase_by_one() -> Result<()> {
    let h = harness();
    let cfg = config(|_| {});
    for expected in 0..4 {
        let layer = h
            .factory
            .build(cfg.clone(), ParallelGroup::single(), QuantizationSettings::default())?;
        assert_eq!(layer.index(), expected);
    }
    assert_eq!(h.factory.layers_built(), 4);

    let other = harness();
    let layer = other
        .factory
        .build(cfg, ParallelGroup::single(), QuantizationSettings::default())?;
    assert_eq!(layer.index(), 0);
    Ok(())
}

#[test]
fn workspace_is_allocated_once_by_the_first_layer() -> Result<()> {
    let h = harness();
    let cfg = config(|_| {});
    let mut layers = (0..3)
        .map(|_| {
            h.factory
                .build(cfg.clone(), ParallelGroup::single(), QuantizationSettings::default())
        })
        .collect::<inference::Result<Vec<_>>>()?;

    // Later layers never trigger the allocation.
    layers[2].forward(hidden(2, 5)?, ForwardOptions::new())?;
    assert!(h.kernels.requests().is_empty());
    assert!(h.factory.workspace_plan().is_none());

    for _ in 0..3 {
        for layer in layers.iter_mut() {
            layer.forward(hidden(2, 5)?, ForwardOptions::new())?;
        }
    }

    let requests = h.kernels.requests();
    assert_eq!(requests.len(), 1);
    let (kind, request) = &requests[0];
    assert_eq!(*kind, WorkspaceKind::Fp32);
    assert_eq!(
        *request,
        WorkspaceRequest {
            hidden_size: HIDDEN,
            batch_size: 2,
            prompt_len: 5,
            num_layers: 3,
            heads: 2,
            mp_size: 1,
            external_cache: false,
            rank: 0,
            max_out_tokens: 64,
        }
    );
    assert_eq!(
        layers[1].workspace_plan().map(|plan| plan.max_seq_len),
        Some(64)
    );
    Ok(())
}

#[test]
fn workspace_request_carries_rank_and_precision_variant() -> Result<()> {
    let kernels = Arc::new(CountingKernels::default());
    let dist = EnvDistributed::from_lookup(|key| match key {
        "RANK" => Some("2".into()),
        "WORLD_SIZE" => Some("4".into()),
        _ => None,
    });
    let factory = LayerFactory::with_kernels(kernels.clone())
        .with_builder(Arc::new(FakeComponents::default()))
        .with_distributed(Arc::new(dist));
    let cfg = config(|c| {
        c.precision = PrecisionMode::Fp16;
        c.external_cache = true;
    });
    let mut layer = factory.build(cfg, ParallelGroup::single(), QuantizationSettings::default())?;
    layer.forward(hidden(1, 3)?, ForwardOptions::new())?;

    let requests = kernels.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, WorkspaceKind::Fp16);
    assert_eq!(requests[0].1.rank, 2);
    assert!(requests[0].1.external_cache);
    Ok(())
}

#[test]
fn prompt_discards_stale_decode_cache() -> Result<()> {
    let h = harness();
    let mut layer = h
        .factory
        .build(config(|_| {}), ParallelGroup::single(), QuantizationSettings::default())?;

    layer.forward(hidden(1, 3)?, ForwardOptions::new())?;
    assert_eq!(layer.layer_past().map(LayerPast::seq_len), Some(3));
    layer.forward(hidden(1, 1)?, ForwardOptions::new())?;
    layer.forward(hidden(1, 1)?, ForwardOptions::new())?;
    assert_eq!(layer.layer_past().map(LayerPast::seq_len), Some(5));

    // New prompt, then a decode step that must see only the new prompt.
    layer.forward(hidden(1, 2)?, ForwardOptions::new())?;
    layer.forward(hidden(1, 1)?, ForwardOptions::new())?;

    let observed = h.observed.lock().unwrap();
    assert_eq!(
        observed.past_lengths,
        vec![None, Some(3), Some(4), None, Some(2)]
    );
    drop(observed);
    assert_eq!(layer.layer_past().map(LayerPast::seq_len), Some(3));

    layer.reset_cache();
    assert!(layer.layer_past().is_none());
    Ok(())
}

#[test]
fn explicit_cache_is_used_but_not_stored() -> Result<()> {
    let h = harness();
    let mut layer = h
        .factory
        .build(config(|_| {}), ParallelGroup::single(), QuantizationSettings::default())?;
    layer.forward(hidden(1, 4)?, ForwardOptions::new())?;

    let external = Tensor::zeros((1, 1, 7, 1), DType::F32, &Device::Cpu)?;
    let options =
        ForwardOptions::new().with_layer_past(LayerPast::new(external.clone(), external));
    let output = layer.forward(hidden(1, 1)?, options.with_present())?;

    assert_eq!(output.present().map(LayerPast::seq_len), Some(8));
    assert_eq!(layer.layer_past().map(LayerPast::seq_len), Some(4));
    assert_eq!(h.observed.lock().unwrap().past_lengths[1], Some(7));
    Ok(())
}

#[test]
fn output_dtype_matches_input_dtype() -> Result<()> {
    for precision in [PrecisionMode::Fp16, PrecisionMode::Int8, PrecisionMode::Fp32] {
        let h = harness();
        let mut layer = h.factory.build(
            config(|c| c.precision = precision),
            ParallelGroup::single(),
            QuantizationSettings::default(),
        )?;
        let input = hidden(1, 2)?;
        let output = layer.forward(input.clone(), ForwardOptions::new())?;
        assert_eq!(output.hidden().dtype(), DType::F32, "{precision}");

        let half = layer.forward(input.to_dtype(DType::F16)?, ForwardOptions::new())?;
        assert_eq!(half.hidden().dtype(), DType::F16, "{precision}");

        let expected = if precision.uses_reduced_activations() {
            DType::F16
        } else {
            DType::F32
        };
        assert_eq!(h.observed.lock().unwrap().attention_dtypes[0], expected);
    }
    Ok(())
}

#[test]
fn output_packaging_follows_flags() -> Result<()> {
    let h = harness();
    let mut tuple_layer = h
        .factory
        .build(config(|_| {}), ParallelGroup::single(), QuantizationSettings::default())?;
    let mut bare_layer = h.factory.build(
        config(|c| c.return_tuple = false),
        ParallelGroup::single(),
        QuantizationSettings::default(),
    )?;
    let mask = Tensor::ones((1, 3), DType::F32, &Device::Cpu)?;

    match tuple_layer.forward((hidden(1, 3)?, mask.clone()), ForwardOptions::new())? {
        LayerOutput::Tuple(out, Some(echoed)) => {
            assert_eq!(out.dims(), &[1, 3, HIDDEN]);
            assert_eq!(max_diff(&echoed, &mask)?, 0.0);
        }
        other => panic!("expected tuple with mask, got {other:?}"),
    }
    assert!(matches!(
        tuple_layer.forward(hidden(1, 3)?, ForwardOptions::new())?,
        LayerOutput::Tuple(_, None)
    ));
    assert!(matches!(
        bare_layer.forward(hidden(1, 3)?, ForwardOptions::new())?,
        LayerOutput::Hidden(_)
    ));

    for args in [
        LegacyForwardArgs {
            get_present: true,
            ..Default::default()
        },
        LegacyForwardArgs {
            get_key_value: true,
            ..Default::default()
        },
        LegacyForwardArgs {
            use_cache: true,
            ..Default::default()
        },
    ] {
        let out = bare_layer.forward_legacy(hidden(1, 3)?, args)?;
        match out {
            LayerOutput::WithPresent(_, present) => assert_eq!(present.seq_len(), 3),
            other => panic!("expected present pair, got {other:?}"),
        }
    }
    Ok(())
}

#[test]
fn post_layer_norm_normalises_mlp_output() -> Result<()> {
    let h = harness();
    let mut post = h.factory.build(
        config(|c| {
            c.pre_layer_norm = false;
            c.layer_norm_eps = 1e-5;
        }),
        ParallelGroup::single(),
        QuantizationSettings::default(),
    )?;
    let weight = Tensor::new(&[1.0f32, 0.5, 2.0, 1.0, 1.0, 0.25, 1.0, 3.0], &Device::Cpu)?;
    let bias = Tensor::new(&[0.0f32, 0.1, 0.0, -0.2, 0.0, 0.0, 0.3, 0.0], &Device::Cpu)?;
    post.set_norm_parameters(&weight, &bias)?;

    let input = hidden(2, 3)?;
    let output = post.forward(input.clone(), ForwardOptions::new())?.into_hidden();
    let mlp_out = input.affine(2.0, 1.0)?;
    let expected = layers::layer_norm(
        &mlp_out,
        &weight,
        &bias,
        1e-5,
        &PrecisionPolicy::from_parameter_dtype(DType::F32),
    )?;
    assert!(max_diff(&output, &expected)? < 1e-5);

    let mut pre = h
        .factory
        .build(config(|_| {}), ParallelGroup::single(), QuantizationSettings::default())?;
    let output = pre.forward(input.clone(), ForwardOptions::new())?.into_hidden();
    assert_eq!(max_diff(&output, &mlp_out)?, 0.0);
    Ok(())
}

#[test]
fn norm_parameters_are_validated_and_cast() -> Result<()> {
    let h = harness();
    let mut layer = h.factory.build(
        config(|c| c.precision = PrecisionMode::Fp16),
        ParallelGroup::single(),
        QuantizationSettings::default(),
    )?;
    assert_eq!(layer.norm_weight().dtype(), DType::F16);

    let weight = Tensor::ones(HIDDEN, DType::F32, &Device::Cpu)?;
    let bias = Tensor::zeros(HIDDEN, DType::F32, &Device::Cpu)?;
    layer.set_norm_parameters(&weight, &bias)?;
    assert_eq!(layer.norm_bias().dtype(), DType::F16);

    let short = Tensor::ones(HIDDEN - 1, DType::F32, &Device::Cpu)?;
    assert!(layer.set_norm_parameters(&short, &bias).is_err());
    Ok(())
}

#[test]
fn extra_grouping_doubles_mlp_quantization_groups() -> Result<()> {
    let h = harness();
    let quantization = QuantizationSettings {
        groups: 3,
        mlp_extra_grouping: true,
        ..Default::default()
    };
    h.factory
        .build(config(|_| {}), ParallelGroup::single(), quantization)?;
    let observed = h.observed.lock().unwrap();
    assert_eq!(observed.attention_groups, vec![3]);
    assert_eq!(observed.mlp_groups, vec![6]);
    Ok(())
}

#[test]
fn missing_kernel_library_fails_construction() {
    let mut cfg = InferenceConfig::new(HIDDEN, 2);
    cfg.kernels = KernelSource::Native(PathBuf::from("/nonexistent/libinference_kernels.so"));
    let factory = LayerFactory::from_config(&cfg, Device::Cpu);
    let err = factory
        .build(
            Arc::new(cfg),
            ParallelGroup::single(),
            QuantizationSettings::default(),
        )
        .unwrap_err();
    assert!(matches!(err, InferenceError::Kernel(KernelError::Load { .. })));
    assert_eq!(factory.layers_built(), 0);
}

#[test]
fn empty_input_is_rejected_before_any_work() -> Result<()> {
    let h = harness();
    let mut layer = h
        .factory
        .build(config(|_| {}), ParallelGroup::single(), QuantizationSettings::default())?;
    for (batch, seq) in [(1, 0), (0, 3), (0, 0)] {
        assert!(matches!(
            layer.forward(
                Tensor::zeros((batch, seq, HIDDEN), DType::F32, &Device::Cpu)?,
                ForwardOptions::new()
            ),
            Err(InferenceError::InvalidArgument(_))
        ));
    }
    assert!(h.kernels.requests().is_empty());
    assert!(h.observed.lock().unwrap().attention_dtypes.is_empty());
    assert!(layer.layer_past().is_none());
    Ok(())
}

#[test]
fn malformed_input_is_rejected() -> Result<()> {
    let h = harness();
    let mut layer = h
        .factory
        .build(config(|_| {}), ParallelGroup::single(), QuantizationSettings::default())?;
    let wrong = Tensor::zeros((1, 2, HIDDEN + 1), DType::F32, &Device::Cpu)?;
    assert!(matches!(
        layer.forward(wrong, ForwardOptions::new()),
        Err(InferenceError::InvalidArgument(_))
    ));
    Ok(())
}
