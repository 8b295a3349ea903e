//! Model capability abstractions.
//!
//! An [`InferenceBackend`] evaluates batches of positions; a
//! [`ModelFactory`] constructs backends from a path-like descriptor. The
//! real neural runtimes live outside this crate and plug in through these
//! traits; [`FakeBackend`] is the built-in deterministic stand-in used by
//! tests and by the binary when no runtime is linked.

use crate::constants::{NUM_MOVES, NUM_POINTS};
use crate::features;
use crate::position::Position;
use crate::symmetry::Symmetry;

/// Longest position history any feature set consumes.
pub const MAX_POSITION_HISTORY: usize = 8;

/// Which input planes a model expects.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FeatureKind {
    /// 17 planes: 8 plies of {my, their} stones plus a to-play plane.
    Agz,
    /// 13 planes: 4 plies of {my, their} stones, to-play, three liberty
    /// planes and a would-capture plane.
    Mlperf07,
}

impl FeatureKind {
    pub fn num_planes(self) -> usize {
        match self {
            FeatureKind::Agz => 17,
            FeatureKind::Mlperf07 => 13,
        }
    }

    /// How many plies of history the feature set consumes.
    pub fn position_history_len(self) -> usize {
        match self {
            FeatureKind::Agz => 8,
            FeatureKind::Mlperf07 => 4,
        }
    }
}

/// Memory layout of the input tensor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Layout {
    Nhwc,
    Nchw,
}

/// Element type of the input tensor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DType {
    U8,
    F32,
}

/// Input features declared by a model at load time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FeatureDescriptor {
    pub kind: FeatureKind,
    pub layout: Layout,
    pub dtype: DType,
}

impl Default for FeatureDescriptor {
    fn default() -> FeatureDescriptor {
        FeatureDescriptor {
            kind: FeatureKind::Agz,
            layout: Layout::Nhwc,
            dtype: DType::F32,
        }
    }
}

/// An encoded input tensor for a batch of positions.
pub enum Tensor {
    U8(Vec<u8>),
    F32(Vec<f32>),
}

impl Tensor {
    pub fn len(&self) -> usize {
        match self {
            Tensor::U8(v) => v.len(),
            Tensor::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One inference request: the position to evaluate (with as much history as
/// the tree has) and the symmetry under which to present it to the model.
#[derive(Clone)]
pub struct ModelInput {
    pub sym: Symmetry,
    /// Positions in most-recent-first order; `position_history[0]` is the
    /// position to evaluate.
    pub position_history: Vec<Position>,
}

impl Default for ModelInput {
    fn default() -> ModelInput {
        ModelInput {
            sym: Symmetry::Identity,
            position_history: Vec::new(),
        }
    }
}

/// Policy and value for a single position, with the policy in board space
/// (any input symmetry already undone by the backend).
#[derive(Clone)]
pub struct ModelOutput {
    pub policy: Vec<f32>,
    pub value: f32,
}

impl Default for ModelOutput {
    fn default() -> ModelOutput {
        ModelOutput {
            policy: vec![0.0; NUM_MOVES],
            value: 0.0,
        }
    }
}

/// A loaded model instance. Multiple instances of the same model may exist
/// concurrently, one per inference thread.
pub trait InferenceBackend: Send {
    fn name(&self) -> &str;

    fn feature_descriptor(&self) -> FeatureDescriptor;

    /// Evaluates `inputs` synchronously, storing results in `outputs` at
    /// matching indices, and returns the name of the model that actually ran
    /// the batch. Implementations must apply the inverse of each input's
    /// symmetry to the policy before storing it.
    ///
    /// Panics if `inputs` and `outputs` have different lengths.
    fn run_many(&mut self, inputs: &[ModelInput], outputs: &mut [ModelOutput]) -> String;
}

/// Constructs inference backends from a model path.
pub trait ModelFactory: Send + Sync {
    fn new_backend(&self, path: &str) -> anyhow::Result<Box<dyn InferenceBackend>>;
}

/// A deterministic backend that returns fixed priors and value. It still
/// encodes the input tensor so the full feature path is exercised.
pub struct FakeBackend {
    name: String,
    descriptor: FeatureDescriptor,
    priors: Vec<f32>,
    value: f32,
}

impl FakeBackend {
    pub fn new(name: &str) -> FakeBackend {
        FakeBackend {
            name: name.to_string(),
            descriptor: FeatureDescriptor::default(),
            priors: vec![1.0 / NUM_MOVES as f32; NUM_MOVES],
            value: 0.0,
        }
    }

    pub fn with_output(mut self, priors: Vec<f32>, value: f32) -> FakeBackend {
        assert_eq!(priors.len(), NUM_MOVES);
        self.priors = priors;
        self.value = value;
        self
    }

    pub fn with_descriptor(mut self, descriptor: FeatureDescriptor) -> FakeBackend {
        self.descriptor = descriptor;
        self
    }
}

impl InferenceBackend for FakeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn feature_descriptor(&self) -> FeatureDescriptor {
        self.descriptor
    }

    fn run_many(&mut self, inputs: &[ModelInput], outputs: &mut [ModelOutput]) -> String {
        assert_eq!(inputs.len(), outputs.len(), "batch size mismatch");
        let tensor = features::encode_batch(&self.descriptor, inputs);
        debug_assert_eq!(
            tensor.len(),
            inputs.len() * self.descriptor.kind.num_planes() * NUM_POINTS
        );
        for output in outputs.iter_mut() {
            output.policy.clear();
            output.policy.extend_from_slice(&self.priors);
            output.value = self.value;
        }
        self.name.clone()
    }
}

/// A [`ModelFactory`] that fabricates [`FakeBackend`]s named after the
/// requested path. Useful for tests and for running the selfplay pipeline
/// without a neural runtime.
pub struct FakeModelFactory {
    pub descriptor: FeatureDescriptor,
}

impl FakeModelFactory {
    pub fn new() -> FakeModelFactory {
        FakeModelFactory {
            descriptor: FeatureDescriptor::default(),
        }
    }
}

impl Default for FakeModelFactory {
    fn default() -> Self {
        FakeModelFactory::new()
    }
}

impl ModelFactory for FakeModelFactory {
    fn new_backend(&self, path: &str) -> anyhow::Result<Box<dyn InferenceBackend>> {
        Ok(Box::new(
            FakeBackend::new(path).with_descriptor(self.descriptor),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Color;

    #[test]
    fn test_fake_backend_fills_outputs() {
        let mut priors = vec![0.0; NUM_MOVES];
        priors[3] = 1.0;
        let mut backend = FakeBackend::new("fake").with_output(priors.clone(), 0.25);

        let inputs = vec![
            ModelInput {
                sym: Symmetry::Identity,
                position_history: vec![Position::new(Color::Black)],
            };
            3
        ];
        let mut outputs = vec![ModelOutput::default(); 3];
        let name = backend.run_many(&inputs, &mut outputs);

        assert_eq!(name, "fake");
        for output in &outputs {
            assert_eq!(output.policy, priors);
            assert_eq!(output.value, 0.25);
        }
    }

    #[test]
    #[should_panic(expected = "batch size mismatch")]
    fn test_fake_backend_batch_size_mismatch_is_fatal() {
        let mut backend = FakeBackend::new("fake");
        let inputs = vec![ModelInput {
            sym: Symmetry::Identity,
            position_history: vec![Position::new(Color::Black)],
        }];
        let mut outputs = Vec::new();
        backend.run_many(&inputs, &mut outputs);
    }

    #[test]
    fn test_factory_names_backend_after_path() {
        let factory = FakeModelFactory::new();
        let backend = factory.new_backend("models/000123-foo").unwrap();
        assert_eq!(backend.name(), "models/000123-foo");
    }
}
