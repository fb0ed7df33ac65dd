//! Pretrained model pair: style feature extractor + LUT diffuser.
//!
//! The extractor digests a reference image into a style embedding; the
//! diffuser conditions on the clip's content frame and that embedding
//! to produce a flattened 3-D LUT. Both run as `ort` sessions. The
//! seams are traits so the pipeline can be exercised with stub models
//! in tests.
//!
//! Supports FP32 and FP16 model exports; the precision path is chosen
//! per model from the declared input dtype.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{Array4, ArrayD};
use ort::{session::Session, value::Tensor};
use tracing::{debug, info, warn};

use crate::batch::resize_batch;
use crate::device::{DevicePolicy, Precision};
use crate::error::GradeError;
use crate::sampler::LutVolume;
use crate::types::{frames_to_batch, RgbFrame};

pub const EXTRACTOR_FILE: &str = "gs_extractor.onnx";
pub const DIFFUSER_FILE: &str = "l_diffuser.onnx";

/// Spatial size frames are resampled to before model input.
const ANALYSIS_SIZE: usize = 256;

/// Style embedding produced by the extractor, consumed by the diffuser.
#[derive(Debug, Clone)]
pub struct Features(pub ArrayD<f32>);

/// Digests a style reference image into an embedding.
pub trait FeatureExtractor: Send + Sync {
    fn extract_features(&self, image: &RgbFrame) -> Result<Features>;
}

/// Produces a flattened LUT (`3 * D^3` floats) for a content frame
/// under a style embedding.
pub trait LutGenerator: Send + Sync {
    fn generate_lut(&self, content: &RgbFrame, features: &Features) -> Result<Vec<f32>>;
}

/// Resamples a frame to the analysis resolution and lays it out as a
/// normalized NCHW `(1, 3, S, S)` tensor.
fn frame_to_nchw(frame: &RgbFrame) -> Result<Array4<f32>> {
    let batch = frames_to_batch(std::slice::from_ref(frame))?;
    let resized = resize_batch(&batch, ANALYSIS_SIZE, ANALYSIS_SIZE);

    let mut nchw = Array4::<f32>::zeros((1, 3, ANALYSIS_SIZE, ANALYSIS_SIZE));
    for y in 0..ANALYSIS_SIZE {
        for x in 0..ANALYSIS_SIZE {
            for c in 0..3 {
                nchw[(0, c, y, x)] = resized[(0, y, x, c)];
            }
        }
    }
    Ok(nchw)
}

fn to_f16_array(input: &ArrayD<f32>) -> Result<ArrayD<f16>> {
    let standard;
    let slice = match input.as_slice() {
        Some(s) => s,
        None => {
            standard = input.as_standard_layout().into_owned();
            standard.as_slice().expect("standard layout is contiguous")
        }
    };
    let mut data = vec![f16::ZERO; slice.len()];
    data.convert_from_f32_slice(slice);
    Ok(ArrayD::from_shape_vec(input.shape().to_vec(), data)?)
}

fn to_f32_vec(view: &ndarray::ArrayViewD<'_, f16>) -> Vec<f32> {
    let owned;
    let slice = match view.as_slice() {
        Some(s) => s,
        None => {
            owned = view.as_standard_layout().into_owned();
            owned.as_slice().expect("standard layout is contiguous")
        }
    };
    let mut out = vec![0.0f32; slice.len()];
    slice.convert_to_f32_slice(&mut out);
    out
}

fn session_io_is_fp16(session: &Session) -> bool {
    match session.inputs()[0].dtype() {
        ort::value::ValueType::Tensor { ty, .. } => *ty == ort::tensor::TensorElementType::Float16,
        _ => false,
    }
}

/// Validates a session's declared IO arity before anything indexes into
/// it. A model with too few inputs or no outputs is a startup error.
fn check_model_io(input_count: usize, output_count: usize, min_inputs: usize) -> Result<()> {
    if input_count < min_inputs {
        bail!("model declares {input_count} input(s), expected at least {min_inputs}");
    }
    if output_count == 0 {
        bail!("model declares no outputs");
    }
    Ok(())
}

/// Picks the tensor IO precision for a session. The model's exported
/// dtype is binding (ORT rejects mismatched tensors); the policy states
/// the expectation, and disagreement is logged at load time.
fn io_precision(policy: &DevicePolicy, model_fp16: bool) -> bool {
    let policy_fp16 = policy.precision == Precision::Fp16;
    if model_fp16 != policy_fp16 {
        warn!(
            policy = %policy.precision,
            model_fp16,
            "model precision differs from the device policy, following the model"
        );
    }
    model_fp16
}

/// ONNX style feature extractor. One image input, one embedding output.
pub struct OnnxExtractor {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    fp16: bool,
}

impl OnnxExtractor {
    pub fn load(model_path: &Path, policy: &DevicePolicy) -> Result<Self> {
        let session = policy.build_session(model_path)?;

        check_model_io(session.inputs().len(), session.outputs().len(), 1)
            .with_context(|| format!("invalid extractor model: {}", model_path.display()))?;
        let input_name = session.inputs()[0].name().to_string();
        let output_name = session.outputs()[0].name().to_string();
        let fp16 = io_precision(policy, session_io_is_fp16(&session));

        debug!(
            model = %model_path.display(),
            input = %input_name,
            output = %output_name,
            fp16,
            "extractor model loaded"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            fp16,
        })
    }

    fn run_f32(&self, image: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let input_tensor = Tensor::from_array(image.clone())?;
        let mut session = self.session.lock().expect("extractor session poisoned");
        let outputs = session.run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
        let view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        Ok(view.to_owned())
    }

    fn run_f16(&self, image: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let input_tensor = Tensor::from_array(to_f16_array(image)?)?;
        let mut session = self.session.lock().expect("extractor session poisoned");
        let outputs = session.run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
        let view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;
        let shape = view.shape().to_vec();
        Ok(ArrayD::from_shape_vec(shape, to_f32_vec(&view))?)
    }
}

impl FeatureExtractor for OnnxExtractor {
    fn extract_features(&self, image: &RgbFrame) -> Result<Features> {
        let nchw = frame_to_nchw(image)?.into_dyn();

        let embedding = if self.fp16 {
            self.run_f16(&nchw)
        } else {
            self.run_f32(&nchw)
        }
        .context(GradeError::Model(
            "style feature extraction failed".to_string(),
        ))?;

        Ok(Features(embedding))
    }
}

/// ONNX LUT diffuser. Two inputs (content image, style embedding), one
/// flat-LUT output.
pub struct OnnxDiffuser {
    session: Mutex<Session>,
    content_input: String,
    features_input: String,
    output_name: String,
    fp16: bool,
}

impl OnnxDiffuser {
    pub fn load(model_path: &Path, policy: &DevicePolicy) -> Result<Self> {
        let session = policy.build_session(model_path)?;

        check_model_io(session.inputs().len(), session.outputs().len(), 2)
            .with_context(|| format!("invalid diffuser model: {}", model_path.display()))?;
        let content_input = session.inputs()[0].name().to_string();
        let features_input = session.inputs()[1].name().to_string();
        let output_name = session.outputs()[0].name().to_string();
        let fp16 = io_precision(policy, session_io_is_fp16(&session));

        debug!(
            model = %model_path.display(),
            content = %content_input,
            features = %features_input,
            output = %output_name,
            fp16,
            "diffuser model loaded"
        );

        Ok(Self {
            session: Mutex::new(session),
            content_input,
            features_input,
            output_name,
            fp16,
        })
    }

    fn run_f32(&self, content: &ArrayD<f32>, features: &ArrayD<f32>) -> Result<Vec<f32>> {
        let content_tensor = Tensor::from_array(content.clone())?;
        let features_tensor = Tensor::from_array(features.clone())?;

        let mut session = self.session.lock().expect("diffuser session poisoned");
        let outputs = session.run(ort::inputs![
            self.content_input.as_str() => &content_tensor,
            self.features_input.as_str() => &features_tensor,
        ])?;
        let view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        let owned = view.as_standard_layout().into_owned();
        Ok(owned.into_raw_vec_and_offset().0)
    }

    fn run_f16(&self, content: &ArrayD<f32>, features: &ArrayD<f32>) -> Result<Vec<f32>> {
        let content_tensor = Tensor::from_array(to_f16_array(content)?)?;
        let features_tensor = Tensor::from_array(to_f16_array(features)?)?;

        let mut session = self.session.lock().expect("diffuser session poisoned");
        let outputs = session.run(ort::inputs![
            self.content_input.as_str() => &content_tensor,
            self.features_input.as_str() => &features_tensor,
        ])?;
        let view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;
        Ok(to_f32_vec(&view))
    }
}

impl LutGenerator for OnnxDiffuser {
    fn generate_lut(&self, content: &RgbFrame, features: &Features) -> Result<Vec<f32>> {
        let content_nchw = frame_to_nchw(content)?.into_dyn();

        if self.fp16 {
            self.run_f16(&content_nchw, &features.0)
        } else {
            self.run_f32(&content_nchw, &features.0)
        }
        .context(GradeError::Model("LUT generation failed".to_string()))
    }
}

/// The loaded extractor + diffuser pair, shared read-only across requests.
pub struct ModelPair {
    extractor: Box<dyn FeatureExtractor>,
    generator: Box<dyn LutGenerator>,
    /// Expected cube edge of generated LUTs; 0 disables the check.
    expected_lut_size: usize,
}

impl std::fmt::Debug for ModelPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelPair")
            .field("expected_lut_size", &self.expected_lut_size)
            .finish_non_exhaustive()
    }
}

impl ModelPair {
    /// Loads both models from `models_dir`. Missing files are startup
    /// errors; a service with no models cannot serve.
    pub fn load(models_dir: &Path, policy: &DevicePolicy, expected_lut_size: usize) -> Result<Self> {
        let extractor_path = models_dir.join(EXTRACTOR_FILE);
        let diffuser_path = models_dir.join(DIFFUSER_FILE);

        for path in [&extractor_path, &diffuser_path] {
            if !path.exists() {
                bail!("model file not found: {}", path.display());
            }
        }

        info!(dir = %models_dir.display(), "loading model pair");
        let extractor = OnnxExtractor::load(&extractor_path, policy)?;
        let generator = OnnxDiffuser::load(&diffuser_path, policy)?;

        Ok(Self {
            extractor: Box::new(extractor),
            generator: Box::new(generator),
            expected_lut_size,
        })
    }

    /// Assembles a pair from already-built components. Used by tests and
    /// by anything that wants to swap in alternative model backends.
    pub fn from_parts(
        extractor: Box<dyn FeatureExtractor>,
        generator: Box<dyn LutGenerator>,
        expected_lut_size: usize,
    ) -> Self {
        Self {
            extractor,
            generator,
            expected_lut_size,
        }
    }

    /// Synthesizes one LUT for a clip from its analysis frame and an
    /// optional reference image. Without a reference the analysis frame
    /// doubles as its own reference, which normalizes the clip toward
    /// its own dominant style.
    pub fn synthesize_lut(
        &self,
        content: &RgbFrame,
        reference: Option<&RgbFrame>,
    ) -> Result<LutVolume> {
        if reference.is_none() {
            debug!("no reference image, using content frame as its own reference");
        }
        let reference = reference.unwrap_or(content);

        let features = self.extractor.extract_features(reference)?;
        let flat = self.generator.generate_lut(content, &features)?;
        let lut = LutVolume::from_flat(flat)?;

        if self.expected_lut_size != 0 && lut.size() != self.expected_lut_size {
            warn!(
                got = lut.size(),
                expected = self.expected_lut_size,
                "diffuser produced an unexpected LUT size"
            );
        }

        Ok(lut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::DEFAULT_LUT_SIZE;

    struct StubExtractor;

    impl FeatureExtractor for StubExtractor {
        fn extract_features(&self, image: &RgbFrame) -> Result<Features> {
            // Embedding encodes the input mean so tests can tell which
            // reference was used.
            let mean =
                image.data.iter().map(|&v| v as f32).sum::<f32>() / image.data.len() as f32;
            Ok(Features(ndarray::arr1(&[mean]).into_dyn()))
        }
    }

    struct IdentityGenerator {
        size: usize,
    }

    impl LutGenerator for IdentityGenerator {
        fn generate_lut(&self, _content: &RgbFrame, _features: &Features) -> Result<Vec<f32>> {
            let n = (self.size - 1) as f32;
            let mut flat = Vec::with_capacity(3 * self.size.pow(3));
            for b in 0..self.size {
                for g in 0..self.size {
                    for r in 0..self.size {
                        flat.extend_from_slice(&[r as f32 / n, g as f32 / n, b as f32 / n]);
                    }
                }
            }
            Ok(flat)
        }
    }

    struct BrokenGenerator;

    impl LutGenerator for BrokenGenerator {
        fn generate_lut(&self, _content: &RgbFrame, _features: &Features) -> Result<Vec<f32>> {
            Ok(vec![0.0; 100])
        }
    }

    fn solid_frame(w: u32, h: u32, value: u8) -> RgbFrame {
        RgbFrame::new(vec![value; w as usize * h as usize * 3], w, h).unwrap()
    }

    #[test]
    fn frame_to_nchw_shape_and_normalization() {
        let frame = solid_frame(64, 48, 255);
        let nchw = frame_to_nchw(&frame).unwrap();
        assert_eq!(nchw.dim(), (1, 3, ANALYSIS_SIZE, ANALYSIS_SIZE));
        for v in nchw.iter() {
            assert!((v - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn frame_to_nchw_separates_channels() {
        let mut data = vec![0u8; 4 * 4 * 3];
        for px in data.chunks_exact_mut(3) {
            px[0] = 255;
            px[1] = 0;
            px[2] = 128;
        }
        let frame = RgbFrame::new(data, 4, 4).unwrap();
        let nchw = frame_to_nchw(&frame).unwrap();

        assert!((nchw[(0, 0, 100, 100)] - 1.0).abs() < 1e-5);
        assert!(nchw[(0, 1, 100, 100)].abs() < 1e-5);
        assert!((nchw[(0, 2, 100, 100)] - 128.0 / 255.0).abs() < 1e-2);
    }

    #[test]
    fn synthesize_lut_with_identity_stub() {
        let pair = ModelPair::from_parts(
            Box::new(StubExtractor),
            Box::new(IdentityGenerator {
                size: DEFAULT_LUT_SIZE,
            }),
            DEFAULT_LUT_SIZE,
        );

        let content = solid_frame(32, 32, 100);
        let reference = solid_frame(16, 16, 200);
        let lut = pair.synthesize_lut(&content, Some(&reference)).unwrap();
        assert_eq!(lut.size(), DEFAULT_LUT_SIZE);

        let out = lut.sample([0.5, 0.5, 0.5]);
        for c in out {
            assert!((c - 0.5).abs() < 1e-5);
        }
    }

    #[test]
    fn missing_reference_falls_back_to_content() {
        struct RecordingExtractor;
        impl FeatureExtractor for RecordingExtractor {
            fn extract_features(&self, image: &RgbFrame) -> Result<Features> {
                // Self-reference: the 42-valued content frame must arrive here.
                assert!(image.data.iter().all(|&v| v == 42));
                StubExtractor.extract_features(image)
            }
        }

        let pair = ModelPair::from_parts(
            Box::new(RecordingExtractor),
            Box::new(IdentityGenerator { size: 5 }),
            0,
        );
        let content = solid_frame(8, 8, 42);
        pair.synthesize_lut(&content, None).unwrap();
    }

    #[test]
    fn malformed_generator_output_is_shape_error() {
        let pair = ModelPair::from_parts(Box::new(StubExtractor), Box::new(BrokenGenerator), 0);
        let err = pair
            .synthesize_lut(&solid_frame(8, 8, 0), None)
            .unwrap_err();
        assert!(matches!(
            crate::error::classify(&err),
            Some(GradeError::Shape(_))
        ));
    }

    #[test]
    fn degenerate_model_io_is_rejected() {
        assert!(check_model_io(1, 1, 1).is_ok());
        assert!(check_model_io(2, 1, 2).is_ok());

        // No inputs, no outputs, or fewer inputs than the role needs.
        assert!(check_model_io(0, 1, 1).is_err());
        assert!(check_model_io(1, 0, 1).is_err());
        assert!(check_model_io(1, 1, 2).is_err());
    }

    #[test]
    fn io_precision_follows_the_exported_model() {
        use crate::device::{ComputeTarget, InferenceBackend};

        let cpu = DevicePolicy::with_target(ComputeTarget::Cpu, InferenceBackend::Cuda, None);
        let gpu =
            DevicePolicy::with_target(ComputeTarget::Accelerator, InferenceBackend::Cuda, None);

        // Matching cases.
        assert!(!io_precision(&cpu, false));
        assert!(io_precision(&gpu, true));
        // Mismatches are logged but the model's dtype still wins.
        assert!(io_precision(&cpu, true));
        assert!(!io_precision(&gpu, false));
    }

    #[test]
    fn missing_model_files_fail_load() {
        let temp = tempfile::tempdir().unwrap();
        let policy = DevicePolicy::with_target(
            crate::device::ComputeTarget::Cpu,
            crate::device::InferenceBackend::Cuda,
            None,
        );
        let err = ModelPair::load(temp.path(), &policy, DEFAULT_LUT_SIZE).unwrap_err();
        assert!(err.to_string().contains("model file not found"));
    }
}
