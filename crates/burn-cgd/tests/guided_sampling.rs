//! End-to-end runs of the guided sampler with the reference collaborators

use burn::backend::Autodiff;
use burn::prelude::*;
use burn_cgd::core::{AnalyticDenoiser, CgdError, DebugConfig};
use burn_cgd::clip::{ClipVariant, ProjectionEmbedder};
use burn_cgd::{ClassConditioning, ClassSelection, ClipGuidedDiffusion, LoopConfig, RunConfig, SamplingRun};
use burn_ndarray::NdArray;

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<TestBackend>;
type Pipeline<'a> = ClipGuidedDiffusion<'a, TestAutodiffBackend, AnalyticDenoiser, ProjectionEmbedder>;

const NUM_CLASSES: usize = 10;

fn config(image_size: usize, respacing: &str) -> RunConfig {
    RunConfig {
        image_size,
        timestep_respacing: respacing.parse().unwrap(),
        num_cutouts: 8,
        num_classes: NUM_CLASSES,
        seed: 42,
        ..RunConfig::new("a red apple")
    }
}

fn denoiser(config: &RunConfig) -> AnalyticDenoiser {
    AnalyticDenoiser::class_conditional(config.base_schedule().alphas_cumprod, NUM_CLASSES, 7)
}

fn embedder() -> ProjectionEmbedder {
    ProjectionEmbedder::new(ClipVariant::VitB32, 0).with_input_resolution(32)
}

fn values(t: Tensor<TestBackend, 4>) -> Vec<f32> {
    t.into_data().to_vec().unwrap()
}

fn seed_image(size: usize) -> Tensor<TestBackend, 4> {
    let device = Default::default();
    let data: Vec<f32> = (0..3 * size * size).map(|i| ((i % 17) as f32 / 8.0) - 1.0).collect();
    Tensor::from_data(TensorData::new(data, [1, 3, size, size]), &device)
}

#[test]
fn test_class_conditioned_guided_run_completes() {
    let config = config(128, "25");
    let (model, embedder) = (denoiser(&config), embedder());
    let device = Default::default();

    let pipeline = Pipeline::new(&model, &embedder, config, false, &device).unwrap();
    let run = pipeline.sample(None, DebugConfig::default()).unwrap();
    assert!(run.is_guided());
    assert_eq!(run.total_steps(), 25);

    let snapshots: Vec<_> = run.collect::<Result<_, _>>().unwrap();
    assert_eq!(snapshots.len(), 25);

    let last = snapshots.last().unwrap();
    assert!(last.is_final());
    assert_eq!(last.pred_xstart.dims(), [1, 3, 128, 128]);
    assert!(values(last.pred_xstart.clone())
        .iter()
        .all(|v| v.is_finite() && (-1.0..=1.0).contains(v)));
    assert!(last.classes.as_ref().is_some_and(|c| c[0] < NUM_CLASSES));
}

#[test]
fn test_seed_image_run_yields_remaining_steps() {
    let config = RunConfig {
        skip_timesteps: 5,
        clip_guidance_scale: 0.0,
        ..config(64, "25")
    };
    let (model, embedder) = (denoiser(&config), embedder());
    let device = Default::default();

    let pipeline = Pipeline::new(&model, &embedder, config, true, &device).unwrap();
    let snapshots: Vec<_> = pipeline
        .sample(Some(seed_image(64)), DebugConfig::default())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(snapshots.len(), 20);
    assert_eq!(snapshots[0].timestep, 19);
    assert_eq!(snapshots.last().unwrap().next_timestep(), -1);
}

#[test]
fn test_zero_scales_match_unguided_chain() {
    let config = RunConfig {
        clip_guidance_scale: 0.0,
        tv_scale: 0.0,
        randomize_class: false,
        ..config(64, "25")
    };
    let (model, embedder) = (denoiser(&config), embedder());
    let device = Default::default();

    let pipeline = Pipeline::new(&model, &embedder, config.clone(), false, &device).unwrap();
    let run = pipeline.sample(None, DebugConfig::default()).unwrap();
    assert!(!run.is_guided());
    let through_pipeline: Vec<_> = run.map(|s| values(s.unwrap().sample)).collect();

    let plain: SamplingRun<'_, TestAutodiffBackend, AnalyticDenoiser, ProjectionEmbedder> = SamplingRun::new(
        pipeline.diffusion(),
        &model,
        None,
        Some(ClassConditioning {
            selection: ClassSelection::Uniform {
                num_classes: NUM_CLASSES,
            },
            randomize: false,
        }),
        LoopConfig {
            seed: config.seed,
            image_size: config.image_size,
            ..Default::default()
        },
        None,
        &device,
    )
    .unwrap();
    let unguided: Vec<_> = plain.map(|s| values(s.unwrap().sample)).collect();

    assert_eq!(through_pipeline.len(), unguided.len());
    assert_eq!(through_pipeline, unguided);
}

#[test]
fn test_ddim_with_seed_image_fails_before_sampling() {
    let config = RunConfig {
        skip_timesteps: 5,
        ..config(64, "ddim25")
    };
    let (model, embedder) = (denoiser(&config), embedder());
    let device = Default::default();

    let result = Pipeline::new(&model, &embedder, config, true, &device);
    assert!(matches!(result, Err(CgdError::Config(_))));
}

#[test]
fn test_seed_reproduces_guided_run() {
    let config = config(64, "ddim25");
    let (model, embedder) = (denoiser(&config), embedder());
    let device = Default::default();
    let pipeline = Pipeline::new(&model, &embedder, config, false, &device).unwrap();

    let final_estimate = || {
        let run = pipeline.sample(None, DebugConfig::default()).unwrap();
        values(run.last().unwrap().unwrap().pred_xstart)
    };
    assert_eq!(final_estimate(), final_estimate());
}

#[test]
fn test_skip_bounds_yield_remaining_steps() {
    let device = Default::default();
    for (respacing, steps) in [("25", 25), ("50", 50)] {
        for skip in [1, steps - 1] {
            let config = RunConfig {
                skip_timesteps: skip,
                clip_guidance_scale: 0.0,
                tv_scale: 0.0,
                ..config(64, respacing)
            };
            let (model, embedder) = (denoiser(&config), embedder());
            let pipeline = Pipeline::new(&model, &embedder, config, true, &device).unwrap();

            let run = pipeline.sample(Some(seed_image(64)), DebugConfig::default()).unwrap();
            assert_eq!(run.total_steps(), steps - skip);
            let snapshots: Vec<_> = run.collect::<Result<_, _>>().unwrap();

            assert_eq!(snapshots.len(), steps - skip, "respacing {respacing}, skip {skip}");
            assert_eq!(snapshots[0].timestep, steps - 1 - skip);
            assert!(snapshots.iter().enumerate().all(|(i, s)| s.step == i));
            let last = snapshots.last().unwrap();
            assert!(last.is_final());
            assert_eq!(last.next_timestep(), -1);
        }
    }
}
