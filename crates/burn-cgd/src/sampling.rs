//! The guided sampling loop
//!
//! [`SamplingRun`] exposes one explicit transition, [`SamplingRun::step`],
//! and an iterator driver over it. All randomness (initial noise, class
//! draws, cutouts, step noise) comes from the [`StdRng`] carried in
//! [`LoopState`], so a seed reproduces a run.

use std::iter::FusedIterator;

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn_cgd_clip::ClassWeights;
use burn_cgd_core::{catch_oom, check_tensor_if, tensor_stats, CgdError, DebugConfig, Denoiser, Embedder, Result};
use burn_cgd_samplers::{DdimConfig, DdimSampler, DdpmSampler, GaussianDiffusion, Respacing, StepOutput};
use rand::distributions::WeightedIndex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::guidance::GuidanceBridge;
use crate::noise::gaussian_noise;

/// How each reverse step is taken
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepKind {
    /// DDPM: sample from the posterior, guidance shifts the mean
    Ancestral,
    /// DDIM: guidance enters through the score, `eta = 0` is deterministic
    Deterministic { eta: f64 },
}

impl StepKind {
    /// `ddimN` respacings select the deterministic sampler
    pub fn for_respacing(respacing: &Respacing) -> Self {
        if respacing.is_ddim() {
            StepKind::Deterministic { eta: 0.0 }
        } else {
            StepKind::Ancestral
        }
    }
}

/// Where class labels are drawn from
#[derive(Debug, Clone, PartialEq)]
pub enum ClassSelection {
    Uniform { num_classes: usize },
    Weighted(ClassWeights),
}

/// Class labels for a class-conditional model
#[derive(Debug, Clone, PartialEq)]
pub struct ClassConditioning {
    pub selection: ClassSelection,
    /// Redraw every element's class before each step
    pub randomize: bool,
}

/// Draw one class label
///
/// Weighted tables are sampled in proportion to their (possibly truncated)
/// probabilities.
pub fn draw_class(selection: &ClassSelection, rng: &mut StdRng) -> usize {
    match selection {
        ClassSelection::Uniform { num_classes } => rng.gen_range(0..(*num_classes).max(1)),
        ClassSelection::Weighted(weights) => {
            let classes = weights.classes();
            match WeightedIndex::new(weights.probabilities()) {
                Ok(index) => classes[rng.sample(&index)],
                // All-zero tables fall back to the top-ranked class
                Err(_) => classes.first().copied().unwrap_or(0),
            }
        }
    }
}

fn draw_classes(selection: &ClassSelection, batch: usize, rng: &mut StdRng) -> Vec<usize> {
    (0..batch).map(|_| draw_class(selection, rng)).collect()
}

/// Loop settings independent of the models
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub kind: StepKind,
    pub batch_size: usize,
    pub image_size: usize,
    pub skip_timesteps: usize,
    /// Clamp the loop's own denoised estimate to [-1, 1]
    pub clip_denoised: bool,
    pub seed: u64,
    pub debug: DebugConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            kind: StepKind::Ancestral,
            batch_size: 1,
            image_size: 128,
            skip_timesteps: 0,
            clip_denoised: true,
            seed: 0,
            debug: DebugConfig::default(),
        }
    }
}

/// Everything that changes between steps
pub struct LoopState<B: Backend> {
    /// Current noisy batch `[n, 3, s, s]`
    pub x: Tensor<B, 4>,
    /// Next (respaced) timestep to process, -1 once finished
    pub timestep: i64,
    /// Steps completed so far
    pub step: usize,
    pub classes: Option<Vec<usize>>,
    pub rng: StdRng,
}

impl<B: Backend> LoopState<B> {
    pub fn is_finished(&self) -> bool {
        self.timestep < 0
    }
}

/// Output of one step
pub struct Snapshot<B: Backend> {
    /// 0-based step counter
    pub step: usize,
    /// Timestep that was processed
    pub timestep: usize,
    /// x_{t-1}
    pub sample: Tensor<B, 4>,
    /// Denoised estimate of the final image
    pub pred_xstart: Tensor<B, 4>,
    pub classes: Option<Vec<usize>>,
}

impl<B: Backend> Snapshot<B> {
    /// Timestep the next step would process, -1 after the last one
    pub fn next_timestep(&self) -> i64 {
        self.timestep as i64 - 1
    }

    pub fn is_final(&self) -> bool {
        self.timestep == 0
    }
}

/// A guided sampling run over a respaced diffusion schedule
pub struct SamplingRun<'a, A: AutodiffBackend, M: ?Sized, E: ?Sized> {
    diffusion: &'a GaussianDiffusion,
    model: &'a M,
    bridge: Option<GuidanceBridge<'a, A, M, E>>,
    conditioning: Option<ClassConditioning>,
    config: LoopConfig,
    state: Option<LoopState<A::InnerBackend>>,
    total_steps: usize,
}

impl<'a, A, M, E> SamplingRun<'a, A, M, E>
where
    A: AutodiffBackend,
    M: Denoiser<A> + Denoiser<A::InnerBackend> + ?Sized,
    E: Embedder<A> + ?Sized,
{
    /// Validate the setup and draw the initial state
    ///
    /// `init_image` is a `[1, 3, s, s]` (or `[batch, 3, s, s]`) tensor in
    /// [-1, 1]; it is forward-noised to timestep `T - 1 - skip_timesteps`.
    pub fn new(
        diffusion: &'a GaussianDiffusion,
        model: &'a M,
        bridge: Option<GuidanceBridge<'a, A, M, E>>,
        conditioning: Option<ClassConditioning>,
        config: LoopConfig,
        init_image: Option<Tensor<A::InnerBackend, 4>>,
        device: &<A::InnerBackend as Backend>::Device,
    ) -> Result<Self> {
        let num_timesteps = diffusion.num_timesteps();
        let skip = config.skip_timesteps;

        if config.batch_size == 0 {
            return Err(CgdError::config("batch size must be greater than zero"));
        }
        if skip >= num_timesteps {
            return Err(CgdError::config(format!(
                "skip_timesteps ({skip}) must be less than the number of sampling steps ({num_timesteps})"
            )));
        }
        if init_image.is_some() && skip == 0 {
            return Err(CgdError::config("an init image needs skip_timesteps greater than 0"));
        }
        if init_image.is_none() && skip != 0 {
            return Err(CgdError::config("skip_timesteps must be 0 without an init image"));
        }
        if init_image.is_some() && matches!(config.kind, StepKind::Deterministic { .. }) {
            return Err(CgdError::config("init images are not supported with ddim respacing"));
        }
        check_conditioning(
            Denoiser::<A::InnerBackend>::num_classes(model),
            conditioning.as_ref(),
        )?;

        let mut rng = StdRng::seed_from_u64(config.seed);
        let dims = [config.batch_size, 3, config.image_size, config.image_size];
        let start = num_timesteps - 1 - skip;

        let noise = gaussian_noise::<A::InnerBackend, 4>(&mut rng, dims, device);
        let x = match init_image {
            Some(image) => {
                let image = expand_batch(image, config.batch_size, config.image_size)?;
                diffusion.q_sample(image, start, noise)
            }
            None => noise,
        };

        let classes = conditioning
            .as_ref()
            .map(|c| draw_classes(&c.selection, config.batch_size, &mut rng));

        tracing::info!(
            steps = start + 1,
            batch = config.batch_size,
            size = config.image_size,
            guided = bridge.is_some(),
            kind = ?config.kind,
            "starting sampling run"
        );

        Ok(Self {
            diffusion,
            model,
            bridge,
            conditioning,
            total_steps: start + 1,
            state: Some(LoopState {
                x,
                timestep: start as i64,
                step: 0,
                classes,
                rng,
            }),
            config,
        })
    }

    /// Number of snapshots the run yields
    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// State before the next step, `None` once the run is exhausted
    pub fn state(&self) -> Option<&LoopState<A::InnerBackend>> {
        self.state.as_ref()
    }

    pub fn is_guided(&self) -> bool {
        self.bridge.is_some()
    }

    /// Advance `state` by one reverse step
    ///
    /// Backend out-of-memory panics anywhere in the step become
    /// [`CgdError::OutOfMemory`].
    pub fn step(
        &self,
        state: LoopState<A::InnerBackend>,
    ) -> Result<(LoopState<A::InnerBackend>, Snapshot<A::InnerBackend>)> {
        if state.is_finished() {
            return Err(CgdError::config("sampling run has already finished"));
        }
        let num_timesteps = self.diffusion.num_timesteps();
        if state.timestep as usize >= num_timesteps {
            return Err(CgdError::config(format!(
                "timestep {} is out of range for {num_timesteps} sampling steps",
                state.timestep
            )));
        }
        let [batch, ..] = state.x.dims();
        if batch != self.config.batch_size {
            return Err(CgdError::config(format!(
                "state batch of {batch} does not match batch size {}",
                self.config.batch_size
            )));
        }
        if let Some(classes) = state.classes.as_ref().filter(|c| c.len() != batch) {
            return Err(CgdError::config(format!(
                "{} class labels given for a batch of {batch}",
                classes.len()
            )));
        }

        catch_oom("sampling step", || self.step_unguarded(state))
    }

    fn step_unguarded(
        &self,
        state: LoopState<A::InnerBackend>,
    ) -> Result<(LoopState<A::InnerBackend>, Snapshot<A::InnerBackend>)> {
        let LoopState {
            x,
            timestep,
            step,
            mut classes,
            mut rng,
        } = state;
        let t = timestep as usize;

        if let Some(conditioning) = self.conditioning.as_ref().filter(|c| c.randomize) {
            classes = Some(draw_classes(
                &conditioning.selection,
                self.config.batch_size,
                &mut rng,
            ));
        }

        let grad = match &self.bridge {
            Some(bridge) => Some(bridge.gradient(x.clone(), t, classes.as_deref(), &mut rng)?),
            None => None,
        };

        let out = self.diffusion.p_mean_variance(
            self.model,
            x.clone(),
            t,
            classes.as_deref(),
            self.config.clip_denoised,
        );

        let StepOutput {
            sample,
            pred_xstart,
        } = match self.config.kind {
            StepKind::Ancestral => {
                let sampler = DdpmSampler::new();
                let noise = sampler
                    .needs_noise(t)
                    .then(|| gaussian_noise::<A::InnerBackend, 4>(&mut rng, x.dims(), &x.device()));
                sampler.step(self.diffusion, out, t, grad, noise)
            }
            StepKind::Deterministic { eta } => {
                let sampler = DdimSampler::new(DdimConfig { eta });
                let noise = sampler
                    .needs_noise(t)
                    .then(|| gaussian_noise::<A::InnerBackend, 4>(&mut rng, x.dims(), &x.device()));
                sampler.step(self.diffusion, out, x, t, grad, noise)
            }
        };

        if self.config.debug.sampler {
            tracing::debug!(
                step,
                timestep = t,
                sample = %tensor_stats(&sample),
                pred_xstart = %tensor_stats(&pred_xstart),
                "sampler step"
            );
        }
        check_tensor_if(&sample, "sample", self.config.debug.nan);
        check_tensor_if(&pred_xstart, "pred_xstart", self.config.debug.nan);

        let snapshot = Snapshot {
            step,
            timestep: t,
            sample: sample.clone(),
            pred_xstart,
            classes: classes.clone(),
        };
        let next = LoopState {
            x: sample,
            timestep: timestep - 1,
            step: step + 1,
            classes,
            rng,
        };

        Ok((next, snapshot))
    }
}

impl<'a, A, M, E> Iterator for SamplingRun<'a, A, M, E>
where
    A: AutodiffBackend,
    M: Denoiser<A> + Denoiser<A::InnerBackend> + ?Sized,
    E: Embedder<A> + ?Sized,
{
    type Item = Result<Snapshot<A::InnerBackend>>;

    fn next(&mut self) -> Option<Self::Item> {
        let state = self.state.take()?;
        if state.is_finished() {
            return None;
        }

        match self.step(state) {
            Ok((next, snapshot)) => {
                if !next.is_finished() {
                    self.state = Some(next);
                }
                Some(Ok(snapshot))
            }
            Err(err) => Some(Err(err)),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self
            .state
            .as_ref()
            .map(|s| (s.timestep + 1).max(0) as usize)
            .unwrap_or(0);
        (0, Some(remaining))
    }
}

impl<'a, A, M, E> FusedIterator for SamplingRun<'a, A, M, E>
where
    A: AutodiffBackend,
    M: Denoiser<A> + Denoiser<A::InnerBackend> + ?Sized,
    E: Embedder<A> + ?Sized,
{
}

fn check_conditioning(num_classes: Option<usize>, conditioning: Option<&ClassConditioning>) -> Result<()> {
    match (num_classes, conditioning) {
        (None, None) => Ok(()),
        (Some(_), None) => Err(CgdError::config(
            "the diffusion model is class-conditional but no class conditioning was given",
        )),
        (None, Some(_)) => Err(CgdError::config(
            "class conditioning was given but the diffusion model is unconditional",
        )),
        (Some(n), Some(c)) => {
            let largest = match &c.selection {
                ClassSelection::Uniform { num_classes } => {
                    if *num_classes == 0 {
                        return Err(CgdError::config("class conditioning needs at least one class"));
                    }
                    num_classes - 1
                }
                ClassSelection::Weighted(weights) => weights.largest_class_index(),
            };
            if largest >= n {
                return Err(CgdError::config(format!(
                    "class index {largest} is out of range for a model with {n} classes"
                )));
            }
            Ok(())
        }
    }
}

fn expand_batch<B: Backend>(image: Tensor<B, 4>, batch: usize, size: usize) -> Result<Tensor<B, 4>> {
    let [n, c, h, w] = image.dims();
    if c != 3 || h != size || w != size {
        return Err(CgdError::config(format!(
            "init image has shape [{n}, {c}, {h}, {w}], expected [1, 3, {size}, {size}]"
        )));
    }
    match n {
        n if n == batch => Ok(image),
        1 => Ok(Tensor::cat(vec![image; batch], 0)),
        _ => Err(CgdError::config(format!(
            "init image batch of {n} does not match batch size {batch}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn_cgd_clip::ProjectionEmbedder;
    use burn_cgd_core::AnalyticDenoiser;
    use burn_cgd_samplers::NoiseSchedule;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;
    type UnguidedRun<'a> = SamplingRun<'a, TestAutodiffBackend, AnalyticDenoiser, ProjectionEmbedder>;

    fn setup(respacing: &str) -> (GaussianDiffusion, AnalyticDenoiser) {
        let base = NoiseSchedule::linear(1000);
        let diffusion = GaussianDiffusion::new(&base, &respacing.parse().unwrap()).unwrap();
        (diffusion, AnalyticDenoiser::new(base.alphas_cumprod))
    }

    fn config(kind: StepKind) -> LoopConfig {
        LoopConfig {
            kind,
            batch_size: 2,
            image_size: 8,
            ..Default::default()
        }
    }

    #[test]
    fn test_yields_every_timestep_then_stops() {
        let device = Default::default();
        let (diffusion, model) = setup("25");
        let mut run = UnguidedRun::new(&diffusion, &model, None, None, config(StepKind::Ancestral), None, &device).unwrap();
        assert_eq!(run.total_steps(), 25);

        let snapshots: Vec<_> = run.by_ref().map(|s| s.unwrap()).collect();
        assert_eq!(snapshots.len(), 25);
        assert_eq!(snapshots[0].timestep, 24);
        assert_eq!(snapshots[24].next_timestep(), -1);
        assert!(snapshots[24].is_final());
        assert!(snapshots.iter().enumerate().all(|(i, s)| s.step == i));
        assert!(run.next().is_none());
        assert!(run.state().is_none());
    }

    #[test]
    fn test_init_image_skips_timesteps() {
        let device = Default::default();
        let (diffusion, model) = setup("25");
        let init = Tensor::<TestBackend, 4>::zeros([1, 3, 8, 8], &device);
        let config = LoopConfig {
            skip_timesteps: 5,
            ..config(StepKind::Ancestral)
        };
        let run = UnguidedRun::new(&diffusion, &model, None, None, config, Some(init), &device).unwrap();
        let snapshots: Vec<_> = run.map(|s| s.unwrap()).collect();
        assert_eq!(snapshots.len(), 20);
        assert_eq!(snapshots[0].timestep, 19);
        assert_eq!(snapshots.last().unwrap().next_timestep(), -1);
    }

    #[test]
    fn test_ddim_with_init_image_is_rejected() {
        let device = Default::default();
        let (diffusion, model) = setup("ddim25");
        let init = Tensor::<TestBackend, 4>::zeros([1, 3, 8, 8], &device);
        let config = LoopConfig {
            skip_timesteps: 5,
            ..config(StepKind::Deterministic { eta: 0.0 })
        };
        let err = UnguidedRun::new(&diffusion, &model, None, None, config, Some(init), &device)
            .err()
            .unwrap();
        assert!(matches!(err, CgdError::Config(_)));
    }

    #[test]
    fn test_skip_rules() {
        let device = Default::default();
        let (diffusion, model) = setup("25");
        let skip_without_init = LoopConfig {
            skip_timesteps: 3,
            ..config(StepKind::Ancestral)
        };
        assert!(UnguidedRun::new(&diffusion, &model, None, None, skip_without_init, None, &device).is_err());

        let init = Tensor::<TestBackend, 4>::zeros([1, 3, 8, 8], &device);
        assert!(UnguidedRun::new(&diffusion, &model, None, None, config(StepKind::Ancestral), Some(init), &device).is_err());
    }

    #[test]
    fn test_deterministic_run_depends_only_on_seed() {
        let device = Default::default();
        let (diffusion, model) = setup("ddim25");
        let last = |seed: u64| {
            let config = LoopConfig {
                seed,
                ..config(StepKind::Deterministic { eta: 0.0 })
            };
            let run = UnguidedRun::new(&diffusion, &model, None, None, config, None, &device).unwrap();
            run.map(|s| s.unwrap()).last().unwrap().sample.into_data().to_vec::<f32>().unwrap()
        };
        assert_eq!(last(4), last(4));
        assert_ne!(last(4), last(5));
    }

    #[test]
    fn test_class_conditioning_rules() {
        let device = Default::default();
        let base = NoiseSchedule::linear(1000);
        let diffusion = GaussianDiffusion::new(&base, &Respacing::Sections(vec![25])).unwrap();
        let conditional = AnalyticDenoiser::class_conditional(base.alphas_cumprod.clone(), 10, 0);
        let unconditional = AnalyticDenoiser::new(base.alphas_cumprod);
        let uniform = ClassConditioning {
            selection: ClassSelection::Uniform { num_classes: 10 },
            randomize: true,
        };

        assert!(UnguidedRun::new(&diffusion, &conditional, None, None, config(StepKind::Ancestral), None, &device).is_err());
        assert!(UnguidedRun::new(&diffusion, &unconditional, None, Some(uniform.clone()), config(StepKind::Ancestral), None, &device).is_err());

        let too_many = ClassConditioning {
            selection: ClassSelection::Uniform { num_classes: 11 },
            randomize: false,
        };
        assert!(UnguidedRun::new(&diffusion, &conditional, None, Some(too_many), config(StepKind::Ancestral), None, &device).is_err());

        let run = UnguidedRun::new(&diffusion, &conditional, None, Some(uniform), config(StepKind::Ancestral), None, &device).unwrap();
        for snapshot in run {
            let classes = snapshot.unwrap().classes.unwrap();
            assert_eq!(classes.len(), 2);
            assert!(classes.iter().all(|&c| c < 10));
        }
    }

    #[test]
    fn test_fixed_classes_are_kept() {
        let device = Default::default();
        let base = NoiseSchedule::linear(1000);
        let diffusion = GaussianDiffusion::new(&base, &Respacing::Sections(vec![25])).unwrap();
        let model = AnalyticDenoiser::class_conditional(base.alphas_cumprod, 50, 0);
        let conditioning = ClassConditioning {
            selection: ClassSelection::Uniform { num_classes: 50 },
            randomize: false,
        };
        let run = UnguidedRun::new(&diffusion, &model, None, Some(conditioning), config(StepKind::Ancestral), None, &device).unwrap();
        let classes: Vec<Vec<usize>> = run.map(|s| s.unwrap().classes.unwrap()).collect();
        assert!(classes.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_draw_class_follows_weights() {
        let weights = ClassWeights::new(vec![(7, 0.9), (3, 0.0), (5, 0.1)]).unwrap();
        let selection = ClassSelection::Weighted(weights);
        let mut rng = StdRng::seed_from_u64(0);
        let draws: Vec<usize> = (0..500).map(|_| draw_class(&selection, &mut rng)).collect();
        assert!(draws.iter().all(|&c| c == 7 || c == 5));
        let sevens = draws.iter().filter(|&&c| c == 7).count();
        assert!(sevens > 400);

        let zero = ClassSelection::Weighted(ClassWeights::new(vec![(2, 0.0), (9, 0.0)]).unwrap());
        assert_eq!(draw_class(&zero, &mut rng), 2);
    }

    #[test]
    fn test_step_after_finish_is_an_error() {
        let device = Default::default();
        let (diffusion, model) = setup("25");
        let run = UnguidedRun::new(&diffusion, &model, None, None, config(StepKind::Ancestral), None, &device).unwrap();
        let finished = LoopState {
            x: Tensor::zeros([2, 3, 8, 8], &device),
            timestep: -1,
            step: 25,
            classes: None,
            rng: StdRng::seed_from_u64(0),
        };
        assert!(run.step(finished).is_err());
    }

    fn state(batch: usize, timestep: i64, classes: Option<Vec<usize>>) -> LoopState<TestBackend> {
        LoopState {
            x: Tensor::zeros([batch, 3, 8, 8], &Default::default()),
            timestep,
            step: 0,
            classes,
            rng: StdRng::seed_from_u64(0),
        }
    }

    #[test]
    fn test_step_rejects_foreign_state() {
        let device = Default::default();
        let (diffusion, model) = setup("25");
        let run = UnguidedRun::new(&diffusion, &model, None, None, config(StepKind::Ancestral), None, &device).unwrap();

        for bad in [state(2, 25, None), state(2, 1000, None), state(3, 10, None), state(2, 10, Some(vec![0]))] {
            let err = run.step(bad).err().unwrap();
            assert!(matches!(err, CgdError::Config(_)));
        }
        assert!(run.step(state(2, 24, None)).is_ok());
    }

    struct ExhaustedDenoiser;

    impl<B: Backend> Denoiser<B> for ExhaustedDenoiser {
        fn forward(&self, _x: Tensor<B, 4>, _t: usize, _c: Option<&[usize]>) -> burn_cgd_core::DenoiserOutput<B> {
            panic!("CUDA out of memory. Tried to allocate 8.00 GiB");
        }

        fn num_classes(&self) -> Option<usize> {
            None
        }
    }

    #[test]
    fn test_unguided_out_of_memory_becomes_error() {
        let device = Default::default();
        let (diffusion, _) = setup("25");
        let mut run = SamplingRun::<TestAutodiffBackend, ExhaustedDenoiser, ProjectionEmbedder>::new(
            &diffusion,
            &ExhaustedDenoiser,
            None,
            None,
            config(StepKind::Ancestral),
            None,
            &device,
        )
        .unwrap();
        assert!(!run.is_guided());

        let err = run.next().unwrap().err().unwrap();
        assert!(err.is_out_of_memory());
        assert!(err.to_string().contains("sampling step"));
        assert!(run.next().is_none());
    }
}
