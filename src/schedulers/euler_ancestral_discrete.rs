use super::{
    pred_original_sample, signed_sqrt, InferenceSchedule, PredictionType, Scheduler,
    SchedulerConfig, SchedulerError, TrainingSchedule,
};
use crate::tensor::{FloatTensor, TensorError};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Ancestral sampling with Euler method steps.
/// Based on the original k-diffusion implementation by Katherine Crowson:
///
/// https://github.com/crowsonkb/k-diffusion/blob/481677d114f6ea445aa009cf5bd7a9cdee909e47/k_diffusion/sampling.py#L72
///
/// Every step draws fresh noise from the scheduler's own seeded generator, so
/// a scheduler must not be reused across generation requests.
#[derive(Clone)]
pub struct EulerAncestralDiscreteScheduler {
    training: TrainingSchedule,
    schedule: Option<InferenceSchedule>,
    rng: StdRng,
    pub config: SchedulerConfig,
}

impl EulerAncestralDiscreteScheduler {
    pub fn new(config: SchedulerConfig, seed: u64) -> Result<Self, SchedulerError> {
        let training = TrainingSchedule::new(&config)?;
        Ok(Self { training, schedule: None, rng: StdRng::seed_from_u64(seed), config })
    }

    /// The inference sigmas, including the trailing zero.
    pub fn sigmas(&self) -> &[f64] {
        self.schedule.as_ref().map(|s| s.sigmas()).unwrap_or(&[])
    }

    fn schedule(&self) -> Result<&InferenceSchedule, SchedulerError> {
        self.schedule.as_ref().ok_or(SchedulerError::TimestepsNotSet)
    }
}

/// Splits the move from `sigma_from` down to `sigma_to` into the standard
/// deviation of the fresh noise, `sigma_up`, and the level reached by the
/// deterministic Euler step, `sigma_down`.
pub fn ancestral_sigmas(sigma_from: f64, sigma_to: f64) -> (f64, f64) {
    let (from_sq, to_sq) = (sigma_from.powi(2), sigma_to.powi(2));
    let sigma_up = signed_sqrt(to_sq * (from_sq - to_sq) / from_sq);
    let sigma_down = signed_sqrt(to_sq - sigma_up.powi(2));
    (sigma_up, sigma_down)
}

/// A single ancestral Euler update from `sigma` to `sigma_to`. `noise` is
/// called once per element, in order.
pub(crate) fn ancestral_update<F: FnMut() -> f32>(
    prediction_type: PredictionType,
    model_output: &FloatTensor,
    sample: &FloatTensor,
    sigma: f64,
    sigma_to: f64,
    mut noise: F,
) -> Result<FloatTensor, TensorError> {
    // 1. compute predicted original sample (x_0) from sigma-scaled predicted noise
    let pred_original_sample = pred_original_sample(prediction_type, sample, model_output, sigma)?;

    let (sigma_up, sigma_down) = ancestral_sigmas(sigma, sigma_to);

    // 2. Convert to an ODE derivative
    let dt = (sigma_down - sigma) as f32;
    let sigma = sigma as f32;
    let mut prev_sample = sample.zip_map(&pred_original_sample, |s, p| {
        let derivative = (s - p) / sigma;
        s + derivative * dt
    })?;

    let sigma_up = sigma_up as f32;
    prev_sample.data_mut().iter_mut().for_each(|v| *v += noise() * sigma_up);
    Ok(prev_sample)
}

impl Scheduler for EulerAncestralDiscreteScheduler {
    fn init_noise_sigma(&self) -> f64 {
        self.schedule
            .as_ref()
            .map_or(self.training.init_noise_sigma(), |s| s.init_noise_sigma())
    }

    fn timesteps(&self) -> &[usize] {
        self.schedule.as_ref().map(|s| s.timesteps()).unwrap_or(&[])
    }

    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<&[usize], SchedulerError> {
        let schedule = InferenceSchedule::new(&self.training, num_inference_steps)?;
        Ok(self.schedule.insert(schedule).timesteps())
    }

    fn scale_in_place(
        &self,
        sample: &mut FloatTensor,
        timestep: usize,
    ) -> Result<(), SchedulerError> {
        // https://github.com/huggingface/diffusers/blob/aba2a65d6ab47c0d1c12fa47e9b238c1d3e34512/src/diffusers/schedulers/scheduling_euler_ancestral_discrete.py#L132
        self.schedule()?.scale_in_place(sample, timestep)
    }

    fn step(
        &mut self,
        model_output: &FloatTensor,
        timestep: usize,
        sample: &FloatTensor,
        _order: usize,
    ) -> Result<FloatTensor, SchedulerError> {
        let schedule = self.schedule()?;
        let step_index = schedule.step_index(timestep)?;
        let sigma = schedule.sigma(step_index)?;
        let sigma_to = schedule.sigma(step_index + 1)?;

        let rng = &mut self.rng;
        let prev_sample = ancestral_update(
            self.config.prediction_type,
            model_output,
            sample,
            sigma,
            sigma_to,
            || rng.sample(StandardNormal),
        )?;
        Ok(prev_sample)
    }

    fn add_noise(
        &self,
        original: &FloatTensor,
        noise: &FloatTensor,
        timestep: usize,
    ) -> Result<FloatTensor, SchedulerError> {
        self.schedule()?.add_noise(original, noise, timestep)
    }
}
