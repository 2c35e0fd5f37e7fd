use super::integrate::integrate;
use super::{
    pred_original_sample, InferenceSchedule, Scheduler, SchedulerConfig, SchedulerError,
    TrainingSchedule,
};
use crate::tensor::FloatTensor;
use std::collections::VecDeque;

/// Linear multistep scheduler for discrete beta schedules, the derivatives of
/// the last `order` steps are combined instead of injecting noise.
///
/// https://github.com/huggingface/diffusers/blob/9b37ed33b5fa09e594b38e4e6f7477beff3bd66a/src/diffusers/schedulers/scheduling_lms_discrete.py
pub struct LmsDiscreteScheduler {
    training: TrainingSchedule,
    schedule: Option<InferenceSchedule>,
    /// Most recent derivative last.
    derivatives: VecDeque<FloatTensor>,
    pub config: SchedulerConfig,
}

impl LmsDiscreteScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let training = TrainingSchedule::new(&config)?;
        Ok(Self { training, schedule: None, derivatives: VecDeque::new(), config })
    }

    /// The inference sigmas, including the trailing zero.
    pub fn sigmas(&self) -> &[f64] {
        self.schedule.as_ref().map(|s| s.sigmas()).unwrap_or(&[])
    }

    fn schedule(&self) -> Result<&InferenceSchedule, SchedulerError> {
        self.schedule.as_ref().ok_or(SchedulerError::TimestepsNotSet)
    }
}

/// Compute a linear multistep coefficient
fn lms_coefficient(sigmas: &[f64], order: usize, t: usize, current_order: usize) -> f64 {
    let lms_derivative = |tau: f64| -> f64 {
        let mut prod = 1.0;
        for k in 0..order {
            if current_order == k {
                continue;
            }
            prod *= (tau - sigmas[t - k]) / (sigmas[t - current_order] - sigmas[t - k]);
        }
        prod
    };

    // Integrate `lms_derivative` over two consecutive timesteps, the absolute
    // tolerance is the default of `scipy.integrate.quad`.
    integrate(lms_derivative, sigmas[t], sigmas[t + 1], 1.49e-8).integral
}

/// The coefficients applied to the derivatives, most recent first.
pub fn lms_coefficients(
    sigmas: &[f64],
    order: usize,
    step_index: usize,
) -> Result<Vec<f64>, SchedulerError> {
    if order == 0 {
        return Err(SchedulerError::InvalidOrder);
    }
    if step_index + 1 >= sigmas.len() {
        return Err(SchedulerError::SigmaOutOfBounds { index: step_index + 1, len: sigmas.len() });
    }
    let order = order.min(step_index + 1);
    Ok((0..order).map(|o| lms_coefficient(sigmas, order, step_index, o)).collect())
}

impl Scheduler for LmsDiscreteScheduler {
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
        self.derivatives.clear();
        Ok(self.schedule.insert(schedule).timesteps())
    }

    /// Scales the denoising model input by `(sigma^2 + 1)^0.5` to match the K-LMS algorithm.
    fn scale_in_place(
        &self,
        sample: &mut FloatTensor,
        timestep: usize,
    ) -> Result<(), SchedulerError> {
        self.schedule()?.scale_in_place(sample, timestep)
    }

    fn step(
        &mut self,
        model_output: &FloatTensor,
        timestep: usize,
        sample: &FloatTensor,
        order: usize,
    ) -> Result<FloatTensor, SchedulerError> {
        if order == 0 {
            return Err(SchedulerError::InvalidOrder);
        }
        let schedule = self.schedule()?;
        let step_index = schedule.step_index(timestep)?;
        let sigma = schedule.sigma(step_index)?;
        // 1. compute predicted original sample (x_0) from sigma-scaled predicted noise
        let pred_original_sample =
            pred_original_sample(self.config.prediction_type, sample, model_output, sigma)?;

        // 2. Convert to an ODE derivative
        let sigma_f = sigma as f32;
        let derivative = sample.zip_map(&pred_original_sample, |s, p| (s - p) / sigma_f)?;

        // 3. compute linear multistep coefficients
        let lms_coeffs = lms_coefficients(schedule.sigmas(), order, step_index)?;

        self.derivatives.push_back(derivative);
        while self.derivatives.len() > order {
            self.derivatives.pop_front();
        }

        // 4. compute previous sample based on the derivatives path
        let mut prev_sample = sample.clone();
        for (coeff, derivative) in lms_coeffs.iter().zip(self.derivatives.iter().rev()) {
            prev_sample.add_scaled(derivative, *coeff as f32)?;
        }
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
