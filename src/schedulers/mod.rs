//! # Diffusion schedulers
//!
//! Noise schedulers can be used to set the trade-off between
//! inference speed and quality.
//!
//! All the schedulers share the same training-time noise levels, see
//! [`TrainingSchedule`], and resize them to the requested number of
//! inference steps with [`InferenceSchedule`].
use crate::tensor::{FloatTensor, TensorError};
use log::debug;
use std::str::FromStr;

pub mod euler_ancestral_discrete;
mod integrate;
pub mod lms_discrete;

pub use euler_ancestral_discrete::EulerAncestralDiscreteScheduler;
pub use lms_discrete::LmsDiscreteScheduler;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("invalid scheduler config: {0}")]
    InvalidConfig(String),

    #[error("unknown beta schedule {0:?}, expected one of linear, scaled_linear")]
    UnknownBetaSchedule(String),

    #[error("unknown scheduler {0:?}, expected one of lms, euler-ancestral")]
    UnknownScheduler(String),

    #[error("the number of inference steps must be positive")]
    InvalidInferenceSteps,

    #[error("the multistep order must be positive")]
    InvalidOrder,

    #[error("set_timesteps has not been called")]
    TimestepsNotSet,

    #[error("timestep {0} is not part of the current inference schedule")]
    UnknownTimestep(usize),

    #[error("sigma index {index} out of bounds for {len} inference sigmas")]
    SigmaOutOfBounds { index: usize, len: usize },

    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    ScaledLinear,
}

impl FromStr for BetaSchedule {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "scaled_linear" | "scaled-linear" => Ok(Self::ScaledLinear),
            _ => Err(SchedulerError::UnknownBetaSchedule(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionType {
    Epsilon,
    VPrediction,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// The value of beta at the beginning of training.
    pub beta_start: f64,
    /// The value of beta at the end of training.
    pub beta_end: f64,
    /// How beta evolved during training.
    pub beta_schedule: BetaSchedule,
    /// number of diffusion steps used to train the model.
    pub train_timesteps: usize,
    /// prediction type of the scheduler function
    pub prediction_type: PredictionType,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            train_timesteps: 1000,
            prediction_type: PredictionType::Epsilon,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.train_timesteps == 0 {
            return Err(SchedulerError::InvalidConfig(
                "train_timesteps must be positive".to_string(),
            ));
        }
        let (start, end) = (self.beta_start, self.beta_end);
        if !(start.is_finite() && end.is_finite() && 0. < start && start < end && end < 1.) {
            return Err(SchedulerError::InvalidConfig(format!(
                "betas must satisfy 0 < beta_start < beta_end < 1, got {start} and {end}"
            )));
        }
        Ok(())
    }
}

/// The scheduling algorithms available to the denoising loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerKind {
    /// Linear multistep, deterministic.
    #[default]
    Lms,
    /// Euler steps with fresh noise injected at every step.
    EulerAncestral,
}

impl FromStr for SchedulerKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lms" | "lms_discrete" | "lms-discrete" => Ok(Self::Lms),
            "euler_a" | "euler-a" | "euler_ancestral" | "euler-ancestral" => {
                Ok(Self::EulerAncestral)
            }
            _ => Err(SchedulerError::UnknownScheduler(s.to_string())),
        }
    }
}

impl SchedulerKind {
    /// Builds a scheduler of this kind, `seed` drives any noise it injects.
    pub fn build(
        self,
        config: SchedulerConfig,
        seed: u64,
    ) -> Result<Box<dyn Scheduler>, SchedulerError> {
        let scheduler: Box<dyn Scheduler> = match self {
            Self::Lms => Box::new(LmsDiscreteScheduler::new(config)?),
            Self::EulerAncestral => Box::new(EulerAncestralDiscreteScheduler::new(config, seed)?),
        };
        Ok(scheduler)
    }
}

/// This trait represents a scheduler for the diffusion process.
///
/// Schedulers are stateful, `set_timesteps` has to be called before
/// `scale_in_place` or `step`, and the timesteps given to those must be taken
/// verbatim from the returned schedule.
pub trait Scheduler {
    /// Standard deviation of the initial noise distribution.
    fn init_noise_sigma(&self) -> f64;

    /// The current inference timesteps, empty before `set_timesteps`.
    fn timesteps(&self) -> &[usize];

    /// Resizes the schedule to `num_inference_steps`, discarding any previous
    /// step state.
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<&[usize], SchedulerError>;

    /// Scales the denoising model input by `1 / (sigma^2 + 1)^0.5`. This
    /// mutates `sample`.
    fn scale_in_place(&self, sample: &mut FloatTensor, timestep: usize)
        -> Result<(), SchedulerError>;

    /// Computes the previous, less noisy, sample from the model output. The
    /// inputs are left untouched and a new tensor is returned.
    fn step(
        &mut self,
        model_output: &FloatTensor,
        timestep: usize,
        sample: &FloatTensor,
        order: usize,
    ) -> Result<FloatTensor, SchedulerError>;

    /// Noises `original` to the level of `timestep`.
    fn add_noise(
        &self,
        original: &FloatTensor,
        noise: &FloatTensor,
        timestep: usize,
    ) -> Result<FloatTensor, SchedulerError>;
}

/// Evenly spaced values from `start` to `stop`. When `inclusive` is set the
/// last value is exactly `stop`.
pub fn linspace(start: f64, stop: f64, count: usize, inclusive: bool) -> Vec<f64> {
    match count {
        0 => vec![],
        1 => vec![start],
        _ => {
            let divisor = if inclusive { count - 1 } else { count };
            let step = (stop - start) / divisor as f64;
            let mut values: Vec<f64> = (0..count).map(|i| start + i as f64 * step).collect();
            if inclusive {
                values[count - 1] = stop;
            }
            values
        }
    }
}

/// Values `start + i * step` for `i` in `0..ceil((stop - start) / step)`.
pub fn arange(start: f64, stop: f64, step: f64) -> Vec<f64> {
    let count = ((stop - start) / step).ceil();
    if !count.is_finite() || count <= 0. {
        return vec![];
    }
    (0..count as usize).map(|i| start + i as f64 * step).collect()
}

/// One-dimensional linear interpolation for monotonically increasing sample
/// points, mimicking np.interp(). Queries outside of `xp` are clamped to the
/// boundary values. A NaN query yields NaN.
pub fn interp(x: &[f64], xp: &[f64], fp: &[f64]) -> Vec<f64> {
    let n = xp.len().min(fp.len());
    if n == 0 {
        return vec![];
    }
    x.iter()
        .map(|&t| {
            if t.is_nan() {
                return f64::NAN;
            }
            if t <= xp[0] {
                return fp[0];
            }
            if t >= xp[n - 1] {
                return fp[n - 1];
            }
            // xp[hi - 1] <= t < xp[hi]
            let hi = xp[..n].partition_point(|&v| v <= t);
            let lo = hi - 1;
            let w = (t - xp[lo]) / (xp[hi] - xp[lo]);
            fp[lo] + w * (fp[hi] - fp[lo])
        })
        .collect()
}

/// Position of `timestep` in `timesteps`. An absent value is an error, the
/// closest timestep is never substituted.
pub fn find_idx(timesteps: &[usize], timestep: usize) -> Result<usize, SchedulerError> {
    timesteps
        .iter()
        .position(|&t| t == timestep)
        .ok_or(SchedulerError::UnknownTimestep(timestep))
}

pub fn cumprod(values: &[f64]) -> Vec<f64> {
    values
        .iter()
        .scan(1.0, |acc, &v| {
            *acc *= v;
            Some(*acc)
        })
        .collect()
}

/// Square root keeping the sign of its argument, small negative values come
/// from floating point cancellation.
pub fn signed_sqrt(x: f64) -> f64 {
    if x < 0. {
        -x.abs().sqrt()
    } else {
        x.sqrt()
    }
}

/// Noise levels of the training process, fixed once the config is known.
#[derive(Debug, Clone)]
pub struct TrainingSchedule {
    alphas_cumprod: Vec<f64>,
    /// `sqrt((1 - a) / a)` over the reversed cumulative alphas, so index 0
    /// holds the noisiest level.
    initial_sigmas: Vec<f64>,
    init_noise_sigma: f64,
}

impl TrainingSchedule {
    pub fn new(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        let n = config.train_timesteps;
        let betas = match config.beta_schedule {
            BetaSchedule::ScaledLinear => {
                linspace(config.beta_start.sqrt(), config.beta_end.sqrt(), n, true)
                    .into_iter()
                    .map(|b| b * b)
                    .collect::<Vec<_>>()
            }
            BetaSchedule::Linear => linspace(config.beta_start, config.beta_end, n, true),
        };
        let alphas: Vec<f64> = betas.iter().map(|b| 1. - b).collect();
        let alphas_cumprod = cumprod(&alphas);

        let initial_sigmas: Vec<f64> =
            alphas_cumprod.iter().rev().map(|a| ((1. - a) / a).sqrt()).collect();
        let init_noise_sigma = initial_sigmas.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        Ok(Self { alphas_cumprod, initial_sigmas, init_noise_sigma })
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn initial_sigmas(&self) -> &[f64] {
        &self.initial_sigmas
    }

    pub fn init_noise_sigma(&self) -> f64 {
        self.init_noise_sigma
    }

    pub fn train_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }
}

/// The training noise levels resized to a given number of inference steps.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceSchedule {
    timesteps: Vec<usize>,
    /// One entry per timestep plus a trailing zero, `step` reads `i + 1`.
    sigmas: Vec<f64>,
    init_noise_sigma: f64,
}

impl InferenceSchedule {
    pub fn new(
        training: &TrainingSchedule,
        num_inference_steps: usize,
    ) -> Result<Self, SchedulerError> {
        if num_inference_steps == 0 {
            return Err(SchedulerError::InvalidInferenceSteps);
        }
        let train_timesteps = training.train_timesteps();
        let positions = linspace(0., (train_timesteps - 1) as f64, num_inference_steps, true);
        let timesteps: Vec<usize> = positions.iter().rev().map(|&t| t as usize).collect();

        // The training sigmas are stored noisiest first, ascending positions
        // therefore line up with the descending timesteps.
        let range = arange(0., training.initial_sigmas.len() as f64, 1.);
        let mut sigmas = interp(&positions, &range, &training.initial_sigmas);
        sigmas.push(0.0);
        if sigmas.len() != timesteps.len() + 1 {
            return Err(SchedulerError::SigmaOutOfBounds {
                index: timesteps.len(),
                len: sigmas.len(),
            });
        }

        let init_noise_sigma = sigmas.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        debug!(
            "inference schedule with {num_inference_steps} steps, timesteps {:?}..{:?}, init noise sigma {init_noise_sigma}",
            timesteps.first(),
            timesteps.last(),
        );
        Ok(Self { timesteps, sigmas, init_noise_sigma })
    }

    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    pub fn init_noise_sigma(&self) -> f64 {
        self.init_noise_sigma
    }

    pub fn step_index(&self, timestep: usize) -> Result<usize, SchedulerError> {
        find_idx(&self.timesteps, timestep)
    }

    pub fn sigma(&self, index: usize) -> Result<f64, SchedulerError> {
        self.sigmas
            .get(index)
            .copied()
            .ok_or(SchedulerError::SigmaOutOfBounds { index, len: self.sigmas.len() })
    }

    pub(crate) fn scale_in_place(
        &self,
        sample: &mut FloatTensor,
        timestep: usize,
    ) -> Result<(), SchedulerError> {
        let sigma = self.sigma(self.step_index(timestep)?)?;
        sample.scale((1. / (sigma.powi(2) + 1.).sqrt()) as f32);
        Ok(())
    }

    pub(crate) fn add_noise(
        &self,
        original: &FloatTensor,
        noise: &FloatTensor,
        timestep: usize,
    ) -> Result<FloatTensor, SchedulerError> {
        let sigma = self.sigma(self.step_index(timestep)?)? as f32;
        Ok(original.zip_map(noise, |o, n| o + n * sigma)?)
    }
}

/// Predicted fully denoised sample (x_0) from the model output at `sigma`.
pub(crate) fn pred_original_sample(
    prediction_type: PredictionType,
    sample: &FloatTensor,
    model_output: &FloatTensor,
    sigma: f64,
) -> Result<FloatTensor, TensorError> {
    match prediction_type {
        PredictionType::Epsilon => {
            let sigma = sigma as f32;
            sample.zip_map(model_output, |s, m| s - sigma * m)
        }
        PredictionType::VPrediction => {
            let c_out = (-sigma / (sigma.powi(2) + 1.).sqrt()) as f32;
            let c_skip = (1. / (sigma.powi(2) + 1.)) as f32;
            sample.zip_map(model_output, |s, m| m * c_out + s * c_skip)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linspace_endpoints() {
        for n in 2..50 {
            let v = linspace(0.1, 0.9, n, true);
            assert_eq!(v.len(), n);
            assert_eq!(v[0], 0.1);
            assert_eq!(v[n - 1], 0.9);
        }
        assert_eq!(linspace(3., 7., 1, true), vec![3.]);
        assert!(linspace(3., 7., 0, true).is_empty());
        assert_eq!(linspace(0., 1., 4, false), vec![0., 0.25, 0.5, 0.75]);
    }

    #[test]
    fn arange_counts() {
        assert_eq!(arange(0., 4., 1.), vec![0., 1., 2., 3.]);
        assert_eq!(arange(0., 1., 0.3).len(), 4);
        assert!(arange(2., 1., 1.).is_empty());
    }

    #[test]
    fn interp_clamps_and_interpolates() {
        let xp = [0., 1., 2.];
        let fp = [10., 20., 40.];
        let y = interp(&[-1., 0., 0.5, 1., 1.5, 2., 3.], &xp, &fp);
        assert_eq!(y, vec![10., 10., 15., 20., 30., 40., 40.]);
        let y = interp(&[f64::NAN, 0.5], &xp, &fp);
        assert!(y[0].is_nan());
        assert_eq!(y[1], 15.);
    }

    #[test]
    fn find_idx_is_exact() {
        let ts = [999, 749, 499, 249, 0];
        assert_eq!(find_idx(&ts, 499), Ok(2));
        assert_eq!(find_idx(&ts, 500), Err(SchedulerError::UnknownTimestep(500)));
    }

    #[test]
    fn cumprod_and_signed_sqrt() {
        assert_eq!(cumprod(&[0.5, 0.5, 2.0]), vec![0.5, 0.25, 0.5]);
        assert_eq!(signed_sqrt(4.), 2.);
        assert_eq!(signed_sqrt(-4.), -2.);
        assert_eq!(signed_sqrt(0.), 0.);
    }

    #[test]
    fn alphas_cumprod_bounds() {
        for (beta_schedule, train_timesteps) in [
            (BetaSchedule::ScaledLinear, 1000),
            (BetaSchedule::Linear, 1000),
            (BetaSchedule::Linear, 1),
            (BetaSchedule::ScaledLinear, 17),
        ] {
            let config = SchedulerConfig { beta_schedule, train_timesteps, ..Default::default() };
            let training = TrainingSchedule::new(&config).unwrap();
            let a = training.alphas_cumprod();
            assert_eq!(a.len(), train_timesteps);
            assert!(a.iter().all(|&v| v > 0. && v <= 1.));
            assert!(a.windows(2).all(|w| w[1] <= w[0]));
            let s = training.initial_sigmas();
            assert!(s.iter().all(|&v| v >= 0.));
            assert_eq!(training.init_noise_sigma(), s[0]);
        }
    }

    #[test]
    fn invalid_configs() {
        let bad = [
            SchedulerConfig { train_timesteps: 0, ..Default::default() },
            SchedulerConfig { beta_start: 0.0, ..Default::default() },
            SchedulerConfig { beta_start: 0.02, beta_end: 0.01, ..Default::default() },
            SchedulerConfig { beta_end: f64::NAN, ..Default::default() },
        ];
        for config in bad {
            assert!(matches!(
                TrainingSchedule::new(&config),
                Err(SchedulerError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn parse_names() {
        assert_eq!("scaled_linear".parse::<BetaSchedule>(), Ok(BetaSchedule::ScaledLinear));
        assert_eq!("LINEAR".parse::<BetaSchedule>(), Ok(BetaSchedule::Linear));
        assert!(matches!(
            "cosine".parse::<BetaSchedule>(),
            Err(SchedulerError::UnknownBetaSchedule(_))
        ));
        assert_eq!("euler_a".parse::<SchedulerKind>(), Ok(SchedulerKind::EulerAncestral));
        assert_eq!("lms".parse::<SchedulerKind>(), Ok(SchedulerKind::Lms));
        assert!("ddim".parse::<SchedulerKind>().is_err());
    }

    #[test]
    fn inference_schedule_layout() {
        let training = TrainingSchedule::new(&SchedulerConfig::default()).unwrap();
        for n in [1, 2, 5, 30, 50, 1000] {
            let schedule = InferenceSchedule::new(&training, n).unwrap();
            let ts = schedule.timesteps();
            assert_eq!(ts.len(), n);
            assert_eq!(schedule.sigmas().len(), n + 1);
            assert_eq!(*schedule.sigmas().last().unwrap(), 0.0);
            assert!(ts.windows(2).all(|w| w[1] <= w[0]));
            assert!(ts.iter().all(|&t| t <= 999));
            assert!(schedule.sigmas().windows(2).all(|w| w[1] <= w[0]));
        }
        assert_eq!(
            InferenceSchedule::new(&training, 0),
            Err(SchedulerError::InvalidInferenceSteps)
        );
    }

    #[test]
    fn sigma_lookup_is_bounds_checked() {
        let training = TrainingSchedule::new(&SchedulerConfig::default()).unwrap();
        let schedule = InferenceSchedule::new(&training, 3).unwrap();
        assert_eq!(schedule.sigma(3), Ok(0.0));
        assert_eq!(schedule.sigma(4), Err(SchedulerError::SigmaOutOfBounds { index: 4, len: 4 }));
    }
}
