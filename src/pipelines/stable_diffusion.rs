//! The text-to-image denoising loop.
//!
//! The neural networks are supplied by the caller through the collaborator
//! traits below, this module only sequences them around a [`Scheduler`].
use crate::schedulers::{Scheduler, SchedulerConfig, SchedulerError, SchedulerKind};
use crate::tensor::{FloatTensor, TensorError};
use anyhow::Context;
use log::{debug, info};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Number of channels in the latent space of the autoencoder.
pub const LATENT_CHANNELS: usize = 4;
/// Scaling factor applied by the autoencoder to its latents.
pub const VAE_SCALE: f32 = 0.18215;
/// Order given to the multistep schedulers.
pub const LMS_ORDER: usize = 4;

/// Text encoder, usually a CLIP variant.
pub trait TextEmbedder {
    /// Embeds `text` repeated `batch_size` times, the result has a leading
    /// batch dimension of `batch_size`.
    fn embed(&self, text: &str, batch_size: usize) -> anyhow::Result<FloatTensor>;
}

/// The UNet predicting the noise contained in a latent.
pub trait NoisePredictor {
    fn predict(
        &self,
        latent_input: &FloatTensor,
        timestep: usize,
        text_embeddings: &FloatTensor,
    ) -> anyhow::Result<FloatTensor>;
}

/// Autoencoder decoder, from latents to pixels in `[-1, 1]`.
pub trait LatentDecoder {
    fn decode(&self, latents: &FloatTensor) -> anyhow::Result<FloatTensor>;
}

/// Content classifier run on the decoded images, one verdict per batch entry.
pub trait SafetyChecker {
    fn check(&self, images: &FloatTensor) -> anyhow::Result<Vec<bool>>;
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("invalid generation request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Tensor(#[from] TensorError),

    #[error("model inference failed")]
    Inference(#[source] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Text the image should not contain, only used with guidance.
    pub negative_prompt: String,
    pub steps: usize,
    /// Strength of the classifier-free guidance, disabled below 1.
    pub guidance_scale: f64,
    pub batch_size: usize,
    pub height: usize,
    pub width: usize,
    /// Seeds both the initial latents and the scheduler noise.
    pub seed: u64,
    pub scheduler: SchedulerKind,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            steps: 30,
            guidance_scale: 7.5,
            batch_size: 1,
            height: 512,
            width: 512,
            seed: 42,
            scheduler: SchedulerKind::default(),
        }
    }
}

impl GenerationRequest {
    pub fn guided(&self) -> bool {
        self.guidance_scale >= 1.0
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.batch_size == 0 {
            return Err(PipelineError::InvalidRequest("batch size must be positive".into()));
        }
        if self.height == 0 || self.width == 0 || self.height % 8 != 0 || self.width % 8 != 0 {
            return Err(PipelineError::InvalidRequest(format!(
                "height and width must be positive multiples of 8, got {}x{}",
                self.height, self.width
            )));
        }
        Ok(())
    }

    fn latent_shape(&self) -> [usize; 4] {
        [self.batch_size, LATENT_CHANNELS, self.height / 8, self.width / 8]
    }
}

#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Decoded images, batch first.
    pub images: FloatTensor,
    /// Safety verdict per image, all true without a checker.
    pub is_valid: Vec<bool>,
    /// The timesteps the loop went through.
    pub timesteps: Vec<usize>,
}

pub struct StableDiffusionPipeline<E, U, D> {
    embedder: E,
    unet: U,
    vae: D,
    safety: Option<Box<dyn SafetyChecker>>,
    pub scheduler_config: SchedulerConfig,
}

impl<E: TextEmbedder, U: NoisePredictor, D: LatentDecoder> StableDiffusionPipeline<E, U, D> {
    pub fn new(embedder: E, unet: U, vae: D) -> Self {
        Self { embedder, unet, vae, safety: None, scheduler_config: Default::default() }
    }

    pub fn with_safety_checker(mut self, safety: Box<dyn SafetyChecker>) -> Self {
        self.safety = Some(safety);
        self
    }

    fn text_embeddings(&self, request: &GenerationRequest) -> anyhow::Result<FloatTensor> {
        let text = self.embedder.embed(&request.prompt, request.batch_size)?;
        if !request.guided() {
            info!("generating image for {:?}, without guidance", request.prompt);
            return Ok(text);
        }
        let uncond_text = request.negative_prompt.trim();
        if uncond_text.is_empty() {
            info!("generating image for {:?}, with guidance", request.prompt);
        } else {
            info!(
                "generating image for {:?}, with negative text {:?}",
                request.prompt, request.negative_prompt
            );
        }
        let uncond = self.embedder.embed(uncond_text, request.batch_size)?;
        Ok(FloatTensor::cat(&[&uncond, &text])?)
    }

    /// Runs the full denoising loop, `progress` is called after each step
    /// with the index of the step that completed.
    pub fn generate<F: FnMut(usize)>(
        &self,
        request: &GenerationRequest,
        mut progress: F,
    ) -> Result<GenerationOutput, PipelineError> {
        request.validate()?;
        let text_embeddings = self
            .text_embeddings(request)
            .context("text embedding")
            .map_err(PipelineError::Inference)?;
        debug!("text embeddings {:?}", text_embeddings.shape());

        let mut rng = StdRng::seed_from_u64(request.seed);
        let mut scheduler = request.scheduler.build(self.scheduler_config.clone(), rng.gen())?;
        let timesteps = scheduler.set_timesteps(request.steps)?.to_vec();

        let mut latents = FloatTensor::randn(&request.latent_shape(), &mut rng);
        latents.scale(scheduler.init_noise_sigma() as f32);

        for (step_index, &timestep) in timesteps.iter().enumerate() {
            debug!("step {step_index} timestep {timestep}");
            latents = self.denoise_step(
                &mut *scheduler,
                request,
                &latents,
                timestep,
                &text_embeddings,
            )?;
            progress(step_index);
        }
        info!("generated latents");

        latents.scale(1. / VAE_SCALE);
        let images =
            self.vae.decode(&latents).context("vae decoding").map_err(PipelineError::Inference)?;
        let is_valid = match &self.safety {
            Some(safety) => {
                let verdicts = safety
                    .check(&images)
                    .context("safety checking")
                    .map_err(PipelineError::Inference)?;
                if verdicts.len() != request.batch_size {
                    return Err(PipelineError::Inference(anyhow::anyhow!(
                        "safety checker returned {} verdicts for {} images",
                        verdicts.len(),
                        request.batch_size
                    )));
                }
                info!("safety checker verdicts {verdicts:?}");
                verdicts
            }
            None => vec![true; request.batch_size],
        };
        info!("generated images");
        Ok(GenerationOutput { images, is_valid, timesteps })
    }

    fn denoise_step(
        &self,
        scheduler: &mut dyn Scheduler,
        request: &GenerationRequest,
        latents: &FloatTensor,
        timestep: usize,
        text_embeddings: &FloatTensor,
    ) -> Result<FloatTensor, PipelineError> {
        let mut latent_model_input = if request.guided() {
            FloatTensor::cat(&[latents, latents])?
        } else {
            latents.clone()
        };
        scheduler.scale_in_place(&mut latent_model_input, timestep)?;

        let noise_pred = self
            .unet
            .predict(&latent_model_input, timestep, text_embeddings)
            .with_context(|| format!("unet at timestep {timestep}"))
            .map_err(PipelineError::Inference)?;

        let noise_pred = if request.guided() {
            let chunks = noise_pred.chunk(2)?;
            let (noise_pred_uncond, noise_pred_text) = (&chunks[0], &chunks[1]);
            let guidance = request.guidance_scale as f32;
            noise_pred_uncond.zip_map(noise_pred_text, |u, t| u + (t - u) * guidance)?
        } else {
            noise_pred
        };

        Ok(scheduler.step(&noise_pred, timestep, latents, LMS_ORDER)?)
    }
}
