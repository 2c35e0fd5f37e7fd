// Runs the denoising loop with small analytic stand-ins for the text encoder,
// the UNet and the autoencoder. This exercises the schedulers end to end
// without any model weights:
//
//   RUST_LOG=debug cargo run --example synthetic-denoise --features clap -- --scheduler euler-a
use clap::Parser;
use sd_schedulers::pipelines::stable_diffusion::{
    GenerationRequest, LatentDecoder, NoisePredictor, StableDiffusionPipeline, TextEmbedder,
};
use sd_schedulers::schedulers::SchedulerKind;
use sd_schedulers::tensor::FloatTensor;

const EMBED_DIM: usize = 16;

struct ByteEmbedder;

impl TextEmbedder for ByteEmbedder {
    fn embed(&self, text: &str, batch_size: usize) -> anyhow::Result<FloatTensor> {
        let mut row = vec![0f32; EMBED_DIM];
        for (i, b) in text.bytes().enumerate() {
            row[i % EMBED_DIM] += b as f32 / 255.;
        }
        let data = row.iter().copied().cycle().take(batch_size * EMBED_DIM).collect();
        Ok(FloatTensor::from_vec(data, &[batch_size, EMBED_DIM])?)
    }
}

/// Treats the data distribution as a point mass at the embedding mean, the
/// exact noise prediction is then proportional to the distance to that mean.
struct PointMassUnet;

impl NoisePredictor for PointMassUnet {
    fn predict(
        &self,
        latent_input: &FloatTensor,
        _timestep: usize,
        text_embeddings: &FloatTensor,
    ) -> anyhow::Result<FloatTensor> {
        let embeddings = text_embeddings.data();
        let target = embeddings.iter().sum::<f32>() / embeddings.len().max(1) as f32;
        let data = latent_input.data().iter().map(|v| v - target * 0.1).collect();
        Ok(FloatTensor::from_vec(data, latent_input.shape())?)
    }
}

struct ClampDecoder;

impl LatentDecoder for ClampDecoder {
    fn decode(&self, latents: &FloatTensor) -> anyhow::Result<FloatTensor> {
        let data = latents.data().iter().map(|v| v.clamp(-1., 1.)).collect();
        Ok(FloatTensor::from_vec(data, latents.shape())?)
    }
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The prompt to be used for image generation.
    #[arg(long, default_value = "A rusty robot holding a fire torch in its hand")]
    prompt: String,

    /// Text the image should not contain.
    #[arg(long, default_value = "")]
    negative_prompt: String,

    /// The scheduling algorithm, lms or euler-ancestral.
    #[arg(long, default_value = "lms")]
    scheduler: SchedulerKind,

    /// The number of steps to run the diffusion for.
    #[arg(long, default_value_t = 30)]
    n_steps: usize,

    /// The strength of the classifier-free guidance.
    #[arg(long, default_value_t = 7.5)]
    guidance_scale: f64,

    /// The height in pixels of the generated image.
    #[arg(long, default_value_t = 512)]
    height: usize,

    /// The width in pixels of the generated image.
    #[arg(long, default_value_t = 512)]
    width: usize,

    /// The random seed, fixing it reproduces the same output.
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let pipeline = StableDiffusionPipeline::new(ByteEmbedder, PointMassUnet, ClampDecoder);
    let request = GenerationRequest {
        prompt: args.prompt,
        negative_prompt: args.negative_prompt,
        steps: args.n_steps,
        guidance_scale: args.guidance_scale,
        batch_size: 1,
        height: args.height,
        width: args.width,
        seed: args.seed,
        scheduler: args.scheduler,
    };

    let output = pipeline.generate(&request, |step| {
        log::info!("step {}/{}", step + 1, request.steps);
    })?;

    let data = output.images.data();
    let mean = data.iter().sum::<f32>() / data.len() as f32;
    let var = data.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / data.len() as f32;
    println!("timesteps: {:?}", output.timesteps);
    println!("output {:?}, mean {mean:.4}, std {:.4}", output.images.shape(), var.sqrt());
    Ok(())
}
