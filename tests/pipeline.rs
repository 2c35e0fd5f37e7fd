use sd_schedulers::pipelines::stable_diffusion::{
    GenerationRequest, LatentDecoder, NoisePredictor, PipelineError, SafetyChecker,
    StableDiffusionPipeline, TextEmbedder,
};
use sd_schedulers::schedulers::{SchedulerError, SchedulerKind};
use sd_schedulers::tensor::FloatTensor;
use std::cell::RefCell;
use std::rc::Rc;

const EMBED_DIM: usize = 8;

/// Embeds a text as its length, so the unconditional row is recognizable.
struct LengthEmbedder {
    calls: Calls,
}

impl TextEmbedder for LengthEmbedder {
    fn embed(&self, text: &str, batch_size: usize) -> anyhow::Result<FloatTensor> {
        self.calls.borrow_mut().push(text.to_string());
        let data = vec![text.len() as f32; batch_size * EMBED_DIM];
        Ok(FloatTensor::from_vec(data, &[batch_size, EMBED_DIM])?)
    }
}

/// Predicts a fraction of its input, records the shapes and timesteps seen.
struct FakeUnet {
    seen: Seen,
    fail_at: Option<usize>,
}

impl NoisePredictor for FakeUnet {
    fn predict(
        &self,
        latent_input: &FloatTensor,
        timestep: usize,
        text_embeddings: &FloatTensor,
    ) -> anyhow::Result<FloatTensor> {
        if self.fail_at == Some(timestep) {
            anyhow::bail!("out of memory");
        }
        self.seen.borrow_mut().push((
            timestep,
            latent_input.shape().to_vec(),
            text_embeddings.shape().to_vec(),
        ));
        let mut out = latent_input.clone();
        out.scale(0.5);
        Ok(out)
    }
}

struct IdentityDecoder;

impl LatentDecoder for IdentityDecoder {
    fn decode(&self, latents: &FloatTensor) -> anyhow::Result<FloatTensor> {
        Ok(latents.clone())
    }
}

struct NoVerdicts;

impl SafetyChecker for NoVerdicts {
    fn check(&self, _images: &FloatTensor) -> anyhow::Result<Vec<bool>> {
        Ok(vec![])
    }
}

struct RejectFirst;

impl SafetyChecker for RejectFirst {
    fn check(&self, images: &FloatTensor) -> anyhow::Result<Vec<bool>> {
        Ok((0..images.shape()[0]).map(|i| i != 0).collect())
    }
}

type Seen = Rc<RefCell<Vec<(usize, Vec<usize>, Vec<usize>)>>>;
type Calls = Rc<RefCell<Vec<String>>>;
type FakePipeline = StableDiffusionPipeline<LengthEmbedder, FakeUnet, IdentityDecoder>;

fn pipeline(fail_at: Option<usize>) -> (FakePipeline, Calls, Seen) {
    let calls = Rc::new(RefCell::new(vec![]));
    let seen = Rc::new(RefCell::new(vec![]));
    let pipeline = StableDiffusionPipeline::new(
        LengthEmbedder { calls: calls.clone() },
        FakeUnet { seen: seen.clone(), fail_at },
        IdentityDecoder,
    );
    (pipeline, calls, seen)
}

fn request(scheduler: SchedulerKind) -> GenerationRequest {
    GenerationRequest {
        prompt: "a rusty robot".to_string(),
        steps: 6,
        height: 32,
        width: 16,
        batch_size: 2,
        seed: 42,
        scheduler,
        ..Default::default()
    }
}

#[test]
fn guided_loop_follows_the_schedule() {
    let (pipeline, calls, seen) = pipeline(None);
    let mut progress = vec![];
    let output =
        pipeline.generate(&request(SchedulerKind::EulerAncestral), |i| progress.push(i)).unwrap();

    assert_eq!(progress, (0..6).collect::<Vec<_>>());
    assert_eq!(output.timesteps.len(), 6);
    assert_eq!(output.timesteps[0], 999);
    assert_eq!(*calls.borrow(), vec!["a rusty robot".to_string(), String::new()]);

    let seen = seen.borrow();
    let timesteps: Vec<usize> = seen.iter().map(|(t, _, _)| *t).collect();
    assert_eq!(timesteps, output.timesteps);
    for (_, latent_shape, embedding_shape) in seen.iter() {
        assert_eq!(latent_shape, &vec![4, 4, 4, 2]);
        assert_eq!(embedding_shape, &vec![4, EMBED_DIM]);
    }
    assert_eq!(output.images.shape(), &[2, 4, 4, 2]);
    assert_eq!(output.is_valid, vec![true, true]);
    assert!(output.images.data().iter().all(|v| v.is_finite()));
}

#[test]
fn unguided_loop_embeds_once() {
    let (pipeline, calls, seen) = pipeline(None);
    let request = GenerationRequest { guidance_scale: 0.5, ..request(SchedulerKind::Lms) };
    pipeline.generate(&request, |_| {}).unwrap();
    assert_eq!(calls.borrow().len(), 1);
    assert!(seen.borrow().iter().all(|(_, shape, _)| shape[0] == 2));
}

#[test]
fn negative_prompt_replaces_the_unconditional_text() {
    let (pipeline, calls, _) = pipeline(None);
    let request =
        GenerationRequest { negative_prompt: "blurry".to_string(), ..request(SchedulerKind::Lms) };
    pipeline.generate(&request, |_| {}).unwrap();
    assert_eq!(calls.borrow()[1], "blurry");
}

#[test]
fn generation_is_reproducible() {
    for kind in [SchedulerKind::Lms, SchedulerKind::EulerAncestral] {
        let (a, _, _) = pipeline(None);
        let (b, _, _) = pipeline(None);
        let out_a = a.generate(&request(kind), |_| {}).unwrap();
        let out_b = b.generate(&request(kind), |_| {}).unwrap();
        assert_eq!(out_a.images, out_b.images);

        let other_seed = GenerationRequest { seed: 7, ..request(kind) };
        let out_c = a.generate(&other_seed, |_| {}).unwrap();
        assert_ne!(out_a.images, out_c.images);
    }
}

#[test]
fn safety_verdicts_are_reported() {
    let (pipeline, _, _) = pipeline(None);
    let pipeline = pipeline.with_safety_checker(Box::new(RejectFirst));
    let output = pipeline.generate(&request(SchedulerKind::Lms), |_| {}).unwrap();
    assert_eq!(output.is_valid, vec![false, true]);
}

#[test]
fn missing_safety_verdicts_fail() {
    let (pipeline, _, _) = pipeline(None);
    let pipeline = pipeline.with_safety_checker(Box::new(NoVerdicts));
    let err = pipeline.generate(&request(SchedulerKind::Lms), |_| {}).unwrap_err();
    match err {
        PipelineError::Inference(source) => {
            assert!(format!("{source}").contains("0 verdicts for 2 images"), "{source}");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn model_failures_are_wrapped() {
    let (pipeline, _, _) = pipeline(Some(999));
    let mut progress = 0;
    let err = pipeline.generate(&request(SchedulerKind::Lms), |_| progress += 1).unwrap_err();
    match err {
        PipelineError::Inference(source) => {
            assert!(format!("{source:#}").contains("out of memory"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(progress, 0);
}

#[test]
fn invalid_requests_fail_fast() {
    let (pipeline, calls, _) = pipeline(None);
    let odd_size = GenerationRequest { height: 30, ..request(SchedulerKind::Lms) };
    assert!(matches!(
        pipeline.generate(&odd_size, |_| {}),
        Err(PipelineError::InvalidRequest(_))
    ));
    assert!(calls.borrow().is_empty());

    let no_steps = GenerationRequest { steps: 0, ..request(SchedulerKind::Lms) };
    assert!(matches!(
        pipeline.generate(&no_steps, |_| {}),
        Err(PipelineError::Scheduler(SchedulerError::InvalidInferenceSteps))
    ));
}
