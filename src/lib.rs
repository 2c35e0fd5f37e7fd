//! # Diffusion schedulers
//!
//! Noise schedulers and the denoising loop of latent diffusion models such as
//! Stable Diffusion.
//!
//! This library includes:
//! - An Euler ancestral scheduler, injecting fresh seeded noise at each step.
//! - A linear multistep (LMS) scheduler accumulating a derivative history.
//! - A text-to-image pipeline sequencing the text encoder, the UNet and the
//!   autoencoder, which are provided by the caller.
//!
//! Latents are carried around as [`tensor::FloatTensor`] values, with
//! conversions to and from `tch` tensors when the `torch` feature is enabled.

pub mod pipelines;
pub mod schedulers;
pub mod tensor;
