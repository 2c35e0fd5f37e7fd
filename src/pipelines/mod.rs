//! # Pipelines

pub mod stable_diffusion;
