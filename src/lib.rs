//! melobot: the core of a multi-source music streaming service that fronts
//! a chat platform's voice channels.
//!
//! Queries resolve through pluggable sources, audio lands in a
//! content-addressed disk cache, and a per-guild state machine drives the
//! queue against a voice transport. The chat adapter and the audio extractor
//! are external collaborators behind the [`orchestrator::VoiceTransport`]
//! and [`extractor::AudioExtractor`] traits.

pub mod cache;
pub mod config;
pub mod error;
pub mod extractor;
pub mod models;
pub mod orchestrator;
pub mod player;
pub mod playlist_import;
pub mod queue;
pub mod sources;
pub mod store;
pub mod utils;

pub use config::Config;
pub use error::{MeloError, Result};
