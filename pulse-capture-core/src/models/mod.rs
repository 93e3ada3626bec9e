pub mod audio_models;
pub mod block;
pub mod config;
pub mod error;
pub mod state;
