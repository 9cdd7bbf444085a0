use crate::config::ConfigError;
use identikit_core::{CascadeError, LabelError, LocatorError, StoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("invalid label: {0}")]
    InvalidLabel(#[from] LabelError),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("cascade error: {0}")]
    Cascade(#[from] CascadeError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to start writer thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl From<LocatorError> for EngineError {
    fn from(e: LocatorError) -> Self {
        match e {
            LocatorError::InvalidImage(msg) => EngineError::InvalidImage(msg),
        }
    }
}

impl From<image::ImageError> for EngineError {
    fn from(e: image::ImageError) -> Self {
        EngineError::InvalidImage(e.to_string())
    }
}
