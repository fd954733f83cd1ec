use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("invalid interval expression: {0:?}")]
    InvalidInterval(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
