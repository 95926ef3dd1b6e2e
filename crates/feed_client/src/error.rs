use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid base_url: {0}")]
    InvalidBaseUrl(String),
}
