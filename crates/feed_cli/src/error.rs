use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("client error: {0}")]
    Client(#[from] feed_client::ClientError),
    #[error("feed error: {0}")]
    Feed(#[from] feed_engine::FeedError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid timezone: {0}")]
    Timezone(String),
}
