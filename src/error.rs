use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShimError {
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to create config directory: {0}")]
    ConfigDirCreate(std::io::Error),

    #[error("Invalid upstream URL '{url}': {source}")]
    InvalidUpstreamUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Failed to read instructions file {path}: {source}")]
    InstructionsRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid tool prefix '{prefix}': {reason}")]
    InvalidToolPrefix { prefix: String, reason: String },

    #[error("Request body is not a JSON object: {0}")]
    BodyParse(#[from] serde_json::Error),
}

pub type Result<T, E = ShimError> = std::result::Result<T, E>;
