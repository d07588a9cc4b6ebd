use thiserror::Error;
use tonic::Status;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("RPC error: {0}")]
    RpcError(#[from] Status),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Request denied: {0}")]
    Denied(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
