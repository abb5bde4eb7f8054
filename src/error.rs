use std::fmt;

#[derive(Debug)]
pub enum GatewayError {
    Decompress(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Decompress(msg) => write!(f, "body decompression error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}
