use std::fmt;

#[derive(Debug)]
pub enum PriceAlarmSDKError {
    Serialization(String),
    Store(String),      // StateStore 拉取/推送错误
    Cache(String),      // sled 本地缓存错误
    IO(String),
    InvalidData(String),
    NotFound(String),
    InvalidOperation(String),
    ShuttingDown(String),
}

impl fmt::Display for PriceAlarmSDKError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceAlarmSDKError::Serialization(e) => write!(f, "Serialization error: {}", e),
            PriceAlarmSDKError::Store(e) => write!(f, "State store error: {}", e),
            PriceAlarmSDKError::Cache(e) => write!(f, "Cache error: {}", e),
            PriceAlarmSDKError::IO(e) => write!(f, "IO error: {}", e),
            PriceAlarmSDKError::InvalidData(e) => write!(f, "Invalid data: {}", e),
            PriceAlarmSDKError::NotFound(e) => write!(f, "Not found: {}", e),
            PriceAlarmSDKError::InvalidOperation(e) => write!(f, "Invalid operation: {}", e),
            PriceAlarmSDKError::ShuttingDown(e) => write!(f, "Shutting down: {}", e),
        }
    }
}

impl std::error::Error for PriceAlarmSDKError {}

impl From<serde_json::Error> for PriceAlarmSDKError {
    fn from(error: serde_json::Error) -> Self {
        PriceAlarmSDKError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for PriceAlarmSDKError {
    fn from(error: std::io::Error) -> Self {
        PriceAlarmSDKError::IO(error.to_string())
    }
}

impl From<sled::Error> for PriceAlarmSDKError {
    fn from(error: sled::Error) -> Self {
        PriceAlarmSDKError::Cache(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PriceAlarmSDKError>;
