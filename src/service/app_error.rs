// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::network::ConnectionId;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// lifecycle errors
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("illegal state: {0}")]
    IllegalState(String),

    /// send path outcomes, expected and never fatal to the engine
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("payload of {size} bytes exceeds the limit of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("outbound queue of connection {0} is full")]
    Backpressure(ConnectionId),

    /// protocol violations by a peer, fatal to that connection only
    #[error("frame of length {size} is too large, limit is {max}")]
    FrameTooLarge { size: u64, max: usize },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AppError::FrameTooLarge { size: 2048, max: 1024 };
        assert_eq!(
            err.to_string(),
            "frame of length 2048 is too large, limit is 1024"
        );
        assert_eq!(
            AppError::UnknownConnection(42).to_string(),
            "unknown connection: 42"
        );
    }
}
