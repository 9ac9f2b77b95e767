//! Real byte-serial transport, built on `tokio-serial`.
//!
//! Adapted from the teacher's `SerialAdapter` (which wrapped the synchronous
//! `serialport` crate on a `spawn_blocking` thread): since the whole session layer
//! is tokio-native here, we use the async `tokio-serial` port directly instead of
//! bridging a blocking API, but keep the same line-terminator/response-delimiter
//! framing and read-with-timeout loop.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::error::{AppResult, ControllerError};

use super::Transport;

/// Framing applied around every request/response exchange.
pub struct SerialTransport {
    port: SerialStream,
    line_terminator: String,
    response_delimiter: u8,
}

impl SerialTransport {
    pub fn open(port_name: &str, baud_rate: u32) -> AppResult<Self> {
        let port = tokio_serial::new(port_name, baud_rate)
            .open_native_async()
            .map_err(|e| {
                ControllerError::Transport(format!("failed to open serial port {port_name}: {e}"))
            })?;
        Ok(Self {
            port,
            line_terminator: "\r\n".to_string(),
            response_delimiter: b'\n',
        })
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send(&mut self, request: &str, timeout: Duration) -> AppResult<String> {
        let command = format!("{request}{}", self.line_terminator);
        self.port
            .write_all(command.as_bytes())
            .await
            .map_err(|e| ControllerError::Transport(format!("serial write failed: {e}")))?;

        let delimiter = self.response_delimiter;
        let read_future = async {
            let mut response = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                let n = self.port.read(&mut byte).await.map_err(|e| {
                    ControllerError::Transport(format!("serial read failed: {e}"))
                })?;
                if n == 0 {
                    return Err(ControllerError::Transport(
                        "unexpected EOF from serial port".into(),
                    ));
                }
                if byte[0] == delimiter {
                    break;
                }
                response.push(byte[0]);
            }
            Ok(String::from_utf8_lossy(&response).trim().to_string())
        };

        tokio::time::timeout(timeout, read_future).await?
    }
}
