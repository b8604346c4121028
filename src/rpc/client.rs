//! RPC client used by the CLI subcommands.

use std::net::SocketAddr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::protocol::{Request, Response, RpcError};

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RpcClient {
    addr: SocketAddr,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to mirsd at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("communication error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode request or decode response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon closed the connection without responding")]
    Closed,

    #[error("daemon did not respond within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("{} (code {})", .0.message, .0.code)]
    Rpc(RpcError),
}

impl ClientError {
    /// The JSON-RPC error code, if the daemon answered with an error.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Rpc(e) => Some(e.code),
            _ => None,
        }
    }
}

impl RpcClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Call an RPC method and decode its result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        tokio::time::timeout(CALL_TIMEOUT, self.round_trip(method, params))
            .await
            .map_err(|_| ClientError::Timeout(CALL_TIMEOUT))?
    }

    pub async fn call_no_params<T: DeserializeOwned>(&self, method: &str) -> Result<T, ClientError> {
        self.call(method, None).await
    }

    async fn round_trip<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let mut stream = TcpStream::connect(self.addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: self.addr,
                source,
            })?;

        let request = Request::new(method, params, 1);

        let mut request_json = serde_json::to_string(&request)?;
        request_json.push('\n');
        stream.write_all(request_json.as_bytes()).await?;

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        if reader.read_line(&mut response_line).await? == 0 {
            return Err(ClientError::Closed);
        }

        let response: Response = serde_json::from_str(&response_line)?;
        if let Some(error) = response.error {
            return Err(ClientError::Rpc(error));
        }

        let result = response.result.unwrap_or(Value::Null);
        Ok(serde_json::from_value(result)?)
    }
}
