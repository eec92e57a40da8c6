use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use installer_proto::{
    abort_path, execute_path, shutdown_path, AbortRequest, AbortResponse, Error, ExecuteRequest,
    FrameDecoder, Message, ProgressMessage, ShutdownRequest, ShutdownResponse, CONTENT_TYPE,
};
use reqwest::{header, Client};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{AgentError, Result};
use crate::server::AgentIdentity;

/// Coordinator-side client of one agent.
pub struct AgentClient {
    base_url: String,
    client: Client,
    timeout: Option<Duration>,
}

impl AgentClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            timeout: None,
        }
    }

    /// Client for the agent on `host` listening on `port`.
    ///
    /// `host` is an IP address (IPv6 gets bracketed) or a host name.
    pub fn for_host(host: &str, port: u16) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => Self::new(format!("http://{}", SocketAddr::new(ip, port))),
            Err(_) => Self::new(format!("http://{}:{}", host, port)),
        }
    }

    /// Timeout applied to unary calls. Execute streams are never timed out.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn identity(&self) -> Result<AgentIdentity> {
        let mut request = self.client.get(format!("{}/health", self.base_url));
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        let response = Self::check_status(request.send().await?).await?;
        Ok(response.json().await?)
    }

    /// Opens an Execute stream.
    pub async fn execute(&self) -> Result<ExecuteStream> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, execute_path()))
            .header(header::CONTENT_TYPE, CONTENT_TYPE)
            .body(ExecuteRequest::default().encode_to_bytes())
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        debug!(agent = %self.base_url, "Execute stream opened");
        Ok(ExecuteStream {
            body: response.bytes_stream().boxed(),
            decoder: FrameDecoder::new(),
        })
    }

    pub async fn shutdown(&self) -> Result<()> {
        let _: ShutdownResponse = self
            .unary(&shutdown_path(), &ShutdownRequest::default())
            .await?;
        Ok(())
    }

    /// Aborts the agent's operation. Returns the error the agent's cleanup
    /// reported, if any.
    pub async fn abort(&self) -> Result<Option<Error>> {
        let response: AbortResponse = self.unary(&abort_path(), &AbortRequest::default()).await?;
        Ok(response.error)
    }

    async fn unary<Req: Message, Resp: Message>(&self, path: &str, request: &Req) -> Result<Resp> {
        let mut builder = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header(header::CONTENT_TYPE, CONTENT_TYPE)
            .body(request.encode_to_bytes());
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        let response = Self::check_status(builder.send().await?).await?;
        let body = response.bytes().await?;
        Ok(Resp::decode(&body)?)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AgentError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

/// Progress messages of an open Execute call.
pub struct ExecuteStream {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: FrameDecoder,
}

impl ExecuteStream {
    /// Next message, or `None` when the agent closed the stream.
    pub async fn next_message(&mut self) -> Result<Option<ProgressMessage>> {
        loop {
            if let Some(progress) = self.decoder.next_frame()? {
                return Ok(Some(progress));
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.decoder.extend(&chunk),
                Some(Err(e)) => {
                    return Err(AgentError::Indeterminate(format!("connection lost: {}", e)))
                }
                None if self.decoder.has_partial() => {
                    return Err(AgentError::Indeterminate(
                        "stream ended in the middle of a message".to_string(),
                    ))
                }
                None => return Ok(None),
            }
        }
    }

    /// Reads the stream until the agent reports completion.
    ///
    /// Every message is handed to `on_progress`. Succeeds only if a
    /// `complete` message arrived and no message carried errors. Errors from
    /// all messages are collected. Cancelling closes the stream, which makes
    /// the agent abort its work.
    pub async fn wait<F>(mut self, cancel: &CancellationToken, mut on_progress: F) -> Result<()>
    where
        F: FnMut(&ProgressMessage),
    {
        let mut errors = Vec::new();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                next = self.next_message() => next?,
            };
            let Some(progress) = next else {
                return Err(AgentError::Indeterminate(
                    "stream closed before the operation completed".to_string(),
                ));
            };

            on_progress(&progress);
            errors.extend(progress.errors.iter().map(|e| e.message.clone()));
            if progress.complete {
                break;
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AgentError::Execution { errors })
        }
    }
}
