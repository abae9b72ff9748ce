use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use reqwest::{header, Client as HttpClient, Url};
use std::collections::HashMap;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{LinesStream, ReceiverStream};
use tracing::{debug, warn};

use crate::error::ConnectionError;
use crate::mcp::protocol::SseDecoder;
use crate::mcp::types::TransportSpec;

/// Inbound frames, one JSON-RPC message per item.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ConnectionError>> + Send>>;

/// Outbound half of a transport.
pub enum FrameWriter {
    /// Newline-delimited JSON written to a byte stream (child stdin).
    Lines(Box<dyn AsyncWrite + Send + Unpin>),
    /// Each frame POSTed to the endpoint announced on the event stream.
    Post { client: HttpClient, endpoint: Url },
}

impl FrameWriter {
    pub async fn send(&mut self, server: &str, frame: &str) -> Result<(), ConnectionError> {
        match self {
            Self::Lines(writer) => {
                let io_err = |e: std::io::Error| ConnectionError::transport(server, e.to_string());
                writer.write_all(frame.as_bytes()).await.map_err(io_err)?;
                writer.write_all(b"\n").await.map_err(io_err)?;
                writer.flush().await.map_err(io_err)
            }
            Self::Post { client, endpoint } => {
                let response = client
                    .post(endpoint.clone())
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(frame.to_string())
                    .send()
                    .await
                    .map_err(|e| ConnectionError::transport(server, e.to_string()))?;

                let status = response.status();
                if !status.is_success() {
                    return Err(ConnectionError::transport(
                        server,
                        format!("message endpoint answered {}", status),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Owns whatever keeps a transport alive. Dropping it kills the process or
/// aborts the background task, so every exit path releases the resource.
#[derive(Default)]
pub struct TransportGuard {
    process: Option<Child>,
    task: Option<JoinHandle<()>>,
}

impl TransportGuard {
    pub fn process(child: Child) -> Self {
        Self {
            process: Some(child),
            task: None,
        }
    }

    pub fn task(task: JoinHandle<()>) -> Self {
        Self {
            process: None,
            task: Some(task),
        }
    }

    /// Asks a child process to terminate (its stdin has already been closed)
    /// and waits up to `grace` for it to exit before killing it.
    pub async fn shutdown(mut self, server: &str, grace: Duration) {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let Some(mut child) = self.process.take() else {
            return;
        };
        terminate(server, &child);

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => debug!("[{}] Process exited with {}", server, status),
            Ok(Err(e)) => warn!("[{}] Failed to wait for process: {}", server, e),
            Err(_) => {
                warn!("[{}] Process did not exit within {:?}, killing", server, grace);
                if let Err(e) = child.kill().await {
                    warn!("[{}] Failed to kill process: {}", server, e);
                }
            }
        }
    }
}

#[cfg(unix)]
fn terminate(server: &str, child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!("[{}] SIGTERM to {} failed: {}", server, pid, e);
    }
}

#[cfg(not(unix))]
fn terminate(_server: &str, _child: &Child) {}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
        if let Some(process) = &mut self.process {
            let _ = process.start_kill();
        }
    }
}

pub struct Transport {
    pub frames: FrameStream,
    pub writer: FrameWriter,
    pub guard: TransportGuard,
}

impl Transport {
    /// Line-framed transport over any byte stream pair.
    pub fn from_io<R, W>(server: &str, reader: R, writer: W, guard: TransportGuard) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let server = server.to_string();
        let frames = LinesStream::new(BufReader::new(reader).lines())
            .map(move |line| line.map_err(|e| ConnectionError::transport(&server, e.to_string())));

        Self {
            frames: Box::pin(frames),
            writer: FrameWriter::Lines(Box::new(writer)),
            guard,
        }
    }
}

/// Opens a fresh transport to one downstream server. Called once per
/// connection attempt, including reconnects.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, server: &str) -> Result<Transport, ConnectionError>;

    fn kind(&self) -> &'static str;
}

pub fn connector_for(
    spec: &TransportSpec,
    http_client: &HttpClient,
    handshake_timeout: Duration,
) -> Box<dyn Connector> {
    match spec {
        TransportSpec::Stdio { command, args, env } => Box::new(StdioConnector {
            command: command.clone(),
            args: args.clone(),
            env: env.clone(),
        }),
        TransportSpec::Sse { url } => Box::new(SseConnector {
            client: http_client.clone(),
            url: url.clone(),
            endpoint_timeout: handshake_timeout,
        }),
    }
}

pub struct StdioConnector {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

#[async_trait]
impl Connector for StdioConnector {
    async fn open(&self, server: &str) -> Result<Transport, ConnectionError> {
        let mut parts = self.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| ConnectionError::transport(server, "empty command"))?;

        let mut process_cmd = Command::new(program);
        process_cmd.args(parts);
        process_cmd.args(&self.args);
        process_cmd.stdin(Stdio::piped());
        process_cmd.stdout(Stdio::piped());
        process_cmd.stderr(Stdio::piped());
        process_cmd.kill_on_drop(true);

        for (key, value) in &self.env {
            if !value.is_empty() {
                process_cmd.env(key, value);
            }
        }

        let mut process = process_cmd.spawn().map_err(|e| {
            ConnectionError::transport(server, format!("failed to spawn '{}': {}", program, e))
        })?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| ConnectionError::transport(server, "failed to capture stdin"))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| ConnectionError::transport(server, "failed to capture stdout"))?;

        if let Some(stderr) = process.stderr.take() {
            let name = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{}] stderr: {}", name, line);
                }
            });
        }

        Ok(Transport::from_io(
            server,
            stdout,
            stdin,
            TransportGuard::process(process),
        ))
    }

    fn kind(&self) -> &'static str {
        "stdio"
    }
}

pub struct SseConnector {
    pub client: HttpClient,
    pub url: String,
    pub endpoint_timeout: Duration,
}

#[async_trait]
impl Connector for SseConnector {
    async fn open(&self, server: &str) -> Result<Transport, ConnectionError> {
        let base = Url::parse(&self.url).map_err(|e| {
            ConnectionError::transport(server, format!("invalid url '{}': {}", self.url, e))
        })?;

        let response = self
            .client
            .get(base.clone())
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| ConnectionError::transport(server, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnectionError::transport(
                server,
                format!("event stream answered {}", status),
            ));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let (frames_tx, frames_rx) = mpsc::channel::<String>(64);
        let name = server.to_string();

        let pump = tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut endpoint_tx = Some(endpoint_tx);

            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!("[{}] Event stream error: {}", name, e);
                        break;
                    }
                };

                for event in decoder.feed(&chunk) {
                    match event.event.as_str() {
                        "endpoint" => {
                            if let Some(tx) = endpoint_tx.take() {
                                let _ = tx.send(event.data);
                            }
                        }
                        "message" => {
                            if frames_tx.send(event.data).await.is_err() {
                                return;
                            }
                        }
                        other => debug!("[{}] Ignoring '{}' event", name, other),
                    }
                }
            }
            debug!("[{}] Event stream closed", name);
        });
        let guard = TransportGuard::task(pump);

        let endpoint = match tokio::time::timeout(self.endpoint_timeout, endpoint_rx).await {
            Ok(Ok(path)) => base.join(&path).map_err(|e| {
                ConnectionError::protocol(server, format!("bad endpoint '{}': {}", path, e))
            })?,
            Ok(Err(_)) => {
                return Err(ConnectionError::protocol(
                    server,
                    "event stream ended before announcing an endpoint",
                ))
            }
            Err(_) => {
                return Err(ConnectionError::protocol(
                    server,
                    format!("no endpoint event within {:?}", self.endpoint_timeout),
                ))
            }
        };
        debug!("[{}] Message endpoint: {}", server, endpoint);

        Ok(Transport {
            frames: Box::pin(ReceiverStream::new(frames_rx).map(Ok)),
            writer: FrameWriter::Post {
                client: self.client.clone(),
                endpoint,
            },
            guard,
        })
    }

    fn kind(&self) -> &'static str {
        "sse"
    }
}
