//! Unix socket bus surface.
//!
//! Serves the stable object layout over newline-delimited JSON: one
//! request envelope per line, one response envelope back. A connection
//! that sends `Subscribe` switches into an event stream and receives the
//! daemon's coalesced signals until it disconnects.
//!
//! Connection tasks never touch daemon state; every method is a `BusCall`
//! sent to the main loop with a oneshot reply, bounded by a 5 s budget.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use up_error::{Result, UpowerError};
use up_protocol::{
    EventEnvelope, Request, RequestEnvelope, Response, ResponseData, ResponseEnvelope,
    MAX_MESSAGE_SIZE,
};

use crate::daemon::BusCall;

/// Maximum concurrent client connections
const MAX_CONNECTIONS: usize = 64;

/// Read timeout per request on non-subscribed connections
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Write timeout per frame
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bus method handlers must answer within this budget
const METHOD_TIMEOUT: Duration = Duration::from_secs(5);

/// Socket is world-readable: this daemon only publishes state
const SOCKET_MODE: u32 = 0o666;

/// Bind retry policy: three attempts spread over five seconds
const BIND_ATTEMPTS: u32 = 3;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(2500);

static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

struct ConnectionGuard;

impl ConnectionGuard {
    fn acquire() -> Option<Self> {
        let count = ACTIVE_CONNECTIONS.fetch_add(1, Ordering::SeqCst);
        if count >= MAX_CONNECTIONS {
            ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(Self)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bind the bus socket, retrying before giving up. A persistent failure
/// maps to exit code 2 in main.
pub async fn bind_listener(socket_path: &str) -> Result<UnixListener> {
    let mut last_error = String::new();
    for attempt in 1..=BIND_ATTEMPTS {
        match try_bind(socket_path) {
            Ok(listener) => {
                info!("bus socket bound at {}", socket_path);
                return Ok(listener);
            }
            Err(e) => {
                warn!(
                    "bus socket bind attempt {}/{} failed: {}",
                    attempt, BIND_ATTEMPTS, e
                );
                last_error = e.to_string();
                if attempt < BIND_ATTEMPTS {
                    tokio::time::sleep(BIND_RETRY_DELAY).await;
                }
            }
        }
    }
    Err(UpowerError::BusAcquire(last_error))
}

fn try_bind(socket_path: &str) -> std::io::Result<UnixListener> {
    let path = Path::new(socket_path);

    if path.exists() {
        // Refuse symlinks outright; a stale socket file is unlinked
        let meta = path.symlink_metadata()?;
        if meta.file_type().is_symlink() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "socket path is a symlink",
            ));
        }
        std::fs::remove_file(path)?;
    }

    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
    Ok(listener)
}

/// Accept loop; one task per connection.
pub async fn run_server(
    listener: UnixListener,
    calls: mpsc::Sender<BusCall>,
    signals: broadcast::Sender<EventEnvelope>,
    mut shutdown: watch::Receiver<bool>,
    version: String,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("bus server stopping");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let calls = calls.clone();
                        let signals = signals.clone();
                        let shutdown = shutdown.clone();
                        let version = version.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, calls, signals, shutdown, version).await;
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    calls: mpsc::Sender<BusCall>,
    signals: broadcast::Sender<EventEnvelope>,
    mut shutdown: watch::Receiver<bool>,
    version: String,
) {
    let Some(_guard) = ConnectionGuard::acquire() else {
        warn!("connection limit reached, dropping client");
        return;
    };

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();

    loop {
        let read = timeout(
            READ_TIMEOUT,
            read_line_bounded(&mut reader, &mut line, MAX_MESSAGE_SIZE),
        )
        .await;

        let n = match read {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!("client read error: {}", e);
                let reply = ResponseEnvelope::new(0, Response::invalid_args(e.to_string()));
                let _ = write_frame(&mut write_half, &reply).await;
                break;
            }
            Err(_) => {
                debug!("client idle past read timeout, closing");
                break;
            }
        };
        if n == 0 {
            break;
        }

        let envelope: RequestEnvelope = match serde_json::from_slice(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                let reply =
                    ResponseEnvelope::new(0, Response::invalid_args(format!("bad request: {}", e)));
                if write_frame(&mut write_half, &reply).await.is_err() {
                    break;
                }
                continue;
            }
        };

        if let Err(reason) = envelope.request.validate() {
            let reply = ResponseEnvelope::new(envelope.id, Response::invalid_args(reason));
            if write_frame(&mut write_half, &reply).await.is_err() {
                break;
            }
            continue;
        }

        if matches!(envelope.request, Request::Subscribe) {
            let reply = ResponseEnvelope::new(envelope.id, Response::ok());
            if write_frame(&mut write_half, &reply).await.is_err() {
                break;
            }
            stream_events(&mut write_half, signals.subscribe(), &mut shutdown).await;
            break;
        }

        let response = dispatch(&envelope.request, &calls, &version).await;
        let reply = ResponseEnvelope::new(envelope.id, response);
        if write_frame(&mut write_half, &reply).await.is_err() {
            break;
        }
    }
}

/// Forward broadcast signals to a subscribed client until it goes away.
async fn stream_events(
    writer: &mut (impl AsyncWriteExt + Unpin),
    mut events: broadcast::Receiver<EventEnvelope>,
    shutdown: &mut watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Ok(envelope) => {
                    if write_frame(writer, &envelope).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("subscriber lagged, dropped {} signals", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

async fn write_frame<T: serde::Serialize>(
    writer: &mut (impl AsyncWriteExt + Unpin),
    frame: &T,
) -> std::io::Result<()> {
    let mut payload = serde_json::to_vec(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    payload.push(b'\n');
    timeout(WRITE_TIMEOUT, writer.write_all(&payload))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout"))?
}

/// Run one method against the main loop and shape the reply.
async fn dispatch(request: &Request, calls: &mpsc::Sender<BusCall>, version: &str) -> Response {
    match request {
        Request::Ping => Response::ok(),
        Request::Version => Response::ok_string(version),
        Request::Subscribe => Response::ok(),

        Request::EnumerateDevices => {
            let (tx, rx) = oneshot::channel();
            roundtrip(calls, BusCall::EnumerateDevices { reply: tx }, rx)
                .await
                .map(|paths| Response::Ok(ResponseData::paths(paths)))
                .unwrap_or_else(failed)
        }
        Request::GetDisplayDevice => {
            let (tx, rx) = oneshot::channel();
            roundtrip(calls, BusCall::GetDisplayDevice { reply: tx }, rx)
                .await
                .map(Response::ok_string)
                .unwrap_or_else(failed)
        }
        Request::GetCriticalAction => {
            let (tx, rx) = oneshot::channel();
            roundtrip(calls, BusCall::GetCriticalAction { reply: tx }, rx)
                .await
                .map(Response::ok_string)
                .unwrap_or_else(failed)
        }
        Request::GetDaemonState => {
            let (tx, rx) = oneshot::channel();
            roundtrip(calls, BusCall::GetDaemonState { reply: tx }, rx)
                .await
                .map(|state| Response::Ok(ResponseData::daemon(state)))
                .unwrap_or_else(failed)
        }
        Request::GetDevice { path } => {
            let (tx, rx) = oneshot::channel();
            let call = BusCall::GetDevice {
                path: path.clone(),
                reply: tx,
            };
            match roundtrip(calls, call, rx).await {
                Ok(Ok(snapshot)) => Response::Ok(ResponseData::device(snapshot)),
                Ok(Err(e)) => Response::error(e.bus_name(), e.to_string()),
                Err(e) => failed(e),
            }
        }
        Request::RefreshDevice { path } => {
            let (tx, rx) = oneshot::channel();
            let call = BusCall::RefreshDevice {
                path: path.clone(),
                reply: tx,
            };
            match roundtrip(calls, call, rx).await {
                Ok(Ok(())) => Response::ok(),
                Ok(Err(e)) => Response::error(e.bus_name(), e.to_string()),
                Err(e) => failed(e),
            }
        }
        Request::GetHistory {
            path,
            kind,
            timespan,
            resolution,
        } => {
            let (tx, rx) = oneshot::channel();
            let call = BusCall::GetHistory {
                path: path.clone(),
                kind: *kind,
                timespan: *timespan,
                resolution: *resolution,
                reply: tx,
            };
            match roundtrip(calls, call, rx).await {
                Ok(Ok(points)) => Response::Ok(ResponseData::history(points)),
                Ok(Err(e)) => Response::error(e.bus_name(), e.to_string()),
                Err(e) => failed(e),
            }
        }
        Request::GetStatistics { path, kind } => {
            let (tx, rx) = oneshot::channel();
            let call = BusCall::GetStatistics {
                path: path.clone(),
                kind: *kind,
                reply: tx,
            };
            match roundtrip(calls, call, rx).await {
                Ok(Ok(points)) => Response::Ok(ResponseData::statistics(points)),
                Ok(Err(e)) => Response::error(e.bus_name(), e.to_string()),
                Err(e) => failed(e),
            }
        }
    }
}

fn failed(message: String) -> Response {
    Response::failed(message)
}

/// Send a call to the main loop and await its reply inside the method
/// budget.
async fn roundtrip<T>(
    calls: &mpsc::Sender<BusCall>,
    call: BusCall,
    reply: oneshot::Receiver<T>,
) -> std::result::Result<T, String> {
    if calls.send(call).await.is_err() {
        return Err("daemon is shutting down".into());
    }
    match timeout(METHOD_TIMEOUT, reply).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err("daemon dropped the request".into()),
        Err(_) => Err("method timed out".into()),
    }
}

/// Read one newline-terminated frame without buffering past `max_len`.
async fn read_line_bounded<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
    max_len: usize,
) -> std::io::Result<usize> {
    out.clear();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(0);
        }

        let mut take_len = available.len();
        let mut found_newline = false;
        if let Some(pos) = available.iter().position(|b| *b == b'\n') {
            take_len = pos + 1;
            found_newline = true;
        }

        let remaining = max_len.saturating_sub(out.len());
        if take_len > remaining {
            // Consume enough to make forward progress, but don't buffer
            // beyond max_len
            let consume_len = remaining.min(available.len());
            reader.consume(consume_len);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "message too large",
            ));
        }

        out.extend_from_slice(&available[..take_len]);
        reader.consume(take_len);

        if found_newline {
            return Ok(out.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_read_line_bounded_splits_frames() {
        let data: &[u8] = b"{\"a\":1}\n{\"b\":2}\n";
        let mut reader = BufReader::new(data);
        let mut line = Vec::new();

        let n = read_line_bounded(&mut reader, &mut line, 1024).await.unwrap();
        assert_eq!(&line[..n], b"{\"a\":1}\n");

        let n = read_line_bounded(&mut reader, &mut line, 1024).await.unwrap();
        assert_eq!(&line[..n], b"{\"b\":2}\n");

        let n = read_line_bounded(&mut reader, &mut line, 1024).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_read_line_bounded_rejects_oversize() {
        let data = vec![b'x'; 64];
        let mut reader = BufReader::new(&data[..]);
        let mut line = Vec::new();
        let result = read_line_bounded(&mut reader, &mut line, 16).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dispatch_ping_and_version_are_local() {
        // Ping and Version never hit the main loop, so a closed channel is
        // fine
        let (calls_tx, _calls_rx) = mpsc::channel(1);
        let response = dispatch(&Request::Ping, &calls_tx, "1.0").await;
        assert!(matches!(response, Response::Ok(_)));

        let response = dispatch(&Request::Version, &calls_tx, "1.0").await;
        let Response::Ok(data) = response else {
            panic!("expected ok");
        };
        assert_eq!(data.value.as_deref(), Some("1.0"));
    }

    #[tokio::test]
    async fn test_dispatch_reports_daemon_gone() {
        let (calls_tx, calls_rx) = mpsc::channel(1);
        drop(calls_rx);
        let response = dispatch(&Request::EnumerateDevices, &calls_tx, "1.0").await;
        let Response::Error { name, .. } = response else {
            panic!("expected error");
        };
        assert_eq!(name, "Failed");
    }
}
