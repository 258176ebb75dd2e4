// TFTP read client used to pull firmware images from a network server.
//
// A download works in the following stages:
//
// 1. Bind a fresh ephemeral socket (our TID) and send a read request to the configured server.
// 2. The first reply fixes the peer address. Servers answer from a new port of their own, so
//    every ACK for the rest of the attempt goes to that address and not to port 69.
// 3. Receive DATA blocks, ACK each one and append it to the output until a short block arrives.
//
// Timeouts, socket failures, unexpected packet types and out-of-sequence blocks abort the attempt;
// the whole transfer is then restarted with an empty buffer, up to `retries` more times. An ERROR
// packet from the server ends the download immediately.

use crate::callback::invoke_guarded;
use crate::config::TftpConfig;
use crate::processor::{ReceiveProcessor, ResultAction};
use crate::tftp;
use std::error;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// File requested by `test_connection`. Any server should answer with "file not found".
pub const CONNECTIVITY_CHECK_FILENAME: &str = "__fwpipe_connectivity_check__";

/// Firmware size assumed for progress reporting when no size hint was given.
pub const DEFAULT_SIZE_ESTIMATE: u64 = 16 * 1024 * 1024;

/// Longest stretch a receive runs without looking at the cancellation flag.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Outcome classification of a TFTP operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TftpError {
    None,
    Timeout,
    NetworkError,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTid,
    FileExists,
    NoSuchUser,
    InvalidResponse,
    ConnectionFailed,
}

impl fmt::Display for TftpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TftpError::None => "no error",
            TftpError::Timeout => "timeout",
            TftpError::NetworkError => "network error",
            TftpError::FileNotFound => "file not found",
            TftpError::AccessViolation => "access violation",
            TftpError::DiskFull => "disk full",
            TftpError::IllegalOperation => "illegal TFTP operation",
            TftpError::UnknownTid => "unknown transfer ID",
            TftpError::FileExists => "file already exists",
            TftpError::NoSuchUser => "no such user",
            TftpError::InvalidResponse => "invalid response",
            TftpError::ConnectionFailed => "connection failed",
        };
        f.write_str(s)
    }
}

/// A failed TFTP operation: what went wrong and a human readable explanation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferError {
    pub kind: TftpError,
    pub message: String,
}

impl TransferError {
    pub fn new(kind: TftpError, message: impl Into<String>) -> TransferError {
        TransferError {
            kind,
            message: message.into(),
        }
    }
}

impl error::Error for TransferError {}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Raised when a client cannot be built from the given server settings.
#[derive(Debug)]
pub enum ClientError {
    Configuration(String),
}

impl error::Error for ClientError {}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClientError::Configuration(msg) => write!(f, "Invalid TFTP configuration: {msg}"),
        }
    }
}

/// Failure of `download_file_to_path`, keeping network trouble apart from local disk trouble.
#[derive(Debug)]
pub enum DownloadError {
    Transfer(TransferError),
    LocalWrite(io::Error),
}

impl error::Error for DownloadError {}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DownloadError::Transfer(e) => write!(f, "Download failed: {e}"),
            DownloadError::LocalWrite(e) => write!(f, "Failed to save downloaded file: {e}"),
        }
    }
}

impl From<TransferError> for DownloadError {
    fn from(e: TransferError) -> Self {
        DownloadError::Transfer(e)
    }
}

/// Snapshot of a running transfer, produced for every new block.
#[derive(Debug, Clone, PartialEq)]
pub struct TftpProgress {
    pub bytes_transferred: u64,
    /// Estimate until the final block arrives, exact afterwards.
    pub total_bytes: u64,
    pub percentage: f64,
    pub elapsed: Duration,
    pub status_message: String,
}

pub type ProgressCallback = Box<dyn Fn(&TftpProgress) + Send + Sync>;
pub type CompletionCallback = Box<dyn Fn(TftpError, &str) + Send + Sync>;

/// Lets another task cancel an operation without borrowing the client.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// How a single attempt ended when it did not succeed.
enum AttemptError {
    /// Worth starting over.
    Retry(TransferError),
    /// Starting over will not help.
    Fatal(TransferError),
}

pub struct TftpClient {
    server: SocketAddr,
    config: TftpConfig,
    size_hint: Option<u64>,
    cancelled: Arc<AtomicBool>,
    last_error: Mutex<TransferError>,
    on_progress: Option<ProgressCallback>,
    on_complete: Option<CompletionCallback>,
}

impl TftpClient {
    /// Creates a client for `server` (an IP address or host name) using the port in `config`.
    pub fn new(server: &str, config: TftpConfig) -> Result<TftpClient, ClientError> {
        let server = server.trim();
        if server.is_empty() {
            return Err(ClientError::Configuration(
                "server address is empty".to_string(),
            ));
        }
        if config.port == 0 {
            return Err(ClientError::Configuration("port must not be 0".to_string()));
        }

        let server_addr = (server, config.port)
            .to_socket_addrs()
            .map_err(|e| ClientError::Configuration(format!("cannot resolve '{server}': {e}")))?
            .next()
            .ok_or_else(|| {
                ClientError::Configuration(format!("'{server}' has no usable address"))
            })?;

        Ok(TftpClient {
            server: server_addr,
            config,
            size_hint: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            last_error: Mutex::new(TransferError::new(TftpError::None, "")),
            on_progress: None,
            on_complete: None,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    /// Expected image size, used only to make progress percentages meaningful.
    pub fn set_size_hint(&mut self, bytes: u64) {
        self.size_hint = Some(bytes);
    }

    pub fn set_progress_callback(&mut self, cb: ProgressCallback) {
        self.on_progress = Some(cb);
    }

    pub fn set_completion_callback(&mut self, cb: CompletionCallback) {
        self.on_complete = Some(cb);
    }

    /// Requests that the running operation stop at its next receive checkpoint.
    pub fn cancel_operation(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancelled.clone())
    }

    pub fn last_error(&self) -> TftpError {
        self.lock_last_error().kind
    }

    pub fn last_error_message(&self) -> String {
        self.lock_last_error().message.clone()
    }

    fn lock_last_error(&self) -> std::sync::MutexGuard<'_, TransferError> {
        // A poisoned lock only means a callback panicked while we held it; the value is intact.
        self.last_error.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_result(&self, result: &Result<(), TransferError>) {
        *self.lock_last_error() = match result {
            Ok(()) => TransferError::new(TftpError::None, ""),
            Err(e) => e.clone(),
        };
    }

    fn bind_socket(&self, block_size: usize) -> Result<tftp::TftpSocket, AttemptError> {
        let local: SocketAddr = match self.server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        tftp::TftpSocket::bind(local, block_size).map_err(|e| {
            AttemptError::Retry(TransferError::new(
                TftpError::ConnectionFailed,
                format!("Unable to bind local socket: {e}"),
            ))
        })
    }

    /// Waits for one packet, checking for cancellation at least every `CANCEL_POLL_INTERVAL`.
    async fn recv(
        &self,
        sock: &tftp::TftpSocket,
    ) -> Result<(tftp::Packet, SocketAddr), AttemptError> {
        let deadline = Instant::now() + self.config.timeout;
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(AttemptError::Fatal(TransferError::new(
                    TftpError::Timeout,
                    "Operation cancelled by user",
                )));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(AttemptError::Retry(TransferError::new(
                    TftpError::Timeout,
                    format!(
                        "No response from {} within {:?}",
                        self.server, self.config.timeout
                    ),
                )));
            }

            match sock
                .recv_with_timeout((deadline - now).min(CANCEL_POLL_INTERVAL))
                .await
            {
                Ok(received) => return Ok(received),
                Err(tftp::SocketError::Timeout(_)) => continue,
                Err(tftp::SocketError::PacketParse(msg)) => {
                    return Err(AttemptError::Retry(TransferError::new(
                        TftpError::InvalidResponse,
                        format!("Malformed packet: {msg}"),
                    )))
                }
                Err(tftp::SocketError::IO(e)) => {
                    return Err(AttemptError::Retry(TransferError::new(
                        TftpError::NetworkError,
                        format!("Receive failed: {e}"),
                    )))
                }
            }
        }
    }

    async fn send(
        &self,
        sock: &tftp::TftpSocket,
        packet: &tftp::Packet,
        dst: SocketAddr,
    ) -> Result<(), AttemptError> {
        sock.send(packet, dst).await.map_err(|e| {
            AttemptError::Retry(TransferError::new(
                TftpError::NetworkError,
                format!("Send to {dst} failed: {e}"),
            ))
        })
    }

    fn read_request(&self, filename: &str) -> tftp::Packet {
        tftp::Packet::ReadReq {
            path: filename.to_string(),
            mode: tftp::FileMode::Octet,
        }
    }

    /// Checks that a TFTP server answers at the configured address.
    ///
    /// Any well formed reply counts, including an ERROR for the missing check file.
    pub async fn test_connection(&self) -> Result<(), TransferError> {
        self.cancelled.store(false, Ordering::SeqCst);
        let block_size = self.config.effective_block_size();
        let attempts = self.config.retries + 1;
        let mut last = TransferError::new(TftpError::ConnectionFailed, "No attempt was made");

        for attempt in 1..=attempts {
            let outcome = async {
                let sock = self.bind_socket(block_size)?;
                self.send(&sock, &self.read_request(CONNECTIVITY_CHECK_FILENAME), self.server)
                    .await?;
                let (packet, src) = self.recv(&sock).await?;
                if let tftp::Packet::Data { .. } = packet {
                    // Somebody actually has the check file. Tell the server we are done with it.
                    let _ = sock
                        .send(
                            &tftp::Packet::Error {
                                code: tftp::ErrorCode::Undefined,
                                message: "Connectivity check complete".to_string(),
                            },
                            src,
                        )
                        .await;
                }
                log::debug!("Connectivity check answered by {src} with {:?}", packet.op_code());
                Ok::<(), AttemptError>(())
            }
            .await;

            match outcome {
                Ok(()) => {
                    log::info!("TFTP server {} is reachable", self.server);
                    let result = Ok(());
                    self.record_result(&result);
                    return result;
                }
                Err(AttemptError::Fatal(e)) => {
                    last = e;
                    break;
                }
                Err(AttemptError::Retry(e)) => {
                    log::warn!("Connection test attempt {attempt}/{attempts} failed: {e}");
                    last = e;
                }
            }
        }

        let result = Err(last);
        self.record_result(&result);
        result
    }

    /// Downloads `filename` into `out`, replacing whatever it held.
    ///
    /// The completion callback fires exactly once per call.
    pub async fn download_file(&self, filename: &str, out: &mut Vec<u8>) -> Result<(), TransferError> {
        self.cancelled.store(false, Ordering::SeqCst);
        let started = Instant::now();
        let attempts = self.config.retries + 1;
        log::info!("Downloading '{filename}' from {}", self.server);

        let mut result = Err(TransferError::new(
            TftpError::ConnectionFailed,
            "No attempt was made",
        ));
        for attempt in 1..=attempts {
            out.clear();
            match self.download_attempt(filename, out, started).await {
                Ok(()) => {
                    result = Ok(());
                    break;
                }
                Err(AttemptError::Fatal(e)) => {
                    result = Err(e);
                    break;
                }
                Err(AttemptError::Retry(e)) => {
                    log::warn!("Download attempt {attempt}/{attempts} failed: {e}");
                    result = Err(e);
                }
            }
        }

        match &result {
            Ok(()) => log::info!(
                "Downloaded '{filename}' ({} bytes) in {:?}",
                out.len(),
                started.elapsed()
            ),
            Err(e) => {
                out.clear();
                log::error!("Download of '{filename}' failed: {e}");
            }
        }

        self.record_result(&result);
        if let Some(cb) = &self.on_complete {
            let (kind, message) = match &result {
                Ok(()) => (TftpError::None, "Download complete".to_string()),
                Err(e) => (e.kind, e.message.clone()),
            };
            invoke_guarded("TFTP completion", || cb(kind, &message));
        }
        result
    }

    async fn download_attempt(
        &self,
        filename: &str,
        out: &mut Vec<u8>,
        started: Instant,
    ) -> Result<(), AttemptError> {
        let block_size = self.config.effective_block_size();
        let sock = self.bind_socket(block_size)?;
        self.send(&sock, &self.read_request(filename), self.server)
            .await?;

        let mut processor = ReceiveProcessor::new(block_size);
        let mut peer: Option<SocketAddr> = None;

        loop {
            let (packet, src) = self.recv(&sock).await?;

            let dst = match peer {
                None => {
                    log::debug!("Transfer peer is {src}");
                    peer = Some(src);
                    src
                }
                Some(p) if p == src => p,
                Some(_) => {
                    log::warn!("Ignoring packet from unknown TID {src}");
                    // Courtesy error to the stray sender, our own transfer carries on.
                    let _ = sock
                        .send(
                            &tftp::Packet::Error {
                                code: tftp::ErrorCode::UnknownTid,
                                message: "Unknown transfer ID".to_string(),
                            },
                            src,
                        )
                        .await;
                    continue;
                }
            };

            let before = processor.bytes_received();
            match processor.process_packet(&packet, out) {
                ResultAction::SendPacketAndAwait(ack) => {
                    self.send(&sock, &ack, dst).await?;
                    if processor.bytes_received() > before {
                        self.report_progress(processor.bytes_received(), false, started);
                    }
                }
                ResultAction::TerminateWithPacket(ack) => {
                    self.send(&sock, &ack, dst).await?;
                    self.report_progress(processor.bytes_received(), true, started);
                    return Ok(());
                }
                ResultAction::AbortAttempt(e) => return Err(AttemptError::Retry(e)),
                ResultAction::AbortTransfer(e) => return Err(AttemptError::Fatal(e)),
            }
        }
    }

    fn report_progress(&self, bytes: u64, finished: bool, started: Instant) {
        let Some(cb) = &self.on_progress else {
            return;
        };

        let progress = if finished {
            TftpProgress {
                bytes_transferred: bytes,
                total_bytes: bytes,
                percentage: 100.0,
                elapsed: started.elapsed(),
                status_message: "Transfer complete".to_string(),
            }
        } else {
            // The size is only known once the short block arrives, so never claim to be done.
            let block = self.config.effective_block_size() as u64;
            let total = self
                .size_hint
                .unwrap_or(DEFAULT_SIZE_ESTIMATE)
                .max(bytes + block);
            TftpProgress {
                bytes_transferred: bytes,
                total_bytes: total,
                percentage: (bytes as f64 * 100.0 / total as f64).min(99.0),
                elapsed: started.elapsed(),
                status_message: format!("Received {bytes} bytes"),
            }
        };
        invoke_guarded("TFTP progress", || cb(&progress));
    }

    /// Downloads `filename` and stores it at `path`, returning the number of bytes written.
    pub async fn download_file_to_path(
        &self,
        filename: &str,
        path: &Path,
    ) -> Result<u64, DownloadError> {
        let mut buf = Vec::new();
        self.download_file(filename, &mut buf).await?;

        if let Err(e) = tokio::fs::write(path, &buf).await {
            log::error!("Unable to write {}: {e}", path.display());
            let _ = tokio::fs::remove_file(path).await;
            *self.lock_last_error() = TransferError::new(
                TftpError::DiskFull,
                format!("Failed to write {}: {e}", path.display()),
            );
            return Err(DownloadError::LocalWrite(e));
        }
        Ok(buf.len() as u64)
    }
}
