//! Packet capture sessions and pcap file streaming.
//!
//! A session owns the pcap file while it runs. Readers never lock the file;
//! they tail it and watch the session's running flag to know when to stop.

use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Bytes;
use byteorder::{ByteOrder, LittleEndian};
use futures_util::stream::{BoxStream, StreamExt};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{ControlError, ControlResult};

pub const PCAP_CHUNK_SIZE: usize = 8 * 1024;
const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(100);

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const PCAP_SNAPLEN: u32 = 65535;
pub const PCAP_GLOBAL_HEADER_LEN: usize = 24;
pub const PCAP_RECORD_HEADER_LEN: usize = 16;

/// Data link encodings a capture can be written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkType {
    #[default]
    En10mb,
    PppSerial,
    CHdlc,
    FrameRelay,
    AtmRfc1483,
}

impl LinkType {
    /// LINKTYPE_* value written in the pcap global header.
    pub fn pcap_network(self) -> u32 {
        match self {
            Self::En10mb => 1,
            Self::PppSerial => 50,
            Self::AtmRfc1483 => 100,
            Self::CHdlc => 104,
            Self::FrameRelay => 107,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::En10mb => "DLT_EN10MB",
            Self::PppSerial => "DLT_PPP_SERIAL",
            Self::CHdlc => "DLT_C_HDLC",
            Self::FrameRelay => "DLT_FRELAY",
            Self::AtmRfc1483 => "DLT_ATM_RFC1483",
        }
    }
}

impl FromStr for LinkType {
    type Err = ControlError;

    /// Accepts both `DLT_EN10MB` and `EN10MB`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.strip_prefix("DLT_").unwrap_or(&upper) {
            "EN10MB" => Ok(Self::En10mb),
            "PPP_SERIAL" => Ok(Self::PppSerial),
            "C_HDLC" => Ok(Self::CHdlc),
            "FRELAY" => Ok(Self::FrameRelay),
            "ATM_RFC1483" => Ok(Self::AtmRfc1483),
            _ => Err(ControlError::InvalidRequest(format!(
                "Unsupported data link type '{}'",
                s
            ))),
        }
    }
}

impl std::fmt::Display for LinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn global_header(link_type: LinkType) -> [u8; PCAP_GLOBAL_HEADER_LEN] {
    let mut header = [0u8; PCAP_GLOBAL_HEADER_LEN];
    LittleEndian::write_u32(&mut header[0..4], PCAP_MAGIC);
    LittleEndian::write_u16(&mut header[4..6], PCAP_VERSION_MAJOR);
    LittleEndian::write_u16(&mut header[6..8], PCAP_VERSION_MINOR);
    // thiszone (8..12) and sigfigs (12..16) stay zero
    LittleEndian::write_u32(&mut header[16..20], PCAP_SNAPLEN);
    LittleEndian::write_u32(&mut header[20..24], link_type.pcap_network());
    header
}

fn record_header(captured: usize, original: usize) -> [u8; PCAP_RECORD_HEADER_LEN] {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut header = [0u8; PCAP_RECORD_HEADER_LEN];
    LittleEndian::write_u32(&mut header[0..4], now.as_secs() as u32);
    LittleEndian::write_u32(&mut header[4..8], now.subsec_micros());
    LittleEndian::write_u32(&mut header[8..12], captured as u32);
    LittleEndian::write_u32(&mut header[12..16], original as u32);
    header
}

/// A running (or finished) recording tap on one NIO.
#[derive(Debug)]
pub struct CaptureSession {
    path: PathBuf,
    link_type: LinkType,
    file: Mutex<Option<File>>,
    running: watch::Sender<bool>,
}

impl CaptureSession {
    /// Create the pcap file and write its global header.
    pub async fn start(path: &Path, link_type: LinkType) -> io::Result<Arc<Self>> {
        let mut file = File::create(path).await?;
        file.write_all(&global_header(link_type)).await?;
        file.flush().await?;
        tracing::info!("Packet capture started in {} ({})", path.display(), link_type);

        let (running, _) = watch::channel(true);
        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            link_type,
            file: Mutex::new(Some(file)),
            running,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.running.subscribe()
    }

    /// Append one frame. Frames arriving after `stop` are dropped.
    pub async fn record(&self, frame: &[u8]) -> io::Result<()> {
        let mut guard = self.file.lock().await;
        let Some(file) = guard.as_mut() else {
            return Ok(());
        };
        let captured = frame.len().min(PCAP_SNAPLEN as usize);
        let mut record = Vec::with_capacity(PCAP_RECORD_HEADER_LEN + captured);
        record.extend_from_slice(&record_header(captured, frame.len()));
        record.extend_from_slice(&frame[..captured]);
        file.write_all(&record).await?;
        file.flush().await
    }

    /// Close the file and flip the running flag. Stopping twice is a no-op.
    pub async fn stop(&self) -> io::Result<()> {
        let file = self.file.lock().await.take();
        let result = match file {
            Some(mut file) => {
                let flushed = file.flush().await;
                match flushed {
                    Ok(()) => file.sync_all().await,
                    Err(e) => Err(e),
                }
            }
            None => Ok(()),
        };
        // readers must observe "stopped" only once every byte is on disk
        self.running.send_replace(false);
        tracing::info!("Packet capture stopped for {}", self.path.display());
        result
    }

    /// Open the capture file for tailing.
    pub async fn open_stream(
        &self,
        shutdown: CancellationToken,
    ) -> ControlResult<BoxStream<'static, io::Result<Bytes>>> {
        let file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ControlError::CaptureFileNotFound(
                    self.path.display().to_string(),
                ))
            }
            Err(e) => return Err(ControlError::Internal(e.into())),
        };
        let tail = PcapTail {
            file,
            path: self.path.clone(),
            running: self.subscribe(),
            shutdown,
            buf: vec![0u8; PCAP_CHUNK_SIZE],
            finished: false,
        };
        Ok(futures_util::stream::unfold(tail, |mut tail| async move {
            match tail.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), tail)),
                Ok(None) => None,
                Err(e) => {
                    tail.finished = true;
                    Some((Err(e), tail))
                }
            }
        })
        .boxed())
    }
}

struct PcapTail {
    file: File,
    path: PathBuf,
    running: watch::Receiver<bool>,
    shutdown: CancellationToken,
    buf: Vec<u8>,
    finished: bool,
}

impl PcapTail {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }
        loop {
            // sample before reading so the last bytes written before stop are drained
            let running = *self.running.borrow()
                && self.running.has_changed().is_ok()
                && !self.shutdown.is_cancelled();
            let n = self.file.read(&mut self.buf).await?;
            if n > 0 {
                return Ok(Some(Bytes::copy_from_slice(&self.buf[..n])));
            }
            if !running || tokio::fs::metadata(&self.path).await.is_err() {
                self.finished = true;
                return Ok(None);
            }
            tokio::select! {
                _ = tokio::time::sleep(STREAM_POLL_INTERVAL) => {}
                _ = self.shutdown.cancelled() => {}
            }
        }
    }
}
