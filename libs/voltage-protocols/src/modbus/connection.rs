//! Modbus Transports
//!
//! A [`Transport`] owns one open byte stream (TCP socket or serial port) and
//! performs one request/response exchange at a time. Frame boundaries come
//! from the framing itself: the MBAP length field for TCP, function code and
//! byte count for RTU, CR LF for ASCII.
//!
//! [`Connector`] opens transports from validated [`TransportSettings`]; the
//! connection manager is its only caller.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use voltage_comlink::error::{ComLinkError, Result};

use super::codec::ModbusCodec;
use super::config::{SerialLine, TransportSettings};
use super::constants::{MAX_ASCII_FRAME, MAX_MBAP_LENGTH, MBAP_HEADER_LEN};
use super::pdu::ModbusPdu;
use super::transport::{is_stale_reply, ModbusMode};

/// What the caller expects back, used when the response itself does not
/// announce its length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseShape {
    /// PDU length of a normal (non-exception) response
    pub pdu_len: Option<usize>,
}

impl ResponseShape {
    pub fn for_request(request: &ModbusPdu) -> Self {
        Self {
            pdu_len: ModbusCodec::expected_response_len(request),
        }
    }
}

/// One open link to a device
#[async_trait]
pub trait Transport: Send + std::fmt::Debug {
    /// Write `request` and wait for one complete response frame.
    ///
    /// The whole exchange (write plus read) is bounded by `limit`.
    async fn exchange(
        &mut self,
        request: &[u8],
        shape: ResponseShape,
        limit: Duration,
    ) -> Result<Vec<u8>>;

    /// Release the underlying handle
    async fn close(&mut self) -> Result<()>;

    /// Human-readable peer (`host:port` or serial path)
    fn describe(&self) -> String;
}

/// Opens transports; swapped for an in-memory connector in tests
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    async fn open(
        &self,
        settings: &TransportSettings,
        limit: Duration,
    ) -> Result<Box<dyn Transport>>;
}

// ============================================================================
// Stream transport
// ============================================================================

/// Transport over any async byte stream
pub struct StreamTransport<S> {
    stream: S,
    mode: ModbusMode,
    peer: String,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, mode: ModbusMode, peer: impl Into<String>) -> Self {
        Self {
            stream,
            mode,
            peer: peer.into(),
        }
    }

    pub fn mode(&self) -> ModbusMode {
        self.mode
    }
}

impl<S> std::fmt::Debug for StreamTransport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("mode", &self.mode)
            .field("peer", &self.peer)
            .finish()
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn exchange(
        &mut self,
        request: &[u8],
        shape: ResponseShape,
        limit: Duration,
    ) -> Result<Vec<u8>> {
        let mode = self.mode;
        let peer = &self.peer;
        let stream = &mut self.stream;
        let io = async move {
            stream.write_all(request).await?;
            stream.flush().await?;
            loop {
                let response = read_response(stream, mode, shape).await?;
                // a duplicate or late reply to an earlier request; the one
                // we are waiting for is still behind it
                if mode == ModbusMode::Tcp && is_stale_reply(request, &response) {
                    warn!(
                        "TCP: discarding stale reply TID {:02X}{:02X} from {}",
                        response[0], response[1], peer
                    );
                    continue;
                }
                return Ok(response);
            }
        };

        match timeout(limit, io).await {
            Ok(result) => result,
            Err(_) => {
                debug!("{} RX timeout: {}", self.mode, self.peer);
                Err(ComLinkError::timeout(format!(
                    "No response from {} within {}ms",
                    self.peer,
                    limit.as_millis()
                )))
            },
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.peer.clone()
    }
}

// ============================================================================
// Frame readers
// ============================================================================

/// Read one response frame in `mode` framing
pub async fn read_response<R>(reader: &mut R, mode: ModbusMode, shape: ResponseShape) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + Send,
{
    match mode {
        ModbusMode::Tcp => read_mbap_frame(reader).await,
        ModbusMode::Rtu => read_rtu_response(reader, shape).await,
        ModbusMode::Ascii => read_ascii_frame(reader).await,
    }
}

/// Read one request frame in `mode` framing (device side)
pub async fn read_request<R>(reader: &mut R, mode: ModbusMode) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + Send,
{
    match mode {
        ModbusMode::Tcp => read_mbap_frame(reader).await,
        ModbusMode::Rtu => read_rtu_request(reader).await,
        ModbusMode::Ascii => read_ascii_frame(reader).await,
    }
}

/// [TID(2)][Proto(2)][Len(2)][Unit(1)][PDU(N)], Len covers unit + PDU
async fn read_mbap_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + Send,
{
    let mut frame = vec![0u8; MBAP_HEADER_LEN];
    reader.read_exact(&mut frame).await?;

    let length = u16::from_be_bytes([frame[4], frame[5]]) as usize;
    if length == 0 || length > MAX_MBAP_LENGTH {
        error!("TCP invalid len: {}", length);
        return Err(ComLinkError::protocol(format!(
            "Invalid TCP frame length: {}",
            length
        )));
    }

    frame.resize(MBAP_HEADER_LEN + length, 0);
    reader.read_exact(&mut frame[MBAP_HEADER_LEN..]).await?;
    debug!("TCP RX: {}B", frame.len());
    Ok(frame)
}

/// [Unit(1)][FC(1)][Data...][CRC(2)]; the data length is derived from the
/// function code, falling back to the expected shape
async fn read_rtu_response<R>(reader: &mut R, shape: ResponseShape) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + Send,
{
    let mut frame = vec![0u8; 2];
    reader.read_exact(&mut frame).await?;
    let fc = frame[1];

    let remaining = if fc & 0x80 != 0 {
        // exception code + CRC
        3
    } else {
        match fc {
            0x01..=0x04 => {
                let byte_count = reader.read_u8().await?;
                frame.push(byte_count);
                byte_count as usize + 2
            },
            0x05 | 0x06 | 0x0F | 0x10 => 4 + 2,
            _ => {
                let pdu_len = shape.pdu_len.ok_or_else(|| {
                    ComLinkError::protocol(format!("Cannot frame RTU response FC{:02X}", fc))
                })?;
                pdu_len.saturating_sub(1) + 2
            },
        }
    };

    read_more(reader, &mut frame, remaining).await?;
    debug!("RTU RX: {}B", frame.len());
    Ok(frame)
}

async fn read_rtu_request<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + Send,
{
    let mut frame = vec![0u8; 2];
    reader.read_exact(&mut frame).await?;

    match frame[1] {
        0x01..=0x06 => read_more(reader, &mut frame, 4 + 2).await?,
        0x0F | 0x10 => {
            // address, quantity, byte count
            read_more(reader, &mut frame, 5).await?;
            let byte_count = frame[6] as usize;
            read_more(reader, &mut frame, byte_count + 2).await?;
        },
        fc => {
            return Err(ComLinkError::protocol(format!(
                "Cannot frame RTU request FC{:02X}",
                fc
            )))
        },
    }
    Ok(frame)
}

/// `:` .. CR LF; anything before the start character is line noise
async fn read_ascii_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + Send,
{
    let mut skipped = 0usize;
    while reader.read_u8().await? != b':' {
        skipped += 1;
        if skipped >= MAX_ASCII_FRAME {
            warn!("ASCII: no start after {}B", skipped);
            return Err(ComLinkError::protocol(format!(
                "No ASCII start character within {} bytes",
                MAX_ASCII_FRAME
            )));
        }
    }
    if skipped > 0 {
        warn!("ASCII: skipped {}B before start", skipped);
    }

    let mut frame = vec![b':'];
    while !frame.ends_with(b"\r\n") {
        if frame.len() >= MAX_ASCII_FRAME {
            return Err(ComLinkError::protocol(format!(
                "ASCII frame exceeds {} bytes without CR LF",
                MAX_ASCII_FRAME
            )));
        }
        frame.push(reader.read_u8().await?);
    }
    debug!("ASCII RX: {}B", frame.len());
    Ok(frame)
}

async fn read_more<R>(reader: &mut R, frame: &mut Vec<u8>, count: usize) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let start = frame.len();
    frame.resize(start + count, 0);
    reader.read_exact(&mut frame[start..]).await?;
    Ok(())
}

// ============================================================================
// System connector
// ============================================================================

/// Opens real TCP sockets and serial ports
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConnector;

#[async_trait]
impl Connector for SystemConnector {
    async fn open(
        &self,
        settings: &TransportSettings,
        limit: Duration,
    ) -> Result<Box<dyn Transport>> {
        match settings {
            TransportSettings::Tcp { host, port } => {
                let addr = format!("{host}:{port}");
                debug!("TCP connecting: {}", addr);

                let stream = match timeout(limit, TcpStream::connect(&addr)).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        error!("TCP err: {} - {}", addr, e);
                        return Err(ComLinkError::transport(format!(
                            "Failed to connect to {addr}: {e}"
                        )));
                    },
                    Err(_) => {
                        warn!("TCP timeout: {}", addr);
                        return Err(ComLinkError::timeout(format!(
                            "Connection to {addr} timed out"
                        )));
                    },
                };

                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }
                info!("TCP connected: {}", addr);
                Ok(Box::new(StreamTransport::new(stream, ModbusMode::Tcp, addr)))
            },
            TransportSettings::Serial { line, .. } => open_serial(settings.mode(), line, limit),
        }
    }
}

#[cfg(feature = "modbus-serial")]
fn open_serial(mode: ModbusMode, line: &SerialLine, limit: Duration) -> Result<Box<dyn Transport>> {
    use super::config::Parity;
    use tokio_serial::SerialPortBuilderExt;

    debug!("{}: {} @{}baud", mode, line.path, line.baud_rate);

    let data_bits = match line.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };
    let stop_bits = match line.stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };
    let parity = match line.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    };

    let port = tokio_serial::new(line.path.as_str(), line.baud_rate)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .timeout(limit)
        .open_native_async()
        .map_err(|e| {
            error!("{} err: {} - {}", mode, line.path, e);
            ComLinkError::transport(format!("Failed to open serial port {}: {}", line.path, e))
        })?;

    info!("{} opened: {}", mode, line.path);
    Ok(Box::new(StreamTransport::new(port, mode, line.path.clone())))
}

#[cfg(not(feature = "modbus-serial"))]
fn open_serial(mode: ModbusMode, line: &SerialLine, _limit: Duration) -> Result<Box<dyn Transport>> {
    Err(ComLinkError::config(format!(
        "{} on {}: serial support not compiled in (enable feature modbus-serial)",
        mode, line.path
    )))
}
