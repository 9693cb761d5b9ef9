//! The serial port as a small async capability, so the protocol engine's
//! state machine can be exercised against an in-memory fake instead of a
//! real device.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::PortError;

/// Descriptor match used by device discovery.
pub const EXPECTED_DESCRIPTOR_PREFIX: &str = "EiBotBoard";
pub const EXPECTED_VID_PID: (u16, u16) = (0x04D8, 0xFD92);

#[async_trait]
pub trait SerialPort: Send + Sync {
    /// Writes `bytes` to the device.
    async fn write(&self, bytes: &[u8]) -> Result<(), PortError>;

    /// Flushes any buffered output.
    async fn flush(&self) -> Result<(), PortError>;

    /// Waits for at least one chunk of inbound bytes. Returns an empty
    /// vector on a clean EOF (remote closed the connection).
    async fn recv(&self) -> Result<Vec<u8>, PortError>;
}

/// A real serial connection to an EBB-class device, built on `serial2-tokio`.
pub struct Serial2Port {
    reader: Mutex<tokio::io::ReadHalf<serial2_tokio::SerialPort>>,
    writer: Mutex<tokio::io::WriteHalf<serial2_tokio::SerialPort>>,
}

impl Serial2Port {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, PortError> {
        let port = serial2_tokio::SerialPort::open(path, baud_rate).map_err(|e| PortError::Open {
            port: path.to_string(),
            reason: e.to_string(),
        })?;
        let (reader, writer) = tokio::io::split(port);
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        })
    }

    /// Scans available serial ports for one matching the expected
    /// descriptor prefix or VID:PID.
    pub fn discover() -> Result<String, PortError> {
        let ports = serialport::available_ports()
            .map_err(|e| PortError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
        ports
            .into_iter()
            .find(|p| match &p.port_type {
                serialport::SerialPortType::UsbPort(usb) => {
                    let descriptor_match = usb
                        .product
                        .as_deref()
                        .is_some_and(|product| product.starts_with(EXPECTED_DESCRIPTOR_PREFIX));
                    let vid_pid_match = (usb.vid, usb.pid) == EXPECTED_VID_PID;
                    descriptor_match || vid_pid_match
                }
                _ => false,
            })
            .map(|p| p.port_name)
            .ok_or(PortError::NoDeviceFound)
    }
}

#[async_trait]
impl SerialPort for Serial2Port {
    async fn write(&self, bytes: &[u8]) -> Result<(), PortError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await.map_err(PortError::Io)?;
        writer.flush().await.map_err(PortError::Io)
    }

    async fn flush(&self) -> Result<(), PortError> {
        let mut writer = self.writer.lock().await;
        writer.flush().await.map_err(PortError::Io)
    }

    async fn recv(&self) -> Result<Vec<u8>, PortError> {
        let mut buf = vec![0u8; 256];
        let mut reader = self.reader.lock().await;
        let n = reader.read(&mut buf).await.map_err(PortError::Io)?;
        buf.truncate(n);
        Ok(buf)
    }
}

/// In-memory fake used by tests: a scripted set of inbound chunks and a
/// record of everything written to it.
pub struct FakePort {
    inbound: Mutex<tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>>,
    written: Mutex<Vec<Vec<u8>>>,
}

impl FakePort {
    pub fn new() -> (Arc<Self>, tokio::sync::mpsc::UnboundedSender<Vec<u8>>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Arc::new(Self {
                inbound: Mutex::new(rx),
                written: Mutex::new(Vec::new()),
            }),
            tx,
        )
    }

    pub async fn written_commands(&self) -> Vec<String> {
        self.written
            .lock()
            .await
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }
}

#[async_trait]
impl SerialPort for FakePort {
    async fn write(&self, bytes: &[u8]) -> Result<(), PortError> {
        self.written.lock().await.push(bytes.to_vec());
        Ok(())
    }

    async fn flush(&self) -> Result<(), PortError> {
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, PortError> {
        let mut rx = self.inbound.lock().await;
        Ok(rx.recv().await.unwrap_or_default())
    }
}
