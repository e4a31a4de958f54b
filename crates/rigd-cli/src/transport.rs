//! Line transport over character devices.
//!
//! Serial adapters and USB bridge consoles show up as character devices
//! (`/dev/ttyUSB0`, `/dev/ttyACM0`); this transport does buffered
//! newline-delimited I/O over one, assuming the port itself was configured
//! out of band (udev rules, `stty`). Read timeouts are imposed by the
//! transport permit, not here.

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use rigd_core::manager::TransportFactory;
use rigd_core::peripheral::PeripheralDescriptor;
use rigd_core::transport::{Transport, TransportError};
use rigd_core::BoxFuture;

/// Newline-delimited I/O over an open character device.
pub struct LineFileTransport {
    file: File,
    buf: Vec<u8>,
}

impl LineFileTransport {
    /// Wrap an already opened device file.
    pub fn new(file: File) -> Self {
        Self {
            file,
            buf: Vec::new(),
        }
    }

    /// Take one complete line out of the buffer, if present.
    fn take_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned())
    }
}

impl Transport for LineFileTransport {
    fn send_line<'a>(&'a mut self, line: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.file.write_all(line.as_bytes()).await?;
            self.file.write_all(b"\n").await?;
            self.file.flush().await?;
            Ok(())
        })
    }

    fn recv_line(&mut self) -> BoxFuture<'_, Result<String, TransportError>> {
        Box::pin(async move {
            loop {
                if let Some(line) = self.take_line() {
                    return Ok(line);
                }
                let mut chunk = [0u8; 256];
                let n = self.file.read(&mut chunk).await?;
                if n == 0 {
                    return Err(TransportError::Closed);
                }
                self.buf.extend_from_slice(&chunk[..n]);
            }
        })
    }
}

/// Opens each peripheral's address as a read/write character device.
pub struct CharDeviceFactory;

impl TransportFactory for CharDeviceFactory {
    fn open<'a>(
        &'a self,
        descriptor: &'a PeripheralDescriptor,
    ) -> BoxFuture<'a, Result<Box<dyn Transport>, TransportError>> {
        Box::pin(async move {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&descriptor.address)
                .await
                .map_err(TransportError::Failure)?;
            Ok(Box::new(LineFileTransport::new(file)) as Box<dyn Transport>)
        })
    }
}
