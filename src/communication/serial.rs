// src/communication/serial.rs - Serial endpoint abstraction
use async_trait::async_trait;
use std::io;
use std::sync::Arc;

/// One open serial endpoint. Reads and writes take `&self` so a reader task
/// and the owning device task can share it.
#[async_trait]
pub trait SerialLink: Send + Sync {
    /// Returns `Ok(0)` once the endpoint is closed.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    async fn write(&self, buf: &[u8]) -> io::Result<usize>;

    async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "serial write returned 0"));
            }
            buf = &buf[n..];
        }
        Ok(())
    }
}

/// Opens links by port name.
#[async_trait]
pub trait SerialConnector: Send + Sync {
    async fn open(&self, port: &str, baud: u32) -> io::Result<Arc<dyn SerialLink>>;

    fn available_ports(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Real hardware through serial2-tokio.
#[derive(Debug, Default, Clone, Copy)]
pub struct Serial2Connector;

pub struct Serial2Link {
    port: serial2_tokio::SerialPort,
}

#[async_trait]
impl SerialLink for Serial2Link {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf).await
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf).await
    }
}

#[async_trait]
impl SerialConnector for Serial2Connector {
    async fn open(&self, port: &str, baud: u32) -> io::Result<Arc<dyn SerialLink>> {
        let port = serial2_tokio::SerialPort::open(port, baud)?;
        Ok(Arc::new(Serial2Link { port }))
    }

    fn available_ports(&self) -> Vec<String> {
        match serial2_tokio::SerialPort::available_ports() {
            Ok(paths) => paths.iter().map(|p| p.display().to_string()).collect(),
            Err(_) => vec![],
        }
    }
}
