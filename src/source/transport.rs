use std::io::{self, BufRead, Read, Write};
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc;

use super::SourceError;

pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Chunks read from an open port. The sender side closing means the device
/// went away; dropping the receiver releases the port.
pub type ChunkReceiver = mpsc::Receiver<io::Result<Vec<u8>>>;

const CHUNK_QUEUE_DEPTH: usize = 64;
const READ_BUFFER_BYTES: usize = 1024;

/// Picks the device to open. `None` means the user backed out.
pub trait PortSelector: Send + Sync + 'static {
    fn select(&self, available: &[String]) -> Option<String>;
}

/// Always picks the configured port, listed or not.
pub struct FixedPort(pub String);

impl PortSelector for FixedPort {
    fn select(&self, _available: &[String]) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Asks on the terminal. An empty answer cancels.
pub struct StdinPortSelector;

impl PortSelector for StdinPortSelector {
    fn select(&self, available: &[String]) -> Option<String> {
        let mut stderr = io::stderr();
        if available.is_empty() {
            let _ = writeln!(stderr, "No serial ports detected.");
        }
        for (index, port) in available.iter().enumerate() {
            let _ = writeln!(stderr, "  [{index}] {port}");
        }
        let _ = write!(stderr, "Select a port (number or path, empty to cancel): ");
        let _ = stderr.flush();

        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer).ok()?;
        pick_port(available, &answer)
    }
}

fn pick_port(available: &[String], answer: &str) -> Option<String> {
    let answer = answer.trim();
    if answer.is_empty() {
        return None;
    }
    match answer.parse::<usize>() {
        Ok(index) => available.get(index).cloned(),
        Err(_) => Some(answer.to_string()),
    }
}

/// Byte-stream transport underneath the serial adapter.
///
/// Both calls may block; the adapter runs them off the async workers.
pub trait SerialTransport: Send + Sync + 'static {
    fn list_ports(&self) -> Result<Vec<String>, SourceError>;
    fn open(&self, port: &str, baud_rate: u32) -> Result<ChunkReceiver, SourceError>;
}

/// Real serial ports through the `serialport` crate.
///
/// Each open port gets a reader thread that forwards chunks until the device
/// disappears or the receiver is dropped.
pub struct SystemSerialTransport {
    read_timeout: Duration,
}

impl SystemSerialTransport {
    pub fn new() -> Self {
        Self {
            read_timeout: Duration::from_millis(200),
        }
    }
}

impl Default for SystemSerialTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialTransport for SystemSerialTransport {
    fn list_ports(&self) -> Result<Vec<String>, SourceError> {
        serialport::available_ports()
            .map(|ports| ports.into_iter().map(|info| info.port_name).collect())
            .map_err(|err| SourceError::UnsupportedEnvironment(err.to_string()))
    }

    fn open(&self, port: &str, baud_rate: u32) -> Result<ChunkReceiver, SourceError> {
        let open_failed = |reason: String| SourceError::TransportOpenFailed {
            port: port.to_string(),
            reason,
        };

        let mut handle = serialport::new(port, baud_rate)
            .timeout(self.read_timeout)
            .open()
            .map_err(|err| open_failed(err.to_string()))?;

        let (tx, rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
        thread::Builder::new()
            .name(format!("serial-{}", port.rsplit('/').next().unwrap_or(port)))
            .spawn(move || {
                let mut buf = [0u8; READ_BUFFER_BYTES];
                while !tx.is_closed() {
                    match handle.read(&mut buf) {
                        Ok(0) => break,
                        Ok(read) => {
                            if tx.blocking_send(Ok(buf[..read].to_vec())).is_err() {
                                break;
                            }
                        }
                        Err(err) if err.kind() == io::ErrorKind::TimedOut => continue,
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => {
                            let _ = tx.blocking_send(Err(err));
                            break;
                        }
                    }
                }
                // `handle` drops here and the port is released.
            })
            .map_err(|err| open_failed(err.to_string()))?;

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_answers() {
        let ports = vec!["/dev/ttyUSB0".to_string(), "/dev/ttyACM0".to_string()];
        assert_eq!(pick_port(&ports, "1\n"), Some("/dev/ttyACM0".to_string()));
        assert_eq!(pick_port(&ports, "/dev/ttyS3"), Some("/dev/ttyS3".to_string()));
        assert_eq!(pick_port(&ports, "  \n"), None);
        assert_eq!(pick_port(&ports, "7"), None);
    }

    #[test]
    fn fixed_port_ignores_listing() {
        assert_eq!(
            FixedPort("/dev/ttyUSB9".into()).select(&[]),
            Some("/dev/ttyUSB9".to_string())
        );
    }
}
