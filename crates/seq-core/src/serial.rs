//! Serial port plumbing shared by every device link.
//!
//! The engine never talks to a concrete port type. Drivers receive a
//! [`DynSerial`], which may be a real `tokio_serial::SerialStream`, a
//! `tokio::io::DuplexStream`, or a simulated device from `seq-sim`.
//!
//! # Feature Flag
//!
//! [`open_serial_async`] requires the `serial` feature (enabled by default).

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control. Opening is wrapped
/// in `spawn_blocking` so enumeration of a slow USB adapter does not stall
/// the runtime.
///
/// # Errors
///
/// Returns an error if the port cannot be opened or spawn_blocking fails.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .context(format!(
                "Failed to open {} serial port: {}",
                device_name_owned, port_path_owned
            ))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

/// Drain stale data from a serial port buffer.
///
/// Reads and discards bytes until nothing arrives for `window`. Used by the
/// command channel after a transaction ended without a clean frame, so the
/// leftovers are never mistaken for the next response.
///
/// Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin + ?Sized>(
    port: &mut R,
    window: Duration,
) -> usize {
    let mut discard = [0u8; 256];
    let mut total_discarded = 0usize;

    loop {
        match tokio::time::timeout(window, port.read(&mut discard)).await {
            Ok(Ok(0)) => break, // EOF
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break, // quiet for a whole window
        }
    }

    total_discarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn drain_discards_pending_bytes() {
        let (mut host, mut device) = tokio::io::duplex(64);
        host.write_all(b"stale data 12345").await.unwrap();

        let discarded = drain_serial_buffer(&mut device, Duration::from_millis(20)).await;
        assert_eq!(discarded, 16);

        let mut buf = [0u8; 1];
        let res = tokio::time::timeout(Duration::from_millis(10), device.read(&mut buf)).await;
        assert!(res.is_err(), "buffer should be empty after drain");
    }

    #[tokio::test]
    async fn boxed_duplex_is_a_serial_port() {
        let (_host, device) = tokio::io::duplex(8);
        let _port: DynSerial = Box::new(device);
    }
}
