use std::fs;
use std::time::Duration;

use anyhow::Result;
use glob::glob;
use log::debug;
use serialport::SerialPort;
use thiserror::Error;

use crate::protocol::Transport;

#[derive(Error, Debug)]
pub enum OpenPortError {
    #[error("{port_name:?} busy")]
    PortBusy { port_name: String },
}

/// Open a serial port for the instrument. Refuses a port some other process
/// already holds open unless `force` is set.
pub fn open_port(
    port_name: &str,
    baudrate: u32,
    timeout: Duration,
    force: bool,
) -> Result<Box<dyn Transport + Send>> {
    if !force && is_port_open(port_name) {
        return Err(OpenPortError::PortBusy {
            port_name: port_name.to_string(),
        }
        .into());
    }

    let mut port = serialport::new(port_name, baudrate).open_native()?;
    port.set_timeout(timeout)?;

    debug!("open_port OK: {} @ {} baud", port_name, baudrate);
    Ok(Box::new(port))
}

fn is_port_open(port_name: &str) -> bool {
    glob("/proc/[0-9]*/fd/*")
        .unwrap()
        .filter_map(|path| path.ok())
        .filter_map(|path| fs::read_link(path).ok())
        .any(|link| link.to_str() == Some(port_name))
}
