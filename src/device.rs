//! Typed query surface of the Laser Falcon methane detector.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use crate::port;
use crate::protocol::{self, Transport};

const CMD_VERSION: &[u8] = b"ETC:VER ?;";
const CMD_SETTINGS: &[u8] = b"CMN:ALL ?;";
const CMD_MEASUREMENT: &[u8] = b"ETC:FWD ?;";

/// error, main value, then five samples of four fields each
const MEASUREMENT_FIELDS: usize = 22;

/// Error code the instrument reports for a clean measurement.
const MEASUREMENT_OK: i32 = 1;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("unrecognized response '{0}'")]
    MalformedResponse(String),
    #[error("expected {expected} measurement fields, got {got}")]
    FieldCount { expected: usize, got: usize },
    #[error("bad field '{0}'")]
    BadField(String),
}

/// Settings dump as reported by `CMN:ALL ?;`, values kept as text.
pub type Settings = HashMap<String, String>;

/// One of the five sub-readings inside a measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementSample {
    pub value: i32,
    pub freq1: f64,
    pub freq2: f64,
    pub time: i32,
}

/// One single-shot measurement: instrument error code, averaged main value
/// and the five individual samples it was combined from.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub error: i32,
    pub main_value: i32,
    pub samples: Vec<MeasurementSample>,
}

impl Measurement {
    pub fn is_ok(&self) -> bool {
        self.error == MEASUREMENT_OK
    }
}

/// A Laser Falcon instrument on the other end of a serial line. Owns the
/// port for its whole lifetime; one transaction at a time.
pub struct Device {
    port: Box<dyn Transport + Send>,
}

impl Device {
    pub fn new(port: Box<dyn Transport + Send>) -> Self {
        Device { port }
    }

    /// Open the named serial port and wrap it in a device handle.
    pub fn open(port_name: &str, baudrate: u32, timeout: Duration, force: bool) -> Result<Self> {
        Ok(Device::new(port::open_port(port_name, baudrate, timeout, force)?))
    }

    /// Send a raw command body and return the response payload, framing and
    /// handshake already taken care of.
    pub fn send_command(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        protocol::transact(self.port.as_mut(), command)
    }

    /// Firmware version token as reported by the instrument.
    pub fn get_version(&mut self) -> Result<String> {
        lazy_static! {
            static ref VERSION_RE: Regex = Regex::new("ETC:VER ([^;]*);").unwrap();
        }

        let response = self.send_command(CMD_VERSION)?;
        let text = String::from_utf8_lossy(&response);

        let version = VERSION_RE
            .captures(&text)
            .ok_or_else(|| DeviceError::MalformedResponse(text.to_string()))?
            .get(1)
            .unwrap()
            .as_str()
            .to_string();
        Ok(version)
    }

    /// Full settings dump as a key/value map.
    pub fn get_settings(&mut self) -> Result<Settings> {
        let response = self.send_command(CMD_SETTINGS)?;
        let text = String::from_utf8_lossy(&response);

        let body = text
            .split_once("CMN:")
            .map(|(_, rest)| rest)
            .ok_or_else(|| DeviceError::MalformedResponse(text.to_string()))?;
        let body = body
            .strip_suffix(';')
            .ok_or_else(|| DeviceError::MalformedResponse(text.to_string()))?;

        let mut settings = Settings::new();
        for pair in body.split(';') {
            let (key, value) = pair
                .split_once(' ')
                .ok_or_else(|| DeviceError::BadField(pair.to_string()))?;
            settings.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(settings)
    }

    /// Trigger a single-shot measurement and parse the 22-field reply.
    pub fn get_measurement(&mut self) -> Result<Measurement> {
        let response = self.send_command(CMD_MEASUREMENT)?;
        let text = String::from_utf8_lossy(&response);

        let body = text
            .split_once("ETC:FWD ")
            .map(|(_, rest)| rest)
            .ok_or_else(|| DeviceError::MalformedResponse(text.to_string()))?;
        let body = body
            .strip_suffix(';')
            .ok_or_else(|| DeviceError::MalformedResponse(text.to_string()))?;

        let fields: Vec<&str> = body.split(';').collect();
        if fields.len() != MEASUREMENT_FIELDS {
            return Err(DeviceError::FieldCount {
                expected: MEASUREMENT_FIELDS,
                got: fields.len(),
            }
            .into());
        }

        let error = parse_field(fields[0])?;
        let main_value = parse_field(fields[1])?;

        let mut samples = Vec::with_capacity(5);
        for (value, freq1, freq2, time) in fields[2..].iter().tuples() {
            samples.push(MeasurementSample {
                value: parse_field(value)?,
                freq1: parse_field(freq1)?,
                freq2: parse_field(freq2)?,
                time: parse_field(time)?,
            });
        }

        Ok(Measurement {
            error,
            main_value,
            samples,
        })
    }
}

fn parse_field<T: FromStr>(field: &str) -> Result<T, DeviceError> {
    field
        .trim()
        .parse()
        .map_err(|_| DeviceError::BadField(field.to_string()))
}
