//! ECHONET Lite client for the low-voltage smart meter object.
//!
//! Talks UDP to the meter endpoint exposed by a Wi-SUN gateway that already holds the
//! B-route session. Only the Get request/response exchange for the handful of
//! properties the bridge needs is implemented.

use crate::config::MeterConfig;
use crate::error::TransportError;
use crate::reading::CumulativeEnergy;
use crate::transport::MeterTransport;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

pub const EHD1: u8 = 0x10;
pub const EHD2: u8 = 0x81;

/// Controller class group, class, instance
pub const CONTROLLER: [u8; 3] = [0x05, 0xFF, 0x01];
/// Low-voltage smart electric energy meter
pub const SMART_METER: [u8; 3] = [0x02, 0x88, 0x01];

pub const ESV_GET: u8 = 0x62;
pub const ESV_GET_RES: u8 = 0x72;
pub const ESV_GET_SNA: u8 = 0x52;
pub const ESV_INF: u8 = 0x73;

pub const EPC_COEFFICIENT: u8 = 0xD3;
pub const EPC_CUMULATIVE_UNIT: u8 = 0xE1;
pub const EPC_INSTANTANEOUS_POWER: u8 = 0xE7;
pub const EPC_CUMULATIVE_30MIN: u8 = 0xEA;

const MAX_CONNECT_BACKOFF: Duration = Duration::from_secs(60);

const HEADER_LEN: usize = 12;
const NO_DATA_COUNT: u32 = 0xFFFF_FFFE;

#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub epc: u8,
    pub edt: Vec<u8>,
}

/// A format 1 ECHONET Lite frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub tid: u16,
    pub seoj: [u8; 3],
    pub deoj: [u8; 3],
    pub esv: u8,
    pub properties: Vec<Property>,
}

impl Frame {
    pub fn get_request(tid: u16, epc: u8) -> Self {
        Self {
            tid,
            seoj: CONTROLLER,
            deoj: SMART_METER,
            esv: ESV_GET,
            properties: vec![Property {
                epc,
                edt: Vec::new(),
            }],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.properties.len() * 6);
        bytes.extend_from_slice(&[EHD1, EHD2]);
        bytes.extend_from_slice(&self.tid.to_be_bytes());
        bytes.extend_from_slice(&self.seoj);
        bytes.extend_from_slice(&self.deoj);
        bytes.push(self.esv);
        bytes.push(self.properties.len() as u8);
        for property in &self.properties {
            bytes.push(property.epc);
            bytes.push(property.edt.len() as u8);
            bytes.extend_from_slice(&property.edt);
        }
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() < HEADER_LEN {
            return Err(malformed(format!("{} bytes is shorter than a header", bytes.len())));
        }
        if bytes[0] != EHD1 || bytes[1] != EHD2 {
            return Err(malformed(format!(
                "unsupported header {:02X}{:02X}",
                bytes[0], bytes[1]
            )));
        }

        let tid = u16::from_be_bytes([bytes[2], bytes[3]]);
        let seoj = [bytes[4], bytes[5], bytes[6]];
        let deoj = [bytes[7], bytes[8], bytes[9]];
        let esv = bytes[10];
        let opc = bytes[11] as usize;

        let mut properties = Vec::with_capacity(opc);
        let mut rest = &bytes[HEADER_LEN..];
        for _ in 0..opc {
            let [epc, pdc, tail @ ..] = rest else {
                return Err(malformed("truncated property header".to_string()));
            };
            let pdc = *pdc as usize;
            if tail.len() < pdc {
                return Err(malformed(format!(
                    "property 0x{epc:02X} declares {pdc} bytes, {} left",
                    tail.len()
                )));
            }
            properties.push(Property {
                epc: *epc,
                edt: tail[..pdc].to_vec(),
            });
            rest = &tail[pdc..];
        }

        Ok(Self {
            tid,
            seoj,
            deoj,
            esv,
            properties,
        })
    }

    pub fn property(&self, epc: u8) -> Option<&Property> {
        self.properties.iter().find(|property| property.epc == epc)
    }
}

fn malformed(reason: String) -> TransportError {
    TransportError::MalformedFrame(reason)
}

fn fixed<const N: usize>(epc: u8, edt: &[u8]) -> Result<[u8; N], TransportError> {
    edt.try_into().map_err(|_| {
        malformed(format!(
            "property 0x{epc:02X} has {} bytes, expected {N}",
            edt.len()
        ))
    })
}

/// 0xE7, signed watts
pub fn decode_instantaneous_power(edt: &[u8]) -> Result<f64, TransportError> {
    let watts = i32::from_be_bytes(fixed::<4>(EPC_INSTANTANEOUS_POWER, edt)?);
    match watts {
        // overflow, underflow and no-data sentinels
        0x7FFF_FFFF | 0x7FFF_FFFE | i32::MIN => Err(TransportError::NoData(EPC_INSTANTANEOUS_POWER)),
        watts => Ok(f64::from(watts)),
    }
}

/// 0xE1, multiplier applied to cumulative counts to get kWh
pub fn decode_cumulative_unit(edt: &[u8]) -> Result<f64, TransportError> {
    let [unit] = fixed::<1>(EPC_CUMULATIVE_UNIT, edt)?;
    match unit {
        0x00 => Ok(1.0),
        0x01 => Ok(0.1),
        0x02 => Ok(0.01),
        0x03 => Ok(0.001),
        0x04 => Ok(0.0001),
        0x0A => Ok(10.0),
        0x0B => Ok(100.0),
        0x0C => Ok(1000.0),
        0x0D => Ok(10000.0),
        other => Err(malformed(format!("unknown cumulative energy unit 0x{other:02X}"))),
    }
}

/// 0xD3, integer coefficient
pub fn decode_coefficient(edt: &[u8]) -> Result<f64, TransportError> {
    let coefficient = u32::from_be_bytes(fixed::<4>(EPC_COEFFICIENT, edt)?);
    Ok(f64::from(coefficient))
}

/// 0xEA, meter local date and time followed by the cumulative count
pub fn decode_cumulative_30min(
    edt: &[u8],
    multiplier: f64,
) -> Result<CumulativeEnergy, TransportError> {
    let [y0, y1, month, day, hour, minute, second, c0, c1, c2, c3] =
        fixed::<11>(EPC_CUMULATIVE_30MIN, edt)?;
    let year = u16::from_be_bytes([y0, y1]);
    let date_and_time = NaiveDate::from_ymd_opt(year.into(), month.into(), day.into())
        .and_then(|date| date.and_hms_opt(hour.into(), minute.into(), second.into()))
        .ok_or_else(|| {
            malformed(format!(
                "invalid date {year}-{month}-{day} {hour}:{minute}:{second}"
            ))
        })?;

    let count = u32::from_be_bytes([c0, c1, c2, c3]);
    if count == NO_DATA_COUNT {
        return Err(TransportError::NoData(EPC_CUMULATIVE_30MIN));
    }

    Ok(CumulativeEnergy {
        date_and_time,
        kwh: f64::from(count) * multiplier,
    })
}

/// Delay after the given failed connection attempt: 1s, 2s, 4s, ... capped
fn connect_backoff(attempt: u32) -> Duration {
    let secs = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(MAX_CONNECT_BACKOFF)
}

/// ECHONET Lite session with one smart meter
pub struct EchonetTransport {
    socket: Mutex<UdpSocket>,
    meter: SocketAddr,
    timeout: Duration,
    next_tid: AtomicU16,
    energy_multiplier: f64,
}

impl EchonetTransport {
    /// Binds the local socket and reads the meter's cumulative energy scaling
    pub async fn connect(config: &MeterConfig) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(config.bind).await?;
        info!(
            "Connecting to smart meter at {} from {}",
            config.address,
            socket.local_addr()?
        );
        let mut transport = Self {
            socket: Mutex::new(socket),
            meter: config.address,
            timeout: config.timeout,
            next_tid: AtomicU16::new(1),
            energy_multiplier: 1.0,
        };

        let unit = decode_cumulative_unit(&transport.get_property(EPC_CUMULATIVE_UNIT).await?)?;
        let coefficient = match transport.get_property(EPC_COEFFICIENT).await {
            Ok(edt) => decode_coefficient(&edt)?,
            // Coefficient is optional, meters without it use 1
            Err(TransportError::Rejected(_) | TransportError::MissingProperty(_)) => 1.0,
            Err(e) => return Err(e),
        };
        transport.energy_multiplier = unit * coefficient;
        info!("Connected to smart meter, unit {unit}kWh, coefficient {coefficient}");

        Ok(transport)
    }

    /// Connects with exponential backoff between attempts
    pub async fn connect_with_retry(
        config: &MeterConfig,
        max_attempts: u32,
    ) -> Result<Self, TransportError> {
        let mut attempt = 1;
        loop {
            match Self::connect(config).await {
                Ok(transport) => return Ok(transport),
                Err(e) if attempt < max_attempts => {
                    warn!("Smart meter connection attempt {attempt}/{max_attempts} failed: {e}");
                    sleep(connect_backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn energy_multiplier(&self) -> f64 {
        self.energy_multiplier
    }

    async fn get_property(&self, epc: u8) -> Result<Vec<u8>, TransportError> {
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        let request = Frame::get_request(tid, epc).encode();

        let socket = self.socket.lock().await;
        debug!("ECHONET Lite send to {}: {:02X?}", self.meter, request);
        socket.send_to(&request, self.meter).await?;

        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 1500];
        loop {
            let (len, from) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Ok(received) => received?,
                Err(_) => return Err(TransportError::Timeout(self.timeout)),
            };
            debug!("ECHONET Lite data from {from}: {:02X?}", &buf[..len]);
            if from.ip() != self.meter.ip() {
                debug!("Ignoring frame from unexpected node {from}");
                continue;
            }
            let frame = match Frame::decode(&buf[..len]) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("Ignoring undecodable frame: {e}");
                    continue;
                }
            };
            if frame.tid != tid || !matches!(frame.esv, ESV_GET_RES | ESV_GET_SNA) {
                debug!(
                    "Ignoring frame tid {} esv 0x{:02X} while waiting for tid {tid}",
                    frame.tid, frame.esv
                );
                continue;
            }
            if frame.esv == ESV_GET_SNA {
                return Err(TransportError::Rejected(epc));
            }
            return match frame.property(epc) {
                Some(property) => Ok(property.edt.clone()),
                None => Err(TransportError::MissingProperty(epc)),
            };
        }
    }
}

#[async_trait]
impl MeterTransport for EchonetTransport {
    async fn read_instantaneous_power(&self) -> Result<f64, TransportError> {
        decode_instantaneous_power(&self.get_property(EPC_INSTANTANEOUS_POWER).await?)
    }

    async fn read_cumulative_energy(&self) -> Result<CumulativeEnergy, TransportError> {
        let edt = self.get_property(EPC_CUMULATIVE_30MIN).await?;
        decode_cumulative_30min(&edt, self.energy_multiplier)
    }
}
