//! ECHONET Lite property reads for the LAN energy-management device
//!
//! This module provides the minimal slice of the ECHONET Lite protocol the
//! controller needs: a single-property GET (ESV 0x62) over UDP with an
//! explicit timeout, and decoding of the numeric property payloads. Protocol
//! discovery and the wider property surface are out of scope.

use crate::config::TelemetryConfig;
use crate::error::TelemetryError;
use crate::logging::get_logger;
use crate::telemetry::{DeviceClass, PropertyId, PropertyReader};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// EHD1/EHD2 header bytes of every ECHONET Lite frame
const EHD: [u8; 2] = [0x10, 0x81];

/// Source object: controller class, instance 1
const SEOJ: [u8; 3] = [0x05, 0xFF, 0x01];

/// Service code: property read request
const ESV_GET: u8 = 0x62;

/// Service code: property read response
const ESV_GET_RES: u8 = 0x72;

/// Service code: property read rejected
const ESV_GET_SNA: u8 = 0x52;

/// UDP client issuing single-property GET requests
pub struct EchonetClient {
    host: String,
    port: u16,
    read_timeout: Duration,
    solar_instance: u8,
    battery_instance: u8,
    tid: AtomicU16,
    logger: crate::logging::StructuredLogger,
}

impl EchonetClient {
    /// Create a new client from telemetry configuration
    pub fn new(config: &TelemetryConfig) -> Self {
        let logger = get_logger("echonet");
        Self {
            host: config.host.clone(),
            port: config.port,
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            solar_instance: config.solar_instance,
            battery_instance: config.battery_instance,
            tid: AtomicU16::new(1),
            logger,
        }
    }

    /// Destination object for a property's host device
    fn deoj(&self, property: PropertyId) -> [u8; 3] {
        let device = property.device();
        let class = device.class_code();
        let instance = match device {
            DeviceClass::Solar => self.solar_instance,
            DeviceClass::Battery => self.battery_instance,
        };
        [class[0], class[1], instance]
    }

    async fn exchange(&self, request: &[u8]) -> Result<Vec<u8>, TelemetryError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| TelemetryError::unreachable(format!("UDP bind failed: {}", e)))?;

        let target = format!("{}:{}", self.host, self.port);
        socket
            .send_to(request, &target)
            .await
            .map_err(|e| TelemetryError::unreachable(format!("send to {} failed: {}", target, e)))?;

        let mut buf = [0u8; 512];
        let (len, _peer) = timeout(self.read_timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| {
                TelemetryError::timeout(format!(
                    "no response from {} within {:?}",
                    target, self.read_timeout
                ))
            })?
            .map_err(|e| TelemetryError::unreachable(format!("receive failed: {}", e)))?;

        Ok(buf[..len].to_vec())
    }
}

#[async_trait::async_trait]
impl PropertyReader for EchonetClient {
    async fn read_property(&self, property: PropertyId) -> Result<i64, TelemetryError> {
        let tid = self.tid.fetch_add(1, Ordering::Relaxed);
        let request = encode_get_request(tid, self.deoj(property), property.epc());

        self.logger.debug(&format!(
            "GET {:?} (EPC 0x{:02X}) tid={}",
            property,
            property.epc(),
            tid
        ));

        let response = self.exchange(&request).await?;
        let edt = parse_get_response(&response, tid, property.epc())?;
        let value = decode_numeric_edt(&edt)?;

        self.logger
            .trace(&format!("{:?} = {} ({} bytes)", property, value, edt.len()));
        Ok(value)
    }
}

/// Encode a single-property GET frame
pub fn encode_get_request(tid: u16, deoj: [u8; 3], epc: u8) -> Vec<u8> {
    let mut frame = Vec::with_capacity(14);
    frame.extend_from_slice(&EHD);
    frame.extend_from_slice(&tid.to_be_bytes());
    frame.extend_from_slice(&SEOJ);
    frame.extend_from_slice(&deoj);
    frame.push(ESV_GET);
    frame.push(1); // OPC
    frame.push(epc);
    frame.push(0); // PDC: no payload on a read
    frame
}

/// Parse a GET response frame and return the raw property payload
pub fn parse_get_response(frame: &[u8], tid: u16, epc: u8) -> Result<Vec<u8>, TelemetryError> {
    if frame.len() < 14 {
        return Err(TelemetryError::malformed(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }
    if frame[0..2] != EHD {
        return Err(TelemetryError::malformed("bad EHD header"));
    }
    let frame_tid = u16::from_be_bytes([frame[2], frame[3]]);
    if frame_tid != tid {
        return Err(TelemetryError::malformed(format!(
            "transaction id mismatch: expected {}, got {}",
            tid, frame_tid
        )));
    }

    let esv = frame[10];
    if esv == ESV_GET_SNA {
        return Err(TelemetryError::malformed(format!(
            "device rejected read of EPC 0x{:02X}",
            epc
        )));
    }
    if esv != ESV_GET_RES {
        return Err(TelemetryError::malformed(format!(
            "unexpected service code 0x{:02X}",
            esv
        )));
    }

    let opc = frame[11] as usize;
    let mut offset = 12;
    for _ in 0..opc {
        if frame.len() < offset + 2 {
            return Err(TelemetryError::malformed("truncated property block"));
        }
        let prop_epc = frame[offset];
        let pdc = frame[offset + 1] as usize;
        offset += 2;
        if frame.len() < offset + pdc {
            return Err(TelemetryError::malformed("truncated property payload"));
        }
        if prop_epc == epc {
            if pdc == 0 {
                return Err(TelemetryError::malformed(format!(
                    "empty payload for EPC 0x{:02X}",
                    epc
                )));
            }
            return Ok(frame[offset..offset + pdc].to_vec());
        }
        offset += pdc;
    }

    Err(TelemetryError::malformed(format!(
        "EPC 0x{:02X} missing from response",
        epc
    )))
}

/// Decode a numeric property payload
///
/// One-byte payloads are unsigned (percentages), two-byte payloads are
/// unsigned shorts (generation watts), four-byte payloads are signed longs
/// (grid and battery flows).
pub fn decode_numeric_edt(edt: &[u8]) -> Result<i64, TelemetryError> {
    match edt.len() {
        1 => Ok(edt[0] as i64),
        2 => Ok(u16::from_be_bytes([edt[0], edt[1]]) as i64),
        4 => Ok(i32::from_be_bytes([edt[0], edt[1], edt[2], edt[3]]) as i64),
        n => Err(TelemetryError::malformed(format!(
            "unsupported payload width: {} bytes",
            n
        ))),
    }
}
