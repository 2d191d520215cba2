//! USB transport (`spec.md` §4.1): BitBox02, framed as 64-byte HID-over-USB reports exchanged
//! over interrupt transfers (the same U2FHID-style chunking WebUSB-based BitBox02 clients use).
//!
//! Frame layout: first packet is `cid(4) || cmd(1) || len_be(2) || data...`, continuation packets
//! are `cid(4) || seq_be(1) || data...`, both padded to the 64-byte report size.

use async_trait::async_trait;
use rusb::{Device, DeviceHandle, GlobalContext};
use std::time::Duration;

use crate::error::Error;
use crate::transport::Transport;

const REPORT_SIZE: usize = 64;
const BITBOX02_VID: u16 = 0x03eb;
const BITBOX02_PID: u16 = 0x2403;
const DEFAULT_CID: [u8; 4] = [0xff, 0xff, 0xff, 0xff];
const CMD_HWW: u8 = 0x80 | 0x40;

pub struct UsbTransport {
    handle: DeviceHandle<GlobalContext>,
    endpoint_out: u8,
    endpoint_in: u8,
    cid: [u8; 4],
    timeout: Duration,
}

impl UsbTransport {
    /// `timeout` is the per-report interrupt-transfer deadline (`spec.md` §4.2's per-roundtrip
    /// deadline), applied to both the write and every read of a (possibly multi-frame) reply.
    pub fn open_first(timeout: Duration) -> Result<Self, Error> {
        let device = find_device()?;
        let handle = device
            .open()
            .map_err(|e| Error::Internal(format!("opening BitBox02 USB device: {}", e), None))?;
        handle
            .claim_interface(0)
            .map_err(|e| Error::Internal(format!("claiming BitBox02 USB interface: {}", e), None))?;
        Ok(UsbTransport {
            handle,
            // Endpoints 0x81 (IN) / 0x01 (OUT) match BitBox02's documented USB-HID interface.
            endpoint_out: 0x01,
            endpoint_in: 0x81,
            cid: DEFAULT_CID,
            timeout,
        })
    }

    fn write_frame(&self, payload: &[u8]) -> Result<(), Error> {
        let mut offset = 0usize;
        let mut seq: u8 = 0;
        while offset < payload.len() || (offset == 0 && payload.is_empty()) {
            let mut report = [0u8; REPORT_SIZE];
            report[0..4].copy_from_slice(&self.cid);
            let header_len;
            if offset == 0 {
                report[4] = CMD_HWW;
                let len = payload.len() as u16;
                report[5..7].copy_from_slice(&len.to_be_bytes());
                header_len = 7;
            } else {
                report[4] = seq;
                header_len = 5;
                seq += 1;
            }
            let chunk_len = (REPORT_SIZE - header_len).min(payload.len() - offset);
            report[header_len..header_len + chunk_len]
                .copy_from_slice(&payload[offset..offset + chunk_len]);
            self.handle
                .write_interrupt(self.endpoint_out, &report, self.timeout)
                .map_err(|e| Error::Internal(format!("writing to BitBox02: {}", e), None))?;
            offset += chunk_len;
            if payload.is_empty() {
                break;
            }
        }
        Ok(())
    }

    fn read_frame(&self) -> Result<Vec<u8>, Error> {
        let mut report = [0u8; REPORT_SIZE];
        let n = self
            .handle
            .read_interrupt(self.endpoint_in, &mut report, Duration::from_secs(60))
            .map_err(|e| Error::Internal(format!("reading from BitBox02: {}", e), None))?;
        if n < 7 {
            return Err(Error::Protocol("BitBox02 reply shorter than frame header".to_string()));
        }
        let total_len = u16::from_be_bytes([report[5], report[6]]) as usize;
        let mut data = Vec::with_capacity(total_len);
        let first_chunk = total_len.min(REPORT_SIZE - 7);
        data.extend_from_slice(&report[7..7 + first_chunk]);
        while data.len() < total_len {
            let n = self
                .handle
                .read_interrupt(self.endpoint_in, &mut report, self.timeout)
                .map_err(|_| Error::TransportLost)?;
            let _ = n;
            let remaining = total_len - data.len();
            let chunk = remaining.min(REPORT_SIZE - 5);
            data.extend_from_slice(&report[5..5 + chunk]);
        }
        Ok(data)
    }
}

fn find_device() -> Result<Device<GlobalContext>, Error> {
    let devices = rusb::devices().map_err(|e| Error::Unsupported(format!("libusb: {}", e)))?;
    for device in devices.iter() {
        if let Ok(desc) = device.device_descriptor() {
            if desc.vendor_id() == BITBOX02_VID && desc.product_id() == BITBOX02_PID {
                return Ok(device);
            }
        }
    }
    Err(Error::NotConnected)
}

#[async_trait]
impl Transport for UsbTransport {
    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, Error> {
        self.write_frame(request)?;
        self.read_frame()
    }

    async fn close(&mut self) -> Result<(), Error> {
        let _ = self.handle.release_interface(0);
        Ok(())
    }
}
