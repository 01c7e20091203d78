// src/diag/obd2.rs
//
// OBD-II (SAE J1979) engine.
//
// Requests are two bytes, `[mode, pid]`, sent to the 0x7DF functional
// address; ECUs answer from 0x7E8..0x7EB with `[mode | 0x40, pid, A, B, ...]`.
// PID values decode from the A and B data bytes per the standard formulas.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::Serialize;
use tokio::sync::broadcast;

use super::dtc::Dtc;
use super::{DiagCore, DiagEvent};
use crate::error::{Error, Result};
use crate::session::CanSession;

/// OBD-II service modes (SAE J1979).
pub mod services {
    pub const SHOW_CURRENT_DATA: u8 = 0x01;
    pub const SHOW_FREEZE_FRAME_DATA: u8 = 0x02;
    pub const SHOW_STORED_DTC: u8 = 0x03;
    pub const CLEAR_DTC: u8 = 0x04;
    pub const SHOW_PENDING_DTC: u8 = 0x07;
    pub const REQUEST_VEHICLE_INFO: u8 = 0x09;
}

/// Mode 01 parameter IDs.
pub mod pids {
    pub const ENGINE_LOAD: u8 = 0x04;
    pub const COOLANT_TEMP: u8 = 0x05;
    pub const FUEL_PRESSURE: u8 = 0x0A;
    pub const INTAKE_MANIFOLD_PRESSURE: u8 = 0x0B;
    pub const ENGINE_RPM: u8 = 0x0C;
    pub const VEHICLE_SPEED: u8 = 0x0D;
    pub const TIMING_ADVANCE: u8 = 0x0E;
    pub const INTAKE_AIR_TEMP: u8 = 0x0F;
    pub const MAF_RATE: u8 = 0x10;
    pub const THROTTLE_POSITION: u8 = 0x11;
}

/// Mode 09 info types.
pub mod info_types {
    pub const VIN: u8 = 0x02;
    pub const CALIBRATION_ID: u8 = 0x04;
    pub const ECU_NAME: u8 = 0x0A;
}

/// Default per-request deadline.
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Gap between requests when reading several PIDs in sequence.
const MULTI_PID_SPACING: Duration = Duration::from_millis(50);

static PID_NAMES: Lazy<HashMap<u8, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (pids::ENGINE_LOAD, "Engine Load"),
        (pids::COOLANT_TEMP, "Coolant Temperature"),
        (pids::FUEL_PRESSURE, "Fuel Pressure"),
        (pids::INTAKE_MANIFOLD_PRESSURE, "Intake Manifold Pressure"),
        (pids::ENGINE_RPM, "Engine RPM"),
        (pids::VEHICLE_SPEED, "Vehicle Speed"),
        (pids::TIMING_ADVANCE, "Timing Advance"),
        (pids::INTAKE_AIR_TEMP, "Intake Air Temperature"),
        (pids::MAF_RATE, "MAF Air Flow Rate"),
        (pids::THROTTLE_POSITION, "Throttle Position"),
    ])
});

/// Display name for a PID.
pub fn pid_name(pid: u8) -> String {
    PID_NAMES
        .get(&pid)
        .map(|name| name.to_string())
        .unwrap_or_else(|| format!("PID 0x{:02X}", pid))
}

/// Decode the scaled value from the A and B data bytes. Unlisted PIDs fall
/// back to the raw A byte.
pub fn decode_pid_value(pid: u8, a: u8, b: u8) -> f64 {
    let (a, b) = (a as f64, b as f64);
    match pid {
        pids::ENGINE_LOAD => a * 100.0 / 255.0,
        pids::COOLANT_TEMP => a - 40.0,
        pids::FUEL_PRESSURE => a * 3.0,
        pids::INTAKE_MANIFOLD_PRESSURE => a,
        pids::ENGINE_RPM => (a * 256.0 + b) / 4.0,
        pids::VEHICLE_SPEED => a,
        pids::TIMING_ADVANCE => a / 2.0 - 64.0,
        pids::INTAKE_AIR_TEMP => a - 40.0,
        pids::MAF_RATE => (a * 256.0 + b) / 100.0,
        pids::THROTTLE_POSITION => a * 100.0 / 255.0,
        _ => a,
    }
}

/// Unit string for a PID, empty when unknown.
pub fn pid_unit(pid: u8) -> &'static str {
    match pid {
        pids::ENGINE_LOAD | pids::THROTTLE_POSITION => "%",
        pids::COOLANT_TEMP | pids::INTAKE_AIR_TEMP => "°C",
        pids::FUEL_PRESSURE | pids::INTAKE_MANIFOLD_PRESSURE => "kPa",
        pids::ENGINE_RPM => "rpm",
        pids::VEHICLE_SPEED => "km/h",
        pids::TIMING_ADVANCE => "°",
        pids::MAF_RATE => "g/s",
        _ => "",
    }
}

/// A decoded live-data parameter.
#[derive(Clone, Debug, Serialize)]
pub struct PidValue {
    pub pid: u8,
    pub name: String,
    pub value: f64,
    pub unit: &'static str,
}

impl std::fmt::Display for PidValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.unit.is_empty() {
            write!(f, "{}: {:.2}", self.name, self.value)
        } else {
            write!(f, "{}: {:.2} {}", self.name, self.value, self.unit)
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// OBD-II engine bound to one session. Clones share state.
#[derive(Clone)]
pub struct Obd2Client {
    core: Arc<DiagCore>,
}

impl Obd2Client {
    pub fn new(session: CanSession) -> Self {
        Self {
            core: Arc::new(DiagCore::new(session, DEFAULT_TIMEOUT)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiagEvent> {
        self.core.subscribe()
    }

    pub fn set_request_id(&self, can_id: u32) {
        self.core.set_request_id(can_id);
    }

    pub fn set_response_id(&self, can_id: u32) {
        self.core.set_response_id(can_id);
    }

    pub fn set_exact_response_match(&self, exact: bool) {
        self.core.set_exact_response_match(exact);
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.core.set_timeout(timeout);
    }

    // ------------------------------------------------------------------
    // Live data
    // ------------------------------------------------------------------

    /// Request one PID and decode the reply.
    pub async fn read_pid(&self, mode: u8, pid: u8) -> Result<PidValue> {
        let response = self.core.execute(&[mode, pid], Some(pid)).await?;
        if response.len() < 3 {
            return Err(Error::MalformedPdu(format!(
                "PID 0x{:02X} response too short: {} bytes",
                pid,
                response.len()
            )));
        }
        let a = response[2];
        let b = response.get(3).copied().unwrap_or(0);
        Ok(PidValue {
            pid,
            name: pid_name(pid),
            value: decode_pid_value(pid, a, b),
            unit: pid_unit(pid),
        })
    }

    /// Read several PIDs in sequence with a 50 ms gap between requests.
    /// PIDs that fail are skipped.
    pub async fn read_pids(&self, mode: u8, pid_list: &[u8]) -> HashMap<u8, PidValue> {
        let mut values = HashMap::new();
        for (i, pid) in pid_list.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(MULTI_PID_SPACING).await;
            }
            if let Ok(value) = self.read_pid(mode, *pid).await {
                values.insert(*pid, value);
            }
        }
        values
    }

    pub async fn engine_rpm(&self) -> Result<f64> {
        Ok(self
            .read_pid(services::SHOW_CURRENT_DATA, pids::ENGINE_RPM)
            .await?
            .value)
    }

    pub async fn vehicle_speed(&self) -> Result<f64> {
        Ok(self
            .read_pid(services::SHOW_CURRENT_DATA, pids::VEHICLE_SPEED)
            .await?
            .value)
    }

    pub async fn coolant_temp(&self) -> Result<f64> {
        Ok(self
            .read_pid(services::SHOW_CURRENT_DATA, pids::COOLANT_TEMP)
            .await?
            .value)
    }

    pub async fn engine_load(&self) -> Result<f64> {
        Ok(self
            .read_pid(services::SHOW_CURRENT_DATA, pids::ENGINE_LOAD)
            .await?
            .value)
    }

    pub async fn throttle_position(&self) -> Result<f64> {
        Ok(self
            .read_pid(services::SHOW_CURRENT_DATA, pids::THROTTLE_POSITION)
            .await?
            .value)
    }

    // ------------------------------------------------------------------
    // Trouble codes
    // ------------------------------------------------------------------

    /// Mode 03: stored DTCs.
    pub async fn read_stored_dtc(&self) -> Result<Vec<Dtc>> {
        self.read_dtc_mode(services::SHOW_STORED_DTC).await
    }

    /// Mode 07: pending DTCs.
    pub async fn read_pending_dtc(&self) -> Result<Vec<Dtc>> {
        self.read_dtc_mode(services::SHOW_PENDING_DTC).await
    }

    /// Mode 04: clear DTCs and stored values.
    pub async fn clear_dtc(&self) -> Result<()> {
        self.core.execute(&[services::CLEAR_DTC, 0x00], None).await?;
        Ok(())
    }

    /// Response layout: `[mode + 0x40, count, hi, lo, hi, lo, ...]`.
    async fn read_dtc_mode(&self, mode: u8) -> Result<Vec<Dtc>> {
        let response = self.core.execute(&[mode, 0x00], None).await?;

        let mut dtcs = Vec::new();
        if response.len() >= 2 {
            let count = response[1] as usize;
            for i in 0..count {
                let hi_index = 2 + i * 2;
                if hi_index + 1 >= response.len() {
                    break;
                }
                let code = ((response[hi_index] as u16) << 8) | response[hi_index + 1] as u16;
                dtcs.push(Dtc::new(code, 0));
            }
        }

        self.core.emit(DiagEvent::DtcList(dtcs.clone()));
        Ok(dtcs)
    }

    // ------------------------------------------------------------------
    // Vehicle information (mode 09)
    // ------------------------------------------------------------------

    pub async fn read_vin(&self) -> Result<String> {
        self.read_vehicle_info(info_types::VIN).await
    }

    pub async fn read_calibration_id(&self) -> Result<String> {
        self.read_vehicle_info(info_types::CALIBRATION_ID).await
    }

    pub async fn read_ecu_name(&self) -> Result<String> {
        self.read_vehicle_info(info_types::ECU_NAME).await
    }

    /// Mode 09 replies are ASCII after the mode byte.
    async fn read_vehicle_info(&self, info_type: u8) -> Result<String> {
        let response = self
            .core
            .execute(&[services::REQUEST_VEHICLE_INFO, info_type], Some(info_type))
            .await?;
        Ok(response[1..].iter().map(|b| *b as char).collect())
    }
}

// ============================================================================
// Tests
// ============================================================================
