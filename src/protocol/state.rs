use std::{collections::BTreeMap, fmt};

use serde::Serialize;
use serde_json::{Map, Value};
use strum_macros::{Display, FromRepr};

use super::fields;
use crate::error::{Error, Result};

/// A decoded device report: a flat object keyed by field code.
pub type Report = Map<String, Value>;

/// An enumeration the device reports as a raw integer code.
pub trait DeviceCode: Sized + Copy {
    fn from_raw(raw: i64) -> Option<Self>;
    fn raw(self) -> i64;
}

/// A raw device code decoded through an enumeration lookup.
///
/// Codes the lookup does not know are kept as `Unknown` rather than being
/// coerced onto a valid member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Code<T> {
    Known(T),
    Unknown(i64),
}

impl<T: DeviceCode> Code<T> {
    pub fn decode(raw: i64) -> Self {
        T::from_raw(raw).map_or(Code::Unknown(raw), Code::Known)
    }

    pub fn known(self) -> Option<T> {
        match self {
            Code::Known(value) => Some(value),
            Code::Unknown(_) => None,
        }
    }

    pub fn raw(self) -> i64 {
        match self {
            Code::Known(value) => value.raw(),
            Code::Unknown(raw) => raw,
        }
    }
}

impl<T: DeviceCode> From<T> for Code<T> {
    fn from(value: T) -> Self {
        Code::Known(value)
    }
}

#[derive(FromRepr, Display, Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[repr(i64)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Low = 66,
    High = 65,
    Auto = 0,
    Ventilation = -127,
}

impl DeviceCode for Mode {
    fn from_raw(raw: i64) -> Option<Self> {
        Mode::from_repr(raw)
    }

    fn raw(self) -> i64 {
        self as i64
    }
}

#[derive(FromRepr, Display, Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[repr(i64)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Swing {
    Off = 0,
    On = 17920,
}

impl DeviceCode for Swing {
    fn from_raw(raw: i64) -> Option<Self> {
        Swing::from_repr(raw)
    }

    fn raw(self) -> i64 {
        self as i64
    }
}

/// Unit used to present temperatures. Never reported by the device.
#[derive(Display, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum TemperatureUnit {
    #[default]
    Celsius,
    Fahrenheit,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub name: String,
    pub model: String,
    pub firmware: String,
    pub product_id: String,
    pub device_id: String,
}

/// Carried through for display, never used for control decisions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub rssi: Option<i64>,
    pub runtime: Option<i64>,
    pub free_memory: Option<i64>,
    pub wifi_version: Option<String>,
    pub status_type: Option<String>,
    pub connect_type: Option<String>,
    pub mcu_boot: Option<bool>,
    pub wifi_log: Option<bool>,
}

impl Diagnostics {
    // lenient: a value of the wrong type is treated as not reported
    fn parse(report: &Report) -> Self {
        let number = |code: &str| report.get(code).and_then(Value::as_i64);
        let string = |code: &str| report.get(code).and_then(Value::as_str).map(str::to_string);
        let boolean = |code: &str| report.get(code).and_then(as_flag);

        Diagnostics {
            rssi: number(fields::RSSI),
            runtime: number(fields::RUNTIME),
            free_memory: number(fields::FREE_MEMORY),
            wifi_version: string(fields::WIFI_VERSION),
            status_type: string(fields::STATUS_TYPE),
            connect_type: string(fields::CONNECT_TYPE),
            mcu_boot: boolean(fields::MCU_BOOT),
            wifi_log: boolean(fields::WIFI_LOG),
        }
    }

    fn merge(&mut self, update: Diagnostics) {
        self.rssi = update.rssi.or(self.rssi);
        self.runtime = update.runtime.or(self.runtime);
        self.free_memory = update.free_memory.or(self.free_memory);
        self.wifi_version = update.wifi_version.or(self.wifi_version.take());
        self.status_type = update.status_type.or(self.status_type.take());
        self.connect_type = update.connect_type.or(self.connect_type.take());
        self.mcu_boot = update.mcu_boot.or(self.mcu_boot);
        self.wifi_log = update.wifi_log.or(self.wifi_log);
    }
}

fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}

fn int(report: &Report, code: &str) -> Result<Option<i64>> {
    match report.get(code) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b as i64)),
        Some(Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| Error::mistyped(code)),
        Some(_) => Err(Error::mistyped(code)),
    }
}

fn flag(report: &Report, code: &str) -> Result<Option<bool>> {
    Ok(int(report, code)?.map(|v| v != 0))
}

fn text(report: &Report, code: &str) -> Result<Option<String>> {
    match report.get(code) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(Error::mistyped(code)),
    }
}

fn require<T>(value: Option<T>, code: &str) -> Result<T> {
    value.ok_or_else(|| Error::missing(code))
}

/// The operational and diagnostic fields present in one report, validated
/// before anything is written to the model.
#[derive(Default)]
struct Delta {
    active: Option<bool>,
    light: Option<bool>,
    mode: Option<i64>,
    target_temperature: Option<i64>,
    swing: Option<i64>,
    current_temperature: Option<i64>,
    beep: Option<i64>,
    auto_plus_ai: Option<i64>,
    diagnostics: Diagnostics,
    other: Vec<(String, Value)>,
}

impl Delta {
    fn parse(report: &Report) -> Result<Self> {
        Ok(Delta {
            active: flag(report, fields::ACTIVE)?,
            light: flag(report, fields::LIGHT)?,
            mode: int(report, fields::MODE)?,
            target_temperature: int(report, fields::TARGET_TEMPERATURE)?,
            swing: int(report, fields::SWING)?,
            current_temperature: int(report, fields::CURRENT_TEMPERATURE)?,
            beep: int(report, fields::BEEP)?,
            auto_plus_ai: int(report, fields::AUTO_PLUS_AI)?,
            diagnostics: Diagnostics::parse(report),
            other: report
                .iter()
                .filter(|(code, _)| !fields::is_known(code))
                .map(|(code, value)| (code.clone(), value.clone()))
                .collect(),
        })
    }
}

/// Last known state of one appliance.
///
/// Built from a full-state report and then patched in place by partial
/// reports and by locally issued settings. Local writes are optimistic: the
/// device remains the source of truth and a later report overwrites them.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceState {
    identity: Identity,

    active: bool,
    mode: Code<Mode>,
    target_temperature: i64,
    current_temperature: i64,
    swing: Code<Swing>,
    light: bool,
    beep: i64,
    auto_plus_ai: i64,

    temperature_unit: TemperatureUnit,

    diagnostics: Diagnostics,

    /// Reported fields the model does not interpret, kept verbatim.
    other: BTreeMap<String, Value>,
}

impl DeviceState {
    /// Build the model from a full-state report. Every identity and
    /// operational field must be present.
    pub fn from_full(report: &Report) -> Result<Self> {
        let identity = Identity {
            name: require(text(report, fields::NAME)?, fields::NAME)?,
            model: require(text(report, fields::MODEL)?, fields::MODEL)?,
            firmware: require(text(report, fields::FIRMWARE)?, fields::FIRMWARE)?,
            product_id: require(text(report, fields::PRODUCT_ID)?, fields::PRODUCT_ID)?,
            device_id: require(text(report, fields::DEVICE_ID)?, fields::DEVICE_ID)?,
        };

        let delta = Delta::parse(report)?;

        Ok(DeviceState {
            identity,
            active: require(delta.active, fields::ACTIVE)?,
            mode: Code::decode(require(delta.mode, fields::MODE)?),
            target_temperature: require(delta.target_temperature, fields::TARGET_TEMPERATURE)?,
            current_temperature: require(delta.current_temperature, fields::CURRENT_TEMPERATURE)?,
            swing: Code::decode(require(delta.swing, fields::SWING)?),
            light: require(delta.light, fields::LIGHT)?,
            beep: require(delta.beep, fields::BEEP)?,
            auto_plus_ai: require(delta.auto_plus_ai, fields::AUTO_PLUS_AI)?,
            temperature_unit: TemperatureUnit::default(),
            diagnostics: delta.diagnostics,
            other: delta.other.into_iter().collect(),
        })
    }

    /// Merge a partial report. Only fields present in `report` are written;
    /// identity fields are never overwritten. Nothing is written if any
    /// present field fails to decode.
    pub fn apply_partial(&mut self, report: &Report) -> Result<()> {
        let delta = Delta::parse(report)?;

        if let Some(active) = delta.active {
            self.active = active;
        }
        if let Some(light) = delta.light {
            self.light = light;
        }
        if let Some(mode) = delta.mode {
            self.mode = Code::decode(mode);
        }
        if let Some(target) = delta.target_temperature {
            self.target_temperature = target;
        }
        if let Some(swing) = delta.swing {
            self.swing = Code::decode(swing);
        }
        if let Some(current) = delta.current_temperature {
            self.current_temperature = current;
        }
        if let Some(beep) = delta.beep {
            self.beep = beep;
        }
        if let Some(auto_plus_ai) = delta.auto_plus_ai {
            self.auto_plus_ai = auto_plus_ai;
        }

        self.diagnostics.merge(delta.diagnostics);
        self.other.extend(delta.other);

        Ok(())
    }

    pub fn with_temperature_unit(mut self, unit: TemperatureUnit) -> Self {
        self.temperature_unit = unit;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn model(&self) -> &str {
        &self.identity.model
    }

    pub fn firmware(&self) -> &str {
        &self.identity.firmware
    }

    pub fn product_id(&self) -> &str {
        &self.identity.product_id
    }

    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn mode(&self) -> Code<Mode> {
        self.mode
    }

    /// Target temperature in whole degrees, unscaled.
    pub fn target_temperature(&self) -> i64 {
        self.target_temperature
    }

    /// Current temperature in degrees Celsius.
    pub fn current_temperature(&self) -> f64 {
        self.current_temperature as f64 / 10.0
    }

    pub fn current_temperature_in(&self, unit: TemperatureUnit) -> f64 {
        let celsius = self.current_temperature();
        match unit {
            TemperatureUnit::Celsius => celsius,
            TemperatureUnit::Fahrenheit => celsius * 9.0 / 5.0 + 32.0,
        }
    }

    pub fn swing(&self) -> Code<Swing> {
        self.swing
    }

    pub fn set_swing(&mut self, swing: Swing) {
        self.swing = swing.into();
    }

    pub fn light(&self) -> bool {
        self.light
    }

    pub fn set_light(&mut self, on: bool) {
        self.light = on;
    }

    pub fn beep(&self) -> bool {
        self.beep > 0
    }

    pub fn set_beep(&mut self, on: bool) {
        self.beep = if on { fields::BEEP_FULL_SCALE } else { 0 };
    }

    pub fn auto_plus_ai(&self) -> bool {
        self.auto_plus_ai == 1
    }

    pub fn set_auto_plus_ai(&mut self, on: bool) {
        self.auto_plus_ai = on as i64;
    }

    pub fn temperature_unit(&self) -> TemperatureUnit {
        self.temperature_unit
    }

    pub fn set_temperature_unit(&mut self, unit: TemperatureUnit) {
        self.temperature_unit = unit;
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// A reported field the model does not interpret.
    pub fn other(&self, code: &str) -> Option<&Value> {
        self.other.get(code)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}
