//! Presentation side of an accessory.
//!
//! A [`Session`](crate::session::Session) reports model changes to an
//! [`AccessoryController`]. [`HeaterCooler`] is the controller for the Philips
//! fan heaters: it renders the model as named properties on a set of services
//! through the narrow [`Presentation`] interface, and turns property writes
//! back into device settings.

use strum_macros::Display;
use tracing::{debug, error, warn};

use crate::{
    error::Result,
    protocol::{
        setting::Setting,
        state::{Code, DeviceState, Mode, Swing, TemperatureUnit},
    },
    session::Session,
    transport::Transport,
};

/// Receives model changes from a session.
pub trait AccessoryController: Send + Sync + 'static {
    /// A new model was built from a full-state report.
    fn on_full_state(&self, state: &DeviceState);

    /// The model was patched, by a partial report or a local setting.
    fn on_partial_update(&self, state: &DeviceState);

    /// The report stream ended. `expected` is false when it died on its own.
    fn on_session_ended(&self, expected: bool);
}

#[derive(Display, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Service {
    #[strum(serialize = "Accessory Information")]
    AccessoryInformation,
    #[strum(serialize = "Heater Cooler")]
    HeaterCooler,
    Backlight,
    Beep,
    #[strum(serialize = "Auto Plus AI")]
    AutoPlusAi,
}

#[derive(Display, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Characteristic {
    Manufacturer,
    Model,
    SerialNumber,
    FirmwareRevision,
    Name,
    Active,
    CurrentHeaterCoolerState,
    TargetHeaterCoolerState,
    CurrentTemperature,
    HeatingThresholdTemperature,
    SwingMode,
    TemperatureDisplayUnits,
    On,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(*b as i64),
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(f.round() as i64),
            Value::Text(_) => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

/// The host's view of an accessory: named properties grouped by service.
pub trait Presentation: Send + Sync + 'static {
    fn update(&self, service: Service, characteristic: Characteristic, value: Value);

    fn remove(&self, service: Service, characteristic: Characteristic);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i64)]
pub enum CurrentHeaterCoolerState {
    Inactive = 0,
    Idle = 1,
    Heating = 2,
    Cooling = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i64)]
pub enum TargetHeaterCoolerState {
    Auto = 0,
    Heat = 1,
    Cool = 2,
}

/// Heater-cooler states shown for a device mode. Unknown modes have none.
pub fn heater_cooler_states(mode: Code<Mode>) -> Option<(CurrentHeaterCoolerState, TargetHeaterCoolerState)> {
    match mode.known()? {
        Mode::Auto => Some((CurrentHeaterCoolerState::Heating, TargetHeaterCoolerState::Auto)),
        Mode::Ventilation => Some((CurrentHeaterCoolerState::Idle, TargetHeaterCoolerState::Cool)),
        Mode::Low | Mode::High => Some((CurrentHeaterCoolerState::Heating, TargetHeaterCoolerState::Heat)),
    }
}

/// A property write coming from the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Intent {
    Setting(Setting),
    /// Display units are local state and never reach the device.
    TemperatureUnit(TemperatureUnit),
}

pub struct HeaterCooler<P> {
    presentation: P,
    manufacturer: String,
    serial_number: String,
}

impl<P: Presentation> HeaterCooler<P> {
    pub fn new(presentation: P, serial_number: impl Into<String>) -> Self {
        HeaterCooler {
            presentation,
            manufacturer: "Philips".to_string(),
            serial_number: serial_number.into(),
        }
    }

    pub fn presentation(&self) -> &P {
        &self.presentation
    }

    /// Translate a property write into what it asks of the device.
    pub fn interpret(service: Service, characteristic: Characteristic, value: &Value) -> Option<Intent> {
        let value = value.as_i64()?;

        let intent = match (service, characteristic) {
            (Service::HeaterCooler, Characteristic::Active) => Intent::Setting(Setting::Active(value > 0)),
            (Service::HeaterCooler, Characteristic::SwingMode) => {
                let swing = if value > 0 { Swing::On } else { Swing::Off };
                Intent::Setting(Setting::Swing(swing))
            }
            (Service::HeaterCooler, Characteristic::TemperatureDisplayUnits) => {
                let unit = if value > 0 {
                    TemperatureUnit::Fahrenheit
                } else {
                    TemperatureUnit::Celsius
                };
                Intent::TemperatureUnit(unit)
            }
            (Service::Backlight, Characteristic::On) => Intent::Setting(Setting::Light(value > 0)),
            (Service::Beep, Characteristic::On) => Intent::Setting(Setting::Beep(value > 0)),
            (Service::AutoPlusAi, Characteristic::On) => Intent::Setting(Setting::AutoPlusAi(value > 0)),
            _ => return None,
        };

        Some(intent)
    }

    fn publish_information(&self, state: &DeviceState) {
        use Characteristic::*;

        let info = Service::AccessoryInformation;
        self.presentation.update(info, Manufacturer, self.manufacturer.as_str().into());
        self.presentation.update(info, Model, state.model().into());
        self.presentation.update(info, SerialNumber, self.serial_number.as_str().into());
        self.presentation.update(info, FirmwareRevision, state.firmware().into());

        self.presentation.update(Service::HeaterCooler, Name, state.name().into());
        self.presentation.update(Service::Backlight, Name, "Backlight".into());
        self.presentation.update(Service::Beep, Name, "Beep".into());
        self.presentation.update(Service::AutoPlusAi, Name, "Auto Plus AI".into());
    }

    fn publish_operational(&self, state: &DeviceState) {
        use Characteristic::*;

        let hc = Service::HeaterCooler;
        self.presentation.update(hc, Active, state.active().into());

        match heater_cooler_states(state.mode()) {
            Some((current, target)) => {
                self.presentation.update(hc, CurrentHeaterCoolerState, (current as i64).into());
                self.presentation.update(hc, TargetHeaterCoolerState, (target as i64).into());
            }
            None => warn!("unknown device mode {}, heater-cooler state left as is", state.mode().raw()),
        }

        let unit = state.temperature_unit();
        self.presentation.update(hc, CurrentTemperature, state.current_temperature_in(unit).into());
        self.presentation.update(hc, TemperatureDisplayUnits, (unit as i64).into());

        // the threshold is only meaningful in auto mode
        if state.mode() == Code::Known(Mode::Auto) {
            self.presentation.update(hc, HeatingThresholdTemperature, state.target_temperature().into());
        } else {
            self.presentation.remove(hc, HeatingThresholdTemperature);
        }

        let swing = state.swing() == Code::Known(Swing::On);
        self.presentation.update(hc, SwingMode, (swing as i64).into());

        self.presentation.update(Service::Backlight, On, state.light().into());
        self.presentation.update(Service::Beep, On, state.beep().into());
        self.presentation.update(Service::AutoPlusAi, On, state.auto_plus_ai().into());
    }
}

impl<P: Presentation> AccessoryController for HeaterCooler<P> {
    fn on_full_state(&self, state: &DeviceState) {
        self.publish_information(state);
        self.publish_operational(state);
    }

    fn on_partial_update(&self, state: &DeviceState) {
        self.presentation.update(
            Service::AccessoryInformation,
            Characteristic::FirmwareRevision,
            state.firmware().into(),
        );
        self.publish_operational(state);
    }

    fn on_session_ended(&self, expected: bool) {
        if expected {
            debug!("report stream ended (expected)");
        } else {
            error!("report stream ended (not expected), showing last known state");
        }
    }
}

/// Apply a property write from the host to the session's device.
pub async fn handle_write<T, P>(
    session: &Session<T, HeaterCooler<P>>,
    service: Service,
    characteristic: Characteristic,
    value: Value,
) -> Result<()>
where
    T: Transport,
    P: Presentation,
{
    match HeaterCooler::<P>::interpret(service, characteristic, &value) {
        Some(Intent::Setting(setting)) => session.apply_setting(setting).await.map(|_| ()),
        Some(Intent::TemperatureUnit(unit)) => session.set_temperature_unit(unit).await,
        None => {
            warn!("ignoring write of {value:?} to {service} {characteristic}");
            Ok(())
        }
    }
}
