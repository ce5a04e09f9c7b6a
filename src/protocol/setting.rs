use std::{fmt, str::FromStr};

use super::{
    fields,
    state::{Code, DeviceState, Swing},
};

/// A user-issued change to one device field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Setting {
    Active(bool),
    Swing(Swing),
    Light(bool),
    Beep(bool),
    AutoPlusAi(bool),
}

impl Setting {
    /// Interpret a raw `field=value` pair. Any value above zero switches a
    /// flag on. Returns `None` for fields that cannot be set or values the
    /// field does not accept.
    pub fn from_raw(field: &str, value: i64) -> Option<Self> {
        let setting = match field {
            fields::ACTIVE => Setting::Active(value > 0),
            fields::LIGHT => Setting::Light(value > 0),
            fields::BEEP => Setting::Beep(value > 0),
            fields::AUTO_PLUS_AI => Setting::AutoPlusAi(value > 0),
            fields::SWING => Setting::Swing(Code::<Swing>::decode(value).known()?),
            _ => return None,
        };

        Some(setting)
    }

    pub fn field(&self) -> &'static str {
        match self {
            Setting::Active(_) => fields::ACTIVE,
            Setting::Swing(_) => fields::SWING,
            Setting::Light(_) => fields::LIGHT,
            Setting::Beep(_) => fields::BEEP,
            Setting::AutoPlusAi(_) => fields::AUTO_PLUS_AI,
        }
    }

    /// The value as the device expects it on the wire.
    pub fn raw_value(&self) -> i64 {
        match *self {
            Setting::Active(on) | Setting::Light(on) | Setting::AutoPlusAi(on) => on as i64,
            Setting::Beep(on) => {
                if on {
                    fields::BEEP_FULL_SCALE
                } else {
                    0
                }
            }
            Setting::Swing(swing) => Code::from(swing).raw(),
        }
    }

    /// Optimistically write the setting into the local model.
    pub fn apply(&self, state: &mut DeviceState) {
        match *self {
            Setting::Active(on) => state.set_active(on),
            Setting::Swing(swing) => state.set_swing(swing),
            Setting::Light(on) => state.set_light(on),
            Setting::Beep(on) => state.set_beep(on),
            Setting::AutoPlusAi(on) => state.set_auto_plus_ai(on),
        }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.field(), self.raw_value())
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("invalid setting {0:?}, expected <field>=<value> for a settable field")]
pub struct InvalidSetting(pub String);

impl FromStr for Setting {
    type Err = InvalidSetting;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidSetting(s.to_string());

        let (field, value) = s.split_once('=').ok_or_else(invalid)?;
        let value = value.trim().parse::<i64>().map_err(|_| invalid())?;

        Setting::from_raw(field.trim(), value).ok_or_else(invalid)
    }
}
