// identity, reported once in the full-state snapshot
pub const NAME: &str = "D01S03";
pub const MODEL: &str = "D01S05";
pub const FIRMWARE: &str = "D01S12";
pub const PRODUCT_ID: &str = "ProductId";
pub const DEVICE_ID: &str = "DeviceId";

// operational
pub const ACTIVE: &str = "D03102";
pub const LIGHT: &str = "D03105";
pub const MODE: &str = "D0310C";
pub const TARGET_TEMPERATURE: &str = "D0310E";
pub const SWING: &str = "D0320F";
pub const BEEP: &str = "D03130";
pub const AUTO_PLUS_AI: &str = "D03180";

/// Current temperature in tenths of a degree.
pub const CURRENT_TEMPERATURE: &str = "D03224";

// diagnostics
pub const RSSI: &str = "rssi";
pub const RUNTIME: &str = "Runtime";
pub const FREE_MEMORY: &str = "free_memory";
pub const WIFI_VERSION: &str = "WifiVersion";
pub const STATUS_TYPE: &str = "StatusType";
pub const CONNECT_TYPE: &str = "ConnectType";
pub const MCU_BOOT: &str = "MCUBoot";
pub const WIFI_LOG: &str = "wifilog";

pub const IDENTITY: [&str; 5] = [NAME, MODEL, FIRMWARE, PRODUCT_ID, DEVICE_ID];

pub const OPERATIONAL: [&str; 8] = [
    ACTIVE,
    LIGHT,
    MODE,
    TARGET_TEMPERATURE,
    SWING,
    CURRENT_TEMPERATURE,
    BEEP,
    AUTO_PLUS_AI,
];

pub const DIAGNOSTIC: [&str; 8] = [
    RSSI,
    RUNTIME,
    FREE_MEMORY,
    WIFI_VERSION,
    STATUS_TYPE,
    CONNECT_TYPE,
    MCU_BOOT,
    WIFI_LOG,
];

/// Beep value the device uses for "on".
pub const BEEP_FULL_SCALE: i64 = 100;

/// Is `code` one of the fields the model tracks by name?
pub fn is_known(code: &str) -> bool {
    IDENTITY.contains(&code) || OPERATIONAL.contains(&code) || DIAGNOSTIC.contains(&code)
}
