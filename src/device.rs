//! Immutable descriptions of the devices to poll.

use std::fmt;

use bluest::Uuid;

use crate::error::DecodeError;
use crate::message::Payload;
use crate::reading::Fields;

/// Decodes the payload of one register section into named fields
pub type DecodeFn = fn(&Section, &[u8]) -> Result<Fields, DecodeError>;

/// One register range the register sequencer reads per cycle
#[derive(Clone)]
pub struct Section {
    pub register: u16,
    pub words: u16,
    /// Field name, or prefix of the field names, the decoder produces
    pub label: String,
    pub decode: DecodeFn,
}

impl Section {
    pub fn new(register: u16, words: u16, label: impl Into<String>, decode: DecodeFn) -> Self {
        Self {
            register,
            words,
            label: label.into(),
            decode,
        }
    }

    /// A section whose registers are reported as raw words
    pub fn raw(register: u16, words: u16, label: impl Into<String>) -> Self {
        Self::new(register, words, label, decode_raw_words)
    }
}

impl fmt::Debug for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Section")
            .field("register", &self.register)
            .field("words", &self.words)
            .field("label", &self.label)
            .finish()
    }
}

/// The service, notify and write characteristic a device family is reached through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattChannels {
    pub service: Uuid,
    pub notify: Uuid,
    pub write: Uuid,
}

impl GattChannels {
    const fn new(service: u128, notify: u128, write: u128) -> Self {
        Self {
            service: Uuid::from_u128(service),
            notify: Uuid::from_u128(notify),
            write: Uuid::from_u128(write),
        }
    }
}

const RENOGY_CHANNELS: GattChannels = GattChannels::new(
    0x0000ffd0_0000_1000_8000_00805f9b34fb,
    0x0000fff1_0000_1000_8000_00805f9b34fb,
    0x0000ffd1_0000_1000_8000_00805f9b34fb,
);

const ECO_WORTHY_CHANNELS: GattChannels = GattChannels::new(
    0x0000ff00_0000_1000_8000_00805f9b34fb,
    0x0000ff01_0000_1000_8000_00805f9b34fb,
    0x0000ff02_0000_1000_8000_00805f9b34fb,
);

const BLE_ESP_CHANNELS: GattChannels = GattChannels::new(
    0x4fafc201_1fb5_459e_8fcc_c5c9c331914b,
    0xbeb5483e_36e1_4688_b7f5_ea07361b26a8,
    0x1c95d5e3_d8f7_413a_bf3d_7a2e5d7be87e,
);

/// The kinds of peripheral this crate knows how to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    /// LiFePO4 battery speaking the 0xDD/0x77 vendor frame protocol
    EcoWorthyBattery,
    /// ESP32 sensor bridge exposing GPS and environment data as registers
    BleEsp,
    /// Any register device reached through the Renogy BT module, sections from configuration
    RegisterMap,
}

impl DeviceFamily {
    pub fn channels(&self) -> GattChannels {
        match self {
            DeviceFamily::EcoWorthyBattery => ECO_WORTHY_CHANNELS,
            DeviceFamily::BleEsp => BLE_ESP_CHANNELS,
            DeviceFamily::RegisterMap => RENOGY_CHANNELS,
        }
    }

    /// Advertised name prefixes accepted when the device cannot be found by address
    pub fn alias_prefixes(&self) -> &'static [&'static str] {
        match self {
            DeviceFamily::RegisterMap => &["BT-TH", "RNGRBP", "BTRIC"],
            DeviceFamily::EcoWorthyBattery | DeviceFamily::BleEsp => &[],
        }
    }

    /// Name of the protocol client, reported with every reading
    pub fn client_name(&self) -> &'static str {
        match self {
            DeviceFamily::EcoWorthyBattery => "eco_worthy_battery",
            DeviceFamily::BleEsp => "ble_esp",
            DeviceFamily::RegisterMap => "register_map",
        }
    }
}

/// How a device is read
#[derive(Debug, Clone)]
pub enum ProtocolDescriptor {
    /// Modbus-style register reads, one request per section
    Register { device_id: u8, sections: Vec<Section> },
    /// Fixed vendor commands answered by 0xDD/0x77 frames
    Frame { read_cell_voltages: bool },
}

/// Everything needed to reach and read one device. Built once at startup.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub address: String,
    pub alias: String,
    pub family: DeviceFamily,
    pub protocol: ProtocolDescriptor,
}

impl DeviceDescriptor {
    pub fn eco_worthy_battery(
        address: impl Into<String>,
        alias: impl Into<String>,
        read_cell_voltages: bool,
    ) -> Self {
        Self {
            address: address.into(),
            alias: alias.into(),
            family: DeviceFamily::EcoWorthyBattery,
            protocol: ProtocolDescriptor::Frame { read_cell_voltages },
        }
    }

    pub fn ble_esp(address: impl Into<String>, alias: impl Into<String>, device_id: u8) -> Self {
        Self {
            address: address.into(),
            alias: alias.into(),
            family: DeviceFamily::BleEsp,
            protocol: ProtocolDescriptor::Register {
                device_id,
                sections: vec![Section::new(0, 11, "sensor", decode_ble_esp)],
            },
        }
    }

    pub fn register_map(
        address: impl Into<String>,
        alias: impl Into<String>,
        device_id: u8,
        sections: Vec<Section>,
    ) -> Self {
        Self {
            address: address.into(),
            alias: alias.into(),
            family: DeviceFamily::RegisterMap,
            protocol: ProtocolDescriptor::Register {
                device_id,
                sections,
            },
        }
    }
}

/// Report every word of the section as its own field.
///
/// A single word section produces `<label>`, longer ones `<label>_0`, `<label>_1`, ...
pub fn decode_raw_words(section: &Section, payload: &[u8]) -> Result<Fields, DecodeError> {
    let payload = Payload::new(payload);
    let mut fields = Fields::new();
    if section.words == 1 {
        fields.insert(section.label.clone(), payload.u16(&section.label, 0)?.into());
        return Ok(fields);
    }
    for word in 0..section.words as usize {
        let name = format!("{}_{}", section.label, word);
        let value = payload.u16(&name, word * 2)?;
        fields.insert(name, value.into());
    }
    Ok(fields)
}

/// Decode the ESP32 bridge block starting at register 0.
///
/// Register | Meaning
/// 0-1      | Latitude, signed, degrees * 10^7
/// 2-3      | Longitude, signed, degrees * 10^7
/// 4        | Altitude in m, signed
/// 5        | Speed in km/h * 10
/// 6        | Satellite count
/// 7        | Temperature in C * 100
/// 8        | Humidity in % * 100
/// 9        | Pressure in hPa * 10
/// 10       | Gas resistance in Ohm
pub fn decode_ble_esp(_section: &Section, payload: &[u8]) -> Result<Fields, DecodeError> {
    let payload = Payload::new(payload);
    let mut fields = Fields::new();
    fields.insert("lat".into(), (payload.i32("lat", 0)? as f64 / 1e7).into());
    fields.insert("lon".into(), (payload.i32("lon", 4)? as f64 / 1e7).into());
    fields.insert("alt".into(), payload.scaled_i16("alt", 8, 1.0)?.into());
    fields.insert("speed".into(), (payload.u16("speed", 10)? as f64 / 10.0).into());
    fields.insert("satellites".into(), payload.u16("satellites", 12)?.into());
    fields.insert("temperature".into(), (payload.i16("temperature", 14)? as f64 / 100.0).into());
    fields.insert("humidity".into(), (payload.u16("humidity", 16)? as f64 / 100.0).into());
    fields.insert("pressure".into(), (payload.u16("pressure", 18)? as f64 / 10.0).into());
    fields.insert("gas_resistance".into(), payload.u16("gas_resistance", 20)?.into());
    Ok(fields)
}

#[test]
fn test_raw_words_naming() {
    let single = Section::raw(5042, 1, "current");
    let fields = decode_raw_words(&single, &[0x00, 0x2a]).unwrap();
    assert_eq!(fields["current"].as_f64(), Some(42.0));

    let block = Section::raw(5000, 2, "cell");
    let fields = decode_raw_words(&block, &[0x0c, 0xe4, 0x0c, 0xe5]).unwrap();
    assert_eq!(fields["cell_0"].as_f64(), Some(3300.0));
    assert_eq!(fields["cell_1"].as_f64(), Some(3301.0));
}

#[test]
fn test_raw_words_short_payload() {
    let block = Section::raw(5000, 3, "cell");
    assert!(decode_raw_words(&block, &[0x0c, 0xe4]).is_err());
}

#[test]
fn test_ble_esp_decode() {
    let mut payload = Vec::new();
    payload.extend_from_slice(&515_000_000i32.to_be_bytes());
    payload.extend_from_slice(&(-1_250_000i32).to_be_bytes());
    payload.extend_from_slice(&(-12i16).to_be_bytes());
    payload.extend_from_slice(&125u16.to_be_bytes());
    payload.extend_from_slice(&9u16.to_be_bytes());
    payload.extend_from_slice(&2150u16.to_be_bytes());
    payload.extend_from_slice(&4500u16.to_be_bytes());
    payload.extend_from_slice(&10132u16.to_be_bytes());
    payload.extend_from_slice(&300u16.to_be_bytes());

    let section = Section::new(0, 11, "sensor", decode_ble_esp);
    let fields = decode_ble_esp(&section, &payload).unwrap();
    let get = |name: &str| fields[name].as_f64().unwrap();
    assert!((get("lat") - 51.5).abs() < 1e-9);
    assert!((get("lon") + 0.125).abs() < 1e-9);
    assert_eq!(get("alt"), -12.0);
    assert!((get("speed") - 12.5).abs() < 1e-9);
    assert_eq!(get("satellites"), 9.0);
    assert!((get("temperature") - 21.5).abs() < 1e-9);
    assert!((get("pressure") - 1013.2).abs() < 1e-9);
    assert_eq!(get("gas_resistance"), 300.0);
}

#[test]
fn test_family_channels_are_distinct() {
    let families = [
        DeviceFamily::EcoWorthyBattery,
        DeviceFamily::BleEsp,
        DeviceFamily::RegisterMap,
    ];
    for family in families {
        let channels = family.channels();
        assert_ne!(channels.notify, channels.write);
    }
    assert_eq!(
        DeviceFamily::RegisterMap.channels().notify.to_string(),
        "0000fff1-0000-1000-8000-00805f9b34fb"
    );
}
