// For now, this only has information about the firmware,
// not the firmware itself.

// Keep these in sync with the device firmware.

use std::fmt;
use uuid::Uuid;

pub const BATTERY_SERVICE_UUID: Uuid = Uuid::from_u128(0x955a180a_0fe2_f5aa_a094_84b8d4f3e8ad);
pub const SIGNAL_SERVICE_UUID: Uuid = Uuid::from_u128(0x955a180b_0fe2_f5aa_a094_84b8d4f3e8ad);

pub const BATTERY_LEVEL_CHARACTERISTICS_UUID: Uuid =
    Uuid::from_u128(0x955a1500_0fe2_f5aa_a094_84b8d4f3e8ad);
pub const CHANNEL_POWER_CHARACTERISTICS_UUID: Uuid =
    Uuid::from_u128(0x955a1504_0fe2_f5aa_a094_84b8d4f3e8ad);
pub const WAVEFORM_A_CHARACTERISTICS_UUID: Uuid =
    Uuid::from_u128(0x955a1505_0fe2_f5aa_a094_84b8d4f3e8ad);
pub const WAVEFORM_B_CHARACTERISTICS_UUID: Uuid =
    Uuid::from_u128(0x955a1506_0fe2_f5aa_a094_84b8d4f3e8ad);
pub const CONFIG_CHARACTERISTICS_UUID: Uuid =
    Uuid::from_u128(0x955a1507_0fe2_f5aa_a094_84b8d4f3e8ad);

/// Devices advertise themselves as "D-LAB ..."
pub const DEVICE_NAME_PREFIX: &str = "D-LAB";

pub const PAYLOAD_LEN: usize = 3;
pub const BATTERY_PAYLOAD_LEN: usize = 1;

/// Largest value that fits the 11-bit power fields.
pub const POWER_MAX: u16 = 0x7FF;

pub const BURST_TICKS: usize = 50;
pub const BURST_INTERVAL_MS: u64 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceRole {
    Battery,
    Signal,
}

impl ServiceRole {
    pub const ALL: [ServiceRole; 2] = [ServiceRole::Battery, ServiceRole::Signal];

    pub fn uuid(self) -> Uuid {
        match self {
            ServiceRole::Battery => BATTERY_SERVICE_UUID,
            ServiceRole::Signal => SIGNAL_SERVICE_UUID,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.uuid() == uuid)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CharacteristicRole {
    BatteryLevel,
    ChannelPower,
    WaveformA,
    WaveformB,
    Config,
}

impl CharacteristicRole {
    pub const ALL: [CharacteristicRole; 5] = [
        CharacteristicRole::BatteryLevel,
        CharacteristicRole::ChannelPower,
        CharacteristicRole::WaveformA,
        CharacteristicRole::WaveformB,
        CharacteristicRole::Config,
    ];

    pub fn uuid(self) -> Uuid {
        match self {
            CharacteristicRole::BatteryLevel => BATTERY_LEVEL_CHARACTERISTICS_UUID,
            CharacteristicRole::ChannelPower => CHANNEL_POWER_CHARACTERISTICS_UUID,
            CharacteristicRole::WaveformA => WAVEFORM_A_CHARACTERISTICS_UUID,
            CharacteristicRole::WaveformB => WAVEFORM_B_CHARACTERISTICS_UUID,
            CharacteristicRole::Config => CONFIG_CHARACTERISTICS_UUID,
        }
    }

    /// The service this characteristic lives under.
    pub fn service(self) -> ServiceRole {
        match self {
            CharacteristicRole::BatteryLevel => ServiceRole::Battery,
            _ => ServiceRole::Signal,
        }
    }

    pub fn payload_len(self) -> usize {
        match self {
            CharacteristicRole::BatteryLevel => BATTERY_PAYLOAD_LEN,
            _ => PAYLOAD_LEN,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.uuid() == uuid)
    }
}

impl fmt::Display for CharacteristicRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CharacteristicRole::BatteryLevel => "battery level",
            CharacteristicRole::ChannelPower => "channel power",
            CharacteristicRole::WaveformA => "waveform A",
            CharacteristicRole::WaveformB => "waveform B",
            CharacteristicRole::Config => "config",
        };
        f.write_str(name)
    }
}

#[test]
fn test_roles_from_uuid() {
    for role in CharacteristicRole::ALL {
        assert_eq!(CharacteristicRole::from_uuid(role.uuid()), Some(role));
    }
    assert_eq!(
        ServiceRole::from_uuid(Uuid::parse_str("955a180b-0fe2-f5aa-a094-84b8d4f3e8ad").unwrap()),
        Some(ServiceRole::Signal)
    );
    assert_eq!(CharacteristicRole::from_uuid(SIGNAL_SERVICE_UUID), None);
}

#[test]
fn test_role_services() {
    assert_eq!(CharacteristicRole::BatteryLevel.service(), ServiceRole::Battery);
    assert_eq!(CharacteristicRole::BatteryLevel.payload_len(), 1);
    for role in &CharacteristicRole::ALL[1..] {
        assert_eq!(role.service(), ServiceRole::Signal);
        assert_eq!(role.payload_len(), 3);
    }
}
