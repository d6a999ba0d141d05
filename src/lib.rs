pub mod bluetooth;
pub mod config;
pub mod error;
pub mod firmware;
#[cfg(test)]
mod mock;
pub mod protocol;
pub mod session;
pub mod transport;

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::config::{BurstRouting, PowerLimit, SessionConfig};
    pub use crate::error::Error;
    pub use crate::protocol::{Channel, ChannelPowerState, DeviceConfig, WaveformParams};
    pub use crate::session::{DeviceEvent, Phase, Session};
    pub use crate::{bluetooth, config, firmware, protocol, session, transport};

    /// Settings for finding a device.
    #[derive(Clone, Debug)]
    pub struct App {
        pub verbose: u8,
        pub scantime: f32,
        pub name_prefix: String,
    }

    impl Default for App {
        fn default() -> Self {
            Self {
                verbose: 0,
                scantime: 3.0,
                name_prefix: firmware::DEVICE_NAME_PREFIX.to_string(),
            }
        }
    }
}
