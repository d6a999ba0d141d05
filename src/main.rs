use dlablink::prelude::*;

use clap::{Parser, Subcommand, ValueEnum};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::Level;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Display more information on the console. Can be used multiple times.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Seconds to wait when scanning for bluetooth devices
    #[arg(short, long, value_name = "SECONDS", default_value_t = 3.0, value_parser = parse_scantime, global = true)]
    scantime: f32,

    /// Only consider devices whose advertised name starts with this
    #[arg(long, default_value = firmware::DEVICE_NAME_PREFIX, global = true)]
    name_prefix: String,

    /// Number of frames sent per waveform burst
    #[arg(long, default_value_t = firmware::BURST_TICKS, global = true)]
    burst_ticks: usize,

    /// Milliseconds between waveform burst frames
    #[arg(
        long,
        default_value_t = firmware::BURST_INTERVAL_MS,
        value_parser = clap::value_parser!(u64).range(1..),
        global = true
    )]
    burst_interval_ms: u64,

    /// Send a channel's waveform to its own characteristic instead of the
    /// opposite one
    #[arg(long, global = true)]
    direct_burst: bool,

    /// What to do with power levels above the device maximum
    #[arg(long, value_enum, default_value_t = PowerLimitArg::Reject, global = true)]
    power_limit: PowerLimitArg,

    #[command(subcommand)]
    command: Commands,
}

fn parse_scantime(arg: &str) -> Result<f32, String> {
    let seconds: f32 = arg.parse().map_err(|err| format!("{err}"))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(format!("{arg} is not a number of seconds"));
    }
    Ok(seconds)
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan for D-LAB devices
    Scan {},

    /// Print battery, power, configuration and waveforms of a device
    Status {},

    /// Set the power of one or both channels
    Power {
        #[arg(short)]
        a: Option<u16>,
        #[arg(short)]
        b: Option<u16>,
    },

    /// Send one waveform burst on a channel
    Waveform {
        #[arg(value_enum)]
        channel: ChannelArg,
        /// 0-31
        x: u8,
        /// 0-1023
        y: u16,
        /// 0-31
        z: u8,
    },

    /// Print device changes until it disconnects
    Monitor {},
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ChannelArg {
    A,
    B,
}

impl From<ChannelArg> for Channel {
    fn from(arg: ChannelArg) -> Self {
        match arg {
            ChannelArg::A => Channel::A,
            ChannelArg::B => Channel::B,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PowerLimitArg {
    Unchecked,
    Clamp,
    Reject,
}

impl From<PowerLimitArg> for PowerLimit {
    fn from(arg: PowerLimitArg) -> Self {
        match arg {
            PowerLimitArg::Unchecked => PowerLimit::Unchecked,
            PowerLimitArg::Clamp => PowerLimit::Clamp,
            PowerLimitArg::Reject => PowerLimit::Reject,
        }
    }
}

impl Cli {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            burst_ticks: self.burst_ticks,
            burst_interval: Duration::from_millis(self.burst_interval_ms),
            burst_routing: if self.direct_burst {
                BurstRouting::Direct
            } else {
                BurstRouting::Crossed
            },
            power_limit: self.power_limit.into(),
            ..SessionConfig::default()
        }
    }
}

async fn open_session(conf: &App, config: SessionConfig) -> Result<(bluetooth::Device, Session), Box<dyn Error>> {
    let device = bluetooth::find_peripheral(conf).await?;
    println!("Found {} with address {}", device.name, device.address);
    let peripheral = device.connect().await?;
    let session = Session::new(config);
    session.attach(peripheral as Arc<dyn transport::GattPeripheral>).await?;
    Ok((device, session))
}

fn print_status(session: &Session) {
    let show = |value: Option<String>| value.unwrap_or_else(|| "unavailable".to_string());
    println!("Battery:   {}", show(session.battery_level().map(|level| format!("{level}%"))));
    if session.is_bound(firmware::CharacteristicRole::ChannelPower) {
        let power = session.channel_power();
        println!("Power:     A={} B={}", power.a, power.b);
    } else {
        println!("Power:     unavailable");
    }
    println!(
        "Config:    {}",
        show(session.config().map(|config| format!(
            "max power {}, power step {}",
            config.max_power, config.power_step
        )))
    );
    for channel in Channel::ALL {
        println!(
            "Waveform {channel}: {}",
            show(session.waveform(channel).map(|w| format!("x={} y={} z={}", w.x, w.y, w.z)))
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
    tracing::debug!("{cli:?}");

    let conf = App {
        verbose: cli.verbose,
        scantime: cli.scantime,
        name_prefix: cli.name_prefix.clone(),
    };

    match &cli.command {
        Commands::Scan {} => {
            let devices = bluetooth::scan(&conf).await?;
            if devices.is_empty() {
                eprintln!("No {} devices found.", conf.name_prefix);
            }
            for device in devices {
                println!("{}\t{}", device.address, device.name);
            }
        }
        Commands::Status {} => {
            let (device, session) = open_session(&conf, cli.session_config()).await?;
            print_status(&session);
            session.detach().await;
            device.disconnect().await?;
        }
        Commands::Power { a, b } => {
            let (device, session) = open_session(&conf, cli.session_config()).await?;
            for (channel, value) in [(Channel::A, a), (Channel::B, b)] {
                if let Some(value) = value {
                    let power = session.write_channel_power(channel, *value).await?;
                    println!("Power:     A={} B={}", power.a, power.b);
                }
            }
            session.detach().await;
            device.disconnect().await?;
        }
        Commands::Waveform { channel, x, y, z } => {
            let (device, session) = open_session(&conf, cli.session_config()).await?;
            let channel = Channel::from(*channel);
            session.set_waveform(channel, *x, *y, *z)?;
            session.start_waveform_burst(channel)?;
            println!("Sending waveform on channel {channel}...");
            session.wait_waveform_burst(channel).await;
            session.detach().await;
            device.disconnect().await?;
        }
        Commands::Monitor {} => {
            let (_device, session) = open_session(&conf, cli.session_config()).await?;
            let mut events = session.events();
            print_status(&session);
            loop {
                match events.recv().await {
                    Ok(DeviceEvent::Detached) | Err(RecvError::Closed) => break,
                    Ok(event) => println!("{event:?}"),
                    Err(RecvError::Lagged(missed)) => eprintln!("Missed {missed} events"),
                }
            }
            println!("Device disconnected.");
        }
    }

    Ok(())
}
