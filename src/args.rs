// Commandline argument parser using clap for FlockRelay

use crate::config::RelayConfig;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
/// Relay motion tracker records to a remote host as OSC messages
pub struct RelayArgs {
    #[command(subcommand)]
    /// Which kind of tracker is attached
    pub tracker: Tracker,

    /// Configuration file in RON format; options given here override it
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to send records to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to send records to; control messages are read on the next one
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of tracking units
    #[arg(short, long)]
    pub birds: Option<usize>,

    /// Smallest movement worth sending
    #[arg(short, long)]
    pub noise: Option<f64>,
}

#[derive(Debug, Subcommand, Clone)]
/// Tracker families
pub enum Tracker {
    /// A flock of units on an RS-232 bus
    #[command(about)]
    Bus(BusCommand),

    /// A high-speed tracker with framed continuous output
    #[command(about)]
    Liberty(LibertyCommand),
}

#[derive(Debug, Args, Clone)]
/// Options of the bus tracker
pub struct BusCommand {
    /// Serial device the master unit is attached to
    #[arg(short, long)]
    pub device: Option<PathBuf>,

    /// Poll units one at a time instead of in one group response
    #[arg(long)]
    pub no_group: bool,

    /// Request every record instead of using continuous output
    #[arg(long)]
    pub no_stream: bool,
}

#[derive(Debug, Args, Clone)]
/// Options of the high-speed tracker
pub struct LibertyCommand {
    /// Serial device the tracker is attached to
    #[arg(short, long, conflicts_with = "usb")]
    pub device: Option<PathBuf>,

    /// Talk to the tracker over USB instead of a serial port
    #[arg(long)]
    pub usb: bool,
}

impl RelayArgs {
    /// Apply the options that were given on top of `config`.
    pub fn apply(&self, config: &mut RelayConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(birds) = self.birds {
            config.birds = birds;
        }
        if let Some(noise) = self.noise {
            config.noise_level = noise;
        }
        match &self.tracker {
            Tracker::Bus(bus) => {
                if let Some(device) = &bus.device {
                    config.device = device.clone();
                }
                config.group &= !bus.no_group;
                config.stream &= !bus.no_stream;
            }
            Tracker::Liberty(liberty) => {
                if let Some(device) = &liberty.device {
                    config.device = device.clone();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn parser_is_consistent() {
        RelayArgs::command().debug_assert();
    }

    #[test]
    fn options_override_config() {
        let args = RelayArgs::parse_from([
            "flockrelay",
            "--host",
            "10.1.1.1",
            "-p",
            "8000",
            "-b",
            "3",
            "bus",
            "-d",
            "/dev/ttyUSB1",
            "--no-group",
        ]);
        let mut config = RelayConfig::default();
        args.apply(&mut config);

        assert_eq!(config.host, "10.1.1.1");
        assert_eq!(config.port, 8000);
        assert_eq!(config.control_port(), 8001);
        assert_eq!(config.birds, 3);
        assert_eq!(config.device, PathBuf::from("/dev/ttyUSB1"));
        assert!(!config.group);
        assert!(config.stream);
    }

    #[test]
    fn liberty_usb() {
        let args = RelayArgs::parse_from(["flockrelay", "-n", "0.01", "liberty", "--usb"]);
        assert!(matches!(
            args.tracker,
            Tracker::Liberty(LibertyCommand { usb: true, .. })
        ));
        let mut config = RelayConfig::default();
        args.apply(&mut config);
        assert_eq!(config.noise_level, 0.01);

        assert!(RelayArgs::try_parse_from([
            "flockrelay",
            "liberty",
            "--usb",
            "-d",
            "/dev/ttyS1"
        ])
        .is_err());
    }
}
