//! Relay tracker records to a remote OSC host until interrupted.

use clap::Parser;
use flockrelay::{
    args::{RelayArgs, Tracker},
    bus::BusSession,
    config::RelayConfig,
    liberty::StreamSession,
    relay::{OscRelay, RecordSource, RelayError},
};
use log::{error, info, warn};
use std::{
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

// Example:
// RUST_LOG=info cargo run --bin flockrelay --
//                            --host  192.168.1.20
//                            --port  7000
//                            -b      2
//                            bus -d  /dev/ttyUSB0

fn main() -> ExitCode {
    env_logger::init();
    let args = RelayArgs::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &RelayArgs) -> Result<(), RelayError> {
    let mut config = match &args.config {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::default(),
    };
    args.apply(&mut config);

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    if let Err(e) = ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst)) {
        warn!("can't catch Ctrl-C, stop with a signal instead: {}", e);
    }

    match &args.tracker {
        Tracker::Bus(_) => {
            info!(
                "Preparing flock device: {}, number of birds: {}",
                config.device.display(),
                config.birds
            );
            let mut session = BusSession::start(
                &config.device,
                config.birds,
                config.record_mode,
                config.group,
                config.stream,
                config.bus.clone(),
            )?;
            let result = relay(&config, &mut session, &running);
            info!("Closing device and connection");
            session.close()?;
            result
        }
        Tracker::Liberty(liberty) if liberty.usb => {
            info!("Preparing USB tracker, number of stations: {}", config.birds);
            let mut session = StreamSession::open_usb(config.birds, config.liberty.clone())?;
            let result = relay(&config, &mut session, &running);
            info!("Closing device and connection");
            session.close();
            result
        }
        Tracker::Liberty(_) => {
            info!(
                "Preparing tracker: {}, number of stations: {}",
                config.device.display(),
                config.birds
            );
            let mut session =
                StreamSession::open(&config.device, config.birds, config.liberty.clone())?;
            let result = relay(&config, &mut session, &running);
            info!("Closing device and connection");
            session.close();
            result
        }
    }
}

fn relay<S: RecordSource>(
    config: &RelayConfig,
    source: &mut S,
    running: &AtomicBool,
) -> Result<(), RelayError> {
    let mut relay = OscRelay::new(config, source.unit_count())?;
    relay.run(source, running)?;
    Ok(())
}
