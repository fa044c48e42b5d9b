//! Forwarding tracker records to a remote host as OSC messages.
//!
//! Every poll, a unit whose position moved more than the noise level since
//! the previous poll is sent as `bird<N>` with one float per record value.
//! A sharp rise on the z axis followed by a fall is reported once as
//! `bird<N> ,sf "bump" <largest rise>`. The remote host may send
//! `zthreshold ,f <value>` back to the control port to retune the bump
//! detector while running.

use crate::{
    bus::BusSession,
    config::{ConfigError, RelayConfig},
    error::FlockError,
    liberty::StreamSession,
    osc::{decode_arguments, Argument, Message, MethodRegistry, OscError},
    port::Port,
    record::BirdRecord,
};
use log::{debug, info, warn};
use std::{
    borrow::Cow,
    fmt, io,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

/// Largest control packet read from the socket.
const CONTROL_BUFFER_SIZE: usize = 1024;

/// Things that stop the relay.
#[derive(Debug)]
pub enum RelayError {
    /// The tracker failed.
    Flock(FlockError),
    /// An outgoing message could not be built.
    Osc(OscError),
    /// The socket failed.
    Io(io::Error),
    /// The remote host name did not resolve.
    Resolve(String),
    /// The configuration file could not be used.
    Config(ConfigError),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use RelayError as RE;
        let msg = match self {
            RE::Flock(e) => Cow::from(format!("tracker: {}", e)),
            RE::Osc(e) => Cow::from(format!("message: {}", e)),
            RE::Io(e) => Cow::from(format!("socket: {}", e)),
            RE::Resolve(host) => Cow::from(format!("can't resolve host {}", host)),
            RE::Config(e) => Cow::from(format!("configuration: {}", e)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::Flock(e) => Some(e),
            RelayError::Osc(e) => Some(e),
            RelayError::Io(e) => Some(e),
            RelayError::Config(e) => Some(e),
            RelayError::Resolve(_) => None,
        }
    }
}

impl From<FlockError> for RelayError {
    fn from(e: FlockError) -> Self {
        RelayError::Flock(e)
    }
}

impl From<OscError> for RelayError {
    fn from(e: OscError) -> Self {
        RelayError::Osc(e)
    }
}

impl From<io::Error> for RelayError {
    fn from(e: io::Error) -> Self {
        RelayError::Io(e)
    }
}

impl From<ConfigError> for RelayError {
    fn from(e: ConfigError) -> Self {
        RelayError::Config(e)
    }
}

/// A tracker session the relay can poll.
pub trait RecordSource {
    /// Number of units reported on.
    fn unit_count(&self) -> usize;

    /// Fetch new records. Returns false when nothing new arrived in time.
    fn poll_records(&mut self) -> Result<bool, FlockError>;

    /// Latest record of every unit, in unit order.
    fn records(&self) -> Vec<BirdRecord>;
}

impl<P: Port> RecordSource for BusSession<P> {
    fn unit_count(&self) -> usize {
        BusSession::unit_count(self)
    }

    fn poll_records(&mut self) -> Result<bool, FlockError> {
        if self.is_group() {
            self.next_record(1)?;
        } else {
            for unit in 1..=BusSession::unit_count(self) {
                self.next_record(unit)?;
            }
        }
        Ok(true)
    }

    fn records(&self) -> Vec<BirdRecord> {
        BusSession::records(self)
    }
}

impl<P: Port> RecordSource for StreamSession<P> {
    fn unit_count(&self) -> usize {
        StreamSession::unit_count(self)
    }

    fn poll_records(&mut self) -> Result<bool, FlockError> {
        self.read_next_record()
    }

    fn records(&self) -> Vec<BirdRecord> {
        StreamSession::records(self).to_vec()
    }
}

#[derive(Debug, Clone, Default)]
struct BirdState {
    previous: Option<[f32; 3]>,
    rising: bool,
    max_dz: f64,
    last_bump: u64,
    bumps: u64,
}

/// Turns successive record sets into the messages worth sending.
#[derive(Debug)]
pub struct MotionFilter {
    noise_level: f64,
    z_threshold: Arc<Mutex<f64>>,
    after_bump_delay: u64,
    polls: u64,
    birds: Vec<BirdState>,
}

impl MotionFilter {
    /// A filter for `units` birds. `z_threshold` is shared so it can be
    /// changed from elsewhere.
    pub fn new(
        units: usize,
        noise_level: f64,
        z_threshold: Arc<Mutex<f64>>,
        after_bump_delay: u64,
    ) -> Self {
        MotionFilter {
            noise_level,
            z_threshold,
            after_bump_delay,
            polls: 0,
            birds: vec![BirdState::default(); units],
        }
    }

    fn z_threshold(&self) -> f64 {
        match self.z_threshold.lock() {
            Ok(value) => *value,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Number of bumps reported for `bird` (0-based).
    pub fn bumps(&self, bird: usize) -> u64 {
        self.birds.get(bird).map_or(0, |b| b.bumps)
    }

    /// Feed the latest record of every unit and get back the messages to
    /// send. The first call only primes the filter.
    pub fn step(&mut self, records: &[BirdRecord]) -> Result<Vec<Message>, OscError> {
        self.polls += 1;
        let z_threshold = self.z_threshold();
        let mut out = Vec::new();

        for (index, (state, bird)) in self.birds.iter_mut().zip(records).enumerate() {
            let name = format!("bird{}", index + 1);
            let position = bird.record.position();
            let previous = std::mem::replace(&mut state.previous, position);

            let (previous, position) = match (previous, position) {
                (Some(previous), Some(position)) => (previous, position),
                (None, Some(_)) => continue,
                // Nothing to measure movement with; forward every record.
                (_, None) => {
                    out.push(values_message(&name, bird)?);
                    continue;
                }
            };

            let dx = (position[0] - previous[0]) as f64;
            let dy = (position[1] - previous[1]) as f64;
            let dz = (position[2] - previous[2]) as f64;

            if (dx * dx + dy * dy + dz * dz).sqrt() > self.noise_level {
                out.push(values_message(&name, bird)?);
            }

            if self.polls - state.last_bump < self.after_bump_delay {
                continue;
            }

            if dz > z_threshold {
                state.rising = true;
                state.max_dz = state.max_dz.max(dz);
            }

            if !state.rising {
                state.max_dz = 0.0;
                continue;
            }

            if dz < 0.5 * z_threshold {
                debug!("{} bumps ({})", name, state.max_dz);
                out.push(Message::build(
                    &name,
                    ",sf",
                    &[Argument::from("bump"), Argument::Float(state.max_dz as f32)],
                )?);
                state.rising = false;
                state.max_dz = 0.0;
                state.last_bump = self.polls;
                state.bumps += 1;
            }
        }

        Ok(out)
    }
}

fn values_message(name: &str, bird: &BirdRecord) -> Result<Message, OscError> {
    let values = bird.record.values();
    let type_tag: String = std::iter::once(',')
        .chain(std::iter::repeat('f').take(values.len()))
        .collect();
    let args: Vec<Argument> = values.into_iter().map(Argument::Float).collect();
    Message::build(name, &type_tag, &args)
}

/// Sends filtered records to a remote host and listens for control
/// messages on a local port.
pub struct OscRelay {
    socket: UdpSocket,
    target: SocketAddr,
    registry: MethodRegistry,
    filter: MotionFilter,
    sent: u64,
}

impl OscRelay {
    /// Bind the control port and resolve the remote host named in `config`.
    pub fn new(config: &RelayConfig, units: usize) -> Result<Self, RelayError> {
        let local_port = config.control_port();
        info!("Opening configuration port: {}", local_port);
        let socket = UdpSocket::bind(("0.0.0.0", local_port))?;
        socket.set_nonblocking(true)?;

        info!(
            "Preparing communication with host: {}, port: {}",
            config.host, config.port
        );
        let target = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|_| RelayError::Resolve(config.host.clone()))?
            .next()
            .ok_or_else(|| RelayError::Resolve(config.host.clone()))?;

        Self::with_socket(socket, target, config, units)
    }

    /// Relay over an already bound, non-blocking socket.
    pub fn with_socket(
        socket: UdpSocket,
        target: SocketAddr,
        config: &RelayConfig,
        units: usize,
    ) -> Result<Self, RelayError> {
        let z_threshold = Arc::new(Mutex::new(config.z_threshold));

        let mut registry = MethodRegistry::new();
        let shared = Arc::clone(&z_threshold);
        registry.register("zthreshold", ",f", move |args: &[u8]| {
            if let Some(Argument::Float(value)) = decode_arguments(",f", args)?.first() {
                info!("Setting zthreshold: {}", value);
                match shared.lock() {
                    Ok(mut threshold) => *threshold = *value as f64,
                    Err(poisoned) => *poisoned.into_inner() = *value as f64,
                }
            }
            Ok(())
        })?;

        Ok(OscRelay {
            socket,
            target,
            registry,
            filter: MotionFilter::new(
                units,
                config.noise_level,
                z_threshold,
                config.after_bump_delay,
            ),
            sent: 0,
        })
    }

    /// Local address of the control socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Current bump threshold.
    pub fn z_threshold(&self) -> f64 {
        self.filter.z_threshold()
    }

    /// Messages sent so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Handle every control packet waiting on the socket. Malformed packets
    /// are logged and skipped.
    pub fn poll_control(&mut self) -> Result<usize, RelayError> {
        let mut buffer = [0u8; CONTROL_BUFFER_SIZE];
        let mut handled = 0;
        loop {
            match self.socket.recv_from(&mut buffer) {
                Ok((n, from)) => match self.registry.dispatch(&buffer[..n]) {
                    Ok(called) => handled += called,
                    Err(e) => warn!("bad control packet from {}: {}", from, e),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(handled),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Filter one set of records and send what passes.
    pub fn relay(&mut self, records: &[BirdRecord]) -> Result<usize, RelayError> {
        let messages = self.filter.step(records)?;
        let mut sent = 0;
        for message in &messages {
            match self.socket.send_to(&message.to_bytes(), self.target) {
                Ok(_) => sent += 1,
                Err(e) => warn!("sending {} failed: {}", message.name(), e),
            }
        }
        self.sent += sent as u64;
        Ok(sent)
    }

    /// Poll `source` and relay its records until `running` is cleared.
    /// Returns the number of record sets relayed.
    pub fn run<S: RecordSource>(
        &mut self,
        source: &mut S,
        running: &AtomicBool,
    ) -> Result<u64, RelayError> {
        let mut polls = 0;
        info!("Running... (Hit Ctrl-C to stop.)");
        while running.load(Ordering::SeqCst) {
            self.poll_control()?;
            if source.poll_records()? {
                self.relay(&source.records())?;
                polls += 1;
            }
        }
        info!("{} record sets relayed, {} messages sent", polls, self.sent);
        Ok(polls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Record, RecordMode};
    use std::time::Duration;

    fn at(x: f32, y: f32, z: f32) -> BirdRecord {
        BirdRecord {
            address: 1,
            record: Record::from_values(RecordMode::PositionAngles, &[x, y, z, 0.0, 0.0, 0.0]),
        }
    }

    fn filter(delay: u64) -> MotionFilter {
        MotionFilter::new(1, 3e-4, Arc::new(Mutex::new(1.5e-2)), delay)
    }

    #[test]
    fn first_poll_primes() {
        let mut f = filter(8);
        assert!(f.step(&[at(0.1, 0.1, 0.1)]).unwrap().is_empty());
    }

    #[test]
    fn noise_gate() {
        let mut f = filter(8);
        f.step(&[at(0.0, 0.0, 0.0)]).unwrap();
        assert!(f.step(&[at(1e-4, 0.0, 0.0)]).unwrap().is_empty());

        let out = f.step(&[at(1e-2, 0.0, 0.0)]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name(), "bird1");
        assert_eq!(out[0].type_tag(), ",ffffff");
        assert_eq!(
            out[0].decode_arguments().unwrap()[0],
            Argument::Float(1e-2)
        );
    }

    #[test]
    fn bump_after_rise_and_fall() {
        let mut f = filter(0);
        f.step(&[at(0.0, 0.0, 0.0)]).unwrap();
        f.step(&[at(0.0, 0.0, 0.02)]).unwrap();
        f.step(&[at(0.0, 0.0, 0.05)]).unwrap();
        let out = f.step(&[at(0.0, 0.0, 0.05)]).unwrap();

        let bump = out
            .iter()
            .find(|m| m.type_tag() == ",sf")
            .expect("bump message");
        let args = bump.decode_arguments().unwrap();
        assert_eq!(args[0], Argument::Str("bump".into()));
        match args[1] {
            Argument::Float(dz) => assert!((dz - 0.03).abs() < 1e-6),
            ref other => panic!("unexpected {:?}", other),
        }
        assert_eq!(f.bumps(0), 1);
    }

    #[test]
    fn bumps_wait_for_the_delay() {
        let mut f = filter(8);
        f.step(&[at(0.0, 0.0, 0.0)]).unwrap();
        f.step(&[at(0.0, 0.0, 0.05)]).unwrap();
        let out = f.step(&[at(0.0, 0.0, 0.05)]).unwrap();
        assert!(out.iter().all(|m| m.type_tag() != ",sf"));
        assert_eq!(f.bumps(0), 0);
    }

    #[test]
    fn records_without_position_always_pass() {
        let mut f = filter(8);
        let angles = BirdRecord {
            address: 1,
            record: Record::from_values(RecordMode::Angles, &[0.0, 0.0, 0.0]),
        };
        assert_eq!(f.step(&[angles]).unwrap().len(), 1);
        assert_eq!(f.step(&[angles]).unwrap()[0].type_tag(), ",fff");
    }

    fn local_relay() -> (OscRelay, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        let config = RelayConfig::default();
        let relay =
            OscRelay::with_socket(socket, peer.local_addr().unwrap(), &config, 1).unwrap();
        (relay, peer)
    }

    #[test]
    fn zthreshold_control() {
        let (mut relay, peer) = local_relay();
        let msg = Message::build("zthreshold", ",f", &[Argument::Float(0.25)]).unwrap();
        peer.send_to(&msg.to_bytes(), relay.local_addr().unwrap())
            .unwrap();

        let mut handled = 0;
        for _ in 0..200 {
            handled += relay.poll_control().unwrap();
            if handled > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handled, 1);
        assert!((relay.z_threshold() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn relayed_records_reach_the_peer() {
        let (mut relay, peer) = local_relay();
        relay.relay(&[at(0.0, 0.0, 0.0)]).unwrap();
        assert_eq!(relay.relay(&[at(0.5, 0.0, 0.0)]).unwrap(), 1);

        let mut buffer = [0u8; 256];
        let (n, _) = peer.recv_from(&mut buffer).unwrap();
        let msg = Message::parse(&buffer[..n]).unwrap();
        assert_eq!(msg.name(), "bird1");
        assert_eq!(relay.sent(), 1);
    }
}
