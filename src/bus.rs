//! Command/response session with a flock on the RS-232 to FBB bus.
//!
//! The host talks to the master unit; a routing byte in front of a command
//! forwards it to another unit on the bus. Every command is answered (or not)
//! with a number of bytes only the [catalog](crate::command) knows, so the
//! session remembers the size it expects and keeps any excess bytes buffered
//! for the next read.
//!
//! ```no_run
//! use flockrelay::{bus::{BusSession, BusTimings}, record::RecordMode};
//!
//! let mut flock = BusSession::start(
//!     "/dev/ttyS0",
//!     2,
//!     RecordMode::PositionAngles,
//!     true,
//!     true,
//!     BusTimings::default(),
//! )?;
//! flock.next_record(1)?;
//! println!("{:?}", flock.record(2)?);
//! # Ok::<(), flockrelay::error::FlockError>(())
//! ```

use crate::{
    byte_queue::ByteQueue,
    command::{catalog, cmd, param, route_to_unit, routed_unit, MAX_ROUTED_ADDRESS},
    error::{ErrorCode, FlockError},
    port::{read_available, Device, Port, BAUD_RATE},
    record::{BirdRecord, RecordMode},
};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::{io::Write, path::Path, time::Duration};

/// Largest response the session buffers.
pub const MAX_RESPONSE_SIZE: usize = 2048;

/// Address of the master unit.
const MASTER: u8 = 1;

/// Bus addressing mode. Fixes how many units the bus can carry and how long
/// the FLOCK SYSTEM STATUS answer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AddressingMode {
    #[allow(missing_docs)]
    #[default]
    Normal,
    #[allow(missing_docs)]
    Expanded,
    #[allow(missing_docs)]
    SuperExpanded,
}

impl AddressingMode {
    /// Largest number of units addressable in this mode, which is also the
    /// length of the flock status answer.
    pub fn max_units(self) -> usize {
        match self {
            AddressingMode::Normal => 14,
            AddressingMode::Expanded => 30,
            AddressingMode::SuperExpanded => 126,
        }
    }
}

/// Settle delays the hardware needs between commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusTimings {
    /// Pause before every command, in microseconds.
    pub command_delay_us: u64,
    /// Pause after a status query, in milliseconds.
    pub status_delay_ms: u64,
    /// Pause around auto-configuration, in milliseconds.
    pub auto_config_delay_ms: u64,
    /// Pause after a mode change, in milliseconds.
    pub mode_delay_ms: u64,
}

impl Default for BusTimings {
    fn default() -> Self {
        BusTimings {
            command_delay_us: 100,
            status_delay_ms: 100,
            auto_config_delay_ms: 800,
            mode_delay_ms: 100,
        }
    }
}

impl BusTimings {
    /// No delays at all, for talking to something that is not a real flock.
    pub fn immediate() -> Self {
        BusTimings {
            command_delay_us: 0,
            status_delay_ms: 0,
            auto_config_delay_ms: 0,
            mode_delay_ms: 0,
        }
    }

    fn command_delay(&self) -> Duration {
        Duration::from_micros(self.command_delay_us)
    }

    fn status_delay(&self) -> Duration {
        Duration::from_millis(self.status_delay_ms)
    }

    fn auto_config_delay(&self) -> Duration {
        Duration::from_millis(self.auto_config_delay_ms)
    }

    fn mode_delay(&self) -> Duration {
        Duration::from_millis(self.mode_delay_ms)
    }
}

fn settle(delay: Duration) {
    if !delay.is_zero() {
        spin_sleep::sleep(delay);
    }
}

/// Response bookkeeping between a write and the matching read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    /// The last response has been read.
    Resolved,
    /// A command was written but the catalog cannot size its response.
    Unknown,
    /// A command was written and the catalog expects this many bytes.
    Bytes(usize),
}

#[derive(Debug, Clone)]
struct Unit {
    mode: RecordMode,
    record: BirdRecord,
}

/// Status of one unit, as read by [BusSession::check_status].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStatus {
    /// Bus address
    pub address: u8,
    /// BIRD SYSTEM STATUS word
    pub status: [u8; 2],
    /// ERROR CODE
    pub error: ErrorCode,
}

/// Result of a status check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Addressing mode inferred from the flock status length
    pub addressing: AddressingMode,
    /// Raw FLOCK SYSTEM STATUS, one byte per address
    pub flock_status: Vec<u8>,
    /// One entry per unit of the session
    pub units: Vec<UnitStatus>,
}

/// An open session with a flock.
pub struct BusSession<P: Port> {
    port: P,
    timings: BusTimings,
    units: Vec<Unit>,
    buffer: ByteQueue,
    pending: Pending,
    target: u8,
    addressing: AddressingMode,
    group: bool,
    group_size: usize,
    stream: bool,
    error: ErrorCode,
}

impl BusSession<Device> {
    /// Open the serial device at `path` for a flock of `unit_count` units.
    pub fn open(
        path: impl AsRef<Path>,
        unit_count: usize,
        timings: BusTimings,
    ) -> Result<Self, FlockError> {
        let path = path.as_ref();
        let device = Device::open(path, BAUD_RATE)?;
        info!("opened flock of {} units on {}", unit_count, path.display());
        BusSession::with_port(device, unit_count, timings)
    }

    /// Open the device and bring the flock up: check status, auto-configure
    /// the bus, put every unit in `mode`, then enter group and stream mode
    /// as asked. Failing to enter stream mode is logged, not fatal.
    pub fn start(
        path: impl AsRef<Path>,
        unit_count: usize,
        mode: RecordMode,
        group: bool,
        stream: bool,
        timings: BusTimings,
    ) -> Result<Self, FlockError> {
        let mut session = BusSession::open(path, unit_count, timings)?;
        session.initialize(mode, group, stream)?;
        Ok(session)
    }
}

impl<P: Port> BusSession<P> {
    /// Run a session over an already open port. Every unit must be
    /// reachable with a routing byte, so at most 30 units.
    pub fn with_port(port: P, unit_count: usize, timings: BusTimings) -> Result<Self, FlockError> {
        if unit_count == 0 || unit_count > MAX_ROUTED_ADDRESS as usize {
            return Err(FlockError::InvalidUnitCount(unit_count));
        }

        let mode = RecordMode::default();
        let units = (1..=unit_count)
            .map(|address| Unit {
                mode,
                record: BirdRecord::zeroed(address as u8, mode),
            })
            .collect();

        Ok(BusSession {
            port,
            timings,
            units,
            buffer: ByteQueue::with_capacity(MAX_RESPONSE_SIZE),
            pending: Pending::Resolved,
            target: MASTER,
            addressing: AddressingMode::Normal,
            group: false,
            group_size: 0,
            stream: false,
            error: ErrorCode::NoError,
        })
    }

    /// The bring-up sequence of [BusSession::start] on an open session.
    pub fn initialize(
        &mut self,
        mode: RecordMode,
        group: bool,
        stream: bool,
    ) -> Result<(), FlockError> {
        self.check_status()?;
        self.auto_configure()?;
        self.set_record_mode_all_units(mode)?;
        self.set_group_mode(group)?;
        if stream {
            if let Err(e) = self.set_stream_mode(true) {
                warn!("cannot enter stream mode: {}", e);
            }
        }
        Ok(())
    }

    /// Leave stream mode, check the flock one last time and release the
    /// device.
    pub fn close(mut self) -> Result<(), FlockError> {
        if self.stream {
            if let Err(e) = self.set_stream_mode(false) {
                warn!("cannot leave stream mode on close: {}", e);
            }
        }
        if let Err(e) = self.check_status() {
            warn!("status check on close failed: {}", e);
        }
        info!("closed flock session");
        Ok(())
    }

    fn system_call<T>(&mut self, result: std::io::Result<T>) -> Result<T, FlockError> {
        result.map_err(|e| {
            self.error = ErrorCode::SystemCall;
            FlockError::Io(e)
        })
    }

    fn unit_index(&mut self, unit: usize) -> Result<usize, FlockError> {
        if unit == 0 || unit > self.units.len() {
            self.error = ErrorCode::Unimplemented;
            return Err(FlockError::InvalidUnit(unit));
        }
        Ok(unit - 1)
    }

    /// Send the next command to the unit at `address`.
    fn route(&mut self, address: u8) -> Result<(), FlockError> {
        match route_to_unit(address) {
            Some(byte) => self.write(&[byte]),
            None => {
                self.error = ErrorCode::Unimplemented;
                Err(FlockError::InvalidUnit(address as usize))
            }
        }
    }

    /// Write one command (a routing byte, or a command byte with its data).
    ///
    /// Pending output is drained and the inter-command delay observed first.
    /// Any buffered response bytes are dropped, and the response size the
    /// catalog predicts is remembered for the next [BusSession::read].
    pub fn write(&mut self, command: &[u8]) -> Result<(), FlockError> {
        let Some(&first) = command.first() else {
            return Ok(());
        };

        let sizes = catalog().lookup(command);
        match sizes {
            Some(sizes) => {
                if let Some(size) = sizes.wire_size() {
                    if size != command.len() {
                        warn!(
                            "{} is {} bytes, writing {} as asked",
                            catalog().describe(command),
                            size,
                            command.len()
                        );
                    }
                }
                self.pending = match sizes.response.fixed() {
                    Some(n) => Pending::Bytes(n),
                    None => Pending::Unknown,
                };
            }
            None => {
                debug!("writing unknown command {:02x?}", command);
                self.pending = Pending::Unknown;
            }
        }

        self.buffer.clear();
        self.target = routed_unit(first).unwrap_or(MASTER);

        trace!("write {:02x?}: {}", command, catalog().describe(command));
        let drained = self.port.drain();
        self.system_call(drained)?;
        settle(self.timings.command_delay());
        let written = self.port.write_all(command);
        self.system_call(written)
    }

    /// Pull whatever the device has into the response buffer with one read.
    fn fill(&mut self) -> Result<usize, FlockError> {
        let free = self.buffer.free();
        if free == 0 {
            return Ok(0);
        }
        let mut chunk = vec![0u8; free];
        let read = read_available(&mut self.port, &mut chunk);
        let n = self.system_call(read)?;
        self.buffer.append(&chunk[..n]);
        Ok(n)
    }

    /// Take `expected` response bytes.
    ///
    /// Bytes left over from an earlier read are used first, without touching
    /// the device. Otherwise a single read is made; `Ok(None)` means not
    /// enough has arrived yet and the caller may retry. If the catalog
    /// predicted a different size at write time, `expected` wins.
    pub fn read(&mut self, expected: usize) -> Result<Option<Vec<u8>>, FlockError> {
        if let Pending::Bytes(predicted) = self.pending {
            if predicted != expected {
                warn!(
                    "expected a {} byte response, reading {} as asked",
                    predicted, expected
                );
                self.pending = Pending::Bytes(expected);
            }
        }
        if expected > MAX_RESPONSE_SIZE {
            self.error = ErrorCode::Unimplemented;
            return Err(FlockError::InvalidSize {
                expected,
                actual: MAX_RESPONSE_SIZE,
            });
        }

        if self.buffer.len() < expected {
            self.fill()?;
        }
        let data = self.buffer.take(expected);
        if data.is_some() {
            self.pending = Pending::Resolved;
        }
        Ok(data)
    }

    /// Read a short answer, giving the device up to the status delay to
    /// produce it.
    fn read_answer(&mut self, expected: usize) -> Result<Option<Vec<u8>>, FlockError> {
        if let Some(data) = self.read(expected)? {
            return Ok(Some(data));
        }
        let wait = self.timings.status_delay();
        let readable = self.port.wait_readable(Some(wait));
        if self.system_call(readable)? {
            return self.read(expected);
        }
        Ok(None)
    }

    fn examine(
        &mut self,
        address: u8,
        parameter: u8,
        size: usize,
    ) -> Result<Option<Vec<u8>>, FlockError> {
        self.route(address)?;
        self.write(&[cmd::EXAMINE_VALUE, parameter])?;
        settle(self.timings.status_delay());
        self.read_answer(size)
    }

    /// Query the flock and every unit for status and error codes.
    ///
    /// The length of the FLOCK SYSTEM STATUS answer tells the addressing
    /// mode: the longest length that is fully available wins. A unit
    /// reporting CPU time overflow is fine; any other error code is logged
    /// and kept for [BusSession::take_error] without failing the check.
    pub fn check_status(&mut self) -> Result<StatusReport, FlockError> {
        self.route(MASTER)?;
        self.write(&[cmd::EXAMINE_VALUE, param::FLOCK_SYSTEM_STATUS])?;
        settle(self.timings.status_delay());

        loop {
            let readable = self.port.wait_readable(Some(Duration::ZERO));
            if !self.system_call(readable)? || self.fill()? == 0 {
                break;
            }
        }

        let mut found = None;
        for mode in [
            AddressingMode::SuperExpanded,
            AddressingMode::Expanded,
            AddressingMode::Normal,
        ] {
            if let Some(status) = self.buffer.peek(mode.max_units()) {
                self.buffer.consume(status.len());
                self.pending = Pending::Resolved;
                found = Some((mode, status));
                break;
            }
        }
        let Some((addressing, flock_status)) = found else {
            return Err(FlockError::NoStatus);
        };
        debug!("flock answers in {:?} addressing", addressing);
        self.addressing = addressing;

        let mut units = Vec::with_capacity(self.units.len());
        for unit in 1..=self.units.len() {
            let address = unit as u8;

            let status = self
                .examine(address, param::BIRD_SYSTEM_STATUS, 2)?
                .ok_or(FlockError::NoResponse {
                    unit,
                    query: "bird system status",
                })?;
            let code = self
                .examine(address, param::ERROR_CODE, 1)?
                .ok_or(FlockError::NoResponse {
                    unit,
                    query: "error code",
                })?[0];

            let error = if code == 0 {
                ErrorCode::NoError
            } else {
                ErrorCode::Device(code)
            };
            if !error.is_benign() {
                warn!("unit {} reports error {}: {}", unit, code, error);
                self.error = error;
            }

            units.push(UnitStatus {
                address,
                status: [status[0], status[1]],
                error,
            });
        }

        Ok(StatusReport {
            addressing,
            flock_status,
            units,
        })
    }

    /// Have the master configure the bus for the session's unit count.
    pub fn auto_configure(&mut self) -> Result<(), FlockError> {
        self.route(MASTER)?;
        settle(self.timings.auto_config_delay());
        self.write(&[
            cmd::CHANGE_VALUE,
            param::FBB_AUTO_CONFIGURATION,
            self.units.len() as u8,
        ])?;
        settle(self.timings.auto_config_delay());
        Ok(())
    }

    fn recompute_group_size(&mut self) {
        self.group_size = if self.group {
            self.units.iter().map(|u| u.mode.wire_size()).sum()
        } else {
            0
        };
    }

    /// Turn group mode on or off. In group mode one request is answered with
    /// the records of all units back to back.
    pub fn set_group_mode(&mut self, enabled: bool) -> Result<(), FlockError> {
        self.route(MASTER)?;
        self.write(&[cmd::CHANGE_VALUE, param::GROUP_MODE, u8::from(enabled)])?;
        settle(self.timings.mode_delay());
        self.group = enabled;
        self.recompute_group_size();
        Ok(())
    }

    /// Turn stream mode on or off. Streaming needs group mode; leaving it
    /// sends one POINT to the master, and anything still streaming in is
    /// dropped.
    pub fn set_stream_mode(&mut self, enabled: bool) -> Result<(), FlockError> {
        if enabled && !self.group {
            self.error = ErrorCode::Unimplemented;
            return Err(FlockError::NotInGroupMode);
        }

        if enabled && !self.stream {
            self.write(&[cmd::STREAM])?;
            self.stream = true;
        } else if !enabled && self.stream {
            self.route(MASTER)?;
            self.write(&[cmd::POINT])?;
            self.stream = false;
        }
        settle(self.timings.mode_delay());

        if !enabled {
            let discarded = self.port.discard_input();
            self.system_call(discarded)?;
            self.buffer.clear();
        }
        Ok(())
    }

    /// Set the record mode of unit `unit` (1-based).
    pub fn set_record_mode(&mut self, unit: usize, mode: RecordMode) -> Result<(), FlockError> {
        let index = self.unit_index(unit)?;
        self.route(unit as u8)?;
        self.write(&[mode.command()])?;
        settle(self.timings.mode_delay());

        self.units[index].mode = mode;
        self.units[index].record = BirdRecord::zeroed(unit as u8, mode);
        self.recompute_group_size();
        Ok(())
    }

    /// Set the same record mode on every unit.
    pub fn set_record_mode_all_units(&mut self, mode: RecordMode) -> Result<(), FlockError> {
        for unit in 1..=self.units.len() {
            self.set_record_mode(unit, mode)?;
        }
        Ok(())
    }

    /// Get the next record of `unit`, or of every unit in group mode.
    ///
    /// Outside stream mode a POINT request is sent first. Then this waits,
    /// without a timeout, until the whole response has arrived.
    pub fn next_record(&mut self, unit: usize) -> Result<(), FlockError> {
        let index = self.unit_index(unit)?;

        if !self.stream {
            self.route(unit as u8)?;
            self.write(&[cmd::POINT])?;
        }

        let size = if self.group {
            self.group_size
        } else {
            self.units[index].mode.wire_size()
        };

        let data = loop {
            if self.buffer.len() < size {
                let readable = self.port.wait_readable(None);
                if !self.system_call(readable)? {
                    return Err(FlockError::NoResponse {
                        unit,
                        query: "point",
                    });
                }
            }
            if let Some(data) = self.read(size)? {
                break data;
            }
        };

        let decoded = if self.group {
            self.decode_group(&data)
        } else {
            let mode = self.units[index].mode;
            BirdRecord::decode_packed(unit as u8, mode, &data)
                .map(|record| self.units[index].record = record)
        };

        if let Err(FlockError::PhaseBit { .. }) = &decoded {
            if self.stream {
                self.realign();
            }
        }
        decoded
    }

    fn decode_group(&mut self, data: &[u8]) -> Result<(), FlockError> {
        let mut offset = 0;
        for (index, unit) in self.units.iter_mut().enumerate() {
            let size = unit.mode.wire_size();
            unit.record = BirdRecord::decode_packed(
                (index + 1) as u8,
                unit.mode,
                &data[offset..offset + size],
            )?;
            offset += size;
        }
        Ok(())
    }

    /// Drop buffered bytes up to the next one carrying the phase bit.
    fn realign(&mut self) {
        let skip = self
            .buffer
            .as_slice()
            .iter()
            .position(|b| b & 0x80 != 0)
            .unwrap_or(self.buffer.len());
        debug!("realigning stream, dropping {} bytes", skip);
        self.buffer.consume(skip);
    }

    /// Last record decoded for `unit` (1-based).
    pub fn record(&self, unit: usize) -> Result<&BirdRecord, FlockError> {
        if unit == 0 || unit > self.units.len() {
            return Err(FlockError::InvalidUnit(unit));
        }
        Ok(&self.units[unit - 1].record)
    }

    /// Last record of every unit, in address order.
    pub fn records(&self) -> Vec<BirdRecord> {
        self.units.iter().map(|u| u.record).collect()
    }

    /// Record mode of `unit` (1-based).
    pub fn record_mode(&self, unit: usize) -> Option<RecordMode> {
        self.units.get(unit.checked_sub(1)?).map(|u| u.mode)
    }

    /// The most specific error seen since the last call. Reading clears it.
    pub fn take_error(&mut self) -> ErrorCode {
        std::mem::take(&mut self.error)
    }

    /// Number of units in the session.
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Addressing mode found by the last status check.
    pub fn addressing_mode(&self) -> AddressingMode {
        self.addressing
    }

    /// Unit addressed by the last command written.
    pub fn target(&self) -> u8 {
        self.target
    }

    #[allow(missing_docs)]
    pub fn is_group(&self) -> bool {
        self.group
    }

    #[allow(missing_docs)]
    pub fn is_stream(&self) -> bool {
        self.stream
    }

    /// Bytes in one group response, zero outside group mode.
    pub fn group_size(&self) -> usize {
        self.group_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;
    use crate::record::{tests::pack_words, Record};

    fn session(units: usize) -> (BusSession<MockPort>, MockPort) {
        let port = MockPort::new();
        let session = BusSession::with_port(port.clone(), units, BusTimings::immediate()).unwrap();
        (session, port)
    }

    /// Two units in group and stream mode decode one 24 byte group response
    #[test]
    fn group_stream_scenario() {
        let (mut flock, port) = session(2);
        flock.auto_configure().unwrap();
        flock.set_group_mode(true).unwrap();
        flock.set_stream_mode(true).unwrap();
        assert_eq!(flock.group_size(), 24);

        let one = [0.5, -0.25, 0.125, 0.0, 0.75, -0.5];
        let two = [-1.0, 0.25, 0.5, -0.125, 0.0, 0.25];
        port.inject(&pack_words(&one));
        port.inject(&pack_words(&two));

        flock.next_record(1).unwrap();
        assert_eq!(flock.record(1).unwrap().record.values(), one.to_vec());
        assert_eq!(flock.record(2).unwrap().record.values(), two.to_vec());
        assert_eq!(flock.record(2).unwrap().address, 2);

        assert_eq!(
            port.written(),
            vec![0xf1, 0x50, 0x32, 2, 0xf1, 0x50, 0x23, 1, 0x40]
        );
    }

    /// Excess bytes stay buffered and satisfy later reads without I/O
    #[test]
    fn read_keeps_excess_bytes() {
        let (mut flock, port) = session(1);
        port.inject(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);

        assert_eq!(flock.read(4).unwrap(), Some(vec![1, 2, 3, 4]));
        assert_eq!(port.pending(), 0);
        assert_eq!(flock.read(4).unwrap(), Some(vec![5, 6, 7, 8]));
        assert_eq!(flock.read(4).unwrap(), None);

        port.inject(&[11, 12]);
        assert_eq!(flock.read(4).unwrap(), Some(vec![9, 10, 11, 12]));
    }

    /// Partial arrivals are retried until complete
    #[test]
    fn read_retries_partial_response() {
        let (mut flock, port) = session(1);
        port.set_chunk(3);
        port.inject(&[0xaa; 7]);
        assert_eq!(flock.read(7).unwrap(), None);
        assert_eq!(flock.read(7).unwrap(), None);
        assert_eq!(flock.read(7).unwrap(), Some(vec![0xaa; 7]));
    }

    /// The caller's expected size wins over the catalog's
    #[test]
    fn caller_size_wins() {
        let (mut flock, port) = session(1);
        port.reply_to(&[cmd::EXAMINE_VALUE, param::ERROR_CODE], &[0, 9]);
        flock.write(&[cmd::EXAMINE_VALUE, param::ERROR_CODE]).unwrap();
        assert_eq!(flock.read(2).unwrap(), Some(vec![0, 9]));
    }

    #[test]
    fn write_clears_response_buffer() {
        let (mut flock, port) = session(1);
        port.inject(&[1, 2, 3, 4]);
        assert_eq!(flock.read(2).unwrap(), Some(vec![1, 2]));
        flock.write(&[cmd::POINT]).unwrap();
        assert_eq!(flock.read(2).unwrap(), None);
    }

    #[test]
    fn write_tracks_target_unit() {
        let (mut flock, _port) = session(2);
        flock.write(&[route_to_unit(2).unwrap()]).unwrap();
        assert_eq!(flock.target(), 2);
        flock.write(&[route_to_unit(18).unwrap()]).unwrap();
        assert_eq!(flock.target(), 18);
        flock.write(&[cmd::POINT]).unwrap();
        assert_eq!(flock.target(), MASTER);
    }

    fn script_status(port: &MockPort, flock_status: &[u8], codes: &[u8]) {
        port.reply_to(
            &[cmd::EXAMINE_VALUE, param::FLOCK_SYSTEM_STATUS],
            flock_status,
        );
        for code in codes {
            port.reply_to(&[cmd::EXAMINE_VALUE, param::BIRD_SYSTEM_STATUS], &[0x81, 0x20]);
            port.reply_to(&[cmd::EXAMINE_VALUE, param::ERROR_CODE], &[*code]);
        }
    }

    /// CPU time overflow is tolerated, other error codes are kept
    #[test]
    fn check_status_reports_units() {
        let (mut flock, port) = session(2);
        script_status(&port, &[0xa0; 14], &[13, 31]);

        let report = flock.check_status().unwrap();
        assert_eq!(report.addressing, AddressingMode::Normal);
        assert_eq!(report.flock_status.len(), 14);
        assert_eq!(report.units.len(), 2);
        assert_eq!(report.units[0].status, [0x81, 0x20]);
        assert_eq!(report.units[0].error, ErrorCode::Device(13));
        assert_eq!(report.units[1].error, ErrorCode::Device(31));

        assert_eq!(flock.take_error(), ErrorCode::Device(13));
        assert_eq!(flock.take_error(), ErrorCode::NoError);
    }

    #[test]
    fn check_status_detects_expanded_addressing() {
        let (mut flock, port) = session(1);
        script_status(&port, &[0x80; 30], &[0]);
        let report = flock.check_status().unwrap();
        assert_eq!(report.addressing, AddressingMode::Expanded);
        assert_eq!(flock.addressing_mode(), AddressingMode::Expanded);
        assert_eq!(flock.take_error(), ErrorCode::NoError);
    }

    #[test]
    fn check_status_without_answer() {
        let (mut flock, _port) = session(1);
        assert!(matches!(flock.check_status(), Err(FlockError::NoStatus)));
    }

    #[test]
    fn silent_unit_fails_status() {
        let (mut flock, port) = session(1);
        port.reply_to(&[cmd::EXAMINE_VALUE, param::FLOCK_SYSTEM_STATUS], &[0; 14]);
        assert!(matches!(
            flock.check_status(),
            Err(FlockError::NoResponse { unit: 1, .. })
        ));
    }

    /// Stream mode is refused outside group mode
    #[test]
    fn stream_needs_group() {
        let (mut flock, port) = session(2);
        assert!(matches!(
            flock.set_stream_mode(true),
            Err(FlockError::NotInGroupMode)
        ));
        assert_eq!(flock.take_error(), ErrorCode::Unimplemented);
        assert!(port.written().is_empty());
    }

    #[test]
    fn leaving_stream_sends_point() {
        let (mut flock, port) = session(2);
        flock.set_group_mode(true).unwrap();
        flock.set_stream_mode(true).unwrap();
        port.inject(&[0x80; 5]);
        flock.set_stream_mode(false).unwrap();
        assert!(!flock.is_stream());
        assert!(port.written().ends_with(&[0x40, 0xf1, 0x42]));
        assert_eq!(port.pending(), 0);
    }

    /// A single record is requested with POINT and decoded in its unit's mode
    #[test]
    fn point_request_single_unit() {
        let (mut flock, port) = session(2);
        flock.set_record_mode(2, RecordMode::Position).unwrap();

        let values = [0.25, 0.5, -0.75];
        port.reply_to(&[cmd::POINT], &pack_words(&values));
        flock.next_record(2).unwrap();

        assert_eq!(
            flock.record(2).unwrap().record,
            Record::Position {
                position: [0.25, 0.5, -0.75]
            }
        );
        assert!(port.written().ends_with(&[0xf2, 0x56, 0xf2, 0x42]));
    }

    #[test]
    fn invalid_unit_rejected() {
        let (mut flock, _port) = session(2);
        assert!(matches!(flock.next_record(3), Err(FlockError::InvalidUnit(3))));
        assert!(matches!(flock.next_record(0), Err(FlockError::InvalidUnit(0))));
        assert_eq!(flock.take_error(), ErrorCode::Unimplemented);
        assert!(matches!(
            flock.set_record_mode(5, RecordMode::Angles),
            Err(FlockError::InvalidUnit(5))
        ));
    }

    #[test]
    fn group_size_follows_record_modes() {
        let (mut flock, _port) = session(3);
        flock.set_record_mode_all_units(RecordMode::Quaternion).unwrap();
        flock.set_group_mode(true).unwrap();
        assert_eq!(flock.group_size(), 24);
        flock.set_record_mode(1, RecordMode::PositionMatrix).unwrap();
        assert_eq!(flock.group_size(), 40);
        flock.set_group_mode(false).unwrap();
        assert_eq!(flock.group_size(), 0);
    }

    /// A stream record without the phase bit is rejected and the next
    /// aligned record still decodes
    #[test]
    fn stream_realigns_after_phase_error() {
        let (mut flock, port) = session(1);
        flock.set_record_mode(1, RecordMode::Position).unwrap();
        flock.set_group_mode(true).unwrap();
        flock.set_stream_mode(true).unwrap();

        port.inject(&[0x01, 0x02]);
        port.inject(&pack_words(&[0.5, 0.5, 0.5]));
        port.inject(&pack_words(&[0.25, 0.25, 0.25]));

        assert!(matches!(
            flock.next_record(1),
            Err(FlockError::PhaseBit { address: 1 })
        ));
        flock.next_record(1).unwrap();
        assert_eq!(flock.record(1).unwrap().record.values(), vec![0.25; 3]);
    }

    #[test]
    fn unit_count_bounds() {
        assert!(matches!(
            BusSession::with_port(MockPort::new(), 0, BusTimings::immediate()),
            Err(FlockError::InvalidUnitCount(0))
        ));
        assert!(matches!(
            BusSession::with_port(MockPort::new(), 40, BusTimings::immediate()),
            Err(FlockError::InvalidUnitCount(40))
        ));
        assert!(BusSession::with_port(MockPort::new(), 30, BusTimings::immediate()).is_ok());
    }

    /// The last routable unit gets the last expanded routing byte
    #[test]
    fn highest_unit_is_routed() {
        let (mut flock, port) = session(30);
        flock.set_record_mode(30, RecordMode::Position).unwrap();
        assert_eq!(port.written(), vec![0xee, 0x56]);
        assert!(matches!(
            flock.set_record_mode(31, RecordMode::Position),
            Err(FlockError::InvalidUnit(31))
        ));
    }

    #[test]
    fn check_status_detects_super_expanded_addressing() {
        let (mut flock, port) = session(2);
        script_status(&port, &[0x80; 126], &[0, 0]);
        let report = flock.check_status().unwrap();
        assert_eq!(report.addressing, AddressingMode::SuperExpanded);
        assert_eq!(report.flock_status, vec![0x80; 126]);
        assert_eq!(report.units.len(), 2);
        assert_eq!(flock.addressing_mode(), AddressingMode::SuperExpanded);
    }

    /// A failure leaving stream mode does not stop the closing status check
    #[test]
    fn close_continues_after_stream_exit_fails() {
        let (mut flock, port) = session(1);
        flock.set_group_mode(true).unwrap();
        flock.set_stream_mode(true).unwrap();

        port.fail_writes(1);
        flock.close().unwrap();
        assert!(port.written().ends_with(&[
            0xf1,
            cmd::EXAMINE_VALUE,
            param::FLOCK_SYSTEM_STATUS
        ]));
    }
}
