//! Continuous record stream from a high-speed tracker.
//!
//! Once in continuous mode the tracker sends one frame after another with
//! no handshake: for every station, a 32 byte sub-frame made of an 8 byte
//! header (`'L' 'Y'`, station number, reserved, status code, reserved,
//! payload size) and six 32 bit floats (x, y, z, azimuth, elevation, roll).
//! A [Synchronizer] finds frame boundaries in that stream, decodes the
//! frames it accepts, and keeps a ledger of everything it had to skip.

use crate::{
    byte_queue::ByteQueue,
    error::FlockError,
    port::{read_available, Device, Port, BAUD_RATE},
    record::{BirdRecord, Record},
    usb_bridge::{self, UsbBridge},
};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::{fmt, io::Write, path::Path, time::Duration};

/// Bytes of one station's sub-frame.
pub const UNIT_FRAME_SIZE: usize = 32;
/// Bytes of a sub-frame header.
pub const HEADER_SIZE: usize = 8;
/// Sub-frame marker.
pub const MAGIC: [u8; 2] = *b"LY";
/// Smallest capacity of the accumulation buffer. It always holds at least
/// two frames, so a failed scan leaves room for the rest of a frame.
pub const BUFFER_SIZE: usize = 1024;

/// Commands that put the tracker in binary, centimetre, position and
/// angles, continuous output.
const CONFIGURATION: [&[u8]; 4] = [b"F1\r", b"U1\r", b"O*,2,4\r", b"C\r"];

/// How the device's float fields map to host floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOrder {
    /// Copy the four bytes as they are (little-endian hosts).
    Verbatim,
    /// Reverse the four bytes first (big-endian hosts).
    Swapped,
}

impl FieldOrder {
    /// The order matching this host.
    pub fn for_host() -> Self {
        if cfg!(target_endian = "big") {
            FieldOrder::Swapped
        } else {
            FieldOrder::Verbatim
        }
    }

    /// Decode one 4 byte field.
    pub fn decode(self, mut bytes: [u8; 4]) -> f32 {
        if self == FieldOrder::Swapped {
            bytes.reverse();
        }
        f32::from_ne_bytes(bytes)
    }
}

/// Human-readable text of a tracker status code.
pub fn status_description(code: u8) -> &'static str {
    match code {
        0x00 | 0x20 => "no error",
        0x01 => "invalid command",
        0x02 => "invalid station",
        0x03 => "invalid parameter",
        0x04 => "too few parameters",
        0x05 => "too many parameters",
        0x06 => "parameter below limit",
        0x07 => "parameter above limit",
        0x08 => "communication failure with sensor processor board",
        0x09 => "error initiating sensor processor 1",
        0x0a => "error initiating sensor processor 2",
        0x0b => "error initiating sensor processor 3",
        0x0c => "error initiating sensor processor 4",
        0x0d => "no sensor processors detected",
        0x0e => "error initiating source processor",
        0x0f => "memory allocation error",
        0x10 => "excessive command characters entered",
        0x11 => "you must exit UTH mode to send this command",
        0x12 => "error reading source prom, using defaults",
        0x13 => "this is a read only command",
        0x14 => "non-fatal text message",
        0x15 => "error loading map",
        0x16 => "error synchronizing sensors",
        0x17 => "firmware incompatible with IO proc code, upgrade required",
        0x18 => "outdated IO processor code, upgrade recommended",
        0x41 => "source fail x + bit errors",
        0x42 => "source fail y + bit errors",
        0x43 => "source fail xy + bit errors",
        0x44 => "source fail z + bit errors",
        0x45 => "source fail xz + bit errors",
        0x46 => "source fail yz + bit errors",
        0x47 => "source fail xyz + bit errors",
        0x49 => "bit errors",
        0x61 => "source fail x",
        0x62 => "source fail y",
        0x63 => "source fail xy",
        0x64 => "source fail z",
        0x65 => "source fail xz",
        0x66 => "source fail yz",
        0x67 => "source fail xyz",
        0x75 => "position outside of mapped area",
        _ => "unknown error",
    }
}

/// Counters describing how clean the stream has been.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStats {
    /// Frames accepted
    pub syncs: u64,
    /// Sub-frame headers with the right marker
    pub tag_successes: u64,
    /// Marked sub-frames with the wrong station number
    pub station_errors: u64,
    /// Station numbers seen in marked sub-frames
    pub stations_seen: [bool; 256],
    /// Sub-frames carrying a status other than "no error"
    pub error_indicators: u64,
    /// Occurrences of each status code
    pub error_counts: [u64; 256],
    /// Marked sub-frames with the wrong payload size
    pub size_errors: u64,
}

impl Default for SyncStats {
    fn default() -> Self {
        SyncStats {
            syncs: 0,
            tag_successes: 0,
            station_errors: 0,
            stations_seen: [false; 256],
            error_indicators: 0,
            error_counts: [0; 256],
            size_errors: 0,
        }
    }
}

impl fmt::Display for SyncStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "syncs: {}", self.syncs)?;
        writeln!(f, "tag successes: {}", self.tag_successes)?;
        write!(f, "station number errors: {}, stations found:", self.station_errors)?;
        for (station, _) in self.stations_seen.iter().enumerate().filter(|(_, seen)| **seen) {
            write!(f, " #{}", station)?;
        }
        writeln!(f)?;
        writeln!(f, "record error indicators: {}", self.error_indicators)?;
        for (code, count) in self.error_counts.iter().enumerate().filter(|(_, n)| **n > 0) {
            writeln!(f, "  {}: {}", status_description(code as u8), count)?;
        }
        write!(f, "size errors: {}", self.size_errors)
    }
}

/// Check one sub-frame header for station `unit` (0-based).
fn check_header(stats: &mut SyncStats, frame: &[u8], unit: usize) -> bool {
    if frame[0..2] != MAGIC {
        return false;
    }
    stats.tag_successes += 1;

    let station = frame[2];
    stats.stations_seen[usize::from(station)] = true;
    if usize::from(station) != unit + 1 {
        stats.station_errors += 1;
        return false;
    }

    let status = frame[4];
    if status != 0x00 && status != 0x20 {
        stats.error_indicators += 1;
        stats.error_counts[usize::from(status)] += 1;
    }

    let size = usize::from(u16::from_le_bytes([frame[6], frame[7]]));
    if size + HEADER_SIZE != UNIT_FRAME_SIZE {
        stats.size_errors += 1;
        return false;
    }

    true
}

fn decode_frame(order: FieldOrder, frame: &[u8]) -> BirdRecord {
    let mut values = [0f32; 6];
    for (value, field) in values
        .iter_mut()
        .zip(frame[HEADER_SIZE..UNIT_FRAME_SIZE].chunks_exact(4))
    {
        *value = order.decode([field[0], field[1], field[2], field[3]]);
    }
    BirdRecord {
        address: frame[2],
        record: Record::PositionAngles {
            position: [values[0], values[1], values[2]],
            angles: [values[3], values[4], values[5]],
        },
    }
}

/// Finds frame boundaries in the tracker's byte stream.
#[derive(Debug, Clone)]
pub struct Synchronizer {
    units: usize,
    order: FieldOrder,
    buffer: ByteQueue,
    synchronized: bool,
    records: Vec<BirdRecord>,
    stats: SyncStats,
}

impl Synchronizer {
    /// A synchronizer for frames of `units` stations.
    pub fn new(units: usize, order: FieldOrder) -> Self {
        Synchronizer {
            units,
            order,
            buffer: ByteQueue::with_capacity(BUFFER_SIZE.max(2 * units * UNIT_FRAME_SIZE)),
            synchronized: false,
            records: (1..=units)
                .map(|station| BirdRecord {
                    address: station as u8,
                    record: Record::PositionAngles {
                        position: [0.0; 3],
                        angles: [0.0; 3],
                    },
                })
                .collect(),
            stats: SyncStats::default(),
        }
    }

    /// Bytes in one full frame.
    pub fn frame_size(&self) -> usize {
        self.units * UNIT_FRAME_SIZE
    }

    /// Append received bytes. What does not fit in the buffer is dropped;
    /// returns how many bytes were kept.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        self.buffer.append(bytes)
    }

    /// Forget the current frame so the next [Synchronizer::sync] scans
    /// again.
    pub fn unsync(&mut self) {
        self.synchronized = false;
    }

    /// Bytes that can still be pushed without dropping any.
    pub fn free(&self) -> usize {
        self.buffer.free()
    }

    /// Look for a complete frame in the buffer.
    ///
    /// Every offset where a whole frame fits is tried in order; at each one
    /// the stations are checked one after the other and every station that
    /// passes is decoded right away. The first offset where all stations
    /// pass is the frame. Everything before the last offset tried (plus the
    /// frame itself on success) is then dropped from the buffer, whether a
    /// frame was found or not.
    pub fn sync(&mut self) -> bool {
        if self.synchronized {
            return true;
        }

        let frame_size = self.frame_size();
        let data = self.buffer.as_slice();
        let mut shift = 0;
        let mut ok = false;

        let mut offset = 0;
        while offset + frame_size <= data.len() {
            shift = offset;
            ok = true;

            for unit in 0..self.units {
                let start = offset + unit * UNIT_FRAME_SIZE;
                let frame = &data[start..start + UNIT_FRAME_SIZE];
                let unit_ok = check_header(&mut self.stats, frame, unit);
                if unit_ok {
                    self.records[unit] = decode_frame(self.order, frame);
                }
                ok = ok && unit_ok;
                if !ok {
                    break;
                }
            }

            if ok {
                self.synchronized = true;
                self.stats.syncs += 1;
                shift += frame_size;
                break;
            }
            offset += 1;
        }

        if shift > 0 {
            self.buffer.consume(shift);
        }
        ok
    }

    /// Bytes waiting in the buffer.
    pub fn buffered(&mut self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// Last record decoded for each station.
    pub fn records(&self) -> &[BirdRecord] {
        &self.records
    }

    /// The synchronization ledger.
    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }
}

/// Tuning of a stream session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// How long one wait for more bytes lasts, in milliseconds.
    pub select_timeout_ms: u64,
    /// Waits allowed per record before giving up.
    pub max_tries: u32,
    /// Wake-up attempts before the tracker is declared absent.
    pub handshake_attempts: u32,
    /// Pause between wake-up attempts, in milliseconds.
    pub handshake_delay_ms: u64,
    /// USB vendor id.
    pub vendor_id: u16,
    /// USB product id of the configured tracker.
    pub product_id: u16,
    /// Bulk OUT endpoint.
    pub write_endpoint: u8,
    /// Bulk IN endpoint.
    pub read_endpoint: u8,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            select_timeout_ms: 1,
            max_tries: 20,
            handshake_attempts: 100,
            handshake_delay_ms: 100,
            vendor_id: usb_bridge::VENDOR_ID,
            product_id: usb_bridge::CONFIGURED_PRODUCT_ID,
            write_endpoint: usb_bridge::WRITE_ENDPOINT,
            read_endpoint: usb_bridge::READ_ENDPOINT,
        }
    }
}

/// An open session with a high-speed tracker.
pub struct StreamSession<P: Port> {
    port: P,
    sync: Synchronizer,
    config: StreamConfig,
}

impl StreamSession<Device> {
    /// Open the tracker on a serial port and start continuous output.
    pub fn open(
        path: impl AsRef<Path>,
        units: usize,
        config: StreamConfig,
    ) -> Result<Self, FlockError> {
        let path = path.as_ref();
        let device = Device::open(path, BAUD_RATE)?;
        info!("opened tracker with {} stations on {}", units, path.display());
        StreamSession::connect(device, units, config)
    }
}

impl StreamSession<UsbBridge> {
    /// Open the tracker over USB and start continuous output.
    pub fn open_usb(units: usize, config: StreamConfig) -> Result<Self, FlockError> {
        let bridge = UsbBridge::connect(
            config.vendor_id,
            config.product_id,
            config.write_endpoint,
            config.read_endpoint,
        )?;
        StreamSession::connect(bridge, units, config)
    }
}

impl<P: Port> StreamSession<P> {
    /// Wrap a port that already carries the record stream.
    pub fn with_port(port: P, units: usize, config: StreamConfig) -> Result<Self, FlockError> {
        if units == 0 || units > 255 {
            return Err(FlockError::InvalidUnitCount(units));
        }
        Ok(StreamSession {
            port,
            sync: Synchronizer::new(units, FieldOrder::for_host()),
            config,
        })
    }

    /// Wake the tracker up, drop whatever it had queued, and switch it to
    /// continuous binary output.
    pub fn connect(port: P, units: usize, config: StreamConfig) -> Result<Self, FlockError> {
        let mut session = StreamSession::with_port(port, units, config)?;
        session.handshake()?;
        session.configure()?;
        Ok(session)
    }

    fn handshake(&mut self) -> Result<(), FlockError> {
        let delay = Duration::from_millis(self.config.handshake_delay_ms);
        let mut buf = [0u8; 64];

        for attempt in 0..self.config.handshake_attempts {
            self.port.write_all(b"\r")?;
            if !delay.is_zero() {
                spin_sleep::sleep(delay);
            }
            if read_available(&mut self.port, &mut buf)? > 0 {
                debug!("tracker answered after {} attempts", attempt + 1);
                self.port.discard_input()?;
                return Ok(());
            }
        }
        Err(FlockError::Handshake)
    }

    fn configure(&mut self) -> Result<(), FlockError> {
        for command in CONFIGURATION {
            self.port.write_all(command)?;
        }
        self.port.drain()?;
        Ok(())
    }

    /// Wait for the next complete frame.
    ///
    /// Synchronization is dropped first, then bytes are read and scanned
    /// until a frame is found. Each wait is short and only a few are
    /// allowed, so a silent tracker yields `Ok(false)` instead of blocking.
    pub fn read_next_record(&mut self) -> Result<bool, FlockError> {
        let timeout = Duration::from_millis(self.config.select_timeout_ms);
        let mut buf = [0u8; 128];
        let mut tries = 0;

        self.sync.unsync();
        while !self.sync.sync() {
            let readable = self.port.wait_readable(Some(timeout))?;
            if tries > self.config.max_tries {
                return Ok(false);
            }
            tries += 1;
            if !readable {
                continue;
            }

            let room = self.sync.free().min(buf.len());
            let n = read_available(&mut self.port, &mut buf[..room])?;
            self.sync.push(&buf[..n]);
        }
        Ok(true)
    }

    /// Last record decoded for `unit` (1-based).
    pub fn record(&self, unit: usize) -> Result<&BirdRecord, FlockError> {
        unit.checked_sub(1)
            .and_then(|index| self.sync.records().get(index))
            .ok_or(FlockError::InvalidUnit(unit))
    }

    /// Last record of every station.
    pub fn records(&self) -> &[BirdRecord] {
        self.sync.records()
    }

    /// Number of stations.
    pub fn unit_count(&self) -> usize {
        self.sync.records().len()
    }

    /// The synchronization ledger so far.
    pub fn stats(&self) -> &SyncStats {
        self.sync.stats()
    }

    /// Log the synchronization ledger and release the device.
    pub fn close(mut self) -> SyncStats {
        for line in self.sync.stats().to_string().lines() {
            info!("{}", line);
        }
        if let Err(e) = self.port.discard_input() {
            debug!("discarding input on close failed: {}", e);
        }
        self.sync.stats().clone()
    }
}
