//! Bridge between a USB-attached tracker and the byte-stream [Port] a stream
//! session reads.
//!
//! Two pump threads share the USB handle behind a mutex: one moves bulk IN
//! transfers into a bounded channel, the other writes whatever the session
//! sends to the bulk OUT endpoint. Shutdown clears a shared running flag,
//! closes the outbound channel and joins both threads.

use crate::{error::FlockError, port::Port};
use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError,
};
use log::{debug, info, trace, warn};
use rusb::{DeviceHandle, GlobalContext};
use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// Vendor id of the tracker.
pub const VENDOR_ID: u16 = 0x0f44;
/// Product id of a tracker whose firmware has been loaded.
pub const CONFIGURED_PRODUCT_ID: u16 = 0xff20;
/// Bulk OUT endpoint.
pub const WRITE_ENDPOINT: u8 = 0x04;
/// Bulk IN endpoint.
pub const READ_ENDPOINT: u8 = 0x88;

const INTERFACE: u8 = 0;
const USB_TIMEOUT: Duration = Duration::from_millis(100);
const PUMP_TIMEOUT: Duration = Duration::from_millis(100);
const CHANNEL_DEPTH: usize = 64;
const TRANSFER_SIZE: usize = 512;

/// A device with one bulk endpoint in each direction.
pub trait BulkDevice: Send + 'static {
    /// Read one bulk transfer. A timeout is reported as
    /// [io::ErrorKind::TimedOut].
    fn read_bulk(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Write one bulk transfer.
    fn write_bulk(&mut self, buf: &[u8], timeout: Duration) -> io::Result<usize>;
}

fn usb_to_io(error: rusb::Error) -> io::Error {
    match error {
        rusb::Error::Timeout => io::ErrorKind::TimedOut.into(),
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

/// The tracker, opened through libusb.
pub struct UsbTracker {
    handle: DeviceHandle<GlobalContext>,
    write_endpoint: u8,
    read_endpoint: u8,
}

impl UsbTracker {
    /// Open the first device matching `vendor_id:product_id` and claim its
    /// interface.
    pub fn connect(
        vendor_id: u16,
        product_id: u16,
        write_endpoint: u8,
        read_endpoint: u8,
    ) -> Result<Self, FlockError> {
        let mut handle = rusb::open_device_with_vid_pid(vendor_id, product_id).ok_or(
            FlockError::DeviceNotFound {
                vendor_id,
                product_id,
            },
        )?;

        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            if handle.kernel_driver_active(INTERFACE).unwrap_or(false) {
                handle.detach_kernel_driver(INTERFACE)?;
            }
        }
        handle.claim_interface(INTERFACE)?;

        for endpoint in [read_endpoint, write_endpoint] {
            if let Err(e) = handle.clear_halt(endpoint) {
                trace!("clear halt on endpoint {:02x} failed: {}", endpoint, e);
            }
        }

        info!("connected to usb tracker {:04x}:{:04x}", vendor_id, product_id);
        Ok(UsbTracker {
            handle,
            write_endpoint,
            read_endpoint,
        })
    }
}

impl BulkDevice for UsbTracker {
    fn read_bulk(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.handle
            .read_bulk(self.read_endpoint, buf, timeout)
            .map_err(usb_to_io)
    }

    fn write_bulk(&mut self, buf: &[u8], timeout: Duration) -> io::Result<usize> {
        self.handle
            .write_bulk(self.write_endpoint, buf, timeout)
            .map_err(usb_to_io)
    }
}

impl Drop for UsbTracker {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(INTERFACE) {
            debug!("releasing usb interface failed: {}", e);
        }
    }
}

/// Pumps bytes between a [BulkDevice] and the owning session.
pub struct UsbBridge {
    inbound: Receiver<Vec<u8>>,
    outbound: Option<Sender<Vec<u8>>>,
    leftover: VecDeque<u8>,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<u64>>,
    writer: Option<JoinHandle<u64>>,
}

fn read_pump<D: BulkDevice>(
    device: Arc<Mutex<D>>,
    tx: Sender<Vec<u8>>,
    running: Arc<AtomicBool>,
) -> u64 {
    let mut total = 0;
    let mut buf = [0u8; TRANSFER_SIZE];

    'pump: while running.load(Ordering::Acquire) {
        let result = device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .read_bulk(&mut buf, USB_TIMEOUT);

        let n = match result {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => {
                warn!("usb read failed: {}", e);
                thread::sleep(USB_TIMEOUT);
                continue;
            }
        };

        let mut chunk = buf[..n].to_vec();
        loop {
            match tx.send_timeout(chunk, PUMP_TIMEOUT) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(back)) => {
                    if !running.load(Ordering::Acquire) {
                        break 'pump;
                    }
                    chunk = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => break 'pump,
            }
        }
        total += n as u64;
    }

    total
}

fn write_pump<D: BulkDevice>(
    device: Arc<Mutex<D>>,
    rx: Receiver<Vec<u8>>,
    running: Arc<AtomicBool>,
) -> u64 {
    let mut total = 0;

    while running.load(Ordering::Acquire) {
        let data = match rx.recv_timeout(PUMP_TIMEOUT) {
            Ok(data) => data,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let mut sent = 0;
        while sent < data.len() {
            let result = device
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .write_bulk(&data[sent..], USB_TIMEOUT);
            match result {
                Ok(n) => sent += n,
                Err(e) => {
                    warn!("usb write failed, dropping {} bytes: {}", data.len() - sent, e);
                    break;
                }
            }
        }
        total += sent as u64;
    }

    total
}

impl UsbBridge {
    /// Start both pumps over `device`.
    pub fn start<D: BulkDevice>(device: D) -> Self {
        let device = Arc::new(Mutex::new(device));
        let running = Arc::new(AtomicBool::new(true));
        let (in_tx, in_rx) = bounded(CHANNEL_DEPTH);
        let (out_tx, out_rx) = bounded(CHANNEL_DEPTH);

        let reader = {
            let device = Arc::clone(&device);
            let running = Arc::clone(&running);
            thread::spawn(move || read_pump(device, in_tx, running))
        };
        let writer = {
            let running = Arc::clone(&running);
            thread::spawn(move || write_pump(device, out_rx, running))
        };

        UsbBridge {
            inbound: in_rx,
            outbound: Some(out_tx),
            leftover: VecDeque::new(),
            running,
            reader: Some(reader),
            writer: Some(writer),
        }
    }

    /// Connect to the tracker over USB and start pumping.
    pub fn connect(
        vendor_id: u16,
        product_id: u16,
        write_endpoint: u8,
        read_endpoint: u8,
    ) -> Result<Self, FlockError> {
        let tracker = UsbTracker::connect(vendor_id, product_id, write_endpoint, read_endpoint)?;
        Ok(UsbBridge::start(tracker))
    }

    /// Whether the pumps are still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop both pumps and wait for them. Calling it again does nothing.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        self.outbound.take();

        if let Some(writer) = self.writer.take() {
            match writer.join() {
                Ok(total) => info!("usb write pump ended, {} bytes written", total),
                Err(_) => warn!("usb write pump panicked"),
            }
        }
        if let Some(reader) = self.reader.take() {
            match reader.join() {
                Ok(total) => info!("usb read pump ended, {} bytes read", total),
                Err(_) => warn!("usb read pump panicked"),
            }
        }
    }
}

impl Read for UsbBridge {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.leftover.is_empty() {
            match self.inbound.try_recv() {
                Ok(chunk) => self.leftover.extend(chunk),
                Err(TryRecvError::Empty) => return Err(io::ErrorKind::WouldBlock.into()),
                Err(TryRecvError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.leftover.len());
        for (dst, src) in buf.iter_mut().zip(self.leftover.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for UsbBridge {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(outbound) = &self.outbound else {
            return Err(io::ErrorKind::BrokenPipe.into());
        };
        outbound
            .send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for UsbBridge {
    fn wait_readable(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        if !self.leftover.is_empty() {
            return Ok(true);
        }
        let received = match timeout {
            None => self.inbound.recv().ok(),
            Some(t) if t.is_zero() => self.inbound.try_recv().ok(),
            Some(t) => self.inbound.recv_timeout(t).ok(),
        };
        match received {
            Some(chunk) => {
                self.leftover.extend(chunk);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Drop for UsbBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Default)]
    struct Wire {
        to_host: VecDeque<u8>,
        from_host: Vec<u8>,
    }

    /// A bulk device backed by shared queues.
    #[derive(Clone, Default)]
    pub(crate) struct LoopbackDevice {
        wire: Arc<Mutex<Wire>>,
    }

    impl LoopbackDevice {
        pub(crate) fn send_to_host(&self, bytes: &[u8]) {
            self.wire.lock().unwrap().to_host.extend(bytes);
        }

        pub(crate) fn received(&self) -> Vec<u8> {
            self.wire.lock().unwrap().from_host.clone()
        }
    }

    impl BulkDevice for LoopbackDevice {
        fn read_bulk(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
            let n = {
                let mut wire = self.wire.lock().unwrap();
                let n = buf.len().min(wire.to_host.len()).min(64);
                for (dst, src) in buf.iter_mut().zip(wire.to_host.drain(..n)) {
                    *dst = src;
                }
                n
            };
            if n == 0 {
                thread::sleep(timeout.min(Duration::from_millis(1)));
                return Err(io::ErrorKind::TimedOut.into());
            }
            Ok(n)
        }

        fn write_bulk(&mut self, buf: &[u8], _timeout: Duration) -> io::Result<usize> {
            self.wire.lock().unwrap().from_host.extend_from_slice(buf);
            Ok(buf.len())
        }
    }

    fn read_exactly(bridge: &mut UsbBridge, n: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 32];
        while out.len() < n {
            assert!(bridge.wait_readable(Some(Duration::from_secs(2))).unwrap());
            let got = bridge.read(&mut buf).unwrap();
            out.extend_from_slice(&buf[..got]);
        }
        out
    }

    /// Bytes flow both ways through the pumps, in order
    #[test]
    fn bridge_moves_bytes_both_ways() {
        let device = LoopbackDevice::default();
        let mut bridge = UsbBridge::start(device.clone());

        let payload: Vec<u8> = (0..=255).collect();
        device.send_to_host(&payload);
        assert_eq!(read_exactly(&mut bridge, payload.len()), payload);

        bridge.write_all(b"F1\r").unwrap();
        bridge.write_all(b"C\r").unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while device.received().len() < 5 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(device.received(), b"F1\rC\r".to_vec());

        bridge.shutdown();
        assert!(!bridge.is_running());
    }

    #[test]
    fn idle_bridge_times_out() {
        let mut bridge = UsbBridge::start(LoopbackDevice::default());
        assert!(!bridge.wait_readable(Some(Duration::from_millis(5))).unwrap());
        assert!(!bridge.wait_readable(Some(Duration::ZERO)).unwrap());
        let mut buf = [0u8; 4];
        assert_eq!(
            bridge.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    /// Writes after shutdown fail instead of hanging
    #[test]
    fn write_after_shutdown_fails() {
        let mut bridge = UsbBridge::start(LoopbackDevice::default());
        bridge.shutdown();
        bridge.shutdown();
        assert_eq!(
            bridge.write(b"x").unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }
}
