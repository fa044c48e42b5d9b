//! The byte-stream device a tracker session talks through.
//!
//! Sessions only need to write bytes, read whatever has arrived, and wait
//! (with or without a timeout) for more to arrive. [Port] captures exactly
//! that, so a session runs unchanged over a serial terminal, a plain file,
//! the USB bridge or a scripted mock.

use crate::error::FlockError;
use log::{debug, warn};
use serial2::{CharSize, FlowControl, KeepSettings, Parity, SerialPort, Settings, StopBits};
use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    os::unix::{
        fs::OpenOptionsExt,
        io::{AsRawFd, RawFd},
    },
    path::Path,
    time::Duration,
};

/// Baud rate of both tracker families.
pub const BAUD_RATE: u32 = 115200;

/// A duplex byte stream to a tracker.
pub trait Port: Read + Write + Send {
    /// Wait until at least one byte can be read. `None` waits forever,
    /// `Some(Duration::ZERO)` only peeks. Returns false on timeout.
    fn wait_readable(&mut self, timeout: Option<Duration>) -> io::Result<bool>;

    /// Block until everything written has been sent.
    fn drain(&mut self) -> io::Result<()> {
        self.flush()
    }

    /// Throw away whatever has arrived but not been read.
    fn discard_input(&mut self) -> io::Result<()> {
        let mut scratch = [0u8; 256];
        while self.wait_readable(Some(Duration::ZERO))? {
            if read_available(self, &mut scratch)? == 0 {
                break;
            }
        }
        Ok(())
    }
}

/// Read what is available, treating "nothing yet" as zero bytes.
pub fn read_available<P: Port + ?Sized>(port: &mut P, buf: &mut [u8]) -> io::Result<usize> {
    match port.read(buf) {
        Ok(n) => Ok(n),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ) =>
        {
            Ok(0)
        }
        Err(e) => Err(e),
    }
}

/// `poll(2)` a descriptor for input.
fn poll_readable(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    let timeout_ms = match timeout {
        None => -1,
        Some(t) => i32::try_from(t.as_millis()).unwrap_or(i32::MAX),
    };
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        // SAFETY: `pfd` is a valid, initialised pollfd and we pass a count of one.
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret >= 0 {
            return Ok(ret > 0);
        }
        let error = io::Error::last_os_error();
        if error.kind() != io::ErrorKind::Interrupted {
            return Err(error);
        }
    }
}

/// A tracker opened by path. Terminals are switched to raw 8N1 at the bus
/// baud rate and restored when dropped; anything else (a fifo, a capture
/// file) is used as is.
pub enum Device {
    /// A serial terminal, with the settings it had before we changed them.
    Serial {
        #[allow(missing_docs)]
        port: SerialPort,
        #[allow(missing_docs)]
        saved: Settings,
    },
    /// A path that is not a terminal.
    File(File),
}

impl Device {
    /// Open `path` for reading and writing.
    pub fn open(path: impl AsRef<Path>, baud_rate: u32) -> Result<Self, FlockError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(path)
            .map_err(FlockError::Open)?;

        // SAFETY: `file` owns a valid open descriptor for the duration of the call.
        if unsafe { libc::isatty(file.as_raw_fd()) } != 1 {
            warn!("{} is not a terminal, using it as a plain file", path.display());
            return Ok(Device::File(file));
        }
        drop(file);

        let mut port = SerialPort::open(path, KeepSettings).map_err(FlockError::Open)?;
        let saved = port.get_configuration().map_err(FlockError::GetAttributes)?;

        let mut settings = saved.clone();
        settings.set_raw();
        settings
            .set_baud_rate(baud_rate)
            .map_err(FlockError::SetAttributes)?;
        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::One);
        settings.set_parity(Parity::None);
        settings.set_flow_control(FlowControl::None);
        port.set_configuration(&settings)
            .map_err(FlockError::SetAttributes)?;

        // Reads never block; sessions wait with `wait_readable` first.
        port.set_read_timeout(Duration::ZERO)
            .map_err(FlockError::SetAttributes)?;

        debug!("opened {} at {} baud", path.display(), baud_rate);
        Ok(Device::Serial { port, saved })
    }
}

impl Read for Device {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Device::Serial { port, .. } => port.read(buf),
            Device::File(file) => file.read(buf),
        }
    }
}

impl Write for Device {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Device::Serial { port, .. } => port.write(buf),
            Device::File(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Device::Serial { port, .. } => port.flush(),
            Device::File(file) => file.flush(),
        }
    }
}

impl Port for Device {
    fn wait_readable(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        match self {
            Device::Serial { port, .. } => poll_readable(port.as_raw_fd(), timeout),
            Device::File(file) => poll_readable(file.as_raw_fd(), timeout),
        }
    }

    fn discard_input(&mut self) -> io::Result<()> {
        match self {
            Device::Serial { port, .. } => port.discard_input_buffer(),
            Device::File(_) => {
                let mut scratch = [0u8; 256];
                while self.wait_readable(Some(Duration::ZERO))? {
                    if read_available(self, &mut scratch)? == 0 {
                        break;
                    }
                }
                Ok(())
            }
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Device::Serial { port, saved } = self {
            if let Err(e) = port.discard_buffers() {
                debug!("discarding serial buffers failed: {}", e);
            }
            if let Err(e) = port.set_configuration(saved) {
                warn!("failed to restore terminal settings: {}", e);
            }
        }
    }
}

#[cfg(test)]
pub mod mock {
    //! Scripted in-memory port.

    use super::*;
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    #[derive(Debug, Default)]
    struct Inner {
        incoming: VecDeque<u8>,
        written: Vec<u8>,
        replies: VecDeque<(Vec<u8>, Vec<u8>)>,
        chunk: Option<usize>,
        failing_writes: usize,
    }

    /// A port whose input is scripted by the test. Clones share state, so a
    /// test keeps one clone to inspect what the session wrote.
    #[derive(Debug, Clone, Default)]
    pub struct MockPort {
        inner: Arc<Mutex<Inner>>,
    }

    impl MockPort {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make `bytes` readable right away.
        pub fn inject(&self, bytes: &[u8]) {
            self.inner.lock().unwrap().incoming.extend(bytes);
        }

        /// Queue a reply that becomes readable once `command` is written.
        /// Replies are matched in the order they were queued.
        pub fn reply_to(&self, command: &[u8], reply: &[u8]) {
            self.inner
                .lock()
                .unwrap()
                .replies
                .push_back((command.to_vec(), reply.to_vec()));
        }

        /// Limit every read to at most `n` bytes.
        pub fn set_chunk(&self, n: usize) {
            self.inner.lock().unwrap().chunk = Some(n);
        }

        /// Fail the next `n` writes with a broken pipe.
        pub fn fail_writes(&self, n: usize) {
            self.inner.lock().unwrap().failing_writes = n;
        }

        /// Everything written so far.
        pub fn written(&self) -> Vec<u8> {
            self.inner.lock().unwrap().written.clone()
        }

        /// Bytes still waiting to be read.
        pub fn pending(&self) -> usize {
            self.inner.lock().unwrap().incoming.len()
        }
    }

    impl Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut inner = self.inner.lock().unwrap();
            if inner.incoming.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let limit = inner.chunk.unwrap_or(usize::MAX);
            let n = buf.len().min(inner.incoming.len()).min(limit);
            for (dst, src) in buf.iter_mut().zip(inner.incoming.drain(..n)) {
                *dst = src;
            }
            Ok(n)
        }
    }

    impl Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut inner = self.inner.lock().unwrap();
            if inner.failing_writes > 0 {
                inner.failing_writes -= 1;
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            inner.written.extend_from_slice(buf);
            let matched = matches!(inner.replies.front(), Some((command, _)) if command == buf);
            if matched {
                if let Some((_, reply)) = inner.replies.pop_front() {
                    inner.incoming.extend(reply);
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Port for MockPort {
        fn wait_readable(&mut self, _timeout: Option<Duration>) -> io::Result<bool> {
            Ok(!self.inner.lock().unwrap().incoming.is_empty())
        }
    }
}
