/// One-shot result channel between the child and the orchestrator
///
/// A frame is a little-endian `u32` length followed by that many bytes of JSON.
/// The child writes exactly one frame and closes its end; the parent polls
/// without blocking and treats end-of-file without a frame as "no reply".
use crate::types::{Failure, Result, SandboxError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

const READ_CHUNK: usize = 64 * 1024;

/// What the child sends back
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Reply<T> {
    Success(T),
    Failure(Failure),
    /// The child could not describe its outcome
    Empty,
}

/// `io::Write` sink that reports allocation failure instead of aborting
struct FallibleBuf(Vec<u8>);

impl io::Write for FallibleBuf {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0
            .try_reserve(data.len())
            .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e))?;
        self.0.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Serialize `value` into a complete frame
pub fn encode_frame<T: Serialize + ?Sized>(value: &T) -> io::Result<Vec<u8>> {
    let mut buf = FallibleBuf(Vec::new());
    io::Write::write_all(&mut buf, &[0u8; 4])?;
    serde_json::to_writer(&mut buf, value).map_err(io::Error::from)?;
    let payload_len = u32::try_from(buf.0.len() - 4)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame larger than 4 GiB"))?;
    buf.0[..4].copy_from_slice(&payload_len.to_le_bytes());
    Ok(buf.0)
}

/// Blocking read of one frame payload; `None` on a clean end-of-file
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut payload = Vec::new();
    payload
        .try_reserve_exact(len)
        .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e))?;
    payload.resize(len, 0);
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

pub fn decode_reply<T: DeserializeOwned>(payload: &[u8]) -> Result<Reply<T>> {
    serde_json::from_slice(payload)
        .map_err(|e| SandboxError::Process(format!("Failed to deserialize reply: {}", e)))
}

/// Create the channel; both ends are close-on-exec
pub fn channel() -> Result<(ChannelReader, ChannelWriter)> {
    let (read_fd, write_fd) = nix::unistd::pipe()
        .map_err(|e| SandboxError::Process(format!("Failed to create pipe: {}", e)))?;
    set_cloexec(read_fd)?;
    set_cloexec(write_fd)?;
    set_nonblocking(read_fd)?;

    Ok((
        ChannelReader {
            fd: Some(read_fd),
            buf: Vec::new(),
            eof: false,
        },
        ChannelWriter { fd: Some(write_fd) },
    ))
}

pub(crate) fn set_cloexec(fd: RawFd) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    let flags = fcntl(fd, FcntlArg::F_GETFD)
        .map_err(|e| SandboxError::Process(format!("Failed to get fd flags: {}", e)))?;
    fcntl(
        fd,
        FcntlArg::F_SETFD(FdFlag::from_bits_truncate(flags) | FdFlag::FD_CLOEXEC),
    )
    .map_err(|e| SandboxError::Process(format!("Failed to set close-on-exec: {}", e)))?;
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = fcntl(fd, FcntlArg::F_GETFL)
        .map_err(|e| SandboxError::Process(format!("Failed to get flags: {}", e)))?;
    fcntl(
        fd,
        FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
    )
    .map_err(|e| SandboxError::Process(format!("Failed to set non-blocking: {}", e)))?;
    Ok(())
}

/// State of the parent's end after a poll
#[derive(Debug, PartialEq, Eq)]
pub enum Poll {
    /// Nothing complete yet, writer still open
    Pending,
    /// A complete frame payload
    Frame(Vec<u8>),
    /// Writer closed without a complete frame
    Closed { partial: bool },
}

/// Parent side of the channel
pub struct ChannelReader {
    fd: Option<RawFd>,
    buf: Vec<u8>,
    eof: bool,
}

impl ChannelReader {
    /// Read whatever is available without blocking
    pub fn poll(&mut self) -> Result<Poll> {
        if let Some(payload) = self.take_frame() {
            return Ok(Poll::Frame(payload));
        }
        let fd = self
            .fd
            .ok_or_else(|| SandboxError::Process("No read file descriptor".to_string()))?;

        let mut chunk = [0u8; READ_CHUNK];
        while !self.eof {
            match nix::unistd::read(fd, &mut chunk) {
                Ok(0) => self.eof = true,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    return Err(SandboxError::Process(format!(
                        "Failed to read from channel: {}",
                        e
                    )))
                }
            }
        }

        if let Some(payload) = self.take_frame() {
            return Ok(Poll::Frame(payload));
        }
        if self.eof {
            return Ok(Poll::Closed {
                partial: !self.buf.is_empty(),
            });
        }
        Ok(Poll::Pending)
    }

    /// Poll until a frame arrives, the writer closes, or `timeout` passes
    pub fn drain(&mut self, timeout: Duration, interval: Duration) -> Result<Poll> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.poll()? {
                Poll::Pending if Instant::now() < deadline => std::thread::sleep(interval),
                state => return Ok(state),
            }
        }
    }

    fn take_frame(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < 4 {
            return None;
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if self.buf.len() < 4 + len {
            return None;
        }
        let payload = self.buf[4..4 + len].to_vec();
        self.buf.drain(..4 + len);
        Some(payload)
    }

    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.fd
    }

    pub fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            let _ = nix::unistd::close(fd);
        }
    }
}

impl Drop for ChannelReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Child side of the channel
pub struct ChannelWriter {
    fd: Option<RawFd>,
}

impl ChannelWriter {
    /// Take ownership of an inherited descriptor
    pub fn from_raw_fd(fd: RawFd) -> Self {
        Self { fd: Some(fd) }
    }

    pub fn send<T: Serialize>(&mut self, reply: &Reply<T>) -> Result<()> {
        let frame = encode_frame(reply)?;
        self.send_frame(&frame)
    }

    /// Write an already encoded frame
    pub fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let fd = self
            .fd
            .ok_or_else(|| SandboxError::Process("No write file descriptor".to_string()))?;
        // From here on the frame is ours; signal handlers must not interleave
        emergency::disarm(fd);

        let mut written = 0;
        while written < frame.len() {
            match nix::unistd::write(fd, &frame[written..]) {
                Ok(n) => written += n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    return Err(SandboxError::Process(format!(
                        "Failed to write reply: {}",
                        e
                    )))
                }
            }
        }
        Ok(())
    }

    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.fd
    }

    pub fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            emergency::disarm(fd);
            let _ = nix::unistd::close(fd);
        }
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Frames encoded before limits apply, written from signal handlers
pub mod emergency {
    use super::{encode_frame, Reply};
    use crate::types::{Failure, FailureKind};
    use std::os::unix::io::RawFd;
    use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicUsize, Ordering};

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Slot {
        CpuTime = 0,
        Memory = 1,
        Signal = 2,
        Empty = 3,
    }

    const SLOTS: usize = 4;

    static FD: AtomicI32 = AtomicI32::new(-1);
    static FRAMES: [AtomicPtr<u8>; SLOTS] = [
        AtomicPtr::new(std::ptr::null_mut()),
        AtomicPtr::new(std::ptr::null_mut()),
        AtomicPtr::new(std::ptr::null_mut()),
        AtomicPtr::new(std::ptr::null_mut()),
    ];
    static LENS: [AtomicUsize; SLOTS] = [
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
    ];

    /// Encode every slot and point the handlers at `fd`
    pub fn arm(fd: RawFd) -> std::io::Result<()> {
        let frames = [
            (
                Slot::CpuTime,
                encode_frame(&Reply::<()>::Failure(Failure::new(
                    FailureKind::CpuTimeExceeded,
                    "CPU time limit reached",
                )))?,
            ),
            (
                Slot::Memory,
                encode_frame(&Reply::<()>::Failure(Failure::new(
                    FailureKind::MemoryLimitExceeded,
                    "Memory limit reached",
                )))?,
            ),
            (
                Slot::Signal,
                encode_frame(&Reply::<()>::Failure(Failure::new(
                    FailureKind::SignalReceived(libc::SIGTERM),
                    "Terminated by SIGTERM",
                )))?,
            ),
            (Slot::Empty, encode_frame(&Reply::<()>::Empty)?),
        ];
        for (slot, frame) in frames {
            // Leaked on purpose: handlers may read them until the process exits
            let frame: &'static mut [u8] = Box::leak(frame.into_boxed_slice());
            LENS[slot as usize].store(frame.len(), Ordering::SeqCst);
            FRAMES[slot as usize].store(frame.as_mut_ptr(), Ordering::SeqCst);
        }
        FD.store(fd, Ordering::SeqCst);
        Ok(())
    }

    /// Stop handlers from writing to `fd`
    pub fn disarm(fd: RawFd) {
        let _ = FD.compare_exchange(fd, -1, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn is_armed() -> bool {
        FD.load(Ordering::SeqCst) >= 0
    }

    /// Pre-encoded bytes of `slot`, if armed
    pub fn frame(slot: Slot) -> Option<&'static [u8]> {
        let ptr = FRAMES[slot as usize].load(Ordering::SeqCst);
        if ptr.is_null() {
            return None;
        }
        let len = LENS[slot as usize].load(Ordering::SeqCst);
        Some(unsafe { std::slice::from_raw_parts(ptr, len) })
    }

    /// Write `slot` and close the channel. Async-signal-safe.
    pub fn send(slot: Slot) -> bool {
        let fd = FD.swap(-1, Ordering::SeqCst);
        if fd < 0 {
            return false;
        }
        let ptr = FRAMES[slot as usize].load(Ordering::SeqCst);
        let len = LENS[slot as usize].load(Ordering::SeqCst);
        let mut written = 0usize;
        let mut ok = !ptr.is_null();
        while ok && written < len {
            let rc = unsafe { libc::write(fd, ptr.add(written) as *const libc::c_void, len - written) };
            if rc > 0 {
                written += rc as usize;
            } else if rc < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            } else {
                ok = false;
            }
        }
        unsafe {
            libc::close(fd);
        }
        ok
    }
}
