//! Map transfer engine: one resumable byte-stream copy of the map per peer and direction.
//!
//! Both sides are driven by readiness. Each call moves as many bytes as the stream
//! accepts without blocking and remembers the cursor, so a transfer can be resumed
//! across any number of poll cycles. `WouldBlock` ends a step, `Interrupted` is retried,
//! anything else fails the transfer for good (no retry).

use std::io::{self, Read, Write};

use crate::protocol::PeerId;

/// Largest map a receiver will allocate for. The size field comes off the wire.
pub const MAX_MAP_SIZE: usize = 64 * 1024 * 1024;

/// Which end of a map stream this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Sender,
    Receiver,
}

/// Synthesized exactly once per transfer when the last byte moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub peer: PeerId,
    pub role: Role,
}

/// Result of one readiness step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub moved: usize,
    pub completion: Option<Completion>,
}

impl Progress {
    fn idle() -> Self {
        Progress::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Idle,
    Sending,
    Done,
    Failed,
}

/// Source side: streams the shared map to one peer.
#[derive(Debug)]
pub struct MapSender {
    peer: PeerId,
    cursor: usize,
    state: SendState,
}

impl MapSender {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            cursor: 0,
            state: SendState::Idle,
        }
    }

    pub fn start(&mut self) -> Result<(), TransferError> {
        if self.state != SendState::Idle {
            return Err(TransferError::AlreadyStarted(self.peer));
        }
        self.state = SendState::Sending;
        Ok(())
    }

    /// Write as much of `map` as `out` accepts. `map` must be the same buffer on every call.
    /// The stream is left open when the transfer completes.
    pub fn on_writable<W: Write + ?Sized>(
        &mut self,
        out: &mut W,
        map: &[u8],
    ) -> Result<Progress, TransferError> {
        if self.state != SendState::Sending {
            return Ok(Progress::idle());
        }
        let mut moved = 0;
        while self.cursor < map.len() {
            match out.write(&map[self.cursor..]) {
                Ok(0) => {
                    return Err(self.fail(io::Error::from(io::ErrorKind::WriteZero)));
                }
                Ok(n) => {
                    self.cursor += n;
                    moved += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.fail(e)),
            }
        }
        let completion = if self.cursor >= map.len() {
            self.state = SendState::Done;
            Some(Completion {
                peer: self.peer,
                role: Role::Sender,
            })
        } else {
            None
        };
        Ok(Progress { moved, completion })
    }

    /// The stream reported an error outside a write, e.g. while waiting for readiness.
    pub fn on_stream_error(&mut self, source: io::Error) -> TransferError {
        self.fail(source)
    }

    fn fail(&mut self, source: io::Error) -> TransferError {
        self.state = SendState::Failed;
        TransferError::Io {
            peer: self.peer,
            source,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn state(&self) -> SendState {
        self.state
    }

    /// True while the stream still wants write readiness.
    pub fn is_active(&self) -> bool {
        self.state == SendState::Sending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    Idle,
    Connecting,
    Receiving,
    Done,
    Failed,
}

/// Receiving side: fills a buffer of exactly the advertised map size.
#[derive(Debug)]
pub struct MapReceiver {
    peer: PeerId,
    buf: Vec<u8>,
    expected: usize,
    cursor: usize,
    state: ReceiveState,
    handed_over: bool,
}

impl MapReceiver {
    /// `expected` comes from the source's Ack. The buffer is allocated up front, so
    /// anything above [`MAX_MAP_SIZE`] is refused.
    pub fn new(peer: PeerId, expected: usize) -> Result<Self, TransferError> {
        if expected > MAX_MAP_SIZE {
            return Err(TransferError::TooLarge {
                peer,
                size: expected,
            });
        }
        Ok(Self {
            peer,
            buf: vec![0; expected],
            expected,
            cursor: 0,
            state: ReceiveState::Idle,
            handed_over: false,
        })
    }

    pub fn begin_connect(&mut self) -> Result<(), TransferError> {
        if self.state != ReceiveState::Idle {
            return Err(TransferError::AlreadyStarted(self.peer));
        }
        self.state = ReceiveState::Connecting;
        Ok(())
    }

    pub fn on_connected(&mut self) {
        if self.state == ReceiveState::Connecting {
            self.state = ReceiveState::Receiving;
        }
    }

    /// The outbound connection could not be established.
    pub fn on_connect_failed(&mut self, source: io::Error) -> TransferError {
        self.fail(source)
    }

    pub fn on_stream_error(&mut self, source: io::Error) -> TransferError {
        self.fail(source)
    }

    /// Drain whatever `input` has without blocking.
    pub fn on_readable<R: Read + ?Sized>(&mut self, input: &mut R) -> Result<Progress, TransferError> {
        match self.state {
            ReceiveState::Connecting => self.state = ReceiveState::Receiving,
            ReceiveState::Receiving => {}
            _ => return Ok(Progress::idle()),
        }
        let mut moved = 0;
        while self.cursor < self.expected {
            match input.read(&mut self.buf[self.cursor..]) {
                Ok(0) => {
                    self.state = ReceiveState::Failed;
                    return Err(TransferError::Closed {
                        peer: self.peer,
                        received: self.cursor,
                        expected: self.expected,
                    });
                }
                Ok(n) => {
                    self.cursor += n;
                    moved += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.fail(e)),
            }
        }
        let completion = if self.cursor >= self.expected {
            self.state = ReceiveState::Done;
            Some(Completion {
                peer: self.peer,
                role: Role::Receiver,
            })
        } else {
            None
        };
        Ok(Progress { moved, completion })
    }

    fn fail(&mut self, source: io::Error) -> TransferError {
        self.state = ReceiveState::Failed;
        TransferError::Io {
            peer: self.peer,
            source,
        }
    }

    /// Hand the completed map over. Returns `None` before completion and after the first call.
    pub fn take_buffer(&mut self) -> Option<Vec<u8>> {
        if self.state != ReceiveState::Done || self.handed_over {
            return None;
        }
        self.handed_over = true;
        Some(std::mem::take(&mut self.buf))
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn received(&self) -> usize {
        self.cursor
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn state(&self) -> ReceiveState {
        self.state
    }

    /// True while the stream still wants read readiness.
    pub fn is_active(&self) -> bool {
        matches!(self.state, ReceiveState::Connecting | ReceiveState::Receiving)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("map stream with {peer} failed: {source}")]
    Io {
        peer: PeerId,
        #[source]
        source: io::Error,
    },
    #[error("{peer} closed the map stream after {received} of {expected} bytes")]
    Closed {
        peer: PeerId,
        received: usize,
        expected: usize,
    },
    #[error("map transfer with {0} already started")]
    AlreadyStarted(PeerId),
    #[error("{peer} advertised a {size}-byte map, more than {MAX_MAP_SIZE} allowed")]
    TooLarge { peer: PeerId, size: usize },
}

impl TransferError {
    pub fn peer(&self) -> PeerId {
        match self {
            TransferError::Io { peer, .. }
            | TransferError::Closed { peer, .. }
            | TransferError::TooLarge { peer, .. } => *peer,
            TransferError::AlreadyStarted(peer) => *peer,
        }
    }
}
