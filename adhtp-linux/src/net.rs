//! `Network`: what the game loop talks to. Owns the session and the dispatcher and
//! feeds one into the other.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use adhtp_core::{
    Action, Event, Message, Motion, PeerDirectory, PeerId, Phase, Role, Session, MAX_MAP_SIZE,
};

use crate::config::{ConfigError, NetConfig};
use crate::dispatcher::{DispatchError, DispatchEvent, Dispatcher};
use crate::transport::{self, TransportError};

/// What `broadcast` sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastKind {
    /// Discovery. Position and velocity are not sent.
    Hello,
    Coord,
}

pub struct Network {
    session: Session,
    dispatcher: Dispatcher,
    poll_timeout: Duration,
}

impl Network {
    /// Validate `config`, open the sockets and start discovering. Must run inside a tokio runtime.
    /// `local_map` is what this process serves if it turns out to be the map source.
    pub fn start(config: &NetConfig, local_map: Option<Vec<u8>>) -> Result<Self, NetError> {
        let ep = config.endpoints()?;
        let map_len = match &local_map {
            Some(m) if m.len() > MAX_MAP_SIZE => return Err(NetError::MapTooLarge(m.len())),
            Some(m) => Some(u32::try_from(m.len()).map_err(|_| NetError::MapTooLarge(m.len()))?),
            None => None,
        };
        let transport = transport::setup(&ep)?;
        log::info!(
            "player {} up, {}",
            ep.local,
            map_len.map_or("no local map".to_string(), |n| format!("{n}-byte local map"))
        );
        let map: Arc<[u8]> = Arc::from(local_map.unwrap_or_default());
        Ok(Self {
            session: Session::new(ep.local, map_len),
            dispatcher: Dispatcher::new(ep.local, transport, map),
            poll_timeout: ep.poll_timeout,
        })
    }

    /// One dispatcher cycle. Returns the game events it produced. Does nothing once Ending.
    /// Only a failed readiness wait is an error; per-peer failures come back as events.
    pub async fn poll(&mut self) -> Result<Vec<Event>, NetError> {
        let mut out = Vec::new();
        if self.session.phase() == Phase::Ending {
            return Ok(out);
        }
        for ev in self.dispatcher.poll_once(self.poll_timeout).await? {
            let actions = match ev {
                DispatchEvent::Packet(pkt) => self.session.on_packet(&pkt),
                DispatchEvent::TransferDone { peer, role, map } => {
                    self.session.on_transfer_done(peer, role, map)
                }
                DispatchEvent::TransferFailed { peer, role } => {
                    self.session.on_transfer_failed(peer, role)
                }
            };
            self.execute(actions, &mut out);
        }
        Ok(out)
    }

    fn execute(&mut self, actions: Vec<Action>, out: &mut Vec<Event>) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Send(pkt) => {
                    if let Err(e) = self.dispatcher.send(&pkt) {
                        log::warn!("{e}");
                    }
                }
                Action::Listen => {
                    if let Err(e) = self.dispatcher.listen() {
                        log::warn!("{e}");
                        queue.extend(self.session.on_listen_failed());
                    }
                }
                Action::Fetch { from, size } => {
                    if let Err(e) = self.dispatcher.fetch(from, size) {
                        log::warn!("{e}");
                        queue.extend(self.session.on_transfer_failed(from, Role::Receiver));
                    }
                }
                Action::Notify(ev) => {
                    match &ev {
                        Event::PhaseChanged(p) => log::info!("{} now {p}", self.session.local()),
                        Event::PeerJoined(id) => log::info!("{id} joined"),
                        Event::MapReceived { from, len } => {
                            log::info!("received {len}-byte map from {from}")
                        }
                        Event::TransferFailed { peer, role } => {
                            log::warn!("map transfer with {peer} failed ({role:?}), not retrying")
                        }
                        Event::ListenFailed => log::warn!("not serving the map"),
                        Event::Position { .. } => {}
                    }
                    out.push(ev);
                }
            }
        }
    }

    /// Broadcast a Hello or this player's position and velocity.
    pub fn broadcast(
        &mut self,
        kind: BroadcastKind,
        position: (i32, i32),
        velocity: (i32, i32),
    ) -> Result<(), NetError> {
        let message = match kind {
            BroadcastKind::Hello => Message::Hello,
            BroadcastKind::Coord => Message::Coord(Motion::new(position, velocity)),
        };
        let pkt = self.session.packet(None, message);
        self.dispatcher.send(&pkt)?;
        Ok(())
    }

    pub fn is_phase_at_least(&self, phase: Phase) -> bool {
        self.session.is_phase_at_least(phase)
    }

    /// True while the game loop should keep broadcasting Hello.
    pub fn needs_hello(&self) -> bool {
        self.session.needs_hello()
    }

    pub fn phase(&self) -> Phase {
        self.session.phase()
    }

    pub fn local(&self) -> PeerId {
        self.session.local()
    }

    /// The map received from the source, once its transfer completed.
    pub fn completed_map_buffer(&self) -> Option<&[u8]> {
        self.session.completed_map()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn directory(&self) -> &PeerDirectory {
        self.dispatcher.directory()
    }

    pub fn failed_transfers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.session.failed_transfers()
    }

    /// Local quit. Polling stops producing events afterwards.
    pub fn end(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        let actions = self.session.end();
        // Ending only ever notifies.
        for a in actions {
            if let Action::Notify(ev) = a {
                out.push(ev);
            }
        }
        log::info!("{} ending", self.session.local());
        out
    }

    /// Close every socket. Consumes the network, so it happens once.
    pub fn destroy(self) {
        self.dispatcher.destroy();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("local map of {0} bytes does not fit the size field")]
    MapTooLarge(usize),
}
