//! Runs a single camera: discovery, the two step login, and the video loop that turns received
//!  messages into [CameraEvent]s. [Camera::run] reconnects from scratch after every failure until
//!  the camera is stopped.

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use tokio::select;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::config::SessionConfig;
use crate::control::messages::{LogicalMessage, MSG_ID_BATTERY_INFO, MSG_ID_LOGIN, MSG_ID_PING, MSG_ID_VIDEO, MSG_ID_VIDEO_INPUT};
use crate::control::session::ControlSession;
use crate::error::{BaichuanError, ErrorKind};
use crate::media::demuxer::FrameDemuxer;
use crate::transport::{Transport, TransportFactory};
use crate::util::random::{Random, RngRandom};


const MAX_CLIENT_ID: u32 = i32::MAX as u32;
const MAX_TID: u32 = 4000;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CameraEvent {
    /// elementary stream bytes extracted from one received message, possibly empty
    Stream(Bytes),
    Battery(u8),
    Pong,
    Unhandled { message_id: u32 },
}

/// Asks a running [Camera] to stop. The camera notices between two messages.
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<watch::Sender<bool>>,
}
impl StopHandle {
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }
}

type Session = ControlSession<Transport>;

pub struct Camera<R: Random> {
    name: String,
    config: Arc<SessionConfig>,
    events: broadcast::Sender<CameraEvent>,
    stop: watch::Receiver<bool>,
    pd: PhantomData<R>,
}

impl Camera<RngRandom> {
    pub fn new(name: &str, config: Arc<SessionConfig>, events: broadcast::Sender<CameraEvent>) -> (Camera<RngRandom>, StopHandle) {
        Self::new_with_random(name, config, events)
    }
}

impl <R: Random> Camera<R> {
    pub fn new_with_random(name: &str, config: Arc<SessionConfig>, events: broadcast::Sender<CameraEvent>) -> (Camera<R>, StopHandle) {
        let (stop_sender, stop) = watch::channel(false);
        let camera = Camera {
            name: name.to_string(),
            config,
            events,
            stop,
            pd: PhantomData::default(),
        };
        (camera, StopHandle { stop: Arc::new(stop_sender) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs sessions until the camera is stopped, reconnecting after failures. Returns an error
    ///  only if retrying cannot help.
    pub async fn run(&mut self, factory: &dyn TransportFactory) -> Result<(), BaichuanError> {
        self.config.validate()
            .map_err(|e| BaichuanError::InvalidConfig(e.to_string()))?;

        loop {
            let Err(e) = self.run_once(factory).await else {
                return Ok(());
            };

            let backoff = match e.kind() {
                ErrorKind::Stopped => {
                    info!("camera {} stopped", self.name);
                    return Ok(());
                }
                ErrorKind::Fatal => {
                    error!("camera {} failed: {}", self.name, e);
                    return Err(e);
                }
                ErrorKind::Transient | ErrorKind::Integrity => self.config.transient_backoff,
                ErrorKind::Protocol | ErrorKind::Discovery => self.config.reconnect_backoff,
            };

            warn!("camera {}: {} - reconnecting in {:?}", self.name, e, backoff);
            select! {
                _ = sleep(backoff) => {}
                _ = stop_requested(&mut self.stop) => {}
            }

            if *self.stop.borrow() {
                info!("camera {} stopped", self.name);
                return Ok(());
            }
        }
    }

    /// A single session from discovery to the first failure. Never returns `Ok` unless stopped
    ///  before anything happened.
    pub async fn run_once(&mut self, factory: &dyn TransportFactory) -> Result<(), BaichuanError> {
        self.check_stopped()?;

        let client_id = R::gen_u32_range(0..=MAX_CLIENT_ID);
        let tid = R::gen_u32_range(0..=MAX_TID);
        debug!("starting session with client id {}, tid {}", client_id, tid);

        let mut transport = factory.open(self.config.clone(), client_id, tid).await?;
        transport.discover().await?;
        self.check_stopped()?;

        let mut session = ControlSession::new(transport, &self.config.username, &self.config.password);

        info!("sending legacy login");
        session.send_legacy_login().await?;
        let nonce = self.receive_nonce(&mut session).await?;
        info!("received nonce {}", nonce);

        session.send_modern_login(&nonce).await?;
        self.receive_until(&mut session, MSG_ID_VIDEO_INPUT).await?;

        info!("logged in, starting {}", self.config.stream.as_str());
        session.start_video(self.config.stream).await?;
        session.transport_mut().set_receive_timeout(self.config.video_receive_timeout);

        self.video_loop(&mut session).await
    }

    fn check_stopped(&self) -> Result<(), BaichuanError> {
        if *self.stop.borrow() {
            return Err(BaichuanError::Stopped);
        }
        Ok(())
    }

    async fn receive_nonce(&self, session: &mut Session) -> Result<String, BaichuanError> {
        loop {
            self.check_stopped()?;
            let Some(message) = session.receive_message().await? else {
                continue;
            };
            if message.message_id != MSG_ID_LOGIN {
                trace!("waiting for nonce, skipping message {:#x}", message.message_id);
                continue;
            }
            match message.nonce() {
                Some(nonce) => return Ok(nonce),
                None => debug!("login reply without nonce"),
            }
        }
    }

    async fn receive_until(&self, session: &mut Session, message_id: u32) -> Result<LogicalMessage, BaichuanError> {
        loop {
            self.check_stopped()?;
            if let Some(message) = session.receive_message().await? {
                if message.message_id == message_id {
                    return Ok(message);
                }
                trace!("waiting for message {:#x}, skipping {:#x}", message_id, message.message_id);
            }
        }
    }

    async fn video_loop(&self, session: &mut Session) -> Result<(), BaichuanError> {
        let mut demuxer = FrameDemuxer::new(self.config.unknown_frames);

        let mut num_received: u64 = 0;
        loop {
            self.check_stopped()?;
            let Some(message) = session.receive_message().await? else {
                continue;
            };

            match message.message_id {
                MSG_ID_VIDEO if !message.binary.is_empty() => demuxer.push(&message.binary),
                MSG_ID_BATTERY_INFO => match message.battery_percent() {
                    Some(percent) => {
                        info!("battery percentage: {}", percent);
                        self.emit(CameraEvent::Battery(percent));
                    }
                    None => debug!("battery message without percentage"),
                },
                MSG_ID_PING => {
                    debug!("received pong");
                    self.emit(CameraEvent::Pong);
                }
                message_id => {
                    debug!("received unhandled message {:#x}", message_id);
                    self.emit(CameraEvent::Unhandled { message_id });
                }
            }
            self.emit(CameraEvent::Stream(demuxer.take_stream()));

            if num_received % self.config.ping_every_n_messages == 0 {
                debug!("sending ping");
                session.ping().await?;
            }
            num_received += 1;
        }
    }

    fn emit(&self, event: CameraEvent) {
        if self.events.send(event).is_err() {
            trace!("no subscribers for camera {}", self.name);
        }
    }
}

/// completes when a stop is requested; never, if the stop handle is gone
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}
