//! Named camera sessions, started on demand and stopped when nobody accessed them for a while.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::camera::{Camera, CameraEvent, StopHandle};
use crate::config::{CameraSettings, RegistryConfig, Settings};
use crate::error::BaichuanError;
use crate::transport::TransportFactory;


/// What callers get for a running session
pub struct SessionHandle {
    name: String,
    backup_image: Option<String>,
    events: broadcast::Sender<CameraEvent>,
}
impl SessionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// image to show while the camera delivers no frames
    pub fn backup_image(&self) -> Option<&str> {
        self.backup_image.as_deref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CameraEvent> {
        self.events.subscribe()
    }
}

struct RunningSession {
    handle: Arc<SessionHandle>,
    stop: StopHandle,
    task: JoinHandle<Result<(), BaichuanError>>,
    last_accessed: Instant,
}
impl RunningSession {
    async fn shut_down(self) {
        self.stop.stop();
        match self.task.await {
            Ok(Ok(())) => debug!("session {} terminated", self.handle.name),
            Ok(Err(e)) => warn!("session {} terminated with error: {}", self.handle.name, e),
            Err(e) => warn!("session {} panicked or was cancelled: {}", self.handle.name, e),
        }
    }
}

/// All mutations happen under a single lock, which is never held while a session shuts down.
pub struct SessionRegistry {
    config: RegistryConfig,
    cameras: Vec<CameraSettings>,
    factory: Arc<dyn TransportFactory>,
    sessions: Mutex<HashMap<String, RunningSession>>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig, settings: Settings, factory: Arc<dyn TransportFactory>) -> SessionRegistry {
        SessionRegistry {
            config,
            cameras: settings.cameras,
            factory,
            sessions: Default::default(),
        }
    }

    /// Starts the named camera, or returns the running session. `None` if there is no camera
    ///  with that name.
    pub async fn start(&self, name: &str) -> Option<Arc<SessionHandle>> {
        let camera_settings = self.cameras.iter()
            .find(|c| c.name == name)?;

        let mut sessions = self.sessions.lock().await;
        if let Some(running) = sessions.get_mut(name) {
            if !running.task.is_finished() {
                running.last_accessed = Instant::now();
                return Some(running.handle.clone());
            }
            debug!("session {} terminated on its own - restarting", name);
        }

        info!("starting session {}", name);
        let (events, _) = broadcast::channel(self.config.event_capacity);
        let (mut camera, stop) = Camera::new(name, Arc::new(camera_settings.session_config()), events.clone());

        let factory = self.factory.clone();
        let task = tokio::spawn(
            async move { camera.run(factory.as_ref()).await }
                .instrument(info_span!("camera", name = %name))
        );

        let handle = Arc::new(SessionHandle {
            name: name.to_string(),
            backup_image: camera_settings.backup_image.clone(),
            events,
        });
        sessions.insert(name.to_string(), RunningSession {
            handle: handle.clone(),
            stop,
            task,
            last_accessed: Instant::now(),
        });
        Some(handle)
    }

    /// Returns `false` if the session was not running
    pub async fn stop(&self, name: &str) -> bool {
        let removed = self.sessions.lock().await
            .remove(name);

        match removed {
            Some(session) => {
                info!("stopping session {}", name);
                session.shut_down().await;
                true
            }
            None => false,
        }
    }

    /// Marks the session as accessed, resetting its idle timer
    pub async fn touch(&self, name: &str) {
        if let Some(session) = self.sessions.lock().await.get_mut(name) {
            session.last_accessed = Instant::now();
        }
    }

    /// Returns the running session, `None` if it was never started or terminated on its own
    pub async fn get(&self, name: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.lock().await
            .get(name)
            .filter(|s| !s.task.is_finished())
            .map(|s| s.handle.clone())
    }

    /// Stops all sessions that were not accessed within the idle timeout, returning their names
    pub async fn evict_idle(&self) -> Vec<String> {
        let now = Instant::now();
        let evicted = {
            let mut sessions = self.sessions.lock().await;
            let idle_names = sessions.iter()
                .filter(|(_, s)| now.duration_since(s.last_accessed) >= self.config.idle_timeout)
                .map(|(name, _)| name.clone())
                .collect::<Vec<_>>();
            idle_names.into_iter()
                .filter_map(|name| sessions.remove(&name).map(|s| (name, s)))
                .collect::<Vec<_>>()
        };

        let mut names = Vec::new();
        for (name, session) in evicted {
            info!("stopping idle session {}", name);
            session.shut_down().await;
            names.push(name);
        }
        names
    }

    pub fn spawn_idle_eviction(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticks = interval(registry.config.eviction_poll_interval);
            loop {
                ticks.tick().await;
                registry.evict_idle().await;
            }
        })
    }

    /// Stops all sessions
    pub async fn shut_down(&self) {
        let sessions = std::mem::take(&mut *self.sessions.lock().await);
        for (_, session) in sessions {
            session.shut_down().await;
        }
    }
}
