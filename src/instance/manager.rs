//! Connection State Machine orchestration
//!
//! `InstanceManager` owns the registry and wires each instance's transport
//! session to the transition table:
//! - one event-loop task per session generation drains the bounded event
//!   channel in order
//! - every transition runs under the instance's slot lock; webhooks are
//!   dispatched after the lock is released
//! - reconnect and readiness timers are tied to the generation's
//!   cancellation token, so teardown cancels them
//!
//! Caller-invoked commands return `InstanceError`. Bookkeeping and background
//! failures go to the `NonFatalReporter`.

use super::readiness::ReadySource;
use super::registry::{InstanceRegistry, InstanceRuntime, InstanceSlot};
use super::state_machine::{self, Effect, Trigger};
use super::{Instance, InstanceStatus};
use crate::config::ConnectionConfig;
use crate::error::{InstanceError, NonFatalError, NonFatalReporter};
use crate::persistence::PersistenceGateway;
use crate::retry::LinearBackoff;
use crate::transport::{
    ConnectOptions, DisconnectReason, MessageContent, TransportAdapter, TransportEvent,
    TransportSession, CONNECTION_LOST_CODE,
};
use crate::webhook::{SessionStatusData, WebhookDispatcher, WebhookEnvelope};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tunables for the connection state machine
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerSettings {
    pub reconnect: LinearBackoff,
    pub readiness_timeout: Duration,
    pub pairing_poll_window: Duration,
    pub pairing_poll_interval: Duration,
    pub event_buffer: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

impl ManagerSettings {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            reconnect: LinearBackoff::new(
                config.reconnect_base_delay,
                config.max_reconnect_attempts,
            ),
            readiness_timeout: config.readiness_timeout,
            pairing_poll_window: config.pairing_poll_window,
            pairing_poll_interval: config.pairing_poll_interval,
            event_buffer: config.event_buffer,
        }
    }
}

/// Options for [`InstanceManager::init`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitOptions {
    /// Replace the instance's webhook URL.
    pub webhook_url: Option<String>,
    /// Tear down and recreate an existing session.
    pub force: bool,
}

/// A webhook to send once the slot lock is released
struct Notification {
    url: Option<String>,
    envelope: WebhookEnvelope,
}

impl Notification {
    fn session_status(instance: &Instance, data: SessionStatusData) -> Self {
        Self {
            url: instance.webhook_url().map(str::to_string),
            envelope: WebhookEnvelope::session_status(instance.id(), data),
        }
    }
}

#[derive(Clone)]
pub struct InstanceManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    registry: InstanceRegistry,
    transport: Arc<dyn TransportAdapter>,
    store: Arc<dyn PersistenceGateway>,
    dispatcher: WebhookDispatcher,
    settings: ManagerSettings,
    reporter: NonFatalReporter,
}

impl InstanceManager {
    pub fn new(
        transport: Arc<dyn TransportAdapter>,
        store: Arc<dyn PersistenceGateway>,
        dispatcher: WebhookDispatcher,
        settings: ManagerSettings,
        reporter: NonFatalReporter,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry: InstanceRegistry::new(),
                transport,
                store,
                dispatcher,
                settings,
                reporter,
            }),
        }
    }

    pub fn dispatcher(&self) -> &WebhookDispatcher {
        &self.inner.dispatcher
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.inner.settings
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            event_buffer: self.inner.settings.event_buffer,
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Bring up a transport session for `id`.
    ///
    /// Idempotent: while the instance is connecting or connected the current
    /// state is returned and no second session is opened, unless
    /// `options.force` is set.
    pub async fn init(&self, id: &str, options: InitOptions) -> Result<Instance, InstanceError> {
        loop {
            let slot = self.slot_or_restore(id).await;
            let mut runtime = slot.lock().await;
            if runtime.removed {
                debug!(instance = %id, "init: slot removed concurrently, retrying");
                continue;
            }
            return self.init_locked(&slot, &mut runtime, options).await;
        }
    }

    async fn init_locked(
        &self,
        slot: &Arc<InstanceSlot>,
        runtime: &mut InstanceRuntime,
        options: InitOptions,
    ) -> Result<Instance, InstanceError> {
        let id = slot.id();
        if let Some(url) = options.webhook_url {
            runtime.instance.set_webhook_url(Some(url));
        }

        if runtime.instance.status().is_active() && !options.force {
            debug!(instance = %id, status = %runtime.instance.status(), "init: session already active");
            self.commit(slot, runtime).await;
            return Ok(runtime.instance.clone());
        }

        state_machine::apply(
            &mut runtime.instance,
            Trigger::InitRequested {
                force: options.force,
            },
            &self.inner.settings.reconnect,
        )?;
        let (generation, cancel) = runtime.reset_session();
        slot.readiness().reset();
        self.commit(slot, runtime).await;

        info!(instance = %id, force = options.force, "opening transport session");
        match self.inner.transport.connect(id, self.connect_options()).await {
            Ok(handle) => {
                runtime.session = Some(handle.session);
                self.spawn_event_loop(Arc::clone(slot), generation, cancel, handle.events);
                Ok(runtime.instance.clone())
            }
            Err(e) => {
                warn!(instance = %id, error = %e, "failed to open transport session");
                if state_machine::apply(
                    &mut runtime.instance,
                    Trigger::ConnectFailed,
                    &self.inner.settings.reconnect,
                )
                .is_ok()
                {
                    self.commit(slot, runtime).await;
                }
                Err(InstanceError::Transport(e))
            }
        }
    }

    /// Request a phone-number pairing code.
    ///
    /// Forces a fresh session (credentials are kept), then waits up to the
    /// pairing poll window for the session to come up.
    pub async fn request_pairing_code(
        &self,
        id: &str,
        phone_number: &str,
    ) -> Result<String, InstanceError> {
        if self
            .inner
            .registry
            .get(id)
            .await
            .is_some_and(|slot| slot.snapshot().is_connected())
        {
            return Err(InstanceError::AlreadyConnected(id.to_string()));
        }

        let webhook_url = match self.remove_from_memory(id).await {
            Ok(previous) => previous.webhook_url().map(str::to_string),
            Err(InstanceError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let options = InitOptions {
            webhook_url,
            force: true,
        };
        if let Err(e) = self.init(id, options).await {
            debug!(instance = %id, error = %e, "pairing: init failed");
            return Err(InstanceError::NotConnectable(id.to_string()));
        }

        let (slot, generation, session) = self.wait_for_session(id).await?;

        let code = session.request_pairing_code(phone_number).await?;

        let mut runtime = slot.lock().await;
        if runtime.generation != generation {
            return Err(InstanceError::NotConnectable(id.to_string()));
        }
        state_machine::apply(
            &mut runtime.instance,
            Trigger::PairingCodeIssued { code: code.clone() },
            &self.inner.settings.reconnect,
        )?;
        self.commit(&slot, &runtime).await;
        info!(instance = %id, "pairing code issued");
        Ok(code)
    }

    async fn wait_for_session(
        &self,
        id: &str,
    ) -> Result<(Arc<InstanceSlot>, u64, Arc<dyn TransportSession>), InstanceError> {
        let deadline = Instant::now() + self.inner.settings.pairing_poll_window;
        loop {
            if let Some(slot) = self.inner.registry.get(id).await {
                let runtime = slot.lock().await;
                let pairable = !runtime.removed
                    && matches!(
                        runtime.instance.status(),
                        InstanceStatus::Connecting | InstanceStatus::QrPending
                    );
                if let (true, Some(session)) = (pairable, runtime.session.clone()) {
                    let generation = runtime.generation;
                    drop(runtime);
                    return Ok((slot, generation, session));
                }
            }
            if Instant::now() >= deadline {
                return Err(InstanceError::NotConnectable(id.to_string()));
            }
            sleep(self.inner.settings.pairing_poll_interval).await;
        }
    }

    /// Log the account out. The instance stays addressable as `logged_out`
    /// and its record is kept.
    pub async fn logout_instance(&self, id: &str) -> Result<Instance, InstanceError> {
        let slot = self.slot(id).await?;
        let (notifications, snapshot) = {
            let mut runtime = slot.lock().await;
            if runtime.removed {
                return Err(InstanceError::NotFound(id.to_string()));
            }
            let session = runtime
                .session
                .clone()
                .ok_or_else(|| InstanceError::NotConnected(id.to_string()))?;
            session.logout().await?;
            let notifications = self
                .transition(
                    &slot,
                    &mut runtime,
                    Trigger::ConnectionClosed {
                        reason: DisconnectReason::LoggedOut,
                    },
                )
                .await;
            (notifications, runtime.instance.clone())
        };
        self.notify(notifications).await;
        Ok(snapshot)
    }

    /// Permanently remove an instance: logout, cancel timers, remove session
    /// artifacts, delete its record and forget it in memory.
    ///
    /// The whole teardown runs under the slot lock; the slot leaves the
    /// registry last, so a concurrent `init` waits and then starts from
    /// scratch. Only an unknown id is an error; every cleanup step is
    /// best-effort.
    pub async fn delete_instance(&self, id: &str) -> Result<(), InstanceError> {
        loop {
            let slot = match self.inner.registry.get(id).await {
                Some(slot) => slot,
                None => match self.inner.store.find_instance(id).await {
                    Ok(Some(record)) => {
                        self.inner
                            .registry
                            .get_or_load(id, move || async move { Instance::restore(record) })
                            .await
                    }
                    _ => return Err(InstanceError::NotFound(id.to_string())),
                },
            };

            let mut runtime = slot.lock().await;
            if runtime.removed {
                continue;
            }
            runtime.removed = true;

            if let Some(session) = runtime.session.clone() {
                if let Err(source) = session.logout().await {
                    self.inner.reporter.report(NonFatalError::Logout {
                        instance_id: id.to_string(),
                        source,
                    });
                }
            }
            runtime.reset_session();
            slot.readiness().reset();

            self.remove_artifacts(id).await;
            if let Err(e) = self.inner.store.delete_instance(id).await {
                self.inner.reporter.persistence("delete_instance", e);
            }
            self.inner.registry.remove(id).await;
            info!(instance = %id, "instance deleted");
            return Ok(());
        }
    }

    /// Drop the instance from memory without logging out. Credentials and
    /// the persisted record survive; the next `init` restores from them.
    pub async fn remove_from_memory(&self, id: &str) -> Result<Instance, InstanceError> {
        let slot = self.slot(id).await?;
        let mut runtime = slot.lock().await;
        if runtime.removed {
            return Err(InstanceError::NotFound(id.to_string()));
        }
        runtime.removed = true;
        runtime.reset_session();
        slot.readiness().reset();
        self.inner.registry.remove(id).await;
        debug!(instance = %id, "removed from memory");
        Ok(runtime.instance.clone())
    }

    /// Send a message through a connected instance.
    pub async fn send_message(
        &self,
        id: &str,
        jid: &str,
        content: MessageContent,
    ) -> Result<String, InstanceError> {
        let slot = self.slot(id).await?;
        let session = {
            let runtime = slot.lock().await;
            if runtime.removed {
                return Err(InstanceError::NotFound(id.to_string()));
            }
            match (&runtime.session, runtime.instance.is_connected()) {
                (Some(session), true) => Arc::clone(session),
                _ => return Err(InstanceError::NotConnected(id.to_string())),
            }
        };
        Ok(session.send(jid, &content).await?)
    }

    /// Set or clear the webhook URL of an instance (in memory or only
    /// persisted).
    pub async fn set_webhook(&self, id: &str, url: Option<String>) -> Result<(), InstanceError> {
        if let Some(slot) = self.inner.registry.get(id).await {
            let mut runtime = slot.lock().await;
            if !runtime.removed {
                runtime.instance.set_webhook_url(url);
                self.commit(&slot, &runtime).await;
                return Ok(());
            }
        }

        let record = match self.inner.store.find_instance(id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Err(InstanceError::NotFound(id.to_string())),
            Err(e) => {
                self.inner.reporter.persistence("find_instance", e);
                return Err(InstanceError::NotFound(id.to_string()));
            }
        };
        // Edit the row as stored; restoring it would downgrade an active status.
        let mut record = record;
        record.webhook_url = url.filter(|u| !u.trim().is_empty());
        record.updated_at = chrono::Utc::now();
        if let Err(e) = self.inner.store.upsert_instance(&record).await {
            self.inner.reporter.persistence("upsert_instance", e);
        }
        Ok(())
    }

    /// Load every persisted instance into memory and re-init the ones that
    /// had a session when they were last saved. Returns how many were loaded.
    pub async fn restore_all(&self) -> usize {
        let records = match self.inner.store.list_instances().await {
            Ok(records) => records,
            Err(e) => {
                self.inner.reporter.persistence("list_instances", e);
                return 0;
            }
        };

        let count = records.len();
        let mut resume = Vec::new();
        for record in records {
            let id = record.id.clone();
            if record.status.is_active() {
                resume.push(id.clone());
            }
            self.inner
                .registry
                .get_or_insert_with(&id, || Instance::restore(record))
                .await;
        }

        let results = join_all(
            resume
                .iter()
                .map(|id| self.init(id, InitOptions::default())),
        )
        .await;
        for (id, result) in resume.iter().zip(results) {
            if let Err(e) = result {
                warn!(instance = %id, error = %e, "failed to resume instance");
            }
        }
        info!(loaded = count, resumed = resume.len(), "restored persisted instances");
        count
    }

    // ------------------------------------------------------------------
    // Reads (never take the slot lock)
    // ------------------------------------------------------------------

    pub async fn snapshot(&self, id: &str) -> Option<Instance> {
        self.inner.registry.get(id).await.map(|slot| slot.snapshot())
    }

    pub async fn status(&self, id: &str) -> Option<InstanceStatus> {
        self.snapshot(id).await.map(|instance| instance.status())
    }

    pub async fn is_connected(&self, id: &str) -> bool {
        self.snapshot(id)
            .await
            .is_some_and(|instance| instance.is_connected())
    }

    pub async fn is_ready(&self, id: &str) -> bool {
        self.inner
            .registry
            .get(id)
            .await
            .is_some_and(|slot| slot.readiness().is_ready())
    }

    pub async fn ready_source(&self, id: &str) -> Option<ReadySource> {
        self.inner
            .registry
            .get(id)
            .await
            .and_then(|slot| slot.readiness().source())
    }

    pub async fn list(&self) -> Vec<Instance> {
        self.inner.registry.snapshots().await
    }

    /// Watch an instance's published state.
    pub async fn subscribe(&self, id: &str) -> Option<watch::Receiver<Instance>> {
        self.inner.registry.get(id).await.map(|slot| slot.subscribe())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn slot(&self, id: &str) -> Result<Arc<InstanceSlot>, InstanceError> {
        self.inner
            .registry
            .get(id)
            .await
            .ok_or_else(|| InstanceError::NotFound(id.to_string()))
    }

    async fn slot_or_restore(&self, id: &str) -> Arc<InstanceSlot> {
        if let Some(slot) = self.inner.registry.get(id).await {
            return slot;
        }
        self.inner
            .registry
            .get_or_load(id, || async {
                match self.inner.store.find_instance(id).await {
                    Ok(Some(record)) => Instance::restore(record),
                    Ok(None) => Instance::new(id),
                    Err(e) => {
                        self.inner.reporter.persistence("find_instance", e);
                        Instance::new(id)
                    }
                }
            })
            .await
    }

    /// Publish the runtime's instance to readers and persist it.
    async fn commit(&self, slot: &InstanceSlot, runtime: &InstanceRuntime) {
        slot.publish(&runtime.instance);
        self.persist(&runtime.instance).await;
    }

    async fn persist(&self, instance: &Instance) {
        if let Err(e) = self.inner.store.upsert_instance(&instance.to_record()).await {
            self.inner.reporter.persistence("upsert_instance", e);
        }
    }

    async fn remove_artifacts(&self, id: &str) {
        if let Err(source) = self.inner.transport.remove_artifacts(id).await {
            self.inner.reporter.report(NonFatalError::Artifacts {
                instance_id: id.to_string(),
                source,
            });
        }
    }

    async fn notify(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            self.inner
                .dispatcher
                .dispatch(notification.url.as_deref(), notification.envelope)
                .await;
        }
    }

    fn spawn_event_loop(
        &self,
        slot: Arc<InstanceSlot>,
        generation: u64,
        cancel: CancellationToken,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Some(event) => manager.handle_event(&slot, generation, event).await,
                    None => {
                        // Stream ended without a close event.
                        let lost = TransportEvent::ConnectionClosed {
                            reason: DisconnectReason::Recoverable(CONNECTION_LOST_CODE),
                        };
                        manager.handle_event(&slot, generation, lost).await;
                        break;
                    }
                }
            }
            debug!(instance = %slot.id(), generation, "event loop stopped");
        });
    }

    async fn handle_event(&self, slot: &Arc<InstanceSlot>, generation: u64, event: TransportEvent) {
        let notifications = {
            let mut runtime = slot.lock().await;
            if runtime.generation != generation {
                debug!(instance = %slot.id(), generation, "ignoring event from stale session");
                return;
            }

            match event {
                TransportEvent::Qr { code } => {
                    self.transition(slot, &mut runtime, Trigger::QrIssued { code })
                        .await
                }
                TransportEvent::CredsUpdated => {
                    debug!(instance = %slot.id(), "credentials updated");
                    self.persist(&runtime.instance).await;
                    Vec::new()
                }
                TransportEvent::ConnectionOpened { user } => {
                    self.transition(
                        slot,
                        &mut runtime,
                        Trigger::ConnectionOpened { phone_number: user },
                    )
                    .await
                }
                TransportEvent::ConnectionClosed { reason } => {
                    self.transition(slot, &mut runtime, Trigger::ConnectionClosed { reason })
                        .await
                }
                TransportEvent::AppStateSynced => {
                    if slot.readiness().mark(ReadySource::Signal) {
                        info!(instance = %slot.id(), "app state ready (sync signal)");
                    } else {
                        debug!(instance = %slot.id(), "late app state sync signal ignored");
                    }
                    Vec::new()
                }
                TransportEvent::Message { event, data } => vec![Notification {
                    url: runtime.instance.webhook_url().map(str::to_string),
                    envelope: WebhookEnvelope::new(event, Some(slot.id().to_string()), data),
                }],
            }
        };
        self.notify(notifications).await;
    }

    /// Apply a trigger under the slot lock and carry out its effect.
    ///
    /// Rejected triggers are logged and leave the instance untouched.
    async fn transition(
        &self,
        slot: &Arc<InstanceSlot>,
        runtime: &mut InstanceRuntime,
        trigger: Trigger,
    ) -> Vec<Notification> {
        let id = slot.id().to_string();
        let effect = match state_machine::apply(
            &mut runtime.instance,
            trigger,
            &self.inner.settings.reconnect,
        ) {
            Ok(effect) => effect,
            Err(e) => {
                debug!(instance = %id, error = %e, "trigger rejected");
                return Vec::new();
            }
        };
        self.commit(slot, runtime).await;

        match effect {
            Effect::QrIssued => {
                info!(instance = %id, "QR code issued");
                let code = runtime.instance.qr_code().unwrap_or_default();
                vec![Notification::session_status(
                    &runtime.instance,
                    SessionStatusData::qr(code),
                )]
            }
            Effect::Connected => {
                info!(instance = %id, phone = ?runtime.instance.phone_number(), "connected");
                self.spawn_readiness_timer(
                    Arc::clone(slot),
                    runtime.generation,
                    runtime.cancel.clone(),
                );
                vec![Notification::session_status(
                    &runtime.instance,
                    SessionStatusData::connected(runtime.instance.phone_number()),
                )]
            }
            Effect::LoggedOut => {
                info!(instance = %id, "logged out, removing session artifacts");
                runtime.reset_session();
                slot.readiness().reset();
                self.remove_artifacts(&id).await;
                vec![Notification::session_status(
                    &runtime.instance,
                    SessionStatusData::disconnected("logged_out"),
                )]
            }
            Effect::Reconnect { attempt, delay } => {
                info!(instance = %id, attempt, delay = ?delay, "connection lost, reconnecting");
                let (generation, cancel) = runtime.reset_session();
                slot.readiness().reset();
                self.spawn_reconnect(Arc::clone(slot), generation, cancel, delay);
                Vec::new()
            }
            Effect::GiveUp => {
                warn!(
                    instance = %id,
                    attempts = runtime.instance.reconnect_attempts(),
                    "reconnect attempts exhausted"
                );
                runtime.reset_session();
                slot.readiness().reset();
                vec![Notification::session_status(
                    &runtime.instance,
                    SessionStatusData::disconnected("reconnect_exhausted"),
                )]
            }
            Effect::PairingIssued | Effect::OpenSession | Effect::Idle => Vec::new(),
        }
    }

    fn spawn_readiness_timer(
        &self,
        slot: Arc<InstanceSlot>,
        generation: u64,
        cancel: CancellationToken,
    ) {
        let timeout = self.inner.settings.readiness_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(timeout) => {}
            }
            let runtime = slot.lock().await;
            if runtime.generation != generation {
                return;
            }
            if slot.readiness().mark(ReadySource::Timeout) {
                info!(instance = %slot.id(), ?timeout, "app state ready (timeout)");
            }
        });
    }

    fn spawn_reconnect(
        &self,
        slot: Arc<InstanceSlot>,
        generation: u64,
        cancel: CancellationToken,
        delay: Duration,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(delay) => {}
            }
            manager.reconnect(&slot, generation).await;
        });
    }

    async fn reconnect(&self, slot: &Arc<InstanceSlot>, generation: u64) {
        let notifications = {
            let mut runtime = slot.lock().await;
            if runtime.generation != generation {
                return;
            }
            match self
                .inner
                .transport
                .connect(slot.id(), self.connect_options())
                .await
            {
                Ok(handle) => {
                    debug!(instance = %slot.id(), "reconnected transport session");
                    runtime.session = Some(handle.session);
                    self.spawn_event_loop(
                        Arc::clone(slot),
                        generation,
                        runtime.cancel.clone(),
                        handle.events,
                    );
                    Vec::new()
                }
                Err(source) => {
                    self.inner.reporter.report(NonFatalError::Reconnect {
                        instance_id: slot.id().to_string(),
                        source,
                    });
                    self.transition(
                        slot,
                        &mut runtime,
                        Trigger::ConnectionClosed {
                            reason: DisconnectReason::Recoverable(CONNECTION_LOST_CODE),
                        },
                    )
                    .await
                }
            }
        };
        self.notify(notifications).await;
    }
}
