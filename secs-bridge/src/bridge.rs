//! Equipment bridge
//!
//! One [`EquipmentBridge`] runs one device: its HSMS connection, the GEM
//! session answering host primaries, the initialization sequencer started
//! each time the link is selected, the trigger sweep raising events and
//! alarms, and host-configured traces.
//!
//! # Tasks
//!
//! ```text
//! event loop   session events in arrival order: state changes, primaries
//! poll task    trigger sweeps every poll interval -> S6F11 / S5F1
//! sequencer    one per selected link, cancelled when the link drops
//! trace tasks  one per S2F23 trace, scoped to the link -> S6F1
//! ```

use crate::catalog::IdentifierCatalog;
use crate::config::DeviceConfig;
use crate::definition::TriggerKind;
use crate::error::{SecsError, SecsResult};
use crate::repository::MappingRepository;
use crate::resolver::{IdentifierResolver, ReportSlot, TriggerSnapshot};
use crate::source::PhysicalSource;
use parking_lot::Mutex;
use secs_core::{Alid, Ceid, DeviceId, Ecid, Item, Rptid, Svid};
use secs_gem::{
    AlarmChange, CommunicationState, ControlState, Dispatch, Effect, GemSequencer, GemSession,
    HandlerRegistry, InitializationState, Notification, ReportValues, Reply, ResolveRequest,
    SequencerObserver, SharedSession, TraceDefinition,
};
use secs_session::{
    HsmsConnection, HsmsConnectionState, HsmsMessage, HsmsStatistics, ReplyOutcome, SessionEvent,
};
use secs_transport::Connector;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Default capacity of a device's notification channel
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 1024;

/// Health report of one device
#[derive(Debug, Clone, Serialize)]
pub struct DeviceHealth {
    pub device_id: DeviceId,
    pub name: String,
    pub running: bool,
    pub connection_state: HsmsConnectionState,
    pub initialization_state: InitializationState,
    pub communication_state: CommunicationState,
    pub control_state: ControlState,
    pub last_error: Option<String>,
    /// Time since the bridge was started
    pub uptime: Option<Duration>,
    pub statistics: HsmsStatistics,
    pub active_alarms: Vec<Alid>,
}

impl DeviceHealth {
    /// Running and not stuck in a failed initialization
    pub fn is_healthy(&self) -> bool {
        self.running && self.initialization_state != InitializationState::Failed
    }
}

/// Tasks of the current selected link
struct LinkScope {
    token: CancellationToken,
    traces: HashMap<u32, CancellationToken>,
}

impl LinkScope {
    fn close(self) {
        self.token.cancel();
    }
}

struct Running {
    token: CancellationToken,
    event_loop: JoinHandle<()>,
    poll: JoinHandle<()>,
    started: Instant,
}

struct BridgeInner {
    config: DeviceConfig,
    connection: HsmsConnection,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<SessionEvent>>,
    session: SharedSession,
    registry: HandlerRegistry,
    resolver: IdentifierResolver,
    repository: Arc<dyn MappingRepository>,
    notifications: broadcast::Sender<Notification>,
    init_state: watch::Sender<InitializationState>,
    last_error: Mutex<Option<String>>,
    running: Mutex<Option<Running>>,
    lifecycle: tokio::sync::Mutex<()>,
}

/// Handle to one device bridge
///
/// Cloning yields another handle to the same bridge.
#[derive(Clone)]
pub struct EquipmentBridge {
    inner: Arc<BridgeInner>,
}

impl EquipmentBridge {
    /// Create an idle bridge
    ///
    /// The configuration is validated and the identifier catalog loaded
    /// before anything is created.
    ///
    /// # Errors
    ///
    /// `SecsError::Config` for an invalid configuration or malformed
    /// identifier mapping, or the repository's error
    pub async fn new(
        config: DeviceConfig,
        connector: Arc<dyn Connector>,
        source: Arc<dyn PhysicalSource>,
        repository: Arc<dyn MappingRepository>,
        notification_capacity: usize,
    ) -> SecsResult<Self> {
        config.validate()?;
        let catalog = IdentifierCatalog::load(repository.as_ref()).await?;
        let device_id = config.device_id;

        let mut session = GemSession::new(device_id, &config.model_name, &config.software_revision)
            .with_directory(catalog.directory(&internal_variables(&config)));
        session.reports = catalog.reports().clone();
        session.enabled_alarms = catalog.alids().map(|d| d.id).collect();

        let resolver = IdentifierResolver::new(device_id, catalog, source, config.source_timeout);
        let (connection, events) = HsmsConnection::new(config.hsms_config(), connector);
        let (notifications, _) = broadcast::channel(notification_capacity.max(1));
        let (init_state, _) = watch::channel(InitializationState::NotStarted);

        let inner = BridgeInner {
            config,
            connection,
            events: tokio::sync::Mutex::new(events),
            session: SharedSession::new(session),
            registry: HandlerRegistry::with_defaults(),
            resolver,
            repository,
            notifications,
            init_state,
            last_error: Mutex::new(None),
            running: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        };
        inner.publish_control_status();
        log::info!("dev{} bridge created", device_id);
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.config.device_id
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    pub fn connection_state(&self) -> HsmsConnectionState {
        self.inner.connection.state()
    }

    pub fn initialization_state(&self) -> InitializationState {
        *self.inner.init_state.borrow()
    }

    /// Watch the initialization state
    pub fn subscribe_initialization(&self) -> watch::Receiver<InitializationState> {
        self.inner.init_state.subscribe()
    }

    /// Watch the connection state
    pub fn subscribe_connection(&self) -> watch::Receiver<HsmsConnectionState> {
        self.inner.connection.subscribe_state()
    }

    /// Receive this device's notifications
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    /// Copy of the GEM session
    pub fn session(&self) -> GemSession {
        self.inner.session.snapshot()
    }

    pub fn resolver(&self) -> &IdentifierResolver {
        &self.inner.resolver
    }

    /// Start the connection and the bridge tasks; no-op if running
    pub async fn start(&self) -> SecsResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.is_running() {
            return Ok(());
        }
        *self.inner.last_error.lock() = None;
        let token = CancellationToken::new();
        self.inner.connection.start();
        let event_loop = tokio::spawn(self.inner.clone().event_loop(token.clone()));
        let poll = tokio::spawn(self.inner.clone().poll_loop(token.child_token()));
        *self.inner.running.lock() = Some(Running {
            token,
            event_loop,
            poll,
            started: Instant::now(),
        });
        log::info!("dev{} bridge started", self.device_id());
        Ok(())
    }

    /// Stop the bridge
    ///
    /// Afterwards the connection is `NotConnected` and initialization
    /// `NotStarted`. Stopping a stopped bridge does nothing.
    pub async fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let running = self.inner.running.lock().take();
        self.inner.connection.stop().await;
        if let Some(running) = running {
            running.token.cancel();
            for (name, task) in [("poll", running.poll), ("event loop", running.event_loop)] {
                if let Err(e) = task.await {
                    log::error!("dev{} {} task ended abnormally: {}", self.device_id(), name, e);
                }
            }
            log::info!("dev{} bridge stopped", self.device_id());
        }
        self.inner.set_init_state(InitializationState::NotStarted, None);
    }

    /// Health report
    pub fn health(&self) -> DeviceHealth {
        let inner = &self.inner;
        let (communication_state, control_state) = inner
            .session
            .read(|s| (s.communication_state, s.control_state));
        let uptime = inner.running.lock().as_ref().map(|r| r.started.elapsed());
        let last_error = inner
            .last_error
            .lock()
            .clone()
            .or_else(|| inner.connection.last_error());
        DeviceHealth {
            device_id: inner.config.device_id,
            name: inner.config.name.clone(),
            running: uptime.is_some(),
            connection_state: inner.connection.state(),
            initialization_state: self.initialization_state(),
            communication_state,
            control_state,
            last_error,
            uptime,
            statistics: inner.connection.statistics(),
            active_alarms: inner.resolver.active_alarms(),
        }
    }

    /// Fire a manually triggered collection event
    ///
    /// # Errors
    ///
    /// `UnknownIdentifier` if the CEID is not defined, `InvalidData` if its
    /// trigger is not manual
    pub async fn trigger_event(&self, ceid: Ceid) -> SecsResult<()> {
        let trigger = self.inner.resolver.catalog().ceid(ceid)?.trigger;
        if trigger != TriggerKind::Manual {
            return Err(SecsError::InvalidData(format!(
                "CEID {} is triggered by the PLC ({:?})",
                ceid, trigger
            )));
        }
        self.inner.fire_event(ceid).await;
        Ok(())
    }

    /// Build and send the S6F11 event report of a collection event again
    ///
    /// Reports reach the host only inside an event report, so the unit of
    /// resend is the CEID with every report currently linked to it. Use
    /// [`read_report`](Self::read_report) to read one RPTID's values.
    pub async fn resend_report(&self, ceid: Ceid) -> SecsResult<()> {
        self.inner.resolver.catalog().ceid(ceid)?;
        self.inner.fire_event(ceid).await;
        Ok(())
    }

    /// Current values of an equipment-defined report, in declared order
    ///
    /// # Errors
    ///
    /// `UnknownIdentifier` if the RPTID is not defined
    pub async fn read_report(&self, rptid: Rptid) -> SecsResult<ReportValues> {
        let slots = self.inner.resolver.resolve_report(rptid).await?;
        Ok(ReportValues {
            rptid,
            values: slots
                .into_iter()
                .map(|(svid, slot)| (svid, slot.into_item()))
                .collect(),
        })
    }

    /// Clear a set alarm
    pub fn clear_alarm(&self, alid: Alid) -> SecsResult<()> {
        if let Some(change) = self.inner.resolver.clear_alarm(alid)? {
            self.inner.report_alarm(alid, change);
        }
        Ok(())
    }

    pub fn monitored_alarms(&self) -> Vec<Alid> {
        self.inner.resolver.monitored_alarms()
    }

    pub fn set_alarm_monitored(&self, alid: Alid, monitored: bool) -> SecsResult<()> {
        self.inner.resolver.set_alarm_monitored(alid, monitored)
    }

    /// Reload the identifier catalog from the repository
    ///
    /// New alarms start enabled for S5F1; removed alarms leave the enabled
    /// set. On error the current catalog stays in place.
    pub async fn reload_definitions(&self) -> SecsResult<()> {
        let inner = &self.inner;
        let catalog = IdentifierCatalog::load(inner.repository.as_ref()).await?;
        let directory = catalog.directory(&internal_variables(&inner.config));
        let previous = inner.resolver.catalog();
        let alids: BTreeSet<Alid> = catalog.alids().map(|d| d.id).collect();
        let added: Vec<Alid> = alids
            .iter()
            .copied()
            .filter(|alid| previous.alid(*alid).is_err())
            .collect();
        inner.resolver.replace_catalog(catalog);
        inner.session.update(|s| {
            s.directory = directory;
            s.enabled_alarms.retain(|alid| alids.contains(alid));
            s.enabled_alarms.extend(added);
        });
        Ok(())
    }
}

fn internal_variables(config: &DeviceConfig) -> [(Svid, &'static str); 2] {
    [
        (config.initialization.control_state_svid, "ControlState"),
        (config.initialization.control_mode_svid, "ControlMode"),
    ]
}

/// Wire value of a report slot; unresolved values are sent as empty lists
fn slot_item(slot: &ReportSlot) -> Item {
    slot.item().cloned().unwrap_or_else(Item::empty_list)
}

/// EAC of S2F16
fn equipment_ack(error: &SecsError) -> u8 {
    match error {
        SecsError::OutOfRange(_) | SecsError::TypeMismatch(_) => 3,
        SecsError::SourceUnavailable(_) => 2,
        _ => 1,
    }
}

/// STIME of S6F1: `YYYYMMDDhhmmsscc`
fn sample_time() -> String {
    let now = chrono::Local::now();
    format!(
        "{}{:02}",
        now.format("%Y%m%d%H%M%S"),
        now.timestamp_subsec_millis() / 10
    )
}

impl BridgeInner {
    fn device_id(&self) -> DeviceId {
        self.config.device_id
    }

    fn notify(&self, notification: Notification) {
        log::debug!("{}", notification.description());
        // no subscribers is fine
        let _ = self.notifications.send(notification);
    }

    /// Move the initialization state
    ///
    /// With a `scope`, the change is dropped once the scope is cancelled, so
    /// a cancelled sequencer cannot overwrite the reset of its link.
    fn set_init_state(&self, to: InitializationState, scope: Option<&CancellationToken>) {
        self.init_state.send_if_modified(|state| {
            if scope.is_some_and(CancellationToken::is_cancelled) || *state == to {
                return false;
            }
            let from = std::mem::replace(state, to);
            self.notify(Notification::InitializationStateChanged {
                device_id: self.device_id(),
                from,
                to,
            });
            true
        });
    }

    fn record_error(&self, error: String) {
        *self.last_error.lock() = Some(error);
    }

    fn publish_control_status(&self) {
        let (state, mode) = self.session.read(|s| (s.control_state, s.control_mode));
        self.resolver.publish_internal(vec![
            (self.config.initialization.control_state_svid, Item::u1(state.code())),
            (self.config.initialization.control_mode_svid, Item::u1(mode.code())),
        ]);
    }

    fn control_state_changed(&self, from: ControlState, to: ControlState) {
        self.publish_control_status();
        self.notify(Notification::ControlStateChanged {
            device_id: self.device_id(),
            from,
            to,
        });
    }

    fn can_report(&self) -> bool {
        self.connection.state().is_selected() && self.session.read(|s| s.control_state.is_online())
    }

    /// Send an equipment primary and log the outcome
    fn send_primary(&self, stream: u8, function: u8, body: Item) {
        let connection = self.connection.clone();
        let device_id = self.device_id();
        tokio::spawn(async move {
            let message = HsmsMessage::primary(stream, function, body);
            match connection.send_and_await_reply(message, None).await {
                Ok(ReplyOutcome::Replied(_)) | Ok(ReplyOutcome::Cancelled) => {}
                Ok(outcome) => {
                    log::warn!("dev{} S{}F{} not acknowledged: {:?}", device_id, stream, function, outcome)
                }
                Err(e) => log::warn!("dev{} S{}F{} not sent: {}", device_id, stream, function, e),
            }
        });
    }

    fn reply(&self, primary: &HsmsMessage, body: Item) {
        if !primary.reply_expected() {
            return;
        }
        if let Err(e) = self
            .connection
            .send_without_reply(HsmsMessage::reply_to(primary, Some(body)))
        {
            log::warn!(
                "dev{} reply to S{}F{} not sent: {}",
                self.device_id(),
                primary.stream(),
                primary.function(),
                e
            );
        }
    }

    /// S9Fx error report carrying the offending header
    fn send_stream9(&self, function: u8, primary: &HsmsMessage) {
        log::warn!(
            "dev{} unrecognized S{}F{}, answering S9F{}",
            self.device_id(),
            primary.stream(),
            primary.function(),
            function
        );
        let body = Item::Binary(primary.header.to_bytes().to_vec());
        if let Err(e) = self
            .connection
            .send_without_reply(HsmsMessage::data(9, function, false, Some(body)))
        {
            log::warn!("dev{} S9F{} not sent: {}", self.device_id(), function, e);
        }
    }

    async fn event_loop(self: Arc<Self>, token: CancellationToken) {
        let mut events = self.events.lock().await;
        let mut link: Option<LinkScope> = None;
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(event) => self.handle_event(event, &mut link, &token).await,
                None => break,
            }
        }
        // state changes queued by the connection's shutdown
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::StateChanged { .. }) {
                self.handle_event(event, &mut link, &token).await;
            }
        }
        if let Some(scope) = link.take() {
            scope.close();
        }
        self.set_init_state(InitializationState::NotStarted, None);
    }

    async fn handle_event(
        self: &Arc<Self>,
        event: SessionEvent,
        link: &mut Option<LinkScope>,
        token: &CancellationToken,
    ) {
        match event {
            SessionEvent::StateChanged { from, to } => {
                self.notify(Notification::ConnectionStateChanged {
                    device_id: self.device_id(),
                    from,
                    to,
                });
                if let Some(scope) = link.take() {
                    scope.close();
                    self.reset_session();
                }
                if to.is_selected() {
                    *link = Some(self.open_link(token));
                }
            }
            SessionEvent::Primary(message) => self.handle_primary(message, link.as_mut()).await,
        }
    }

    fn reset_session(&self) {
        let from = self.session.update(|s| {
            let from = s.control_state;
            s.reset();
            from
        });
        self.set_init_state(InitializationState::NotStarted, None);
        if from != ControlState::EquipmentOffLine {
            self.control_state_changed(from, ControlState::EquipmentOffLine);
        }
    }

    /// Start the initialization sequence of a newly selected link
    fn open_link(self: &Arc<Self>, token: &CancellationToken) -> LinkScope {
        let scope = token.child_token();
        self.set_init_state(InitializationState::NotStarted, None);
        let observer = Arc::new(SequencerLink {
            inner: self.clone(),
            scope: scope.clone(),
        });
        let sequencer = GemSequencer::new(
            self.device_id(),
            self.config.initialization.clone(),
            self.session.clone(),
            observer,
        );
        let inner = self.clone();
        let sequencer_token = scope.clone();
        tokio::spawn(async move {
            let state = sequencer.run(sequencer_token).await;
            if state == InitializationState::Failed {
                inner.record_error("GEM initialization failed".to_string());
            }
        });
        LinkScope {
            token: scope,
            traces: HashMap::new(),
        }
    }

    async fn handle_primary(self: &Arc<Self>, message: HsmsMessage, mut link: Option<&mut LinkScope>) {
        let (stream, function) = (message.stream(), message.function());
        let dispatch = self.session.update(|s| {
            self.registry
                .dispatch(s, stream, function, message.body.as_ref())
        });
        let outcome = match dispatch {
            Dispatch::Handled(outcome) => outcome,
            Dispatch::UnrecognizedStream => return self.send_stream9(3, &message),
            Dispatch::UnrecognizedFunction => return self.send_stream9(5, &message),
        };
        match outcome.reply {
            Reply::None => {}
            Reply::Body(body) => self.reply(&message, body),
            Reply::Resolve(request) => {
                let body = self.resolve(request).await;
                self.reply(&message, body);
            }
        }
        for effect in outcome.effects {
            self.apply_effect(effect, link.as_deref_mut());
        }
    }

    fn apply_effect(self: &Arc<Self>, effect: Effect, link: Option<&mut LinkScope>) {
        match effect {
            Effect::ControlStateChanged { from, to } => self.control_state_changed(from, to),
            Effect::TraceStarted(trid) => match link {
                Some(link) => self.start_trace(trid, link),
                None => log::warn!("dev{} trace {} configured without a link", self.device_id(), trid),
            },
            Effect::TraceStopped(trid) => {
                if let Some(token) = link.and_then(|l| l.traces.remove(&trid)) {
                    token.cancel();
                    log::info!("dev{} trace {} stopped", self.device_id(), trid);
                }
            }
            Effect::AlarmEnableChanged { alid, enabled } => {
                log::info!(
                    "dev{} alarm {} reporting {}",
                    self.device_id(),
                    alid,
                    if enabled { "enabled" } else { "disabled" }
                );
            }
            Effect::CommunicationEstablished
            | Effect::ReportsChanged
            | Effect::EventLinksChanged
            | Effect::EventsEnabledChanged => {
                log::debug!("dev{} {:?}", self.device_id(), effect);
            }
        }
    }

    /// Build a reply body that needs PLC values
    async fn resolve(&self, request: ResolveRequest) -> Item {
        match request {
            ResolveRequest::StatusVariables(svids) => {
                let slots = self.resolver.resolve_values(&svids).await;
                Item::list(slots.iter().map(|(_, slot)| slot_item(slot)).collect())
            }
            ResolveRequest::EquipmentConstants(ecids) => {
                let mut values = Vec::with_capacity(ecids.len());
                for ecid in ecids {
                    values.push(self.resolver.read_ecid(ecid).await.unwrap_or_else(|e| {
                        log::warn!("dev{} ECID {} unavailable: {}", self.device_id(), ecid, e);
                        Item::empty_list()
                    }));
                }
                Item::list(values)
            }
            ResolveRequest::ApplyConstants(values) => self.apply_constants(values).await,
            ResolveRequest::EventReport(ceid) => self.build_event_report(ceid).await.0,
            ResolveRequest::IndividualReport(rptid) => {
                let svids = self.session.read(|s| s.reports.get(&rptid).cloned());
                match svids {
                    Some(svids) => {
                        let slots = self.resolver.resolve_values(&svids).await;
                        Item::list(slots.iter().map(|(_, slot)| slot_item(slot)).collect())
                    }
                    None => Item::empty_list(),
                }
            }
            ResolveRequest::AlarmList(alids) => {
                let catalog = self.resolver.catalog();
                let entries = alids
                    .into_iter()
                    .filter_map(|alid| catalog.alid(alid).ok())
                    .map(|alarm| {
                        let change = match self.resolver.alarm_state(alarm.id) {
                            Some(state) if state.set => AlarmChange::Set,
                            _ => AlarmChange::Clear,
                        };
                        Item::list(vec![
                            Item::binary(change.alcd(alarm.category)),
                            Item::u4(alarm.id),
                            Item::ascii(alarm.name.clone()),
                        ])
                    })
                    .collect();
                Item::list(entries)
            }
        }
    }

    async fn apply_constants(&self, values: Vec<(Ecid, Item)>) -> Item {
        match self.resolver.apply_ecids(&values).await {
            Ok(()) => {
                for (ecid, value) in values {
                    log::info!("dev{} ECID {} set to {}", self.device_id(), ecid, value);
                    self.notify(Notification::EquipmentConstantChanged {
                        device_id: self.device_id(),
                        ecid,
                        value,
                    });
                }
                Item::binary(0)
            }
            Err(e) => {
                log::warn!("dev{} S2F15 denied: {}", self.device_id(), e);
                Item::binary(equipment_ack(&e))
            }
        }
    }

    /// S6F11/S6F16 body of an event with its linked reports
    async fn build_event_report(&self, ceid: Ceid) -> (Item, Vec<ReportValues>) {
        let (data_id, links) = self
            .session
            .update(|s| (s.next_data_id(), s.linked_reports(ceid)));
        let mut items = Vec::with_capacity(links.len());
        let mut reports = Vec::with_capacity(links.len());
        for (rptid, svids) in links {
            let slots = self.resolver.resolve_values(&svids).await;
            items.push(Item::list(vec![
                Item::u4(rptid),
                Item::list(slots.iter().map(|(_, slot)| slot_item(slot)).collect()),
            ]));
            let report = ReportValues {
                rptid,
                values: slots
                    .into_iter()
                    .map(|(svid, slot)| (svid, slot.into_item()))
                    .collect(),
            };
            if report.is_degraded() {
                log::warn!("dev{} event {} report {} degraded", self.device_id(), ceid, rptid);
            }
            reports.push(report);
        }
        let body = Item::list(vec![Item::u4(data_id), Item::u4(ceid), Item::list(items)]);
        (body, reports)
    }

    /// Publish an event and report it to the host if enabled
    async fn fire_event(&self, ceid: Ceid) {
        let (body, reports) = self.build_event_report(ceid).await;
        log::info!("dev{} event {} fired", self.device_id(), ceid);
        self.notify(Notification::EventFired {
            device_id: self.device_id(),
            ceid,
            reports,
        });
        if self.session.read(|s| s.is_event_enabled(ceid)) && self.can_report() {
            self.send_primary(6, 11, body);
        }
    }

    /// Publish an alarm transition and report it to the host if enabled
    fn report_alarm(&self, alid: Alid, change: AlarmChange) {
        log::info!("dev{} alarm {} {:?}", self.device_id(), alid, change);
        self.notify(Notification::AlarmTransition {
            device_id: self.device_id(),
            alid,
            change,
        });
        let catalog = self.resolver.catalog();
        let Ok(alarm) = catalog.alid(alid) else {
            return;
        };
        let enabled = self.session.read(|s| s.enabled_alarms.contains(&alid));
        if self.resolver.is_monitored(alid) && enabled && self.can_report() {
            self.send_primary(
                5,
                1,
                Item::list(vec![
                    Item::binary(change.alcd(alarm.category)),
                    Item::u4(alid),
                    Item::ascii(alarm.name.clone()),
                ]),
            );
        }
    }

    async fn poll_loop(self: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut previous: Option<TriggerSnapshot> = None;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            let current = self.resolver.snapshot().await;
            if let Some(previous) = &previous {
                for ceid in self.resolver.evaluate_event_triggers(previous, &current) {
                    self.fire_event(ceid).await;
                }
            }
            for (alid, change) in self.resolver.evaluate_alarms(&current) {
                self.report_alarm(alid, change);
            }
            previous = Some(current);
        }
    }

    fn start_trace(self: &Arc<Self>, trid: u32, link: &mut LinkScope) {
        let Some(definition) = self.session.read(|s| s.traces.get(&trid).cloned()) else {
            return;
        };
        let token = link.token.child_token();
        if let Some(previous) = link.traces.insert(trid, token.clone()) {
            previous.cancel();
        }
        log::info!(
            "dev{} trace {} started: {} sample(s) every {:?}",
            self.device_id(),
            trid,
            definition.total_samples,
            definition.period
        );
        tokio::spawn(self.clone().run_trace(definition, token));
    }

    async fn run_trace(self: Arc<Self>, trace: TraceDefinition, token: CancellationToken) {
        let mut interval = tokio::time::interval(trace.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut group = Vec::new();
        for smpln in 1..=trace.total_samples {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => {}
            }
            let slots = self.resolver.resolve_values(&trace.svids).await;
            group.extend(slots.iter().map(|(_, slot)| slot_item(slot)));
            self.notify(Notification::TraceSample {
                device_id: self.device_id(),
                trid: trace.trid,
                smpln,
                values: slots
                    .into_iter()
                    .map(|(svid, slot)| (svid, slot.into_item()))
                    .collect(),
            });
            if smpln % trace.group_size == 0 || smpln == trace.total_samples {
                let body = Item::list(vec![
                    Item::u4(trace.trid),
                    Item::u4(smpln),
                    Item::ascii(sample_time()),
                    Item::list(std::mem::take(&mut group)),
                ]);
                if self.connection.state().is_selected() {
                    self.send_primary(6, 1, body);
                }
            }
        }
        self.session.update(|s| s.traces.remove(&trace.trid));
        log::info!("dev{} trace {} completed", self.device_id(), trace.trid);
    }
}

/// Connects a running sequencer to its bridge
struct SequencerLink {
    inner: Arc<BridgeInner>,
    scope: CancellationToken,
}

impl SequencerObserver for SequencerLink {
    fn on_state_changed(&self, _from: InitializationState, to: InitializationState) {
        self.inner.set_init_state(to, Some(&self.scope));
    }

    fn on_control_state_changed(&self, from: ControlState, to: ControlState) {
        if !self.scope.is_cancelled() {
            self.inner.control_state_changed(from, to);
        }
    }

    fn publish_status(&self, values: Vec<(Svid, Item)>) {
        self.inner.resolver.publish_internal(values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{AlidDefinition, IdentifierDefinition};
    use crate::repository::InMemoryMappingRepository;
    use crate::source::{MemorySource, PlcValue};
    use crate::testing::{HostSimulator, WAIT, device_config, plc, tables};
    use secs_core::IdentifierKind;
    use secs_transport::{MemoryConnector, MemoryDialer};

    async fn bridge_with(source: Arc<MemorySource>) -> (EquipmentBridge, MemoryDialer) {
        let (connector, dialer) = MemoryConnector::pair("host");
        let bridge = EquipmentBridge::new(
            device_config(1),
            Arc::new(connector),
            source,
            Arc::new(InMemoryMappingRepository::from_tables(&tables())),
            64,
        )
        .await
        .unwrap();
        (bridge, dialer)
    }

    /// Started bridge with a selected host
    async fn connected() -> (EquipmentBridge, HostSimulator, Arc<MemorySource>, MemoryDialer) {
        let source = Arc::new(plc());
        let (bridge, dialer) = bridge_with(source.clone()).await;
        bridge.start().await.unwrap();
        let host = HostSimulator::connect(&dialer, 1).await;
        (bridge, host, source, dialer)
    }

    async fn wait_initialization(bridge: &EquipmentBridge, state: InitializationState) {
        let mut rx = bridge.subscribe_initialization();
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
            .await
            .unwrap()
            .unwrap();
    }

    async fn next_matching<F>(rx: &mut broadcast::Receiver<Notification>, f: F) -> Notification
    where
        F: Fn(&Notification) -> bool,
    {
        tokio::time::timeout(WAIT, async {
            loop {
                let notification = rx.recv().await.unwrap();
                if f(&notification) {
                    return notification;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_new_seeds_session() {
        let (bridge, _dialer) = bridge_with(Arc::new(plc())).await;
        let session = bridge.session();
        assert_eq!(session.reports.get(&1), Some(&vec![10001]));
        assert!(session.directory.svids.contains_key(&10001));
        assert!(session.directory.svids.contains_key(&1));
        assert!(session.enabled_alarms.contains(&5001));
        assert_eq!(bridge.resolver().resolve_svid(1).await.unwrap(), Item::u1(1));
        assert!(!bridge.is_running());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let (connector, _dialer) = MemoryConnector::pair("host");
        let result = EquipmentBridge::new(
            DeviceConfig::new(0, "127.0.0.1:5000"),
            Arc::new(connector),
            Arc::new(MemorySource::new()),
            Arc::new(InMemoryMappingRepository::new()),
            16,
        )
        .await;
        assert!(matches!(result, Err(SecsError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let (bridge, _dialer) = bridge_with(Arc::new(plc())).await;
        bridge.start().await.unwrap();
        bridge.start().await.unwrap();
        assert!(bridge.health().running);
        bridge.stop().await;
        bridge.stop().await;
        let health = bridge.health();
        assert!(!health.running);
        assert_eq!(health.connection_state, HsmsConnectionState::NotConnected);
        assert_eq!(health.initialization_state, InitializationState::NotStarted);

        bridge.start().await.unwrap();
        assert!(bridge.is_running());
        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_host_initialization_completes() {
        let (bridge, mut host, _source, _dialer) = connected().await;
        let mut notifications = bridge.subscribe();
        host.initialize(100, 7, &[10001, 10002]).await;
        wait_initialization(&bridge, InitializationState::Completed).await;

        let health = bridge.health();
        assert!(health.is_healthy());
        assert_eq!(health.connection_state, HsmsConnectionState::Selected);
        assert_eq!(health.communication_state, CommunicationState::Communicating);
        assert_eq!(health.control_state, ControlState::OnLineRemote);

        next_matching(&mut notifications, |n| {
            matches!(
                n,
                Notification::InitializationStateChanged {
                    to: InitializationState::Completed,
                    ..
                }
            )
        })
        .await;

        let reply = host
            .request(1, 3, Some(Item::list(vec![Item::u4(1), Item::u4(10001), Item::u4(999)])))
            .await;
        assert_eq!(
            reply.body,
            Some(Item::list(vec![Item::u1(5), Item::u4(20), Item::empty_list()]))
        );
        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_event_report_on_rising_edge() {
        let (bridge, mut host, source, _dialer) = connected().await;
        host.initialize(100, 7, &[10001, 10002]).await;
        wait_initialization(&bridge, InitializationState::Completed).await;
        let mut notifications = bridge.subscribe();

        source.set("M10", PlcValue::Bool(true));
        let report = host.expect_primary(6, 11).await;
        let body = report.body.unwrap();
        assert_eq!(body.get(1), Some(&Item::u4(100)));
        assert_eq!(
            body.get(2),
            Some(&Item::list(vec![Item::list(vec![
                Item::u4(7),
                Item::list(vec![Item::u4(20), Item::u4(30)]),
            ])]))
        );

        let fired = next_matching(&mut notifications, |n| matches!(n, Notification::EventFired { .. })).await;
        let Notification::EventFired { ceid, reports, .. } = fired else {
            unreachable!()
        };
        assert_eq!(ceid, 100);
        assert_eq!(reports[0].values[1], (10002, Some(Item::u4(30))));
        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_alarm_reported_once_then_cleared() {
        let (bridge, mut host, source, _dialer) = connected().await;
        host.initialize(100, 7, &[10001]).await;
        wait_initialization(&bridge, InitializationState::Completed).await;

        source.set("M20", PlcValue::Bool(true));
        let set = host.expect_primary(5, 1).await;
        assert_eq!(
            set.body,
            Some(Item::list(vec![
                Item::binary(0x84),
                Item::u4(5001),
                Item::ascii("Overheat"),
            ]))
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bridge.health().active_alarms, vec![5001]);

        source.set("M20", PlcValue::Bool(false));
        let cleared = host.expect_primary(5, 1).await;
        assert_eq!(cleared.body.as_ref().and_then(|b| b.get(0)), Some(&Item::binary(0x04)));
        assert!(bridge.health().active_alarms.is_empty());
        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_equipment_constants() {
        let (bridge, mut host, source, _dialer) = connected().await;
        let reply = host.request(2, 13, Some(Item::list(vec![Item::u4(20001)]))).await;
        assert_eq!(reply.body, Some(Item::list(vec![Item::u4(150)])));

        let out_of_range = Item::list(vec![Item::list(vec![Item::u4(20001), Item::u4(500)])]);
        assert_eq!(host.request(2, 15, Some(out_of_range)).await.body, Some(Item::binary(3)));
        assert_eq!(source.get("D200"), Some(PlcValue::UInt(150)));

        let mut notifications = bridge.subscribe();
        let valid = Item::list(vec![Item::list(vec![Item::u4(20001), Item::u4(200)])]);
        assert_eq!(host.request(2, 15, Some(valid)).await.body, Some(Item::binary(0)));
        assert_eq!(source.get("D200"), Some(PlcValue::UInt(200)));
        let changed = next_matching(&mut notifications, |n| {
            matches!(n, Notification::EquipmentConstantChanged { .. })
        })
        .await;
        assert!(matches!(
            changed,
            Notification::EquipmentConstantChanged { ecid: 20001, .. }
        ));
        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_unrecognized_messages_answer_stream9() {
        let (bridge, mut host, _source, _dialer) = connected().await;
        host.send(99, 1, None).await;
        let s9f3 = host.expect_primary(9, 3).await;
        let Some(Item::Binary(header)) = s9f3.body else {
            panic!("S9F3 without header")
        };
        assert_eq!(header.len(), 10);
        assert_eq!(header[2] & 0x7F, 99);

        host.send(1, 99, None).await;
        let s9f5 = host.expect_primary(9, 5).await;
        let Some(Item::Binary(header)) = s9f5.body else {
            panic!("S9F5 without header")
        };
        assert_eq!(header[3], 99);
        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_link_drop_resets_initialization() {
        let (bridge, mut host, _source, dialer) = connected().await;
        host.initialize(100, 7, &[10001]).await;
        wait_initialization(&bridge, InitializationState::Completed).await;

        host.close();
        wait_initialization(&bridge, InitializationState::NotStarted).await;
        let health = bridge.health();
        assert!(!health.connection_state.is_selected());
        assert_eq!(health.control_state, ControlState::EquipmentOffLine);

        let mut host = HostSimulator::connect(&dialer, 1).await;
        host.initialize(100, 7, &[10001]).await;
        wait_initialization(&bridge, InitializationState::Completed).await;
        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_manual_event_only_for_manual_trigger() {
        let (bridge, mut host, _source, _dialer) = connected().await;
        host.initialize(101, 7, &[10001]).await;
        wait_initialization(&bridge, InitializationState::Completed).await;

        assert!(matches!(
            bridge.trigger_event(100).await,
            Err(SecsError::InvalidData(_))
        ));
        assert!(matches!(
            bridge.trigger_event(999).await,
            Err(SecsError::UnknownIdentifier { kind: IdentifierKind::Ceid, id: 999 })
        ));
        bridge.trigger_event(101).await.unwrap();
        let report = host.expect_primary(6, 11).await;
        assert_eq!(report.body.as_ref().and_then(|b| b.get(1)), Some(&Item::u4(101)));
        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_reload_tracks_enabled_alarms() {
        let source = Arc::new(plc());
        source.set("M21", PlcValue::Bool(false));
        let repository = Arc::new(InMemoryMappingRepository::from_tables(&tables()));
        let (connector, dialer) = MemoryConnector::pair("host");
        let bridge = EquipmentBridge::new(
            device_config(1),
            Arc::new(connector),
            source.clone(),
            repository.clone(),
            64,
        )
        .await
        .unwrap();
        bridge.start().await.unwrap();
        let mut host = HostSimulator::connect(&dialer, 1).await;
        host.initialize(100, 7, &[10001]).await;
        wait_initialization(&bridge, InitializationState::Completed).await;

        repository.upsert(IdentifierDefinition::Alid(AlidDefinition {
            id: 5002,
            name: "DoorOpen".to_string(),
            priority: 0,
            category: 2,
            address: "M21".to_string(),
            auto_clear: true,
            monitored: true,
        }));
        assert!(repository.remove(IdentifierKind::Alid, 5001));
        bridge.reload_definitions().await.unwrap();
        let enabled = bridge.session().enabled_alarms;
        assert!(enabled.contains(&5002));
        assert!(!enabled.contains(&5001));

        source.set("M21", PlcValue::Bool(true));
        let report = host.expect_primary(5, 1).await;
        assert_eq!(
            report.body,
            Some(Item::list(vec![
                Item::binary(0x82),
                Item::u4(5002),
                Item::ascii("DoorOpen"),
            ]))
        );
        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_read_report_in_declared_order() {
        let source = Arc::new(plc());
        source.fail("D100");
        let (bridge, _dialer) = bridge_with(source).await;
        let report = bridge.read_report(1).await.unwrap();
        assert_eq!(report.rptid, 1);
        assert_eq!(report.values, vec![(10001, None)]);
        assert!(report.is_degraded());
        assert!(matches!(
            bridge.read_report(9).await,
            Err(SecsError::UnknownIdentifier { kind: IdentifierKind::Rptid, id: 9 })
        ));
    }

    #[test]
    fn test_equipment_ack() {
        assert_eq!(equipment_ack(&SecsError::OutOfRange("x".into())), 3);
        assert_eq!(equipment_ack(&SecsError::unknown(IdentifierKind::Ecid, 1)), 1);
        assert_eq!(
            equipment_ack(&SecsError::ReadOnlyViolation {
                kind: IdentifierKind::Ecid,
                id: 1
            }),
            1
        );
    }

    #[test]
    fn test_sample_time_format() {
        let stime = sample_time();
        assert_eq!(stime.len(), 16);
        assert!(stime.bytes().all(|b| b.is_ascii_digit()));
    }
}
