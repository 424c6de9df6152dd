//! HSMS connection
//!
//! One [`HsmsConnection`] drives the link to the host for one device. A
//! supervisor task establishes the transport through a [`Connector`],
//! performs the select procedure and reconnects after every fault until
//! the connection is stopped. While a link is up three tasks cooperate:
//!
//! - the reader (inside the supervisor) decodes frames, answers control
//!   messages, completes transactions and forwards primaries
//! - the writer serializes outgoing frames under the T8 bound
//! - the link-test task sends Linktest.req after T6 of silence
//!
//! State changes and inbound primaries are delivered in order on the
//! [`SessionEvent`] channel returned by [`HsmsConnection::new`].

use crate::error::{SecsError, SecsResult};
use crate::hsms::header::{CONTROL_SESSION_ID, HsmsHeader, RejectReason, SType};
use crate::hsms::message::HsmsMessage;
use crate::hsms::state::HsmsConnectionState;
use crate::hsms::statistics::HsmsStatistics;
use crate::hsms::transaction::{ReplyOutcome, TransactionCorrelator};
use parking_lot::Mutex;
use secs_core::{DeviceId, HsmsTimeouts, Item};
use secs_transport::{
    BoxedStream, Connector, DEFAULT_MAX_FRAME_LENGTH, read_frame, write_frame,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Select procedure role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectMode {
    /// Wait for the host's Select.req
    #[default]
    Passive,
    /// Send Select.req after connecting
    Active,
}

/// Per-device HSMS settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HsmsConfig {
    pub device_id: DeviceId,
    pub mode: ConnectMode,
    pub timeouts: HsmsTimeouts,
    /// Consecutive T3 timeouts tolerated before the link is faulted
    pub t3_retry_limit: u32,
    pub max_frame_length: usize,
}

impl Default for HsmsConfig {
    fn default() -> Self {
        Self {
            device_id: 1,
            mode: ConnectMode::Passive,
            timeouts: HsmsTimeouts::default(),
            t3_retry_limit: 3,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl HsmsConfig {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: ConnectMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_timeouts(mut self, timeouts: HsmsTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_t3_retry_limit(mut self, limit: u32) -> Self {
        self.t3_retry_limit = limit;
        self
    }

    pub fn validate(&self) -> SecsResult<()> {
        if self.device_id == 0 {
            return Err(SecsError::Config("device id must not be 0".to_string()));
        }
        if self.device_id == CONTROL_SESSION_ID {
            return Err(SecsError::Config(format!(
                "device id 0x{:04X} is reserved for control messages",
                CONTROL_SESSION_ID
            )));
        }
        if self.max_frame_length < crate::hsms::header::HEADER_LENGTH {
            return Err(SecsError::Config("max_frame_length too small".to_string()));
        }
        self.timeouts.validate()
    }
}

/// Events delivered to the owner of a connection, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        from: HsmsConnectionState,
        to: HsmsConnectionState,
    },
    /// A primary data message from the host
    Primary(HsmsMessage),
}

struct Link {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    token: CancellationToken,
}

struct Running {
    token: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    config: HsmsConfig,
    connector: Arc<dyn Connector>,
    correlator: TransactionCorrelator,
    state: watch::Sender<HsmsConnectionState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    statistics: Mutex<HsmsStatistics>,
    last_error: Mutex<Option<String>>,
    last_activity: Mutex<Instant>,
    not_selected_since: Mutex<Instant>,
    consecutive_timeouts: AtomicU32,
    link: Mutex<Option<Link>>,
    running: Mutex<Option<Running>>,
}

/// Handle to one device's HSMS connection
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct HsmsConnection {
    inner: Arc<Inner>,
}

impl HsmsConnection {
    /// Create an idle connection
    ///
    /// # Returns
    ///
    /// The connection handle and the receiver of its session events
    pub fn new(
        config: HsmsConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(HsmsConnectionState::NotConnected);
        let now = Instant::now();
        let inner = Inner {
            config,
            connector,
            correlator: TransactionCorrelator::new(),
            state,
            events,
            statistics: Mutex::new(HsmsStatistics::new()),
            last_error: Mutex::new(None),
            last_activity: Mutex::new(now),
            not_selected_since: Mutex::new(now),
            consecutive_timeouts: AtomicU32::new(0),
            link: Mutex::new(None),
            running: Mutex::new(None),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.config.device_id
    }

    pub fn config(&self) -> &HsmsConfig {
        &self.inner.config
    }

    pub fn state(&self) -> HsmsConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch the connection state
    pub fn subscribe_state(&self) -> watch::Receiver<HsmsConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn statistics(&self) -> HsmsStatistics {
        self.inner.statistics.lock().clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    pub fn pending_transactions(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Begin listening (passive) or dialing (active)
    ///
    /// Idempotent: calling `start` on a running connection does nothing.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut running = self.inner.running.lock();
        if running.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let inner = self.inner.clone();
        let task = tokio::spawn(supervise(inner, token.clone()));
        *running = Some(Running { token, task });
        log::info!(
            "dev{} HSMS connection started ({})",
            self.device_id(),
            self.inner.connector.describe()
        );
    }

    /// Tear down the transport, force `NotConnected` and cancel all
    /// pending transactions
    ///
    /// Idempotent: stopping a stopped connection does nothing.
    pub async fn stop(&self) {
        let running = self.inner.running.lock().take();
        if let Some(running) = running {
            running.token.cancel();
            if let Err(e) = running.task.await {
                log::error!("dev{} supervisor task failed: {}", self.device_id(), e);
            }
            log::info!("dev{} HSMS connection stopped", self.device_id());
        }
        self.inner.correlator.cancel_all();
        self.inner.set_state(HsmsConnectionState::NotConnected);
    }

    /// Tear down the current link; the supervisor reconnects
    pub fn disconnect(&self, reason: &str) {
        self.inner.fault(reason.to_string());
    }

    /// Send a primary and wait for its reply
    ///
    /// # Arguments
    ///
    /// * `message` - Primary data message; session id, W-bit and system
    ///   bytes are filled in here
    /// * `timeout` - Reply timeout, T3 if `None`
    ///
    /// # Returns
    ///
    /// `ReplyOutcome::NoReply` when the timeout expires. A timeout is not an
    /// error, but more consecutive timeouts than the retry limit fault the
    /// link.
    ///
    /// # Errors
    ///
    /// `SecsError::NotSelected` if the connection is not selected
    pub async fn send_and_await_reply(
        &self,
        mut message: HsmsMessage,
        timeout: Option<Duration>,
    ) -> SecsResult<ReplyOutcome> {
        let inner = &self.inner;
        if !self.state().is_selected() {
            return Err(SecsError::NotSelected);
        }
        let timeout = timeout.unwrap_or(inner.config.timeouts.t3);
        let device_id = inner.config.device_id;
        let pending = inner
            .correlator
            .begin(device_id, message.stream(), message.function(), timeout);
        message.header = HsmsHeader::data(
            device_id,
            message.stream(),
            message.function(),
            true,
            pending.id(),
        );
        let token = inner.transmit(&message)?;
        let outcome = pending.wait(&token).await;

        match &outcome {
            ReplyOutcome::NoReply => {
                inner.statistics.lock().increment_t3_timeouts();
                let count = inner.consecutive_timeouts.fetch_add(1, Ordering::SeqCst) + 1;
                log::warn!(
                    "dev{} no reply to S{}F{} [{:08X}] within {:?} ({} consecutive)",
                    device_id,
                    message.stream(),
                    message.function(),
                    message.system_bytes(),
                    timeout,
                    count
                );
                if count > inner.config.t3_retry_limit {
                    inner.fault(format!("{} consecutive reply timeouts", count));
                }
            }
            ReplyOutcome::Replied(_) => {
                inner.consecutive_timeouts.store(0, Ordering::SeqCst);
            }
            ReplyOutcome::Rejected(reason) => {
                log::warn!(
                    "dev{} S{}F{} rejected by host, reason {}",
                    device_id,
                    message.stream(),
                    message.function(),
                    reason
                );
            }
            ReplyOutcome::Cancelled => {}
        }
        Ok(outcome)
    }

    /// Send a message without recording a transaction
    ///
    /// Replies to host primaries keep their system bytes; other messages
    /// get a fresh transaction id.
    pub fn send_without_reply(&self, mut message: HsmsMessage) -> SecsResult<()> {
        if !self.state().is_selected() {
            return Err(SecsError::NotSelected);
        }
        let device_id = self.inner.config.device_id;
        let system_bytes = if message.is_primary() || message.system_bytes() == 0 {
            self.inner.correlator.next_id()
        } else {
            message.system_bytes()
        };
        message.header = HsmsHeader::data(
            device_id,
            message.stream(),
            message.function(),
            false,
            system_bytes,
        );
        self.inner.transmit(&message).map(|_| ())
    }
}

impl Inner {
    fn device_id(&self) -> DeviceId {
        self.config.device_id
    }

    fn state(&self) -> HsmsConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, to: HsmsConnectionState) {
        let from = self.state.send_replace(to);
        if from == to {
            return;
        }
        if let Err(e) = from.validate_transition(to) {
            log::warn!("dev{} {}", self.device_id(), e);
        }
        if to == HsmsConnectionState::Connected {
            *self.not_selected_since.lock() = Instant::now();
        }
        log::info!("dev{} HSMS {} -> {}", self.device_id(), from, to);
        let _ = self.events.send(SessionEvent::StateChanged { from, to });
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn record_error(&self, reason: String) {
        *self.last_error.lock() = Some(reason);
    }

    /// Record a fault and tear down the current link
    fn fault(&self, reason: String) {
        let link = self.link.lock();
        if let Some(link) = link.as_ref() {
            if !link.token.is_cancelled() {
                log::error!("dev{} link fault: {}", self.device_id(), reason);
                self.record_error(reason);
                link.token.cancel();
            }
        }
    }

    /// Queue a message on the current link's writer
    ///
    /// # Returns
    ///
    /// The link's cancellation token, cancelled when the link goes down
    fn transmit(&self, message: &HsmsMessage) -> SecsResult<CancellationToken> {
        let frame = message.encode()?;
        let link = self.link.lock();
        let link = link.as_ref().ok_or(SecsError::NotSelected)?;
        log::debug!("dev{} >> {}", self.device_id(), message);
        link.outbound.send(frame).map_err(|_| {
            SecsError::Connection(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "link writer closed",
            ))
        })?;
        Ok(link.token.clone())
    }

    fn reject(&self, header: &HsmsHeader, reason: RejectReason) -> SecsResult<()> {
        log::warn!(
            "dev{} rejecting SType {} S{}F{} [{:08X}]: {:?}",
            self.device_id(),
            header.stype,
            header.stream(),
            header.function(),
            header.system_bytes,
            reason
        );
        self.statistics.lock().increment_rejects_sent();
        self.transmit(&HsmsMessage::reject(header, reason)).map(|_| ())
    }

    /// Handle one inbound frame
    ///
    /// # Returns
    ///
    /// `Ok(false)` when the host separated the link
    fn handle_frame(&self, frame: &[u8]) -> SecsResult<bool> {
        self.touch();
        self.statistics.lock().increment_frames_received();

        let header = HsmsHeader::decode(frame)?;
        let Some(stype) = header.message_type() else {
            self.reject(&header, RejectReason::STypeNotSupported)?;
            return Ok(true);
        };
        if header.ptype != 0 && stype != SType::RejectReq {
            self.reject(&header, RejectReason::PTypeNotSupported)?;
            return Ok(true);
        }

        match stype {
            SType::Data => self.handle_data(&header, frame)?,
            SType::SelectReq => {
                let status = match self.state() {
                    HsmsConnectionState::Connected => 0,
                    // already active
                    _ => 1,
                };
                self.transmit(&HsmsMessage::control_response(&header, SType::SelectRsp, status))?;
                if status == 0 {
                    self.set_state(HsmsConnectionState::Selected);
                }
            }
            SType::DeselectReq => {
                let status = if self.state().is_selected() { 0 } else { 1 };
                self.transmit(&HsmsMessage::control_response(&header, SType::DeselectRsp, status))?;
                if status == 0 {
                    self.set_state(HsmsConnectionState::Connected);
                }
            }
            SType::LinktestReq => {
                self.transmit(&HsmsMessage::control_response(&header, SType::LinktestRsp, 0))?;
            }
            SType::SelectRsp | SType::DeselectRsp | SType::LinktestRsp => {
                let message = HsmsMessage { header, body: None };
                if !self.correlator.resolve_reply(message) {
                    self.statistics.lock().increment_unmatched_replies();
                    self.reject(&header, RejectReason::TransactionNotOpen)?;
                }
            }
            SType::RejectReq => {
                self.statistics.lock().increment_rejects_received();
                let message = HsmsMessage { header, body: None };
                if !self.correlator.resolve_reject(&message) {
                    log::warn!(
                        "dev{} Reject.req [{:08X}] reason {} matches no transaction",
                        self.device_id(),
                        header.system_bytes,
                        header.byte3
                    );
                }
            }
            SType::SeparateReq => {
                log::info!("dev{} host sent Separate.req", self.device_id());
                self.record_error("separated by host".to_string());
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn handle_data(&self, header: &HsmsHeader, frame: &[u8]) -> SecsResult<()> {
        if !self.state().is_selected() {
            return self.reject(header, RejectReason::EntityNotSelected);
        }
        let message = match HsmsMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                log::warn!(
                    "dev{} illegal data in S{}F{} [{:08X}], answering S9F7: {}",
                    self.device_id(),
                    header.stream(),
                    header.function(),
                    header.system_bytes,
                    e
                );
                let report = HsmsMessage {
                    header: HsmsHeader::data(self.device_id(), 9, 7, false, self.correlator.next_id()),
                    body: Some(Item::Binary(header.to_bytes().to_vec())),
                };
                return self.transmit(&report).map(|_| ());
            }
        };
        log::debug!("dev{} << {}", self.device_id(), message);

        if message.is_primary() {
            let _ = self.events.send(SessionEvent::Primary(message));
        } else if self.correlator.resolve_reply(message) {
            self.consecutive_timeouts.store(0, Ordering::SeqCst);
        } else {
            self.statistics.lock().increment_unmatched_replies();
            log::warn!(
                "dev{} discarding unmatched reply S{}F{} [{:08X}]",
                self.device_id(),
                header.stream(),
                header.function(),
                header.system_bytes
            );
        }
        Ok(())
    }
}

/// Connect, run the link, reconnect; until cancelled
async fn supervise(inner: Arc<Inner>, token: CancellationToken) {
    let t5 = inner.config.timeouts.t5;
    let mut separation = false;

    while !token.is_cancelled() {
        if separation {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(t5) => {}
            }
        }

        inner.set_state(HsmsConnectionState::Connecting);
        let connected = match inner.config.mode {
            ConnectMode::Active => tokio::select! {
                _ = token.cancelled() => break,
                result = tokio::time::timeout(t5, inner.connector.connect()) => result
                    .unwrap_or_else(|_| Err(SecsError::Timeout("T5 connect timeout".to_string()))),
            },
            ConnectMode::Passive => tokio::select! {
                _ = token.cancelled() => break,
                result = inner.connector.connect() => result,
            },
        };

        match connected {
            Ok(stream) => {
                run_link(&inner, stream, &token).await;
                // active side waits T5 before dialing again
                separation = inner.config.mode == ConnectMode::Active;
            }
            Err(e) => {
                log::warn!(
                    "dev{} connect via {} failed: {}",
                    inner.device_id(),
                    inner.connector.describe(),
                    e
                );
                inner.record_error(e.to_string());
                inner.set_state(HsmsConnectionState::NotConnected);
                separation = true;
            }
        }
    }
    inner.set_state(HsmsConnectionState::NotConnected);
}

async fn run_link(inner: &Arc<Inner>, stream: BoxedStream, token: &CancellationToken) {
    let link_token = token.child_token();
    let (reader, writer) = tokio::io::split(stream);
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    *inner.link.lock() = Some(Link {
        outbound,
        token: link_token.clone(),
    });
    inner.statistics.lock().increment_connects();
    inner.consecutive_timeouts.store(0, Ordering::SeqCst);
    inner.touch();
    inner.set_state(HsmsConnectionState::Connected);

    let writer_task = tokio::spawn(write_loop(inner.clone(), writer, outbound_rx, link_token.clone()));
    let linktest_task = tokio::spawn(linktest_loop(inner.clone(), link_token.clone()));
    let select_task = match inner.config.mode {
        ConnectMode::Active => Some(tokio::spawn(select_procedure(inner.clone(), link_token.clone()))),
        ConnectMode::Passive => None,
    };

    match read_loop(inner, reader, &link_token).await {
        Ok(()) => {}
        Err(e) => {
            if !link_token.is_cancelled() {
                log::error!("dev{} link lost: {}", inner.device_id(), e);
                inner.record_error(e.to_string());
            }
        }
    }

    link_token.cancel();
    *inner.link.lock() = None;
    for task in [Some(writer_task), Some(linktest_task), select_task].into_iter().flatten() {
        let _ = task.await;
    }
    let cancelled = inner.correlator.cancel_all();
    if cancelled > 0 {
        log::warn!("dev{} cancelled {} pending transactions", inner.device_id(), cancelled);
    }
    inner.statistics.lock().increment_disconnects();
    inner.set_state(HsmsConnectionState::NotConnected);
}

async fn read_loop(
    inner: &Arc<Inner>,
    mut reader: ReadHalf<BoxedStream>,
    link_token: &CancellationToken,
) -> SecsResult<()> {
    let t7 = inner.config.timeouts.t7;
    let t8 = inner.config.timeouts.t8;
    let max = inner.config.max_frame_length;

    loop {
        // a frame read is only dropped with the link; T7 wakeups re-poll it
        let read = read_frame(&mut reader, t8, max);
        tokio::pin!(read);
        let frame = loop {
            let awaiting_select = inner.state() == HsmsConnectionState::Connected;
            let t7_deadline = *inner.not_selected_since.lock() + t7;
            tokio::select! {
                _ = link_token.cancelled() => return Ok(()),
                _ = tokio::time::sleep_until(t7_deadline), if awaiting_select => {
                    if inner.state() == HsmsConnectionState::Connected {
                        return Err(SecsError::Timeout("T7 not selected".to_string()));
                    }
                }
                frame = &mut read => break frame?,
            }
        };

        match frame {
            Some(frame) => {
                if !inner.handle_frame(&frame)? {
                    return Ok(());
                }
            }
            None => {
                return Err(SecsError::Connection(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "connection closed by host",
                )));
            }
        }
    }
}

async fn write_loop(
    inner: Arc<Inner>,
    mut writer: WriteHalf<BoxedStream>,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    link_token: CancellationToken,
) {
    let t8 = inner.config.timeouts.t8;
    loop {
        let frame = tokio::select! {
            _ = link_token.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        match write_frame(&mut writer, &frame, t8).await {
            Ok(()) => {
                inner.statistics.lock().increment_frames_sent();
                inner.touch();
            }
            Err(e) => {
                inner.fault(format!("write failed: {}", e));
                break;
            }
        }
    }
}

async fn linktest_loop(inner: Arc<Inner>, link_token: CancellationToken) {
    let t6 = inner.config.timeouts.t6;
    let mut state = inner.state.subscribe();

    loop {
        if !state.borrow_and_update().is_selected() {
            tokio::select! {
                _ = link_token.cancelled() => return,
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
            }
        }

        let due = *inner.last_activity.lock() + t6;
        tokio::select! {
            _ = link_token.cancelled() => return,
            _ = tokio::time::sleep_until(due) => {}
        }
        if !inner.state().is_selected() || inner.last_activity.lock().elapsed() < t6 {
            continue;
        }

        let pending = inner.correlator.begin(CONTROL_SESSION_ID, 0, 0, t6);
        inner.statistics.lock().increment_linktests_sent();
        let request = HsmsMessage::control(SType::LinktestReq, pending.id());
        if inner.transmit(&request).is_err() {
            return;
        }
        match pending.wait(&link_token).await {
            ReplyOutcome::Replied(_) => {}
            ReplyOutcome::Cancelled => return,
            ReplyOutcome::NoReply | ReplyOutcome::Rejected(_) => {
                inner.statistics.lock().increment_linktest_failures();
                inner.fault("Linktest.rsp not received within T6".to_string());
                return;
            }
        }
    }
}

/// Active side: send Select.req and wait T6 for a successful Select.rsp
async fn select_procedure(inner: Arc<Inner>, link_token: CancellationToken) {
    let pending = inner
        .correlator
        .begin(CONTROL_SESSION_ID, 0, 0, inner.config.timeouts.t6);
    let request = HsmsMessage::control(SType::SelectReq, pending.id());
    if inner.transmit(&request).is_err() {
        return;
    }
    match pending.wait(&link_token).await {
        ReplyOutcome::Replied(rsp) if rsp.header.byte3 == 0 => {
            if inner.state() == HsmsConnectionState::Connected {
                inner.set_state(HsmsConnectionState::Selected);
            }
        }
        ReplyOutcome::Replied(rsp) => {
            inner.fault(format!("Select.rsp status {}", rsp.header.byte3));
        }
        ReplyOutcome::NoReply => inner.fault("Select.rsp not received within T6".to_string()),
        ReplyOutcome::Rejected(reason) => inner.fault(format!("Select.req rejected, reason {}", reason)),
        ReplyOutcome::Cancelled => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secs_transport::{MemoryConnector, MemoryDialer};
    use tokio::io::{AsyncWriteExt, DuplexStream};

    const WAIT: Duration = Duration::from_secs(2);

    fn fast_timeouts() -> HsmsTimeouts {
        HsmsTimeouts::default()
            .with_t3(Duration::from_millis(200))
            .with_t5(Duration::from_millis(50))
            .with_t6(Duration::from_secs(5))
            .with_t7(Duration::from_secs(5))
            .with_t8(Duration::from_secs(1))
    }

    async fn send(host: &mut DuplexStream, message: &HsmsMessage) {
        write_frame(host, &message.encode().unwrap(), WAIT).await.unwrap();
    }

    async fn recv(host: &mut DuplexStream) -> HsmsMessage {
        let frame = tokio::time::timeout(WAIT, read_frame(host, WAIT, DEFAULT_MAX_FRAME_LENGTH))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        HsmsMessage::decode(&frame).unwrap()
    }

    async fn wait_state(connection: &HsmsConnection, state: HsmsConnectionState) {
        let mut rx = connection.subscribe_state();
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
            .await
            .unwrap()
            .unwrap();
    }

    async fn selected_pair(
        timeouts: HsmsTimeouts,
    ) -> (
        HsmsConnection,
        mpsc::UnboundedReceiver<SessionEvent>,
        DuplexStream,
        MemoryDialer,
    ) {
        let (connector, dialer) = MemoryConnector::pair("dev1");
        let config = HsmsConfig::new(1).with_timeouts(timeouts);
        let (connection, events) = HsmsConnection::new(config, Arc::new(connector));
        connection.start();
        let mut host = dialer.dial().unwrap();
        wait_state(&connection, HsmsConnectionState::Connected).await;

        send(&mut host, &HsmsMessage::control(SType::SelectReq, 1)).await;
        let rsp = recv(&mut host).await;
        assert_eq!(rsp.message_type(), Some(SType::SelectRsp));
        assert_eq!(rsp.header.byte3, 0);
        wait_state(&connection, HsmsConnectionState::Selected).await;
        (connection, events, host, dialer)
    }

    #[test]
    fn test_config_validation() {
        assert!(HsmsConfig::new(1).validate().is_ok());
        assert!(HsmsConfig::new(0).validate().is_err());
        assert!(HsmsConfig::new(CONTROL_SESSION_ID).validate().is_err());
        let zero_t3 = HsmsTimeouts::default().with_t3(Duration::ZERO);
        assert!(HsmsConfig::new(1).with_timeouts(zero_t3).validate().is_err());
    }

    #[tokio::test]
    async fn test_passive_select_and_state_events() {
        let (connection, mut events, _host, _dialer) = selected_pair(fast_timeouts()).await;
        let mut seen = Vec::new();
        while let Ok(SessionEvent::StateChanged { to, .. }) = events.try_recv() {
            seen.push(to);
        }
        assert_eq!(
            seen,
            vec![
                HsmsConnectionState::Connecting,
                HsmsConnectionState::Connected,
                HsmsConnectionState::Selected
            ]
        );
        connection.stop().await;
    }

    #[tokio::test]
    async fn test_send_and_await_reply() {
        let (connection, _events, mut host, _dialer) = selected_pair(fast_timeouts()).await;
        let sender = connection.clone();
        let request = tokio::spawn(async move {
            sender
                .send_and_await_reply(HsmsMessage::primary(1, 1, Item::empty_list()), None)
                .await
        });

        let primary = recv(&mut host).await;
        assert_eq!(primary.device_id(), 1);
        assert!(primary.reply_expected());
        assert_ne!(primary.system_bytes(), 0);
        send(&mut host, &HsmsMessage::reply_to(&primary, Some(Item::empty_list()))).await;

        let outcome = request.await.unwrap().unwrap();
        let reply = outcome.into_reply().unwrap();
        assert_eq!(reply.function(), 2);
        connection.stop().await;
    }

    #[tokio::test]
    async fn test_no_reply_keeps_selected() {
        let (connection, _events, mut host, _dialer) = selected_pair(fast_timeouts()).await;
        let outcome = connection
            .send_and_await_reply(HsmsMessage::primary(1, 1, Item::empty_list()), None)
            .await
            .unwrap();
        assert_eq!(outcome, ReplyOutcome::NoReply);
        assert_eq!(connection.state(), HsmsConnectionState::Selected);
        assert_eq!(connection.statistics().t3_timeouts, 1);
        let _ = recv(&mut host).await;
        connection.stop().await;
    }

    #[tokio::test]
    async fn test_retry_limit_faults_link() {
        let timeouts = fast_timeouts().with_t3(Duration::from_millis(50));
        let (connection, _events, _host, _dialer) = selected_pair(timeouts).await;
        for _ in 0..4 {
            let _ = connection
                .send_and_await_reply(HsmsMessage::primary(1, 1, Item::empty_list()), None)
                .await;
        }
        wait_state(&connection, HsmsConnectionState::Connecting).await;
        assert!(connection.last_error().unwrap().contains("reply timeouts"));
        connection.stop().await;
    }

    #[tokio::test]
    async fn test_unmatched_reply_discarded() {
        let (connection, _events, mut host, _dialer) = selected_pair(fast_timeouts()).await;
        let mut stray = HsmsMessage::data(1, 2, false, None);
        stray.header.session_id = 1;
        stray.header.system_bytes = 0xABCD;
        send(&mut host, &stray).await;

        // link test proves the reader is still alive
        send(&mut host, &HsmsMessage::control(SType::LinktestReq, 77)).await;
        let rsp = recv(&mut host).await;
        assert_eq!(rsp.message_type(), Some(SType::LinktestRsp));
        assert_eq!(rsp.system_bytes(), 77);
        assert_eq!(connection.statistics().unmatched_replies, 1);
        assert_eq!(connection.state(), HsmsConnectionState::Selected);
        connection.stop().await;
    }

    #[tokio::test]
    async fn test_primary_forwarded_as_event() {
        let (connection, mut events, mut host, _dialer) = selected_pair(fast_timeouts()).await;
        let mut primary = HsmsMessage::primary(1, 13, Item::empty_list());
        primary.header.session_id = 1;
        primary.header.system_bytes = 5;
        send(&mut host, &primary).await;

        let event = tokio::time::timeout(WAIT, async {
            loop {
                if let Some(SessionEvent::Primary(msg)) = events.recv().await {
                    return msg;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event.function(), 13);
        connection.stop().await;
    }

    #[tokio::test]
    async fn test_data_before_select_rejected() {
        let (connector, dialer) = MemoryConnector::pair("dev1");
        let config = HsmsConfig::new(1).with_timeouts(fast_timeouts());
        let (connection, _events) = HsmsConnection::new(config, Arc::new(connector));
        connection.start();
        let mut host = dialer.dial().unwrap();
        wait_state(&connection, HsmsConnectionState::Connected).await;

        let mut primary = HsmsMessage::primary(1, 1, Item::empty_list());
        primary.header.session_id = 1;
        primary.header.system_bytes = 9;
        send(&mut host, &primary).await;
        let reject = recv(&mut host).await;
        assert_eq!(reject.message_type(), Some(SType::RejectReq));
        assert_eq!(reject.header.byte3, RejectReason::EntityNotSelected as u8);
        assert_eq!(reject.system_bytes(), 9);
        connection.stop().await;
    }

    #[tokio::test]
    async fn test_t7_disconnects_unselected_link() {
        let timeouts = fast_timeouts().with_t7(Duration::from_millis(100));
        let (connector, dialer) = MemoryConnector::pair("dev1");
        let config = HsmsConfig::new(1).with_timeouts(timeouts);
        let (connection, _events) = HsmsConnection::new(config, Arc::new(connector));
        connection.start();
        let mut host = dialer.dial().unwrap();
        wait_state(&connection, HsmsConnectionState::Connected).await;
        wait_state(&connection, HsmsConnectionState::Connecting).await;
        assert!(connection.last_error().unwrap().contains("T7"));
        let eof = read_frame(&mut host, WAIT, DEFAULT_MAX_FRAME_LENGTH).await.unwrap();
        assert!(eof.is_none());
        connection.stop().await;
    }

    #[tokio::test]
    async fn test_linktest_sent_when_idle() {
        let timeouts = fast_timeouts().with_t6(Duration::from_millis(100));
        let (connection, _events, mut host, _dialer) = selected_pair(timeouts).await;
        let request = recv(&mut host).await;
        assert_eq!(request.message_type(), Some(SType::LinktestReq));
        send(
            &mut host,
            &HsmsMessage::control_response(&request.header, SType::LinktestRsp, 0),
        )
        .await;
        let again = recv(&mut host).await;
        assert_eq!(again.message_type(), Some(SType::LinktestReq));
        assert_eq!(connection.state(), HsmsConnectionState::Selected);
        connection.stop().await;
    }

    #[tokio::test]
    async fn test_linktest_failure_faults_link() {
        let timeouts = fast_timeouts().with_t6(Duration::from_millis(100));
        let (connection, _events, mut host, _dialer) = selected_pair(timeouts).await;
        let request = recv(&mut host).await;
        assert_eq!(request.message_type(), Some(SType::LinktestReq));
        wait_state(&connection, HsmsConnectionState::Connecting).await;
        assert_eq!(connection.statistics().linktest_failures, 1);
        connection.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_cancels() {
        let (connection, _events, _host, _dialer) = selected_pair(fast_timeouts()).await;
        let sender = connection.clone();
        let request = tokio::spawn(async move {
            sender
                .send_and_await_reply(HsmsMessage::primary(1, 1, Item::empty_list()), Some(WAIT))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        connection.stop().await;
        connection.stop().await;
        assert_eq!(request.await.unwrap().unwrap(), ReplyOutcome::Cancelled);
        assert_eq!(connection.state(), HsmsConnectionState::NotConnected);
        assert!(!connection.is_running());
        assert!(matches!(
            connection.send_without_reply(HsmsMessage::data(6, 11, false, None)),
            Err(SecsError::NotSelected)
        ));
    }

    #[tokio::test]
    async fn test_separate_and_reconnect() {
        let (connector, dialer) = MemoryConnector::pair("dev1");
        let config = HsmsConfig::new(1).with_timeouts(fast_timeouts());
        let (connection, _events) = HsmsConnection::new(config, Arc::new(connector));
        connection.start();

        let mut host = dialer.dial().unwrap();
        wait_state(&connection, HsmsConnectionState::Connected).await;
        send(&mut host, &HsmsMessage::control(SType::SeparateReq, 3)).await;
        wait_state(&connection, HsmsConnectionState::Connecting).await;

        let mut host = dialer.dial().unwrap();
        wait_state(&connection, HsmsConnectionState::Connected).await;
        send(&mut host, &HsmsMessage::control(SType::SelectReq, 4)).await;
        assert_eq!(recv(&mut host).await.header.byte3, 0);
        wait_state(&connection, HsmsConnectionState::Selected).await;
        assert_eq!(connection.statistics().connects, 2);
        connection.stop().await;
    }

    #[tokio::test]
    async fn test_active_mode_sends_select() {
        let (connector, dialer) = MemoryConnector::pair("dev1");
        let config = HsmsConfig::new(1)
            .with_mode(ConnectMode::Active)
            .with_timeouts(fast_timeouts());
        let (connection, _events) = HsmsConnection::new(config, Arc::new(connector));
        let mut host = dialer.dial().unwrap();
        connection.start();

        let request = recv(&mut host).await;
        assert_eq!(request.message_type(), Some(SType::SelectReq));
        send(
            &mut host,
            &HsmsMessage::control_response(&request.header, SType::SelectRsp, 0),
        )
        .await;
        wait_state(&connection, HsmsConnectionState::Selected).await;
        connection.stop().await;
    }

    #[tokio::test]
    async fn test_frame_split_across_t7_deadline() {
        let timeouts = fast_timeouts().with_t7(Duration::from_millis(300));
        let (connector, dialer) = MemoryConnector::pair("dev1");
        let config = HsmsConfig::new(1)
            .with_mode(ConnectMode::Active)
            .with_timeouts(timeouts);
        let (connection, _events) = HsmsConnection::new(config, Arc::new(connector));
        let mut host = dialer.dial().unwrap();
        connection.start();

        let request = recv(&mut host).await;
        send(
            &mut host,
            &HsmsMessage::control_response(&request.header, SType::SelectRsp, 0),
        )
        .await;
        wait_state(&connection, HsmsConnectionState::Selected).await;

        let linktest = HsmsMessage::control(SType::LinktestReq, 21).encode().unwrap();
        host.write_all(&(linktest.len() as u32).to_be_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        host.write_all(&linktest).await.unwrap();

        let rsp = recv(&mut host).await;
        assert_eq!(rsp.message_type(), Some(SType::LinktestRsp));
        assert_eq!(rsp.system_bytes(), 21);
        assert_eq!(connection.state(), HsmsConnectionState::Selected);
        assert!(connection.last_error().is_none());
        connection.stop().await;
    }

    #[tokio::test]
    async fn test_illegal_data_answers_s9f7() {
        let (connection, mut events, mut host, _dialer) = selected_pair(fast_timeouts()).await;
        let header = HsmsHeader::data(1, 1, 3, true, 42);
        let mut frame = header.to_bytes().to_vec();
        frame.push(0x40);
        write_frame(&mut host, &frame, WAIT).await.unwrap();

        let report = recv(&mut host).await;
        assert_eq!((report.stream(), report.function()), (9, 7));
        assert!(!report.reply_expected());
        assert_eq!(report.body, Some(Item::Binary(header.to_bytes().to_vec())));
        assert_eq!(connection.state(), HsmsConnectionState::Selected);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, SessionEvent::Primary(_)));
        }
        connection.stop().await;
    }
}
