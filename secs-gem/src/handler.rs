//! Stream/function handlers for host primaries
//!
//! A handler is a plain function over the device's [`GemSession`] and the
//! message body. It answers directly with a reply body, or asks the bridge
//! to complete the reply through the identifier resolver when PLC values
//! are needed. Side effects the bridge must act on are returned alongside.

use crate::control::{CommunicationState, ControlState};
use crate::session::{GemSession, TraceDefinition};
use secs_core::{Alid, Ceid, Ecid, Item, Rptid, Svid};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Traces that may run at the same time
pub const MAX_TRACES: usize = 16;

/// Variables one trace may sample
pub const MAX_TRACE_VARIABLES: usize = 64;

/// Handler for one stream/function pair
pub type Handler = fn(&mut GemSession, Option<&Item>) -> HandlerOutcome;

/// Reply body requiring resolver access
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveRequest {
    /// S1F4: current values of these status variables
    StatusVariables(Vec<Svid>),
    /// S2F14: current values of these equipment constants
    EquipmentConstants(Vec<Ecid>),
    /// S2F16: validate and write these equipment constants
    ApplyConstants(Vec<(Ecid, Item)>),
    /// S6F16: event report for a collection event
    EventReport(Ceid),
    /// S6F20: one report
    IndividualReport(Rptid),
    /// S5F6: alarm data for these alarms
    AlarmList(Vec<Alid>),
}

/// How a primary is answered
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// No reply is sent
    None,
    /// Reply with this body
    Body(Item),
    /// The bridge builds the reply
    Resolve(ResolveRequest),
}

/// Side effect of a handler the bridge acts on
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    CommunicationEstablished,
    ControlStateChanged { from: ControlState, to: ControlState },
    ReportsChanged,
    EventLinksChanged,
    EventsEnabledChanged,
    TraceStarted(u32),
    TraceStopped(u32),
    AlarmEnableChanged { alid: Alid, enabled: bool },
}

/// Result of a handler
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutcome {
    pub reply: Reply,
    pub effects: Vec<Effect>,
}

impl HandlerOutcome {
    pub fn reply(body: Item) -> Self {
        Self {
            reply: Reply::Body(body),
            effects: Vec::new(),
        }
    }

    pub fn resolve(request: ResolveRequest) -> Self {
        Self {
            reply: Reply::Resolve(request),
            effects: Vec::new(),
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Result of dispatching a primary
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Handled(HandlerOutcome),
    /// No handler for any function of the stream (answer S9F3)
    UnrecognizedStream,
    /// The stream is known but not the function (answer S9F5)
    UnrecognizedFunction,
}

/// Maps (stream, function) to handlers
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<(u8, u8), Handler>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Create a registry with every built-in GEM handler
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(1, 1, are_you_there);
        registry.register(1, 3, selected_status);
        registry.register(1, 11, status_namelist);
        registry.register(1, 13, establish_communication);
        registry.register(1, 15, request_offline);
        registry.register(1, 17, request_online);
        registry.register(2, 13, equipment_constant_request);
        registry.register(2, 15, new_equipment_constants);
        registry.register(2, 23, trace_initialize);
        registry.register(2, 33, define_reports);
        registry.register(2, 35, link_event_reports);
        registry.register(2, 37, enable_event_reports);
        registry.register(5, 3, enable_alarm);
        registry.register(5, 5, list_alarms);
        registry.register(6, 15, event_report_request);
        registry.register(6, 19, individual_report_request);
        registry
    }

    /// Register a handler, returning the one it replaces
    pub fn register(&mut self, stream: u8, function: u8, handler: Handler) -> Option<Handler> {
        self.handlers.insert((stream, function), handler)
    }

    pub fn supports_stream(&self, stream: u8) -> bool {
        self.handlers.keys().any(|(s, _)| *s == stream)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler for a primary
    pub fn dispatch(
        &self,
        session: &mut GemSession,
        stream: u8,
        function: u8,
        body: Option<&Item>,
    ) -> Dispatch {
        match self.handlers.get(&(stream, function)) {
            Some(handler) => Dispatch::Handled(handler(session, body)),
            None if self.supports_stream(stream) => Dispatch::UnrecognizedFunction,
            None => Dispatch::UnrecognizedStream,
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Identifier list: a list of integer items or an integer array
fn id_list(body: Option<&Item>) -> Option<Vec<u32>> {
    match body {
        None => Some(Vec::new()),
        Some(Item::List(items)) => items.iter().map(Item::as_u32).collect(),
        Some(Item::U1(v)) => Some(v.iter().map(|x| u32::from(*x)).collect()),
        Some(Item::U2(v)) => Some(v.iter().map(|x| u32::from(*x)).collect()),
        Some(Item::U4(v)) => Some(v.clone()),
        Some(other) => other.as_u32().map(|id| vec![id]),
    }
}

fn ack(code: u8) -> HandlerOutcome {
    HandlerOutcome::reply(Item::binary(code))
}

fn model_item(session: &GemSession) -> Item {
    Item::list(vec![
        Item::ascii(session.model_name.clone()),
        Item::ascii(session.software_revision.clone()),
    ])
}

/// S1F1 -> S1F2
fn are_you_there(session: &mut GemSession, _body: Option<&Item>) -> HandlerOutcome {
    HandlerOutcome::reply(model_item(session))
}

/// S1F3 -> S1F4; empty list requests every status variable
fn selected_status(session: &mut GemSession, body: Option<&Item>) -> HandlerOutcome {
    let svids = match id_list(body) {
        Some(ids) if ids.is_empty() => session.directory.svids.keys().copied().collect(),
        Some(ids) => ids,
        None => return HandlerOutcome::reply(Item::empty_list()),
    };
    HandlerOutcome::resolve(ResolveRequest::StatusVariables(svids))
}

/// S1F11 -> S1F12; unknown SVIDs answer with empty name and units
fn status_namelist(session: &mut GemSession, body: Option<&Item>) -> HandlerOutcome {
    let svids: Vec<Svid> = match id_list(body) {
        Some(ids) if ids.is_empty() => session.directory.svids.keys().copied().collect(),
        Some(ids) => ids,
        None => return HandlerOutcome::reply(Item::empty_list()),
    };
    let entries = svids
        .into_iter()
        .map(|svid| {
            let info = session.directory.svids.get(&svid).cloned().unwrap_or_default();
            Item::list(vec![Item::u4(svid), Item::ascii(info.name), Item::ascii(info.units)])
        })
        .collect();
    HandlerOutcome::reply(Item::list(entries))
}

/// S1F13 -> S1F14, COMMACK 0
fn establish_communication(session: &mut GemSession, _body: Option<&Item>) -> HandlerOutcome {
    session.communication_state = CommunicationState::Communicating;
    session.progress.communication_established = true;
    HandlerOutcome::reply(Item::list(vec![Item::binary(0), model_item(session)]))
        .with_effect(Effect::CommunicationEstablished)
}

/// S1F15 -> S1F16, OFLACK 0
fn request_offline(session: &mut GemSession, _body: Option<&Item>) -> HandlerOutcome {
    let mut outcome = ack(0);
    if let Some(from) = session.set_control_state(ControlState::HostOffLine) {
        outcome = outcome.with_effect(Effect::ControlStateChanged {
            from,
            to: ControlState::HostOffLine,
        });
    }
    outcome
}

/// S1F17 -> S1F18, ONLACK 0 accepted, 2 already on-line
fn request_online(session: &mut GemSession, _body: Option<&Item>) -> HandlerOutcome {
    session.progress.online_requested = true;
    if session.control_state.is_online() {
        return ack(2);
    }
    let to = ControlState::online(session.control_mode);
    let mut outcome = ack(0);
    if let Some(from) = session.set_control_state(to) {
        outcome = outcome.with_effect(Effect::ControlStateChanged { from, to });
    }
    outcome
}

/// S2F13 -> S2F14; empty list requests every equipment constant
fn equipment_constant_request(session: &mut GemSession, body: Option<&Item>) -> HandlerOutcome {
    let ecids = match id_list(body) {
        Some(ids) if ids.is_empty() => session.directory.ecids.keys().copied().collect(),
        Some(ids) => ids,
        None => return HandlerOutcome::reply(Item::empty_list()),
    };
    HandlerOutcome::resolve(ResolveRequest::EquipmentConstants(ecids))
}

/// S2F15 -> S2F16; a malformed body is denied with EAC 1
fn new_equipment_constants(_session: &mut GemSession, body: Option<&Item>) -> HandlerOutcome {
    let parsed: Option<Vec<(Ecid, Item)>> = body
        .and_then(Item::as_list)
        .map(|entries| {
            entries
                .iter()
                .map(|entry| {
                    let ecid = entry.get(0)?.as_u32()?;
                    let value = entry.get(1)?.clone();
                    Some((ecid, value))
                })
                .collect()
        })
        .unwrap_or(None);
    match parsed {
        Some(values) => HandlerOutcome::resolve(ResolveRequest::ApplyConstants(values)),
        None => ack(1),
    }
}

/// Parse a DSPER of the form `hhmmss` or `hhmmsscc`
fn parse_period(dsper: &str) -> Option<Duration> {
    if !matches!(dsper.len(), 6 | 8) || !dsper.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let field = |range: std::ops::Range<usize>| dsper[range].parse::<u64>().ok();
    let hours = field(0..2)?;
    let minutes = field(2..4)?;
    let seconds = field(4..6)?;
    let centis = if dsper.len() == 8 { field(6..8)? } else { 0 };
    if minutes > 59 || seconds > 59 {
        return None;
    }
    let period = Duration::from_secs(hours * 3600 + minutes * 60 + seconds)
        + Duration::from_millis(centis * 10);
    (!period.is_zero()).then_some(period)
}

/// S2F23 -> S2F24 TIAACK
///
/// 0 ok, 1 too many SVIDs, 2 no more traces allowed, 3 invalid period,
/// 4 unknown SVID, 5 bad REPGSZ. TOTSMP 0 stops the trace.
fn trace_initialize(session: &mut GemSession, body: Option<&Item>) -> HandlerOutcome {
    let parsed = body.and_then(|b| {
        Some((
            b.get(0)?.as_u32()?,
            b.get(1)?.as_ascii()?.to_string(),
            b.get(2)?.as_u32()?,
            b.get(3)?.as_u32()?,
            id_list(b.get(4))?,
        ))
    });
    let Some((trid, dsper, total_samples, group_size, svids)) = parsed else {
        return ack(3);
    };

    if total_samples == 0 {
        session.progress.traces_initialized = true;
        return match session.traces.remove(&trid) {
            Some(_) => ack(0).with_effect(Effect::TraceStopped(trid)),
            None => ack(0),
        };
    }
    let Some(period) = parse_period(&dsper) else {
        return ack(3);
    };
    if svids.len() > MAX_TRACE_VARIABLES {
        return ack(1);
    }
    if !session.traces.contains_key(&trid) && session.traces.len() >= MAX_TRACES {
        return ack(2);
    }
    if svids.iter().any(|svid| !session.directory.svids.contains_key(svid)) {
        return ack(4);
    }
    if group_size == 0 || group_size > total_samples {
        return ack(5);
    }

    session.traces.insert(
        trid,
        TraceDefinition {
            trid,
            period,
            total_samples,
            group_size,
            svids,
        },
    );
    session.progress.traces_initialized = true;
    ack(0).with_effect(Effect::TraceStarted(trid))
}

/// S2F33 -> S2F34 DRACK
///
/// 0 ok, 2 invalid format, 3 RPTID already defined, 4 unknown VID. An empty
/// report list deletes every report; a report with no variables deletes
/// that report. Nothing changes unless the whole message is accepted.
fn define_reports(session: &mut GemSession, body: Option<&Item>) -> HandlerOutcome {
    let parsed: Option<Vec<(Rptid, Vec<Svid>)>> = body
        .and_then(|b| b.get(1))
        .and_then(Item::as_list)
        .map(|reports| {
            reports
                .iter()
                .map(|report| Some((report.get(0)?.as_u32()?, id_list(report.get(1))?)))
                .collect()
        })
        .unwrap_or(None);
    let Some(definitions) = parsed else {
        return ack(2);
    };

    if definitions.is_empty() {
        session.reports.clear();
        session.event_links.clear();
        session.progress.reports_defined = true;
        return ack(0).with_effect(Effect::ReportsChanged);
    }

    let mut seen = BTreeSet::new();
    for (rptid, svids) in &definitions {
        if !seen.insert(*rptid) || (!svids.is_empty() && session.reports.contains_key(rptid)) {
            return ack(3);
        }
        if svids.iter().any(|svid| !session.directory.svids.contains_key(svid)) {
            return ack(4);
        }
    }

    for (rptid, svids) in definitions {
        if svids.is_empty() {
            session.reports.remove(&rptid);
            for links in session.event_links.values_mut() {
                links.retain(|linked| *linked != rptid);
            }
        } else {
            session.reports.insert(rptid, svids);
        }
    }
    session.progress.reports_defined = true;
    ack(0).with_effect(Effect::ReportsChanged)
}

/// S2F35 -> S2F36 LRACK
///
/// 0 ok, 2 invalid format, 3 unknown CEID, 4 unknown RPTID, 5 CEID already
/// linked. An empty report list removes the event's links.
fn link_event_reports(session: &mut GemSession, body: Option<&Item>) -> HandlerOutcome {
    let parsed: Option<Vec<(Ceid, Vec<Rptid>)>> = body
        .and_then(|b| b.get(1))
        .and_then(Item::as_list)
        .map(|links| {
            links
                .iter()
                .map(|link| Some((link.get(0)?.as_u32()?, id_list(link.get(1))?)))
                .collect()
        })
        .unwrap_or(None);
    let Some(links) = parsed else {
        return ack(2);
    };
    for (ceid, rptids) in &links {
        if !session.directory.ceids.contains(ceid) {
            return ack(3);
        }
        if rptids.iter().any(|rptid| !session.reports.contains_key(rptid)) {
            return ack(4);
        }
        let already_linked = session
            .event_links
            .get(ceid)
            .is_some_and(|existing| !existing.is_empty());
        if !rptids.is_empty() && already_linked {
            return ack(5);
        }
    }

    for (ceid, rptids) in links {
        if rptids.is_empty() {
            session.event_links.remove(&ceid);
        } else {
            session.event_links.insert(ceid, rptids);
        }
    }
    session.progress.links_defined = true;
    ack(0).with_effect(Effect::EventLinksChanged)
}

/// S2F37 -> S2F38 ERACK
///
/// 0 ok, 1 unknown CEID. An empty CEID list applies to every event.
fn enable_event_reports(session: &mut GemSession, body: Option<&Item>) -> HandlerOutcome {
    let parsed = body.and_then(|b| Some((b.get(0)?.as_bool()?, id_list(b.get(1))?)));
    let Some((enable, ceids)) = parsed else {
        return ack(1);
    };
    let targets: Vec<Ceid> = if ceids.is_empty() {
        session.directory.ceids.iter().copied().collect()
    } else {
        if ceids.iter().any(|ceid| !session.directory.ceids.contains(ceid)) {
            return ack(1);
        }
        ceids
    };
    for ceid in targets {
        if enable {
            session.enabled_events.insert(ceid);
        } else {
            session.enabled_events.remove(&ceid);
        }
    }
    session.progress.events_enabled = true;
    ack(0).with_effect(Effect::EventsEnabledChanged)
}

/// S5F3 -> S5F4 ACKC5; ALED bit 8 enables the alarm
fn enable_alarm(session: &mut GemSession, body: Option<&Item>) -> HandlerOutcome {
    let parsed = body.and_then(|b| {
        let aled = match b.get(0)? {
            Item::Binary(v) | Item::U1(v) if v.len() == 1 => v[0],
            Item::Boolean(v) if v.len() == 1 => u8::from(v[0]) << 7,
            _ => return None,
        };
        Some((aled & 0x80 != 0, b.get(1)?.as_u32()?))
    });
    let Some((enabled, alid)) = parsed else {
        return ack(1);
    };
    if !session.directory.alids.contains_key(&alid) {
        return ack(1);
    }
    let changed = if enabled {
        session.enabled_alarms.insert(alid)
    } else {
        session.enabled_alarms.remove(&alid)
    };
    let outcome = ack(0);
    if changed {
        outcome.with_effect(Effect::AlarmEnableChanged { alid, enabled })
    } else {
        outcome
    }
}

/// S5F5 -> S5F6; empty vector lists every alarm
fn list_alarms(session: &mut GemSession, body: Option<&Item>) -> HandlerOutcome {
    let alids = match id_list(body) {
        Some(ids) if ids.is_empty() => session.directory.alids.keys().copied().collect(),
        Some(ids) => ids,
        None => return HandlerOutcome::reply(Item::empty_list()),
    };
    HandlerOutcome::resolve(ResolveRequest::AlarmList(alids))
}

/// S6F15 -> S6F16
fn event_report_request(_session: &mut GemSession, body: Option<&Item>) -> HandlerOutcome {
    match body.and_then(Item::as_u32) {
        Some(ceid) => HandlerOutcome::resolve(ResolveRequest::EventReport(ceid)),
        None => HandlerOutcome::reply(Item::empty_list()),
    }
}

/// S6F19 -> S6F20
fn individual_report_request(_session: &mut GemSession, body: Option<&Item>) -> HandlerOutcome {
    match body.and_then(Item::as_u32) {
        Some(rptid) => HandlerOutcome::resolve(ResolveRequest::IndividualReport(rptid)),
        None => HandlerOutcome::reply(Item::empty_list()),
    }
}
