//! Host simulator for bridge tests

use crate::config::DeviceConfig;
use crate::definition::IdentifierTables;
use crate::source::{MemorySource, PlcValue};
use secs_core::{DeviceId, Item};
use secs_gem::InitializationConfig;
use secs_session::{HsmsMessage, SType};
use secs_transport::{DEFAULT_MAX_FRAME_LENGTH, MemoryDialer, read_frame, write_frame};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::DuplexStream;

pub(crate) const WAIT: Duration = Duration::from_secs(3);

pub(crate) fn tables() -> IdentifierTables {
    toml::from_str(
        r#"
        [[svids]]
        id = 10001
        name = "ChamberTemp"
        address = "D100"
        data_type = "u32"
        unit = "C"

        [[svids]]
        id = 10002
        name = "ChamberPressure"
        address = "D101"
        data_type = "u32"

        [[ceids]]
        id = 100
        name = "LotStart"
        trigger = "rising-edge"
        address = "M10"
        data_type = "bool"

        [[ceids]]
        id = 101
        name = "OperatorCall"
        trigger = "manual"

        [[ecids]]
        id = 20001
        name = "MaxTemp"
        address = "D200"
        data_type = "u32"
        min = 0
        max = 400

        [[alids]]
        id = 5001
        name = "Overheat"
        category = 4
        address = "M20"

        [[rptids]]
        id = 1
        svids = [10001]
        "#,
    )
    .unwrap()
}

pub(crate) fn plc() -> MemorySource {
    MemorySource::new()
        .with_value("D100", PlcValue::UInt(20))
        .with_value("D101", PlcValue::UInt(30))
        .with_value("M10", PlcValue::Bool(false))
        .with_value("M20", PlcValue::Bool(false))
        .with_value("D200", PlcValue::UInt(150))
}

pub(crate) fn device_config(device_id: DeviceId) -> DeviceConfig {
    DeviceConfig::new(device_id, "127.0.0.1:5000")
        .with_poll_interval(Duration::from_millis(20))
        .with_initialization(InitializationConfig::default().with_step_timeout(WAIT))
}

/// Drives the host end of a memory link
pub(crate) struct HostSimulator {
    stream: DuplexStream,
    device_id: DeviceId,
    system: u32,
    inbox: VecDeque<HsmsMessage>,
}

impl HostSimulator {
    /// Dial the equipment and select the link
    pub(crate) async fn connect(dialer: &MemoryDialer, device_id: DeviceId) -> Self {
        let mut host = Self {
            stream: dialer.dial().unwrap(),
            device_id,
            system: 1000,
            inbox: VecDeque::new(),
        };
        let system = host.next_system();
        host.write(&HsmsMessage::control(SType::SelectReq, system)).await;
        let rsp = host.read().await;
        assert_eq!(rsp.message_type(), Some(SType::SelectRsp));
        assert_eq!(rsp.header.byte3, 0);
        host
    }

    fn next_system(&mut self) -> u32 {
        self.system += 1;
        self.system
    }

    async fn write(&mut self, message: &HsmsMessage) {
        write_frame(&mut self.stream, &message.encode().unwrap(), WAIT)
            .await
            .unwrap();
    }

    /// Next message other than a link test
    async fn read(&mut self) -> HsmsMessage {
        loop {
            let frame = tokio::time::timeout(
                WAIT,
                read_frame(&mut self.stream, WAIT, DEFAULT_MAX_FRAME_LENGTH),
            )
            .await
            .expect("equipment sent nothing")
            .unwrap()
            .expect("link closed");
            let message = HsmsMessage::decode(&frame).unwrap();
            if message.message_type() == Some(SType::LinktestReq) {
                let rsp = HsmsMessage::control_response(&message.header, SType::LinktestRsp, 0);
                self.write(&rsp).await;
                continue;
            }
            return message;
        }
    }

    async fn acknowledge(&mut self, primary: &HsmsMessage) {
        if primary.reply_expected() {
            self.write(&HsmsMessage::reply_to(primary, Some(Item::binary(0))))
                .await;
        }
    }

    /// Send a primary without waiting for anything
    pub(crate) async fn send(&mut self, stream: u8, function: u8, body: Option<Item>) -> u32 {
        let mut message = HsmsMessage::data(stream, function, true, body);
        message.header.session_id = self.device_id;
        message.header.system_bytes = self.next_system();
        self.write(&message).await;
        message.header.system_bytes
    }

    /// Send a primary and return its reply
    ///
    /// Equipment primaries arriving meanwhile are acknowledged and kept.
    pub(crate) async fn request(&mut self, stream: u8, function: u8, body: Option<Item>) -> HsmsMessage {
        let system = self.send(stream, function, body).await;
        loop {
            let message = self.read().await;
            if !message.is_primary() && message.system_bytes() == system {
                assert_eq!(message.stream(), stream);
                assert_eq!(message.function(), function + 1);
                return message;
            }
            self.acknowledge(&message).await;
            self.inbox.push_back(message);
        }
    }

    /// Wait for an equipment primary, acknowledging it
    pub(crate) async fn expect_primary(&mut self, stream: u8, function: u8) -> HsmsMessage {
        if let Some(index) = self
            .inbox
            .iter()
            .position(|m| m.stream() == stream && m.function() == function)
        {
            if let Some(message) = self.inbox.remove(index) {
                return message;
            }
        }
        loop {
            let message = self.read().await;
            if message.is_primary() {
                self.acknowledge(&message).await;
            }
            if message.stream() == stream && message.function() == function {
                return message;
            }
            self.inbox.push_back(message);
        }
    }

    /// Run the host side of GEM initialization
    ///
    /// Deletes every report, defines `rptid` over `svids`, links it to
    /// `ceid` and enables `ceid`.
    pub(crate) async fn initialize(&mut self, ceid: u32, rptid: u32, svids: &[u32]) {
        let clear = Item::list(vec![Item::u4(0), Item::empty_list()]);
        assert_eq!(self.request(2, 33, Some(clear)).await.body, Some(Item::binary(0)));

        let reply = self.request(1, 13, Some(Item::empty_list())).await;
        assert_eq!(reply.body.as_ref().and_then(|b| b.get(0)), Some(&Item::binary(0)));

        let reply = self.request(1, 17, None).await;
        assert_eq!(reply.body, Some(Item::binary(0)));

        let define = Item::list(vec![
            Item::u4(1),
            Item::list(vec![Item::list(vec![
                Item::u4(rptid),
                Item::list(svids.iter().map(|svid| Item::u4(*svid)).collect()),
            ])]),
        ]);
        assert_eq!(self.request(2, 33, Some(define)).await.body, Some(Item::binary(0)));

        let link = Item::list(vec![
            Item::u4(2),
            Item::list(vec![Item::list(vec![
                Item::u4(ceid),
                Item::list(vec![Item::u4(rptid)]),
            ])]),
        ]);
        assert_eq!(self.request(2, 35, Some(link)).await.body, Some(Item::binary(0)));

        let enable = Item::list(vec![Item::boolean(true), Item::list(vec![Item::u4(ceid)])]);
        assert_eq!(self.request(2, 37, Some(enable)).await.body, Some(Item::binary(0)));
    }

    /// Drop the link
    pub(crate) fn close(self) {
        drop(self.stream);
    }
}
