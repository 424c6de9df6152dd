//! HSMS messages

use crate::error::SecsResult;
use crate::hsms::header::{CONTROL_SESSION_ID, HEADER_LENGTH, HsmsHeader, RejectReason, SType};
use bytes::BytesMut;
use secs_codec::{SecsEncoder, decode_item};
use secs_core::Item;
use std::fmt;

/// A complete HSMS message: header plus optional SECS-II body
#[derive(Debug, Clone, PartialEq)]
pub struct HsmsMessage {
    pub header: HsmsHeader,
    pub body: Option<Item>,
}

impl HsmsMessage {
    /// Create a data message
    ///
    /// Session id and system bytes are filled in by the connection when the
    /// message is sent.
    pub fn data(stream: u8, function: u8, reply_expected: bool, body: Option<Item>) -> Self {
        Self {
            header: HsmsHeader::data(0, stream, function, reply_expected, 0),
            body,
        }
    }

    /// Create a primary message expecting a reply
    pub fn primary(stream: u8, function: u8, body: Item) -> Self {
        Self::data(stream, function, true, Some(body))
    }

    /// Create the reply (function + 1) to a primary message
    pub fn reply_to(primary: &HsmsMessage, body: Option<Item>) -> Self {
        Self {
            header: HsmsHeader::data(
                primary.header.session_id,
                primary.stream(),
                primary.function().wrapping_add(1),
                false,
                primary.header.system_bytes,
            ),
            body,
        }
    }

    /// Create a control message
    pub fn control(stype: SType, system_bytes: u32) -> Self {
        Self {
            header: HsmsHeader::control(CONTROL_SESSION_ID, stype, 0, 0, system_bytes),
            body: None,
        }
    }

    /// Create a control response carrying `status` in byte 3
    pub fn control_response(request: &HsmsHeader, stype: SType, status: u8) -> Self {
        Self {
            header: HsmsHeader::control(request.session_id, stype, 0, status, request.system_bytes),
            body: None,
        }
    }

    /// Create a Reject.req for the given header
    pub fn reject(rejected: &HsmsHeader, reason: RejectReason) -> Self {
        // byte 2 carries the stream for data messages, the SType otherwise
        let byte2 = if rejected.is_data() {
            rejected.stream()
        } else {
            rejected.stype
        };
        Self {
            header: HsmsHeader::control(
                rejected.session_id,
                SType::RejectReq,
                byte2,
                reason as u8,
                rejected.system_bytes,
            ),
            body: None,
        }
    }

    pub fn device_id(&self) -> u16 {
        self.header.session_id
    }

    pub fn stream(&self) -> u8 {
        self.header.stream()
    }

    pub fn function(&self) -> u8 {
        self.header.function()
    }

    pub fn reply_expected(&self) -> bool {
        self.header.reply_expected()
    }

    pub fn system_bytes(&self) -> u32 {
        self.header.system_bytes
    }

    pub fn message_type(&self) -> Option<SType> {
        self.header.message_type()
    }

    /// Primary messages carry an odd function code
    pub fn is_primary(&self) -> bool {
        self.header.is_data() && self.function() % 2 == 1
    }

    /// Encode header and body (without the length prefix)
    pub fn encode(&self) -> SecsResult<Vec<u8>> {
        let mut buffer = BytesMut::with_capacity(HEADER_LENGTH + 16);
        self.header.encode(&mut buffer);
        if let Some(body) = &self.body {
            let mut encoder = SecsEncoder::new();
            encoder.encode_item(body)?;
            buffer.extend_from_slice(encoder.as_bytes());
        }
        Ok(buffer.to_vec())
    }

    /// Decode a frame (without the length prefix)
    pub fn decode(frame: &[u8]) -> SecsResult<Self> {
        let header = HsmsHeader::decode(frame)?;
        let body = match &frame[HEADER_LENGTH..] {
            [] => None,
            bytes => Some(decode_item(bytes)?),
        };
        Ok(Self { header, body })
    }
}

impl fmt::Display for HsmsMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message_type() {
            Some(SType::Data) => {
                write!(f, "S{}F{}", self.stream(), self.function())?;
                if self.reply_expected() {
                    write!(f, " W")?;
                }
                write!(f, " [{:08X}]", self.system_bytes())?;
                if let Some(body) = &self.body {
                    write!(f, " {}", body)?;
                }
                Ok(())
            }
            Some(stype) => write!(f, "{:?} [{:08X}]", stype, self.system_bytes()),
            None => write!(f, "SType({}) [{:08X}]", self.header.stype, self.system_bytes()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_data_message() {
        let mut msg = HsmsMessage::primary(1, 13, Item::empty_list());
        msg.header.session_id = 1;
        msg.header.system_bytes = 42;
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes, vec![0, 1, 0x81, 13, 0, 0, 0, 0, 0, 42, 0x01, 0x00]);
        assert_eq!(HsmsMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_header_only_message_has_no_body() {
        let msg = HsmsMessage::control(SType::LinktestReq, 3);
        let decoded = HsmsMessage::decode(&msg.encode().unwrap()).unwrap();
        assert!(decoded.body.is_none());
        assert_eq!(decoded.message_type(), Some(SType::LinktestReq));
    }

    #[test]
    fn test_reply_to() {
        let mut primary = HsmsMessage::primary(2, 33, Item::empty_list());
        primary.header.session_id = 7;
        primary.header.system_bytes = 99;
        let reply = HsmsMessage::reply_to(&primary, Some(Item::binary(0)));
        assert_eq!(reply.device_id(), 7);
        assert_eq!(reply.stream(), 2);
        assert_eq!(reply.function(), 34);
        assert_eq!(reply.system_bytes(), 99);
        assert!(!reply.reply_expected());
        assert!(!reply.is_primary());
    }

    #[test]
    fn test_reject_carries_stream_and_reason() {
        let header = HsmsHeader::data(1, 6, 11, true, 5);
        let reject = HsmsMessage::reject(&header, RejectReason::EntityNotSelected);
        assert_eq!(reject.message_type(), Some(SType::RejectReq));
        assert_eq!(reject.header.byte2, 6);
        assert_eq!(reject.header.byte3, 4);
        assert_eq!(reject.system_bytes(), 5);
    }

    #[test]
    fn test_display() {
        let mut msg = HsmsMessage::primary(1, 3, Item::list(vec![Item::u4(1)]));
        msg.header.system_bytes = 1;
        assert_eq!(msg.to_string(), "S1F3 W [00000001] <L [1] <U4 1>>");
    }
}
