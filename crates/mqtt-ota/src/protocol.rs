/// File upload wire format over MQTT.
///
/// ```text
/// cmnd/<topic>/fileupload      JSON control: header, final digest
/// cmnd/<topic>/fileupload201   raw binary chunk (no framing)
/// stat/<topic>/FILEUPLOAD      JSON acknowledgment from the device
/// ```
///
/// Header:  {"File":"tasmota.bin.gz","Id":114,"Type":1,"Size":1500}
/// Final:   {"Id":114,"Md5":"<lowercase hex>"}
/// Ack:     {"Command":"Error","Id":114,"MaxSize":256}   (all optional)

use serde::{Deserialize, Serialize};

/// Default chunk size: the device's default MQTT max message size.
pub const DEFAULT_CHUNK_SIZE: usize = 700;

/// Default session id used by the reference upload tool.
pub const DEFAULT_SESSION_ID: u8 = 114;

/// Session ids must be even and within this range.
pub const MIN_SESSION_ID: u8 = 2;
pub const MAX_SESSION_ID: u8 = 254;

/// Default file type tag (firmware image).
pub const DEFAULT_FILE_TYPE: u32 = 1;

/// Default bound on a single acknowledgment wait (100 polls of 10 ms).
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 1000;

/// Capacity of the inbound acknowledgment channel.
pub const ACK_CHANNEL_CAPACITY: usize = 16;

/// `Command` value the device uses to report a failure.
pub const COMMAND_ERROR: &str = "Error";

/// Topic names for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    /// Header and final digest.
    pub control: String,
    /// Raw chunk payloads.
    pub chunk: String,
    /// Device acknowledgments. Case sensitive.
    pub ack: String,
}

impl Topics {
    pub fn for_device(topic: &str) -> Self {
        let control = format!("cmnd/{}/fileupload", topic);
        Self {
            chunk: format!("{}201", control),
            control,
            ack: format!("stat/{}/FILEUPLOAD", topic),
        }
    }
}

/// JSON control message exchanged on the control and ack topics.
///
/// Field order matters for the serialized form: header and final messages
/// are emitted in the order the device firmware documents them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ControlMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u64>,
    #[serde(default, rename = "Type", skip_serializing_if = "Option::is_none")]
    pub file_type: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
}

impl ControlMessage {
    /// Session-opening message.
    pub fn header(file: &str, id: u8, file_type: u32, size: u64) -> Self {
        Self {
            file: Some(file.to_string()),
            id: Some(id as u64),
            file_type: Some(file_type),
            size: Some(size),
            ..Default::default()
        }
    }

    /// Session-closing message carrying the content digest.
    pub fn finish(id: u8, md5_hex: &str) -> Self {
        Self {
            id: Some(id as u64),
            md5: Some(md5_hex.to_string()),
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.command.as_deref() == Some(COMMAND_ERROR)
    }

    /// True if this message pertains to session `id`. A missing `Id` never matches.
    pub fn is_for(&self, id: u8) -> bool {
        self.id == Some(id as u64)
    }

    pub fn to_json(&self) -> Vec<u8> {
        // Every field is a plain string or integer, serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        serde_json::from_slice(payload).ok()
    }
}

/// Check a session id: even, within [MIN_SESSION_ID, MAX_SESSION_ID].
pub fn valid_session_id(id: u8) -> bool {
    (MIN_SESSION_ID..=MAX_SESSION_ID).contains(&id) && id % 2 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_for_device() {
        let t = Topics::for_device("demo");
        assert_eq!(t.control, "cmnd/demo/fileupload");
        assert_eq!(t.chunk, "cmnd/demo/fileupload201");
        assert_eq!(t.ack, "stat/demo/FILEUPLOAD");
    }

    #[test]
    fn header_json_shape() {
        let msg = ControlMessage::header("f", 114, 1, 1500);
        assert_eq!(
            String::from_utf8(msg.to_json()).unwrap(),
            r#"{"File":"f","Id":114,"Type":1,"Size":1500}"#
        );
    }

    #[test]
    fn final_json_shape() {
        let msg = ControlMessage::finish(114, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(
            String::from_utf8(msg.to_json()).unwrap(),
            r#"{"Id":114,"Md5":"d41d8cd98f00b204e9800998ecf8427e"}"#
        );
    }

    #[test]
    fn parse_ack_with_max_size() {
        let msg = ControlMessage::parse(br#"{"Id":114,"MaxSize":256}"#).unwrap();
        assert!(msg.is_for(114));
        assert!(!msg.is_error());
        assert_eq!(msg.max_size, Some(256));
    }

    #[test]
    fn parse_error_ack_ignores_unknown_fields() {
        let msg =
            ControlMessage::parse(br#"{"Command":"Error","Id":114,"Reason":"flash"}"#).unwrap();
        assert!(msg.is_error());
        assert!(msg.is_for(114));
    }

    #[test]
    fn missing_id_matches_nothing() {
        let msg = ControlMessage::parse(br#"{"MaxSize":256}"#).unwrap();
        assert!(!msg.is_for(114));
        assert!(!msg.is_for(0));
    }

    #[test]
    fn reject_non_json() {
        assert!(ControlMessage::parse(b"\x00\x01garbage").is_none());
    }

    #[test]
    fn session_id_range() {
        assert!(valid_session_id(2));
        assert!(valid_session_id(114));
        assert!(valid_session_id(254));
        assert!(!valid_session_id(0));
        assert!(!valid_session_id(113));
        assert!(!valid_session_id(255));
    }
}
