use bytes::Bytes;

use crate::config::StreamKind;
use crate::control::message_header::MessageClass;
use crate::util::xml::XmlBody;


pub const MSG_ID_LOGIN: u32 = 0x01;
pub const MSG_ID_VIDEO: u32 = 0x03;
/// the device's answer to a successful modern login
pub const MSG_ID_VIDEO_INPUT: u32 = 0x4e;
pub const MSG_ID_PING: u32 = 0x5d;
pub const MSG_ID_BATTERY_INFO: u32 = 0xfc;


/// A reassembled control message. `text` is decrypted if the device sent it encrypted, `binary`
///  holds the record stream of messages in binary mode and is never decrypted.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LogicalMessage {
    pub message_id: u32,
    pub class: MessageClass,
    pub text: Bytes,
    pub binary: Bytes,
}

impl LogicalMessage {
    /// `None` if the text is not an XML document
    pub fn xml(&self) -> Option<XmlBody<'_>> {
        XmlBody::parse_bytes(&self.text).ok()
    }

    /// the login nonce a device sends in reply to a legacy login
    pub fn nonce(&self) -> Option<String> {
        self.xml()?
            .text("Encryption/nonce")
            .filter(|nonce| !nonce.is_empty())
            .map(|nonce| nonce.to_string())
    }

    pub fn battery_percent(&self) -> Option<u8> {
        self.xml()?
            .parse_at("BatteryList/BatteryInfo/batteryPercent")
    }
}

pub fn start_video_xml(stream: StreamKind) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" ?>\n<body>\n<Preview version=\"1.1\">\n<channelId>0</channelId>\n<handle>0</handle>\n<streamType>{}</streamType>\n</Preview>\n</body>\n",
        stream.as_str(),
    )
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn message(id: u32, text: &str) -> LogicalMessage {
        LogicalMessage {
            message_id: id,
            class: MessageClass::Modern,
            text: Bytes::copy_from_slice(text.as_bytes()),
            binary: Bytes::new(),
        }
    }

    #[rstest]
    #[case::present("<?xml version=\"1.0\" encoding=\"UTF-8\" ?>\n<body>\n<Encryption version=\"1.1\">\n<type>md5</type>\n<nonce>0-AhnEZyUg6eKrJFIWgXPF</nonce>\n</Encryption>\n</body>\n", Some("0-AhnEZyUg6eKrJFIWgXPF"))]
    #[case::empty("<body><Encryption><nonce></nonce></Encryption></body>", None)]
    #[case::missing("<body><Encryption><type>md5</type></Encryption></body>", None)]
    #[case::wrong_level("<body><nonce>abc</nonce></body>", None)]
    #[case::not_xml("\u{1}\u{2}garbage", None)]
    fn test_nonce(#[case] text: &str, #[case] expected: Option<&str>) {
        assert_eq!(message(MSG_ID_LOGIN, text).nonce().as_deref(), expected);
    }

    #[rstest]
    #[case::present("<body>\n<BatteryList version=\"1.1\">\n<BatteryInfo>\n<channelId>0</channelId>\n<batteryPercent>87</batteryPercent>\n</BatteryInfo>\n</BatteryList>\n</body>\n", Some(87))]
    #[case::not_a_number("<body><BatteryList><BatteryInfo><batteryPercent>n/a</batteryPercent></BatteryInfo></BatteryList></body>", None)]
    #[case::missing("<body><BatteryList/></body>", None)]
    fn test_battery_percent(#[case] text: &str, #[case] expected: Option<u8>) {
        assert_eq!(message(MSG_ID_BATTERY_INFO, text).battery_percent(), expected);
    }

    #[rstest]
    #[case::main(StreamKind::Main, "<streamType>mainStream</streamType>")]
    #[case::sub(StreamKind::Sub, "<streamType>subStream</streamType>")]
    fn test_start_video_xml(#[case] stream: StreamKind, #[case] expected_element: &str) {
        let xml = start_video_xml(stream);
        assert!(xml.contains(expected_element));
        assert!(xml.contains("<Preview version=\"1.1\">\n<channelId>0</channelId>\n<handle>0</handle>\n"));
    }
}
