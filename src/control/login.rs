use md5::{Digest, Md5};

use crate::control::message_header::{MessageClass, MessageHeader};
use crate::control::messages::MSG_ID_LOGIN;


/// Body length of a legacy login message, fixed regardless of credential length
pub const LEGACY_LOGIN_BODY_LEN: usize = 1836;

const LEGACY_CREDENTIAL_FIELD_LEN: usize = 32;

/// Upper case hex MD5 digest, cut to the 31 characters the devices expect
pub fn md5_hex31(s: &str) -> String {
    let mut hex = hex::encode_upper(Md5::digest(s.as_bytes()));
    hex.truncate(31);
    hex
}

pub fn legacy_login_header() -> MessageHeader {
    MessageHeader {
        message_id: MSG_ID_LOGIN,
        message_len: LEGACY_LOGIN_BODY_LEN as u32,
        encryption_offset: 0x0100_0000,
        encrypted: true,
        unknown: 0xdc,
        class: MessageClass::Legacy,
        bin_offset: 0,
    }
}

/// Two NUL terminated 32 byte digest fields, followed by zero padding
pub fn legacy_login_body(username: &str, password: &str) -> Vec<u8> {
    let mut body = vec![0u8; LEGACY_LOGIN_BODY_LEN];
    for (i, credential) in [username, password].iter().enumerate() {
        let digest = md5_hex31(credential);
        let start = i * LEGACY_CREDENTIAL_FIELD_LEN;
        body[start..start + digest.len()].copy_from_slice(digest.as_bytes());
    }
    body
}

pub fn modern_login_xml(username: &str, password: &str, nonce: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" ?>\n<body>\n<LoginUser version=\"1.1\">\n<userName>{}</userName>\n<password>{}</password>\n<userVer>1</userVer>\n</LoginUser>\n<LoginNet version=\"1.1\"><type>LAN</type>\n<udpPort>0</udpPort>\n</LoginNet>\n</body>\n",
        md5_hex31(&format!("{}{}", username, nonce)),
        md5_hex31(&format!("{}{}", password, nonce)),
    )
}
