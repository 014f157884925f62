const OFFSET_KEY: [u8; 8] = [0x1f, 0x2d, 0x3c, 0x4b, 0x5a, 0x69, 0x78, 0xff];

const TID_KEY: [u32; 8] = [
    0x1f2d3c4b, 0x5a6c7f8d,
    0x38172e4b, 0x8271635a,
    0x863f1a2b, 0xa5c6f7d8,
    0x8371e1b4, 0x17f2d3a5,
];


/// Cipher for control message XML. The key rotates with the encryption offset the device puts
///  into every message header, and the offset's low byte is mixed into each output byte.
pub fn offset_xor(data: &[u8], offset: u32) -> Vec<u8> {
    let rotation = (offset % 8) as usize;
    let offset_byte = offset as u8;

    data.iter()
        .enumerate()
        .map(|(i, &b)| b ^ OFFSET_KEY[(i + rotation) % 8] ^ offset_byte)
        .collect()
}

/// Cipher for discovery and P2P signaling XML. Each of the eight 32-bit key words is shifted by the
///  transaction id, and the payload is processed in 4-byte groups cycling through the key words,
///  one little-endian key byte per payload byte.
pub fn tid_xor(data: &[u8], tid: u32) -> Vec<u8> {
    let key = TID_KEY.map(|word| word.wrapping_add(tid));

    let mut result = Vec::with_capacity(data.len());
    let num_groups = (data.len() + 3) / 4;
    for group in 0..num_groups {
        let key_bytes = key[group & 7].to_le_bytes();
        for (b, key_byte) in key_bytes.iter().enumerate() {
            let byte_index = group * 4 + b;
            result.push(data[byte_index] ^ key_byte);
            if byte_index + 1 >= data.len() {
                return result;
            }
        }
    }
    result
}
