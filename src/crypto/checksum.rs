use crc::{Algorithm, Crc};


/// The reflected CRC-32 the devices use to sign discovery and P2P payloads. This is the IEEE
///  polynomial and lookup table, but with a zero initial value and no final XOR, so neither
///  CRC-32/ISO-HDLC nor any other catalogued variant matches it.
pub static BAICHUAN_CRC_32: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x04c11db7,
    init: 0,
    refin: true,
    refout: true,
    xorout: 0,
    check: 0x2dfd2d88,
    residue: 0,
};

static CHECKSUM: Crc<u32> = Crc::<u32>::new(&BAICHUAN_CRC_32);

/// Checksum over the (already encrypted) payload of a discovery datagram
pub fn checksum(data: &[u8]) -> u32 {
    CHECKSUM.checksum(data)
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(b"".as_slice(), 0)]
    #[case::check_string(b"123456789".as_slice(), 0x2dfd2d88)]
    #[case::ascending(&[1, 2], 0xf715506d)]
    #[case::descending(&[2, 1], 0x45315214)]
    #[case::xml_prefix(b"<P2P>\n".as_slice(), 0xdc25e4e4)]
    fn test_checksum(#[case] data: &[u8], #[case] expected: u32) {
        assert_eq!(checksum(data), expected);
    }

    #[rstest]
    #[case::two_bytes(vec![1, 2])]
    #[case::text(b"<P2P>\n<C2M_Q>\n".to_vec())]
    #[case::repeated_prefix(vec![7, 7, 7, 9])]
    fn test_checksum_is_order_sensitive(#[case] data: Vec<u8>) {
        let mut reversed = data.clone();
        reversed.reverse();

        assert_eq!(checksum(&data), checksum(&data));
        assert_ne!(checksum(&data), checksum(&reversed));
    }
}
