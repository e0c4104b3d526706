//! Raw word and frame builders, the exact inverses of the stream decoder.

use tpx3_decode::{CHUNK_HEADER_TAG, HIT_NIBBLE, PACKET_ID_BYTE, TDC_NIBBLE};

/// TDC pulse word for the given 640 MHz clock value.
pub fn tdc(clock: i64) -> u64 {
    let coarse = (clock as u64) >> 1;
    // fractional counter 1..=12: 1..=6 decode to an even tick, 7..=12 odd
    let fract: u64 = if clock & 1 == 1 { 7 } else { 1 };
    (TDC_NIBBLE as u64) << 60 | coarse << 9 | fract << 5
}

/// Pixel hit word for coordinates, TOA clock value and TOT.
pub fn hit(x: u16, y: u16, toa_clock: i64, tot: u64) -> u64 {
    let ftoa = (16 - (toa_clock as u64 % 16)) % 16;
    let ticks = (toa_clock as u64 + ftoa) >> 4;
    let toa = ticks & 0x3fff;
    let coarse = (ticks >> 14) & 0xffff;
    let pix = ((x & 1) << 2 | (y & 3)) as u64;
    let dcol = (x & !1) as u64;
    let spix = (y & !3) as u64;
    let addr = (dcol << 8) | (spix << 1) | pix;
    (HIT_NIBBLE as u64) << 60 | addr << 44 | toa << 30 | (tot & 0x3ff) << 20 | ftoa << 16 | coarse
}

/// Chunk header; the size field covers the packet-id word plus payload.
pub fn chunk_header(chip: u8, payload_words: usize) -> u64 {
    let chunk_size = 8 + 8 * payload_words as u64;
    chunk_size << 48 | (chip as u64) << 32 | CHUNK_HEADER_TAG
}

pub fn packet_word(packet_id: u64) -> u64 {
    (PACKET_ID_BYTE as u64) << 56 | (packet_id & 0xffff_ffff_ffff)
}

/// One complete wire frame: header, packet id, payload.
pub fn frame(chip: u8, packet_id: u64, words: &[u64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(16 + 8 * words.len());
    bytes.extend_from_slice(&chunk_header(chip, words.len()).to_le_bytes());
    bytes.extend_from_slice(&packet_word(packet_id).to_le_bytes());
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpx3_decode as decode;

    #[test]
    fn tdc_words_decode_back() {
        for clock in [0i64, 1, 2, 639_999, 640_000, 1_280_001] {
            let word = tdc(clock);
            assert!(decode::matches_nibble(word, decode::TDC_NIBBLE));
            assert_eq!(decode::tdc_clock(word).unwrap(), clock, "clock {clock}");
        }
    }

    #[test]
    fn hit_words_decode_back() {
        for &(x, y, toa, tot) in &[
            (0u16, 0u16, 0i64, 0u64),
            (1, 2, 1_360_000, 100),
            (255, 255, 12_345, 1023),
            (17, 200, 999_999, 512),
        ] {
            let word = hit(x, y, toa, tot);
            assert!(decode::matches_nibble(word, decode::HIT_NIBBLE));
            assert_eq!(decode::xy(word), (x, y));
            assert_eq!(decode::toa_clock(word), toa);
            assert_eq!(decode::tot_clock(word), tot);
        }
    }

    #[test]
    fn frames_carry_header_fields() {
        let bytes = frame(2, 77, &[tdc(0), tdc(640_000)]);
        assert_eq!(bytes.len(), 32);

        let header = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        assert!(decode::is_chunk_header(header));
        assert_eq!(decode::chunk_chip_index(header), 2);
        assert_eq!(decode::chunk_size_bytes(header), 24);

        let id_word = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        assert!(decode::matches_byte(id_word, decode::PACKET_ID_BYTE));
        assert_eq!(decode::packet_id(id_word), 77);
    }
}
