//! SER header pack/unpack
//!
//! ```text
//!   0  file_id[14]        "LUCAM-RECORDER"
//!  14  lu_id          u32
//!  18  color_id       u32
//!  22  little_endian  u32
//!  26  width          u32
//!  30  height         u32
//!  34  pixel_depth    u32   bits per plane
//!  38  frame_count    u32
//!  42  observer[40]
//!  82  instrument[40]
//! 122  telescope[40]
//! 162  date_time      u64   local time, ticks
//! 170  date_time_utc  u64   UTC, ticks
//! 178
//! ```
//!
//! Fields are packed one by one, so the layout never depends on struct padding.

use super::{planes_for_code, ByteOrder, ColorId, Metadata, SerError, TIMESTAMP_SIZE};
use bytes::{Buf, BufMut, BytesMut};

pub const HEADER_SIZE: usize = 178;
pub const FILE_ID: &[u8; 14] = b"LUCAM-RECORDER";
pub const METADATA_FIELD_LEN: usize = 40;

/// Decoded SER header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerHeader {
    pub file_id: [u8; 14],
    pub lu_id: u32,
    pub color_id: u32,
    pub little_endian: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_depth: u32,
    pub frame_count: u32,
    pub observer: String,
    pub instrument: String,
    pub telescope: String,
    pub date_time: u64,
    pub date_time_utc: u64,
}

impl SerHeader {
    /// Header for a new recording with `frame_count = 0`
    pub fn new(width: u32, height: u32, bytes_per_channel: u8, color: ColorId, metadata: &Metadata) -> Self {
        Self {
            file_id: *FILE_ID,
            lu_id: 0,
            color_id: color.code(),
            little_endian: 0,
            width,
            height,
            pixel_depth: u32::from(bytes_per_channel) * 8,
            frame_count: 0,
            observer: metadata.observer.clone(),
            instrument: metadata.instrument.clone(),
            telescope: metadata.telescope.clone(),
            date_time: 0,
            date_time_utc: 0,
        }
    }

    pub fn has_valid_id(&self) -> bool {
        &self.file_id == FILE_ID
    }

    /// `file_id` as text, for diagnostics
    pub fn file_id_lossy(&self) -> String {
        decode_text(&self.file_id)
    }

    pub fn color(&self) -> Option<ColorId> {
        ColorId::from_code(self.color_id)
    }

    pub fn planes(&self) -> u32 {
        planes_for_code(self.color_id)
    }

    /// 0 for depth 0, one byte per plane up to 8 bits, two above
    pub fn bytes_per_pixel(&self) -> u32 {
        match self.pixel_depth {
            0 => 0,
            1..=8 => self.planes(),
            _ => 2 * self.planes(),
        }
    }

    /// Bytes per frame; `None` when the dimensions overflow
    pub fn frame_size(&self) -> Option<u64> {
        u64::from(self.width)
            .checked_mul(u64::from(self.height))?
            .checked_mul(u64::from(self.bytes_per_pixel()))
    }

    pub fn frame_offset(&self, index: u32) -> Option<u64> {
        u64::from(index)
            .checked_mul(self.frame_size()?)?
            .checked_add(HEADER_SIZE as u64)
    }

    /// Where the trailer starts for `frame_count` frames
    pub fn trailer_offset(&self) -> Option<u64> {
        self.frame_offset(self.frame_count)
    }

    /// Size of a complete file holding this header's frame count
    pub fn expected_file_size(&self) -> Option<u64> {
        self.trailer_offset()?
            .checked_add(u64::from(self.frame_count) * TIMESTAMP_SIZE as u64)
    }

    /// Whether pixel data is big-endian, per the inverted `little_endian` flag
    pub fn data_is_big_endian(&self) -> bool {
        self.little_endian == 1
    }

    pub fn metadata(&self) -> Metadata {
        Metadata {
            observer: self.observer.clone(),
            instrument: self.instrument.clone(),
            telescope: self.telescope.clone(),
        }
    }

    /// Packs the header with multi-byte fields in `order`
    pub fn encode(&self, order: ByteOrder) -> [u8; HEADER_SIZE] {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);

        buf.put_slice(&self.file_id);
        for value in [
            self.lu_id,
            self.color_id,
            self.little_endian,
            self.width,
            self.height,
            self.pixel_depth,
            self.frame_count,
        ] {
            put_u32(&mut buf, value, order);
        }
        for text in [&self.observer, &self.instrument, &self.telescope] {
            buf.put_slice(&encode_text(text));
        }
        put_u64(&mut buf, self.date_time, order);
        put_u64(&mut buf, self.date_time_utc, order);

        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Unpacks a header whose multi-byte fields are in `order`
    pub fn decode(data: &[u8], order: ByteOrder) -> Result<Self, SerError> {
        if data.len() < HEADER_SIZE {
            return Err(SerError::HeaderTruncated {
                size: data.len() as u64,
            });
        }

        let mut cur = &data[..HEADER_SIZE];

        let mut file_id = [0u8; 14];
        cur.copy_to_slice(&mut file_id);

        let lu_id = get_u32(&mut cur, order);
        let color_id = get_u32(&mut cur, order);
        let little_endian = get_u32(&mut cur, order);
        let width = get_u32(&mut cur, order);
        let height = get_u32(&mut cur, order);
        let pixel_depth = get_u32(&mut cur, order);
        let frame_count = get_u32(&mut cur, order);

        let mut texts = [[0u8; METADATA_FIELD_LEN]; 3];
        for text in texts.iter_mut() {
            cur.copy_to_slice(text);
        }

        let date_time = get_u64(&mut cur, order);
        let date_time_utc = get_u64(&mut cur, order);

        Ok(Self {
            file_id,
            lu_id,
            color_id,
            little_endian,
            width,
            height,
            pixel_depth,
            frame_count,
            observer: decode_text(&texts[0]),
            instrument: decode_text(&texts[1]),
            telescope: decode_text(&texts[2]),
            date_time,
            date_time_utc,
        })
    }
}

pub(crate) fn put_u32(buf: &mut BytesMut, value: u32, order: ByteOrder) {
    match order {
        ByteOrder::Little => buf.put_u32_le(value),
        ByteOrder::Big => buf.put_u32(value),
    }
}

pub(crate) fn put_u64(buf: &mut BytesMut, value: u64, order: ByteOrder) {
    match order {
        ByteOrder::Little => buf.put_u64_le(value),
        ByteOrder::Big => buf.put_u64(value),
    }
}

fn get_u32(cur: &mut &[u8], order: ByteOrder) -> u32 {
    match order {
        ByteOrder::Little => cur.get_u32_le(),
        ByteOrder::Big => cur.get_u32(),
    }
}

pub(crate) fn get_u64(cur: &mut &[u8], order: ByteOrder) -> u64 {
    match order {
        ByteOrder::Little => cur.get_u64_le(),
        ByteOrder::Big => cur.get_u64(),
    }
}

/// NUL-padded, cut at a char boundary so the field stays valid UTF-8
fn encode_text(text: &str) -> [u8; METADATA_FIELD_LEN] {
    let mut end = text.len().min(METADATA_FIELD_LEN);
    while !text.is_char_boundary(end) {
        end -= 1;
    }

    let mut field = [0u8; METADATA_FIELD_LEN];
    field[..end].copy_from_slice(&text.as_bytes()[..end]);
    field
}

fn decode_text(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SerHeader {
        let metadata = Metadata {
            observer: "observer".into(),
            instrument: "ASI224MC".into(),
            telescope: "C8".into(),
        };
        let mut header = SerHeader::new(640, 480, 2, ColorId::Rggb, &metadata);
        header.frame_count = 42;
        header.little_endian = 1;
        header.date_time = 0x0123_4567_89AB_CDEF;
        header.date_time_utc = 0x0FED_CBA9_8765_4321;
        header
    }

    #[test]
    fn test_field_offsets_little_endian() {
        let bytes = sample().encode(ByteOrder::Little);

        assert_eq!(&bytes[0..14], FILE_ID);
        assert_eq!(&bytes[18..22], &8u32.to_le_bytes());
        assert_eq!(&bytes[26..30], &640u32.to_le_bytes());
        assert_eq!(&bytes[34..38], &16u32.to_le_bytes());
        assert_eq!(&bytes[38..42], &42u32.to_le_bytes());
        assert_eq!(&bytes[42..50], b"observer");
        assert_eq!(bytes[50], 0);
        assert_eq!(&bytes[162..170], &0x0123_4567_89AB_CDEFu64.to_le_bytes());
    }

    #[test]
    fn test_big_endian_fields() {
        let bytes = sample().encode(ByteOrder::Big);
        assert_eq!(&bytes[26..30], &640u32.to_be_bytes());
        assert_eq!(&bytes[170..178], &0x0FED_CBA9_8765_4321u64.to_be_bytes());
    }

    #[test]
    fn test_decode_matches_encode() {
        let header = sample();
        for order in [ByteOrder::Little, ByteOrder::Big] {
            let decoded = SerHeader::decode(&header.encode(order), order).unwrap();
            assert_eq!(decoded, header);
        }
    }

    #[test]
    fn test_decode_rejects_short_input() {
        let result = SerHeader::decode(&[0u8; 100], ByteOrder::Little);
        assert!(matches!(result, Err(SerError::HeaderTruncated { size: 100 })));
    }

    #[test]
    fn test_metadata_truncated_to_field() {
        let long = "x".repeat(60);
        let metadata = Metadata {
            observer: long,
            ..Default::default()
        };
        let header = SerHeader::new(8, 8, 1, ColorId::Mono, &metadata);
        let decoded = SerHeader::decode(&header.encode(ByteOrder::Little), ByteOrder::Little).unwrap();
        assert_eq!(decoded.observer.len(), METADATA_FIELD_LEN);
    }

    #[test]
    fn test_metadata_cut_on_char_boundary() {
        // 39 ASCII bytes followed by a 2-byte char that would straddle the limit
        let text = format!("{}é", "a".repeat(39));
        let field = encode_text(&text);
        assert_eq!(field[39], 0);
        assert_eq!(decode_text(&field), "a".repeat(39));
    }

    #[test]
    fn test_frame_geometry() {
        let mono8 = SerHeader::new(100, 50, 1, ColorId::Mono, &Metadata::default());
        assert_eq!(mono8.bytes_per_pixel(), 1);
        assert_eq!(mono8.frame_size(), Some(5_000));

        let rgb16 = SerHeader::new(100, 50, 2, ColorId::Rgb, &Metadata::default());
        assert_eq!(rgb16.pixel_depth, 16);
        assert_eq!(rgb16.bytes_per_pixel(), 6);
        assert_eq!(rgb16.frame_size(), Some(30_000));

        let mut header = rgb16;
        header.frame_count = 3;
        assert_eq!(header.trailer_offset(), Some(HEADER_SIZE as u64 + 90_000));
        assert_eq!(header.expected_file_size(), Some(HEADER_SIZE as u64 + 90_000 + 24));
    }
}
