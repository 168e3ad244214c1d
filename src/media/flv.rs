//! FLV tag parsing and framing
//!
//! FLV (Flash Video) is the container format carried over HTTP-FLV. The
//! stream starts with a 9-byte file header and a 4-byte PreviousTagSize of
//! zero, then repeats fully-framed tags.
//!
//! On-wire tag structure:
//! ```text
//! +--------+-------------+-----------+-------------+---------+-------------+
//! | Type(1)| DataSize(3) | TS(3+1)   | StreamID(3) | Data(N) | PrevSize(4) |
//! +--------+-------------+-----------+-------------+---------+-------------+
//! ```
//!
//! Video data first byte:
//! ```text
//! +----------+----------+
//! | FrameType| CodecID  | CodecData...
//! | (4 bits) | (4 bits) |
//! +----------+----------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};

/// FLV tag header: type(1) + dataSize(3) + timestamp(3+1) + streamId(3)
pub const TAG_HEADER_SIZE: usize = 11;
/// Trailing PreviousTagSize field
pub const PREV_TAG_SIZE_LEN: usize = 4;
/// FLV file header ("FLV" + version + flags + header length)
pub const FLV_HEADER_SIZE: usize = 9;

/// FLV tag type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlvTagType {
    Audio,
    Video,
    Script,
}

impl FlvTagType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            8 => Some(FlvTagType::Audio),
            9 => Some(FlvTagType::Video),
            18 => Some(FlvTagType::Script),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            FlvTagType::Audio => 8,
            FlvTagType::Video => 9,
            FlvTagType::Script => 18,
        }
    }
}

/// Video frame type (upper 4 bits of the first payload byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFrameType {
    /// Keyframe (for AVC, a seekable frame)
    Keyframe = 1,
    /// Inter frame
    InterFrame = 2,
    /// Disposable inter frame (H.263 only)
    DisposableInterFrame = 3,
    /// Generated keyframe (reserved for server use)
    GeneratedKeyframe = 4,
    /// Video info/command frame
    VideoInfoFrame = 5,
}

impl VideoFrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match (b >> 4) & 0x0F {
            1 => Some(VideoFrameType::Keyframe),
            2 => Some(VideoFrameType::InterFrame),
            3 => Some(VideoFrameType::DisposableInterFrame),
            4 => Some(VideoFrameType::GeneratedKeyframe),
            5 => Some(VideoFrameType::VideoInfoFrame),
            _ => None,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(
            self,
            VideoFrameType::Keyframe | VideoFrameType::GeneratedKeyframe
        )
    }
}

/// AVC codec id in the lower nibble of the first video payload byte
pub const CODEC_ID_AVC: u8 = 7;
/// AVC packet type: NAL units follow
pub const AVC_PACKET_NALU: u8 = 1;
/// NAL unit type for an IDR slice
pub const NAL_TYPE_IDR: u8 = 5;

/// Parsed FLV tag
///
/// `payload` holds the tag body only; the 11-byte header and the trailing
/// PreviousTagSize are reconstructed by [`FlvTag::encode`].
#[derive(Debug, Clone)]
pub struct FlvTag {
    /// Tag type
    pub tag_type: FlvTagType,
    /// Timestamp in milliseconds (24-bit low part + extended byte)
    pub timestamp: u32,
    /// Tag body (zero-copy via reference counting)
    pub payload: Bytes,
}

impl FlvTag {
    pub fn video(timestamp: u32, payload: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Video,
            timestamp,
            payload,
        }
    }

    pub fn audio(timestamp: u32, payload: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Audio,
            timestamp,
            payload,
        }
    }

    pub fn script(timestamp: u32, payload: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Script,
            timestamp,
            payload,
        }
    }

    pub fn is_video(&self) -> bool {
        self.tag_type == FlvTagType::Video
    }

    pub fn is_audio(&self) -> bool {
        self.tag_type == FlvTagType::Audio
    }

    pub fn is_script(&self) -> bool {
        self.tag_type == FlvTagType::Script
    }

    /// For video tags, the frame type nibble
    pub fn video_frame_type(&self) -> Option<VideoFrameType> {
        if self.is_video() && !self.payload.is_empty() {
            VideoFrameType::from_byte(self.payload[0])
        } else {
            None
        }
    }

    /// For video tags, the codec id nibble
    pub fn video_codec_id(&self) -> Option<u8> {
        if self.is_video() && !self.payload.is_empty() {
            Some(self.payload[0] & 0x0F)
        } else {
            None
        }
    }

    /// Whether this tag is a true keyframe.
    ///
    /// FrameType == 1 is necessary. For AVC NALU packets the check is
    /// refined by scanning the length-prefixed NAL units for an IDR slice;
    /// for every other codec (and for AVC sequence headers) the frame-type
    /// nibble is taken at face value.
    pub fn is_keyframe(&self) -> bool {
        let frame_keyed = self
            .video_frame_type()
            .map(|ft| ft.is_keyframe())
            .unwrap_or(false);
        if !frame_keyed {
            return false;
        }

        if self.video_codec_id() == Some(CODEC_ID_AVC)
            && self.payload.len() >= 2
            && self.payload[1] == AVC_PACKET_NALU
        {
            return contains_idr_nalu(&self.payload);
        }

        true
    }

    /// Check if this is an AVC sequence header (AVCDecoderConfigurationRecord)
    pub fn is_avc_sequence_header(&self) -> bool {
        self.is_video()
            && self.payload.len() >= 2
            && self.payload[0] & 0x0F == CODEC_ID_AVC
            && self.payload[1] == 0
    }

    /// Check if this is an AAC sequence header (AudioSpecificConfig)
    pub fn is_aac_sequence_header(&self) -> bool {
        self.is_audio()
            && self.payload.len() >= 2
            && (self.payload[0] >> 4) & 0x0F == 10
            && self.payload[1] == 0
    }

    /// Whether this tag belongs in the replay prologue rather than the
    /// media timeline: the onMetaData script tag or a codec sequence header.
    pub fn is_prologue_tag(&self) -> bool {
        self.is_script() || self.is_avc_sequence_header() || self.is_aac_sequence_header()
    }

    pub fn data_size(&self) -> usize {
        self.payload.len()
    }

    /// Serialize to the on-wire form: header(11) + payload + prevTagSize(4).
    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(TAG_HEADER_SIZE + self.payload.len() + PREV_TAG_SIZE_LEN);

        buf.put_u8(self.tag_type.as_byte());

        let size = self.payload.len() as u32;
        buf.put_u8((size >> 16) as u8);
        buf.put_u8((size >> 8) as u8);
        buf.put_u8(size as u8);

        buf.put_u8((self.timestamp >> 16) as u8);
        buf.put_u8((self.timestamp >> 8) as u8);
        buf.put_u8(self.timestamp as u8);
        buf.put_u8((self.timestamp >> 24) as u8);

        // stream id, always zero
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u8(0);

        buf.put_slice(&self.payload);

        buf.put_u32(TAG_HEADER_SIZE as u32 + size);

        buf.freeze()
    }
}

/// Walk length-prefixed NAL units in an AVC NALU payload looking for an IDR
/// slice. Layout: byte 0 frame/codec, byte 1 packet type, bytes 2-4
/// composition time, then repeated { length(4) | nalu }.
fn contains_idr_nalu(payload: &[u8]) -> bool {
    let mut pos = 5;
    while pos + 4 <= payload.len() {
        let len = u32::from_be_bytes([
            payload[pos],
            payload[pos + 1],
            payload[pos + 2],
            payload[pos + 3],
        ]) as usize;
        pos += 4;
        if len == 0 || pos >= payload.len() {
            break;
        }
        if payload[pos] & 0x1F == NAL_TYPE_IDR {
            return true;
        }
        pos += len;
    }
    false
}

/// Rewrite the 4 timestamp bytes of an encoded tag in place.
///
/// `buf` must start at the tag header (24-bit low in bytes 4-6, extended
/// byte at index 7).
pub fn patch_timestamp(buf: &mut [u8], timestamp: u32) {
    if buf.len() < TAG_HEADER_SIZE {
        return;
    }
    buf[4] = (timestamp >> 16) as u8;
    buf[5] = (timestamp >> 8) as u8;
    buf[6] = timestamp as u8;
    buf[7] = (timestamp >> 24) as u8;
}

/// Read the timestamp out of an encoded tag header.
pub fn read_timestamp(buf: &[u8]) -> Option<u32> {
    if buf.len() < TAG_HEADER_SIZE {
        return None;
    }
    Some(
        (u32::from(buf[4]) << 16)
            | (u32::from(buf[5]) << 8)
            | u32::from(buf[6])
            | (u32::from(buf[7]) << 24),
    )
}

/// A tag in its cached wire form.
///
/// Fan-out and the GOP cache work on these: the bytes are the full frame
/// (header + payload + prevTagSize) with the ORIGINAL upstream timestamp;
/// per-viewer rebasing copies and patches the header at enqueue time.
#[derive(Debug, Clone)]
pub struct FramedTag {
    pub tag_type: FlvTagType,
    /// Original upstream timestamp in milliseconds
    pub timestamp: u32,
    pub is_keyframe: bool,
    pub is_sequence_header: bool,
    pub bytes: Bytes,
}

impl FramedTag {
    pub fn from_tag(tag: &FlvTag) -> Self {
        Self {
            tag_type: tag.tag_type,
            timestamp: tag.timestamp,
            is_keyframe: tag.is_keyframe(),
            is_sequence_header: tag.is_avc_sequence_header() || tag.is_aac_sequence_header(),
            bytes: tag.encode(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_type_round_trip() {
        assert_eq!(FlvTagType::from_byte(8), Some(FlvTagType::Audio));
        assert_eq!(FlvTagType::from_byte(9), Some(FlvTagType::Video));
        assert_eq!(FlvTagType::from_byte(18), Some(FlvTagType::Script));
        assert_eq!(FlvTagType::from_byte(10), None);

        assert_eq!(FlvTagType::Audio.as_byte(), 8);
        assert_eq!(FlvTagType::Video.as_byte(), 9);
        assert_eq!(FlvTagType::Script.as_byte(), 18);
    }

    #[test]
    fn test_video_frame_type() {
        // Keyframe + AVC
        assert_eq!(
            VideoFrameType::from_byte(0x17),
            Some(VideoFrameType::Keyframe)
        );
        // Inter frame + AVC
        assert_eq!(
            VideoFrameType::from_byte(0x27),
            Some(VideoFrameType::InterFrame)
        );
        assert_eq!(VideoFrameType::from_byte(0x00), None);
    }

    #[test]
    fn test_keyframe_non_avc() {
        // Keyframe nibble with VP6: frame type alone decides
        let tag = FlvTag::video(0, Bytes::from_static(&[0x14, 0x01]));
        assert!(tag.is_keyframe());

        let inter = FlvTag::video(0, Bytes::from_static(&[0x24, 0x01]));
        assert!(!inter.is_keyframe());
    }

    #[test]
    fn test_keyframe_avc_idr_refinement() {
        // AVC NALU packet with an IDR slice (nal type 5)
        let idr = FlvTag::video(
            0,
            Bytes::from_static(&[
                0x17, 0x01, 0x00, 0x00, 0x00, // frame/codec, pkt type, cts
                0x00, 0x00, 0x00, 0x02, 0x65, 0x88, // len=2, nal 0x65 (IDR)
            ]),
        );
        assert!(idr.is_keyframe());

        // AVC NALU packet with only a non-IDR slice despite the keyframe nibble
        let not_idr = FlvTag::video(
            0,
            Bytes::from_static(&[
                0x17, 0x01, 0x00, 0x00, 0x00, //
                0x00, 0x00, 0x00, 0x02, 0x41, 0x9A, // nal 0x41 (non-IDR slice)
            ]),
        );
        assert!(!not_idr.is_keyframe());

        // Multiple NALUs: SEI then IDR
        let sei_then_idr = FlvTag::video(
            0,
            Bytes::from_static(&[
                0x17, 0x01, 0x00, 0x00, 0x00, //
                0x00, 0x00, 0x00, 0x02, 0x06, 0x05, // SEI
                0x00, 0x00, 0x00, 0x02, 0x65, 0x88, // IDR
            ]),
        );
        assert!(sei_then_idr.is_keyframe());
    }

    #[test]
    fn test_avc_sequence_header() {
        let header = FlvTag::video(0, Bytes::from_static(&[0x17, 0x00, 0x00, 0x00, 0x00]));
        assert!(header.is_avc_sequence_header());
        // Sequence header is not a NALU packet; nibble decides
        assert!(header.is_keyframe());

        let frame = FlvTag::video(0, Bytes::from_static(&[0x17, 0x01, 0x00, 0x00, 0x00]));
        assert!(!frame.is_avc_sequence_header());
    }

    #[test]
    fn test_aac_sequence_header() {
        let header = FlvTag::audio(0, Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]));
        assert!(header.is_aac_sequence_header());

        let frame = FlvTag::audio(0, Bytes::from_static(&[0xAF, 0x01, 0x21, 0x00]));
        assert!(!frame.is_aac_sequence_header());
    }

    #[test]
    fn test_prologue_tag_classification() {
        assert!(FlvTag::script(0, Bytes::from_static(b"onMetaData")).is_prologue_tag());
        assert!(FlvTag::video(0, Bytes::from_static(&[0x17, 0x00])).is_prologue_tag());
        assert!(FlvTag::audio(0, Bytes::from_static(&[0xAF, 0x00])).is_prologue_tag());
        assert!(!FlvTag::audio(0, Bytes::from_static(&[0xAF, 0x01])).is_prologue_tag());
        assert!(!FlvTag::video(0, Bytes::from_static(&[0x27, 0x01])).is_prologue_tag());
    }

    #[test]
    fn test_encode_layout() {
        let tag = FlvTag::video(0x01020304, Bytes::from_static(&[0x17, 0x01, 0xAA]));
        let wire = tag.encode();

        assert_eq!(wire.len(), TAG_HEADER_SIZE + 3 + PREV_TAG_SIZE_LEN);
        assert_eq!(wire[0], 9); // video
        assert_eq!(&wire[1..4], &[0x00, 0x00, 0x03]); // data size
        assert_eq!(&wire[4..7], &[0x02, 0x03, 0x04]); // ts low 24 bits
        assert_eq!(wire[7], 0x01); // ts extended byte
        assert_eq!(&wire[8..11], &[0x00, 0x00, 0x00]); // stream id
        assert_eq!(&wire[11..14], &[0x17, 0x01, 0xAA]); // payload
        assert_eq!(&wire[14..18], &(11u32 + 3).to_be_bytes()); // prev tag size
    }

    #[test]
    fn test_patch_and_read_timestamp() {
        let tag = FlvTag::audio(1000, Bytes::from_static(&[0xAF, 0x01]));
        let mut wire = tag.encode().to_vec();
        assert_eq!(read_timestamp(&wire), Some(1000));

        patch_timestamp(&mut wire, 0x0100_0250);
        assert_eq!(read_timestamp(&wire), Some(0x0100_0250));
        assert_eq!(wire[7], 0x01); // extended byte carries the high bits
    }

    #[test]
    fn test_framed_tag_flags() {
        let kf = FlvTag::video(500, Bytes::from_static(&[0x14, 0x01]));
        let framed = FramedTag::from_tag(&kf);
        assert!(framed.is_keyframe);
        assert!(!framed.is_sequence_header);
        assert_eq!(framed.timestamp, 500);
        assert_eq!(framed.len(), kf.encode().len());

        let hdr = FlvTag::video(0, Bytes::from_static(&[0x17, 0x00]));
        let framed = FramedTag::from_tag(&hdr);
        assert!(framed.is_sequence_header);
    }

    #[test]
    fn test_empty_payload() {
        let tag = FlvTag::video(0, Bytes::new());
        assert!(tag.video_frame_type().is_none());
        assert!(tag.video_codec_id().is_none());
        assert!(!tag.is_keyframe());
        assert!(!tag.is_avc_sequence_header());
    }

    #[test]
    fn test_truncated_nalu_walk() {
        // Length prefix runs past the payload: must not panic, not a keyframe
        let tag = FlvTag::video(
            0,
            Bytes::from_static(&[0x17, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10]),
        );
        assert!(!tag.is_keyframe());
    }
}
