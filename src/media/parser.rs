//! Streaming FLV parser
//!
//! Reads fully-framed tags off an upstream byte stream. The stream must
//! open with the 9-byte FLV signature and the zero PreviousTagSize; after
//! that, tags are self-delimiting.
//!
//! The parser also drives the initial-tag capture: the FLV header plus the
//! run of tags up to and including the onMetaData script tag and the
//! AVC/AAC sequence headers form the "replay prologue" handed to every new
//! viewer before any media tag.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{RelayError, Result};

use super::flv::{FlvTag, FlvTagType, FLV_HEADER_SIZE, PREV_TAG_SIZE_LEN, TAG_HEADER_SIZE};

/// Captured replay prologue.
#[derive(Debug, Clone)]
pub struct Prologue {
    /// FLV header + onMetaData + sequence-header tags, with the prologue
    /// tags' timestamps normalized to 0. Delivered verbatim to every viewer
    /// before any media tag.
    pub bytes: Bytes,
    /// The first media tag encountered while capturing, if capture ended by
    /// running into the live timeline rather than by completing the tag set.
    pub first_media: Option<FlvTag>,
}

/// Streaming tag reader over an upstream body.
pub struct FlvReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FlvReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Fill `buf` completely. `Ok(false)` means the stream ended cleanly
    /// before the first byte; a partial read is a parse error.
    async fn fill(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut read = 0;
        while read < buf.len() {
            let n = self.inner.read(&mut buf[read..]).await?;
            if n == 0 {
                if read == 0 {
                    return Ok(false);
                }
                return Err(RelayError::Parse(format!(
                    "short read: wanted {} bytes, got {}",
                    buf.len(),
                    read
                )));
            }
            read += n;
        }
        Ok(true)
    }

    /// Read and validate the 9-byte FLV header plus the initial 4-byte
    /// PreviousTagSize, returning the raw bytes.
    pub async fn read_stream_header(&mut self) -> Result<Bytes> {
        let mut buf = [0u8; FLV_HEADER_SIZE + PREV_TAG_SIZE_LEN];
        if !self.fill(&mut buf).await? {
            return Err(RelayError::UpstreamClosed);
        }

        if &buf[0..3] != b"FLV" {
            return Err(RelayError::Parse(format!(
                "bad flv signature: {:02x} {:02x} {:02x}",
                buf[0], buf[1], buf[2]
            )));
        }
        let header_len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
        if header_len != FLV_HEADER_SIZE as u32 {
            return Err(RelayError::Parse(format!(
                "unexpected flv header length {header_len}"
            )));
        }
        let prev_size = u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]);
        if prev_size != 0 {
            return Err(RelayError::Parse(format!(
                "initial PreviousTagSize is {prev_size}, expected 0"
            )));
        }

        Ok(Bytes::copy_from_slice(&buf))
    }

    /// Read the next fully-framed tag.
    ///
    /// Clean EOF at a tag boundary maps to [`RelayError::UpstreamClosed`];
    /// truncation anywhere inside the frame is a parse error.
    pub async fn next_tag(&mut self) -> Result<FlvTag> {
        let mut header = [0u8; TAG_HEADER_SIZE];
        if !self.fill(&mut header).await? {
            return Err(RelayError::UpstreamClosed);
        }

        let tag_type = FlvTagType::from_byte(header[0])
            .ok_or_else(|| RelayError::Parse(format!("unknown tag type {}", header[0])))?;

        let data_size = (u32::from(header[1]) << 16)
            | (u32::from(header[2]) << 8)
            | u32::from(header[3]);
        let timestamp = (u32::from(header[4]) << 16)
            | (u32::from(header[5]) << 8)
            | u32::from(header[6])
            | (u32::from(header[7]) << 24);

        let stream_id = (u32::from(header[8]) << 16)
            | (u32::from(header[9]) << 8)
            | u32::from(header[10]);
        if stream_id != 0 {
            tracing::debug!(stream_id, "non-zero stream id in tag header");
        }

        let mut payload = vec![0u8; data_size as usize];
        if !self.fill(&mut payload).await? {
            return Err(RelayError::Parse("stream ended inside tag payload".into()));
        }

        let mut prev = [0u8; PREV_TAG_SIZE_LEN];
        if !self.fill(&mut prev).await? {
            return Err(RelayError::Parse(
                "stream ended before PreviousTagSize".into(),
            ));
        }

        Ok(FlvTag {
            tag_type,
            timestamp,
            payload: Bytes::from(payload),
        })
    }

    /// Capture the replay prologue, bounded by `deadline`.
    ///
    /// Consumes the FLV header and then tags until the script tag and both
    /// sequence headers have been seen, or until the first plain media tag
    /// arrives (which is handed back untouched in `first_media`). Prologue
    /// tags are re-encoded with timestamp 0 so a fresh viewer timeline
    /// starts at the origin.
    pub async fn read_prologue(&mut self, deadline: Duration) -> Result<Prologue> {
        tokio::time::timeout(deadline, self.capture_prologue())
            .await
            .map_err(|_| RelayError::HeaderTimeout)?
    }

    async fn capture_prologue(&mut self) -> Result<Prologue> {
        let header = self.read_stream_header().await?;

        let mut buf = BytesMut::from(&header[..]);
        let mut have_script = false;
        let mut have_video_header = false;
        let mut have_audio_header = false;

        loop {
            let tag = self.next_tag().await?;

            if tag.is_prologue_tag() {
                if tag.is_script() {
                    have_script = true;
                } else if tag.is_avc_sequence_header() {
                    have_video_header = true;
                } else {
                    have_audio_header = true;
                }

                let normalized = FlvTag {
                    timestamp: 0,
                    ..tag
                };
                buf.put_slice(&normalized.encode());

                if have_script && have_video_header && have_audio_header {
                    return Ok(Prologue {
                        bytes: buf.freeze(),
                        first_media: None,
                    });
                }
                continue;
            }

            // Live timeline reached. The capture only counts if it actually
            // produced something a decoder can initialize from.
            if !(have_script || have_video_header || have_audio_header) {
                return Err(RelayError::Parse(
                    "media tag before metadata and sequence headers".into(),
                ));
            }
            return Ok(Prologue {
                bytes: buf.freeze(),
                first_media: Some(tag),
            });
        }
    }
}
