//! Outbound chunk framing for the write channels.
//!
//! Every write is a sequence of frames `[tag][payload...]` of at most
//! [`FRAME_BUDGET`] bytes:
//!
//! ```text
//! 0x01 Start   overwrite the field with payload (empty payload clears it)
//! 0x02 Append  extend the field with payload
//! ```
//!
//! Chunk boundaries never fall inside a multi-byte UTF-8 sequence, so the
//! peripheral can decode a partially received field at any frame boundary.

/// Largest frame the peripheral accepts in one write, tag byte included.
pub const FRAME_BUDGET: usize = 18;

/// Payload bytes per frame.
pub const MAX_CHUNK_PAYLOAD: usize = FRAME_BUDGET - 1;

pub const TAG_START: u8 = 0x01;
pub const TAG_APPEND: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    Start,
    Append,
}

impl FrameTag {
    pub fn to_byte(self) -> u8 {
        match self {
            FrameTag::Start => TAG_START,
            FrameTag::Append => TAG_APPEND,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            TAG_START => Some(FrameTag::Start),
            TAG_APPEND => Some(FrameTag::Append),
            _ => None,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is empty")]
    Empty,
    #[error("unknown frame tag 0x{0:02x}")]
    UnknownTag(u8),
    #[error("frame header truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
}

/// One tagged fragment of an outbound write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub tag: FrameTag,
    pub payload: Vec<u8>,
}

impl OutboundFrame {
    pub fn start(payload: &[u8]) -> Self {
        Self {
            tag: FrameTag::Start,
            payload: payload.to_vec(),
        }
    }

    pub fn append(payload: &[u8]) -> Self {
        Self {
            tag: FrameTag::Append,
            payload: payload.to_vec(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.payload.len());
        buf.push(self.tag.to_byte());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        let (&tag, payload) = data.split_first().ok_or(FrameError::Empty)?;
        let tag = FrameTag::from_byte(tag).ok_or(FrameError::UnknownTag(tag))?;
        Ok(Self {
            tag,
            payload: payload.to_vec(),
        })
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// Split `bytes` into chunks of at most `budget` bytes without cutting a
/// UTF-8 sequence.
///
/// A boundary that would land on a continuation byte is moved back to the
/// start of that code point. If that leaves an empty chunk (only possible
/// with a budget below 4) the naive boundary is used.
pub fn split_utf8(bytes: &[u8], budget: usize) -> Vec<&[u8]> {
    let budget = budget.max(1);
    let mut chunks = Vec::with_capacity(bytes.len().div_ceil(budget));
    let mut start = 0;

    while start < bytes.len() {
        let mut end = (start + budget).min(bytes.len());
        if end < bytes.len() {
            let mut cut = end;
            while cut > start && is_continuation(bytes[cut]) {
                cut -= 1;
            }
            if cut > start {
                end = cut;
            }
        }
        chunks.push(&bytes[start..end]);
        start = end;
    }

    chunks
}

/// Frames for one logical write of `text` with the default budget.
pub fn frames(text: &str) -> Vec<OutboundFrame> {
    frames_with_budget(text, MAX_CHUNK_PAYLOAD)
}

/// Frames for one logical write of `text`.
///
/// An empty string yields exactly one empty `Start` frame, which the
/// peripheral treats as "clear field".
pub fn frames_with_budget(text: &str, budget: usize) -> Vec<OutboundFrame> {
    if text.is_empty() {
        return vec![OutboundFrame::start(&[])];
    }

    split_utf8(text.as_bytes(), budget)
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            if i == 0 {
                OutboundFrame::start(chunk)
            } else {
                OutboundFrame::append(chunk)
            }
        })
        .collect()
}

/// Peripheral-side field state built from received frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldBuffer {
    value: Vec<u8>,
}

impl FieldBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one raw frame. Frames with an unknown tag are ignored.
    pub fn apply(&mut self, raw: &[u8]) {
        match OutboundFrame::from_bytes(raw) {
            Ok(frame) => self.apply_frame(&frame),
            Err(e) => log::debug!("ignoring field frame: {e}"),
        }
    }

    pub fn apply_frame(&mut self, frame: &OutboundFrame) {
        match frame.tag {
            FrameTag::Start => self.value = frame.payload.clone(),
            FrameTag::Append => self.value.extend_from_slice(&frame.payload),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.value
    }

    /// Decoded value, `None` while the buffer is not valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_text_is_single_clear_frame() {
        let frames = frames("");
        assert_eq!(frames, vec![OutboundFrame::start(&[])]);
        assert_eq!(frames[0].to_bytes(), vec![TAG_START]);
    }

    #[test]
    fn short_text_fits_one_start_frame() {
        let frames = frames("héllo");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].tag, FrameTag::Start);
        assert_eq!(frames[0].payload, "héllo".as_bytes());
        assert_eq!(frames[0].payload.len(), 6);
    }

    #[test]
    fn long_text_start_then_append() {
        let text = "a".repeat(40);
        let frames = frames(&text);
        let tags: Vec<_> = frames.iter().map(|f| f.tag).collect();
        assert_eq!(
            tags,
            vec![FrameTag::Start, FrameTag::Append, FrameTag::Append]
        );
        assert_eq!(frames[0].payload.len(), 17);
        assert_eq!(frames[1].payload.len(), 17);
        assert_eq!(frames[2].payload.len(), 6);
        assert!(frames.iter().all(|f| f.to_bytes().len() <= FRAME_BUDGET));
    }

    #[test]
    fn boundary_backs_off_before_multibyte() {
        // 16 ASCII bytes then a 2-byte 'é': the naive cut at 17 would split it.
        let text = format!("{}é{}", "x".repeat(16), "y".repeat(3));
        let chunks = split_utf8(text.as_bytes(), MAX_CHUNK_PAYLOAD);
        assert_eq!(chunks[0].len(), 16);
        assert_eq!(chunks[1], "éyyy".as_bytes());
    }

    #[test]
    fn four_byte_code_points() {
        let text = "🦀".repeat(10);
        let chunks = split_utf8(text.as_bytes(), MAX_CHUNK_PAYLOAD);
        let lens: Vec<_> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(lens, vec![16, 16, 8]);
        for chunk in chunks {
            assert!(std::str::from_utf8(chunk).is_ok());
        }
    }

    #[test]
    fn tiny_budget_accepts_naive_boundary() {
        let chunks = split_utf8("é".as_bytes(), 1);
        assert_eq!(chunks, vec![&[0xC3][..], &[0xA9][..]]);
    }

    #[test]
    fn frame_bytes() {
        let frame = OutboundFrame::from_bytes(&[TAG_APPEND, b'h', b'i']).unwrap();
        assert_eq!(frame, OutboundFrame::append(b"hi"));
        assert_eq!(OutboundFrame::from_bytes(&[]), Err(FrameError::Empty));
        assert_eq!(
            OutboundFrame::from_bytes(&[0x07, 1]),
            Err(FrameError::UnknownTag(0x07))
        );
    }

    #[test]
    fn field_buffer_clear_and_overwrite() {
        let mut field = FieldBuffer::new();
        for frame in frames("previous-value-that-is-long") {
            field.apply(&frame.to_bytes());
        }
        assert_eq!(field.as_str(), Some("previous-value-that-is-long"));

        for frame in frames("") {
            field.apply(&frame.to_bytes());
        }
        assert_eq!(field.as_str(), Some(""));

        field.apply(&[0x09, b'z']);
        assert_eq!(field.as_str(), Some(""));
    }

    proptest! {
        #[test]
        fn split_preserves_bytes_and_code_points(text in "\\PC{0,80}") {
            let frames = frames(&text);
            let joined: Vec<u8> = frames.iter().flat_map(|f| f.payload.clone()).collect();
            prop_assert_eq!(joined, text.as_bytes().to_vec());

            for (i, frame) in frames.iter().enumerate() {
                let expected = if i == 0 { FrameTag::Start } else { FrameTag::Append };
                prop_assert_eq!(frame.tag, expected);
                prop_assert!(frame.payload.len() <= MAX_CHUNK_PAYLOAD);
                prop_assert!(std::str::from_utf8(&frame.payload).is_ok());
            }

            let mut field = FieldBuffer::new();
            for frame in &frames {
                field.apply(&frame.to_bytes());
            }
            prop_assert_eq!(field.as_str(), Some(text.as_str()));
        }
    }
}
