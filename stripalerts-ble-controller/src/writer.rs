//! Chunked writes of text fields.

use std::time::Duration;

use stripalerts_proto::Channel;
use stripalerts_proto::chunk::{self, MAX_CHUNK_PAYLOAD};

use crate::error::TransportError;
use crate::link::TransportLink;

/// Gap between two frames of one write. The peripheral's receive buffer
/// overflows below this, so it is not configurable.
pub const FRAME_PACING: Duration = Duration::from_millis(50);

/// Splits text into Start/Append frames and sends them in order with a fixed
/// gap between frames.
#[derive(Debug, Clone)]
pub struct ChunkedWriter {
    pacing: Duration,
    budget: usize,
}

impl Default for ChunkedWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedWriter {
    pub fn new() -> Self {
        Self {
            pacing: FRAME_PACING,
            budget: MAX_CHUNK_PAYLOAD,
        }
    }

    pub fn pacing(&self) -> Duration {
        self.pacing
    }

    /// Write `text` to `channel`.
    ///
    /// A frame that fails because the link is gone gets one reconnect and one
    /// retry. On error the peripheral holds a partial value; callers must
    /// rewrite the whole field.
    pub async fn write<L>(
        &self,
        link: &mut L,
        channel: Channel,
        text: &str,
    ) -> Result<(), TransportError>
    where
        L: TransportLink + ?Sized,
    {
        let frames = chunk::frames_with_budget(text, self.budget);
        if channel.is_secret() {
            log::debug!("writing {channel}: *** in {} frame(s)", frames.len());
        } else {
            log::debug!("writing {channel}: {text:?} in {} frame(s)", frames.len());
        }

        for (i, frame) in frames.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.pacing).await;
            }
            let bytes = frame.to_bytes();
            match link.write_frame(channel, &bytes).await {
                Ok(()) => {}
                Err(e) if e.is_link_lost() => {
                    log::warn!("link lost writing {channel} frame {i}, reconnecting");
                    link.reconnect()
                        .await
                        .map_err(|e| write_failed(channel, &e))?;
                    link.write_frame(channel, &bytes)
                        .await
                        .map_err(|e| write_failed(channel, &e))?;
                }
                Err(e) => return Err(write_failed(channel, &e)),
            }
        }
        Ok(())
    }
}

fn write_failed(channel: Channel, cause: &TransportError) -> TransportError {
    match cause {
        TransportError::WriteFailed { .. } => cause.clone(),
        _ => TransportError::WriteFailed {
            channel,
            reason: cause.to_string(),
        },
    }
}
