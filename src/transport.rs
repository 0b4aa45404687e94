//! WebSocket framing for protocol envelopes
//!
//! Text and binary frames both carry one JSON envelope. Pings are answered
//! by tungstenite itself; [`next_envelope`] skips control frames while
//! [`next_frame`] reports them.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

use crate::error::Result;
use crate::protocol::MessageEnvelope;

/// What the next frame turned out to be
#[derive(Debug)]
pub(crate) enum Inbound {
    Envelope(MessageEnvelope),
    /// A data frame that is not a valid envelope
    Malformed(serde_json::Error),
    /// Close frame or end of stream
    Closed,
}

/// Send one envelope as a text frame
pub(crate) async fn send_envelope<S>(write: &mut S, envelope: &MessageEnvelope) -> Result<()>
where
    S: SinkExt<WsMessage, Error = WsError> + Unpin,
{
    let json = envelope.to_json()?;
    write.send(WsMessage::Text(json)).await?;
    Ok(())
}

/// Read frames until an envelope, a malformed data frame, or the end
///
/// Cancel safe: nothing is consumed without being returned.
pub(crate) async fn next_envelope<R>(read: &mut R) -> Result<Inbound>
where
    R: StreamExt<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    loop {
        if let Some(inbound) = next_frame(read).await? {
            return Ok(inbound);
        }
    }
}

/// Read one frame. Ping and pong frames come back as `None` so callers
/// can treat them as a sign of life.
pub(crate) async fn next_frame<R>(read: &mut R) -> Result<Option<Inbound>>
where
    R: StreamExt<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    let parsed = match read.next().await {
        Some(Ok(WsMessage::Text(text))) => MessageEnvelope::from_json(&text),
        Some(Ok(WsMessage::Binary(data))) => MessageEnvelope::from_json_bytes(&data),
        Some(Ok(WsMessage::Close(_))) | None => return Ok(Some(Inbound::Closed)),
        Some(Ok(_)) => return Ok(None),
        Some(Err(WsError::ConnectionClosed)) => return Ok(Some(Inbound::Closed)),
        Some(Err(e)) => return Err(e.into()),
    };
    Ok(Some(match parsed {
        Ok(envelope) => Inbound::Envelope(envelope),
        Err(e) => Inbound::Malformed(e),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    use crate::protocol::{Message, OkReply};

    fn frames(messages: Vec<WsMessage>) -> impl StreamExt<Item = std::result::Result<WsMessage, WsError>> + Unpin {
        stream::iter(messages.into_iter().map(Ok::<_, WsError>))
    }

    #[tokio::test]
    async fn test_control_frames_are_skipped() {
        let envelope = MessageEnvelope::new(Message::OkReply(OkReply {}));
        let mut read = frames(vec![
            WsMessage::Ping(vec![1]),
            WsMessage::Pong(Vec::new()),
            WsMessage::Text(envelope.to_json().unwrap()),
        ]);

        match next_envelope(&mut read).await.unwrap() {
            Inbound::Envelope(received) => assert_eq!(received.id, envelope.id),
            other => panic!("expected envelope, got {:?}", other),
        }
        assert!(matches!(next_envelope(&mut read).await.unwrap(), Inbound::Closed));
    }

    #[tokio::test]
    async fn test_next_frame_reports_pings() {
        let mut read = frames(vec![WsMessage::Ping(Vec::new()), WsMessage::Text("{".into())]);

        assert!(next_frame(&mut read).await.unwrap().is_none());
        assert!(matches!(next_frame(&mut read).await.unwrap(), Some(Inbound::Malformed(_))));
    }
}
