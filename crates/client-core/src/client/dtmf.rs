//! DTMF sending (RFC 4733 via the media session)

use super::SoftphoneClient;
use crate::call::{CallState, SessionId};
use crate::error::{ClientError, ClientResult};
use crate::events::ClientEvent;
use crate::media::MediaError;
use std::time::Duration;
use tracing::debug;

/// Default tone duration handed to the media session.
const TONE_DURATION_MS: u32 = 100;
/// Default gap between tones in a sequence.
pub const DEFAULT_TONE_PAUSE: Duration = Duration::from_millis(200);
/// Default settle delay before the first tone of a sequence.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);

fn validate_tone(tone: char) -> ClientResult<char> {
    let tone = tone.to_ascii_uppercase();
    match tone {
        '0'..='9' | '*' | '#' | 'A'..='D' => Ok(tone),
        other => Err(ClientError::InvalidTone { tone: other }),
    }
}

impl SoftphoneClient {
    /// Send a single DTMF tone on an established call.
    pub async fn send_dtmf(&self, session_id: &SessionId, tone: char) -> ClientResult<()> {
        let tone = validate_tone(tone)?;
        let session = self.session_checked(session_id)?;
        if session.state() != CallState::Established {
            return Err(ClientError::SessionNotEstablished {
                session_id: session_id.to_string(),
                state: session.state(),
            });
        }
        let media = session
            .media_session()
            .ok_or(ClientError::DtmfUnsupported)?;
        match media.send_dtmf(tone, TONE_DURATION_MS).await {
            Ok(()) => {
                debug!(session = %session_id, tone = %tone, "DTMF sent");
                self.inner.bus.emit(ClientEvent::DtmfSent {
                    session_id: session.id.clone(),
                    tone,
                });
                Ok(())
            }
            Err(MediaError::Unsupported) => Err(ClientError::DtmfUnsupported),
            Err(MediaError::Failed { reason }) => Err(ClientError::Media { reason }),
        }
    }

    /// Send a sequence of tones, paced by `pause` between tones after an
    /// initial settle delay. The whole sequence is validated before the
    /// first tone goes out, and the future resolves only after the last
    /// tone was emitted.
    pub async fn send_dtmf_sequence(
        &self,
        session_id: &SessionId,
        sequence: &str,
        pause: Option<Duration>,
        initial_delay: Option<Duration>,
    ) -> ClientResult<()> {
        let pause = pause.unwrap_or(DEFAULT_TONE_PAUSE);
        let initial_delay = initial_delay.unwrap_or(DEFAULT_INITIAL_DELAY);

        let tones: Vec<char> = sequence
            .chars()
            .map(validate_tone)
            .collect::<ClientResult<_>>()?;
        if tones.is_empty() {
            return Ok(());
        }

        tokio::time::sleep(initial_delay).await;
        for (index, tone) in tones.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(pause).await;
            }
            self.send_dtmf(session_id, *tone).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tone_validation() {
        assert_eq!(validate_tone('5').unwrap(), '5');
        assert_eq!(validate_tone('a').unwrap(), 'A');
        assert_eq!(validate_tone('#').unwrap(), '#');
        assert_eq!(validate_tone('*').unwrap(), '*');
        assert!(matches!(
            validate_tone('E'),
            Err(ClientError::InvalidTone { tone: 'E' })
        ));
        assert!(validate_tone(' ').is_err());
    }
}
