//! Session descriptions exchanged while establishing a peer connection.
//!
//! A session description is a minimal SDP document. Only two attributes matter:
//!
//! - `a=candidate:<address>`: where the sender can be reached.
//! - `a=max-message-size:<bytes>`: the largest message the sender accepts.

use thiserror::Error;

const CANDIDATE: &str = "a=candidate:";
const MAX_MESSAGE_SIZE: &str = "a=max-message-size:";

#[derive(Debug, Error, PartialEq, Eq)]
/// Errors related to session descriptions.
pub enum SdpError {
    #[error("missing max-message-size attribute")]
    MissingMaxMessageSize,
    #[error("invalid max-message-size attribute `{0}`")]
    InvalidMaxMessageSize(String),
    #[error("missing candidate attribute")]
    MissingCandidate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// What a peer advertises about its side of a connection.
pub struct SessionDescription {
    pub candidate: String,
    pub max_message_size: usize,
}

impl SessionDescription {
    /// Renders the session description.
    pub fn to_sdp(&self) -> String {
        format!(
            "v=0\r\n\
             o=- 0 0 IN IP4 0.0.0.0\r\n\
             s=-\r\n\
             t=0 0\r\n\
             m=application 9 UDP webrtc-datachannel\r\n\
             {}{}\r\n\
             {}{}\r\n",
            CANDIDATE, self.candidate, MAX_MESSAGE_SIZE, self.max_message_size
        )
    }

    /// Parses a session description.
    ///
    /// # Errors
    /// Fails if the candidate or the maximum message size is missing, or if the
    /// maximum message size is not a positive integer.
    pub fn parse(sdp: &str) -> Result<Self, SdpError> {
        let max_message_size =
            attribute(sdp, MAX_MESSAGE_SIZE).ok_or(SdpError::MissingMaxMessageSize)?;
        let max_message_size = max_message_size
            .parse::<usize>()
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| SdpError::InvalidMaxMessageSize(max_message_size.to_string()))?;
        let candidate = attribute(sdp, CANDIDATE)
            .filter(|candidate| !candidate.is_empty())
            .ok_or(SdpError::MissingCandidate)?;

        Ok(Self {
            candidate: candidate.to_string(),
            max_message_size,
        })
    }
}

fn attribute<'a>(sdp: &'a str, name: &str) -> Option<&'a str> {
    sdp.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix(name))
        .map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdp() {
        let description = SessionDescription {
            candidate: "127.0.0.1:4000".to_string(),
            max_message_size: 16384,
        };
        assert_eq!(
            SessionDescription::parse(&description.to_sdp()).unwrap(),
            description
        );
    }

    #[test]
    fn test_missing_attributes() {
        assert_eq!(
            SessionDescription::parse("v=0\r\na=candidate:memory:1\r\n").unwrap_err(),
            SdpError::MissingMaxMessageSize
        );
        assert_eq!(
            SessionDescription::parse("v=0\r\na=max-message-size:abc\r\n").unwrap_err(),
            SdpError::InvalidMaxMessageSize("abc".to_string())
        );
        assert_eq!(
            SessionDescription::parse("v=0\r\na=max-message-size:1200\r\n").unwrap_err(),
            SdpError::MissingCandidate
        );
    }
}
