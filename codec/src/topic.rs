// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::fmt;
use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt};

use crate::error::{DecodeError, EncodeError};
use crate::utils;
use crate::{ByteArray, DecodePacket, EncodePacket};

fn validate_pub_topic(s: &str) -> Result<(), EncodeError> {
    if s.is_empty() {
        return Err(EncodeError::InvalidTopic);
    }
    // Topic names used in PUBLISH packets must not contain wildcard characters
    // [MQTT-3.3.2-2].
    if s.contains('+') || s.contains('#') {
        return Err(EncodeError::InvalidTopic);
    }
    utils::validate_utf8_string(s)?;
    Ok(())
}

/// Topic name as carried by a PUBLISH packet. Unlike a `SubTopic` it never contains
/// wildcard characters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PubTopic(String);

impl PubTopic {
    /// Create a new publish topic.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is empty or contains a wildcard character.
    pub fn new(topic: &str) -> Result<Self, EncodeError> {
        validate_pub_topic(topic)?;
        Ok(Self(topic.to_string()))
    }

    /// Get byte length in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }

    /// Returns true if the leading topic level starts with `$`, e.g. `$SYS/...`.
    #[must_use]
    pub fn is_system_topic(&self) -> bool {
        self.0.starts_with('$')
    }
}

impl AsRef<str> for PubTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PubTopic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DecodePacket for PubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()?;
        let s = ba.read_string(len as usize)?;
        validate_pub_topic(&s).map_err(|_err| DecodeError::InvalidTopic)?;
        Ok(Self(s))
    }
}

impl EncodePacket for PubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        let len = self.0.len() as u16;
        buf.write_u16::<BigEndian>(len)?;
        buf.write_all(self.0.as_bytes())?;
        Ok(self.bytes())
    }
}

fn validate_sub_topic(s: &str) -> Result<(), EncodeError> {
    if s.is_empty() {
        return Err(EncodeError::InvalidTopic);
    }
    utils::validate_utf8_string(s)?;

    let levels: Vec<&str> = s.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.len() > 1 && (level.contains('+') || level.contains('#')) {
            // `+` and `#` must occupy an entire topic level on their own.
            return Err(EncodeError::InvalidTopic);
        }
        if *level == "#" && i != levels.len() - 1 {
            // `#` is only valid as the last character in the filter.
            return Err(EncodeError::InvalidTopic);
        }
    }
    Ok(())
}

/// Topic filter as carried by SUBSCRIBE and UNSUBSCRIBE packets. May contain the
/// single-level `+` and multi-level `#` wildcard characters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SubTopic(String);

impl SubTopic {
    /// Create a new subscribe topic filter.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is empty or uses wildcard characters incorrectly.
    pub fn new(topic: &str) -> Result<Self, EncodeError> {
        validate_sub_topic(topic)?;
        Ok(Self(topic.to_string()))
    }

    /// Get byte length in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }
}

impl AsRef<str> for SubTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubTopic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DecodePacket for SubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()?;
        let s = ba.read_string(len as usize)?;
        validate_sub_topic(&s).map_err(|_err| DecodeError::InvalidTopic)?;
        Ok(Self(s))
    }
}

impl EncodePacket for SubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        let len = self.0.len() as u16;
        buf.write_u16::<BigEndian>(len)?;
        buf.write_all(self.0.as_bytes())?;
        Ok(self.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filters_rejected() {
        assert!(SubTopic::new("sport+").is_err());
        assert!(SubTopic::new("sport/#/player1").is_err());
        assert!(PubTopic::new("sport/+").is_err());
    }
}
