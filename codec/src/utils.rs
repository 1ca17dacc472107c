// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::fmt;
use std::str;

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::error::{DecodeError, EncodeError};

/// Generate random string, used to assign a client id when none was supplied.
#[must_use]
pub fn random_string(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Two Byte Integer length prefixes cap the data they describe at this many bytes.
pub const MAX_TWO_BYTES_DATA: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringError {
    /// String is longer than fits in a two byte length prefix.
    TooLong,

    /// Bytes are not valid UTF-8.
    InvalidUtf8,

    /// String contains the disallowed null character [MQTT-1.5.4-2].
    ContainsNulChar,
}

impl fmt::Display for StringError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for StringError {}

/// Check that `s` can be encoded as MQTT String Data.
///
/// # Errors
///
/// Returns error if `s` is too long or contains the null character.
pub fn validate_utf8_string(s: &str) -> Result<(), StringError> {
    if s.len() > MAX_TWO_BYTES_DATA {
        return Err(StringError::TooLong);
    }
    if s.contains('\u{0000}') {
        return Err(StringError::ContainsNulChar);
    }
    Ok(())
}

/// Convert raw bytes read off the wire into an owned UTF-8 `String`.
///
/// # Errors
///
/// Returns error if `bytes` do not form valid UTF-8.
pub fn to_utf8_string(bytes: &[u8]) -> Result<String, StringError> {
    str::from_utf8(bytes)
        .map(ToString::to_string)
        .map_err(|_err| StringError::InvalidUtf8)
}

/// Check that `data` fits within a two byte length prefix.
///
/// # Errors
///
/// Returns error if `data` is longer than `MAX_TWO_BYTES_DATA` bytes.
pub fn validate_two_bytes_data(data: &[u8]) -> Result<(), EncodeError> {
    if data.len() > MAX_TWO_BYTES_DATA {
        return Err(EncodeError::TooManyData);
    }
    Ok(())
}

#[derive(Debug)]
pub enum ClientIdError {
    /// No chars.
    IsEmpty,

    /// Larger than 23 chars [MQTT-3.1.3-5].
    TooLong,

    /// Can only contain `0-9a-zA-Z`.
    InvalidChars,
}

/// Check that `client_id` meets the restrictions a Server is allowed to enforce.
///
/// A Server MAY allow `ClientId`s that contain more or different characters, this
/// implementation only guarantees the minimal portable charset [MQTT-3.1.3-5].
///
/// # Errors
///
/// Returns error if `client_id` is empty, too long or has non-alphanumeric characters.
pub fn validate_client_id(client_id: &str) -> Result<(), ClientIdError> {
    if client_id.is_empty() {
        // Empty client ids are handled specially by the Server [MQTT-3.1.3-6]; this
        // function only validates client-supplied non-empty ids.
        return Ok(());
    }
    if client_id.len() > 23 {
        return Err(ClientIdError::TooLong);
    }
    if !client_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ClientIdError::InvalidChars);
    }
    Ok(())
}

/// Check that `keep_alive` is in range.
///
/// # Errors
///
/// Returns error if `keep_alive` is non-zero but smaller than the minimum accepted value.
pub const fn validate_keep_alive(keep_alive: u16) -> Result<(), DecodeError> {
    if keep_alive != 0 && keep_alive < 5 {
        Err(DecodeError::OtherErrors)
    } else {
        Ok(())
    }
}
