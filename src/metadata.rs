//! Owner metadata carried in a satellite's application data.
//!
//! The real encoding belongs to an external codec library; the manager and
//! the permission policies only go through [`MetadataCodec`].

use crate::error::{Result, SatelliteError};
use crate::satellite::SatelliteState;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SatelliteMetadata {
    pub user_id: Option<u32>,
    pub club_id: Option<u16>,
    /// Unix seconds at which the owner data was written.
    pub timestamp: u64,
}

pub trait MetadataCodec: Send + Sync {
    /// Coarse pre-connection check: could this fingerprint belong to `user_id`?
    fn fingerprint_matches_user(&self, fingerprint: u32, user_id: u32) -> bool;

    /// Coarse pre-connection check: does this fingerprint denote an
    /// unassigned satellite?
    fn fingerprint_matches_no_user(&self, fingerprint: u32) -> bool;

    fn parse(&self, application_data: &[u8], token: Option<&str>) -> Result<SatelliteMetadata>;

    fn parse_state(&self, state: &SatelliteState, token: Option<&str>) -> Result<SatelliteMetadata> {
        self.parse(&state.persistent.application_data, token)
    }
}

const PLAIN_FORMAT: u8 = 1;
const SEALED_FORMAT: u8 = 2;
const ENCODED_LEN: usize = 15;
const NO_USER_TAG: u8 = 0;

/// Built-in tag metadata layout, little-endian:
///
/// | bytes | field |
/// |---|---|
/// | 0 | format (1 = plain, 2 = sealed, needs a token) |
/// | 1..5 | user id, 0 = unassigned |
/// | 5..13 | timestamp |
/// | 13..15 | club id, 0 = none |
///
/// The fingerprint's low byte is a user tag: 0 for unassigned, otherwise
/// `user_id % 255 + 1`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TagMetadataCodec;

impl TagMetadataCodec {
    pub fn user_tag(user_id: Option<u32>) -> u8 {
        match user_id {
            None | Some(0) => NO_USER_TAG,
            Some(id) => (id % 255) as u8 + 1,
        }
    }

    pub fn fingerprint_for(user_id: Option<u32>, state_hash: u32) -> u32 {
        (state_hash & !0xFF) | u32::from(Self::user_tag(user_id))
    }

    pub fn encode(metadata: &SatelliteMetadata, sealed: bool) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ENCODED_LEN);
        bytes.push(if sealed { SEALED_FORMAT } else { PLAIN_FORMAT });
        bytes.extend_from_slice(&metadata.user_id.unwrap_or(0).to_le_bytes());
        bytes.extend_from_slice(&metadata.timestamp.to_le_bytes());
        bytes.extend_from_slice(&metadata.club_id.unwrap_or(0).to_le_bytes());
        bytes
    }
}

impl MetadataCodec for TagMetadataCodec {
    fn fingerprint_matches_user(&self, fingerprint: u32, user_id: u32) -> bool {
        user_id != 0 && (fingerprint & 0xFF) as u8 == Self::user_tag(Some(user_id))
    }

    fn fingerprint_matches_no_user(&self, fingerprint: u32) -> bool {
        (fingerprint & 0xFF) as u8 == NO_USER_TAG
    }

    fn parse(&self, application_data: &[u8], token: Option<&str>) -> Result<SatelliteMetadata> {
        if application_data.len() < ENCODED_LEN {
            return Err(SatelliteError::Metadata(format!(
                "application data too short: {} bytes",
                application_data.len()
            )));
        }

        match application_data[0] {
            PLAIN_FORMAT => {}
            SEALED_FORMAT => {
                if token.map_or(true, str::is_empty) {
                    return Err(SatelliteError::Metadata(
                        "sealed metadata requires an authentication token".to_string(),
                    ));
                }
            }
            other => {
                return Err(SatelliteError::Metadata(format!(
                    "unsupported metadata format {}",
                    other
                )))
            }
        }

        let mut user = [0u8; 4];
        user.copy_from_slice(&application_data[1..5]);
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&application_data[5..13]);
        let mut club = [0u8; 2];
        club.copy_from_slice(&application_data[13..15]);

        let user_id = u32::from_le_bytes(user);
        let club_id = u16::from_le_bytes(club);
        Ok(SatelliteMetadata {
            user_id: (user_id != 0).then_some(user_id),
            club_id: (club_id != 0).then_some(club_id),
            timestamp: u64::from_le_bytes(timestamp),
        })
    }
}
