use rand::Rng;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub(crate) fn validate_stay(check_in: Date, check_out: Date) -> Result<StayRange, EngineError> {
    StayRange::try_new(check_in, check_out)
        .ok_or(EngineError::InvalidRange { check_in, check_out })
}

/// Checks that only depend on the request and today's date.
pub(crate) fn validate_admission(stay: &StayRange, today: Date, guest: &str) -> Result<(), EngineError> {
    if stay.check_in < today {
        return Err(EngineError::PastDate {
            check_in: stay.check_in,
            today,
        });
    }
    if stay.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    if guest.trim().is_empty() {
        return Err(EngineError::Validation("guest reference is required"));
    }
    if guest.len() > MAX_GUEST_REF_LEN {
        return Err(EngineError::LimitExceeded("guest reference too long"));
    }
    Ok(())
}

/// First booking on the room overlapping `stay`, skipping `excluding`.
pub(crate) fn find_conflict<'a>(
    rs: &'a RoomState,
    stay: &StayRange,
    excluding: Option<Ulid>,
) -> Option<&'a Booking> {
    rs.overlapping(stay)
        .find(|b| Some(b.id) != excluding)
}

pub(crate) fn check_no_conflict(
    rs: &RoomState,
    stay: &StayRange,
    excluding: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(rs, stay, excluding) {
        Some(existing) => Err(EngineError::Conflict {
            booking_id: existing.id,
            stay: existing.stay,
        }),
        None => Ok(()),
    }
}

pub(crate) fn generate_confirmation_code(rng: &mut impl Rng) -> String {
    (0..CONFIRMATION_CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}
