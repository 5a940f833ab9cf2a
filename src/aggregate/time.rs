//! Arithmetic on the wrapping 64-bit nanosecond timeline.

/// Signed displacement from `b` to `a`, taking the short way round.
///
/// `safe_subtract(0, u64::MAX) == 1`.
#[inline]
pub fn safe_subtract(a: u64, b: u64) -> i64 {
    a.wrapping_sub(b) as i64
}

/// Start of the slot containing `timestamp`, for slots of `slot_length`
/// whose boundaries sit at `offset` modulo `slot_length`.
///
/// A plain floor on the u64 timeline. Timestamps before the first boundary
/// land in the slot that starts `slot_length - offset` below zero.
#[inline]
pub fn floor_align(timestamp: u64, slot_length: u64, offset: u64) -> u64 {
    debug_assert!(slot_length > 0);
    if timestamp >= offset {
        offset + ((timestamp - offset) / slot_length) * slot_length
    } else {
        let slots_back = (offset - timestamp).div_ceil(slot_length);
        offset.wrapping_sub(slots_back.wrapping_mul(slot_length))
    }
}
