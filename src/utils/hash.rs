/// Polynomial rolling hash reduced to a 32-bit signed range, absolute value
/// taken. Deterministic across calls and process restarts so the same
/// speaker key always lands on the same pool member.
pub fn stable_hash(key: &str) -> u32 {
    let mut h: i32 = 0;
    for c in key.chars() {
        h = h.wrapping_mul(31).wrapping_add(c as i32);
    }
    h.unsigned_abs()
}

/// Hashed pick from an ordered pool. Empty pool yields nothing.
pub fn pick_from_pool<'a>(pool: &'a [String], key: &str) -> Option<&'a str> {
    if pool.is_empty() {
        return None;
    }
    Some(pool[stable_hash(key) as usize % pool.len()].as_str())
}
