//! SecurityAccess seed/key derivation
//!
//! Fixed-function mixer shared by tester and ECU. Both 32-bit seeds are run
//! through their own multiply/add lane and the lanes are xor-ed together.

const SEED_MASK: u32 = 0x1FFF_8823;

const X_LANE: (u32, u32) = (1_859_775_393, 2_840_853_838);
const Y_LANE: (u32, u32) = (1_518_500_249, 2_400_959_708);

fn mix(seed: u32, (multiplier, addend): (u32, u32)) -> u32 {
    (seed ^ SEED_MASK)
        .wrapping_mul(multiplier)
        .wrapping_add(addend)
}

/// Derive the access key for a `(seed_x, seed_y)` pair
pub fn derive_key(seed_x: u32, seed_y: u32) -> u32 {
    mix(seed_x, X_LANE) ^ mix(seed_y, Y_LANE)
}
