//! SecurityAccess state

use ecuflash_proto::derive_key;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Lock state, outstanding seed pair and invalid-key lockout
pub(crate) struct SecurityState {
    unlocked: bool,
    seed_x: u32,
    seed_y: u32,
    /// Key derived from the last issued seed pair (0 when none)
    key: u32,
    /// No seed requests are served before this instant
    delay_until: u64,
    rng: StdRng,
}

impl SecurityState {
    pub fn new(rng_seed: Option<u64>) -> Self {
        let rng = match rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut state = Self {
            unlocked: false,
            seed_x: 0,
            seed_y: 0,
            key: 0,
            delay_until: 0,
            rng,
        };
        state.regenerate_seeds();
        state
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    pub fn seeds(&self) -> (u32, u32) {
        (self.seed_x, self.seed_y)
    }

    pub fn delay_until(&self) -> u64 {
        self.delay_until
    }

    pub fn in_delay(&self, now: u64) -> bool {
        now < self.delay_until
    }

    /// Both seeds are non-zero while a challenge is outstanding
    pub fn has_outstanding_seed(&self) -> bool {
        self.seed_x != 0 && self.seed_y != 0
    }

    /// Issue the current seed pair and remember the key it implies
    pub fn issue_seed(&mut self) -> (u32, u32) {
        self.key = derive_key(self.seed_x, self.seed_y);
        (self.seed_x, self.seed_y)
    }

    /// Check a key against the outstanding seed pair.
    ///
    /// A match unlocks and consumes the seeds. A mismatch opens the lockout
    /// window and replaces the seeds.
    pub fn verify_key(&mut self, key: u32, now: u64, delay_ms: u64) -> bool {
        self.key = derive_key(self.seed_x, self.seed_y);
        if key != self.key {
            self.delay_until = now.saturating_add(delay_ms);
            self.regenerate_seeds();
            self.key = 0;
            return false;
        }
        self.unlocked = true;
        self.seed_x = 0;
        self.seed_y = 0;
        true
    }

    /// Re-lock with a fresh challenge
    pub fn lock(&mut self) {
        self.unlocked = false;
        self.key = 0;
        self.regenerate_seeds();
    }

    fn regenerate_seeds(&mut self) {
        self.seed_x = self.rng.gen_range(1..=u32::MAX);
        self.seed_y = self.rng.gen_range(1..=u32::MAX);
    }
}
