//! Deterministic agreement without a network round trip.
//!
//! Both peers seed a [`SharedRng`] with the same value and then make the same
//! sequence of draws. Any decision computed from those draws, over inputs put
//! into a canonical order first, comes out identical on both sides.
//!
//! The agreement holds only while both peers have consumed exactly the same
//! number of draws in the same order since seeding. A draw taken on one side
//! only (a branch that is true for one bot) shifts every later decision, and
//! nothing on the wire detects it. [`SharedRng::draws`] exists so drivers can
//! log or compare the count at agreement points.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

pub const DEFAULT_RNG_SEED: u64 = 0;

/// Seeded generator shared (by seed) between the two peers.
pub struct SharedRng {
    inner: StdRng,
    seed: u64,
    draws: u64,
}

impl SharedRng {
    pub fn seeded(seed: u64) -> Self {
        Self {
            inner: StdRng::seed_from_u64(seed),
            seed,
            draws: 0,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Number of calls made into the generator since seeding.
    pub fn draws(&self) -> u64 {
        self.draws
    }

    /// Uniform draw in `[0, 1)`.
    pub fn next_unit(&mut self) -> f64 {
        self.random()
    }
}

impl RngCore for SharedRng {
    fn next_u32(&mut self) -> u32 {
        self.draws += 1;
        self.inner.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.draws += 1;
        self.inner.next_u64()
    }

    fn fill_bytes(&mut self, dst: &mut [u8]) {
        self.draws += 1;
        self.inner.fill_bytes(dst);
    }
}

/// Index into a collection of `len` items from one unit draw.
///
/// Always consumes exactly one draw, including for an empty collection, so
/// the draw count does not depend on the input.
pub fn draw_index<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Option<usize> {
    let unit: f64 = rng.random();
    if len == 0 {
        return None;
    }
    let index = (unit * len as f64).floor() as usize;
    Some(index.min(len - 1))
}

/// Decide whether the local bot takes the primary role for this agreement point.
///
/// Sorting the two names first makes the choice independent of which side asks:
/// with distinct names exactly one peer gets `true`.
pub fn decide_primary<R: Rng + ?Sized>(local_name: &str, peer_name: &str, rng: &mut R) -> bool {
    let mut names = [local_name, peer_name];
    names.sort_unstable();
    let index = draw_index(names.len(), rng).unwrap_or(0);
    names[index] == local_name
}

/// Pick one item after sorting into canonical order.
///
/// Returns `None` for an empty slice (still consuming one draw).
pub fn pick_random<'a, T: Ord, R: Rng + ?Sized>(items: &'a [T], rng: &mut R) -> Option<&'a T> {
    let mut canonical: Vec<&'a T> = items.iter().collect();
    canonical.sort();
    draw_index(canonical.len(), rng).map(|index| canonical[index])
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADINGS: [&str; 4] = ["north", "east", "south", "west"];

    #[test]
    fn identical_seeds_agree_on_primary() {
        let mut alpha = SharedRng::seeded(12345);
        let mut bravo = SharedRng::seeded(12345);

        for _ in 0..200 {
            let alpha_primary = decide_primary("Alpha", "Bravo", &mut alpha);
            let bravo_primary = decide_primary("Bravo", "Alpha", &mut bravo);
            assert_ne!(alpha_primary, bravo_primary, "exactly one primary");
        }
        assert_eq!(alpha.draws(), bravo.draws());
    }

    #[test]
    fn both_roles_occur() {
        let mut rng = SharedRng::seeded(7);
        let picks: Vec<bool> = (0..100)
            .map(|_| decide_primary("Alpha", "Bravo", &mut rng))
            .collect();
        assert!(picks.contains(&true));
        assert!(picks.contains(&false));
    }

    #[test]
    fn pick_random_ignores_input_order() {
        let mut alpha = SharedRng::seeded(99);
        let mut bravo = SharedRng::seeded(99);
        let mut reversed = HEADINGS;
        reversed.reverse();

        for _ in 0..100 {
            assert_eq!(
                pick_random(&HEADINGS, &mut alpha),
                pick_random(&reversed, &mut bravo)
            );
        }
    }

    #[test]
    fn mixed_call_sequence_agrees() {
        let mut alpha = SharedRng::seeded(2024);
        let mut bravo = SharedRng::seeded(2024);

        for round in 0..50 {
            let a = (
                decide_primary("Alpha", "Bravo", &mut alpha),
                pick_random(&HEADINGS, &mut alpha).copied(),
                alpha.next_unit(),
            );
            let b = (
                !decide_primary("Bravo", "Alpha", &mut bravo),
                pick_random(&HEADINGS, &mut bravo).copied(),
                bravo.next_unit(),
            );
            assert_eq!(a, b, "round {round}");
        }
    }

    #[test]
    fn one_sided_draw_desynchronizes_draw_count() {
        let mut alpha = SharedRng::seeded(5);
        let mut bravo = SharedRng::seeded(5);

        let _ = alpha.next_unit();
        assert_ne!(alpha.draws(), bravo.draws());

        let _ = bravo.next_unit();
        assert_eq!(alpha.draws(), bravo.draws());
        assert_eq!(alpha.next_unit(), bravo.next_unit());
    }

    #[test]
    fn empty_pick_still_consumes_a_draw() {
        let mut rng = SharedRng::seeded(1);
        let empty: [u8; 0] = [];
        assert_eq!(pick_random(&empty, &mut rng), None);
        assert_eq!(rng.draws(), 1);
    }

    #[test]
    fn draw_index_stays_in_bounds() {
        let mut rng = SharedRng::seeded(3);
        for len in 1..20 {
            let index = draw_index(len, &mut rng).unwrap();
            assert!(index < len);
        }
    }
}
