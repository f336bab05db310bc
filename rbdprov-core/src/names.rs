//! Unique-name primitives and per-run name planning.
//!
//! Synthesized pool names must be identical on both clusters of a mirror
//! relationship, while synthesized image names must not collide between the
//! primary and secondary halves. A [`NamePlan`] fixes the random parts once
//! per provisioning run so every expansion in that run agrees on them.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;

use crate::types::PoolType;

/// Random ASCII-letter string of `len` characters.
pub fn random_string(len: usize) -> String {
    random_string_with(&mut rand::thread_rng(), len)
}

/// Random ASCII-letter string drawn from `rng`.
pub fn random_string_with<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    rng.sample_iter(&Alphanumeric)
        .map(char::from)
        .filter(char::is_ascii_alphabetic)
        .take(len)
        .collect()
}

/// Random name stems for one pool type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionNames {
    /// e.g. `rep_pool_AbCdE`
    pub pool_stem: String,
    /// e.g. `data_pool_AbCdE`
    pub data_pool_stem: String,
    /// Image stem for images created by the primary side
    pub primary_image_stem: String,
    /// Image stem for images created by the secondary side
    pub secondary_image_stem: String,
}

impl SectionNames {
    pub fn image_stem(&self, is_secondary: bool) -> &str {
        if is_secondary {
            &self.secondary_image_stem
        } else {
            &self.primary_image_stem
        }
    }
}

/// Random name stems for every pool type, fixed for one provisioning run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePlan {
    sections: HashMap<PoolType, SectionNames>,
}

impl NamePlan {
    /// Fresh plan from the thread RNG.
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::thread_rng())
    }

    /// Plan drawn from `rng`; a seeded RNG gives reproducible names.
    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let sections = PoolType::ALL
            .iter()
            .map(|&pool_type| {
                let stem = pool_type.name_stem();
                let names = SectionNames {
                    pool_stem: format!("{}_pool_{}", stem, random_string_with(rng, 5)),
                    data_pool_stem: format!("data_pool_{}", random_string_with(rng, 5)),
                    primary_image_stem: format!("{}_image_{}", stem, random_string_with(rng, 5)),
                    secondary_image_stem: format!("{}_image_{}", stem, random_string_with(rng, 5)),
                };
                (pool_type, names)
            })
            .collect();
        Self { sections }
    }

    pub fn section(&self, pool_type: PoolType) -> &SectionNames {
        // Every pool type is populated by the constructors.
        &self.sections[&pool_type]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_random_string_length_and_alphabet() {
        let s = random_string(5);
        assert_eq!(s.len(), 5);
        assert!(s.chars().all(|c| c.is_ascii_alphabetic()));
    }

    #[test]
    fn test_seeded_plan_is_reproducible() {
        let a = NamePlan::generate_with(&mut StdRng::seed_from_u64(7));
        let b = NamePlan::generate_with(&mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn test_plan_stems() {
        let plan = NamePlan::generate();
        let rep = plan.section(PoolType::Replicated);
        assert!(rep.pool_stem.starts_with("rep_pool_"));
        assert!(plan.section(PoolType::ErasureCoded).pool_stem.starts_with("ec_pool_"));
        assert_ne!(rep.image_stem(false), rep.image_stem(true));
    }
}
