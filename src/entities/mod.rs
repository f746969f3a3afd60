// Config-owned models
// Entities and algorithm versions are registered by admins; the engine reads them.
//
// Each has:
// - Stable identity that NEVER changes
// - Write-once or forward-only lifecycle enforced in storage
// - A registry over the injected connection

pub mod algorithm;
pub mod roster;

pub use algorithm::{
    default_tier_bands, validate_tier_bands, AlgorithmRegistry, AlgorithmVersion,
    FactorDefinition, MissingPolicy, Scale, TierBand,
};
pub use roster::{Entity, EntityRoster, EntityStatus};
