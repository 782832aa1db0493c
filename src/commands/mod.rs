// Manifest-driven commands: plan, apply, destroy
pub mod declarative;

// Lookups against the platform
pub mod extension;
