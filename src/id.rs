//! Prefixed ID generation for Keywarden entities.
//!
//! All IDs use a `kw_` brand prefix to guarantee collision avoidance with
//! payment provider IDs (Stripe's `sub_`, `pi_`, PayPal's `WH-`, etc.).
//!
//! Format: `kw_{entity}_{uuid_simple}` (32 hex chars, no hyphens)

use uuid::Uuid;

/// Entity types that have prefixed IDs in Keywarden.
#[derive(Debug, Clone, Copy)]
pub enum EntityType {
    License,
    Activation,
    Subscription,
    AuditLog,
    Batch,
}

impl EntityType {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::License => "kw_lic",
            Self::Activation => "kw_act",
            Self::Subscription => "kw_sub",
            Self::AuditLog => "kw_aud",
            Self::Batch => "kw_bat",
        }
    }

    /// Generates a new prefixed ID for this entity type.
    pub fn gen_id(&self) -> String {
        format!("{}_{}", self.prefix(), Uuid::new_v4().as_simple())
    }
}
