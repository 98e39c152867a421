//! Identity resolution: which raw records describe the same person or sale.
//!
//! A policy is an ordered list of tiers. The first tier whose fields are all
//! populated produces the key (`<label>:<v1>|<v2>`). Records without any
//! qualifying tier fall back to their own record id and finally to a
//! content-derived key, so no record is ever dropped for lack of identity.
//!
//! Records that populate *different* tiers (one carries only a client id,
//! another only the maid id of the same household) resolve to different keys
//! and are not merged. That is accepted behaviour.

use opsdash_adapters::fields;
use opsdash_core::{IdentityKey, RawEvent};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const ANON_NAMESPACE: Uuid = Uuid::from_u128(0x6f70_7364_6173_6800_8000_0000_6964_656e);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityTier {
    pub label: String,
    pub fields: Vec<String>,
}

impl IdentityTier {
    pub fn new(label: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            label: label.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn key_for(&self, event: &RawEvent) -> Option<String> {
        if self.fields.is_empty() {
            return None;
        }
        let values = self
            .fields
            .iter()
            .map(|field| event.identifier(field))
            .collect::<Option<Vec<_>>>()?;
        Some(format!("{}:{}", self.label, values.join("|")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPolicy {
    pub tiers: Vec<IdentityTier>,
    /// Prefix keys with the event category so different categories never merge.
    #[serde(default)]
    pub prefix_category: bool,
}

impl Default for IdentityPolicy {
    /// `client:<id>`, else `maid:<id>`, else the record id.
    fn default() -> Self {
        Self {
            tiers: vec![
                IdentityTier::new("client", &[fields::CLIENT_ID]),
                IdentityTier::new("maid", &[fields::MAID_ID]),
            ],
            prefix_category: false,
        }
    }
}

impl IdentityPolicy {
    /// Contract + client + housemaid identifies one sale; partial rows fall
    /// back to client, then maid.
    pub fn sale() -> Self {
        Self {
            tiers: vec![
                IdentityTier::new(
                    "sale",
                    &[fields::CONTRACT_ID, fields::CLIENT_ID, fields::MAID_ID],
                ),
                IdentityTier::new("client", &[fields::CLIENT_ID]),
                IdentityTier::new("maid", &[fields::MAID_ID]),
            ],
            prefix_category: true,
        }
    }

    pub fn per_category(mut self) -> Self {
        self.prefix_category = true;
        self
    }

    pub fn resolve(&self, event: &RawEvent) -> IdentityKey {
        let base = self
            .tiers
            .iter()
            .find_map(|tier| tier.key_for(event))
            .or_else(|| event.record_id().map(|id| format!("record:{id}")))
            .unwrap_or_else(|| synthesized_key(event));

        if !self.prefix_category {
            return IdentityKey::new(base);
        }
        let category = event
            .category()
            .map(str::to_lowercase)
            .unwrap_or_else(|| "uncategorized".to_string());
        IdentityKey::new(format!("{category}/{base}"))
    }
}

/// Resolve with the default client → maid → record precedence.
pub fn resolve_identity(event: &RawEvent) -> IdentityKey {
    IdentityPolicy::default().resolve(event)
}

fn synthesized_key(event: &RawEvent) -> String {
    // BTreeMap-backed fields serialise deterministically.
    let canonical = serde_json::to_string(event).unwrap_or_default();
    format!("anon:{}", Uuid::new_v5(&ANON_NAMESPACE, canonical.as_bytes()))
}
