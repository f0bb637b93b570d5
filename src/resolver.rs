// SPDX-License-Identifier: Apache-2.0

//! The Tier Resolver (spec.md §4.5): maps a container id to its tier
//! configuration. Resolution never hands the scaler an "unknown" tier
//! (Design Notes §9) — only a validated `TierConfig` or a `TierError`.

use crate::error::TierError;
use crate::tier::TierConfig;
use std::collections::HashMap;

pub struct TierResolver {
    tier_by_container: HashMap<String, Result<TierConfig, TierError>>,
    fallback: Result<TierConfig, TierError>,
}

impl TierResolver {
    pub fn new(
        tier_by_container: HashMap<String, Result<TierConfig, TierError>>,
        fallback: TierConfig,
    ) -> Self {
        let fallback = fallback.validate().map(|()| fallback.clone());
        Self {
            tier_by_container,
            fallback,
        }
    }

    pub fn resolve(&self, container_id: &str) -> Result<TierConfig, TierError> {
        self.tier_by_container
            .get(container_id)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}
