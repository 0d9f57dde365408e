use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::Config;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
}

impl Plan {
    pub fn as_str(self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
        }
    }

    /// Tier name the generation backend uses for the same plan.
    pub fn backend_tier(self) -> &'static str {
        match self {
            Plan::Free => "hobbyist",
            Plan::Pro => "developer",
        }
    }
}

pub fn resolve_plan(plan: Option<&str>) -> Plan {
    match plan
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "pro" | "developer" => Plan::Pro,
        _ => Plan::Free,
    }
}

/// Stripe reports `active`/`trialing`, Square reports `ACTIVE`.
pub fn is_subscription_active(status: Option<&str>) -> bool {
    matches!(
        status
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "active" | "trialing"
    )
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditPack {
    Small,
    Large,
}

impl CreditPack {
    pub fn as_str(self) -> &'static str {
        match self {
            CreditPack::Small => "small",
            CreditPack::Large => "large",
        }
    }

    pub fn credits(self) -> i64 {
        match self {
            CreditPack::Small => 500,
            CreditPack::Large => 2_500,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        let normalized = normalized.strip_prefix("credits_").unwrap_or(&normalized);
        match normalized {
            "small" => Some(CreditPack::Small),
            "large" => Some(CreditPack::Large),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Product {
    Plan(Plan),
    Credits(CreditPack),
}

/// Generation job types and their credit price.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Imagine,
    Upscale,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Imagine => "imagine",
            TaskKind::Upscale => "upscale",
        }
    }

    pub fn cost(self) -> i64 {
        match self {
            TaskKind::Imagine => 8,
            TaskKind::Upscale => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Month,
    Year,
}

#[derive(Clone, Debug, Default)]
pub struct PriceMap {
    by_stripe_price_id: HashMap<String, Product>,
    by_square_variation_id: HashMap<String, Plan>,
    pro_monthly: Option<String>,
    pro_yearly: Option<String>,
    pack_prices: HashMap<CreditPack, String>,
}

impl PriceMap {
    pub fn from_config(config: &Config) -> Self {
        let mut map = Self::default();
        map.pro_monthly = clean(config.stripe_price_id_pro_monthly.clone());
        map.pro_yearly = clean(config.stripe_price_id_pro_yearly.clone());

        for price_id in [map.pro_monthly.clone(), map.pro_yearly.clone()]
            .into_iter()
            .flatten()
        {
            map.by_stripe_price_id
                .insert(price_id, Product::Plan(Plan::Pro));
        }

        for (price_id, pack) in [
            (config.stripe_price_id_credits_small.clone(), CreditPack::Small),
            (config.stripe_price_id_credits_large.clone(), CreditPack::Large),
        ] {
            if let Some(price_id) = clean(price_id) {
                map.by_stripe_price_id
                    .insert(price_id.clone(), Product::Credits(pack));
                map.pack_prices.insert(pack, price_id);
            }
        }

        if let Some(variation_id) = clean(config.square_plan_variation_id_pro.clone()) {
            map.by_square_variation_id.insert(variation_id, Plan::Pro);
        }

        map
    }

    pub fn product_for_stripe_price(&self, price_id: Option<&str>) -> Option<Product> {
        let price_id = price_id?.trim();
        if price_id.is_empty() {
            return None;
        }
        self.by_stripe_price_id.get(price_id).copied()
    }

    pub fn plan_for_square_variation(&self, variation_id: Option<&str>) -> Option<Plan> {
        let variation_id = variation_id?.trim();
        if variation_id.is_empty() {
            return None;
        }
        self.by_square_variation_id.get(variation_id).copied()
    }

    pub fn stripe_price_for_plan(&self, plan: Plan, interval: BillingInterval) -> Option<&str> {
        match (plan, interval) {
            (Plan::Free, _) => None,
            (Plan::Pro, BillingInterval::Month) => self.pro_monthly.as_deref(),
            (Plan::Pro, BillingInterval::Year) => self.pro_yearly.as_deref(),
        }
    }

    pub fn stripe_price_for_pack(&self, pack: CreditPack) -> Option<&str> {
        self.pack_prices.get(&pack).map(String::as_str)
    }
}

fn clean(price_id: Option<String>) -> Option<String> {
    price_id
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
