//! Instance selection: ranks spot quotes by effective price and yields the
//! ones whose architecture the fleet can run.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, info};

use crate::cloud::CloudProvider;
use crate::config::{Config, RotationMode};
use crate::error::{CloudError, CycleError};
use crate::model::{Arch, Offer, SpotQuote};

/// How a quote's price is compared against others.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PricingMode {
    /// Price per instance.
    PerInstance,
    /// Price per usable interface, counting a surcharge for each interface
    /// beyond the first.
    PerInterface { surcharge: f64 },
}

impl PricingMode {
    pub fn for_rotation(mode: RotationMode, surcharge: f64) -> Self {
        match mode {
            RotationMode::WholeInstance => PricingMode::PerInstance,
            RotationMode::LiveIp => PricingMode::PerInterface { surcharge },
        }
    }

    pub fn effective_price(&self, quote: &SpotQuote) -> f64 {
        match *self {
            PricingMode::PerInstance => quote.price,
            PricingMode::PerInterface { surcharge } => {
                let n = f64::from(quote.max_interfaces.max(1));
                (quote.price + surcharge * (n - 1.0)) / n
            }
        }
    }
}

/// Cost and region constraints on offers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OfferFilter {
    pub min_cost: Option<f64>,
    pub max_cost: Option<f64>,
    /// Zone prefixes; empty admits all zones.
    pub regions: Vec<String>,
}

impl OfferFilter {
    pub fn admits_zone(&self, zone: &str) -> bool {
        self.regions.is_empty() || self.regions.iter().any(|r| zone.starts_with(r.as_str()))
    }

    pub fn admits_price(&self, effective_price: f64) -> bool {
        effective_price.is_finite()
            && effective_price >= 0.0
            && self.min_cost.map_or(true, |min| effective_price >= min)
            && self.max_cost.map_or(true, |max| effective_price <= max)
    }
}

/// A filtered quote with the price it is ranked by.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedQuote {
    pub quote: SpotQuote,
    pub effective_price: f64,
}

pub struct InstanceSelector {
    cloud: Arc<dyn CloudProvider>,
    filter: OfferFilter,
    pricing: PricingMode,
    supported: Vec<Arch>,
}

impl InstanceSelector {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        filter: OfferFilter,
        pricing: PricingMode,
        supported: Vec<Arch>,
    ) -> Self {
        Self {
            cloud,
            filter,
            pricing,
            supported,
        }
    }

    pub fn from_config(cloud: Arc<dyn CloudProvider>, config: &Config) -> Self {
        Self::new(
            cloud,
            OfferFilter {
                min_cost: config.min_cost,
                max_cost: config.max_cost,
                regions: config.regions.clone(),
            },
            PricingMode::for_rotation(config.mode, config.interface_surcharge),
            config.architectures.clone(),
        )
    }

    /// Filter and order quotes: ascending effective price, ties broken by
    /// instance type then zone so the order is deterministic.
    pub fn rank(&self, quotes: Vec<SpotQuote>) -> Vec<RankedQuote> {
        let mut ranked: Vec<RankedQuote> = quotes
            .into_iter()
            .filter(|q| self.filter.admits_zone(&q.zone))
            .map(|quote| RankedQuote {
                effective_price: self.pricing.effective_price(&quote),
                quote,
            })
            .filter(|r| self.filter.admits_price(r.effective_price))
            .collect();

        ranked.sort_by(|a, b| {
            a.effective_price
                .total_cmp(&b.effective_price)
                .then_with(|| a.quote.instance_type.cmp(&b.quote.instance_type))
                .then_with(|| a.quote.zone.cmp(&b.quote.zone))
        });
        ranked
    }

    /// Query the market and return a fresh offer sequence for this cycle.
    pub async fn select(&self) -> Result<OfferSequence, CycleError> {
        let quotes = self.cloud.list_offers(&self.filter.regions).await?;
        let total = quotes.len();
        let ranked = self.rank(quotes);
        info!(
            quotes = total,
            admitted = ranked.len(),
            cheapest = ranked.first().map(|r| r.effective_price),
            "Ranked spot offers"
        );
        Ok(OfferSequence {
            cloud: Arc::clone(&self.cloud),
            ranked: ranked.into(),
            supported: self.supported.clone(),
            arch_cache: HashMap::new(),
            skipped: 0,
        })
    }
}

/// Lazily walks ranked quotes, describing architectures only as needed.
pub struct OfferSequence {
    cloud: Arc<dyn CloudProvider>,
    ranked: VecDeque<RankedQuote>,
    supported: Vec<Arch>,
    arch_cache: HashMap<String, Vec<Arch>>,
    skipped: usize,
}

impl OfferSequence {
    /// Next offer with a supported architecture, or `None` when exhausted.
    /// Unsupported offers are skipped silently.
    pub async fn next_supported(&mut self) -> Result<Option<Offer>, CloudError> {
        while let Some(ranked) = self.ranked.pop_front() {
            let architectures = match self.arch_cache.get(&ranked.quote.instance_type) {
                Some(archs) => archs.clone(),
                None => {
                    let archs = self
                        .cloud
                        .describe_architectures(&ranked.quote.instance_type)
                        .await?;
                    self.arch_cache
                        .insert(ranked.quote.instance_type.clone(), archs.clone());
                    archs
                }
            };

            let Some(arch) = self
                .supported
                .iter()
                .copied()
                .find(|a| architectures.contains(a))
            else {
                debug!(
                    instance_type = %ranked.quote.instance_type,
                    zone = %ranked.quote.zone,
                    architectures = ?architectures,
                    "Skipping offer with unsupported architecture"
                );
                self.skipped += 1;
                continue;
            };

            return Ok(Some(Offer {
                instance_type: ranked.quote.instance_type,
                zone: ranked.quote.zone,
                price: ranked.quote.price,
                effective_price: ranked.effective_price,
                max_interfaces: ranked.quote.max_interfaces.max(1),
                architectures,
                arch,
            }));
        }
        Ok(None)
    }

    /// First acceptable offer; fails when the whole sequence is unsupported.
    pub async fn cheapest(&mut self) -> Result<Offer, CycleError> {
        self.next_supported()
            .await?
            .ok_or(CycleError::NoCapacityAvailable)
    }

    /// Offers passed over for their architecture so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn remaining(&self) -> usize {
        self.ranked.len()
    }
}
