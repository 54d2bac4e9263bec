//! Ordered extraction strategies for the image of a loaded detail page.

pub mod strategies;

use crate::browser::BrowserSession;
use crate::error::BrowserError;
use crate::store::TargetField;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

pub use strategies::{MarkupScan, MetaImage, PhotoControl};

/// One way of finding the target value on a loaded page.
#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Time budget for one extraction.
    fn timeout(&self) -> Duration;

    /// Returns the value, or `None` if this strategy found nothing.
    async fn extract(&self, session: &dyn BrowserSession) -> Result<Option<String>, BrowserError>;
}

/// A value found by a strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub value: String,
    pub strategy: &'static str,
}

/// Runs strategies in priority order and returns the first hit.
pub struct ExtractionPipeline {
    strategies: Vec<Box<dyn ExtractionStrategy>>,
}

impl ExtractionPipeline {
    /// Creates an empty pipeline.
    pub fn new() -> Self {
        Self { strategies: Vec::new() }
    }

    /// Appends a strategy with the lowest priority so far.
    pub fn add(&mut self, strategy: impl ExtractionStrategy + 'static) -> &mut Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    /// Meta tag, then the photo control, then a markup scan.
    pub fn image() -> Self {
        let mut pipeline = Self::new();
        pipeline.add(MetaImage::default()).add(PhotoControl::default()).add(MarkupScan::default());
        pipeline
    }

    /// Pipeline able to find `field`, if any strategies exist for it.
    pub fn for_field(field: TargetField) -> Option<Self> {
        match field {
            TargetField::Image => Some(Self::image()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Strategy names in priority order.
    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Returns the first non-empty value. Strategy failures and timeouts fall
    /// through to the next strategy; `None` means nothing was found.
    pub async fn run(&self, session: &dyn BrowserSession) -> Option<Extracted> {
        for strategy in &self.strategies {
            match tokio::time::timeout(strategy.timeout(), strategy.extract(session)).await {
                Ok(Ok(Some(value))) if !value.trim().is_empty() => {
                    debug!("Strategy '{}' found a value", strategy.name());
                    return Some(Extracted { value: value.trim().to_string(), strategy: strategy.name() });
                }
                Ok(Ok(_)) => debug!("Strategy '{}' found nothing", strategy.name()),
                Ok(Err(e)) => warn!("Strategy '{}' failed: {}", strategy.name(), e),
                Err(_) => warn!("Strategy '{}' timed out after {:?}", strategy.name(), strategy.timeout()),
            }
        }
        None
    }
}

impl Default for ExtractionPipeline {
    fn default() -> Self {
        Self::image()
    }
}
