use std::collections::HashMap;
use std::sync::Arc;

use super::Venue;
use crate::error::{Error, Result};

/// Frozen lookup table from venue name to capability.
///
/// Venues are a small, statically known set; freezing the map after
/// construction keeps the hottest lookup path free of locks.
pub struct VenueRegistry {
    venues: HashMap<String, Arc<dyn Venue>>,
}

impl VenueRegistry {
    pub fn new(venues: HashMap<String, Arc<dyn Venue>>) -> Self {
        Self { venues }
    }

    /// Capability for `name`, or a typed error when absent.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Venue>> {
        self.lookup(name)
            .ok_or_else(|| Error::VenueNotFound(name.to_string()))
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Venue>> {
        self.venues.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.venues.contains_key(name)
    }

    /// All registered (name, capability) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Venue>)> {
        self.venues.iter().map(|(name, venue)| (name.as_str(), venue))
    }

    pub fn len(&self) -> usize {
        self.venues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.venues.is_empty()
    }
}
