//! Pass configuration
//!
//! Loaded from a TOML file such as:
//!
//! ```toml
//! refine_branches = true
//! fold_conversions = true
//! remove_dead_operations = false
//! verify = true
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Switches for the type optimization pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassConfig {
    /// Refine knowledge along the edges of branches on type and null checks
    pub refine_branches: bool,
    /// Collapse an inward conversion applied to an outward conversion
    pub fold_conversions: bool,
    /// Sweep pure operations that the rewrite left unused
    pub remove_dead_operations: bool,
    /// Verify the reduced graph; input graphs are always verified
    pub verify: bool,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            refine_branches: true,
            fold_conversions: true,
            remove_dead_operations: true,
            verify: true,
        }
    }
}

impl PassConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn refine_branches(mut self, enable: bool) -> Self {
        self.refine_branches = enable;
        self
    }

    pub fn fold_conversions(mut self, enable: bool) -> Self {
        self.fold_conversions = enable;
        self
    }

    pub fn remove_dead_operations(mut self, enable: bool) -> Self {
        self.remove_dead_operations = enable;
        self
    }

    pub fn verify(mut self, enable: bool) -> Self {
        self.verify = enable;
        self
    }
}
