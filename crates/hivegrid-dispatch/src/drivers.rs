//! Secret driver plugins.
//!
//! A secret whose spec names a driver gets its payload from the driver
//! at assignment time instead of the stored data. Drivers are looked up
//! by name in a `DriverProvider` registry.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use hivegrid_state::{Driver, SecretSpec, Task};

/// Largest secret payload a driver may return.
pub const MAX_SECRET_SIZE: usize = 500 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("no secret driver registered under name {0:?}")]
    UnknownDriver(String),

    #[error("secret driver call failed: {0}")]
    Call(String),

    #[error("invalid secret payload: {0}")]
    InvalidPayload(String),
}

/// An external source of secret payloads.
pub trait SecretDriver: Send + Sync {
    fn get(&self, spec: &SecretSpec, task: &Task) -> Result<Vec<u8>, DriverError>;
}

/// Registry of secret drivers, indexed by driver name.
#[derive(Default)]
pub struct DriverProvider {
    drivers: HashMap<String, Arc<dyn SecretDriver>>,
}

impl DriverProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, driver: Arc<dyn SecretDriver>) {
        self.drivers.insert(name.into(), driver);
    }

    /// Resolve the driver a secret spec references.
    pub fn new_secret_driver(&self, driver: &Driver) -> Result<Arc<dyn SecretDriver>, DriverError> {
        self.drivers
            .get(&driver.name)
            .cloned()
            .ok_or_else(|| DriverError::UnknownDriver(driver.name.clone()))
    }
}

/// Validate a payload returned by a secret driver.
pub fn validate_secret_payload(payload: &[u8]) -> Result<(), DriverError> {
    if payload.is_empty() {
        return Err(DriverError::InvalidPayload("payload is empty".to_string()));
    }
    if payload.len() > MAX_SECRET_SIZE {
        return Err(DriverError::InvalidPayload(format!(
            "payload exceeds {MAX_SECRET_SIZE} bytes"
        )));
    }
    Ok(())
}
