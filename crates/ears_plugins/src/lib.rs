//! # EARS Plugins
//!
//! Adapters shipped with the router and, behind the `dynamic` feature,
//! loading of adapter factories from shared libraries.
//!
//! | type    | receiver | sender |
//! |---------|----------|--------|
//! | `debug` | yes      | yes    |
//! | `null`  |          | yes    |

pub mod debug;
#[cfg(feature = "dynamic")]
pub mod dynamic;
pub mod null;

pub use debug::{DebugAdapter, DebugParams, DEBUG_ADAPTER_TYPE};
pub use null::{NullAdapter, NULL_ADAPTER_TYPE};

#[doc(hidden)]
pub use ears_core;

use ears_core::{Adapter, AdapterFactoryRegistry, RegistryError};
use std::sync::Arc;

/// Registers the built-in adapter types
pub fn register_builtin(factories: &AdapterFactoryRegistry) -> Result<(), RegistryError> {
    factories.register_fn(DEBUG_ADAPTER_TYPE, |params| {
        let params = DebugParams::from_value(params)?;
        Ok(Arc::new(DebugAdapter::new(params)) as Arc<dyn Adapter>)
    })?;
    factories.register_fn(NULL_ADAPTER_TYPE, |_| {
        Ok(Arc::new(NullAdapter::new()) as Arc<dyn Adapter>)
    })?;
    Ok(())
}
