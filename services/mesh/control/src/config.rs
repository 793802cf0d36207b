//! Mesh start configuration

use crate::error::MeshError;
use crate::events::MeshEventHandler;
use mesh_routing::{HwAddr, DEFAULT_ROUTE_TABLE_CAPACITY};
use mesh_transport::{StartParams, DEFAULT_CHANNEL, DEFAULT_MAX_LAYER, DEFAULT_MESH_ID};
use std::fmt;
use std::sync::Arc;

/// Highest radio channel
pub const MAX_CHANNEL: u8 = 14;

/// Deepest tree the transport supports
pub const MAX_LAYER_LIMIT: u8 = 25;

/// Longest accepted mesh password in bytes
pub const MAX_PASSWORD_LEN: usize = 64;

/// Configuration for [`crate::MeshController::start`]
#[derive(Clone)]
pub struct MeshConfig {
    /// Mesh network id
    pub mesh_id: [u8; 6],
    /// Radio channel (1..=14)
    pub channel: u8,
    /// Maximum tree depth (1..=25)
    pub max_layer: u8,
    /// Whether this node may promote itself to root
    pub allow_root: bool,
    /// Mesh access password (empty for an open mesh)
    pub password: String,
    /// Route table capacity
    pub route_table_capacity: usize,
    /// Receiver of application-level mesh events
    pub event_handler: Option<Arc<dyn MeshEventHandler>>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            mesh_id: DEFAULT_MESH_ID,
            channel: DEFAULT_CHANNEL,
            max_layer: DEFAULT_MAX_LAYER,
            allow_root: true,
            password: String::new(),
            route_table_capacity: DEFAULT_ROUTE_TABLE_CAPACITY,
            event_handler: None,
        }
    }
}

impl fmt::Debug for MeshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshConfig")
            .field("mesh_id", &HwAddr(self.mesh_id))
            .field("channel", &self.channel)
            .field("max_layer", &self.max_layer)
            .field("allow_root", &self.allow_root)
            .field("password", &"<redacted>")
            .field("route_table_capacity", &self.route_table_capacity)
            .field("event_handler", &self.event_handler.is_some())
            .finish()
    }
}

impl MeshConfig {
    /// Attach an event handler
    pub fn with_event_handler<T>(mut self, handler: Arc<T>) -> Self
    where
        T: MeshEventHandler + 'static,
    {
        self.event_handler = Some(handler);
        self
    }

    /// Check every field against the transport's limits
    pub fn validate(&self) -> Result<(), MeshError> {
        if !(1..=MAX_CHANNEL).contains(&self.channel) {
            return Err(MeshError::InvalidArgument(format!(
                "channel {} outside 1..={}",
                self.channel, MAX_CHANNEL
            )));
        }

        if !(1..=MAX_LAYER_LIMIT).contains(&self.max_layer) {
            return Err(MeshError::InvalidArgument(format!(
                "max_layer {} outside 1..={}",
                self.max_layer, MAX_LAYER_LIMIT
            )));
        }

        if self.password.len() > MAX_PASSWORD_LEN {
            return Err(MeshError::InvalidArgument(format!(
                "password longer than {} bytes",
                MAX_PASSWORD_LEN
            )));
        }

        if self.route_table_capacity == 0 {
            return Err(MeshError::InvalidArgument(
                "route_table_capacity must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Transport parameters for this configuration
    pub fn start_params(&self) -> StartParams {
        StartParams {
            mesh_id: self.mesh_id,
            channel: self.channel,
            max_layer: self.max_layer,
            allow_root: self.allow_root,
            password: self.password.clone(),
        }
    }
}
