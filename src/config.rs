//! Construction parameters for contexts and pipelines.
//!
//! Both configs are plain builders with sensible defaults:
//!
//! ```ignore
//! let config = ContextConfig::new()
//!     .label("Viewer")
//!     .descriptor_capacity(1024)
//!     .force_emulated(true);
//! let ctx = RtContext::new(device, config)?;
//! ```
//!
//! # Environment
//!
//! [`ContextConfig::from_env`] overlays two variables on the defaults:
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `RTFRAMEWORK_FORCE_EMULATED` | `1`/`true` forces the compute fallback |
//! | `RTFRAMEWORK_DESCRIPTORS` | descriptor heap capacity |

use tracing::warn;

use crate::resource::Format;

/// Environment variable forcing the emulated path.
pub const ENV_FORCE_EMULATED: &str = "RTFRAMEWORK_FORCE_EMULATED";

/// Environment variable overriding the descriptor heap capacity.
pub const ENV_DESCRIPTORS: &str = "RTFRAMEWORK_DESCRIPTORS";

/// Parameters fixed when a context is created.
#[derive(Clone, Debug, PartialEq)]
pub struct ContextConfig {
    pub label: String,
    /// Slots in the shared descriptor heap.
    pub descriptor_capacity: u32,
    /// Entries in the indirection table (emulated path only).
    pub indirection_capacity: u32,
    /// Use the compute fallback even when native raytracing is available.
    pub force_emulated: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            label: "Raytracing Context".to_string(),
            descriptor_capacity: 4096,
            indirection_capacity: 1024,
            force_emulated: false,
        }
    }
}

impl ContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `RTFRAMEWORK_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().overlay(|name| std::env::var(name).ok())
    }

    /// Applies variables looked up through `lookup`. Unparseable values are ignored.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = lookup(ENV_FORCE_EMULATED) {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.force_emulated = true,
                "0" | "false" | "no" | "off" | "" => self.force_emulated = false,
                other => warn!(variable = ENV_FORCE_EMULATED, value = other, "ignoring value"),
            }
        }

        if let Some(value) = lookup(ENV_DESCRIPTORS) {
            match value.trim().parse::<u32>() {
                Ok(capacity) if capacity > 0 => self.descriptor_capacity = capacity,
                _ => warn!(variable = ENV_DESCRIPTORS, value = %value, "ignoring value"),
            }
        }

        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn descriptor_capacity(mut self, capacity: u32) -> Self {
        self.descriptor_capacity = capacity;
        self
    }

    pub fn indirection_capacity(mut self, capacity: u32) -> Self {
        self.indirection_capacity = capacity;
        self
    }

    pub fn force_emulated(mut self, force: bool) -> Self {
        self.force_emulated = force;
        self
    }
}

/// Parameters of a [`RaytracingPipeline`](crate::pipeline::RaytracingPipeline).
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    /// Frames in flight; one constant buffer is kept per frame.
    pub frame_count: u32,
    /// Format of the output texture.
    pub format: Format,
    /// Bounces traced per sample.
    pub max_recursion_depth: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_count: 3,
            format: Format::R16G16B16A16Float,
            max_recursion_depth: 3,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_count(mut self, count: u32) -> Self {
        self.frame_count = count.max(1);
        self
    }

    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn max_recursion_depth(mut self, depth: u32) -> Self {
        self.max_recursion_depth = depth.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let config = ContextConfig::default();
        assert_eq!(config.descriptor_capacity, 4096);
        assert_eq!(config.indirection_capacity, 1024);
        assert!(!config.force_emulated);
    }

    #[test]
    fn builder_overrides() {
        let config = ContextConfig::new()
            .label("test")
            .descriptor_capacity(16)
            .indirection_capacity(8)
            .force_emulated(true);
        assert_eq!(config.label, "test");
        assert_eq!(config.descriptor_capacity, 16);
        assert_eq!(config.indirection_capacity, 8);
        assert!(config.force_emulated);
    }

    #[test]
    fn environment_overlay() {
        let config = ContextConfig::default().overlay(lookup(&[
            (ENV_FORCE_EMULATED, "TRUE"),
            (ENV_DESCRIPTORS, "512"),
        ]));
        assert!(config.force_emulated);
        assert_eq!(config.descriptor_capacity, 512);
    }

    #[test]
    fn bad_environment_values_are_ignored() {
        let config = ContextConfig::default().overlay(lookup(&[
            (ENV_FORCE_EMULATED, "maybe"),
            (ENV_DESCRIPTORS, "zero"),
        ]));
        assert_eq!(config, ContextConfig::default());
    }

    #[test]
    fn pipeline_config_clamps() {
        let config = PipelineConfig::new().frame_count(0).max_recursion_depth(0);
        assert_eq!(config.frame_count, 1);
        assert_eq!(config.max_recursion_depth, 1);
    }
}
