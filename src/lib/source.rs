//! The source tool capability: how a tool definition asks for a checkout of its own source.
//!
//! A tool only has to say where its repository lives and which revision it wants. The pipeline
//! turns that into a [`CheckoutRequest`] and never needs to know which tool is asking.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::git::CheckoutRequest;

/// Implemented by every tool whose source can be fetched by revision.
pub trait SourceTool: Send + Sync + std::fmt::Debug {
    /// The name of the tool, for use in user-facing messages.
    fn name(&self) -> &str;

    /// The repository origin to fetch from.
    fn origin(&self) -> &str;

    /// The revision to check out.
    fn version(&self) -> &str;

    /// Adapt this tool's configuration into the generic checkout request.
    fn to_checkout_request(&self) -> CheckoutRequest {
        CheckoutRequest::new(self.origin(), self.version())
    }
}

/// The fixed definition of a tool: its name and its defaults.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SourceToolDescriptor {
    pub name: String,
    pub default_origin: String,
    pub default_version: String,
}

impl SourceToolDescriptor {
    pub fn new<N, O, V>(name: N, default_origin: O, default_version: V) -> Self
    where
        N: Into<String>,
        O: Into<String>,
        V: Into<String>,
    {
        Self {
            name: name.into(),
            default_origin: default_origin.into(),
            default_version: default_version.into(),
        }
    }
}

/// Operator overrides for a tool. A set value replaces the default outright.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceToolOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl SourceToolOptions {
    /// Options from `self`, falling back to `other` for settings `self` leaves unset.
    pub fn or(self, other: SourceToolOptions) -> Self {
        Self {
            origin: self.origin.or(other.origin),
            version: self.version.or(other.version),
        }
    }
}

/// A descriptor with its operator overrides applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguredSourceTool {
    descriptor: SourceToolDescriptor,
    options: SourceToolOptions,
}

impl ConfiguredSourceTool {
    pub fn new(descriptor: SourceToolDescriptor) -> Self {
        Self {
            descriptor,
            options: SourceToolOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SourceToolOptions) -> Self {
        self.options = options;
        self
    }

    pub fn descriptor(&self) -> &SourceToolDescriptor {
        &self.descriptor
    }
}

impl SourceTool for ConfiguredSourceTool {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn origin(&self) -> &str {
        self.options
            .origin
            .as_deref()
            .unwrap_or(&self.descriptor.default_origin)
    }

    fn version(&self) -> &str {
        self.options
            .version
            .as_deref()
            .unwrap_or(&self.descriptor.default_version)
    }
}

/// A source tool handed to the pipeline. Two requests are equal when they would check out the
/// same thing, so requests can be memoised by value.
#[derive(Debug, Clone)]
pub struct SourceToolRequest(Arc<dyn SourceTool>);

impl SourceToolRequest {
    pub fn new<T: SourceTool + 'static>(tool: T) -> Self {
        Self(Arc::new(tool))
    }

    pub fn from_arc(tool: Arc<dyn SourceTool>) -> Self {
        Self(tool)
    }

    pub fn tool(&self) -> &dyn SourceTool {
        self.0.as_ref()
    }

    pub fn checkout_request(&self) -> CheckoutRequest {
        self.0.to_checkout_request()
    }
}

impl PartialEq for SourceToolRequest {
    fn eq(&self, other: &Self) -> bool {
        self.checkout_request() == other.checkout_request()
    }
}

impl Eq for SourceToolRequest {}

impl std::hash::Hash for SourceToolRequest {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.checkout_request().hash(state)
    }
}

/// Tools by name. Registering a name again replaces the earlier tool.
#[derive(Default, Clone)]
pub struct SourceToolRegistry {
    tools: BTreeMap<String, Arc<dyn SourceTool>>,
}

impl SourceToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: SourceTool + 'static>(&mut self, tool: T) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn SourceTool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn SourceTool>> {
        self.tools.get(name)
    }

    /// Wrap the named tool for submission to the pipeline.
    pub fn request(&self, name: &str) -> Option<SourceToolRequest> {
        self.get(name).cloned().map(SourceToolRequest::from_arc)
    }

    /// Tool names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SourceTool>> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for SourceToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> SourceToolDescriptor {
        SourceToolDescriptor::new("widget", "https://example.com/widget.git", "v1.0")
    }

    #[test]
    fn defaults_are_used_without_overrides() {
        let tool = ConfiguredSourceTool::new(descriptor());
        assert_eq!(tool.origin(), "https://example.com/widget.git");
        assert_eq!(tool.version(), "v1.0");
        assert_eq!(
            tool.to_checkout_request(),
            CheckoutRequest::new("https://example.com/widget.git", "v1.0")
        );
    }

    #[test]
    fn overrides_replace_each_setting() {
        let tool = ConfiguredSourceTool::new(descriptor()).with_options(SourceToolOptions {
            origin: None,
            version: Some("v2.0".to_string()),
        });
        assert_eq!(tool.origin(), "https://example.com/widget.git");
        assert_eq!(tool.version(), "v2.0");
    }

    #[test]
    fn command_line_options_take_precedence() {
        let from_file = SourceToolOptions {
            origin: Some("https://mirror.example.com/widget.git".to_string()),
            version: Some("v2.0".to_string()),
        };
        let from_args = SourceToolOptions {
            origin: None,
            version: Some("v3.0".to_string()),
        };
        let merged = from_args.or(from_file);
        assert_eq!(
            merged.origin.as_deref(),
            Some("https://mirror.example.com/widget.git")
        );
        assert_eq!(merged.version.as_deref(), Some("v3.0"));
    }

    #[derive(Debug)]
    struct Pinned;

    impl SourceTool for Pinned {
        fn name(&self) -> &str {
            "pinned"
        }
        fn origin(&self) -> &str {
            "https://example.com/widget.git"
        }
        fn version(&self) -> &str {
            "v1.0"
        }
    }

    #[test]
    fn requests_compare_by_checkout_request() {
        let configured = SourceToolRequest::new(ConfiguredSourceTool::new(descriptor()));
        let pinned = SourceToolRequest::new(Pinned);
        assert_eq!(configured, pinned);
    }

    #[test]
    fn registry_replaces_by_name() {
        let mut registry = SourceToolRegistry::new();
        registry.register(ConfiguredSourceTool::new(descriptor()));
        registry.register(Pinned);
        registry.register(ConfiguredSourceTool::new(descriptor()).with_options(
            SourceToolOptions {
                origin: None,
                version: Some("v9".to_string()),
            },
        ));
        assert_eq!(registry.names(), vec!["pinned", "widget"]);
        assert_eq!(registry.get("widget").unwrap().version(), "v9");
        assert!(registry.request("missing").is_none());
        assert_eq!(
            registry.request("pinned").unwrap().checkout_request().rev.spec,
            "v1.0"
        );
    }
}
