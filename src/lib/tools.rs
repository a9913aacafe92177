//! Built-in tool definitions.

use std::sync::Arc;

use crate::external::ExternalTool;
use crate::source::SourceToolDescriptor;

/// The HPC package manager (<https://spack.io>).
#[derive(Debug, Clone, Copy, Default)]
pub struct Spack;

impl Spack {
    pub const NAME: &'static str = "spack";
    pub const DEFAULT_ORIGIN: &'static str = "https://github.com/spack/spack.git";
    pub const DEFAULT_SOURCE_VERSION: &'static str = "v0.16.0";

    pub fn source_descriptor() -> SourceToolDescriptor {
        SourceToolDescriptor::new(Self::NAME, Self::DEFAULT_ORIGIN, Self::DEFAULT_SOURCE_VERSION)
    }
}

impl ExternalTool for Spack {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn default_version(&self) -> &str {
        "0.16.0"
    }

    fn default_known_versions(&self) -> Vec<String> {
        [
            "0.16.0|darwin|064b2532c70916c7684d4c7c973416ac32dd2ea15f5c392654c75258bfc8c6c2|5512800",
            "0.16.0|linux|064b2532c70916c7684d4c7c973416ac32dd2ea15f5c392654c75258bfc8c6c2|5512800",
        ]
        .map(String::from)
        .to_vec()
    }

    fn url_template(&self) -> &str {
        "https://github.com/spack/spack/releases/download/v{version}/spack-{version}.tar.gz"
    }

    fn entry_point(&self, version: &str) -> String {
        format!("spack-{version}/bin/spack")
    }
}

/// Descriptors of every built-in source tool.
pub fn source_tool_descriptors() -> Vec<SourceToolDescriptor> {
    vec![Spack::source_descriptor()]
}

/// Every built-in external tool.
pub fn external_tools() -> Vec<Arc<dyn ExternalTool>> {
    vec![Arc::new(Spack)]
}

/// Look up a built-in external tool by name.
pub fn external_tool(name: &str) -> Option<Arc<dyn ExternalTool>> {
    external_tools().into_iter().find(|tool| tool.name() == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::Platform;

    #[test]
    fn spack_known_versions_parse() {
        let known = Spack.known_versions().unwrap();
        assert_eq!(known.len(), 2);
        assert!(known.iter().all(|k| k.version == "0.16.0" && k.size == 5512800));
    }

    #[test]
    fn spack_request_for_current_platform() {
        let request = Spack
            .get_request(Spack.default_version(), Platform::current())
            .unwrap();
        assert_eq!(
            request.url,
            "https://github.com/spack/spack/releases/download/v0.16.0/spack-0.16.0.tar.gz"
        );
        assert_eq!(request.entry_point, "spack-0.16.0/bin/spack");
    }

    #[test]
    fn lookup_by_name() {
        assert_eq!(external_tool("spack").unwrap().name(), "spack");
        assert!(external_tool("nope").is_none());
        assert_eq!(source_tool_descriptors()[0].default_version, "v0.16.0");
    }
}
