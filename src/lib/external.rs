//! Prebuilt tool archives downloaded by URL template and validated against known checksums.
//!
//! Each [`ExternalTool`] carries a registry of known versions in the form
//! `version|platform|sha256|size`. A download is only accepted when its size and SHA-256 match
//! the entry for the requested `(version, platform)` pair.

use std::str::FromStr;
use std::sync::Arc;

use crate::digest::Digest;

/// Errors raised while resolving, downloading or unpacking an external tool.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExternalToolError {
    #[error("no known version {version} of {tool} for platform {platform}")]
    UnknownVersion {
        tool: String,
        version: String,
        platform: Platform,
    },
    #[error("invalid known version '{line}': {reason}")]
    InvalidKnownVersion { line: String, reason: String },
    #[error("unknown platform '{0}': expected one of linux, darwin")]
    UnknownPlatform(String),
    #[error("invalid download url '{url}' for {tool}: {reason}")]
    InvalidUrl {
        tool: String,
        url: String,
        reason: String,
    },
    #[error("failed to download {url}: {message}")]
    Download { url: String, message: String },
    #[error("{tool} {version} ({platform}) is {actual} bytes, expected {expected}")]
    SizeMismatch {
        tool: String,
        version: String,
        platform: Platform,
        expected: u64,
        actual: u64,
    },
    #[error("{tool} {version} ({platform}) has sha256 {actual}, expected {expected}")]
    ChecksumMismatch {
        tool: String,
        version: String,
        platform: Platform,
        expected: String,
        actual: String,
    },
    #[error("failed to unpack {tool} {version}")]
    Extract {
        tool: String,
        version: String,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("{tool} {version} does not contain its entry point '{entry_point}'")]
    MissingEntryPoint {
        tool: String,
        version: String,
        entry_point: String,
    },
}

/// Platforms a tool archive can be published for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Darwin,
}

impl Platform {
    /// The platform this process is running on. Anything that is not macOS is treated as Linux.
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Self::Darwin
        } else {
            Self::Linux
        }
    }
}

impl FromStr for Platform {
    type Err = ExternalToolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linux" => Ok(Self::Linux),
            "darwin" | "macos" => Ok(Self::Darwin),
            _ => Err(ExternalToolError::UnknownPlatform(s.to_string())),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linux => write!(f, "linux"),
            Self::Darwin => write!(f, "darwin"),
        }
    }
}

/// One published archive: `version|platform|sha256|size`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct KnownVersion {
    pub version: String,
    pub platform: Platform,
    pub sha256: String,
    pub size: u64,
}

impl FromStr for KnownVersion {
    type Err = ExternalToolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ExternalToolError::InvalidKnownVersion {
            line: line.to_string(),
            reason: reason.to_string(),
        };
        let parts = line.split('|').map(str::trim).collect::<Vec<_>>();
        let [version, platform, checksum, size] = parts.as_slice() else {
            return Err(invalid("expected 4 '|'-separated fields"));
        };
        if version.is_empty() {
            return Err(invalid("version is empty"));
        }
        let platform = platform
            .parse::<Platform>()
            .map_err(|e| invalid(&e.to_string()))?;
        if checksum.len() != 64 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid("sha256 must be 64 hex characters"));
        }
        let size = size
            .parse::<u64>()
            .map_err(|e| invalid(&format!("size: {e}")))?;
        Ok(Self {
            version: version.to_string(),
            platform,
            sha256: checksum.to_lowercase(),
            size,
        })
    }
}

/// A tool distributed as a prebuilt archive.
pub trait ExternalTool: Send + Sync + std::fmt::Debug {
    /// The name of the tool, for use in user-facing messages.
    fn name(&self) -> &str;

    fn default_version(&self) -> &str;

    /// Known archives in `version|platform|sha256|size` form.
    fn default_known_versions(&self) -> Vec<String>;

    /// Download URL with `{version}` and `{platform}` placeholders.
    fn url_template(&self) -> &str;

    /// Path of the executable inside the unpacked archive.
    fn entry_point(&self, version: &str) -> String;

    fn generate_url(&self, version: &str, platform: Platform) -> Result<String, ExternalToolError> {
        let url = self
            .url_template()
            .replace("{version}", version)
            .replace("{platform}", &platform.to_string());
        url::Url::parse(&url).map_err(|e| ExternalToolError::InvalidUrl {
            tool: self.name().to_string(),
            url: url.clone(),
            reason: e.to_string(),
        })?;
        Ok(url)
    }

    fn known_versions(&self) -> Result<Vec<KnownVersion>, ExternalToolError> {
        self.default_known_versions()
            .iter()
            .map(|line| line.parse())
            .collect()
    }

    /// Resolve `(version, platform)` against the known versions.
    fn get_request(
        &self,
        version: &str,
        platform: Platform,
    ) -> Result<ExternalToolRequest, ExternalToolError> {
        let expected = self
            .known_versions()?
            .into_iter()
            .find(|known| known.version == version && known.platform == platform)
            .ok_or_else(|| ExternalToolError::UnknownVersion {
                tool: self.name().to_string(),
                version: version.to_string(),
                platform,
            })?;
        Ok(ExternalToolRequest {
            name: self.name().to_string(),
            url: self.generate_url(version, platform)?,
            entry_point: self.entry_point(version),
            expected,
        })
    }
}

/// Operator overrides for an external tool. A set value replaces the default outright.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ExternalToolOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Replaces the built-in `version|platform|sha256|size` lines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_versions: Option<Vec<String>>,
}

/// A built-in external tool with its operator overrides applied.
#[derive(Debug, Clone)]
pub struct ConfiguredExternalTool {
    tool: Arc<dyn ExternalTool>,
    options: ExternalToolOptions,
}

impl ConfiguredExternalTool {
    pub fn new(tool: Arc<dyn ExternalTool>, options: ExternalToolOptions) -> Self {
        Self { tool, options }
    }
}

impl ExternalTool for ConfiguredExternalTool {
    fn name(&self) -> &str {
        self.tool.name()
    }

    fn default_version(&self) -> &str {
        self.options
            .version
            .as_deref()
            .unwrap_or(self.tool.default_version())
    }

    fn default_known_versions(&self) -> Vec<String> {
        self.options
            .known_versions
            .clone()
            .unwrap_or_else(|| self.tool.default_known_versions())
    }

    fn url_template(&self) -> &str {
        self.tool.url_template()
    }

    fn entry_point(&self, version: &str) -> String {
        self.tool.entry_point(version)
    }
}

/// Everything needed to download and check one archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExternalToolRequest {
    pub name: String,
    pub url: String,
    pub entry_point: String,
    pub expected: KnownVersion,
}

impl ExternalToolRequest {
    pub fn version(&self) -> &str {
        &self.expected.version
    }

    pub fn platform(&self) -> Platform {
        self.expected.platform
    }

    /// Check a downloaded archive against the expected size and checksum.
    pub fn verify(&self, bytes: &[u8]) -> Result<(), ExternalToolError> {
        let actual = bytes.len() as u64;
        if actual != self.expected.size {
            return Err(ExternalToolError::SizeMismatch {
                tool: self.name.clone(),
                version: self.expected.version.clone(),
                platform: self.expected.platform,
                expected: self.expected.size,
                actual,
            });
        }
        let actual = sha256::digest(bytes);
        if actual != self.expected.sha256 {
            return Err(ExternalToolError::ChecksumMismatch {
                tool: self.name.clone(),
                version: self.expected.version.clone(),
                platform: self.expected.platform,
                expected: self.expected.sha256.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// A validated, unpacked archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DownloadedExternalTool {
    pub digest: Digest,
    pub exe: String,
}

/// A downloaded tool ready to be run: its unpacked tree and the executable within it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PackagedTool {
    pub name: String,
    pub version: String,
    pub platform: Platform,
    pub digest: Digest,
    pub entry_point: String,
}

/// Fetches the bytes behind a URL.
#[async_trait::async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, url: &str) -> Result<Vec<u8>, ExternalToolError>;
}

/// Downloads over HTTP(S) with `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

#[async_trait::async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, url: &str) -> Result<Vec<u8>, ExternalToolError> {
        let download_error = |e: reqwest::Error| ExternalToolError::Download {
            url: url.to_string(),
            message: e.to_string(),
        };
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(download_error)?;
        let bytes = response.bytes().await.map_err(download_error)?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "064b2532c70916c7684d4c7c973416ac32dd2ea15f5c392654c75258bfc8c6c2";

    #[derive(Debug)]
    struct Widget;

    impl ExternalTool for Widget {
        fn name(&self) -> &str {
            "widget"
        }
        fn default_version(&self) -> &str {
            "1.2.0"
        }
        fn default_known_versions(&self) -> Vec<String> {
            vec![format!("1.2.0|linux|{SHA}|3"), format!("1.2.0 | darwin | {SHA} | 3")]
        }
        fn url_template(&self) -> &str {
            "https://example.com/widget-{version}-{platform}.tar.gz"
        }
        fn entry_point(&self, version: &str) -> String {
            format!("widget-{version}/bin/widget")
        }
    }

    #[test]
    fn parse_known_version() {
        let known: KnownVersion = format!("0.16.0|linux|{SHA}|5512800").parse().unwrap();
        assert_eq!(known.version, "0.16.0");
        assert_eq!(known.platform, Platform::Linux);
        assert_eq!(known.size, 5512800);
    }

    #[test]
    fn malformed_known_versions_are_rejected() {
        for line in [
            "0.16.0|linux|abc".to_string(),
            format!("0.16.0|windows|{SHA}|1"),
            "0.16.0|linux|not-hex|1".to_string(),
            format!("0.16.0|linux|{SHA}|big"),
        ] {
            assert!(
                matches!(line.parse::<KnownVersion>(), Err(ExternalToolError::InvalidKnownVersion { line: l, .. }) if l == line),
                "accepted {line}"
            );
        }
    }

    #[test]
    fn url_template_is_expanded() {
        assert_eq!(
            Widget.generate_url("1.2.0", Platform::Darwin).unwrap(),
            "https://example.com/widget-1.2.0-darwin.tar.gz"
        );
    }

    #[test]
    fn request_matches_version_and_platform() {
        let request = Widget.get_request("1.2.0", Platform::Linux).unwrap();
        assert_eq!(request.platform(), Platform::Linux);
        assert_eq!(request.entry_point, "widget-1.2.0/bin/widget");
        assert!(matches!(
            Widget.get_request("9.9.9", Platform::Linux),
            Err(ExternalToolError::UnknownVersion { version, .. }) if version == "9.9.9"
        ));
    }

    #[test]
    fn options_replace_version_and_known_versions() {
        let configured = ConfiguredExternalTool::new(
            Arc::new(Widget),
            ExternalToolOptions {
                version: Some("2.0.0".to_string()),
                known_versions: Some(vec![format!("2.0.0|linux|{SHA}|7")]),
            },
        );
        assert_eq!(configured.name(), "widget");
        assert_eq!(configured.default_version(), "2.0.0");
        let request = configured.get_request("2.0.0", Platform::Linux).unwrap();
        assert_eq!(request.expected.size, 7);
        assert_eq!(request.url, "https://example.com/widget-2.0.0-linux.tar.gz");
        assert!(configured.get_request("1.2.0", Platform::Linux).is_err());

        let unchanged = ConfiguredExternalTool::new(Arc::new(Widget), ExternalToolOptions::default());
        assert_eq!(unchanged.default_version(), "1.2.0");
        assert_eq!(unchanged.known_versions().unwrap().len(), 2);
    }

    #[test]
    fn verification_checks_size_then_checksum() {
        let request = Widget.get_request("1.2.0", Platform::Linux).unwrap();
        assert!(matches!(
            request.verify(b"four"),
            Err(ExternalToolError::SizeMismatch { expected: 3, actual: 4, .. })
        ));
        assert!(matches!(
            request.verify(b"abc"),
            Err(ExternalToolError::ChecksumMismatch { .. })
        ));
        let mut good = request.clone();
        good.expected.sha256 = sha256::digest("abc");
        assert!(good.verify(b"abc").is_ok());
    }
}
