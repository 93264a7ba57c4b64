//! Target descriptors and the external driver seam.
//!
//! A [`TargetSpec`] is one build request: a target name plus the platform
//! and configuration to compile it for. The external target build driver
//! turns a spec into a [`TargetGraph`]: the manifest of files the build is
//! expected to produce together with the action-graph fragments it exported
//! for distribution. Targets the driver compiled directly and synchronously
//! come back with an empty fragment list and still flow through the
//! deploy/verify pipeline.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

/// One platform/configuration build request for one project.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    /// Target name, e.g. a program or module name.
    pub target: String,
    /// Platform identifier, e.g. `Win64`.
    pub platform: String,
    /// Build configuration, e.g. `Development`.
    pub configuration: String,
    /// Optional project file the target belongs to.
    pub project: Option<Utf8PathBuf>,
    /// Extra arguments forwarded to the driver verbatim.
    pub extra_args: Vec<String>,
}

impl TargetSpec {
    pub fn new(
        target: impl Into<String>,
        platform: impl Into<String>,
        configuration: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            platform: platform.into(),
            configuration: configuration.into(),
            project: None,
            extra_args: Vec::new(),
        }
    }

    pub fn with_project(mut self, project: impl AsRef<Utf8Path>) -> Self {
        self.project = Some(project.as_ref().to_path_buf());
        self
    }

    pub fn with_extra_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.extra_args.extend(args);
        self
    }

    /// Human-readable caption identifying this target in merged output,
    /// e.g. `Game-Win64-Development`.
    pub fn caption(&self) -> String {
        format!("{}-{}-{}", self.target, self.platform, self.configuration)
    }
}

/// The driver's declaration of what a target build produces and which
/// scripts frame it. Read-only once produced.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Manifest {
    /// Final build products, verified to exist after a successful build.
    #[serde(default)]
    pub build_products: Vec<Utf8PathBuf>,
    /// Library products; may be intermediate artifacts, never verified.
    #[serde(default)]
    pub library_build_products: Vec<Utf8PathBuf>,
    /// Scripts to run before any compilation starts.
    #[serde(default)]
    pub pre_build_scripts: Vec<Utf8PathBuf>,
    /// Scripts to run after the merged graph has executed.
    #[serde(default)]
    pub post_build_scripts: Vec<Utf8PathBuf>,
    /// Files handed to the driver's deploy step, one invocation each.
    #[serde(default)]
    pub deploy_target_files: Vec<Utf8PathBuf>,
}

/// One target's contribution to a build: its manifest plus the ordered raw
/// graph fragments the driver exported for it.
#[derive(Debug, Clone)]
pub struct TargetGraph {
    pub spec: TargetSpec,
    /// Caption stamped onto merged tools, see [`TargetSpec::caption`].
    pub caption: String,
    pub manifest: Manifest,
    /// Exported fragment files, in the order the driver emitted them.
    /// Empty when the driver compiled the target directly.
    pub fragments: Vec<Utf8PathBuf>,
    /// True when the driver command line requested link-skipping; such
    /// targets are never deployed.
    pub skips_link: bool,
}

impl TargetGraph {
    pub fn new(spec: TargetSpec, manifest: Manifest) -> Self {
        let caption = spec.caption();
        Self {
            spec,
            caption,
            manifest,
            fragments: Vec::new(),
            skips_link: false,
        }
    }

    pub fn with_fragments(mut self, fragments: impl IntoIterator<Item = Utf8PathBuf>) -> Self {
        self.fragments.extend(fragments);
        self
    }

    pub fn with_skips_link(mut self, skips_link: bool) -> Self {
        self.skips_link = skips_link;
        self
    }
}

/// The external target build driver.
///
/// Implementations wrap whatever tool turns source code into manifests and
/// fragment exports; the orchestrator only needs these two operations. Both
/// are userland seams and report errors through `anyhow`.
pub trait Driver: Send + Sync {
    /// Invoke the driver for one target. Distributable targets come back
    /// with exported fragments; non-distributable targets are compiled
    /// directly by the driver and return a manifest only.
    fn prepare(&self, spec: &TargetSpec) -> anyhow::Result<TargetGraph>;

    /// Run the driver's deploy step for one deploy-target file.
    fn deploy(&self, file: &Utf8Path) -> anyhow::Result<()>;
}
