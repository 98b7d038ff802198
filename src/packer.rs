//! Driver for the external `packer` binary plus its build manifest.
//!
//! Packer's manifest post-processor appends a record for every image built.
//! We treat that file as a cache: before building, look for an existing
//! record whose configuration matches, and only shell out to `packer build`
//! on a miss (or when a rebuild is forced).

use crate::cloud::TfVars;
use crate::progress::Status;
use crate::system::PackerConfig;
use crate::{Ami, Region, Sha};
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Report;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::process::Stdio;

const MANIFEST_FILE: &str = "manifest.json";
const PACKER_LOG: &str = "packer.log";

#[derive(thiserror::Error, Debug)]
#[error("packer finished but the manifest has no matching build record")]
pub struct BuildNotProduced;

/// Compilation profile baked into the machine image.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    clap::ValueEnum,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BuildProfile {
    #[default]
    Debug,
    Release,
}

impl std::fmt::Display for BuildProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildProfile::Debug => write!(f, "debug"),
            BuildProfile::Release => write!(f, "release"),
        }
    }
}

/// Build options taken from the command line; systems that don't compile
/// from a source tree ignore the sha and git root.
#[derive(Debug, Clone, Default)]
pub struct BuildArgs {
    pub profile: BuildProfile,
    pub sha: Option<Sha>,
    pub git_root: Option<PathBuf>,
}

/// One record from the packer manifest: the image it produced plus the
/// variables it was built with (in `custom_data`).
#[derive(Debug, Clone)]
pub struct Build {
    pub build_time: u64,
    pub region: Region,
    pub ami: Ami,
    pub custom_data: BTreeMap<String, String>,
}

impl Build {
    pub fn custom(&self, key: &str) -> Option<&str> {
        self.custom_data.get(key).map(String::as_str)
    }
}

#[derive(Deserialize)]
struct RawManifest {
    #[serde(default)]
    builds: Vec<RawBuild>,
}

#[derive(Deserialize)]
struct RawBuild {
    artifact_id: String,
    build_time: u64,
    #[serde(default)]
    custom_data: BTreeMap<String, String>,
}

/// The parsed manifest, builds ordered most recent first.
pub struct Manifest {
    builds: Vec<Build>,
}

impl Manifest {
    /// Loads the manifest at `path`; a missing file is an empty manifest
    /// (nothing was ever built in this root).
    pub fn load(path: &Path) -> Result<Self, Report> {
        if !path.exists() {
            return Ok(Self { builds: Vec::new() });
        }
        let data = std::fs::read(path).wrap_err("read manifest")?;
        Self::from_json(&data)
    }

    fn from_json(data: &[u8]) -> Result<Self, Report> {
        let raw: RawManifest =
            serde_json::from_slice(data).wrap_err("parse manifest")?;
        let mut builds = raw
            .builds
            .into_iter()
            .map(|build| {
                let (region, ami) = match build.artifact_id.split_once(':') {
                    Some((region, ami)) => (region.into(), ami.into()),
                    None => bail!(
                        "malformed artifact id [{}] in manifest",
                        build.artifact_id
                    ),
                };
                Ok(Build {
                    build_time: build.build_time,
                    region,
                    ami,
                    custom_data: build.custom_data,
                })
            })
            .collect::<Result<Vec<_>, Report>>()?;
        builds.sort_by(|a, b| b.build_time.cmp(&a.build_time));
        Ok(Self { builds })
    }

    pub fn most_recent_matching<C: PackerConfig>(
        &self,
        config: &C,
    ) -> Option<&Build> {
        self.builds.iter().find(|build| config.matches(build))
    }
}

/// Whether this configuration must be rebuilt. When forcing is on, each
/// distinct configuration is rebuilt once per run; repeats within the same
/// run fall back to the cache.
fn should_force<C: Clone + Eq + Hash>(
    config: &C,
    force_rebuilt: Option<&mut HashSet<C>>,
) -> bool {
    match force_rebuilt {
        Some(rebuilt) => rebuilt.insert(config.clone()),
        None => false,
    }
}

/// Returns a build matching `config`, building an image if the manifest has
/// none (or a rebuild is forced). `root_dir` holds `packer.json` and the
/// manifest.
pub async fn ensure_build<C: PackerConfig>(
    config: &C,
    force_rebuilt: Option<&mut HashSet<C>>,
    root_dir: &Path,
) -> Result<Build, Report> {
    let manifest_path = root_dir.join(MANIFEST_FILE);
    let manifest = Manifest::load(&manifest_path)?;

    if !should_force(config, force_rebuilt) {
        if let Some(build) = manifest.most_recent_matching(config) {
            let status = Status::spinner("[image] checking build cache");
            status.info(format!("[image] using cached image {}", build.ami));
            return Ok(build.clone());
        }
    }

    // staging must outlive the build: configs may drop archives here that
    // packer reads mid-run
    let staging = tempfile::tempdir().wrap_err("staging dir")?;
    let vars: TfVars = config.packer_vars(staging.path()).await?;

    let status = Status::spinner(format!(
        "[image] building image (output in [{}])",
        PACKER_LOG
    ));
    let log = std::fs::File::create(PACKER_LOG).wrap_err("packer log")?;
    let mut command = tokio::process::Command::new("packer");
    command.arg("build");
    for (key, value) in &vars {
        command.arg("-var").arg(format!("{}={}", key, value));
    }
    let exit = command
        .arg("packer.json")
        .current_dir(root_dir)
        .stdout(Stdio::from(log))
        .status()
        .await
        .wrap_err("packer build")?;
    if !exit.success() {
        status.fail("[image] build failed");
        bail!("packer build failed (output in [{}])", PACKER_LOG);
    }

    let manifest = Manifest::load(&manifest_path)?;
    match manifest.most_recent_matching(config) {
        Some(build) => {
            status.succeed(format!("[image] built image {}", build.ami));
            Ok(build.clone())
        }
        None => Err(BuildNotProduced.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct ShaConfig {
        sha: &'static str,
    }

    impl PackerConfig for ShaConfig {
        fn packer_vars(
            &self,
            _staging: &Path,
        ) -> impl Future<Output = Result<TfVars, Report>> {
            async { Ok(TfVars::new()) }
        }

        fn matches(&self, build: &Build) -> bool {
            build.custom("sha") == Some(self.sha)
        }
    }

    const MANIFEST: &str = r#"{
        "builds": [
            {
                "artifact_id": "us-east-2:ami-old",
                "build_time": 100,
                "custom_data": {"sha": "abc"}
            },
            {
                "artifact_id": "us-east-2:ami-other",
                "build_time": 300,
                "custom_data": {"sha": "def"}
            },
            {
                "artifact_id": "us-east-2:ami-new",
                "build_time": 200,
                "custom_data": {"sha": "abc"}
            }
        ],
        "last_run_uuid": "ignored"
    }"#;

    #[test]
    fn missing_manifest_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::load(&dir.path().join("manifest.json")).unwrap();
        assert!(manifest
            .most_recent_matching(&ShaConfig { sha: "abc" })
            .is_none());
    }

    #[test]
    fn matching_picks_most_recent_build() {
        let manifest = Manifest::from_json(MANIFEST.as_bytes()).unwrap();
        let build = manifest
            .most_recent_matching(&ShaConfig { sha: "abc" })
            .unwrap();
        assert_eq!(build.ami, "ami-new".into());
        assert_eq!(build.region, "us-east-2".into());
        assert_eq!(build.build_time, 200);

        assert!(manifest
            .most_recent_matching(&ShaConfig { sha: "zzz" })
            .is_none());
    }

    #[test]
    fn malformed_artifact_id_is_an_error() {
        let data = br#"{"builds": [{"artifact_id": "no-colon", "build_time": 1}]}"#;
        assert!(Manifest::from_json(data).is_err());
    }

    #[test]
    fn force_rebuild_applies_once_per_configuration() {
        let config = ShaConfig { sha: "abc" };
        assert!(!should_force(&config, None));

        let mut rebuilt = HashSet::new();
        assert!(should_force(&config, Some(&mut rebuilt)));
        assert!(!should_force(&config, Some(&mut rebuilt)));
        assert!(should_force(&ShaConfig { sha: "def" }, Some(&mut rebuilt)));
    }

    #[tokio::test]
    async fn cache_hit_skips_the_build() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join(MANIFEST_FILE), MANIFEST).unwrap();
        let config = ShaConfig { sha: "abc" };
        // a cache miss would shell out to packer and fail loudly (there is
        // no packer.json under this root)
        let first = ensure_build(&config, None, root.path()).await.unwrap();
        let second = ensure_build(&config, None, root.path()).await.unwrap();
        assert_eq!(first.ami, "ami-new".into());
        assert_eq!(second.ami, first.ami);
    }

    #[test]
    fn build_profile_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&BuildProfile::Release).unwrap(),
            "\"release\""
        );
        let profile: BuildProfile = serde_json::from_str("\"debug\"").unwrap();
        assert_eq!(profile, BuildProfile::Debug);
    }
}
