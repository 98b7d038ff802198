//! The contract every system under test implements.
//!
//! - an [`Environment`] describes the infrastructure *shape* an experiment
//!   needs (machine type, per-role machine counts);
//! - a [`Setting`] is the live counterpart: connected [`Machine`]s organized
//!   by role;
//! - an [`Experiment`] is one fully-parameterized trial, which knows the
//!   environment it needs and how to run against a setting.
//!
//! Experiments with equal environments share one provisioned fleet, so
//! environments carry a total order for grouping.

use crate::cloud::{TfOutput, TfVars};
use crate::machine::Machine;
use crate::packer::{Build, BuildArgs};
use crate::progress::Status;
use crate::{Hostname, InstanceType};
use color_eyre::Report;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::path::Path;

/// Identifies one machine within a fleet: either a singleton role
/// (`Named("publisher")`) or one slot of a pool (`Indexed("worker", 3)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Named(&'static str),
    Indexed(&'static str, usize),
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Named(name) => write!(f, "{}", name),
            Role::Indexed(name, index) => write!(f, "{}[{}]", name, index),
        }
    }
}

pub trait Environment:
    Clone + Eq + Ord + Hash + fmt::Debug + Send + Sync
{
    fn instance_type(&self) -> InstanceType;

    /// How many machines this environment provisions in total; the fleet
    /// connector checks it against the machine spec and treats a mismatch as
    /// a fatal configuration error.
    fn machine_count(&self) -> usize;

    fn tf_vars(&self, build: &Build) -> TfVars;

    /// The fixed variable set used for teardown: all counts zero, null
    /// image. Independent of any live environment so that teardown destroys
    /// everything even when the bookkeeping of "what was last provisioned"
    /// is stale.
    fn cleanup_tf_vars() -> TfVars;
}

#[allow(async_fn_in_trait)]
pub trait Setting: Sized {
    /// Maps the raw provisioner output (hostname lists per role) to the flat
    /// role → hostname assignment the fleet connector should dial.
    fn machine_spec(output: &TfOutput) -> Result<Vec<(Role, Hostname)>, Report>;

    /// Assembles the setting from connected machines, validating that every
    /// required role is present and nothing unknown snuck in.
    fn from_machines(machines: HashMap<Role, Machine>) -> Result<Self, Report>;

    /// One-time bootstrap after all connections are live and before any
    /// trial (e.g. starting a coordination service and polling it healthy).
    async fn additional_setup(&mut self, status: &Status) -> Result<(), Report>;
}

#[allow(async_fn_in_trait)]
pub trait Experiment:
    Clone + fmt::Debug + Serialize + DeserializeOwned
{
    type Environment: Environment;
    type Setting: Setting;

    /// The infrastructure shape this experiment needs. Pure.
    fn to_environment(&self) -> Self::Environment;

    /// Runs one trial and returns its result. The trial executor may cancel
    /// this future at any suspension point; remote cleanup happens in
    /// [`teardown`](Self::teardown), which the executor always calls
    /// afterwards.
    async fn run(
        &self,
        setting: &mut Self::Setting,
        status: &Status,
    ) -> Result<ExperimentResult<Self>, Report>;

    /// Best-effort remote shutdown, run after every attempt (success,
    /// failure, or cancellation) so no trial state leaks into the next
    /// attempt. Must tolerate remote failures.
    async fn teardown(&self, setting: &mut Self::Setting);
}

/// A build-cache key plus the recipe for invoking the image builder.
pub trait PackerConfig: Clone + Eq + Hash + fmt::Debug {
    /// The variables to pass to the builder. May stage artifacts (e.g. a
    /// source archive) under `staging`, which outlives the build invocation.
    fn packer_vars(
        &self,
        staging: &Path,
    ) -> impl Future<Output = Result<TfVars, Report>>;

    /// Whether a persisted build record was produced from this
    /// configuration (value equality over all configuration fields).
    fn matches(&self, build: &Build) -> bool;
}

/// Ties one system under test together: its experiment type, its build
/// configuration, and the directory holding its terraform/packer files.
pub trait System {
    const NAME: &'static str;

    type Experiment: Experiment;
    type PackerConfig: PackerConfig;

    /// Directory containing this system's `main.tf`, `packer.json`, config
    /// templates, and build manifest.
    fn root_dir() -> &'static Path;

    fn packer_config(
        build: &BuildArgs,
        environment: &EnvironmentOf<Self>,
    ) -> Result<Self::PackerConfig, Report>;
}

pub type EnvironmentOf<S> =
    <<S as System>::Experiment as Experiment>::Environment;
pub type SettingOf<S> = <<S as System>::Experiment as Experiment>::Setting;

/// The outcome of one successful trial, serialized flat alongside the
/// experiment that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentResult<E> {
    #[serde(flatten)]
    pub experiment: E,
    /// Elapsed time in milliseconds.
    pub time: u64,
    pub queries: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_latency: Option<f64>,
}

impl<E> ExperimentResult<E> {
    pub fn new(experiment: E, time: u64, queries: u64) -> Self {
        Self {
            experiment,
            time,
            queries,
            mean_latency: None,
        }
    }

    pub fn qps(&self) -> u64 {
        if self.time == 0 {
            return 0;
        }
        (self.queries as f64 / self.time as f64 * 1000.0) as u64
    }
}

/// Groups experiments that can share a fleet: stable-sorts by environment,
/// then partitions into maximal runs of equal environments. Order within a
/// group is the input order.
pub fn group_by_environment<E: Experiment>(
    mut experiments: Vec<E>,
) -> Vec<(E::Environment, Vec<E>)> {
    experiments.sort_by(|a, b| a.to_environment().cmp(&b.to_environment()));
    let mut groups: Vec<(E::Environment, Vec<E>)> = Vec::new();
    for experiment in experiments {
        let environment = experiment.to_environment();
        match groups.last_mut() {
            Some((group_env, group)) if *group_env == environment => {
                group.push(experiment)
            }
            _ => groups.push((environment, vec![experiment])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::TfVars;
    use crate::packer::Build;
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    struct Env(usize);

    impl Environment for Env {
        fn instance_type(&self) -> InstanceType {
            InstanceType::default_type()
        }

        fn machine_count(&self) -> usize {
            self.0
        }

        fn tf_vars(&self, _build: &Build) -> TfVars {
            TfVars::new()
        }

        fn cleanup_tf_vars() -> TfVars {
            TfVars::new()
        }
    }

    struct NoSetting;

    impl Setting for NoSetting {
        fn machine_spec(
            _output: &TfOutput,
        ) -> Result<Vec<(Role, Hostname)>, Report> {
            Ok(Vec::new())
        }

        fn from_machines(
            _machines: HashMap<Role, Machine>,
        ) -> Result<Self, Report> {
            Ok(NoSetting)
        }

        async fn additional_setup(
            &mut self,
            _status: &Status,
        ) -> Result<(), Report> {
            Ok(())
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Exp {
        machines: usize,
        label: String,
    }

    impl Experiment for Exp {
        type Environment = Env;
        type Setting = NoSetting;

        fn to_environment(&self) -> Env {
            Env(self.machines)
        }

        async fn run(
            &self,
            _setting: &mut NoSetting,
            _status: &Status,
        ) -> Result<ExperimentResult<Self>, Report> {
            unreachable!()
        }

        async fn teardown(&self, _setting: &mut NoSetting) {}
    }

    fn exp(machines: usize, label: &str) -> Exp {
        Exp {
            machines,
            label: label.to_string(),
        }
    }

    #[test]
    fn grouping_partitions_equal_environments() {
        let experiments = vec![
            exp(2, "a"),
            exp(4, "b"),
            exp(2, "c"),
            exp(4, "d"),
            exp(1, "e"),
        ];
        let groups = group_by_environment(experiments);
        let shape: Vec<(usize, Vec<&str>)> = groups
            .iter()
            .map(|(env, exps)| {
                (env.0, exps.iter().map(|e| e.label.as_str()).collect())
            })
            .collect();
        assert_eq!(
            shape,
            vec![
                (1, vec!["e"]),
                (2, vec!["a", "c"]),
                (4, vec!["b", "d"]),
            ]
        );
    }

    #[test]
    fn grouping_preserves_input_order_within_a_group() {
        let experiments =
            vec![exp(3, "first"), exp(3, "second"), exp(3, "third")];
        let groups = group_by_environment(experiments);
        assert_eq!(groups.len(), 1);
        let labels: Vec<&str> =
            groups[0].1.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["first", "second", "third"]);
    }

    #[test]
    fn qps_derives_from_queries_and_time() {
        let result = ExperimentResult::new((), 2000, 500);
        assert_eq!(result.qps(), 250);
        let result = ExperimentResult::new((), 0, 500);
        assert_eq!(result.qps(), 0);
    }
}
