//! The spectrum system: a publisher, groups of workers, and client machines
//! hammering them, coordinated through etcd on the publisher.
//!
//! Workers and viewers run as templated systemd units
//! (`spectrum-worker@N`, `viewer@N`); throughput is scraped from the worker
//! journals after a fixed measurement window.

use crate::cloud::{TfOutput, TfVars};
use crate::machine::Machine;
use crate::packer::{Build, BuildArgs, BuildProfile};
use crate::progress::Status;
use crate::system::{self, ExperimentResult, Role};
use crate::systems::push_file;
use crate::{Bytes, Hostname, InstanceType, Region, Sha};
use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Report;
use futures::future::{join_all, try_join_all};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// install.sh bakes this many worker units into the image
const MAX_WORKERS_PER_MACHINE: usize = 10;

const EXPERIMENT_TIMEOUT: Duration = Duration::from_secs(60);
const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

const TIMING_PATTERN: &str =
    r"([0-9]+) clients processed in time ([0-9]+)ms \([0-9]+ qps\)";

/// Which security mode the protocol runs in; decides the worker group count
/// and the flag passed to the remote setup binary. Deserializes from a
/// single-key tagged map such as `{"Symmetric": {"security": 16}}`; unknown
/// variants and fields are hard errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum Protocol {
    Symmetric {
        #[serde(default = "Protocol::default_security")]
        security: Bytes,
    },
    Insecure {
        #[serde(default = "Protocol::default_parties")]
        parties: usize,
    },
    SeedHomomorphic { parties: usize },
}

impl Protocol {
    fn default_security() -> Bytes {
        Bytes(16)
    }

    fn default_parties() -> usize {
        2
    }

    pub fn flag(&self) -> String {
        match self {
            Protocol::Symmetric { security } => {
                format!("--security {}", security)
            }
            Protocol::Insecure { .. } => "--no-security".to_string(),
            Protocol::SeedHomomorphic { .. } => {
                "--security-multi-key 16".to_string()
            }
        }
    }

    /// The two-party symmetric mode always runs with exactly 2 groups.
    pub fn groups(&self) -> usize {
        match self {
            Protocol::Symmetric { .. } => 2,
            Protocol::Insecure { parties } => *parties,
            Protocol::SeedHomomorphic { parties } => *parties,
        }
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Symmetric {
            security: Self::default_security(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Experiment {
    pub clients: u32,
    pub channels: usize,
    pub message_size: Bytes,
    #[serde(default = "InstanceType::default_type")]
    pub instance_type: InstanceType,
    #[serde(
        default = "Experiment::default_clients_per_machine",
        deserialize_with = "positive_clients_per_machine"
    )]
    pub clients_per_machine: u32,
    #[serde(default = "Experiment::default_workers_per_machine")]
    pub workers_per_machine: usize,
    #[serde(default = "Experiment::default_worker_machines_per_group")]
    pub worker_machines_per_group: usize,
    #[serde(default)]
    pub protocol: Protocol,
}

/// The client machine count is `clients` divided by this, so zero is a
/// configuration error, not a fleet of zero machines.
fn positive_clients_per_machine<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = u32::deserialize(deserializer)?;
    if value == 0 {
        return Err(serde::de::Error::custom(
            "clients_per_machine must be positive",
        ));
    }
    Ok(value)
}

impl Experiment {
    fn default_clients_per_machine() -> u32 {
        200
    }

    fn default_workers_per_machine() -> usize {
        4
    }

    fn default_worker_machines_per_group() -> usize {
        1
    }

    pub fn groups(&self) -> usize {
        self.protocol.groups()
    }

    /// Worker processes per group, across all of the group's machines.
    pub fn group_size(&self) -> usize {
        self.workers_per_machine * self.worker_machines_per_group
    }

    async fn execute(
        &self,
        publisher: &Machine,
        workers: &[Machine],
        etcd_url: &str,
    ) -> Result<ExperimentResult<Self>, Report> {
        install_spectrum_config(
            publisher,
            &[("SPECTRUM_CONFIG_SERVER".to_string(), etcd_url.to_string())],
        )
        .await?;
        publisher.exec("sudo systemctl start spectrum-publisher").await?;
        // leave some of the window for fetching and shutdown
        tokio::time::sleep(EXPERIMENT_TIMEOUT - Duration::from_secs(10)).await;

        let timings =
            try_join_all(workers.iter().map(|worker| self.fetch_timing(worker)))
                .await?;
        let timings: Vec<MachineTiming> =
            timings.into_iter().flatten().collect();
        if timings.is_empty() {
            bail!("no worker reported any completed clients");
        }

        // each group serves every query, so dividing by the group count
        // avoids double-counting
        let total_qps = timings.iter().map(|timing| timing.qps).sum::<f64>()
            / self.groups() as f64;
        let min_time = timings
            .iter()
            .map(|timing| timing.time)
            .min()
            .expect("timings is non-empty");
        let queries = (total_qps * min_time as f64 / 1000.0) as u64;
        Ok(ExperimentResult::new(self.clone(), min_time, queries))
    }

    /// Best throughput seen by each worker process on this machine, summed;
    /// `None` if no process logged a result.
    async fn fetch_timing(
        &self,
        worker: &Machine,
    ) -> Result<Option<MachineTiming>, Report> {
        let pattern = Regex::new(TIMING_PATTERN).wrap_err("timing pattern")?;
        let mut total_qps = 0.0;
        let mut max_time = None;
        for process in 1..=self.workers_per_machine {
            // grep exits non-zero when a process logged nothing; that's fine
            let log = worker
                .exec_unchecked(format!(
                    "journalctl --unit spectrum-worker@{} | grep -Eo '{}'",
                    process, TIMING_PATTERN
                ))
                .await?;
            if let Some(best) = best_process_timing(&log, &pattern) {
                total_qps += best.qps;
                max_time = Some(match max_time {
                    Some(time) if time > best.time => time,
                    _ => best.time,
                });
            }
        }
        Ok(max_time.map(|time| MachineTiming {
            qps: total_qps,
            time,
        }))
    }
}

struct MachineTiming {
    qps: f64,
    time: u64,
}

/// Picks the best (highest-throughput) intermediate result from one worker
/// process's journal excerpt.
fn best_process_timing(log: &str, pattern: &Regex) -> Option<MachineTiming> {
    log.lines()
        .filter_map(|line| {
            let captures = pattern.captures(line)?;
            let clients: u64 = captures[1].parse().ok()?;
            let time: u64 = captures[2].parse().ok()?;
            if time == 0 {
                return None;
            }
            Some(MachineTiming {
                qps: clients as f64 / time as f64 * 1000.0,
                time,
            })
        })
        .max_by(|a, b| a.qps.total_cmp(&b.qps))
}

/// Inclusive 1-based viewer index ranges, one per client machine; every
/// machine gets a full allotment except possibly the last.
fn client_ranges(clients: u32, per_machine: u32) -> Vec<(u32, u32)> {
    let mut ranges = Vec::new();
    let mut start = 1;
    while start <= clients {
        let stop = (start + per_machine - 1).min(clients);
        ranges.push((start, stop));
        start = stop + 1;
    }
    ranges
}

async fn install_spectrum_config(
    machine: &Machine,
    vars: &[(String, String)],
) -> Result<(), Report> {
    let contents = vars
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("\n");
    push_file(machine, &contents, "/tmp/spectrum.conf").await?;
    machine
        .exec("sudo install -m 644 /tmp/spectrum.conf /etc/spectrum.conf")
        .await?;
    Ok(())
}

async fn prepare_worker(
    machine: &Machine,
    group: usize,
    worker_start_index: usize,
    num_workers: usize,
    etcd_url: &str,
) -> Result<(), Report> {
    let vars = vec![
        ("SPECTRUM_WORKER_GROUP".to_string(), group.to_string()),
        (
            "SPECTRUM_WORKER_START_INDEX".to_string(),
            worker_start_index.to_string(),
        ),
        (
            "SPECTRUM_TLS_CA".to_string(),
            "/home/ubuntu/spectrum/data/ca.crt".to_string(),
        ),
        (
            "SPECTRUM_TLS_KEY".to_string(),
            "/home/ubuntu/spectrum/data/server.key".to_string(),
        ),
        (
            "SPECTRUM_TLS_CERT".to_string(),
            "/home/ubuntu/spectrum/data/server.crt".to_string(),
        ),
        ("SPECTRUM_CONFIG_SERVER".to_string(), etcd_url.to_string()),
    ];
    install_spectrum_config(machine, &vars).await?;

    // stale results from a previous run on this machine would confuse the
    // journal scrape
    machine
        .exec("sudo journalctl --rotate && sudo journalctl --vacuum-time=1s")
        .await?;

    machine
        .exec(format!(
            "sudo systemctl start spectrum-worker@{{1..{}}}",
            num_workers
        ))
        .await?;
    Ok(())
}

async fn prepare_client(
    machine: &Machine,
    range: (u32, u32),
    etcd_url: &str,
) -> Result<(), Report> {
    let vars = vec![
        (
            "SPECTRUM_TLS_CA".to_string(),
            "/home/ubuntu/spectrum/data/ca.crt".to_string(),
        ),
        ("SPECTRUM_CONFIG_SERVER".to_string(), etcd_url.to_string()),
    ];
    install_spectrum_config(machine, &vars).await?;
    machine
        .exec(format!(
            "sudo systemctl start viewer@{{{}..{}}}",
            range.0, range.1
        ))
        .await?;
    Ok(())
}

impl system::Experiment for Experiment {
    type Environment = Environment;
    type Setting = Setting;

    fn to_environment(&self) -> Environment {
        let client_machines = (self.clients + self.clients_per_machine - 1)
            / self.clients_per_machine;
        Environment {
            instance_type: self.instance_type.clone(),
            client_machines: client_machines as usize,
            worker_machines: self.worker_machines_per_group * self.groups(),
        }
    }

    async fn run(
        &self,
        setting: &mut Setting,
        status: &Status,
    ) -> Result<ExperimentResult<Self>, Report> {
        if self.workers_per_machine > MAX_WORKERS_PER_MACHINE {
            bail!(
                "at most {} workers per machine are installed",
                MAX_WORKERS_PER_MACHINE
            );
        }

        let publisher = &setting.publisher;
        let etcd_url = format!("etcd://{}:2379", publisher.hostname());

        status.set("[experiment] setting up");
        publisher
            .exec("sudo journalctl --rotate && sudo journalctl --vacuum-time=1s")
            .await?;
        // blank slate for the config server
        publisher
            .exec("ETCDCTL_API=3 etcdctl --endpoints localhost:2379 del --prefix ''")
            .await?;
        publisher
            .exec_with_timeout(
                format!(
                    "SPECTRUM_CONFIG_SERVER={} /home/ubuntu/spectrum/setup \
                     {} --hammer --channels {} --clients {} --group-size {} \
                     --groups {} --message-size {}",
                    etcd_url,
                    self.protocol.flag(),
                    self.channels,
                    self.clients,
                    self.group_size(),
                    self.groups(),
                    self.message_size
                ),
                SETUP_TIMEOUT,
            )
            .await?;

        status.set("[experiment] starting workers and clients");
        let assignments = (0..self.worker_machines_per_group).flat_map(
            |machine_index| {
                (0..self.groups()).map(move |group| (machine_index, group))
            },
        );
        try_join_all(assignments.zip(setting.workers.iter()).map(
            |((machine_index, group), worker)| {
                prepare_worker(
                    worker,
                    group + 1,
                    machine_index * self.workers_per_machine,
                    self.workers_per_machine,
                    &etcd_url,
                )
            },
        ))
        .await?;

        let ranges = client_ranges(self.clients, self.clients_per_machine);
        try_join_all(setting.clients.iter().zip(ranges).map(
            |(client, range)| prepare_client(client, range, &etcd_url),
        ))
        .await?;

        status.set("[experiment] running");
        match tokio::time::timeout(
            EXPERIMENT_TIMEOUT,
            self.execute(publisher, &setting.workers, &etcd_url),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => bail!(
                "experiment timed out after {:?}",
                EXPERIMENT_TIMEOUT
            ),
        }
    }

    async fn teardown(&self, setting: &mut Setting) {
        let mut shutdowns = Vec::new();
        for worker in &setting.workers {
            shutdowns
                .push(worker.exec_unchecked("sudo systemctl stop 'spectrum-worker@*'"));
        }
        for client in &setting.clients {
            shutdowns.push(client.exec_unchecked("sudo systemctl stop 'viewer@*'"));
        }
        let publisher = setting
            .publisher
            .exec_unchecked("sudo systemctl stop spectrum-publisher");
        let _ = join_all(shutdowns).await;
        let _ = publisher.await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Environment {
    pub instance_type: InstanceType,
    pub client_machines: usize,
    pub worker_machines: usize,
}

impl system::Environment for Environment {
    fn instance_type(&self) -> InstanceType {
        self.instance_type.clone()
    }

    fn machine_count(&self) -> usize {
        // +1 for the publisher
        self.client_machines + self.worker_machines + 1
    }

    fn tf_vars(&self, build: &Build) -> TfVars {
        TfVars::from([
            ("ami".to_string(), build.ami.to_string()),
            ("region".to_string(), Region::aws().to_string()),
            (
                "instance_type".to_string(),
                self.instance_type.to_string(),
            ),
            (
                "client_machine_count".to_string(),
                self.client_machines.to_string(),
            ),
            (
                "worker_machine_count".to_string(),
                self.worker_machines.to_string(),
            ),
        ])
    }

    fn cleanup_tf_vars() -> TfVars {
        TfVars::from([
            ("ami".to_string(), "null".to_string()),
            // must match the region everything was created in
            ("region".to_string(), Region::aws().to_string()),
            (
                "instance_type".to_string(),
                InstanceType::default_type().to_string(),
            ),
            ("client_machine_count".to_string(), "0".to_string()),
            ("worker_machine_count".to_string(), "0".to_string()),
        ])
    }
}

pub struct Setting {
    publisher: Machine,
    workers: Vec<Machine>,
    clients: Vec<Machine>,
}

impl system::Setting for Setting {
    fn machine_spec(
        output: &TfOutput,
    ) -> Result<Vec<(Role, Hostname)>, Report> {
        let mut spec = vec![(
            Role::Named("publisher"),
            output.string("publisher")?.into(),
        )];
        for (index, worker) in output.string_list("workers")?.into_iter().enumerate()
        {
            spec.push((Role::Indexed("worker", index), worker.into()));
        }
        for (index, client) in output.string_list("clients")?.into_iter().enumerate()
        {
            spec.push((Role::Indexed("client", index), client.into()));
        }
        Ok(spec)
    }

    fn from_machines(machines: HashMap<Role, Machine>) -> Result<Self, Report> {
        let mut publisher = None;
        let mut workers = Vec::new();
        let mut clients = Vec::new();
        for (role, machine) in machines {
            match role {
                Role::Named("publisher") => publisher = Some(machine),
                Role::Indexed("worker", index) => workers.push((index, machine)),
                Role::Indexed("client", index) => clients.push((index, machine)),
                other => bail!("unexpected role [{}]", other),
            }
        }
        workers.sort_by_key(|(index, _)| *index);
        clients.sort_by_key(|(index, _)| *index);
        Ok(Self {
            publisher: publisher.ok_or_else(|| eyre!("missing publisher"))?,
            workers: workers.into_iter().map(|(_, machine)| machine).collect(),
            clients: clients.into_iter().map(|(_, machine)| machine).collect(),
        })
    }

    async fn additional_setup(&mut self, status: &Status) -> Result<(), Report> {
        status.set("[infrastructure] starting etcd");
        self.publisher
            .exec(
                "envsubst '$HOSTNAME' < $HOME/config/etcd.template \
                 | sudo tee /etc/default/etcd > /dev/null",
            )
            .await?;
        self.publisher.exec("sudo systemctl restart etcd").await?;

        let health = format!(
            "ETCDCTL_API=3 etcdctl --endpoints {}:2379 endpoint health",
            self.publisher.hostname()
        );
        let mut last_err = None;
        for _ in 0..20 {
            match self.publisher.exec(&health).await {
                Ok(_) => {
                    status.succeed("[infrastructure] etcd healthy");
                    return Ok(());
                }
                Err(err) => last_err = Some(err),
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        Err(last_err.expect("at least one health check attempt"))
            .wrap_err("etcd never became healthy")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackerConfig {
    pub instance_type: InstanceType,
    pub sha: Sha,
    pub profile: BuildProfile,
    pub git_root: PathBuf,
}

impl system::PackerConfig for PackerConfig {
    async fn packer_vars(&self, staging: &Path) -> Result<TfVars, Report> {
        let archive = staging.join("spectrum-src.tar.gz");
        let exit = tokio::process::Command::new("git")
            .arg("archive")
            .arg("--format")
            .arg("tar.gz")
            .arg("--output")
            .arg(&archive)
            .arg("--prefix")
            .arg("spectrum/")
            .arg(&self.sha.0)
            .current_dir(&self.git_root)
            .status()
            .await
            .wrap_err("git archive")?;
        if !exit.success() {
            bail!("git archive of {} failed ({})", self.sha, exit);
        }
        Ok(TfVars::from([
            ("sha".to_string(), self.sha.to_string()),
            (
                "src_archive".to_string(),
                archive.display().to_string(),
            ),
            ("profile".to_string(), self.profile.to_string()),
            ("region".to_string(), Region::aws().to_string()),
            (
                "instance_type".to_string(),
                self.instance_type.to_string(),
            ),
        ]))
    }

    fn matches(&self, build: &Build) -> bool {
        build.custom("instance_type") == Some(self.instance_type.0.as_str())
            && build.custom("sha") == Some(self.sha.0.as_str())
            && build.custom("profile") == Some(self.profile.to_string().as_str())
    }
}

pub struct Spectrum;

impl system::System for Spectrum {
    const NAME: &'static str = "spectrum";

    type Experiment = Experiment;
    type PackerConfig = PackerConfig;

    fn root_dir() -> &'static Path {
        Path::new("infra/spectrum")
    }

    fn packer_config(
        build: &BuildArgs,
        environment: &Environment,
    ) -> Result<PackerConfig, Report> {
        let sha = build
            .sha
            .clone()
            .ok_or_else(|| eyre!("spectrum needs a source revision to build"))?;
        let git_root = build
            .git_root
            .clone()
            .ok_or_else(|| eyre!("spectrum needs a git checkout to build from"))?;
        Ok(PackerConfig {
            instance_type: environment.instance_type.clone(),
            sha,
            profile: build.profile,
            git_root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{group_by_environment, Environment as _, Experiment as _};

    fn experiment(json: &str) -> Experiment {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn defaults_fill_in() {
        let exp = experiment(
            r#"{"clients": 100, "channels": 1, "message_size": 1024}"#,
        );
        assert_eq!(exp.instance_type, InstanceType::default_type());
        assert_eq!(exp.clients_per_machine, 200);
        assert_eq!(exp.workers_per_machine, 4);
        assert_eq!(exp.worker_machines_per_group, 1);
        assert_eq!(exp.protocol, Protocol::default());
    }

    #[test]
    fn zero_clients_per_machine_is_rejected() {
        let err = serde_json::from_str::<Experiment>(
            r#"{"clients": 100, "channels": 1, "message_size": 1024,
                "clients_per_machine": 0}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("clients_per_machine"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<Experiment>(
            r#"{"clients": 100, "channels": 1, "message_size": 1024, "client": 7}"#
        )
        .is_err());
    }

    #[test]
    fn protocol_decodes_tagged_maps() {
        let exp = experiment(
            r#"{"clients": 10, "channels": 1, "message_size": 1024,
                "protocol": {"SeedHomomorphic": {"parties": 5}}}"#,
        );
        assert_eq!(exp.groups(), 5);
        assert_eq!(exp.protocol.flag(), "--security-multi-key 16");

        let exp = experiment(
            r#"{"clients": 10, "channels": 1, "message_size": 1024,
                "protocol": {"Insecure": {}}}"#,
        );
        assert_eq!(exp.groups(), 2);
        assert_eq!(exp.protocol.flag(), "--no-security");

        let exp = experiment(
            r#"{"clients": 10, "channels": 1, "message_size": 1024,
                "protocol": {"Symmetric": {"security": 32}}}"#,
        );
        assert_eq!(exp.protocol.flag(), "--security 32");
    }

    #[test]
    fn protocol_rejects_unknown_variants() {
        assert!(serde_json::from_str::<Protocol>(
            r#"{"Quantum": {"parties": 2}}"#
        )
        .is_err());
        assert!(serde_json::from_str::<Protocol>(
            r#"{"Symmetric": {"securty": 16}}"#
        )
        .is_err());
    }

    #[test]
    fn environment_math() {
        let exp = experiment(
            r#"{"clients": 450, "channels": 1, "message_size": 1024,
                "worker_machines_per_group": 2,
                "protocol": {"Insecure": {"parties": 3}}}"#,
        );
        let env = exp.to_environment();
        // ceil(450 / 200)
        assert_eq!(env.client_machines, 3);
        // 2 machines per group, 3 groups
        assert_eq!(env.worker_machines, 6);
        // plus the publisher
        assert_eq!(env.machine_count(), 10);
        // 4 workers per machine, 2 machines per group
        assert_eq!(exp.group_size(), 8);
    }

    #[test]
    fn client_ranges_fill_machines_in_order() {
        assert_eq!(
            client_ranges(450, 200),
            vec![(1, 200), (201, 400), (401, 450)]
        );
        assert_eq!(client_ranges(400, 200), vec![(1, 200), (201, 400)]);
        assert_eq!(client_ranges(10, 200), vec![(1, 10)]);
        assert!(client_ranges(0, 200).is_empty());
    }

    #[test]
    fn best_process_timing_picks_highest_qps() {
        let pattern = Regex::new(TIMING_PATTERN).unwrap();
        let log = "\
100 clients processed in time 1000ms (100 qps)
300 clients processed in time 2000ms (150 qps)
garbage line
120 clients processed in time 1000ms (120 qps)
";
        let best = best_process_timing(log, &pattern).unwrap();
        assert_eq!(best.time, 2000);
        assert!((best.qps - 150.0).abs() < 1e-6);

        assert!(best_process_timing("nothing here", &pattern).is_none());
    }

    #[test]
    fn cleanup_vars_are_environment_independent() {
        let vars = Environment::cleanup_tf_vars();
        assert_eq!(vars["client_machine_count"], "0");
        assert_eq!(vars["worker_machine_count"], "0");
        assert_eq!(vars["ami"], "null");
        assert_eq!(vars["region"], crate::AWS_REGION);
    }

    #[test]
    fn experiments_with_equal_shapes_share_an_environment() {
        // same machine counts even though the client counts differ
        let experiments = vec![
            experiment(r#"{"clients": 150, "channels": 1, "message_size": 1024}"#),
            experiment(r#"{"clients": 350, "channels": 1, "message_size": 1024}"#),
            experiment(r#"{"clients": 180, "channels": 2, "message_size": 1024}"#),
        ];
        let groups = group_by_environment(experiments);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0.client_machines, 1);
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0.client_machines, 2);
        assert_eq!(groups[1].1.len(), 1);
    }
}
