//! The riposte system: a leader, a second server, an auditor, and client
//! machines hammering the leader.
//!
//! Riposte has no configuration files; its database table shape is a
//! compile-time constant, so every trial patches a templated `types.go` and
//! recompiles on all machines. Each trial runs twice, once with the
//! communication-optimal table shape and once with an even square, and keeps
//! the better result.

use crate::cloud::{TfOutput, TfVars};
use crate::machine::Machine;
use crate::packer::{Build, BuildArgs};
use crate::progress::Status;
use crate::system::{self, ExperimentResult, Role};
use crate::{Bytes, Hostname, InstanceType, Region};
use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Report;
use futures::future::{join_all, try_join_all};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

const RESULT_PATTERN: &str = r"Served (\d+) requests at ([\d.]+) reqs/sec";
const WAIT_TIME: Duration = Duration::from_secs(60);
const PORT: u16 = 4000;
const RIPOSTE_BASE: &str = "/home/ubuntu/go/src/bitbucket.org/henrycg/riposte";
const RIPOSTE_LOG: &str = "riposte.log";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Experiment {
    #[serde(default = "InstanceType::default_type")]
    pub instance_type: InstanceType,
    // num cores
    #[serde(default = "Experiment::default_server_threads")]
    pub server_threads: usize,
    // 2 * (num cores)
    #[serde(default = "Experiment::default_client_threads")]
    pub client_threads: usize,
    #[serde(default = "Experiment::default_channels")]
    pub channels: usize,
    #[serde(default = "Experiment::default_message_size")]
    pub message_size: Bytes,
    #[serde(default = "Experiment::default_client_machines")]
    pub client_machines: usize,
}

impl Experiment {
    fn default_server_threads() -> usize {
        8
    }

    fn default_client_threads() -> usize {
        16
    }

    fn default_channels() -> usize {
        1
    }

    fn default_message_size() -> Bytes {
        Bytes(160)
    }

    fn default_client_machines() -> usize {
        1
    }

    /// Patches the table shape into the templated `types.go` and rebuilds
    /// the server and client binaries on one machine.
    async fn compile_machine(
        &self,
        machine: &Machine,
        shape: TableShape,
    ) -> Result<(), Report> {
        machine
            .exec(format!(
                "TABLE_WIDTH={width} TABLE_HEIGHT={height} MESSAGE_SIZE={size} \
                 envsubst '$TABLE_WIDTH $TABLE_HEIGHT $MESSAGE_SIZE' \
                 < /home/ubuntu/config/types.go.template \
                 > {base}/db/types.go",
                width = shape.width,
                height = shape.height,
                size = self.message_size,
                base = RIPOSTE_BASE,
            ))
            .await?;
        for binary_dir in ["server", "client"] {
            machine
                .exec(format!("cd {}/{} && go build", RIPOSTE_BASE, binary_dir))
                .await?;
        }
        Ok(())
    }

    async fn run_once(
        &self,
        setting: &Setting,
        status: &Status,
    ) -> Result<ExperimentResult<Self>, Report> {
        status.set("[experiment] starting servers");
        let hosts = [&setting.leader, &setting.server, &setting.auditor]
            .map(|machine| format!("{}:{}", machine.hostname(), PORT))
            .join(",");
        let server_command = |index: usize| {
            format!(
                "ulimit -n 65536 && {base}/server/server -idx {index} \
                 -servers {hosts} -threads {threads} 2>&1 | tee /tmp/riposte.log",
                base = RIPOSTE_BASE,
                index = index,
                hosts = hosts,
                threads = self.server_threads,
            )
        };
        // start order matters: the leader dials the others immediately
        let auditor = spawn_remote(&setting.auditor, server_command(2), Stdio::null())?;
        let server = spawn_remote(&setting.server, server_command(1), Stdio::null())?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let leader =
            spawn_remote(&setting.leader, server_command(0), Stdio::piped())?;
        // the leader waits 2s before accepting requests
        tokio::time::sleep(Duration::from_secs(2)).await;

        status.set("[experiment] starting clients");
        let client_command = format!(
            "{base}/client/client -leader {leader}:{port} -hammer -threads {threads} \
             2>&1 | tee /tmp/riposte-client.log",
            base = RIPOSTE_BASE,
            leader = setting.leader.hostname(),
            port = PORT,
            threads = self.client_threads,
        );
        let mut clients = setting
            .clients
            .iter()
            .map(|client| spawn_remote(client, client_command.clone(), Stdio::null()))
            .collect::<Result<Vec<_>, _>>()?;

        status.set(format!(
            "[experiment] running for {}s",
            WAIT_TIME.as_secs()
        ));
        tokio::time::sleep(WAIT_TIME).await;

        status.set("[experiment] cleaning up");
        for client in &mut clients {
            client.start_kill();
        }
        for client in clients {
            client.wait().await;
        }
        // kill_on_drop takes the other two servers down
        drop(server);
        drop(auditor);

        status.set("[experiment] parsing output");
        let output = leader.collect_stdout().await?;
        std::fs::write(RIPOSTE_LOG, &output).wrap_err("riposte log")?;
        let (time, queries) = parse_leader_output(&output)?;
        Ok(ExperimentResult::new(self.clone(), time, queries))
    }
}

struct RemoteProcess(tokio::process::Child);

impl RemoteProcess {
    fn start_kill(&mut self) {
        let _ = self.0.start_kill();
    }

    async fn wait(mut self) {
        let _ = self.0.wait().await;
    }

    async fn collect_stdout(mut self) -> Result<String, Report> {
        let _ = self.0.start_kill();
        let output = self
            .0
            .wait_with_output()
            .await
            .wrap_err("collect leader output")?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn spawn_remote(
    machine: &Machine,
    command: String,
    stdout: Stdio,
) -> Result<RemoteProcess, Report> {
    let mut process = machine.prepare_exec(command);
    let child = process
        .stdout(stdout)
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .wrap_err_with(|| format!("spawn remote process on {}", machine.hostname()))?;
    Ok(RemoteProcess(child))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TableShape {
    width: u64,
    height: u64,
}

/// The two candidate table shapes for a channel count and message size: the
/// communication-optimal rectangle (Riposte sec. 4.3) and the even square
/// the paper's fig. 4 suggests.
///
/// The row count uses the 19.5 multiplier (not 2.7) because the
/// implementation uses XOR rather than field addition; this gives a 95%
/// success rate (sec. 3.2).
fn table_shapes(channels: usize, message_size: Bytes) -> [TableShape; 2] {
    let rows = (channels as f64 * 19.5).ceil();
    let alpha = 128.0;
    let beta = (message_size.0 * 8) as f64; // bits per byte
    let c = (beta / (1.0 + alpha)).sqrt();
    let optimal = TableShape {
        width: (rows.sqrt() / c).ceil() as u64,
        height: (rows.sqrt() * c).ceil() as u64,
    };
    let side = rows.sqrt().ceil() as u64;
    let even = TableShape {
        width: side,
        height: side,
    };
    [optimal, even]
}

/// Sums the marginal throughput reports from the leader's output. The first
/// report covers startup and is skipped; fewer than three reports total
/// means the run didn't get going.
fn parse_leader_output(output: &str) -> Result<(u64, u64), Report> {
    let pattern = Regex::new(RESULT_PATTERN).wrap_err("result pattern")?;
    let matches: Vec<(u64, f64)> = output
        .lines()
        .filter_map(|line| {
            let captures = pattern.captures(line)?;
            let queries: u64 = captures[1].parse().ok()?;
            let rate: f64 = captures[2].parse().ok()?;
            Some((queries, rate))
        })
        .collect();
    if matches.len() <= 2 {
        bail!(
            "leader output has only {} performance reports (output in [{}])",
            matches.len(),
            RIPOSTE_LOG
        );
    }
    let mut total_queries = 0;
    let mut total_time = 0.0;
    // reports are marginal (the binaries are patched to not report
    // cumulative numbers), so summing across is sound
    for (queries, rate) in &matches[1..] {
        if *rate == 0.0 {
            continue;
        }
        total_queries += queries;
        total_time += *queries as f64 / rate;
    }
    if total_queries == 0 {
        bail!("leader served no requests");
    }
    Ok(((total_time * 1000.0) as u64, total_queries))
}

impl system::Experiment for Experiment {
    type Environment = Environment;
    type Setting = Setting;

    fn to_environment(&self) -> Environment {
        Environment {
            instance_type: self.instance_type.clone(),
            client_machines: self.client_machines,
        }
    }

    async fn run(
        &self,
        setting: &mut Setting,
        status: &Status,
    ) -> Result<ExperimentResult<Self>, Report> {
        let mut best: Option<ExperimentResult<Self>> = None;
        for shape in table_shapes(self.channels, self.message_size) {
            status.set(format!(
                "[experiment] compiling with a {}x{} table",
                shape.width, shape.height
            ));
            try_join_all(
                setting
                    .all()
                    .map(|machine| self.compile_machine(machine, shape)),
            )
            .await?;

            let result = self.run_once(setting, status).await?;
            best = Some(match best {
                Some(previous) if previous.qps() >= result.qps() => previous,
                _ => result,
            });
        }
        best.ok_or_else(|| eyre!("no table shape produced a result"))
    }

    async fn teardown(&self, setting: &mut Setting) {
        let _ = join_all(
            setting
                .all()
                .map(|machine| machine.exec_unchecked("pkill -f riposte")),
        )
        .await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Environment {
    pub instance_type: InstanceType,
    pub client_machines: usize,
}

impl system::Environment for Environment {
    fn instance_type(&self) -> InstanceType {
        self.instance_type.clone()
    }

    fn machine_count(&self) -> usize {
        // leader, server, auditor, plus the clients
        3 + self.client_machines
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
        ])
    }
}

pub struct Setting {
    clients: Vec<Machine>,
    leader: Machine,
    server: Machine,
    auditor: Machine,
}

impl Setting {
    fn all(&self) -> impl Iterator<Item = &Machine> {
        [&self.leader, &self.server, &self.auditor]
            .into_iter()
            .chain(self.clients.iter())
    }
}

impl system::Setting for Setting {
    fn machine_spec(
        output: &TfOutput,
    ) -> Result<Vec<(Role, Hostname)>, Report> {
        let mut spec = vec![
            (Role::Named("leader"), output.string("leader")?.into()),
            (Role::Named("server"), output.string("server")?.into()),
            (Role::Named("auditor"), output.string("auditor")?.into()),
        ];
        for (index, client) in output.string_list("clients")?.into_iter().enumerate()
        {
            spec.push((Role::Indexed("client", index), client.into()));
        }
        Ok(spec)
    }

    fn from_machines(machines: HashMap<Role, Machine>) -> Result<Self, Report> {
        let mut leader = None;
        let mut server = None;
        let mut auditor = None;
        let mut clients = Vec::new();
        for (role, machine) in machines {
            match role {
                Role::Named("leader") => leader = Some(machine),
                Role::Named("server") => server = Some(machine),
                Role::Named("auditor") => auditor = Some(machine),
                Role::Indexed("client", index) => clients.push((index, machine)),
                other => bail!("unexpected role [{}]", other),
            }
        }
        clients.sort_by_key(|(index, _)| *index);
        if clients.is_empty() {
            bail!("no client machines");
        }
        Ok(Self {
            clients: clients.into_iter().map(|(_, machine)| machine).collect(),
            leader: leader.ok_or_else(|| eyre!("missing leader"))?,
            server: server.ok_or_else(|| eyre!("missing server"))?,
            auditor: auditor.ok_or_else(|| eyre!("missing auditor"))?,
        })
    }

    async fn additional_setup(
        &mut self,
        _status: &Status,
    ) -> Result<(), Report> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackerConfig {
    pub instance_type: InstanceType,
}

impl system::PackerConfig for PackerConfig {
    async fn packer_vars(&self, _staging: &Path) -> Result<TfVars, Report> {
        Ok(TfVars::from([
            ("region".to_string(), Region::aws().to_string()),
            (
                "instance_type".to_string(),
                self.instance_type.to_string(),
            ),
        ]))
    }

    fn matches(&self, build: &Build) -> bool {
        build.custom("instance_type") == Some(self.instance_type.0.as_str())
    }
}

pub struct Riposte;

impl system::System for Riposte {
    const NAME: &'static str = "riposte";

    type Experiment = Experiment;
    type PackerConfig = PackerConfig;

    fn root_dir() -> &'static Path {
        Path::new("infra/riposte")
    }

    fn packer_config(
        _build: &BuildArgs,
        environment: &Environment,
    ) -> Result<PackerConfig, Report> {
        Ok(PackerConfig {
            instance_type: environment.instance_type.clone(),
        })
    }
}
