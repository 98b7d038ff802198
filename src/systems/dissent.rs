//! The dissent system: two servers and a client machine running listener and
//! broadcaster processes. This is a latency benchmark: one broadcast is
//! triggered over HTTP and the phase timestamps are read back out of the
//! server log.
//!
//! Dissent silently fails when the servers use keys we generate, so the two
//! demo keys it ships with are always used for the servers; client keys are
//! drawn from the generated pool.

use crate::cloud::{TfOutput, TfVars};
use crate::machine::Machine;
use crate::packer::{Build, BuildArgs};
use crate::progress::Status;
use crate::system::{self, ExperimentResult, Role, System as _};
use crate::systems::push_file;
use crate::{Bytes, Hostname, InstanceType, Region};
use chrono::NaiveDateTime;
use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Report;
use futures::future::{join_all, try_join_all};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

const PORT: u16 = 6000;
const WAIT_TIME: Duration = Duration::from_secs(300);

const SERVER0_ID: &str = "QUTDkL8mYss2gBw-E2fx1GGAh2w=";
const SERVER1_ID: &str = "h8m9jFrEqu4bOcUBxYilGQMsYXE=";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Experiment {
    pub clients: usize,
    #[serde(default = "InstanceType::default_type")]
    pub instance_type: InstanceType,
    #[serde(default = "Experiment::default_channels")]
    pub channels: usize,
    #[serde(default = "Experiment::default_message_size")]
    pub message_size: Bytes,
    /// Whether to run the blame (accountability) phase; without it the
    /// measurement covers the best-case broadcast only.
    #[serde(default)]
    pub blame: bool,
}

impl Experiment {
    fn default_channels() -> usize {
        1
    }

    fn default_message_size() -> Bytes {
        Bytes(160)
    }
}

/// Which key each process runs under.
#[derive(Debug, PartialEq, Eq)]
struct KeyAssignment {
    server0: String,
    server1: String,
    broadcasters: Vec<String>,
    listeners: Vec<String>,
}

/// Assigns keys from an `ls keys/private` listing: the fixed demo keys for
/// the servers, then the lexicographically largest generated keys for
/// broadcasters (one per channel) and listeners (the remaining clients).
fn assign_keys(
    listing: &str,
    channels: usize,
    clients: usize,
) -> Result<KeyAssignment, Report> {
    let mut pool: Vec<String> = listing
        .lines()
        .map(str::trim)
        .filter(|key| {
            !key.is_empty() && *key != SERVER0_ID && *key != SERVER1_ID
        })
        .map(str::to_string)
        .collect();
    pool.sort();
    if clients > pool.len() {
        bail!(
            "need {} client keys but only {} are installed",
            clients,
            pool.len()
        );
    }
    if channels > clients {
        bail!("more channels ({}) than clients ({})", channels, clients);
    }
    let broadcasters = pool.split_off(pool.len() - channels);
    let listeners = pool.split_off(pool.len() - (clients - channels));
    Ok(KeyAssignment {
        server0: SERVER0_ID.to_string(),
        server1: SERVER1_ID.to_string(),
        broadcasters,
        listeners,
    })
}

/// Fills `{key}` placeholders in a config template.
fn render(template: &str, vars: &[(&str, String)]) -> String {
    let mut rendered = template.to_string();
    for (key, value) in vars {
        rendered = rendered.replace(&format!("{{{}}}", key), value);
    }
    rendered
}

fn line_timestamp(line: &str) -> Result<NaiveDateTime, Report> {
    let token = line.split(' ').next().unwrap_or_default();
    NaiveDateTime::parse_from_str(token, "%Y-%m-%dT%H:%M:%S%.f")
        .wrap_err_with(|| format!("bad log timestamp [{}]", token))
}

/// Elapsed milliseconds from the start of phase 1 to the end marker. The
/// initial shuffle corresponds to setup and is excluded; without blame the
/// measurement also stops before the blame phase.
fn parse_log(log: &str, blame: bool) -> Result<u64, Report> {
    let mut lines = log.lines();
    let start = lines
        .by_ref()
        .find(|line| line.contains("Phase: 1"))
        .ok_or_else(|| eyre!("no phase 1 start in server log"))?;
    let start = line_timestamp(start)?;

    let end_marker = if blame {
        "finished bulk"
    } else {
        r#"starting: "SERVER_PUSH_CLEARTEXT""#
    };
    let end = lines
        .find(|line| line.contains(end_marker))
        .ok_or_else(|| eyre!("no [{}] marker in server log", end_marker))?;
    let end = line_timestamp(end)?;

    let elapsed = (end - start).num_milliseconds();
    if elapsed < 0 {
        bail!("server log timestamps went backwards");
    }
    Ok(elapsed as u64)
}

fn spawn_remote(
    machine: &Machine,
    command: String,
) -> Result<tokio::process::Child, Report> {
    let mut process = machine.prepare_exec(command);
    process
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .wrap_err_with(|| format!("spawn remote process on {}", machine.hostname()))
}

impl Experiment {
    async fn install_keys(&self, setting: &Setting) -> Result<(), Report> {
        let mut installs = Vec::new();
        for machine in setting.all() {
            for key in [SERVER0_ID, SERVER1_ID] {
                installs.push(machine.exec(format!(
                    "cp -f Dissent/conf/local/public/{key}.pub keys/public/ && \
                     cp -f Dissent/conf/local/private/{key} keys/private/",
                    key = key
                )));
            }
        }
        try_join_all(installs).await?;
        Ok(())
    }

    async fn public_ip(machine: &Machine) -> Result<String, Report> {
        machine.exec("ec2metadata --public-ip").await
    }

    async fn install_configs(
        &self,
        setting: &Setting,
        keys: &KeyAssignment,
    ) -> Result<(), Report> {
        let server0_addr = Self::public_ip(&setting.server0).await?;
        let server1_addr = Self::public_ip(&setting.server1).await?;

        let round_type = if self.blame {
            "neff/csdcnet"
        } else {
            "null/csdcnet"
        };
        let common: Vec<(&str, String)> = vec![
            ("server0_addr", server0_addr),
            ("server1_addr", server1_addr),
            ("dissent_port", PORT.to_string()),
            (
                "server_ids",
                format!("\"{}\",\"{}\"", keys.server0, keys.server1),
            ),
            ("round_type", round_type.to_string()),
        ];

        let config_dir = Dissent::root_dir().join("config");
        let read = |name: &str| {
            std::fs::read_to_string(config_dir.join(name))
                .wrap_err_with(|| format!("read config template [{}]", name))
        };
        let server_template = read("server.conf")?;
        let broadcaster_template = read("broadcaster.conf")?;
        let client_template = read("client.conf")?;

        for (machine, local_id) in
            [(&setting.server0, &keys.server0), (&setting.server1, &keys.server1)]
        {
            let mut vars = common.clone();
            vars.push(("local_id", local_id.clone()));
            push_file(machine, &render(&server_template, &vars), "server.conf")
                .await?;
        }

        let mut broadcaster_keys = keys.broadcasters.clone();
        for client in &setting.clients {
            let broadcaster_key = broadcaster_keys
                .pop()
                .ok_or_else(|| eyre!("ran out of broadcaster keys"))?;
            let mut vars = common.clone();
            vars.push(("local_id", broadcaster_key));
            vars.push(("web_port", "8080".to_string()));
            push_file(
                client,
                &render(&broadcaster_template, &vars),
                "broadcaster.conf",
            )
            .await?;

            let listener_ids = keys
                .listeners
                .iter()
                .map(|key| format!("\"{}\"", key))
                .collect::<Vec<_>>()
                .join(",");
            let mut vars = common.clone();
            vars.push(("local_ids", listener_ids));
            vars.push(("nodes_per_process", keys.listeners.len().to_string()));
            push_file(client, &render(&client_template, &vars), "client.conf")
                .await?;

            client
                .exec(format!(
                    "head -c {} /dev/zero | tr '\\0' 'a' > message",
                    self.message_size
                ))
                .await?;
        }
        Ok(())
    }
}

impl system::Experiment for Experiment {
    type Environment = Environment;
    type Setting = Setting;

    fn to_environment(&self) -> Environment {
        Environment {
            instance_type: self.instance_type.clone(),
            client_machine_count: 1,
        }
    }

    async fn run(
        &self,
        setting: &mut Setting,
        status: &Status,
    ) -> Result<ExperimentResult<Self>, Report> {
        if setting.clients.len() != 1 {
            bail!("dissent runs with exactly one client machine");
        }

        status.set("[experiment] distributing keys");
        try_join_all(
            setting
                .all()
                .map(|machine| machine.exec_unchecked("pkill dissent || rm -f *.log")),
        )
        .await?;
        self.install_keys(setting).await?;
        let listing = setting.server0.exec("ls keys/private").await?;
        let keys = assign_keys(&listing, self.channels, self.clients)?;
        if keys.broadcasters.len() != setting.clients.len() {
            bail!("one broadcaster per client machine for now");
        }

        status.set("[experiment] installing configs");
        self.install_configs(setting, &keys).await?;

        status.set("[experiment] starting processes");
        let mut processes = vec![
            spawn_remote(&setting.server0, "./Dissent/dissent server.conf".to_string())?,
            spawn_remote(&setting.server1, "./Dissent/dissent server.conf".to_string())?,
        ];
        for client in &setting.clients {
            processes
                .push(spawn_remote(client, "./Dissent/dissent client.conf".to_string())?);
            processes.push(spawn_remote(
                client,
                "./Dissent/dissent broadcaster.conf".to_string(),
            )?);
        }

        // give everything a moment to register with the servers
        tokio::time::sleep(Duration::from_secs(5)).await;
        try_join_all(setting.clients.iter().map(|client| {
            client.exec(
                "curl -X POST --data-binary @message localhost:8080/session/send",
            )
        }))
        .await?;

        status.set(format!(
            "[experiment] waiting for the broadcast (up to {}s)",
            WAIT_TIME.as_secs()
        ));
        setting
            .server0
            .exec_with_timeout(
                "tail -f -n +0 server.log | grep -m1 'finished bulk'",
                WAIT_TIME,
            )
            .await?;

        // killing the ssh sessions tears the processes down; teardown does
        // the remote pkill
        drop(processes);

        let log = setting.server0.exec("cat server.log").await?;
        let time = parse_log(&log, self.blame)?;
        let mut result =
            ExperimentResult::new(self.clone(), time, self.clients as u64);
        result.mean_latency = Some(time as f64 / self.clients as f64);
        Ok(result)
    }

    async fn teardown(&self, setting: &mut Setting) {
        let _ = join_all(
            setting
                .all()
                .map(|machine| machine.exec_unchecked("pkill dissent")),
        )
        .await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Environment {
    pub instance_type: InstanceType,
    pub client_machine_count: usize,
}

impl system::Environment for Environment {
    fn instance_type(&self) -> InstanceType {
        self.instance_type.clone()
    }

    fn machine_count(&self) -> usize {
        // the two servers plus the clients
        2 + self.client_machine_count
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
                self.client_machine_count.to_string(),
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
    server0: Machine,
    server1: Machine,
}

impl Setting {
    fn all(&self) -> impl Iterator<Item = &Machine> {
        [&self.server0, &self.server1]
            .into_iter()
            .chain(self.clients.iter())
    }
}

impl system::Setting for Setting {
    fn machine_spec(
        output: &TfOutput,
    ) -> Result<Vec<(Role, Hostname)>, Report> {
        let mut spec = vec![
            (Role::Named("server0"), output.string("server0")?.into()),
            (Role::Named("server1"), output.string("server1")?.into()),
        ];
        for (index, client) in output.string_list("clients")?.into_iter().enumerate()
        {
            spec.push((Role::Indexed("client", index), client.into()));
        }
        Ok(spec)
    }

    fn from_machines(machines: HashMap<Role, Machine>) -> Result<Self, Report> {
        let mut server0 = None;
        let mut server1 = None;
        let mut clients = Vec::new();
        for (role, machine) in machines {
            match role {
                Role::Named("server0") => server0 = Some(machine),
                Role::Named("server1") => server1 = Some(machine),
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
            server0: server0.ok_or_else(|| eyre!("missing server0"))?,
            server1: server1.ok_or_else(|| eyre!("missing server1"))?,
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

pub struct Dissent;

impl system::System for Dissent {
    const NAME: &'static str = "dissent";

    type Experiment = Experiment;
    type PackerConfig = PackerConfig;

    fn root_dir() -> &'static Path {
        Path::new("infra/dissent")
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::Experiment as _;

    #[test]
    fn render_fills_placeholders() {
        let template = "addr = {server0_addr}:{dissent_port}\nid = {local_id}\n";
        let rendered = render(
            template,
            &[
                ("server0_addr", "1.2.3.4".to_string()),
                ("dissent_port", "6000".to_string()),
                ("local_id", "abc".to_string()),
            ],
        );
        assert_eq!(rendered, "addr = 1.2.3.4:6000\nid = abc\n");
    }

    #[test]
    fn keys_are_assigned_from_the_top_of_the_pool() {
        let listing = format!(
            "key-a\nkey-b\nkey-c\nkey-d\n{}\n{}\n",
            SERVER0_ID, SERVER1_ID
        );
        let keys = assign_keys(&listing, 1, 3).unwrap();
        assert_eq!(keys.server0, SERVER0_ID);
        assert_eq!(keys.server1, SERVER1_ID);
        assert_eq!(keys.broadcasters, vec!["key-d"]);
        assert_eq!(keys.listeners, vec!["key-b", "key-c"]);
    }

    #[test]
    fn too_few_keys_is_an_error() {
        assert!(assign_keys("key-a\n", 1, 3).is_err());
        assert!(assign_keys("key-a\nkey-b\n", 2, 1).is_err());
    }

    const LOG: &str = "\
2020-05-01T12:00:00.000 starting up
2020-05-01T12:00:01.000 Phase: 0
2020-05-01T12:00:02.500 Phase: 1
2020-05-01T12:00:04.000 starting: \"SERVER_PUSH_CLEARTEXT\"
2020-05-01T12:00:06.250 finished bulk
";

    #[test]
    fn parse_log_measures_to_the_cleartext_push() {
        assert_eq!(parse_log(LOG, false).unwrap(), 1500);
    }

    #[test]
    fn parse_log_with_blame_measures_to_bulk_finish() {
        assert_eq!(parse_log(LOG, true).unwrap(), 3750);
    }

    #[test]
    fn parse_log_without_a_start_is_an_error() {
        assert!(parse_log("2020-05-01T12:00:00.0 nothing\n", false).is_err());
    }

    #[test]
    fn defaults_fill_in() {
        let exp: Experiment =
            serde_json::from_str(r#"{"clients": 8}"#).unwrap();
        assert_eq!(exp.channels, 1);
        assert_eq!(exp.message_size, Bytes(160));
        assert!(!exp.blame);
        use crate::system::Environment as _;
        assert_eq!(exp.to_environment().machine_count(), 3);
    }
}
