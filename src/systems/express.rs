//! The express system: two servers and a client machine in throughput mode.
//!
//! The binaries run as ad-hoc remote processes (no init system); server A
//! prints a cumulative summary line every 10 seconds and we scrape the last
//! one after the measurement window.

use crate::cloud::{TfOutput, TfVars};
use crate::machine::Machine;
use crate::packer::{Build, BuildArgs};
use crate::progress::Status;
use crate::system::{self, ExperimentResult, Role};
use crate::{Bytes, Hostname, InstanceType, Region};
use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Report;
use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

// the server prints summary statistics every 10s; add a couple of seconds so
// we never race the last report
const WAIT_TIME: Duration = Duration::from_secs(32);

const EXPRESS_LOG: &str = "express.log";

const RESULT_PATTERN: &str =
    r"Time Elapsed: ([0-9.]+)s; number of writes: ([0-9]+)";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Experiment {
    #[serde(default = "InstanceType::default_type")]
    pub instance_type: InstanceType,
    // "1x or 2x the number of cores on the system"
    #[serde(default = "Experiment::default_server_threads")]
    pub server_threads: usize,
    // "larger than the actual number of cores on the machine"
    #[serde(default = "Experiment::default_client_threads")]
    pub client_threads: usize,
    #[serde(default = "Experiment::default_channels")]
    pub channels: usize,
    #[serde(default = "Experiment::default_message_size")]
    pub message_size: Bytes,
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
        Bytes(1000)
    }
}

/// The last cumulative summary from server A's stderr, as
/// `(time in ms, writes)`.
fn parse_server_output(stderr: &str, pattern: &Regex) -> Option<(u64, u64)> {
    stderr
        .lines()
        .filter_map(|line| {
            let captures = pattern.captures(line)?;
            let seconds: f64 = captures[1].parse().ok()?;
            let writes: u64 = captures[2].parse().ok()?;
            Some(((seconds * 1000.0) as u64, writes))
        })
        .last()
}

async fn kill_and_collect(
    mut process: tokio::process::Child,
) -> Result<String, Report> {
    let _ = process.start_kill();
    let output = process
        .wait_with_output()
        .await
        .wrap_err("collect remote process output")?;
    Ok(String::from_utf8_lossy(&output.stderr).to_string())
}

fn spawn_remote(
    machine: &Machine,
    command: String,
) -> Result<tokio::process::Child, Report> {
    let mut process = machine.prepare_exec(command);
    process
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .wrap_err_with(|| format!("spawn remote process on {}", machine.hostname()))
}

impl system::Experiment for Experiment {
    type Environment = Environment;
    type Setting = Setting;

    fn to_environment(&self) -> Environment {
        Environment {
            instance_type: self.instance_type.clone(),
        }
    }

    async fn run(
        &self,
        setting: &mut Setting,
        status: &Status,
    ) -> Result<ExperimentResult<Self>, Report> {
        status.set("[experiment] starting processes");
        let server_b = spawn_remote(
            &setting.server_b,
            format!(
                // "cores" must be 0
                "cd Express/serverB && ./serverB {} 0 {} {}",
                self.server_threads, self.channels, self.message_size
            ),
        )?;
        let server_a = spawn_remote(
            &setting.server_a,
            format!(
                "cd Express/serverA && ./serverA {}:4442 {} 0 {} {}",
                setting.server_b.hostname(),
                self.server_threads,
                self.channels,
                self.message_size
            ),
        )?;
        let client = spawn_remote(
            &setting.client,
            format!(
                "cd Express/client && ./client {}:4443 {}:4442 {} {} throughput",
                setting.server_a.hostname(),
                setting.server_b.hostname(),
                self.client_threads,
                self.message_size
            ),
        )?;

        status.set(format!(
            "[experiment] running processes for {}s",
            WAIT_TIME.as_secs()
        ));
        tokio::time::sleep(WAIT_TIME).await;

        status.set("[experiment] waiting for processes to exit");
        let server_a_log = kill_and_collect(server_a).await?;
        let server_b_log = kill_and_collect(server_b).await?;
        let client_log = kill_and_collect(client).await?;

        let pattern = Regex::new(RESULT_PATTERN).wrap_err("result pattern")?;
        match parse_server_output(&server_a_log, &pattern) {
            Some((time, queries)) => {
                Ok(ExperimentResult::new(self.clone(), time, queries))
            }
            None => {
                let mut log =
                    std::fs::File::create(EXPRESS_LOG).wrap_err("express log")?;
                writeln!(log, "SERVER A\n{}", server_a_log)?;
                writeln!(log, "\n\nSERVER B\n{}", server_b_log)?;
                writeln!(log, "\n\nCLIENT\n{}", client_log)?;
                bail!("no summary line from server A (output in [{}])", EXPRESS_LOG)
            }
        }
    }

    async fn teardown(&self, setting: &mut Setting) {
        // the remote binaries outlive their ssh session when we kill it
        let _ = join_all([
            setting.server_a.exec_unchecked("pkill serverA"),
            setting.server_b.exec_unchecked("pkill serverB"),
            setting.client.exec_unchecked("pkill client"),
        ])
        .await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Environment {
    pub instance_type: InstanceType,
}

impl system::Environment for Environment {
    fn instance_type(&self) -> InstanceType {
        self.instance_type.clone()
    }

    fn machine_count(&self) -> usize {
        3
    }

    fn tf_vars(&self, build: &Build) -> TfVars {
        TfVars::from([
            ("ami".to_string(), build.ami.to_string()),
            ("region".to_string(), Region::aws().to_string()),
            (
                "instance_type".to_string(),
                self.instance_type.to_string(),
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
        ])
    }
}

pub struct Setting {
    client: Machine,
    server_a: Machine,
    server_b: Machine,
}

impl system::Setting for Setting {
    fn machine_spec(
        output: &TfOutput,
    ) -> Result<Vec<(Role, Hostname)>, Report> {
        Ok(vec![
            (Role::Named("client"), output.string("client")?.into()),
            (Role::Named("serverA"), output.string("serverA")?.into()),
            (Role::Named("serverB"), output.string("serverB")?.into()),
        ])
    }

    fn from_machines(
        mut machines: HashMap<Role, Machine>,
    ) -> Result<Self, Report> {
        let mut take = |name| {
            machines
                .remove(&Role::Named(name))
                .ok_or_else(|| eyre!("missing machine [{}]", name))
        };
        Ok(Self {
            client: take("client")?,
            server_a: take("serverA")?,
            server_b: take("serverB")?,
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

pub struct Express;

impl system::System for Express {
    const NAME: &'static str = "express";

    type Experiment = Experiment;
    type PackerConfig = PackerConfig;

    fn root_dir() -> &'static Path {
        Path::new("infra/express")
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

    #[test]
    fn parse_takes_the_last_summary() {
        let pattern = Regex::new(RESULT_PATTERN).unwrap();
        let stderr = "\
serverA.go:209: Time Elapsed: 10.5s; number of writes: 1000
serverA.go:110: some unrelated log line
serverA.go:209: Time Elapsed: 20.25s; number of writes: 2100
";
        let (time, queries) = parse_server_output(stderr, &pattern).unwrap();
        assert_eq!(time, 20250);
        assert_eq!(queries, 2100);
    }

    #[test]
    fn parse_fails_without_a_summary() {
        let pattern = Regex::new(RESULT_PATTERN).unwrap();
        assert!(parse_server_output("starting up...\n", &pattern).is_none());
    }

    #[test]
    fn defaults_fill_in() {
        let exp: Experiment = serde_json::from_str("{}").unwrap();
        assert_eq!(exp.server_threads, 8);
        assert_eq!(exp.client_threads, 16);
        assert_eq!(exp.channels, 1);
        assert_eq!(exp.message_size, Bytes(1000));
        assert_eq!(exp.instance_type, InstanceType::default_type());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(
            serde_json::from_str::<Experiment>(r#"{"server_thread": 8}"#).is_err()
        );
    }
}
