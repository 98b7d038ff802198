//! Driver for the external `terraform` binary.
//!
//! Provisioning is idempotent: we always plan first and skip the apply when
//! the plan reports no changes, so re-provisioning an identical environment
//! is a cheap no-op.

use crate::progress::Status;
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Report;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

pub type TfVars = BTreeMap<String, String>;

const TERRAFORM_LOG: &str = "terraform.log";

#[derive(thiserror::Error, Debug)]
pub enum InfraError {
    #[error("missing AWS credentials (AWS_ACCESS_KEY_ID is not set)")]
    MissingCredentials,
    #[error("no machine image matched the given variables; build one first")]
    NoImage,
}

/// Formats a variable map as `-var key=value` arguments.
pub fn var_args(vars: &TfVars) -> Vec<String> {
    vars.iter()
        .flat_map(|(key, value)| {
            ["-var".to_string(), format!("{}={}", key, value)]
        })
        .collect()
}

/// The parsed `terraform output -json` map, with the `{"value": ...}`
/// envelopes stripped.
pub struct TfOutput {
    values: serde_json::Map<String, serde_json::Value>,
}

impl TfOutput {
    pub fn from_json(data: &[u8]) -> Result<Self, Report> {
        let raw: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(data).wrap_err("parse terraform output")?;
        let values = raw
            .into_iter()
            .map(|(key, envelope)| {
                let value = envelope
                    .get("value")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                (key, value)
            })
            .collect();
        Ok(Self { values })
    }

    pub fn string(&self, key: &str) -> Result<String, Report> {
        match self.values.get(key).and_then(|value| value.as_str()) {
            Some(value) => Ok(value.to_string()),
            None => bail!("terraform output missing string [{}]", key),
        }
    }

    pub fn string_list(&self, key: &str) -> Result<Vec<String>, Report> {
        let list = match self.values.get(key).and_then(|value| value.as_array())
        {
            Some(list) => list,
            None => bail!("terraform output missing list [{}]", key),
        };
        list.iter()
            .map(|entry| match entry.as_str() {
                Some(value) => Ok(value.to_string()),
                None => bail!("terraform output [{}] has a non-string entry", key),
            })
            .collect()
    }
}

/// Brings infrastructure in line with `vars` and returns the tool's outputs
/// (hostnames, generated private key). Applies only when the plan reports
/// changes; runs `terraform init` (once) if the plan says it's needed.
pub async fn provision(vars: &TfVars, dir: &Path) -> Result<TfOutput, Report> {
    if std::env::var_os("AWS_ACCESS_KEY_ID").is_none() {
        return Err(InfraError::MissingCredentials.into());
    }

    let tmp = tempfile::tempdir().wrap_err("plan tempdir")?;
    let plan_path = tmp.path().join("tfplan");

    let status = Status::spinner("[infrastructure] checking current state");
    let plan_output = match plan(vars, &plan_path, dir).await? {
        PlanResult::Output(output) => output,
        PlanResult::NeedsInit => {
            status.set("[infrastructure] initializing plugins");
            init(dir).await?;
            status.set("[infrastructure] checking current state");
            match plan(vars, &plan_path, dir).await? {
                PlanResult::Output(output) => output,
                PlanResult::NeedsInit => {
                    bail!("terraform still uninitialized after `terraform init`")
                }
            }
        }
    };

    let changes = planned_changes(&plan_output);
    if changes.is_empty() {
        status.info("[infrastructure] no changes to apply");
    } else {
        status.succeed("[infrastructure] found changes to apply:");
        for change in &changes {
            println!("  • {}", change);
        }
        let status = Status::spinner(format!(
            "[infrastructure] applying changes (output in [{}])",
            TERRAFORM_LOG
        ));
        apply(&plan_path, dir).await?;
        status.succeed("[infrastructure] created");
    }

    output(dir).await
}

/// Destroys the fleet. Callers pass the fixed zero-count cleanup variables,
/// never the last-used ones, so teardown is complete even when the caller's
/// record of the live environment is stale.
pub async fn destroy(cleanup_vars: &TfVars, dir: &Path) -> Result<(), Report> {
    let status = Status::spinner("[infrastructure] tearing down all resources");
    let exit = tokio::process::Command::new("terraform")
        .arg("destroy")
        .arg("-auto-approve")
        .args(var_args(cleanup_vars))
        .current_dir(dir)
        .stdout(Stdio::null())
        .status()
        .await
        .wrap_err("terraform destroy")?;
    if !exit.success() {
        bail!("terraform destroy failed ({})", exit);
    }
    status.succeed("[infrastructure] torn down");
    Ok(())
}

enum PlanResult {
    Output(String),
    NeedsInit,
}

async fn plan(
    vars: &TfVars,
    plan_path: &Path,
    dir: &Path,
) -> Result<PlanResult, Report> {
    let output = tokio::process::Command::new("terraform")
        .arg("plan")
        .arg(format!("-out={}", plan_path.display()))
        .arg("-no-color")
        .args(var_args(vars))
        .current_dir(dir)
        .output()
        .await
        .wrap_err("terraform plan")?;
    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    if output.status.success() {
        return Ok(PlanResult::Output(combined));
    }
    if combined.contains("terraform init") {
        return Ok(PlanResult::NeedsInit);
    }
    if combined.contains("Your query returned no results") {
        return Err(InfraError::NoImage.into());
    }
    std::fs::write(TERRAFORM_LOG, &combined).wrap_err("write terraform log")?;
    bail!("terraform plan failed (output in [{}])", TERRAFORM_LOG);
}

async fn init(dir: &Path) -> Result<(), Report> {
    let exit = tokio::process::Command::new("terraform")
        .arg("init")
        .current_dir(dir)
        .stdout(Stdio::null())
        .status()
        .await
        .wrap_err("terraform init")?;
    if !exit.success() {
        bail!("terraform init failed ({})", exit);
    }
    Ok(())
}

async fn apply(plan_path: &Path, dir: &Path) -> Result<(), Report> {
    let log = std::fs::File::create(TERRAFORM_LOG).wrap_err("terraform log")?;
    let exit = tokio::process::Command::new("terraform")
        .arg("apply")
        .arg("-refresh=false")
        .arg("-auto-approve")
        .arg(plan_path)
        .current_dir(dir)
        .stdout(Stdio::from(log))
        .status()
        .await
        .wrap_err("terraform apply")?;
    if !exit.success() {
        bail!("terraform apply failed (output in [{}])", TERRAFORM_LOG);
    }
    Ok(())
}

async fn output(dir: &Path) -> Result<TfOutput, Report> {
    let output = tokio::process::Command::new("terraform")
        .arg("output")
        .arg("-json")
        .current_dir(dir)
        .output()
        .await
        .wrap_err("terraform output")?;
    if !output.status.success() {
        bail!("terraform output failed ({})", output.status);
    }
    TfOutput::from_json(&output.stdout)
}

/// Extracts the resource-change summary lines from a plan's output: the
/// lines terraform prefixes with `#`, minus the "unchanged ... hidden"
/// noise.
fn planned_changes(plan_output: &str) -> Vec<String> {
    plan_output
        .lines()
        .filter(|line| line.trim_start().starts_with('#'))
        .filter(|line| {
            !line.contains("unchanged attributes hidden")
                && !line.contains("unchanged element hidden")
        })
        .map(|line| line.trim_start_matches([' ', '#']).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_args_formats_pairs_in_order() {
        let mut vars = TfVars::new();
        vars.insert("region".to_string(), "us-east-2".to_string());
        vars.insert("client_machine_count".to_string(), "0".to_string());
        assert_eq!(
            var_args(&vars),
            vec![
                "-var",
                "client_machine_count=0",
                "-var",
                "region=us-east-2"
            ]
        );
    }

    #[test]
    fn planned_changes_finds_resource_lines() {
        let plan = "\
Terraform will perform the following actions:

  # aws_instance.worker[0] will be created
  + resource \"aws_instance\" \"worker\" {
  # aws_instance.publisher will be updated in-place
      # (3 unchanged attributes hidden)

Plan: 1 to add, 1 to change, 0 to destroy.
";
        let changes = planned_changes(plan);
        assert_eq!(
            changes,
            vec![
                "aws_instance.worker[0] will be created",
                "aws_instance.publisher will be updated in-place",
            ]
        );
    }

    #[test]
    fn planned_changes_empty_for_no_op_plan() {
        let plan = "No changes. Your infrastructure matches the configuration.";
        assert!(planned_changes(plan).is_empty());
    }

    #[test]
    fn tf_output_unwraps_value_envelopes() {
        let data = br#"{
            "publisher": {"sensitive": false, "value": "ec2-1.example.com"},
            "workers": {"value": ["ec2-2.example.com", "ec2-3.example.com"]},
            "private_key": {"sensitive": true, "value": "PEM"}
        }"#;
        let output = TfOutput::from_json(data).unwrap();
        assert_eq!(output.string("publisher").unwrap(), "ec2-1.example.com");
        assert_eq!(
            output.string_list("workers").unwrap(),
            vec!["ec2-2.example.com", "ec2-3.example.com"]
        );
        assert!(output.string("missing").is_err());
        assert!(output.string_list("publisher").is_err());
    }
}
