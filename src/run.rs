//! The experiment executor: groups experiments by environment, provisions a
//! fleet per group, runs trials with bounded retries, and streams results.
//!
//! Interruption is two-tier. The first interrupt during a trial cancels that
//! attempt and retries it; a second interrupt during the same trial aborts
//! the whole run. Teardown and any results already streamed survive either
//! way.

use crate::cloud;
use crate::machine::{KeyFile, Machine};
use crate::packer::{self, BuildArgs};
use crate::progress::Status;
use crate::system::{
    group_by_environment, Environment, EnvironmentOf, Experiment,
    ExperimentResult, Setting, SettingOf, System,
};
use crate::util::ResultWriter;
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Report;
use futures::future::try_join_all;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

pub const MAX_ATTEMPTS: usize = 5;

/// A resettable interruption flag, set from a signal handler and observed by
/// the trial executor. Cleared at the start of every attempt so each attempt
/// gets a fresh "interrupt once to retry, twice to abort" budget.
pub struct Interrupt {
    flag: watch::Sender<bool>,
}

impl Interrupt {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self { flag }
    }

    pub fn set(&self) {
        self.flag.send_replace(true);
    }

    pub fn clear(&self) {
        self.flag.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolves once the flag is set; never resolves otherwise.
    pub async fn wait(&self) {
        let mut flag = self.flag.subscribe();
        loop {
            if *flag.borrow_and_update() {
                return;
            }
            if flag.changed().await.is_err() {
                // sender half gone; nothing can fire anymore
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupt").field("set", &self.is_set()).finish()
    }
}

/// The outcome of one trial after retries are exhausted.
#[derive(Debug)]
pub enum Trial<R> {
    /// A result was produced.
    Done(R),
    /// Every attempt failed; the run continues with the next experiment.
    Failed,
    /// The user interrupted twice; the run stops.
    Aborted,
}

/// Options shared by every run.
#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    /// Build images even when the manifest has a matching one.
    pub force_rebuild: bool,
    /// Destroy all infrastructure after the run.
    pub cleanup: bool,
    pub build: BuildArgs,
}

/// Runs one experiment with up to [`MAX_ATTEMPTS`] attempts. An interrupted
/// attempt consumes a slot like a failed one; errors are appended to
/// `error_log` so the console stays readable.
pub async fn retry_experiment<E: Experiment>(
    experiment: &E,
    setting: &mut E::Setting,
    interrupt: &Interrupt,
    error_log: &Path,
) -> Result<Trial<ExperimentResult<E>>, Report> {
    let mut interrupted = false;
    for attempt in 1..=MAX_ATTEMPTS {
        interrupt.clear();
        let status = Status::spinner(format!(
            "running (attempt {} of {})",
            attempt, MAX_ATTEMPTS
        ));
        let outcome = tokio::select! {
            result = experiment.run(setting, &status) => Some(result),
            _ = interrupt.wait() => None,
        };
        // teardown runs after *every* attempt so a cancelled or failed trial
        // leaves no remote processes behind for the next one
        experiment.teardown(setting).await;
        match outcome {
            Some(Ok(result)) => {
                status.succeed(format!(
                    "time: {}ms ({} qps)",
                    result.time,
                    result.qps()
                ));
                return Ok(Trial::Done(result));
            }
            Some(Err(err)) => {
                append_error(error_log, experiment, &err)?;
                if attempt == MAX_ATTEMPTS {
                    status.fail(format!(
                        "error (attempt {} of {}); giving up (details in [{}])",
                        attempt,
                        MAX_ATTEMPTS,
                        error_log.display()
                    ));
                } else {
                    status.warn(format!(
                        "error (attempt {} of {}); retrying (details in [{}])",
                        attempt,
                        MAX_ATTEMPTS,
                        error_log.display()
                    ));
                }
            }
            None => {
                if interrupted {
                    status.fail("interrupted again; aborting the run");
                    return Ok(Trial::Aborted);
                }
                interrupted = true;
                status.info("interrupted; retrying (interrupt again to abort)");
            }
        }
    }
    Ok(Trial::Failed)
}

fn append_error<E: Experiment>(
    path: &Path,
    experiment: &E,
    err: &Report,
) -> Result<(), Report> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .wrap_err("open error log")?;
    let experiment =
        serde_json::to_string(experiment).wrap_err("serialize experiment")?;
    writeln!(file, "{}\n{:?}\n", experiment, err).wrap_err("write error log")?;
    Ok(())
}

/// Builds the image, provisions the fleet, connects to every machine, and
/// runs the system's one-time setup.
async fn acquire<S: System>(
    environment: &EnvironmentOf<S>,
    args: &RunArgs,
    force_rebuilt: Option<&mut HashSet<S::PackerConfig>>,
) -> Result<SettingOf<S>, Report> {
    Status::header(format!("environment: {:?}", environment));

    let config = S::packer_config(&args.build, environment)?;
    let build = packer::ensure_build(&config, force_rebuilt, S::root_dir())
        .await
        .wrap_err("image build")?;

    let output = cloud::provision(&environment.tf_vars(&build), S::root_dir())
        .await
        .wrap_err("provisioning")?;

    let spec = <SettingOf<S> as Setting>::machine_spec(&output)?;
    if spec.len() != environment.machine_count() {
        bail!(
            "provisioner reported {} machines but the environment needs {}",
            spec.len(),
            environment.machine_count()
        );
    }

    let key = Arc::new(KeyFile::new(&output.string("private_key")?)?);
    let status =
        Status::spinner(format!("connecting to {} machines", spec.len()));
    let connections = spec.into_iter().map(|(role, hostname)| {
        let key = key.clone();
        async move {
            let machine = Machine::connect(hostname, key)
                .await
                .wrap_err_with(|| format!("connecting role {}", role))?;
            Ok::<_, Report>((role, machine))
        }
    });
    let machines: HashMap<_, _> =
        try_join_all(connections).await?.into_iter().collect();
    status.succeed("machines ready");

    let mut setting = SettingOf::<S>::from_machines(machines)?;
    let status = Status::spinner("running one-time setup");
    setting.additional_setup(&status).await?;
    Ok(setting)
}

/// Runs every experiment, sharing fleets within environment groups and
/// streaming each result as it completes. Returns `false` only when some
/// trial exhausted its retries; an aborted run is not itself a failure.
/// When `cleanup` is set, infrastructure is destroyed after the run even
/// if it failed or was aborted.
pub async fn run_experiments<S: System, W: Write>(
    experiments: Vec<S::Experiment>,
    args: &RunArgs,
    writer: &mut ResultWriter<W>,
    interrupt: &Interrupt,
    error_log: &Path,
) -> Result<bool, Report> {
    let mut force_rebuilt = args.force_rebuild.then(HashSet::new);
    let outcome = drive::<S, W>(
        experiments,
        args,
        writer,
        interrupt,
        error_log,
        &mut force_rebuilt,
    )
    .await;
    if args.cleanup {
        cloud::destroy(&EnvironmentOf::<S>::cleanup_tf_vars(), S::root_dir())
            .await
            .wrap_err("cleanup")?;
    }
    outcome
}

async fn drive<S: System, W: Write>(
    experiments: Vec<S::Experiment>,
    args: &RunArgs,
    writer: &mut ResultWriter<W>,
    interrupt: &Interrupt,
    error_log: &Path,
    force_rebuilt: &mut Option<HashSet<S::PackerConfig>>,
) -> Result<bool, Report> {
    let mut all_ok = true;
    'groups: for (environment, group) in group_by_environment(experiments) {
        let mut setting =
            acquire::<S>(&environment, args, force_rebuilt.as_mut()).await?;
        for experiment in group {
            Status::header(format!("experiment: {:?}", experiment));
            let trial =
                retry_experiment(&experiment, &mut setting, interrupt, error_log)
                    .await?;
            if record_trial(trial, writer, &mut all_ok)?.is_break() {
                break 'groups;
            }
        }
    }
    Ok(all_ok)
}

/// Folds one trial outcome into the run: results are streamed, exhausted
/// retries mark the run failed, and an abort stops the run without marking
/// it failed.
fn record_trial<E: Experiment, W: Write>(
    trial: Trial<ExperimentResult<E>>,
    writer: &mut ResultWriter<W>,
    all_ok: &mut bool,
) -> Result<ControlFlow<()>, Report> {
    match trial {
        Trial::Done(result) => writer.write(&result)?,
        Trial::Failed => *all_ok = false,
        Trial::Aborted => return Ok(ControlFlow::Break(())),
    }
    Ok(ControlFlow::Continue(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{TfOutput, TfVars};
    use crate::packer::Build;
    use crate::system::Role;
    use crate::{Hostname, InstanceType};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    struct Env;

    impl Environment for Env {
        fn instance_type(&self) -> InstanceType {
            InstanceType::default_type()
        }

        fn machine_count(&self) -> usize {
            0
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

    /// Fails the first `failures` attempts, succeeds afterwards; interrupts
    /// itself (and then hangs) on the first `interrupts` attempts.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Flaky {
        failures: usize,
        #[serde(skip, default)]
        interrupts: usize,
        #[serde(skip, default)]
        attempts: Arc<AtomicUsize>,
        #[serde(skip, default)]
        teardowns: Arc<AtomicUsize>,
        #[serde(skip, default)]
        interrupt: Arc<Interrupt>,
    }

    impl Flaky {
        fn failing(failures: usize) -> Self {
            Self {
                failures,
                interrupts: 0,
                attempts: Arc::default(),
                teardowns: Arc::default(),
                interrupt: Arc::default(),
            }
        }

        fn interrupting(interrupts: usize, interrupt: Arc<Interrupt>) -> Self {
            Self {
                failures: 0,
                interrupts,
                attempts: Arc::default(),
                teardowns: Arc::default(),
                interrupt,
            }
        }
    }

    impl Experiment for Flaky {
        type Environment = Env;
        type Setting = NoSetting;

        fn to_environment(&self) -> Env {
            Env
        }

        async fn run(
            &self,
            _setting: &mut NoSetting,
            _status: &Status,
        ) -> Result<ExperimentResult<Self>, Report> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.interrupts {
                self.interrupt.set();
                std::future::pending::<()>().await;
            }
            if attempt < self.failures {
                bail!("boom on attempt {}", attempt);
            }
            Ok(ExperimentResult::new(self.clone(), 1000, 42))
        }

        async fn teardown(&self, _setting: &mut NoSetting) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn error_log() -> tempfile::NamedTempFile {
        tempfile::NamedTempFile::new().unwrap()
    }

    fn entries(log: &tempfile::NamedTempFile) -> usize {
        std::fs::read_to_string(log.path())
            .unwrap()
            .matches("boom")
            .count()
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let experiment = Flaky::failing(100);
        let interrupt = Interrupt::new();
        let log = error_log();
        let trial = retry_experiment(
            &experiment,
            &mut NoSetting,
            &interrupt,
            log.path(),
        )
        .await
        .unwrap();
        assert!(matches!(trial, Trial::Failed));
        assert_eq!(experiment.attempts.load(Ordering::SeqCst), MAX_ATTEMPTS);
        assert_eq!(experiment.teardowns.load(Ordering::SeqCst), MAX_ATTEMPTS);
        assert_eq!(entries(&log), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn last_attempt_can_still_succeed() {
        let experiment = Flaky::failing(MAX_ATTEMPTS - 1);
        let interrupt = Interrupt::new();
        let log = error_log();
        let trial = retry_experiment(
            &experiment,
            &mut NoSetting,
            &interrupt,
            log.path(),
        )
        .await
        .unwrap();
        match trial {
            Trial::Done(result) => {
                assert_eq!(result.time, 1000);
                assert_eq!(result.queries, 42);
            }
            other => panic!("expected a result, got {:?}", other),
        }
        assert_eq!(entries(&log), MAX_ATTEMPTS - 1);
        assert_eq!(experiment.teardowns.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn one_interrupt_retries_and_consumes_an_attempt() {
        let interrupt = Arc::new(Interrupt::new());
        let experiment = Flaky::interrupting(1, interrupt.clone());
        let log = error_log();
        let trial = retry_experiment(
            &experiment,
            &mut NoSetting,
            &interrupt,
            log.path(),
        )
        .await
        .unwrap();
        assert!(matches!(trial, Trial::Done(_)));
        assert_eq!(experiment.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(experiment.teardowns.load(Ordering::SeqCst), 2);
        assert_eq!(entries(&log), 0);
    }

    #[tokio::test]
    async fn second_interrupt_aborts() {
        let interrupt = Arc::new(Interrupt::new());
        let experiment = Flaky::interrupting(100, interrupt.clone());
        let log = error_log();
        let trial = retry_experiment(
            &experiment,
            &mut NoSetting,
            &interrupt,
            log.path(),
        )
        .await
        .unwrap();
        assert!(matches!(trial, Trial::Aborted));
        assert_eq!(experiment.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(experiment.teardowns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_interrupt_is_cleared_before_each_attempt() {
        let interrupt = Interrupt::new();
        interrupt.set();
        let experiment = Flaky::failing(0);
        let log = error_log();
        let trial = retry_experiment(
            &experiment,
            &mut NoSetting,
            &interrupt,
            log.path(),
        )
        .await
        .unwrap();
        assert!(matches!(trial, Trial::Done(_)));
        assert_eq!(experiment.attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn abort_stops_the_run_without_failing_it() {
        let mut writer = ResultWriter::new(Vec::new()).unwrap();
        let mut all_ok = true;
        let flow =
            record_trial::<Flaky, _>(Trial::Aborted, &mut writer, &mut all_ok)
                .unwrap();
        assert!(flow.is_break());
        assert!(all_ok);
    }

    #[test]
    fn exhausted_retries_fail_the_run() {
        let mut writer = ResultWriter::new(Vec::new()).unwrap();
        let mut all_ok = true;
        let flow =
            record_trial::<Flaky, _>(Trial::Failed, &mut writer, &mut all_ok)
                .unwrap();
        assert!(flow.is_continue());
        assert!(!all_ok);
    }
}
