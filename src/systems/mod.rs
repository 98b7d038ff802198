//! The systems under test. Each submodule wires one implementation into the
//! executor: its experiment schema, environment shape, terraform variables,
//! image build configuration, and the remote choreography of a trial.

pub mod dissent;
pub mod express;
pub mod riposte;
pub mod spectrum;

use crate::machine::Machine;
use color_eyre::eyre::WrapErr;
use color_eyre::Report;
use std::io::Write;

/// Writes `contents` to a temporary local file and copies it to
/// `remote_path` on the machine. Used to install rendered config files.
pub(crate) async fn push_file(
    machine: &Machine,
    contents: &str,
    remote_path: &str,
) -> Result<(), Report> {
    let mut file = tempfile::NamedTempFile::new().wrap_err("staging file")?;
    file.write_all(contents.as_bytes()).wrap_err("staging file")?;
    file.flush().wrap_err("staging file")?;
    machine.copy_to(file.path(), remote_path).await
}
