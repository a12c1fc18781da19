//! Shell completion generation.

use {
    anyhow::{Result, bail},
    clap::CommandFactory,
    clap_complete::{Shell, generate},
    std::io::{self, Write},
};

use crate::Cli;

/// Generate shell completions to stdout.
///
/// Without an explicit shell the current one is taken from `$SHELL`
/// (PowerShell on Windows when unset).
pub(crate) fn cmd_completions(shell: Option<Shell>) -> Result<()> {
    let Some(shell) = shell.or_else(Shell::from_env) else {
        bail!("Could not detect shell, specify one, e.g.: bleota completions bash");
    };
    write_completions(shell, &mut io::stdout());
    Ok(())
}

fn write_completions(shell: Shell, out: &mut dyn Write) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, out);
}
