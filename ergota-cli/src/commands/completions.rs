//! Shell completion generation.

use clap::CommandFactory;
use clap_complete::{Shell, generate};
use std::io;

use crate::Cli;

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(shell: Shell) -> String {
        let mut cmd = Cli::command();
        let mut out = Vec::new();
        generate(shell, &mut cmd, "ergota", &mut out);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_bash_completions_cover_subcommands() {
        let script = render(Shell::Bash);
        assert!(script.contains("_ergota()"));
        assert!(script.contains("simulate"));
        assert!(script.contains("--cancel-after-windows"));
    }

    #[test]
    fn test_fish_completions() {
        let script = render(Shell::Fish);
        assert!(script.contains("complete -c ergota"));
    }
}
