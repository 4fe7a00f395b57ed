use clap::Parser;

/// devsandbox - run a command inside an isolated development sandbox
#[derive(Parser, Debug)]
#[command(name = "devsandbox")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable the HTTPS intercepting proxy (network isolation)
    #[arg(long)]
    pub proxy: bool,

    /// Port the HTTPS proxy listens on (default: 17080)
    #[arg(long, value_name = "PORT")]
    pub proxy_port: Option<u16>,

    /// Print the compiled sandbox policy and exit without running anything
    #[arg(long)]
    pub info: bool,

    /// Project directory (default: the current directory)
    #[arg(long, value_name = "DIR")]
    pub project: Option<std::path::PathBuf>,

    /// Command to run inside the sandbox; an interactive shell when empty
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "CMD")]
    pub command: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_command_is_captured() {
        let cli = Cli::parse_from(["devsandbox", "echo", "hello"]);
        assert!(!cli.proxy);
        assert_eq!(cli.command, vec!["echo", "hello"]);
    }

    #[test]
    fn proxy_flags_parse() {
        let cli = Cli::parse_from(["devsandbox", "--proxy", "--proxy-port", "18889", "npm", "ci"]);
        assert!(cli.proxy);
        assert_eq!(cli.proxy_port, Some(18889));
        assert_eq!(cli.command, vec!["npm", "ci"]);
    }

    #[test]
    fn target_flags_stay_with_the_command() {
        let cli = Cli::parse_from(["devsandbox", "cargo", "build", "--release"]);
        assert_eq!(cli.command, vec!["cargo", "build", "--release"]);
    }

    #[test]
    fn empty_command_means_shell() {
        let cli = Cli::parse_from(["devsandbox", "--info"]);
        assert!(cli.info);
        assert!(cli.command.is_empty());
    }
}
