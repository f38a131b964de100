use clap::{Parser, Subcommand};
use std::path::PathBuf;

// ranci - RAN CI 命令执行与核心网管理
#[derive(Parser, Debug)]
#[clap(
    name = "ranci",
    version,
    about = "Run commands on CI hosts and manage core network deployments",
    after_help = "HOSTS:\n  An empty host, \"none\" or \"localhost\" runs on this machine; anything else\n  ([user@]host[:port] or an ~/.ssh/config alias) is reached over SSH.\n\nEXAMPLES:\n  ranci run --host ofqot -- docker ps -a\n  ranci script --host ofqot deploy-physim.sh oaicicd-ran 2222\n  ranci deploy oai-cn5g --node cacofonix\n  ranci undeploy oai-cn5g --node cacofonix --log-dir logs/\n  ranci ip oai-cn5g --node cacofonix"
)]
pub struct CliArgs {
    // Settings file (TOML)
    // 配置文件（TOML）
    #[clap(short = 'c', long = "config", global = true, help = "Harness settings file (TOML)")]
    pub config: Option<PathBuf>,

    // Core network registry, overrides the settings file
    // 核心网注册表，覆盖配置文件中的设置
    #[clap(short = 'r', long = "registry", global = true, help = "Core network registry (YAML)")]
    pub registry: Option<PathBuf>,

    // Scripts directory, overrides the settings file
    // 脚本目录，覆盖配置文件中的设置
    #[clap(long = "scripts-dir", global = true, help = "Directory `!script` commands are resolved in")]
    pub scripts_dir: Option<PathBuf>,

    // Verbose mode - Show more log information
    // 详细模式 - 显示更多日志信息
    #[clap(short = 'v', long = "verbose", global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    // Quiet mode - Only show errors
    // 安静模式 - 只显示错误
    #[clap(short = 'q', long = "quiet", global = true, help = "Suppress non-essential output")]
    pub quiet: bool,

    #[clap(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Run a shell command on a host
    Run {
        #[clap(long = "host", help = "Target host (empty, none or localhost for this machine)")]
        host: Option<String>,
        #[clap(long = "timeout", help = "Command timeout in seconds")]
        timeout: Option<u64>,
        #[clap(long = "cwd", help = "Working directory on the target host")]
        cwd: Option<String>,
        #[clap(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Run a script from the scripts directory on a host
    Script {
        #[clap(long = "host", help = "Target host")]
        host: Option<String>,
        #[clap(long = "timeout", help = "Script timeout in seconds")]
        timeout: Option<u64>,
        name: String,
        #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
        parameters: Vec<String>,
    },
    /// Copy a file from a host to this machine
    Copyin {
        #[clap(long = "host", help = "Source host")]
        host: Option<String>,
        src: String,
        tgt: PathBuf,
    },
    /// Copy a file from this machine to a host
    Copyout {
        #[clap(long = "host", help = "Target host")]
        host: Option<String>,
        src: PathBuf,
        tgt: String,
    },
    /// Deploy a core network (undeploys it first)
    Deploy {
        name: String,
        #[clap(long = "node", help = "Host replacing %%current_host%%")]
        node: Option<String>,
    },
    /// Collect logs of a core network and undeploy it
    Undeploy {
        name: String,
        #[clap(long = "node", help = "Host replacing %%current_host%%")]
        node: Option<String>,
        #[clap(long = "log-dir", help = "Local directory collected logs are copied to")]
        log_dir: Option<PathBuf>,
        #[clap(long = "collect-logs", help = "Collect logs into logs/<timestamp> when --log-dir is not given")]
        collect_logs: bool,
    },
    /// Print the IP address of a deployed core network
    Ip {
        name: String,
        #[clap(long = "node", help = "Host replacing %%current_host%%")]
        node: Option<String>,
    },
}

impl CliArgs {
    /// Parse command line arguments
    /// 解析命令行参数
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get log level
    /// 获取日志级别
    pub fn get_log_level(&self) -> &str {
        if self.quiet {
            "error"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_collects_trailing_words() {
        let args = CliArgs::parse_from(["ranci", "run", "--host", "ofqot", "--", "ls", "-la", "/tmp"]);
        match &args.command {
            CliCommand::Run { host, command, .. } => {
                let command = command.clone();
                assert_eq!(host.as_deref(), Some("ofqot"));
                assert_eq!(command, vec!["ls", "-la", "/tmp"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(args.get_log_level(), "info");
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = CliArgs::parse_from([
            "ranci", "undeploy", "oai-cn5g", "--node", "cacofonix", "-v", "--registry", "infra.yaml",
        ]);
        assert!(args.verbose);
        assert_eq!(args.get_log_level(), "debug");
        assert_eq!(args.registry, Some(PathBuf::from("infra.yaml")));
        match args.command {
            CliCommand::Undeploy { name, node, log_dir, collect_logs } => {
                assert_eq!(name, "oai-cn5g");
                assert_eq!(node.as_deref(), Some("cacofonix"));
                assert!(log_dir.is_none());
                assert!(!collect_logs);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_run_requires_command() {
        assert!(CliArgs::try_parse_from(["ranci", "run"]).is_err());
    }
}
