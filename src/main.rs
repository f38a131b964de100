use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info};

use ranci::config::cli_args::{CliArgs, CliCommand};
use ranci::config::harness_config::HarnessConfig;
use ranci::connection::{ConnectionFactory, RunOptions};
use ranci::core_network::CoreNetwork;

/// 命令或部署失败
const EXIT_FAILURE: u8 = 1;
/// 配置或连接错误
const EXIT_ERROR: u8 = 2;

fn main() -> ExitCode {
    let args = CliArgs::parse_args();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(args.get_log_level()),
    )
    .init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {e:#}");
            return ExitCode::from(EXIT_ERROR);
        }
    };

    match execute(&args.command, &config) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_FAILURE),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

/// 读取配置文件并应用命令行覆盖
fn load_config(args: &CliArgs) -> Result<HarnessConfig> {
    let mut config = match &args.config {
        Some(path) => HarnessConfig::from_file(path)?,
        None => HarnessConfig::default(),
    };
    if let Some(registry) = &args.registry {
        config.registry = registry.clone();
    }
    if let Some(scripts_dir) = &args.scripts_dir {
        config.scripts_dir = scripts_dir.clone();
    }
    Ok(config)
}

/// 执行子命令，返回是否成功
fn execute(command: &CliCommand, config: &HarnessConfig) -> Result<bool> {
    let factory = ConnectionFactory::from_config(config);

    match command {
        CliCommand::Run {
            host,
            timeout,
            cwd,
            command,
        } => {
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or(config.command_timeout);
            let mut connection = factory.get_connection(host.as_deref())?;
            if let Some(dir) = cwd {
                connection.cd(dir);
            }
            let result =
                connection.run_with(&command.join(" "), &RunOptions::default().with_timeout(timeout));
            connection.close()?;
            println!("{}", result.standard_output);
            Ok(result.success())
        }
        CliCommand::Script {
            host,
            timeout,
            name,
            parameters,
        } => {
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or(config.script_timeout);
            let result =
                factory.run_script(host.as_deref(), name, timeout, &parameters.join(" "), false)?;
            println!("{}", result.standard_output);
            Ok(result.success())
        }
        CliCommand::Copyin { host, src, tgt } => {
            let mut connection = factory.get_connection(host.as_deref())?;
            connection
                .copyin(src, tgt)
                .with_context(|| format!("copyin {src} -> {} failed", tgt.display()))?;
            connection.close()?;
            Ok(true)
        }
        CliCommand::Copyout { host, src, tgt } => {
            let mut connection = factory.get_connection(host.as_deref())?;
            connection
                .copyout(src, tgt)
                .with_context(|| format!("copyout {} -> {tgt} failed", src.display()))?;
            connection.close()?;
            Ok(true)
        }
        CliCommand::Deploy { name, node } => {
            let mut core = CoreNetwork::from_config(name, node.as_deref(), None, config)?;
            let (success, output) = core.deploy()?;
            println!("{output}");
            Ok(success)
        }
        CliCommand::Undeploy {
            name,
            node,
            log_dir,
            collect_logs,
        } => {
            let mut core = CoreNetwork::from_config(name, node.as_deref(), None, config)?;
            let log_dir = match (log_dir, collect_logs) {
                (Some(dir), _) => Some(dir.clone()),
                (None, true) => Some(default_log_dir()),
                (None, false) => None,
            };
            let (log_files, output) = core.undeploy(log_dir.as_deref())?;
            println!("{output}");
            for file in &log_files {
                info!("collected {}", file.display());
            }
            Ok(true)
        }
        CliCommand::Ip { name, node } => {
            let core = CoreNetwork::from_config(name, node.as_deref(), None, config)?;
            match core.get_ip()? {
                Some(ip) => {
                    println!("{ip}");
                    Ok(true)
                }
                None => {
                    error!("could not retrieve IP address of core network {core}");
                    Ok(false)
                }
            }
        }
    }
}

/// `logs/<时间戳>`
fn default_log_dir() -> PathBuf {
    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    PathBuf::from("logs").join(timestamp.to_string())
}
