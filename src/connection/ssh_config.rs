//! SSH主机解析
//!
//! 把主机标识（`host`、`user@host`、`host:port`、`user@host:port`）与
//! `~/.ssh/config` 中的 `Host` 配置块合并成最终的连接端点。
//! 只支持 `HostName`、`User`、`Port`、`IdentityFile` 四个关键字，
//! 其余关键字与 `Match` 块会被忽略。

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use log::{debug, trace};

use crate::config::connection_config::ConnectionConfig;
use crate::utils;

/// 未指定私钥时依次尝试的默认私钥
const DEFAULT_IDENTITY_FILES: &[&str] = &["~/.ssh/id_ed25519", "~/.ssh/id_ecdsa", "~/.ssh/id_rsa"];

/// 单个主机在ssh配置中的设置
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostSettings {
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_files: Vec<String>,
}

#[derive(Debug, Clone)]
struct HostBlock {
    patterns: Vec<String>,
    settings: HostSettings,
}

/// 解析后的ssh配置文件
#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    blocks: Vec<HostBlock>,
}

impl SshConfig {
    /// 读取ssh配置文件，文件不存在时返回空配置
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            trace!("ssh配置文件不存在: {}", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("无法读取ssh配置文件: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        // 第一个 Host 之前的选项对所有主机生效
        let mut blocks = vec![HostBlock {
            patterns: vec!["*".to_string()],
            settings: HostSettings::default(),
        }];
        let mut in_match = false;

        for (index, raw_line) in content.lines().enumerate() {
            let line_number = index + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (keyword, args) = split_option(line);
            let keyword = keyword.to_ascii_lowercase();

            match keyword.as_str() {
                "host" => {
                    if args.is_empty() {
                        bail!("Host requires a value at line {line_number}");
                    }
                    in_match = false;
                    blocks.push(HostBlock {
                        patterns: args,
                        settings: HostSettings::default(),
                    });
                    continue;
                }
                "match" => {
                    in_match = true;
                    continue;
                }
                _ if in_match => continue,
                _ => {}
            }

            let Some(block) = blocks.last_mut() else {
                continue;
            };
            let settings = &mut block.settings;
            match keyword.as_str() {
                "hostname" | "user" | "port" | "identityfile" if args.is_empty() => {
                    bail!("{keyword} requires a value at line {line_number}");
                }
                "hostname" => {
                    settings.hostname.get_or_insert_with(|| args[0].clone());
                }
                "user" => {
                    settings.user.get_or_insert_with(|| args[0].clone());
                }
                "port" => {
                    let port: u16 = args[0].parse().with_context(|| {
                        format!("Invalid port number '{}' at line {line_number}", args[0])
                    })?;
                    settings.port.get_or_insert(port);
                }
                "identityfile" => settings.identity_files.push(args[0].clone()),
                _ => trace!("忽略ssh配置关键字 {keyword} (line {line_number})"),
            }
        }

        Ok(Self { blocks })
    }

    /// 查找主机别名的设置，每个关键字取第一个匹配块中的值
    pub fn lookup(&self, alias: &str) -> HostSettings {
        let mut merged = HostSettings::default();
        for block in &self.blocks {
            if !host_matches(&block.patterns, alias) {
                continue;
            }
            let settings = &block.settings;
            if merged.hostname.is_none() {
                merged.hostname = settings.hostname.clone();
            }
            if merged.user.is_none() {
                merged.user = settings.user.clone();
            }
            if merged.port.is_none() {
                merged.port = settings.port;
            }
            merged
                .identity_files
                .extend(settings.identity_files.iter().cloned());
        }
        merged
    }
}

/// 拆分 `Keyword value` 或 `Keyword=value`
fn split_option(line: &str) -> (String, Vec<String>) {
    let (keyword, rest) = match line.find(|c: char| c.is_whitespace() || c == '=') {
        Some(pos) => (&line[..pos], &line[pos..]),
        None => (line, ""),
    };
    let rest = rest.trim_start().trim_start_matches('=').trim();
    let args = rest
        .split_whitespace()
        .map(|arg| arg.trim_matches('"').to_string())
        .collect();
    (keyword.to_string(), args)
}

/// 主机是否匹配一组模式；任何否定模式（`!pattern`）匹配时整组不匹配
fn host_matches(patterns: &[String], host: &str) -> bool {
    let mut matched = false;
    for pattern in patterns {
        if let Some(negated) = pattern.strip_prefix('!') {
            if wildcard_match(negated, host) {
                return false;
            }
        } else if wildcard_match(pattern, host) {
            matched = true;
        }
    }
    matched
}

/// 支持 `*` 与 `?` 的通配符匹配
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

/// 主机标识中显式给出的部分
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl HostSpec {
    /// 解析 `[user@]host[:port]`；含多个冒号时视为IPv6地址，不拆分端口
    pub fn parse(identifier: &str) -> Result<Self> {
        let identifier = identifier.trim();
        let (user, rest) = match identifier.rsplit_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            _ => (None, identifier),
        };
        let (host, port) = match rest.split_once(':') {
            Some((host, port)) if !port.contains(':') => {
                let port: u16 = port
                    .parse()
                    .with_context(|| format!("主机标识 {identifier} 中的端口无效"))?;
                (host.to_string(), Some(port))
            }
            _ => (rest.trim_matches(|c| c == '[' || c == ']').to_string(), None),
        };
        if host.is_empty() {
            bail!("主机标识 {identifier} 中缺少主机名");
        }
        Ok(Self { user, host, port })
    }
}

/// 最终的SSH连接端点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    pub user: String,
    pub hostname: String,
    pub port: u16,
    pub identity_files: Vec<PathBuf>,
}

impl SshEndpoint {
    /// 按"主机标识 > ssh配置 > 连接默认值"的优先级解析端点
    pub fn resolve(identifier: &str, config: &ConnectionConfig) -> Result<Self> {
        let ssh_config = match config.ssh_config_path() {
            Some(path) => SshConfig::load(&path)?,
            None => SshConfig::default(),
        };
        Self::resolve_with(identifier, config, &ssh_config)
    }

    pub fn resolve_with(
        identifier: &str,
        config: &ConnectionConfig,
        ssh_config: &SshConfig,
    ) -> Result<Self> {
        let spec = HostSpec::parse(identifier)?;
        let settings = ssh_config.lookup(&spec.host);

        let user = spec
            .user
            .or(settings.user)
            .unwrap_or_else(|| config.default_username());
        let hostname = settings.hostname.unwrap_or_else(|| spec.host.clone());
        let port = spec.port.or(settings.port).unwrap_or(config.port);

        let mut identity_files: Vec<PathBuf> = Vec::new();
        let candidates = config
            .private_key_path
            .iter()
            .map(String::as_str)
            .chain(settings.identity_files.iter().map(String::as_str))
            .chain(DEFAULT_IDENTITY_FILES.iter().copied());
        for candidate in candidates {
            let path = utils::expand_home(candidate);
            if !identity_files.contains(&path) {
                identity_files.push(path);
            }
        }

        debug!("解析SSH端点 {identifier} -> {user}@{hostname}:{port}");
        Ok(Self {
            user,
            hostname,
            port,
            identity_files,
        })
    }
}
