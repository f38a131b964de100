//! 核心网注册表
//!
//! 注册表是一个YAML映射，键为核心网实例名，值为该实例的部署描述。
//! 同一个文件里通常还有其他类型的条目（例如UE），因此只解析被请求的那一项。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_yaml::Value;

use crate::core_network::CoreNetworkError;
use crate::utils;

/// `Host` 取此值时使用调用方给出的当前主机
pub const CURRENT_HOST_PLACEHOLDER: &str = "%%current_host%%";

/// `LogCollect` 命令中会被替换为远程暂存目录的占位符
pub const LOG_DIR_PLACEHOLDER: &str = "%%log_dir%%";

/// 单个核心网实例的部署描述
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CoreNetworkDescriptor {
    #[serde(rename = "Host", default)]
    pub host: String,
    #[serde(rename = "Deploy", default, deserialize_with = "deserialize_command_list")]
    pub deploy: Vec<String>,
    #[serde(rename = "Undeploy", default, deserialize_with = "deserialize_command_list")]
    pub undeploy: Vec<String>,
    #[serde(rename = "LogCollect", default, deserialize_with = "deserialize_command_list")]
    pub log_collect: Vec<String>,
    #[serde(rename = "NetworkScript", default, deserialize_with = "deserialize_command_list")]
    pub network_script: Vec<String>,
    #[serde(rename = "CmdPrefix", default)]
    pub cmd_prefix: Option<String>,
    #[serde(rename = "RunIperf3Server", default)]
    pub run_iperf3_server: Option<bool>,
}

impl CoreNetworkDescriptor {
    /// 至少一条 `LogCollect` 命令须包含 `%%log_dir%%`
    pub fn has_log_dir_placeholder(&self) -> bool {
        self.log_collect.is_empty()
            || self
                .log_collect
                .iter()
                .any(|command| command.contains(LOG_DIR_PLACEHOLDER))
    }
}

/// 将单个字符串或字符串列表统一为命令列表
fn deserialize_command_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    listify(&value).map_err(D::Error::custom)
}

/// 数字和布尔值按字符串处理，`null` 视为空列表
pub fn listify(value: &Value) -> Result<Vec<String>, String> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Sequence(items) => items.iter().map(scalar_to_string).collect(),
        other => Ok(vec![scalar_to_string(other)?]),
    }
}

fn scalar_to_string(value: &Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(format!("expected a command string, found {other:?}")),
    }
}

/// 已加载的注册表
#[derive(Debug, Clone)]
pub struct CoreNetworkRegistry {
    path: PathBuf,
    entries: HashMap<String, Value>,
}

impl CoreNetworkRegistry {
    pub fn load(path: &Path) -> Result<Self, CoreNetworkError> {
        let entries: HashMap<String, Value> =
            utils::read_yaml_from_file(path).map_err(|e| CoreNetworkError::Registry {
                path: path.to_path_buf(),
                message: format!("{e:#}"),
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// 解析指定实例的描述
    pub fn descriptor(&self, name: &str) -> Result<CoreNetworkDescriptor, CoreNetworkError> {
        let value = self
            .entries
            .get(name)
            .ok_or_else(|| CoreNetworkError::UnknownCoreNetwork {
                name: name.to_string(),
                path: self.path.clone(),
            })?;
        serde_yaml::from_value(value.clone()).map_err(|e| CoreNetworkError::InvalidDescriptor {
            name: name.to_string(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const REGISTRY: &str = r#"
oai-cn5g:
  Host: "%%current_host%%"
  Deploy: docker compose -f /opt/oai-cn5g/docker-compose.yaml up -d
  Undeploy:
    - docker compose -f /opt/oai-cn5g/docker-compose.yaml down -t 5
  LogCollect:
    - docker logs oai-amf > %%log_dir%%/oai-amf.log
    - docker logs oai-smf > %%log_dir%%/oai-smf.log
  NetworkScript: docker exec oai-ext-dn ip a show dev eth0
  CmdPrefix: docker exec oai-ext-dn
  RunIperf3Server: false
numbers:
  Host: localhost
  Deploy: [1, true, "echo x"]
amarisoft-ue:
  Host: amariue
  AttachScript: ~
  Devices: [1, 2]
"#;

    fn load(content: &str) -> (tempfile::TempDir, CoreNetworkRegistry) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ci_infra.yaml");
        fs::write(&path, content).unwrap();
        let registry = CoreNetworkRegistry::load(&path).unwrap();
        (dir, registry)
    }

    #[test]
    fn test_scalar_and_list_are_normalized() {
        let (_dir, registry) = load(REGISTRY);
        let cn = registry.descriptor("oai-cn5g").unwrap();
        assert_eq!(cn.host, CURRENT_HOST_PLACEHOLDER);
        assert_eq!(
            cn.deploy,
            vec!["docker compose -f /opt/oai-cn5g/docker-compose.yaml up -d"]
        );
        assert_eq!(cn.undeploy.len(), 1);
        assert_eq!(cn.log_collect.len(), 2);
        assert_eq!(cn.network_script.len(), 1);
        assert_eq!(cn.cmd_prefix.as_deref(), Some("docker exec oai-ext-dn"));
        assert_eq!(cn.run_iperf3_server, Some(false));
        assert!(cn.has_log_dir_placeholder());
    }

    #[test]
    fn test_non_string_scalars() {
        let (_dir, registry) = load(REGISTRY);
        let cn = registry.descriptor("numbers").unwrap();
        assert_eq!(cn.deploy, vec!["1", "true", "echo x"]);
        assert!(cn.undeploy.is_empty());
        assert_eq!(cn.run_iperf3_server, None);
    }

    #[test]
    fn test_other_entries_are_not_parsed_eagerly() {
        let (_dir, registry) = load(REGISTRY);
        assert_eq!(registry.names(), vec!["amarisoft-ue", "numbers", "oai-cn5g"]);
        let ue = registry.descriptor("amarisoft-ue").unwrap();
        assert!(ue.deploy.is_empty());
    }

    #[test]
    fn test_unknown_name() {
        let (_dir, registry) = load(REGISTRY);
        let err = registry.descriptor("magma").unwrap_err();
        assert!(matches!(err, CoreNetworkError::UnknownCoreNetwork { .. }));
    }

    #[test]
    fn test_nested_command_is_rejected() {
        let (_dir, registry) = load("bad:\n  Deploy:\n    - [echo, nested]\n");
        let err = registry.descriptor("bad").unwrap_err();
        assert!(matches!(err, CoreNetworkError::InvalidDescriptor { .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = CoreNetworkRegistry::load(Path::new("/nonexistent/ci_infra.yaml")).unwrap_err();
        assert!(matches!(err, CoreNetworkError::Registry { .. }));
    }

    #[test]
    fn test_placeholder_check() {
        let descriptor = CoreNetworkDescriptor {
            log_collect: vec!["cp /var/log/amf.log /tmp".to_string()],
            ..Default::default()
        };
        assert!(!descriptor.has_log_dir_placeholder());
        assert!(CoreNetworkDescriptor::default().has_log_dir_placeholder());
    }
}
