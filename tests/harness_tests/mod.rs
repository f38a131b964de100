//! 集成测试共用的夹具

use std::fs;
use std::path::{Path, PathBuf};

mod connection_test;
mod core_network_test;

/// 测试夹具目录
pub fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures")
}

pub fn fixture_scripts_dir() -> PathBuf {
    fixtures_dir().join("scripts")
}

/// 把注册表夹具写入临时目录，`@TMP@` 替换为该目录
pub fn fixture_registry(dir: &Path) -> PathBuf {
    let content = fs::read_to_string(fixtures_dir().join("test_core_infra.yaml")).unwrap();
    let path = dir.join("ci_infra.yaml");
    fs::write(&path, content.replace("@TMP@", &dir.display().to_string())).unwrap();
    path
}
