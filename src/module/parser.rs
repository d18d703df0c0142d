//! 模块描述解析器
//!
//! 负责从 module.yaml 文件解析模块描述。

use std::collections::HashSet;
use std::path::Path;

use crate::module::metadata::ModuleManifest;
use crate::utils::{CoreError, Result};

/// 模块描述解析器
#[derive(Debug, Clone, Default)]
pub struct ModuleParser;

impl ModuleParser {
    /// 从文件解析模块描述
    ///
    /// # Errors
    ///
    /// - 文件不存在或无法读取时返回 IO 错误
    /// - 文件内容不符合 YAML 格式时返回 YAML 错误
    /// - 描述验证失败时返回 `InvalidMetadata` 错误
    pub async fn parse_file(path: &Path) -> Result<ModuleManifest> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse_string(&content)
    }

    /// 从文件同步解析模块描述
    pub fn parse_file_sync(path: &Path) -> Result<ModuleManifest> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_string(&content)
    }

    /// 从字符串解析模块描述
    pub fn parse_string(content: &str) -> Result<ModuleManifest> {
        let manifest: ModuleManifest = serde_yaml::from_str(content)?;
        Self::validate(&manifest)?;
        Ok(manifest)
    }

    /// 验证模块描述
    ///
    /// 收集全部问题后一次性返回：
    /// - 名称与入口不能为空，名称只允许字母、数字、`_`、`-`、`.`
    /// - 版本号必须是 semver
    /// - 依赖名称不能为空、不能重复、不能依赖自身，版本要求必须是 semver 范围
    pub fn validate(manifest: &ModuleManifest) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if manifest.name.is_empty() {
            errors.push("模块名称不能为空".to_string());
        } else if !Self::is_valid_name(&manifest.name) {
            errors.push(format!(
                "模块名称 '{}' 格式无效，只允许字母、数字、下划线、连字符和点",
                manifest.name
            ));
        }

        if manifest.version.is_empty() {
            errors.push("模块版本号不能为空".to_string());
        } else if semver::Version::parse(&manifest.version).is_err() {
            errors.push(format!(
                "无效的版本号格式 '{}', 请使用 semver 格式 (如 1.0.0)",
                manifest.version
            ));
        }

        if manifest.entry.is_empty() {
            errors.push("入口不能为空".to_string());
        }

        let mut seen = HashSet::new();
        for (index, dep) in manifest.dependencies.iter().enumerate() {
            if dep.name.is_empty() {
                errors.push(format!("第 {} 个依赖的模块名称不能为空", index + 1));
                continue;
            }
            if dep.name == manifest.name {
                errors.push(format!("模块 '{}' 不能依赖自身", dep.name));
            }
            if !seen.insert(dep.name.as_str()) {
                errors.push(format!("依赖 '{}' 重复声明", dep.name));
            }
            if semver::VersionReq::parse(&dep.version).is_err() {
                errors.push(format!(
                    "依赖 '{}' 的版本要求格式无效: '{}', 请使用 semver 范围格式 (如 ^1.0.0)",
                    dep.name, dep.version
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::InvalidMetadata(errors.join("; ")))
        }
    }

    /// 字母开头，只包含字母、数字、`_`、`-`、`.`
    fn is_valid_name(name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphabetic() => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::metadata::Dependency;

    fn valid_manifest() -> ModuleManifest {
        ModuleManifest::new("test-module", "1.0.0")
    }

    #[test]
    fn test_parse_valid_yaml() {
        let yaml = r#"
name: "greeter"
version: "1.2.3"
entry: "greeter-v1"
description: "问候服务"
headers:
  vendor: "chips"
dependencies:
  - name: "i18n"
    version: "^2.0.0"
  - name: "audit"
    version: "*"
    required: false
"#;

        let result = ModuleParser::parse_string(yaml);
        assert!(result.is_ok(), "解析失败: {:?}", result.err());

        let manifest = result.unwrap();
        assert_eq!(manifest.name, "greeter");
        assert_eq!(manifest.version, "1.2.3");
        assert_eq!(manifest.entry, "greeter-v1");
        assert_eq!(manifest.headers["vendor"], "chips");
        assert_eq!(manifest.dependencies.len(), 2);
        assert!(manifest.dependencies[0].required);
        assert!(!manifest.dependencies[1].required);
    }

    #[test]
    fn test_parse_missing_entry_fails() {
        let yaml = r#"
name: "minimal"
version: "0.1.0"
"#;
        assert!(matches!(
            ModuleParser::parse_string(yaml),
            Err(CoreError::Yaml(_))
        ));
    }

    #[test]
    fn test_validate_empty_name() {
        let mut manifest = valid_manifest();
        manifest.name = String::new();

        let err = ModuleParser::validate(&manifest).unwrap_err();
        assert!(err.to_string().contains("名称不能为空"));
    }

    #[test]
    fn test_validate_invalid_name_format() {
        let mut manifest = valid_manifest();
        manifest.name = "9lives".to_string();

        let err = ModuleParser::validate(&manifest).unwrap_err();
        assert!(err.to_string().contains("格式无效"));
    }

    #[test]
    fn test_validate_invalid_version() {
        let mut manifest = valid_manifest();
        manifest.version = "not-a-version".to_string();

        let err = ModuleParser::validate(&manifest).unwrap_err();
        assert!(err.to_string().contains("版本号格式"));
    }

    #[test]
    fn test_validate_dependency_problems() {
        let manifest = valid_manifest()
            .with_dependency(Dependency::new("test-module", "^1.0"))
            .with_dependency(Dependency::new("other", "invalid-version"))
            .with_dependency(Dependency::new("other", "^1.0"));

        let msg = ModuleParser::validate(&manifest).unwrap_err().to_string();
        assert!(msg.contains("不能依赖自身"));
        assert!(msg.contains("版本要求格式无效"));
        assert!(msg.contains("重复声明"));
    }

    #[test]
    fn test_multiple_validation_errors() {
        let mut manifest = valid_manifest();
        manifest.name = String::new();
        manifest.entry = String::new();
        manifest.version = "invalid".to_string();

        let err = ModuleParser::validate(&manifest).unwrap_err();
        assert_eq!(err.error_code(), crate::utils::error_code::MODULE_INVALID_METADATA);

        let msg = err.to_string();
        assert!(msg.contains("名称不能为空"));
        assert!(msg.contains("入口不能为空"));
        assert!(msg.contains("版本号格式"));
    }

    #[test]
    fn test_is_valid_name() {
        assert!(ModuleParser::is_valid_name("greeter"));
        assert!(ModuleParser::is_valid_name("com.example.greeter"));
        assert!(ModuleParser::is_valid_name("greeter_v2-beta"));

        assert!(!ModuleParser::is_valid_name(""));
        assert!(!ModuleParser::is_valid_name("-greeter"));
        assert!(!ModuleParser::is_valid_name("greeter module"));
    }

    #[tokio::test]
    async fn test_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("module.yaml");
        tokio::fs::write(&path, "name: a\nversion: 1.0.0\nentry: a\n")
            .await
            .unwrap();

        let manifest = ModuleParser::parse_file(&path).await.unwrap();
        assert_eq!(manifest.name, "a");
        assert_eq!(ModuleParser::parse_file_sync(&path).unwrap(), manifest);

        let missing = ModuleParser::parse_file(&dir.path().join("nope.yaml")).await;
        assert!(matches!(missing, Err(CoreError::Io(_))));
    }
}
