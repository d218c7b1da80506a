//! 运行目录：<output_dir>/<run_name>/<YYYYmmdd_HHMMSS>/{answers.jsonl, config.json}

use std::path::{Path, PathBuf};

use crate::config::AppConfig;

#[derive(Debug, Clone)]
pub struct RunDir {
    pub root: PathBuf,
    pub answers: PathBuf,
    pub config: PathBuf,
}

/// run_name 中的空格和斜杠替换为下划线
pub fn sanitize_run_name(name: &str) -> String {
    let trimmed = name.trim();
    let cleaned: String = trimmed
        .chars()
        .map(|c| if c == ' ' || c == '/' || c == '\\' { '_' } else { c })
        .collect();
    if cleaned.is_empty() {
        "run".to_string()
    } else {
        cleaned
    }
}

impl RunDir {
    /// 新建带时间戳的目录，或在 resume_from 指定时复用已存在的目录
    pub fn prepare(output_dir: &Path, run_name: &str, resume_from: Option<&str>) -> std::io::Result<Self> {
        let name = sanitize_run_name(run_name);
        if name != run_name {
            tracing::warn!(from = %run_name, to = %name, "sanitized run_name");
        }
        let run_root = output_dir.join(&name);
        let root = match resume_from {
            Some(stamp) => {
                let dir = run_root.join(stamp);
                if !dir.is_dir() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("run directory to resume not found: {}", dir.display()),
                    ));
                }
                dir
            }
            None => {
                let dir = run_root.join(chrono::Local::now().format("%Y%m%d_%H%M%S").to_string());
                std::fs::create_dir_all(&dir)?;
                dir
            }
        };
        Ok(Self {
            answers: root.join("answers.jsonl"),
            config: root.join("config.json"),
            root,
        })
    }

    /// 保存本次运行的有效配置
    pub fn write_config(&self, cfg: &AppConfig) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(cfg)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.config, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_run_name() {
        assert_eq!(sanitize_run_name("my run/v2"), "my_run_v2");
        assert_eq!(sanitize_run_name("  "), "run");
    }

    #[test]
    fn test_prepare_new_and_resume() {
        let out = tempfile::tempdir().unwrap();
        let dir = RunDir::prepare(out.path(), "exp 1", None).unwrap();
        assert!(dir.root.is_dir());
        assert!(dir.root.starts_with(out.path().join("exp_1")));
        dir.write_config(&AppConfig::default()).unwrap();
        assert!(dir.config.exists());

        let stamp = dir.root.file_name().unwrap().to_str().unwrap().to_string();
        let resumed = RunDir::prepare(out.path(), "exp 1", Some(&stamp)).unwrap();
        assert_eq!(resumed.root, dir.root);

        let err = RunDir::prepare(out.path(), "exp 1", Some("19700101_000000")).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
