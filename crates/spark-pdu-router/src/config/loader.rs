//! TOML 配置入口。
//!
//! 加载后立即执行 [`RouterConfig::validate`]，调用方拿到的配置要么完整可用，要么是一条明确的错误。

use std::{fs, path::Path};

use super::RouterConfig;
use crate::error::ConfigError;

impl RouterConfig {
    /// 从 TOML 文本解析并校验配置。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: RouterConfig = toml::from_str(text).map_err(|err| ConfigError::Parse {
            detail: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 读取文件并按 TOML 解析。
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| ConfigError::Parse {
            detail: format!("{}: {err}", path.display()),
        })?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{DestinationKind, LockMechanism, Processing, RouterConfig, TriggerBoundary};
    use crate::error::ConfigError;
    use crate::ids::{BufferId, CoreId};

    const GATEWAY: &str = r#"
core_count = 2

[[locks]]
mechanism = { kind = "spinlock", retry_limit = 64 }

[[buffers]]
capacity = 64
max_readers = 2

[[buffers]]
capacity = 256
max_readers = 2

[[queues]]
depth = 4
pool = [0, 1]
lock = 0

[[routes]]
queue = 0
lock = 0
threshold = 32
boundary = "exclusive"
metadata_length = 4
destinations = [0, 1]

[[destinations]]
route = 0
kind = "downstream"

[[destinations]]
route = 0
kind = "upstream"
processing = "deferred"
partition = 1
"#;

    #[test]
    fn parses_a_complete_gateway_table() {
        let config = RouterConfig::from_toml_str(GATEWAY).expect("示例配置应当合法");
        assert_eq!(config.core_count, 2);
        assert_eq!(
            config.locks[0].mechanism,
            LockMechanism::Spinlock { retry_limit: 64 }
        );
        assert_eq!(config.queues[0].pool, [BufferId::new(0), BufferId::new(1)]);
        assert_eq!(config.routes[0].boundary, TriggerBoundary::Exclusive);
        assert_eq!(config.destinations[1].kind, DestinationKind::Upstream);
        assert_eq!(config.destinations[1].processing, Processing::Deferred);
        assert_eq!(config.destinations[1].partition, CoreId::new(1));
        assert_eq!(config.destinations[0].processing, Processing::Immediate);
    }

    #[test]
    fn unknown_fields_are_parse_errors() {
        let text = GATEWAY.replace("threshold = 32", "treshold = 32");
        assert!(matches!(
            RouterConfig::from_toml_str(&text),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn parsed_tables_are_validated() {
        let text = GATEWAY.replace("pool = [0, 1]", "pool = [0, 5]");
        assert!(matches!(
            RouterConfig::from_toml_str(&text),
            Err(ConfigError::DanglingReference { .. })
        ));
    }
}
