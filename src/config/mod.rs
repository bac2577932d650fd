/// 统一配置系统
///
/// 提供TOML/JSON配置文件、环境变量覆盖和校验
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    /// 文件读取错误
    #[error("Config file error: {0}")]
    FileError(#[from] std::io::Error),
    /// 解析错误
    #[error("Config parse error: {0}")]
    ParseError(String),
    /// 验证错误
    #[error("Config validation error: {0}")]
    ValidationError(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// 桥接层主配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// 工作线程配置
    #[serde(default)]
    pub worker: WorkerConfig,

    /// 值编码配置
    #[serde(default)]
    pub marshal: MarshalConfig,

    /// 会话配置
    #[serde(default)]
    pub session: SessionConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    /// 创建默认配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 从TOML文件加载配置
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(ConfigError::FileError)?;
        Self::from_toml_str(&content)
    }

    /// 从TOML字符串解析配置
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// 从JSON文件加载配置
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(ConfigError::FileError)?;
        Self::from_json_str(&content)
    }

    /// 从JSON字符串解析配置
    pub fn from_json_str(content: &str) -> ConfigResult<Self> {
        serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// 按扩展名加载配置文件（`.json` 走JSON，其余按TOML解析）
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_file(path),
            _ => Self::from_toml_file(path),
        }
    }

    /// 保存为TOML文件
    pub fn save_toml<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        fs::write(path, content).map_err(ConfigError::FileError)
    }

    /// 保存为JSON文件
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        fs::write(path, content).map_err(ConfigError::FileError)
    }

    /// 从环境变量覆盖配置
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // 工作线程配置
        if let Some(val) = lookup("BRIDGE_WORKER_POLL_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                self.worker.poll_interval_ms = ms;
            }
        }

        // 编码配置
        if let Some(val) = lookup("BRIDGE_MARSHAL_MAX_CACHED_STRING_LEN") {
            if let Ok(len) = val.parse() {
                self.marshal.max_cached_string_len = len;
            }
        }
        if let Some(val) = lookup("BRIDGE_MARSHAL_MAX_DEPTH") {
            if let Ok(depth) = val.parse() {
                self.marshal.max_depth = depth;
            }
        }

        // 会话配置
        if let Some(val) = lookup("BRIDGE_SESSION_ROOT_GLOBAL") {
            self.session.root_global = if val.is_empty() { None } else { Some(val) };
        }
        if let Some(val) = lookup("BRIDGE_SESSION_INIT_SCRIPT") {
            self.session.init_script = if val.is_empty() { None } else { Some(PathBuf::from(val)) };
        }

        // 日志配置
        if let Some(val) = lookup("BRIDGE_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                self.logging.level = level;
            }
        }
    }

    /// 验证配置
    pub fn validate(&self) -> ConfigResult<()> {
        self.worker.validate()?;
        self.marshal.validate()?;
        self.session.validate()?;
        Ok(())
    }

    /// 自动查找并加载配置文件
    ///
    /// 按以下顺序查找：
    /// 1. ./bridge.toml
    /// 2. ./bridge.json
    /// 3. <用户配置目录>/engine_bridge/config.toml
    /// 4. 使用默认配置
    ///
    /// 返回值附带实际加载的文件路径；此时日志尚未初始化，由调用方记录。
    pub fn load_or_default() -> (Self, Option<PathBuf>) {
        let mut candidates = vec![PathBuf::from("bridge.toml"), PathBuf::from("bridge.json")];
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("engine_bridge").join("config.toml"));
        }

        for path in candidates {
            if let Ok(config) = Self::from_file(&path) {
                return (config, Some(path));
            }
        }

        (Self::default(), None)
    }
}

/// 工作线程配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// 任务队列的轮询间隔（毫秒），决定停止/重置被观察到的最大延迟
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "worker.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// 值编码配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarshalConfig {
    /// 行对象快照中缓存的字符串最大长度
    pub max_cached_string_len: usize,
    /// 编码时允许的最大嵌套深度
    pub max_depth: usize,
}

impl Default for MarshalConfig {
    fn default() -> Self {
        Self {
            max_cached_string_len: 100,
            max_depth: 64,
        }
    }
}

impl MarshalConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_depth == 0 {
            return Err(ConfigError::ValidationError(
                "marshal.max_depth must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// 会话配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// 作为会话根对象的全局变量名；为空时使用全局对象本身
    #[serde(default)]
    pub root_global: Option<String>,
    /// 宿主初始化脚本，在工作线程启动时于前置脚本之后执行一次
    ///
    /// 通常由它定义 `root_global` 指向的根对象和领域类。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_script: Option<PathBuf>,
    /// 远端 fetch 回调在引擎中安装的全局名
    pub fetch_global: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            root_global: None,
            init_script: None,
            fetch_global: "fetch".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.fetch_global.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "session.fetch_global must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别
    pub level: LogLevel,

    /// 是否输出到控制台（标准错误）
    pub log_to_console: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            log_to_console: true,
        }
    }
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// 跟踪
    Trace,
    /// 调试
    Debug,
    /// 信息
    Info,
    /// 警告
    Warn,
    /// 错误
    Error,
}

impl LogLevel {
    /// `EnvFilter` 使用的过滤字符串
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}
