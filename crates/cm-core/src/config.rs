//! Configuration management
//!
//! 設定は以下の優先順位で読み込まれます:
//! 1. 環境変数
//! 2. cm.toml 設定ファイル
//! 3. デフォルト値
//!
//! 設定ファイル内では `${VAR_NAME}` 形式で環境変数を展開できます。

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use crate::memory::{
    InMemoryLongTermMemory, LongTermMemory, ShortTermMemory, SqliteLongTermMemory,
    DEFAULT_CHAT_STORE_KEY,
};
use crate::store::{InMemoryStore, MessageStore, SqliteStore};
use crate::Error;

/// Default config file name
pub const CONFIG_FILE: &str = "cm.toml";

/// LLM Provider type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// Anthropic Claude API
    #[default]
    Claude,
    /// OpenAI-compatible API
    OpenAi,
}

impl LlmProvider {
    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "openai" | "glm" | "zai" | "minimax" => LlmProvider::OpenAi,
            _ => LlmProvider::Claude,
        }
    }
}

/// LLM configuration
///
/// Accepted by memories for future summarization; nothing here calls it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmConfig {
    /// API key
    #[serde(default, skip_serializing)]
    pub api_key: String,

    /// Model to use
    #[serde(default = "default_model")]
    pub model: String,

    /// API provider
    #[serde(default)]
    pub provider: LlmProvider,

    /// Base URL (optional, for custom endpoints)
    pub base_url: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            provider: LlmProvider::Claude,
            base_url: None,
        }
    }
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

/// Which backend a memory tier runs on
///
/// `InMemory` lives only as long as the built instance; each
/// `build_*` call starts empty.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    InMemory,
    #[default]
    Sqlite,
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "in_memory" | "memory" | "simple" => Ok(BackendKind::InMemory),
            "sqlite" => Ok(BackendKind::Sqlite),
            other => Err(Error::Config(format!("Unknown backend: {}", other))),
        }
    }
}

/// Short-term memory configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShortTermConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Conversation key the memory binds to
    #[serde(default = "default_chat_store_key")]
    pub chat_store_key: String,

    /// Token budget for windowed reads (None = whole history)
    #[serde(default)]
    pub token_limit: Option<usize>,
}

impl Default for ShortTermConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            db_path: default_db_path(),
            chat_store_key: default_chat_store_key(),
            token_limit: None,
        }
    }
}

/// Long-term memory configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LongTermConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for LongTermConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "data/cm.db".to_string()
}

fn default_chat_store_key() -> String {
    DEFAULT_CHAT_STORE_KEY.to_string()
}

/// Main configuration for cm
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Short-term memory configuration
    #[serde(default)]
    pub short_term: ShortTermConfig,

    /// Long-term memory configuration
    #[serde(default)]
    pub long_term: LongTermConfig,

    /// Optional model handle passed to memories
    #[serde(default)]
    pub llm: Option<LlmConfig>,
}

impl Config {
    /// 設定ファイルから環境変数を展開する
    ///
    /// `${VAR_NAME}` 形式の文字列を環境変数の値に置換します。
    /// 環境変数が存在しない場合は空文字列になります。
    fn expand_env_vars(value: &str) -> String {
        let mut result = String::new();
        let mut chars = value.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '$' && chars.peek() == Some(&'{') {
                chars.next(); // '{' を消費

                let mut var_name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    var_name.push(c);
                }

                if let Ok(env_value) = std::env::var(&var_name) {
                    result.push_str(&env_value);
                }
            } else {
                result.push(c);
            }
        }

        result
    }

    /// TOML 設定ファイルから設定を読み込む
    ///
    /// # 引数
    /// * `path` - TOML ファイルのパス
    ///
    /// # 環境変数展開
    /// 設定ファイル内の `${VAR_NAME}` は環境変数の値に置換されます。
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();

        let toml_content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut cfg = Self::from_toml_str(&toml_content)?;

        // 既存の環境変数で上書き（環境変数が優先）
        cfg.apply_env_overrides();

        Ok(cfg)
    }

    /// TOML 文字列を解析する（環境変数による上書きなし）
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let expanded_content = Self::expand_env_vars(content);

        let toml: TomlConfig = toml::from_str(&expanded_content)
            .map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))?;

        Self::from_toml_config(toml)
    }

    /// デフォルトパスから設定を読み込む
    ///
    /// `./cm.toml` があればそれを使い、なければ環境変数のみで構成します。
    pub fn load() -> crate::Result<Self> {
        if Path::new(CONFIG_FILE).exists() {
            return Self::from_toml_file(CONFIG_FILE);
        }

        Ok(Self::from_env())
    }

    /// Load configuration from environment variables over the defaults
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env_overrides();
        cfg
    }

    /// TOML 構造から Config を構築
    fn from_toml_config(toml: TomlConfig) -> crate::Result<Self> {
        // 短期メモリ設定
        let short = toml.short_term.unwrap_or_default();
        let short_term = ShortTermConfig {
            backend: short
                .backend
                .as_deref()
                .map(str::parse)
                .transpose()?
                .unwrap_or_default(),
            db_path: short.db_path.unwrap_or_else(default_db_path),
            chat_store_key: short.chat_store_key.unwrap_or_else(default_chat_store_key),
            token_limit: short.token_limit,
        };

        // 長期メモリ設定
        let long = toml.long_term.unwrap_or_default();
        let long_term = LongTermConfig {
            backend: long
                .backend
                .as_deref()
                .map(str::parse)
                .transpose()?
                .unwrap_or_default(),
            db_path: long.db_path.unwrap_or_else(default_db_path),
        };

        // LLM 設定（セクションがある場合のみ）
        let llm = toml.llm.map(|llm| LlmConfig {
            api_key: llm.api_key.unwrap_or_default(),
            model: llm.model.unwrap_or_else(default_model),
            provider: LlmProvider::parse(&llm.provider.unwrap_or_default()),
            base_url: llm.base_url,
        });

        Ok(Config {
            short_term,
            long_term,
            llm,
        })
    }

    /// 環境変数で設定を上書きする
    fn apply_env_overrides(&mut self) {
        // 短期メモリ設定の上書き
        if let Ok(backend) = std::env::var("CM_STORE_BACKEND") {
            match backend.parse() {
                Ok(kind) => self.short_term.backend = kind,
                Err(e) => warn!("Ignoring CM_STORE_BACKEND: {}", e),
            }
        }
        if let Ok(path) = std::env::var("CM_DB_PATH") {
            if !path.is_empty() {
                self.short_term.db_path = path;
            }
        }
        if let Ok(key) = std::env::var("CM_CHAT_STORE_KEY") {
            if !key.is_empty() {
                self.short_term.chat_store_key = key;
            }
        }
        if let Ok(limit) = std::env::var("CM_TOKEN_LIMIT") {
            match limit.parse() {
                Ok(limit) => self.short_term.token_limit = Some(limit),
                Err(_) => warn!("Ignoring CM_TOKEN_LIMIT: not a number: {}", limit),
            }
        }

        // 長期メモリ設定の上書き
        if let Ok(backend) = std::env::var("CM_LONG_TERM_BACKEND") {
            match backend.parse() {
                Ok(kind) => self.long_term.backend = kind,
                Err(e) => warn!("Ignoring CM_LONG_TERM_BACKEND: {}", e),
            }
        }
        if let Ok(path) = std::env::var("CM_LONG_TERM_DB_PATH") {
            if !path.is_empty() {
                self.long_term.db_path = path;
            }
        }

        // LLM 設定の上書き（API キーがあればセクションを作成）
        if let Ok(api_key) = std::env::var("LLM_API_KEY") {
            self.llm.get_or_insert_with(LlmConfig::default).api_key = api_key;
        }
        if let Some(llm) = self.llm.as_mut() {
            if let Ok(model) = std::env::var("LLM_MODEL") {
                if !model.is_empty() {
                    llm.model = model;
                }
            }
            if let Ok(provider) = std::env::var("LLM_PROVIDER") {
                if !provider.is_empty() {
                    llm.provider = LlmProvider::parse(&provider);
                }
            }
            if let Ok(base_url) = std::env::var("LLM_BASE_URL") {
                if !base_url.is_empty() {
                    llm.base_url = Some(base_url);
                }
            }
        }
    }

    /// Open the message store described by `[short_term]`
    pub fn build_store(&self) -> crate::Result<Arc<dyn MessageStore>> {
        Ok(match self.short_term.backend {
            BackendKind::InMemory => Arc::new(InMemoryStore::new()),
            BackendKind::Sqlite => Arc::new(SqliteStore::new(&self.short_term.db_path)?),
        })
    }

    /// Build a short-term memory bound to the configured key
    pub fn build_short_term(&self) -> crate::Result<ShortTermMemory> {
        let mut memory = ShortTermMemory::new(self.build_store()?, &self.short_term.chat_store_key)
            .with_llm(self.llm.clone());
        if let Some(limit) = self.short_term.token_limit {
            memory = memory.with_token_limit(limit);
        }
        Ok(memory)
    }

    /// Open the long-term memory described by `[long_term]`
    pub fn build_long_term(&self) -> crate::Result<Arc<dyn LongTermMemory>> {
        Ok(match self.long_term.backend {
            BackendKind::InMemory => Arc::new(InMemoryLongTermMemory::new()),
            BackendKind::Sqlite => Arc::new(SqliteLongTermMemory::new(&self.long_term.db_path)?),
        })
    }
}

// ============================================================================
// TOML 構造体定義（ファイル解析用）
// ============================================================================

/// TOML ファイル用のトップレベル構造
#[derive(Debug, Deserialize)]
struct TomlConfig {
    /// 短期メモリ設定
    short_term: Option<TomlShortTermConfig>,
    /// 長期メモリ設定
    long_term: Option<TomlLongTermConfig>,
    /// LLM 設定
    llm: Option<TomlLlmConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlShortTermConfig {
    /// バックエンド ("in_memory" または "sqlite")
    backend: Option<String>,
    /// データベースパス
    db_path: Option<String>,
    /// 会話キー
    chat_store_key: Option<String>,
    /// トークン上限
    token_limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlLongTermConfig {
    /// バックエンド ("in_memory" または "sqlite")
    backend: Option<String>,
    /// データベースパス
    db_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlLlmConfig {
    /// API プロバイダー ("claude" または "openai")
    provider: Option<String>,
    /// モデル名
    model: Option<String>,
    /// API キー
    api_key: Option<String>,
    /// ベース URL (オプション)
    base_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ChatMemory;
    use crate::message::Message;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.short_term.backend, BackendKind::Sqlite);
        assert_eq!(config.short_term.db_path, "data/cm.db");
        assert_eq!(config.short_term.chat_store_key, "chat_history");
        assert!(config.short_term.token_limit.is_none());
        assert_eq!(config.long_term.backend, BackendKind::Sqlite);
        assert!(config.llm.is_none());
    }

    #[test]
    fn test_llm_config_default() {
        let config = LlmConfig::default();
        assert_eq!(config.model, "claude-sonnet-4-20250514");
        assert_eq!(config.provider, LlmProvider::Claude);
        assert!(config.api_key.is_empty());
        assert!(config.base_url.is_none());
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("sqlite".parse::<BackendKind>().unwrap(), BackendKind::Sqlite);
        assert_eq!("Memory".parse::<BackendKind>().unwrap(), BackendKind::InMemory);
        assert!(matches!("redis".parse::<BackendKind>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_expand_env_vars() {
        // テスト用環境変数を設定
        unsafe {
            std::env::set_var("CM_CONFIG_TEST_VAR", "test_value");
        }

        let result = Config::expand_env_vars("prefix_${CM_CONFIG_TEST_VAR}_suffix");
        assert_eq!(result, "prefix_test_value_suffix");

        // 存在しない環境変数
        let result = Config::expand_env_vars("prefix_${CM_NONEXISTENT_VAR}_suffix");
        assert_eq!(result, "prefix__suffix");

        unsafe {
            std::env::remove_var("CM_CONFIG_TEST_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_no_braces() {
        assert_eq!(Config::expand_env_vars("no_vars_here"), "no_vars_here");
        assert_eq!(Config::expand_env_vars("cost: $5"), "cost: $5");
        assert_eq!(Config::expand_env_vars("${}_content"), "_content");
    }

    #[test]
    fn test_toml_config_parsing() {
        let toml_content = r#"
[short_term]
backend = "sqlite"
db_path = "/path/to/short.db"
chat_store_key = "session-42"
token_limit = 2048

[long_term]
backend = "sqlite"
db_path = "/path/to/long.db"

[llm]
provider = "openai"
model = "glm-4.7"
api_key = "test_key"
base_url = "https://api.example.com"
"#;

        let config = Config::from_toml_str(toml_content).unwrap();
        assert_eq!(config.short_term.backend, BackendKind::Sqlite);
        assert_eq!(config.short_term.db_path, "/path/to/short.db");
        assert_eq!(config.short_term.chat_store_key, "session-42");
        assert_eq!(config.short_term.token_limit, Some(2048));
        assert_eq!(config.long_term.db_path, "/path/to/long.db");

        let llm = config.llm.unwrap();
        assert_eq!(llm.provider, LlmProvider::OpenAi);
        assert_eq!(llm.model, "glm-4.7");
        assert_eq!(llm.api_key, "test_key");
        assert_eq!(llm.base_url, Some("https://api.example.com".to_string()));
    }

    #[test]
    fn test_toml_partial_and_invalid() {
        let config = Config::from_toml_str("[long_term]\nbackend = \"sqlite\"\n").unwrap();
        assert_eq!(config.short_term, ShortTermConfig::default());
        assert_eq!(config.long_term.backend, BackendKind::Sqlite);
        assert!(config.llm.is_none());

        assert!(Config::from_toml_str("[short_term]\nbackend = \"redis\"\n").is_err());
        assert!(Config::from_toml_str("not = [valid").is_err());
    }

    #[test]
    fn test_from_toml_file_missing() {
        let err = Config::from_toml_file("/definitely/not/here/cm.toml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_build_short_term_sqlite() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            short_term: ShortTermConfig {
                backend: BackendKind::Sqlite,
                db_path: tmp.path().join("short.db").to_str().unwrap().to_string(),
                chat_store_key: "k".to_string(),
                token_limit: Some(100),
            },
            ..Config::default()
        };

        let memory = config.build_short_term().unwrap();
        assert_eq!(memory.key(), "k");
        assert_eq!(memory.token_limit(), Some(100));
        assert_eq!(memory.store().class_name(), "sqlite");
        memory.put(Message::user("hi")).unwrap();

        // A second build sees the same on-disk history
        let again = config.build_short_term().unwrap();
        assert_eq!(again.get_all().unwrap(), vec![Message::user("hi")]);
    }

    #[test]
    fn test_build_long_term_in_memory() {
        let config = Config {
            long_term: LongTermConfig {
                backend: BackendKind::InMemory,
                ..LongTermConfig::default()
            },
            ..Config::default()
        };
        let long_term = config.build_long_term().unwrap();
        long_term.add_message(Message::user("x"), "c", 1.0).unwrap();
        assert_eq!(long_term.get_messages("c").unwrap().len(), 1);

        // Nothing outlives the instance
        assert!(config.build_long_term().unwrap().get_messages("c").unwrap().is_empty());
    }

    #[test]
    fn test_default_backends_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("data").join("cm.db").to_str().unwrap().to_string();
        let mut config = Config::default();
        config.short_term.db_path = db_path.clone();
        config.long_term.db_path = db_path;

        config.build_short_term().unwrap().put(Message::user("hi")).unwrap();
        config
            .build_long_term()
            .unwrap()
            .add_message(Message::user("remembered"), "c", 5.0)
            .unwrap();

        let reopened = config.build_short_term().unwrap();
        assert_eq!(reopened.get_all().unwrap(), vec![Message::user("hi")]);
        assert_eq!(config.build_store().unwrap().get_keys().unwrap(), vec!["chat_history"]);

        let recent = config
            .build_long_term()
            .unwrap()
            .get_recent_memories("c", 10.0, 10)
            .unwrap();
        assert_eq!(recent, vec![Message::user("remembered")]);
    }
}
