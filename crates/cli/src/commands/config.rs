use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use toml::Value;
use tunesmith_core::config::{AppConfig, LoadOptions};

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_key: &str| {
        field_source(key_path, env_key, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];

    lines.push(render_line(
        "database.url",
        &config.database.url,
        source("database.url", "TUNESMITH_DATABASE_URL"),
    ));
    lines.push(render_line(
        "database.max_connections",
        &config.database.max_connections.to_string(),
        source("database.max_connections", "TUNESMITH_DATABASE_MAX_CONNECTIONS"),
    ));
    lines.push(render_line(
        "database.timeout_secs",
        &config.database.timeout_secs.to_string(),
        source("database.timeout_secs", "TUNESMITH_DATABASE_TIMEOUT_SECS"),
    ));

    lines.push(render_line("llm.model", &config.llm.model, source("llm.model", "TUNESMITH_LLM_MODEL")));
    lines.push(render_line(
        "llm.base_url",
        &config.llm.base_url,
        source("llm.base_url", "TUNESMITH_LLM_BASE_URL"),
    ));
    let llm_api_key = if config.llm.api_key.is_some() { "<redacted>" } else { "<unset>" };
    lines.push(render_line(
        "llm.api_key",
        llm_api_key,
        source("llm.api_key", "TUNESMITH_LLM_API_KEY"),
    ));
    lines.push(render_line(
        "llm.timeout_secs",
        &config.llm.timeout_secs.to_string(),
        source("llm.timeout_secs", "TUNESMITH_LLM_TIMEOUT_SECS"),
    ));
    lines.push(render_line(
        "llm.max_retries",
        &config.llm.max_retries.to_string(),
        source("llm.max_retries", "TUNESMITH_LLM_MAX_RETRIES"),
    ));

    lines.push(render_line(
        "server.bind_address",
        &config.server.bind_address,
        source("server.bind_address", "TUNESMITH_SERVER_BIND_ADDRESS"),
    ));
    lines.push(render_line(
        "server.port",
        &config.server.port.to_string(),
        source("server.port", "TUNESMITH_SERVER_PORT"),
    ));

    lines.push(render_line(
        "logging.level",
        &config.logging.level,
        source("logging.level", "TUNESMITH_LOGGING_LEVEL"),
    ));
    lines.push(render_line(
        "logging.format",
        &format!("{:?}", config.logging.format),
        source("logging.format", "TUNESMITH_LOGGING_FORMAT"),
    ));

    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from("tunesmith.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/tunesmith.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

#[cfg(test)]
mod tests {
    use super::contains_path;

    #[test]
    fn contains_path_walks_nested_tables() {
        let doc: toml::Value = "[database]\nurl = \"sqlite::memory:\"\n".parse().expect("toml");
        assert!(contains_path(&doc, "database.url"));
        assert!(!contains_path(&doc, "database.max_connections"));
        assert!(!contains_path(&doc, "server.port"));
    }
}
