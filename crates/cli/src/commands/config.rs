use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use expensa_core::config::{AppConfig, LoadOptions};
use toml::Value;

struct Field {
    key: &'static str,
    env_key: Option<&'static str>,
    value: String,
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in effective_fields(&config) {
        let source =
            field_source(&field, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(field.key, &field.value, source));
    }

    lines.join("\n")
}

fn effective_fields(config: &AppConfig) -> Vec<Field> {
    let rates = config
        .currency
        .rates
        .iter()
        .map(|(code, rate)| format!("{code}={rate}"))
        .collect::<Vec<_>>()
        .join(",");
    let signing_secret = if config.notifications.signing_secret.is_some() {
        "<redacted>"
    } else {
        "<unset>"
    };

    vec![
        Field {
            key: "database.url",
            env_key: Some("EXPENSA_DATABASE_URL"),
            value: config.database.url.clone(),
        },
        Field {
            key: "database.max_connections",
            env_key: Some("EXPENSA_DATABASE_MAX_CONNECTIONS"),
            value: config.database.max_connections.to_string(),
        },
        Field {
            key: "database.timeout_secs",
            env_key: Some("EXPENSA_DATABASE_TIMEOUT_SECS"),
            value: config.database.timeout_secs.to_string(),
        },
        Field {
            key: "server.bind_address",
            env_key: Some("EXPENSA_SERVER_BIND_ADDRESS"),
            value: config.server.bind_address.clone(),
        },
        Field {
            key: "server.port",
            env_key: Some("EXPENSA_SERVER_PORT"),
            value: config.server.port.to_string(),
        },
        Field {
            key: "approvals.max_conflict_retries",
            env_key: Some("EXPENSA_APPROVALS_MAX_CONFLICT_RETRIES"),
            value: config.approvals.max_conflict_retries.to_string(),
        },
        Field {
            key: "currency.pivot",
            env_key: Some("EXPENSA_CURRENCY_PIVOT"),
            value: config.currency.pivot.clone(),
        },
        Field { key: "currency.rates", env_key: Some("EXPENSA_CURRENCY_RATES"), value: rates },
        Field {
            key: "notifications.webhook_url",
            env_key: Some("EXPENSA_NOTIFICATIONS_WEBHOOK_URL"),
            value: config.notifications.webhook_url.clone().unwrap_or_else(|| "<unset>".into()),
        },
        Field {
            key: "notifications.signing_secret",
            env_key: Some("EXPENSA_NOTIFICATIONS_SIGNING_SECRET"),
            value: signing_secret.to_string(),
        },
        Field {
            key: "logging.level",
            env_key: Some("EXPENSA_LOGGING_LEVEL"),
            value: config.logging.level.clone(),
        },
        Field {
            key: "logging.format",
            env_key: Some("EXPENSA_LOGGING_FORMAT"),
            value: format!("{:?}", config.logging.format),
        },
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("expensa.toml"), PathBuf::from("config/expensa.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    field: &Field,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = field.env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, field.key) {
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
    use toml::Value;

    use super::{contains_path, field_source, Field};

    #[test]
    fn nested_keys_are_found_in_config_documents() {
        let doc: Value = "[currency.rates]\nEUR = \"0.9\"\n".parse().expect("toml");
        assert!(contains_path(&doc, "currency.rates"));
        assert!(!contains_path(&doc, "currency.pivot"));
    }

    #[test]
    fn file_source_names_the_file() {
        let doc: Value = "[server]\nport = 9000\n".parse().expect("toml");
        let field = Field { key: "server.port", env_key: None, value: "9000".to_string() };
        let source = field_source(&field, Some(&doc), Some(std::path::Path::new("expensa.toml")));
        assert_eq!(source, "file (expensa.toml)");

        let missing = Field { key: "server.bind_address", env_key: None, value: String::new() };
        assert_eq!(field_source(&missing, Some(&doc), None), "default");
    }
}
