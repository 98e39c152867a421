use std::path::PathBuf;
use std::time::Duration;

use opsdash_storage::{ClassifierConfig, RateLimit};

/// Knobs for one processing run.
#[derive(Debug, Clone)]
pub struct ProcessingSettings {
    /// Records per classifier request.
    pub batch_size: usize,
    /// Classifier requests in flight at once for one run.
    pub max_in_flight: usize,
    /// Failures after which a record is terminally failed.
    pub max_retries: u32,
    /// Wall-clock budget for the classification phase.
    pub budget: Duration,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_in_flight: 4,
            max_retries: 3,
            budget: Duration::from_secs(240),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub api_token: Option<String>,
    pub classifier_url: Option<String>,
    pub classifier_key: Option<String>,
    /// Requests per minute allowed against the classifier; unlimited when unset.
    pub classifier_rate_per_minute: Option<u32>,
    pub processing: ProcessingSettings,
    pub scheduler_enabled: bool,
    pub process_cron: String,
    pub web_port: u16,
    pub workspace_root: PathBuf,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = ProcessingSettings::default();
        Self {
            data_dir: std::env::var("OPSDASH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            api_token: non_empty_var("OPSDASH_API_TOKEN"),
            classifier_url: non_empty_var("OPSDASH_CLASSIFIER_URL"),
            classifier_key: non_empty_var("OPSDASH_CLASSIFIER_KEY"),
            classifier_rate_per_minute: parsed_var::<u32>("OPSDASH_CLASSIFIER_RATE_PER_MINUTE")
                .filter(|rate| *rate > 0),
            processing: ProcessingSettings {
                batch_size: parsed_var("OPSDASH_BATCH_SIZE").unwrap_or(defaults.batch_size).max(1),
                max_in_flight: parsed_var("OPSDASH_MAX_IN_FLIGHT")
                    .unwrap_or(defaults.max_in_flight)
                    .max(1),
                max_retries: parsed_var("OPSDASH_MAX_RETRIES").unwrap_or(defaults.max_retries),
                budget: parsed_var("OPSDASH_PROCESS_BUDGET_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.budget),
            },
            scheduler_enabled: std::env::var("OPSDASH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            process_cron: std::env::var("OPSDASH_PROCESS_CRON")
                .unwrap_or_else(|_| "15 * * * *".to_string()),
            web_port: parsed_var("OPSDASH_WEB_PORT").unwrap_or(8000),
            workspace_root: std::env::var("OPSDASH_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

impl AppConfig {
    /// Client settings for the configured classifier endpoint, if any.
    pub fn classifier_config(&self) -> Option<ClassifierConfig> {
        let url = self.classifier_url.as_ref()?;
        let mut config = ClassifierConfig::new(url.clone());
        config.api_key = self.classifier_key.clone();
        config.user_agent = Some(format!("opsdash/{}", env!("CARGO_PKG_VERSION")));
        config.rate_limit = self.classifier_rate_per_minute.map(|requests| RateLimit {
            requests,
            per: Duration::from_secs(60),
        });
        Some(config)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_defaults_are_bounded() {
        let settings = ProcessingSettings::default();
        assert_eq!(settings.batch_size, 10);
        assert_eq!(settings.max_in_flight, 4);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.budget, Duration::from_secs(240));
    }

    fn config() -> AppConfig {
        AppConfig {
            data_dir: PathBuf::from("./data"),
            api_token: None,
            classifier_url: None,
            classifier_key: None,
            classifier_rate_per_minute: None,
            processing: ProcessingSettings::default(),
            scheduler_enabled: false,
            process_cron: "15 * * * *".to_string(),
            web_port: 8000,
            workspace_root: PathBuf::from("."),
        }
    }

    #[test]
    fn classifier_client_carries_key_and_rate_limit() {
        assert!(config().classifier_config().is_none());

        let app = AppConfig {
            classifier_url: Some("http://classifier.local/v1/classify".to_string()),
            classifier_key: Some("secret".to_string()),
            classifier_rate_per_minute: Some(30),
            ..config()
        };
        let client = app.classifier_config().unwrap();
        assert_eq!(client.api_key.as_deref(), Some("secret"));
        assert_eq!(
            client.rate_limit,
            Some(RateLimit {
                requests: 30,
                per: Duration::from_secs(60)
            })
        );

        let unlimited = AppConfig {
            classifier_rate_per_minute: None,
            ..app
        };
        assert!(unlimited.classifier_config().unwrap().rate_limit.is_none());
    }
}
