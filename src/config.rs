use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::locator::Locator;
use crate::models::{MatchPolicy, Regime, SearchMode};
use crate::search_spec::TreeTraversal;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub locator: Locator,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SiteConfig {
    #[serde(default = "default_root_url")]
    pub root_url: String,
    #[serde(default = "default_filter_url")]
    pub filter_url: String,
    /// Host suffix the regime-B detail links must land on.
    #[serde(default = "default_registry_domain")]
    pub registry_domain: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            root_url: default_root_url(),
            filter_url: default_filter_url(),
            registry_domain: default_registry_domain(),
        }
    }
}

fn default_root_url() -> String {
    "https://www.rts-tender.ru/".to_string()
}
fn default_filter_url() -> String {
    "https://www.rts-tender.ru/poisk/search?keywords=&isFilter=1".to_string()
}
fn default_registry_domain() -> String {
    "zakupki.gov.ru".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrowserConfig {
    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,
    #[serde(default = "default_headless")]
    pub headless: bool,
    #[serde(default = "default_warmup_secs")]
    pub warmup_secs: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            webdriver_url: default_webdriver_url(),
            headless: default_headless(),
            warmup_secs: default_warmup_secs(),
        }
    }
}

fn default_webdriver_url() -> String {
    "http://localhost:9515".to_string()
}
fn default_headless() -> bool {
    true
}
fn default_warmup_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_days")]
    pub days: u32,
    #[serde(default)]
    pub match_policy: MatchPolicy,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Quick-settings checkboxes ticked on every search.
    #[serde(default = "default_quick_settings")]
    pub quick_settings: Vec<String>,
    #[serde(default = "default_trade_platforms")]
    pub trade_platforms: Vec<String>,
    #[serde(default)]
    pub code_traversal: TreeTraversal,
    /// Retry codes the tree walk could not find through the autocomplete box.
    #[serde(default = "default_text_fallback")]
    pub text_fallback: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            days: default_days(),
            match_policy: MatchPolicy::default(),
            workers: default_workers(),
            quick_settings: default_quick_settings(),
            trade_platforms: default_trade_platforms(),
            code_traversal: TreeTraversal::default(),
            text_fallback: default_text_fallback(),
        }
    }
}

fn default_days() -> u32 {
    1
}
fn default_quick_settings() -> Vec<String> {
    [
        "Искать в файлах",
        "Точное соответствие",
        "Исключить совместные закупки",
        "Только МСП / СМП",
    ]
    .map(String::from)
    .to_vec()
}
fn default_trade_platforms() -> Vec<String> {
    vec!["РТС-тендер".to_string()]
}
fn default_workers() -> usize {
    4
}
fn default_text_fallback() -> bool {
    true
}

/// Bounds for every UI wait, in seconds unless noted.
#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutConfig {
    #[serde(default = "default_overlay_secs")]
    pub overlay_secs: u64,
    #[serde(default = "default_prepare_secs")]
    pub prepare_secs: u64,
    #[serde(default = "default_element_secs")]
    pub element_secs: u64,
    #[serde(default = "default_url_change_secs")]
    pub url_change_secs: u64,
    #[serde(default = "default_results_secs")]
    pub results_secs: u64,
    #[serde(default = "default_pager_secs")]
    pub pager_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            overlay_secs: default_overlay_secs(),
            prepare_secs: default_prepare_secs(),
            element_secs: default_element_secs(),
            url_change_secs: default_url_change_secs(),
            results_secs: default_results_secs(),
            pager_secs: default_pager_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn overlay(&self) -> Duration {
        Duration::from_secs(self.overlay_secs)
    }
    pub fn prepare(&self) -> Duration {
        Duration::from_secs(self.prepare_secs)
    }
    pub fn element(&self) -> Duration {
        Duration::from_secs(self.element_secs)
    }
    pub fn url_change(&self) -> Duration {
        Duration::from_secs(self.url_change_secs)
    }
    pub fn results(&self) -> Duration {
        Duration::from_secs(self.results_secs)
    }
    pub fn pager(&self) -> Duration {
        Duration::from_secs(self.pager_secs)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_overlay_secs() -> u64 {
    10
}
fn default_prepare_secs() -> u64 {
    30
}
fn default_element_secs() -> u64 {
    10
}
fn default_url_change_secs() -> u64 {
    10
}
fn default_results_secs() -> u64 {
    5
}
fn default_pager_secs() -> u64 {
    2
}
fn default_poll_interval_ms() -> u64 {
    250
}

/// Caps for the reload-and-retry loops.
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_fill_restarts")]
    pub fill_restarts: u32,
    #[serde(default = "default_page_retries")]
    pub page_retries: u32,
    #[serde(default = "default_detail_retries")]
    pub detail_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            fill_restarts: default_fill_restarts(),
            page_retries: default_page_retries(),
            detail_retries: default_detail_retries(),
        }
    }
}

fn default_fill_restarts() -> u32 {
    5
}
fn default_page_retries() -> u32 {
    3
}
fn default_detail_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One search task: an input file of criteria and the file new notices go to.
#[derive(Debug, Deserialize, Clone)]
pub struct TaskConfig {
    pub name: String,
    pub regime: Regime,
    #[serde(default)]
    pub mode: Option<SearchMode>,
    pub input: PathBuf,
    pub output: PathBuf,
}

impl Config {
    /// Tasks for `regime`, narrowed to `mode` when one is given.
    pub fn select_tasks(&self, regime: Regime, mode: Option<SearchMode>) -> Vec<&TaskConfig> {
        self.tasks
            .iter()
            .filter(|task| task.regime == regime)
            .filter(|task| mode.is_none() || task.mode == mode)
            .collect()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.search.workers == 0 {
        anyhow::bail!("search.workers must be >= 1");
    }

    if config.timeouts.poll_interval_ms == 0 {
        anyhow::bail!("timeouts.poll_interval_ms must be > 0");
    }

    if url::Url::parse(&config.site.filter_url).is_err() {
        anyhow::bail!("site.filter_url is not a valid URL: '{}'", config.site.filter_url);
    }

    let mut names = HashSet::new();
    for task in &config.tasks {
        if !names.insert(task.name.as_str()) {
            anyhow::bail!("Duplicate task name: '{}'", task.name);
        }
        if task.mode.is_none() {
            anyhow::bail!(
                "Task '{}' reads {} but has no mode; set mode = \"keywords\" or \"codes\"",
                task.name,
                task.input.display()
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = parse("[db]\npath = \"notices.sqlite\"\n").unwrap();
        assert_eq!(config.search.workers, 4);
        assert_eq!(config.search.days, 1);
        assert_eq!(config.search.match_policy, MatchPolicy::Any);
        assert_eq!(config.retry.fill_restarts, 5);
        assert_eq!(config.timeouts.pager(), Duration::from_secs(2));
        assert!(config.browser.headless);
        assert!(config.tasks.is_empty());
        assert_eq!(config.search.trade_platforms, vec!["РТС-тендер"]);
        assert_eq!(config.search.quick_settings.len(), 4);
        assert!(config
            .search
            .quick_settings
            .contains(&"Исключить совместные закупки".to_string()));
    }

    #[test]
    fn test_tasks_parse_and_select() {
        let config = parse(
            r#"
[db]
path = "notices.sqlite"

[[tasks]]
name = "kw44"
regime = "44"
mode = "keywords"
input = "in/kw.txt"
output = "out/kw44.txt"

[[tasks]]
name = "codes44"
regime = "44"
mode = "codes"
input = "in/codes.txt"
output = "out/codes44.txt"

[[tasks]]
name = "kw223"
regime = "223"
mode = "keywords"
input = "in/kw.txt"
output = "out/kw223.txt"
"#,
        )
        .unwrap();

        assert_eq!(config.select_tasks(Regime::A, None).len(), 2);
        let codes = config.select_tasks(Regime::A, Some(SearchMode::Codes));
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].name, "codes44");
        assert_eq!(config.select_tasks(Regime::B, None)[0].name, "kw223");
    }

    #[test]
    fn test_task_without_mode_is_rejected() {
        let err = parse(
            r#"
[db]
path = "notices.sqlite"

[[tasks]]
name = "broken"
regime = "44"
input = "in/kw.txt"
output = "out/kw.txt"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("has no mode"));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = parse("[db]\npath = \"n.sqlite\"\n[search]\nworkers = 0\n").unwrap_err();
        assert!(err.to_string().contains("workers"));
    }

    #[test]
    fn test_locator_override() {
        let config =
            parse("[db]\npath = \"n.sqlite\"\n[locator]\nsearch_button = \".go button\"\n").unwrap();
        assert_eq!(config.locator.search_button, ".go button");
        assert_eq!(config.locator.pager, Locator::default().pager);
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = parse(include_str!("../config/tw.example.toml")).unwrap();
        assert_eq!(config.tasks.len(), 4);
        assert_eq!(config.select_tasks(Regime::B, Some(SearchMode::Codes))[0].name, "codes223");
    }
}
