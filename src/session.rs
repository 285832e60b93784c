//! Browser sessions.
//!
//! Every worker owns exactly one [`Session`]. Sessions are started through
//! a [`SessionManager`], which keeps a handle to each live session so that
//! [`SessionManager::shutdown_all`] can terminate whatever a failed or
//! panicked worker left behind.

use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thirtyfour::prelude::*;
use thirtyfour::{CapabilitiesHelper, ChromiumLikeCapabilities};
use tracing::{info, warn};

use crate::config::{BrowserConfig, SiteConfig};

/// Chrome flags every session starts with.
const CHROME_ARGS: &[&str] = &[
    // TLS failures on the target site must not stall navigation.
    "--ignore-certificate-errors",
    "--ignore-ssl-errors",
    "--ignore-urlfetcher-cert-requests",
    "--allow-insecure-localhost",
    "--ignore-certificate-errors-spki-list",
    // No native popups or notification prompts.
    "--disable-notifications",
    "--disable-popup-blocking",
    "--log-level=3",
];

const HIDE_WEBDRIVER_FLAG: &str =
    "Object.defineProperty(navigator, 'webdriver', {get: () => undefined})";

/// A live browser session owned by one worker.
pub struct Session {
    worker: usize,
    driver: WebDriver,
}

impl Session {
    pub fn driver(&self) -> &WebDriver {
        &self.driver
    }
}

/// Starts sessions and guarantees they are all terminated.
#[derive(Clone)]
pub struct SessionManager {
    browser: BrowserConfig,
    root_url: String,
    live: Arc<Mutex<Vec<(usize, WebDriver)>>>,
}

impl SessionManager {
    pub fn new(browser: &BrowserConfig, site: &SiteConfig) -> Self {
        Self {
            browser: browser.clone(),
            root_url: site.root_url.clone(),
            live: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Launch a browser for `worker`, warm up its cookies on the site root
    /// and let the site's bot heuristics settle.
    pub async fn start(&self, worker: usize) -> Result<Session> {
        let mut caps = DesiredCapabilities::chrome();
        for arg in CHROME_ARGS {
            caps.add_arg(arg)?;
        }
        if self.browser.headless {
            caps.add_arg("--headless")?;
        }
        caps.accept_insecure_certs(true)?;

        let driver = WebDriver::new(self.browser.webdriver_url.as_str(), caps)
            .await
            .with_context(|| {
                format!(
                    "Failed to start browser session at {}",
                    self.browser.webdriver_url
                )
            })?;
        self.register(worker, &driver);

        driver.goto(self.root_url.as_str()).await?;
        driver.execute(HIDE_WEBDRIVER_FLAG, Vec::new()).await?;
        tokio::time::sleep(Duration::from_secs(self.browser.warmup_secs)).await;

        info!(worker, "browser session connected");
        Ok(Session { worker, driver })
    }

    /// Terminate `session` and forget it.
    pub async fn release(&self, session: Session) -> Result<()> {
        self.unregister(session.worker);
        session
            .driver
            .quit()
            .await
            .with_context(|| format!("Failed to quit browser session of worker {}", session.worker))?;
        info!(worker = session.worker, "browser session closed");
        Ok(())
    }

    /// Terminate every session that was started but not released.
    pub async fn shutdown_all(&self) {
        let leftover: Vec<(usize, WebDriver)> = match self.live.lock() {
            Ok(mut live) => live.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for (worker, driver) in leftover {
            warn!(worker, "closing browser session left open by worker");
            if let Err(e) = driver.quit().await {
                warn!(worker, error = %e, "failed to quit browser session");
            }
        }
    }

    fn register(&self, worker: usize, driver: &WebDriver) {
        let entry = (worker, driver.clone());
        match self.live.lock() {
            Ok(mut live) => live.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }

    fn unregister(&self, worker: usize) {
        match self.live.lock() {
            Ok(mut live) => live.retain(|(w, _)| *w != worker),
            Err(poisoned) => poisoned.into_inner().retain(|(w, _)| *w != worker),
        }
    }
}
