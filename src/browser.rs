//! Headless Chromium implementation of the browser seams

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::SetBlockedUrLsParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::{Result, ScrapeError};
use crate::traits::{BrowserLauncher, BrowserSession, PageHandle};

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const SELECTOR_POLL: Duration = Duration::from_millis(250);

/// Calls `check` every `interval` until it returns true or `limit` elapses.
async fn poll_until<F, Fut>(limit: Duration, interval: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polling = async {
        while !check().await {
            sleep(interval).await;
        }
    };
    timeout(limit, polling).await.is_ok()
}

/// Launches one headless Chromium per client scrape.
#[derive(Debug, Clone, Default)]
pub struct ChromiumLauncher {
    executable: Option<PathBuf>,
}

impl ChromiumLauncher {
    pub fn new(executable: Option<PathBuf>) -> Self {
        Self { executable }
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-setuid-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .arg(format!("--user-agent={USER_AGENT}"));

        if let Some(path) = &self.executable {
            builder = builder.chrome_executable(path);
        }

        let config = builder.build().map_err(ScrapeError::Browser)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| ScrapeError::Browser(format!("launch failed: {e}")))?;

        let handler = tokio::spawn(async move { while handler.next().await.is_some() {} });

        info!("Launched headless browser");
        Ok(Box::new(ChromiumSession { browser, handler }))
    }
}

pub struct ChromiumSession {
    browser: Browser,
    handler: JoinHandle<()>,
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn new_page(&self) -> Result<Box<dyn PageHandle>> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(ScrapeError::browser)?;
        Ok(Box::new(ChromiumPage { page }))
    }

    async fn close(&mut self) -> Result<()> {
        let closed = self.browser.close().await.map_err(ScrapeError::browser);
        if let Err(e) = self.browser.wait().await {
            warn!("Browser process did not exit cleanly: {}", e);
        }
        self.handler.abort();
        debug!("Browser closed");
        closed.map(|_| ())
    }
}

pub struct ChromiumPage {
    page: Page,
}

#[async_trait]
impl PageHandle for ChromiumPage {
    async fn block_requests(&mut self, patterns: &[String]) -> Result<()> {
        self.page
            .execute(SetBlockedUrLsParams::new(patterns.to_vec()))
            .await
            .map_err(ScrapeError::browser)?;
        Ok(())
    }

    async fn goto(&mut self, url: &str, limit: Duration) -> Result<()> {
        let navigation = async {
            self.page.goto(url).await?;
            self.page.wait_for_navigation().await?;
            Ok::<_, chromiumoxide::error::CdpError>(())
        };

        match timeout(limit, navigation).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ScrapeError::Browser(format!("navigation to {url} failed: {e}"))),
            Err(_) => Err(ScrapeError::NavigationTimeout {
                url: url.to_string(),
                seconds: limit.as_secs(),
            }),
        }
    }

    async fn wait_for_selector(&mut self, selector: &str, limit: Duration) -> Result<()> {
        let page = &self.page;
        let found = poll_until(limit, SELECTOR_POLL, || async move {
            page.find_element(selector).await.is_ok()
        })
        .await;

        if found {
            return Ok(());
        }

        let url = self.page.url().await.ok().flatten().unwrap_or_default();
        Err(ScrapeError::ElementNotFound {
            selector: selector.to_string(),
            url,
        })
    }

    async fn content(&mut self) -> Result<String> {
        self.page.content().await.map_err(ScrapeError::browser)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.page.close().await.map_err(ScrapeError::browser)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn polling_succeeds_once_check_passes() {
        let calls = AtomicU32::new(0);

        let found = poll_until(Duration::from_secs(5), SELECTOR_POLL, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { n >= 2 }
        })
        .await;

        assert!(found);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_gives_up_after_limit() {
        let started = tokio::time::Instant::now();

        let found = poll_until(Duration::from_secs(2), SELECTOR_POLL, || async { false }).await;

        assert!(!found);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_limit_does_not_overflow() {
        let found = poll_until(Duration::MAX, SELECTOR_POLL, || async { true }).await;
        assert!(found);
    }
}
