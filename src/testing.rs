//! Scripted in-memory browser for tests

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use tokio::time::{Instant, sleep};

use crate::error::{Result, ScrapeError};
use crate::traits::{BrowserLauncher, BrowserSession, PageHandle};

#[derive(Debug, Clone)]
enum Response {
    Html(String),
    Broken,
    Hang,
}

#[derive(Default)]
struct State {
    pages: HashMap<String, Response>,
    failures_left: HashMap<String, u32>,
    visits: HashMap<String, u32>,
    pages_opened: usize,
    pages_closed: usize,
    browsers_launched: usize,
    browsers_closed: usize,
    open_pages: usize,
    max_open_pages: usize,
    launch_times: Vec<Instant>,
    close_times: Vec<Instant>,
    latency: Duration,
    launch_hangs: bool,
}

/// A fake web: URL to scripted response, plus counters for assertions.
#[derive(Clone, Default)]
pub struct FakeWeb {
    state: Arc<Mutex<State>>,
}

impl FakeWeb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(self, url: &str, html: &str) -> Self {
        self.with(|s| {
            s.pages.insert(url.to_string(), Response::Html(html.to_string()));
        })
    }

    pub fn broken(self, url: &str) -> Self {
        self.with(|s| {
            s.pages.insert(url.to_string(), Response::Broken);
        })
    }

    pub fn hanging(self, url: &str) -> Self {
        self.with(|s| {
            s.pages.insert(url.to_string(), Response::Hang);
        })
    }

    /// Serves `html` only after `failures` failed navigations.
    pub fn flaky(self, url: &str, html: &str, failures: u32) -> Self {
        self.page(url, html).with(|s| {
            s.failures_left.insert(url.to_string(), failures);
        })
    }

    /// Every successful navigation takes `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.with(|s| s.latency = latency)
    }

    /// Browser launches never complete.
    pub fn hanging_launch(self) -> Self {
        self.with(|s| s.launch_hangs = true)
    }

    pub fn visits(&self, url: &str) -> u32 {
        self.read(|s| s.visits.get(url).copied().unwrap_or(0))
    }

    pub fn pages_opened(&self) -> usize {
        self.read(|s| s.pages_opened)
    }

    pub fn pages_closed(&self) -> usize {
        self.read(|s| s.pages_closed)
    }

    pub fn browsers_launched(&self) -> usize {
        self.read(|s| s.browsers_launched)
    }

    pub fn browsers_closed(&self) -> usize {
        self.read(|s| s.browsers_closed)
    }

    /// Highest number of pages open at the same time.
    pub fn max_open_pages(&self) -> usize {
        self.read(|s| s.max_open_pages)
    }

    pub fn launch_times(&self) -> Vec<Instant> {
        self.read(|s| s.launch_times.clone())
    }

    pub fn close_times(&self) -> Vec<Instant> {
        self.read(|s| s.close_times.clone())
    }

    fn with(self, f: impl FnOnce(&mut State)) -> Self {
        self.with_ref(f);
        self
    }

    fn with_ref(&self, f: impl FnOnce(&mut State)) {
        f(&mut self.state.lock().unwrap());
    }

    fn read<T>(&self, f: impl FnOnce(&State) -> T) -> T {
        f(&self.state.lock().unwrap())
    }

    fn navigate(&self, url: &str) -> Option<Response> {
        let mut state = self.state.lock().unwrap();
        *state.visits.entry(url.to_string()).or_default() += 1;

        if let Some(left) = state.failures_left.get_mut(url)
            && *left > 0
        {
            *left -= 1;
            return Some(Response::Broken);
        }
        state.pages.get(url).cloned()
    }
}

#[async_trait]
impl BrowserLauncher for FakeWeb {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>> {
        if self.read(|s| s.launch_hangs) {
            sleep(Duration::from_secs(3600)).await;
        }
        self.with_ref(|s| {
            s.browsers_launched += 1;
            s.launch_times.push(Instant::now());
        });
        Ok(Box::new(FakeSession { web: self.clone() }))
    }
}

struct FakeSession {
    web: FakeWeb,
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn new_page(&self) -> Result<Box<dyn PageHandle>> {
        self.web.with_ref(|s| {
            s.pages_opened += 1;
            s.open_pages += 1;
            s.max_open_pages = s.max_open_pages.max(s.open_pages);
        });
        Ok(Box::new(FakePage {
            web: self.web.clone(),
            url: String::new(),
            html: String::new(),
        }))
    }

    async fn close(&mut self) -> Result<()> {
        self.web.with_ref(|s| {
            s.browsers_closed += 1;
            s.close_times.push(Instant::now());
        });
        Ok(())
    }
}

struct FakePage {
    web: FakeWeb,
    url: String,
    html: String,
}

fn has_match(html: &str, selector: &str) -> bool {
    let Ok(selector) = Selector::parse(selector) else {
        return false;
    };
    Html::parse_document(html).select(&selector).next().is_some()
}

#[async_trait]
impl PageHandle for FakePage {
    async fn block_requests(&mut self, _patterns: &[String]) -> Result<()> {
        Ok(())
    }

    async fn goto(&mut self, url: &str, limit: Duration) -> Result<()> {
        self.url = url.to_string();
        match self.web.navigate(url) {
            Some(Response::Html(html)) => {
                let latency = self.web.read(|s| s.latency);
                if !latency.is_zero() {
                    sleep(latency).await;
                }
                self.html = html;
                Ok(())
            }
            Some(Response::Hang) => {
                sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            Some(Response::Broken) | None => Err(ScrapeError::NavigationTimeout {
                url: url.to_string(),
                seconds: limit.as_secs(),
            }),
        }
    }

    async fn wait_for_selector(&mut self, selector: &str, _limit: Duration) -> Result<()> {
        if has_match(&self.html, selector) {
            Ok(())
        } else {
            Err(ScrapeError::ElementNotFound {
                selector: selector.to_string(),
                url: self.url.clone(),
            })
        }
    }

    async fn content(&mut self) -> Result<String> {
        Ok(self.html.clone())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.web.with_ref(|s| {
            s.pages_closed += 1;
            s.open_pages -= 1;
        });
        Ok(())
    }
}
