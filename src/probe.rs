use std::{
    sync::{
        Arc,
        mpsc::{self, Receiver, RecvTimeoutError},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use headless_chrome::protocol::cdp::{Page, types::Event};
use headless_chrome::{Browser, Tab};
use tracing::{debug, info, warn};

use crate::error::HarnessError;
use crate::fixture::MutationStamp;

/// Page-side observation seam. The harness sequences against this trait so
/// the measurement order can be exercised with a double.
pub trait Probe {
    /// Open an isolated page, navigate, and resolve when the load event
    /// fires. Returns the load duration in milliseconds.
    fn measure_load(&mut self, url: &str, timeout: Duration) -> Result<u64, HarnessError>;

    /// Wait for a console message containing `marker`. Prefers the in-page
    /// epoch timestamp embedded in the message (it reflects the page clock
    /// at the moment the mutated code executed); falls back to host-side
    /// elapsed time since the mutation was written.
    fn wait_for_signal(
        &mut self,
        marker: &str,
        stamp: &MutationStamp,
        timeout: Duration,
    ) -> Result<u64, HarnessError>;

    /// Close the current page, bounding resource usage across the loop.
    fn close_page(&mut self);
}

/// Console observation over a shared headless Chromium instance. One page is
/// active at a time; the browser itself lives for the whole run.
pub struct BrowserProbe {
    browser: Browser,
    tab: Option<Arc<Tab>>,
    console: Option<Receiver<String>>,
}

impl BrowserProbe {
    pub fn launch() -> Result<Self> {
        let browser = Browser::default().context("Failed to launch headless browser")?;
        info!("headless browser ready");
        Ok(Self {
            browser,
            tab: None,
            console: None,
        })
    }

    /// Render the given HTML in a disposable tab and screenshot it. Used by
    /// the reporter for the results chart; never part of measurement.
    pub fn capture_html(&self, html: &str, settle: Duration) -> Result<Vec<u8>> {
        let tab = self
            .browser
            .new_tab()
            .context("Failed to open chart tab")?;
        let url = format!("data:text/html;base64,{}", BASE64.encode(html));
        tab.navigate_to(&url)
            .and_then(|tab| tab.wait_until_navigated())
            .context("Failed to render chart page")?;
        // Let the charting script finish drawing the canvas.
        thread::sleep(settle);
        let image = tab
            .capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, None, true)
            .context("Failed to capture chart screenshot")?;
        let _ = tab.close(true);
        Ok(image)
    }
}

impl Probe for BrowserProbe {
    fn measure_load(&mut self, url: &str, timeout: Duration) -> Result<u64, HarnessError> {
        self.close_page();

        let tab = self.browser.new_tab().map_err(|err| {
            warn!(error = %err, "failed to open page");
            HarnessError::NavigationTimeout {
                url: url.into(),
                timeout_ms: timeout.as_millis() as u64,
            }
        })?;
        tab.set_default_timeout(timeout);

        let (tx, rx) = mpsc::channel();
        let listener_result = tab.enable_runtime().and_then(|tab| {
            tab.add_event_listener(Arc::new(move |event: &Event| {
                if let Event::RuntimeConsoleAPICalled(event) = event {
                    let text = event
                        .params
                        .args
                        .iter()
                        .filter_map(|arg| arg.value.as_ref())
                        .map(|value| match value {
                            serde_json::Value::String(text) => text.clone(),
                            other => other.to_string(),
                        })
                        .collect::<Vec<_>>()
                        .join(" ");
                    let _ = tx.send(text);
                }
            }))
            .map(|_| ())
        });
        if let Err(err) = listener_result {
            warn!(error = %err, "failed to attach console listener");
        }

        let started = Instant::now();
        let navigated = tab
            .navigate_to(url)
            .and_then(|tab| tab.wait_until_navigated());
        if let Err(err) = navigated {
            debug!(url, error = %err, "navigation failed");
            let _ = tab.close(true);
            return Err(HarnessError::NavigationTimeout {
                url: url.into(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        let duration_ms = started.elapsed().as_millis() as u64;

        self.tab = Some(tab);
        self.console = Some(rx);
        info!(url, duration_ms, "page loaded");
        Ok(duration_ms)
    }

    fn wait_for_signal(
        &mut self,
        marker: &str,
        stamp: &MutationStamp,
        timeout: Duration,
    ) -> Result<u64, HarnessError> {
        let timeout_ms = timeout.as_millis() as u64;
        let Some(console) = self.console.as_ref() else {
            return Err(HarnessError::ConsoleTimeout {
                marker: marker.into(),
                timeout_ms,
            });
        };

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(HarnessError::ConsoleTimeout {
                    marker: marker.into(),
                    timeout_ms,
                });
            }
            match console.recv_timeout(remaining) {
                Ok(text) if text.contains(marker) => {
                    let duration_ms = signal_duration(&text, stamp);
                    info!(marker, duration_ms, "console signal observed");
                    return Ok(duration_ms);
                }
                Ok(other) => debug!(text = %other, "unrelated console message"),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return Err(HarnessError::ConsoleTimeout {
                        marker: marker.into(),
                        timeout_ms,
                    });
                }
            }
        }
    }

    fn close_page(&mut self) {
        self.console = None;
        if let Some(tab) = self.tab.take() {
            if let Err(err) = tab.close(true) {
                debug!(error = %err, "page close failed");
            }
        }
    }
}

/// Duration for a matched console marker: the embedded page-clock timestamp
/// when present and plausible, otherwise host-side elapsed time.
fn signal_duration(text: &str, stamp: &MutationStamp) -> u64 {
    let embedded = text
        .split_whitespace()
        .last()
        .and_then(|token| token.parse::<i64>().ok());
    match embedded {
        Some(page_ms) if page_ms >= stamp.epoch_ms => (page_ms - stamp.epoch_ms) as u64,
        _ => stamp.written_at.elapsed().as_millis() as u64,
    }
}
