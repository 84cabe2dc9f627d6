//! Scriptable in-memory driver for exercising session logic without a
//! browser.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::driver::{BrowserDriver, DriverError, DriverFactory};
use super::selectors::Selector;
use crate::banks::Bank;
use crate::error::SyncError;

pub(crate) struct FakeDriver {
    /// Selector display substrings reported as not visible.
    pub hidden: Vec<&'static str>,
    /// Every element lookup pends forever. Drives timeout and
    /// cancellation paths.
    pub hang_lookups: bool,
    /// Bytes handed out for any download.
    pub export: &'static str,
    /// Returned by `text_of` for any selector.
    pub pinpad_text: &'static str,
    /// URLs reported by successive `location()` calls; the last goto
    /// target is reported once the queue runs dry.
    pub locations: VecDeque<String>,
    current_location: String,
    pub clicks: Arc<Mutex<Vec<String>>>,
    pub closed: Arc<AtomicBool>,
}

impl FakeDriver {
    /// A portal where everything is where the flow expects it: banners
    /// and error markers hidden, every needed control visible.
    pub fn happy(export: &'static str) -> Self {
        Self {
            hidden: vec!["onetrust", "didomi", "Acceso seguro", "error"],
            hang_lookups: false,
            export,
            pinpad_text: "posiciones 1, 2 y 3",
            locations: VecDeque::new(),
            current_location: String::new(),
            clicks: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn goto(&mut self, url: &str) -> Result<(), DriverError> {
        self.current_location = url.to_string();
        Ok(())
    }

    async fn is_visible(&mut self, selector: &Selector) -> Result<bool, DriverError> {
        if self.hang_lookups {
            std::future::pending::<()>().await;
        }
        let display = selector.to_string();
        Ok(!self.hidden.iter().any(|hidden| display.contains(hidden)))
    }

    async fn fill(&mut self, _selector: &Selector, _value: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn click(&mut self, selector: &Selector) -> Result<(), DriverError> {
        self.clicks.lock().unwrap().push(selector.to_string());
        Ok(())
    }

    async fn text_of(&mut self, _selector: &Selector) -> Result<String, DriverError> {
        Ok(self.pinpad_text.to_string())
    }

    async fn evaluate(&mut self, _script: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn download(&mut self, trigger: &Selector) -> Result<Vec<u8>, DriverError> {
        self.clicks.lock().unwrap().push(trigger.to_string());
        Ok(self.export.as_bytes().to_vec())
    }

    async fn location(&mut self) -> String {
        if let Some(next) = self.locations.pop_front() {
            self.current_location = next;
        }
        self.current_location.clone()
    }

    async fn visible_controls(&mut self) -> Vec<String> {
        vec!["Inicio".to_string(), "Salir".to_string()]
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Factory that hands out pre-scripted drivers and counts launches.
pub(crate) struct FakeDriverFactory {
    pub export: &'static str,
    pub launches: Arc<Mutex<Vec<Bank>>>,
}

impl FakeDriverFactory {
    pub fn new(export: &'static str) -> Self {
        Self {
            export,
            launches: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }
}

#[async_trait]
impl DriverFactory for FakeDriverFactory {
    async fn launch(&self, bank: Bank) -> Result<Box<dyn BrowserDriver>, SyncError> {
        self.launches.lock().unwrap().push(bank);
        Ok(Box::new(FakeDriver::happy(self.export)))
    }
}
