use async_trait::async_trait;
use thiserror::Error;

use super::selectors::Selector;
use crate::banks::Bank;
use crate::error::SyncError;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("element not found: {0}")]
    NotFound(String),
    #[error("browser automation failed: {0}")]
    Automation(String),
}

/// The seam between session logic and the machinery that actually moves
/// a browser. Sessions own their driver exclusively and close it on
/// every exit path, success or not.
#[async_trait]
pub trait BrowserDriver: Send {
    async fn goto(&mut self, url: &str) -> Result<(), DriverError>;

    async fn is_visible(&mut self, selector: &Selector) -> Result<bool, DriverError>;

    async fn fill(&mut self, selector: &Selector, value: &str) -> Result<(), DriverError>;

    async fn click(&mut self, selector: &Selector) -> Result<(), DriverError>;

    async fn text_of(&mut self, selector: &Selector) -> Result<String, DriverError>;

    /// Run a script in the page. Used to strip consent overlays that
    /// intercept clicks.
    async fn evaluate(&mut self, script: &str) -> Result<(), DriverError>;

    /// Click the trigger and capture the bytes of the file the page
    /// offers for download.
    async fn download(&mut self, trigger: &Selector) -> Result<Vec<u8>, DriverError>;

    /// Current page URL, best effort. Diagnostics only.
    async fn location(&mut self) -> String;

    /// Accessible names of the controls currently on screen, best
    /// effort. Diagnostics only.
    async fn visible_controls(&mut self) -> Vec<String>;

    async fn close(&mut self);
}

#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn launch(&self, bank: Bank) -> Result<Box<dyn BrowserDriver>, SyncError>;
}
