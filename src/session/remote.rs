use async_trait::async_trait;
use httpclient::{Client, InMemoryResponseExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::driver::{BrowserDriver, DriverError, DriverFactory};
use super::selectors::Selector;
use crate::banks::Bank;
use crate::error::SyncError;

/// Launches browser sessions on the automation sidecar, the hardened
/// browser host that runs the actual pages. Keeping the browser out of
/// process means a wedged portal page can never take the sync loop down
/// with it.
pub struct RemoteDriverFactory {
    base_url: String,
}

impl RemoteDriverFactory {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait]
impl DriverFactory for RemoteDriverFactory {
    async fn launch(&self, bank: Bank) -> Result<Box<dyn BrowserDriver>, SyncError> {
        log::info!("Launching browser session for {bank}...");
        let http = Arc::new(Client::new().base_url(&self.base_url));
        let response: LaunchResponse = post(
            &http,
            "/sessions",
            &LaunchRequest {
                profile: bank.id().to_string(),
            },
        )
        .await
        .map_err(|err| SyncError::Transient(format!("sidecar launch failed: {err}")))?;
        log::info!("Launching browser session for {bank}...done");
        Ok(Box::new(RemoteDriver {
            http,
            session_id: response.session_id,
        }))
    }
}

/// One browser session on the sidecar. Every method is a command POST
/// against the session resource.
pub struct RemoteDriver {
    http: Arc<Client>,
    session_id: String,
}

impl RemoteDriver {
    async fn command<Response: serde::de::DeserializeOwned>(
        &self,
        command: Command<'_>,
    ) -> Result<Response, DriverError> {
        let path = format!("/sessions/{}/commands", self.session_id);
        post(&self.http, &path, &command).await
    }
}

async fn post<Request: Serialize, Response: serde::de::DeserializeOwned>(
    http: &Client,
    path: &str,
    request: &Request,
) -> Result<Response, DriverError> {
    let body = serde_json::to_value(request)
        .map_err(|err| DriverError::Automation(format!("request encoding failed: {err}")))?;
    let response = http
        .post(path)
        .json(body)
        .await
        .map_err(|err| DriverError::Automation(err.to_string()))?;
    response
        .json()
        .map_err(|err| DriverError::Automation(format!("response decoding failed: {err}")))
}

// Wire contract of the sidecar. The sidecar reports missing elements as
// `"error": "not_found"` so flows can tell a missing control from a
// broken browser.

#[derive(Serialize)]
struct LaunchRequest {
    profile: String,
}

#[derive(Deserialize)]
struct LaunchResponse {
    session_id: String,
}

#[derive(Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum Command<'a> {
    Goto {
        url: &'a str,
    },
    IsVisible {
        selector: &'a Selector,
    },
    Fill {
        selector: &'a Selector,
        value: &'a str,
    },
    Click {
        selector: &'a Selector,
    },
    TextOf {
        selector: &'a Selector,
    },
    Evaluate {
        script: &'a str,
    },
    Download {
        trigger: &'a Selector,
    },
    Location,
    VisibleControls,
    Close,
}

#[derive(Deserialize)]
struct CommandResponse<T> {
    #[serde(default)]
    error: Option<String>,
    result: Option<T>,
}

impl<T> CommandResponse<T> {
    fn into_result(self, selector: impl Fn() -> String) -> Result<T, DriverError> {
        match (self.error, self.result) {
            (Some(error), _) if error == "not_found" => Err(DriverError::NotFound(selector())),
            (Some(error), _) => Err(DriverError::Automation(error)),
            (None, Some(result)) => Ok(result),
            (None, None) => Err(DriverError::Automation(
                "sidecar returned neither result nor error".to_string(),
            )),
        }
    }
}

#[derive(Deserialize)]
struct Empty {}

#[async_trait]
impl BrowserDriver for RemoteDriver {
    async fn goto(&mut self, url: &str) -> Result<(), DriverError> {
        let response: CommandResponse<Empty> = self.command(Command::Goto { url }).await?;
        response.into_result(|| url.to_string()).map(|_| ())
    }

    async fn is_visible(&mut self, selector: &Selector) -> Result<bool, DriverError> {
        let response: CommandResponse<bool> = self.command(Command::IsVisible { selector }).await?;
        response.into_result(|| selector.to_string())
    }

    async fn fill(&mut self, selector: &Selector, value: &str) -> Result<(), DriverError> {
        let response: CommandResponse<Empty> =
            self.command(Command::Fill { selector, value }).await?;
        response.into_result(|| selector.to_string()).map(|_| ())
    }

    async fn click(&mut self, selector: &Selector) -> Result<(), DriverError> {
        let response: CommandResponse<Empty> = self.command(Command::Click { selector }).await?;
        response.into_result(|| selector.to_string()).map(|_| ())
    }

    async fn text_of(&mut self, selector: &Selector) -> Result<String, DriverError> {
        let response: CommandResponse<String> = self.command(Command::TextOf { selector }).await?;
        response.into_result(|| selector.to_string())
    }

    async fn evaluate(&mut self, script: &str) -> Result<(), DriverError> {
        let response: CommandResponse<Empty> = self.command(Command::Evaluate { script }).await?;
        response.into_result(|| script.to_string()).map(|_| ())
    }

    async fn download(&mut self, trigger: &Selector) -> Result<Vec<u8>, DriverError> {
        // Exports are text grids, so the sidecar ships them as a string.
        let response: CommandResponse<String> =
            self.command(Command::Download { trigger }).await?;
        response
            .into_result(|| trigger.to_string())
            .map(String::into_bytes)
    }

    async fn location(&mut self) -> String {
        let response: Result<CommandResponse<String>, DriverError> =
            self.command(Command::Location).await;
        response
            .ok()
            .and_then(|response| response.result)
            .unwrap_or_default()
    }

    async fn visible_controls(&mut self) -> Vec<String> {
        let response: Result<CommandResponse<Vec<String>>, DriverError> =
            self.command(Command::VisibleControls).await;
        response
            .ok()
            .and_then(|response| response.result)
            .unwrap_or_default()
    }

    async fn close(&mut self) {
        let response: Result<CommandResponse<Empty>, DriverError> =
            self.command(Command::Close).await;
        if let Err(err) = response {
            log::warn!("Closing browser session failed: {err}");
        }
    }
}
