use anyhow::Result;
use dialoguer::{theme::ColorfulTheme, Confirm, Input, Password};

pub fn prompt(prompt: &str) -> Result<String> {
    Ok(Input::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .interact()?)
}

/// Prompt without echoing. Anything credential-shaped goes through here.
pub fn prompt_password(prompt: &str) -> Result<String> {
    Ok(Password::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .interact()?)
}

pub fn confirm(prompt: &str, default: bool) -> Result<bool> {
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(default)
        .interact()?)
}

const INDENT_SIZE: usize = 2;

pub struct BulletPointPrinter {
    nesting: usize,
}

impl BulletPointPrinter {
    pub fn new() -> Self {
        Self { nesting: 0 }
    }

    pub fn print_item(&self, message: impl std::fmt::Display) {
        let indent = " ".repeat(self.nesting * INDENT_SIZE);
        println!("{indent}• {message}");
    }

    pub fn indent(&self) -> Self {
        Self {
            nesting: self.nesting + 1,
        }
    }
}

impl Default for BulletPointPrinter {
    fn default() -> Self {
        Self::new()
    }
}
