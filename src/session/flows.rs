//! Per-portal navigation flows, one function per bank family.
//!
//! Flows are deliberately declarative: each screen element is a [`Target`]
//! with lookup strategies in priority order, and the flow body is little
//! more than the sequence of interactions. All waiting, retrying and
//! cancellation lives in [`BankSession`].

use super::selectors::{Selector, Target};
use super::BankSession;
use crate::banks::Bank;
use crate::error::SyncError;
use crate::normalize::RawExport;
use crate::vault::Secret;

/// Removes fixed-position consent layers that intercept clicks.
const REMOVE_OVERLAYS_SCRIPT: &str = r##"
    for (const node of document.querySelectorAll(
        "#onetrust-banner-sdk, [id*='onetrust'], #didomi-host, [id*='didomi']"
    )) { node.remove(); }
    document.body.style.overflow = "auto";
"##;

/// Split a stored credential blob into its expected newline-separated
/// fields. A blob in the wrong shape can never log in, so it is reported
/// as an authentication failure without echoing any of its content.
fn credential_fields<'a>(
    secret: &'a Secret,
    expected: &[&str],
) -> Result<Vec<&'a str>, SyncError> {
    let fields: Vec<&str> = secret.reveal().lines().map(str::trim).collect();
    if fields.len() != expected.len() || fields.iter().any(|field| field.is_empty()) {
        log::warn!(
            "Stored credential does not have the expected fields ({})",
            expected.join(", "),
        );
        return Err(SyncError::Authentication);
    }
    Ok(fields)
}

const IBERCAJA_HOME: &str = "https://www.ibercaja.es/";

fn accept_cookies() -> Target {
    Target::new(
        "cookie accept button",
        vec![
            Selector::role("button", "Aceptar"),
            Selector::css("#onetrust-accept-btn-handler"),
        ],
    )
}

fn consent_overlay() -> Target {
    Target::new(
        "consent overlay",
        vec![
            Selector::css("#onetrust-banner-sdk"),
            Selector::css("[id*='onetrust']"),
        ],
    )
}

fn client_access() -> Target {
    Target::new(
        "client access link",
        vec![
            Selector::role("link", "Acceso clientes"),
            Selector::css("a[href*='login']"),
        ],
    )
}

fn identification_field() -> Target {
    Target::new(
        "identification code field",
        vec![
            Selector::role("textbox", "Código de identificación"),
            Selector::css("input[name='identificacion']"),
        ],
    )
}

fn access_key_field() -> Target {
    Target::new(
        "access key field",
        vec![
            Selector::role("textbox", "Clave de acceso"),
            Selector::css("input[type='password']"),
        ],
    )
}

fn enter_button() -> Target {
    // The accessible name really does start with a space on this portal.
    Target::new(
        "enter button",
        vec![
            Selector::role("button", " entrar"),
            Selector::css("button[type='submit']"),
        ],
    )
}

fn login_error_banner() -> Target {
    Target::new(
        "login error banner",
        vec![
            Selector::css("[class*='login-error']"),
            Selector::css(".error-message"),
        ],
    )
}

fn account_row() -> Target {
    Target::new(
        "account overview row",
        vec![
            Selector::css(".ui-table__row"),
            Selector::css("table tbody tr"),
        ],
    )
}

fn ibercaja_download_menu() -> Target {
    // The download control is an icon-font glyph with no text label.
    Target::new(
        "movement download menu",
        vec![
            Selector::role("button", "\u{e911}"),
            Selector::css("[class*='descargar']"),
        ],
    )
}

fn excel_entry() -> Target {
    Target::new(
        "excel download entry",
        vec![Selector::text("Excel"), Selector::css("[class*='excel']")],
    )
}

pub(super) async fn ibercaja(
    session: &mut BankSession,
    credential: &Secret,
) -> Result<RawExport, SyncError> {
    let fields = credential_fields(credential, &["identification code", "access key"])?;

    session.goto(IBERCAJA_HOME).await?;
    if session.click_if_present(&accept_cookies()).await? {
        log::debug!("Dismissed the cookie banner");
    }
    session.click(&client_access()).await?;
    session.fill(&identification_field(), fields[0]).await?;
    session.fill(&access_key_field(), fields[1]).await?;
    session.click(&enter_button()).await?;

    // The first screen after a good login is the account overview. If it
    // never shows up, check for the rejection banner before blaming the
    // markup.
    match session.wait_for(&account_row()).await {
        Ok(_) => {}
        Err(SyncError::Timeout(_)) if session.is_present(&login_error_banner()).await? => {
            return Err(SyncError::Authentication);
        }
        Err(err) => return Err(err),
    }
    session.mark_authenticated();
    session
        .dismiss_overlays(&consent_overlay(), REMOVE_OVERLAYS_SCRIPT)
        .await?;

    session.click(&account_row()).await?;
    session.mark_downloading();
    session.click(&ibercaja_download_menu()).await?;
    let bytes = session.download(&excel_entry()).await?;
    parse_export(session.bank(), &bytes)
}

const ING_LOGIN: &str = "https://ing.ingdirect.es/app-login/";
const ING_OVERVIEW_FRAGMENT: &str = "overall-position";

fn reject_cookies() -> Target {
    Target::new(
        "cookie reject button",
        vec![
            Selector::role("button", "Rechazarlas"),
            Selector::css("#didomi-notice-disagree-button"),
        ],
    )
}

fn didomi_overlay() -> Target {
    Target::new(
        "didomi overlay",
        vec![Selector::css("#didomi-host"), Selector::css("[id*='didomi']")],
    )
}

fn document_field() -> Target {
    Target::new(
        "document number field",
        vec![
            Selector::css("input[name='input_dni']"),
            Selector::role("textbox", "NIF/NIE/Pasaporte"),
        ],
    )
}

fn birth_field(part: &'static str, placeholder: &str) -> Target {
    Target::new(
        part,
        vec![
            Selector::css(&format!("input[placeholder='{placeholder}']")),
            Selector::css(&format!("input[name*='{}']", placeholder.to_lowercase())),
        ],
    )
}

fn continue_button() -> Target {
    Target::new(
        "continue button",
        vec![
            Selector::role("button", "Continuar"),
            Selector::role("button", "Entrar"),
        ],
    )
}

fn pinpad_positions() -> Target {
    Target::new(
        "pinpad position labels",
        vec![
            Selector::css("div.c-pinpad__secret-positions"),
            Selector::css("[class*='pinpad']"),
        ],
    )
}

fn pin_key(digit: char) -> Target {
    Target::new(
        "pinpad key",
        vec![
            Selector::role("button", &digit.to_string()),
            Selector::css(&format!("[data-key='{digit}']")),
        ],
    )
}

fn secure_access_notice() -> Target {
    Target::new(
        "secure access notice",
        vec![Selector::text("Acceso seguro")],
    )
}

fn ing_account_link(bank: Bank) -> Target {
    let name = match bank {
        Bank::IngNomina => "Cuenta NÓMINA",
        Bank::IngNaranja => "Cuenta NARANJA",
        Bank::Ibercaja => unreachable!("not an ING account"),
    };
    Target::new(
        "account link",
        vec![Selector::text(name), Selector::role("link", name)],
    )
}

fn search_options() -> Target {
    Target::new(
        "extended search options",
        vec![
            Selector::text("Más opciones de búsqueda"),
            Selector::css("[class*='search-options']"),
        ],
    )
}

fn last_quarter_filter() -> Target {
    Target::new(
        "last quarter filter",
        vec![
            Selector::text("Últimos 3 meses"),
            Selector::css("[data-range='3m']"),
        ],
    )
}

fn search_button() -> Target {
    Target::new(
        "search button",
        vec![
            Selector::role("button", "Buscar"),
            Selector::css("button[type='submit']"),
        ],
    )
}

fn ing_download_menu() -> Target {
    Target::new(
        "movement download menu",
        vec![
            Selector::text("Descargar movimientos"),
            Selector::css("[class*='download']"),
        ],
    )
}

pub(super) async fn ing(
    session: &mut BankSession,
    credential: &Secret,
) -> Result<RawExport, SyncError> {
    let fields = credential_fields(
        credential,
        &["document number", "birth day", "birth month", "birth year"],
    )?;

    session.goto(ING_LOGIN).await?;
    if session.click_if_present(&reject_cookies()).await? {
        log::debug!("Dismissed the cookie banner");
    }
    session
        .dismiss_overlays(&didomi_overlay(), REMOVE_OVERLAYS_SCRIPT)
        .await?;

    session.fill(&document_field(), fields[0]).await?;
    session.fill(&birth_field("birth day field", "DD"), fields[1]).await?;
    session.fill(&birth_field("birth month field", "MM"), fields[2]).await?;
    session.fill(&birth_field("birth year field", "AAAA"), fields[3]).await?;
    session.click(&continue_button()).await?;

    // The portal asks for a few positions of the access code on an
    // on-screen pinpad. Which positions is decided server-side, so the
    // operator has to read them off and answer with just those digits.
    session.wait_for(&pinpad_positions()).await?;
    let label = session.text_of(&pinpad_positions()).await?;
    let positions = parse_pinpad_positions(&label);
    if positions.is_empty() {
        return Err(session.structure_changed(&pinpad_positions()).await);
    }
    let digits = session
        .request_second_factor(&format!(
            "Enter the digits of your access code at positions {}",
            positions
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        ))
        .await?;
    if digits.chars().count() != positions.len() || !digits.chars().all(|c| c.is_ascii_digit()) {
        log::warn!(
            "Second factor response does not match the {} requested positions",
            positions.len(),
        );
        return Err(SyncError::Authentication);
    }
    for digit in digits.chars() {
        session.click(&pin_key(digit)).await?;
    }

    // Some logins additionally want a confirmation in the phone app
    // before the redirect to the overview happens.
    if session.is_present(&secure_access_notice()).await? {
        session.notify_operator("Confirm the login in the ING app on your phone");
        let timeout = session.second_factor_timeout();
        session.wait_for_location(ING_OVERVIEW_FRAGMENT, timeout).await?;
    } else {
        let timeout = session.page_timeout();
        session.wait_for_location(ING_OVERVIEW_FRAGMENT, timeout).await?;
    }
    session.mark_authenticated();

    session.click(&ing_account_link(session.bank())).await?;
    if session.click_if_present(&search_options()).await? {
        session.click(&last_quarter_filter()).await?;
        session.click(&search_button()).await?;
    }

    session.mark_downloading();
    session.click(&ing_download_menu()).await?;
    let bytes = session.download(&excel_entry()).await?;
    parse_export(session.bank(), &bytes)
}

fn parse_pinpad_positions(label: &str) -> Vec<u32> {
    let pattern = regex::Regex::new(r"\d").unwrap();
    pattern
        .find_iter(label)
        .filter_map(|m| m.as_str().parse().ok())
        .collect()
}

fn parse_export(bank: Bank, bytes: &[u8]) -> Result<RawExport, SyncError> {
    RawExport::from_csv(bank, bytes)
        .map_err(|err| SyncError::Transient(format!("downloaded export could not be read: {err}")))
}
