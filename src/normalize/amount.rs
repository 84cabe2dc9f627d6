use rust_decimal::Decimal;

use crate::banks::NumericLocale;

/// Parse a numeric cell respecting the export's separator convention.
/// Currency symbols and spacing (including non-breaking spaces some portals
/// emit) are tolerated; anything else returns `None`.
pub fn parse_amount(raw: &str, locale: NumericLocale) -> Option<Decimal> {
    let (thousands, decimal) = match locale {
        NumericLocale::CommaDecimal => ('.', ','),
        NumericLocale::DotDecimal => (',', '.'),
    };

    let mut cleaned = String::with_capacity(raw.len());
    let mut digits = 0;
    for c in raw.trim().chars() {
        match c {
            '0'..='9' => {
                digits += 1;
                cleaned.push(c);
            }
            '-' | '+' => cleaned.push(c),
            c if c == decimal => cleaned.push('.'),
            c if c == thousands => {}
            ' ' | '\u{a0}' | '€' => {}
            _ => return None,
        }
    }
    if digits == 0 {
        return None;
    }
    cleaned.parse().ok()
}
