//! Issue body parsing.
//!
//! Order issues are usually opened through a GitHub issue form, which
//! renders as `### Heading` sections. Structured fields are read first; for
//! the SKU only, a regex fallback scans the raw text so hand-written issues
//! (`SKU: COFFEE_V1`) still work. Option values are collected untyped and
//! unvalidated; pricing tolerates unknown keys by design.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// Quantity bounds enforced at intake.
pub const MIN_QUANTITY: i64 = 1;
pub const MAX_QUANTITY: i64 = 10;

/// GitHub issue forms render unanswered fields as this placeholder.
const NO_RESPONSE: &str = "_No response_";

static SKU_FALLBACK: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)] // pattern is a compile-time constant
    Regex::new(r"(?im)^\s*SKU\s*[:=]\s*([A-Za-z0-9][A-Za-z0-9_\-]*)\s*$").unwrap()
});

/// What the buyer asked for, as parsed from the issue body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderRequest {
    pub sku: Option<String>,
    /// Clamped to `[MIN_QUANTITY, MAX_QUANTITY]`, default 1.
    pub quantity: i64,
    pub email: Option<String>,
    /// Remaining form sections, keyed by snake_cased heading.
    pub options: BTreeMap<String, String>,
}

/// Parse an issue body into an [`OrderRequest`].
pub fn parse_issue_body(body: &str) -> OrderRequest {
    let mut request = OrderRequest {
        quantity: MIN_QUANTITY,
        ..OrderRequest::default()
    };

    for (heading, value) in form_sections(body) {
        if value.is_empty() || value == NO_RESPONSE {
            continue;
        }
        match heading.as_str() {
            "sku" | "product" | "product_sku" => request.sku = Some(value),
            "quantity" | "qty" => request.quantity = clamp_quantity(value.parse().ok()),
            "email" | "contact_email" => request.email = Some(value),
            _ => {
                request.options.insert(heading, value);
            }
        }
    }

    // Regex fallback on the raw text, SKU only.
    if request.sku.is_none() {
        request.sku = SKU_FALLBACK
            .captures(body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
    }

    request
}

fn clamp_quantity(parsed: Option<i64>) -> i64 {
    parsed.unwrap_or(MIN_QUANTITY).clamp(MIN_QUANTITY, MAX_QUANTITY)
}

/// Split a markdown body into `### Heading` sections, keeping the first
/// non-empty line of each section as its value.
fn form_sections(body: &str) -> Vec<(String, String)> {
    let mut sections = Vec::new();
    let mut current: Option<(String, Option<String>)> = None;

    for line in body.lines() {
        if let Some(heading) = line.strip_prefix("### ") {
            if let Some((key, value)) = current.take() {
                sections.push((key, value.unwrap_or_default()));
            }
            current = Some((snake_case(heading.trim()), None));
        } else if let Some((_, value)) = current.as_mut() {
            if value.is_none() {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    *value = Some(trimmed.to_string());
                }
            }
        }
    }
    if let Some((key, value)) = current.take() {
        sections.push((key, value.unwrap_or_default()));
    }
    sections
}

fn snake_case(heading: &str) -> String {
    heading
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_issue_form_sections() {
        let body = "### SKU\n\nCOFFEE_V1\n\n### Quantity\n\n3\n\n### Grind\n\nespresso\n";
        let request = parse_issue_body(body);
        assert_eq!(request.sku.as_deref(), Some("COFFEE_V1"));
        assert_eq!(request.quantity, 3);
        assert_eq!(request.options.get("grind").map(String::as_str), Some("espresso"));
    }

    #[test]
    fn sku_regex_fallback_on_raw_text() {
        let body = "I'd like to order.\n\nSKU:COFFEE_V1\nthanks!";
        let request = parse_issue_body(body);
        assert_eq!(request.sku.as_deref(), Some("COFFEE_V1"));
        assert_eq!(request.quantity, 1);
    }

    #[test]
    fn structured_field_wins_over_fallback() {
        let body = "### SKU\n\nMUG_V2\n\nSKU: COFFEE_V1\n";
        let request = parse_issue_body(body);
        assert_eq!(request.sku.as_deref(), Some("MUG_V2"));
    }

    #[test]
    fn quantity_is_clamped_and_defaulted() {
        assert_eq!(parse_issue_body("### Quantity\n\n99\n").quantity, 10);
        assert_eq!(parse_issue_body("### Quantity\n\n0\n").quantity, 1);
        assert_eq!(parse_issue_body("### Quantity\n\n-3\n").quantity, 1);
        assert_eq!(parse_issue_body("### Quantity\n\nbanana\n").quantity, 1);
        assert_eq!(parse_issue_body("no quantity here").quantity, 1);
    }

    #[test]
    fn no_response_placeholder_is_ignored() {
        let body = "### SKU\n\nCOFFEE_V1\n\n### Email\n\n_No response_\n";
        let request = parse_issue_body(body);
        assert_eq!(request.email, None);
        assert_eq!(request.sku.as_deref(), Some("COFFEE_V1"));
    }

    #[test]
    fn unknown_sections_land_in_options() {
        let body = "### SKU\n\nA\n\n### Gift Wrap\n\nyes\n\n### Notes\n\nleave at door\n";
        let request = parse_issue_body(body);
        assert_eq!(request.options.get("gift_wrap").map(String::as_str), Some("yes"));
        assert_eq!(
            request.options.get("notes").map(String::as_str),
            Some("leave at door")
        );
    }
}
