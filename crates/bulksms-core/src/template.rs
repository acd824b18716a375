//! Message template rendering
//!
//! Substitutes `{{field}}` placeholders from recipient attributes with
//! case-insensitive key matching. Missing keys render as the empty string
//! and are reported to the caller so the executor can warn once per session.
//! The renderer never truncates; segmentation is the transport's concern,
//! but an advisory segment estimate is available for telemetry.

use serde::{Deserialize, Serialize};

use crate::errors::TemplateError;
use crate::recipient::Recipient;

// ----------------------------------------------------------------------------
// Rendering
// ----------------------------------------------------------------------------

/// A rendered SMS body plus the placeholders that had no value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub body: String,
    /// Placeholder names (as written in the template) with no recipient value
    pub missing: Vec<String>,
}

/// Stateless `{{field}}` renderer
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRenderer;

impl TemplateRenderer {
    /// Check a template before a campaign starts
    pub fn validate(template: &str) -> Result<(), TemplateError> {
        if template.trim().is_empty() {
            return Err(TemplateError::Empty);
        }
        let mut rest = template;
        let mut offset = 0;
        while let Some(start) = rest.find("{{") {
            let after = &rest[start + 2..];
            match after.find("}}") {
                None => {
                    return Err(TemplateError::UnclosedPlaceholder {
                        offset: offset + start,
                    })
                }
                Some(end) => {
                    if after[..end].trim().is_empty() {
                        return Err(TemplateError::EmptyPlaceholder {
                            offset: offset + start,
                        });
                    }
                    offset += start + 2 + end + 2;
                    rest = &after[end + 2..];
                }
            }
        }
        Ok(())
    }

    /// Render one body for one recipient
    pub fn render(template: &str, recipient: &Recipient) -> RenderedMessage {
        let mut body = String::with_capacity(template.len());
        let mut missing = Vec::new();
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            body.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                None => {
                    // Unclosed placeholder passes through verbatim; validate()
                    // rejects these before a campaign starts.
                    body.push_str(&rest[start..]);
                    rest = "";
                    break;
                }
                Some(end) => {
                    let key = after[..end].trim();
                    match recipient.field(key) {
                        Some(value) => body.push_str(value),
                        None => {
                            if !missing.iter().any(|m| m == key) {
                                missing.push(key.to_string());
                            }
                        }
                    }
                    rest = &after[end + 2..];
                }
            }
        }
        body.push_str(rest);

        RenderedMessage { body, missing }
    }
}

// ----------------------------------------------------------------------------
// Segment Estimation
// ----------------------------------------------------------------------------

/// Character encoding the network would pick for a body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmsEncoding {
    /// GSM 03.38 7-bit default alphabet
    Gsm7,
    /// UCS-2 fallback for anything outside the default alphabet
    Ucs2,
}

/// Advisory segment estimate; the transport still performs real segmentation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentEstimate {
    pub encoding: SmsEncoding,
    pub units: usize,
    pub segments: u32,
}

/// GSM 03.38 basic character set
const GSM7_BASIC: &str = "@£$¥èéùìòÇ\nØø\rÅåΔ_ΦΓΛΩΠΨΣΘΞÆæßÉ !\"#¤%&'()*+,-./0123456789:;<=>?¡ABCDEFGHIJKLMNOPQRSTUVWXYZÄÖÑܧ¿abcdefghijklmnopqrstuvwxyzäöñüà";
/// Extension table characters, each costing two septets
const GSM7_EXTENDED: &str = "^{}\\[~]|€";

fn gsm7_septets(ch: char) -> Option<usize> {
    if GSM7_BASIC.contains(ch) {
        Some(1)
    } else if GSM7_EXTENDED.contains(ch) {
        Some(2)
    } else {
        None
    }
}

/// Estimate the encoding and segment count for a rendered body
pub fn estimate_segments(body: &str) -> SegmentEstimate {
    let mut septets = 0usize;
    let mut gsm7 = true;
    for ch in body.chars() {
        match gsm7_septets(ch) {
            Some(cost) => septets += cost,
            None => {
                gsm7 = false;
                break;
            }
        }
    }

    if gsm7 {
        let segments = if septets <= 160 {
            1
        } else {
            septets.div_ceil(153)
        };
        SegmentEstimate {
            encoding: SmsEncoding::Gsm7,
            units: septets,
            segments: segments.max(1) as u32,
        }
    } else {
        let units = body.encode_utf16().count();
        let segments = if units <= 70 { 1 } else { units.div_ceil(67) };
        SegmentEstimate {
            encoding: SmsEncoding::Ucs2,
            units,
            segments: segments.max(1) as u32,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient() -> Recipient {
        Recipient::new(0, "+254700000001")
            .with_name("Wanjiku")
            .with_amount("1200")
            .with_field("DueDate", "2024-03-01")
    }

    #[test]
    fn renders_aliases_and_fields() {
        let rendered = TemplateRenderer::render(
            "Dear {{Name}}, KES {{Amount}} is due {{duedate}}. Ref {{Phone}}",
            &recipient(),
        );
        assert_eq!(
            rendered.body,
            "Dear Wanjiku, KES 1200 is due 2024-03-01. Ref +254700000001"
        );
        assert!(rendered.missing.is_empty());
    }

    #[test]
    fn missing_keys_render_empty_and_are_reported_once() {
        let rendered =
            TemplateRenderer::render("Hi {{Nickname}} {{Nickname}} {{Name}}", &recipient());
        assert_eq!(rendered.body, "Hi  Wanjiku");
        assert_eq!(rendered.missing, vec!["Nickname".to_string()]);
    }

    #[test]
    fn whitespace_inside_placeholder_is_trimmed() {
        let rendered = TemplateRenderer::render("Hi {{ Name }}", &recipient());
        assert_eq!(rendered.body, "Hi Wanjiku");
    }

    #[test]
    fn template_without_placeholders_passes_through() {
        let rendered = TemplateRenderer::render("Flash sale today only!", &recipient());
        assert_eq!(rendered.body, "Flash sale today only!");
    }

    #[test]
    fn validate_rejects_degenerate_templates() {
        assert_eq!(TemplateRenderer::validate(""), Err(TemplateError::Empty));
        assert_eq!(TemplateRenderer::validate("  \n "), Err(TemplateError::Empty));
        assert_eq!(
            TemplateRenderer::validate("Hi {{Name"),
            Err(TemplateError::UnclosedPlaceholder { offset: 3 })
        );
        assert_eq!(
            TemplateRenderer::validate("Hi {{}}"),
            Err(TemplateError::EmptyPlaceholder { offset: 3 })
        );
        assert!(TemplateRenderer::validate("Hi {{Name}}").is_ok());
    }

    #[test]
    fn gsm7_segment_boundaries() {
        let one = "a".repeat(160);
        let two = "a".repeat(161);
        assert_eq!(
            estimate_segments(&one),
            SegmentEstimate {
                encoding: SmsEncoding::Gsm7,
                units: 160,
                segments: 1
            }
        );
        assert_eq!(estimate_segments(&two).segments, 2);
    }

    #[test]
    fn extension_chars_cost_two_septets() {
        let body = "{}".repeat(40); // 80 chars, 160 septets
        assert_eq!(estimate_segments(&body).units, 160);
        assert_eq!(estimate_segments(&body).segments, 1);
    }

    #[test]
    fn non_gsm_falls_back_to_ucs2() {
        let est = estimate_segments("Привет, мир");
        assert_eq!(est.encoding, SmsEncoding::Ucs2);
        assert_eq!(est.segments, 1);

        let long = "日".repeat(71);
        assert_eq!(estimate_segments(&long).encoding, SmsEncoding::Ucs2);
        assert_eq!(estimate_segments(&long).segments, 2);
    }
}
