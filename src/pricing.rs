//! USD cost estimation from token usage.
//!
//! A static `(provider, model) → $/1M-token` rate table; unknown pairs
//! price at zero rather than failing. Gemini model names are normalised
//! before lookup because the API reports them in several spellings.

/// Per-million-token rates: `(input, output)`.
fn rate(provider: &str, model: &str) -> (f64, f64) {
    match provider {
        "openai" | "azure" => match model {
            "gpt-4o-mini" => (0.15, 0.60),
            "gpt-4o" => (2.50, 10.00),
            "o3-mini" => (1.10, 4.40),
            _ => (0.0, 0.0),
        },
        "openrouter" => match model {
            "openai/gpt-4o-mini-2024-07-18" => (0.15, 0.60),
            "openai/gpt-4o-2024-08-06" => (2.50, 10.00),
            "google/gemini-2.5-pro-preview" => (1.25, 10.00),
            _ => (0.0, 0.0),
        },
        "gemini" => match normalize_gemini_model(model).as_str() {
            "gemini-2.5-flash" | "gemini-1.5-flash" => (0.35, 1.05),
            "gemini-1.5-pro" => (3.50, 10.50),
            _ => (0.0, 0.0),
        },
        _ => (0.0, 0.0),
    }
}

/// Estimated cost in USD.
pub fn cost(provider: &str, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let (input_rate, output_rate) = rate(provider, model.trim());
    input_tokens as f64 / 1_000_000.0 * input_rate
        + output_tokens as f64 / 1_000_000.0 * output_rate
}

/// Format a cost for display.
pub fn format_cost(cost: f64) -> String {
    format!("${cost:.4}")
}

/// Reduce a Gemini model name to its base id: drop `models/` path
/// prefixes, version/date suffixes (`-001`, `-06-05`, `-20240605`), and
/// collapse the old short names.
pub fn normalize_gemini_model(model: &str) -> String {
    let mut name = model.trim().to_lowercase();

    if let Some(rest) = name.rfind("models/").map(|i| name[i + "models/".len()..].to_string()) {
        name = rest;
    }
    if let Some(rest) = name.rsplit('/').next().map(str::to_string) {
        name = rest;
    }

    name = strip_version_suffix(&name);

    match name.as_str() {
        "gemini-pro" => "gemini-1.5-pro".to_string(),
        "gemini-flash" => "gemini-1.5-flash".to_string(),
        _ => name,
    }
}

/// Strip a trailing `-NNN`, `-MM-DD`, or `-YYYYMMDD` segment.
fn strip_version_suffix(name: &str) -> String {
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());

    // -MM-DD: two numeric segments of two digits each.
    let parts: Vec<&str> = name.split('-').collect();
    if parts.len() >= 3 {
        let (a, b) = (parts[parts.len() - 2], parts[parts.len() - 1]);
        if a.len() == 2 && b.len() == 2 && all_digits(a) && all_digits(b) {
            return parts[..parts.len() - 2].join("-");
        }
    }
    if let Some((head, tail)) = name.rsplit_once('-') {
        if (tail.len() == 3 || tail.len() == 8) && all_digits(tail) {
            return head.to_string();
        }
    }
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_openai_rates() {
        // 1M input + 1M output tokens of gpt-4o.
        let c = cost("openai", "gpt-4o", 1_000_000, 1_000_000);
        assert!((c - 12.50).abs() < 1e-9);
    }

    #[test]
    fn test_azure_mirrors_openai() {
        assert_eq!(
            cost("azure", "gpt-4o-mini", 2_000_000, 1_000_000),
            cost("openai", "gpt-4o-mini", 2_000_000, 1_000_000)
        );
    }

    #[test]
    fn test_unknown_model_is_free() {
        assert_eq!(cost("openai", "gpt-99-ultra", 1_000_000, 1_000_000), 0.0);
        assert_eq!(cost("acme", "gpt-4o", 1_000_000, 1_000_000), 0.0);
    }

    #[test]
    fn test_zero_tokens_zero_cost() {
        assert_eq!(cost("openai", "gpt-4o", 0, 0), 0.0);
    }

    #[test]
    fn test_cost_is_linear_in_input() {
        let (a, b, c) = (123_456u64, 654_321u64, 42_000u64);
        let combined = cost("openai", "gpt-4o-mini", a + b, c);
        let split = cost("openai", "gpt-4o-mini", a, c) + cost("openai", "gpt-4o-mini", b, 0);
        assert!((combined - split).abs() < 1e-9);
    }

    #[test]
    fn test_gemini_normalization_prefixes() {
        assert_eq!(
            normalize_gemini_model("models/gemini-1.5-pro"),
            "gemini-1.5-pro"
        );
        assert_eq!(
            normalize_gemini_model("publishers/google/models/gemini-1.5-flash"),
            "gemini-1.5-flash"
        );
    }

    #[test]
    fn test_gemini_normalization_suffixes() {
        assert_eq!(
            normalize_gemini_model("gemini-1.5-pro-001"),
            "gemini-1.5-pro"
        );
        assert_eq!(
            normalize_gemini_model("gemini-1.5-pro-06-05"),
            "gemini-1.5-pro"
        );
        assert_eq!(
            normalize_gemini_model("gemini-1.5-pro-20240605"),
            "gemini-1.5-pro"
        );
    }

    #[test]
    fn test_gemini_synonyms() {
        assert_eq!(normalize_gemini_model("gemini-pro"), "gemini-1.5-pro");
        assert_eq!(normalize_gemini_model("Gemini-Flash"), "gemini-1.5-flash");
    }

    #[test]
    fn test_gemini_priced_after_normalization() {
        let c = cost("gemini", "models/gemini-1.5-flash-001", 1_000_000, 0);
        assert!((c - 0.35).abs() < 1e-9);
    }

    #[test]
    fn test_version_suffix_not_overstripped() {
        assert_eq!(
            normalize_gemini_model("gemini-2.5-flash"),
            "gemini-2.5-flash"
        );
        assert_eq!(normalize_gemini_model("gemini-1.5-flash-8b"), "gemini-1.5-flash-8b");
    }

    #[test]
    fn test_format_cost() {
        assert_eq!(format_cost(1.23456), "$1.2346");
        assert_eq!(format_cost(0.0), "$0.0000");
    }
}
