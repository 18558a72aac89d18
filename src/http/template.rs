// Error template rendering with {Code, Message} fields.

/// Template applied to error responses. Placeholders `{{.Code}}` and
/// `{{.Message}}` are substituted verbatim; anything else passes through.
#[derive(Debug, Clone)]
pub struct ErrorTemplate {
    raw: String,
}

/// Built-in fallback used when no template was registered at any scope.
pub const DEFAULT_ERROR_TEMPLATE: &str = "{{.Code}} {{.Message}}";

impl ErrorTemplate {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn render(&self, code: u16, message: &str) -> String {
        self.raw
            .replace("{{.Code}}", &code.to_string())
            .replace("{{.Message}}", message)
    }
}

impl Default for ErrorTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_TEMPLATE)
    }
}

/// Content sniff deciding whether captured error bytes are already a
/// rendered HTML document to be emitted verbatim.
pub fn looks_like_html(body: &[u8]) -> bool {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim_start().to_ascii_lowercase();
    trimmed.starts_with("<!doctype html") || trimmed.starts_with("<html")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_fields() {
        let t = ErrorTemplate::new("E{{.Code}}:{{.Message}}");
        assert_eq!(t.render(404, "no such thing"), "E404:no such thing");
    }

    #[test]
    fn test_default_template() {
        let t = ErrorTemplate::default();
        assert_eq!(t.render(503, "Service Unavailable"), "503 Service Unavailable");
    }

    #[test]
    fn test_html_sniff() {
        assert!(looks_like_html(b"  <!DOCTYPE html><html></html>"));
        assert!(looks_like_html(b"<HTML><body>x</body></HTML>"));
        assert!(!looks_like_html(b"plain error text"));
    }
}
