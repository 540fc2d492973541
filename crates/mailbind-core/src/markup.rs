//! Markup template for rendered messages.
//!
//! The extracted reply is wrapped in a fixed, minimal XHTML document: one
//! `<pre>` block styled monospaced with `white-space: pre-wrap`, so an HTML
//! renderer keeps every space and blank line while still wrapping long lines.
//! The document is well-formed XML, which lets native renderers read the text
//! back without an HTML parser.

use quick_xml::escape::escape;

/// Fixed stylesheet applied to every rendered message.
pub const STYLESHEET: &str = "body { margin: 0; } \
pre { font-family: \"Courier New\", Courier, monospace; font-size: 10pt; line-height: 1.4; \
white-space: pre-wrap; word-wrap: break-word; overflow-wrap: break-word; }";

/// Wraps `text` in the message template.
///
/// The text is escaped but otherwise inserted verbatim.
pub fn message_markup(text: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<html xmlns=\"http://www.w3.org/1999/xhtml\">\
<head><meta charset=\"UTF-8\"/><style>{}</style></head>\
<body><pre>{}</pre></body></html>\n",
        STYLESHEET,
        escape(text)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escapes_markup_characters() {
        let html = message_markup("<b>Tom & \"Jerry\"</b> isn't");
        assert!(html.contains(
            "<pre>&lt;b&gt;Tom &amp; &quot;Jerry&quot;&lt;/b&gt; isn&apos;t</pre>"
        ));
    }

    #[test]
    fn test_template_keeps_whitespace_verbatim() {
        let text = "From: A\n\n\n   indented\tline\n";
        let html = message_markup(text);
        assert!(html.contains("<pre>From: A\n\n\n   indented\tline\n</pre>"));
        assert!(html.contains("white-space: pre-wrap"));
        assert!(html.contains("monospace"));
    }

    #[test]
    fn test_template_is_single_pre_block() {
        let html = message_markup("<pre>nested</pre>");
        assert_eq!(html.matches("<pre>").count(), 1);
    }
}
