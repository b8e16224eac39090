//! Rule-based newsletter/spam detection and unsubscribe link extraction

use crate::config::ClassifierConfig;
use crate::error::{CleanupError, Result};
use crate::models::{ClassificationResult, NormalizedMessage};
use regex::{RegexSet, RegexSetBuilder};
use scraper::{Html, Selector};
use std::collections::HashSet;

/// Patterns matched against subject, sender and HTML body
pub const DEFAULT_NEWSLETTER_PATTERNS: &[&str] = &[
    "newsletter",
    "news",
    "digest",
    "promo",
    "promotion",
    "offre",
    "offers",
    "sale",
    "unsubscribe",
    "update",
];

/// Patterns matched against subject and text body
pub const DEFAULT_SPAM_PATTERNS: &[&str] = &[
    "viagra",
    "free money",
    "win a prize",
    "click here",
    "urgent",
];

/// Patterns matched against an anchor's href and text (English and French)
pub const DEFAULT_UNSUBSCRIBE_PATTERNS: &[&str] = &[
    "unsub",
    r"se d[ée]sabonner",
    r"d[ée]sinscrire",
    r"opt[- ]?out",
    r"manage preferences",
    r"update subscription",
    r"modifier mes pr[ée]f[ée]rences",
    r"stop receiving",
    r"cancel subscription",
];

/// Keyword/regex classifier
///
/// Pattern lists come from [`ClassifierConfig`], so the corpus can be
/// extended without code changes. All matching is case-insensitive.
#[derive(Debug, Clone)]
pub struct Classifier {
    newsletter: RegexSet,
    spam: RegexSet,
    unsubscribe: RegexSet,
}

impl Classifier {
    /// Build a classifier from configured pattern lists
    pub fn from_config(config: &ClassifierConfig) -> Result<Self> {
        Ok(Self {
            newsletter: build_set("newsletter_patterns", &config.newsletter_patterns)?,
            spam: build_set("spam_patterns", &config.spam_patterns)?,
            unsubscribe: build_set("unsubscribe_patterns", &config.unsubscribe_patterns)?,
        })
    }

    /// True if any newsletter pattern matches the subject, sender or HTML body
    pub fn classify_newsletter(&self, subject: &str, sender: &str, html_body: Option<&str>) -> bool {
        self.newsletter.is_match(subject)
            || self.newsletter.is_match(sender)
            || html_body.is_some_and(|body| self.newsletter.is_match(body))
    }

    /// True if any spam trigger phrase matches the subject or text body
    pub fn classify_spam(&self, subject: &str, text_body: Option<&str>) -> bool {
        self.spam.is_match(subject) || text_body.is_some_and(|body| self.spam.is_match(body))
    }

    /// Extract unsubscribe links from HTML
    ///
    /// An anchor qualifies when an unsubscribe pattern matches its href or
    /// its text. Returned hrefs are unique and in document order. Empty or
    /// malformed input yields an empty list.
    pub fn extract_unsubscribe_links(&self, html: &str) -> Vec<String> {
        if html.trim().is_empty() {
            return Vec::new();
        }

        let Ok(anchor_sel) = Selector::parse("a[href]") else {
            return Vec::new();
        };

        let document = Html::parse_document(html);
        let mut seen = HashSet::new();
        let mut links = Vec::new();

        for anchor in document.select(&anchor_sel) {
            let href = anchor.value().attr("href").unwrap_or("").trim();
            if href.is_empty() {
                continue;
            }

            let text: String = anchor.text().collect();
            let combined = format!("{} {}", href, text);
            if !self.unsubscribe.is_match(&combined) {
                continue;
            }

            if seen.insert(href.to_string()) {
                links.push(href.to_string());
            }
        }

        links
    }

    /// Run every rule over one message
    pub fn classify(&self, message: &NormalizedMessage) -> ClassificationResult {
        let unsubscribe_links = message
            .html_body
            .as_deref()
            .map(|html| self.extract_unsubscribe_links(html))
            .unwrap_or_default();

        ClassificationResult {
            is_newsletter: self.classify_newsletter(
                &message.subject,
                &message.sender,
                message.html_body.as_deref(),
            ),
            is_spam: message.is_spam
                || self.classify_spam(&message.subject, message.text_body.as_deref()),
            unsubscribe_links,
        }
    }

    /// Fold inferred labels into the message: spam detection is OR-ed into
    /// `is_spam` and matching rules add "newsletter"/"spam" categories.
    pub fn annotate(&self, message: &mut NormalizedMessage) -> ClassificationResult {
        let result = self.classify(message);
        if result.is_spam {
            message.is_spam = true;
            message.add_category("spam");
        }
        if result.is_newsletter {
            message.add_category("newsletter");
        }
        result
    }
}

impl Default for Classifier {
    fn default() -> Self {
        // Built-in patterns are valid regexes; a failure here is a programming error.
        Self::from_config(&ClassifierConfig::default())
            .expect("default classifier patterns must compile")
    }
}

fn build_set(field: &str, patterns: &[String]) -> Result<RegexSet> {
    RegexSetBuilder::new(patterns)
        .case_insensitive(true)
        .build()
        .map_err(|e| CleanupError::ConfigError(format!("Invalid classifier.{}: {}", field, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn classifier() -> Classifier {
        Classifier::default()
    }

    #[test]
    fn test_newsletter_subject_match() {
        let c = classifier();
        assert!(c.classify_newsletter("Weekly Newsletter – 20% off", "team@shop.com", None));
    }

    #[test]
    fn test_newsletter_negative() {
        let c = classifier();
        assert!(!c.classify_newsletter("Q3 Budget Review", "finance@corp.com", None));
        assert!(!c.classify_newsletter(
            "Q3 Budget Review",
            "finance@corp.com",
            Some("<p>See attached figures.</p>")
        ));
    }

    #[test]
    fn test_newsletter_sender_and_body_match() {
        let c = classifier();
        assert!(c.classify_newsletter("Hello", "newsletter@brand.com", None));
        assert!(c.classify_newsletter("Hello", "bob@brand.com", Some("<b>SUMMER SALE</b>")));
    }

    #[test]
    fn test_spam_detection() {
        let c = classifier();
        assert!(c.classify_spam("URGENT: claim now", None));
        assert!(c.classify_spam("Hi", Some("You can win a prize today")));
        assert!(!c.classify_spam("Lunch tomorrow?", Some("See you at noon")));
    }

    #[test]
    fn test_extract_single_link() {
        let c = classifier();
        let links =
            c.extract_unsubscribe_links(r#"<a href="http://x.com/u">Click here to unsubscribe</a>"#);
        assert_eq!(links, vec!["http://x.com/u".to_string()]);
    }

    #[test]
    fn test_extract_no_match() {
        let c = classifier();
        let links = c.extract_unsubscribe_links(
            r#"<html><body><a href="http://x.com/home">Home</a></body></html>"#,
        );
        assert!(links.is_empty());
    }

    #[test]
    fn test_extract_dedup_preserves_order() {
        let c = classifier();
        let html = r#"
            <a href="http://a.com/unsubscribe">Unsubscribe</a>
            <a href="http://b.com/prefs">Manage preferences</a>
            <a href="http://a.com/unsubscribe">unsubscribe here</a>
        "#;
        let links = c.extract_unsubscribe_links(html);
        assert_eq!(
            links,
            vec![
                "http://a.com/unsubscribe".to_string(),
                "http://b.com/prefs".to_string()
            ]
        );
    }

    #[test]
    fn test_extract_matches_href_only() {
        let c = classifier();
        let links = c.extract_unsubscribe_links(r#"<a href="https://x.com/opt-out?id=1">here</a>"#);
        assert_eq!(links, vec!["https://x.com/opt-out?id=1".to_string()]);
    }

    #[test]
    fn test_extract_french_phrasing() {
        let c = classifier();
        let html = r#"<p><a href="https://fr.example/r?t=9">Se désabonner</a></p>"#;
        assert_eq!(c.extract_unsubscribe_links(html), vec!["https://fr.example/r?t=9"]);
    }

    #[test]
    fn test_extract_empty_and_malformed() {
        let c = classifier();
        assert!(c.extract_unsubscribe_links("").is_empty());
        assert!(c.extract_unsubscribe_links("<a href=").is_empty());
        assert!(c.extract_unsubscribe_links("<<<>>> not html at all").is_empty());
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let config = ClassifierConfig {
            spam_patterns: vec!["(unclosed".to_string()],
            ..ClassifierConfig::default()
        };
        let err = Classifier::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("classifier.spam_patterns"));
    }

    #[test]
    fn test_custom_patterns_extend_corpus() {
        let mut config = ClassifierConfig::default();
        config.spam_patterns.push("crypto giveaway".to_string());
        let c = Classifier::from_config(&config).unwrap();
        assert!(c.classify_spam("Huge CRYPTO GIVEAWAY", None));
    }

    #[test]
    fn test_annotate_sets_categories() {
        let c = classifier();
        let mut msg = NormalizedMessage::new("1", "deals@shop.com", Utc::now())
            .with_subject("Flash sale")
            .with_text_body("Click here now")
            .with_html_body(r#"<a href="https://shop.com/unsub">Unsubscribe</a>"#);

        let result = c.annotate(&mut msg);
        assert!(result.is_newsletter);
        assert!(result.is_spam);
        assert_eq!(result.unsubscribe_links, vec!["https://shop.com/unsub"]);
        assert!(msg.is_spam);
        assert!(msg.categories.contains("newsletter"));
        assert!(msg.categories.contains("spam"));
    }

    #[test]
    fn test_classify_keeps_provider_spam_flag() {
        let c = classifier();
        let msg = NormalizedMessage::new("1", "x@y.com", Utc::now())
            .with_subject("Hello")
            .with_spam(true);
        assert!(c.classify(&msg).is_spam);
    }
}
