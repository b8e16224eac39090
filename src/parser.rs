//! Metadata extraction from provider-specific message shapes

use chrono::{DateTime, Utc};
use google_gmail1::api::{Message, MessagePart};
use mail_parser::MessageParser;
use serde::{Deserialize, Serialize};

use crate::error::{CleanupError, Result};
use crate::models::NormalizedMessage;

/// A message as returned by one of the providers
#[derive(Debug, Clone)]
pub enum RawMessage {
    /// Gmail API message fetched with `format=full`
    Gmail(Message),
    /// Microsoft Graph message resource
    Outlook(OutlookMessage),
    /// RFC 5322 bytes (IMAP `BODY[]`)
    Mime { id: String, raw: Vec<u8>, seen: bool },
}

/// Subset of the Graph `message` resource that we read
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutlookMessage {
    pub id: String,
    pub subject: Option<String>,
    pub received_date_time: Option<String>,
    pub from: Option<OutlookRecipient>,
    pub is_read: bool,
    pub body: Option<OutlookBody>,
    pub categories: Vec<String>,
    pub inference_classification: Option<String>,
    pub internet_message_headers: Vec<OutlookHeader>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutlookRecipient {
    pub email_address: OutlookEmailAddress,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlookEmailAddress {
    pub name: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutlookBody {
    /// "html" or "text"
    pub content_type: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlookHeader {
    pub name: String,
    pub value: String,
}

/// Normalize a raw message, using the current time when the date is missing
pub fn extract_metadata(raw: &RawMessage) -> Result<NormalizedMessage> {
    extract_metadata_at(raw, Utc::now())
}

/// Normalize a raw message; `now` stands in for a missing or unparseable date
pub fn extract_metadata_at(raw: &RawMessage, now: DateTime<Utc>) -> Result<NormalizedMessage> {
    match raw {
        RawMessage::Gmail(msg) => from_gmail(msg, now),
        RawMessage::Outlook(msg) => Ok(from_outlook(msg, now)),
        RawMessage::Mime { id, raw, seen } => from_mime(id, raw, *seen, now),
    }
}

fn from_gmail(msg: &Message, now: DateTime<Utc>) -> Result<NormalizedMessage> {
    let id = msg
        .id
        .clone()
        .ok_or_else(|| CleanupError::InvalidMessageFormat("Missing message ID".to_string()))?;

    let mut sender_email = String::new();
    let mut sender_name = String::new();
    let mut subject = String::new();
    let mut date_str = String::new();
    let mut list_unsubscribe = None;

    let headers = msg.payload.as_ref().and_then(|p| p.headers.as_ref());
    for header in headers.into_iter().flatten() {
        if let (Some(name), Some(value)) = (&header.name, &header.value) {
            match name.to_lowercase().as_str() {
                "from" => {
                    if let Some((name_part, email_part)) = parse_email_header(value) {
                        sender_name = name_part;
                        sender_email = email_part;
                    } else {
                        sender_email = value.clone();
                    }
                }
                "subject" => subject = value.clone(),
                "date" => date_str = value.clone(),
                "list-unsubscribe" => list_unsubscribe = Some(value.clone()),
                _ => {}
            }
        }
    }

    // internalDate (ms since epoch) is authoritative; the Date header is sender-controlled
    let date = msg
        .internal_date
        .and_then(DateTime::from_timestamp_millis)
        .or_else(|| parse_date(&date_str).ok())
        .unwrap_or(now);

    let mut normalized = NormalizedMessage::new(id, sender_email, date).with_subject(subject);
    normalized.sender_name = sender_name;
    normalized.size_bytes = msg.size_estimate.map(|s| s.max(0) as u64).unwrap_or(0);
    normalized.list_unsubscribe = list_unsubscribe;

    // Gmail reports read state inverted, as the UNREAD label
    normalized.is_read = true;
    for label in msg.label_ids.iter().flatten() {
        match label.as_str() {
            "UNREAD" => normalized.is_read = false,
            "SPAM" => normalized.is_spam = true,
            other => {
                if let Some(category) = other.strip_prefix("CATEGORY_") {
                    normalized.add_category(category);
                }
            }
        }
    }

    if let Some(payload) = msg.payload.as_ref() {
        let mut html = None;
        let mut text = None;
        collect_gmail_bodies(payload, &mut html, &mut text);
        normalized.html_body = html;
        normalized.text_body = text;
    }

    Ok(normalized)
}

/// Depth-first walk over MIME parts, keeping the first html and text bodies
fn collect_gmail_bodies(part: &MessagePart, html: &mut Option<String>, text: &mut Option<String>) {
    let mime = part.mime_type.as_deref().unwrap_or("").to_lowercase();
    let data = part.body.as_ref().and_then(|b| b.data.as_ref());

    if let Some(bytes) = data {
        let decoded = String::from_utf8_lossy(bytes).into_owned();
        if mime == "text/html" && html.is_none() {
            *html = Some(decoded);
        } else if mime == "text/plain" && text.is_none() {
            *text = Some(decoded);
        }
    }

    for child in part.parts.iter().flatten() {
        collect_gmail_bodies(child, html, text);
    }
}

fn from_outlook(msg: &OutlookMessage, now: DateTime<Utc>) -> NormalizedMessage {
    let (sender_name, sender_email) = msg
        .from
        .as_ref()
        .map(|f| {
            (
                f.email_address.name.clone().unwrap_or_default(),
                f.email_address.address.clone().unwrap_or_default(),
            )
        })
        .unwrap_or_default();

    let date = msg
        .received_date_time
        .as_deref()
        .and_then(|d| parse_date(d).ok())
        .unwrap_or(now);

    let mut normalized = NormalizedMessage::new(msg.id.clone(), sender_email, date)
        .with_subject(msg.subject.clone().unwrap_or_default())
        .with_read(msg.is_read);
    normalized.sender_name = sender_name;

    if let Some(body) = msg.body.as_ref().filter(|b| !b.content.is_empty()) {
        if body.content_type.eq_ignore_ascii_case("html") {
            normalized.html_body = Some(body.content.clone());
        } else {
            normalized.text_body = Some(body.content.clone());
        }
    }

    for category in &msg.categories {
        normalized.add_category(category);
    }
    if let Some(inference) = msg.inference_classification.as_deref() {
        normalized.add_category(inference);
    }

    normalized.list_unsubscribe = msg
        .internet_message_headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("list-unsubscribe"))
        .map(|h| h.value.clone());

    normalized
}

fn from_mime(id: &str, raw: &[u8], seen: bool, now: DateTime<Utc>) -> Result<NormalizedMessage> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| CleanupError::InvalidMessageFormat(format!("Unparseable MIME message {}", id)))?;

    let sender = message
        .from()
        .and_then(|addr| addr.as_list())
        .and_then(|list| list.first());
    let sender_email = sender.and_then(|a| a.address()).unwrap_or("").to_string();
    let sender_name = sender.and_then(|a| a.name()).unwrap_or("").to_string();

    let date = message
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or(now);

    let mut normalized = NormalizedMessage::new(id, sender_email, date)
        .with_subject(message.subject().unwrap_or(""))
        .with_size(raw.len() as u64)
        .with_read(seen);
    normalized.sender_name = sender_name;
    // body_html/body_text convert between the two; only keep real parts
    normalized.html_body = message
        .html_part(0)
        .filter(|part| part.is_text_html())
        .and_then(|part| part.text_contents())
        .map(str::to_string);
    normalized.text_body = message
        .text_part(0)
        .filter(|part| part.is_text() && !part.is_text_html())
        .and_then(|part| part.text_contents())
        .map(str::to_string);
    normalized.list_unsubscribe = message
        .header_raw("List-Unsubscribe")
        .map(|v| v.trim().to_string());
    normalized.is_spam = message
        .header_raw("X-Spam-Flag")
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("yes"));

    Ok(normalized)
}

/// Parse email header in "Name <email@example.com>" format
pub fn parse_email_header(header: &str) -> Option<(String, String)> {
    if let Some(start) = header.find('<') {
        if let Some(end) = header.find('>') {
            if end > start {
                let name = header[..start].trim().trim_matches('"').to_string();
                let email = header[start + 1..end].trim().to_string();
                return Some((name, email));
            }
        }
    }
    None
}

/// Parse an RFC 2822 or RFC 3339 date string
pub fn parse_date(date_str: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(date_str)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| DateTime::parse_from_rfc3339(date_str).map(|dt| dt.with_timezone(&Utc)))
        .map_err(|e| CleanupError::InvalidMessageFormat(format!("Invalid date format: {}", e)))
}
