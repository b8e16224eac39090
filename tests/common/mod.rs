//! Common test utilities and fixtures

#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use google_gmail1::api::{Message, MessagePart, MessagePartBody, MessagePartHeader};
use inbox_cleanup::cleaner::MessageDeleter;
use inbox_cleanup::client::MailProvider;
use inbox_cleanup::error::Result;
use inbox_cleanup::models::NormalizedMessage;
use inbox_cleanup::parser::RawMessage;
use mockall::mock;

/// Normalized message received `age_days` before `now`
pub fn create_test_message(
    id: &str,
    sender: &str,
    subject: &str,
    age_days: i64,
    now: DateTime<Utc>,
) -> NormalizedMessage {
    NormalizedMessage::new(id, sender, now - Duration::days(age_days)).with_subject(subject)
}

pub fn create_newsletter_message(id: &str, sender: &str, now: DateTime<Utc>) -> NormalizedMessage {
    create_test_message(id, sender, "Weekly Newsletter – 20% off", 1, now)
}

pub fn create_spam_message(id: &str, sender: &str, now: DateTime<Utc>) -> NormalizedMessage {
    create_test_message(id, sender, "Hello", 1, now).with_spam(true)
}

fn header(name: &str, value: &str) -> MessagePartHeader {
    MessagePartHeader {
        name: Some(name.to_string()),
        value: Some(value.to_string()),
    }
}

/// Gmail `format=full` message with a single text/html part
pub fn gmail_message(
    id: &str,
    from: &str,
    subject: &str,
    labels: &[&str],
    html: &str,
    received: DateTime<Utc>,
) -> RawMessage {
    RawMessage::Gmail(Message {
        id: Some(id.to_string()),
        thread_id: Some(format!("thread_{}", id)),
        label_ids: Some(labels.iter().map(|l| l.to_string()).collect()),
        internal_date: Some(received.timestamp_millis()),
        size_estimate: Some(html.len() as i32 + 512),
        payload: Some(MessagePart {
            mime_type: Some("text/html".to_string()),
            headers: Some(vec![
                header("From", from),
                header("To", "me@example.com"),
                header("Subject", subject),
            ]),
            body: Some(MessagePartBody {
                data: Some(html.as_bytes().to_vec()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// RFC 5322 message as an IMAP server would return it
pub fn mime_message(id: &str, from: &str, subject: &str, received: DateTime<Utc>, html: &str) -> RawMessage {
    let raw = format!(
        "From: {}\r\nTo: me@example.com\r\nSubject: {}\r\nDate: {}\r\nMIME-Version: 1.0\r\nContent-Type: text/html; charset=utf-8\r\n\r\n{}\r\n",
        from,
        subject,
        received.to_rfc2822(),
        html
    );
    RawMessage::Mime {
        id: id.to_string(),
        raw: raw.into_bytes(),
        seen: false,
    }
}

mock! {
    pub MailProvider {}

    #[async_trait::async_trait]
    impl MailProvider for MailProvider {
        async fn list_messages(&self, query: &str) -> Result<Vec<String>>;
        async fn get_message(&self, id: &str) -> Result<RawMessage>;
        async fn delete_message(&self, id: &str) -> Result<()>;
        async fn mark_read(&self, id: &str, read: bool) -> Result<()>;
    }
}

mock! {
    pub Deleter {}

    #[async_trait::async_trait]
    impl MessageDeleter for Deleter {
        async fn delete(&self, message_id: &str) -> Result<()>;
    }
}
