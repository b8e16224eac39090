//! Generic IMAP provider over implicit TLS

use async_imap::types::Flag;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashSet;
use std::env;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};

use crate::client::MailProvider;
use crate::config::ImapConfig;
use crate::error::{CleanupError, Result};
use crate::parser::RawMessage;

type ImapSession = async_imap::Session<Compat<TlsStream<TcpStream>>>;

/// Mailbox on an IMAP server; message ids are UIDs in the selected mailbox
pub struct ImapProvider {
    session: Mutex<ImapSession>,
    mailbox: String,
    max_messages: usize,
    /// Server advertises UIDPLUS, so `UID EXPUNGE` is available
    uidplus: bool,
}

impl ImapProvider {
    /// Connect with the password from `IMAP_PASSWORD`
    pub async fn connect_from_env(config: &ImapConfig, max_messages: usize) -> Result<Self> {
        let password = password_from(env::var("IMAP_PASSWORD").ok())?;
        Self::connect(config, &password, max_messages).await
    }

    /// TLS handshake, LOGIN and SELECT of the configured mailbox
    pub async fn connect(config: &ImapConfig, password: &str, max_messages: usize) -> Result<Self> {
        let tls = connect_tls(&config.host, config.port).await?;

        let client = async_imap::Client::new(tls);
        let mut session = client
            .login(&config.username, password)
            .await
            .map_err(|e| CleanupError::AuthError(format!("IMAP login failed: {}", e.0)))?;

        session
            .select(&config.mailbox)
            .await
            .map_err(|e| imap_error("SELECT", e))?;

        let uidplus = session
            .capabilities()
            .await
            .map_err(|e| imap_error("CAPABILITY", e))?
            .has_str("UIDPLUS");

        info!(host = %config.host, mailbox = %config.mailbox, uidplus, "IMAP session ready");
        Ok(Self {
            session: Mutex::new(session),
            mailbox: config.mailbox.clone(),
            max_messages,
            uidplus,
        })
    }

    /// Set or clear one flag on a UID and wait for the server to confirm
    async fn store(&self, uid: u32, command: &str) -> Result<()> {
        let mut session = self.session.lock().await;
        let updates = session
            .uid_store(uid.to_string(), command)
            .await
            .map_err(|e| imap_error("STORE", e))?;
        drain_stream(updates)
            .await
            .map_err(|e| imap_error("STORE", e))
    }

    /// Log out cleanly; dropping the provider just closes the socket
    pub async fn logout(self) -> Result<()> {
        let mut session = self.session.into_inner();
        session.logout().await.map_err(|e| imap_error("LOGOUT", e))
    }
}

async fn connect_tls(host: &str, port: u16) -> Result<Compat<TlsStream<TcpStream>>> {
    let tcp_stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| CleanupError::NetworkError(format!("TCP connect to {}:{} failed: {}", host, port, e)))?;

    let config = ClientConfig::builder()
        .with_root_certificates(RootCertStore::from_iter(
            webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
        ))
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| CleanupError::ConfigError(format!("Invalid IMAP host '{}': {}", host, e)))?;

    let tls_stream = connector
        .connect(server_name, tcp_stream)
        .await
        .map_err(|e| CleanupError::NetworkError(format!("TLS handshake failed: {}", e)))?;

    Ok(tls_stream.compat())
}

async fn drain_stream<T, E>(
    stream: impl futures::Stream<Item = std::result::Result<T, E>>,
) -> std::result::Result<(), E> {
    futures::pin_mut!(stream);
    while let Some(result) = stream.next().await {
        result?;
    }
    Ok(())
}

fn password_from(value: Option<String>) -> Result<String> {
    value
        .filter(|p| !p.is_empty())
        .ok_or_else(|| CleanupError::ConfigError("IMAP_PASSWORD not set".to_string()))
}

/// How a `\Deleted` message is removed for good
#[derive(Debug, Clone, PartialEq, Eq)]
enum Expunge {
    /// `UID EXPUNGE` (UIDPLUS), limited to these UIDs
    Uids(String),
    /// Plain `EXPUNGE`; also removes anything else flagged `\Deleted`
    Mailbox,
}

impl Expunge {
    fn for_uid(uidplus: bool, uid: u32) -> Self {
        if uidplus {
            Expunge::Uids(uid.to_string())
        } else {
            Expunge::Mailbox
        }
    }
}

fn imap_error(command: &str, error: impl std::fmt::Display) -> CleanupError {
    CleanupError::ApiError(format!("IMAP {} failed: {}", command, error))
}

fn parse_uid(id: &str) -> Result<u32> {
    id.trim()
        .parse()
        .map_err(|_| CleanupError::InvalidMessageFormat(format!("Invalid IMAP UID '{}'", id)))
}

/// SEARCH criteria; blank means every message
fn search_criteria(query: &str) -> &str {
    let query = query.trim();
    if query.is_empty() {
        "ALL"
    } else {
        query
    }
}

/// Highest UIDs first, capped at `max`
fn newest_first(uids: HashSet<u32>, max: usize) -> Vec<String> {
    let mut uids: Vec<u32> = uids.into_iter().collect();
    uids.sort_unstable_by(|a, b| b.cmp(a));
    uids.truncate(max);
    uids.into_iter().map(|u| u.to_string()).collect()
}

#[async_trait]
impl MailProvider for ImapProvider {
    async fn list_messages(&self, query: &str) -> Result<Vec<String>> {
        let criteria = search_criteria(query);
        let uids = {
            let mut session = self.session.lock().await;
            session
                .uid_search(criteria)
                .await
                .map_err(|e| imap_error("SEARCH", e))?
        };

        let ids = newest_first(uids, self.max_messages);
        debug!(count = ids.len(), mailbox = %self.mailbox, criteria, "Listed IMAP messages");
        Ok(ids)
    }

    async fn get_message(&self, id: &str) -> Result<RawMessage> {
        let uid = parse_uid(id)?;
        let mut session = self.session.lock().await;

        // PEEK leaves \Seen untouched
        let fetches = session
            .uid_fetch(uid.to_string(), "(UID FLAGS BODY.PEEK[])")
            .await
            .map_err(|e| imap_error("FETCH", e))?;
        futures::pin_mut!(fetches);

        let mut found = None;
        while let Some(fetch) = fetches.next().await {
            let fetch = fetch.map_err(|e| imap_error("FETCH", e))?;
            if found.is_some() || fetch.uid != Some(uid) {
                continue;
            }
            if let Some(body) = fetch.body() {
                let seen = fetch.flags().any(|flag| matches!(flag, Flag::Seen));
                found = Some(RawMessage::Mime {
                    id: id.to_string(),
                    raw: body.to_vec(),
                    seen,
                });
            }
        }

        found.ok_or_else(|| CleanupError::MessageNotFound(format!("UID {} in {}", uid, self.mailbox)))
    }

    async fn delete_message(&self, id: &str) -> Result<()> {
        let uid = parse_uid(id)?;
        self.store(uid, "+FLAGS (\\Deleted)").await?;

        let mut session = self.session.lock().await;
        match Expunge::for_uid(self.uidplus, uid) {
            Expunge::Uids(uid_set) => {
                let expunged = session
                    .uid_expunge(uid_set)
                    .await
                    .map_err(|e| imap_error("UID EXPUNGE", e))?;
                drain_stream(expunged)
                    .await
                    .map_err(|e| imap_error("UID EXPUNGE", e))
            }
            Expunge::Mailbox => {
                warn!(uid, mailbox = %self.mailbox, "Server lacks UIDPLUS, expunging whole mailbox");
                let expunged = session
                    .expunge()
                    .await
                    .map_err(|e| imap_error("EXPUNGE", e))?;
                drain_stream(expunged)
                    .await
                    .map_err(|e| imap_error("EXPUNGE", e))
            }
        }
    }

    async fn mark_read(&self, id: &str, read: bool) -> Result<()> {
        let uid = parse_uid(id)?;
        let command = if read {
            "+FLAGS (\\Seen)"
        } else {
            "-FLAGS (\\Seen)"
        };
        self.store(uid, command).await
    }
}
