//! In-memory messenger: accounts, logins per connection, two-party chats.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tokio::task;
use tracing::{debug, info};

use tandem_core::messages::{InboxItem, MessageItem, MessengerRequest, MessengerResponse};
use tandem_core::ServiceError;

use crate::handler::Handler;
use crate::registry::ConnectionId;

const ERROR_KIND: &str = "MessengerError";

fn messenger_error(message: impl Into<String>) -> ServiceError {
    ServiceError::new(ERROR_KIND, message)
}

#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// bcrypt work factor, 4 to 31.
    pub hash_cost: u32,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            hash_cost: bcrypt::DEFAULT_COST,
        }
    }
}

struct Account {
    /// bcrypt hash in modular crypt format; carries its own salt and cost.
    password_hash: String,
}

// Both run on the blocking pool.
async fn hash_password(password: String, cost: u32) -> Result<String, ServiceError> {
    task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|e| ServiceError::internal(format!("password hashing failed: {e}")))?
        .map_err(|e| ServiceError::internal(format!("password hashing failed: {e}")))
}

async fn verify_password(password: String, hash: String) -> Result<bool, ServiceError> {
    task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| ServiceError::internal(format!("password check failed: {e}")))?
        .map_err(|e| ServiceError::internal(format!("password check failed: {e}")))
}

/// Chats are keyed by the ordered pair of participants.
type ChatKey = (String, String);

fn chat_key(a: &str, b: &str) -> ChatKey {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[derive(Default)]
struct State {
    accounts: HashMap<String, Account>,
    online: HashMap<ConnectionId, String>,
    chats: HashMap<ChatKey, Vec<MessageItem>>,
}

impl State {
    fn current_user(&self, conn: ConnectionId) -> Result<String, ServiceError> {
        self.online
            .get(&conn)
            .cloned()
            .ok_or_else(|| messenger_error("not logged in"))
    }

    fn require_user(&self, username: &str) -> Result<(), ServiceError> {
        if self.accounts.contains_key(username) {
            Ok(())
        } else {
            Err(messenger_error(format!("user {username} not found")))
        }
    }

    fn inbox(&self, user: &str) -> Vec<InboxItem> {
        let mut items: Vec<InboxItem> = self
            .accounts
            .keys()
            .filter(|name| name.as_str() != user)
            .map(|contact| match self.chats.get(&chat_key(user, contact)) {
                Some(messages) => InboxItem {
                    user: contact.clone(),
                    last_modified: messages.last().map(|m| m.timestamp),
                    unread_count: messages
                        .iter()
                        .filter(|m| m.receiver == user && !m.seen)
                        .count(),
                },
                None => InboxItem {
                    user: contact.clone(),
                    last_modified: None,
                    unread_count: 0,
                },
            })
            .collect();
        items.sort_by(inbox_order);
        items
    }
}

/// Unread first, then most recently active, then by name.
fn inbox_order(a: &InboxItem, b: &InboxItem) -> Ordering {
    b.is_unread()
        .cmp(&a.is_unread())
        .then_with(|| b.last_modified.cmp(&a.last_modified))
        .then_with(|| a.user.cmp(&b.user))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The messenger service. One login per connection; disconnecting logs out.
#[derive(Default)]
pub struct MessengerService {
    state: Mutex<State>,
    config: MessengerConfig,
}

impl MessengerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MessengerConfig) -> Self {
        Self {
            state: Mutex::default(),
            config,
        }
    }

    /// Number of registered accounts.
    pub async fn user_count(&self) -> usize {
        self.state.lock().await.accounts.len()
    }

    /// Number of connections currently logged in.
    pub async fn online_count(&self) -> usize {
        self.state.lock().await.online.len()
    }
}

impl Handler for MessengerService {
    type Request = MessengerRequest;
    type Response = MessengerResponse;

    async fn handle(
        &self,
        conn: ConnectionId,
        request: MessengerRequest,
    ) -> Result<MessengerResponse, ServiceError> {
        match request {
            MessengerRequest::CheckUsername { username } => {
                let state = self.state.lock().await;
                Ok(MessengerResponse::UsernameAvailable(
                    !state.accounts.contains_key(&username),
                ))
            }

            // Password work happens without the state lock held.
            MessengerRequest::SignUp { username, password } => {
                if username.is_empty() {
                    return Err(messenger_error("username must not be empty"));
                }
                let taken = || messenger_error(format!("username {username} already exists"));
                if self.state.lock().await.accounts.contains_key(&username) {
                    return Err(taken());
                }
                let password_hash = hash_password(password, self.config.hash_cost).await?;

                let mut state = self.state.lock().await;
                if state.accounts.contains_key(&username) {
                    return Err(taken());
                }
                state.accounts.insert(username.clone(), Account { password_hash });
                info!(conn_id = conn, user = %username, "account created");
                Ok(MessengerResponse::Done)
            }

            MessengerRequest::Login { username, password } => {
                let password_hash = self
                    .state
                    .lock()
                    .await
                    .accounts
                    .get(&username)
                    .map(|account| account.password_hash.clone())
                    .ok_or_else(|| messenger_error(format!("username {username} not found")))?;
                if !verify_password(password, password_hash).await? {
                    return Err(messenger_error("invalid password"));
                }
                debug!(conn_id = conn, user = %username, "logged in");
                self.state.lock().await.online.insert(conn, username);
                Ok(MessengerResponse::Done)
            }

            MessengerRequest::Logout => {
                let mut state = self.state.lock().await;
                let user = state.online.remove(&conn).ok_or_else(|| messenger_error("not logged in"))?;
                debug!(conn_id = conn, user = %user, "logged out");
                Ok(MessengerResponse::Done)
            }

            MessengerRequest::GetInbox => {
                let state = self.state.lock().await;
                let user = state.current_user(conn)?;
                Ok(MessengerResponse::Inbox(state.inbox(&user)))
            }

            MessengerRequest::SendMessage { to, text } => {
                let mut state = self.state.lock().await;
                let user = state.current_user(conn)?;
                state.require_user(&to)?;
                let message = MessageItem {
                    sender: user.clone(),
                    receiver: to.clone(),
                    text,
                    timestamp: now_millis(),
                    seen: false,
                };
                state.chats.entry(chat_key(&user, &to)).or_default().push(message);
                Ok(MessengerResponse::Done)
            }

            MessengerRequest::ReadMessages { contact, count } => {
                let mut state = self.state.lock().await;
                let user = state.current_user(conn)?;
                state.require_user(&contact)?;
                let messages = state
                    .chats
                    .get_mut(&chat_key(&user, &contact))
                    .ok_or_else(|| messenger_error(format!("contact {contact} not found")))?;

                // A count of zero returns the whole history.
                let start = if count == 0 {
                    0
                } else {
                    messages.len().saturating_sub(count)
                };
                let window = &mut messages[start..];
                for message in window.iter_mut() {
                    if message.receiver == user {
                        message.seen = true;
                    }
                }
                Ok(MessengerResponse::Messages(window.to_vec()))
            }
        }
    }

    async fn disconnected(&self, conn: ConnectionId) {
        if let Some(user) = self.state.lock().await.online.remove(&conn) {
            debug!(conn_id = conn, user = %user, "logged out on disconnect");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> MessengerService {
        MessengerService::with_config(MessengerConfig { hash_cost: 4 })
    }

    async fn call(svc: &MessengerService, conn: ConnectionId, req: MessengerRequest) -> Result<MessengerResponse, ServiceError> {
        svc.handle(conn, req).await
    }

    async fn signup_and_login(svc: &MessengerService, conn: ConnectionId, name: &str) {
        call(svc, conn, MessengerRequest::SignUp { username: name.into(), password: "pw".into() })
            .await
            .unwrap();
        call(svc, conn, MessengerRequest::Login { username: name.into(), password: "pw".into() })
            .await
            .unwrap();
    }

    async fn send(svc: &MessengerService, conn: ConnectionId, to: &str, text: &str) {
        call(svc, conn, MessengerRequest::SendMessage { to: to.into(), text: text.into() })
            .await
            .unwrap();
    }

    async fn inbox(svc: &MessengerService, conn: ConnectionId) -> Vec<InboxItem> {
        match call(svc, conn, MessengerRequest::GetInbox).await.unwrap() {
            MessengerResponse::Inbox(items) => items,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn signup_twice_fails_and_username_becomes_taken() {
        let svc = service();
        assert_eq!(
            call(&svc, 1, MessengerRequest::CheckUsername { username: "ann".into() }).await.unwrap(),
            MessengerResponse::UsernameAvailable(true)
        );
        call(&svc, 1, MessengerRequest::SignUp { username: "ann".into(), password: "x".into() })
            .await
            .unwrap();
        let err = call(&svc, 2, MessengerRequest::SignUp { username: "ann".into(), password: "y".into() })
            .await
            .unwrap_err();
        assert_eq!(err, ServiceError::new("MessengerError", "username ann already exists"));
        assert_eq!(
            call(&svc, 1, MessengerRequest::CheckUsername { username: "ann".into() }).await.unwrap(),
            MessengerResponse::UsernameAvailable(false)
        );
    }

    #[tokio::test]
    async fn login_checks_password() {
        let svc = service();
        call(&svc, 1, MessengerRequest::SignUp { username: "ann".into(), password: "right".into() })
            .await
            .unwrap();
        let err = call(&svc, 1, MessengerRequest::Login { username: "ann".into(), password: "wrong".into() })
            .await
            .unwrap_err();
        assert_eq!(err.message, "invalid password");
        let err = call(&svc, 1, MessengerRequest::Login { username: "bob".into(), password: "right".into() })
            .await
            .unwrap_err();
        assert_eq!(err.message, "username bob not found");
        call(&svc, 1, MessengerRequest::Login { username: "ann".into(), password: "right".into() })
            .await
            .unwrap();
        assert_eq!(svc.online_count().await, 1);
    }

    #[tokio::test]
    async fn stored_passwords_are_salted_bcrypt_hashes() {
        let a = hash_password("secret".into(), 4).await.unwrap();
        let b = hash_password("secret".into(), 4).await.unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("$2b$04$"));
        assert!(verify_password("secret".into(), a.clone()).await.unwrap());
        assert!(!verify_password("Secret".into(), a).await.unwrap());

        let svc = service();
        call(&svc, 1, MessengerRequest::SignUp { username: "ann".into(), password: "secret".into() })
            .await
            .unwrap();
        let stored = svc.state.lock().await.accounts["ann"].password_hash.clone();
        assert!(!stored.contains("secret"));
        assert!(bcrypt::verify("secret", &stored).unwrap());
    }

    #[tokio::test]
    async fn concurrent_signups_for_one_name_create_one_account() {
        let svc = std::sync::Arc::new(service());
        let attempts: Vec<_> = (0..4)
            .map(|i| {
                let svc = svc.clone();
                tokio::spawn(async move {
                    svc.handle(i, MessengerRequest::SignUp { username: "ann".into(), password: format!("pw{i}") })
                        .await
                })
            })
            .collect();
        let mut created = 0;
        for attempt in attempts {
            if attempt.await.unwrap().is_ok() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(svc.user_count().await, 1);
    }

    #[tokio::test]
    async fn requests_require_login() {
        let svc = service();
        let err = call(&svc, 9, MessengerRequest::GetInbox).await.unwrap_err();
        assert_eq!(err.message, "not logged in");
        let err = call(&svc, 9, MessengerRequest::Logout).await.unwrap_err();
        assert_eq!(err.message, "not logged in");
    }

    #[tokio::test]
    async fn messages_mark_seen_for_receiver_only() {
        let svc = service();
        signup_and_login(&svc, 1, "ann").await;
        signup_and_login(&svc, 2, "bob").await;

        send(&svc, 1, "bob", "hi").await;
        send(&svc, 1, "bob", "there").await;

        let bob_inbox = inbox(&svc, 2).await;
        assert_eq!(bob_inbox[0].user, "ann");
        assert_eq!(bob_inbox[0].unread_count, 2);

        // Sender reading does not mark anything seen.
        call(&svc, 1, MessengerRequest::ReadMessages { contact: "bob".into(), count: 10 })
            .await
            .unwrap();
        assert_eq!(inbox(&svc, 2).await[0].unread_count, 2);

        let read = call(&svc, 2, MessengerRequest::ReadMessages { contact: "ann".into(), count: 1 })
            .await
            .unwrap();
        match read {
            MessengerResponse::Messages(items) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].text, "there");
                assert!(items[0].seen);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(inbox(&svc, 2).await[0].unread_count, 1);

        let all = call(&svc, 2, MessengerRequest::ReadMessages { contact: "ann".into(), count: 0 })
            .await
            .unwrap();
        assert!(matches!(all, MessengerResponse::Messages(items) if items.len() == 2));
        assert_eq!(inbox(&svc, 2).await[0].unread_count, 0);
    }

    #[tokio::test]
    async fn unknown_contact_and_missing_chat() {
        let svc = service();
        signup_and_login(&svc, 1, "ann").await;
        signup_and_login(&svc, 2, "bob").await;

        let err = call(&svc, 1, MessengerRequest::SendMessage { to: "zed".into(), text: "?".into() })
            .await
            .unwrap_err();
        assert_eq!(err.message, "user zed not found");
        let err = call(&svc, 1, MessengerRequest::ReadMessages { contact: "bob".into(), count: 5 })
            .await
            .unwrap_err();
        assert_eq!(err.message, "contact bob not found");
    }

    #[test]
    fn inbox_orders_unread_then_recent_then_name() {
        let item = |user: &str, last: Option<u64>, unread: usize| InboxItem {
            user: user.into(),
            last_modified: last,
            unread_count: unread,
        };
        let mut items = vec![
            item("dave", None, 0),
            item("carl", Some(10), 0),
            item("bea", Some(5), 1),
            item("abe", None, 0),
            item("eve", Some(20), 0),
            item("fay", Some(1), 3),
        ];
        items.sort_by(inbox_order);
        let names: Vec<_> = items.iter().map(|i| i.user.as_str()).collect();
        assert_eq!(names, ["bea", "fay", "eve", "carl", "abe", "dave"]);
    }

    #[tokio::test]
    async fn inbox_lists_every_other_user() {
        let svc = service();
        signup_and_login(&svc, 1, "ann").await;
        for name in ["cat", "bob"] {
            call(&svc, 5, MessengerRequest::SignUp { username: name.into(), password: "pw".into() })
                .await
                .unwrap();
        }
        let items = inbox(&svc, 1).await;
        let names: Vec<_> = items.iter().map(|i| i.user.as_str()).collect();
        assert_eq!(names, ["bob", "cat"]);
        assert!(items.iter().all(|i| i.last_modified.is_none() && !i.is_unread()));
    }

    #[tokio::test]
    async fn disconnect_logs_out() {
        let svc = service();
        signup_and_login(&svc, 1, "ann").await;
        assert_eq!(svc.online_count().await, 1);
        svc.disconnected(1).await;
        assert_eq!(svc.online_count().await, 0);
        assert_eq!(svc.user_count().await, 1);
    }
}
