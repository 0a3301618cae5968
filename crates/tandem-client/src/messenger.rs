//! Typed wrapper for the messenger request family.

use std::sync::Arc;

use tandem_core::messages::{InboxItem, MessageItem, MessengerRequest, MessengerResponse};
use tandem_core::{TandemError, TandemResult};

use crate::client::TandemClient;

pub struct MessengerClient {
    client: Arc<TandemClient>,
}

impl MessengerClient {
    pub fn new(client: Arc<TandemClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<TandemClient> {
        &self.client
    }

    pub async fn sign_up(&self, username: &str, password: &str) -> TandemResult<()> {
        self.done(MessengerRequest::SignUp {
            username: username.to_string(),
            password: password.to_string(),
        })
        .await
    }

    pub async fn login(&self, username: &str, password: &str) -> TandemResult<()> {
        self.done(MessengerRequest::Login {
            username: username.to_string(),
            password: password.to_string(),
        })
        .await
    }

    pub async fn logout(&self) -> TandemResult<()> {
        self.done(MessengerRequest::Logout).await
    }

    pub async fn inbox(&self) -> TandemResult<Vec<InboxItem>> {
        match self.ask(MessengerRequest::GetInbox).await? {
            MessengerResponse::Inbox(items) => Ok(items),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn send_message(&self, to: &str, text: &str) -> TandemResult<()> {
        self.done(MessengerRequest::SendMessage {
            to: to.to_string(),
            text: text.to_string(),
        })
        .await
    }

    /// The last `count` messages exchanged with `contact`, oldest first.
    pub async fn read_messages(&self, contact: &str, count: usize) -> TandemResult<Vec<MessageItem>> {
        let request = MessengerRequest::ReadMessages {
            contact: contact.to_string(),
            count,
        };
        match self.ask(request).await? {
            MessengerResponse::Messages(items) => Ok(items),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn is_username_available(&self, username: &str) -> TandemResult<bool> {
        let request = MessengerRequest::CheckUsername {
            username: username.to_string(),
        };
        match self.ask(request).await? {
            MessengerResponse::UsernameAvailable(available) => Ok(available),
            other => Err(unexpected(&other)),
        }
    }

    async fn ask(&self, request: MessengerRequest) -> TandemResult<MessengerResponse> {
        self.client.ask(&request).await
    }

    async fn done(&self, request: MessengerRequest) -> TandemResult<()> {
        match self.ask(request).await? {
            MessengerResponse::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &MessengerResponse) -> TandemError {
    TandemError::Other(format!("unexpected messenger response: {response:?}"))
}
