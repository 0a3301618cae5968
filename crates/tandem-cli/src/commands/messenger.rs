//! `tandem messenger ...`: one-shot messenger requests.
//!
//! Logins last for one connection, so commands that need an account log in
//! first and log out when done.

use anyhow::{Context, Result};
use tandem_client::{ClientConfig, MessengerClient};

use super::{disconnect, Endpoint};

/// Account credentials for commands that act as a user.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

pub async fn run_available(endpoint: &Endpoint, config: ClientConfig, username: &str) -> Result<()> {
    let client = endpoint.connect(config).await?;
    let messenger = MessengerClient::new(client.clone());
    let result = messenger.is_username_available(username).await;
    disconnect(&client).await;

    if result.context("availability check failed")? {
        println!("{username} is available");
    } else {
        println!("{username} is taken");
    }
    Ok(())
}

pub async fn run_signup(endpoint: &Endpoint, config: ClientConfig, username: &str, password: &str) -> Result<()> {
    let client = endpoint.connect(config).await?;
    let messenger = MessengerClient::new(client.clone());
    let result = messenger.sign_up(username, password).await;
    disconnect(&client).await;

    result.with_context(|| format!("failed to sign up {username}"))?;
    println!("signed up {username}");
    Ok(())
}

pub async fn run_inbox(endpoint: &Endpoint, config: ClientConfig, creds: &Credentials) -> Result<()> {
    let client = endpoint.connect(config).await?;
    let messenger = MessengerClient::new(client.clone());
    let result = async {
        login(&messenger, creds).await?;
        let inbox = messenger.inbox().await.context("failed to fetch inbox")?;
        messenger.logout().await?;
        Ok::<_, anyhow::Error>(inbox)
    }
    .await;
    disconnect(&client).await;

    let inbox = result?;
    if inbox.is_empty() {
        println!("No contacts yet.");
        return Ok(());
    }
    println!("{:<20} {}", "CONTACT", "UNREAD");
    for item in &inbox {
        println!("{:<20} {}", item.user, item.unread_count);
    }
    Ok(())
}

pub async fn run_send(
    endpoint: &Endpoint,
    config: ClientConfig,
    creds: &Credentials,
    to: &str,
    text: &str,
) -> Result<()> {
    let client = endpoint.connect(config).await?;
    let messenger = MessengerClient::new(client.clone());
    let result = async {
        login(&messenger, creds).await?;
        messenger
            .send_message(to, text)
            .await
            .with_context(|| format!("failed to message {to}"))?;
        messenger.logout().await?;
        Ok::<_, anyhow::Error>(())
    }
    .await;
    disconnect(&client).await;
    result
}

pub async fn run_read(
    endpoint: &Endpoint,
    config: ClientConfig,
    creds: &Credentials,
    contact: &str,
    count: usize,
) -> Result<()> {
    let client = endpoint.connect(config).await?;
    let messenger = MessengerClient::new(client.clone());
    let result = async {
        login(&messenger, creds).await?;
        let messages = messenger
            .read_messages(contact, count)
            .await
            .with_context(|| format!("failed to read messages with {contact}"))?;
        messenger.logout().await?;
        Ok::<_, anyhow::Error>(messages)
    }
    .await;
    disconnect(&client).await;

    for message in result? {
        println!("[{}] {}: {}", message.timestamp, message.sender, message.text);
    }
    Ok(())
}

async fn login(messenger: &MessengerClient, creds: &Credentials) -> Result<()> {
    messenger
        .login(&creds.user, &creds.password)
        .await
        .with_context(|| format!("failed to log in as {}", creds.user))
}
