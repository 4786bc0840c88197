//! Update listener: Telegram updates → platform events.

use std::sync::Arc;

use maren_core::platform::{PlatformEvent, PlatformMessage};
use maren_core::{PlatformMessageId, UserId};
use teloxide::prelude::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::platform::TelegramPlatform;

/// Run the update loop until cancelled. Every private text message is
/// recorded into the transport registry and forwarded as a
/// [`PlatformEvent`]; the daemon bridges the channel into the ingress
/// adapter.
pub async fn run_listener(
    platform: Arc<TelegramPlatform>,
    events: mpsc::Sender<PlatformEvent>,
    cancel: CancellationToken,
) {
    let bot = platform.bot();
    let handler = Update::filter_message().endpoint(on_message);

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![platform, events])
        .default_handler(|_| async {})
        .build();

    let shutdown = dispatcher.shutdown_token();
    let watcher = tokio::spawn(async move {
        cancel.cancelled().await;
        if let Ok(wait) = shutdown.shutdown() {
            wait.await;
        }
    });

    info!("telegram update listener up");
    dispatcher.dispatch().await;
    watcher.abort();
    info!("telegram update listener down");
}

async fn on_message(
    message: Message,
    platform: Arc<TelegramPlatform>,
    events: mpsc::Sender<PlatformEvent>,
) -> ResponseResult<()> {
    if !message.chat.is_private() {
        return Ok(());
    }
    let Some(text) = message.text() else {
        return Ok(());
    };

    let user_id = UserId(message.chat.id.0);
    if let Some(from) = &message.from {
        platform.record_name(user_id, &from.first_name);
    }
    let inbound = PlatformMessage {
        id: PlatformMessageId(i64::from(message.id.0)),
        user_id,
        text: text.to_owned(),
        sent_at: message.date,
    };
    platform.record(inbound.clone());
    if let Err(err) = events.send(PlatformEvent::Message(inbound)).await {
        warn!(%err, "event channel closed, dropping update");
    }
    Ok(())
}
