//! Card streaming state machine.
//!
//! One [`StreamingCard`] per conversation:
//!
//! ```text
//! idle → created → updating → finished
//!                     │
//!                     └──────→ failed
//! ```
//!
//! `start` creates the card entity and posts it into the chat; every
//! snapshot pushes the cumulative content into the card's markdown
//! element with an increasing sequence number; the final snapshot turns
//! streaming mode off. Any API failure parks the card in `failed`, after
//! which the final content falls back to a plain card send. Cards older
//! than 90 minutes force an eager token refresh before the next update.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::api::FeishuClient;
use super::markdown::build_card_elements;

/// The markdown element rewritten by streaming updates.
const STREAM_ELEMENT_ID: &str = "md_stream";

/// Cards older than this force an eager token refresh before updating.
const CARD_MAX_AGE: Duration = Duration::from_secs(90 * 60);

/// Lifecycle of a streamed card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    /// Card entity created and posted, no update yet.
    Created,
    /// At least one streaming update succeeded.
    Updating,
    /// Final update applied; the card is closed.
    Finished,
    /// An API call failed; later snapshots use plain sends.
    Failed,
}

struct StreamingCard {
    card_id: String,
    sequence: i64,
    created_at: Instant,
    last_content: String,
    state: CardState,
}

/// Per-conversation card streaming state.
pub struct CardStreamManager {
    client: Arc<FeishuClient>,
    cards: Mutex<HashMap<String, StreamingCard>>,
}

impl CardStreamManager {
    /// Create a manager over the given API client.
    pub fn new(client: Arc<FeishuClient>) -> Self {
        Self {
            client,
            cards: Mutex::new(HashMap::new()),
        }
    }

    /// Current state of a conversation's card, if one exists.
    pub async fn state(&self, chat_id: &str) -> Option<CardState> {
        self.cards.lock().await.get(chat_id).map(|c| c.state)
    }

    /// Create the card for a new streamed turn and post it to the chat.
    pub async fn start(&self, chat_id: &str) {
        let receive_id_type = receive_id_type(chat_id);

        let card_id = match self.client.create_card(STREAM_ELEMENT_ID).await {
            Ok(card_id) => card_id,
            Err(e) => {
                error!(chat_id, error = %e, "card creation failed");
                return;
            }
        };

        if let Err(e) = self.client.send_card(receive_id_type, chat_id, &card_id).await {
            error!(chat_id, error = %e, "card message send failed");
            return;
        }

        info!(chat_id, card = %card_id, "streaming card created");
        self.cards.lock().await.insert(
            chat_id.to_owned(),
            StreamingCard {
                card_id,
                sequence: 0,
                created_at: Instant::now(),
                last_content: String::new(),
                state: CardState::Created,
            },
        );
    }

    /// Push a cumulative snapshot into the chat's card.
    pub async fn handle_chunk(&self, chat_id: &str, text: &str, is_final: bool) {
        let mut cards = self.cards.lock().await;

        let Some(card) = cards.get_mut(chat_id) else {
            // No card (creation failed or never started): deliver the
            // final content as a plain card message instead.
            drop(cards);
            if is_final {
                self.send_plain(chat_id, text).await;
            }
            return;
        };

        if card.state == CardState::Failed {
            let content = text.to_owned();
            if is_final {
                cards.remove(chat_id);
                drop(cards);
                self.send_plain(chat_id, &content).await;
            }
            return;
        }

        // Long-lived cards outlive the token's TTL; refresh eagerly.
        if card.created_at.elapsed() > CARD_MAX_AGE {
            self.client.invalidate_token().await;
        }

        if !is_final && card.last_content == text {
            return;
        }

        card.sequence += 1;
        let update = self
            .client
            .update_card_element(&card.card_id, STREAM_ELEMENT_ID, text, card.sequence)
            .await;

        match update {
            Ok(()) => {
                card.last_content = text.to_owned();
                if card.state == CardState::Created {
                    card.state = CardState::Updating;
                }
            }
            Err(e) => {
                warn!(chat_id, error = %e, "card update failed, falling back to plain sends");
                card.state = CardState::Failed;
                if is_final {
                    let content = text.to_owned();
                    cards.remove(chat_id);
                    drop(cards);
                    self.send_plain(chat_id, &content).await;
                }
                return;
            }
        }

        if is_final {
            card.sequence += 1;
            if let Err(e) = self.client.finalize_card(&card.card_id, card.sequence).await {
                warn!(chat_id, error = %e, "card finalize failed");
            }
            card.state = CardState::Finished;
            debug!(chat_id, "streaming card finished");
            cards.remove(chat_id);
        }
    }

    async fn send_plain(&self, chat_id: &str, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let card = serde_json::json!({
            "config": {"wide_screen_mode": true},
            "elements": build_card_elements(text),
        });
        if let Err(e) = self
            .client
            .send_message(receive_id_type(chat_id), chat_id, "interactive", &card.to_string())
            .await
        {
            error!(chat_id, error = %e, "plain fallback send failed");
        }
    }
}

/// Group chats are addressed by `chat_id`, direct chats by `open_id`.
pub(super) fn receive_id_type(chat_id: &str) -> &'static str {
    if chat_id.starts_with("oc_") {
        "chat_id"
    } else {
        "open_id"
    }
}
