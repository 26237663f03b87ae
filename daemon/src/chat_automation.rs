//! Chat Automation (C6), per spec.md §4.8.
//!
//! A step-indexed script per transaction. Steps are data (template text,
//! expected-reply classifier) but the branch taken after classification is
//! expressed in code, the same way the step table in Design Notes §9 is
//! "a table of `(fromStep, messageClassifier) -> (action, toStep)` rows"
//! once you account for the "stupid" branch every step can take.

use crate::account_registry::AccountRegistry;
use crate::event_bus::EventBus;
use crate::store::Store;
use crate::transaction_fsm;
use model::{ChatContentType, Payout, Sender as ChatSender, Transaction, TransactionId, TransactionStatus};
use std::sync::Arc;
use tracing::{info, warn};

const STEP_GREETING: u32 = 0;
const STEP_BANK_CONFIRM: u32 = 1;
const STEP_PAYMENT_INSTRUCTIONS: u32 = 2;
const STEP_AWAITING_RECEIPT: u32 = 3;
const STEP_RELEASE_NOTICE: u32 = 4;

pub struct ChatAutomation {
    store: Arc<dyn Store>,
    registry: Arc<AccountRegistry>,
    events: Arc<EventBus>,
}

impl ChatAutomation {
    pub fn new(store: Arc<dyn Store>, registry: Arc<AccountRegistry>, events: Arc<EventBus>) -> Self {
        Self {
            store,
            registry,
            events,
        }
    }

    /// Sends the step-0 greeting, called by Order Discovery the first time a
    /// transaction reaches `chat_started` (§4.6 step 6).
    pub async fn start(&self, transaction_id: TransactionId) -> anyhow::Result<()> {
        let Some(tx) = self.store.find_transaction(transaction_id).await? else {
            return Ok(());
        };
        if tx.status != TransactionStatus::ChatStarted {
            return Ok(());
        }
        self.send_step(&tx, STEP_GREETING, greeting_template()).await
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        for tx in self.store.list_non_terminal_transactions().await? {
            if let Err(err) = self.process(tx.id, tx).await {
                warn!(error = %err, "chat automation step failed");
            }
        }
        Ok(())
    }

    async fn process(&self, transaction_id: TransactionId, tx: Transaction) -> anyhow::Result<()> {
        let Some(payout) = self.store.find_payout(&tx.payout_id).await? else {
            return Ok(());
        };

        match tx.status {
            TransactionStatus::ChatStarted if tx.chat_step == STEP_GREETING => {
                self.handle_greeting_reply(&tx).await
            }
            TransactionStatus::ChatStarted if tx.chat_step == STEP_BANK_CONFIRM => {
                self.handle_bank_reply(&tx, &payout).await
            }
            TransactionStatus::PaymentReceived => self.handle_payment_received(&tx).await,
            TransactionStatus::CheckReceived if tx.chat_step < STEP_RELEASE_NOTICE => {
                self.send_step(&tx, STEP_RELEASE_NOTICE, release_notice_template())
                    .await
            }
            _ => Ok(()),
        }?;
        let _ = transaction_id;
        Ok(())
    }

    /// Marks the reply processed only once its corresponding outbound step
    /// has actually gone out, so a transient send failure leaves the reply
    /// unprocessed and retried on the next tick (§7's transient-retry rule)
    /// instead of stranding the transaction at the same chat step forever.
    async fn handle_greeting_reply(&self, tx: &Transaction) -> anyhow::Result<()> {
        let Some(reply) = self.latest_unprocessed_reply(tx.id).await? else {
            return Ok(());
        };
        match classify_yes_no(&reply.body) {
            Some(true) => {
                self.send_step(tx, STEP_BANK_CONFIRM, bank_confirm_template())
                    .await?;
                self.store.mark_chat_message_processed(reply.id).await?;
                Ok(())
            }
            Some(false) => {
                self.mark_stupid(tx).await?;
                self.store.mark_chat_message_processed(reply.id).await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn handle_bank_reply(&self, tx: &Transaction, payout: &Payout) -> anyhow::Result<()> {
        let Some(reply) = self.latest_unprocessed_reply(tx.id).await? else {
            return Ok(());
        };

        let claimed_bank = reply.body.trim().to_lowercase();
        let expected_bank = payout.bank_name.trim().to_lowercase();
        if !expected_bank.is_empty() && claimed_bank.contains(&expected_bank) {
            self.send_step(tx, STEP_PAYMENT_INSTRUCTIONS, payment_instructions_template(payout))
                .await?;
            self.store.mark_chat_message_processed(reply.id).await?;
            transaction_fsm::transition(
                self.store.as_ref(),
                &self.events,
                tx.id,
                TransactionStatus::ChatStarted,
                TransactionStatus::WaitingPayment,
                None,
            )
            .await?;
            Ok(())
        } else {
            warn!(transaction_id = %tx.id, claimed_bank, expected_bank, "bank mismatch, classifying as junk");
            self.mark_stupid(tx).await?;
            self.store.mark_chat_message_processed(reply.id).await?;
            Ok(())
        }
    }

    async fn handle_payment_received(&self, tx: &Transaction) -> anyhow::Result<()> {
        if tx.chat_step < STEP_AWAITING_RECEIPT {
            self.store.set_chat_step(tx.id, STEP_AWAITING_RECEIPT).await?;
        }
        let messages = self.store.list_recent_chat_messages(tx.id, 10).await?;
        for message in messages {
            if message.processed || message.sender != ChatSender::Them {
                continue;
            }
            if matches!(message.content_type, ChatContentType::Image | ChatContentType::Pdf) {
                info!(transaction_id = %tx.id, "receipt attachment observed in chat, awaiting email match");
                self.store.mark_chat_message_processed(message.id).await?;
            }
        }
        Ok(())
    }

    async fn mark_stupid(&self, tx: &Transaction) -> anyhow::Result<()> {
        transaction_fsm::transition(
            self.store.as_ref(),
            &self.events,
            tx.id,
            tx.status,
            TransactionStatus::Stupid,
            None,
        )
        .await?;
        Ok(())
    }

    async fn latest_unprocessed_reply(&self, transaction_id: TransactionId) -> anyhow::Result<Option<model::ChatMessage>> {
        let messages = self.store.list_recent_chat_messages(transaction_id, 10).await?;
        Ok(messages
            .into_iter()
            .find(|m| !m.processed && m.sender == ChatSender::Them))
    }

    async fn send_step(&self, tx: &Transaction, step: u32, text: String) -> anyhow::Result<()> {
        if self.store.step_send(tx.id, step).await?.is_some() {
            return Ok(());
        }
        let Some(order_id) = &tx.order_id else {
            return Ok(());
        };
        let Some(advertisement) = self.store.find_advertisement(tx.advertisement_id).await? else {
            return Ok(());
        };
        let Some(client) = self.registry.client_x(advertisement.account_id).await else {
            return Ok(());
        };

        let message_id = client.send_chat_message(order_id, &text).await?;
        self.store.record_step_send(tx.id, step, &message_id).await?;
        if step > tx.chat_step {
            self.store.set_chat_step(tx.id, step).await?;
        }
        Ok(())
    }
}

fn classify_yes_no(body: &str) -> Option<bool> {
    let normalized = body.trim().to_lowercase();
    if ["да", "yes", "д"].contains(&normalized.as_str()) {
        Some(true)
    } else if ["нет", "no", "н"].contains(&normalized.as_str()) {
        Some(false)
    } else {
        None
    }
}

fn greeting_template() -> String {
    "Здравствуйте! Подскажите, пожалуйста, вы физическое лицо? (да/нет)".to_string()
}

fn bank_confirm_template() -> String {
    "Отлично. Уточните, пожалуйста, банк получателя.".to_string()
}

fn payment_instructions_template(payout: &Payout) -> String {
    format!(
        "Реквизиты для перевода: {} на {} ({}), сумма {}. После оплаты нажмите \"Оплачено\".",
        payout.bank_name, payout.recipient_identifier, payout.recipient_name, payout.amount
    )
}

fn release_notice_template() -> String {
    "Чек получен, спасибо! Производим release.".to_string()
}
