//! Receipt Processor (C7), per spec.md §4.9.

use crate::config::Config;
use crate::email_client::EmailClient;
use crate::event_bus::EventBus;
use crate::pdf_parser::{self, PdfTextExtractor};
use crate::store::Store;
use crate::transaction_fsm;
use model::{Receipt, ReceiptId, TransactionStatus};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

pub struct ReceiptProcessor {
    store: Arc<dyn Store>,
    email: Arc<dyn EmailClient>,
    pdf: Arc<dyn PdfTextExtractor>,
    events: Arc<EventBus>,
    config: Config,
    extraction_limit: Arc<Semaphore>,
}

impl ReceiptProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        email: Arc<dyn EmailClient>,
        pdf: Arc<dyn PdfTextExtractor>,
        events: Arc<EventBus>,
        config: Config,
    ) -> Self {
        let extraction_limit = Arc::new(Semaphore::new(
            config.receipts.max_concurrent_extractions.max(1),
        ));
        Self {
            store,
            email,
            pdf,
            events,
            config,
            extraction_limit,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        self.ingest().await?;
        self.match_receipts().await?;
        Ok(())
    }

    async fn ingest(&self) -> anyhow::Result<()> {
        for inbox in self.email.list_inboxes().await? {
            for summary in self.email.list_emails(&inbox, None).await? {
                if !is_trusted_sender(&self.config.email.trusted_senders, &summary.from_address) {
                    continue;
                }
                let message = self.email.fetch_email(&inbox, &summary.id).await?;
                for attachment in &message.attachments {
                    if !attachment.file_name.to_lowercase().ends_with(".pdf") {
                        continue;
                    }
                    self.ingest_attachment(&inbox, &message.id, attachment)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn ingest_attachment(
        &self,
        inbox: &str,
        email_id: &str,
        attachment: &crate::email_client::EmailAttachment,
    ) -> anyhow::Result<()> {
        let hash = hex::encode(Sha256::digest(&attachment.bytes));
        if self.store.find_receipt_by_hash(&hash).await?.is_some() {
            return Ok(());
        }

        let text = {
            let _permit = self
                .extraction_limit
                .acquire()
                .await
                .expect("extraction semaphore is never closed");
            self.pdf.extract(attachment.bytes.clone()).await?
        };
        let (fields, parse_error) = match pdf_parser::parse_receipt_text(&text) {
            Ok(fields) => (Some(fields), None),
            Err(err) => (None, Some(err)),
        };

        if let Some(err) = &parse_error {
            warn!(inbox, email_id, file = %attachment.file_name, error = %err, "receipt parse failed");
        }

        let receipt = Receipt {
            id: ReceiptId::new(),
            source_email_id: email_id.to_string(),
            file_path: format!("{inbox}/{email_id}/{}", attachment.file_name),
            fields,
            processed: parse_error.is_some(),
            linked_transaction_id: None,
            file_hash: hash,
        };
        self.store.insert_receipt(&receipt).await?;
        Ok(())
    }

    /// Joins unmatched Receipts against non-terminal Transactions on
    /// (amount, bank, recipient-identifier, recipient-name), first-match-
    /// wins, per spec.md §4.9. A Receipt left unmatched here (e.g. because
    /// its order hasn't reached `waiting_payment` yet) is retried on every
    /// call, which is how scenario 4 ("receipt before order") resolves once
    /// the Transaction catches up -- no separate pending-receipt pointer is
    /// needed on the Payout.
    async fn match_receipts(&self) -> anyhow::Result<()> {
        for receipt in self.store.list_unmatched_receipts().await? {
            let Some(fields) = &receipt.fields else {
                continue;
            };

            for tx in self.store.list_non_terminal_transactions().await? {
                if !matches!(
                    tx.status,
                    TransactionStatus::WaitingPayment | TransactionStatus::PaymentReceived
                ) {
                    continue;
                }
                let Some(payout) = self.store.find_payout(&tx.payout_id).await? else {
                    continue;
                };
                let accepted_at = match payout.accepted_at {
                    Some(at) => at,
                    None => continue,
                };
                let matches = payout.amount == fields.amount
                    && payout.bank_name == fields.recipient_bank
                    && payout.recipient_identifier == fields.recipient_phone
                    && payout.recipient_name == fields.recipient_name
                    && fields.datetime >= accepted_at;
                if !matches {
                    continue;
                }

                let applied = transaction_fsm::transition(
                    self.store.as_ref(),
                    &self.events,
                    tx.id,
                    tx.status,
                    TransactionStatus::CheckReceived,
                    None,
                )
                .await?;
                if applied {
                    self.store.mark_receipt_matched(receipt.id, tx.id).await?;
                    info!(transaction_id = %tx.id, receipt_id = %receipt.id, "receipt matched");
                    break;
                }
            }
        }
        Ok(())
    }
}

fn is_trusted_sender(trusted: &[String], from_address: &str) -> bool {
    if trusted.is_empty() {
        return true;
    }
    let domain = from_address.rsplit_once('@').map(|(_, d)| d);
    trusted.iter().any(|t| Some(t.as_str()) == domain || t == from_address)
}
