//! One relay pass: list → fetch → classify → act → commit, strictly serial.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::channels::{MailboxConnector, MailboxSession, OutboundSession, OutboundTransport};
use crate::config::RelayConfig;
use crate::error::{MailboxError, PassError};
use crate::mime::Part;
use crate::pipeline::bounce::extract_recipients;
use crate::pipeline::classifier::Classifier;
use crate::pipeline::throttle::Throttler;
use crate::pipeline::transform::TransformEngine;
use crate::pipeline::types::{Classification, InboundMessage, MessageOutcome, PassReport};
use crate::signing::UnsubscribeSigner;
use crate::store::{Cursor, MessageCommit, RelayStore};

pub struct Relay {
    mailbox: Arc<dyn MailboxConnector>,
    transport: Arc<dyn OutboundTransport>,
    store: Arc<dyn RelayStore>,
    classifier: Classifier,
    engine: TransformEngine,
    throttler: Throttler,
}

impl Relay {
    pub fn new(
        mailbox: Arc<dyn MailboxConnector>,
        transport: Arc<dyn OutboundTransport>,
        store: Arc<dyn RelayStore>,
        classifier: Classifier,
        engine: TransformEngine,
        throttler: Throttler,
    ) -> Self {
        Self {
            mailbox,
            transport,
            store,
            classifier,
            engine,
            throttler,
        }
    }

    pub fn from_config(
        config: &RelayConfig,
        mailbox: Arc<dyn MailboxConnector>,
        transport: Arc<dyn OutboundTransport>,
        store: Arc<dyn RelayStore>,
    ) -> Self {
        Self::new(
            mailbox,
            transport,
            store,
            Classifier::from_config(config),
            TransformEngine::new(
                &config.transform,
                UnsubscribeSigner::new(&config.unsubscribe),
            ),
            Throttler::new(&config.throttle),
        )
    }

    /// Process every message in the mailbox once.
    ///
    /// Messages committed before an error stay committed; the failing
    /// message is retried next pass.
    pub async fn run_pass(&self) -> Result<PassReport, PassError> {
        let mut session = self.mailbox.connect().await?;
        let mut outbound = None;
        let result = self.process_mailbox(session.as_mut(), &mut outbound).await;
        if let Some(mut outbound) = outbound
            && let Err(e) = outbound.quit().await
        {
            debug!(error = %e, "Outbound quit failed");
        }
        if let Err(e) = session.logout().await {
            debug!(error = %e, "Mailbox logout failed");
        }
        result
    }

    async fn process_mailbox(
        &self,
        session: &mut dyn MailboxSession,
        outbound: &mut Option<Box<dyn OutboundSession>>,
    ) -> Result<PassReport, PassError> {
        let uids = session.list().await?;
        let mut report = PassReport {
            listed: uids.len(),
            ..PassReport::default()
        };

        for uid in uids {
            let fetched = match session.fetch(uid).await {
                Ok(fetched) => fetched,
                Err(e @ MailboxError::Fetch { .. }) => {
                    warn!(uid, error = %e, "Skipping message this pass");
                    report.fetch_failures += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let cursor = self.store.load_cursor().await?;
            let msg = InboundMessage::parse(fetched);
            let classification = self.classifier.classify(&msg, cursor.as_ref());
            debug!(
                uid,
                kind = classification.label(),
                subject = msg.subject.as_deref().unwrap_or(""),
                "Classified message"
            );

            let outcome = self
                .handle(msg, classification, cursor.as_ref(), outbound)
                .await?;
            report.record(&outcome);

            if outcome == MessageOutcome::Discarded {
                continue;
            }
            if let Err(e) = session.mark_seen(uid).await {
                warn!(uid, error = %e, "Failed to mark message seen");
            }
            if matches!(
                outcome,
                MessageOutcome::TestRelayed { .. } | MessageOutcome::BroadcastSent { .. }
            ) {
                self.throttler.after_message().await;
            }
        }

        Ok(report)
    }

    async fn handle(
        &self,
        msg: InboundMessage,
        classification: Classification,
        cursor: Option<&Cursor>,
        outbound: &mut Option<Box<dyn OutboundSession>>,
    ) -> Result<MessageOutcome, PassError> {
        let uid = msg.uid;
        let next = Cursor::advance(cursor, msg.received_at, &msg.key);

        match classification {
            Classification::Discard => Ok(MessageOutcome::Discarded),

            Classification::Ignored => {
                info!(uid, from = %msg.from_header, "Ignoring message from unknown sender");
                self.commit(uid, next, Vec::new()).await?;
                Ok(MessageOutcome::Ignored)
            }

            Classification::Bounce => {
                let tree = msg
                    .tree
                    .map_err(|source| PassError::Transform { uid, source })?;
                let recipients = extract_recipients(&tree);
                for recipient in &recipients {
                    let report = recipient.report();
                    info!(
                        uid,
                        address = %report.address,
                        field = recipient.field(),
                        action = report.action.as_deref().unwrap_or("-"),
                        status = report.status.as_deref().unwrap_or("-"),
                        "Bounce reported recipient"
                    );
                }
                let addresses = recipients.iter().map(|r| r.address().to_string()).collect();
                let unsubscribed = self.commit(uid, next, addresses).await?;
                info!(uid, reported = recipients.len(), unsubscribed, "Bounce applied");
                Ok(MessageOutcome::BounceApplied {
                    reported: recipients.len(),
                    unsubscribed,
                })
            }

            Classification::TestProbe { sender } => {
                let tree = msg
                    .tree
                    .map_err(|source| PassError::Transform { uid, source })?;
                let payload = self.engine.test_probe(&self.engine.prepare(&tree), &sender);

                let session = self.outbound(outbound).await?;
                let delivered = self.deliver(session, uid, &sender, &payload).await?;
                self.commit(uid, next, Vec::new()).await?;
                info!(uid, to = %sender, delivered, "Test probe relayed");
                Ok(MessageOutcome::TestRelayed {
                    to: sender,
                    delivered,
                })
            }

            Classification::Broadcast => {
                let tree = msg
                    .tree
                    .map_err(|source| PassError::Transform { uid, source })?;
                let (sent, rejected) = self.broadcast(uid, &tree, outbound).await?;
                self.commit(uid, next, Vec::new()).await?;
                info!(uid, sent, rejected, "Broadcast delivered");
                Ok(MessageOutcome::BroadcastSent { sent, rejected })
            }
        }
    }

    /// Send one copy per subscribed entry, in rank order. Returns
    /// `(sent, rejected)`.
    async fn broadcast(
        &self,
        uid: u32,
        tree: &Part,
        outbound: &mut Option<Box<dyn OutboundSession>>,
    ) -> Result<(usize, usize), PassError> {
        let prepared = self.engine.prepare(tree);
        // Read fresh: the unsubscribe endpoint may have changed it since the
        // previous message.
        let roster = self.store.subscribed_roster().await?;
        if roster.is_empty() {
            warn!(uid, "Broadcast with no subscribed recipients");
            return Ok((0, 0));
        }
        let session = self.outbound(outbound).await?;

        let (mut sent, mut rejected) = (0, 0);
        for (i, subscriber) in roster.iter().enumerate() {
            if i > 0 {
                self.throttler.after_recipient().await;
            }
            let payload = self
                .engine
                .broadcast(&prepared, subscriber)
                .map_err(|source| PassError::Transform { uid, source })?;
            if self.deliver(&mut *session, uid, &subscriber.email, &payload).await? {
                sent += 1;
            } else {
                rejected += 1;
            }
        }
        Ok((sent, rejected))
    }

    /// `Ok(false)` when only this recipient was refused.
    async fn deliver(
        &self,
        session: &mut dyn OutboundSession,
        uid: u32,
        to: &str,
        payload: &[u8],
    ) -> Result<bool, PassError> {
        match session.send(to, payload).await {
            Ok(()) => {
                debug!(uid, to, bytes = payload.len(), "Sent");
                Ok(true)
            }
            Err(e) if e.is_recipient_local() => {
                warn!(uid, to, error = %e, "Recipient rejected, continuing");
                Ok(false)
            }
            Err(source) => Err(PassError::Delivery { uid, source }),
        }
    }

    /// The pass's outbound session, opened on first use.
    async fn outbound<'a>(
        &self,
        slot: &'a mut Option<Box<dyn OutboundSession>>,
    ) -> Result<&'a mut dyn OutboundSession, PassError> {
        let session = match slot.take() {
            Some(session) => session,
            None => self.transport.connect().await.map_err(PassError::Transport)?,
        };
        Ok(&mut **slot.insert(session))
    }

    async fn commit(
        &self,
        uid: u32,
        cursor: Cursor,
        unsubscribe: Vec<String>,
    ) -> Result<usize, PassError> {
        self.store
            .commit_message(&MessageCommit {
                cursor,
                unsubscribe,
            })
            .await
            .map_err(|source| PassError::Commit { uid, source })
    }
}

