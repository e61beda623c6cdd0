use chat_driver::{ChatClient, SendOptions};
use shared::domain::{DispatchFailure, DispatchResult, RecipientAddress};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    config::DispatchSettings,
    resolver::{ExclusionSet, ResolvedEntry},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    OwnAddress,
    Excluded,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    Skipped(SkipReason),
    Failed(DispatchFailure),
}

#[derive(Debug, Default)]
struct Tally {
    result: DispatchResult,
}

impl Tally {
    fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Sent => self.result.sent += 1,
            DeliveryOutcome::Skipped(_) => self.result.skipped += 1,
            DeliveryOutcome::Failed(failure) => {
                self.result.failed += 1;
                self.result.errors.push(failure);
            }
        }
    }

    fn finish(mut self, total: usize) -> DispatchResult {
        self.result.total = total;
        self.result
    }
}

/// Sends `body` to every entry in order, one at a time. Own, excluded and
/// duplicate addresses are skipped; every other send is preceded by the
/// configured interval. Per-recipient failures are recorded and never stop
/// the loop.
pub async fn dispatch(
    client: &dyn ChatClient,
    recipients: &[ResolvedEntry],
    body: &str,
    own_address: &RecipientAddress,
    exclusions: &ExclusionSet,
    settings: &DispatchSettings,
) -> DispatchResult {
    info!(
        recipients = recipients.len(),
        exclusions = exclusions.len(),
        interval_ms = settings.send_interval.as_millis() as u64,
        "dispatch: starting"
    );
    let mut tally = Tally::default();
    for entry in recipients {
        let outcome = deliver(client, entry, body, own_address, exclusions, settings).await;
        tally.record(outcome);
    }
    let result = tally.finish(recipients.len());
    info!(
        total = result.total,
        sent = result.sent,
        failed = result.failed,
        skipped = result.skipped,
        "dispatch: finished"
    );
    result
}

async fn deliver(
    client: &dyn ChatClient,
    entry: &ResolvedEntry,
    body: &str,
    own_address: &RecipientAddress,
    exclusions: &ExclusionSet,
    settings: &DispatchSettings,
) -> DeliveryOutcome {
    let recipient = match entry {
        ResolvedEntry::Address(address) => address,
        ResolvedEntry::Duplicate(address) => {
            debug!(%address, "dispatch: skipping duplicate recipient");
            return DeliveryOutcome::Skipped(SkipReason::Duplicate);
        }
        ResolvedEntry::Unresolved { raw, reason } => {
            warn!(recipient = %raw, %reason, "dispatch: unresolved recipient");
            return DeliveryOutcome::Failed(DispatchFailure {
                recipient: raw.clone(),
                error: reason.clone(),
            });
        }
    };
    if recipient == own_address {
        debug!(%recipient, "dispatch: skipping own address");
        return DeliveryOutcome::Skipped(SkipReason::OwnAddress);
    }
    if exclusions.contains(recipient) {
        debug!(%recipient, "dispatch: skipping excluded recipient");
        return DeliveryOutcome::Skipped(SkipReason::Excluded);
    }

    sleep(settings.send_interval).await;
    match client
        .send_message(recipient.as_str(), body, SendOptions::default())
        .await
    {
        Ok(()) => {
            debug!(%recipient, "dispatch: sent");
            DeliveryOutcome::Sent
        }
        Err(err) => {
            let error = format!("{err:#}");
            warn!(%recipient, %error, "dispatch: send failed");
            DeliveryOutcome::Failed(DispatchFailure {
                recipient: recipient.to_string(),
                error,
            })
        }
    }
}

#[cfg(test)]
#[path = "tests/dispatch_tests.rs"]
mod tests;
