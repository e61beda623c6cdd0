use std::collections::HashSet;

use chat_driver::ChatClient;
use shared::domain::{ChatId, Participant, RecipientAddress};
use tracing::{debug, warn};

use crate::error::SessionError;

pub const INVALID_PHONE_NUMBER: &str = "Invalid phone number";

/// One input recipient after normalization, in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedEntry {
    Address(RecipientAddress),
    /// Normalizes to an address seen earlier in the same list.
    Duplicate(RecipientAddress),
    Unresolved { raw: String, reason: String },
}

/// Raw identifiers the caller wants left out, resolved like recipients.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet(HashSet<RecipientAddress>);

impl ExclusionSet {
    /// A lookup error fails the whole set; an exclusion that names no
    /// account is ignored.
    pub async fn resolve(client: &dyn ChatClient, raws: &[String]) -> Result<Self, SessionError> {
        let mut addresses = HashSet::new();
        for raw in raws {
            let resolved = resolve_address(client, raw)
                .await
                .map_err(|err| err.context(format!("failed to resolve exclusion '{raw}'")))?;
            match resolved {
                Some(address) => {
                    addresses.insert(address);
                }
                None => warn!(exclusion = %raw, "resolver: ignoring unresolvable exclusion"),
            }
        }
        Ok(Self(addresses))
    }

    pub fn contains(&self, address: &RecipientAddress) -> bool {
        self.0.contains(address)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<RecipientAddress> for ExclusionSet {
    fn from_iter<I: IntoIterator<Item = RecipientAddress>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Normalizes one raw identifier. Anything containing `@` is taken as a
/// platform address; everything else is treated as a phone number, stripped
/// of separators and looked up in the directory. `Ok(None)` means the input
/// does not name a reachable account.
pub async fn resolve_address(
    client: &dyn ChatClient,
    raw: &str,
) -> anyhow::Result<Option<RecipientAddress>> {
    let raw = raw.trim();
    if raw.contains('@') {
        return Ok(RecipientAddress::parse(raw).ok());
    }
    let Some(number) = phone_digits(raw) else {
        return Ok(None);
    };
    let id = client.number_id(&number).await?;
    Ok(id.map(|id| id.address()))
}

fn phone_digits(raw: &str) -> Option<String> {
    let digits: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '+' | '-' | '(' | ')'))
        .collect();
    (!digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())).then_some(digits)
}

/// Resolves an explicit recipient list. Failures become
/// [`ResolvedEntry::Unresolved`] entries; nothing here is fatal.
pub async fn resolve_recipients(client: &dyn ChatClient, raws: &[String]) -> Vec<ResolvedEntry> {
    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(raws.len());
    for raw in raws {
        let entry = match resolve_address(client, raw).await {
            Ok(Some(address)) => dedupe(&mut seen, address),
            Ok(None) => ResolvedEntry::Unresolved {
                raw: raw.clone(),
                reason: INVALID_PHONE_NUMBER.to_string(),
            },
            Err(err) => ResolvedEntry::Unresolved {
                raw: raw.clone(),
                reason: format!("{err:#}"),
            },
        };
        entries.push(entry);
    }
    entries
}

/// Fetches a group chat and returns its participants. Fails before anything
/// is sent when the id is not a group or the participant list is empty.
pub async fn load_group(
    client: &dyn ChatClient,
    group_id: &ChatId,
) -> Result<Vec<Participant>, SessionError> {
    let chat = client
        .chat_by_id(group_id.as_str())
        .await
        .map_err(|err| SessionError::Other(err.context(format!("failed to fetch chat {group_id}"))))?;
    if !chat.is_group {
        return Err(SessionError::NotAGroup(group_id.clone()));
    }
    match chat.participants {
        Some(participants) if !participants.is_empty() => {
            debug!(%group_id, count = participants.len(), "resolver: group loaded");
            Ok(participants)
        }
        _ => Err(SessionError::EmptyGroup(group_id.clone())),
    }
}

pub fn participant_entries(participants: &[Participant]) -> Vec<ResolvedEntry> {
    let mut seen = HashSet::new();
    participants
        .iter()
        .map(|participant| dedupe(&mut seen, participant.id.address()))
        .collect()
}

fn dedupe(seen: &mut HashSet<RecipientAddress>, address: RecipientAddress) -> ResolvedEntry {
    if seen.insert(address.clone()) {
        ResolvedEntry::Address(address)
    } else {
        ResolvedEntry::Duplicate(address)
    }
}

#[cfg(test)]
#[path = "tests/resolver_tests.rs"]
mod tests;
