use std::time::Duration;

use tokio::time::Instant;

use super::*;
use crate::test_support::{FakeClient, OWN_USER};

fn address(user: &str) -> RecipientAddress {
    RecipientAddress::parse(&format!("{user}@c.us")).expect("address")
}

fn entries(users: &[&str]) -> Vec<ResolvedEntry> {
    users
        .iter()
        .map(|user| ResolvedEntry::Address(address(user)))
        .collect()
}

fn settings(millis: u64) -> DispatchSettings {
    DispatchSettings {
        send_interval: Duration::from_millis(millis),
    }
}

fn assert_balanced(result: &DispatchResult) {
    assert_eq!(result.sent + result.failed + result.skipped, result.total);
    assert_eq!(result.errors.len(), result.failed);
}

#[tokio::test(start_paused = true)]
async fn one_failure_does_not_stop_the_loop() {
    let client = FakeClient::ready().failing_send_to("b@c.us");

    let result = dispatch(
        &client,
        &entries(&["a", "b", "c"]),
        "hello",
        &address(OWN_USER),
        &ExclusionSet::default(),
        &settings(1000),
    )
    .await;

    assert_eq!(result.total, 3);
    assert_eq!(result.sent, 2);
    assert_eq!(result.failed, 1);
    assert_eq!(result.errors[0].recipient, "b@c.us");
    assert!(result.errors[0].error.contains("unreachable"));
    assert_eq!(client.sent_to(), vec!["a@c.us", "c@c.us"]);
    assert_balanced(&result);
}

#[tokio::test(start_paused = true)]
async fn own_address_is_skipped_and_never_reported() {
    let client = FakeClient::ready();

    let result = dispatch(
        &client,
        &entries(&["a", OWN_USER]),
        "hello",
        &address(OWN_USER),
        &ExclusionSet::default(),
        &settings(1000),
    )
    .await;

    assert_eq!(result.sent, 1);
    assert_eq!(result.skipped, 1);
    assert!(result.errors.is_empty());
    assert_eq!(client.sent_to(), vec!["a@c.us"]);
    assert_balanced(&result);
}

#[tokio::test(start_paused = true)]
async fn excluded_recipient_is_skipped_without_a_failure() {
    let client = FakeClient::ready();
    let exclusions: ExclusionSet = [address("b")].into_iter().collect();

    let result = dispatch(
        &client,
        &entries(&["a", "b", "c"]),
        "hello",
        &address(OWN_USER),
        &exclusions,
        &settings(1000),
    )
    .await;

    assert_eq!(result.sent, 2);
    assert_eq!(result.failed, 0);
    assert_eq!(result.skipped, 1);
    assert_eq!(client.sent_to(), vec!["a@c.us", "c@c.us"]);
}

#[tokio::test(start_paused = true)]
async fn interval_precedes_every_send_but_not_skips() {
    let client = FakeClient::ready();
    let started = Instant::now();
    let mut recipients = entries(&["a", OWN_USER, "b"]);
    recipients.push(ResolvedEntry::Duplicate(address("a")));

    let result = dispatch(
        &client,
        &recipients,
        "hello",
        &address(OWN_USER),
        &ExclusionSet::default(),
        &settings(1500),
    )
    .await;

    let offsets: Vec<Duration> = client
        .sent()
        .iter()
        .map(|message| message.at.duration_since(started))
        .collect();
    assert_eq!(
        offsets,
        vec![Duration::from_millis(1500), Duration::from_millis(3000)]
    );
    assert_eq!(result.skipped, 2);
    assert_balanced(&result);
}

#[tokio::test(start_paused = true)]
async fn unresolved_entries_count_as_failures_without_sending() {
    let client = FakeClient::ready();
    let started = Instant::now();
    let recipients = vec![
        ResolvedEntry::Unresolved {
            raw: "12345".to_string(),
            reason: "Invalid phone number".to_string(),
        },
        ResolvedEntry::Address(address("a")),
    ];

    let result = dispatch(
        &client,
        &recipients,
        "hello",
        &address(OWN_USER),
        &ExclusionSet::default(),
        &settings(1000),
    )
    .await;

    assert_eq!(result.failed, 1);
    assert_eq!(result.errors[0].recipient, "12345");
    assert_eq!(result.errors[0].error, "Invalid phone number");
    assert_eq!(result.sent, 1);
    assert_eq!(started.elapsed(), Duration::from_millis(1000));
    assert_balanced(&result);
}

#[tokio::test]
async fn empty_recipient_list_yields_an_empty_report() {
    let client = FakeClient::ready();

    let result = dispatch(
        &client,
        &[],
        "hello",
        &address(OWN_USER),
        &ExclusionSet::default(),
        &settings(1000),
    )
    .await;

    assert_eq!(result, DispatchResult::default());
}
