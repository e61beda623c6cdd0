use std::{sync::Arc, time::Duration};

use storage::Storage;

use super::*;
use crate::{
    config::DispatchSettings,
    test_support::{
        fast_engine, manager_for, messenger_for, FakeClient, FakeConnector, FakeStoreConnector,
        OWN_USER,
    },
};

const GROUP: &str = "120363000000000001@g.us";

fn session() -> SessionId {
    SessionId::new("alpha")
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn group_client() -> FakeClient {
    FakeClient::ready().with_group(GROUP, "Team", &["51911111111", OWN_USER, "51922222222"])
}

#[tokio::test]
async fn list_groups_projects_only_group_chats() {
    let client = Arc::new(
        group_client()
            .with_direct_chat("51933333333@c.us", "Bob")
            .with_group("120363000000000002@g.us", "Family", &["51944444444"]),
    );
    let messenger = messenger_for(&client);

    let groups = messenger.list_groups(&session()).await.expect("groups");

    assert_eq!(
        groups,
        vec![
            GroupDetail {
                id: ChatId::new(GROUP),
                name: "Team".to_string(),
                participant_count: 3,
            },
            GroupDetail {
                id: ChatId::new("120363000000000002@g.us"),
                name: "Family".to_string(),
                participant_count: 1,
            },
        ]
    );
    assert_eq!(client.destroy_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn tag_everyone_mentions_every_participant_once() {
    let client = Arc::new(group_client());
    let messenger = messenger_for(&client);

    messenger
        .tag_everyone_in_group(&session(), &ChatId::new(GROUP), Some("Meeting at 5"))
        .await
        .expect("tag");

    let sent = client.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, GROUP);
    assert_eq!(
        sent[0].body,
        format!("Meeting at 5\n\n@51911111111 @{OWN_USER} @51922222222")
    );
    assert_eq!(
        sent[0].mentions,
        vec![
            ContactId::for_user("51911111111"),
            ContactId::for_user(OWN_USER),
            ContactId::for_user("51922222222"),
        ]
    );
}

#[tokio::test]
async fn tag_everyone_falls_back_to_the_default_message() {
    let client = Arc::new(FakeClient::ready().with_group(GROUP, "Team", &["1"]));
    let messenger = messenger_for(&client);

    messenger
        .tag_everyone_in_group(&session(), &ChatId::new(GROUP), Some("   "))
        .await
        .expect("tag");

    assert_eq!(client.sent()[0].body, "Attention everyone:\n\n@1");
}

#[tokio::test]
async fn group_operations_fail_before_sending_to_non_groups() {
    let client = Arc::new(FakeClient::ready().with_direct_chat("51933333333@c.us", "Bob"));
    let messenger = messenger_for(&client);
    let chat = ChatId::new("51933333333@c.us");

    let tag = messenger
        .tag_everyone_in_group(&session(), &chat, None)
        .await
        .expect_err("not a group");
    let direct = messenger
        .send_direct_messages_to_group_members(&session(), &chat, "hi", &[])
        .await
        .expect_err("not a group");

    assert!(matches!(tag, SessionError::NotAGroup(_)));
    assert!(matches!(direct, SessionError::NotAGroup(_)));
    assert!(client.sent().is_empty());
    assert_eq!(client.destroy_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn direct_messages_skip_self_and_exclusions() {
    let client = Arc::new(group_client().with_number("51922222222", "51922222222"));
    let messenger = messenger_for(&client);

    let result = messenger
        .send_direct_messages_to_group_members(
            &session(),
            &ChatId::new(GROUP),
            "Hello!",
            &strings(&["+51 922 222 222"]),
        )
        .await
        .expect("dispatch");

    assert_eq!(result.total, 3);
    assert_eq!(result.sent, 1);
    assert_eq!(result.skipped, 2);
    assert_eq!(result.failed, 0);
    assert_eq!(client.sent_to(), vec!["51911111111@c.us"]);
}

#[tokio::test(start_paused = true)]
async fn failed_exclusion_lookup_aborts_before_any_send() {
    let client = Arc::new(group_client().failing_number_lookups("driver timed out"));
    let messenger = messenger_for(&client);

    let err = messenger
        .send_direct_messages_to_group_members(
            &session(),
            &ChatId::new(GROUP),
            "Hello!",
            &strings(&["51922222222"]),
        )
        .await
        .expect_err("exclusion lookup failed");

    assert!(matches!(err, SessionError::Other(_)));
    assert!(client.sent().is_empty());
    assert_eq!(client.destroy_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn broadcast_fails_when_an_exclusion_cannot_be_looked_up() {
    let client = Arc::new(FakeClient::ready().failing_number_lookups("driver timed out"));
    let messenger = messenger_for(&client);

    let err = messenger
        .broadcast_to_address_list(
            &session(),
            &strings(&["51911111111@c.us", "51922222222@c.us"]),
            &strings(&["hi"]),
            &strings(&["51922222222"]),
        )
        .await
        .expect_err("exclusion lookup failed");

    assert!(matches!(err, SessionError::Other(_)));
    assert!(client.sent().is_empty());
}

#[tokio::test]
async fn empty_inputs_are_rejected_before_any_session_is_opened() {
    let client = Arc::new(FakeClient::ready());
    let connector = Arc::new(FakeConnector::new(Arc::clone(&client)));
    let messenger = Messenger::new(
        ConnectionManager::new(connector.clone(), Arc::new(FakeStoreConnector::default())),
        EngineConfig::default(),
    );

    let no_addresses = messenger
        .broadcast_to_address_list(&session(), &[], &strings(&["hi"]), &[])
        .await
        .expect_err("no addresses");
    let no_messages = messenger
        .broadcast_to_address_list(&session(), &strings(&["51911111111"]), &strings(&["", " "]), &[])
        .await
        .expect_err("no messages");
    let blank_dm = messenger
        .send_direct_messages_to_group_members(&session(), &ChatId::new(GROUP), "  ", &[])
        .await
        .expect_err("blank message");

    for err in [no_addresses, no_messages, blank_dm] {
        assert!(matches!(err, SessionError::InvalidRequest(_)));
    }
    assert_eq!(connector.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn broadcast_joins_messages_and_reports_invalid_numbers() {
    let client = Arc::new(
        FakeClient::ready()
            .with_number("51911111111", "51911111111")
            .with_number("51922222222", "51922222222"),
    );
    let messenger = messenger_for(&client);

    let result = messenger
        .broadcast_to_address_list(
            &session(),
            &strings(&["51911111111", "999", "51922222222", "51911111111"]),
            &strings(&["Line one", "Line two"]),
            &[],
        )
        .await
        .expect("broadcast");

    assert_eq!(result.total, 4);
    assert_eq!(result.sent, 2);
    assert_eq!(result.failed, 1);
    assert_eq!(result.skipped, 1);
    assert_eq!(result.errors[0].recipient, "999");
    assert_eq!(result.errors[0].error, "Invalid phone number");
    assert!(client
        .sent()
        .iter()
        .all(|message| message.body == "Line one\n\nLine two"));
}

#[tokio::test]
async fn group_contacts_fail_when_any_lookup_fails() {
    let client = Arc::new(
        FakeClient::ready()
            .with_group(GROUP, "Team", &["51911111111", "51922222222"])
            .with_contact("51911111111", "Ana"),
    );
    let messenger = messenger_for(&client);

    let err = messenger
        .group_contacts(&session(), &ChatId::new(GROUP))
        .await
        .expect_err("missing contact");

    assert!(err.to_string().contains("51922222222@c.us"));
    assert_eq!(client.destroy_calls(), 1);
}

#[tokio::test]
async fn snapshot_round_trip_feeds_a_later_broadcast() {
    let client = Arc::new(
        FakeClient::ready()
            .with_group(GROUP, "Team", &["51911111111", "51922222222"])
            .with_contact("51911111111", "Ana")
            .with_contact("51922222222", "Luis"),
    );
    let messenger = Messenger::new(
        manager_for(&client),
        EngineConfig {
            dispatch: DispatchSettings {
                send_interval: Duration::ZERO,
            },
            ..fast_engine()
        },
    );
    let store = Storage::new("sqlite::memory:").await.expect("storage");

    let saved = messenger
        .snapshot_group_contacts(&session(), &ChatId::new(GROUP), &store)
        .await
        .expect("snapshot");
    assert_eq!(saved, 2);

    let result = messenger
        .send_to_saved_contacts(&session(), &store, &strings(&["Promo"]), &strings(&["51922222222@c.us"]))
        .await
        .expect("send");

    assert_eq!(result.sent, 1);
    assert_eq!(result.skipped, 1);
    assert_eq!(client.sent_to(), vec!["51911111111@c.us"]);
}

#[test]
fn compose_message_joins_parts_with_a_blank_line() {
    assert_eq!(
        compose_message(&strings(&["a", "b"])).expect("message"),
        "a\n\nb"
    );
    assert!(compose_message(&[]).is_err());
}
