use super::*;

#[test]
fn parses_user_address_and_lowercases_server() {
    let id = ContactId::parse(" 51987654321@C.US ").expect("parse");
    assert_eq!(id.user, "51987654321");
    assert_eq!(id.server, USER_SERVER);
    assert_eq!(id.address().as_str(), "51987654321@c.us");
}

#[test]
fn rejects_addresses_without_server_or_user() {
    assert_eq!(ContactId::parse(""), Err(AddressParseError::Empty));
    assert!(matches!(
        ContactId::parse("51987654321"),
        Err(AddressParseError::MissingServer(_))
    ));
    assert!(matches!(
        ContactId::parse("@c.us"),
        Err(AddressParseError::EmptyUser(_))
    ));
}

#[test]
fn recipient_address_deserialization_validates_format() {
    let ok: RecipientAddress = serde_json::from_str("\"123@c.us\"").expect("valid");
    assert_eq!(ok.as_str(), "123@c.us");
    assert!(serde_json::from_str::<RecipientAddress>("\"123\"").is_err());
}

#[test]
fn group_detail_projection_counts_participants() {
    let chat = Chat {
        id: ChatId::from("120363@g.us"),
        name: "Ops".into(),
        is_group: true,
        participants: Some(vec![
            Participant {
                id: ContactId::for_user("1"),
                is_admin: true,
                is_super_admin: false,
            },
            Participant {
                id: ContactId::for_user("2"),
                is_admin: false,
                is_super_admin: false,
            },
        ]),
    };
    let detail = GroupDetail::from_chat(&chat).expect("group");
    assert_eq!(detail.participant_count, 2);
    assert_eq!(detail.name, "Ops");

    let direct = Chat {
        is_group: false,
        participants: None,
        ..chat
    };
    assert!(GroupDetail::from_chat(&direct).is_none());
}
