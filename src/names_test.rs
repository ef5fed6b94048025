use super::*;
use std::collections::HashSet;

fn ids() -> (Uuid, Uuid) {
    (
        "0bd81c66-6d41-47f5-9171-8e0c9d94dd3a".parse().unwrap(),
        "5b6fbc2e-52a3-4bd1-93f7-0a6c15f2b9fd".parse().unwrap(),
    )
}

#[test]
fn same_scope_renders_same_name() {
    let (org, conv) = ids();
    assert_eq!(conversation(org, conv), conversation(org, conv));
    assert_eq!(organization(org), organization(org));
    assert_eq!(typing(org, conv), typing(org, conv));
}

#[test]
fn distinct_scopes_never_collide() {
    let (org, conv) = ids();
    let names: HashSet<String> = [
        organization(org),
        conversation(org, conv),
        typing(org, conv),
        widget(org, conv),
        dashboard(org),
    ]
    .into_iter()
    .collect();
    assert_eq!(names.len(), 5);
}

#[test]
fn distinct_conversations_never_collide() {
    let (org, conv) = ids();
    let other = Uuid::new_v4();
    assert_ne!(conversation(org, conv), conversation(org, other));
    assert_ne!(typing(org, conv), typing(org, other));
}

#[test]
fn rendered_names_match_grammar() {
    let (org, conv) = ids();
    assert_eq!(organization(org), format!("org:{org}"));
    assert_eq!(conversation(org, conv), format!("org:{org}:conversation:{conv}"));
    assert_eq!(typing(org, conv), format!("org:{org}:typing:{conv}"));
    assert_eq!(widget(org, conv), format!("org:{org}:widget:{conv}"));
    assert_eq!(dashboard(org), format!("org:{org}:dashboard"));
}

#[test]
fn parse_round_trips_every_scope() {
    let (org, conv) = ids();
    let scopes = [
        ChannelScope::Organization(org),
        ChannelScope::Conversation(org, conv),
        ChannelScope::Typing(org, conv),
        ChannelScope::Widget(org, conv),
        ChannelScope::Dashboard(org),
    ];
    for scope in scopes {
        assert_eq!(ChannelScope::parse(&scope.name()), Some(scope));
        assert_eq!(scope.organization_id(), org);
    }
}

#[test]
fn parse_rejects_non_canonical_topics() {
    let (org, conv) = ids();
    for topic in [
        "",
        "org:",
        "org:not-a-uuid",
        &format!("bcast:org:{org}"),
        &format!("org:{org}:conv:{conv}"),
        &format!("org:{org}:conversation:"),
        &format!("org:{org}:dashboard:extra"),
    ] {
        assert_eq!(ChannelScope::parse(topic), None, "accepted {topic:?}");
    }
}
