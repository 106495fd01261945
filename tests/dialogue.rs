//! Dialogue store integration tests

use lark_gateway::dialogue::{Dialogue, Message, Role};

#[test]
fn eviction_preserves_order_and_system() {
    let mut dialogue = Dialogue::new(4, true);
    dialogue.append(Message::system("You are a helpful assistant."));

    for i in 0..10 {
        dialogue.append(Message::user(format!("message {i}")));
        dialogue.append(Message::assistant(format!("reply {i}")));
    }

    // Nominal cap plus the protected system message
    assert!(dialogue.len() <= 5);

    let history = dialogue.history();
    assert_eq!(history[0].role, Role::System);

    // Remaining non-system messages are the newest, still in order
    let contents: Vec<&str> = history[1..]
        .iter()
        .filter_map(|m| m.content.as_deref())
        .collect();
    assert_eq!(contents, vec!["reply 8", "message 9", "reply 9"]);
}

#[test]
fn without_keep_system_everything_is_evictable() {
    let mut dialogue = Dialogue::new(2, false);
    dialogue.append(Message::system("prompt"));
    dialogue.append(Message::user("one"));
    dialogue.append(Message::user("two"));
    dialogue.append(Message::user("three"));

    assert_eq!(dialogue.len(), 2);
    assert!(dialogue.history().iter().all(|m| m.role != Role::System));
}

#[test]
fn repeated_appends_are_stable() {
    let mut dialogue = Dialogue::new(3, true);
    dialogue.append(Message::system("prompt"));

    for i in 0..50 {
        dialogue.append(Message::user(format!("m{i}")));
        assert!(dialogue.len() <= 4, "len drifted at append {i}");
    }
}

#[test]
fn snapshot_round_trips_through_json() {
    let mut dialogue = Dialogue::new(10, true);
    dialogue.append(Message::system("prompt"));
    dialogue.append(Message::user_with_speaker("hello", "Alice"));
    dialogue.append(Message::assistant("hi Alice"));

    let snapshot = dialogue.snapshot();
    let json = serde_json::to_string(&snapshot).unwrap();
    let restored = Dialogue::restore(serde_json::from_str(&json).unwrap());

    assert_eq!(restored.len(), 3);
    let history = restored.history();
    assert_eq!(history[1].speaker.as_deref(), Some("Alice"));
    assert_eq!(history[2].content.as_deref(), Some("hi Alice"));
}

#[test]
fn find_by_id_after_eviction() {
    let mut dialogue = Dialogue::new(3, false);
    let early = dialogue.append(Message::user("early"));
    let late = dialogue.append(Message::user("late"));
    for i in 0..5 {
        dialogue.append(Message::user(format!("filler {i}")));
    }

    assert!(dialogue.find_by_id(early).is_none());
    assert!(dialogue.find_by_id(late).is_none());

    let kept = dialogue.append(Message::user("kept"));
    assert!(dialogue.find_by_id(kept).is_some());
}
