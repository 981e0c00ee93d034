mod common;

use common::*;
use userbot_rust::listener::{ACK_ALREADY_ARMED, ACK_ALREADY_DISARMED, ACK_ARMED, ACK_DISARMED};
use userbot_rust::session::StartOutcome;
use userbot_rust::ubcore::conversation::{HistoryEntry, Role};
use userbot_rust::ubcore::store::CredentialStore;
use userbot_rust::ubcore::{AccountKey, ChatKey};

async fn running_account(h: &Harness) -> AccountKey {
    let credential = seeded_credential(&h.provider, PHONE);
    h.store
        .save(&credential.account_key, &credential)
        .await
        .unwrap();
    assert!(matches!(
        h.plane.start_session(&credential.account_key).await.unwrap(),
        StartOutcome::Started { .. }
    ));
    credential.account_key
}

#[tokio::test]
async fn armed_chat_gets_a_generated_reply() {
    let h = harness().await;
    let key = running_account(&h).await;
    let session = h.plane.session(&key).unwrap();

    h.provider.deliver(&key, message(42, 1, true, ".start")).await;
    wait_for_active(&session, 42, true).await;
    let replies = wait_for_replies(&h.provider, 1).await;
    assert_eq!(replies[0].text, ACK_ARMED);
    assert_eq!(replies[0].reply_to, Some(1));

    h.provider.deliver(&key, message(42, 2, false, "hello")).await;
    wait_for_history(&session, 42, 2).await;

    let requests = h.completion.requests();
    assert_eq!(requests, vec![vec![HistoryEntry::user("hello")]]);
    let replies = wait_for_replies(&h.provider, 2).await;
    assert_eq!(replies[1].chat, ChatKey(42));
    assert_eq!(replies[1].reply_to, Some(2));
    assert_eq!(replies[1].text, "hi there");
    assert!(h.provider.typing_indicators() >= 1);

    let status = h.plane.session_status(&key).await;
    assert_eq!(status.active_chats, 1);
    assert_eq!(status.total_chats, 1);
    h.plane.shutdown().await;
}

#[tokio::test]
async fn only_the_owner_toggles_the_assistant() {
    let h = harness().await;
    let key = running_account(&h).await;
    let session = h.plane.session(&key).unwrap();

    h.provider.deliver(&key, message(7, 1, false, ".start")).await;
    h.provider.deliver(&key, message(7, 2, false, "  .СТАРТ ")).await;
    h.provider.deliver(&key, message(7, 3, true, ".старт")).await;
    // A chat's messages are handled in order, so this ack comes after both
    // peer commands. Had either armed the chat it would say "already".
    let replies = wait_for_replies(&h.provider, 1).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].text, ACK_ARMED);
    assert_eq!(replies[0].reply_to, Some(3));
    assert!(session.is_chat_active(ChatKey(7)).await);

    h.provider.deliver(&key, message(7, 4, false, ".stop")).await;
    h.provider.deliver(&key, message(7, 5, true, ".start")).await;
    let replies = wait_for_replies(&h.provider, 2).await;
    assert_eq!(replies[1].text, ACK_ALREADY_ARMED);
    assert!(session.is_chat_active(ChatKey(7)).await);

    h.provider.deliver(&key, message(7, 6, true, ".stop")).await;
    let replies = wait_for_replies(&h.provider, 3).await;
    assert_eq!(replies[2].text, ACK_DISARMED);

    h.provider.deliver(&key, message(7, 7, true, "start")).await;
    h.provider.deliver(&key, message(7, 8, false, "hello?")).await;
    h.provider.deliver(&key, message(7, 9, true, ".stop")).await;
    let replies = wait_for_replies(&h.provider, 4).await;
    assert_eq!(replies.len(), 4);
    assert_eq!(replies[3].text, ACK_ALREADY_DISARMED);
    assert_eq!(replies[3].reply_to, Some(9));
    assert!(!session.is_chat_active(ChatKey(7)).await);
    assert!(h.completion.requests().is_empty());
    h.plane.shutdown().await;
}

#[tokio::test]
async fn arming_from_the_control_plane_clears_history() {
    let h = harness().await;
    let key = running_account(&h).await;
    let session = h.plane.session(&key).unwrap();

    assert!(h.plane.arm_chat(&key, ChatKey(9)).await.unwrap());
    h.provider.deliver(&key, message(9, 1, false, "first")).await;
    wait_for_history(&session, 9, 2).await;
    h.provider.deliver(&key, message(9, 2, false, "second")).await;
    wait_for_history(&session, 9, 4).await;

    let requests = h.completion.requests();
    assert_eq!(requests.len(), 2);
    let roles: Vec<Role> = requests[1].iter().map(|entry| entry.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);

    h.plane.reset_chat(&key, ChatKey(9)).await.unwrap();
    assert_eq!(session.history_len(ChatKey(9)).await, Some(0));
    assert!(session.is_chat_active(ChatKey(9)).await);

    assert!(h.plane.disarm_chat(&key, ChatKey(9)).await.unwrap());
    assert!(!h.plane.disarm_chat(&key, ChatKey(9)).await.unwrap());
    h.plane.shutdown().await;
}

#[tokio::test]
async fn group_messages_are_ignored() {
    let h = harness().await;
    let key = running_account(&h).await;
    let session = h.plane.session(&key).unwrap();
    assert!(h.plane.arm_chat(&key, ChatKey(-100)).await.unwrap());

    let mut group = message(-100, 1, false, "hello everyone");
    group.is_private = false;
    h.provider.deliver(&key, group).await;
    h.provider.deliver(&key, message(5, 2, true, "ping")).await;
    wait_for_history(&session, 5, 0).await;

    assert_eq!(session.history_len(ChatKey(-100)).await, Some(0));
    assert!(h.completion.requests().is_empty());
    h.plane.shutdown().await;
}
