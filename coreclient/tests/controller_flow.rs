// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end controller scenarios over the scripted in-memory agent.

use std::time::Duration;

use chrono::Utc;
use courieragentclient::{
    AgentEntity, AgentEvent, AgentEventEnvelope, MsgFlags, MsgMeta,
    mock::{MockAgent, MockCommand},
};
use couriercommon::{
    identifiers::{AgentConnId, SharedMsgId},
    messages::{
        ChatMessage, ChatMsgEvent, ExtMsgContent, FileDescrPart, FileInvitation, InlineFileMode,
        MsgContainer, MsgContent,
    },
    profile::{GroupMemberRole, Profile},
};
use couriercoreclient::{
    ChatConfig, ChatController, ChatResponse,
    chats::CIDirection,
    commands::{ChatCommand, ChatTarget, ContactTarget, GroupTarget},
    groups::GroupMemberStatus,
    open_memory_store,
};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

type Events = mpsc::Receiver<ChatResponse>;

async fn setup() -> (ChatController<MockAgent>, Events, MockAgent) {
    let pool = open_memory_store().await.unwrap();
    let agent = MockAgent::new();
    let (controller, events) = ChatController::new(pool, agent.clone(), ChatConfig::default());
    let response = controller
        .process_command(ChatCommand::CreateActiveUser {
            profile: Profile::new("alice"),
        })
        .await
        .unwrap();
    assert!(matches!(response, ChatResponse::ActiveUser(_)));
    (controller, events, agent)
}

fn conn_event(conn_id: &AgentConnId, event: AgentEvent) -> AgentEventEnvelope {
    AgentEventEnvelope {
        corr_id: None,
        entity: AgentEntity::Connection(conn_id.clone()),
        event,
    }
}

fn msg_event(conn_id: &AgentConnId, agent_msg_id: i64, body: Vec<u8>) -> AgentEventEnvelope {
    conn_event(
        conn_id,
        AgentEvent::Msg {
            meta: MsgMeta {
                agent_msg_id,
                broker_ts: Utc::now(),
            },
            flags: MsgFlags::default(),
            body,
        },
    )
}

fn wire(event: ChatMsgEvent) -> Vec<u8> {
    ChatMessage::new(None, event).encode(false).unwrap()
}

fn wire_with_id(shared_msg_id: SharedMsgId, event: ChatMsgEvent) -> Vec<u8> {
    ChatMessage::new(Some(shared_msg_id), event)
        .encode(false)
        .unwrap()
}

/// Decoded protocol events sent on a connection, skipping binary frames.
fn sent_events(agent: &MockAgent, conn_id: &AgentConnId) -> Vec<ChatMessage> {
    agent
        .sent_messages(conn_id)
        .iter()
        .map(|body| ChatMessage::decode(body).unwrap())
        .collect()
}

async fn next_event(events: &mut Events) -> ChatResponse {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn wait_for<F: Fn(&ChatResponse) -> bool>(events: &mut Events, matches: F) -> ChatResponse {
    loop {
        let event = next_event(events).await;
        if matches(&event) {
            return event;
        }
    }
}

/// Connects a peer named `name`; returns its contact id and connection.
async fn connected_contact(
    controller: &ChatController<MockAgent>,
    agent: &MockAgent,
    name: &str,
) -> (i64, AgentConnId) {
    let before = agent.commands().len();
    controller
        .process_text(&format!("/c mock://{name}"))
        .await
        .unwrap();
    assert!(matches!(
        &agent.commands()[before],
        MockCommand::JoinConnection { .. }
    ));
    let conn_id = MockAgent::conn_id(count_conns(agent) - 1);
    controller
        .process_agent_event(conn_event(
            &conn_id,
            AgentEvent::Info {
                conn_info: wire(ChatMsgEvent::Info(Profile::new(name))),
            },
        ))
        .await;
    controller
        .process_agent_event(conn_event(&conn_id, AgentEvent::Connected))
        .await;

    let ChatResponse::ContactsList(contacts) = controller
        .process_command(ChatCommand::ListContacts)
        .await
        .unwrap()
    else {
        panic!("expected contact list")
    };
    let contact = contacts
        .iter()
        .filter(|contact| contact.profile.display_name == name)
        .max_by_key(|contact| contact.contact_id)
        .expect("contact created");
    (contact.contact_id, conn_id)
}

#[tokio::test]
async fn send_then_edit_direct_text() {
    let (controller, _events, agent) = setup().await;
    let (contact_id, conn_id) = connected_contact(&controller, &agent, "bob").await;

    let response = controller
        .process_text(&format!("/_send @{contact_id} live=off text hi"))
        .await
        .unwrap();
    let ChatResponse::NewChatItem(item) = response else {
        panic!("expected new chat item")
    };
    assert_eq!(item.item_text, "hi");
    assert_eq!(item.item_sent, CIDirection::Snd);
    let shared_msg_id = item.shared_msg_id.expect("sent item has shared id");

    let response = controller
        .process_text(&format!(
            "/_update item @{contact_id} {} live=off text hello",
            item.chat_item_id
        ))
        .await
        .unwrap();
    let ChatResponse::ChatItemUpdated(updated) = response else {
        panic!("expected updated item")
    };
    assert_eq!(updated.chat_item_id, item.chat_item_id);
    assert_eq!(updated.item_text, "hello");
    assert!(updated.item_edited);

    // wire: one x.msg.new then one x.msg.update addressing the same id
    let sent = sent_events(&agent, &conn_id);
    let new_msg = sent
        .iter()
        .find(|message| matches!(message.event, ChatMsgEvent::MsgNew(_)))
        .expect("x.msg.new sent");
    assert_eq!(new_msg.shared_msg_id, Some(shared_msg_id));
    let update = sent
        .iter()
        .find_map(|message| match &message.event {
            ChatMsgEvent::MsgUpdate { msg_id, content } => Some((msg_id, content)),
            _ => None,
        })
        .expect("x.msg.update sent");
    assert_eq!(*update.0, shared_msg_id);
    assert_eq!(*update.1, MsgContent::Text("hello".into()));
}

#[tokio::test]
async fn broadcast_delete_by_sender() {
    let (controller, _events, agent) = setup().await;
    let (contact_id, conn_id) = connected_contact(&controller, &agent, "bob").await;

    let ChatResponse::NewChatItem(item) = controller
        .process_text(&format!("/_send @{contact_id} live=off text oops"))
        .await
        .unwrap()
    else {
        panic!("expected new chat item")
    };
    let shared_msg_id = item.shared_msg_id.unwrap();

    let response = controller
        .process_text(&format!(
            "/_delete item @{contact_id} {} broadcast",
            item.chat_item_id
        ))
        .await
        .unwrap();
    let ChatResponse::ChatItemDeleted { by_user, timed, .. } = response else {
        panic!("expected deletion")
    };
    assert!(by_user);
    assert!(!timed);

    let sent = sent_events(&agent, &conn_id);
    let deleted = sent
        .iter()
        .find_map(|message| match &message.event {
            ChatMsgEvent::MsgDel { msg_id, member_id } => Some((msg_id, member_id)),
            _ => None,
        })
        .expect("x.msg.del sent");
    assert_eq!(*deleted.0, shared_msg_id);
    assert!(deleted.1.is_none());
}

#[tokio::test]
async fn rcv_message_redelivery_is_idempotent() {
    let (controller, _events, agent) = setup().await;
    let (contact_id, conn_id) = connected_contact(&controller, &agent, "bob").await;

    let body = wire_with_id(
        SharedMsgId::new([7; 16]),
        ChatMsgEvent::MsgNew(MsgContainer::Simple(ExtMsgContent::plain(
            MsgContent::Text("hi".into()),
        ))),
    );
    controller
        .process_agent_event(msg_event(&conn_id, 100, body.clone()))
        .await;
    // same agent message id again: no second item
    controller
        .process_agent_event(msg_event(&conn_id, 100, body))
        .await;

    let ChatResponse::ChatItems { items, .. } = controller
        .process_text(&format!("/_get chat @{contact_id} count=10"))
        .await
        .unwrap()
    else {
        panic!("expected chat items")
    };
    let received: Vec<_> = items
        .iter()
        .filter(|item| item.item_sent == CIDirection::Rcv && item.item_text == "hi")
        .collect();
    assert_eq!(received.len(), 1);
    let _ = agent;
}

#[tokio::test]
async fn out_of_order_update_synthesizes_late_item() {
    let (controller, _events, agent) = setup().await;
    let (contact_id, conn_id) = connected_contact(&controller, &agent, "bob").await;

    let shared = SharedMsgId::new([8; 16]);
    let update = wire(ChatMsgEvent::MsgUpdate {
        msg_id: shared,
        content: MsgContent::Text("edited before new".into()),
    });
    controller
        .process_agent_event(msg_event(&conn_id, 1, update))
        .await;

    let ChatResponse::ChatItems { items, .. } = controller
        .process_text(&format!("/_get chat @{contact_id} count=10"))
        .await
        .unwrap()
    else {
        panic!("expected chat items")
    };
    let late = items
        .iter()
        .find(|item| item.shared_msg_id == Some(shared))
        .expect("late item materialized");
    assert_eq!(late.item_text, "edited before new");

    // the delete addressing the same id now resolves
    let delete = wire(ChatMsgEvent::MsgDel {
        msg_id: shared,
        member_id: None,
    });
    controller
        .process_agent_event(msg_event(&conn_id, 2, delete))
        .await;
    let ChatResponse::ChatItems { items, .. } = controller
        .process_text(&format!("/_get chat @{contact_id} count=10"))
        .await
        .unwrap()
    else {
        panic!("expected chat items")
    };
    let late = items
        .iter()
        .find(|item| item.shared_msg_id == Some(shared))
        .expect("item still present after soft delete");
    assert!(late.item_deleted);
}

#[tokio::test]
async fn group_introduction_as_host() {
    let (controller, mut events, agent) = setup().await;
    let (contact_a, _conn_a) = connected_contact(&controller, &agent, "anna").await;
    let (contact_n, _conn_n) = connected_contact(&controller, &agent, "nico").await;

    let ChatResponse::GroupCreated(group) = controller
        .process_command(ChatCommand::NewGroup {
            profile: couriercommon::profile::GroupProfile::new("team"),
        })
        .await
        .unwrap()
    else {
        panic!("expected group")
    };

    // invite anna; her invitation connection is the next one the mock makes
    let before = count_conns(&agent);
    let ChatResponse::SentGroupInvitation { member: anna, .. } = controller
        .process_command(ChatCommand::AddMember {
            group: GroupTarget::Id(group.group_id),
            contact: ContactTarget::Id(contact_a),
            role: GroupMemberRole::Admin,
        })
        .await
        .unwrap()
    else {
        panic!("expected invitation")
    };
    let anna_group_conn = MockAgent::conn_id(before);
    controller
        .process_agent_event(conn_event(
            &anna_group_conn,
            AgentEvent::Confirmation {
                confirmation_id: couriercommon::identifiers::ConfirmationId(vec![1]),
                conn_info: wire(ChatMsgEvent::GrpAcpt {
                    member_id: anna.member_id,
                }),
            },
        ))
        .await;
    controller
        .process_agent_event(conn_event(&anna_group_conn, AgentEvent::Connected))
        .await;
    wait_for(&mut events, |event| {
        matches!(event, ChatResponse::JoinedGroupMember { .. })
    })
    .await;

    // invite nico; once he connects, the host announces and introduces him
    // to anna
    let before = count_conns(&agent);
    let ChatResponse::SentGroupInvitation { member: nico, .. } = controller
        .process_command(ChatCommand::AddMember {
            group: GroupTarget::Id(group.group_id),
            contact: ContactTarget::Id(contact_n),
            role: GroupMemberRole::Member,
        })
        .await
        .unwrap()
    else {
        panic!("expected invitation")
    };
    let nico_group_conn = MockAgent::conn_id(before);
    controller
        .process_agent_event(conn_event(
            &nico_group_conn,
            AgentEvent::Confirmation {
                confirmation_id: couriercommon::identifiers::ConfirmationId(vec![2]),
                conn_info: wire(ChatMsgEvent::GrpAcpt {
                    member_id: nico.member_id,
                }),
            },
        ))
        .await;
    controller
        .process_agent_event(conn_event(&nico_group_conn, AgentEvent::Connected))
        .await;

    let to_anna = sent_events(&agent, &anna_group_conn);
    let announced = to_anna
        .iter()
        .find_map(|message| match &message.event {
            ChatMsgEvent::GrpMemNew(info) => Some(info),
            _ => None,
        })
        .expect("x.grp.mem.new sent to existing member");
    assert_eq!(announced.member_id, nico.member_id);
    let introduced = to_anna
        .iter()
        .find_map(|message| match &message.event {
            ChatMsgEvent::GrpMemIntro(info) => Some(info),
            _ => None,
        })
        .expect("x.grp.mem.intro sent to existing member");
    assert_eq!(introduced.member_id, nico.member_id);

    // anna returns her fresh connection requests; the host forwards them
    let inv = wire(ChatMsgEvent::GrpMemInv {
        member_id: nico.member_id,
        intro_inv: couriercommon::messages::IntroInvitation {
            group_conn_req: couriercommon::identifiers::ConnReqUri("mock://anna-group".into()),
            direct_conn_req: Some(couriercommon::identifiers::ConnReqUri(
                "mock://anna-direct".into(),
            )),
        },
    });
    controller
        .process_agent_event(msg_event(&anna_group_conn, 10, inv))
        .await;

    let to_nico = sent_events(&agent, &nico_group_conn);
    let forwarded = to_nico
        .iter()
        .find_map(|message| match &message.event {
            ChatMsgEvent::GrpMemFwd { member, intro_inv } => Some((member, intro_inv)),
            _ => None,
        })
        .expect("x.grp.mem.fwd sent to new member");
    assert_eq!(forwarded.0.member_id, anna.member_id);
    assert_eq!(forwarded.1.group_conn_req.0, "mock://anna-group");
}

#[tokio::test]
async fn group_introduction_as_existing_member() {
    let (controller, mut events, agent) = setup().await;
    let (_contact_h, host_conn) = connected_contact(&controller, &agent, "host").await;

    // the host invites us into a group
    let invitation = couriercommon::messages::GroupInvitation {
        from_member: couriercommon::messages::MemberIdRole {
            member_id: couriercommon::identifiers::MemberId::new([1; 16]),
            role: GroupMemberRole::Owner,
        },
        invited_member: couriercommon::messages::MemberIdRole {
            member_id: couriercommon::identifiers::MemberId::new([2; 16]),
            role: GroupMemberRole::Admin,
        },
        conn_request: couriercommon::identifiers::ConnReqUri("mock://group-host".into()),
        group_profile: couriercommon::profile::GroupProfile::new("team"),
        group_link_id: None,
    };
    controller
        .process_agent_event(msg_event(&host_conn, 1, wire(ChatMsgEvent::GrpInv(invitation))))
        .await;
    let ChatResponse::ReceivedGroupInvitation { group, .. } =
        wait_for(&mut events, |event| {
            matches!(event, ChatResponse::ReceivedGroupInvitation { .. })
        })
        .await
    else {
        unreachable!()
    };

    let before = count_conns(&agent);
    controller
        .process_command(ChatCommand::JoinGroup {
            group: GroupTarget::Id(group.group_id),
        })
        .await
        .unwrap();
    let host_member_conn = MockAgent::conn_id(before);
    controller
        .process_agent_event(conn_event(&host_member_conn, AgentEvent::Connected))
        .await;
    wait_for(&mut events, |event| {
        matches!(event, ChatResponse::UserJoinedGroup(_))
    })
    .await;

    // the host announces and introduces a new member
    let nico_member_id = couriercommon::identifiers::MemberId::new([3; 16]);
    let nico_info = couriercommon::messages::MemberInfo {
        member_id: nico_member_id,
        role: GroupMemberRole::Member,
        profile: Profile::new("nico"),
    };
    controller
        .process_agent_event(msg_event(
            &host_member_conn,
            2,
            wire(ChatMsgEvent::GrpMemNew(nico_info.clone())),
        ))
        .await;
    assert_eq!(
        member_status(&controller, group.group_id, "nico").await,
        GroupMemberStatus::Announced
    );

    let before = count_conns(&agent);
    controller
        .process_agent_event(msg_event(
            &host_member_conn,
            3,
            wire(ChatMsgEvent::GrpMemIntro(nico_info)),
        ))
        .await;
    // two fresh connections and the x.grp.mem.inv reply to the host
    let nico_intro_conn = MockAgent::conn_id(before);
    assert_eq!(count_conns(&agent), before + 2);
    let to_host = sent_events(&agent, &host_member_conn);
    assert!(to_host.iter().any(|message| matches!(
        &message.event,
        ChatMsgEvent::GrpMemInv { member_id, .. } if *member_id == nico_member_id
    )));
    assert_eq!(
        member_status(&controller, group.group_id, "nico").await,
        GroupMemberStatus::IntroInvited
    );

    // nico reaches us on the introduced connection
    controller
        .process_agent_event(conn_event(
            &nico_intro_conn,
            AgentEvent::Confirmation {
                confirmation_id: couriercommon::identifiers::ConfirmationId(vec![3]),
                conn_info: wire(ChatMsgEvent::GrpMemInfo {
                    member_id: nico_member_id,
                    profile: Profile::new("nico"),
                }),
            },
        ))
        .await;
    wait_for(&mut events, |event| {
        matches!(event, ChatResponse::JoinedGroupMemberConnecting { .. })
    })
    .await;
    assert_eq!(
        member_status(&controller, group.group_id, "nico").await,
        GroupMemberStatus::Connecting
    );

    controller
        .process_agent_event(conn_event(&nico_intro_conn, AgentEvent::Connected))
        .await;
    wait_for(&mut events, |event| {
        matches!(event, ChatResponse::ConnectedToGroupMember { .. })
    })
    .await;
    assert_eq!(
        member_status(&controller, group.group_id, "nico").await,
        GroupMemberStatus::Connected
    );
}

#[tokio::test]
async fn inline_voice_file_receive() {
    let (controller, mut events, agent) = setup().await;
    let dir = tempfile::tempdir().unwrap();
    controller
        .process_command(ChatCommand::SetFilesFolder(dir.path().to_path_buf()))
        .await
        .unwrap();
    let (_contact_id, conn_id) = connected_contact(&controller, &agent, "bob").await;

    let bytes: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
    let chunk_size = 15_780usize;
    let shared = SharedMsgId::new([9; 16]);
    let invitation = FileInvitation {
        file_name: "voice.m4a".into(),
        file_size: bytes.len() as i64,
        file_digest: Some(hex::encode(Sha256::digest(&bytes))),
        file_conn_req: None,
        file_inline: Some(InlineFileMode::Sent),
        file_descr: None,
    };
    let body = wire_with_id(
        shared,
        ChatMsgEvent::MsgNew(MsgContainer::Simple(ExtMsgContent {
            content: MsgContent::Voice {
                text: String::new(),
                duration: 11,
            },
            file: Some(invitation),
            ttl: None,
            live: None,
        })),
    );
    controller.process_agent_event(msg_event(&conn_id, 1, body)).await;
    wait_for(&mut events, |event| {
        matches!(event, ChatResponse::RcvFileStart { .. })
    })
    .await;

    for (index, chunk) in bytes.chunks(chunk_size).enumerate() {
        let frame = ChatMessage::new(
            Some(shared),
            ChatMsgEvent::FileChunk {
                chunk_no: index as u32 + 1,
                chunk: chunk.to_vec(),
            },
        )
        .encode(true)
        .unwrap();
        controller
            .process_agent_event(msg_event(&conn_id, 2 + index as i64, frame))
            .await;
    }

    let ChatResponse::RcvFileComplete { target_path, .. } = wait_for(&mut events, |event| {
        matches!(event, ChatResponse::RcvFileComplete { .. })
    })
    .await
    else {
        unreachable!()
    };
    let received = std::fs::read(&target_path).unwrap();
    assert_eq!(received.len(), 40_000);
    assert_eq!(Sha256::digest(&received), Sha256::digest(&bytes));
}

#[tokio::test]
async fn xftp_descriptor_is_sent_in_parts() {
    let (controller, _events, agent) = setup().await;
    let (contact_id, conn_id) = connected_contact(&controller, &agent, "bob").await;

    // too many chunks for inline: handed to the agent as an XFTP upload
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.bin");
    std::fs::write(&path, vec![0xA5u8; 300_000]).unwrap();
    controller
        .process_command(ChatCommand::SendFile {
            chat: ChatTarget::Ref(couriercoreclient::chats::ChatRef::Direct(contact_id)),
            path: path.clone(),
        })
        .await
        .unwrap();
    let snd_file_id = agent
        .commands()
        .iter()
        .find_map(|command| match command {
            MockCommand::XftpSendFile { .. } => Some(1),
            _ => None,
        })
        .expect("file handed to XFTP");

    // upload finished: one descriptor for the single recipient
    let descriptor = "d".repeat(20_000);
    controller
        .process_agent_event(AgentEventEnvelope {
            corr_id: None,
            entity: AgentEntity::SndFile(snd_file_id),
            event: AgentEvent::SndFileDone {
                descriptors: vec![descriptor.clone()],
            },
        })
        .await;

    let sent = sent_events(&agent, &conn_id);
    let parts: Vec<&FileDescrPart> = sent
        .iter()
        .filter_map(|message| match &message.event {
            ChatMsgEvent::MsgFileDescr { file_descr, .. } => Some(file_descr),
            _ => None,
        })
        .collect();
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].part_no, 0);
    assert_eq!(parts[0].text.len(), 14_000);
    assert!(!parts[0].complete);
    assert_eq!(parts[1].part_no, 1);
    assert_eq!(parts[1].text.len(), 6_000);
    assert!(parts[1].complete);
    let reassembled: String = parts.iter().map(|part| part.text.as_str()).collect();
    assert_eq!(reassembled, descriptor);
}

#[tokio::test]
async fn xftp_receive_across_descriptor_parts() {
    let (controller, mut events, agent) = setup().await;
    let dir = tempfile::tempdir().unwrap();
    controller
        .process_command(ChatCommand::SetFilesFolder(dir.path().to_path_buf()))
        .await
        .unwrap();
    let (_contact_id, conn_id) = connected_contact(&controller, &agent, "bob").await;

    let shared = SharedMsgId::new([4; 16]);
    let body = wire_with_id(
        shared,
        ChatMsgEvent::MsgNew(MsgContainer::Simple(ExtMsgContent {
            content: MsgContent::File("big.bin".into()),
            file: Some(FileInvitation {
                file_name: "big.bin".into(),
                file_size: 300_000,
                file_digest: None,
                file_conn_req: None,
                file_inline: None,
                file_descr: None,
            }),
            ttl: None,
            live: None,
        })),
    );
    controller.process_agent_event(msg_event(&conn_id, 1, body)).await;
    let item = wait_for(&mut events, |event| {
        matches!(event, ChatResponse::NewChatItem(_))
    })
    .await;
    let ChatResponse::NewChatItem(item) = item else {
        unreachable!()
    };
    let file_id = item.file_id.expect("item carries a file");

    controller
        .process_command(ChatCommand::ReceiveFile {
            file_id,
            path: None,
        })
        .await
        .unwrap();

    // the descriptor arrives in two ordered parts
    let descriptor = "x".repeat(20_000);
    for (part_no, (text, complete)) in [
        (&descriptor[..14_000], false),
        (&descriptor[14_000..], true),
    ]
    .into_iter()
    .enumerate()
    {
        let part = FileDescrPart {
            part_no: part_no as u32,
            text: text.to_owned(),
            complete,
        };
        controller
            .process_agent_event(msg_event(
                &conn_id,
                10 + part_no as i64,
                wire(ChatMsgEvent::MsgFileDescr {
                    msg_id: shared,
                    file_descr: part,
                }),
            ))
            .await;
    }
    let agent_rcv_file_id = agent
        .commands()
        .iter()
        .find_map(|command| match command {
            MockCommand::XftpReceiveFile { descriptor: d, .. } => {
                assert_eq!(d, &descriptor);
                Some(1)
            }
            _ => None,
        })
        .expect("descriptor handed to the agent");

    // the agent finishes the download into its staging area
    let staging = dir.path().join("staging.part");
    std::fs::write(&staging, vec![7u8; 1000]).unwrap();
    controller
        .process_agent_event(AgentEventEnvelope {
            corr_id: None,
            entity: AgentEntity::RcvFile(agent_rcv_file_id),
            event: AgentEvent::RcvFileDone {
                staging_path: staging.display().to_string(),
            },
        })
        .await;

    let ChatResponse::RcvFileComplete { target_path, .. } = wait_for(&mut events, |event| {
        matches!(event, ChatResponse::RcvFileComplete { .. })
    })
    .await
    else {
        unreachable!()
    };
    assert!(target_path.ends_with("big.bin"));
    assert_eq!(std::fs::read(target_path).unwrap(), vec![7u8; 1000]);
    assert!(!staging.exists());
}

#[tokio::test(start_paused = true)]
async fn timed_message_is_deleted_after_ttl() {
    let (controller, mut events, agent) = setup().await;
    let (contact_id, _conn_id) = connected_contact(&controller, &agent, "bob").await;

    let ChatResponse::NewChatItem(item) = controller
        .process_text(&format!("/_send @{contact_id} live=off ttl=60 text soon gone"))
        .await
        .unwrap()
    else {
        panic!("expected new chat item")
    };
    let timed = item.timed.expect("item is timed");
    assert_eq!(timed.ttl, 60);
    assert!(timed.delete_at.is_some());

    tokio::time::sleep(Duration::from_secs(61)).await;

    let deleted = wait_for(&mut events, |event| {
        matches!(event, ChatResponse::ChatItemDeleted { .. })
    })
    .await;
    let ChatResponse::ChatItemDeleted { by_user, timed, deleted_item, .. } = deleted else {
        unreachable!()
    };
    assert!(!by_user);
    assert!(timed);
    assert_eq!(deleted_item.chat_item_id, item.chat_item_id);

    let ChatResponse::ChatItems { items, .. } = controller
        .process_text(&format!("/_get chat @{contact_id} count=10"))
        .await
        .unwrap()
    else {
        panic!("expected chat items")
    };
    assert!(items.iter().all(|i| i.chat_item_id != item.chat_item_id));
}

#[tokio::test]
async fn contacts_merge_after_probe_match() {
    let (controller, mut events, agent) = setup().await;
    // two contact rows with the same profile, as after a group promotion
    let (first_id, first_conn) = connected_contact(&controller, &agent, "bob").await;
    let (second_id, second_conn) = connected_contact(&controller, &agent, "bob").await;
    assert_ne!(first_id, second_id);

    // second identity probes us; the profiles match, so we answer with the
    // probe hash on the first connection... the peer then confirms.
    let probe = couriercommon::identifiers::Probe::new([5; 16]);
    controller
        .process_agent_event(msg_event(
            &second_conn,
            50,
            wire(ChatMsgEvent::InfoProbe(probe)),
        ))
        .await;
    let check = sent_events(&agent, &first_conn)
        .into_iter()
        .find_map(|message| match message.event {
            ChatMsgEvent::InfoProbeCheck(hash) => Some(hash),
            _ => None,
        })
        .expect("probe check sent on the duplicate channel");
    assert_eq!(check, couriercommon::identifiers::ProbeHash::of(&probe));

    controller
        .process_agent_event(msg_event(
            &first_conn,
            51,
            wire(ChatMsgEvent::InfoProbeOk(probe)),
        ))
        .await;
    let ChatResponse::ContactsMerged {
        into_contact,
        merged_contact_id,
    } = wait_for(&mut events, |event| {
        matches!(event, ChatResponse::ContactsMerged { .. })
    })
    .await
    else {
        unreachable!()
    };
    assert_eq!(into_contact.contact_id, first_id);
    assert_eq!(merged_contact_id, second_id);

    let ChatResponse::ContactsList(contacts) = controller
        .process_command(ChatCommand::ListContacts)
        .await
        .unwrap()
    else {
        panic!("expected contact list")
    };
    assert_eq!(
        contacts
            .iter()
            .filter(|contact| contact.profile.display_name == "bob")
            .count(),
        1
    );
}

fn count_conns(agent: &MockAgent) -> u64 {
    agent
        .commands()
        .iter()
        .filter(|command| {
            matches!(
                command,
                MockCommand::JoinConnection { .. }
                    | MockCommand::CreateConnection { .. }
                    | MockCommand::CreateConnectionAsync { .. }
                    | MockCommand::AcceptContact { .. }
            )
        })
        .count() as u64
}

async fn member_status(
    controller: &ChatController<MockAgent>,
    group_id: i64,
    name: &str,
) -> GroupMemberStatus {
    let ChatResponse::GroupMembers { members, .. } = controller
        .process_command(ChatCommand::ListMembers {
            group: GroupTarget::Id(group_id),
        })
        .await
        .unwrap()
    else {
        panic!("expected members")
    };
    members
        .iter()
        .find(|member| member.profile.display_name == name)
        .unwrap_or_else(|| panic!("member {name} not found"))
        .member_status
}
