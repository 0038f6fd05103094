//! End-to-end behavior of an account against a scripted server.
//!
//! Every test signs in through the public API over an in-memory network and
//! plays the server side line by line.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use msnp::core::Command;
use msnp::roster::{MemoryRosterStore, RosterStore};
use msnp::session::invitation::InvitationFields;
use msnp::session::message::{ChatMessage, MimeMessage};
use msnp::session::{FileReceiver, FileSender, SessionError, TicketError, TransferSettings};
use msnp::{
    Account, AccountConfig, AccountEvent, Application, AuthFailure, ClientError, Cookie,
    DisconnectReason, GroupId, Handle, SessionId, TransferFailure,
};
use msnp_testkit::{FailingTicketService, FakeNetwork, FakeServer, FixedTicketService, REPLY_WAIT};

const ALICE: &str = "alice@example.com";
const BOB: &str = "bob@example.com";
const SWITCHBOARD: &str = "sb.example:1863";

struct Harness {
    account: Account,
    events: mpsc::Receiver<AccountEvent>,
    network: FakeNetwork,
    ns: FakeServer,
}

async fn connect(config: AccountConfig, store: Arc<MemoryRosterStore>) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (mut network, connector) = FakeNetwork::new();
    let builder = Account::builder(ALICE, "secret")
        .config(config)
        .connector(connector)
        .ticket_service(Arc::new(FixedTicketService::default()))
        .roster_store(store);

    let script = async {
        let ns = network.accept().await?;
        ns.login(ALICE, "Alice").await?;
        anyhow::Ok(ns)
    };
    let (client, ns) = tokio::join!(builder.connect(), script);
    let (account, mut events) = client.unwrap();
    let ns = ns.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        AccountEvent::Connected {
            display_name: "Alice".into()
        }
    );
    Harness {
        account,
        events,
        network,
        ns,
    }
}

/// Sign in with an empty roster and wait until we are online.
async fn sign_in(config: AccountConfig) -> Harness {
    let mut harness = connect(config, Arc::new(MemoryRosterStore::new())).await;
    harness.ns.push_roster(("1", "1"), &[], &[]).await.unwrap();
    wait_for(&mut harness.events, |e| matches!(e, AccountEvent::SelfPresenceChanged { .. })).await;
    harness
}

async fn next_event(events: &mut mpsc::Receiver<AccountEvent>) -> AccountEvent {
    tokio::time::timeout(REPLY_WAIT, events.recv())
        .await
        .expect("no event within the wait")
        .expect("event stream ended")
}

async fn wait_for(
    events: &mut mpsc::Receiver<AccountEvent>,
    matches: impl Fn(&AccountEvent) -> bool,
) -> AccountEvent {
    loop {
        let event = next_event(events).await;
        if matches(&event) {
            return event;
        }
    }
}

fn chat_payload(command: &Command) -> ChatMessage {
    let payload = command.payload.as_ref().expect("MSG without payload");
    ChatMessage::from_mime(&MimeMessage::parse(payload).unwrap())
}

fn invitation_fields(command: &Command) -> InvitationFields {
    match chat_payload(command) {
        ChatMessage::Invitation(fields) => fields,
        other => panic!("expected invitation, got {:?}", other),
    }
}

/// A chat message from `from` as the switchboard relays it.
fn relayed(from: &str, nick: &str, message: &ChatMessage) -> Command {
    Command::new("MSG")
        .args([from, nick])
        .with_payload(message.to_mime().to_bytes())
}

/// Walk an outgoing switchboard request to the point where Bob has joined.
async fn dial_bob(harness: &mut Harness) -> FakeServer {
    let xfr = harness.ns.expect("XFR").await.unwrap();
    assert_eq!(xfr.get(0), Some("SB"));
    harness
        .ns
        .reply(&xfr, &format!("SB {SWITCHBOARD} CKI 17262740.1050826919.32308"))
        .await
        .unwrap();

    let sb = harness.network.accept().await.unwrap();
    assert_eq!(sb.addr, SWITCHBOARD);
    let usr = sb.expect("USR").await.unwrap();
    assert_eq!(usr.args, vec![ALICE, "17262740.1050826919.32308"]);
    sb.reply(&usr, &format!("OK {ALICE} Alice")).await.unwrap();

    let cal = sb.expect("CAL").await.unwrap();
    assert_eq!(cal.get(0), Some(BOB));
    sb.reply(&cal, "RINGING 11752013").await.unwrap();
    sb.send_line(&format!("JOI {BOB} Bob")).await.unwrap();
    sb
}

/// Bob rings us; answer and wait for the session to open.
async fn answer_bob(harness: &mut Harness) -> (FakeServer, SessionId) {
    harness
        .ns
        .send_line(&format!("RNG 11752013 {SWITCHBOARD} CKI 849102291.520491113 {BOB} Bob"))
        .await
        .unwrap();

    let sb = harness.network.accept().await.unwrap();
    let ans = sb.expect("ANS").await.unwrap();
    assert_eq!(ans.args, vec![ALICE, "849102291.520491113", "11752013"]);
    let trid = ans.trid.unwrap();
    sb.send_line(&format!("IRO {trid} 1 1 {BOB} Bob")).await.unwrap();
    sb.reply(&ans, "OK").await.unwrap();

    let opened = wait_for(&mut harness.events, |e| matches!(e, AccountEvent::SessionOpened { .. })).await;
    let AccountEvent::SessionOpened { session, participants } = opened else {
        unreachable!()
    };
    assert_eq!(participants, vec![Handle::new(BOB)]);
    (sb, session)
}

fn file_contents(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

// ─────────────────────────────────────────────────────────────────────────────
// Login
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_ticket_failure_after_redirect_is_bad_ticket() {
    let (mut network, connector) = FakeNetwork::new();
    let builder = Account::builder(ALICE, "secret")
        .connector(connector)
        .ticket_service(Arc::new(FailingTicketService(TicketError::InvalidHost(
            "login.example".into(),
        ))));

    let script = async {
        let dispatch = network.accept().await?;
        dispatch.redirect("ns2.example:1863").await?;

        let ns = network.accept().await?;
        assert_eq!(ns.addr, "ns2.example:1863");
        let usr = ns.negotiate().await?;
        ns.reply(&usr, "TWN S lc=1033,id=507,tw=40").await?;
        // No second attempt on this socket.
        ns.expect_closed().await
    };
    let (client, script) = tokio::join!(builder.connect(), script);
    script.unwrap();

    match client {
        Err(ClientError::Auth(failure)) => assert_eq!(failure, AuthFailure::BadTicket),
        other => panic!("expected a bad ticket, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_sign_in_reports_roster_and_presence() {
    let mut harness = connect(AccountConfig::default(), Arc::new(MemoryRosterStore::new())).await;
    harness
        .ns
        .push_roster(
            ("10", "20"),
            &[(0, "Other Contacts"), (1, "Friends")],
            &[(BOB, "Bob", 11, "1")],
        )
        .await
        .unwrap();

    assert_eq!(
        wait_for(&mut harness.events, |e| matches!(e, AccountEvent::RosterSynced { .. })).await,
        AccountEvent::RosterSynced {
            contacts: 1,
            groups: 2,
            full: true
        }
    );

    let roster = harness.account.roster().await.unwrap();
    let bob = roster.contact(&Handle::new(BOB)).unwrap();
    assert_eq!(bob.display_name, "Bob");
    assert!(bob.local_groups.contains("Friends"));
    assert_eq!(roster.default_group_name(), "Other Contacts");
}

// ─────────────────────────────────────────────────────────────────────────────
// Roster
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_group_move_never_leaves_contact_groupless() {
    let store = Arc::new(MemoryRosterStore::new());
    let mut harness = connect(AccountConfig::default(), Arc::clone(&store)).await;
    harness
        .ns
        .push_roster(
            ("10", "20"),
            &[(0, "~"), (1, "Friends"), (2, "G2"), (3, "G3")],
            &[(BOB, "Bob", 11, "2,3")],
        )
        .await
        .unwrap();
    wait_for(&mut harness.events, |e| matches!(e, AccountEvent::RosterSynced { .. })).await;

    harness.account.set_contact_groups(BOB, ["Friends"]).await.unwrap();

    let add = harness.ns.expect("ADD").await.unwrap();
    assert_eq!(add.args, vec!["FL", BOB, "Bob", "1"]);
    let rem = harness.ns.expect("REM").await.unwrap();
    assert_eq!(rem.args, vec!["FL", BOB, "2"]);

    harness.ns.reply(&add, &format!("FL 21 {BOB} Bob 1")).await.unwrap();
    harness.ns.reply(&rem, &format!("FL 22 {BOB} 2")).await.unwrap();

    let bob = Handle::new(BOB);
    wait_for(&mut harness.events, |e| {
        *e == AccountEvent::GroupMembershipChanged {
            handle: bob.clone(),
            groups: vec![GroupId(1), GroupId(3)],
        }
    })
    .await;

    let roster = harness.account.roster().await.unwrap();
    let contact = roster.contact(&bob).unwrap();
    assert!(contact.server_groups.contains(&GroupId(1)));
    assert!(!contact.server_groups.contains(&GroupId(2)));
    assert_eq!(contact.local_groups.iter().map(String::as_str).collect::<Vec<_>>(), vec!["Friends"]);

    let stored = store.load().await.unwrap();
    let record = stored.contacts.iter().find(|c| c.handle == bob).unwrap();
    assert_eq!(record.groups, vec![GroupId(1), GroupId(3)]);
    assert_eq!(stored.tokens.last_change, "22");

    // Asking for the same groups again leaves group 3 alone.
    harness.account.set_contact_groups(BOB, ["Friends"]).await.unwrap();
    harness.account.set_presence(msnp::Presence::Busy).await.unwrap();
    let chg = harness.ns.expect("CHG").await.unwrap();
    assert_eq!(chg.get(0), Some("BSY"));

    let Harness { account, ns, .. } = harness;
    let (signed_out, out) = tokio::join!(account.sign_out(), ns.expect("OUT"));
    signed_out.unwrap();
    out.unwrap();

    // The next sign-in starts from the stored roster and sends no removal.
    let mut harness = connect(AccountConfig::default(), Arc::clone(&store)).await;
    let chg = harness.ns.confirm_roster().await.unwrap();
    assert_eq!(chg.get(0), Some("NLN"));
    wait_for(&mut harness.events, |e| matches!(e, AccountEvent::SelfPresenceChanged { .. })).await;

    let roster = harness.account.roster().await.unwrap();
    assert_eq!(
        roster.contact(&bob).unwrap().server_groups.iter().copied().collect::<Vec<_>>(),
        vec![GroupId(1), GroupId(3)]
    );
}

#[tokio::test]
async fn test_rejected_contact_handle_never_reaches_the_wire() {
    let mut harness = sign_in(AccountConfig::default()).await;

    let err = harness.account.add_contact("no handle", msnp::List::Forward).await.unwrap_err();
    assert!(matches!(err, ClientError::Config(_)));

    harness.account.add_contact(BOB, msnp::List::Allow).await.unwrap();
    let add = harness.ns.expect("ADD").await.unwrap();
    assert_eq!(add.get(0), Some("AL"));
    assert_eq!(add.get(1), Some(BOB));
}

#[tokio::test]
async fn test_offline_presence_needs_sign_out() {
    let harness = sign_in(AccountConfig::default()).await;

    let err = harness.account.set_presence(msnp::Presence::Offline).await.unwrap_err();
    assert!(matches!(err, ClientError::Session(SessionError::InvalidRequest(_))));

    harness.account.set_presence(msnp::Presence::Invisible).await.unwrap();
    let chg = harness.ns.expect("CHG").await.unwrap();
    assert_eq!(chg.get(0), Some("HDN"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversations
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_first_message_opens_a_switchboard() {
    let mut harness = sign_in(AccountConfig::default()).await;

    let session = harness.account.open_session([BOB]).await.unwrap();
    harness.account.send_message(session, "hi bob").await.unwrap();
    let sb = dial_bob(&mut harness).await;

    let msg = sb.expect("MSG").await.unwrap();
    assert_eq!(msg.get(0), Some("A"));
    assert!(matches!(chat_payload(&msg), ChatMessage::Text { ref text, .. } if text == "hi bob"));

    wait_for(&mut harness.events, |e| matches!(e, AccountEvent::SessionOpened { .. })).await;

    sb.send(relayed(BOB, "Bob", &ChatMessage::text("hello alice"))).await.unwrap();
    assert_eq!(
        wait_for(&mut harness.events, |e| matches!(e, AccountEvent::MessageReceived { .. })).await,
        AccountEvent::MessageReceived {
            session,
            from: Handle::new(BOB),
            text: "hello alice".into()
        }
    );

    sb.send_line(&format!("BYE {BOB}")).await.unwrap();
    wait_for(&mut harness.events, |e| *e == AccountEvent::SessionClosed { session }).await;
}

#[tokio::test]
async fn test_answered_ring_relays_typing() {
    let mut harness = sign_in(AccountConfig::default()).await;
    let (sb, session) = answer_bob(&mut harness).await;

    let typing = ChatMessage::Typing {
        user: Handle::new(BOB),
    };
    sb.send(relayed(BOB, "Bob", &typing)).await.unwrap();
    assert_eq!(
        wait_for(&mut harness.events, |e| matches!(e, AccountEvent::TypingNotification { .. })).await,
        AccountEvent::TypingNotification {
            session,
            from: Handle::new(BOB)
        }
    );
}

#[tokio::test]
async fn test_sign_out_leaves_switchboards_first() {
    let mut harness = sign_in(AccountConfig::default()).await;
    let (sb, session) = answer_bob(&mut harness).await;

    let Harness {
        account,
        mut events,
        ns,
        ..
    } = harness;
    let (signed_out, ()) = tokio::join!(account.sign_out(), async {
        sb.expect("OUT").await.unwrap();
        ns.expect("OUT").await.unwrap();
    });
    signed_out.unwrap();

    wait_for(&mut events, |e| *e == AccountEvent::SessionClosed { session }).await;
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, AccountEvent::Disconnected { .. })).await,
        AccountEvent::Disconnected {
            reason: DisconnectReason::Requested
        }
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Invitations and transfers
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_received_file_reports_quarter_progress() {
    let mut harness = sign_in(AccountConfig::default()).await;
    let (sb, session) = answer_bob(&mut harness).await;

    let application = Application::FileTransfer {
        file_name: "notes.txt".into(),
        file_size: 1000,
    };
    let invite = InvitationFields::invite(&application, Cookie(555));
    sb.send(relayed(BOB, "Bob", &ChatMessage::Invitation(invite))).await.unwrap();
    assert_eq!(
        wait_for(&mut harness.events, |e| matches!(e, AccountEvent::InvitationReceived { .. })).await,
        AccountEvent::InvitationReceived {
            session,
            cookie: Cookie(555),
            from: Handle::new(BOB),
            application,
        }
    );

    harness.account.accept_invitation(session, Cookie(555)).await.unwrap();
    let accept = invitation_fields(&sb.expect("MSG").await.unwrap());
    assert_eq!(accept.command.as_deref(), Some("ACCEPT"));
    assert_eq!(accept.cookie, Some(555));

    let mut params = InvitationFields::accept(Cookie(555));
    params.ip_address = Some("10.0.0.2".into());
    params.port = Some(6891);
    params.auth_cookie = Some(777);
    sb.send(relayed(BOB, "Bob", &ChatMessage::Invitation(params))).await.unwrap();

    let (addr, mut link) = harness.network.accept_transfer().await.unwrap();
    assert_eq!(addr, "10.0.0.2:6891");

    let data = file_contents(1000);
    let sender = FileSender::new(
        Handle::new(ALICE),
        Cookie(777),
        data.clone(),
        TransferSettings {
            idle_timeout: REPLY_WAIT,
            chunk_size: 250,
        },
    );
    let (progress, _progress_rx) = mpsc::channel(16);
    // Completes only after the receiver's BYE.
    sender.run(&mut link, &progress, &CancellationToken::new()).await.unwrap();

    let mut percents = Vec::new();
    loop {
        match next_event(&mut harness.events).await {
            AccountEvent::TransferProgress { cookie, percent, .. } => {
                assert_eq!(cookie, Cookie(555));
                percents.push(percent);
            }
            AccountEvent::TransferDone { cookie, received } => {
                assert_eq!(cookie, Cookie(555));
                assert_eq!(received, Some(data));
                break;
            }
            _ => {}
        }
    }
    assert_eq!(percents, vec![25, 50, 75, 100]);
}

#[tokio::test]
async fn test_sent_file_reaches_peer() {
    let mut harness = sign_in(AccountConfig::default()).await;

    let session = harness.account.open_session([BOB]).await.unwrap();
    let data = file_contents(3000);
    let cookie = harness
        .account
        .send_file(session, "photo.jpg", data.clone())
        .await
        .unwrap();
    let sb = dial_bob(&mut harness).await;

    let invite = invitation_fields(&sb.expect("MSG").await.unwrap());
    assert_eq!(invite.command.as_deref(), Some("INVITE"));
    assert_eq!(invite.cookie, Some(cookie.0));
    assert_eq!(
        invite.application(),
        Application::FileTransfer {
            file_name: "photo.jpg".into(),
            file_size: 3000
        }
    );

    let accept = InvitationFields::accept(cookie);
    sb.send(relayed(BOB, "Bob", &ChatMessage::Invitation(accept))).await.unwrap();

    let params = invitation_fields(&sb.expect("MSG").await.unwrap());
    assert_eq!(params.command.as_deref(), Some("ACCEPT"));
    assert_eq!(params.ip_address.as_deref(), Some("127.0.0.1"));
    let port = params.port.unwrap();
    let auth_cookie = Cookie(params.auth_cookie.unwrap());
    assert_eq!(port, 6891);

    let mut link = harness.network.dial_transfer(port).await.unwrap();
    let receiver = FileReceiver::new(Handle::new(BOB), auth_cookie, TransferSettings::default());
    let (progress, _progress_rx) = mpsc::channel(16);
    let received = receiver
        .run(&mut link, &progress, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(received, data);

    assert_eq!(
        wait_for(&mut harness.events, |e| matches!(e, AccountEvent::TransferDone { .. })).await,
        AccountEvent::TransferDone {
            cookie,
            received: None
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_invitation_times_out() {
    let mut config = AccountConfig::default();
    config.timeouts.invitation = Duration::from_secs(2);
    let mut harness = sign_in(config).await;

    let session = harness.account.open_session([BOB]).await.unwrap();
    let cookie = harness
        .account
        .send_file(session, "notes.txt", file_contents(1000))
        .await
        .unwrap();
    let sb = dial_bob(&mut harness).await;

    let invite = invitation_fields(&sb.expect("MSG").await.unwrap());
    assert_eq!(invite.command.as_deref(), Some("INVITE"));

    // Bob never answers.
    let cancel = invitation_fields(&sb.expect("MSG").await.unwrap());
    assert_eq!(cancel.command.as_deref(), Some("CANCEL"));
    assert_eq!(cancel.cookie, Some(cookie.0));
    assert_eq!(cancel.cancel_code.as_deref(), Some("TIMEOUT"));

    assert_eq!(
        wait_for(&mut harness.events, |e| matches!(e, AccountEvent::InvitationFailed { .. })).await,
        AccountEvent::InvitationFailed {
            session,
            cookie,
            failure: TransferFailure::Timeout
        }
    );

    // The cookie is gone: a late ACCEPT changes nothing.
    let late = InvitationFields::accept(cookie);
    sb.send(relayed(BOB, "Bob", &ChatMessage::Invitation(late))).await.unwrap();
    let err = harness.account.cancel_invitation(session, cookie).await.unwrap_err();
    assert!(matches!(err, ClientError::Session(_)));
}

#[tokio::test]
async fn test_declined_invitation_sends_reject() {
    let mut harness = sign_in(AccountConfig::default()).await;
    let (sb, session) = answer_bob(&mut harness).await;

    let application = Application::External {
        name: "Game".into(),
        guid: "{6A13AF9C-5308-4F35-923A-67E8DDE40C2F}".into(),
    };
    let invite = InvitationFields::invite(&application, Cookie(42));
    sb.send(relayed(BOB, "Bob", &ChatMessage::Invitation(invite))).await.unwrap();
    wait_for(&mut harness.events, |e| matches!(e, AccountEvent::InvitationReceived { .. })).await;

    harness.account.decline_invitation(session, Cookie(42)).await.unwrap();
    let cancel = invitation_fields(&sb.expect("MSG").await.unwrap());
    assert_eq!(cancel.command.as_deref(), Some("CANCEL"));
    assert_eq!(cancel.cancel_code.as_deref(), Some("REJECT"));

    // Answering twice is refused.
    let err = harness.account.accept_invitation(session, Cookie(42)).await.unwrap_err();
    assert!(matches!(err, ClientError::Session(_)));
}
